//! Periodic sync trigger via systemd user units (Linux only).
//!
//! `install` writes a `bb-sync.service`/`bb-sync.timer` pair under
//! `~/.config/systemd/user/` and enables the timer; `remove` tears both
//! down. Other platforms get a one-line error.

#![cfg_attr(not(target_os = "linux"), allow(unused_imports, dead_code))]

use std::fs;
use std::path::PathBuf;
use std::process::Command;

use anyhow::{Context, Result};

use bb_core::engine::Reporter;
use bb_core::paths::Paths;

const SERVICE_UNIT: &str = "bb-sync.service";
const TIMER_UNIT: &str = "bb-sync.timer";

fn unit_dir(paths: &Paths) -> PathBuf {
    paths.home().join(".config").join("systemd").join("user")
}

#[cfg(target_os = "linux")]
pub fn install(paths: &Paths, interval_minutes: u64, reporter: &mut dyn Reporter) -> Result<()> {
    let dir = unit_dir(paths);
    fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create dir {}", dir.display()))?;

    let exe = std::env::current_exe().context("cannot resolve the bb executable path")?;
    let service = format!(
        "[Unit]\nDescription=bb repository sync\n\n\
         [Service]\nType=oneshot\nExecStart={} --quiet sync\n",
        exe.display()
    );
    let timer = format!(
        "[Unit]\nDescription=periodic bb sync\n\n\
         [Timer]\nOnBootSec=2min\nOnUnitActiveSec={interval_minutes}min\nUnit={SERVICE_UNIT}\n\n\
         [Install]\nWantedBy=timers.target\n"
    );

    let service_path = dir.join(SERVICE_UNIT);
    let timer_path = dir.join(TIMER_UNIT);
    fs::write(&service_path, service)
        .with_context(|| format!("failed to write {}", service_path.display()))?;
    fs::write(&timer_path, timer)
        .with_context(|| format!("failed to write {}", timer_path.display()))?;

    systemctl(&["daemon-reload"], reporter);
    systemctl(&["enable", "--now", TIMER_UNIT], reporter);
    reporter.info(&format!(
        "installed {} (every {interval_minutes} minutes)",
        timer_path.display()
    ));
    Ok(())
}

#[cfg(target_os = "linux")]
pub fn status(paths: &Paths, reporter: &mut dyn Reporter) -> Result<()> {
    let timer_path = unit_dir(paths).join(TIMER_UNIT);
    if !timer_path.exists() {
        reporter.info("scheduler: not installed");
        return Ok(());
    }
    reporter.info(&format!("scheduler: installed at {}", timer_path.display()));
    let active = Command::new("systemctl")
        .args(["--user", "is-active", TIMER_UNIT])
        .output()
        .map(|out| String::from_utf8_lossy(&out.stdout).trim().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    reporter.info(&format!("scheduler: timer is {active}"));
    Ok(())
}

#[cfg(target_os = "linux")]
pub fn remove(paths: &Paths, reporter: &mut dyn Reporter) -> Result<()> {
    systemctl(&["disable", "--now", TIMER_UNIT], reporter);
    let dir = unit_dir(paths);
    for unit in [SERVICE_UNIT, TIMER_UNIT] {
        let path = dir.join(unit);
        match fs::remove_file(&path) {
            Ok(()) => reporter.info(&format!("removed {}", path.display())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to remove {}", path.display()));
            }
        }
    }
    systemctl(&["daemon-reload"], reporter);
    Ok(())
}

#[cfg(target_os = "linux")]
fn systemctl(args: &[&str], reporter: &mut dyn Reporter) {
    let mut command = Command::new("systemctl");
    command.arg("--user").args(args);
    match command.output() {
        Ok(out) if out.status.success() => {}
        Ok(out) => reporter.warn(&format!(
            "systemctl --user {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&out.stderr).trim()
        )),
        Err(err) => reporter.warn(&format!("systemctl not available: {err}")),
    }
}

#[cfg(not(target_os = "linux"))]
pub fn install(_paths: &Paths, _interval_minutes: u64, _reporter: &mut dyn Reporter) -> Result<()> {
    anyhow::bail!("scheduler integration is only available on Linux (systemd user units)")
}

#[cfg(not(target_os = "linux"))]
pub fn status(_paths: &Paths, _reporter: &mut dyn Reporter) -> Result<()> {
    anyhow::bail!("scheduler integration is only available on Linux (systemd user units)")
}

#[cfg(not(target_os = "linux"))]
pub fn remove(_paths: &Paths, _reporter: &mut dyn Reporter) -> Result<()> {
    anyhow::bail!("scheduler integration is only available on Linux (systemd user units)")
}
