//! Single-holder process lock.
//!
//! The lock file lives in the local state root and holds three plain-text
//! lines: `pid=`, `hostname=`, `created_at=` (RFC3339 UTC). A lock is stale
//! when its mtime or `created_at` is at least 24 hours old, or when the
//! holder ran on this host and its pid is gone. Corrupt files younger than
//! 24 hours still block.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};

use crate::paths::Paths;

/// Age after which any lock is considered abandoned.
pub const STALE_AFTER: Duration = Duration::from_secs(24 * 60 * 60);

/// Holder metadata parsed from an existing lock file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LockHolder {
    pub pid: Option<u32>,
    pub hostname: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

impl LockHolder {
    fn parse(content: &str) -> Self {
        let mut holder = Self::default();
        for line in content.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            match key.trim() {
                "pid" => holder.pid = value.trim().parse().ok(),
                "hostname" => holder.hostname = Some(value.trim().to_string()),
                "created_at" => {
                    holder.created_at = DateTime::parse_from_rfc3339(value.trim())
                        .ok()
                        .map(|t| t.with_timezone(&Utc));
                }
                _ => {}
            }
        }
        holder
    }
}

/// Held process lock; releases (unlinks) on `release` or best-effort on Drop.
#[derive(Debug)]
pub struct ProcessLock {
    path: PathBuf,
    released: bool,
}

impl ProcessLock {
    /// Acquire the lock, recovering stale locks transparently.
    pub fn acquire(paths: &Paths, hostname: &str, now: DateTime<Utc>) -> Result<Self> {
        Self::acquire_at(&paths.lock_file(), hostname, now)
    }

    fn acquire_at(lock_path: &Path, hostname: &str, now: DateTime<Utc>) -> Result<Self> {
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create state dir {}", parent.display()))?;
        }

        // Two passes: a failed first attempt may find a stale lock to reap.
        for attempt in 0..2 {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(lock_path)
            {
                Ok(mut file) => {
                    let body = format!(
                        "pid={}\nhostname={}\ncreated_at={}\n",
                        std::process::id(),
                        hostname,
                        now.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
                    );
                    file.write_all(body.as_bytes()).with_context(|| {
                        format!("failed to write lock file {}", lock_path.display())
                    })?;
                    file.sync_all()
                        .with_context(|| format!("failed to sync lock file {}", lock_path.display()))?;
                    return Ok(Self {
                        path: lock_path.to_path_buf(),
                        released: false,
                    });
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists && attempt == 0 => {
                    let holder = read_holder(lock_path)?;
                    if is_stale(lock_path, &holder, hostname, now) {
                        match fs::remove_file(lock_path) {
                            Ok(()) => continue,
                            Err(err) if err.kind() == ErrorKind::NotFound => continue,
                            Err(err) => {
                                return Err(err).with_context(|| {
                                    format!(
                                        "failed to remove stale lock file {}",
                                        lock_path.display()
                                    )
                                });
                            }
                        }
                    }
                    bail!(
                        "another bb process holds the lock (pid {} on {} since {})",
                        holder.pid.map_or_else(|| "?".to_string(), |p| p.to_string()),
                        holder.hostname.as_deref().unwrap_or("?"),
                        holder
                            .created_at
                            .map_or_else(|| "?".to_string(), |t| t.to_rfc3339()),
                    );
                }
                Err(err) => {
                    return Err(err).with_context(|| {
                        format!("failed to create lock file {}", lock_path.display())
                    });
                }
            }
        }
        bail!(
            "another bb process holds the lock ({})",
            lock_path.display()
        );
    }

    pub fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        match fs::remove_file(&self.path) {
            Ok(()) => {
                self.released = true;
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                self.released = true;
                Ok(())
            }
            Err(err) => {
                Err(err).with_context(|| format!("failed to remove lock file {}", self.path.display()))
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        if !self.released {
            let _ = fs::remove_file(&self.path);
        }
    }
}

/// Read and parse holder metadata from an existing lock file. A file that
/// vanished between probe and read parses as an empty holder.
pub fn read_holder(lock_path: &Path) -> Result<LockHolder> {
    match fs::read_to_string(lock_path) {
        Ok(content) => Ok(LockHolder::parse(&content)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(LockHolder::default()),
        Err(err) => {
            Err(err).with_context(|| format!("failed to read lock file {}", lock_path.display()))
        }
    }
}

fn is_stale(lock_path: &Path, holder: &LockHolder, local_hostname: &str, now: DateTime<Utc>) -> bool {
    // (a) mtime age. Covers corrupt files that sat around long enough.
    if let Ok(meta) = fs::metadata(lock_path) {
        if let Ok(mtime) = meta.modified() {
            if let Ok(age) = std::time::SystemTime::now().duration_since(mtime) {
                if age >= STALE_AFTER {
                    return true;
                }
            }
        }
    }

    // (b) recorded creation time.
    if let Some(created_at) = holder.created_at {
        if now - created_at >= chrono::Duration::hours(24) {
            return true;
        }
    }

    // (c) same-host holder whose pid is gone.
    if let (Some(pid), Some(hostname)) = (holder.pid, holder.hostname.as_deref()) {
        if hostname == local_hostname && !process_alive(pid) {
            return true;
        }
    }

    false
}

/// Liveness probe for rule (c). Linux reads `/proc`; platforms without an
/// equivalent skip the rule, which only delays recovery to the 24h rules.
#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    true
}
