//! Machine identity.
//!
//! The machine id names this machine's snapshot file in the shared area, so
//! it must be stable across runs. Resolution order: `BB_MACHINE_ID`, the
//! persisted `machine-id` state file, then the sanitized hostname (persisted
//! on first use).

use std::fs;

use anyhow::{Context, Result};

use crate::paths::Paths;

pub const MACHINE_ID_ENV: &str = "BB_MACHINE_ID";

/// Local hostname, lossily decoded.
pub fn hostname() -> String {
    gethostname::gethostname().to_string_lossy().to_string()
}

/// Resolve and, when derived from the hostname, persist the machine id.
pub fn machine_id(paths: &Paths) -> Result<String> {
    resolve_machine_id(std::env::var(MACHINE_ID_ENV).ok(), paths)
}

fn resolve_machine_id(env_override: Option<String>, paths: &Paths) -> Result<String> {
    if let Some(id) = env_override {
        let id = sanitize_machine_id(&id);
        if !id.is_empty() {
            return Ok(id);
        }
    }

    let id_path = paths.machine_id_file();
    if let Ok(raw) = fs::read_to_string(&id_path) {
        let id = sanitize_machine_id(raw.trim());
        if !id.is_empty() {
            return Ok(id);
        }
    }

    let id = sanitize_machine_id(&hostname());
    anyhow::ensure!(!id.is_empty(), "could not derive a machine id from the hostname");

    fs::create_dir_all(paths.state_root())
        .with_context(|| format!("failed to create state dir {}", paths.state_root().display()))?;
    fs::write(&id_path, format!("{id}\n"))
        .with_context(|| format!("failed to write machine id file {}", id_path.display()))?;
    Ok(id)
}

/// Keep `[a-z0-9._-]`, lowercased; everything else becomes `-`.
fn sanitize_machine_id(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.trim().chars() {
        let ch = ch.to_ascii_lowercase();
        if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
            out.push(ch);
        } else {
            out.push('-');
        }
    }
    out.trim_matches('-').to_string()
}
