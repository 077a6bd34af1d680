//! On-disk layout resolution.
//!
//! Two roots hang off `$HOME`: the config root (`~/.config/bb-project/`),
//! which is the shared metadata area synchronized across machines, and the
//! local state root (`~/.local/state/bb-project/`), which never leaves the
//! machine.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub const PROJECT_DIR: &str = "bb-project";
pub const CONFIG_FILE: &str = "config.yaml";
pub const MACHINES_DIR: &str = "machines";
pub const REPOS_DIR: &str = "repos";
pub const MACHINE_ID_FILE: &str = "machine-id";
pub const LOCK_FILE: &str = "lock";
pub const NOTIFY_CACHE_FILE: &str = "notify-cache.yaml";

/// Canonical locations for everything bb reads or writes.
#[derive(Debug, Clone)]
pub struct Paths {
    home: PathBuf,
}

impl Paths {
    /// Resolve from the current user's home directory.
    pub fn from_env() -> Result<Self> {
        let home = dirs::home_dir().context("could not determine home directory")?;
        Ok(Self { home })
    }

    /// Anchor all paths under an explicit home (tests, `HOME` overrides).
    pub fn from_home(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    /// Shared metadata area: `~/.config/bb-project/`.
    pub fn config_root(&self) -> PathBuf {
        self.home.join(".config").join(PROJECT_DIR)
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_root().join(CONFIG_FILE)
    }

    pub fn machines_dir(&self) -> PathBuf {
        self.config_root().join(MACHINES_DIR)
    }

    pub fn machine_file(&self, machine_id: &str) -> PathBuf {
        self.machines_dir().join(format!("{machine_id}.yaml"))
    }

    pub fn repos_dir(&self) -> PathBuf {
        self.config_root().join(REPOS_DIR)
    }

    pub fn repo_file(&self, repo_key: &str) -> PathBuf {
        self.repos_dir()
            .join(format!("{}.yaml", encode_repo_key(repo_key)))
    }

    /// Machine-local state: `~/.local/state/bb-project/`.
    pub fn state_root(&self) -> PathBuf {
        self.home.join(".local").join("state").join(PROJECT_DIR)
    }

    pub fn machine_id_file(&self) -> PathBuf {
        self.state_root().join(MACHINE_ID_FILE)
    }

    pub fn lock_file(&self) -> PathBuf {
        self.state_root().join(LOCK_FILE)
    }

    pub fn notify_cache_file(&self) -> PathBuf {
        self.state_root().join(NOTIFY_CACHE_FILE)
    }
}

/// Encode a repo key into a flat filename: `/` becomes `__`; each of
/// `:`, `\`, `?`, `*` becomes `_`.
pub fn encode_repo_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    for ch in key.chars() {
        match ch {
            '/' => out.push_str("__"),
            ':' | '\\' | '?' | '*' => out.push('_'),
            other => out.push(other),
        }
    }
    out
}
