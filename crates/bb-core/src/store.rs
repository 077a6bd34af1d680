//! Crash-safe YAML persistence for the shared area and local state.
//!
//! Every document is written whole via write-then-rename so readers never
//! observe a partial file. Field ordering is stable (struct declaration
//! order). The `Store` owns all writes under both roots.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::notify::NotifyCache;
use crate::paths::Paths;
use crate::types::{MachineFile, RepoMetadata};

/// Read a YAML document; a missing file is `None`.
pub fn load_yaml<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", path.display()));
        }
    };
    let value = serde_yaml::from_str(&content)
        .with_context(|| format!("failed to parse YAML {}", path.display()))?;
    Ok(Some(value))
}

/// Serialize to YAML and write atomically: exclusive temp file, fsync,
/// rename over the destination. Parent directories are created 0o755.
pub fn save_yaml<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let yaml = serde_yaml::to_string(value)
        .with_context(|| format!("failed to serialize YAML for {}", path.display()))?;
    write_atomic(path, yaml.as_bytes())
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dir_all_0755(parent)
            .with_context(|| format!("failed to create dir {}", parent.display()))?;
    }

    let tmp_path = path.with_extension(format!("tmp.{}", std::process::id()));
    // A leftover from a crashed run with the same pid is ours to discard.
    match fs::remove_file(&tmp_path) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to clear temp file {}", tmp_path.display()));
        }
    }

    {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path)
            .with_context(|| format!("failed to create temp file {}", tmp_path.display()))?;
        file.write_all(bytes)
            .with_context(|| format!("failed to write temp file {}", tmp_path.display()))?;
        file.sync_all()
            .with_context(|| format!("failed to sync temp file {}", tmp_path.display()))?;
    }

    fs::rename(&tmp_path, path)
        .with_context(|| format!("failed to rename temp file into {}", path.display()))?;
    Ok(())
}

#[cfg(unix)]
fn create_dir_all_0755(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new().recursive(true).mode(0o755).create(dir)
}

#[cfg(not(unix))]
fn create_dir_all_0755(dir: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dir)
}

/// Typed access to every on-disk document bb owns.
#[derive(Debug, Clone)]
pub struct Store {
    paths: Paths,
}

impl Store {
    pub fn new(paths: Paths) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    pub fn load_machine(&self, machine_id: &str) -> Result<Option<MachineFile>> {
        load_yaml(&self.paths.machine_file(machine_id))
    }

    pub fn save_machine(&self, machine: &MachineFile) -> Result<()> {
        save_yaml(&self.paths.machine_file(&machine.machine_id), machine)
    }

    /// All machine snapshots in the shared area, sorted by machine id.
    pub fn list_machines(&self) -> Result<Vec<MachineFile>> {
        let dir = self.paths.machines_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read dir {}", dir.display()));
            }
        };

        let mut machines = Vec::new();
        for entry in entries {
            let entry = entry.with_context(|| format!("failed to read dir {}", dir.display()))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
                continue;
            }
            if let Some(machine) = load_yaml::<MachineFile>(&path)? {
                machines.push(machine);
            }
        }
        machines.sort_by(|a, b| a.machine_id.cmp(&b.machine_id));
        Ok(machines)
    }

    pub fn load_repo_meta(&self, repo_key: &str) -> Result<Option<RepoMetadata>> {
        load_yaml(&self.paths.repo_file(repo_key))
    }

    pub fn save_repo_meta(&self, meta: &RepoMetadata) -> Result<()> {
        save_yaml(&self.paths.repo_file(&meta.repo_key), meta)
    }

    pub fn remove_repo_meta(&self, repo_key: &str) -> Result<()> {
        let path = self.paths.repo_file(repo_key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("failed to remove {}", path.display())),
        }
    }

    /// All shared repo metadata, sorted by repo key.
    pub fn list_repo_meta(&self) -> Result<Vec<RepoMetadata>> {
        let dir = self.paths.repos_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read dir {}", dir.display()));
            }
        };

        let mut metas = Vec::new();
        for entry in entries {
            let entry = entry.with_context(|| format!("failed to read dir {}", dir.display()))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
                continue;
            }
            if let Some(meta) = load_yaml::<RepoMetadata>(&path)? {
                metas.push(meta);
            }
        }
        metas.sort_by(|a, b| a.repo_key.cmp(&b.repo_key));
        Ok(metas)
    }

    pub fn load_notify_cache(&self) -> Result<NotifyCache> {
        Ok(load_yaml(&self.paths.notify_cache_file())?.unwrap_or_default())
    }

    pub fn save_notify_cache(&self, cache: &NotifyCache) -> Result<()> {
        save_yaml(&self.paths.notify_cache_file(), cache)
    }
}
