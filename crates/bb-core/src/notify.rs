//! Unsyncable-notification dedupe, throttling, and delivery boundary.
//!
//! Notifications are keyed by `(repo_key, fingerprint)` where the
//! fingerprint hashes the sorted reason list. One is emitted only when
//! dedupe is disabled, or when the fingerprint changed and the per-repo
//! throttle window has passed (throttle 0 disables throttling).

use std::collections::BTreeMap;
use std::process::Command;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{NotifyBackendKind, NotifyConfig};
use crate::statehash::sha256_hex;
use crate::types::UnsyncableReason;

/// Fingerprint of a reason set: SHA-256 over the sorted reason strings.
pub fn fingerprint(reasons: &[UnsyncableReason]) -> String {
    let mut names: Vec<&str> = reasons.iter().map(|r| r.as_str()).collect();
    names.sort_unstable();
    names.dedup();
    sha256_hex(names.join("\n").as_bytes())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotifyEntry {
    pub fingerprint: String,
    pub sent_at: DateTime<Utc>,
}

/// Persisted per-repo notification ledger (`notify-cache.yaml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NotifyCache {
    #[serde(default)]
    pub entries: BTreeMap<String, NotifyEntry>,
}

impl NotifyCache {
    /// Decide whether to notify, without recording anything.
    pub fn should_notify(
        &self,
        repo_key: &str,
        fingerprint: &str,
        now: DateTime<Utc>,
        config: &NotifyConfig,
    ) -> bool {
        if !config.dedupe_enabled {
            return true;
        }
        match self.entries.get(repo_key) {
            None => true,
            Some(entry) => {
                if entry.fingerprint == fingerprint {
                    return false;
                }
                if config.throttle_minutes == 0 {
                    return true;
                }
                let elapsed = now - entry.sent_at;
                elapsed >= chrono::Duration::minutes(config.throttle_minutes as i64)
            }
        }
    }

    /// Record an emitted notification.
    pub fn record(&mut self, repo_key: &str, fingerprint: String, now: DateTime<Utc>) {
        self.entries.insert(
            repo_key.to_string(),
            NotifyEntry {
                fingerprint,
                sent_at: now,
            },
        );
    }

    /// Drop entries for repositories that are no longer unsyncable.
    pub fn retain_keys<'a>(&mut self, live: impl IntoIterator<Item = &'a str>) {
        let keep: std::collections::BTreeSet<&str> = live.into_iter().collect();
        self.entries.retain(|key, _| keep.contains(key.as_str()));
    }
}

/// Delivery boundary. Backends are deliberately dumb: the cache has already
/// decided that this notification should go out.
pub trait NotifyBackend: std::fmt::Debug {
    fn send(&mut self, repo_key: &str, reasons: &[UnsyncableReason]) -> Result<()>;
}

/// Default backend: one line on stderr.
#[derive(Debug)]
pub struct StderrBackend;

impl NotifyBackend for StderrBackend {
    fn send(&mut self, repo_key: &str, reasons: &[UnsyncableReason]) -> Result<()> {
        let list: Vec<&str> = reasons.iter().map(|r| r.as_str()).collect();
        eprintln!("bb: {repo_key} is unsyncable: {}", list.join(", "));
        Ok(())
    }
}

/// Spawns a configured argv with the repo key and reasons appended.
#[derive(Debug)]
pub struct CommandBackend {
    argv: Vec<String>,
}

impl CommandBackend {
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }
}

impl NotifyBackend for CommandBackend {
    fn send(&mut self, repo_key: &str, reasons: &[UnsyncableReason]) -> Result<()> {
        let (program, base_args) = self
            .argv
            .split_first()
            .context("notify command argv is empty")?;
        let mut command = Command::new(program);
        command.args(base_args);
        command.arg(repo_key);
        for reason in reasons {
            command.arg(reason.as_str());
        }
        let status = command
            .status()
            .with_context(|| format!("failed to run notify command {program}"))?;
        if !status.success() {
            bail!("notify command {program} exited with {status}");
        }
        Ok(())
    }
}

/// Backend selected by configuration; `name` overrides (`--notify-backend`).
pub fn backend_for(config: &NotifyConfig, name: Option<&str>) -> Result<Box<dyn NotifyBackend>> {
    let kind = match name {
        Some("stderr") => NotifyBackendKind::Stderr,
        Some("command") => NotifyBackendKind::Command,
        Some(other) => bail!("unknown notify backend {other:?} (expected stderr or command)"),
        None => config.backend,
    };
    match kind {
        NotifyBackendKind::Stderr => Ok(Box::new(StderrBackend)),
        NotifyBackendKind::Command => {
            let argv = config
                .command
                .clone()
                .filter(|argv| !argv.is_empty())
                .context("notify.command is required when notify.backend is command")?;
            Ok(Box::new(CommandBackend::new(argv)))
        }
    }
}
