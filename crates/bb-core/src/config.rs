//! Configuration file (`config.yaml`) loading and validation.
//!
//! A missing file yields defaults with no catalogs; a file that fails to
//! parse or validate aborts the command with a single line naming the
//! offending field.

use std::collections::BTreeSet;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::paths::Paths;
use crate::store;
use crate::types::{AutoPush, Catalog};

/// Notification backend selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyBackendKind {
    #[default]
    Stderr,
    Command,
}

/// Notification dedupe/throttle settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotifyConfig {
    #[serde(default = "default_true")]
    pub dedupe_enabled: bool,
    /// Minimum minutes between notifications for one repository; 0 disables
    /// throttling.
    #[serde(default = "default_throttle_minutes")]
    pub throttle_minutes: u64,
    #[serde(default)]
    pub backend: NotifyBackendKind,
    /// Argv for the `command` backend; repo key and reasons are appended.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub command: Option<Vec<String>>,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            dedupe_enabled: true,
            throttle_minutes: default_throttle_minutes(),
            backend: NotifyBackendKind::Stderr,
            command: None,
        }
    }
}

/// How the shared metadata area reaches other machines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    /// Outside tooling (cloud file sync) moves the config root around.
    External,
    /// The config root is itself a Git repository; bb pulls before reading
    /// and commits+pushes after writing.
    Git,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransportConfig {
    #[serde(default = "default_transport_mode")]
    pub mode: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            mode: default_transport_mode(),
        }
    }
}

fn default_transport_mode() -> String {
    "external".to_string()
}

/// Forge settings consumed by `init` and fork retargeting.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GithubConfig {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub owner: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub default_catalog: Option<String>,
    #[serde(default)]
    pub catalogs: Vec<Catalog>,
    /// `fix`/`doctor` reuse a scan no older than this instead of rescanning.
    #[serde(default = "default_scan_freshness")]
    pub scan_freshness_seconds: u64,
    /// Whether untracked files count as dirt for syncability.
    #[serde(default = "default_true")]
    pub include_untracked: bool,
    #[serde(default = "default_true")]
    pub pull_ff_only: bool,
    #[serde(default = "default_true")]
    pub fetch_prune: bool,
    /// Machine-wide default auto-push policy for newly discovered repos.
    #[serde(default)]
    pub auto_push: AutoPush,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub state_transport: TransportConfig,
    #[serde(default)]
    pub github: GithubConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_catalog: None,
            catalogs: Vec::new(),
            scan_freshness_seconds: default_scan_freshness(),
            include_untracked: true,
            pull_ff_only: true,
            fetch_prune: true,
            auto_push: AutoPush::Disabled,
            notify: NotifyConfig::default(),
            state_transport: TransportConfig::default(),
            github: GithubConfig::default(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_scan_freshness() -> u64 {
    300
}

fn default_throttle_minutes() -> u64 {
    240
}

impl Config {
    /// Load from the config root; a missing file yields defaults.
    pub fn load(paths: &Paths) -> Result<Self> {
        let config: Self = store::load_yaml(&paths.config_file())
            .with_context(|| format!("failed to load {}", paths.config_file().display()))?
            .unwrap_or_default();
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, paths: &Paths) -> Result<()> {
        self.validate()?;
        store::save_yaml(&paths.config_file(), self)
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for catalog in &self.catalogs {
            if catalog.name.is_empty() {
                bail!("invalid config: catalogs[].name must not be empty");
            }
            if !seen.insert(catalog.name.as_str()) {
                bail!("invalid config: duplicate catalog name {:?}", catalog.name);
            }
            if !catalog.root.is_absolute() {
                bail!(
                    "invalid config: catalogs[{}].root must be an absolute path",
                    catalog.name
                );
            }
            if !matches!(catalog.repo_path_depth, 1 | 2) {
                bail!(
                    "invalid config: catalogs[{}].repo_path_depth must be 1 or 2",
                    catalog.name
                );
            }
        }
        if let Some(default) = &self.default_catalog {
            if self.catalog(default).is_none() {
                bail!("invalid config: default_catalog {default:?} names no configured catalog");
            }
        }
        self.transport_mode()?;
        if self.notify.backend == NotifyBackendKind::Command {
            match &self.notify.command {
                Some(argv) if !argv.is_empty() => {}
                _ => bail!("invalid config: notify.command is required when notify.backend is command"),
            }
        }
        Ok(())
    }

    pub fn catalog(&self, name: &str) -> Option<&Catalog> {
        self.catalogs.iter().find(|c| c.name == name)
    }

    /// The catalog used when none is named: the configured default, else the
    /// only catalog, else an error.
    pub fn target_catalog(&self, explicit: Option<&str>) -> Result<&Catalog> {
        if let Some(name) = explicit {
            return self
                .catalog(name)
                .with_context(|| format!("unknown catalog {name:?}"));
        }
        if let Some(default) = &self.default_catalog {
            return self
                .catalog(default)
                .with_context(|| format!("default_catalog {default:?} names no configured catalog"));
        }
        match self.catalogs.as_slice() {
            [only] => Ok(only),
            [] => bail!("no catalogs configured; run `bb catalog add` first"),
            _ => bail!("multiple catalogs configured; pass --catalog or set a default"),
        }
    }

    pub fn transport_mode(&self) -> Result<TransportMode> {
        match self.state_transport.mode.as_str() {
            "external" => Ok(TransportMode::External),
            "git" => Ok(TransportMode::Git),
            other => bail!("invalid config: unsupported state_transport.mode {other:?}"),
        }
    }

    /// GitHub owner, required by `init` and fork retargeting.
    pub fn github_owner(&self) -> Result<&str> {
        match self.github.owner.as_deref() {
            Some(owner) if !owner.is_empty() => Ok(owner),
            _ => bail!("invalid config: github.owner is required for this command"),
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let td = tempdir().expect("tempdir");
        let paths = Paths::from_home(td.path());
        let config = Config::load(&paths).expect("load");
        assert!(config.catalogs.is_empty());
        assert_eq!(config.scan_freshness_seconds, 300);
        assert!(config.include_untracked);
        assert!(config.notify.dedupe_enabled);
        assert_eq!(config.notify.throttle_minutes, 240);
        assert_eq!(config.transport_mode().expect("mode"), TransportMode::External);
    }

    #[test]
    fn round_trips_through_store() {
        let td = tempdir().expect("tempdir");
        let paths = Paths::from_home(td.path());
        let mut config = Config::default();
        config.catalogs.push(Catalog::new("work", "/srv/work"));
        config.default_catalog = Some("work".to_string());
        config.save(&paths).expect("save");

        let back = Config::load(&paths).expect("load");
        assert_eq!(back, config);
    }

    #[test]
    fn duplicate_catalog_names_rejected() {
        let mut config = Config::default();
        config.catalogs.push(Catalog::new("work", "/a"));
        config.catalogs.push(Catalog::new("work", "/b"));
        let err = config.validate().expect_err("must fail");
        assert!(err.to_string().contains("duplicate catalog name"));
    }

    #[test]
    fn relative_root_rejected() {
        let mut config = Config::default();
        config.catalogs.push(Catalog::new("work", "relative/path"));
        let err = config.validate().expect_err("must fail");
        assert!(err.to_string().contains("absolute path"));
    }

    #[test]
    fn bad_depth_rejected() {
        let mut config = Config::default();
        let mut cat = Catalog::new("work", "/srv/work");
        cat.repo_path_depth = 3;
        config.catalogs.push(cat);
        let err = config.validate().expect_err("must fail");
        assert!(err.to_string().contains("repo_path_depth"));
    }

    #[test]
    fn unknown_default_catalog_rejected() {
        let mut config = Config::default();
        config.default_catalog = Some("nope".to_string());
        let err = config.validate().expect_err("must fail");
        assert!(err.to_string().contains("default_catalog"));
    }

    #[test]
    fn unsupported_transport_mode_rejected() {
        let mut config = Config::default();
        config.state_transport.mode = "s3".to_string();
        let err = config.validate().expect_err("must fail");
        assert!(err.to_string().contains("state_transport.mode"));
    }

    #[test]
    fn command_backend_requires_argv() {
        let mut config = Config::default();
        config.notify.backend = NotifyBackendKind::Command;
        let err = config.validate().expect_err("must fail");
        assert!(err.to_string().contains("notify.command"));
    }

    #[test]
    fn target_catalog_resolution() {
        let mut config = Config::default();
        assert!(config.target_catalog(None).is_err());

        config.catalogs.push(Catalog::new("work", "/w"));
        assert_eq!(config.target_catalog(None).expect("only").name, "work");

        config.catalogs.push(Catalog::new("play", "/p"));
        assert!(config.target_catalog(None).is_err());

        config.default_catalog = Some("play".to_string());
        assert_eq!(config.target_catalog(None).expect("default").name, "play");
        assert_eq!(
            config.target_catalog(Some("work")).expect("explicit").name,
            "work"
        );
        assert!(config.target_catalog(Some("nope")).is_err());
    }
}
