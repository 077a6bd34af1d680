//! Domain types: catalogs, repo keys, shared metadata, machine snapshots,
//! observations, and the unsyncable-reason enumeration.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A named local directory tree containing repositories at a fixed depth.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Catalog {
    /// Unique name per machine; the first component of every repo key.
    pub name: String,
    /// Absolute local root of the catalog.
    pub root: PathBuf,
    /// How many path segments below `root` identify a repository (1 or 2).
    #[serde(default = "default_repo_path_depth")]
    pub repo_path_depth: u8,
    /// Permit auto-push of the default branch for private repositories.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub allow_auto_push_default_branch_private: Option<bool>,
    /// Permit auto-push of the default branch for public repositories.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub allow_auto_push_default_branch_public: Option<bool>,
    /// Clone repositories missing locally during `sync`.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub auto_clone_on_sync: Option<bool>,
}

fn default_repo_path_depth() -> u8 {
    1
}

impl Catalog {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
            repo_path_depth: 1,
            allow_auto_push_default_branch_private: None,
            allow_auto_push_default_branch_public: None,
            auto_clone_on_sync: None,
        }
    }

    pub fn effective_depth(&self) -> usize {
        usize::from(self.repo_path_depth)
    }

    pub fn auto_clone_on_sync(&self) -> bool {
        self.auto_clone_on_sync.unwrap_or(false)
    }

    /// Default-branch auto-push gate for the given visibility. Private repos
    /// default to allowed, public ones to blocked.
    pub fn allow_auto_push_default_branch(&self, visibility: Visibility) -> bool {
        match visibility {
            Visibility::Public => self.allow_auto_push_default_branch_public.unwrap_or(false),
            Visibility::Private | Visibility::Unknown => self
                .allow_auto_push_default_branch_private
                .unwrap_or(true),
        }
    }

    /// Absolute path a repo key's segments resolve to under this catalog.
    pub fn repo_path(&self, key: &RepoKey) -> PathBuf {
        let mut path = self.root.clone();
        for seg in &key.segments {
            path.push(seg);
        }
        path
    }
}

/// Canonical cross-machine repository identifier: `catalog/seg1[/seg2]`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RepoKey {
    pub catalog: String,
    pub segments: Vec<String>,
}

impl RepoKey {
    /// Build a key from already-validated components.
    pub fn new(catalog: impl Into<String>, segments: Vec<String>) -> Result<Self> {
        let key = Self {
            catalog: catalog.into(),
            segments,
        };
        key.validate()?;
        Ok(key)
    }

    fn validate(&self) -> Result<()> {
        if self.catalog.is_empty() {
            bail!("repo key has an empty catalog component");
        }
        if self.segments.is_empty() || self.segments.len() > 2 {
            bail!(
                "repo key must have 1 or 2 path segments, got {}",
                self.segments.len()
            );
        }
        for seg in &self.segments {
            if seg.is_empty() || seg == "." || seg == ".." {
                bail!("repo key contains an invalid path segment {seg:?}");
            }
        }
        Ok(())
    }

    /// Repository name: the last key segment.
    pub fn name(&self) -> &str {
        self.segments.last().map(String::as_str).unwrap_or_default()
    }

    /// Path of the repository relative to its catalog root.
    pub fn relative_path(&self) -> PathBuf {
        let mut path = PathBuf::new();
        for seg in &self.segments {
            path.push(seg);
        }
        path
    }
}

impl fmt::Display for RepoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.catalog, self.segments.join("/"))
    }
}

impl FromStr for RepoKey {
    type Err = anyhow::Error;

    /// Parse `catalog/seg1[/seg2]`. Backslashes are normalized to `/` first.
    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.replace('\\', "/");
        let mut parts = normalized.split('/');
        let catalog = parts.next().unwrap_or_default().to_string();
        let segments: Vec<String> = parts.map(str::to_string).collect();
        Self::new(catalog, segments)
    }
}

/// Remote visibility as recorded in shared metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Private,
    Public,
    #[default]
    Unknown,
}

/// Per-repository auto-push policy. Serializes as YAML `false`, `true`, or
/// the string `include-default-branch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AutoPush {
    #[default]
    Disabled,
    Enabled,
    IncludeDefaultBranch,
}

impl AutoPush {
    pub fn as_str(self) -> &'static str {
        match self {
            AutoPush::Disabled => "false",
            AutoPush::Enabled => "true",
            AutoPush::IncludeDefaultBranch => "include-default-branch",
        }
    }
}

impl FromStr for AutoPush {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "false" => Ok(AutoPush::Disabled),
            "true" => Ok(AutoPush::Enabled),
            "include-default-branch" => Ok(AutoPush::IncludeDefaultBranch),
            other => bail!("invalid auto_push value {other:?} (expected false, true, or include-default-branch)"),
        }
    }
}

impl Serialize for AutoPush {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            AutoPush::Disabled => serializer.serialize_bool(false),
            AutoPush::Enabled => serializer.serialize_bool(true),
            AutoPush::IncludeDefaultBranch => {
                serializer.serialize_str("include-default-branch")
            }
        }
    }
}

impl<'de> Deserialize<'de> for AutoPush {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Bool(bool),
            Str(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Bool(false) => Ok(AutoPush::Disabled),
            Raw::Bool(true) => Ok(AutoPush::Enabled),
            Raw::Str(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// Cached result of the push-access probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushAccess {
    #[default]
    Unknown,
    ReadWrite,
    ReadOnly,
}

impl PushAccess {
    pub fn as_str(self) -> &'static str {
        match self {
            PushAccess::Unknown => "unknown",
            PushAccess::ReadWrite => "read_write",
            PushAccess::ReadOnly => "read_only",
        }
    }
}

impl FromStr for PushAccess {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "unknown" => Ok(PushAccess::Unknown),
            "read_write" => Ok(PushAccess::ReadWrite),
            "read_only" => Ok(PushAccess::ReadOnly),
            other => bail!("invalid push_access value {other:?}"),
        }
    }
}

/// In-flight Git operation detected in a working tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Operation {
    #[default]
    None,
    Merge,
    Rebase,
    CherryPick,
    Bisect,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::None => "none",
            Operation::Merge => "merge",
            Operation::Rebase => "rebase",
            Operation::CherryPick => "cherry-pick",
            Operation::Bisect => "bisect",
        }
    }
}

/// Why a repository is not eligible for automated reconciliation.
///
/// Closed enumeration; the four non-blocking variants are remediated by fix
/// actions or clone backfill rather than blocking all progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnsyncableReason {
    MissingOrigin,
    OperationInProgress,
    DirtyTracked,
    DirtyUntracked,
    MissingUpstream,
    Diverged,
    PushPolicyBlocked,
    PushAccessBlocked,
    PushFailed,
    PullFailed,
    SyncConflictRequiresManualResolution,
    SyncFeasibilityProbeFailed,
    CheckoutFailed,
    TargetPathNonemptyNotRepo,
    TargetPathRepoMismatch,
    CloneRequired,
    CatalogNotMapped,
    CatalogMismatch,
    RemoteFormatMismatch,
}

impl UnsyncableReason {
    pub fn as_str(self) -> &'static str {
        match self {
            UnsyncableReason::MissingOrigin => "missing_origin",
            UnsyncableReason::OperationInProgress => "operation_in_progress",
            UnsyncableReason::DirtyTracked => "dirty_tracked",
            UnsyncableReason::DirtyUntracked => "dirty_untracked",
            UnsyncableReason::MissingUpstream => "missing_upstream",
            UnsyncableReason::Diverged => "diverged",
            UnsyncableReason::PushPolicyBlocked => "push_policy_blocked",
            UnsyncableReason::PushAccessBlocked => "push_access_blocked",
            UnsyncableReason::PushFailed => "push_failed",
            UnsyncableReason::PullFailed => "pull_failed",
            UnsyncableReason::SyncConflictRequiresManualResolution => {
                "sync_conflict_requires_manual_resolution"
            }
            UnsyncableReason::SyncFeasibilityProbeFailed => "sync_feasibility_probe_failed",
            UnsyncableReason::CheckoutFailed => "checkout_failed",
            UnsyncableReason::TargetPathNonemptyNotRepo => "target_path_nonempty_not_repo",
            UnsyncableReason::TargetPathRepoMismatch => "target_path_repo_mismatch",
            UnsyncableReason::CloneRequired => "clone_required",
            UnsyncableReason::CatalogNotMapped => "catalog_not_mapped",
            UnsyncableReason::CatalogMismatch => "catalog_mismatch",
            UnsyncableReason::RemoteFormatMismatch => "remote_format_mismatch",
        }
    }

    /// Whether this reason prevents all automated progress.
    pub fn is_blocking(self) -> bool {
        !matches!(
            self,
            UnsyncableReason::CloneRequired
                | UnsyncableReason::CatalogNotMapped
                | UnsyncableReason::CatalogMismatch
                | UnsyncableReason::RemoteFormatMismatch
        )
    }
}

impl fmt::Display for UnsyncableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared per-repository metadata, one file per repo key, writable by any
/// machine when policy changes or a new repository is discovered.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RepoMetadata {
    pub repo_key: String,
    pub name: String,
    #[serde(default)]
    pub origin_url: String,
    #[serde(default)]
    pub visibility: Visibility,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub preferred_catalog: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub preferred_remote: Option<String>,
    #[serde(default)]
    pub auto_push: AutoPush,
    #[serde(default)]
    pub push_access: PushAccess,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub push_access_checked_remote: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub push_access_checked_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub push_access_manual_override: bool,
    #[serde(default = "default_true")]
    pub branch_follow_enabled: bool,
}

fn default_true() -> bool {
    true
}

impl RepoMetadata {
    /// Fresh metadata for a newly discovered repository.
    pub fn discovered(key: &RepoKey, origin_url: impl Into<String>) -> Self {
        Self {
            repo_key: key.to_string(),
            name: key.name().to_string(),
            origin_url: origin_url.into(),
            visibility: Visibility::Unknown,
            preferred_catalog: Some(key.catalog.clone()),
            preferred_remote: None,
            auto_push: AutoPush::Disabled,
            push_access: PushAccess::Unknown,
            push_access_checked_remote: None,
            push_access_checked_at: None,
            push_access_manual_override: false,
            branch_follow_enabled: true,
        }
    }
}

/// One machine's published snapshot. Written only by its owning machine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MachineFile {
    pub machine_id: String,
    pub hostname: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub default_catalog: Option<String>,
    #[serde(default)]
    pub catalogs: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_scan_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_scan_catalogs: Vec<String>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub repos: Vec<MachineRepoRecord>,
}

impl MachineFile {
    pub fn record(&self, repo_key: &str) -> Option<&MachineRepoRecord> {
        self.repos.iter().find(|r| r.repo_key == repo_key)
    }
}

/// A single repository's observed state within a machine snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MachineRepoRecord {
    pub repo_key: String,
    pub name: String,
    pub catalog: String,
    pub path: PathBuf,
    #[serde(default)]
    pub origin_url: String,
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub head_sha: String,
    #[serde(default)]
    pub upstream: String,
    #[serde(default)]
    pub remote_head_sha: String,
    #[serde(default)]
    pub ahead: u32,
    #[serde(default)]
    pub behind: u32,
    #[serde(default)]
    pub diverged: bool,
    #[serde(default)]
    pub has_dirty_tracked: bool,
    #[serde(default)]
    pub has_untracked: bool,
    #[serde(default)]
    pub operation_in_progress: Operation,
    #[serde(default)]
    pub syncable: bool,
    #[serde(default)]
    pub unsyncable_reasons: Vec<UnsyncableReason>,
    #[serde(default)]
    pub state_hash: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub observed_at: Option<DateTime<Utc>>,
}

/// Raw Git observations for one working tree, before policy evaluation.
///
/// Immutable input to record derivation; the Scanner supplies the
/// expected-key/catalog/path triple separately.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObservedRepoState {
    pub origin_url: String,
    pub branch: String,
    pub default_branch: String,
    pub head_sha: String,
    pub upstream: String,
    pub remote_head_sha: String,
    pub ahead: u32,
    pub behind: u32,
    pub diverged: bool,
    pub has_dirty_tracked: bool,
    pub has_untracked: bool,
    pub operation_in_progress: Operation,
    /// Whether untracked files count as dirt for syncability.
    pub include_untracked_rule: bool,
    pub push_access: PushAccess,
}

impl ObservedRepoState {
    pub fn on_default_branch(&self) -> bool {
        !self.branch.is_empty() && self.branch == self.default_branch
    }
}

/// True when the path looks like a Git working tree: a `.git` directory or
/// (for worktree-added paths) a `.git` file pointing elsewhere.
pub fn has_git_marker(path: &Path) -> bool {
    let marker = path.join(".git");
    marker.is_dir() || marker.is_file()
}
