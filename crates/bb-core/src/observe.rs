//! Observer: derive per-repository state from a working tree and evaluate
//! syncability.
//!
//! Observation and mutation are separated: [`observe_tree`] produces an
//! immutable [`ObservedRepoState`], [`evaluate_syncability`] applies the
//! ordered rule table, and [`build_record`] combines both with the expected
//! key/catalog/path triple, the state hash, and the `observed_at` law.

use std::path::Path;

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::git::{Git, same_origin};
use crate::statehash::record_state_hash;
use crate::types::{
    AutoPush, Catalog, MachineRepoRecord, ObservedRepoState, Operation, PushAccess, RepoKey,
    RepoMetadata, UnsyncableReason, Visibility,
};

/// Policy inputs for syncability evaluation.
#[derive(Debug, Clone, Copy)]
pub struct SyncPolicy<'a> {
    pub catalog: &'a Catalog,
    pub visibility: Visibility,
    pub auto_push: AutoPush,
    /// The `--push` override from the command line.
    pub cli_push: bool,
}

impl<'a> SyncPolicy<'a> {
    pub fn from_meta(catalog: &'a Catalog, meta: Option<&RepoMetadata>, cli_push: bool) -> Self {
        Self {
            catalog,
            visibility: meta.map(|m| m.visibility).unwrap_or_default(),
            auto_push: meta.map(|m| m.auto_push).unwrap_or_default(),
            cli_push,
        }
    }

    /// Whether pushing the current branch is permitted by policy.
    pub fn push_permitted(&self, on_default_branch: bool) -> bool {
        if self.cli_push {
            return true;
        }
        match self.auto_push {
            AutoPush::Disabled => false,
            AutoPush::Enabled => !on_default_branch,
            AutoPush::IncludeDefaultBranch => {
                !on_default_branch || self.catalog.allow_auto_push_default_branch(self.visibility)
            }
        }
    }
}

/// Assemble an observation by calling the adapter once per field.
pub fn observe_tree(
    git: &dyn Git,
    path: &Path,
    preferred_remote: Option<&str>,
    include_untracked_rule: bool,
    push_access: PushAccess,
) -> Result<ObservedRepoState> {
    let origin_url = git.origin_url(path, preferred_remote)?;
    let remote = match preferred_remote {
        Some(remote) => remote.to_string(),
        None => git.preferred_remote(path)?,
    };
    let branch = git.current_branch(path)?;
    let default_branch = git.default_branch(path, &remote)?;
    let head_sha = git.head_sha(path)?;
    let upstream = git.upstream(path)?;
    let remote_head_sha = git.remote_head_sha(path)?;
    let (ahead, behind) = git.ahead_behind(path)?;
    let (has_dirty_tracked, has_untracked) = git.dirty(path)?;
    let operation_in_progress = git.operation_in_progress(path)?;

    Ok(ObservedRepoState {
        origin_url,
        branch,
        default_branch,
        head_sha,
        upstream,
        remote_head_sha,
        ahead,
        behind,
        diverged: ahead > 0 && behind > 0,
        has_dirty_tracked,
        has_untracked,
        operation_in_progress,
        include_untracked_rule,
        push_access,
    })
}

/// The ordered syncability rule table. Reasons accumulate in evaluation
/// order; a repository is syncable iff the result is empty.
pub fn evaluate_syncability(
    observed: &ObservedRepoState,
    policy: &SyncPolicy<'_>,
) -> Vec<UnsyncableReason> {
    let mut reasons = Vec::new();

    if observed.origin_url.is_empty() {
        reasons.push(UnsyncableReason::MissingOrigin);
    }
    if observed.operation_in_progress != Operation::None {
        reasons.push(UnsyncableReason::OperationInProgress);
    }
    if observed.has_dirty_tracked {
        reasons.push(UnsyncableReason::DirtyTracked);
    }
    if observed.include_untracked_rule && observed.has_untracked {
        reasons.push(UnsyncableReason::DirtyUntracked);
    }
    if observed.upstream.is_empty() {
        reasons.push(UnsyncableReason::MissingUpstream);
    }
    if observed.diverged {
        reasons.push(UnsyncableReason::Diverged);
    }
    if observed.ahead > 0 {
        if observed.push_access == PushAccess::ReadOnly {
            reasons.push(UnsyncableReason::PushAccessBlocked);
        } else if !policy.push_permitted(observed.on_default_branch()) {
            reasons.push(UnsyncableReason::PushPolicyBlocked);
        }
    }

    reasons
}

/// Non-blocking discrepancies between an observation and shared metadata.
pub fn metadata_reasons(
    observed: &ObservedRepoState,
    meta: Option<&RepoMetadata>,
    found_catalog: &str,
) -> Vec<UnsyncableReason> {
    let Some(meta) = meta else {
        return Vec::new();
    };
    let mut reasons = Vec::new();

    match meta.preferred_catalog.as_deref() {
        None => reasons.push(UnsyncableReason::CatalogNotMapped),
        Some(preferred) if preferred != found_catalog => {
            reasons.push(UnsyncableReason::CatalogMismatch);
        }
        Some(_) => {}
    }

    if !meta.origin_url.is_empty() && !observed.origin_url.is_empty() {
        if !same_origin(&meta.origin_url, &observed.origin_url) {
            reasons.push(UnsyncableReason::TargetPathRepoMismatch);
        } else if meta.origin_url != observed.origin_url {
            reasons.push(UnsyncableReason::RemoteFormatMismatch);
        }
    }

    reasons
}

/// Combine an observation with the expected triple into a machine record,
/// applying the state-hash and `observed_at` laws.
pub fn build_record(
    key: &RepoKey,
    path: &Path,
    observed: &ObservedRepoState,
    reasons: Vec<UnsyncableReason>,
    prev: Option<&MachineRepoRecord>,
    now: DateTime<Utc>,
) -> MachineRepoRecord {
    let mut record = MachineRepoRecord {
        repo_key: key.to_string(),
        name: key.name().to_string(),
        catalog: key.catalog.clone(),
        path: path.to_path_buf(),
        origin_url: observed.origin_url.clone(),
        branch: observed.branch.clone(),
        head_sha: observed.head_sha.clone(),
        upstream: observed.upstream.clone(),
        remote_head_sha: observed.remote_head_sha.clone(),
        ahead: observed.ahead,
        behind: observed.behind,
        diverged: observed.diverged,
        has_dirty_tracked: observed.has_dirty_tracked,
        has_untracked: observed.has_untracked,
        operation_in_progress: observed.operation_in_progress,
        syncable: reasons.is_empty(),
        unsyncable_reasons: reasons,
        state_hash: String::new(),
        observed_at: None,
    };
    record.state_hash = record_state_hash(&record);
    record.observed_at = match prev {
        Some(prev) if prev.state_hash == record.state_hash && prev.observed_at.is_some() => {
            prev.observed_at
        }
        _ => Some(now),
    };
    record
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use chrono::TimeZone;

    use crate::types::Catalog;

    use super::*;

    fn clean_observation() -> ObservedRepoState {
        ObservedRepoState {
            origin_url: "git@github.com:owner/api.git".into(),
            branch: "feature/x".into(),
            default_branch: "main".into(),
            head_sha: "abc".into(),
            upstream: "origin/feature/x".into(),
            remote_head_sha: "abc".into(),
            ahead: 0,
            behind: 0,
            diverged: false,
            has_dirty_tracked: false,
            has_untracked: false,
            operation_in_progress: Operation::None,
            include_untracked_rule: true,
            push_access: PushAccess::Unknown,
        }
    }

    fn policy(catalog: &Catalog) -> SyncPolicy<'_> {
        SyncPolicy {
            catalog,
            visibility: Visibility::Private,
            auto_push: AutoPush::Disabled,
            cli_push: false,
        }
    }

    #[test]
    fn clean_observation_is_syncable() {
        let catalog = Catalog::new("work", "/w");
        assert!(evaluate_syncability(&clean_observation(), &policy(&catalog)).is_empty());
    }

    #[test]
    fn reasons_accumulate_in_rule_order() {
        let catalog = Catalog::new("work", "/w");
        let mut observed = clean_observation();
        observed.origin_url.clear();
        observed.operation_in_progress = Operation::Rebase;
        observed.has_dirty_tracked = true;
        observed.has_untracked = true;
        observed.upstream.clear();

        let reasons = evaluate_syncability(&observed, &policy(&catalog));
        assert_eq!(
            reasons,
            vec![
                UnsyncableReason::MissingOrigin,
                UnsyncableReason::OperationInProgress,
                UnsyncableReason::DirtyTracked,
                UnsyncableReason::DirtyUntracked,
                UnsyncableReason::MissingUpstream,
            ]
        );
    }

    #[test]
    fn untracked_rule_off_ignores_untracked() {
        let catalog = Catalog::new("work", "/w");
        let mut observed = clean_observation();
        observed.has_untracked = true;
        observed.include_untracked_rule = false;
        assert!(evaluate_syncability(&observed, &policy(&catalog)).is_empty());
    }

    #[test]
    fn diverged_orders_before_push_rules() {
        let catalog = Catalog::new("work", "/w");
        let mut observed = clean_observation();
        observed.ahead = 1;
        observed.behind = 2;
        observed.diverged = true;
        observed.push_access = PushAccess::ReadOnly;

        let reasons = evaluate_syncability(&observed, &policy(&catalog));
        assert_eq!(
            reasons,
            vec![UnsyncableReason::Diverged, UnsyncableReason::PushAccessBlocked]
        );
    }

    #[test]
    fn ahead_with_read_only_access_is_access_blocked() {
        let catalog = Catalog::new("work", "/w");
        let mut observed = clean_observation();
        observed.ahead = 1;
        observed.push_access = PushAccess::ReadOnly;

        let mut p = policy(&catalog);
        p.cli_push = true;
        let reasons = evaluate_syncability(&observed, &p);
        assert_eq!(reasons, vec![UnsyncableReason::PushAccessBlocked]);
    }

    #[test]
    fn ahead_without_policy_is_policy_blocked() {
        let catalog = Catalog::new("work", "/w");
        let mut observed = clean_observation();
        observed.ahead = 1;

        let reasons = evaluate_syncability(&observed, &policy(&catalog));
        assert_eq!(reasons, vec![UnsyncableReason::PushPolicyBlocked]);
    }

    #[test]
    fn cli_push_overrides_policy() {
        let catalog = Catalog::new("work", "/w");
        let mut observed = clean_observation();
        observed.ahead = 1;

        let mut p = policy(&catalog);
        p.cli_push = true;
        assert!(evaluate_syncability(&observed, &p).is_empty());
    }

    #[test]
    fn auto_push_spares_default_branch_unless_included() {
        let catalog = Catalog::new("work", "/w");
        let mut observed = clean_observation();
        observed.ahead = 1;
        observed.branch = "main".into();
        observed.upstream = "origin/main".into();

        let mut p = policy(&catalog);
        p.auto_push = AutoPush::Enabled;
        assert_eq!(
            evaluate_syncability(&observed, &p),
            vec![UnsyncableReason::PushPolicyBlocked]
        );

        p.auto_push = AutoPush::IncludeDefaultBranch;
        // Private catalogs default to allowing the default branch.
        assert!(evaluate_syncability(&observed, &p).is_empty());

        p.visibility = Visibility::Public;
        assert_eq!(
            evaluate_syncability(&observed, &p),
            vec![UnsyncableReason::PushPolicyBlocked]
        );
    }

    #[test]
    fn metadata_reasons_flag_catalog_and_remote_drift() {
        let observed = clean_observation();
        let key: RepoKey = "work/api".parse().expect("key");

        assert!(metadata_reasons(&observed, None, "work").is_empty());

        let mut meta = RepoMetadata::discovered(&key, observed.origin_url.clone());
        assert!(metadata_reasons(&observed, Some(&meta), "work").is_empty());

        meta.preferred_catalog = None;
        assert_eq!(
            metadata_reasons(&observed, Some(&meta), "work"),
            vec![UnsyncableReason::CatalogNotMapped]
        );

        meta.preferred_catalog = Some("play".into());
        assert_eq!(
            metadata_reasons(&observed, Some(&meta), "work"),
            vec![UnsyncableReason::CatalogMismatch]
        );

        meta.preferred_catalog = Some("work".into());
        meta.origin_url = "https://github.com/owner/api".into();
        assert_eq!(
            metadata_reasons(&observed, Some(&meta), "work"),
            vec![UnsyncableReason::RemoteFormatMismatch]
        );

        meta.origin_url = "https://github.com/other/api".into();
        assert_eq!(
            metadata_reasons(&observed, Some(&meta), "work"),
            vec![UnsyncableReason::TargetPathRepoMismatch]
        );
    }

    #[test]
    fn build_record_applies_hash_and_syncable() {
        let key: RepoKey = "work/api".parse().expect("key");
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let record = build_record(
            &key,
            &PathBuf::from("/w/api"),
            &clean_observation(),
            vec![],
            None,
            now,
        );
        assert!(record.syncable);
        assert!(record.state_hash.starts_with("sha256:"));
        assert_eq!(record.observed_at, Some(now));
        assert_eq!(record.name, "api");
        assert_eq!(record.catalog, "work");
    }

    #[test]
    fn observed_at_preserved_while_hash_unchanged() {
        let key: RepoKey = "work/api".parse().expect("key");
        let earlier = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap();
        let later = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let observed = clean_observation();
        let path = PathBuf::from("/w/api");

        let first = build_record(&key, &path, &observed, vec![], None, earlier);
        assert_eq!(first.observed_at, Some(earlier));

        let second = build_record(&key, &path, &observed, vec![], Some(&first), later);
        assert_eq!(second.observed_at, Some(earlier), "unchanged state keeps observed_at");

        let mut moved = observed.clone();
        moved.head_sha = "def".into();
        let third = build_record(&key, &path, &moved, vec![], Some(&second), later);
        assert_eq!(third.observed_at, Some(later), "changed state advances observed_at");
    }

    #[test]
    fn observed_at_advances_when_previous_is_unset() {
        let key: RepoKey = "work/api".parse().expect("key");
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let observed = clean_observation();
        let path = PathBuf::from("/w/api");

        let mut prev = build_record(&key, &path, &observed, vec![], None, now);
        prev.observed_at = None;

        let next = build_record(&key, &path, &observed, vec![], Some(&prev), now);
        assert_eq!(next.observed_at, Some(now));
    }
}
