//! Reconciler: drive a local working tree toward the winner snapshot.
//!
//! Each repository runs through a small state machine:
//! `Preflight → Fetch → Checkout → Pull → (Push?) → Done | Failed(reason)`.
//! Steps are idempotent; an interrupted run re-derives state and picks up
//! where it left off. Failures become unsyncable reasons on the record, not
//! engine errors.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

use crate::config::Config;
use crate::engine::Reporter;
use crate::git::{CloneOptions, Git, is_merge_conflict, is_permission_denied, same_origin};
use crate::observe::SyncPolicy;
use crate::types::{Catalog, MachineRepoRecord, RepoMetadata, UnsyncableReason};

/// Steps the reconciler took (or, under `--dry-run`, would take).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileStep {
    Clone,
    RewriteRemoteUrl,
    Fetch,
    Checkout,
    Pull,
    Push,
}

impl ReconcileStep {
    pub fn as_str(self) -> &'static str {
        match self {
            ReconcileStep::Clone => "clone",
            ReconcileStep::RewriteRemoteUrl => "rewrite-remote-url",
            ReconcileStep::Fetch => "fetch",
            ReconcileStep::Checkout => "checkout",
            ReconcileStep::Pull => "pull",
            ReconcileStep::Push => "push",
        }
    }
}

#[derive(Debug, Default)]
pub struct ReconcileOutcome {
    /// Reasons produced by reconcile steps; merged into the re-observed
    /// record by the orchestrator.
    pub reasons: Vec<UnsyncableReason>,
    pub steps: Vec<ReconcileStep>,
    /// Whether the working tree was mutated (re-observation required).
    pub mutated: bool,
    /// Push was rejected with a permission-denied pattern; the caller must
    /// persist `push_access = read_only` on the metadata.
    pub downgrade_push_access: bool,
}

impl ReconcileOutcome {
    fn fail(mut self, reason: UnsyncableReason) -> Self {
        self.reasons.push(reason);
        self
    }
}

/// Reconcile one locally-expected repository toward the winner record.
pub fn reconcile_repo(
    git: &dyn Git,
    catalog: &Catalog,
    path: &Path,
    winner: &MachineRepoRecord,
    meta: &RepoMetadata,
    config: &Config,
    cli_push: bool,
    dry_run: bool,
    reporter: &mut dyn Reporter,
) -> Result<ReconcileOutcome> {
    let mut outcome = ReconcileOutcome::default();
    let key = &winner.repo_key;

    // Preflight: make sure the expected path holds the expected repository.
    match preflight(git, catalog, path, winner, meta, dry_run, &mut outcome, reporter)? {
        Preflight::Ready | Preflight::CloneScheduled => {}
        Preflight::Stop => return Ok(outcome),
    }

    let remote = meta.preferred_remote.clone().unwrap_or_else(|| "origin".to_string());

    // Fetch.
    if config.fetch_prune {
        outcome.steps.push(ReconcileStep::Fetch);
        if !dry_run {
            if let Err(err) = git.fetch_prune(path, &remote) {
                reporter.warn(&format!("{key}: fetch failed: {}", err.output().trim()));
                return Ok(outcome.fail(UnsyncableReason::PullFailed));
            }
            outcome.mutated = true;
        }
    }

    // Checkout the winner's branch, creating a tracking branch if needed.
    if !winner.branch.is_empty() && meta.branch_follow_enabled {
        let current = if dry_run {
            String::new()
        } else {
            git.current_branch(path)?
        };
        if current != winner.branch {
            outcome.steps.push(ReconcileStep::Checkout);
            if !dry_run {
                if let Err(err) = git.checkout(path, &winner.branch, &remote) {
                    reporter.warn(&format!(
                        "{key}: checkout {} failed: {}",
                        winner.branch,
                        err.output().trim()
                    ));
                    return Ok(outcome.fail(UnsyncableReason::CheckoutFailed));
                }
                outcome.mutated = true;
            }
        }
    }

    // Fast-forward pull.
    if config.pull_ff_only {
        outcome.steps.push(ReconcileStep::Pull);
        if !dry_run {
            if let Err(err) = git.pull_ff_only(path) {
                let output = err.output();
                reporter.warn(&format!("{key}: pull failed: {}", output.trim()));
                let reason = if is_merge_conflict(&output) {
                    UnsyncableReason::Diverged
                } else {
                    UnsyncableReason::PullFailed
                };
                return Ok(outcome.fail(reason));
            }
            outcome.mutated = true;
        }
    }

    // Optional push of local work.
    if dry_run {
        return Ok(outcome);
    }
    let (ahead, _) = git.ahead_behind(path)?;
    if ahead > 0 && meta.push_access != crate::types::PushAccess::ReadOnly {
        let policy = SyncPolicy::from_meta(catalog, Some(meta), cli_push);
        let branch = git.current_branch(path)?;
        let default_branch = git.default_branch(path, &remote)?;
        let on_default = !branch.is_empty() && branch == default_branch;
        if policy.push_permitted(on_default) {
            outcome.steps.push(ReconcileStep::Push);
            if let Err(err) = git.push(path) {
                let output = err.output();
                reporter.warn(&format!("{key}: push failed: {}", output.trim()));
                if is_permission_denied(&output) {
                    outcome.downgrade_push_access = true;
                }
                return Ok(outcome.fail(UnsyncableReason::PushFailed));
            }
            outcome.mutated = true;
        }
    }

    Ok(outcome)
}

enum Preflight {
    Ready,
    CloneScheduled,
    Stop,
}

#[allow(clippy::too_many_arguments)]
fn preflight(
    git: &dyn Git,
    catalog: &Catalog,
    path: &Path,
    winner: &MachineRepoRecord,
    meta: &RepoMetadata,
    dry_run: bool,
    outcome: &mut ReconcileOutcome,
    reporter: &mut dyn Reporter,
) -> Result<Preflight> {
    let key = &winner.repo_key;
    let is_empty_dir = |p: &Path| -> Result<bool> {
        let mut entries =
            fs::read_dir(p).with_context(|| format!("failed to read dir {}", p.display()))?;
        Ok(entries.next().is_none())
    };

    let needs_clone = if !path.exists() {
        true
    } else if git.is_work_tree(path) {
        // Path backfill done; verify the origin matches the winner's.
        let origin = git
            .origin_url(path, meta.preferred_remote.as_deref())
            .unwrap_or_default();
        if !origin.is_empty() && !winner.origin_url.is_empty() {
            if !same_origin(&origin, &winner.origin_url) {
                outcome.reasons.push(UnsyncableReason::TargetPathRepoMismatch);
                return Ok(Preflight::Stop);
            }
            if origin != winner.origin_url {
                // Same repository, different URL format: rewrite in place.
                outcome.steps.push(ReconcileStep::RewriteRemoteUrl);
                if !dry_run {
                    let remote = meta.preferred_remote.as_deref().unwrap_or("origin");
                    if let Err(err) = git.set_remote_url(path, remote, &winner.origin_url) {
                        reporter.warn(&format!(
                            "{key}: remote rewrite failed: {}",
                            err.output().trim()
                        ));
                    } else {
                        outcome.mutated = true;
                    }
                }
            }
        }
        false
    } else if is_empty_dir(path)? {
        true
    } else {
        outcome
            .reasons
            .push(UnsyncableReason::TargetPathNonemptyNotRepo);
        return Ok(Preflight::Stop);
    };

    if !needs_clone {
        return Ok(Preflight::Ready);
    }

    if winner.origin_url.is_empty() || !catalog.auto_clone_on_sync() {
        outcome.reasons.push(UnsyncableReason::CloneRequired);
        return Ok(Preflight::Stop);
    }

    outcome.steps.push(ReconcileStep::Clone);
    if dry_run {
        return Ok(Preflight::CloneScheduled);
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create dir {}", parent.display()))?;
    }
    if let Err(err) = git.clone_repo(&CloneOptions {
        url: winner.origin_url.clone(),
        dest: path.to_path_buf(),
        shallow: false,
        filter: None,
        sparse_paths: vec![],
    }) {
        reporter.warn(&format!("{key}: clone failed: {}", err.output().trim()));
        outcome.reasons.push(UnsyncableReason::CloneRequired);
        return Ok(Preflight::Stop);
    }
    outcome.mutated = true;
    Ok(Preflight::Ready)
}
