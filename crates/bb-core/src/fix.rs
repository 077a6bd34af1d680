//! Remediation catalogue: a rule system over repo records.
//!
//! Each action declares the reasons it intends to clear plus guard
//! predicates, and a small imperative body over the Git adapter. The list
//! view is computed by filtering actions whose preconditions hold on the
//! current record; applying one runs the body and reports what changed.

use std::fs;
use std::str::FromStr;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};

use crate::config::Config;
use crate::git::{Git, SyncProbe, SyncStrategy, normalize_origin};
use crate::store::Store;
use crate::types::{
    AutoPush, MachineRepoRecord, PushAccess, RepoKey, RepoMetadata, UnsyncableReason,
};

/// Dirty paths that suppress `stage-commit-push` outright.
const SECRET_FILES: &[&str] = &[".env"];

/// Dirty path prefixes that suppress `stage-commit-push` unless a tracked
/// `.gitignore` exists to keep them out of the commit.
const NOISY_PREFIXES: &[&str] = &["node_modules/", "target/", "dist/", "build/", ".venv/"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixActionId {
    StageCommitPush,
    SetUpstreamPush,
    EnableAutoPush,
    ForkAndRetarget,
    SyncWithUpstream,
    PublishNewBranch,
    MoveToCatalog,
    CreateProject,
}

pub const ALL_ACTIONS: &[FixActionId] = &[
    FixActionId::StageCommitPush,
    FixActionId::SetUpstreamPush,
    FixActionId::EnableAutoPush,
    FixActionId::ForkAndRetarget,
    FixActionId::SyncWithUpstream,
    FixActionId::PublishNewBranch,
    FixActionId::MoveToCatalog,
    FixActionId::CreateProject,
];

impl FixActionId {
    pub fn as_str(self) -> &'static str {
        match self {
            FixActionId::StageCommitPush => "stage-commit-push",
            FixActionId::SetUpstreamPush => "set-upstream-push",
            FixActionId::EnableAutoPush => "enable-auto-push",
            FixActionId::ForkAndRetarget => "fork-and-retarget",
            FixActionId::SyncWithUpstream => "sync-with-upstream",
            FixActionId::PublishNewBranch => "publish-new-branch",
            FixActionId::MoveToCatalog => "move-to-catalog",
            FixActionId::CreateProject => "create-project",
        }
    }

    pub fn summary(self) -> &'static str {
        match self {
            FixActionId::StageCommitPush => "stage all changes, commit, and push",
            FixActionId::SetUpstreamPush => "push the current branch and set its upstream",
            FixActionId::EnableAutoPush => "enable auto-push for this repository",
            FixActionId::ForkAndRetarget => "retarget origin to your fork and push there",
            FixActionId::SyncWithUpstream => "rebase or merge onto the upstream after a probe",
            FixActionId::PublishNewBranch => "move work to a new branch and publish it",
            FixActionId::MoveToCatalog => "record or restore the repository's catalog mapping",
            FixActionId::CreateProject => "create an origin for a repository that has none",
        }
    }

    /// The unsyncable reasons this action intends to clear.
    pub fn targets(self) -> &'static [UnsyncableReason] {
        match self {
            FixActionId::StageCommitPush => {
                &[UnsyncableReason::DirtyTracked, UnsyncableReason::DirtyUntracked]
            }
            FixActionId::SetUpstreamPush => &[UnsyncableReason::MissingUpstream],
            FixActionId::EnableAutoPush => &[UnsyncableReason::PushPolicyBlocked],
            FixActionId::ForkAndRetarget => {
                &[UnsyncableReason::PushAccessBlocked, UnsyncableReason::PushFailed]
            }
            FixActionId::SyncWithUpstream => &[UnsyncableReason::Diverged],
            FixActionId::PublishNewBranch => {
                &[UnsyncableReason::MissingUpstream, UnsyncableReason::PushPolicyBlocked]
            }
            FixActionId::MoveToCatalog => {
                &[UnsyncableReason::CatalogMismatch, UnsyncableReason::CatalogNotMapped]
            }
            FixActionId::CreateProject => &[UnsyncableReason::MissingOrigin],
        }
    }
}

impl FromStr for FixActionId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        ALL_ACTIONS
            .iter()
            .copied()
            .find(|a| a.as_str() == s)
            .with_context(|| format!("unknown fix action {s:?}"))
    }
}

/// Options threaded through from the `fix` command line.
#[derive(Debug, Clone, Default)]
pub struct FixOptions {
    pub message: Option<String>,
    pub publish_branch: Option<String>,
    pub sync_strategy: Option<SyncStrategy>,
    pub return_to_original_sync: bool,
}

impl FixOptions {
    fn strategy(&self) -> SyncStrategy {
        self.sync_strategy.unwrap_or(SyncStrategy::Rebase)
    }
}

/// Everything an action body may touch.
pub struct FixContext<'a> {
    pub git: &'a dyn Git,
    pub store: &'a Store,
    pub config: &'a Config,
    pub record: &'a MachineRepoRecord,
    pub meta: &'a mut RepoMetadata,
    pub options: &'a FixOptions,
    pub now: DateTime<Utc>,
}

/// What applying an action did.
#[derive(Debug, Default)]
pub struct FixOutcome {
    pub notes: Vec<String>,
    /// The working tree changed; the caller must re-observe.
    pub tree_mutated: bool,
    /// Reasons surfaced by the action itself (probe conflicts etc.).
    pub new_reasons: Vec<UnsyncableReason>,
}

impl FixOutcome {
    fn note(mut self, msg: impl Into<String>) -> Self {
        self.notes.push(msg.into());
        self
    }
}

fn targets_reason(action: FixActionId, record: &MachineRepoRecord) -> bool {
    action
        .targets()
        .iter()
        .any(|t| record.unsyncable_reasons.contains(t))
}

/// Guard predicates beyond reason targeting.
fn guard_holds(action: FixActionId, ctx: &FixContext<'_>) -> Result<bool> {
    let record = ctx.record;
    Ok(match action {
        FixActionId::StageCommitPush => {
            let dirty = ctx.git.dirty_paths(&record.path)?;
            let has_secret = dirty.iter().any(|p| {
                SECRET_FILES
                    .iter()
                    .any(|s| p == s || p.ends_with(&format!("/{s}")))
            });
            if has_secret {
                return Ok(false);
            }
            let noisy = dirty
                .iter()
                .any(|p| NOISY_PREFIXES.iter().any(|n| p.starts_with(n)));
            if noisy && !ctx.git.is_tracked(&record.path, ".gitignore")? {
                return Ok(false);
            }
            !record.branch.is_empty() && !record.origin_url.is_empty()
        }
        FixActionId::SetUpstreamPush => {
            !record.branch.is_empty() && !record.origin_url.is_empty()
        }
        FixActionId::EnableAutoPush => ctx.meta.auto_push != AutoPush::IncludeDefaultBranch,
        FixActionId::ForkAndRetarget => {
            ctx.config.github.owner.is_some() && normalize_origin(&record.origin_url).is_some()
        }
        FixActionId::SyncWithUpstream => !record.upstream.is_empty(),
        FixActionId::PublishNewBranch => ctx.options.publish_branch.is_some(),
        FixActionId::MoveToCatalog => match ctx.meta.preferred_catalog.as_deref() {
            None => true,
            Some(preferred) => ctx.config.catalog(preferred).is_some(),
        },
        FixActionId::CreateProject => ctx.config.github.owner.is_some(),
    })
}

/// Actions whose targeted reasons are present and whose guards pass.
pub fn applicable_actions(ctx: &FixContext<'_>) -> Result<Vec<FixActionId>> {
    let mut actions = Vec::new();
    for action in ALL_ACTIONS.iter().copied() {
        if targets_reason(action, ctx.record) && guard_holds(action, ctx)? {
            actions.push(action);
        }
    }
    Ok(actions)
}

/// Apply a single action. Preconditions are re-checked; an action whose
/// guard no longer holds is an error, not a silent no-op.
pub fn apply_action(action: FixActionId, ctx: &mut FixContext<'_>) -> Result<FixOutcome> {
    if !targets_reason(action, ctx.record) {
        bail!(
            "action {} does not target any current reason of {}",
            action.as_str(),
            ctx.record.repo_key
        );
    }
    if !guard_holds(action, &*ctx)? {
        bail!(
            "preconditions for {} do not hold on {}",
            action.as_str(),
            ctx.record.repo_key
        );
    }

    match action {
        FixActionId::StageCommitPush => stage_commit_push(ctx),
        FixActionId::SetUpstreamPush => set_upstream_push(ctx),
        FixActionId::EnableAutoPush => enable_auto_push(ctx),
        FixActionId::ForkAndRetarget => fork_and_retarget(ctx),
        FixActionId::SyncWithUpstream => sync_with_upstream(ctx),
        FixActionId::PublishNewBranch => publish_new_branch(ctx),
        FixActionId::MoveToCatalog => move_to_catalog(ctx),
        FixActionId::CreateProject => create_project(ctx),
    }
}

fn remote_of(meta: &RepoMetadata) -> String {
    meta.preferred_remote
        .clone()
        .unwrap_or_else(|| "origin".to_string())
}

fn stage_commit_push(ctx: &mut FixContext<'_>) -> Result<FixOutcome> {
    let path = &ctx.record.path;
    let message = ctx
        .options
        .message
        .clone()
        .unwrap_or_else(|| "Checkpoint work in progress".to_string());

    ctx.git.add_all(path)?;
    ctx.git.commit(path, &message)?;
    if ctx.record.upstream.is_empty() {
        ctx.git
            .push_upstream(path, &remote_of(ctx.meta), &ctx.record.branch, false)?;
    } else {
        ctx.git.push(path)?;
    }

    Ok(FixOutcome {
        tree_mutated: true,
        ..FixOutcome::default()
    }
    .note(format!("committed and pushed {}", ctx.record.branch)))
}

fn set_upstream_push(ctx: &mut FixContext<'_>) -> Result<FixOutcome> {
    let remote = remote_of(ctx.meta);
    ctx.git
        .push_upstream(&ctx.record.path, &remote, &ctx.record.branch, false)?;
    Ok(FixOutcome {
        tree_mutated: true,
        ..FixOutcome::default()
    }
    .note(format!("published {} to {remote}", ctx.record.branch)))
}

fn enable_auto_push(ctx: &mut FixContext<'_>) -> Result<FixOutcome> {
    let default_branch = ctx
        .git
        .default_branch(&ctx.record.path, &remote_of(ctx.meta))?;
    let on_default = !ctx.record.branch.is_empty() && ctx.record.branch == default_branch;
    ctx.meta.auto_push = if on_default {
        AutoPush::IncludeDefaultBranch
    } else {
        AutoPush::Enabled
    };
    ctx.store.save_repo_meta(ctx.meta)?;
    Ok(FixOutcome::default().note(format!(
        "auto_push set to {} for {}",
        ctx.meta.auto_push.as_str(),
        ctx.record.repo_key
    )))
}

/// Retarget origin to the operator's fork. The metadata retarget persists
/// before the push so a push failure cannot loop the action.
fn fork_and_retarget(ctx: &mut FixContext<'_>) -> Result<FixOutcome> {
    let owner = ctx.config.github_owner()?;
    let name = ctx
        .record
        .repo_key
        .parse::<RepoKey>()
        .map(|k| k.name().to_string())
        .unwrap_or_else(|_| ctx.record.name.clone());
    let fork_url = format!("git@github.com:{owner}/{name}.git");

    ctx.meta.origin_url = fork_url.clone();
    ctx.meta.push_access = PushAccess::Unknown;
    ctx.meta.push_access_checked_remote = None;
    ctx.meta.push_access_checked_at = None;
    ctx.meta.push_access_manual_override = false;
    ctx.store.save_repo_meta(ctx.meta)?;

    let remote = remote_of(ctx.meta);
    ctx.git.set_remote_url(&ctx.record.path, &remote, &fork_url)?;
    ctx.git
        .push_upstream(&ctx.record.path, &remote, &ctx.record.branch, false)?;

    Ok(FixOutcome {
        tree_mutated: true,
        ..FixOutcome::default()
    }
    .note(format!("origin retargeted to {fork_url}")))
}

fn sync_with_upstream(ctx: &mut FixContext<'_>) -> Result<FixOutcome> {
    let path = &ctx.record.path;
    let strategy = ctx.options.strategy();

    match ctx.git.probe_sync_with_upstream(path, strategy)? {
        SyncProbe::Clean => {}
        SyncProbe::Conflict => {
            return Ok(FixOutcome {
                new_reasons: vec![UnsyncableReason::SyncConflictRequiresManualResolution],
                ..FixOutcome::default()
            }
            .note(format!(
                "{} with {} would conflict; resolve manually",
                strategy.as_str(),
                ctx.record.upstream
            )));
        }
        SyncProbe::ProbeFailed | SyncProbe::Unknown => {
            return Ok(FixOutcome {
                new_reasons: vec![UnsyncableReason::SyncFeasibilityProbeFailed],
                ..FixOutcome::default()
            }
            .note("sync feasibility probe failed"));
        }
    }

    match strategy {
        SyncStrategy::Rebase => ctx.git.rebase(path, &ctx.record.upstream)?,
        SyncStrategy::Merge => ctx.git.merge_no_edit(path, &ctx.record.upstream)?,
    }
    let mut outcome = FixOutcome {
        tree_mutated: true,
        ..FixOutcome::default()
    }
    .note(format!("{}d onto {}", strategy.as_str(), ctx.record.upstream));

    if ctx.options.return_to_original_sync && !ctx.record.branch.is_empty() {
        let current = ctx.git.current_branch(path)?;
        if current != ctx.record.branch {
            ctx.git
                .checkout(path, &ctx.record.branch, &remote_of(ctx.meta))?;
            outcome = outcome.note(format!("returned to {}", ctx.record.branch));
        }
    }
    Ok(outcome)
}

fn publish_new_branch(ctx: &mut FixContext<'_>) -> Result<FixOutcome> {
    let branch = ctx
        .options
        .publish_branch
        .clone()
        .context("publish-new-branch requires --publish-branch")?;
    let path = &ctx.record.path;
    ctx.git.create_branch(path, &branch)?;
    ctx.git
        .push_upstream(path, &remote_of(ctx.meta), &branch, false)?;
    Ok(FixOutcome {
        tree_mutated: true,
        ..FixOutcome::default()
    }
    .note(format!("published new branch {branch}")))
}

fn move_to_catalog(ctx: &mut FixContext<'_>) -> Result<FixOutcome> {
    let record = ctx.record;
    let key: RepoKey = record
        .repo_key
        .parse()
        .with_context(|| format!("invalid repo key {:?}", record.repo_key))?;

    match ctx.meta.preferred_catalog.clone() {
        // Not mapped: adopt the catalog the repository was found in.
        None => {
            ctx.meta.preferred_catalog = Some(record.catalog.clone());
            ctx.store.save_repo_meta(ctx.meta)?;
            Ok(FixOutcome::default()
                .note(format!("{} mapped to catalog {}", record.repo_key, record.catalog)))
        }
        // Mismatch: move the working tree into the preferred catalog.
        Some(preferred) => {
            let catalog = ctx
                .config
                .catalog(&preferred)
                .with_context(|| format!("unknown catalog {preferred:?}"))?;
            let new_key = RepoKey::new(catalog.name.clone(), key.segments.clone())?;
            let dest = catalog.repo_path(&new_key);
            if dest.exists() {
                bail!("cannot move {}: {} already exists", record.repo_key, dest.display());
            }
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create dir {}", parent.display()))?;
            }
            fs::rename(&record.path, &dest).with_context(|| {
                format!(
                    "failed to move {} to {}",
                    record.path.display(),
                    dest.display()
                )
            })?;

            let old_key = ctx.meta.repo_key.clone();
            ctx.meta.repo_key = new_key.to_string();
            ctx.store.save_repo_meta(ctx.meta)?;
            ctx.store.remove_repo_meta(&old_key)?;

            Ok(FixOutcome {
                tree_mutated: true,
                ..FixOutcome::default()
            }
            .note(format!("moved to {}", dest.display())))
        }
    }
}

fn create_project(ctx: &mut FixContext<'_>) -> Result<FixOutcome> {
    let owner = ctx.config.github_owner()?;
    let url = format!("git@github.com:{owner}/{}.git", ctx.record.name);
    let path = &ctx.record.path;

    ctx.git.add_remote(path, "origin", &url)?;
    ctx.meta.origin_url = url.clone();
    ctx.store.save_repo_meta(ctx.meta)?;
    if !ctx.record.branch.is_empty() {
        ctx.git.push_upstream(path, "origin", &ctx.record.branch, false)?;
    }

    Ok(FixOutcome {
        tree_mutated: true,
        ..FixOutcome::default()
    }
    .note(format!("origin created at {url}")))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use chrono::Utc;
    use tempfile::tempdir;

    use crate::paths::Paths;
    use crate::testutil::{FakeGit, FakeRepo, record_at};

    use super::*;

    struct Fixture {
        git: FakeGit,
        store: Store,
        config: Config,
        record: MachineRepoRecord,
        meta: RepoMetadata,
        options: FixOptions,
        _home: tempfile::TempDir,
    }

    impl Fixture {
        fn new(reasons: Vec<UnsyncableReason>, repo: FakeRepo) -> Self {
            let home = tempdir().expect("tempdir");
            let store = Store::new(Paths::from_home(home.path()));
            let mut config = Config::default();
            config
                .catalogs
                .push(crate::types::Catalog::new("work", home.path().join("work")));
            config.github.owner = Some("me".to_string());

            let mut record = record_at("work/repo", Utc::now());
            record.path = PathBuf::from("/fake/work/repo");
            record.origin_url = repo.origin_url.clone();
            record.branch = repo.branch.clone();
            record.upstream = repo.upstream.clone();
            record.syncable = reasons.is_empty();
            record.unsyncable_reasons = reasons;

            let key: RepoKey = "work/repo".parse().expect("key");
            let meta = RepoMetadata::discovered(&key, record.origin_url.clone());

            let git = FakeGit::new();
            git.insert(&record.path, repo);

            Self {
                git,
                store,
                config,
                record,
                meta,
                options: FixOptions::default(),
                _home: home,
            }
        }

        fn ctx(&mut self) -> FixContext<'_> {
            FixContext {
                git: &self.git,
                store: &self.store,
                config: &self.config,
                record: &self.record,
                meta: &mut self.meta,
                options: &self.options,
                now: Utc::now(),
            }
        }
    }

    #[test]
    fn list_offers_stage_commit_push_for_dirty_tree() {
        let repo = FakeRepo {
            dirty_tracked: true,
            dirty_files: vec!["src/lib.rs".into()],
            ..FakeRepo::default()
        };
        let mut fx = Fixture::new(vec![UnsyncableReason::DirtyTracked], repo);
        let actions = applicable_actions(&fx.ctx()).expect("list");
        assert_eq!(actions, vec![FixActionId::StageCommitPush]);
    }

    #[test]
    fn dirty_env_file_suppresses_stage_commit_push() {
        let repo = FakeRepo {
            dirty_tracked: true,
            dirty_files: vec![".env".into(), "src/lib.rs".into()],
            ..FakeRepo::default()
        };
        let mut fx = Fixture::new(vec![UnsyncableReason::DirtyTracked], repo);
        assert!(applicable_actions(&fx.ctx()).expect("list").is_empty());
    }

    #[test]
    fn nested_env_file_also_suppresses() {
        let repo = FakeRepo {
            dirty_tracked: true,
            dirty_files: vec!["deploy/.env".into()],
            ..FakeRepo::default()
        };
        let mut fx = Fixture::new(vec![UnsyncableReason::DirtyTracked], repo);
        assert!(applicable_actions(&fx.ctx()).expect("list").is_empty());
    }

    #[test]
    fn noisy_path_requires_tracked_gitignore() {
        let noisy = FakeRepo {
            dirty_untracked: true,
            dirty_files: vec!["node_modules/left-pad/index.js".into()],
            tracked_files: vec!["README.md".into()],
            ..FakeRepo::default()
        };
        let mut fx = Fixture::new(vec![UnsyncableReason::DirtyUntracked], noisy);
        assert!(applicable_actions(&fx.ctx()).expect("list").is_empty());

        let ignored = FakeRepo {
            dirty_untracked: true,
            dirty_files: vec!["node_modules/left-pad/index.js".into()],
            ..FakeRepo::default()
        };
        let mut fx = Fixture::new(vec![UnsyncableReason::DirtyUntracked], ignored);
        assert_eq!(
            applicable_actions(&fx.ctx()).expect("list"),
            vec![FixActionId::StageCommitPush]
        );
    }

    #[test]
    fn stage_commit_push_commits_and_pushes() {
        let repo = FakeRepo {
            dirty_tracked: true,
            dirty_files: vec!["src/lib.rs".into()],
            ..FakeRepo::default()
        };
        let mut fx = Fixture::new(vec![UnsyncableReason::DirtyTracked], repo);
        fx.options.message = Some("wip".into());
        let outcome =
            apply_action(FixActionId::StageCommitPush, &mut fx.ctx()).expect("apply");
        assert!(outcome.tree_mutated);

        let repo = fx.git.repo(&fx.record.path);
        assert!(!repo.dirty_tracked);
        assert_eq!(repo.ahead, 0, "commit was pushed");
        let calls = fx.git.calls();
        assert!(calls.iter().any(|c| c.starts_with("commit")));
        assert!(calls.iter().any(|c| c.starts_with("push")));
    }

    #[test]
    fn set_upstream_push_publishes_branch() {
        let repo = FakeRepo {
            branch: "feature/x".into(),
            upstream: String::new(),
            ahead: 1,
            ..FakeRepo::default()
        };
        let mut fx = Fixture::new(vec![UnsyncableReason::MissingUpstream], repo);
        let outcome = apply_action(FixActionId::SetUpstreamPush, &mut fx.ctx()).expect("apply");
        assert!(outcome.tree_mutated);
        assert_eq!(fx.git.repo(&fx.record.path).upstream, "origin/feature/x");
    }

    #[test]
    fn enable_auto_push_persists_policy() {
        let repo = FakeRepo {
            branch: "feature/x".into(),
            ahead: 1,
            ..FakeRepo::default()
        };
        let mut fx = Fixture::new(vec![UnsyncableReason::PushPolicyBlocked], repo);
        apply_action(FixActionId::EnableAutoPush, &mut fx.ctx()).expect("apply");
        assert_eq!(fx.meta.auto_push, AutoPush::Enabled);
        let saved = fx
            .store
            .load_repo_meta("work/repo")
            .expect("load")
            .expect("some");
        assert_eq!(saved.auto_push, AutoPush::Enabled);
    }

    #[test]
    fn enable_auto_push_on_default_branch_includes_it() {
        let repo = FakeRepo {
            ahead: 1,
            ..FakeRepo::default()
        };
        let mut fx = Fixture::new(vec![UnsyncableReason::PushPolicyBlocked], repo);
        apply_action(FixActionId::EnableAutoPush, &mut fx.ctx()).expect("apply");
        assert_eq!(fx.meta.auto_push, AutoPush::IncludeDefaultBranch);
    }

    #[test]
    fn fork_and_retarget_persists_metadata_before_push() {
        let repo = FakeRepo {
            ahead: 1,
            fail_push: Some("remote: Permission denied".into()),
            ..FakeRepo::default()
        };
        let mut fx = Fixture::new(vec![UnsyncableReason::PushAccessBlocked], repo);
        let err = apply_action(FixActionId::ForkAndRetarget, &mut fx.ctx())
            .expect_err("push fails");
        assert!(format!("{err:#}").contains("Permission denied"));

        // The retarget survived the failed push, so the action cannot loop.
        let saved = fx
            .store
            .load_repo_meta("work/repo")
            .expect("load")
            .expect("some");
        assert_eq!(saved.origin_url, "git@github.com:me/repo.git");
        assert_eq!(saved.push_access, PushAccess::Unknown);
        assert_eq!(
            fx.git.repo(&fx.record.path).origin_url,
            "git@github.com:me/repo.git"
        );
    }

    #[test]
    fn sync_with_upstream_reports_conflicts_instead_of_mutating() {
        let repo = FakeRepo {
            ahead: 1,
            behind: 2,
            probe_sync: SyncProbe::Conflict,
            ..FakeRepo::default()
        };
        let mut fx = Fixture::new(vec![UnsyncableReason::Diverged], repo);
        let outcome = apply_action(FixActionId::SyncWithUpstream, &mut fx.ctx()).expect("apply");
        assert!(!outcome.tree_mutated);
        assert_eq!(
            outcome.new_reasons,
            vec![UnsyncableReason::SyncConflictRequiresManualResolution]
        );
    }

    #[test]
    fn sync_with_upstream_rebases_when_probe_is_clean() {
        let repo = FakeRepo {
            ahead: 1,
            behind: 2,
            ..FakeRepo::default()
        };
        let mut fx = Fixture::new(vec![UnsyncableReason::Diverged], repo);
        let outcome = apply_action(FixActionId::SyncWithUpstream, &mut fx.ctx()).expect("apply");
        assert!(outcome.tree_mutated);
        assert_eq!(fx.git.repo(&fx.record.path).behind, 0);
    }

    #[test]
    fn publish_new_branch_requires_the_flag() {
        let repo = FakeRepo {
            upstream: String::new(),
            ..FakeRepo::default()
        };
        let mut fx = Fixture::new(vec![UnsyncableReason::MissingUpstream], repo);
        // Without --publish-branch the action is not offered.
        let actions = applicable_actions(&fx.ctx()).expect("list");
        assert!(!actions.contains(&FixActionId::PublishNewBranch));

        fx.options.publish_branch = Some("rescue/wip".into());
        let outcome = apply_action(FixActionId::PublishNewBranch, &mut fx.ctx()).expect("apply");
        assert!(outcome.tree_mutated);
        let repo = fx.git.repo(&fx.record.path);
        assert_eq!(repo.branch, "rescue/wip");
        assert_eq!(repo.upstream, "origin/rescue/wip");
    }

    #[test]
    fn move_to_catalog_records_missing_mapping() {
        let repo = FakeRepo::default();
        let mut fx = Fixture::new(vec![UnsyncableReason::CatalogNotMapped], repo);
        fx.meta.preferred_catalog = None;
        apply_action(FixActionId::MoveToCatalog, &mut fx.ctx()).expect("apply");
        assert_eq!(fx.meta.preferred_catalog.as_deref(), Some("work"));
    }

    #[test]
    fn create_project_adds_origin_and_publishes() {
        let repo = FakeRepo {
            origin_url: String::new(),
            remotes: Default::default(),
            upstream: String::new(),
            remote_branches: vec![],
            ..FakeRepo::default()
        };
        let mut fx = Fixture::new(vec![UnsyncableReason::MissingOrigin], repo);
        fx.record.origin_url = String::new();
        let outcome = apply_action(FixActionId::CreateProject, &mut fx.ctx()).expect("apply");
        assert!(outcome.tree_mutated);
        let repo = fx.git.repo(&fx.record.path);
        assert_eq!(repo.origin_url, "git@github.com:me/repo.git");
        assert_eq!(fx.meta.origin_url, "git@github.com:me/repo.git");
    }

    #[test]
    fn apply_rejects_untargeted_action() {
        let repo = FakeRepo::default();
        let mut fx = Fixture::new(vec![UnsyncableReason::DirtyTracked], repo);
        let err = apply_action(FixActionId::SyncWithUpstream, &mut fx.ctx())
            .expect_err("must fail");
        assert!(err.to_string().contains("does not target"));
    }

    #[test]
    fn action_ids_round_trip() {
        for action in ALL_ACTIONS.iter().copied() {
            let parsed: FixActionId = action.as_str().parse().expect("parse");
            assert_eq!(parsed, action);
        }
        assert!("not-an-action".parse::<FixActionId>().is_err());
    }
}
