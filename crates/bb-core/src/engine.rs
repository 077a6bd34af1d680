//! Orchestrator: top-level workflows over the scanner, winner selector,
//! reconciler, fix rules, and notify cache.
//!
//! One command runs at a time under the process lock. Within a pass the
//! order is fixed: scan completes before winner selection, which completes
//! before reconcile; each repository is visited at most twice
//! (observe → reconcile → re-observe).

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};

use crate::clock;
use crate::config::Config;
use crate::fix::{self, FixActionId, FixContext, FixOptions};
use crate::git::{CloneOptions, Git, normalize_origin};
use crate::lock::ProcessLock;
use crate::machine;
use crate::notify;
use crate::observe::{self, SyncPolicy};
use crate::paths::Paths;
use crate::reconcile::{self, ReconcileOutcome};
use crate::scan;
use crate::statehash::record_state_hash;
use crate::store::Store;
use crate::transport;
use crate::types::{
    AutoPush, Catalog, MachineFile, MachineRepoRecord, PushAccess, RepoKey, RepoMetadata,
    UnsyncableReason, Visibility,
};
use crate::winner::{Candidate, select_winner};

/// Progress/log sink implemented by the CLI. `--quiet` silences `info`.
pub trait Reporter {
    fn info(&mut self, msg: &str);
    fn warn(&mut self, msg: &str);
    fn error(&mut self, msg: &str);
}

/// Swallows everything; used by tests and read-only helpers.
pub struct NullReporter;

impl Reporter for NullReporter {
    fn info(&mut self, _msg: &str) {}
    fn warn(&mut self, _msg: &str) {}
    fn error(&mut self, _msg: &str) {}
}

/// Terminal status of a workflow that inspected repositories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Clean,
    Unsyncable,
}

impl RunStatus {
    pub fn exit_code(self) -> i32 {
        match self {
            RunStatus::Clean => 0,
            RunStatus::Unsyncable => 1,
        }
    }

    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a MachineRepoRecord>) -> Self {
        if records.into_iter().all(|r| r.syncable) {
            RunStatus::Clean
        } else {
            RunStatus::Unsyncable
        }
    }
}

/// Options for `sync`.
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    pub include: Vec<String>,
    pub push: bool,
    pub dry_run: bool,
    pub notify: bool,
    pub notify_backend: Option<String>,
}

/// Request for `clone`.
#[derive(Debug, Clone, Default)]
pub struct CloneRequest {
    pub selector: String,
    pub catalog: Option<String>,
    pub rename: Option<String>,
    pub shallow: bool,
    /// Already normalized: empty means unset.
    pub filter: Option<String>,
    pub only: Vec<String>,
}

/// Request for `link`.
#[derive(Debug, Clone, Default)]
pub struct LinkRequest {
    pub selector: String,
    pub rename: Option<String>,
    pub dir: Option<PathBuf>,
    pub absolute: bool,
    pub catalog: Option<String>,
}

/// One command invocation's context: configuration, identity, store, Git.
pub struct Session<'a> {
    git: &'a dyn Git,
    pub store: Store,
    pub config: Config,
    pub machine_id: String,
    pub hostname: String,
}

impl<'a> Session<'a> {
    pub fn open(git: &'a dyn Git, paths: Paths) -> Result<Self> {
        let config = Config::load(&paths)?;
        let machine_id = machine::machine_id(&paths)?;
        let hostname = machine::hostname();
        Ok(Self {
            git,
            store: Store::new(paths),
            config,
            machine_id,
            hostname,
        })
    }

    pub fn paths(&self) -> &Paths {
        self.store.paths()
    }

    fn lock(&self) -> Result<ProcessLock> {
        ProcessLock::acquire(self.paths(), &self.hostname, clock::now())
    }

    // ---- scan ----------------------------------------------------------

    /// Observe the selected catalogs and write this machine's snapshot.
    fn scan_pass(
        &self,
        include: &[String],
        cli_push: bool,
        reporter: &mut dyn Reporter,
    ) -> Result<MachineFile> {
        let selected = scan::select_catalogs(&self.config, include)?;
        let selected_names: Vec<String> = selected.iter().map(|c| c.name.clone()).collect();
        let now = clock::now();
        let prev = self.store.load_machine(&self.machine_id)?;

        let mut records: Vec<MachineRepoRecord> = Vec::new();
        if let Some(prev) = &prev {
            // A partial scan keeps records from unselected catalogs.
            for record in &prev.repos {
                if !selected_names.contains(&record.catalog) {
                    records.push(record.clone());
                }
            }
        }

        for catalog in &selected {
            for discovered in scan::discover(catalog)? {
                let key_str = discovered.key.to_string();
                reporter.info(&format!("observing {key_str}"));
                let record = self.observe_one(
                    catalog,
                    &discovered.key,
                    &discovered.path,
                    cli_push,
                    prev.as_ref().and_then(|p| p.record(&key_str)),
                    now,
                )?;
                records.push(record);
            }
        }
        records.sort_by(|a, b| a.repo_key.cmp(&b.repo_key));

        let machine = MachineFile {
            machine_id: self.machine_id.clone(),
            hostname: self.hostname.clone(),
            default_catalog: self.config.default_catalog.clone(),
            catalogs: self.config.catalogs.iter().map(|c| c.name.clone()).collect(),
            last_scan_at: Some(now),
            last_scan_catalogs: selected_names,
            updated_at: now,
            repos: records,
        };
        self.store.save_machine(&machine)?;
        Ok(machine)
    }

    /// Observe one working tree into a machine record, creating shared
    /// metadata for newly discovered repositories.
    fn observe_one(
        &self,
        catalog: &Catalog,
        key: &RepoKey,
        path: &Path,
        cli_push: bool,
        prev_record: Option<&MachineRepoRecord>,
        now: DateTime<Utc>,
    ) -> Result<MachineRepoRecord> {
        let key_str = key.to_string();
        let mut meta = self.store.load_repo_meta(&key_str)?;
        let preferred_remote = meta.as_ref().and_then(|m| m.preferred_remote.clone());
        let push_access = meta.as_ref().map(|m| m.push_access).unwrap_or_default();

        let observed = observe::observe_tree(
            self.git,
            path,
            preferred_remote.as_deref(),
            self.config.include_untracked,
            push_access,
        )?;

        if meta.is_none() {
            let fresh = RepoMetadata {
                auto_push: self.config.auto_push,
                ..RepoMetadata::discovered(key, observed.origin_url.clone())
            };
            self.store.save_repo_meta(&fresh)?;
            meta = Some(fresh);
        }

        let policy = SyncPolicy::from_meta(catalog, meta.as_ref(), cli_push);
        let mut reasons = observe::evaluate_syncability(&observed, &policy);
        reasons.extend(observe::metadata_reasons(&observed, meta.as_ref(), &catalog.name));

        Ok(observe::build_record(
            key,
            path,
            &observed,
            reasons,
            prev_record,
            now,
        ))
    }

    pub fn run_scan(
        &self,
        include: &[String],
        cli_push: bool,
        reporter: &mut dyn Reporter,
    ) -> Result<RunStatus> {
        let mode = self.config.transport_mode()?;
        let _lock = self.lock()?;
        transport::pull(self.git, self.paths(), mode, reporter)?;
        let machine = self.scan_pass(include, cli_push, reporter)?;
        transport::publish(self.git, self.paths(), mode, &self.machine_id, reporter)?;
        reporter.info(&format!("scanned {} repositories", machine.repos.len()));
        Ok(RunStatus::from_records(&machine.repos))
    }

    // ---- sync ----------------------------------------------------------

    pub fn run_sync(&self, opts: &SyncOptions, reporter: &mut dyn Reporter) -> Result<RunStatus> {
        let mode = self.config.transport_mode()?;
        let _lock = self.lock()?;
        transport::pull(self.git, self.paths(), mode, reporter)?;

        let mut machine = self.scan_pass(&opts.include, opts.push, reporter)?;
        let peers = self.store.list_machines()?;
        let selected = scan::select_catalogs(&self.config, &opts.include)?;
        let selected_names: Vec<&str> = selected.iter().map(|c| c.name.as_str()).collect();

        let planned = plan_reconciles(
            &machine,
            &peers,
            &self.machine_id,
            &self.config,
            &selected_names,
        );

        let now = clock::now();
        for plan in planned {
            let Some(catalog) = self.config.catalog(&plan.winner.catalog) else {
                continue;
            };
            reporter.info(&format!(
                "reconciling {} toward {}@{}",
                plan.winner.repo_key, plan.winner.branch, plan.winner_machine
            ));

            let mut meta = match self.store.load_repo_meta(&plan.winner.repo_key)? {
                Some(meta) => meta,
                None => {
                    let key: RepoKey = plan.winner.repo_key.parse()?;
                    let fresh = RepoMetadata {
                        auto_push: self.config.auto_push,
                        ..RepoMetadata::discovered(&key, plan.winner.origin_url.clone())
                    };
                    self.store.save_repo_meta(&fresh)?;
                    fresh
                }
            };

            let outcome = reconcile::reconcile_repo(
                self.git,
                catalog,
                &plan.path,
                &plan.winner,
                &meta,
                &self.config,
                opts.push,
                opts.dry_run,
                reporter,
            )?;

            for step in &outcome.steps {
                reporter.info(&format!("  {} {}", step.as_str(), plan.winner.repo_key));
            }
            if outcome.downgrade_push_access && !opts.dry_run {
                meta.push_access = PushAccess::ReadOnly;
                meta.push_access_checked_remote =
                    Some(meta.preferred_remote.clone().unwrap_or_else(|| "origin".into()));
                meta.push_access_checked_at = Some(now);
                meta.push_access_manual_override = false;
                self.store.save_repo_meta(&meta)?;
            }
            if opts.dry_run {
                continue;
            }

            self.absorb_reconcile(&mut machine, catalog, &plan, outcome, opts.push, now)?;
        }

        if !opts.dry_run {
            machine.updated_at = clock::now();
            self.store.save_machine(&machine)?;
            if opts.notify {
                self.notify_unsyncable(&machine, opts.notify_backend.as_deref(), reporter)?;
            }
            transport::publish(self.git, self.paths(), mode, &self.machine_id, reporter)?;
        }

        Ok(RunStatus::from_records(&machine.repos))
    }

    /// Fold a reconcile outcome back into the machine snapshot, re-observing
    /// when the tree changed.
    fn absorb_reconcile(
        &self,
        machine: &mut MachineFile,
        catalog: &Catalog,
        plan: &PlannedReconcile,
        outcome: ReconcileOutcome,
        cli_push: bool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let key: RepoKey = plan.winner.repo_key.parse()?;
        let key_str = key.to_string();
        let prev = machine.record(&key_str).cloned();

        let record = if plan.path.exists() && self.git.is_work_tree(&plan.path) {
            let mut record =
                self.observe_one(catalog, &key, &plan.path, cli_push, prev.as_ref(), now)?;
            merge_reasons(&mut record, &outcome.reasons, prev.as_ref(), now);
            record
        } else {
            // Nothing on disk to observe (clone pending or refused).
            let mut record = MachineRepoRecord {
                repo_key: key_str.clone(),
                name: key.name().to_string(),
                catalog: key.catalog.clone(),
                path: plan.path.clone(),
                origin_url: plan.winner.origin_url.clone(),
                branch: String::new(),
                head_sha: String::new(),
                upstream: String::new(),
                remote_head_sha: String::new(),
                ahead: 0,
                behind: 0,
                diverged: false,
                has_dirty_tracked: false,
                has_untracked: false,
                operation_in_progress: Default::default(),
                syncable: false,
                unsyncable_reasons: outcome.reasons,
                state_hash: String::new(),
                observed_at: None,
            };
            record.state_hash = record_state_hash(&record);
            record.observed_at = match &prev {
                Some(p) if p.state_hash == record.state_hash && p.observed_at.is_some() => {
                    p.observed_at
                }
                _ => Some(now),
            };
            record
        };

        match machine.repos.iter_mut().find(|r| r.repo_key == key_str) {
            Some(slot) => *slot = record,
            None => {
                machine.repos.push(record);
                machine.repos.sort_by(|a, b| a.repo_key.cmp(&b.repo_key));
            }
        }
        Ok(())
    }

    fn notify_unsyncable(
        &self,
        machine: &MachineFile,
        backend_name: Option<&str>,
        reporter: &mut dyn Reporter,
    ) -> Result<()> {
        let mut cache = self.store.load_notify_cache()?;
        let mut backend = notify::backend_for(&self.config.notify, backend_name)?;
        let now = clock::now();

        let unsyncable: Vec<&MachineRepoRecord> =
            machine.repos.iter().filter(|r| !r.syncable).collect();
        for record in &unsyncable {
            let fp = notify::fingerprint(&record.unsyncable_reasons);
            if cache.should_notify(&record.repo_key, &fp, now, &self.config.notify) {
                if let Err(err) = backend.send(&record.repo_key, &record.unsyncable_reasons) {
                    reporter.warn(&format!("notification failed: {err:#}"));
                } else {
                    cache.record(&record.repo_key, fp, now);
                }
            }
        }
        cache.retain_keys(unsyncable.iter().map(|r| r.repo_key.as_str()));
        self.store.save_notify_cache(&cache)
    }

    // ---- status / doctor ----------------------------------------------

    /// Records for the selected catalogs, reusing the last scan when it is
    /// fresh enough. Read-only: no lock, no writes.
    pub fn current_records(
        &self,
        include: &[String],
        reporter: &mut dyn Reporter,
    ) -> Result<Vec<MachineRepoRecord>> {
        let selected = scan::select_catalogs(&self.config, include)?;
        let selected_names: Vec<String> = selected.iter().map(|c| c.name.clone()).collect();
        let now = clock::now();

        if let Some(machine) = self.store.load_machine(&self.machine_id)? {
            let fresh = machine.last_scan_at.is_some_and(|at| {
                (now - at).num_seconds() >= 0
                    && (now - at).num_seconds() <= self.config.scan_freshness_seconds as i64
            });
            let covers = selected_names
                .iter()
                .all(|name| machine.last_scan_catalogs.contains(name));
            if fresh && covers {
                return Ok(machine
                    .repos
                    .iter()
                    .filter(|r| selected_names.contains(&r.catalog))
                    .cloned()
                    .collect());
            }
        }

        reporter.info("scan is stale; observing working trees");
        let prev = self.store.load_machine(&self.machine_id)?;
        let mut records = Vec::new();
        for catalog in &selected {
            for discovered in scan::discover(catalog)? {
                let key_str = discovered.key.to_string();
                let record = self.observe_one(
                    catalog,
                    &discovered.key,
                    &discovered.path,
                    false,
                    prev.as_ref().and_then(|p| p.record(&key_str)),
                    now,
                )?;
                records.push(record);
            }
        }
        records.sort_by(|a, b| a.repo_key.cmp(&b.repo_key));
        Ok(records)
    }

    pub fn run_doctor(&self, include: &[String], reporter: &mut dyn Reporter) -> Result<RunStatus> {
        let mut problems = 0usize;

        let git_bin = std::env::var(crate::git::GIT_BIN_ENV).unwrap_or_else(|_| "git".into());
        match which::which(&git_bin) {
            Ok(path) => {
                let version = crate::process::run_command(&path, &["--version"], None, &[])
                    .ok()
                    .filter(|out| out.success())
                    .map(|out| out.stdout_trimmed().to_string())
                    .unwrap_or_else(|| "version unknown".to_string());
                reporter.info(&format!("git binary: {} ({version})", path.display()));
            }
            Err(_) => {
                problems += 1;
                reporter.error(&format!("git binary {git_bin:?} not found on PATH"));
            }
        }

        reporter.info(&format!("machine id: {}", self.machine_id));
        reporter.info(&format!("config root: {}", self.paths().config_root().display()));

        if self.config.catalogs.is_empty() {
            problems += 1;
            reporter.error("no catalogs configured");
        }
        for catalog in &self.config.catalogs {
            if catalog.root.is_dir() {
                reporter.info(&format!("catalog {}: {}", catalog.name, catalog.root.display()));
            } else {
                problems += 1;
                reporter.error(&format!(
                    "catalog {} root {} does not exist",
                    catalog.name,
                    catalog.root.display()
                ));
            }
        }

        let lock_path = self.paths().lock_file();
        if lock_path.exists() {
            let holder = crate::lock::read_holder(&lock_path)?;
            reporter.warn(&format!(
                "lock held by pid {} on {}",
                holder.pid.map_or_else(|| "?".into(), |p| p.to_string()),
                holder.hostname.as_deref().unwrap_or("?"),
            ));
        } else {
            reporter.info("lock: free");
        }

        match fs::create_dir_all(self.paths().machines_dir()) {
            Ok(()) => reporter.info("shared area: writable"),
            Err(err) => {
                problems += 1;
                reporter.error(&format!("shared area not writable: {err}"));
            }
        }

        let records = self.current_records(include, reporter)?;
        for record in &records {
            if !record.syncable {
                let reasons: Vec<&str> =
                    record.unsyncable_reasons.iter().map(|r| r.as_str()).collect();
                reporter.warn(&format!("{}: {}", record.repo_key, reasons.join(", ")));
            }
        }

        if problems > 0 || records.iter().any(|r| !r.syncable) {
            Ok(RunStatus::Unsyncable)
        } else {
            Ok(RunStatus::Clean)
        }
    }

    // ---- ensure --------------------------------------------------------

    /// Clone every repository known to the shared area that is missing from
    /// its catalog path on this machine.
    pub fn run_ensure(&self, include: &[String], reporter: &mut dyn Reporter) -> Result<RunStatus> {
        let mode = self.config.transport_mode()?;
        let _lock = self.lock()?;
        transport::pull(self.git, self.paths(), mode, reporter)?;

        let selected = scan::select_catalogs(&self.config, include)?;
        let selected_names: Vec<&str> = selected.iter().map(|c| c.name.as_str()).collect();

        let mut missing = 0usize;
        for meta in self.store.list_repo_meta()? {
            let Ok(key) = meta.repo_key.parse::<RepoKey>() else {
                continue;
            };
            if !selected_names.contains(&key.catalog.as_str()) {
                continue;
            }
            let Some(catalog) = self.config.catalog(&key.catalog) else {
                continue;
            };
            let path = catalog.repo_path(&key);
            if path.exists() {
                continue;
            }
            if meta.origin_url.is_empty() {
                missing += 1;
                reporter.warn(&format!(
                    "{}: missing locally and has no origin to clone from",
                    meta.repo_key
                ));
                continue;
            }
            reporter.info(&format!("cloning {} into {}", meta.repo_key, path.display()));
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create dir {}", parent.display()))?;
            }
            if let Err(err) = self.git.clone_repo(&CloneOptions {
                url: meta.origin_url.clone(),
                dest: path.clone(),
                shallow: false,
                filter: None,
                sparse_paths: vec![],
            }) {
                missing += 1;
                reporter.error(&format!(
                    "{}: clone failed: {}",
                    meta.repo_key,
                    err.output().trim()
                ));
            }
        }

        let machine = self.scan_pass(include, false, reporter)?;
        transport::publish(self.git, self.paths(), mode, &self.machine_id, reporter)?;

        if missing > 0 {
            return Ok(RunStatus::Unsyncable);
        }
        Ok(RunStatus::from_records(&machine.repos))
    }

    // ---- fix -----------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn run_fix(
        &self,
        project: Option<&str>,
        action: Option<&str>,
        include: &[String],
        options: &FixOptions,
        no_refresh: bool,
        reporter: &mut dyn Reporter,
    ) -> Result<RunStatus> {
        let _lock = self.lock()?;

        let mut machine = if no_refresh {
            self.store
                .load_machine(&self.machine_id)?
                .context("no scan on record; run `bb scan` or drop --no-refresh")?
        } else {
            let now = clock::now();
            match self.store.load_machine(&self.machine_id)? {
                Some(existing)
                    if existing.last_scan_at.is_some_and(|at| {
                        (now - at).num_seconds() >= 0
                            && (now - at).num_seconds()
                                <= self.config.scan_freshness_seconds as i64
                    }) =>
                {
                    existing
                }
                _ => self.scan_pass(include, false, reporter)?,
            }
        };

        let targets: Vec<MachineRepoRecord> = machine
            .repos
            .iter()
            .filter(|r| !r.syncable)
            .filter(|r| match project {
                Some(selector) => r.repo_key == selector || r.name == selector,
                None => true,
            })
            .cloned()
            .collect();

        if targets.is_empty() {
            match project {
                Some(selector) => bail!("no unsyncable repository matches {selector:?}"),
                None => {
                    reporter.info("nothing to fix");
                    return Ok(RunStatus::from_records(&machine.repos));
                }
            }
        }

        let Some(action_name) = action else {
            // List view: actions whose preconditions pass, per repository.
            for record in &targets {
                let mut meta = self.require_meta(record)?;
                let ctx = FixContext {
                    git: self.git,
                    store: &self.store,
                    config: &self.config,
                    record,
                    meta: &mut meta,
                    options,
                    now: clock::now(),
                };
                let actions = fix::applicable_actions(&ctx)?;
                let reasons: Vec<&str> =
                    record.unsyncable_reasons.iter().map(|r| r.as_str()).collect();
                reporter.info(&format!("{} ({})", record.repo_key, reasons.join(", ")));
                if actions.is_empty() {
                    reporter.info("  no applicable fix action");
                }
                for action in actions {
                    reporter.info(&format!("  {}: {}", action.as_str(), action.summary()));
                }
            }
            return Ok(RunStatus::from_records(&machine.repos));
        };

        let action_id: FixActionId = action_name.parse()?;
        if targets.len() > 1 {
            bail!(
                "{} unsyncable repositories match; name one project to apply {}",
                targets.len(),
                action_id.as_str()
            );
        }
        let record = &targets[0];
        let mut meta = self.require_meta(record)?;
        let mut ctx = FixContext {
            git: self.git,
            store: &self.store,
            config: &self.config,
            record,
            meta: &mut meta,
            options,
            now: clock::now(),
        };
        let outcome = fix::apply_action(action_id, &mut ctx)?;
        for note in &outcome.notes {
            reporter.info(note);
        }

        // Re-observe the repository and republish the snapshot.
        let now = clock::now();
        let key: RepoKey = record.repo_key.parse()?;
        if let Some(catalog) = self.config.catalog(&key.catalog) {
            if self.git.is_work_tree(&record.path) {
                let prev = machine.record(&record.repo_key).cloned();
                let mut refreshed =
                    self.observe_one(catalog, &key, &record.path, false, prev.as_ref(), now)?;
                merge_reasons(&mut refreshed, &outcome.new_reasons, prev.as_ref(), now);
                if let Some(slot) = machine
                    .repos
                    .iter_mut()
                    .find(|r| r.repo_key == record.repo_key)
                {
                    *slot = refreshed;
                }
            }
        }
        machine.updated_at = now;
        self.store.save_machine(&machine)?;

        Ok(RunStatus::from_records(&machine.repos))
    }

    fn require_meta(&self, record: &MachineRepoRecord) -> Result<RepoMetadata> {
        if let Some(meta) = self.store.load_repo_meta(&record.repo_key)? {
            return Ok(meta);
        }
        let key: RepoKey = record.repo_key.parse()?;
        let meta = RepoMetadata {
            auto_push: self.config.auto_push,
            ..RepoMetadata::discovered(&key, record.origin_url.clone())
        };
        self.store.save_repo_meta(&meta)?;
        Ok(meta)
    }

    // ---- repo metadata commands ---------------------------------------

    /// Resolve a repo selector against shared metadata: exact key first,
    /// then a unique name match.
    pub fn resolve_meta(&self, selector: &str) -> Result<RepoMetadata> {
        if let Some(meta) = self.store.load_repo_meta(selector)? {
            return Ok(meta);
        }
        let mut matches: Vec<RepoMetadata> = self
            .store
            .list_repo_meta()?
            .into_iter()
            .filter(|m| m.name == selector)
            .collect();
        match matches.len() {
            0 => bail!("no repository matches {selector:?}"),
            1 => Ok(matches.remove(0)),
            n => bail!("{n} repositories are named {selector:?}; use the full repo key"),
        }
    }

    pub fn repo_set_policy(&self, selector: &str, auto_push: AutoPush) -> Result<RepoMetadata> {
        let mut meta = self.resolve_meta(selector)?;
        meta.auto_push = auto_push;
        self.store.save_repo_meta(&meta)?;
        Ok(meta)
    }

    pub fn repo_set_remote(&self, selector: &str, remote: &str) -> Result<RepoMetadata> {
        let mut meta = self.resolve_meta(selector)?;
        meta.preferred_remote = Some(remote.to_string());
        self.store.save_repo_meta(&meta)?;
        Ok(meta)
    }

    pub fn repo_access_set(&self, selector: &str, access: PushAccess) -> Result<RepoMetadata> {
        let mut meta = self.resolve_meta(selector)?;
        meta.push_access = access;
        meta.push_access_manual_override = true;
        meta.push_access_checked_at = Some(clock::now());
        meta.push_access_checked_remote =
            Some(meta.preferred_remote.clone().unwrap_or_else(|| "origin".into()));
        self.store.save_repo_meta(&meta)?;
        Ok(meta)
    }

    pub fn repo_access_refresh(
        &self,
        selector: &str,
        reporter: &mut dyn Reporter,
    ) -> Result<RepoMetadata> {
        let mut meta = self.resolve_meta(selector)?;
        let machine = self
            .store
            .load_machine(&self.machine_id)?
            .context("no scan on record; run `bb scan` first")?;
        let record = machine
            .record(&meta.repo_key)
            .with_context(|| format!("{} is not present on this machine", meta.repo_key))?;

        let remote = meta.preferred_remote.clone().unwrap_or_else(|| "origin".into());
        let access = self.git.probe_push_access(&record.path, &remote)?;
        reporter.info(&format!("{}: push access {}", meta.repo_key, access.as_str()));

        meta.push_access = access;
        meta.push_access_manual_override = false;
        meta.push_access_checked_remote = Some(remote);
        meta.push_access_checked_at = Some(clock::now());
        self.store.save_repo_meta(&meta)?;
        Ok(meta)
    }

    // ---- catalog commands ---------------------------------------------

    pub fn catalog_add(&mut self, catalog: Catalog, make_default: bool) -> Result<()> {
        if self.config.catalog(&catalog.name).is_some() {
            bail!("catalog {:?} already exists", catalog.name);
        }
        let name = catalog.name.clone();
        self.config.catalogs.push(catalog);
        if make_default || self.config.default_catalog.is_none() {
            self.config.default_catalog = Some(name);
        }
        self.config.save(self.store.paths())
    }

    pub fn catalog_rm(&mut self, name: &str) -> Result<()> {
        if self.config.catalog(name).is_none() {
            bail!("unknown catalog {name:?}");
        }
        self.config.catalogs.retain(|c| c.name != name);
        if self.config.default_catalog.as_deref() == Some(name) {
            self.config.default_catalog = None;
        }
        self.config.save(self.store.paths())
    }

    pub fn catalog_set_default(&mut self, name: &str) -> Result<()> {
        if self.config.catalog(name).is_none() {
            bail!("unknown catalog {name:?}");
        }
        self.config.default_catalog = Some(name.to_string());
        self.config.save(self.store.paths())
    }

    // ---- init / clone / link ------------------------------------------

    pub fn run_init(
        &self,
        project: Option<&str>,
        catalog: Option<&str>,
        public: bool,
        push: bool,
        https: bool,
        reporter: &mut dyn Reporter,
    ) -> Result<()> {
        let owner = self.config.github_owner()?.to_string();
        let catalog = self.config.target_catalog(catalog)?;

        let name = match project {
            Some(name) => name.to_string(),
            None => std::env::current_dir()?
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .context("cannot derive a project name from the current directory")?,
        };

        let segments = match catalog.effective_depth() {
            2 => vec![owner.clone(), name.clone()],
            _ => vec![name.clone()],
        };
        let key = RepoKey::new(catalog.name.clone(), segments)?;
        let path = catalog.repo_path(&key);
        if path.join(".git").exists() {
            bail!("{} already contains a repository", path.display());
        }

        fs::create_dir_all(&path)
            .with_context(|| format!("failed to create dir {}", path.display()))?;
        self.git.init_repo(&path, "main")?;

        let url = if https {
            format!("https://github.com/{owner}/{name}.git")
        } else {
            format!("git@github.com:{owner}/{name}.git")
        };
        self.git.add_remote(&path, "origin", &url)?;

        let mut meta = RepoMetadata::discovered(&key, url.clone());
        meta.auto_push = self.config.auto_push;
        meta.visibility = if public {
            Visibility::Public
        } else {
            Visibility::Private
        };
        self.store.save_repo_meta(&meta)?;

        if push {
            let readme = path.join("README.md");
            if !readme.exists() {
                fs::write(&readme, format!("# {name}\n"))
                    .with_context(|| format!("failed to write {}", readme.display()))?;
            }
            self.git.add_all(&path)?;
            self.git.commit(&path, "Initial commit")?;
            self.git.push_upstream(&path, "origin", "main", false)?;
        }

        reporter.info(&format!("initialized {} at {}", key, path.display()));
        Ok(())
    }

    pub fn run_clone(&self, req: &CloneRequest, reporter: &mut dyn Reporter) -> Result<PathBuf> {
        let catalog = self.config.target_catalog(req.catalog.as_deref())?;
        let (url, owner, name) = self.resolve_clone_selector(&req.selector)?;
        let name = req.rename.clone().unwrap_or(name);

        let segments = match catalog.effective_depth() {
            2 => vec![owner, name],
            _ => vec![name],
        };
        let key = RepoKey::new(catalog.name.clone(), segments)?;
        let path = catalog.repo_path(&key);
        if path.exists() {
            bail!("{} already exists", path.display());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create dir {}", parent.display()))?;
        }

        reporter.info(&format!("cloning {url} into {}", path.display()));
        self.git.clone_repo(&CloneOptions {
            url: url.clone(),
            dest: path.clone(),
            shallow: req.shallow,
            filter: req.filter.clone().filter(|f| !f.is_empty()),
            sparse_paths: req.only.clone(),
        })?;

        if self.store.load_repo_meta(&key.to_string())?.is_none() {
            let mut meta = RepoMetadata::discovered(&key, url);
            meta.auto_push = self.config.auto_push;
            self.store.save_repo_meta(&meta)?;
        }
        Ok(path)
    }

    /// `owner/name`, a bare name (resolved via `github.owner`), or any URL
    /// the origin normalizer understands.
    fn resolve_clone_selector(&self, selector: &str) -> Result<(String, String, String)> {
        if selector.contains("://") || (selector.contains('@') && selector.contains(':')) {
            let identity = normalize_origin(selector)
                .with_context(|| format!("cannot parse repository URL {selector:?}"))?;
            let mut parts = identity.split('/');
            let _host = parts.next();
            let owner = parts.next().unwrap_or_default().to_string();
            let name = parts.last().unwrap_or_default().to_string();
            if owner.is_empty() || name.is_empty() {
                bail!("cannot parse repository URL {selector:?}");
            }
            return Ok((selector.to_string(), owner, name));
        }

        let (owner, name) = match selector.split_once('/') {
            Some((owner, name)) if !owner.is_empty() && !name.is_empty() => {
                (owner.to_string(), name.to_string())
            }
            Some(_) => bail!("invalid repository selector {selector:?}"),
            None => (self.config.github_owner()?.to_string(), selector.to_string()),
        };
        let url = format!("git@github.com:{owner}/{name}.git");
        Ok((url, owner, name))
    }

    pub fn run_link(&self, req: &LinkRequest, reporter: &mut dyn Reporter) -> Result<PathBuf> {
        let target = self.resolve_link_target(req)?;

        let dir = match &req.dir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir()?,
        };
        let link_name = match &req.rename {
            Some(name) => name.clone(),
            None => target
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .context("cannot derive a link name")?,
        };
        let link_path = dir.join(&link_name);
        if link_path.exists() {
            bail!("{} already exists", link_path.display());
        }

        let link_target = if req.absolute {
            target.clone()
        } else {
            make_relative(&target, &dir)
        };

        #[cfg(unix)]
        std::os::unix::fs::symlink(&link_target, &link_path)
            .with_context(|| format!("failed to link {}", link_path.display()))?;
        #[cfg(not(unix))]
        bail!("link is only supported on Unix platforms");

        #[cfg(unix)]
        {
            reporter.info(&format!(
                "linked {} -> {}",
                link_path.display(),
                link_target.display()
            ));
            Ok(link_path)
        }
    }

    fn resolve_link_target(&self, req: &LinkRequest) -> Result<PathBuf> {
        // Full repo key selector.
        if let Ok(key) = req.selector.parse::<RepoKey>() {
            if let Some(catalog) = self.config.catalog(&key.catalog) {
                let path = catalog.repo_path(&key);
                if path.exists() {
                    return Ok(path);
                }
            }
        }
        // Bare name, searched in the target catalog (or all catalogs).
        let catalogs: Vec<&Catalog> = match req.catalog.as_deref() {
            Some(name) => vec![
                self.config
                    .catalog(name)
                    .with_context(|| format!("unknown catalog {name:?}"))?,
            ],
            None => self.config.catalogs.iter().collect(),
        };
        for catalog in catalogs {
            for discovered in scan::discover(catalog)? {
                if discovered.key.name() == req.selector {
                    return Ok(discovered.path);
                }
            }
        }
        bail!("no repository matches {:?}", req.selector)
    }
}

/// A reconcile the sync pass decided to run.
#[derive(Debug, Clone)]
struct PlannedReconcile {
    path: PathBuf,
    winner: MachineRepoRecord,
    winner_machine: String,
}

/// Decide which repositories need reconciling: locally-present records whose
/// winner differs, plus repositories other machines know that are missing
/// here. Pure over the snapshots.
fn plan_reconciles(
    machine: &MachineFile,
    peers: &[MachineFile],
    machine_id: &str,
    config: &Config,
    selected_catalogs: &[&str],
) -> Vec<PlannedReconcile> {
    let mut by_key: BTreeMap<&str, Vec<Candidate<'_>>> = BTreeMap::new();
    for peer in peers {
        for record in &peer.repos {
            by_key.entry(record.repo_key.as_str()).or_default().push(Candidate {
                machine_id: &peer.machine_id,
                record,
            });
        }
    }

    let mut planned = Vec::new();
    for (key, candidates) in &by_key {
        let Ok(parsed) = key.parse::<RepoKey>() else {
            continue;
        };
        if !selected_catalogs.contains(&parsed.catalog.as_str()) {
            continue;
        }
        let Some(catalog) = config.catalog(&parsed.catalog) else {
            continue;
        };
        let Some(winner) = select_winner(candidates) else {
            continue;
        };

        match machine.record(key) {
            Some(local) => {
                if local
                    .unsyncable_reasons
                    .iter()
                    .any(|r| r.is_blocking())
                {
                    continue;
                }
                if winner.machine_id == machine_id {
                    // Our own record is authoritative; the only work left
                    // is pushing local commits the policy permits.
                    if local.ahead == 0 {
                        continue;
                    }
                } else if local.branch == winner.record.branch
                    && local.head_sha == winner.record.head_sha
                {
                    continue;
                }
                planned.push(PlannedReconcile {
                    path: local.path.clone(),
                    winner: winner.record.clone(),
                    winner_machine: winner.machine_id.to_string(),
                });
            }
            None => {
                // Known elsewhere, absent here: reconcile against the
                // catalog-derived path (clone backfill or clone_required).
                planned.push(PlannedReconcile {
                    path: catalog.repo_path(&parsed),
                    winner: winner.record.clone(),
                    winner_machine: winner.machine_id.to_string(),
                });
            }
        }
    }
    planned
}

/// Relative path from `from_dir` to `target`, computed lexically.
fn make_relative(target: &Path, from_dir: &Path) -> PathBuf {
    let target_comps: Vec<_> = target.components().collect();
    let from_comps: Vec<_> = from_dir.components().collect();
    let common = target_comps
        .iter()
        .zip(from_comps.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut rel = PathBuf::new();
    for _ in common..from_comps.len() {
        rel.push("..");
    }
    for comp in &target_comps[common..] {
        rel.push(comp.as_os_str());
    }
    if rel.as_os_str().is_empty() {
        rel.push(".");
    }
    rel
}

/// Append reconcile-produced reasons to a re-observed record, keeping the
/// hash and `observed_at` laws intact.
fn merge_reasons(
    record: &mut MachineRepoRecord,
    extra: &[UnsyncableReason],
    prev: Option<&MachineRepoRecord>,
    now: DateTime<Utc>,
) {
    if extra.is_empty() {
        return;
    }
    for reason in extra {
        if !record.unsyncable_reasons.contains(reason) {
            record.unsyncable_reasons.push(*reason);
        }
    }
    record.syncable = record.unsyncable_reasons.is_empty();
    record.state_hash = record_state_hash(record);
    record.observed_at = match prev {
        Some(prev) if prev.state_hash == record.state_hash && prev.observed_at.is_some() => {
            prev.observed_at
        }
        _ => Some(now),
    };
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use crate::testutil::record_at;
    use crate::types::Operation;

    use super::*;

    fn machine_with(id: &str, records: Vec<MachineRepoRecord>) -> MachineFile {
        MachineFile {
            machine_id: id.to_string(),
            hostname: id.to_string(),
            default_catalog: None,
            catalogs: vec!["work".into()],
            last_scan_at: Some(Utc::now()),
            last_scan_catalogs: vec!["work".into()],
            updated_at: Utc::now(),
            repos: records,
        }
    }

    fn config_with_work_catalog() -> Config {
        let mut config = Config::default();
        config.catalogs.push(Catalog::new("work", "/srv/work"));
        config
    }

    fn at(hour: u32) -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, hour, 0, 0).unwrap()
    }

    #[test]
    fn plan_skips_repos_already_matching_the_winner() {
        let config = config_with_work_catalog();
        let local = record_at("work/repo", at(8));
        let mut remote = record_at("work/repo", at(12));
        remote.branch = local.branch.clone();
        remote.head_sha = local.head_sha.clone();

        let ours = machine_with("a-machine", vec![local]);
        let theirs = machine_with("z-machine", vec![remote]);
        let peers = vec![ours.clone(), theirs];

        let planned = plan_reconciles(&ours, &peers, "a-machine", &config, &["work"]);
        assert!(planned.is_empty());
    }

    #[test]
    fn plan_reconciles_toward_newer_winner() {
        let config = config_with_work_catalog();
        let local = record_at("work/repo", at(8));
        let mut remote = record_at("work/repo", at(12));
        remote.branch = "feature/x".into();
        remote.head_sha = "2222222".into();

        let ours = machine_with("a-machine", vec![local]);
        let theirs = machine_with("z-machine", vec![remote]);
        let peers = vec![ours.clone(), theirs];

        let planned = plan_reconciles(&ours, &peers, "a-machine", &config, &["work"]);
        assert_eq!(planned.len(), 1);
        assert_eq!(planned[0].winner_machine, "z-machine");
        assert_eq!(planned[0].winner.branch, "feature/x");
        assert_eq!(planned[0].path, ours.repos[0].path);
    }

    #[test]
    fn plan_skips_when_our_record_is_the_winner() {
        let config = config_with_work_catalog();
        let local = record_at("work/repo", at(12));
        let mut remote = record_at("work/repo", at(8));
        remote.branch = "feature/old".into();

        let ours = machine_with("a-machine", vec![local]);
        let theirs = machine_with("z-machine", vec![remote]);
        let peers = vec![ours.clone(), theirs];

        let planned = plan_reconciles(&ours, &peers, "a-machine", &config, &["work"]);
        assert!(planned.is_empty());
    }

    #[test]
    fn plan_skips_blocked_local_repos() {
        let config = config_with_work_catalog();
        let mut local = record_at("work/repo", at(8));
        local.syncable = false;
        local.has_dirty_tracked = true;
        local.unsyncable_reasons = vec![UnsyncableReason::DirtyTracked];
        let mut remote = record_at("work/repo", at(12));
        remote.head_sha = "2222222".into();

        let ours = machine_with("a-machine", vec![local]);
        let theirs = machine_with("z-machine", vec![remote]);
        let peers = vec![ours.clone(), theirs];

        let planned = plan_reconciles(&ours, &peers, "a-machine", &config, &["work"]);
        assert!(planned.is_empty());
    }

    #[test]
    fn plan_backfills_repos_missing_locally() {
        let config = config_with_work_catalog();
        let remote = record_at("work/repo", at(12));

        let ours = machine_with("a-machine", vec![]);
        let theirs = machine_with("z-machine", vec![remote]);
        let peers = vec![ours.clone(), theirs];

        let planned = plan_reconciles(&ours, &peers, "a-machine", &config, &["work"]);
        assert_eq!(planned.len(), 1);
        assert_eq!(planned[0].path, PathBuf::from("/srv/work/repo"));
    }

    #[test]
    fn plan_ignores_unselected_catalogs() {
        let config = config_with_work_catalog();
        let remote = record_at("work/repo", at(12));

        let ours = machine_with("a-machine", vec![]);
        let theirs = machine_with("z-machine", vec![remote]);
        let peers = vec![ours.clone(), theirs];

        let planned = plan_reconciles(&ours, &peers, "a-machine", &config, &[]);
        assert!(planned.is_empty());
    }

    #[test]
    fn merge_reasons_rehashes_and_marks_unsyncable() {
        let mut record = record_at("work/repo", at(8));
        let before_hash = record.state_hash.clone();
        merge_reasons(
            &mut record,
            &[UnsyncableReason::PushFailed],
            None,
            at(12),
        );
        assert!(!record.syncable);
        assert_eq!(record.unsyncable_reasons, vec![UnsyncableReason::PushFailed]);
        assert_ne!(record.state_hash, before_hash);
        assert_eq!(record.observed_at, Some(at(12)));
        assert_eq!(record.operation_in_progress, Operation::None);
    }

    #[test]
    fn merge_reasons_is_a_no_op_for_empty_extras() {
        let mut record = record_at("work/repo", at(8));
        let before = record.clone();
        merge_reasons(&mut record, &[], None, at(12));
        assert_eq!(record, before);
    }

    #[test]
    fn make_relative_walks_up_and_down() {
        assert_eq!(
            make_relative(Path::new("/srv/work/api"), Path::new("/home/u/project")),
            PathBuf::from("../../../srv/work/api")
        );
        assert_eq!(
            make_relative(Path::new("/srv/work/api"), Path::new("/srv/work")),
            PathBuf::from("api")
        );
        assert_eq!(
            make_relative(Path::new("/srv/work"), Path::new("/srv/work")),
            PathBuf::from(".")
        );
    }
}
