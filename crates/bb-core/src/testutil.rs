//! In-memory [`Git`] fake and record builders for engine-level tests.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::git::{CloneOptions, Git, GitError, GitResult, SyncProbe, SyncStrategy};
use crate::types::{MachineRepoRecord, Operation, PushAccess};

fn command_err(command: &str, stderr: &str) -> GitError {
    GitError::Command {
        command: command.to_string(),
        exit_code: 1,
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

/// Scripted state for one fake repository.
#[derive(Debug, Clone)]
pub struct FakeRepo {
    pub origin_url: String,
    pub remotes: BTreeMap<String, String>,
    pub branch: String,
    pub default_branch: String,
    pub head_sha: String,
    pub upstream: String,
    pub remote_head_sha: String,
    pub ahead: u32,
    pub behind: u32,
    pub dirty_tracked: bool,
    pub dirty_untracked: bool,
    pub dirty_files: Vec<String>,
    pub tracked_files: Vec<String>,
    pub operation: Operation,
    /// Branches that exist on the remote and can be checked out.
    pub remote_branches: Vec<String>,
    /// Stderr to fail the next push/pull/checkout with; `None` succeeds.
    pub fail_push: Option<String>,
    pub fail_pull: Option<String>,
    pub fail_checkout: bool,
    pub fail_fetch: Option<String>,
    pub probe_push: PushAccess,
    pub probe_sync: SyncProbe,
}

impl Default for FakeRepo {
    fn default() -> Self {
        Self {
            origin_url: "git@github.com:owner/repo.git".into(),
            remotes: BTreeMap::from([(
                "origin".to_string(),
                "git@github.com:owner/repo.git".to_string(),
            )]),
            branch: "main".into(),
            default_branch: "main".into(),
            head_sha: "1111111".into(),
            upstream: "origin/main".into(),
            remote_head_sha: "1111111".into(),
            ahead: 0,
            behind: 0,
            dirty_tracked: false,
            dirty_untracked: false,
            dirty_files: vec![],
            tracked_files: vec![".gitignore".into(), "README.md".into()],
            operation: Operation::None,
            remote_branches: vec!["main".into()],
            fail_push: None,
            fail_pull: None,
            fail_checkout: false,
            fail_fetch: None,
            probe_push: PushAccess::ReadWrite,
            probe_sync: SyncProbe::Clean,
        }
    }
}

/// In-memory [`Git`] implementation with just enough mutation semantics for
/// observer/reconciler/fix tests.
#[derive(Debug, Default)]
pub struct FakeGit {
    repos: RefCell<BTreeMap<PathBuf, FakeRepo>>,
    pub log: RefCell<Vec<String>>,
}

impl FakeGit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: impl Into<PathBuf>, repo: FakeRepo) {
        self.repos.borrow_mut().insert(path.into(), repo);
    }

    pub fn repo(&self, path: &Path) -> FakeRepo {
        self.repos
            .borrow()
            .get(path)
            .cloned()
            .unwrap_or_else(|| panic!("no fake repo at {}", path.display()))
    }

    pub fn calls(&self) -> Vec<String> {
        self.log.borrow().clone()
    }

    fn with_repo<T>(
        &self,
        path: &Path,
        op: &str,
        f: impl FnOnce(&mut FakeRepo) -> GitResult<T>,
    ) -> GitResult<T> {
        self.log.borrow_mut().push(format!("{op} {}", path.display()));
        let mut repos = self.repos.borrow_mut();
        let repo = repos
            .get_mut(path)
            .ok_or_else(|| command_err(op, "fatal: not a git repository"))?;
        f(repo)
    }
}

impl Git for FakeGit {
    fn is_work_tree(&self, path: &Path) -> bool {
        self.repos.borrow().contains_key(path)
    }

    fn remote_names(&self, path: &Path) -> GitResult<Vec<String>> {
        self.with_repo(path, "remote", |r| Ok(r.remotes.keys().cloned().collect()))
    }

    fn origin_url(&self, path: &Path, preferred_remote: Option<&str>) -> GitResult<String> {
        let remote = preferred_remote.unwrap_or("origin").to_string();
        self.with_repo(path, "remote get-url", |r| {
            Ok(r.remotes.get(&remote).cloned().unwrap_or_default())
        })
    }

    fn default_branch(&self, path: &Path, _remote: &str) -> GitResult<String> {
        self.with_repo(path, "default-branch", |r| Ok(r.default_branch.clone()))
    }

    fn current_branch(&self, path: &Path) -> GitResult<String> {
        self.with_repo(path, "branch --show-current", |r| Ok(r.branch.clone()))
    }

    fn head_sha(&self, path: &Path) -> GitResult<String> {
        self.with_repo(path, "rev-parse HEAD", |r| Ok(r.head_sha.clone()))
    }

    fn upstream(&self, path: &Path) -> GitResult<String> {
        self.with_repo(path, "upstream", |r| Ok(r.upstream.clone()))
    }

    fn remote_head_sha(&self, path: &Path) -> GitResult<String> {
        self.with_repo(path, "rev-parse upstream", |r| Ok(r.remote_head_sha.clone()))
    }

    fn ahead_behind(&self, path: &Path) -> GitResult<(u32, u32)> {
        self.with_repo(path, "rev-list --count", |r| Ok((r.ahead, r.behind)))
    }

    fn dirty(&self, path: &Path) -> GitResult<(bool, bool)> {
        self.with_repo(path, "status", |r| Ok((r.dirty_tracked, r.dirty_untracked)))
    }

    fn dirty_paths(&self, path: &Path) -> GitResult<Vec<String>> {
        self.with_repo(path, "status --porcelain", |r| Ok(r.dirty_files.clone()))
    }

    fn is_tracked(&self, path: &Path, file: &str) -> GitResult<bool> {
        let file = file.to_string();
        self.with_repo(path, "ls-files", |r| Ok(r.tracked_files.contains(&file)))
    }

    fn operation_in_progress(&self, path: &Path) -> GitResult<Operation> {
        self.with_repo(path, "operation", |r| Ok(r.operation))
    }

    fn init_repo(&self, path: &Path, initial_branch: &str) -> GitResult<()> {
        self.log
            .borrow_mut()
            .push(format!("init {}", path.display()));
        let repo = FakeRepo {
            origin_url: String::new(),
            remotes: BTreeMap::new(),
            branch: initial_branch.to_string(),
            default_branch: initial_branch.to_string(),
            head_sha: String::new(),
            upstream: String::new(),
            remote_head_sha: String::new(),
            remote_branches: vec![],
            ..FakeRepo::default()
        };
        self.repos.borrow_mut().insert(path.to_path_buf(), repo);
        Ok(())
    }

    fn add_remote(&self, path: &Path, name: &str, url: &str) -> GitResult<()> {
        let (name, url) = (name.to_string(), url.to_string());
        self.with_repo(path, "remote add", |r| {
            if name == "origin" {
                r.origin_url = url.clone();
            }
            r.remotes.insert(name, url);
            Ok(())
        })
    }

    fn set_remote_url(&self, path: &Path, name: &str, url: &str) -> GitResult<()> {
        let (name, url) = (name.to_string(), url.to_string());
        self.with_repo(path, "remote set-url", |r| {
            if name == "origin" {
                r.origin_url = url.clone();
            }
            r.remotes.insert(name, url);
            Ok(())
        })
    }

    fn fetch_prune(&self, path: &Path, _remote: &str) -> GitResult<()> {
        self.with_repo(path, "fetch --prune", |r| match r.fail_fetch.take() {
            Some(stderr) => Err(command_err("git fetch --prune", &stderr)),
            None => Ok(()),
        })
    }

    fn pull_ff_only(&self, path: &Path) -> GitResult<()> {
        self.with_repo(path, "pull --ff-only", |r| {
            if let Some(stderr) = r.fail_pull.take() {
                return Err(command_err("git pull --ff-only", &stderr));
            }
            if r.ahead > 0 && r.behind > 0 {
                return Err(command_err(
                    "git pull --ff-only",
                    "fatal: Not possible to fast-forward, aborting.",
                ));
            }
            if r.behind > 0 {
                r.head_sha = r.remote_head_sha.clone();
                r.behind = 0;
            }
            Ok(())
        })
    }

    fn checkout(&self, path: &Path, branch: &str, remote: &str) -> GitResult<()> {
        let branch = branch.to_string();
        let remote = remote.to_string();
        self.with_repo(path, "checkout", |r| {
            if r.fail_checkout {
                return Err(command_err("git checkout", "error: pathspec did not match"));
            }
            if !r.remote_branches.contains(&branch) && r.branch != branch {
                return Err(command_err("git checkout", "error: pathspec did not match"));
            }
            r.branch = branch.clone();
            r.upstream = format!("{remote}/{branch}");
            Ok(())
        })
    }

    fn create_branch(&self, path: &Path, branch: &str) -> GitResult<()> {
        let branch = branch.to_string();
        self.with_repo(path, "checkout -B", |r| {
            r.branch = branch.clone();
            r.upstream = String::new();
            Ok(())
        })
    }

    fn clone_repo(&self, options: &CloneOptions) -> GitResult<()> {
        self.log
            .borrow_mut()
            .push(format!("clone {} {}", options.url, options.dest.display()));
        let repo = FakeRepo {
            origin_url: options.url.clone(),
            remotes: BTreeMap::from([("origin".to_string(), options.url.clone())]),
            ..FakeRepo::default()
        };
        self.repos.borrow_mut().insert(options.dest.clone(), repo);
        Ok(())
    }

    fn push(&self, path: &Path) -> GitResult<()> {
        self.with_repo(path, "push", |r| {
            if let Some(stderr) = r.fail_push.take() {
                return Err(command_err("git push", &stderr));
            }
            r.remote_head_sha = r.head_sha.clone();
            r.ahead = 0;
            Ok(())
        })
    }

    fn push_upstream(&self, path: &Path, remote: &str, branch: &str, _force: bool) -> GitResult<()> {
        let (remote, branch) = (remote.to_string(), branch.to_string());
        self.with_repo(path, "push --set-upstream", |r| {
            if let Some(stderr) = r.fail_push.take() {
                return Err(command_err("git push --set-upstream", &stderr));
            }
            r.upstream = format!("{remote}/{branch}");
            if !r.remote_branches.contains(&branch) {
                r.remote_branches.push(branch.clone());
            }
            r.remote_head_sha = r.head_sha.clone();
            r.ahead = 0;
            Ok(())
        })
    }

    fn add_all(&self, path: &Path) -> GitResult<()> {
        self.with_repo(path, "add --all", |r| {
            r.dirty_tracked = false;
            r.dirty_untracked = false;
            Ok(())
        })
    }

    fn commit(&self, path: &Path, _message: &str) -> GitResult<()> {
        self.with_repo(path, "commit", |r| {
            r.head_sha = format!("{}+", r.head_sha);
            r.ahead += 1;
            r.dirty_files.clear();
            Ok(())
        })
    }

    fn rebase(&self, path: &Path, _onto: &str) -> GitResult<()> {
        self.with_repo(path, "rebase", |r| {
            r.behind = 0;
            Ok(())
        })
    }

    fn merge_no_edit(&self, path: &Path, _reference: &str) -> GitResult<()> {
        self.with_repo(path, "merge --no-edit", |r| {
            r.behind = 0;
            r.ahead += 1;
            Ok(())
        })
    }

    fn probe_push_access(&self, path: &Path, _remote: &str) -> GitResult<PushAccess> {
        self.with_repo(path, "push --dry-run", |r| Ok(r.probe_push))
    }

    fn probe_sync_with_upstream(
        &self,
        path: &Path,
        _strategy: SyncStrategy,
    ) -> GitResult<SyncProbe> {
        self.with_repo(path, "sync-probe", |r| Ok(r.probe_sync))
    }
}

/// A syncable baseline record for winner/reconcile tests.
pub fn record_at(repo_key: &str, observed_at: DateTime<Utc>) -> MachineRepoRecord {
    let key: crate::types::RepoKey = repo_key.parse().expect("valid key");
    MachineRepoRecord {
        repo_key: repo_key.to_string(),
        name: key.name().to_string(),
        catalog: key.catalog.clone(),
        path: PathBuf::from(format!("/srv/{repo_key}")),
        origin_url: "git@github.com:owner/repo.git".into(),
        branch: "main".into(),
        head_sha: "1111111".into(),
        upstream: "origin/main".into(),
        remote_head_sha: "1111111".into(),
        ahead: 0,
        behind: 0,
        diverged: false,
        has_dirty_tracked: false,
        has_untracked: false,
        operation_in_progress: Operation::None,
        syncable: true,
        unsyncable_reasons: vec![],
        state_hash: "sha256:fake".into(),
        observed_at: Some(observed_at),
    }
}
