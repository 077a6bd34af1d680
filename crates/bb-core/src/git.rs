//! Git adapter: the only component that touches working trees.
//!
//! The engine consumes Git through the [`Git`] trait; [`SystemGit`] is the
//! subprocess implementation. Every invocation runs with a hermetic
//! environment (no global/system config, no credential prompts, fixed
//! author identity); probes additionally neutralize hooks. Non-zero exits
//! become [`GitError`] values that retain the full command and output —
//! the adapter never panics on Git failures.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::process::{self, CommandOutput};
use crate::types::{Operation, PushAccess};

pub const GIT_BIN_ENV: &str = "BB_GIT_BIN";

/// Substrings (matched lowercased) that mark a push rejected for lack of
/// write access.
const PERMISSION_DENIED_MARKERS: &[&str] = &[
    "permission denied",
    "access denied",
    "read only",
    "read-only",
    "denied to",
    "does not have write access",
    "403",
    "authentication failed",
    "could not read from remote repository",
];

/// Substrings (matched lowercased) that mark a merge/rebase conflict or a
/// refused fast-forward.
const MERGE_CONFLICT_MARKERS: &[&str] = &[
    "conflict",
    "needs merge",
    "not possible to fast-forward",
    "would be overwritten by",
];

pub fn is_permission_denied(text: &str) -> bool {
    let lower = text.to_lowercase();
    PERMISSION_DENIED_MARKERS.iter().any(|m| lower.contains(m))
}

pub fn is_merge_conflict(text: &str) -> bool {
    let lower = text.to_lowercase();
    MERGE_CONFLICT_MARKERS.iter().any(|m| lower.contains(m))
}

#[derive(Debug, Error)]
pub enum GitError {
    #[error("`{command}` exited with status {exit_code}: {}", stderr.trim())]
    Command {
        command: String,
        exit_code: i32,
        stdout: String,
        stderr: String,
    },
    #[error("failed to run git: {0}")]
    Spawn(String),
}

impl GitError {
    /// Combined output for failure classification.
    pub fn output(&self) -> String {
        match self {
            GitError::Command { stdout, stderr, .. } => format!("{stdout}\n{stderr}"),
            GitError::Spawn(msg) => msg.clone(),
        }
    }
}

pub type GitResult<T> = Result<T, GitError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStrategy {
    Rebase,
    Merge,
}

impl SyncStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncStrategy::Rebase => "rebase",
            SyncStrategy::Merge => "merge",
        }
    }
}

impl std::str::FromStr for SyncStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "rebase" => Ok(SyncStrategy::Rebase),
            "merge" => Ok(SyncStrategy::Merge),
            other => anyhow::bail!("invalid sync strategy {other:?} (expected rebase or merge)"),
        }
    }
}

/// Outcome of the sync-feasibility probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncProbe {
    Clean,
    Conflict,
    ProbeFailed,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct CloneOptions {
    pub url: String,
    pub dest: PathBuf,
    pub shallow: bool,
    pub filter: Option<String>,
    /// Non-empty enables a sparse checkout restricted to these paths.
    pub sparse_paths: Vec<String>,
}

/// The fixed vocabulary of Git operations the engine uses.
///
/// Observation methods report absence as an empty string rather than an
/// error, so the Observer can assemble a state from any tree.
pub trait Git {
    fn is_work_tree(&self, path: &Path) -> bool;
    fn remote_names(&self, path: &Path) -> GitResult<Vec<String>>;
    fn origin_url(&self, path: &Path, preferred_remote: Option<&str>) -> GitResult<String>;
    fn default_branch(&self, path: &Path, remote: &str) -> GitResult<String>;
    fn current_branch(&self, path: &Path) -> GitResult<String>;
    fn head_sha(&self, path: &Path) -> GitResult<String>;
    fn upstream(&self, path: &Path) -> GitResult<String>;
    fn remote_head_sha(&self, path: &Path) -> GitResult<String>;
    fn ahead_behind(&self, path: &Path) -> GitResult<(u32, u32)>;
    /// `(tracked, untracked)` dirt.
    fn dirty(&self, path: &Path) -> GitResult<(bool, bool)>;
    /// Paths from `status --porcelain`, tracked and untracked alike.
    fn dirty_paths(&self, path: &Path) -> GitResult<Vec<String>>;
    fn is_tracked(&self, path: &Path, file: &str) -> GitResult<bool>;
    fn operation_in_progress(&self, path: &Path) -> GitResult<Operation>;

    fn init_repo(&self, path: &Path, initial_branch: &str) -> GitResult<()>;
    fn add_remote(&self, path: &Path, name: &str, url: &str) -> GitResult<()>;
    fn set_remote_url(&self, path: &Path, name: &str, url: &str) -> GitResult<()>;
    fn fetch_prune(&self, path: &Path, remote: &str) -> GitResult<()>;
    fn pull_ff_only(&self, path: &Path) -> GitResult<()>;
    /// Plain checkout, falling back to `checkout -B <b> --track <remote>/<b>`.
    fn checkout(&self, path: &Path, branch: &str, remote: &str) -> GitResult<()>;
    /// Create (or reset) a local branch at HEAD and switch to it.
    fn create_branch(&self, path: &Path, branch: &str) -> GitResult<()>;
    fn clone_repo(&self, options: &CloneOptions) -> GitResult<()>;
    fn push(&self, path: &Path) -> GitResult<()>;
    fn push_upstream(&self, path: &Path, remote: &str, branch: &str, force: bool) -> GitResult<()>;
    fn add_all(&self, path: &Path) -> GitResult<()>;
    fn commit(&self, path: &Path, message: &str) -> GitResult<()>;
    fn rebase(&self, path: &Path, onto: &str) -> GitResult<()>;
    fn merge_no_edit(&self, path: &Path, reference: &str) -> GitResult<()>;

    fn probe_push_access(&self, path: &Path, remote: &str) -> GitResult<PushAccess>;
    fn probe_sync_with_upstream(&self, path: &Path, strategy: SyncStrategy)
    -> GitResult<SyncProbe>;

    /// The upstream's remote, else `origin` when present, else the first
    /// remote in sorted order, else `origin`.
    fn preferred_remote(&self, path: &Path) -> GitResult<String> {
        let upstream = self.upstream(path)?;
        if let Some((remote, _)) = upstream.split_once('/') {
            if !remote.is_empty() {
                return Ok(remote.to_string());
            }
        }
        let mut names = self.remote_names(path)?;
        if names.iter().any(|n| n == "origin") {
            return Ok("origin".to_string());
        }
        names.sort();
        Ok(names.into_iter().next().unwrap_or_else(|| "origin".to_string()))
    }
}

/// Subprocess-backed [`Git`] implementation.
#[derive(Debug, Clone)]
pub struct SystemGit {
    program: PathBuf,
}

impl Default for SystemGit {
    fn default() -> Self {
        Self::from_env()
    }
}

impl SystemGit {
    /// Use the binary named by `BB_GIT_BIN`, else `git` from `PATH`.
    pub fn from_env() -> Self {
        let program = std::env::var_os(GIT_BIN_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("git"));
        Self { program }
    }

    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Environment for every invocation: config isolation, no prompts,
    /// fixed identity, stable messages.
    fn hermetic_env() -> Vec<(&'static str, &'static str)> {
        vec![
            ("GIT_CONFIG_GLOBAL", "/dev/null"),
            ("GIT_CONFIG_SYSTEM", "/dev/null"),
            ("GIT_CONFIG_NOSYSTEM", "1"),
            ("GIT_TERMINAL_PROMPT", "0"),
            ("GIT_ASKPASS", "true"),
            ("SSH_ASKPASS", "true"),
            ("GIT_AUTHOR_NAME", "bb"),
            ("GIT_AUTHOR_EMAIL", "bb@localhost"),
            ("GIT_COMMITTER_NAME", "bb"),
            ("GIT_COMMITTER_EMAIL", "bb@localhost"),
            ("LC_ALL", "C"),
        ]
    }

    fn run(&self, cwd: Option<&Path>, args: &[&str]) -> GitResult<CommandOutput> {
        let args: Vec<OsString> = args.iter().map(OsString::from).collect();
        process::run_command(&self.program, &args, cwd, &Self::hermetic_env())
            .map_err(|err| GitError::Spawn(format!("{err:#}")))
    }

    /// Run and require exit 0.
    fn run_ok(&self, cwd: Option<&Path>, args: &[&str]) -> GitResult<CommandOutput> {
        let out = self.run(cwd, args)?;
        if out.success() {
            Ok(out)
        } else {
            Err(GitError::Command {
                command: format!("git {}", args.join(" ")),
                exit_code: out.exit_code,
                stdout: out.stdout,
                stderr: out.stderr,
            })
        }
    }

    /// Probe invocations additionally neutralize hooks.
    fn run_probe(&self, cwd: &Path, args: &[&str]) -> GitResult<CommandOutput> {
        let mut full = vec!["-c", "core.hooksPath=/dev/null"];
        full.extend_from_slice(args);
        self.run(Some(cwd), &full)
    }

    fn git_dir(&self, path: &Path) -> GitResult<Option<PathBuf>> {
        let out = self.run(Some(path), &["rev-parse", "--git-dir"])?;
        if !out.success() {
            return Ok(None);
        }
        let raw = PathBuf::from(out.stdout_trimmed());
        Ok(Some(if raw.is_absolute() {
            raw
        } else {
            path.join(raw)
        }))
    }
}

impl Git for SystemGit {
    fn is_work_tree(&self, path: &Path) -> bool {
        if !path.is_dir() {
            return false;
        }
        self.run(Some(path), &["rev-parse", "--is-inside-work-tree"])
            .map(|out| out.success() && out.stdout_trimmed() == "true")
            .unwrap_or(false)
    }

    fn remote_names(&self, path: &Path) -> GitResult<Vec<String>> {
        let out = self.run_ok(Some(path), &["remote"])?;
        Ok(out
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn origin_url(&self, path: &Path, preferred_remote: Option<&str>) -> GitResult<String> {
        let remote = preferred_remote.unwrap_or("origin");
        let out = self.run(Some(path), &["remote", "get-url", remote])?;
        if out.success() {
            return Ok(out.stdout_trimmed().to_string());
        }
        if out.stderr.to_lowercase().contains("no such remote") {
            return Ok(String::new());
        }
        Err(GitError::Command {
            command: format!("git remote get-url {remote}"),
            exit_code: out.exit_code,
            stdout: out.stdout,
            stderr: out.stderr,
        })
    }

    fn default_branch(&self, path: &Path, remote: &str) -> GitResult<String> {
        let head_ref = format!("refs/remotes/{remote}/HEAD");
        let out = self.run(Some(path), &["symbolic-ref", "--short", &head_ref])?;
        if out.success() {
            let full = out.stdout_trimmed();
            let prefix = format!("{remote}/");
            return Ok(full
                .strip_prefix(&prefix)
                .unwrap_or(full)
                .to_string());
        }
        for candidate in ["main", "master"] {
            let remote_ref = format!("refs/remotes/{remote}/{candidate}");
            if self
                .run(Some(path), &["rev-parse", "--verify", "--quiet", &remote_ref])?
                .success()
            {
                return Ok(candidate.to_string());
            }
            let local_ref = format!("refs/heads/{candidate}");
            if self
                .run(Some(path), &["rev-parse", "--verify", "--quiet", &local_ref])?
                .success()
            {
                return Ok(candidate.to_string());
            }
        }
        Ok("main".to_string())
    }

    fn current_branch(&self, path: &Path) -> GitResult<String> {
        let out = self.run(Some(path), &["branch", "--show-current"])?;
        if out.success() {
            Ok(out.stdout_trimmed().to_string())
        } else {
            Ok(String::new())
        }
    }

    fn head_sha(&self, path: &Path) -> GitResult<String> {
        let out = self.run(Some(path), &["rev-parse", "HEAD"])?;
        if out.success() {
            Ok(out.stdout_trimmed().to_string())
        } else {
            Ok(String::new())
        }
    }

    fn upstream(&self, path: &Path) -> GitResult<String> {
        let out = self.run(
            Some(path),
            &["rev-parse", "--abbrev-ref", "--symbolic-full-name", "@{upstream}"],
        )?;
        if out.success() {
            Ok(out.stdout_trimmed().to_string())
        } else {
            Ok(String::new())
        }
    }

    fn remote_head_sha(&self, path: &Path) -> GitResult<String> {
        let out = self.run(Some(path), &["rev-parse", "@{upstream}"])?;
        if out.success() {
            Ok(out.stdout_trimmed().to_string())
        } else {
            Ok(String::new())
        }
    }

    fn ahead_behind(&self, path: &Path) -> GitResult<(u32, u32)> {
        let out = self.run(
            Some(path),
            &["rev-list", "--left-right", "--count", "HEAD...@{upstream}"],
        )?;
        if !out.success() {
            return Ok((0, 0));
        }
        let mut parts = out.stdout_trimmed().split_whitespace();
        let ahead = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
        let behind = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
        Ok((ahead, behind))
    }

    fn dirty(&self, path: &Path) -> GitResult<(bool, bool)> {
        let out = self.run_ok(Some(path), &["status", "--porcelain"])?;
        let mut tracked = false;
        let mut untracked = false;
        for line in out.stdout.lines() {
            if line.starts_with("??") {
                untracked = true;
            } else if !line.trim().is_empty() {
                tracked = true;
            }
        }
        Ok((tracked, untracked))
    }

    fn dirty_paths(&self, path: &Path) -> GitResult<Vec<String>> {
        let out = self.run_ok(Some(path), &["status", "--porcelain"])?;
        Ok(out
            .stdout
            .lines()
            .filter(|l| l.len() > 3)
            .map(|l| l[3..].trim().trim_matches('"').to_string())
            .collect())
    }

    fn is_tracked(&self, path: &Path, file: &str) -> GitResult<bool> {
        let out = self.run(Some(path), &["ls-files", "--error-unmatch", file])?;
        Ok(out.success())
    }

    fn operation_in_progress(&self, path: &Path) -> GitResult<Operation> {
        let Some(git_dir) = self.git_dir(path)? else {
            return Ok(Operation::None);
        };
        if git_dir.join("MERGE_HEAD").exists() {
            return Ok(Operation::Merge);
        }
        if git_dir.join("rebase-apply").exists() || git_dir.join("rebase-merge").exists() {
            return Ok(Operation::Rebase);
        }
        if git_dir.join("CHERRY_PICK_HEAD").exists() {
            return Ok(Operation::CherryPick);
        }
        if git_dir.join("BISECT_LOG").exists() {
            return Ok(Operation::Bisect);
        }
        Ok(Operation::None)
    }

    fn init_repo(&self, path: &Path, initial_branch: &str) -> GitResult<()> {
        let branch_arg = format!("--initial-branch={initial_branch}");
        self.run_ok(Some(path), &["init", &branch_arg]).map(|_| ())
    }

    fn add_remote(&self, path: &Path, name: &str, url: &str) -> GitResult<()> {
        self.run_ok(Some(path), &["remote", "add", name, url])
            .map(|_| ())
    }

    fn set_remote_url(&self, path: &Path, name: &str, url: &str) -> GitResult<()> {
        self.run_ok(Some(path), &["remote", "set-url", name, url])
            .map(|_| ())
    }

    fn fetch_prune(&self, path: &Path, remote: &str) -> GitResult<()> {
        self.run_ok(Some(path), &["fetch", "--prune", remote])
            .map(|_| ())
    }

    fn pull_ff_only(&self, path: &Path) -> GitResult<()> {
        self.run_ok(Some(path), &["pull", "--ff-only"]).map(|_| ())
    }

    fn checkout(&self, path: &Path, branch: &str, remote: &str) -> GitResult<()> {
        if self.run(Some(path), &["checkout", branch])?.success() {
            return Ok(());
        }
        let track = format!("{remote}/{branch}");
        self.run_ok(Some(path), &["checkout", "-B", branch, "--track", &track])
            .map(|_| ())
    }

    fn create_branch(&self, path: &Path, branch: &str) -> GitResult<()> {
        self.run_ok(Some(path), &["checkout", "-B", branch]).map(|_| ())
    }

    fn clone_repo(&self, options: &CloneOptions) -> GitResult<()> {
        let dest = options.dest.to_string_lossy().to_string();
        let mut args: Vec<&str> = vec!["clone"];
        if options.shallow {
            args.extend_from_slice(&["--depth", "1"]);
        }
        let filter_arg;
        if let Some(filter) = options.filter.as_deref().filter(|f| !f.is_empty()) {
            filter_arg = format!("--filter={filter}");
            args.push(&filter_arg);
        }
        if !options.sparse_paths.is_empty() {
            args.push("--sparse");
        }
        args.push(&options.url);
        args.push(&dest);
        self.run_ok(None, &args)?;

        if !options.sparse_paths.is_empty() {
            let mut sparse: Vec<&str> = vec!["sparse-checkout", "set"];
            sparse.extend(options.sparse_paths.iter().map(String::as_str));
            self.run_ok(Some(&options.dest), &sparse)?;
        }
        Ok(())
    }

    fn push(&self, path: &Path) -> GitResult<()> {
        self.run_ok(Some(path), &["push"]).map(|_| ())
    }

    fn push_upstream(&self, path: &Path, remote: &str, branch: &str, force: bool) -> GitResult<()> {
        let mut args = vec!["push", "--set-upstream"];
        if force {
            args.push("--force");
        }
        args.push(remote);
        args.push(branch);
        self.run_ok(Some(path), &args).map(|_| ())
    }

    fn add_all(&self, path: &Path) -> GitResult<()> {
        self.run_ok(Some(path), &["add", "--all"]).map(|_| ())
    }

    fn commit(&self, path: &Path, message: &str) -> GitResult<()> {
        self.run_ok(Some(path), &["commit", "-m", message]).map(|_| ())
    }

    fn rebase(&self, path: &Path, onto: &str) -> GitResult<()> {
        self.run_ok(Some(path), &["rebase", onto]).map(|_| ())
    }

    fn merge_no_edit(&self, path: &Path, reference: &str) -> GitResult<()> {
        self.run_ok(Some(path), &["merge", "--no-edit", reference])
            .map(|_| ())
    }

    fn probe_push_access(&self, path: &Path, remote: &str) -> GitResult<PushAccess> {
        let out = self.run_probe(path, &["push", "--dry-run", remote, "HEAD"])?;
        if out.success() {
            return Ok(PushAccess::ReadWrite);
        }
        if is_permission_denied(&out.stderr) {
            return Ok(PushAccess::ReadOnly);
        }
        Ok(PushAccess::Unknown)
    }

    fn probe_sync_with_upstream(
        &self,
        path: &Path,
        strategy: SyncStrategy,
    ) -> GitResult<SyncProbe> {
        let upstream = self.upstream(path)?;
        if upstream.is_empty() {
            return Ok(SyncProbe::Unknown);
        }

        let probe_dir =
            std::env::temp_dir().join(format!("bb-sync-probe-{}", std::process::id()));
        let probe_str = probe_dir.to_string_lossy().to_string();
        let added = self
            .run(Some(path), &["worktree", "add", "--detach", &probe_str, "HEAD"])?
            .success();
        if !added {
            return Ok(SyncProbe::ProbeFailed);
        }

        let attempt = match strategy {
            SyncStrategy::Rebase => self.run_probe(&probe_dir, &["rebase", &upstream]),
            SyncStrategy::Merge => {
                self.run_probe(&probe_dir, &["merge", "--no-edit", &upstream])
            }
        };

        let verdict = match attempt {
            Ok(out) if out.success() => SyncProbe::Clean,
            Ok(out) if is_merge_conflict(&format!("{}\n{}", out.stdout, out.stderr)) => {
                let abort = match strategy {
                    SyncStrategy::Rebase => ["rebase", "--abort"],
                    SyncStrategy::Merge => ["merge", "--abort"],
                };
                let _ = self.run_probe(&probe_dir, &abort);
                SyncProbe::Conflict
            }
            Ok(_) | Err(_) => SyncProbe::ProbeFailed,
        };

        let _ = self.run(
            Some(path),
            &["worktree", "remove", "--force", &probe_str],
        );
        let _ = self.run(Some(path), &["worktree", "prune"]);
        Ok(verdict)
    }
}

/// Normalize a remote URL to its `host/owner/name` identity, lowercased.
/// Returns `None` for URLs that do not carry an owner/name path.
pub fn normalize_origin(url: &str) -> Option<String> {
    let url = url.trim();
    if url.is_empty() {
        return None;
    }

    let (host, path) = if let Some(rest) = url
        .strip_prefix("ssh://")
        .or_else(|| url.strip_prefix("git://"))
        .or_else(|| url.strip_prefix("https://"))
        .or_else(|| url.strip_prefix("http://"))
    {
        // Drop userinfo, split host[:port] from the path.
        let rest = rest.rsplit_once('@').map_or(rest, |(_, r)| r);
        let (host, path) = rest.split_once('/')?;
        let host = host.split_once(':').map_or(host, |(h, _)| h);
        (host, path)
    } else if let Some((userinfo_host, path)) = url.split_once(':') {
        // scp-like syntax: [user@]host:owner/name
        if userinfo_host.contains('/') {
            return None;
        }
        let host = userinfo_host
            .rsplit_once('@')
            .map_or(userinfo_host, |(_, h)| h);
        (host, path)
    } else {
        return None;
    };

    let path = path
        .trim_matches('/')
        .trim_end_matches(".git")
        .trim_matches('/');
    if host.is_empty() || path.is_empty() || !path.contains('/') {
        return None;
    }
    Some(format!("{host}/{path}").to_lowercase())
}

/// Identity comparison for two remote URLs; unparseable URLs fall back to
/// literal equality.
pub fn same_origin(a: &str, b: &str) -> bool {
    match (normalize_origin(a), normalize_origin(b)) {
        (Some(na), Some(nb)) => na == nb,
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_origin_maps_all_formats_to_one_identity() {
        let expected = Some("github.com/owner/name".to_string());
        assert_eq!(normalize_origin("git@github.com:Owner/Name.git"), expected);
        assert_eq!(normalize_origin("https://github.com/Owner/Name.git"), expected);
        assert_eq!(normalize_origin("https://github.com/Owner/Name/"), expected);
        assert_eq!(normalize_origin("https://github.com/Owner/Name"), expected);
        assert_eq!(normalize_origin("ssh://git@github.com/Owner/Name.git"), expected);
        assert_eq!(
            normalize_origin("ssh://git@github.com:2222/Owner/Name.git"),
            expected
        );
    }

    #[test]
    fn normalize_origin_rejects_pathless_urls() {
        assert_eq!(normalize_origin(""), None);
        assert_eq!(normalize_origin("https://github.com/"), None);
        assert_eq!(normalize_origin("https://github.com/onlyowner"), None);
        assert_eq!(normalize_origin("/local/path/repo"), None);
    }

    #[test]
    fn normalize_origin_keeps_nested_groups() {
        assert_eq!(
            normalize_origin("git@gitlab.com:Group/Sub/Repo.git"),
            Some("gitlab.com/group/sub/repo".to_string())
        );
    }

    #[test]
    fn same_origin_compares_identities() {
        assert!(same_origin(
            "git@github.com:Owner/Name.git",
            "https://github.com/owner/name"
        ));
        assert!(!same_origin(
            "git@github.com:Owner/Name.git",
            "git@github.com:Owner/Other.git"
        ));
        // Unparseable URLs compare literally.
        assert!(same_origin("/srv/mirror.git", "/srv/mirror.git"));
        assert!(!same_origin("/srv/mirror.git", "/srv/other.git"));
    }

    #[test]
    fn permission_denied_classification() {
        assert!(is_permission_denied(
            "remote: Permission denied to deploy-bot"
        ));
        assert!(is_permission_denied("ERROR 403: Forbidden"));
        assert!(is_permission_denied(
            "fatal: Could not read from remote repository."
        ));
        assert!(!is_permission_denied("fatal: not a git repository"));
    }

    #[test]
    fn merge_conflict_classification() {
        assert!(is_merge_conflict("CONFLICT (content): Merge conflict in a.txt"));
        assert!(is_merge_conflict("fatal: Not possible to fast-forward, aborting."));
        assert!(is_merge_conflict(
            "error: Your local changes would be overwritten by merge"
        ));
        assert!(!is_merge_conflict("Everything up-to-date"));
    }

    mod with_real_git {
        use std::fs;

        use tempfile::tempdir;

        use super::*;

        fn git() -> SystemGit {
            SystemGit::from_env()
        }

        fn init_with_commit(path: &Path) -> SystemGit {
            let g = git();
            fs::create_dir_all(path).expect("mkdir");
            g.init_repo(path, "main").expect("init");
            fs::write(path.join("README.md"), "hello\n").expect("write");
            g.add_all(path).expect("add");
            g.commit(path, "initial").expect("commit");
            g
        }

        #[test]
        fn observation_on_fresh_repo() {
            let td = tempdir().expect("tempdir");
            let repo = td.path().join("repo");
            let g = init_with_commit(&repo);

            assert!(g.is_work_tree(&repo));
            assert_eq!(g.current_branch(&repo).expect("branch"), "main");
            assert_eq!(g.head_sha(&repo).expect("sha").len(), 40);
            assert_eq!(g.upstream(&repo).expect("upstream"), "");
            assert_eq!(g.ahead_behind(&repo).expect("counts"), (0, 0));
            assert_eq!(g.dirty(&repo).expect("dirty"), (false, false));
            assert_eq!(
                g.operation_in_progress(&repo).expect("op"),
                Operation::None
            );
            assert_eq!(g.origin_url(&repo, None).expect("origin"), "");
        }

        #[test]
        fn dirty_distinguishes_tracked_and_untracked() {
            let td = tempdir().expect("tempdir");
            let repo = td.path().join("repo");
            let g = init_with_commit(&repo);

            fs::write(repo.join("new.txt"), "untracked\n").expect("write");
            assert_eq!(g.dirty(&repo).expect("dirty"), (false, true));

            fs::write(repo.join("README.md"), "edited\n").expect("write");
            assert_eq!(g.dirty(&repo).expect("dirty"), (true, true));

            let paths = g.dirty_paths(&repo).expect("paths");
            assert!(paths.contains(&"README.md".to_string()));
            assert!(paths.contains(&"new.txt".to_string()));
        }

        #[test]
        fn is_tracked_reflects_index() {
            let td = tempdir().expect("tempdir");
            let repo = td.path().join("repo");
            let g = init_with_commit(&repo);
            assert!(g.is_tracked(&repo, "README.md").expect("tracked"));
            assert!(!g.is_tracked(&repo, ".gitignore").expect("untracked"));
        }

        #[test]
        fn remotes_and_origin_url() {
            let td = tempdir().expect("tempdir");
            let repo = td.path().join("repo");
            let g = init_with_commit(&repo);
            g.add_remote(&repo, "origin", "git@github.com:owner/repo.git")
                .expect("add remote");
            g.add_remote(&repo, "upstream", "git@github.com:other/repo.git")
                .expect("add remote");

            assert_eq!(
                g.remote_names(&repo).expect("names"),
                vec!["origin".to_string(), "upstream".to_string()]
            );
            assert_eq!(
                g.origin_url(&repo, None).expect("origin"),
                "git@github.com:owner/repo.git"
            );
            assert_eq!(
                g.origin_url(&repo, Some("upstream")).expect("upstream url"),
                "git@github.com:other/repo.git"
            );
            assert_eq!(g.preferred_remote(&repo).expect("preferred"), "origin");

            g.set_remote_url(&repo, "origin", "https://github.com/owner/repo.git")
                .expect("set url");
            assert_eq!(
                g.origin_url(&repo, None).expect("origin"),
                "https://github.com/owner/repo.git"
            );
        }

        #[test]
        fn clone_fetch_pull_push_against_file_remote() {
            let td = tempdir().expect("tempdir");
            let g = git();

            // Bare "remote" seeded from a source repo.
            let seed = td.path().join("seed");
            init_with_commit(&seed);
            let bare = td.path().join("remote.git");
            g.run_ok(
                None,
                &[
                    "clone",
                    "--bare",
                    &seed.to_string_lossy(),
                    &bare.to_string_lossy(),
                ],
            )
            .expect("bare clone");

            let work = td.path().join("work");
            g.clone_repo(&CloneOptions {
                url: bare.to_string_lossy().to_string(),
                dest: work.clone(),
                shallow: false,
                filter: None,
                sparse_paths: vec![],
            })
            .expect("clone");

            assert!(g.is_work_tree(&work));
            assert_eq!(g.upstream(&work).expect("upstream"), "origin/main");
            assert_eq!(
                g.remote_head_sha(&work).expect("remote sha"),
                g.head_sha(&work).expect("sha")
            );

            // Local commit: ahead 1, push clears it.
            fs::write(work.join("extra.txt"), "x\n").expect("write");
            g.add_all(&work).expect("add");
            g.commit(&work, "extra").expect("commit");
            assert_eq!(g.ahead_behind(&work).expect("counts"), (1, 0));
            g.push(&work).expect("push");
            g.fetch_prune(&work, "origin").expect("fetch");
            assert_eq!(g.ahead_behind(&work).expect("counts"), (0, 0));
            g.pull_ff_only(&work).expect("pull");
        }

        #[test]
        fn checkout_creates_tracking_branch_from_remote() {
            let td = tempdir().expect("tempdir");
            let g = git();

            let seed = td.path().join("seed");
            init_with_commit(&seed);
            g.run_ok(Some(&seed), &["checkout", "-b", "feature/x"])
                .expect("branch");
            fs::write(seed.join("feat.txt"), "f\n").expect("write");
            g.add_all(&seed).expect("add");
            g.commit(&seed, "feature work").expect("commit");

            let bare = td.path().join("remote.git");
            g.run_ok(
                None,
                &[
                    "clone",
                    "--bare",
                    &seed.to_string_lossy(),
                    &bare.to_string_lossy(),
                ],
            )
            .expect("bare clone");

            let work = td.path().join("work");
            g.clone_repo(&CloneOptions {
                url: bare.to_string_lossy().to_string(),
                dest: work.clone(),
                shallow: false,
                filter: None,
                sparse_paths: vec![],
            })
            .expect("clone");
            g.checkout(&work, "main", "origin").expect("checkout main");
            assert_eq!(g.current_branch(&work).expect("branch"), "main");

            g.checkout(&work, "feature/x", "origin")
                .expect("checkout tracking");
            assert_eq!(g.current_branch(&work).expect("branch"), "feature/x");
            assert_eq!(g.upstream(&work).expect("upstream"), "origin/feature/x");
        }

        #[test]
        fn probe_push_access_against_file_remote_is_read_write() {
            let td = tempdir().expect("tempdir");
            let g = git();

            let seed = td.path().join("seed");
            init_with_commit(&seed);
            let bare = td.path().join("remote.git");
            g.run_ok(
                None,
                &[
                    "clone",
                    "--bare",
                    &seed.to_string_lossy(),
                    &bare.to_string_lossy(),
                ],
            )
            .expect("bare clone");
            let work = td.path().join("work");
            g.clone_repo(&CloneOptions {
                url: bare.to_string_lossy().to_string(),
                dest: work.clone(),
                shallow: false,
                filter: None,
                sparse_paths: vec![],
            })
            .expect("clone");

            assert_eq!(
                g.probe_push_access(&work, "origin").expect("probe"),
                PushAccess::ReadWrite
            );
        }
    }
}
