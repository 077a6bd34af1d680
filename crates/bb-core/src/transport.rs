//! Shared-area transport.
//!
//! In `external` mode outside tooling (cloud file sync) moves the config
//! root between machines and bb does nothing. In `git` mode the config root
//! is itself a repository: pull before reading cross-machine state, commit
//! and push after writing. Transport failures degrade to warnings so a sync
//! pass still completes against possibly-stale data.

use anyhow::Result;

use crate::config::TransportMode;
use crate::engine::Reporter;
use crate::git::Git;
use crate::paths::Paths;

/// Refresh the shared area before reading cross-machine state.
pub fn pull(
    git: &dyn Git,
    paths: &Paths,
    mode: TransportMode,
    reporter: &mut dyn Reporter,
) -> Result<()> {
    if mode != TransportMode::Git {
        return Ok(());
    }
    let root = paths.config_root();
    if !git.is_work_tree(&root) {
        reporter.warn("state_transport.mode is git but the config root is not a repository");
        return Ok(());
    }
    if let Err(err) = git.pull_ff_only(&root) {
        reporter.warn(&format!(
            "shared-area pull failed, continuing with local state: {}",
            err.output().trim()
        ));
    }
    Ok(())
}

/// Publish local writes to the shared area after a pass.
pub fn publish(
    git: &dyn Git,
    paths: &Paths,
    mode: TransportMode,
    machine_id: &str,
    reporter: &mut dyn Reporter,
) -> Result<()> {
    if mode != TransportMode::Git {
        return Ok(());
    }
    let root = paths.config_root();
    if !git.is_work_tree(&root) {
        return Ok(());
    }
    let (tracked, untracked) = git.dirty(&root)?;
    if !tracked && !untracked {
        return Ok(());
    }
    if let Err(err) = git.add_all(&root) {
        reporter.warn(&format!("shared-area stage failed: {}", err.output().trim()));
        return Ok(());
    }
    if let Err(err) = git.commit(&root, &format!("bb: state update from {machine_id}")) {
        reporter.warn(&format!("shared-area commit failed: {}", err.output().trim()));
        return Ok(());
    }
    if let Err(err) = git.push(&root) {
        reporter.warn(&format!(
            "shared-area push failed, state will publish on the next pass: {}",
            err.output().trim()
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::engine::NullReporter;
    use crate::testutil::{FakeGit, FakeRepo};

    use super::*;

    #[test]
    fn external_mode_is_a_no_op() {
        let git = FakeGit::new();
        let paths = Paths::from_home("/home/u");
        let mut reporter = NullReporter;
        pull(&git, &paths, TransportMode::External, &mut reporter).expect("pull");
        publish(&git, &paths, TransportMode::External, "m", &mut reporter).expect("publish");
        assert!(git.calls().is_empty());
    }

    #[test]
    fn git_mode_pulls_the_config_root() {
        let git = FakeGit::new();
        let paths = Paths::from_home("/home/u");
        git.insert(paths.config_root(), FakeRepo::default());
        let mut reporter = NullReporter;
        pull(&git, &paths, TransportMode::Git, &mut reporter).expect("pull");
        assert!(git.calls().iter().any(|c| c.starts_with("pull --ff-only")));
    }

    #[test]
    fn publish_commits_and_pushes_only_when_dirty() {
        let git = FakeGit::new();
        let paths = Paths::from_home("/home/u");
        let repo = FakeRepo {
            dirty_tracked: true,
            ..FakeRepo::default()
        };
        git.insert(paths.config_root(), repo);
        let mut reporter = NullReporter;
        publish(&git, &paths, TransportMode::Git, "a-machine", &mut reporter).expect("publish");
        let calls = git.calls();
        assert!(calls.iter().any(|c| c.starts_with("add --all")));
        assert!(calls.iter().any(|c| c.starts_with("commit")));
        assert!(calls.iter().any(|c| c.starts_with("push ")));
    }

    #[test]
    fn publish_skips_clean_root() {
        let git = FakeGit::new();
        let paths = Paths::from_home("/home/u");
        git.insert(paths.config_root(), FakeRepo::default());
        let mut reporter = NullReporter;
        publish(&git, &paths, TransportMode::Git, "a-machine", &mut reporter).expect("publish");
        assert!(!git.calls().iter().any(|c| c.starts_with("commit")));
    }
}
