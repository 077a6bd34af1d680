//! Scanner: catalog enumeration and working-tree discovery.
//!
//! Walks each catalog root to exactly `repo_path_depth` levels and treats
//! any entry with a `.git` marker (directory, or file for worktree-added
//! paths) as a repository. Paths whose depth does not match the catalog are
//! silently ignored.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

use crate::config::Config;
use crate::types::{Catalog, RepoKey, has_git_marker};

/// Resolve the catalog selection. An empty include-list selects every
/// configured catalog; otherwise the order of first appearance is kept and
/// unknown names are rejected.
pub fn select_catalogs<'a>(config: &'a Config, include: &[String]) -> Result<Vec<&'a Catalog>> {
    if include.is_empty() {
        return Ok(config.catalogs.iter().collect());
    }
    let mut selected: Vec<&Catalog> = Vec::new();
    for name in include {
        let catalog = config
            .catalog(name)
            .with_context(|| format!("unknown catalog {name:?}"))?;
        if !selected.iter().any(|c| c.name == catalog.name) {
            selected.push(catalog);
        }
    }
    Ok(selected)
}

/// A discovered working tree and its derived key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredRepo {
    pub key: RepoKey,
    pub path: PathBuf,
}

/// Enumerate working trees under one catalog root. A missing root yields an
/// empty list rather than an error; `doctor` reports it separately.
pub fn discover(catalog: &Catalog) -> Result<Vec<DiscoveredRepo>> {
    let mut found = Vec::new();
    walk(catalog, &catalog.root, 0, &mut found)?;
    found.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(found)
}

fn walk(
    catalog: &Catalog,
    dir: &Path,
    depth: usize,
    found: &mut Vec<DiscoveredRepo>,
) -> Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read dir {}", dir.display()));
        }
    };

    for entry in entries {
        let entry = entry.with_context(|| format!("failed to read dir {}", dir.display()))?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        if depth + 1 == catalog.effective_depth() {
            if has_git_marker(&path) {
                if let Ok(key) = derive_repo_key(catalog, &path) {
                    found.push(DiscoveredRepo { key, path });
                }
            }
        } else {
            walk(catalog, &path, depth + 1, found)?;
        }
    }
    Ok(())
}

/// Derive the canonical repo key for an absolute path inside a catalog.
/// Symlinks are resolved on both sides; a segment count different from the
/// catalog depth is an error (discovery ignores it).
pub fn derive_repo_key(catalog: &Catalog, path: &Path) -> Result<RepoKey> {
    let root = fs::canonicalize(&catalog.root)
        .with_context(|| format!("failed to resolve catalog root {}", catalog.root.display()))?;
    let path = fs::canonicalize(path)
        .with_context(|| format!("failed to resolve repo path {}", path.display()))?;

    let rel = path.strip_prefix(&root).with_context(|| {
        format!(
            "path {} is not inside catalog {} ({})",
            path.display(),
            catalog.name,
            root.display()
        )
    })?;

    let segments: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();
    if segments.len() != catalog.effective_depth() {
        bail!(
            "path {} has {} segments below catalog {}, expected {}",
            path.display(),
            segments.len(),
            catalog.name,
            catalog.effective_depth()
        );
    }
    RepoKey::new(catalog.name.clone(), segments)
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn mkrepo(path: &Path) {
        fs::create_dir_all(path.join(".git")).expect("mkdir .git");
    }

    #[test]
    fn select_all_by_default() {
        let mut config = Config::default();
        config.catalogs.push(Catalog::new("work", "/w"));
        config.catalogs.push(Catalog::new("play", "/p"));
        let selected = select_catalogs(&config, &[]).expect("select");
        let names: Vec<&str> = selected.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["work", "play"]);
    }

    #[test]
    fn include_list_keeps_first_appearance_order() {
        let mut config = Config::default();
        config.catalogs.push(Catalog::new("work", "/w"));
        config.catalogs.push(Catalog::new("play", "/p"));
        let include = vec!["play".to_string(), "work".to_string(), "play".to_string()];
        let selected = select_catalogs(&config, &include).expect("select");
        let names: Vec<&str> = selected.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["play", "work"]);
    }

    #[test]
    fn include_list_rejects_unknown_names() {
        let mut config = Config::default();
        config.catalogs.push(Catalog::new("work", "/w"));
        let include = vec!["nope".to_string()];
        let err = select_catalogs(&config, &include).expect_err("must fail");
        assert!(err.to_string().contains("unknown catalog"));
    }

    #[test]
    fn depth_one_discovery_finds_repos_at_exactly_one_level() {
        let td = tempdir().expect("tempdir");
        let root = td.path().join("work");
        mkrepo(&root.join("api"));
        mkrepo(&root.join("web"));
        // Nested one level too deep: ignored at depth 1.
        mkrepo(&root.join("group").join("deep"));
        // Plain directory without a marker: ignored.
        fs::create_dir_all(root.join("notes")).expect("mkdir");

        let catalog = Catalog::new("work", &root);
        let found = discover(&catalog).expect("discover");
        let keys: Vec<String> = found.iter().map(|d| d.key.to_string()).collect();
        assert_eq!(keys, vec!["work/api", "work/web"]);
    }

    #[test]
    fn depth_two_discovery_ignores_depth_one_trees() {
        let td = tempdir().expect("tempdir");
        let root = td.path().join("hub");
        mkrepo(&root.join("owner").join("repo"));
        mkrepo(&root.join("stray"));

        let mut catalog = Catalog::new("hub", &root);
        catalog.repo_path_depth = 2;
        let found = discover(&catalog).expect("discover");
        let keys: Vec<String> = found.iter().map(|d| d.key.to_string()).collect();
        assert_eq!(keys, vec!["hub/owner/repo"]);
    }

    #[test]
    fn git_file_marker_counts_as_work_tree() {
        let td = tempdir().expect("tempdir");
        let root = td.path().join("work");
        let linked = root.join("linked");
        fs::create_dir_all(&linked).expect("mkdir");
        fs::write(linked.join(".git"), "gitdir: /somewhere/else\n").expect("write");

        let catalog = Catalog::new("work", &root);
        let found = discover(&catalog).expect("discover");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].key.to_string(), "work/linked");
    }

    #[test]
    fn missing_root_discovers_nothing() {
        let catalog = Catalog::new("work", "/definitely/not/here");
        assert!(discover(&catalog).expect("discover").is_empty());
    }

    #[test]
    fn derive_repo_key_resolves_symlinked_root() {
        let td = tempdir().expect("tempdir");
        let real_root = td.path().join("real");
        mkrepo(&real_root.join("api"));

        #[cfg(unix)]
        {
            let link_root = td.path().join("link");
            std::os::unix::fs::symlink(&real_root, &link_root).expect("symlink");
            let catalog = Catalog::new("work", &link_root);
            let key = derive_repo_key(&catalog, &link_root.join("api")).expect("derive");
            assert_eq!(key.to_string(), "work/api");
        }
    }

    #[test]
    fn derive_repo_key_rejects_depth_mismatch() {
        let td = tempdir().expect("tempdir");
        let root = td.path().join("hub");
        mkrepo(&root.join("owner").join("repo"));

        let catalog = Catalog::new("hub", &root);
        let err = derive_repo_key(&catalog, &root.join("owner").join("repo"))
            .expect_err("depth 2 path under depth 1 catalog");
        assert!(err.to_string().contains("expected 1"));
    }

    #[test]
    fn derive_repo_key_rejects_outside_paths() {
        let td = tempdir().expect("tempdir");
        let root = td.path().join("work");
        mkrepo(&root.join("api"));
        let elsewhere = td.path().join("elsewhere");
        fs::create_dir_all(&elsewhere).expect("mkdir");

        let catalog = Catalog::new("work", &root);
        assert!(derive_repo_key(&catalog, &elsewhere).is_err());
    }
}
