//! Deterministic state hashing.
//!
//! The state hash is `"sha256:" + hex(sha256(canonical_json))` over a fixed
//! field set, used to decide whether `observed_at` advances. The canonical
//! form is compact UTF-8 JSON with a fixed key order; the three `expected_*`
//! keys are omitted when empty.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::types::MachineRepoRecord;

/// Canonical hashed field set. Field declaration order is the wire order.
#[derive(Serialize)]
struct CanonicalState<'a> {
    #[serde(skip_serializing_if = "str::is_empty")]
    expected_repo_key: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    expected_catalog: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    expected_path: &'a str,
    branch: &'a str,
    head_sha: &'a str,
    upstream: &'a str,
    remote_head_sha: &'a str,
    ahead: u32,
    behind: u32,
    diverged: bool,
    has_dirty_tracked: bool,
    has_untracked: bool,
    operation_in_progress: &'a str,
    syncable: bool,
    unsyncable_reasons: Vec<&'a str>,
}

/// Hash a machine repo record over its canonical fields. The record's
/// key/catalog/path triple supplies the `expected_*` values.
pub fn record_state_hash(record: &MachineRepoRecord) -> String {
    let expected_path = record.path.to_string_lossy();
    let canonical = CanonicalState {
        expected_repo_key: &record.repo_key,
        expected_catalog: &record.catalog,
        expected_path: &expected_path,
        branch: &record.branch,
        head_sha: &record.head_sha,
        upstream: &record.upstream,
        remote_head_sha: &record.remote_head_sha,
        ahead: record.ahead,
        behind: record.behind,
        diverged: record.diverged,
        has_dirty_tracked: record.has_dirty_tracked,
        has_untracked: record.has_untracked,
        operation_in_progress: record.operation_in_progress.as_str(),
        syncable: record.syncable,
        unsyncable_reasons: record
            .unsyncable_reasons
            .iter()
            .map(|r| r.as_str())
            .collect(),
    };
    let json = serde_json::to_string(&canonical).expect("canonical state serializes");
    let digest = Sha256::digest(json.as_bytes());
    format!("sha256:{}", hex::encode(digest))
}

/// SHA-256 over arbitrary bytes with the same `sha256:` prefix convention.
pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
}
