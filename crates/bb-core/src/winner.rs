//! Winner selection: pick the authoritative snapshot for one repo key
//! across all machines.
//!
//! Pure and total: non-syncable records are discarded, the greatest
//! `observed_at` wins, and ties break on the lexicographically smallest
//! machine id. No winner exists when every record is non-syncable.

use chrono::{DateTime, Utc};

use crate::types::MachineRepoRecord;

/// One machine's record for a repo key, as read from its machine file.
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub machine_id: &'a str,
    pub record: &'a MachineRepoRecord,
}

fn observed_at(candidate: &Candidate<'_>) -> DateTime<Utc> {
    candidate
        .record
        .observed_at
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Select the winner among the given candidates, if any is syncable.
pub fn select_winner<'a>(candidates: &[Candidate<'a>]) -> Option<Candidate<'a>> {
    candidates
        .iter()
        .filter(|c| c.record.syncable)
        .copied()
        .min_by(|a, b| {
            observed_at(b)
                .cmp(&observed_at(a))
                .then_with(|| a.machine_id.cmp(b.machine_id))
        })
}
