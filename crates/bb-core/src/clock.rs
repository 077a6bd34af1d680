//! Engine wall clock.
//!
//! `BB_NOW` (RFC3339 UTC) overrides the system clock so state written during
//! tests and replayed runs is deterministic. Invalid values fall through to
//! the real clock.

use chrono::{DateTime, Utc};

pub const NOW_ENV: &str = "BB_NOW";

/// Current engine time, honoring the `BB_NOW` override.
pub fn now() -> DateTime<Utc> {
    now_from(std::env::var(NOW_ENV).ok().as_deref())
}

fn now_from(raw: Option<&str>) -> DateTime<Utc> {
    if let Some(raw) = raw {
        if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
            return parsed.with_timezone(&Utc);
        }
    }
    Utc::now()
}
