//! Run state machine and the `(user_id, digest_date)` idempotency record
//! (spec §4.9).

use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use tracing::info;

use crate::error::Result;
use crate::types::{RunKey, RunRecord, RunState};

/// A completed run is not rebuilt unless it is older than this window,
/// matching the T-48h rebuild window named in spec §4.9.
pub const REBUILD_WINDOW_HOURS: i64 = 48;

fn record_path(state_dir: &Path, run_key: &RunKey) -> PathBuf {
    state_dir.join(format!("{}-{}.done.json", run_key.user_id, run_key.digest_date))
}

/// Load the persisted completion record for `run_key`, if any.
#[must_use]
pub fn load_record(state_dir: &Path, run_key: &RunKey) -> Option<RunRecord> {
    let raw = std::fs::read_to_string(record_path(state_dir, run_key)).ok()?;
    serde_json::from_str(&raw).ok()
}

/// Persist `record` atomically.
///
/// # Errors
///
/// Returns [`crate::error::Error::Io`] if the temp file cannot be written or
/// renamed into place.
pub fn store_record(state_dir: &Path, record: &RunRecord) -> Result<()> {
    std::fs::create_dir_all(state_dir)?;
    let path = record_path(state_dir, &record.run_key);
    let tmp_path = path.with_extension("json.tmp");
    let serialized = serde_json::to_string_pretty(record)?;
    std::fs::write(&tmp_path, serialized)?;
    std::fs::rename(&tmp_path, &path)?;
    Ok(())
}

/// Whether a run already completed for `run_key` within the rebuild window
/// as of `now`, and so should be skipped unless `force` is set.
#[must_use]
pub fn should_skip(state_dir: &Path, run_key: &RunKey, now: DateTime<Utc>, force: bool) -> bool {
    if force {
        return false;
    }
    let Some(record) = load_record(state_dir, run_key) else {
        return false;
    };
    let age = now.signed_duration_since(record.finished_at);
    let fresh = age < Duration::hours(REBUILD_WINDOW_HOURS);
    if fresh {
        info!(run_key = %run_key, age_hours = age.num_hours(), "existing run within rebuild window, skipping");
    }
    fresh
}

/// A single transition in the state machine, used for both the in-memory
/// controller and structured log lines (spec §4.9 state machine).
pub fn transition(current: &RunState, next: RunState) -> RunState {
    info!(from = ?current, to = ?next, "run state transition");
    next
}

/// Build the terminal `Failed` state for a stage that errored.
#[must_use]
pub fn failed(stage: &str, error: &dyn std::fmt::Display) -> RunState {
    RunState::Failed {
        stage: stage.to_owned(),
        error: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn run_key() -> RunKey {
        RunKey {
            user_id: "alice".to_owned(),
            digest_date: NaiveDate::from_ymd_opt(2026, 8, 1).unwrap(),
        }
    }

    #[test]
    fn skips_when_record_is_within_rebuild_window() {
        let dir = tempfile::tempdir().unwrap();
        let record = RunRecord {
            run_key: run_key(),
            finished_at: Utc::now(),
            artifact_paths: vec!["digest-2026-08-01.json".to_owned()],
            trace_id: "t1".to_owned(),
        };
        store_record(dir.path(), &record).unwrap();
        assert!(should_skip(dir.path(), &run_key(), Utc::now(), false));
    }

    #[test]
    fn force_always_rebuilds() {
        let dir = tempfile::tempdir().unwrap();
        let record = RunRecord {
            run_key: run_key(),
            finished_at: Utc::now(),
            artifact_paths: Vec::new(),
            trace_id: "t1".to_owned(),
        };
        store_record(dir.path(), &record).unwrap();
        assert!(!should_skip(dir.path(), &run_key(), Utc::now(), true));
    }

    #[test]
    fn stale_record_does_not_skip() {
        let dir = tempfile::tempdir().unwrap();
        let record = RunRecord {
            run_key: run_key(),
            finished_at: Utc::now() - Duration::hours(REBUILD_WINDOW_HOURS.saturating_add(1)),
            artifact_paths: Vec::new(),
            trace_id: "t1".to_owned(),
        };
        store_record(dir.path(), &record).unwrap();
        assert!(!should_skip(dir.path(), &run_key(), Utc::now(), false));
    }
}
