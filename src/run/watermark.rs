//! Durable incremental-sync watermark (spec §4.9/§6.2).
//!
//! Owned exclusively by the run controller: loaded before `FETCHING`,
//! advanced only after a run reaches `DONE`. Written atomically via the
//! same temp-file-then-rename idiom used for digest artifacts, so a crash
//! mid-write never leaves a corrupt watermark for the next run to trip on.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::warn;

use crate::error::Result;
use crate::types::Watermark;

fn watermark_path(state_dir: &Path, user_id: &str) -> PathBuf {
    state_dir.join(format!("{user_id}.watermark.json"))
}

/// Load the watermark for `user_id`, or `None` if absent or corrupt.
///
/// A corrupt watermark is logged and treated as absent rather than
/// propagated as an error — the caller falls back to a full sweep
/// (spec §4.9 "watermark corruption ⇒ full sweep").
pub fn load(state_dir: &Path, user_id: &str) -> Option<Watermark> {
    let path = watermark_path(state_dir, user_id);
    let raw = std::fs::read_to_string(&path).ok()?;
    match serde_json::from_str(&raw) {
        Ok(watermark) => Some(watermark),
        Err(err) => {
            warn!(user_id, error = %err, "watermark file is corrupt, falling back to full sweep");
            None
        }
    }
}

/// Persist `watermark` for `user_id` atomically.
///
/// # Errors
///
/// Returns [`crate::error::Error::Io`] if the temp file cannot be written
/// or renamed into place.
pub fn store(state_dir: &Path, user_id: &str, watermark: &Watermark) -> Result<()> {
    std::fs::create_dir_all(state_dir)?;
    let path = watermark_path(state_dir, user_id);
    let tmp_path = path.with_extension("json.tmp");
    let serialized = serde_json::to_string_pretty(watermark)?;
    std::fs::write(&tmp_path, serialized)?;
    std::fs::rename(&tmp_path, &path)?;
    Ok(())
}

/// A fresh watermark for a user who has never completed a run, anchored at
/// the current time so the first run's "since last watermark" fetch has a
/// well-defined starting point.
#[must_use]
pub fn initial() -> Watermark {
    Watermark {
        token: None,
        last_full_sweep: Utc::now(),
    }
}
