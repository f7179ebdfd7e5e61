//! Digest Assembler (C10).
//!
//! Pure rendering: takes the ranked, cited [`Digest`] C8 produced and turns
//! it into the two artifacts a run writes — the canonical JSON document and
//! a short markdown summary — then writes both atomically via the
//! temp-file-then-rename idiom used for every other durable artifact in this
//! system.

use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::Result;
use crate::types::{Digest, ItemKind};

/// Markdown renderings longer than this are truncated (spec §4.10 "≤400 words").
const MARKDOWN_WORD_LIMIT: usize = 400;

/// Serialize `digest` to canonical JSON: sorted keys, UTF-8, no trailing
/// whitespace, so byte-identical reruns over identical input produce
/// byte-identical files (spec §5 determinism invariant).
///
/// # Errors
///
/// Returns [`crate::error::Error::Json`] if serialization fails.
pub fn render_json(digest: &Digest) -> Result<String> {
    let value = serde_json::to_value(digest)?;
    let canonical = canonicalize(&value);
    Ok(serde_json::to_string_pretty(&canonical)?)
}

/// Sort every object's keys recursively so the rendered JSON is independent
/// of `serde`'s field declaration order.
fn canonicalize(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut sorted = serde_json::Map::new();
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            serde_json::Value::Object(sorted)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(canonicalize).collect())
        }
        other => other.clone(),
    }
}

/// Render a human-readable markdown digest, grouped by item kind, annotated
/// with each item's `evidence_id`, capped at [`MARKDOWN_WORD_LIMIT`] words.
#[must_use]
pub fn render_markdown(digest: &Digest) -> String {
    let mut out = String::with_capacity(2048);
    out.push_str(&format!("# Digest for {}\n\n", digest.digest_date));

    if digest.items.is_empty() {
        out.push_str("No actionable items today.\n");
        return cap_words(&out, MARKDOWN_WORD_LIMIT);
    }

    for kind in [
        ItemKind::Action,
        ItemKind::Question,
        ItemKind::Deadline,
        ItemKind::Risk,
        ItemKind::Mention,
        ItemKind::Fyi,
    ] {
        let items: Vec<_> = digest.items.iter().filter(|item| item.kind == kind).collect();
        if items.is_empty() {
            continue;
        }

        out.push_str(&format!("## {kind}\n\n"));
        for item in items {
            let due_suffix = item
                .due
                .map(|d| format!(" (due {d})"))
                .unwrap_or_default();
            out.push_str(&format!(
                "- {}{} [{}]\n",
                item.text.trim(),
                due_suffix,
                item.evidence_id
            ));
        }
        out.push('\n');
    }

    cap_words(&out, MARKDOWN_WORD_LIMIT)
}

fn cap_words(text: &str, limit: usize) -> String {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.len() <= limit {
        return text.to_owned();
    }
    let mut truncated = words[..limit].join(" ");
    truncated.push_str(" …[truncated]");
    truncated
}

/// Paths of the two artifacts [`write_artifacts`] writes for one digest.
pub struct ArtifactPaths {
    /// Path of the written JSON document.
    pub json_path: PathBuf,
    /// Path of the written markdown summary.
    pub markdown_path: PathBuf,
}

/// Render and atomically write both digest artifacts under `output_dir`,
/// named `digest-<user_id>-<digest_date>.{json,md}`.
///
/// # Errors
///
/// Returns [`crate::error::Error::Io`] if a temp file cannot be written or
/// renamed into place, or [`crate::error::Error::Json`] on a serialization
/// failure.
pub fn write_artifacts(digest: &Digest, output_dir: &Path, user_id: &str) -> Result<ArtifactPaths> {
    std::fs::create_dir_all(output_dir)?;

    let json_path = output_dir.join(format!("digest-{user_id}-{}.json", digest.digest_date));
    let markdown_path = output_dir.join(format!("digest-{user_id}-{}.md", digest.digest_date));

    write_atomic(&json_path, &render_json(digest)?)?;
    write_atomic(&markdown_path, &render_markdown(digest))?;

    info!(
        json_path = %json_path.display(),
        markdown_path = %markdown_path.display(),
        item_count = digest.items.len(),
        "digest artifacts written"
    );

    Ok(ArtifactPaths { json_path, markdown_path })
}

fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let tmp_path = path.with_extension(format!(
        "{}.tmp",
        path.extension().and_then(|e| e.to_str()).unwrap_or("tmp")
    ));
    std::fs::write(&tmp_path, content)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Citation, ExtractedItem, SchemaVersion};
    use chrono::NaiveDate;

    fn sample_digest() -> Digest {
        Digest {
            schema_version: SchemaVersion::V2,
            digest_date: NaiveDate::from_ymd_opt(2026, 8, 1).unwrap(),
            trace_id: "t1".to_owned(),
            items: vec![ExtractedItem {
                kind: ItemKind::Action,
                text: "Review the budget".to_owned(),
                verb: Some("review".to_owned()),
                who: None,
                due: NaiveDate::from_ymd_opt(2026, 8, 3),
                confidence: 0.8,
                evidence_id: "e1".to_owned(),
                citations: vec![Citation {
                    msg_id: "m1".to_owned(),
                    start: 0,
                    end: 18,
                    preview: "Review the budget".to_owned(),
                    checksum: "deadbeef".to_owned(),
                }],
                rank_score: Some(0.9),
            }],
        }
    }

    #[test]
    fn json_rendering_is_deterministic_across_calls() {
        let digest = sample_digest();
        assert_eq!(render_json(&digest).unwrap(), render_json(&digest).unwrap());
    }

    #[test]
    fn markdown_includes_evidence_id_annotation() {
        let markdown = render_markdown(&sample_digest());
        assert!(markdown.contains("[e1]"));
    }

    #[test]
    fn markdown_reports_no_items_when_empty() {
        let mut digest = sample_digest();
        digest.items.clear();
        let markdown = render_markdown(&digest);
        assert!(markdown.contains("No actionable items today"));
    }

    #[test]
    fn write_artifacts_round_trips_json() {
        let dir = tempfile::tempdir().unwrap();
        let digest = sample_digest();
        let paths = write_artifacts(&digest, dir.path(), "alice").unwrap();
        let content = std::fs::read_to_string(&paths.json_path).unwrap();
        assert!(content.contains("\"trace_id\""));
    }
}
