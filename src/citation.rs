//! Citation Builder/Validator (C6).
//!
//! Locates the evidence a classified item was built from back in its owning
//! message's cleaned body, and validates the five provenance invariants any
//! citation must hold before it reaches the ranker or the assembled digest.

use sha2::{Digest as _, Sha256};
use tracing::warn;

use crate::config::CitationMode;
use crate::types::{Citation, EvidenceChunk, ExtractedItem, NormalizedMessage};

/// Citations are truncated previews, never more than this many chars.
const PREVIEW_MAX_CHARS: usize = 200;

/// Lowercase hex SHA-256 of `text`, used for [`NormalizedMessage::checksum`]
/// and as the checksum carried on every [`Citation`].
#[must_use]
pub fn sha256_hex(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

/// A violation of one of the five citation invariants (spec §3/§4.6/§8).
#[derive(Debug, Clone)]
pub struct CitationViolation {
    /// Which evidence chunk the violation was found for.
    pub evidence_id: String,
    /// A human-readable description of the violated invariant.
    pub reason: String,
}

/// Build a citation for `item`'s evidence chunk, locating its exact span in
/// `message.text_body` (falling back to whitespace-collapsed fuzzy matching).
///
/// Returns `None` if the chunk content cannot be located at all, even fuzzily.
#[must_use]
pub fn build_citation(item: &ExtractedItem, chunk: &EvidenceChunk, message: &NormalizedMessage) -> Option<Citation> {
    let body = message.text_body.as_str();

    let (start, end) = if body
        .get(chunk.start_in_body..chunk.end_in_body)
        .is_some_and(|slice| slice == chunk.content)
    {
        (chunk.start_in_body, chunk.end_in_body)
    } else if let Some(found) = body.find(item.text.as_str()) {
        (found, found.saturating_add(item.text.len()))
    } else if let Some((start, end)) = fuzzy_find(body, &item.text) {
        (start, end)
    } else {
        warn!(evidence_id = %chunk.evidence_id, "citation content not found, even fuzzily");
        return None;
    };

    let preview_end = end.min(start.saturating_add(PREVIEW_MAX_CHARS));
    let preview = body.get(start..preview_end).unwrap_or_default().to_owned();

    Some(Citation {
        msg_id: message.message.msg_id.clone(),
        start,
        end,
        preview,
        checksum: message.checksum.clone(),
    })
}

/// Whitespace-collapsed fuzzy substring search, used only when an exact
/// search fails (e.g. the LLM gateway normalized internal whitespace).
fn fuzzy_find(body: &str, needle: &str) -> Option<(usize, usize)> {
    let needle_collapsed: String = collapse_ws(needle);
    if needle_collapsed.is_empty() {
        return None;
    }

    let body_collapsed = collapse_ws(body);
    let byte_offset = body_collapsed.find(&needle_collapsed)?;

    // Map the collapsed-string offset back onto the original body by walking
    // it once; sufficient because collapse_ws never merges non-whitespace
    // runs, only whitespace ones.
    map_collapsed_offset(body, byte_offset, needle_collapsed.len())
}

fn collapse_ws(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_was_space = false;
    for ch in text.chars() {
        if ch.is_whitespace() {
            if !last_was_space {
                out.push(' ');
            }
            last_was_space = true;
        } else {
            out.push(ch);
            last_was_space = false;
        }
    }
    out
}

fn map_collapsed_offset(
    original: &str,
    collapsed_start: usize,
    collapsed_len: usize,
) -> Option<(usize, usize)> {
    let mut orig_start = None;
    let mut orig_end = None;
    let mut last_was_space = false;
    let mut collapsed_pos = 0usize;

    for (orig_idx, ch) in original.char_indices() {
        if ch.is_whitespace() {
            if !last_was_space {
                if collapsed_pos == collapsed_start {
                    orig_start.get_or_insert(orig_idx);
                }
                collapsed_pos = collapsed_pos.saturating_add(1);
            }
            last_was_space = true;
        } else {
            if collapsed_pos == collapsed_start {
                orig_start.get_or_insert(orig_idx);
            }
            collapsed_pos = collapsed_pos.saturating_add(ch.len_utf8());
            last_was_space = false;
            if collapsed_pos >= collapsed_start.saturating_add(collapsed_len) {
                orig_end = Some(orig_idx.saturating_add(ch.len_utf8()));
            }
        }
    }

    match (orig_start, orig_end) {
        (Some(s), Some(e)) if s <= e => Some((s, e)),
        _ => None,
    }
}

/// Validate every citation on `items` against `message`'s cleaned body.
///
/// In [`CitationMode::Strict`], the first violation aborts validation and is
/// returned as a single-element error vector. In [`CitationMode::Lax`],
/// violations accumulate and are all returned; callers typically log them
/// and drop the offending items rather than failing the run.
pub fn validate_citations(
    items: &[ExtractedItem],
    message: &NormalizedMessage,
    mode: CitationMode,
) -> Vec<CitationViolation> {
    let mut violations = Vec::new();
    let body = message.text_body.as_str();

    for item in items {
        for citation in &citation_subset_for(item, message) {
            if citation.msg_id != message.message.msg_id {
                continue;
            }

            if let Some(violation) = validate_one(citation, body, &item.evidence_id) {
                violations.push(violation);
                if mode == CitationMode::Strict {
                    return violations;
                }
            }
        }
    }

    violations
}

fn citation_subset_for<'a>(item: &'a ExtractedItem, message: &NormalizedMessage) -> Vec<&'a crate::types::Citation> {
    item.citations
        .iter()
        .filter(|c| c.msg_id == message.message.msg_id)
        .collect()
}

fn validate_one(citation: &Citation, body: &str, evidence_id: &str) -> Option<CitationViolation> {
    if citation.start >= citation.end || citation.end > body.len() {
        return Some(CitationViolation {
            evidence_id: evidence_id.to_owned(),
            reason: "span out of range".to_owned(),
        });
    }

    let Some(slice) = body.get(citation.start..citation.end) else {
        return Some(CitationViolation {
            evidence_id: evidence_id.to_owned(),
            reason: "span falls on non-char-boundary".to_owned(),
        });
    };

    let expected_preview_end = citation.end.min(citation.start.saturating_add(PREVIEW_MAX_CHARS));
    let expected_preview = body.get(citation.start..expected_preview_end).unwrap_or_default();
    if expected_preview != citation.preview {
        return Some(CitationViolation {
            evidence_id: evidence_id.to_owned(),
            reason: "preview mismatch".to_owned(),
        });
    }

    let actual_checksum = sha256_hex(body);
    if actual_checksum != citation.checksum {
        return Some(CitationViolation {
            evidence_id: evidence_id.to_owned(),
            reason: "checksum mismatch".to_owned(),
        });
    }

    if slice.is_empty() {
        return Some(CitationViolation {
            evidence_id: evidence_id.to_owned(),
            reason: "content not found".to_owned(),
        });
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Message;
    use chrono::Utc;

    fn message(text_body: &str) -> NormalizedMessage {
        let checksum = sha256_hex(text_body);
        NormalizedMessage {
            message: Message {
                msg_id: "m1".to_owned(),
                conversation_id: "c1".to_owned(),
                received_at: Utc::now(),
                sender: "a@corp.com".to_owned(),
                to: vec!["b@corp.com".to_owned()],
                cc: Vec::new(),
                subject: "subj".to_owned(),
                raw_body: String::new(),
                is_auto_submitted: false,
                changekey: "ck".to_owned(),
                has_attachments: false,
            },
            text_body: text_body.to_owned(),
            removed_spans: Vec::new(),
            checksum,
        }
    }

    #[test]
    fn checksum_matches_round_trips() {
        let msg = message("Please review the budget.");
        assert!(msg.checksum_matches());
    }

    #[test]
    fn validate_one_accepts_well_formed_citation() {
        let msg = message("Please review the budget.");
        let citation = Citation {
            msg_id: "m1".to_owned(),
            start: 0,
            end: 6,
            preview: "Please".to_owned(),
            checksum: msg.checksum.clone(),
        };
        assert!(validate_one(&citation, &msg.text_body, "e1").is_none());
    }

    #[test]
    fn validate_one_flags_checksum_mismatch() {
        let msg = message("Please review the budget.");
        let citation = Citation {
            msg_id: "m1".to_owned(),
            start: 0,
            end: 6,
            preview: "Please".to_owned(),
            checksum: "stale-checksum".to_owned(),
        };
        let violation = validate_one(&citation, &msg.text_body, "e1").unwrap();
        assert_eq!(violation.reason, "checksum mismatch");
    }

    #[test]
    fn validate_one_flags_out_of_range_span() {
        let msg = message("short");
        let citation = Citation {
            msg_id: "m1".to_owned(),
            start: 0,
            end: 100,
            preview: "short".to_owned(),
            checksum: msg.checksum.clone(),
        };
        let violation = validate_one(&citation, &msg.text_body, "e1").unwrap();
        assert_eq!(violation.reason, "span out of range");
    }

    #[test]
    fn fuzzy_find_locates_whitespace_normalized_text() {
        let body = "Please   review   the budget.";
        let found = fuzzy_find(body, "Please review the budget.");
        assert!(found.is_some());
    }
}
