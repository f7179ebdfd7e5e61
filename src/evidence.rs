//! Evidence Splitter (C4).
//!
//! Splits each normalized message into token-bounded chunks the extractor and
//! LLM gateway can consume independently, with deterministic ids stable
//! across reruns over identical input.

use sha2::{Digest as _, Sha256};

use crate::extractors;
use crate::types::{ChunkMetadata, EvidenceChunk, NormalizedMessage};

/// Paragraphs longer than this are re-split by sentence.
const MAX_TOKENS_PER_PARAGRAPH: usize = 512;

/// Hard cap on chunks kept per message.
const MAX_CHUNKS_PER_MESSAGE: usize = 12;

/// Rough chars-per-token ratio used for the token estimate; evidence chunking
/// only needs to be consistent with itself, not exact.
const CHARS_PER_TOKEN: usize = 4;

/// Split one normalized message's body into evidence chunks.
///
/// `user_aliases` is only used to break ties in the over-budget relevance
/// pre-ranker (see [`select_most_relevant`]); it plays no role below the cap.
#[must_use]
pub fn split_message(message: &NormalizedMessage, user_aliases: &[String]) -> Vec<EvidenceChunk> {
    let body = message.text_body.as_str();
    let mut spans = Vec::new();

    for paragraph in paragraph_spans(body) {
        let token_count = estimate_tokens(&body[paragraph.clone()]);
        if token_count <= MAX_TOKENS_PER_PARAGRAPH {
            spans.push(paragraph);
        } else {
            spans.extend(sentence_spans(body, paragraph));
        }
    }

    if spans.len() > MAX_CHUNKS_PER_MESSAGE {
        spans = select_most_relevant(body, spans, user_aliases);
    }

    let metadata = ChunkMetadata {
        to: message.message.to.clone(),
        cc: message.message.cc.clone(),
        sender: message.message.sender.clone(),
        subject: message.message.subject.clone(),
        has_attachments: message.message.has_attachments,
        received_at: message.message.received_at,
    };

    spans
        .into_iter()
        .enumerate()
        .map(|(chunk_index, span)| {
            let content = body[span.clone()].to_owned();
            let token_count = estimate_tokens(&content);
            let evidence_id = compute_evidence_id(&message.message.msg_id, chunk_index, &content);
            EvidenceChunk {
                evidence_id,
                msg_id: message.message.msg_id.clone(),
                chunk_index,
                content,
                start_in_body: span.start,
                end_in_body: span.end,
                token_count,
                metadata: metadata.clone(),
            }
        })
        .collect()
}

/// `evidence_id = first_8_bytes(SHA256(msg_id || ":" || chunk_index || ":" || content))`,
/// hex-encoded (spec §4.4) — stable across reruns for identical inputs.
fn compute_evidence_id(msg_id: &str, chunk_index: usize, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(msg_id.as_bytes());
    hasher.update(b":");
    hasher.update(chunk_index.to_string().as_bytes());
    hasher.update(b":");
    hasher.update(content.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}

fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN).max(1)
}

/// Byte spans of each non-blank paragraph in `body`, in order.
fn paragraph_spans(body: &str) -> Vec<std::ops::Range<usize>> {
    let mut spans = Vec::new();
    let mut pos = 0usize;
    for block in body.split("\n\n") {
        let start = pos;
        let end = start.saturating_add(block.len());
        if !block.trim().is_empty() {
            spans.push(start..end);
        }
        pos = end.saturating_add(2);
    }
    spans
}

/// Re-split an oversized paragraph span into sentence-level spans within `body`.
fn sentence_spans(body: &str, paragraph: std::ops::Range<usize>) -> Vec<std::ops::Range<usize>> {
    let text = &body[paragraph.clone()];
    let mut spans = Vec::new();
    let mut sentence_start = 0usize;

    for (idx, ch) in text.char_indices() {
        if matches!(ch, '.' | '!' | '?') {
            let end = idx.saturating_add(ch.len_utf8());
            let slice = &text[sentence_start..end];
            if !slice.trim().is_empty() {
                spans.push(
                    paragraph.start.saturating_add(sentence_start)
                        ..paragraph.start.saturating_add(end),
                );
            }
            sentence_start = end;
        }
    }
    if sentence_start < text.len() {
        let slice = &text[sentence_start..];
        if !slice.trim().is_empty() {
            spans.push(
                paragraph.start.saturating_add(sentence_start)..paragraph.end,
            );
        }
    }

    if spans.is_empty() {
        vec![paragraph]
    } else {
        spans
    }
}

/// Keep the [`MAX_CHUNKS_PER_MESSAGE`] highest-scoring spans of `spans`
/// (spec §4.4: "applies a relevance pre-ranker ... and keeps top-k"),
/// restoring document order afterward so chunk indices still read top to
/// bottom.
fn select_most_relevant(
    body: &str,
    spans: Vec<std::ops::Range<usize>>,
    user_aliases: &[String],
) -> Vec<std::ops::Range<usize>> {
    let mut scored: Vec<(usize, f64, std::ops::Range<usize>)> = spans
        .into_iter()
        .enumerate()
        .map(|(original_index, span)| {
            let score = extractors::relevance_score(&body[span.clone()], user_aliases);
            (original_index, score, span)
        })
        .collect();

    scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    scored.truncate(MAX_CHUNKS_PER_MESSAGE);
    scored.sort_by_key(|(original_index, _, _)| *original_index);

    scored.into_iter().map(|(_, _, span)| span).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Message;
    use chrono::Utc;

    fn normalized(text_body: &str) -> NormalizedMessage {
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
            checksum: "deadbeef".to_owned(),
        }
    }

    #[test]
    fn chunk_offsets_round_trip_into_text_body() {
        let msg = normalized("First paragraph.\n\nSecond paragraph here.");
        let chunks = split_message(&msg, &[]);
        for chunk in &chunks {
            assert_eq!(
                &msg.text_body[chunk.start_in_body..chunk.end_in_body],
                chunk.content
            );
        }
    }

    #[test]
    fn evidence_id_is_stable_across_calls() {
        let msg = normalized("Please review the attached budget.");
        let first = split_message(&msg, &[]);
        let second = split_message(&msg, &[]);
        assert_eq!(first[0].evidence_id, second[0].evidence_id);
    }

    #[test]
    fn caps_chunks_per_message() {
        let body = (0..20)
            .map(|i| format!("Paragraph number {i}."))
            .collect::<Vec<_>>()
            .join("\n\n");
        let msg = normalized(&body);
        let chunks = split_message(&msg, &[]);
        assert!(chunks.len() <= MAX_CHUNKS_PER_MESSAGE);
    }

    #[test]
    fn splits_oversized_paragraph_by_sentence() {
        let long_sentence_block = "One. Two. Three. Four. Five.".repeat(80);
        let msg = normalized(&long_sentence_block);
        let chunks = split_message(&msg, &[]);
        assert!(chunks.len() > 1);
    }

    #[test]
    fn over_budget_trim_keeps_highest_relevance_paragraphs() {
        let mut paragraphs: Vec<String> = (0..20).map(|i| format!("Just an update, paragraph {i}.")).collect();
        paragraphs.push("Ivan, please approve the budget by Friday.".to_owned());
        let body = paragraphs.join("\n\n");
        let msg = normalized(&body);

        let chunks = split_message(&msg, &["Ivan".to_owned()]);
        assert!(chunks.len() <= MAX_CHUNKS_PER_MESSAGE);
        assert!(
            chunks.iter().any(|c| c.content.contains("approve the budget")),
            "high-signal paragraph should survive the relevance trim over plain filler"
        );
    }
}
