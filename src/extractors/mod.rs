//! Action Extractor (C5).
//!
//! Classifies each sentence-level candidate within an [`EvidenceChunk`] into
//! one of the six [`ItemKind`] tags, scored by a logistic confidence function
//! over a small hand-picked feature vector (spec §4.5/§4.5.1).

mod patterns;

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc, Weekday};
use chrono_tz::Tz;
use regex::Regex;
use tracing::warn;

use crate::types::{Citation, EvidenceChunk, ExtractedItem, ItemKind};

/// Feature weights `(has_user_mention, has_imperative, has_action_marker,
/// is_question, has_deadline, sender_rank)` (spec §4.5 defaults).
const WEIGHTS: [f64; 6] = [1.5, 1.2, 1.0, 0.8, 0.6, 0.5];

/// Logistic bias term (spec §4.5 default).
const BIAS: f64 = 1.5;

/// Minimum confidence an otherwise-unclassified candidate needs to surface
/// as `fyi` rather than being dropped as noise (spec §4.5.1).
const FYI_MIN_CONFIDENCE: f64 = 0.3;

/// Process-wide counter of skipped malformed user-supplied patterns (spec §4.5).
pub static EXTRACTOR_ERRORS: AtomicU64 = AtomicU64::new(0);

/// Compile a user-supplied blacklist/whitelist pattern, incrementing
/// [`EXTRACTOR_ERRORS`] and returning `None` on failure rather than aborting
/// the run (spec §4.5 error semantics).
pub fn compile_user_pattern(pattern: &str) -> Option<Regex> {
    match Regex::new(pattern) {
        Ok(re) => Some(re),
        Err(e) => {
            EXTRACTOR_ERRORS.fetch_add(1, Ordering::Relaxed);
            warn!(pattern = %pattern, error = %e, "skipping malformed extractor pattern");
            None
        }
    }
}

/// One sentence-level candidate, with its byte span relative to the chunk's
/// own coordinate system (which is itself relative to `text_body`).
struct Candidate<'a> {
    text: &'a str,
    start_in_chunk: usize,
    end_in_chunk: usize,
}

/// Extract zero or more items from one evidence chunk.
///
/// `user_aliases` identifies the mailbox owner in-text (name, handle, or
/// email local-part); `important_senders` matches [`crate::config::RankerConfig::important_senders`]'s
/// semantics (exact or prefix) and feeds the `sender_rank` feature;
/// `user_timezone` resolves relative due-date cues against the chunk's
/// `received_at`.
#[must_use]
pub fn extract_from_chunk(
    chunk: &EvidenceChunk,
    user_aliases: &[String],
    important_senders: &[String],
    user_timezone: &str,
) -> Vec<ExtractedItem> {
    let sender_rank = if is_important_sender(&chunk.metadata.sender, important_senders) {
        1.0
    } else {
        0.0
    };

    sentence_candidates(&chunk.content)
        .into_iter()
        .filter_map(|candidate| classify_candidate(candidate, chunk, user_aliases, sender_rank, user_timezone))
        .collect()
}

/// Cheap relevance score for C4's over-budget chunk trimming: the same
/// user-mention/imperative/action-marker/question/deadline cues
/// [`classify_candidate`] weighs, minus sender importance (chunk metadata
/// isn't available yet at evidence-splitting time). Used to keep the
/// highest-signal spans rather than an arbitrary document-order prefix.
#[must_use]
pub fn relevance_score(text: &str, user_aliases: &[String]) -> f64 {
    let has_user_mention = mentions_user(text, user_aliases);
    let has_imperative = first_match(text, &patterns::imperative_patterns()).is_some();
    let has_action_marker = first_match(text, &patterns::action_marker_patterns()).is_some();
    let is_question =
        text.trim_end().ends_with('?') || first_match(text, &patterns::question_patterns()).is_some();
    let has_deadline = first_match(text, &patterns::deadline_patterns()).is_some();

    let features = [
        f64::from(has_user_mention),
        f64::from(has_imperative),
        f64::from(has_action_marker),
        f64::from(is_question),
        f64::from(has_deadline),
    ];
    features.iter().zip(WEIGHTS.iter()).map(|(f, w)| f * w).sum()
}

fn is_important_sender(sender: &str, important_senders: &[String]) -> bool {
    let sender_lower = sender.to_ascii_lowercase();
    important_senders.iter().any(|pattern| {
        let pattern_lower = pattern.to_ascii_lowercase();
        sender_lower == pattern_lower || sender_lower.starts_with(&pattern_lower)
    })
}

fn classify_candidate(
    candidate: Candidate<'_>,
    chunk: &EvidenceChunk,
    user_aliases: &[String],
    sender_rank: f64,
    user_timezone: &str,
) -> Option<ExtractedItem> {
    let text = candidate.text.trim();
    if text.is_empty() {
        return None;
    }

    let has_user_mention = mentions_user(text, user_aliases);
    let imperative_match = first_match(text, &patterns::imperative_patterns());
    let action_marker_match = first_match(text, &patterns::action_marker_patterns());
    let is_question = text.trim_end().ends_with('?') || first_match(text, &patterns::question_patterns()).is_some();
    let deadline_match = first_match(text, &patterns::deadline_patterns());
    let risk_match = first_match(text, &patterns::risk_patterns());

    let features = [
        f64::from(has_user_mention),
        f64::from(imperative_match.is_some()),
        f64::from(action_marker_match.is_some()),
        f64::from(is_question),
        f64::from(deadline_match.is_some()),
        sender_rank,
    ];
    let confidence = sigmoid(weighted_sum(&features) - BIAS);

    let due = deadline_match
        .as_ref()
        .and_then(|m| resolve_due(m, chunk.metadata.received_at, user_timezone));

    let (kind, due) = if is_question {
        (ItemKind::Question, None)
    } else if imperative_match.is_some() || action_marker_match.is_some() {
        (ItemKind::Action, due)
    } else if has_user_mention {
        (ItemKind::Mention, None)
    } else if deadline_match.is_some() {
        (ItemKind::Deadline, due)
    } else if risk_match.is_some() {
        (ItemKind::Risk, None)
    } else if confidence >= FYI_MIN_CONFIDENCE {
        (ItemKind::Fyi, None)
    } else {
        return None;
    };

    let verb = imperative_match.map(canonicalize_verb);
    let who = has_user_mention.then(|| matched_alias(text, user_aliases)).flatten();

    let citation = Citation {
        msg_id: chunk.msg_id.clone(),
        start: chunk.start_in_body.saturating_add(candidate.start_in_chunk),
        end: chunk.start_in_body.saturating_add(candidate.end_in_chunk),
        preview: text.chars().take(200).collect(),
        checksum: String::new(),
    };

    Some(ExtractedItem {
        kind,
        text: text.to_owned(),
        verb,
        who,
        due,
        confidence,
        evidence_id: chunk.evidence_id.clone(),
        citations: vec![citation],
        rank_score: None,
    })
}

/// Surface imperative forms matched by [`patterns::imperative_patterns`]
/// that aren't already their own base/infinitive form. English matches
/// ("review", "approve", "submit", ...) are already canonical; only the
/// Russian conjugated imperatives need mapping.
const IMPERATIVE_CANONICAL_FORMS: &[(&str, &str)] = &[
    ("сделайте", "сделать"),
    ("сделай", "сделать"),
    ("проверьте", "проверить"),
    ("проверь", "проверить"),
    ("подготовьте", "подготовить"),
    ("подготовь", "подготовить"),
    ("согласуйте", "согласовать"),
    ("согласуй", "согласовать"),
    ("утвердите", "утвердить"),
    ("утверди", "утвердить"),
];

/// Canonicalize a matched imperative surface form to its base/infinitive
/// form (spec §8 S1: "согласуйте" → "согласовать").
fn canonicalize_verb(raw: &str) -> String {
    let lower = raw.to_ascii_lowercase();
    IMPERATIVE_CANONICAL_FORMS
        .iter()
        .find(|(surface, _)| *surface == lower)
        .map(|(_, base)| (*base).to_owned())
        .unwrap_or(lower)
}

fn weighted_sum(features: &[f64; 6]) -> f64 {
    features
        .iter()
        .zip(WEIGHTS.iter())
        .map(|(f, w)| f * w)
        .sum()
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

fn first_match<'a>(text: &'a str, patterns: &[Regex]) -> Option<&'a str> {
    patterns
        .iter()
        .find_map(|re| re.find(text))
        .map(|m| m.as_str())
}

fn mentions_user(text: &str, user_aliases: &[String]) -> bool {
    let lower = text.to_ascii_lowercase();
    user_aliases
        .iter()
        .any(|alias| !alias.is_empty() && lower.contains(&alias.to_ascii_lowercase()))
}

fn matched_alias(text: &str, user_aliases: &[String]) -> Option<String> {
    let lower = text.to_ascii_lowercase();
    user_aliases
        .iter()
        .find(|alias| !alias.is_empty() && lower.contains(&alias.to_ascii_lowercase()))
        .cloned()
}

/// Split `content` into sentence-level candidates, keeping byte spans
/// relative to `content` itself.
fn sentence_candidates(content: &str) -> Vec<Candidate<'_>> {
    let mut candidates = Vec::new();
    let mut start = 0usize;

    for (idx, ch) in content.char_indices() {
        if matches!(ch, '.' | '!' | '?') {
            let end = idx.saturating_add(ch.len_utf8());
            if !content[start..end].trim().is_empty() {
                candidates.push(Candidate {
                    text: &content[start..end],
                    start_in_chunk: start,
                    end_in_chunk: end,
                });
            }
            start = end;
        }
    }
    if start < content.len() && !content[start..].trim().is_empty() {
        candidates.push(Candidate {
            text: &content[start..],
            start_in_chunk: start,
            end_in_chunk: content.len(),
        });
    }

    candidates
}

/// Resolve a due date from a matched deadline-cue span, relative to
/// `received_at` in `user_timezone` (spec §4.5.1 ADDED).
fn resolve_due(cue: &str, received_at: DateTime<Utc>, user_timezone: &str) -> Option<NaiveDate> {
    let tz: Tz = user_timezone.parse().unwrap_or(chrono_tz::UTC);
    let local_now = received_at.with_timezone(&tz).date_naive();
    let lower = cue.to_ascii_lowercase();

    if lower.contains("сегодня") || lower.contains("today") {
        return Some(local_now);
    }
    if lower.contains("завтра") && !lower.contains("послезавтра") || lower.contains("tomorrow") {
        return Some(local_now.succ_opt().unwrap_or(local_now));
    }
    if lower.contains("послезавтра") {
        return local_now.succ_opt().and_then(|d| d.succ_opt());
    }

    if let Some(weekday) = weekday_from_cue(&lower) {
        return Some(next_occurrence_of(local_now, weekday));
    }

    if let Some((day, month)) = parse_day_month(&lower) {
        return nearest_future_day_month(local_now, day, month);
    }

    None
}

/// Parse the first `D[./]M` or `DD[./]MM` token in `text`, without pulling in
/// a one-off regex for a pattern this simple.
fn parse_day_month(text: &str) -> Option<(u32, u32)> {
    for token in text.split_whitespace() {
        let trimmed = token.trim_matches(|c: char| !c.is_ascii_digit() && c != '.' && c != '/');
        let Some(sep) = trimmed.find(['.', '/']) else {
            continue;
        };
        let (day_part, rest) = trimmed.split_at(sep);
        let Some(month_part) = rest.get(1..) else {
            continue;
        };
        if let (Ok(day), Ok(month)) = (day_part.parse::<u32>(), month_part.parse::<u32>()) {
            if (1..=31).contains(&day) && (1..=12).contains(&month) {
                return Some((day, month));
            }
        }
    }
    None
}

fn weekday_from_cue(lower: &str) -> Option<Weekday> {
    const PAIRS: &[(&str, Weekday)] = &[
        ("monday", Weekday::Mon),
        ("понедельник", Weekday::Mon),
        ("tuesday", Weekday::Tue),
        ("вторник", Weekday::Tue),
        ("wednesday", Weekday::Wed),
        ("сред", Weekday::Wed),
        ("thursday", Weekday::Thu),
        ("четверг", Weekday::Thu),
        ("friday", Weekday::Fri),
        ("пятниц", Weekday::Fri),
        ("saturday", Weekday::Sat),
        ("суббот", Weekday::Sat),
        ("sunday", Weekday::Sun),
        ("воскресень", Weekday::Sun),
    ];
    PAIRS
        .iter()
        .find(|(marker, _)| lower.contains(marker))
        .map(|(_, weekday)| *weekday)
}

fn next_occurrence_of(from: NaiveDate, weekday: Weekday) -> NaiveDate {
    let mut candidate = from;
    loop {
        candidate = candidate.succ_opt().unwrap_or(candidate);
        if candidate.weekday() == weekday {
            return candidate;
        }
        if candidate > from + Duration::days(8) {
            return candidate;
        }
    }
}

fn nearest_future_day_month(from: NaiveDate, day: u32, month: u32) -> Option<NaiveDate> {
    let this_year = NaiveDate::from_ymd_opt(from.year(), month, day)?;
    if this_year >= from {
        Some(this_year)
    } else {
        NaiveDate::from_ymd_opt(from.year().saturating_add(1), month, day)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChunkMetadata;
    use chrono::TimeZone;

    fn chunk(content: &str, sender: &str) -> EvidenceChunk {
        EvidenceChunk {
            evidence_id: "e1".to_owned(),
            msg_id: "m1".to_owned(),
            chunk_index: 0,
            content: content.to_owned(),
            start_in_body: 0,
            end_in_body: content.len(),
            token_count: content.len() / 4,
            metadata: ChunkMetadata {
                to: vec!["ivan@corp".to_owned()],
                cc: Vec::new(),
                sender: sender.to_owned(),
                subject: "Budget Q3".to_owned(),
                has_attachments: false,
                received_at: Utc.with_ymd_and_hms(2026, 7, 27, 9, 0, 0).unwrap(),
            },
        }
    }

    #[test]
    fn imperative_with_deadline_is_tagged_action_with_due() {
        let chunk = chunk("Иван, пожалуйста согласуйте бюджет Q3 до пятницы.", "boss@corp");
        let aliases = vec!["Иван".to_owned()];
        let items = extract_from_chunk(&chunk, &aliases, &[], "UTC");
        let action = items.iter().find(|i| i.kind == ItemKind::Action).expect("expected an action item");
        assert!(action.due.is_some());
        assert!(action.confidence >= 0.5);
        assert_eq!(action.verb.as_deref(), Some("согласовать"));
    }

    #[test]
    fn english_imperative_verb_is_already_canonical() {
        let chunk = chunk("Review the attached budget, please.", "boss@corp");
        let items = extract_from_chunk(&chunk, &[], &[], "UTC");
        let action = items.iter().find(|i| i.kind == ItemKind::Action).expect("expected an action item");
        assert_eq!(action.verb.as_deref(), Some("review"));
    }

    #[test]
    fn bare_date_without_imperative_is_deadline() {
        let chunk = chunk("The meeting is Friday.", "alice@corp");
        let items = extract_from_chunk(&chunk, &[], &[], "UTC");
        assert!(items.iter().any(|i| i.kind == ItemKind::Deadline));
    }

    #[test]
    fn question_cue_outranks_imperative() {
        let chunk = chunk("Could you tell me when this is due?", "alice@corp");
        let items = extract_from_chunk(&chunk, &[], &[], "UTC");
        assert!(items.iter().any(|i| i.kind == ItemKind::Question));
    }

    #[test]
    fn risk_marker_without_other_cues_is_risk() {
        let chunk = chunk("The deployment is broken.", "alice@corp");
        let items = extract_from_chunk(&chunk, &[], &[], "UTC");
        assert!(items.iter().any(|i| i.kind == ItemKind::Risk));
    }

    #[test]
    fn malformed_user_pattern_increments_counter_and_is_skipped() {
        let before = EXTRACTOR_ERRORS.load(Ordering::Relaxed);
        assert!(compile_user_pattern("[unterminated").is_none());
        assert!(EXTRACTOR_ERRORS.load(Ordering::Relaxed) > before);
    }

    #[test]
    fn numeric_date_resolves_to_nearest_future_occurrence() {
        let received = Utc.with_ymd_and_hms(2026, 1, 1, 9, 0, 0).unwrap();
        let due = resolve_due("до 15.08", received, "UTC").unwrap();
        assert_eq!(due, NaiveDate::from_ymd_opt(2026, 8, 15).unwrap());
    }
}
