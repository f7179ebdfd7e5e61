//! Actionability Ranker (C8).
//!
//! Scores each enriched item on ten features (spec §4.8), combines them with
//! the configured weights into a single `rank_score`, then stable-sorts the
//! list so the assembler always sees the same order for the same input.

use chrono::{DateTime, Utc};

use crate::config::{RankerConfig, RankerWeights};
use crate::types::{ExtractedItem, ItemKind, NormalizedMessage};

/// Recency decays linearly from 1.0 at 0h to 0.0 at this many hours old.
const RECENCY_HORIZON_HOURS: f64 = 48.0;

/// `thread_length` saturates at this many messages.
const THREAD_LENGTH_CAP: f64 = 10.0;

/// Per-item context the ranker needs beyond the item itself — the owning
/// message and its thread, neither of which the item carries directly.
pub struct RankContext<'a> {
    /// The message the item's evidence chunk came from.
    pub message: &'a NormalizedMessage,
    /// Number of messages in the item's thread.
    pub thread_length: usize,
    /// The recipient aliases identifying "the user" for `user_in_to`/`user_in_cc`.
    pub user_aliases: &'a [String],
}

/// The ten raw feature values for one item, before weighting (spec §4.8).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Features {
    pub user_in_to: f64,
    pub user_in_cc: f64,
    pub has_action: f64,
    pub has_mention: f64,
    pub has_due_date: f64,
    pub sender_importance: f64,
    pub thread_length: f64,
    pub recency: f64,
    pub has_attachments: f64,
    pub has_project_tag: f64,
}

impl Features {
    fn weighted_sum(self, w: &RankerWeights) -> f64 {
        let sum = (self.user_in_to * w.user_in_to)
            + (self.user_in_cc * w.user_in_cc)
            + (self.has_action * w.has_action)
            + (self.has_mention * w.has_mention)
            + (self.has_due_date * w.has_due_date)
            + (self.sender_importance * w.sender_importance)
            + (self.thread_length * w.thread_length)
            + (self.recency * w.recency)
            + (self.has_attachments * w.has_attachments)
            + (self.has_project_tag * w.has_project_tag);
        sum.clamp(0.0, 1.0)
    }
}

/// Compute the raw feature vector for `item` given `ctx` and ranker config.
#[must_use]
pub fn compute_features(item: &ExtractedItem, ctx: &RankContext<'_>, config: &RankerConfig) -> Features {
    let message = &ctx.message.message;

    let user_in_to = f64::from(addresses_match(&message.to, ctx.user_aliases));
    let user_in_cc = f64::from(addresses_match(&message.cc, ctx.user_aliases));
    let has_action = f64::from(item.kind == ItemKind::Action);
    let has_mention = f64::from(item.kind == ItemKind::Mention);
    let has_due_date = f64::from(item.due.is_some());
    let sender_importance = sender_importance_score(&message.sender, &config.important_senders);
    let thread_length = (ctx.thread_length as f64).min(THREAD_LENGTH_CAP) / THREAD_LENGTH_CAP;
    let recency = recency_score(message.received_at, Utc::now());
    let has_attachments = f64::from(message.has_attachments);
    let has_project_tag = f64::from(mentions_project_tag(item, &message.subject, &config.project_tags));

    Features {
        user_in_to,
        user_in_cc,
        has_action,
        has_mention,
        has_due_date,
        sender_importance,
        thread_length,
        recency,
        has_attachments,
        has_project_tag,
    }
}

fn addresses_match(addresses: &[String], aliases: &[String]) -> bool {
    addresses.iter().any(|addr| {
        aliases
            .iter()
            .any(|alias| addr.eq_ignore_ascii_case(alias))
    })
}

fn sender_importance_score(sender: &str, important_senders: &[String]) -> f64 {
    let sender_lower = sender.to_ascii_lowercase();
    let is_important = important_senders.iter().any(|pattern| {
        let pattern_lower = pattern.to_ascii_lowercase();
        sender_lower == pattern_lower || sender_lower.starts_with(pattern_lower.as_str())
    });
    f64::from(is_important)
}

fn recency_score(received_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let age_hours = now.signed_duration_since(received_at).num_minutes() as f64 / 60.0;
    if age_hours <= 0.0 {
        return 1.0;
    }
    (1.0 - (age_hours / RECENCY_HORIZON_HOURS)).clamp(0.0, 1.0)
}

fn mentions_project_tag(item: &ExtractedItem, subject: &str, project_tags: &[String]) -> bool {
    if project_tags.is_empty() {
        return false;
    }
    let haystack = format!("{} {}", item.text, subject).to_ascii_lowercase();
    project_tags.iter().any(|tag| {
        let tag_lower = tag.trim_start_matches('#').to_ascii_lowercase();
        haystack.contains(&tag_lower)
    })
}

/// Rank `items`, setting `rank_score` on each and returning them sorted
/// descending by score with a deterministic tie-break (spec §4.8).
///
/// When `config.enabled` is false, returns `items` unchanged and in their
/// original (LLM) order, with `rank_score` left unset.
#[must_use]
pub fn rank_items(
    mut items: Vec<ExtractedItem>,
    contexts: &[RankContext<'_>],
    config: &RankerConfig,
) -> Vec<ExtractedItem> {
    if !config.enabled {
        return items;
    }

    for (item, ctx) in items.iter_mut().zip(contexts.iter()) {
        let features = compute_features(item, ctx, config);
        item.rank_score = Some(features.weighted_sum(&config.weights));
    }

    let received_at: Vec<DateTime<Utc>> = contexts.iter().map(|ctx| ctx.message.message.received_at).collect();
    let mut indexed: Vec<usize> = (0..items.len()).collect();
    indexed.sort_by(|&ia, &ib| {
        let a = &items[ia];
        let b = &items[ib];
        let score_a = a.rank_score.unwrap_or(0.0);
        let score_b = b.rank_score.unwrap_or(0.0);
        score_b
            .partial_cmp(&score_a)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                b.confidence
                    .partial_cmp(&a.confidence)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| received_at[ib].cmp(&received_at[ia]))
            .then_with(|| a.evidence_id.cmp(&b.evidence_id))
    });

    indexed.into_iter().map(|i| items[i].clone()).collect()
}
