//! Core domain types shared by every pipeline stage.
//!
//! Each stage's output is an immutable value built from these types; nothing
//! here is mutated in place once constructed.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// A single mailbox item as handed to the pipeline by the (out-of-scope) fetcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique identifier within the mailbox.
    pub msg_id: String,
    /// Groups messages into the same conversation.
    pub conversation_id: String,
    /// UTC receipt timestamp.
    pub received_at: DateTime<Utc>,
    /// Sender address or display string.
    pub sender: String,
    /// Primary recipients.
    pub to: Vec<String>,
    /// Carbon-copy recipients.
    pub cc: Vec<String>,
    /// Subject line.
    pub subject: String,
    /// Raw body, HTML or plain text.
    pub raw_body: String,
    /// Whether the mail server marked this as an automated submission.
    pub is_auto_submitted: bool,
    /// Opaque change token from the mailbox provider, used for full-sweep dedup.
    pub changekey: String,
    /// Whether the message carries attachments (feeds the ranker and chunk metadata).
    #[serde(default)]
    pub has_attachments: bool,
}

/// The kind of noise a [`crate::cleaner`] span was removed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovedSpanType {
    /// A quoted reply chain (`>`-prefixed lines, `-----Original Message-----`, …).
    Quoted,
    /// An email signature block.
    Signature,
    /// Confidentiality boilerplate or unsubscribe footer.
    Disclaimer,
    /// An automated out-of-office / auto-reply banner.
    AutoResponse,
}

/// A contiguous region removed from the raw body, recorded in *pre-cleaning* coordinates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemovedSpan {
    /// Start byte offset into the raw (pre-cleaning) body.
    pub start: usize,
    /// End byte offset (exclusive) into the raw body.
    pub end: usize,
    /// Classification of the removed content.
    #[serde(rename = "type")]
    pub kind: RemovedSpanType,
    /// The removed text itself, kept for audit.
    pub content: String,
    /// Confidence that this removal was correct, in `[0, 1]`.
    pub confidence: f64,
}

/// A [`Message`] after C1/C2 have normalized and cleaned its body.
///
/// `text_body` is the coordinate system every later offset (chunks, citations)
/// is expressed in; `checksum` proves it hasn't been mutated after the fact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedMessage {
    /// The original message this was derived from.
    pub message: Message,
    /// Cleaned, plain-text body.
    pub text_body: String,
    /// Spans removed during cleaning, in pre-cleaning coordinates, in removal order.
    pub removed_spans: Vec<RemovedSpan>,
    /// Lowercase hex SHA-256 of `text_body`.
    pub checksum: String,
}

impl NormalizedMessage {
    /// Recompute the checksum from `text_body` and compare against the stored one.
    pub fn checksum_matches(&self) -> bool {
        crate::citation::sha256_hex(&self.text_body) == self.checksum
    }
}

/// A token-bounded substring of a [`NormalizedMessage::text_body`] used as extraction input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceChunk {
    /// Stable identifier: first 8 bytes of `SHA256(msg_id|chunk_index|content)`, hex-encoded.
    pub evidence_id: String,
    /// Owning message.
    pub msg_id: String,
    /// Zero-based index of this chunk within its message.
    pub chunk_index: usize,
    /// The chunk text — a verbatim substring of the owning message's `text_body`.
    pub content: String,
    /// Start byte offset into `text_body`.
    pub start_in_body: usize,
    /// End byte offset (exclusive) into `text_body`.
    pub end_in_body: usize,
    /// Approximate token count of `content`.
    pub token_count: usize,
    /// Denormalized context carried alongside the chunk for prompting and ranking.
    pub metadata: ChunkMetadata,
}

/// Context copied from the owning message so downstream stages don't need it re-joined.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkMetadata {
    /// Primary recipients of the owning message.
    pub to: Vec<String>,
    /// Carbon-copy recipients of the owning message.
    pub cc: Vec<String>,
    /// Sender of the owning message.
    pub sender: String,
    /// Subject of the owning message.
    pub subject: String,
    /// Whether the owning message has attachments.
    pub has_attachments: bool,
    /// Receipt time of the owning message.
    pub received_at: DateTime<Utc>,
}

/// Proof that an [`ExtractedItem`] traces back to an exact substring of a normalized body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Citation {
    /// The message this citation points into.
    pub msg_id: String,
    /// Start byte offset into `text_body`.
    pub start: usize,
    /// End byte offset (exclusive) into `text_body`.
    pub end: usize,
    /// `text_body[start..min(end, start+200)]`, capped at 200 chars.
    pub preview: String,
    /// The owning [`NormalizedMessage::checksum`] at the time of citation build.
    pub checksum: String,
}

/// The tag of the [`ExtractedItem`] union (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    /// An imperative request directed at the user.
    Action,
    /// A question directed at the user.
    Question,
    /// The user is mentioned without an imperative or question.
    Mention,
    /// A date/time reference with no accompanying request.
    Deadline,
    /// A risk, blocker, or problem statement.
    Risk,
    /// Informational content, not actionable.
    Fyi,
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Action => "action",
            Self::Question => "question",
            Self::Mention => "mention",
            Self::Deadline => "deadline",
            Self::Risk => "risk",
            Self::Fyi => "fyi",
        };
        f.write_str(s)
    }
}

/// A single extracted, classified piece of evidence — the tagged union from spec §3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedItem {
    /// The item's classification.
    pub kind: ItemKind,
    /// The evidence text this item was extracted from.
    pub text: String,
    /// The governing verb, when the extractor identified one (e.g. "approve").
    pub verb: Option<String>,
    /// Who the item addresses (alias or name), when identifiable.
    pub who: Option<String>,
    /// A resolved due date, when a deadline cue was present.
    pub due: Option<NaiveDate>,
    /// Extraction confidence in `[0, 1]`.
    pub confidence: f64,
    /// The evidence chunk this item was extracted from.
    pub evidence_id: String,
    /// Citations proving the item's provenance; populated by C6, always non-empty after enrichment.
    pub citations: Vec<Citation>,
    /// Actionability score set by the ranker; `None` when ranking is disabled.
    pub rank_score: Option<f64>,
}

/// The schema version a [`Digest`] was written with (spec §OQ: default to `v2`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaVersion {
    /// Legacy extract-actions-only schema, read-only in this system.
    V1,
    /// Current schema: tagged item kinds, required citations and evidence ids.
    V2,
}

/// The final structured artifact for one `(user_id, digest_date)` run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Digest {
    /// Schema this document was written with.
    pub schema_version: SchemaVersion,
    /// Calendar date (in `time.user_timezone`) this digest covers.
    pub digest_date: NaiveDate,
    /// Correlates every log line and gateway call made while building this digest.
    pub trace_id: String,
    /// Ranked, cited items, grouped by kind for stable presentation.
    pub items: Vec<ExtractedItem>,
}

/// Durable incremental-sync cursor owned by the run controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Watermark {
    /// Opaque token from the mailbox fetcher; `None` before the first successful run.
    pub token: Option<String>,
    /// UTC timestamp of the last full sweep, used to decide full-sweep windows.
    pub last_full_sweep: DateTime<Utc>,
}

/// The idempotency key a digest run is keyed by (spec §4.9).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RunKey {
    /// The mailbox owner this digest is for.
    pub user_id: String,
    /// The calendar day the digest covers.
    pub digest_date: NaiveDate,
}

impl fmt::Display for RunKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.user_id, self.digest_date)
    }
}

/// The run controller's state machine (spec §4.9).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunState {
    /// No run in progress.
    Idle,
    /// Pulling messages from the mailbox fetcher.
    Fetching,
    /// Running C1/C2/C3 over fetched messages.
    Normalizing,
    /// Running C4/C5 to produce candidate items.
    Extracting,
    /// Calling the LLM gateway over selected evidence.
    LlmCalling,
    /// Building and validating citations (C6).
    Citing,
    /// Scoring and ordering items (C8).
    Ranking,
    /// Writing output artifacts (C10).
    Assembling,
    /// The run completed and artifacts were written.
    Done,
    /// The run failed at `stage` with `error`; the watermark was not advanced.
    Failed {
        /// The stage active when the failure occurred.
        stage: String,
        /// A human-readable error summary.
        error: String,
    },
}

impl RunState {
    /// The metric label for this state (`ok`, `retry`, or `failed`), when terminal.
    pub fn terminal_status(&self) -> Option<&'static str> {
        match self {
            Self::Done => Some("ok"),
            Self::Failed { .. } => Some("failed"),
            _ => None,
        }
    }
}

/// A persisted record that a run finished successfully (`runs/<digest_date>.done`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    /// The idempotency key this record is for.
    pub run_key: RunKey,
    /// UTC completion timestamp.
    pub finished_at: DateTime<Utc>,
    /// Paths to the artifacts written by this run.
    pub artifact_paths: Vec<String>,
    /// The trace id the run was executed under.
    pub trace_id: String,
}
