//! The per-run orchestrator wiring C1 through C10 (spec §2/§4.9.1).
//!
//! [`run`] is a pure-ish async function: given a batch of fetched messages
//! and the pieces C9 owns (config, credentials, cancellation, budget), it
//! produces one [`Digest`] plus the citation violations found along the way.
//! The run controller in [`crate::run`] is the only caller; it owns the
//! state machine transitions and watermark, `run` just does the work for one
//! state-machine pass.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::warn;

use crate::citation::{self, CitationViolation};
use crate::cleaner::Cleaner;
use crate::config::Config;
use crate::evidence;
use crate::extractors;
use crate::gateway::client::{GatewayClient, RunBudget};
use crate::gateway::{GatewayError, GatewayTransport};
use crate::metrics::Metrics;
use crate::normalize;
use crate::ranker::{self, RankContext};
use crate::thread;
use crate::types::{
    Digest, EvidenceChunk, ExtractedItem, ItemKind, Message, NormalizedMessage, SchemaVersion,
};

/// Errors specific to orchestration, distinct from a single component's own
/// error type — converted into [`crate::error::Error`] at the run controller.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The run was cancelled mid-pipeline (spec §5 "no partial artifacts").
    #[error("run cancelled")]
    Cancelled,
    /// A stage-level component error, wrapped with the stage name it occurred in.
    #[error("{stage} failed: {source}")]
    Stage {
        /// The [`crate::types::RunState`] variant active when this error occurred.
        stage: String,
        /// The underlying error.
        #[source]
        source: crate::error::Error,
    },
}

/// Everything one [`run`] call produces.
pub struct PipelineOutput {
    /// The assembled, ranked, cited digest.
    pub digest: Digest,
    /// Citation invariant violations found during C6 (already excluded from `digest.items`).
    pub violations: Vec<CitationViolation>,
    /// Whether the run fell back to extractive-only output for any message (spec §4.7 budget policy).
    pub extractive_fallback_used: bool,
}

/// Run C1 through C10 over `messages`, producing one digest.
///
/// # Errors
///
/// Returns [`PipelineError::Cancelled`] if `cancel` is signalled before
/// completion.
pub async fn run<T: GatewayTransport>(
    messages: Vec<Message>,
    config: &Config,
    user_aliases: &[String],
    llm_client: Option<&GatewayClient<T>>,
    trace_id: String,
    metrics: &Metrics,
    mut cancel: watch::Receiver<bool>,
) -> Result<PipelineOutput, PipelineError> {
    if *cancel.borrow() {
        return Err(PipelineError::Cancelled);
    }

    let normalized = normalize_and_clean(messages, config, &mut cancel).await?;
    for msg in &normalized {
        metrics.incr_emails("normalized");
        if !msg.checksum_matches() {
            warn!(msg_id = %msg.message.msg_id, "normalized message checksum mismatch after cleaning");
        }
    }

    let threads = thread::build_threads(normalized);
    let thread_length_for: std::collections::HashMap<String, usize> = threads
        .iter()
        .flat_map(|t| t.messages.iter().map(|m| (m.message.msg_id.clone(), t.messages.len())))
        .collect();

    // Service traffic (bounces, auto-replies) is already excluded from `threads`
    // by `thread::build_threads`; evidence splitting must only ever see what
    // survived that filter.
    let surviving_messages: Vec<&NormalizedMessage> = threads.iter().flat_map(|t| &t.messages).collect();

    if *cancel.borrow() {
        return Err(PipelineError::Cancelled);
    }

    let budget = RunBudget::new(
        config.llm.max_tokens_per_run,
        config.llm.cost_limit_per_run,
        config.llm.usd_per_1k_tokens,
    );

    let mut all_items: Vec<ExtractedItem> = Vec::new();
    let mut all_messages_by_item: Vec<NormalizedMessage> = Vec::new();
    let mut violations = Vec::new();
    let mut extractive_fallback_used = false;

    for message in surviving_messages.iter().copied() {
        if *cancel.borrow() {
            return Err(PipelineError::Cancelled);
        }

        let chunks = evidence::split_message(message, user_aliases);
        let rule_based = extract_rule_based(
            &chunks,
            user_aliases,
            &config.ranker.important_senders,
            &config.time.user_timezone,
        );

        let (items_for_message, used_fallback) = match llm_client {
            Some(client) => classify_via_gateway(client, &chunks, &rule_based, &budget, metrics).await,
            None => (rule_based, true),
        };

        if used_fallback {
            extractive_fallback_used = true;
        }

        let enriched = enrich_citations(
            items_for_message,
            &chunks,
            message,
            config.citations.mode,
            &mut violations,
        );
        for item in enriched {
            metrics.incr_actions_found(&item.kind.to_string());
            all_items.push(item);
            all_messages_by_item.push(message.clone());
        }
    }

    if *cancel.borrow() {
        return Err(PipelineError::Cancelled);
    }

    let contexts: Vec<RankContext<'_>> = all_messages_by_item
        .iter()
        .map(|message| RankContext {
            message,
            thread_length: *thread_length_for.get(&message.message.msg_id).unwrap_or(&1),
            user_aliases,
        })
        .collect();

    let ranked = ranker::rank_items(all_items, &contexts, &config.ranker);
    metrics.set_ranking_enabled(config.ranker.enabled);

    let top10_actionable = ranked
        .iter()
        .take(10)
        .filter(|i| matches!(i.kind, ItemKind::Action | ItemKind::Question | ItemKind::Deadline))
        .count();
    if !ranked.is_empty() {
        let denom = (ranked.len().min(10) as f64).max(1.0);
        metrics.set_top10_actions_share(top10_actionable as f64 / denom);
    }

    let digest_date = Utc::now().date_naive();
    let digest = Digest {
        schema_version: SchemaVersion::V2,
        digest_date,
        trace_id,
        items: ranked,
    };

    Ok(PipelineOutput {
        digest,
        violations,
        extractive_fallback_used,
    })
}

/// Fan out C1+C2 (and implicitly C3's input) across a bounded worker pool
/// feeding results back over an `mpsc` channel (spec §4.9.1).
async fn normalize_and_clean(
    messages: Vec<Message>,
    config: &Config,
    cancel: &mut watch::Receiver<bool>,
) -> Result<Vec<NormalizedMessage>, PipelineError> {
    let pool_size = config.workers.normalize_pool_size.max(1);
    let cleaner = Arc::new(Cleaner::new(config.email_cleaner.clone()));

    let total = messages.len();
    let queue: Arc<Mutex<VecDeque<(usize, Message)>>> =
        Arc::new(Mutex::new(messages.into_iter().enumerate().collect()));
    let (tx, mut rx) = mpsc::channel::<(usize, NormalizedMessage)>(total.max(1));

    let mut handles = Vec::new();
    for _ in 0..pool_size {
        let queue = Arc::clone(&queue);
        let cleaner = Arc::clone(&cleaner);
        let tx = tx.clone();
        handles.push(tokio::spawn(async move {
            loop {
                let next = queue.lock().await.pop_front();
                let Some((index, message)) = next else { break };
                let rendered = normalize::normalize_body(&message.raw_body);
                let (text_body, removed_spans) = cleaner.clean(&rendered);
                let checksum = citation::sha256_hex(&text_body);
                let normalized = NormalizedMessage {
                    message,
                    text_body,
                    removed_spans,
                    checksum,
                };
                if tx.send((index, normalized)).await.is_err() {
                    break;
                }
            }
        }));
    }
    drop(tx);

    let mut collected: Vec<Option<NormalizedMessage>> = (0..total).map(|_| None).collect();
    while let Some((index, normalized)) = rx.recv().await {
        if *cancel.borrow() {
            for handle in &handles {
                handle.abort();
            }
            return Err(PipelineError::Cancelled);
        }
        if let Some(slot) = collected.get_mut(index) {
            *slot = Some(normalized);
        }
    }

    for handle in handles {
        let _ = handle.await;
    }

    Ok(collected.into_iter().flatten().collect())
}

fn extract_rule_based(
    chunks: &[EvidenceChunk],
    user_aliases: &[String],
    important_senders: &[String],
    user_timezone: &str,
) -> Vec<ExtractedItem> {
    chunks
        .iter()
        .flat_map(|chunk| extractors::extract_from_chunk(chunk, user_aliases, important_senders, user_timezone))
        .collect()
}

/// Call the LLM gateway for `chunks`, falling back to `rule_based` items when
/// the budget is exhausted or the call otherwise fails (spec §4.7 graceful
/// degradation).
///
/// Returns the items to use plus whether the extractive fallback fired.
async fn classify_via_gateway<T: GatewayTransport>(
    client: &GatewayClient<T>,
    chunks: &[EvidenceChunk],
    rule_based: &[ExtractedItem],
    budget: &RunBudget,
    metrics: &Metrics,
) -> (Vec<ExtractedItem>, bool) {
    match client.classify(chunks, budget).await {
        Ok(gateway_items) => {
            let items = gateway_items
                .into_iter()
                .filter_map(|gi| gateway_item_to_extracted(gi, chunks))
                .collect();
            (items, false)
        }
        Err(GatewayError::BudgetExceeded(reason)) => {
            warn!(reason = %reason, "LLM budget exceeded, falling back to extractive-only output");
            (rule_based.to_vec(), true)
        }
        Err(err) => {
            warn!(error = %err, "LLM gateway call failed, falling back to extractive-only output");
            metrics.incr_runs("retry");
            (rule_based.to_vec(), true)
        }
    }
}

fn gateway_item_to_extracted(item: crate::gateway::GatewayItem, chunks: &[EvidenceChunk]) -> Option<ExtractedItem> {
    let kind = parse_item_kind(&item.kind)?;
    let confidence = item.confidence.clamp(0.0, 1.0);
    chunks.iter().find(|c| c.evidence_id == item.evidence_id)?;

    Some(ExtractedItem {
        kind,
        text: item.text,
        verb: item.verb,
        who: item.who,
        due: item.due,
        confidence,
        evidence_id: item.evidence_id,
        citations: Vec::new(),
        rank_score: None,
    })
}

fn parse_item_kind(raw: &str) -> Option<ItemKind> {
    match raw {
        "action" => Some(ItemKind::Action),
        "question" => Some(ItemKind::Question),
        "mention" => Some(ItemKind::Mention),
        "deadline" => Some(ItemKind::Deadline),
        "risk" => Some(ItemKind::Risk),
        "fyi" => Some(ItemKind::Fyi),
        other => {
            warn!(kind = other, "gateway returned unrecognized item kind, dropping item");
            None
        }
    }
}

/// Build and validate citations for every item extracted from `message`
/// (C6), dropping items whose citation cannot be located or fails
/// validation in strict mode (spec §4.6).
fn enrich_citations(
    items: Vec<ExtractedItem>,
    chunks: &[EvidenceChunk],
    message: &NormalizedMessage,
    mode: crate::config::CitationMode,
    violations: &mut Vec<CitationViolation>,
) -> Vec<ExtractedItem> {
    let mut enriched = Vec::with_capacity(items.len());

    for mut item in items {
        let Some(chunk) = chunks.iter().find(|c| c.evidence_id == item.evidence_id) else {
            continue;
        };

        let Some(built) = citation::build_citation(&item, chunk, message) else {
            violations.push(CitationViolation {
                evidence_id: item.evidence_id.clone(),
                reason: "no citation could be located".to_owned(),
            });
            continue;
        };

        item.citations = vec![built];
        let found = citation::validate_citations(std::slice::from_ref(&item), message, mode);
        if !found.is_empty() {
            violations.extend(found);
            if mode == crate::config::CitationMode::Strict {
                continue;
            }
        }

        enriched.push(item);
    }

    enriched
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::*;
    use async_trait::async_trait;

    struct NoopTransport;

    #[async_trait]
    impl GatewayTransport for NoopTransport {
        async fn send(&self, _request: &crate::gateway::GatewayRequest) -> Result<serde_json::Value, GatewayError> {
            Ok(serde_json::json!({"items": []}))
        }
    }

    fn test_config() -> Config {
        Config {
            ews: EwsConfig::default(),
            email_cleaner: CleanerConfig::default(),
            llm: LlmConfig {
                model: "m".to_owned(),
                endpoint: "https://gateway.example.test".to_owned(),
                timeout_s: 5,
                max_tokens_per_run: 10_000,
                cost_limit_per_run: 10.0,
                usd_per_1k_tokens: 0.01,
                max_concurrent_calls: 1,
                prompt_version: PromptVersion::V2,
            },
            ranker: RankerConfig::default(),
            time: TimeConfig::default(),
            citations: CitationsConfig::default(),
            workers: WorkersConfig::default(),
            state_dir: std::env::temp_dir(),
            output_dir: std::env::temp_dir(),
        }
    }

    fn test_message(msg_id: &str, body: &str) -> Message {
        Message {
            msg_id: msg_id.to_owned(),
            conversation_id: "c1".to_owned(),
            received_at: Utc::now(),
            sender: "boss@corp.com".to_owned(),
            to: vec!["user@corp.com".to_owned()],
            cc: Vec::new(),
            subject: "Budget".to_owned(),
            raw_body: body.to_owned(),
            is_auto_submitted: false,
            changekey: "ck1".to_owned(),
            has_attachments: false,
        }
    }

    #[tokio::test]
    async fn empty_llm_response_yields_no_items_without_fallback() {
        let config = test_config();
        let metrics = Metrics::default();
        let (_tx, cancel) = watch::channel(false);
        let client = GatewayClient::new(
            NoopTransport,
            config.llm.clone(),
            crate::gateway::redactor::Redactor::new(Vec::new()),
        );

        let messages = vec![test_message("m1", "Please review the attached budget by Friday.")];
        let output = run(
            messages,
            &config,
            &["user@corp.com".to_owned()],
            Some(&client),
            "trace-1".to_owned(),
            &metrics,
            cancel,
        )
        .await
        .unwrap();

        assert!(output.digest.items.is_empty());
        assert!(!output.extractive_fallback_used);
    }

    #[tokio::test]
    async fn cancellation_short_circuits_before_any_stage() {
        let config = test_config();
        let metrics = Metrics::default();
        let (_tx, cancel) = watch::channel(true);
        let messages = vec![test_message("m1", "hello")];

        let result =
            run::<NoopTransport>(messages, &config, &[], None, "trace-2".to_owned(), &metrics, cancel).await;
        assert!(matches!(result, Err(PipelineError::Cancelled)));
    }
}
