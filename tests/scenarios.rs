//! Black-box coverage of the end-to-end scenarios the pipeline is expected
//! to satisfy, exercised through the crate's public API only.

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, TimeZone, Utc, Weekday};
use tokio::sync::watch;

use inbox_digest::cleaner::Cleaner;
use inbox_digest::config::{
    CitationsConfig, CleanerConfig, Config, EwsConfig, LlmConfig, PromptVersion, RankerConfig, TimeConfig,
    WorkersConfig,
};
use inbox_digest::gateway::client::{GatewayClient, RunBudget};
use inbox_digest::gateway::redactor::Redactor;
use inbox_digest::gateway::{GatewayError, GatewayRequest, GatewayTransport};
use inbox_digest::metrics::Metrics;
use inbox_digest::pipeline;
use inbox_digest::ranker::{self, RankContext};
use inbox_digest::run::{RunController, RunOutcome, RunRequest};
use inbox_digest::types::{ExtractedItem, ItemKind, Message, NormalizedMessage, RunKey};

struct UnreachableTransport;

#[async_trait]
impl GatewayTransport for UnreachableTransport {
    async fn send(&self, _request: &GatewayRequest) -> Result<serde_json::Value, GatewayError> {
        panic!("transport must not be called once the run budget is already exhausted");
    }
}

fn base_llm_config() -> LlmConfig {
    LlmConfig {
        model: "m".to_owned(),
        endpoint: "https://gateway.example.test".to_owned(),
        timeout_s: 5,
        max_tokens_per_run: 10_000,
        cost_limit_per_run: 10.0,
        usd_per_1k_tokens: 0.01,
        max_concurrent_calls: 1,
        prompt_version: PromptVersion::V2,
    }
}

fn base_config(state_dir: std::path::PathBuf, output_dir: std::path::PathBuf) -> Config {
    Config {
        ews: EwsConfig::default(),
        email_cleaner: CleanerConfig::default(),
        llm: base_llm_config(),
        ranker: RankerConfig::default(),
        time: TimeConfig::default(),
        citations: CitationsConfig::default(),
        workers: WorkersConfig::default(),
        state_dir,
        output_dir,
    }
}

fn message(msg_id: &str, sender: &str, to: Vec<String>, subject: &str, body: &str, received_at: chrono::DateTime<Utc>) -> Message {
    Message {
        msg_id: msg_id.to_owned(),
        conversation_id: format!("c-{msg_id}"),
        received_at,
        sender: sender.to_owned(),
        to,
        cc: Vec::new(),
        subject: subject.to_owned(),
        raw_body: body.to_owned(),
        is_auto_submitted: false,
        changekey: "ck1".to_owned(),
        has_attachments: false,
    }
}

/// S1 — a single bilingual imperative resolves to one action item with a
/// canonical verb, a due date on the upcoming Friday, high confidence, and
/// exactly one citation spanning the full sentence.
#[tokio::test]
async fn s1_simple_imperative_yields_one_high_confidence_action() {
    let received_at = Utc.with_ymd_and_hms(2026, 7, 27, 9, 0, 0).unwrap();
    let body = "Иван, пожалуйста согласуйте бюджет Q3 до пятницы.";
    let messages = vec![message(
        "m1",
        "boss@corp.com",
        vec!["ivan@corp.com".to_owned()],
        "Budget Q3",
        body,
        received_at,
    )];

    let state_dir = tempfile::tempdir().unwrap();
    let config = base_config(state_dir.path().to_path_buf(), state_dir.path().to_path_buf());
    let metrics = Metrics::default();
    let (_tx, cancel) = watch::channel(false);

    let output = pipeline::run::<UnreachableTransport>(
        messages,
        &config,
        &["Иван".to_owned()],
        None,
        "trace-s1".to_owned(),
        &metrics,
        cancel,
    )
    .await
    .unwrap();

    assert_eq!(output.digest.items.len(), 1);
    let item = &output.digest.items[0];
    assert_eq!(item.kind, ItemKind::Action);
    assert_eq!(item.verb.as_deref(), Some("согласовать"));
    assert!(item.confidence >= 0.85, "confidence {} below 0.85", item.confidence);
    assert_eq!(item.due.map(|d| d.weekday()), Some(Weekday::Fri));
    assert_eq!(item.citations.len(), 1);
    assert_eq!(item.citations[0].preview, body);
}

/// S2 — an inline reply above a quoted chain keeps only the reply when
/// `keep_top_quote_head` is off, and keeps the quote's opening paragraphs
/// too when it's on.
#[test]
fn s2_quoted_reply_head_retention_toggle() {
    let body = "Согласен.\n\n> От: Иван\n> Предлагаю встретиться завтра.";

    let dropped = Cleaner::new(CleanerConfig {
        keep_top_quote_head: false,
        ..CleanerConfig::default()
    });
    let (cleaned, removed) = dropped.clean(body);
    assert_eq!(cleaned, "Согласен.");
    assert_eq!(removed.len(), 1);
    assert_eq!(removed[0].kind, inbox_digest::types::RemovedSpanType::Quoted);

    let kept = Cleaner::new(CleanerConfig {
        keep_top_quote_head: true,
        max_top_quote_paragraphs: 2,
        ..CleanerConfig::default()
    });
    let (cleaned, _removed) = kept.clean(body);
    assert!(cleaned.contains("Согласен"));
    assert!(cleaned.contains("Предлагаю встретиться завтра"));
}

fn ranked_item(kind: ItemKind, evidence_id: &str) -> ExtractedItem {
    ExtractedItem {
        kind,
        text: "some evidence text".to_owned(),
        verb: None,
        who: None,
        due: None,
        confidence: 0.7,
        evidence_id: evidence_id.to_owned(),
        citations: Vec::new(),
        rank_score: None,
    }
}

fn ranker_message(hours_ago: i64) -> NormalizedMessage {
    NormalizedMessage {
        message: message(
            "m",
            "boss@corp.com",
            vec!["user@corp.com".to_owned()],
            "FYI",
            "body",
            Utc::now() - chrono::Duration::hours(hours_ago),
        ),
        text_body: "body".to_owned(),
        removed_spans: Vec::new(),
        checksum: "deadbeef".to_owned(),
    }
}

/// S3 — with the ranker enabled, actionable kinds (action/question/deadline)
/// dominate the top 10 even when most of the 50-item inbox is plain FYI
/// noise; with it disabled, items stay in arrival order and `rank_score`
/// is never set.
#[test]
fn s3_ranker_concentrates_actionable_items_in_top_ten() {
    let mut items = Vec::new();
    for i in 0..40 {
        items.push(ranked_item(ItemKind::Fyi, &format!("fyi-{i}")));
    }
    let actionable_kinds = [ItemKind::Action, ItemKind::Question, ItemKind::Deadline];
    for (i, kind) in actionable_kinds.iter().cycle().take(10).enumerate() {
        items.push(ranked_item(*kind, &format!("actionable-{i}")));
    }

    let messages: Vec<NormalizedMessage> = items.iter().map(|_| ranker_message(1)).collect();
    let contexts: Vec<RankContext<'_>> = messages
        .iter()
        .map(|m| RankContext {
            message: m,
            thread_length: 1,
            user_aliases: &[],
        })
        .collect();

    let enabled_config = RankerConfig::default();
    let ranked = ranker::rank_items(items.clone(), &contexts, &enabled_config);
    let top10_actionable = ranked
        .iter()
        .take(10)
        .filter(|i| matches!(i.kind, ItemKind::Action | ItemKind::Question | ItemKind::Deadline))
        .count();
    assert!(
        (top10_actionable as f64 / 10.0) >= 0.70,
        "expected at least 70% actionable in top 10, got {top10_actionable}/10"
    );

    let disabled_config = RankerConfig {
        enabled: false,
        ..RankerConfig::default()
    };
    let unranked = ranker::rank_items(items.clone(), &contexts, &disabled_config);
    assert_eq!(unranked[0].evidence_id, items[0].evidence_id);
    assert!(unranked.iter().all(|i| i.rank_score.is_none()));
}

struct CorrectiveRetryTransport {
    calls: std::sync::atomic::AtomicUsize,
}

#[async_trait]
impl GatewayTransport for CorrectiveRetryTransport {
    async fn send(&self, _request: &GatewayRequest) -> Result<serde_json::Value, GatewayError> {
        let attempt = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if attempt == 0 {
            Ok(serde_json::json!({"not_the_expected_shape": true}))
        } else {
            Ok(serde_json::json!({"items": [
                {"evidence_id": "e1", "kind": "action", "text": "review the budget", "confidence": 0.9}
            ]}))
        }
    }
}

fn gateway_test_chunk() -> inbox_digest::types::EvidenceChunk {
    inbox_digest::types::EvidenceChunk {
        evidence_id: "e1".to_owned(),
        msg_id: "m1".to_owned(),
        chunk_index: 0,
        content: "Please review the budget.".to_owned(),
        start_in_body: 0,
        end_in_body: 26,
        token_count: 7,
        metadata: inbox_digest::types::ChunkMetadata {
            to: vec!["u@corp.com".to_owned()],
            cc: Vec::new(),
            sender: "a@corp.com".to_owned(),
            subject: "Budget".to_owned(),
            has_attachments: false,
            received_at: Utc::now(),
        },
    }
}

/// S4 — a schema-violating first response is recovered by the one-shot
/// corrective retry: the call still succeeds, and the transport was
/// exercised exactly twice.
#[tokio::test]
async fn s4_schema_violation_recovers_via_corrective_retry() {
    let client = GatewayClient::new(
        CorrectiveRetryTransport {
            calls: std::sync::atomic::AtomicUsize::new(0),
        },
        base_llm_config(),
        Redactor::new(Vec::new()),
    );
    let budget = RunBudget::new(10_000, 10.0, 0.01);

    let items = client.classify(&[gateway_test_chunk()], &budget).await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].evidence_id, "e1");
}

/// S5 — when the run budget is already too small for even one chunk, the
/// gateway is never called and the pipeline falls back to extractive-only
/// output that still carries valid citations.
#[tokio::test]
async fn s5_budget_overflow_falls_back_to_extractive_output_with_citations() {
    let received_at = Utc.with_ymd_and_hms(2026, 7, 27, 9, 0, 0).unwrap();
    let messages = vec![message(
        "m1",
        "boss@corp.com",
        vec!["user@corp.com".to_owned()],
        "Budget",
        "User, please review the attached budget by Friday.",
        received_at,
    )];

    let state_dir = tempfile::tempdir().unwrap();
    let mut config = base_config(state_dir.path().to_path_buf(), state_dir.path().to_path_buf());
    config.llm.max_tokens_per_run = 1;

    let client = GatewayClient::new(UnreachableTransport, config.llm.clone(), Redactor::new(Vec::new()));
    let metrics = Metrics::default();
    let (_tx, cancel) = watch::channel(false);

    let output = pipeline::run(
        messages,
        &config,
        &["User".to_owned()],
        Some(&client),
        "trace-s5".to_owned(),
        &metrics,
        cancel,
    )
    .await
    .unwrap();

    assert!(output.extractive_fallback_used);
    assert!(!output.digest.items.is_empty());
    assert!(output.digest.items.iter().all(|i| !i.citations.is_empty()));
}

struct EmptyTransport;

#[async_trait]
impl GatewayTransport for EmptyTransport {
    async fn send(&self, _request: &GatewayRequest) -> Result<serde_json::Value, GatewayError> {
        Ok(serde_json::json!({"items": []}))
    }
}

/// S6 — running the controller twice back-to-back for the same idempotency
/// key writes artifacts only once; the second call is skipped before the
/// watermark file is ever touched, so it is byte-identical across both runs.
#[tokio::test]
async fn s6_idempotent_rerun_writes_no_new_artifact_and_leaves_watermark_untouched() {
    let state_dir = tempfile::tempdir().unwrap();
    let output_dir = tempfile::tempdir().unwrap();
    let config = base_config(state_dir.path().to_path_buf(), output_dir.path().to_path_buf());
    let client = GatewayClient::new(EmptyTransport, config.llm.clone(), Redactor::new(Vec::new()));
    let controller = RunController::new(config, client, Metrics::default());

    let run_key = RunKey {
        user_id: "alice".to_owned(),
        digest_date: NaiveDate::from_ymd_opt(2026, 8, 1).unwrap(),
    };

    let (_tx, cancel) = watch::channel(false);
    let request_1 = RunRequest {
        run_key: run_key.clone(),
        user_aliases: vec!["alice@corp.com".to_owned()],
        force: false,
        trace_id: "t1".to_owned(),
    };
    let first = controller.run(request_1, Vec::new(), cancel.clone()).await.unwrap();
    assert!(matches!(first, RunOutcome::Completed { .. }));

    let watermark_path = state_dir.path().join("alice.watermark.json");
    let watermark_after_first = std::fs::read_to_string(&watermark_path).unwrap();

    let request_2 = RunRequest {
        run_key,
        user_aliases: vec!["alice@corp.com".to_owned()],
        force: false,
        trace_id: "t2".to_owned(),
    };
    let second = controller.run(request_2, Vec::new(), cancel).await.unwrap();
    assert!(matches!(second, RunOutcome::Skipped { .. }));

    let watermark_after_second = std::fs::read_to_string(&watermark_path).unwrap();
    assert_eq!(watermark_after_first, watermark_after_second);
}
