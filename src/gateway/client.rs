//! HTTP gateway client: request construction, retry/backoff, the one-shot
//! corrective retry on schema violation, and run-budget enforcement
//! (spec §4.7).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use tracing::{info, warn};

use crate::config::{LlmConfig, PromptVersion};
use crate::types::EvidenceChunk;

use super::redactor::{extract_redaction_tokens, response_preserves_redaction_tokens, Redactor};
use super::{
    parse_response, GatewayError, GatewayItem, GatewayMessage, GatewayRequest, GatewayTransport,
    Role,
};

const MAX_TRANSPORT_RETRIES: u32 = 2;
const INITIAL_BACKOFF_MS: u64 = 500;
const MAX_BACKOFF_MS: u64 = 8_000;

/// Hard cap on estimated tokens sent in a single gateway call, independent of
/// the whole-run [`RunBudget`] (spec §4.4). Evidence chunks arrive already
/// ranked most-relevant first (see [`crate::evidence::split_message`]), so
/// trimming from the tail keeps the strongest evidence in the call.
const MAX_TOKENS_PER_CALL: u64 = 3_000;

/// Rough chars-per-token ratio used for pre-flight budget estimates; only
/// needs to be consistent with [`crate::evidence`]'s own estimate.
const CHARS_PER_TOKEN: u64 = 4;

/// Tracks cumulative token spend across a single run so [`GatewayClient`]
/// can refuse further calls once [`LlmConfig::max_tokens_per_run`] or
/// [`LlmConfig::cost_limit_per_run`] would be exceeded.
#[derive(Debug, Default)]
pub struct RunBudget {
    tokens_spent: AtomicU64,
    cost_limit_usd: f64,
    tokens_limit: u64,
    /// USD per 1000 tokens, used only for the pre-flight cost estimate.
    usd_per_1k_tokens: f64,
}

impl RunBudget {
    /// Create a fresh budget tracker from the run's configured limits.
    #[must_use]
    pub fn new(tokens_limit: u64, cost_limit_usd: f64, usd_per_1k_tokens: f64) -> Self {
        Self {
            tokens_spent: AtomicU64::new(0),
            cost_limit_usd,
            tokens_limit,
            usd_per_1k_tokens,
        }
    }

    fn spent(&self) -> u64 {
        self.tokens_spent.load(Ordering::Relaxed)
    }

    fn record(&self, tokens: u64) {
        self.tokens_spent.fetch_add(tokens, Ordering::Relaxed);
    }

    /// Whether `additional_tokens` more tokens would exceed either limit.
    #[must_use]
    pub fn would_exceed(&self, additional_tokens: u64) -> bool {
        let projected = self.spent().saturating_add(additional_tokens);
        if projected > self.tokens_limit {
            return true;
        }
        let projected_cost = (projected as f64 / 1000.0) * self.usd_per_1k_tokens;
        projected_cost > self.cost_limit_usd
    }
}

/// One evidence chunk sent to the gateway, paired with the redaction tokens
/// present in its content so the response can be checked for preservation.
struct PreparedChunk<'a> {
    chunk: &'a EvidenceChunk,
    rendered: String,
    redaction_tokens: Vec<String>,
}

/// Build the gateway request for one batch of evidence chunks.
///
/// `corrective` carries the prior schema-violation message when this is a
/// one-shot corrective retry (spec §4.7.3); `None` on the first attempt.
fn build_request(
    model: &str,
    system_prompt: &str,
    prepared: &[PreparedChunk<'_>],
    corrective: Option<&str>,
) -> GatewayRequest {
    let mut messages = vec![GatewayMessage {
        role: Role::System,
        content: system_prompt.to_owned(),
    }];

    for p in prepared {
        messages.push(GatewayMessage {
            role: Role::User,
            content: p.rendered.clone(),
        });
    }

    if let Some(reason) = corrective {
        messages.push(GatewayMessage {
            role: Role::User,
            content: format!(
                "Your previous response did not match the required schema ({reason}). \
                 Reply again with only a JSON object matching the schema, no other text."
            ),
        });
    }

    GatewayRequest {
        model: model.to_owned(),
        messages,
    }
}

/// Trim `prepared` to stay under [`MAX_TOKENS_PER_CALL`], always keeping at
/// least the first chunk even if it alone exceeds the cap, and return the
/// kept chunks alongside their total estimated token count.
fn cap_to_per_call_token_limit(prepared: Vec<PreparedChunk<'_>>) -> (Vec<PreparedChunk<'_>>, u64) {
    let original_len = prepared.len();
    let mut kept = Vec::with_capacity(prepared.len());
    let mut total = 0u64;

    for p in prepared {
        let tokens = (p.rendered.len() as u64).saturating_div(CHARS_PER_TOKEN);
        if !kept.is_empty() && total.saturating_add(tokens) > MAX_TOKENS_PER_CALL {
            break;
        }
        total = total.saturating_add(tokens);
        kept.push(p);
    }

    if kept.len() < original_len {
        warn!(
            kept = kept.len(),
            dropped = original_len.saturating_sub(kept.len()),
            "dropped lowest-ranked evidence chunks to stay under the per-call token cap"
        );
    }

    (kept, total)
}

fn render_chunk(chunk: &EvidenceChunk) -> String {
    serde_json::json!({
        "evidence_id": chunk.evidence_id,
        "sender": chunk.metadata.sender,
        "subject": chunk.metadata.subject,
        "received_at": chunk.metadata.received_at,
        "content": chunk.content,
    })
    .to_string()
}

fn system_prompt(prompt_version: PromptVersion) -> &'static str {
    match prompt_version {
        PromptVersion::V2 => {
            "Classify each evidence chunk into one JSON object per chunk. \
             Respond with a JSON object of the form {\"items\": [...]}."
        }
        PromptVersion::V1 => {
            "Classify each evidence chunk into one JSON object per chunk. \
             Respond with a JSON object of the form {\"actions\": [...]}."
        }
    }
}

/// Drives one or more [`GatewayTransport`] calls to classify a set of
/// evidence chunks, enforcing retry, budget, schema, and redaction policy
/// around the raw transport.
pub struct GatewayClient<T: GatewayTransport> {
    transport: T,
    config: LlmConfig,
    redactor: Redactor,
}

impl<T: GatewayTransport> GatewayClient<T> {
    /// Construct a client wrapping `transport` under `config`'s timeout and
    /// budget policy, using `redactor` to sanitize any logged error bodies.
    #[must_use]
    pub fn new(transport: T, config: LlmConfig, redactor: Redactor) -> Self {
        Self {
            transport,
            config,
            redactor,
        }
    }

    /// Classify `chunks` against the gateway, honoring `budget`.
    ///
    /// Returns the classified items, or [`GatewayError::BudgetExceeded`] if
    /// sending would exceed the run's token or cost budget — callers should
    /// treat this as a signal to fall back to extractive-only classification
    /// for the remaining chunks rather than abort the run.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError`] on transport failure after retries, on a
    /// schema violation surviving the one-shot corrective retry, or if the
    /// response drops a masking token present in the request.
    pub async fn classify(
        &self,
        chunks: &[EvidenceChunk],
        budget: &RunBudget,
    ) -> Result<Vec<GatewayItem>, GatewayError> {
        if chunks.is_empty() {
            return Ok(Vec::new());
        }

        let prepared: Vec<PreparedChunk<'_>> = chunks
            .iter()
            .map(|chunk| {
                let rendered = render_chunk(chunk);
                let redaction_tokens = extract_redaction_tokens(&rendered);
                PreparedChunk {
                    chunk,
                    rendered,
                    redaction_tokens,
                }
            })
            .collect();

        let (prepared, estimated_tokens) = cap_to_per_call_token_limit(prepared);

        if budget.would_exceed(estimated_tokens) {
            return Err(GatewayError::BudgetExceeded(format!(
                "sending {estimated_tokens} estimated tokens would exceed the run budget"
            )));
        }

        let system = system_prompt(self.config.prompt_version);
        let request = build_request(&self.config.model, system, &prepared, None);

        let all_tokens: Vec<String> = prepared
            .iter()
            .flat_map(|p| p.redaction_tokens.iter().cloned())
            .collect();

        match self.send_with_retry(&request).await {
            Ok(body) => self.accept_or_retry(body, &request, &all_tokens, budget, estimated_tokens).await,
            Err(err) => Err(err),
        }
    }

    async fn accept_or_retry(
        &self,
        body: serde_json::Value,
        original_request: &GatewayRequest,
        redaction_tokens: &[String],
        budget: &RunBudget,
        estimated_tokens: u64,
    ) -> Result<Vec<GatewayItem>, GatewayError> {
        if !response_preserves_redaction_tokens(redaction_tokens, &body.to_string()) {
            warn!("gateway response dropped a masking token, rejecting");
            return Err(GatewayError::MaskingViolated);
        }

        match parse_response(&body, self.config.prompt_version) {
            Ok(parsed) => {
                budget.record(estimated_tokens);
                Ok(parsed.items)
            }
            Err(GatewayError::SchemaViolation(reason)) => {
                info!(reason = %reason, "gateway response violated schema, issuing one-shot corrective retry");
                let corrective = build_request(
                    &self.config.model,
                    system_prompt(self.config.prompt_version),
                    &[],
                    Some(&reason),
                );
                let mut retry_messages = original_request.messages.clone();
                retry_messages.extend(corrective.messages.into_iter().skip(1));
                let retry_request = GatewayRequest {
                    model: self.config.model.clone(),
                    messages: retry_messages,
                };

                let retry_body = self.send_with_retry(&retry_request).await?;
                if !response_preserves_redaction_tokens(redaction_tokens, &retry_body.to_string()) {
                    return Err(GatewayError::MaskingViolated);
                }
                let parsed = parse_response(&retry_body, self.config.prompt_version)?;
                budget.record(estimated_tokens);
                Ok(parsed.items)
            }
            Err(other) => Err(other),
        }
    }

    /// Send `request`, retrying transport failures and remote rate limits
    /// with exponential backoff up to [`MAX_TRANSPORT_RETRIES`] attempts.
    async fn send_with_retry(
        &self,
        request: &GatewayRequest,
    ) -> Result<serde_json::Value, GatewayError> {
        let mut backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(INITIAL_BACKOFF_MS))
            .with_max_interval(Duration::from_millis(MAX_BACKOFF_MS))
            .with_max_elapsed_time(Some(Duration::from_secs(self.config.timeout_s.saturating_mul(4))))
            .build();

        let mut attempt: u32 = 0;
        loop {
            match self.transport.send(request).await {
                Ok(body) => return Ok(body),
                Err(err) if attempt < MAX_TRANSPORT_RETRIES && is_retryable(&err) => {
                    let Some(delay) = backoff.next_backoff() else {
                        return Err(err);
                    };
                    warn!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying gateway call");
                    tokio::time::sleep(delay).await;
                    attempt = attempt.saturating_add(1);
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn is_retryable(err: &GatewayError) -> bool {
    match err {
        GatewayError::Transport(_) => true,
        GatewayError::HttpStatus { status, .. } => *status == 429 || *status >= 500,
        GatewayError::SchemaViolation(_)
        | GatewayError::MaskingViolated
        | GatewayError::BudgetExceeded(_) => false,
    }
}

/// The production [`GatewayTransport`]: a single bearer-authenticated POST
/// to the configured endpoint (spec §4.7).
pub struct HttpGatewayTransport {
    client: reqwest::Client,
    endpoint: String,
    bearer_token: String,
    redactor: Redactor,
}

impl HttpGatewayTransport {
    /// Build a transport that posts to `endpoint` with `bearer_token`,
    /// timing each call out after `timeout_s` seconds.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::ConfigError`] if the underlying HTTP
    /// client cannot be constructed.
    pub fn new(
        endpoint: String,
        bearer_token: String,
        timeout_s: u64,
        redactor: Redactor,
    ) -> crate::error::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_s))
            .build()
            .map_err(|e| crate::error::Error::ConfigError(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint,
            bearer_token,
            redactor,
        })
    }
}

#[async_trait::async_trait]
impl GatewayTransport for HttpGatewayTransport {
    async fn send(&self, request: &GatewayRequest) -> Result<serde_json::Value, GatewayError> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.bearer_token)
            .json(request)
            .send()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::HttpStatus {
                status: status.as_u16(),
                body: super::sanitize_http_error_body(&body, &self.redactor),
            });
        }

        response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct ScriptedTransport {
        responses: Mutex<Vec<Result<serde_json::Value, GatewayError>>>,
    }

    #[async_trait]
    impl GatewayTransport for ScriptedTransport {
        async fn send(&self, _request: &GatewayRequest) -> Result<serde_json::Value, GatewayError> {
            self.responses
                .lock()
                .unwrap()
                .pop()
                .unwrap_or(Err(GatewayError::Transport("exhausted script".to_owned())))
        }
    }

    fn test_config() -> LlmConfig {
        LlmConfig {
            model: "test-model".to_owned(),
            endpoint: "https://gateway.example.test".to_owned(),
            timeout_s: 5,
            max_tokens_per_run: 10_000,
            cost_limit_per_run: 10.0,
            usd_per_1k_tokens: 0.01,
            max_concurrent_calls: 1,
            prompt_version: PromptVersion::V2,
        }
    }

    fn test_chunk() -> EvidenceChunk {
        EvidenceChunk {
            evidence_id: "e1".to_owned(),
            msg_id: "m1".to_owned(),
            chunk_index: 0,
            content: "Please review the budget.".to_owned(),
            start_in_body: 0,
            end_in_body: 26,
            token_count: 7,
            metadata: crate::types::ChunkMetadata {
                to: vec!["u@corp.com".to_owned()],
                cc: Vec::new(),
                sender: "a@corp.com".to_owned(),
                subject: "Budget".to_owned(),
                has_attachments: false,
                received_at: chrono::Utc::now(),
            },
        }
    }

    #[tokio::test]
    async fn classify_returns_items_on_first_success() {
        let ok_body = serde_json::json!({"items": [
            {"evidence_id": "e1", "kind": "action", "text": "review the budget", "confidence": 0.8}
        ]});
        let transport = ScriptedTransport {
            responses: Mutex::new(vec![Ok(ok_body)]),
        };
        let client = GatewayClient::new(transport, test_config(), Redactor::new(Vec::new()));
        let budget = RunBudget::new(10_000, 10.0, 0.01);

        let items = client.classify(&[test_chunk()], &budget).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].evidence_id, "e1");
    }

    #[tokio::test]
    async fn classify_rejects_response_missing_masking_token() {
        let chunk = EvidenceChunk {
            content: "Contact [[REDACT:EMAIL]] about this.".to_owned(),
            ..test_chunk()
        };
        let ok_body = serde_json::json!({"items": []});
        let transport = ScriptedTransport {
            responses: Mutex::new(vec![Ok(ok_body)]),
        };
        let client = GatewayClient::new(transport, test_config(), Redactor::new(Vec::new()));
        let budget = RunBudget::new(10_000, 10.0, 0.01);

        let result = client.classify(&[chunk], &budget).await;
        assert!(matches!(result, Err(GatewayError::MaskingViolated)));
    }

    #[tokio::test]
    async fn classify_refuses_when_budget_would_be_exceeded() {
        let transport = ScriptedTransport {
            responses: Mutex::new(Vec::new()),
        };
        let client = GatewayClient::new(transport, test_config(), Redactor::new(Vec::new()));
        let budget = RunBudget::new(1, 10.0, 0.01);

        let result = client.classify(&[test_chunk()], &budget).await;
        assert!(matches!(result, Err(GatewayError::BudgetExceeded(_))));
    }

    #[tokio::test]
    async fn classify_retries_transient_transport_error_then_succeeds() {
        let ok_body = serde_json::json!({"items": []});
        let transport = ScriptedTransport {
            responses: Mutex::new(vec![
                Ok(ok_body),
                Err(GatewayError::Transport("connection reset".to_owned())),
            ]),
        };
        let client = GatewayClient::new(transport, test_config(), Redactor::new(Vec::new()));
        let budget = RunBudget::new(10_000, 10.0, 0.01);

        let items = client.classify(&[test_chunk()], &budget).await.unwrap();
        assert!(items.is_empty());
    }

    struct CapturingTransport {
        captured: std::sync::Arc<Mutex<Option<GatewayRequest>>>,
    }

    #[async_trait]
    impl GatewayTransport for CapturingTransport {
        async fn send(&self, request: &GatewayRequest) -> Result<serde_json::Value, GatewayError> {
            *self.captured.lock().unwrap() = Some(request.clone());
            Ok(serde_json::json!({"items": []}))
        }
    }

    #[tokio::test]
    async fn classify_drops_lowest_ranked_chunks_past_the_per_call_token_cap() {
        let chunks: Vec<EvidenceChunk> = (0..8)
            .map(|i| EvidenceChunk {
                evidence_id: format!("e{i}"),
                content: "word ".repeat(1_000),
                ..test_chunk()
            })
            .collect();

        let captured = std::sync::Arc::new(Mutex::new(None));
        let client = GatewayClient::new(
            CapturingTransport { captured: captured.clone() },
            test_config(),
            Redactor::new(Vec::new()),
        );
        let budget = RunBudget::new(1_000_000, 1_000.0, 0.0);

        client.classify(&chunks, &budget).await.unwrap();

        let sent = captured.lock().unwrap().take().unwrap();
        let user_messages = sent.messages.len().saturating_sub(1);
        assert!(user_messages < chunks.len(), "expected some chunks to be dropped, kept {user_messages}");
    }
}
