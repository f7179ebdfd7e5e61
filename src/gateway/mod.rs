//! LLM Gateway Client (C7).
//!
//! The gateway is treated as a single opaque HTTP endpoint (spec §4.7): POST
//! `{model, messages}` with bearer auth, get back either a schema-conforming
//! JSON digest or an error. This module owns the wire types and the
//! transport trait tests substitute a mock for; [`client`] owns the retry,
//! budget, and redaction-preservation policy built around them.

pub mod client;
pub mod redactor;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::PromptVersion;

/// A chat-style role in a gateway request (spec §4.7.1: system + per-chunk user messages).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System message naming the prompt version and schema.
    System,
    /// A user message carrying one evidence chunk.
    User,
}

/// A single message in a [`GatewayRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayMessage {
    /// The role of the message author.
    pub role: Role,
    /// Message text.
    pub content: String,
}

/// The request body sent to the gateway endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayRequest {
    /// The configured model identifier.
    pub model: String,
    /// System message followed by one user message per evidence chunk.
    pub messages: Vec<GatewayMessage>,
}

/// One classified item as returned by the gateway (spec §4.7.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayItem {
    /// The evidence chunk this item was extracted from.
    pub evidence_id: String,
    /// Item kind as a lowercase string (`action`, `mention`, `deadline`, `question`, `risk`, `fyi`).
    pub kind: String,
    /// The extracted text span.
    pub text: String,
    /// The imperative verb, if any.
    #[serde(default)]
    pub verb: Option<String>,
    /// Who the action is directed at, if identifiable.
    #[serde(default)]
    pub who: Option<String>,
    /// Resolved due date, if any.
    #[serde(default)]
    pub due: Option<chrono::NaiveDate>,
    /// The gateway's own confidence for this classification.
    pub confidence: f64,
}

/// Gateway response under prompt version v2 — the current schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayResponseV2 {
    /// Classified items.
    pub items: Vec<GatewayItem>,
}

/// Gateway response under prompt version v1 — kept only so
/// [`PromptVersion::V1`] configs still parse; maps onto v2 on read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayResponseV1 {
    /// Classified items, named `actions` in the v1 schema.
    pub actions: Vec<GatewayItem>,
}

impl GatewayResponseV1 {
    /// Normalize a v1 response into the v2 shape the rest of the pipeline consumes.
    #[must_use]
    pub fn into_v2(self) -> GatewayResponseV2 {
        GatewayResponseV2 { items: self.actions }
    }
}

/// Errors returned by the gateway client.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// HTTP transport failure (network error, timeout).
    #[error("gateway transport error: {0}")]
    Transport(String),
    /// Gateway responded with a non-success HTTP status.
    #[error("gateway returned HTTP {status}: {body}")]
    HttpStatus {
        /// HTTP status code.
        status: u16,
        /// Sanitized response body.
        body: String,
    },
    /// Response body did not match the configured schema.
    #[error("gateway response did not match schema: {0}")]
    SchemaViolation(String),
    /// Response dropped or altered a masking token present in the request.
    #[error("gateway response did not preserve masking tokens")]
    MaskingViolated,
    /// The run's token or cost budget would be exceeded by this call.
    #[error("gateway call would exceed run budget: {0}")]
    BudgetExceeded(String),
}

impl From<GatewayError> for crate::error::Error {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Transport(msg) => Self::TransientNetwork(msg),
            GatewayError::HttpStatus { status, body } if status == 429 => {
                Self::RemoteRateLimit(format!("HTTP 429: {body}"))
            }
            GatewayError::HttpStatus { status, body } if status >= 500 => {
                Self::TransientNetwork(format!("HTTP {status}: {body}"))
            }
            GatewayError::HttpStatus { status, body } => {
                Self::SchemaViolation(format!("HTTP {status}: {body}"))
            }
            GatewayError::SchemaViolation(msg) => Self::SchemaViolation(msg),
            GatewayError::MaskingViolated => {
                Self::DataIntegrity("gateway response dropped a masking token".to_owned())
            }
            GatewayError::BudgetExceeded(msg) => Self::BudgetExceeded(msg),
        }
    }
}

/// Collapse whitespace, redact known secret shapes, and cap the length of an
/// HTTP error body before it is logged or surfaced in [`GatewayError::HttpStatus`].
#[must_use]
pub fn sanitize_http_error_body(raw: &str, redactor: &redactor::Redactor) -> String {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    let redacted = redactor.redact(&collapsed);

    const MAX_ERROR_BODY_CHARS: usize = 256;
    if redacted.chars().count() > MAX_ERROR_BODY_CHARS {
        let shortened: String = redacted.chars().take(MAX_ERROR_BODY_CHARS).collect();
        format!("{shortened}...[truncated]")
    } else {
        redacted
    }
}

/// The transport boundary the retry/budget/schema logic in [`client`] is
/// built around — lets tests substitute a mock instead of making real HTTP
/// calls.
#[async_trait]
pub trait GatewayTransport: Send + Sync {
    /// Send one request and return the raw JSON body on success.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Transport`] on network/timeout failure or
    /// [`GatewayError::HttpStatus`] on a non-2xx response.
    async fn send(&self, request: &GatewayRequest) -> Result<serde_json::Value, GatewayError>;
}

/// Parse a raw gateway response body according to the configured prompt version.
///
/// # Errors
///
/// Returns [`GatewayError::SchemaViolation`] if the body does not match the
/// expected shape for `prompt_version`.
pub fn parse_response(
    body: &serde_json::Value,
    prompt_version: PromptVersion,
) -> Result<GatewayResponseV2, GatewayError> {
    match prompt_version {
        PromptVersion::V2 => serde_json::from_value::<GatewayResponseV2>(body.clone())
            .map_err(|e| GatewayError::SchemaViolation(e.to_string())),
        PromptVersion::V1 => serde_json::from_value::<GatewayResponseV1>(body.clone())
            .map(GatewayResponseV1::into_v2)
            .map_err(|e| GatewayError::SchemaViolation(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_response_v2_reads_items_field() {
        let body = serde_json::json!({
            "items": [{"evidence_id": "e1", "kind": "action", "text": "review", "confidence": 0.9}]
        });
        let parsed = parse_response(&body, PromptVersion::V2).unwrap();
        assert_eq!(parsed.items.len(), 1);
    }

    #[test]
    fn parse_response_v1_maps_actions_onto_items() {
        let body = serde_json::json!({
            "actions": [{"evidence_id": "e1", "kind": "action", "text": "review", "confidence": 0.9}]
        });
        let parsed = parse_response(&body, PromptVersion::V1).unwrap();
        assert_eq!(parsed.items.len(), 1);
    }

    #[test]
    fn parse_response_rejects_missing_required_field() {
        let body = serde_json::json!({"items": [{"evidence_id": "e1"}]});
        assert!(parse_response(&body, PromptVersion::V2).is_err());
    }

    #[test]
    fn sanitize_http_error_body_truncates_long_bodies() {
        let redactor = redactor::Redactor::new(Vec::new());
        let raw = "x".repeat(1000);
        let sanitized = sanitize_http_error_body(&raw, &redactor);
        assert!(sanitized.ends_with("...[truncated]"));
    }
}
