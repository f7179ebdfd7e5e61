//! Secret redaction and `[[REDACT:TYPE]]` masking-token enforcement for the
//! LLM gateway client (spec §4.7/§9 "PII masking").
//!
//! The gateway is assumed to mask sensitive spans of the prompt itself,
//! replacing them with tokens of the form `[[REDACT:EMAIL]]`; this client's
//! only obligation is to refuse any response that fails to preserve those
//! tokens verbatim, since a token that changed or disappeared means the
//! underlying content may have been echoed back unmasked.

use regex::Regex;

/// Canonical replacement marker used when sanitizing log/error output.
pub const REDACTION_MARKER: &str = "[REDACTED]";

/// Matches `[[REDACT:TYPE]]` masking tokens, e.g. `[[REDACT:EMAIL]]`.
fn redaction_token_pattern() -> Regex {
    Regex::new(r"\[\[REDACT:[A-Z_]+\]\]").expect("redaction token pattern must compile")
}

/// Every `[[REDACT:TYPE]]` token present in `text`, in order of appearance.
#[must_use]
pub fn extract_redaction_tokens(text: &str) -> Vec<String> {
    redaction_token_pattern()
        .find_iter(text)
        .map(|m| m.as_str().to_owned())
        .collect()
}

/// Whether every masking token sent to the gateway is still present,
/// unchanged, somewhere in its response.
///
/// A token that vanished or was altered means the gateway (or the model)
/// revealed the content it was supposed to mask; such a response must be
/// rejected rather than used.
#[must_use]
pub fn response_preserves_redaction_tokens(input_tokens: &[String], response_text: &str) -> bool {
    input_tokens.iter().all(|token| response_text.contains(token.as_str()))
}

/// Redacts known secret values and common vendor token patterns from output
/// text — used to sanitize log lines and HTTP error bodies before they are
/// recorded, never the LLM prompt/response path itself.
///
/// Known secrets and secret-shaped patterns are folded into one compiled
/// alternation so a call to [`Redactor::redact`] walks the input once rather
/// than once per known secret plus once per pattern.
#[derive(Debug, Clone)]
pub struct Redactor {
    combined: Regex,
}

impl Redactor {
    /// Create a redactor from known secret values (e.g. [`crate::credentials::Credentials::known_secrets`]).
    #[must_use]
    pub fn new(exact_secrets: Vec<String>) -> Self {
        let mut alternatives: Vec<String> = exact_secrets
            .into_iter()
            .filter(|secret| !secret.is_empty())
            .map(|secret| regex::escape(&secret))
            .collect();
        alternatives.extend(default_pattern_sources().iter().map(|p| (*p).to_owned()));

        let combined = Regex::new(&alternatives.join("|")).expect("combined redaction pattern must compile");
        Self { combined }
    }

    /// Redact every known secret and known secret-shaped span in one pass.
    #[must_use]
    pub fn redact(&self, text: &str) -> String {
        self.combined.replace_all(text, REDACTION_MARKER).into_owned()
    }
}

fn default_pattern_sources() -> &'static [&'static str] {
    &[
        r"Bearer [A-Za-z0-9\-._~+/]{10,}",
        r"sk-[A-Za-z0-9]{32,}",
        r"[A-Za-z0-9+/]{40,}={0,2}",
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_tokens_in_order() {
        let text = "Contact [[REDACT:EMAIL]] about [[REDACT:PHONE]].";
        let tokens = extract_redaction_tokens(text);
        assert_eq!(tokens, vec!["[[REDACT:EMAIL]]".to_owned(), "[[REDACT:PHONE]]".to_owned()]);
    }

    #[test]
    fn response_rejected_when_token_missing() {
        let input_tokens = vec!["[[REDACT:EMAIL]]".to_owned()];
        assert!(!response_preserves_redaction_tokens(&input_tokens, "no tokens here"));
    }

    #[test]
    fn response_accepted_when_token_preserved() {
        let input_tokens = vec!["[[REDACT:EMAIL]]".to_owned()];
        let response = "The sender [[REDACT:EMAIL]] asked for approval.";
        assert!(response_preserves_redaction_tokens(&input_tokens, response));
    }

    #[test]
    fn redactor_masks_bearer_token() {
        let redactor = Redactor::new(vec!["super-secret-token".to_owned()]);
        let redacted = redactor.redact("Authorization: Bearer super-secret-token");
        assert!(!redacted.contains("super-secret-token"));
    }
}
