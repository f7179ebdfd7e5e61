//! Bilingual (RU/EN) noise-detection pattern families for the body cleaner.
//!
//! Patterns are table-driven and compiled once per [`super::Cleaner`] (spec
//! §9 "regex-driven cleaner... compile once per run").

use regex::Regex;

use crate::types::RemovedSpanType;

/// A single compiled detector: a regex and the span type it signals, plus a
/// baseline confidence used when no finer-grained signal is available.
pub(super) struct Detector {
    pub regex: Regex,
    pub kind: RemovedSpanType,
    pub confidence: f64,
}

fn detector(pattern: &str, kind: RemovedSpanType, confidence: f64) -> Detector {
    Detector {
        regex: Regex::new(pattern).expect("built-in cleaner pattern must compile"),
        kind,
        confidence,
    }
}

/// Line-anchored markers that start a quoted-reply block.
pub(super) fn quote_start_markers() -> Vec<Detector> {
    vec![
        detector(r"(?m)^\s*>.*$", RemovedSpanType::Quoted, 0.9),
        detector(
            r"(?mi)^\s*-{3,}\s*Original Message\s*-{3,}\s*$",
            RemovedSpanType::Quoted,
            0.95,
        ),
        detector(
            r"(?mi)^\s*(От|From):\s*.+$",
            RemovedSpanType::Quoted,
            0.85,
        ),
        detector(
            r"(?mi)^\s*(Кому|To):\s*.+$",
            RemovedSpanType::Quoted,
            0.6,
        ),
        detector(
            r"(?mi)^\s*On .+ wrote:\s*$",
            RemovedSpanType::Quoted,
            0.9,
        ),
    ]
}

/// Signature-block markers.
pub(super) fn signature_markers() -> Vec<Detector> {
    vec![
        detector(r"(?m)^--\s*$", RemovedSpanType::Signature, 0.95),
        detector(
            r"(?mi)^\s*Sent from my (iPhone|iPad|Android|mobile device).*$",
            RemovedSpanType::Signature,
            0.9,
        ),
        detector(
            r"(?mi)^\s*С уважением,?\s*$",
            RemovedSpanType::Signature,
            0.85,
        ),
        detector(
            r"(?mi)^\s*Best regards,?\s*$",
            RemovedSpanType::Signature,
            0.75,
        ),
    ]
}

/// Disclaimer / legal-boilerplate markers.
pub(super) fn disclaimer_markers() -> Vec<Detector> {
    vec![
        detector(
            r"(?i)this (e-?mail|message) (and any attachments )?(is|are) confidential",
            RemovedSpanType::Disclaimer,
            0.9,
        ),
        detector(
            r"(?i)настоящее сообщение (является конфиденциальным|содержит конфиденциальную информацию)",
            RemovedSpanType::Disclaimer,
            0.9,
        ),
        detector(
            r"(?i)to unsubscribe,? (click|please)",
            RemovedSpanType::Disclaimer,
            0.85,
        ),
        detector(
            r"(?i)отписаться от рассылки",
            RemovedSpanType::Disclaimer,
            0.85,
        ),
    ]
}

/// Automated out-of-office / auto-reply banners.
pub(super) fn auto_response_markers() -> Vec<Detector> {
    vec![
        detector(
            r"(?i)^\s*(out of office|automatic reply|auto-?reply)",
            RemovedSpanType::AutoResponse,
            0.9,
        ),
        detector(
            r"(?i)(автоответ|я в отпуске|нахожусь вне офиса)",
            RemovedSpanType::AutoResponse,
            0.9,
        ),
    ]
}

/// All built-in detectors across the four noise classes, in removal-priority order.
pub(super) fn all_detectors() -> Vec<Detector> {
    let mut all = Vec::new();
    all.extend(auto_response_markers());
    all.extend(disclaimer_markers());
    all.extend(signature_markers());
    all.extend(quote_start_markers());
    all
}
