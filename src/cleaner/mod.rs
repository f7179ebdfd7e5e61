//! Body Cleaner (C2).
//!
//! Removes four classes of noise — quoted replies, signatures, disclaimers,
//! and auto-response banners — from a normalized body, bilingually (RU/EN).
//! Operates on paragraphs of the C1-normalized text and records every removed
//! span in that same (pre-cleaning) coordinate system, so citations built
//! later always resolve against `NormalizedMessage.text_body` unambiguously.

mod patterns;

use regex::Regex;
use tracing::warn;

use crate::config::CleanerConfig;
use crate::types::{RemovedSpan, RemovedSpanType};

use patterns::Detector;

/// A compiled cleaner ready to process message bodies.
pub struct Cleaner {
    config: CleanerConfig,
    detectors: Vec<Detector>,
    whitelist: Vec<Regex>,
    blacklist: Vec<Regex>,
}

/// One paragraph of the pre-cleaning text, with its byte span.
struct Paragraph<'a> {
    start: usize,
    end: usize,
    text: &'a str,
}

impl Cleaner {
    /// Compile a cleaner from configuration. Malformed whitelist/blacklist
    /// patterns are skipped and logged rather than failing the whole run
    /// (spec §4.5 error semantics generalized to the cleaner's own pattern lists).
    #[must_use]
    pub fn new(config: CleanerConfig) -> Self {
        let whitelist = compile_patterns(&config.whitelist_patterns);
        let blacklist = compile_patterns(&config.blacklist_patterns);
        Self {
            config,
            detectors: patterns::all_detectors(),
            whitelist,
            blacklist,
        }
    }

    /// Clean `text_in`, returning the cleaned text plus every removed span in
    /// `text_in`'s own coordinate system.
    pub fn clean(&self, text_in: &str) -> (String, Vec<RemovedSpan>) {
        if !self.config.enabled {
            return (text_in.to_owned(), Vec::new());
        }

        let paragraphs = split_paragraphs(text_in);
        let mut removed_spans = Vec::new();
        let mut kept = Vec::new();
        let mut quote_started = false;
        let mut quote_head_kept = 0usize;
        let mut quote_head_lines_kept = 0usize;

        for paragraph in &paragraphs {
            if self.whitelisted(paragraph.text) {
                kept.push(paragraph.text);
                continue;
            }

            let forced = self.blacklisted(paragraph.text);
            let detected = self.detect(paragraph.text);

            let classification = match (&detected, forced) {
                (Some((kind, confidence)), _) => Some((*kind, *confidence)),
                (None, true) => Some((RemovedSpanType::Quoted, 0.99)),
                (None, false) if quote_started => Some((RemovedSpanType::Quoted, 0.7)),
                (None, false) => None,
            };

            let Some((kind, confidence)) = classification else {
                kept.push(paragraph.text);
                continue;
            };

            if kind == RemovedSpanType::Quoted {
                let just_started = !quote_started;
                quote_started = true;

                if self.config.keep_top_quote_head {
                    let lines = paragraph.text.lines().count();
                    let paragraph_fits =
                        quote_head_kept < self.config.max_top_quote_paragraphs;
                    let lines_fit = quote_head_lines_kept.saturating_add(lines)
                        <= self.config.max_top_quote_lines;
                    if just_started && paragraph_fits && lines_fit {
                        quote_head_kept = quote_head_kept.saturating_add(1);
                        quote_head_lines_kept = quote_head_lines_kept.saturating_add(lines);
                        kept.push(paragraph.text);
                        continue;
                    }
                }
            }

            if paragraph.text.chars().count() > self.config.max_quote_removal_length {
                warn!(
                    len = paragraph.text.chars().count(),
                    limit = self.config.max_quote_removal_length,
                    "refusing to remove oversized block, keeping as-is"
                );
                kept.push(paragraph.text);
                continue;
            }

            if self.config.track_removed_spans {
                removed_spans.push(RemovedSpan {
                    start: paragraph.start,
                    end: paragraph.end,
                    kind,
                    content: paragraph.text.to_owned(),
                    confidence,
                });
            }
        }

        (kept.join("\n\n"), removed_spans)
    }

    fn whitelisted(&self, text: &str) -> bool {
        self.whitelist.iter().any(|re| re.is_match(text))
    }

    fn blacklisted(&self, text: &str) -> bool {
        self.blacklist.iter().any(|re| re.is_match(text))
    }

    fn detect(&self, text: &str) -> Option<(RemovedSpanType, f64)> {
        self.detectors
            .iter()
            .find(|d| d.regex.is_match(text))
            .map(|d| (d.kind, d.confidence))
    }
}

fn compile_patterns(patterns: &[String]) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|p| match Regex::new(p) {
            Ok(re) => Some(re),
            Err(e) => {
                warn!(pattern = %p, error = %e, "skipping malformed cleaner pattern");
                None
            }
        })
        .collect()
}

/// Split `text` on blank lines into paragraphs, keeping their byte offsets.
fn split_paragraphs(text: &str) -> Vec<Paragraph<'_>> {
    let mut paragraphs = Vec::new();
    let mut pos = 0usize;

    for block in text.split("\n\n") {
        let block_start = pos;
        let block_end = block_start.saturating_add(block.len());
        if !block.trim().is_empty() {
            paragraphs.push(Paragraph {
                start: block_start,
                end: block_end,
                text: block,
            });
        }
        pos = block_end.saturating_add(2);
    }

    paragraphs
}
