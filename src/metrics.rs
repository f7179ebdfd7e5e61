//! In-process metrics registry.
//!
//! No Prometheus client crate is pulled in — none of the reference stack
//! exposes a scrape endpoint either — so this hand-rolls the handful of
//! atomic counters and histograms the run controller needs and renders them
//! in the standard text exposition format on demand (spec §6/§9 Open Questions).

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// A monotonically increasing counter, optionally labeled.
#[derive(Debug, Default)]
struct Counter {
    total: AtomicU64,
    by_label: Mutex<BTreeMap<String, u64>>,
}

impl Counter {
    fn incr(&self, label: Option<&str>) {
        self.incr_by(label, 1);
    }

    fn incr_by(&self, label: Option<&str>, amount: u64) {
        self.total.fetch_add(amount, Ordering::Relaxed);
        if let Some(label) = label {
            let mut map = self.by_label.lock().unwrap_or_else(|e| e.into_inner());
            let entry = map.entry(label.to_owned()).or_insert(0);
            *entry = entry.saturating_add(amount);
        }
    }
}

/// A histogram tracked only as count/sum, sufficient for the averages this
/// system reports; per-bucket exposition is not needed by any consumer.
#[derive(Debug, Default)]
struct Histogram {
    count: AtomicU64,
    sum_milli: AtomicU64,
}

impl Histogram {
    fn observe(&self, value: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        #[allow(clippy::cast_possible_truncation)]
        let milli = (value * 1000.0).round() as u64;
        self.sum_milli.fetch_add(milli, Ordering::Relaxed);
    }
}

/// The process-wide metrics registry, matching the series named in spec §6.
#[derive(Debug, Default)]
pub struct Metrics {
    digest_build_seconds: Histogram,
    llm_latency_ms: Histogram,
    llm_tokens_in_total: AtomicU64,
    llm_tokens_out_total: AtomicU64,
    emails_total: Counter,
    runs_total: Counter,
    citation_validation_failures_total: Counter,
    citations_per_item: Histogram,
    rank_score: Histogram,
    top10_actions_share: Mutex<f64>,
    actions_found_total: Counter,
    ranking_enabled: Mutex<bool>,
}

impl Metrics {
    /// Record one complete digest build's wall-clock duration.
    pub fn observe_digest_build_seconds(&self, seconds: f64) {
        self.digest_build_seconds.observe(seconds);
    }

    /// Record one LLM gateway call's latency.
    pub fn observe_llm_latency_ms(&self, millis: f64) {
        self.llm_latency_ms.observe(millis);
    }

    /// Record tokens sent to and received from the LLM gateway in one call.
    pub fn add_llm_tokens(&self, tokens_in: u64, tokens_out: u64) {
        self.llm_tokens_in_total.fetch_add(tokens_in, Ordering::Relaxed);
        self.llm_tokens_out_total.fetch_add(tokens_out, Ordering::Relaxed);
    }

    /// Record one fetched message's fate (`normalized`, `skipped`, `errored`).
    pub fn incr_emails(&self, status: &str) {
        self.emails_total.incr(Some(status));
    }

    /// Record one completed run's terminal status (`ok`, `retry`, `failed`).
    pub fn incr_runs(&self, status: &str) {
        self.runs_total.incr(Some(status));
    }

    /// Record one citation invariant violation.
    pub fn incr_citation_validation_failures(&self, failure_type: &str) {
        self.citation_validation_failures_total.incr(Some(failure_type));
    }

    /// Record the number of citations attached to one extracted item.
    pub fn observe_citations_per_item(&self, count: usize) {
        #[allow(clippy::cast_precision_loss)]
        self.citations_per_item.observe(count as f64);
    }

    /// Record one item's final rank score.
    pub fn observe_rank_score(&self, score: f64) {
        self.rank_score.observe(score);
    }

    /// Set the share of this run's items that made the top 10.
    pub fn set_top10_actions_share(&self, share: f64) {
        if let Ok(mut guard) = self.top10_actions_share.lock() {
            *guard = share;
        }
    }

    /// Record one classified action by its action-verb category.
    pub fn incr_actions_found(&self, action_type: &str) {
        self.actions_found_total.incr(Some(action_type));
    }

    /// Record whether ranking was enabled for this run.
    pub fn set_ranking_enabled(&self, enabled: bool) {
        if let Ok(mut guard) = self.ranking_enabled.lock() {
            *guard = enabled;
        }
    }

    /// Render the registry in the Prometheus text exposition format.
    #[must_use]
    pub fn render_prometheus_text(&self) -> String {
        let mut out = String::new();

        write_histogram(&mut out, "digest_build_seconds", &self.digest_build_seconds);
        write_histogram(&mut out, "llm_latency_ms", &self.llm_latency_ms);

        let _ = writeln!(
            out,
            "# TYPE llm_tokens_in_total counter\nllm_tokens_in_total {}",
            self.llm_tokens_in_total.load(Ordering::Relaxed)
        );
        let _ = writeln!(
            out,
            "# TYPE llm_tokens_out_total counter\nllm_tokens_out_total {}",
            self.llm_tokens_out_total.load(Ordering::Relaxed)
        );

        write_labeled_counter(&mut out, "emails_total", "status", &self.emails_total);
        write_labeled_counter(&mut out, "runs_total", "status", &self.runs_total);
        write_labeled_counter(
            &mut out,
            "citation_validation_failures_total",
            "failure_type",
            &self.citation_validation_failures_total,
        );
        write_histogram(&mut out, "citations_per_item_histogram", &self.citations_per_item);
        write_histogram(&mut out, "rank_score_histogram", &self.rank_score);

        let share = self.top10_actions_share.lock().map(|g| *g).unwrap_or(0.0);
        let _ = writeln!(
            out,
            "# TYPE top10_actions_share gauge\ntop10_actions_share {share}"
        );

        write_labeled_counter(
            &mut out,
            "actions_found_total",
            "action_type",
            &self.actions_found_total,
        );

        let enabled = self.ranking_enabled.lock().map(|g| *g).unwrap_or(false);
        let _ = writeln!(
            out,
            "# TYPE ranking_enabled gauge\nranking_enabled {}",
            u8::from(enabled)
        );

        out
    }
}

fn write_histogram(out: &mut String, name: &str, histogram: &Histogram) {
    let count = histogram.count.load(Ordering::Relaxed);
    let sum = histogram.sum_milli.load(Ordering::Relaxed) as f64 / 1000.0;
    let _ = writeln!(
        out,
        "# TYPE {name} summary\n{name}_count {count}\n{name}_sum {sum}"
    );
}

fn write_labeled_counter(out: &mut String, name: &str, label_name: &str, counter: &Counter) {
    let _ = writeln!(out, "# TYPE {name} counter");
    let by_label = counter.by_label.lock().unwrap_or_else(|e| e.into_inner());
    if by_label.is_empty() {
        let _ = writeln!(out, "{name} {}", counter.total.load(Ordering::Relaxed));
    } else {
        for (label, value) in by_label.iter() {
            let _ = writeln!(out, "{name}{{{label_name}=\"{label}\"}} {value}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_all_series_names() {
        let metrics = Metrics::default();
        metrics.observe_digest_build_seconds(1.5);
        metrics.incr_emails("normalized");
        metrics.incr_runs("ok");
        metrics.set_ranking_enabled(true);
        let text = metrics.render_prometheus_text();
        assert!(text.contains("digest_build_seconds_count 1"));
        assert!(text.contains("emails_total{status=\"normalized\"} 1"));
        assert!(text.contains("runs_total{status=\"ok\"} 1"));
        assert!(text.contains("ranking_enabled 1"));
    }

    #[test]
    fn counter_incr_by_accumulates_label() {
        let counter = Counter::default();
        counter.incr_by(Some("action"), 3);
        counter.incr_by(Some("action"), 2);
        let map = counter.by_label.lock().unwrap();
        assert_eq!(map.get("action"), Some(&5));
    }
}
