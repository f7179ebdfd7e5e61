//! Run configuration: loading, environment overrides, and validation.
//!
//! A [`Config`] is loaded once per process and threaded explicitly through the
//! run controller to every pipeline component — no component reads environment
//! variables directly (spec §9 design notes).

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

/// Top-level run configuration, matching the options enumerated in spec §6/§6.1.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Mailbox fetch tuning.
    #[serde(default)]
    pub ews: EwsConfig,
    /// Body cleaner policy.
    #[serde(default)]
    pub email_cleaner: CleanerConfig,
    /// LLM gateway tuning.
    pub llm: LlmConfig,
    /// Ranker weights and feature sources.
    #[serde(default)]
    pub ranker: RankerConfig,
    /// Timezone and digest window.
    #[serde(default)]
    pub time: TimeConfig,
    /// Citation validation mode.
    #[serde(default)]
    pub citations: CitationsConfig,
    /// Concurrency tuning.
    #[serde(default)]
    pub workers: WorkersConfig,
    /// Root of persistent run state (watermark, run records).
    pub state_dir: PathBuf,
    /// Root for atomically-written digest artifacts.
    pub output_dir: PathBuf,
}

/// Mailbox fetch tuning (spec §6).
#[derive(Debug, Clone, Deserialize)]
pub struct EwsConfig {
    /// Look-back horizon, in hours, used for a full sweep.
    #[serde(default = "default_lookback_hours")]
    pub lookback_hours: u32,
    /// Fetch batch size.
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

impl Default for EwsConfig {
    fn default() -> Self {
        Self {
            lookback_hours: default_lookback_hours(),
            page_size: default_page_size(),
        }
    }
}

/// Body cleaner policy (spec §4.2/§6).
#[derive(Debug, Clone, Deserialize)]
pub struct CleanerConfig {
    /// Master enable/disable switch.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Whether to retain the head of the outermost quote (inline-reply preservation).
    #[serde(default)]
    pub keep_top_quote_head: bool,
    /// Paragraphs of the outermost quote to retain when `keep_top_quote_head` is set.
    #[serde(default = "default_top_quote_paragraphs")]
    pub max_top_quote_paragraphs: usize,
    /// Lines of the outermost quote to retain when `keep_top_quote_head` is set.
    #[serde(default = "default_top_quote_lines")]
    pub max_top_quote_lines: usize,
    /// A single removable block longer than this is refused outright.
    #[serde(default = "default_max_quote_removal_length")]
    pub max_quote_removal_length: usize,
    /// Patterns that veto removal of their enclosing block.
    #[serde(default)]
    pub whitelist_patterns: Vec<String>,
    /// Patterns that force removal even outside obvious noise regions.
    #[serde(default)]
    pub blacklist_patterns: Vec<String>,
    /// Whether to record removed spans (disabling saves memory on huge threads).
    #[serde(default = "default_true")]
    pub track_removed_spans: bool,
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            keep_top_quote_head: false,
            max_top_quote_paragraphs: default_top_quote_paragraphs(),
            max_top_quote_lines: default_top_quote_lines(),
            max_quote_removal_length: default_max_quote_removal_length(),
            whitelist_patterns: Vec::new(),
            blacklist_patterns: Vec::new(),
            track_removed_spans: true,
        }
    }
}

/// LLM gateway tuning (spec §4.7/§6/§6.1).
#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    /// Model identifier sent to the gateway.
    pub model: String,
    /// Gateway base URL.
    pub endpoint: String,
    /// Per-call timeout, in seconds.
    #[serde(default = "default_llm_timeout_s")]
    pub timeout_s: u64,
    /// Hard cap on tokens sent across the whole run.
    #[serde(default = "default_max_tokens_per_run")]
    pub max_tokens_per_run: u64,
    /// Hard cap on estimated cost (USD) across the whole run.
    #[serde(default = "default_cost_limit_per_run")]
    pub cost_limit_per_run: f64,
    /// USD per 1000 tokens, used to project `cost_limit_per_run` spend before each call.
    #[serde(default = "default_usd_per_1k_tokens")]
    pub usd_per_1k_tokens: f64,
    /// Maximum concurrent in-flight gateway calls.
    #[serde(default = "default_max_concurrent_calls")]
    pub max_concurrent_calls: usize,
    /// Prompt/response schema version to use.
    #[serde(default)]
    pub prompt_version: PromptVersion,
}

/// Prompt/schema version (spec §OQ: default `v2`, `v1` is a legacy read path only).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptVersion {
    /// Legacy extract-actions-only schema.
    V1,
    /// Current schema.
    #[default]
    V2,
}

/// Ranker weights and feature sources (spec §4.8/§6/§GLOSSARY).
#[derive(Debug, Clone, Deserialize)]
pub struct RankerConfig {
    /// Master enable/disable switch.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Per-feature weights, summing to 1.0 by default.
    #[serde(default)]
    pub weights: RankerWeights,
    /// Senders considered important, matched exact or as a prefix.
    #[serde(default)]
    pub important_senders: Vec<String>,
    /// Project tags, matched case-insensitively against item text and subject (spec §4.8.1).
    #[serde(default)]
    pub project_tags: Vec<String>,
}

impl Default for RankerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            weights: RankerWeights::default(),
            important_senders: Vec::new(),
            project_tags: Vec::new(),
        }
    }
}

/// The ten ranker feature weights (spec §GLOSSARY defaults).
#[derive(Debug, Clone, Deserialize)]
pub struct RankerWeights {
    /// Weight for `user_in_to`.
    #[serde(default = "w_user_in_to")]
    pub user_in_to: f64,
    /// Weight for `user_in_cc`.
    #[serde(default = "w_user_in_cc")]
    pub user_in_cc: f64,
    /// Weight for `has_action`.
    #[serde(default = "w_has_action")]
    pub has_action: f64,
    /// Weight for `has_mention`.
    #[serde(default = "w_has_mention")]
    pub has_mention: f64,
    /// Weight for `has_due_date`.
    #[serde(default = "w_has_due_date")]
    pub has_due_date: f64,
    /// Weight for `sender_importance`.
    #[serde(default = "w_sender_importance")]
    pub sender_importance: f64,
    /// Weight for `thread_length`.
    #[serde(default = "w_thread_length")]
    pub thread_length: f64,
    /// Weight for `recency`.
    #[serde(default = "w_recency")]
    pub recency: f64,
    /// Weight for `has_attachments`.
    #[serde(default = "w_has_attachments")]
    pub has_attachments: f64,
    /// Weight for `has_project_tag`.
    #[serde(default = "w_has_project_tag")]
    pub has_project_tag: f64,
}

impl Default for RankerWeights {
    fn default() -> Self {
        Self {
            user_in_to: w_user_in_to(),
            user_in_cc: w_user_in_cc(),
            has_action: w_has_action(),
            has_mention: w_has_mention(),
            has_due_date: w_has_due_date(),
            sender_importance: w_sender_importance(),
            thread_length: w_thread_length(),
            recency: w_recency(),
            has_attachments: w_has_attachments(),
            has_project_tag: w_has_project_tag(),
        }
    }
}

/// Timezone and digest window (spec §6).
#[derive(Debug, Clone, Deserialize)]
pub struct TimeConfig {
    /// IANA timezone name the digest date and `due` resolution are computed in.
    #[serde(default = "default_timezone")]
    pub user_timezone: String,
    /// Whether the digest covers a fixed calendar day or a rolling 24h window.
    #[serde(default)]
    pub window: TimeWindow,
}

impl Default for TimeConfig {
    fn default() -> Self {
        Self {
            user_timezone: default_timezone(),
            window: TimeWindow::default(),
        }
    }
}

/// The digest's time window (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeWindow {
    /// Midnight-to-midnight in `user_timezone`.
    #[default]
    CalendarDay,
    /// The trailing 24 hours from run time.
    Rolling24h,
}

/// Citation validation mode (spec §4.6/§6.1).
#[derive(Debug, Clone, Deserialize)]
pub struct CitationsConfig {
    /// `strict` aborts a stage on the first invariant violation; `lax` accumulates and reports.
    #[serde(default)]
    pub mode: CitationMode,
}

impl Default for CitationsConfig {
    fn default() -> Self {
        Self {
            mode: CitationMode::default(),
        }
    }
}

/// See [`CitationsConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CitationMode {
    /// Accumulate invariant violations and report them without aborting.
    #[default]
    Lax,
    /// Abort the stage on the first invariant violation.
    Strict,
}

/// Concurrency tuning (spec §4.9.1/§6.1).
#[derive(Debug, Clone, Deserialize)]
pub struct WorkersConfig {
    /// Size of the bounded pool running C1+C2 per message.
    #[serde(default = "default_normalize_pool_size")]
    pub normalize_pool_size: usize,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            normalize_pool_size: default_normalize_pool_size(),
        }
    }
}

fn default_lookback_hours() -> u32 {
    24
}
fn default_page_size() -> u32 {
    100
}
fn default_top_quote_paragraphs() -> usize {
    2
}
fn default_top_quote_lines() -> usize {
    10
}
fn default_max_quote_removal_length() -> usize {
    10_000
}
fn default_true() -> bool {
    true
}
fn default_llm_timeout_s() -> u64 {
    45
}
fn default_max_tokens_per_run() -> u64 {
    3_000
}
fn default_cost_limit_per_run() -> f64 {
    1.0
}
fn default_usd_per_1k_tokens() -> f64 {
    0.01
}
fn default_max_concurrent_calls() -> usize {
    1
}
fn default_normalize_pool_size() -> usize {
    4
}
fn default_timezone() -> String {
    "UTC".to_owned()
}
fn w_user_in_to() -> f64 {
    0.15
}
fn w_user_in_cc() -> f64 {
    0.05
}
fn w_has_action() -> f64 {
    0.20
}
fn w_has_mention() -> f64 {
    0.10
}
fn w_has_due_date() -> f64 {
    0.15
}
fn w_sender_importance() -> f64 {
    0.10
}
fn w_thread_length() -> f64 {
    0.05
}
fn w_recency() -> f64 {
    0.10
}
fn w_has_attachments() -> f64 {
    0.05
}
fn w_has_project_tag() -> f64 {
    0.05
}

impl Config {
    /// Load configuration from a TOML file, applying `APP_`-prefixed environment overrides
    /// for the handful of secrets-adjacent fields that operators commonly override per-host.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigError`] if the file cannot be read, [`Error::Toml`] if it
    /// cannot be parsed, and [`Error::ConfigError`] again if [`Config::validate`] fails.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::ConfigError(format!("failed to read config at {}: {e}", path.display()))
        })?;
        let mut config: Self = toml::from_str(&contents).map_err(|e| Error::Toml(e.to_string()))?;

        if let Ok(endpoint) = std::env::var("APP_LLM_ENDPOINT") {
            config.llm.endpoint = endpoint;
        }
        if let Ok(model) = std::env::var("APP_LLM_MODEL") {
            config.llm.model = model;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field invariants that `serde` defaults cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigError`] describing the first violation found.
    pub fn validate(&self) -> Result<()> {
        if self.llm.model.trim().is_empty() {
            return Err(Error::ConfigError("llm.model must not be empty".into()));
        }
        if self.llm.endpoint.trim().is_empty() {
            return Err(Error::ConfigError("llm.endpoint must not be empty".into()));
        }
        if self.llm.usd_per_1k_tokens < 0.0 {
            return Err(Error::ConfigError(
                "llm.usd_per_1k_tokens must not be negative".into(),
            ));
        }
        if self.llm.max_concurrent_calls == 0 {
            return Err(Error::ConfigError(
                "llm.max_concurrent_calls must be at least 1".into(),
            ));
        }
        if self.workers.normalize_pool_size == 0 {
            return Err(Error::ConfigError(
                "workers.normalize_pool_size must be at least 1".into(),
            ));
        }
        let weight_sum = {
            let w = &self.ranker.weights;
            w.user_in_to
                + w.user_in_cc
                + w.has_action
                + w.has_mention
                + w.has_due_date
                + w.sender_importance
                + w.thread_length
                + w.recency
                + w.has_attachments
                + w.has_project_tag
        };
        if (weight_sum - 1.0).abs() > 0.05 {
            return Err(Error::ConfigError(format!(
                "ranker weights must sum to ~1.0, got {weight_sum}"
            )));
        }
        for pattern in self
            .email_cleaner
            .whitelist_patterns
            .iter()
            .chain(self.email_cleaner.blacklist_patterns.iter())
        {
            if regex::Regex::new(pattern).is_err() {
                return Err(Error::ConfigError(format!(
                    "invalid cleaner pattern: {pattern}"
                )));
            }
        }
        Ok(())
    }
}
