//! Run Controller (C9): idempotency, watermark, and state machine (spec §4.9).
//!
//! Owns the one `tokio::sync::watch<bool>` cancellation signal for a run and
//! wraps [`crate::pipeline::run`], which does the actual C1-C10 work. This
//! module's job is bookkeeping around that call: deciding whether a run is
//! needed at all, which messages it should see, and what to persist when it
//! finishes.

pub mod state;
pub mod watermark;

use chrono::{Duration, Utc};
use tokio::sync::watch;
use tracing::{error, info};

use crate::assembler;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::gateway::client::GatewayClient;
use crate::gateway::GatewayTransport;
use crate::metrics::Metrics;
use crate::pipeline::{self, PipelineError};
use crate::types::{Message, RunKey, RunRecord, RunState, Watermark};

/// Inputs an operator supplies for one digest build, distinct from what the
/// controller derives on its own (watermark, idempotency record).
pub struct RunRequest {
    /// The idempotency key for this run.
    pub run_key: RunKey,
    /// Aliases identifying the mailbox owner in message text (name, handle, email local-part).
    pub user_aliases: Vec<String>,
    /// Rebuild even if a fresh run record already exists.
    pub force: bool,
    /// Correlates every log line and gateway call made while building this run's digest.
    pub trace_id: String,
}

/// The outcome of [`RunController::run`].
pub enum RunOutcome {
    /// A fresh run record already existed within the rebuild window; nothing was done.
    Skipped {
        /// When the existing run completed.
        finished_at: chrono::DateTime<Utc>,
    },
    /// The run completed and artifacts were written.
    Completed {
        /// Paths of the written artifacts.
        artifacts: assembler::ArtifactPaths,
        /// Citation invariant violations found along the way (non-fatal in lax mode).
        violations: Vec<crate::citation::CitationViolation>,
    },
}

/// Orchestrates one [`RunRequest`] through the full state machine, owning
/// the watermark and idempotency record around a [`pipeline::run`] call.
pub struct RunController<T: GatewayTransport> {
    config: Config,
    llm_client: GatewayClient<T>,
    metrics: Metrics,
}

impl<T: GatewayTransport> RunController<T> {
    /// Build a controller for `config`, calling the gateway through `llm_client`.
    #[must_use]
    pub fn new(config: Config, llm_client: GatewayClient<T>, metrics: Metrics) -> Self {
        Self {
            config,
            llm_client,
            metrics,
        }
    }

    /// Run one digest build for `request` over `messages` already fetched by
    /// the (out-of-scope) mailbox fetcher for the window since the last
    /// watermark (spec §4.9 "otherwise: load watermark; ingest messages
    /// since watermark").
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] if `cancel` fires before the run
    /// completes, or the mapped component error on a fatal stage failure.
    /// Neither case advances the watermark or writes artifacts.
    pub async fn run(
        &self,
        request: RunRequest,
        messages: Vec<Message>,
        cancel: watch::Receiver<bool>,
    ) -> Result<RunOutcome> {
        let now = Utc::now();

        if !state::should_skip(&self.config.state_dir, &request.run_key, now, request.force) {
            info!(run_key = %request.run_key, "no fresh run record, proceeding");
        } else if let Some(record) = state::load_record(&self.config.state_dir, &request.run_key) {
            return Ok(RunOutcome::Skipped {
                finished_at: record.finished_at,
            });
        }

        let mut current_state = RunState::Idle;
        current_state = state::transition(&current_state, RunState::Fetching);

        let watermark = watermark::load(&self.config.state_dir, &request.run_key.user_id)
            .unwrap_or_else(watermark::initial);
        let full_sweep_due = now.signed_duration_since(watermark.last_full_sweep)
            > Duration::hours(i64::try_from(self.config.ews.lookback_hours).unwrap_or(24).saturating_mul(3));

        current_state = state::transition(&current_state, RunState::Normalizing);

        // The mailbox fetcher is out of scope here, but its cursor only ever
        // needs to move past messages this run actually saw; an empty batch
        // (nothing new since the last watermark) leaves it untouched rather
        // than rewinding it to `None`.
        let advanced_token = messages.iter().map(|m| m.received_at).max().map(|t| t.to_rfc3339());

        let result = pipeline::run(
            messages,
            &self.config,
            &request.user_aliases,
            Some(&self.llm_client),
            request.trace_id.clone(),
            &self.metrics,
            cancel,
        )
        .await;

        let output = match result {
            Ok(output) => output,
            Err(PipelineError::Cancelled) => {
                self.metrics.incr_runs("cancelled");
                return Err(Error::Cancelled);
            }
            Err(PipelineError::Stage { stage, source }) => {
                let failed_state = state::failed(&stage, &source);
                error!(run_key = %request.run_key, stage = %stage, error = %source, "run failed");
                let _ = state::transition(&current_state, failed_state);
                self.metrics.incr_runs("failed");
                return Err(source);
            }
        };

        current_state = state::transition(&current_state, RunState::Citing);
        current_state = state::transition(&current_state, RunState::Ranking);
        current_state = state::transition(&current_state, RunState::Assembling);

        let artifacts = assembler::write_artifacts(
            &output.digest,
            &self.config.output_dir,
            &request.run_key.user_id,
        )?;

        let record = RunRecord {
            run_key: request.run_key.clone(),
            finished_at: now,
            artifact_paths: vec![
                artifacts.json_path.display().to_string(),
                artifacts.markdown_path.display().to_string(),
            ],
            trace_id: request.trace_id,
        };
        state::store_record(&self.config.state_dir, &record)?;

        let new_watermark = Watermark {
            token: advanced_token.or(watermark.token),
            last_full_sweep: if full_sweep_due { now } else { watermark.last_full_sweep },
        };
        watermark::store(&self.config.state_dir, &request.run_key.user_id, &new_watermark)?;

        let _ = state::transition(&current_state, RunState::Done);
        self.metrics.incr_runs("ok");

        for violation in &output.violations {
            self.metrics.incr_citation_validation_failures(&violation.reason);
        }

        Ok(RunOutcome::Completed {
            artifacts,
            violations: output.violations,
        })
    }
}
