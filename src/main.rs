#![allow(missing_docs)]

//! `inbox-digest` — corporate-inbox daily digest pipeline.
//!
//! Single binary with two subcommands: `run` builds one digest for a
//! mailbox user/date, `status` inspects persisted run state without
//! mutating it.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};

use inbox_digest::cli::{Cli, Command};
use inbox_digest::config::{CitationMode, Config};
use inbox_digest::credentials::load_credentials;
use inbox_digest::gateway::client::{GatewayClient, HttpGatewayTransport};
use inbox_digest::gateway::redactor::Redactor;
use inbox_digest::metrics::Metrics;
use inbox_digest::run::{self, RunController, RunOutcome, RunRequest};
use inbox_digest::types::{Message, RunKey};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            credentials,
            messages,
            user_id,
            digest_date,
            user_aliases,
            force,
            strict,
        } => {
            handle_run(
                config,
                credentials,
                messages,
                user_id,
                digest_date,
                user_aliases,
                force,
                strict,
            )
            .await
        }
        Command::Status {
            config,
            user_id,
            digest_date,
        } => handle_status(config, user_id, digest_date),
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_run(
    config_path: std::path::PathBuf,
    credentials_path: std::path::PathBuf,
    messages_path: std::path::PathBuf,
    user_id: String,
    digest_date: chrono::NaiveDate,
    user_aliases: Vec<String>,
    force: bool,
    strict: bool,
) -> Result<()> {
    let mut config = Config::load(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    if strict {
        config.citations.mode = CitationMode::Strict;
    }

    let _logging_guard = inbox_digest::logging::init_production(&config.state_dir.join("logs"))
        .context("failed to initialize logging")?;

    let credentials = load_credentials(&credentials_path)
        .with_context(|| format!("failed to load {}", credentials_path.display()))?;
    let bearer_token = credentials
        .require("LLM_BEARER_TOKEN")
        .context("LLM gateway bearer token not configured")?;
    let redactor = Redactor::new(credentials.known_secrets());

    let transport = HttpGatewayTransport::new(
        config.llm.endpoint.clone(),
        bearer_token,
        config.llm.timeout_s,
        redactor.clone(),
    )
    .context("failed to construct LLM gateway transport")?;
    let client = GatewayClient::new(transport, config.llm.clone(), redactor);

    let raw_messages = std::fs::read_to_string(&messages_path)
        .with_context(|| format!("failed to read {}", messages_path.display()))?;
    let messages: Vec<Message> = serde_json::from_str(&raw_messages)
        .with_context(|| format!("failed to parse messages from {}", messages_path.display()))?;

    let metrics = Metrics::default();
    let controller = RunController::new(config, client, metrics);

    let trace_id = uuid::Uuid::new_v4().to_string();
    let request = RunRequest {
        run_key: RunKey { user_id, digest_date },
        user_aliases,
        force,
        trace_id,
    };

    let (cancel_tx, cancel_rx) = watch::channel(false);
    let ctrl_c = tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = cancel_tx.send(true);
    });

    let outcome = controller.run(request, messages, cancel_rx).await;
    ctrl_c.abort();

    match outcome {
        Ok(RunOutcome::Skipped { finished_at }) => {
            info!(%finished_at, "run already completed within the rebuild window, skipping");
            Ok(())
        }
        Ok(RunOutcome::Completed { artifacts, violations }) => {
            info!(
                json_path = %artifacts.json_path.display(),
                markdown_path = %artifacts.markdown_path.display(),
                violation_count = violations.len(),
                "digest build complete"
            );
            if strict && !violations.is_empty() {
                error!(violation_count = violations.len(), "citation validation failed under --strict");
                std::process::exit(2);
            }
            Ok(())
        }
        Err(err) => {
            error!(error = %err, "digest build failed");
            Err(err.into())
        }
    }
}

fn handle_status(config_path: std::path::PathBuf, user_id: String, digest_date: chrono::NaiveDate) -> Result<()> {
    inbox_digest::logging::init_cli();

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    let run_key = RunKey { user_id: user_id.clone(), digest_date };

    match run::state::load_record(&config.state_dir, &run_key) {
        Some(record) => {
            info!(
                finished_at = %record.finished_at,
                trace_id = %record.trace_id,
                artifacts = ?record.artifact_paths,
                "run record found"
            );
        }
        None => info!(run_key = %run_key, "no run record found"),
    }

    match run::watermark::load(&config.state_dir, &user_id) {
        Some(watermark) => info!(
            token = ?watermark.token,
            last_full_sweep = %watermark.last_full_sweep,
            "watermark found"
        ),
        None => info!(user_id, "no watermark found (next run will do a full sweep)"),
    }

    let now = Utc::now();
    info!(checked_at = %now, "status check complete");
    Ok(())
}
