//! CLI argument parsing: `run` and `status` subcommands (spec §1.1/§2).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Builds a ranked, cited daily digest from a corporate mailbox.
#[derive(Parser)]
#[command(name = "inbox-digest", version, about)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
pub enum Command {
    /// Build one digest for a mailbox user/date.
    Run {
        /// Path to the TOML run configuration.
        #[arg(long, default_value = "config.toml")]
        config: PathBuf,
        /// Path to the `.env`-style credentials file.
        #[arg(long, default_value = ".env")]
        credentials: PathBuf,
        /// Path to the JSON file holding the fetched `Vec<Message>` for this run.
        ///
        /// The mailbox fetcher itself is out of scope for this binary; this
        /// flag is the seam an operator's fetch step hands its output to.
        #[arg(long)]
        messages: PathBuf,
        /// Mailbox owner this digest is for.
        #[arg(long)]
        user_id: String,
        /// Calendar date (in `time.user_timezone`) this digest covers, `YYYY-MM-DD`.
        #[arg(long)]
        digest_date: chrono::NaiveDate,
        /// Aliases identifying the mailbox owner in message text (repeatable).
        #[arg(long = "alias")]
        user_aliases: Vec<String>,
        /// Rebuild even if a fresh run record already exists within the rebuild window.
        #[arg(long)]
        force: bool,
        /// Override `citations.mode` to `strict` for this run regardless of config.
        #[arg(long)]
        strict: bool,
    },
    /// Inspect persisted run state for a mailbox user/date without mutating it.
    Status {
        /// Path to the TOML run configuration.
        #[arg(long, default_value = "config.toml")]
        config: PathBuf,
        /// Mailbox owner to inspect.
        #[arg(long)]
        user_id: String,
        /// Calendar date to inspect, `YYYY-MM-DD`.
        #[arg(long)]
        digest_date: chrono::NaiveDate,
    },
}
