//! Operator command line.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::scheduler::PublishPhase;

/// vidrelay: ingest, translate and publish videos on a schedule.
#[derive(Debug, Parser)]
#[command(name = "vidrelay", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Config file (defaults to ./vidrelay.toml).
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    /// Debug-level logging (overridden by RUST_LOG).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Runs both schedulers until interrupted.
    Run,

    /// Queues a unit for ingestion. Submitting an existing reference is a no-op.
    Submit {
        /// External reference (video id or URL).
        source_ref: String,

        #[arg(long)]
        url: Option<String>,

        #[arg(long)]
        title: Option<String>,

        #[arg(long)]
        description: Option<String>,

        /// JSON file with caption cues: [{"text", "offset", "duration", "lang"}].
        #[arg(long)]
        subtitles: Option<PathBuf>,
    },

    /// Lists units, or shows the steps of one unit.
    Status { unit_ref: Option<String> },

    /// Resets one ingest step to pending; the next tick re-runs it.
    Retry { unit_ref: String, step: String },

    /// Publishes one phase now, ignoring cooldowns.
    Publish {
        unit_ref: String,
        #[arg(value_enum)]
        phase: PublishPhase,
    },

    /// Translates an SRT file with the configured provider.
    Translate { input: PathBuf, output: PathBuf },
}
