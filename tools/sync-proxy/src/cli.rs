use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::output::OutputFormat;

/// Run the offline write-sync worker as a local HTTP proxy, or inspect its queue.
#[derive(Parser, Debug)]
#[command(name = "sync-proxy", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Path to the TOML configuration file.
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    /// Output format for all subcommands.
    #[arg(long, value_enum, default_value = "human", global = true)]
    pub output: OutputFormat,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Install the worker and proxy requests until interrupted.
    Serve(ServeArgs),

    /// Show queue and dead-letter counts.
    Status,

    /// List queued writes waiting for replay.
    Pending(PendingArgs),

    /// List writes that failed permanently.
    DeadLetters,

    /// Replay the queue once and exit.
    Drain(DrainArgs),
}

// ── serve ────────────────────────────────────────────────────────────

#[derive(clap::Args, Debug)]
pub struct ServeArgs {
    /// Listen address (overrides `proxy.listen`).
    #[arg(long)]
    pub listen: Option<String>,

    /// Request handler threads (overrides `proxy.workers`).
    #[arg(long)]
    pub workers: Option<usize>,

    /// Stop after this many requests.
    #[arg(long)]
    pub max_requests: Option<usize>,
}

// ── pending ──────────────────────────────────────────────────────────

#[derive(clap::Args, Debug)]
pub struct PendingArgs {
    /// Order by retry count instead of enqueue time.
    #[arg(long)]
    pub by_retries: bool,
}

// ── drain ────────────────────────────────────────────────────────────

#[derive(clap::Args, Debug)]
pub struct DrainArgs {
    /// Exit with status 1 when the drain dead-letters anything.
    #[arg(long)]
    pub strict: bool,
}
