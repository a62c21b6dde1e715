use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "clinicsync")]
#[command(about = "Offline-first sync for the clinic database", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to the local cache database (overrides CLINICSYNC_CACHE_PATH)
    #[arg(long, global = true, value_name = "PATH")]
    pub cache_path: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run sync cycles against the remote store
    Sync {
        #[command(subcommand)]
        action: SyncAction,
    },
    /// Run a statement through the query router
    Query {
        /// SQL text with `?` placeholders
        sql: String,
        /// Positional parameter; integers, reals and `null` are detected
        #[arg(short = 'p', long = "param", value_name = "VALUE")]
        params: Vec<String>,
        /// Read from the remote store instead of the cache
        #[arg(long)]
        fresh: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Inspect and repair the pending-operation queue
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },
    /// Merge provisional ids and duplicate rows in the cache
    Reconcile {
        /// Only fold provisional ids into their remote ids
        #[arg(long)]
        identities_only: bool,
        /// List duplicate groups without changing anything
        #[arg(long, conflicts_with = "identities_only")]
        dry_run: bool,
        /// Only rewrite natural-key date columns to `YYYY-MM-DD`
        #[arg(long, conflicts_with_all = ["identities_only", "dry_run"])]
        dates_only: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the stored sync cursor
    Cursor,
}

#[derive(Debug, Subcommand)]
pub enum SyncAction {
    /// Merge remote changes into the cache once
    Pull {
        #[arg(long)]
        json: bool,
    },
    /// Replay queued writes once
    Push {
        #[arg(long)]
        json: bool,
    },
    /// Keep pulling and pushing until interrupted
    Run,
}

#[derive(Debug, Subcommand)]
pub enum QueueAction {
    /// Show queue depth
    Status {
        #[arg(long)]
        json: bool,
    },
    /// List dead-lettered operations
    DeadLetters {
        #[arg(long)]
        json: bool,
    },
    /// Move dead-lettered operations back to pending
    Requeue {
        /// Operation id
        #[arg(required_unless_present = "all")]
        id: Option<i64>,
        /// Requeue every dead-lettered operation
        #[arg(long, conflicts_with = "id")]
        all: bool,
    },
}
