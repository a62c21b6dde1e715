mod cli;
mod commands;
mod error;

#[cfg(test)]
mod tests;

use clap::Parser;
use clinicsync_core::config::SyncSettings;

use crate::cli::{Cli, Commands, QueueAction, SyncAction};
use crate::commands::cursor::run_cursor;
use crate::commands::query::run_query;
use crate::commands::queue::{run_dead_letters, run_queue_status, run_requeue};
use crate::commands::reconcile::{run_reconcile, ReconcileMode};
use crate::commands::sync::{run_daemon, run_pull, run_push};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("clinicsync_core=info".parse().expect("valid directive"))
                .add_directive("clinicsync_cli=info".parse().expect("valid directive")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut settings = SyncSettings::from_env()?;
    if let Some(path) = cli.cache_path {
        settings.cache_path = Some(path);
    }

    match cli.command {
        Commands::Sync { action } => match action {
            SyncAction::Pull { json } => run_pull(settings, json).await,
            SyncAction::Push { json } => run_push(settings, json).await,
            SyncAction::Run => run_daemon(settings).await,
        },
        Commands::Query {
            sql,
            params,
            fresh,
            json,
        } => run_query(settings, &sql, &params, fresh, json).await,
        Commands::Queue { action } => match action {
            QueueAction::Status { json } => run_queue_status(settings, json).await,
            QueueAction::DeadLetters { json } => run_dead_letters(settings, json).await,
            QueueAction::Requeue { id, all } => run_requeue(settings, id, all).await,
        },
        Commands::Reconcile {
            identities_only,
            dry_run,
            dates_only,
            json,
        } => {
            let mode = ReconcileMode::from_flags(identities_only, dry_run, dates_only);
            run_reconcile(settings, mode, json).await
        }
        Commands::Cursor => run_cursor(settings).await,
    }
}
