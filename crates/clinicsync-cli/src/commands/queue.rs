use clinicsync_core::config::SyncSettings;
use clinicsync_core::models::PendingOperation;
use serde::Serialize;

use crate::commands::common::{open_cache, print_json};
use crate::error::CliError;

#[derive(Debug, Serialize)]
struct OperationView<'a> {
    id: i64,
    action: &'a str,
    target: &'a str,
    attempts: u32,
    last_error: Option<&'a str>,
    created_at: &'a str,
    sql: &'a str,
}

impl<'a> From<&'a PendingOperation> for OperationView<'a> {
    fn from(operation: &'a PendingOperation) -> Self {
        Self {
            id: operation.id,
            action: &operation.action,
            target: &operation.target,
            attempts: operation.attempts,
            last_error: operation.last_error.as_deref(),
            created_at: &operation.created_at,
            sql: &operation.body.sql,
        }
    }
}

pub async fn run_queue_status(settings: SyncSettings, json: bool) -> Result<(), CliError> {
    let cache = open_cache(&settings).await?;
    let stats = cache.session().await.queue_stats().await?;

    if json {
        return print_json(&stats);
    }
    println!("Pending: {}", stats.pending);
    println!("Dead letters: {}", stats.dead_letters);
    Ok(())
}

pub async fn run_dead_letters(settings: SyncSettings, json: bool) -> Result<(), CliError> {
    let cache = open_cache(&settings).await?;
    let operations = cache.session().await.dead_letters().await?;

    if json {
        let views: Vec<OperationView<'_>> = operations.iter().map(OperationView::from).collect();
        return print_json(&views);
    }
    if operations.is_empty() {
        println!("No dead-lettered operations");
        return Ok(());
    }
    for operation in &operations {
        println!("{}", format_operation(operation));
    }
    Ok(())
}

pub async fn run_requeue(settings: SyncSettings, id: Option<i64>, all: bool) -> Result<(), CliError> {
    let cache = open_cache(&settings).await?;
    let session = cache.session().await;

    match (id, all) {
        (_, true) => {
            let moved = session.requeue_all().await?;
            println!("Requeued {moved} operation(s)");
        }
        (Some(id), false) => {
            session.requeue(id).await?;
            println!("Requeued operation {id}");
        }
        (None, false) => {
            return Err(CliError::InvalidArgument(
                "Pass an operation id or --all".to_string(),
            ));
        }
    }
    Ok(())
}

pub fn format_operation(operation: &PendingOperation) -> String {
    format!(
        "#{} {} {} (attempts: {}) {}: {}",
        operation.id,
        operation.action,
        operation.target,
        operation.attempts,
        operation.last_error.as_deref().unwrap_or("no error recorded"),
        operation.body.sql,
    )
}
