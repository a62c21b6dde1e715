use clinicsync_core::config::SyncSettings;
use clinicsync_core::scheduler::{CycleOutcome, PullReport, PushReport};

use crate::commands::common::{print_json, SyncContext};
use crate::error::CliError;

pub async fn run_pull(settings: SyncSettings, json: bool) -> Result<(), CliError> {
    let context = SyncContext::connect(&settings).await?;
    let outcome = context.scheduler.pull_once().await?;

    if json {
        return print_json(&outcome);
    }
    match outcome {
        CycleOutcome::Completed(report) => {
            for line in format_pull_report(&report) {
                println!("{line}");
            }
        }
        CycleOutcome::Skipped => println!("A pull is already running"),
    }
    Ok(())
}

pub async fn run_push(settings: SyncSettings, json: bool) -> Result<(), CliError> {
    let context = SyncContext::connect(&settings).await?;
    let outcome = context.scheduler.push_once().await?;

    if json {
        return print_json(&outcome);
    }
    match outcome {
        CycleOutcome::Completed(report) => {
            for line in format_push_report(&report) {
                println!("{line}");
            }
        }
        CycleOutcome::Skipped => println!("A push is already running"),
    }
    Ok(())
}

/// Run the pull and push loops until Ctrl-C.
pub async fn run_daemon(settings: SyncSettings) -> Result<(), CliError> {
    let context = SyncContext::connect(&settings).await?;
    let handle = context.scheduler.spawn();
    tracing::info!("Syncing until interrupted (Ctrl-C to stop)");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Interrupt received, finishing current cycles");
    handle.shutdown().await;

    if let Some(report) = context.scheduler.last_pull().await {
        for line in format_pull_report(&report) {
            println!("Last pull: {line}");
        }
    }
    if let Some(report) = context.scheduler.last_push().await {
        for line in format_push_report(&report) {
            println!("Last push: {line}");
        }
    }
    Ok(())
}

pub fn format_pull_report(report: &PullReport) -> Vec<String> {
    let mut lines = vec![format!(
        "Merged {} rows from {} tables ({} skipped)",
        report.rows_merged, report.tables_merged, report.rows_skipped
    )];
    if report.rows_relocated > 0 {
        lines.push(format!(
            "Moved {} unpushed local rows to new ids",
            report.rows_relocated
        ));
    }
    if !report.tables_failed.is_empty() {
        lines.push(format!("Failed tables: {}", report.tables_failed.join(", ")));
    }
    if !report.global_advanced {
        lines.push("Global cursor unchanged".to_string());
    }
    lines
}

pub fn format_push_report(report: &PushReport) -> Vec<String> {
    let mut lines = vec![format!(
        "Pushed {}, failed {}, dead-lettered {}, {} still pending",
        report.pushed, report.failed, report.dead_lettered, report.remaining
    )];
    if report.deferred > 0 {
        lines.push(format!(
            "Held back {} operations behind earlier failures",
            report.deferred
        ));
    }
    if report.unrecorded > 0 {
        lines.push(format!(
            "{} applied operations still need local bookkeeping",
            report.unrecorded
        ));
    }
    if report.budget_exhausted {
        lines.push("Stopped early: push time budget exhausted".to_string());
    }
    if report.mappings_captured > 0 {
        lines.push(format!("Captured {} id mappings", report.mappings_captured));
    }
    if let Some(identities) = &report.reconciliation {
        lines.push(format!(
            "Reconciled ids: {} renamed, {} merged, {} relocated, {} skipped",
            identities.renamed, identities.merged, identities.relocated, identities.skipped
        ));
    }
    lines
}
