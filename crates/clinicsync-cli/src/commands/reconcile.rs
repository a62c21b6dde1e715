use clinicsync_core::config::SyncSettings;
use clinicsync_core::reconcile::{DuplicateGroup, ReconcileReport, ReconciliationService};

use crate::commands::common::{open_cache, print_json};
use crate::error::CliError;

/// Which reconciliation passes to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileMode {
    All,
    IdentitiesOnly,
    DatesOnly,
    DryRun,
}

impl ReconcileMode {
    pub const fn from_flags(identities_only: bool, dry_run: bool, dates_only: bool) -> Self {
        if dry_run {
            Self::DryRun
        } else if identities_only {
            Self::IdentitiesOnly
        } else if dates_only {
            Self::DatesOnly
        } else {
            Self::All
        }
    }
}

pub async fn run_reconcile(
    settings: SyncSettings,
    mode: ReconcileMode,
    json: bool,
) -> Result<(), CliError> {
    let schema = std::sync::Arc::new(settings.load_schema()?);
    let cache = open_cache(&settings).await?;
    let service = ReconciliationService::new(cache, schema);

    match mode {
        ReconcileMode::DryRun => {
            let groups = service.duplicate_groups().await?;
            if json {
                return print_json(&groups);
            }
            for line in format_duplicate_groups(&groups) {
                println!("{line}");
            }
            return Ok(());
        }
        ReconcileMode::IdentitiesOnly => {
            let report = service.reconcile_identities().await?;
            if json {
                return print_json(&report);
            }
            println!(
                "Identities: {} renamed, {} merged, {} relocated, {} skipped",
                report.renamed, report.merged, report.relocated, report.skipped
            );
            return Ok(());
        }
        ReconcileMode::DatesOnly => {
            let changed = service.normalize_dates().await?;
            if json {
                return print_json(&serde_json::json!({ "dates_normalized": changed }));
            }
            println!("Normalized {changed} date value(s)");
            return Ok(());
        }
        ReconcileMode::All => {}
    }

    let report = service.run_all().await?;
    if json {
        return print_json(&report);
    }
    for line in format_reconcile_report(&report) {
        println!("{line}");
    }
    Ok(())
}

pub fn format_duplicate_groups(groups: &[DuplicateGroup]) -> Vec<String> {
    if groups.is_empty() {
        return vec!["No duplicate rows found".to_string()];
    }
    groups
        .iter()
        .map(|group| {
            let duplicates: Vec<String> = group.duplicates.iter().map(ToString::to_string).collect();
            format!(
                "{}: keep {} and fold {} (key {})",
                group.table,
                group.master,
                duplicates.join(", "),
                group.key.replace('\u{1f}', " | ")
            )
        })
        .collect()
}

pub fn format_reconcile_report(report: &ReconcileReport) -> Vec<String> {
    let identities = &report.identities;
    let duplicates = &report.duplicates;
    let mut lines = vec![
        format!(
            "Identities: {} renamed, {} merged, {} relocated, {} skipped",
            identities.renamed, identities.merged, identities.relocated, identities.skipped
        ),
        format!(
            "Duplicates: {} groups folded, {} rows removed, {} dates normalized",
            duplicates.groups, duplicates.rows_removed, duplicates.dates_normalized
        ),
    ];
    if duplicates.failures > 0 {
        lines.push(format!(
            "{} duplicate group(s) failed and were left untouched",
            duplicates.failures
        ));
    }
    lines
}
