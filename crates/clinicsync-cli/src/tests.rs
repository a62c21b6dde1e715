use std::path::PathBuf;

use clap::Parser;
use clinicsync_core::config::SyncSettings;
use clinicsync_core::models::{CapturedStatement, Statement};
use clinicsync_core::reconcile::{DuplicateGroup, IdentityReport};
use clinicsync_core::scheduler::{PullReport, PushReport};
use clinicsync_core::{Row, SqlValue};
use pretty_assertions::assert_eq;

use crate::cli::{Cli, Commands, QueueAction, SyncAction};
use crate::commands::common::{format_rows, open_cache, parse_param, resolve_cache_path};
use crate::commands::queue::run_requeue;
use crate::commands::reconcile::{format_duplicate_groups, run_reconcile, ReconcileMode};
use crate::commands::sync::{format_pull_report, format_push_report};
use crate::error::CliError;

fn settings_with_cache(path: PathBuf) -> SyncSettings {
    SyncSettings {
        cache_path: Some(path),
        ..SyncSettings::default()
    }
}

#[test]
fn params_are_typed_from_their_text() {
    assert_eq!(parse_param("42"), SqlValue::Integer(42));
    assert_eq!(parse_param("-7"), SqlValue::Integer(-7));
    assert_eq!(parse_param("12.5"), SqlValue::Real(12.5));
    assert_eq!(parse_param("NULL"), SqlValue::Null);
    assert_eq!(parse_param("Asha"), SqlValue::Text("Asha".to_string()));
    assert_eq!(parse_param("'42'"), SqlValue::Text("42".to_string()));
    assert_eq!(parse_param("inf"), SqlValue::Text("inf".to_string()));
}

#[test]
fn rows_render_as_tab_separated_lines() {
    let rows = vec![
        Row::new().with("id", 1).with("name", "Asha"),
        Row::new().with("id", 2),
    ];
    assert_eq!(
        format_rows(&rows),
        vec!["id\tname".to_string(), "1\tAsha".to_string(), "2\t".to_string()]
    );
    assert_eq!(format_rows(&[]), vec!["(no rows)".to_string()]);
}

#[test]
fn explicit_cache_path_wins() {
    let settings = settings_with_cache(PathBuf::from("/tmp/clinic/cache.db"));
    assert_eq!(
        resolve_cache_path(&settings).unwrap(),
        PathBuf::from("/tmp/clinic/cache.db")
    );
}

#[test]
fn cli_parses_nested_subcommands() {
    let cli = Cli::try_parse_from(["clinicsync", "--cache-path", "c.db", "sync", "push", "--json"])
        .unwrap();
    assert_eq!(cli.cache_path, Some(PathBuf::from("c.db")));
    assert!(matches!(
        cli.command,
        Commands::Sync {
            action: SyncAction::Push { json: true }
        }
    ));

    let cli = Cli::try_parse_from(["clinicsync", "queue", "requeue", "--all"]).unwrap();
    assert!(matches!(
        cli.command,
        Commands::Queue {
            action: QueueAction::Requeue { id: None, all: true }
        }
    ));

    assert!(Cli::try_parse_from(["clinicsync", "queue", "requeue"]).is_err());
    assert!(Cli::try_parse_from(["clinicsync", "reconcile", "--dry-run", "--identities-only"]).is_err());
    assert!(Cli::try_parse_from(["clinicsync", "reconcile", "--dates-only", "--dry-run"]).is_err());

    let cli = Cli::try_parse_from(["clinicsync", "reconcile", "--dates-only"]).unwrap();
    let Commands::Reconcile {
        identities_only,
        dry_run,
        dates_only,
        ..
    } = cli.command
    else {
        panic!("expected reconcile");
    };
    assert_eq!(
        ReconcileMode::from_flags(identities_only, dry_run, dates_only),
        ReconcileMode::DatesOnly
    );
}

#[test]
fn cycle_reports_summarize_outcomes() {
    let pull = PullReport {
        tables_merged: 3,
        tables_failed: vec!["payments".to_string()],
        rows_merged: 12,
        rows_skipped: 1,
        rows_relocated: 0,
        global_advanced: false,
    };
    assert_eq!(
        format_pull_report(&pull),
        vec![
            "Merged 12 rows from 3 tables (1 skipped)".to_string(),
            "Failed tables: payments".to_string(),
            "Global cursor unchanged".to_string(),
        ]
    );

    let push = PushReport {
        pushed: 2,
        remaining: 1,
        mappings_captured: 1,
        reconciliation: Some(IdentityReport {
            renamed: 1,
            ..IdentityReport::default()
        }),
        ..PushReport::default()
    };
    assert_eq!(
        format_push_report(&push),
        vec![
            "Pushed 2, failed 0, dead-lettered 0, 1 still pending".to_string(),
            "Captured 1 id mappings".to_string(),
            "Reconciled ids: 1 renamed, 0 merged, 0 relocated, 0 skipped".to_string(),
        ]
    );
}

#[test]
fn duplicate_groups_print_their_readable_key() {
    let groups = vec![DuplicateGroup {
        table: "registrations".to_string(),
        key: "asha\u{1f}2024-05-01".to_string(),
        master: 10,
        duplicates: vec![14, 15],
    }];
    assert_eq!(
        format_duplicate_groups(&groups),
        vec!["registrations: keep 10 and fold 14, 15 (key asha | 2024-05-01)".to_string()]
    );
    assert_eq!(
        format_duplicate_groups(&[]),
        vec!["No duplicate rows found".to_string()]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn requeue_moves_dead_letters_back_to_pending() {
    let temp_dir = tempfile::tempdir().unwrap();
    let settings = settings_with_cache(temp_dir.path().join("nested").join("cache.db"));

    let cache = open_cache(&settings).await.unwrap();
    let id = {
        let session = cache.session().await;
        let statement = Statement::new("UPDATE patients SET name = ? WHERE patient_id = ?")
            .bind("Asha")
            .bind(1);
        let id = session
            .enqueue("update", "patients", &CapturedStatement::new(&statement, None))
            .await
            .unwrap();
        session
            .record_failure(id, 5, "rejected", true)
            .await
            .unwrap();
        id
    };

    let missing = run_requeue(settings.clone(), Some(id + 100), false).await;
    assert!(matches!(missing, Err(CliError::Core(_))));

    run_requeue(settings.clone(), Some(id), false).await.unwrap();
    let stats = cache.session().await.queue_stats().await.unwrap();
    assert_eq!((stats.pending, stats.dead_letters), (1, 0));
}

#[tokio::test(flavor = "multi_thread")]
async fn dates_only_reconcile_rewrites_attendance_dates() {
    let temp_dir = tempfile::tempdir().unwrap();
    let settings = settings_with_cache(temp_dir.path().join("cache.db"));

    let cache = open_cache(&settings).await.unwrap();
    for sql in [
        "INSERT INTO attendance (attendance_id, patient_id, attendance_date) VALUES (1, 9, '1714550400')",
        "INSERT INTO attendance (attendance_id, patient_id, attendance_date) VALUES (2, 9, '1714550400')",
    ] {
        cache.execute(&Statement::new(sql)).await.unwrap();
    }

    run_reconcile(settings.clone(), ReconcileMode::DatesOnly, false)
        .await
        .unwrap();

    let rows = cache
        .query(
            "SELECT attendance_date FROM attendance ORDER BY attendance_id",
            Vec::new(),
        )
        .await
        .unwrap();
    assert_eq!(
        rows,
        vec![
            Row::new().with("attendance_date", "2024-05-01"),
            Row::new().with("attendance_date", "2024-05-01"),
        ]
    );
}
