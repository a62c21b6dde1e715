mod common;

use std::time::Duration;

use clinicsync_core::models::{Row, SqlValue, Statement, SyncCursor, SyncSchema};
use clinicsync_core::remote::RetryPolicy;
use clinicsync_core::scheduler::{CycleOutcome, SchedulerConfig};
use common::{Harness, Mode};
use pretty_assertions::assert_eq;

fn count(rows: &[Row]) -> i64 {
    rows[0].get("n").and_then(SqlValue::as_i64).unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn offline_writes_drain_once_the_remote_returns() {
    let harness = Harness::new().await;
    harness.remote.set_mode(Mode::Offline);

    for name in ["Main", "East", "West"] {
        harness
            .write(
                Statement::new("INSERT INTO branches (name, updated_at) VALUES (?, '2024-05-01 09:00:00')")
                    .bind(name),
            )
            .await;
    }

    let offline = harness.scheduler.push_once().await.unwrap().completed().unwrap();
    assert_eq!(offline.pushed, 0);
    assert_eq!(offline.failed, 1);
    assert_eq!(offline.remaining, 3);

    harness.remote.set_mode(Mode::Online);
    let online = harness.scheduler.push_once().await.unwrap().completed().unwrap();
    assert_eq!(online.pushed, 3);
    assert_eq!(online.remaining, 0);

    let remote = harness.remote.rows("SELECT name FROM branches ORDER BY branch_id").await;
    assert_eq!(
        remote,
        vec![
            Row::new().with("name", "Main"),
            Row::new().with("name", "East"),
            Row::new().with("name", "West"),
        ]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn pulling_the_same_rows_twice_changes_nothing() {
    let harness = Harness::new().await;
    harness
        .remote
        .seed(
            "INSERT INTO patients (patient_id, registration_id, patient_name, updated_at) VALUES
             (1, 10, 'Asha', '2024-05-01 10:00:00'),
             (2, 11, 'Ravi', '2024-05-01 11:00:00')",
        )
        .await;

    harness.scheduler.pull_once().await.unwrap();
    let first = harness.local_rows("SELECT * FROM patients ORDER BY patient_id").await;

    // Forget the cursor so the same batch is merged again.
    {
        let session = harness.cache.session().await;
        session.save_cursor(&SyncCursor::default()).await.unwrap();
    }
    let again = harness.scheduler.pull_once().await.unwrap().completed().unwrap();
    assert_eq!(again.rows_merged, 2);

    let second = harness.local_rows("SELECT * FROM patients ORDER BY patient_id").await;
    assert_eq!(first, second);
    assert_eq!(first.len(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn offline_insert_is_renamed_to_its_remote_id() {
    let harness = Harness::new().await;
    harness
        .remote
        .seed("INSERT INTO registrations (registration_id, patient_name) VALUES (86, 'Earlier')")
        .await;
    harness
        .cache
        .execute(&Statement::new(
            "INSERT INTO registrations (registration_id, patient_name) VALUES (500, 'Stale')",
        ))
        .await
        .unwrap();

    harness.remote.set_mode(Mode::Offline);
    let inserted = harness
        .router
        .execute(
            &Statement::new("INSERT INTO registrations (patient_name, phone_number) VALUES (?, ?)")
                .bind("Meera")
                .bind("555-0142"),
        )
        .await
        .unwrap();
    assert_eq!(inserted.mutation().unwrap().last_insert_id, Some(501));

    harness
        .write(
            Statement::new("INSERT INTO patients (registration_id, patient_name) VALUES (?, ?)")
                .bind(501)
                .bind("Meera"),
        )
        .await;

    harness.remote.set_mode(Mode::Online);
    let report = harness.scheduler.push_once().await.unwrap().completed().unwrap();
    assert_eq!(report.pushed, 2);
    assert_eq!(report.reconciliation.unwrap().renamed, 1);

    let remote_child = harness
        .remote
        .rows("SELECT registration_id FROM patients WHERE patient_name = 'Meera'")
        .await;
    assert_eq!(remote_child, vec![Row::new().with("registration_id", 87)]);

    let local_child = harness
        .local_rows("SELECT registration_id FROM patients WHERE patient_name = 'Meera'")
        .await;
    assert_eq!(local_child, vec![Row::new().with("registration_id", 87)]);

    let local_parent = harness
        .local_rows("SELECT registration_id FROM registrations WHERE patient_name = 'Meera'")
        .await;
    assert_eq!(local_parent, vec![Row::new().with("registration_id", 87)]);

    // No child points at a parent that is not cached.
    let orphans = harness
        .local_rows(
            "SELECT COUNT(*) AS n FROM patients
             WHERE registration_id NOT IN (SELECT registration_id FROM registrations)",
        )
        .await;
    assert_eq!(count(&orphans), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn extra_remote_columns_are_dropped_when_mirroring() {
    let harness = Harness::new().await;
    harness.remote.seed("ALTER TABLE branches ADD COLUMN region TEXT").await;
    harness
        .remote
        .seed(
            "INSERT INTO branches (branch_id, name, region, updated_at)
             VALUES (3, 'North', 'Hills', '2024-05-01 09:00:00')",
        )
        .await;

    let report = harness.scheduler.pull_once().await.unwrap().completed().unwrap();
    assert!(report.tables_failed.is_empty());
    assert_eq!(report.rows_merged, 1);

    let rows = harness.local_rows("SELECT branch_id, name FROM branches").await;
    assert_eq!(rows, vec![Row::new().with("branch_id", 3).with("name", "North")]);
}

#[tokio::test(flavor = "multi_thread")]
async fn projections_without_the_primary_key_are_not_cached() {
    let harness = Harness::new().await;
    harness
        .remote
        .seed("INSERT INTO branches (branch_id, name) VALUES (1, 'Main')")
        .await;

    let outcome = harness
        .router
        .execute_fresh(&Statement::new("SELECT name FROM branches"))
        .await
        .unwrap();
    assert_eq!(outcome.rows(), &[Row::new().with("name", "Main")]);

    let cached = harness.local_rows("SELECT COUNT(*) AS n FROM branches").await;
    assert_eq!(count(&cached), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_registrations_converge_on_the_lowest_id() {
    let harness = Harness::new().await;
    harness
        .remote
        .seed(
            "INSERT INTO registrations (registration_id, patient_name, phone_number, total_amount, updated_at) VALUES
             (10, 'Asha Rao', '555-0101', 400, '2024-05-01 09:00:00'),
             (14, 'asha rao', '555-0101', 400, '2024-05-01 09:30:00')",
        )
        .await;
    harness
        .remote
        .seed(
            "INSERT INTO payments (payment_id, registration_id, amount, created_at) VALUES
             (1, 10, 150, '2024-05-01 09:05:00'),
             (2, 14, 250, '2024-05-01 09:35:00')",
        )
        .await;
    harness.scheduler.pull_once().await.unwrap();

    let service = clinicsync_core::reconcile::ReconciliationService::new(
        harness.cache.clone(),
        std::sync::Arc::new(clinicsync_core::models::SyncSchema::clinic()),
    );
    let report = service.run_all().await.unwrap();
    assert_eq!(report.duplicates.rows_removed, 1);

    let registrations = harness
        .local_rows("SELECT registration_id, paid_amount, status FROM registrations")
        .await;
    assert_eq!(
        registrations,
        vec![Row::new()
            .with("registration_id", 10)
            .with("paid_amount", 400.0)
            .with("status", "paid")]
    );
    let payments = harness
        .local_rows("SELECT payment_id, registration_id FROM payments ORDER BY payment_id")
        .await;
    assert_eq!(
        payments,
        vec![
            Row::new().with("payment_id", 1).with("registration_id", 10),
            Row::new().with("payment_id", 2).with("registration_id", 10),
        ]
    );

    let rerun = service.run_all().await.unwrap();
    assert_eq!(rerun.duplicates.rows_removed, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn rejected_operations_are_dead_lettered_at_the_ceiling() {
    let config = SchedulerConfig {
        queue_retry: RetryPolicy::queue(2),
        ..SchedulerConfig::default()
    };
    let harness = Harness::with(config, Duration::ZERO).await;
    harness
        .write(Statement::new("UPDATE patients SET diagnosis = 'flu' WHERE patient_id = 4"))
        .await;
    harness.remote.set_mode(Mode::Rejecting);

    let first = harness.scheduler.push_once().await.unwrap().completed().unwrap();
    assert_eq!((first.failed, first.dead_lettered), (1, 0));
    let second = harness.scheduler.push_once().await.unwrap().completed().unwrap();
    assert_eq!((second.failed, second.dead_lettered), (0, 1));

    harness.remote.set_mode(Mode::Online);
    let third = harness.scheduler.push_once().await.unwrap().completed().unwrap();
    assert_eq!(third.pushed, 0);
    assert_eq!(third.remaining, 0);

    let session = harness.cache.session().await;
    let dead = session.dead_letters().await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].attempts, 2);
    assert!(dead[0].last_error.as_deref().unwrap().contains("constraint failed"));
}

#[tokio::test(flavor = "multi_thread")]
async fn validation_failures_skip_the_retry_budget() {
    let harness = Harness::new().await;
    harness
        .write(Statement::new("DELETE FROM inquiries WHERE inquiry_id = 2"))
        .await;
    harness
        .write(Statement::new("DELETE FROM inquiries WHERE inquiry_id = 3"))
        .await;
    harness.remote.set_mode(Mode::Invalid);

    let report = harness.scheduler.push_once().await.unwrap().completed().unwrap();
    assert_eq!(report.dead_lettered, 2);
    assert_eq!(report.remaining, 0);

    // A dead letter goes back in line only when requeued by hand.
    harness.remote.set_mode(Mode::Online);
    let requeued = harness.cache.session().await.requeue_all().await.unwrap();
    assert_eq!(requeued, 2);
    let drained = harness.scheduler.push_once().await.unwrap().completed().unwrap();
    assert_eq!(drained.pushed, 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn only_one_cycle_of_each_kind_runs_at_a_time() {
    let harness = Harness::with(SchedulerConfig::default(), Duration::from_millis(50)).await;
    let scheduler = harness.scheduler.clone();

    let (first, second) = tokio::join!(scheduler.pull_once(), scheduler.pull_once());
    let outcomes = [first.unwrap(), second.unwrap()];
    assert_eq!(
        outcomes
            .iter()
            .filter(|outcome| **outcome == CycleOutcome::Skipped)
            .count(),
        1
    );

    let (pull, push) = tokio::join!(scheduler.pull_once(), scheduler.push_once());
    assert!(matches!(pull.unwrap(), CycleOutcome::Completed(_)));
    assert!(matches!(push.unwrap(), CycleOutcome::Completed(_)));

    harness
        .write(Statement::new("INSERT INTO inquiries (name) VALUES ('walk-in')"))
        .await;
    let (first, second) = tokio::join!(scheduler.push_once(), scheduler.push_once());
    let skipped = [first.unwrap(), second.unwrap()]
        .into_iter()
        .filter(|outcome| *outcome == CycleOutcome::Skipped)
        .count();
    assert_eq!(skipped, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn a_failing_operation_does_not_hold_back_independent_ones() {
    let harness = Harness::new().await;
    harness
        .write(Statement::new("DELETE FROM inquiries WHERE inquiry_id = 2"))
        .await;
    harness
        .write(Statement::new(
            "INSERT INTO branches (name, updated_at) VALUES ('Main', '2024-05-01 09:00:00')",
        ))
        .await;
    harness.remote.seed("DROP TABLE inquiries").await;

    let report = harness.scheduler.push_once().await.unwrap().completed().unwrap();
    assert_eq!((report.pushed, report.failed, report.deferred), (1, 1, 0));
    assert_eq!(report.remaining, 1);

    let remote = harness.remote.rows("SELECT name FROM branches").await;
    assert_eq!(remote, vec![Row::new().with("name", "Main")]);
}

#[tokio::test(flavor = "multi_thread")]
async fn operations_on_a_failed_row_wait_for_it() {
    let harness = Harness::new().await;
    harness.remote.seed("DROP TABLE registrations").await;
    harness
        .write(Statement::new(
            "INSERT INTO registrations (patient_name, updated_at) VALUES ('Asha', '2024-05-01 09:00:00')",
        ))
        .await;
    harness
        .write(
            Statement::new(
                "INSERT INTO patients (registration_id, patient_name, updated_at) VALUES (?, 'Asha', '2024-05-01 09:05:00')",
            )
            .bind(1),
        )
        .await;
    harness
        .write(Statement::new(
            "INSERT INTO branches (name, updated_at) VALUES ('Main', '2024-05-01 09:00:00')",
        ))
        .await;

    let report = harness.scheduler.push_once().await.unwrap().completed().unwrap();
    assert_eq!(
        (report.pushed, report.failed, report.deferred, report.remaining),
        (1, 1, 1, 2)
    );
    assert_eq!(count(&harness.remote.rows("SELECT COUNT(*) AS n FROM patients").await), 0);
    assert_eq!(count(&harness.remote.rows("SELECT COUNT(*) AS n FROM branches").await), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn full_pages_never_split_rows_sharing_a_marker() {
    let config = SchedulerConfig {
        pull_batch_size: 2,
        ..SchedulerConfig::default()
    };
    let harness = Harness::with(config, Duration::ZERO).await;
    harness
        .remote
        .seed(
            "INSERT INTO branches (branch_id, name, updated_at) VALUES
             (1, 'Main', '2024-05-01 09:00:00'),
             (2, 'East', '2024-05-01 10:00:00'),
             (3, 'West', '2024-05-01 10:00:00')",
        )
        .await;

    let first = harness.scheduler.pull_once().await.unwrap().completed().unwrap();
    assert_eq!(first.rows_merged, 3);

    harness
        .remote
        .seed(
            "INSERT INTO branches (branch_id, name, updated_at) VALUES
             (4, 'North', '2024-05-01 11:00:00'),
             (5, 'South', '2024-05-01 11:00:00'),
             (6, 'Hill', '2024-05-01 11:00:00'),
             (7, 'Lake', '2024-05-01 12:00:00')",
        )
        .await;
    let second = harness.scheduler.pull_once().await.unwrap().completed().unwrap();
    assert_eq!(second.rows_merged, 3);
    let third = harness.scheduler.pull_once().await.unwrap().completed().unwrap();
    assert_eq!(third.rows_merged, 1);

    let ids: Vec<Row> = harness
        .local_rows("SELECT branch_id FROM branches ORDER BY branch_id")
        .await;
    assert_eq!(
        ids,
        (1..=7)
            .map(|id| Row::new().with("branch_id", id))
            .collect::<Vec<_>>()
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn pulled_row_never_overwrites_an_unpushed_local_row() {
    let harness = Harness::new().await;
    harness
        .remote
        .seed(
            "INSERT INTO branches (branch_id, name, updated_at)
             VALUES (1, 'OtherClient', '2024-05-01 09:00:00')",
        )
        .await;
    harness
        .write(Statement::new(
            "INSERT INTO branches (name, updated_at) VALUES ('Local', '2024-05-02 09:00:00')",
        ))
        .await;

    let pulled = harness.scheduler.pull_once().await.unwrap().completed().unwrap();
    assert_eq!(pulled.rows_relocated, 1);
    let expected = vec![
        Row::new().with("branch_id", 1).with("name", "OtherClient"),
        Row::new().with("branch_id", 2).with("name", "Local"),
    ];
    assert_eq!(
        harness
            .local_rows("SELECT branch_id, name FROM branches ORDER BY branch_id")
            .await,
        expected
    );

    harness.scheduler.push_once().await.unwrap();
    harness.scheduler.pull_once().await.unwrap();
    assert_eq!(
        harness
            .local_rows("SELECT branch_id, name FROM branches ORDER BY branch_id")
            .await,
        expected
    );
    assert_eq!(
        harness
            .remote
            .rows("SELECT branch_id, name FROM branches ORDER BY branch_id")
            .await,
        expected
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn push_stops_at_its_time_budget_and_resumes_next_cycle() {
    let config = SchedulerConfig {
        push_budget: Duration::from_millis(120),
        ..SchedulerConfig::default()
    };
    let harness = Harness::with(config, Duration::from_millis(50)).await;
    for name in ["a", "b", "c", "d", "e"] {
        harness
            .write(Statement::new("INSERT INTO inquiries (name) VALUES (?)").bind(name))
            .await;
    }

    let first = harness.scheduler.push_once().await.unwrap().completed().unwrap();
    assert!(first.budget_exhausted);
    assert!(first.pushed >= 1 && first.pushed < 5, "{first:?}");
    assert_eq!(first.remaining, 5 - u64::try_from(first.pushed).unwrap());

    let mut cycles = 1;
    let mut remaining = first.remaining;
    while remaining > 0 {
        let next = harness.scheduler.push_once().await.unwrap().completed().unwrap();
        assert!(next.pushed >= 1);
        remaining = next.remaining;
        cycles += 1;
        assert!(cycles <= 5);
    }
    assert_eq!(count(&harness.remote.rows("SELECT COUNT(*) AS n FROM inquiries").await), 5);
}

#[tokio::test(flavor = "multi_thread")]
async fn one_failing_table_does_not_stop_the_pull() {
    let harness = Harness::new().await;
    harness
        .remote
        .seed("INSERT INTO branches (branch_id, name, updated_at) VALUES (1, 'Main', '2024-05-01 09:00:00')")
        .await;
    harness.remote.seed("DROP TABLE payments").await;

    let report = harness.scheduler.pull_once().await.unwrap().completed().unwrap();
    assert_eq!(report.tables_failed, vec!["payments".to_string()]);
    assert_eq!(report.tables_merged, SyncSchema::clinic().tables.len() - 1);
    assert!(!report.global_advanced);

    assert_eq!(count(&harness.local_rows("SELECT COUNT(*) AS n FROM branches").await), 1);
    let cursor = harness.cache.session().await.load_cursor().await.unwrap();
    assert!(cursor.table_marker("branches").is_some());
    assert_eq!(cursor.global, None);
}

#[tokio::test(flavor = "multi_thread")]
async fn local_read_error_wins_when_the_remote_fails_too() {
    let harness = Harness::new().await;
    harness.remote.set_mode(Mode::Offline);

    let error = harness
        .router
        .execute(&Statement::new("SELECT * FROM ghosts"))
        .await
        .unwrap_err();
    assert!(!error.is_transient(), "{error:?}");
}
