//! Background pull and push cycles.
//!
//! PULL walks the syncable tables in schema order and merges remote rows
//! newer than each table's cursor. PUSH replays the pending queue in id order.
//! The two may overlap; a second PULL (or PUSH) while one is running is
//! skipped.

use std::cmp::Ordering as CmpOrdering;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::cache::{CacheSession, LocalCache};
use crate::config::SyncSettings;
use crate::error::{Error, Result};
use crate::models::{
    PendingOperation, QueryOutcome, Row, SqlValue, Statement, SyncSchema, SyncableTable,
};
use crate::reconcile::{held_identities, relocate_local_row, IdentityReport, ReconciliationService};
use crate::remote::{RemoteExecutor, RetryPolicy};
use crate::sql::{self, remap_local_ids};
use crate::util::sanitize;

/// Wakes the push loop after a local write.
#[derive(Debug, Clone, Default)]
pub struct PushTrigger(Arc<Notify>);

impl PushTrigger {
    pub fn fire(&self) {
        self.0.notify_one();
    }

    pub async fn notified(&self) {
        self.0.notified().await;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    pub pull_interval: Duration,
    pub push_interval: Duration,
    pub push_debounce: Duration,
    pub push_budget: Duration,
    pub pull_batch_size: u32,
    pub transport_retry: RetryPolicy,
    pub queue_retry: RetryPolicy,
    pub reconcile_after_push: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from(&SyncSettings::default())
    }
}

impl From<&SyncSettings> for SchedulerConfig {
    fn from(settings: &SyncSettings) -> Self {
        Self {
            pull_interval: settings.pull_interval,
            push_interval: settings.push_interval,
            push_debounce: settings.push_debounce,
            push_budget: settings.push_budget,
            pull_batch_size: settings.pull_batch_size,
            transport_retry: settings.transport_retry.clone(),
            queue_retry: settings.queue_retry.clone(),
            reconcile_after_push: settings.reconcile_after_push,
        }
    }
}

/// Result of asking for a cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "report", rename_all = "snake_case")]
pub enum CycleOutcome<T> {
    Completed(T),
    /// Another cycle of the same kind was already running.
    Skipped,
}

impl<T> CycleOutcome<T> {
    pub fn completed(self) -> Option<T> {
        match self {
            Self::Completed(report) => Some(report),
            Self::Skipped => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PullReport {
    pub tables_merged: usize,
    pub tables_failed: Vec<String>,
    pub rows_merged: usize,
    pub rows_skipped: usize,
    /// Unpushed local rows moved aside for a pulled row with the same key.
    pub rows_relocated: usize,
    pub global_advanced: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PushReport {
    pub pushed: usize,
    /// Failed this cycle but still pending.
    pub failed: usize,
    pub dead_lettered: usize,
    /// Held back because an earlier failed operation touches the same keys.
    pub deferred: usize,
    /// Applied remotely but not yet recorded locally; never replayed.
    pub unrecorded: usize,
    /// Pending operations left when the cycle ended.
    pub remaining: u64,
    pub budget_exhausted: bool,
    pub mappings_captured: usize,
    pub reconciliation: Option<IdentityReport>,
}

#[derive(Debug, Default)]
struct TablePull {
    merged: usize,
    skipped: usize,
    relocated: usize,
    max_marker: Option<SqlValue>,
}

/// A replay the remote store accepted whose local bookkeeping failed.
#[derive(Debug, Clone)]
struct Acknowledgement {
    operation: PendingOperation,
    outcome: QueryOutcome,
}

/// Owns the sync state for one cache/remote pair.
pub struct SyncScheduler {
    cache: Arc<LocalCache>,
    remote: Arc<dyn RemoteExecutor>,
    schema: Arc<SyncSchema>,
    config: SchedulerConfig,
    trigger: PushTrigger,
    pulling: AtomicBool,
    pushing: AtomicBool,
    last_pull: Mutex<Option<PullReport>>,
    last_push: Mutex<Option<PushReport>>,
    unrecorded: Mutex<Vec<Acknowledgement>>,
}

impl SyncScheduler {
    pub fn new(
        cache: Arc<LocalCache>,
        remote: Arc<dyn RemoteExecutor>,
        schema: Arc<SyncSchema>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            cache,
            remote,
            schema,
            config,
            trigger: PushTrigger::default(),
            pulling: AtomicBool::new(false),
            pushing: AtomicBool::new(false),
            last_pull: Mutex::new(None),
            last_push: Mutex::new(None),
            unrecorded: Mutex::new(Vec::new()),
        }
    }

    /// Trigger to hand to the router so local writes wake the push loop.
    pub fn push_trigger(&self) -> PushTrigger {
        self.trigger.clone()
    }

    pub async fn last_pull(&self) -> Option<PullReport> {
        self.last_pull.lock().await.clone()
    }

    pub async fn last_push(&self) -> Option<PushReport> {
        self.last_push.lock().await.clone()
    }

    /// One PULL cycle over every syncable table.
    pub async fn pull_once(&self) -> Result<CycleOutcome<PullReport>> {
        let Some(_guard) = CycleGuard::acquire(&self.pulling) else {
            debug!("Pull already running, skipping");
            return Ok(CycleOutcome::Skipped);
        };

        let mut report = PullReport::default();
        let mut highest: Option<SqlValue> = None;
        for table in &self.schema.tables {
            match self.pull_table(table).await {
                Ok(pulled) => {
                    report.tables_merged += 1;
                    report.rows_merged += pulled.merged;
                    report.rows_skipped += pulled.skipped;
                    report.rows_relocated += pulled.relocated;
                    if let Some(marker) = pulled.max_marker {
                        highest = Some(max_marker(highest, marker));
                    }
                }
                Err(error) => {
                    warn!(table = %table.name, "Pull failed for table: {error}");
                    report.tables_failed.push(table.name.clone());
                }
            }
        }

        if report.tables_failed.is_empty() {
            if let Some(marker) = highest {
                let session = self.cache.session().await;
                let mut cursor = session.load_cursor().await?;
                if cursor.advance_global(&marker) {
                    session.save_cursor(&cursor).await?;
                    report.global_advanced = true;
                }
            }
        }

        info!(
            tables = report.tables_merged,
            failed = report.tables_failed.len(),
            rows = report.rows_merged,
            "Pull cycle finished"
        );
        *self.last_pull.lock().await = Some(report.clone());
        Ok(CycleOutcome::Completed(report))
    }

    async fn pull_table(&self, table: &SyncableTable) -> Result<TablePull> {
        if !sql::is_safe_identifier(&table.name) || !sql::is_safe_identifier(&table.change_marker) {
            return Err(Error::validation(format!("unsafe table definition `{}`", table.name)));
        }
        let since = self
            .cache
            .session()
            .await
            .load_cursor()
            .await?
            .table_marker(&table.name)
            .cloned();

        let name = sql::quote_ident(&table.name);
        let marker = sql::quote_ident(&table.change_marker);
        let batch_size = self.config.pull_batch_size;
        let mut rows = Vec::new();
        let statement = match since {
            Some(since) => Statement::new(format!(
                "SELECT * FROM {name} WHERE {marker} > ? ORDER BY {marker} ASC LIMIT {batch_size}"
            ))
            .bind(since),
            None => {
                // Rows without a marker can only be reached before the first marker is recorded.
                rows = self
                    .fetch(&Statement::new(format!(
                        "SELECT * FROM {name} WHERE {marker} IS NULL"
                    )))
                    .await?;
                Statement::new(format!(
                    "SELECT * FROM {name} WHERE {marker} IS NOT NULL ORDER BY {marker} ASC LIMIT {batch_size}"
                ))
            }
        };

        let mut page = self.fetch(&statement).await?;
        if page.len() >= usize::try_from(batch_size).unwrap_or(usize::MAX) {
            // A full page may stop inside a run of equal markers; re-read that run whole.
            if let Some(last) = sql::take_trailing_run(&mut page, &table.change_marker) {
                let run = sql::marker_run(&table.name, &table.change_marker, &last);
                page.extend(self.fetch(&run).await?);
            }
        }
        rows.extend(page);
        if rows.is_empty() {
            return Ok(TablePull::default());
        }

        let max_marker = rows
            .iter()
            .filter_map(|row| row.get(&table.change_marker))
            .filter(|value| !value.is_null())
            .max_by(|a, b| a.sql_cmp(b))
            .cloned();

        let session = self.cache.session().await;
        session.begin().await?;
        match merge_batch(&session, &self.schema, table, &rows, max_marker.as_ref()).await {
            Ok(merge) => {
                session.commit().await?;
                debug!(
                    table = %table.name,
                    merged = merge.merged,
                    skipped = merge.skipped,
                    relocated = merge.relocated,
                    "Merged remote batch"
                );
                Ok(TablePull {
                    max_marker,
                    ..merge
                })
            }
            Err(error) => {
                session.rollback().await;
                Err(error)
            }
        }
    }

    async fn fetch(&self, statement: &Statement) -> Result<Vec<Row>> {
        Ok(self
            .config
            .transport_retry
            .run(|| self.remote.execute(statement))
            .await?
            .into_rows())
    }

    /// One PUSH cycle over the pending queue.
    pub async fn push_once(&self) -> Result<CycleOutcome<PushReport>> {
        let Some(_guard) = CycleGuard::acquire(&self.pushing) else {
            debug!("Push already running, skipping");
            return Ok(CycleOutcome::Skipped);
        };

        let started = Instant::now();
        let mut report = PushReport::default();
        let unrecorded = self.record_outstanding(&mut report).await;
        let operations = self.cache.session().await.pending_operations(None).await?;
        let mut blocked: HashSet<(String, i64)> = HashSet::new();

        for operation in operations {
            if unrecorded.contains(&operation.id) {
                continue;
            }
            if started.elapsed() >= self.config.push_budget {
                report.budget_exhausted = true;
                debug!("Push budget spent, deferring the rest of the queue");
                break;
            }

            let cursor = self.cache.session().await.load_cursor().await?;
            let statement = remap_local_ids(&operation.body.statement(), &self.schema, &cursor);
            let keys = operation_keys(&operation, &statement, &self.schema);
            if keys.iter().any(|key| blocked.contains(key)) {
                debug!(op_id = operation.id, "Holding operation behind an earlier failure");
                report.deferred += 1;
                blocked.extend(keys);
                continue;
            }

            match self
                .config
                .transport_retry
                .run(|| self.remote.execute(&statement))
                .await
            {
                Ok(outcome) => match self.acknowledge(&operation, &outcome).await {
                    Ok(captured) => {
                        report.pushed += 1;
                        if captured {
                            report.mappings_captured += 1;
                        }
                    }
                    Err(error) => {
                        error!(
                            op_id = operation.id,
                            "Remote applied the operation but recording it locally failed: {error}"
                        );
                        self.unrecorded
                            .lock()
                            .await
                            .push(Acknowledgement { operation, outcome });
                        break;
                    }
                },
                Err(error) => {
                    let attempts = operation.attempts.saturating_add(1);
                    let dead = error.is_validation() || self.config.queue_retry.is_exhausted(attempts);
                    self.cache
                        .session()
                        .await
                        .record_failure(operation.id, attempts, &sanitize(&error), dead)
                        .await?;

                    if dead {
                        warn!(
                            op_id = operation.id,
                            table = %operation.target,
                            attempts,
                            "Moved operation to dead letters: {error}"
                        );
                        report.dead_lettered += 1;
                    } else if error.is_transient() {
                        warn!(op_id = operation.id, attempts, "Remote unreachable, stopping cycle: {error}");
                        report.failed += 1;
                        break;
                    } else {
                        warn!(op_id = operation.id, attempts, "Push failed: {error}");
                        report.failed += 1;
                        blocked.extend(keys);
                    }
                }
            }
        }

        if report.mappings_captured > 0 && self.config.reconcile_after_push {
            let service = ReconciliationService::new(self.cache.clone(), self.schema.clone());
            match service.reconcile_identities().await {
                Ok(identities) => report.reconciliation = Some(identities),
                Err(error) => error!("Identity reconciliation failed: {error}"),
            }
        }

        report.unrecorded = self.unrecorded.lock().await.len();
        report.remaining = self.cache.session().await.queue_stats().await?.pending;
        info!(
            pushed = report.pushed,
            failed = report.failed,
            dead_lettered = report.dead_lettered,
            remaining = report.remaining,
            "Push cycle finished"
        );
        *self.last_push.lock().await = Some(report.clone());
        Ok(CycleOutcome::Completed(report))
    }

    /// Retry the local bookkeeping of replays the remote already applied.
    /// Returns the ids still outstanding, which must not be replayed.
    async fn record_outstanding(&self, report: &mut PushReport) -> HashSet<i64> {
        let mut unrecorded = self.unrecorded.lock().await;
        let mut outstanding = Vec::new();
        for acknowledgement in unrecorded.drain(..) {
            match self
                .acknowledge(&acknowledgement.operation, &acknowledgement.outcome)
                .await
            {
                Ok(captured) => {
                    report.pushed += 1;
                    if captured {
                        report.mappings_captured += 1;
                    }
                }
                Err(error) => {
                    warn!(
                        op_id = acknowledgement.operation.id,
                        "Still unable to record applied operation: {error}"
                    );
                    outstanding.push(acknowledgement);
                }
            }
        }
        let ids = outstanding
            .iter()
            .map(|acknowledgement| acknowledgement.operation.id)
            .collect();
        *unrecorded = outstanding;
        ids
    }

    /// Drop an acknowledged operation and capture its identity mapping.
    /// Returns whether a non-trivial mapping was recorded.
    async fn acknowledge(&self, operation: &PendingOperation, outcome: &QueryOutcome) -> Result<bool> {
        let remote_id = outcome.mutation().and_then(|result| result.last_insert_id);
        let creates_rows = sql::analyze(&operation.body.sql)
            .mutation()
            .is_some_and(|kind| kind.creates_rows());

        let session = self.cache.session().await;
        session.begin().await?;
        let result = record_acknowledgement(&session, operation, creates_rows, remote_id).await;
        match result {
            Ok(captured) => {
                session.commit().await?;
                Ok(captured)
            }
            Err(error) => {
                session.rollback().await;
                Err(error)
            }
        }
    }

    /// Start the pull and push loops on the current runtime.
    pub fn spawn(self: &Arc<Self>) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let pull = tokio::spawn(self.clone().pull_loop(shutdown_rx.clone()));
        let push = tokio::spawn(self.clone().push_loop(shutdown_rx));
        info!(
            pull_interval = ?self.config.pull_interval,
            push_interval = ?self.config.push_interval,
            remote = %self.remote.describe(),
            "Sync scheduler started"
        );
        SchedulerHandle {
            shutdown_tx,
            tasks: vec![pull, push],
        }
    }

    async fn pull_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.config.pull_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    if let Err(error) = self.pull_once().await {
                        error!("Pull cycle failed: {error}");
                    }
                }
            }
        }
        debug!("Pull loop stopped");
    }

    async fn push_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.config.push_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
                () = self.trigger.notified() => {
                    // Let a burst of writes settle into one cycle.
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        () = sleep(self.config.push_debounce) => {}
                    }
                }
            }
            if let Err(error) = self.push_once().await {
                error!("Push cycle failed: {error}");
            }
        }
        debug!("Push loop stopped");
    }
}

/// Running scheduler loops.
pub struct SchedulerHandle {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Stop both loops after their current cycle and wait for them.
    pub async fn shutdown(self) {
        self.shutdown_tx.send(true).ok();
        for task in self.tasks {
            if let Err(error) = task.await {
                error!("Scheduler task ended abnormally: {error}");
            }
        }
        info!("Sync scheduler stopped");
    }
}

/// Single-flight flag held for the duration of a cycle.
struct CycleGuard<'a>(&'a AtomicBool);

impl<'a> CycleGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn max_marker(current: Option<SqlValue>, candidate: SqlValue) -> SqlValue {
    match current {
        Some(current) if current.sql_cmp(&candidate) != CmpOrdering::Less => current,
        _ => candidate,
    }
}

/// Upsert one pulled batch and advance the table cursor. Runs inside the
/// caller's transaction.
async fn merge_batch(
    session: &CacheSession<'_>,
    schema: &SyncSchema,
    table: &SyncableTable,
    rows: &[Row],
    max_marker: Option<&SqlValue>,
) -> Result<TablePull> {
    let relocated = make_room(session, schema, table, rows).await?;
    let mirrored = session.mirror_rows(&table.name, rows).await?;
    if !mirrored.table_known {
        return Err(Error::Database(format!(
            "local table `{}` does not exist",
            table.name
        )));
    }

    if let Some(marker) = max_marker {
        let mut cursor = session.load_cursor().await?;
        if cursor.advance_table(&table.name, marker) {
            session.save_cursor(&cursor).await?;
        }
    }
    Ok(TablePull {
        merged: mirrored.upserted,
        skipped: mirrored.refused + mirrored.failed,
        relocated,
        max_marker: None,
    })
}

/// Move unpushed local rows out of the way of pulled rows that carry the
/// same primary key. New ids are placed above every key in the batch.
async fn make_room(
    session: &CacheSession<'_>,
    schema: &SyncSchema,
    table: &SyncableTable,
    rows: &[Row],
) -> Result<usize> {
    let Some(pk) = table.single_primary_key() else {
        return Ok(0);
    };
    let held = held_identities(session, &table.name).await?;
    if held.is_empty() {
        return Ok(0);
    }

    let incoming: Vec<i64> = rows.iter().filter_map(|row| row_key(row, pk)).collect();
    let floor = incoming.iter().max().map_or(1, |max| max.saturating_add(1));
    let mut relocated = 0;
    for id in incoming.into_iter().filter(|id| held.contains(id)) {
        if !session.row_exists(&table.name, pk, id).await? {
            continue;
        }
        let fresh = relocate_local_row(session, schema, table, pk, id, floor).await?;
        info!(
            table = %table.name,
            from = id,
            to = fresh,
            "Moved unpushed local row aside for a pulled row"
        );
        relocated += 1;
    }
    Ok(relocated)
}

fn row_key(row: &Row, pk: &str) -> Option<i64> {
    row.get(pk)
        .or_else(|| {
            row.iter()
                .find(|(column, _)| column.eq_ignore_ascii_case(pk))
                .map(|(_, value)| value)
        })
        .and_then(SqlValue::as_i64)
}

/// Keys an operation touches: its own provisional id plus every key it binds.
fn operation_keys(
    operation: &PendingOperation,
    statement: &Statement,
    schema: &SyncSchema,
) -> Vec<(String, i64)> {
    let mut keys = sql::bound_keys(statement, schema);
    if let Some(local_id) = operation.body.local_id {
        keys.push((operation.target.to_ascii_lowercase(), local_id));
    }
    keys
}

async fn record_acknowledgement(
    session: &CacheSession<'_>,
    operation: &PendingOperation,
    creates_rows: bool,
    remote_id: Option<i64>,
) -> Result<bool> {
    let mut captured = false;
    if let (true, Some(local_id), Some(remote_id)) = (creates_rows, operation.body.local_id, remote_id) {
        let mut cursor = session.load_cursor().await?;
        cursor.record_mapping(&operation.target, local_id, remote_id);
        session.save_cursor(&cursor).await?;
        captured = local_id != remote_id;
        if captured {
            info!(table = %operation.target, local_id, remote_id, "Captured identity mapping");
        }
    }
    session.complete_operation(operation.id).await?;
    Ok(captured)
}
