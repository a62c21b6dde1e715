//! Statement routing between the local cache and the remote store.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::cache::{CacheSession, LocalCache};
use crate::error::{Error, Result};
use crate::models::{CapturedStatement, MutationResult, QueryOutcome, Statement, SyncSchema};
use crate::remote::{RemoteExecutor, RetryPolicy};
use crate::scheduler::PushTrigger;
use crate::sql::{self, translate_for_local, MutationKind, StatementInfo, StatementKind, NOOP_READ};

/// Decides, per statement, whether the cache or the remote store answers it.
///
/// Domain reads are local-first, domain writes land locally and are queued
/// for push, and anything touching an authoritative table goes to the remote
/// store with its effect mirrored back into the cache.
pub struct QueryRouter {
    cache: Arc<LocalCache>,
    remote: Arc<dyn RemoteExecutor>,
    schema: Arc<SyncSchema>,
    read_retry: RetryPolicy,
    push_trigger: PushTrigger,
}

impl QueryRouter {
    pub fn new(
        cache: Arc<LocalCache>,
        remote: Arc<dyn RemoteExecutor>,
        schema: Arc<SyncSchema>,
    ) -> Self {
        Self {
            cache,
            remote,
            schema,
            read_retry: RetryPolicy::default(),
            push_trigger: PushTrigger::default(),
        }
    }

    /// Share the scheduler's trigger so local writes wake the push loop.
    #[must_use]
    pub fn with_push_trigger(mut self, trigger: PushTrigger) -> Self {
        self.push_trigger = trigger;
        self
    }

    /// Retry policy for remote reads.
    #[must_use]
    pub fn with_read_retry(mut self, policy: RetryPolicy) -> Self {
        self.read_retry = policy;
        self
    }

    pub fn cache(&self) -> &Arc<LocalCache> {
        &self.cache
    }

    pub fn schema(&self) -> &SyncSchema {
        &self.schema
    }

    pub fn push_trigger(&self) -> &PushTrigger {
        &self.push_trigger
    }

    /// Route a statement by kind and table classification.
    pub async fn execute(&self, statement: &Statement) -> Result<QueryOutcome> {
        self.route(statement, false).await
    }

    /// Like [`execute`](Self::execute) but reads bypass the cache.
    pub async fn execute_fresh(&self, statement: &Statement) -> Result<QueryOutcome> {
        self.route(statement, true).await
    }

    async fn route(&self, statement: &Statement, fresh: bool) -> Result<QueryOutcome> {
        let info = sql::analyze(&statement.sql);
        let authoritative = info
            .tables
            .iter()
            .any(|table| self.schema.is_authoritative(table));
        debug!(kind = ?info.kind, tables = ?info.tables, authoritative, fresh, "Routing statement");

        match info.kind {
            StatementKind::Session => {
                self.cache.query(NOOP_READ, Vec::new()).await?;
                Ok(QueryOutcome::empty())
            }
            StatementKind::Schema => self.apply_schema(statement).await,
            StatementKind::Read if fresh || authoritative => self.remote_read(statement, &info).await,
            StatementKind::Read => self.local_read(statement, &info).await,
            StatementKind::Mutation(kind) if authoritative => {
                self.remote_mutation(statement, &info, kind).await
            }
            StatementKind::Mutation(kind) => self.local_mutation(statement, &info, kind).await,
        }
    }

    async fn remote_read(&self, statement: &Statement, info: &StatementInfo) -> Result<QueryOutcome> {
        let outcome = self
            .read_retry
            .run(|| self.remote.execute(statement))
            .await?;

        if let [table] = info.tables.as_slice() {
            if !outcome.rows().is_empty() {
                let session = self.cache.session().await;
                mirror_best_effort(&session, table, &outcome).await;
            }
        }
        Ok(outcome)
    }

    async fn local_read(&self, statement: &Statement, info: &StatementInfo) -> Result<QueryOutcome> {
        let local = local_statement(statement);
        let syncable = info.tables.iter().any(|table| self.schema.is_syncable(table));

        match self.cache.execute(&local).await {
            Ok(outcome) if outcome.rows().is_empty() && syncable => {
                debug!(tables = ?info.tables, "Local miss, reading through to remote");
                match self.remote_read(statement, info).await {
                    Ok(remote) => Ok(remote),
                    Err(error) if error.is_transient() => {
                        debug!("Remote unavailable, serving the empty local result: {error}");
                        Ok(outcome)
                    }
                    Err(error) => Err(error),
                }
            }
            Ok(outcome) => Ok(outcome),
            Err(local_error) => {
                warn!("Local read failed, trying remote: {local_error}");
                self.remote_read(statement, info).await.map_err(|remote_error| {
                    warn!("Remote read failed as well: {remote_error}");
                    local_error
                })
            }
        }
    }

    async fn remote_mutation(
        &self,
        statement: &Statement,
        info: &StatementInfo,
        kind: MutationKind,
    ) -> Result<QueryOutcome> {
        let outcome = self.remote.execute(statement).await?;
        let Some(target) = info.target() else {
            return Ok(outcome);
        };
        let result = outcome.mutation().unwrap_or_default();

        match (kind.creates_rows(), result.last_insert_id) {
            (true, Some(remote_id)) => self.mirror_remote_row(target, remote_id).await,
            _ => {
                let session = self.cache.session().await;
                if let Err(error) = session.execute(&local_statement(statement)).await {
                    warn!(table = target, "Could not replay authoritative write locally: {error}");
                }
            }
        }
        Ok(outcome)
    }

    /// Fetch a freshly inserted remote row by rowid and store it locally.
    async fn mirror_remote_row(&self, table: &str, remote_id: i64) {
        if !sql::is_safe_identifier(table) {
            return;
        }
        let fetch = Statement::new(format!(
            "SELECT * FROM {} WHERE rowid = ?",
            sql::quote_ident(table)
        ))
        .bind(remote_id);

        match self.remote.execute(&fetch).await {
            Ok(outcome) => {
                let session = self.cache.session().await;
                mirror_best_effort(&session, table, &outcome).await;
            }
            Err(error) => warn!(table, remote_id, "Could not fetch inserted row: {error}"),
        }
    }

    async fn local_mutation(
        &self,
        statement: &Statement,
        info: &StatementInfo,
        kind: MutationKind,
    ) -> Result<QueryOutcome> {
        let target = info
            .target()
            .ok_or_else(|| Error::validation("mutation has no target table"))?;
        let target = self
            .schema
            .table(target)
            .map_or_else(|| target.to_string(), |table| table.name.clone());

        let session = self.cache.session().await;
        session.begin().await?;
        let written = write_and_enqueue(&session, statement, &target, kind).await;
        let (result, op_id) = match written {
            Ok(value) => {
                session.commit().await?;
                value
            }
            Err(error) => {
                session.rollback().await;
                return Err(error);
            }
        };
        drop(session);

        info!(table = %target, op_id, action = kind.as_str(), "Queued local write");
        self.push_trigger.fire();
        Ok(QueryOutcome::Mutation(result))
    }

    /// Run a DDL statement remotely, then locally on a best-effort basis.
    async fn apply_schema(&self, statement: &Statement) -> Result<QueryOutcome> {
        let outcome = self.remote.execute(statement).await?;
        if let Err(error) = self.cache.execute(&local_statement(statement)).await {
            warn!("Schema change not applied to the cache: {error}");
        }
        Ok(outcome)
    }
}

async fn write_and_enqueue(
    session: &CacheSession<'_>,
    statement: &Statement,
    target: &str,
    kind: MutationKind,
) -> Result<(MutationResult, i64)> {
    let outcome = session.execute(&local_statement(statement)).await?;
    let result = outcome.mutation().unwrap_or_default();
    let local_id = if kind.creates_rows() {
        result.last_insert_id
    } else {
        None
    };
    let body = CapturedStatement::new(statement, local_id);
    let op_id = session.enqueue(kind.as_str(), target, &body).await?;
    Ok((result, op_id))
}

async fn mirror_best_effort(session: &CacheSession<'_>, table: &str, outcome: &QueryOutcome) {
    match session.mirror_rows(table, outcome.rows()).await {
        Ok(report) if report.table_known => {
            debug!(table, upserted = report.upserted, refused = report.refused, "Mirrored remote rows");
        }
        Ok(_) => {}
        Err(error) => warn!(table, "Mirroring failed: {error}"),
    }
}

fn local_statement(statement: &Statement) -> Statement {
    Statement::with_params(translate_for_local(&statement.sql), statement.params.clone())
}
