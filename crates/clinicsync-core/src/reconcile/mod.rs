//! Post-reconnect repair of the local cache.
//!
//! Two passes: identity reconciliation renames rows created offline to the
//! ids the remote store assigned them, and deduplication folds rows sharing a
//! natural key into the lowest-keyed one.

mod dates;
mod dedup;

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cache::{CacheSession, LocalCache};
use crate::error::Result;
use crate::models::{CapturedStatement, IdentityKey, SqlValue, SyncSchema, SyncableTable};
use crate::sql::{quote_ident, remap_ids};

pub use dates::{normalize_date, normalize_date_text};
pub use dedup::{DedupReport, DuplicateGroup};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IdentityReport {
    /// Local rows moved to their remote id.
    pub renamed: usize,
    /// Local rows dropped because the remote copy was already cached.
    pub merged: usize,
    /// Unpushed rows moved out of the way of an incoming remote id.
    pub relocated: usize,
    pub dependents_rewritten: u64,
    pub operations_rewritten: usize,
    /// Mappings left for a later run.
    pub skipped: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub identities: IdentityReport,
    pub duplicates: DedupReport,
}

pub struct ReconciliationService {
    cache: Arc<LocalCache>,
    schema: Arc<SyncSchema>,
}

impl ReconciliationService {
    pub fn new(cache: Arc<LocalCache>, schema: Arc<SyncSchema>) -> Self {
        Self { cache, schema }
    }

    /// Identities first, then duplicates.
    pub async fn run_all(&self) -> Result<ReconcileReport> {
        let identities = self.reconcile_identities().await?;
        let duplicates = self.deduplicate().await?;
        Ok(ReconcileReport {
            identities,
            duplicates,
        })
    }

    /// Apply every non-trivial identity mapping to the cache.
    ///
    /// Each mapping is handled in its own transaction. A mapping that fails is
    /// rolled back and kept for the next run.
    pub async fn reconcile_identities(&self) -> Result<IdentityReport> {
        let session = self.cache.session().await;
        let pending = session.load_cursor().await?.unreconciled();
        let mut report = IdentityReport::default();
        if pending.is_empty() {
            return Ok(report);
        }

        for (key, remote_id) in pending {
            let Some(table) = self.schema.table(&key.table) else {
                debug!(table = %key.table, "Mapping for a table outside the schema");
                report.skipped += 1;
                continue;
            };
            let Some(pk) = table.single_primary_key() else {
                report.skipped += 1;
                continue;
            };

            session.begin().await?;
            let mut step = IdentityReport::default();
            match self.apply_mapping(&session, table, pk, &key, remote_id, &mut step).await {
                Ok(()) => {
                    session.commit().await?;
                    info!(
                        table = %table.name,
                        local_id = key.local_id,
                        remote_id,
                        merged = step.merged > 0,
                        "Reconciled identity"
                    );
                    report.absorb(&step);
                }
                Err(error) => {
                    session.rollback().await;
                    warn!(
                        table = %table.name,
                        local_id = key.local_id,
                        remote_id,
                        "Identity reconciliation failed, keeping mapping: {error}"
                    );
                    report.skipped += 1;
                }
            }
        }
        Ok(report)
    }

    async fn apply_mapping(
        &self,
        session: &CacheSession<'_>,
        table: &SyncableTable,
        pk: &str,
        key: &IdentityKey,
        remote_id: i64,
        report: &mut IdentityReport,
    ) -> Result<()> {
        if session.table_shape(&table.name).await?.is_some() {
            if is_provisional(session, &table.name, remote_id).await? {
                // An unpushed local row already holds the id the remote assigned.
                let fresh = next_free_id(session, &table.name, pk).await?;
                report.dependents_rewritten +=
                    move_row(session, table, pk, remote_id, fresh).await?;
                report.operations_rewritten +=
                    rewrite_queue(session, &self.schema, &table.name, remote_id, fresh).await?;
                report.relocated += 1;
            }

            let local_exists = session.row_exists(&table.name, pk, key.local_id).await?;
            let remote_exists = session.row_exists(&table.name, pk, remote_id).await?;
            if local_exists && remote_exists {
                report.dependents_rewritten +=
                    repoint_dependents(session, table, key.local_id, remote_id).await?;
                delete_row(session, &table.name, pk, key.local_id).await?;
                report.merged += 1;
            } else if local_exists {
                report.dependents_rewritten +=
                    move_row(session, table, pk, key.local_id, remote_id).await?;
                report.renamed += 1;
            } else {
                report.dependents_rewritten +=
                    repoint_dependents(session, table, key.local_id, remote_id).await?;
            }
        }

        report.operations_rewritten +=
            rewrite_queue(session, &self.schema, &table.name, key.local_id, remote_id).await?;

        let mut cursor = session.load_cursor().await?;
        cursor.remove_mapping(&key.table, key.local_id);
        cursor.record_mapping(&key.table, remote_id, remote_id);
        session.save_cursor(&cursor).await
    }
}

impl IdentityReport {
    fn absorb(&mut self, other: &Self) {
        self.renamed += other.renamed;
        self.merged += other.merged;
        self.relocated += other.relocated;
        self.dependents_rewritten += other.dependents_rewritten;
        self.operations_rewritten += other.operations_rewritten;
        self.skipped += other.skipped;
    }
}

/// Rename a row's primary key and follow it in every dependent column.
async fn move_row(
    session: &CacheSession<'_>,
    table: &SyncableTable,
    pk: &str,
    from: i64,
    to: i64,
) -> Result<u64> {
    let sql = format!(
        "UPDATE {} SET {} = ? WHERE {} = ?",
        quote_ident(&table.name),
        quote_ident(pk),
        quote_ident(pk)
    );
    session.run(&sql, vec![to.into(), from.into()]).await?;
    repoint_dependents(session, table, from, to).await
}

async fn delete_row(session: &CacheSession<'_>, table: &str, pk: &str, id: i64) -> Result<()> {
    let sql = format!(
        "DELETE FROM {} WHERE {} = ?",
        quote_ident(table),
        quote_ident(pk)
    );
    session.run(&sql, vec![id.into()]).await?;
    Ok(())
}

/// Point every dependent column holding `from` at `to`. Dependent tables
/// missing from the cache are skipped.
pub(crate) async fn repoint_dependents(
    session: &CacheSession<'_>,
    table: &SyncableTable,
    from: i64,
    to: i64,
) -> Result<u64> {
    let mut changed = 0;
    for dependent in &table.dependents {
        let Some(shape) = session.table_shape(&dependent.table).await? else {
            continue;
        };
        let Some(column) = shape.column(&dependent.column) else {
            continue;
        };
        let sql = format!(
            "UPDATE {} SET {} = ? WHERE {} = ?",
            quote_ident(&shape.name),
            quote_ident(column),
            quote_ident(column)
        );
        changed += session.run(&sql, vec![to.into(), from.into()]).await?;
    }
    Ok(changed)
}

/// Rewrite queued statements (pending and dead-lettered) that bind `from` as
/// a key of `table`. Returns how many operations changed.
pub(crate) async fn rewrite_queue(
    session: &CacheSession<'_>,
    schema: &SyncSchema,
    table: &str,
    from: i64,
    to: i64,
) -> Result<usize> {
    let mut operations = session.pending_operations(None).await?;
    operations.extend(session.dead_letters().await?);

    let mut changed = 0;
    for operation in operations {
        let statement = operation.body.statement();
        let rewritten = remap_ids(&statement, schema, |key_table, id| {
            (key_table.eq_ignore_ascii_case(table) && id == from).then_some(to)
        });
        let owns_id =
            operation.target.eq_ignore_ascii_case(table) && operation.body.local_id == Some(from);
        if rewritten == statement && !owns_id {
            continue;
        }

        let local_id = if owns_id { Some(to) } else { operation.body.local_id };
        session
            .update_operation_body(operation.id, &CapturedStatement::new(&rewritten, local_id))
            .await?;
        changed += 1;
    }
    Ok(changed)
}

/// Local ids in `table` that a pulled row must not overwrite: ids minted by
/// queued inserts and ids still waiting for identity reconciliation.
pub(crate) async fn held_identities(session: &CacheSession<'_>, table: &str) -> Result<HashSet<i64>> {
    let mut operations = session.pending_operations(None).await?;
    operations.extend(session.dead_letters().await?);
    let mut held: HashSet<i64> = operations
        .iter()
        .filter(|operation| operation.target.eq_ignore_ascii_case(table))
        .filter_map(|operation| operation.body.local_id)
        .collect();

    let cursor = session.load_cursor().await?;
    held.extend(
        cursor
            .unreconciled()
            .into_iter()
            .filter(|(key, _)| key.table.eq_ignore_ascii_case(table))
            .map(|(key, _)| key.local_id),
    );
    Ok(held)
}

/// Move the local row holding `id` to a free id no lower than `floor`. The
/// row is followed in dependent columns, queued statements and the identity
/// map. Returns the new id.
pub(crate) async fn relocate_local_row(
    session: &CacheSession<'_>,
    schema: &SyncSchema,
    table: &SyncableTable,
    pk: &str,
    id: i64,
    floor: i64,
) -> Result<i64> {
    let fresh = next_free_id(session, &table.name, pk).await?.max(floor);
    move_row(session, table, pk, id, fresh).await?;
    rewrite_queue(session, schema, &table.name, id, fresh).await?;

    let mut cursor = session.load_cursor().await?;
    if let Some(remote_id) = cursor.remote_id(&table.name, id).filter(|remote_id| *remote_id != id) {
        cursor.remove_mapping(&table.name, id);
        cursor.record_mapping(&table.name, fresh, remote_id);
        session.save_cursor(&cursor).await?;
    }
    Ok(fresh)
}

/// Whether `id` in `table` was minted locally by a queued insert.
async fn is_provisional(session: &CacheSession<'_>, table: &str, id: i64) -> Result<bool> {
    let mut operations = session.pending_operations(None).await?;
    operations.extend(session.dead_letters().await?);
    Ok(operations.iter().any(|operation| {
        operation.target.eq_ignore_ascii_case(table) && operation.body.local_id == Some(id)
    }))
}

async fn next_free_id(session: &CacheSession<'_>, table: &str, pk: &str) -> Result<i64> {
    let sql = format!(
        "SELECT COALESCE(MAX({}), 0) + 1 AS next_id FROM {}",
        quote_ident(pk),
        quote_ident(table)
    );
    let rows = session.query(&sql, Vec::new()).await?;
    Ok(rows
        .first()
        .and_then(|row| row.get("next_id"))
        .and_then(SqlValue::as_i64)
        .unwrap_or(1))
}
