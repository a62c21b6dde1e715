//! Duplicate folding by natural key.

use std::collections::HashMap;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::dates::normalize_date;
use super::{repoint_dependents, rewrite_queue, ReconciliationService};
use crate::cache::{CacheSession, TableShape};
use crate::error::{Error, Result};
use crate::models::{DuplicateRule, Row, SqlValue, SyncSchema, SyncableTable};
use crate::sql::quote_ident;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DedupReport {
    pub groups: usize,
    pub rows_removed: usize,
    pub dependents_repointed: u64,
    pub dates_normalized: u64,
    /// Rules or groups that failed and were rolled back.
    pub failures: usize,
}

/// Rows of one table sharing a normalized natural key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateGroup {
    pub table: String,
    pub key: String,
    /// Lowest primary key in the group.
    pub master: i64,
    pub duplicates: Vec<i64>,
}

impl ReconciliationService {
    /// Fold duplicate rows for every rule, one transaction per group.
    pub async fn deduplicate(&self) -> Result<DedupReport> {
        let mut report = DedupReport::default();
        for rule in &self.schema.duplicate_rules {
            if let Err(error) = self.deduplicate_rule(rule, &mut report).await {
                warn!(table = %rule.table, "Deduplication failed: {error}");
                report.failures += 1;
            }
        }
        Ok(report)
    }

    /// Rewrite every rule's date columns to `YYYY-MM-DD`.
    pub async fn normalize_dates(&self) -> Result<u64> {
        let session = self.cache.session().await;
        let mut changed = 0;
        for rule in &self.schema.duplicate_rules {
            let (table, pk) = rule_table(&self.schema, rule)?;
            let Some(shape) = session.table_shape(&table.name).await? else {
                continue;
            };
            changed += normalize_rule_dates(&session, &shape, pk, rule).await?;
        }
        Ok(changed)
    }

    /// Groups that [`Self::deduplicate`] would merge, without changing anything.
    pub async fn duplicate_groups(&self) -> Result<Vec<DuplicateGroup>> {
        let session = self.cache.session().await;
        let mut groups = Vec::new();
        for rule in &self.schema.duplicate_rules {
            let (table, pk) = rule_table(&self.schema, rule)?;
            let Some(shape) = session.table_shape(&table.name).await? else {
                continue;
            };
            groups.extend(find_groups(&session, &shape, pk, rule).await?);
        }
        Ok(groups)
    }

    async fn deduplicate_rule(&self, rule: &DuplicateRule, report: &mut DedupReport) -> Result<()> {
        let (table, pk) = rule_table(&self.schema, rule)?;
        let session = self.cache.session().await;
        let Some(shape) = session.table_shape(&table.name).await? else {
            debug!(table = %table.name, "Table not cached, nothing to deduplicate");
            return Ok(());
        };

        report.dates_normalized += normalize_rule_dates(&session, &shape, pk, rule).await?;

        for group in find_groups(&session, &shape, pk, rule).await? {
            session.begin().await?;
            match merge_group(&session, &self.schema, table, &shape, pk, rule, &group).await {
                Ok(repointed) => {
                    session.commit().await?;
                    info!(
                        table = %group.table,
                        master = group.master,
                        merged = ?group.duplicates,
                        "Merged duplicate rows"
                    );
                    report.groups += 1;
                    report.rows_removed += group.duplicates.len();
                    report.dependents_repointed += repointed;
                }
                Err(error) => {
                    session.rollback().await;
                    warn!(table = %group.table, master = group.master, "Duplicate merge failed: {error}");
                    report.failures += 1;
                }
            }
        }
        Ok(())
    }
}

fn rule_table<'a>(schema: &'a SyncSchema, rule: &DuplicateRule) -> Result<(&'a SyncableTable, &'a str)> {
    let table = schema
        .table(&rule.table)
        .ok_or_else(|| Error::validation(format!("unknown table `{}`", rule.table)))?;
    let pk = table.single_primary_key().ok_or_else(|| {
        Error::validation(format!("`{}` has no single-column primary key", table.name))
    })?;
    Ok((table, pk))
}

async fn find_groups(
    session: &CacheSession<'_>,
    shape: &TableShape,
    pk: &str,
    rule: &DuplicateRule,
) -> Result<Vec<DuplicateGroup>> {
    let mut selected = vec![quote_ident(pk)];
    for column in &rule.key_columns {
        let local = shape.column(column).ok_or_else(|| {
            Error::validation(format!("`{}` has no column `{column}`", shape.name))
        })?;
        selected.push(format!("{} AS {}", quote_ident(local), quote_ident(column)));
    }
    let sql = format!(
        "SELECT {} FROM {} ORDER BY {} ASC",
        selected.join(", "),
        quote_ident(&shape.name),
        quote_ident(pk)
    );

    let mut order: Vec<String> = Vec::new();
    let mut members: HashMap<String, Vec<i64>> = HashMap::new();
    for row in session.query(&sql, Vec::new()).await? {
        let Some(id) = row.get(pk).and_then(SqlValue::as_i64) else {
            continue;
        };
        let Some(key) = natural_key(&row, rule) else {
            continue;
        };
        let ids = members.entry(key.clone()).or_insert_with(|| {
            order.push(key);
            Vec::new()
        });
        ids.push(id);
    }

    Ok(order
        .into_iter()
        .filter_map(|key| {
            let ids = members.remove(&key)?;
            let (&master, duplicates) = ids.split_first()?;
            (!duplicates.is_empty()).then(|| DuplicateGroup {
                table: shape.name.clone(),
                key,
                master,
                duplicates: duplicates.to_vec(),
            })
        })
        .collect())
}

/// Normalized natural key of a row, or `None` when any part is empty.
fn natural_key(row: &Row, rule: &DuplicateRule) -> Option<String> {
    let mut parts = Vec::with_capacity(rule.key_columns.len());
    for column in &rule.key_columns {
        let value = row.get(column)?;
        let is_date = rule
            .date_columns
            .iter()
            .any(|date| date.eq_ignore_ascii_case(column));
        let part = if is_date {
            normalize_date(value)?
        } else {
            normalize_key_part(value)?
        };
        parts.push(part);
    }
    Some(parts.join("\u{1f}"))
}

fn normalize_key_part(value: &SqlValue) -> Option<String> {
    match value {
        SqlValue::Null => None,
        SqlValue::Integer(number) => Some(number.to_string()),
        SqlValue::Real(number) => Some(number.to_string()),
        SqlValue::Text(text) => {
            let folded = text.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
            (!folded.is_empty()).then_some(folded)
        }
    }
}

async fn merge_group(
    session: &CacheSession<'_>,
    schema: &SyncSchema,
    table: &SyncableTable,
    shape: &TableShape,
    pk: &str,
    rule: &DuplicateRule,
    group: &DuplicateGroup,
) -> Result<u64> {
    let delete = format!(
        "DELETE FROM {} WHERE {} = ?",
        quote_ident(&shape.name),
        quote_ident(pk)
    );

    let mut repointed = 0;
    for &duplicate in &group.duplicates {
        repointed += repoint_dependents(session, table, duplicate, group.master).await?;
        rewrite_queue(session, schema, &table.name, duplicate, group.master).await?;
        session.run(&delete, vec![duplicate.into()]).await?;
    }

    for field in &rule.derived {
        let Some(column) = shape.column(&field.column) else {
            continue;
        };
        let sql = format!(
            "UPDATE {} SET {} = ({}) WHERE {} = ?",
            quote_ident(&shape.name),
            quote_ident(column),
            field.expression,
            quote_ident(pk)
        );
        session.run(&sql, vec![group.master.into()]).await?;
    }
    Ok(repointed)
}

async fn normalize_rule_dates(
    session: &CacheSession<'_>,
    shape: &TableShape,
    pk: &str,
    rule: &DuplicateRule,
) -> Result<u64> {
    let mut changed = 0;
    for column in &rule.date_columns {
        let Some(local) = shape.column(column) else {
            continue;
        };
        let select = format!(
            "SELECT {pk_ident}, {col} AS value FROM {table} WHERE {col} IS NOT NULL",
            pk_ident = quote_ident(pk),
            col = quote_ident(local),
            table = quote_ident(&shape.name)
        );
        let update = format!(
            "UPDATE {} SET {} = ? WHERE {} = ?",
            quote_ident(&shape.name),
            quote_ident(local),
            quote_ident(pk)
        );

        for row in session.query(&select, Vec::new()).await? {
            let (Some(id), Some(value)) = (row.get(pk).and_then(SqlValue::as_i64), row.get("value")) else {
                continue;
            };
            let Some(normalized) = normalize_date(value) else {
                continue;
            };
            if value.as_str() != Some(normalized.as_str()) {
                changed += session.run(&update, vec![normalized.into(), id.into()]).await?;
            }
        }
    }
    Ok(changed)
}
