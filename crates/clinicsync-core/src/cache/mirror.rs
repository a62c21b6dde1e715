//! Writing remote rows into local tables.

use tracing::{debug, warn};

use super::{CacheSession, TableShape};
use crate::error::Result;
use crate::models::{Row, SqlValue};
use crate::sql::quote_ident;

/// What happened to a batch of mirrored rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MirrorReport {
    /// False when the local table does not exist and nothing was attempted.
    pub table_known: bool,
    pub upserted: usize,
    /// Rows missing part of the local primary key.
    pub refused: usize,
    /// Rows the engine rejected.
    pub failed: usize,
}

impl CacheSession<'_> {
    /// Upserts `rows` into local `table` by primary key.
    ///
    /// Only columns present both in the row and in the local table are
    /// written, matched case-insensitively. A row that lacks any local
    /// primary-key column is refused rather than stored partially. Per-row
    /// failures are counted and skipped; callers decide on transactions.
    pub async fn mirror_rows(&self, table: &str, rows: &[Row]) -> Result<MirrorReport> {
        let Some(shape) = self.table_shape(table).await? else {
            debug!(table, "Skipping mirror into unknown local table");
            return Ok(MirrorReport::default());
        };

        let mut report = MirrorReport {
            table_known: true,
            ..MirrorReport::default()
        };
        for row in rows {
            let Some((sql, params)) = upsert_statement(&shape, row) else {
                report.refused += 1;
                continue;
            };
            match self.run(&sql, params).await {
                Ok(_) => report.upserted += 1,
                Err(error) => {
                    warn!(table, "Failed to mirror row: {error}");
                    report.failed += 1;
                }
            }
        }

        if report.refused > 0 {
            warn!(
                table,
                refused = report.refused,
                "Refused rows missing primary-key columns"
            );
        }
        Ok(report)
    }
}

/// `INSERT ... ON CONFLICT(pk) DO UPDATE` for the columns `row` shares with
/// the local table. `None` when the row cannot be mirrored safely.
fn upsert_statement(shape: &TableShape, row: &Row) -> Option<(String, Vec<SqlValue>)> {
    let mut columns = Vec::new();
    let mut params = Vec::new();
    for (name, value) in row.iter() {
        if let Some(local) = shape.column(name) {
            if !columns.contains(&local) {
                columns.push(local);
                params.push(value.clone());
            }
        }
    }

    let has_full_key = shape
        .primary_key
        .iter()
        .all(|key| columns.iter().any(|column| column.eq_ignore_ascii_case(key)));
    if columns.is_empty() || !has_full_key {
        return None;
    }

    let column_list = columns
        .iter()
        .map(|column| quote_ident(column))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = vec!["?"; columns.len()].join(", ");
    let mut sql = format!(
        "INSERT INTO {} ({column_list}) VALUES ({placeholders})",
        quote_ident(&shape.name)
    );

    if !shape.primary_key.is_empty() {
        let conflict = shape
            .primary_key
            .iter()
            .map(|key| quote_ident(key))
            .collect::<Vec<_>>()
            .join(", ");
        let updates = columns
            .iter()
            .filter(|column| !shape.primary_key.iter().any(|key| key == *column))
            .map(|column| format!("{0} = excluded.{0}", quote_ident(column)))
            .collect::<Vec<_>>();
        if updates.is_empty() {
            sql.push_str(&format!(" ON CONFLICT({conflict}) DO NOTHING"));
        } else {
            sql.push_str(&format!(
                " ON CONFLICT({conflict}) DO UPDATE SET {}",
                updates.join(", ")
            ));
        }
    }

    Some((sql, params))
}
