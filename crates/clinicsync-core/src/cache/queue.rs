//! Persisted pending-operation queue.

use serde::Serialize;

use super::CacheSession;
use crate::error::{Error, Result};
use crate::models::{CapturedStatement, OperationStatus, PendingOperation, Row, SqlValue};
use crate::util::timestamp_now;

const SELECT_OPERATIONS: &str = "SELECT id, action, target, method, body, status, attempts, \
                                 last_error, created_at FROM pending_operations";

/// Queue depth by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: u64,
    pub dead_letters: u64,
}

impl CacheSession<'_> {
    /// Append a captured statement. Call inside the transaction that made the
    /// local write so both commit or neither does.
    pub async fn enqueue(&self, action: &str, target: &str, body: &CapturedStatement) -> Result<i64> {
        let payload = serde_json::to_string(body)?;
        self.run(
            "INSERT INTO pending_operations (action, target, method, body, status, attempts, created_at)
             VALUES (?, ?, 'statement', ?, ?, 0, ?)",
            vec![
                action.into(),
                target.into(),
                payload.into(),
                OperationStatus::Pending.as_str().into(),
                timestamp_now().into(),
            ],
        )
        .await?;
        Ok(self.last_insert_rowid())
    }

    /// Pending operations in replay order.
    pub async fn pending_operations(&self, limit: Option<u32>) -> Result<Vec<PendingOperation>> {
        let sql = format!(
            "{SELECT_OPERATIONS} WHERE status = ? ORDER BY id ASC LIMIT ?"
        );
        let limit = limit.map_or(-1, i64::from);
        self.load_operations(&sql, vec![OperationStatus::Pending.as_str().into(), limit.into()])
            .await
    }

    pub async fn dead_letters(&self) -> Result<Vec<PendingOperation>> {
        let sql = format!("{SELECT_OPERATIONS} WHERE status = ? ORDER BY id ASC");
        self.load_operations(&sql, vec![OperationStatus::Error.as_str().into()])
            .await
    }

    pub async fn operation(&self, id: i64) -> Result<Option<PendingOperation>> {
        let sql = format!("{SELECT_OPERATIONS} WHERE id = ?");
        Ok(self.load_operations(&sql, vec![id.into()]).await?.pop())
    }

    /// Remove an operation the remote store acknowledged.
    pub async fn complete_operation(&self, id: i64) -> Result<()> {
        self.run("DELETE FROM pending_operations WHERE id = ?", vec![id.into()])
            .await?;
        Ok(())
    }

    /// Record a failed replay; `dead_letter` moves it out of the replay set.
    pub async fn record_failure(
        &self,
        id: i64,
        attempts: u32,
        error: &str,
        dead_letter: bool,
    ) -> Result<()> {
        let status = if dead_letter {
            OperationStatus::Error
        } else {
            OperationStatus::Pending
        };
        self.run(
            "UPDATE pending_operations SET attempts = ?, last_error = ?, status = ? WHERE id = ?",
            vec![
                i64::from(attempts).into(),
                error.into(),
                status.as_str().into(),
                id.into(),
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn update_operation_body(&self, id: i64, body: &CapturedStatement) -> Result<()> {
        let payload = serde_json::to_string(body)?;
        self.run(
            "UPDATE pending_operations SET body = ? WHERE id = ?",
            vec![payload.into(), id.into()],
        )
        .await?;
        Ok(())
    }

    /// Put a dead-lettered operation back in line with a fresh retry budget.
    pub async fn requeue(&self, id: i64) -> Result<()> {
        let changed = self
            .run(
                "UPDATE pending_operations SET status = ?, attempts = 0, last_error = NULL
                 WHERE id = ? AND status = ?",
                vec![
                    OperationStatus::Pending.as_str().into(),
                    id.into(),
                    OperationStatus::Error.as_str().into(),
                ],
            )
            .await?;
        if changed == 0 {
            return Err(Error::NotFound(format!("dead-lettered operation {id}")));
        }
        Ok(())
    }

    /// Requeue every dead letter; returns how many moved.
    pub async fn requeue_all(&self) -> Result<u64> {
        self.run(
            "UPDATE pending_operations SET status = ?, attempts = 0, last_error = NULL
             WHERE status = ?",
            vec![
                OperationStatus::Pending.as_str().into(),
                OperationStatus::Error.as_str().into(),
            ],
        )
        .await
    }

    pub async fn queue_stats(&self) -> Result<QueueStats> {
        let rows = self
            .query(
                "SELECT status, COUNT(*) AS total FROM pending_operations GROUP BY status",
                Vec::new(),
            )
            .await?;

        let mut stats = QueueStats::default();
        for row in rows {
            let total = row
                .get("total")
                .and_then(SqlValue::as_i64)
                .and_then(|total| u64::try_from(total).ok())
                .unwrap_or(0);
            match row.get("status").and_then(SqlValue::as_str) {
                Some("pending") => stats.pending = total,
                Some("error") => stats.dead_letters = total,
                _ => {}
            }
        }
        Ok(stats)
    }

    async fn load_operations(&self, sql: &str, params: Vec<SqlValue>) -> Result<Vec<PendingOperation>> {
        self.query(sql, params)
            .await?
            .iter()
            .map(operation_from_row)
            .collect()
    }
}

fn operation_from_row(row: &Row) -> Result<PendingOperation> {
    let text = |column: &str| -> Result<String> {
        row.get(column)
            .and_then(SqlValue::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::Database(format!("pending operation is missing `{column}`")))
    };

    let id = row
        .get("id")
        .and_then(SqlValue::as_i64)
        .ok_or_else(|| Error::Database("pending operation is missing `id`".to_string()))?;
    let body: CapturedStatement = serde_json::from_str(&text("body")?)?;
    let status = text("status")?
        .parse::<OperationStatus>()
        .map_err(Error::Database)?;
    let attempts = row
        .get("attempts")
        .and_then(SqlValue::as_i64)
        .and_then(|attempts| u32::try_from(attempts).ok())
        .unwrap_or(0);

    Ok(PendingOperation {
        id,
        action: text("action")?,
        target: text("target")?,
        method: text("method")?,
        body,
        status,
        attempts,
        last_error: row
            .get("last_error")
            .and_then(SqlValue::as_str)
            .map(str::to_string),
        created_at: text("created_at")?,
    })
}
