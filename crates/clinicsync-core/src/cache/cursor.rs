//! Cursor document persistence in `sync_state`.

use super::CacheSession;
use crate::error::Result;
use crate::models::{SqlValue, SyncCursor};
use crate::util::timestamp_now;

const CURSOR_KEY: &str = "cursor";

impl CacheSession<'_> {
    /// The stored cursor, or an empty one before the first pull.
    pub async fn load_cursor(&self) -> Result<SyncCursor> {
        let rows = self
            .query(
                "SELECT value FROM sync_state WHERE key = ?",
                vec![CURSOR_KEY.into()],
            )
            .await?;
        match rows
            .first()
            .and_then(|row| row.get("value"))
            .and_then(SqlValue::as_str)
        {
            Some(document) => Ok(serde_json::from_str(document)?),
            None => Ok(SyncCursor::default()),
        }
    }

    pub async fn save_cursor(&self, cursor: &SyncCursor) -> Result<()> {
        let document = serde_json::to_string(cursor)?;
        self.run(
            "INSERT INTO sync_state (key, value, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            vec![CURSOR_KEY.into(), document.into(), timestamp_now().into()],
        )
        .await?;
        Ok(())
    }
}
