//! Local embedded cache: a libSQL database mirroring the remote store plus the
//! private queue and cursor tables.

mod cursor;
mod migrations;
mod mirror;
mod queue;

use std::path::Path;

use libsql::{Builder, Connection, Database};
use tokio::sync::{Mutex, MutexGuard};

use crate::error::{Error, Result};
use crate::models::{MutationResult, QueryOutcome, Row, SqlValue, Statement};
use crate::sql::{self, StatementKind};

pub use migrations::CLINIC_SCHEMA;
pub use mirror::MirrorReport;
pub use queue::QueueStats;

/// Column layout of a local table as reported by `PRAGMA table_info`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableShape {
    pub name: String,
    pub columns: Vec<String>,
    /// Primary-key columns in key order. Empty for rowid-only tables.
    pub primary_key: Vec<String>,
}

impl TableShape {
    /// Local spelling of `column`, matched case-insensitively.
    pub fn column(&self, column: &str) -> Option<&str> {
        self.columns
            .iter()
            .find(|candidate| candidate.eq_ignore_ascii_case(column))
            .map(String::as_str)
    }
}

/// The local cache database.
///
/// All access goes through one connection. [`LocalCache::session`] hands out
/// exclusive use of it, so a transaction opened on a session is never
/// interleaved with statements from another task.
pub struct LocalCache {
    _db: Database,
    conn: Mutex<Connection>,
}

impl LocalCache {
    /// Open (or create) a cache file and run migrations.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let db = Builder::new_local(&path_str).build().await?;
        Self::from_database(db).await
    }

    /// In-memory cache, used by tests and one-shot tools.
    pub async fn open_in_memory() -> Result<Self> {
        let db = Builder::new_local(":memory:").build().await?;
        Self::from_database(db).await
    }

    async fn from_database(db: Database) -> Result<Self> {
        let conn = db.connect()?;
        configure(&conn).await?;
        migrations::run(&conn).await?;
        Ok(Self {
            _db: db,
            conn: Mutex::new(conn),
        })
    }

    /// Exclusive access to the cache connection.
    pub async fn session(&self) -> CacheSession<'_> {
        let conn = self.conn.lock().await;
        if !conn.is_autocommit() {
            // A previous holder bailed out mid-transaction.
            tracing::warn!("Rolling back a transaction left open on the cache connection");
            conn.execute("ROLLBACK", ()).await.ok();
        }
        CacheSession { conn }
    }

    /// Run a local statement outside any explicit transaction.
    pub async fn execute(&self, statement: &Statement) -> Result<QueryOutcome> {
        self.session().await.execute(statement).await
    }

    pub async fn query(&self, sql: &str, params: Vec<SqlValue>) -> Result<Vec<Row>> {
        self.session().await.query(sql, params).await
    }
}

async fn configure(conn: &Connection) -> Result<()> {
    conn.execute("PRAGMA journal_mode = WAL;", ()).await.ok();
    conn.execute("PRAGMA synchronous = NORMAL;", ()).await.ok();
    // Partial mirror: parents may arrive after children.
    conn.execute("PRAGMA foreign_keys = OFF;", ()).await?;
    conn.execute("PRAGMA busy_timeout = 5000;", ()).await.ok();
    Ok(())
}

/// Exclusive handle on the cache connection.
pub struct CacheSession<'a> {
    conn: MutexGuard<'a, Connection>,
}

impl CacheSession<'_> {
    pub async fn begin(&self) -> Result<()> {
        self.conn.execute("BEGIN IMMEDIATE", ()).await?;
        Ok(())
    }

    pub async fn commit(&self) -> Result<()> {
        if let Err(error) = self.conn.execute("COMMIT", ()).await {
            self.conn.execute("ROLLBACK", ()).await.ok();
            return Err(error.into());
        }
        Ok(())
    }

    /// Best-effort rollback; errors are logged, not returned.
    pub async fn rollback(&self) {
        if let Err(error) = self.conn.execute("ROLLBACK", ()).await {
            tracing::debug!("Rollback failed: {error}");
        }
    }

    pub async fn execute(&self, statement: &Statement) -> Result<QueryOutcome> {
        let kind = sql::analyze(&statement.sql).kind;
        run_statement(&self.conn, statement, kind).await
    }

    pub async fn query(&self, sql: &str, params: Vec<SqlValue>) -> Result<Vec<Row>> {
        let statement = Statement::with_params(sql, params);
        let rows = self
            .conn
            .query(&statement.sql, statement.libsql_params())
            .await?;
        collect_rows(rows).await
    }

    /// Execute a statement that returns no rows; returns the change count.
    pub async fn run(&self, sql: &str, params: Vec<SqlValue>) -> Result<u64> {
        let statement = Statement::with_params(sql, params);
        Ok(self
            .conn
            .execute(&statement.sql, statement.libsql_params())
            .await?)
    }

    pub fn last_insert_rowid(&self) -> i64 {
        self.conn.last_insert_rowid()
    }

    /// Layout of a local table, or `None` when it does not exist.
    pub async fn table_shape(&self, table: &str) -> Result<Option<TableShape>> {
        if !sql::is_safe_identifier(table) {
            return Err(Error::validation(format!("unsafe table name `{table}`")));
        }
        let pragma = format!("PRAGMA table_info({})", sql::quote_ident(table));
        let mut rows = self.conn.query(&pragma, ()).await?;

        let mut columns = Vec::new();
        let mut keyed: Vec<(i64, String)> = Vec::new();
        while let Some(row) = rows.next().await? {
            let name: String = row.get(1)?;
            let pk_position: i64 = row.get(5)?;
            if pk_position > 0 {
                keyed.push((pk_position, name.clone()));
            }
            columns.push(name);
        }
        if columns.is_empty() {
            return Ok(None);
        }
        keyed.sort_by_key(|(position, _)| *position);

        Ok(Some(TableShape {
            name: table.to_string(),
            columns,
            primary_key: keyed.into_iter().map(|(_, name)| name).collect(),
        }))
    }

    /// Whether a row with `column = id` exists in `table`.
    pub async fn row_exists(&self, table: &str, column: &str, id: i64) -> Result<bool> {
        let sql = format!(
            "SELECT 1 FROM {} WHERE {} = ? LIMIT 1",
            sql::quote_ident(table),
            sql::quote_ident(column)
        );
        Ok(!self.query(&sql, vec![SqlValue::Integer(id)]).await?.is_empty())
    }
}

/// Run `statement` on `conn`, reading rows for reads and change counts otherwise.
pub(crate) async fn run_statement(
    conn: &Connection,
    statement: &Statement,
    kind: StatementKind,
) -> Result<QueryOutcome> {
    match kind {
        StatementKind::Read => {
            let rows = conn
                .query(&statement.sql, statement.libsql_params())
                .await?;
            Ok(QueryOutcome::Rows(collect_rows(rows).await?))
        }
        StatementKind::Session => Ok(QueryOutcome::empty()),
        StatementKind::Mutation(mutation) => {
            let rows_affected = conn
                .execute(&statement.sql, statement.libsql_params())
                .await?;
            let last_insert_id = (mutation.creates_rows() && rows_affected > 0)
                .then(|| conn.last_insert_rowid());
            Ok(QueryOutcome::Mutation(MutationResult {
                rows_affected,
                last_insert_id,
            }))
        }
        StatementKind::Schema => {
            let rows_affected = conn
                .execute(&statement.sql, statement.libsql_params())
                .await?;
            Ok(QueryOutcome::Mutation(MutationResult {
                rows_affected,
                last_insert_id: None,
            }))
        }
    }
}

pub(crate) async fn collect_rows(mut rows: libsql::Rows) -> Result<Vec<Row>> {
    let count = rows.column_count();
    let names: Vec<String> = (0..count)
        .map(|index| rows.column_name(index).unwrap_or_default().to_string())
        .collect();

    let mut out = Vec::new();
    while let Some(row) = rows.next().await? {
        let mut record = Row::with_capacity(names.len());
        for (index, name) in (0..count).zip(&names) {
            record.set(name.clone(), SqlValue::from(row.get_value(index)?));
        }
        out.push(record);
    }
    Ok(out)
}
