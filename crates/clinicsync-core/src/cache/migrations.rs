//! Cache migrations

use crate::error::Result;
use libsql::Connection;

/// Clinic domain tables, shared with remote fixtures and the bridge bootstrap.
///
/// Keys are `INTEGER PRIMARY KEY` rowid aliases. Foreign keys are plain
/// columns; the cache is a partial mirror and cannot enforce them.
pub const CLINIC_SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS branches (
        branch_id INTEGER PRIMARY KEY,
        name TEXT,
        address TEXT,
        phone_number TEXT,
        created_at TEXT,
        updated_at TEXT
    )",
    "CREATE TABLE IF NOT EXISTS employees (
        employee_id INTEGER PRIMARY KEY,
        branch_id INTEGER,
        full_name TEXT,
        role TEXT,
        phone_number TEXT,
        is_active INTEGER DEFAULT 1,
        created_at TEXT,
        updated_at TEXT
    )",
    "CREATE TABLE IF NOT EXISTS payment_methods (
        method_id INTEGER PRIMARY KEY,
        name TEXT,
        is_active INTEGER DEFAULT 1,
        created_at TEXT,
        updated_at TEXT
    )",
    "CREATE TABLE IF NOT EXISTS registrations (
        registration_id INTEGER PRIMARY KEY,
        branch_id INTEGER,
        patient_name TEXT,
        phone_number TEXT,
        age INTEGER,
        gender TEXT,
        total_amount REAL DEFAULT 0,
        paid_amount REAL DEFAULT 0,
        due_amount REAL DEFAULT 0,
        status TEXT DEFAULT 'pending',
        created_at TEXT,
        updated_at TEXT
    )",
    "CREATE TABLE IF NOT EXISTS patients (
        patient_id INTEGER PRIMARY KEY,
        registration_id INTEGER,
        patient_name TEXT,
        phone_number TEXT,
        diagnosis TEXT,
        created_at TEXT,
        updated_at TEXT
    )",
    "CREATE TABLE IF NOT EXISTS tests (
        test_id INTEGER PRIMARY KEY,
        registration_id INTEGER,
        patient_id INTEGER,
        test_uid TEXT,
        test_name TEXT,
        total_amount REAL DEFAULT 0,
        paid_amount REAL DEFAULT 0,
        status TEXT,
        created_at TEXT,
        updated_at TEXT
    )",
    "CREATE TABLE IF NOT EXISTS test_items (
        item_id INTEGER PRIMARY KEY,
        test_id INTEGER,
        item_name TEXT,
        amount REAL DEFAULT 0,
        created_at TEXT,
        updated_at TEXT
    )",
    "CREATE TABLE IF NOT EXISTS attendance (
        attendance_id INTEGER PRIMARY KEY,
        patient_id INTEGER,
        attendance_date TEXT,
        remarks TEXT,
        created_at TEXT
    )",
    "CREATE TABLE IF NOT EXISTS payments (
        payment_id INTEGER PRIMARY KEY,
        registration_id INTEGER,
        patient_id INTEGER,
        test_id INTEGER,
        method_id INTEGER,
        amount REAL DEFAULT 0,
        remarks TEXT,
        created_at TEXT
    )",
    "CREATE TABLE IF NOT EXISTS inquiries (
        inquiry_id INTEGER PRIMARY KEY,
        name TEXT,
        phone_number TEXT,
        message TEXT,
        status TEXT,
        created_at TEXT,
        updated_at TEXT
    )",
    "CREATE TABLE IF NOT EXISTS treatment_plans (
        plan_id INTEGER PRIMARY KEY,
        patient_id INTEGER,
        employee_id INTEGER,
        description TEXT,
        start_date TEXT,
        end_date TEXT,
        created_at TEXT,
        updated_at TEXT
    )",
    "CREATE TABLE IF NOT EXISTS notifications (
        notification_id INTEGER PRIMARY KEY,
        title TEXT,
        body TEXT,
        is_read INTEGER DEFAULT 0,
        created_at TEXT
    )",
    "CREATE TABLE IF NOT EXISTS expenses (
        expense_id INTEGER PRIMARY KEY,
        branch_id INTEGER,
        employee_id INTEGER,
        description TEXT,
        amount REAL DEFAULT 0,
        expense_date TEXT,
        created_at TEXT,
        updated_at TEXT
    )",
    "CREATE TABLE IF NOT EXISTS roles (
        role_id INTEGER PRIMARY KEY,
        name TEXT,
        created_at TEXT
    )",
    "CREATE TABLE IF NOT EXISTS users (
        user_id INTEGER PRIMARY KEY,
        role_id INTEGER,
        username TEXT,
        full_name TEXT,
        created_at TEXT,
        updated_at TEXT
    )",
    "CREATE TABLE IF NOT EXISTS user_sessions (
        session_id TEXT PRIMARY KEY,
        user_id INTEGER,
        expires_at TEXT,
        created_at TEXT
    )",
    "CREATE TABLE IF NOT EXISTS system_settings (
        setting_key TEXT PRIMARY KEY,
        setting_value TEXT,
        updated_at TEXT
    )",
];

const CURRENT_VERSION: i32 = 2;

/// Run all pending migrations
pub async fn run(conn: &Connection) -> Result<()> {
    let version = get_version(conn).await?;

    if version < 1 {
        apply(conn, 1, &private_tables()).await?;
    }
    if version < 2 {
        apply(conn, 2, CLINIC_SCHEMA).await?;
    }

    debug_assert_eq!(get_version(conn).await?, CURRENT_VERSION);
    Ok(())
}

async fn get_version(conn: &Connection) -> Result<i32> {
    let mut rows = conn
        .query(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
            (),
        )
        .await?;

    let exists: bool = if let Some(row) = rows.next().await? {
        row.get::<i32>(0)? != 0
    } else {
        false
    };

    if !exists {
        return Ok(0);
    }

    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM schema_version", ())
        .await?;

    let version: i32 = if let Some(row) = rows.next().await? {
        row.get(0)?
    } else {
        0
    };

    Ok(version)
}

/// Version 1: queue and cursor tables.
fn private_tables() -> [&'static str; 4] {
    [
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        )",
        "CREATE TABLE IF NOT EXISTS pending_operations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            action TEXT NOT NULL,
            target TEXT NOT NULL,
            method TEXT NOT NULL DEFAULT 'statement',
            body TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            attempts INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            created_at TEXT NOT NULL
        )",
        "CREATE INDEX IF NOT EXISTS idx_pending_operations_status
            ON pending_operations(status, id)",
        "CREATE TABLE IF NOT EXISTS sync_state (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
    ]
}

async fn apply(conn: &Connection, version: i32, statements: &[&str]) -> Result<()> {
    conn.execute("BEGIN TRANSACTION", ()).await?;

    for stmt in statements {
        if let Err(e) = conn.execute(stmt, ()).await {
            conn.execute("ROLLBACK", ()).await.ok();
            return Err(e.into());
        }
    }

    if let Err(e) = conn
        .execute("INSERT INTO schema_version (version) VALUES (?)", [version])
        .await
    {
        conn.execute("ROLLBACK", ()).await.ok();
        return Err(e.into());
    }

    if let Err(e) = conn.execute("COMMIT", ()).await {
        conn.execute("ROLLBACK", ()).await.ok();
        return Err(e.into());
    }

    tracing::info!("Migrated cache to version {version}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use libsql::Builder;

    #[tokio::test(flavor = "multi_thread")]
    async fn migrations_are_idempotent() {
        let db = Builder::new_local(":memory:").build().await.unwrap();
        let conn = db.connect().unwrap();

        run(&conn).await.unwrap();
        run(&conn).await.unwrap();

        assert_eq!(get_version(&conn).await.unwrap(), CURRENT_VERSION);
    }
}
