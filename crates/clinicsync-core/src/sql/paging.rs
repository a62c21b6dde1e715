//! Keeping pulled pages aligned to change-marker boundaries.

use std::cmp::Ordering;

use super::quote_ident;
use crate::models::{Row, SqlValue, Statement};

/// Remove the rows at the end of `rows` that share the last row's `marker`
/// value and return that value. A missing marker column counts as NULL.
///
/// A page cut by `LIMIT` can end partway through a run of equal markers;
/// trimming the run and re-reading it whole with [`marker_run`] lets the
/// cursor move past the run without losing any of it.
pub fn take_trailing_run(rows: &mut Vec<Row>, marker: &str) -> Option<SqlValue> {
    let last = rows
        .last()?
        .get(marker)
        .cloned()
        .unwrap_or(SqlValue::Null);
    while rows
        .last()
        .is_some_and(|row| same_marker(row.get(marker), &last))
    {
        rows.pop();
    }
    Some(last)
}

/// Every row of `table` whose `marker` equals `value`.
pub fn marker_run(table: &str, marker: &str, value: &SqlValue) -> Statement {
    if value.is_null() {
        Statement::new(format!(
            "SELECT * FROM {} WHERE {} IS NULL",
            quote_ident(table),
            quote_ident(marker)
        ))
    } else {
        Statement::new(format!(
            "SELECT * FROM {} WHERE {} = ?",
            quote_ident(table),
            quote_ident(marker)
        ))
        .bind(value.clone())
    }
}

fn same_marker(value: Option<&SqlValue>, marker: &SqlValue) -> bool {
    let value = value.unwrap_or(&SqlValue::Null);
    match (value.is_null(), marker.is_null()) {
        (true, true) => true,
        (false, false) => value.sql_cmp(marker) == Ordering::Equal,
        _ => false,
    }
}
