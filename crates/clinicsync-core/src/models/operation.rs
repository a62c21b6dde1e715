//! Pending operation queue model

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::value::SqlValue;
use super::Statement;

/// Lifecycle status of a queued local mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Waiting to be replayed against the remote store.
    Pending,
    /// Dead-lettered: retry budget exhausted or rejected outright.
    Error,
}

impl OperationStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(Self::Pending),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown operation status `{other}`")),
        }
    }
}

/// The serialized `body` of a queued operation: the literal statement that
/// produced the local write, plus the rowid it was given locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturedStatement {
    pub sql: String,
    #[serde(default)]
    pub params: Vec<SqlValue>,
    /// Provisional primary key minted by the local insert.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_id: Option<i64>,
}

impl CapturedStatement {
    pub fn new(statement: &Statement, local_id: Option<i64>) -> Self {
        Self {
            sql: statement.sql.clone(),
            params: statement.params.clone(),
            local_id,
        }
    }

    pub fn statement(&self) -> Statement {
        Statement::with_params(self.sql.clone(), self.params.clone())
    }
}

/// A queued local mutation awaiting replay.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingOperation {
    pub id: i64,
    /// `insert`, `update`, `delete` or `replace`.
    pub action: String,
    /// Table the statement writes to.
    pub target: String,
    pub method: String,
    pub body: CapturedStatement,
    pub status: OperationStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: String,
}

impl PendingOperation {
    pub const fn is_dead_letter(&self) -> bool {
        matches!(self.status, OperationStatus::Error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_text() {
        for status in [OperationStatus::Pending, OperationStatus::Error] {
            assert_eq!(status.as_str().parse::<OperationStatus>().unwrap(), status);
        }
        assert!("done".parse::<OperationStatus>().is_err());
    }

    #[test]
    fn captured_body_omits_missing_local_id() {
        let statement = Statement::new("UPDATE patients SET name = ? WHERE patient_id = ?")
            .bind("B")
            .bind(3);
        let body = serde_json::to_string(&CapturedStatement::new(&statement, None)).unwrap();
        assert!(!body.contains("local_id"));

        let parsed: CapturedStatement = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed.statement(), statement);
    }
}
