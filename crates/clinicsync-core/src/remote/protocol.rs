//! Wire types for the HTTP bridge.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::{MutationResult, Row, SqlValue, Statement};
use crate::sql::{is_safe_identifier, quote_ident};

pub const HEALTH_PATH: &str = "/healthz";
pub const QUERY_PATH: &str = "/v1/query";
pub const WRITE_PATH: &str = "/v1/write";
pub const BATCH_PATH: &str = "/v1/batch";
pub const CHANGES_PATH: &str = "/v1/changes";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteAction {
    Insert,
    Update,
}

/// One structured row write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteRequest {
    pub table: String,
    pub action: WriteAction,
    pub data: Row,
    /// Key column for updates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pk: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pk_val: Option<SqlValue>,
}

impl WriteRequest {
    pub fn insert(table: impl Into<String>, data: Row) -> Self {
        Self {
            table: table.into(),
            action: WriteAction::Insert,
            data,
            pk: None,
            pk_val: None,
        }
    }

    pub fn update(
        table: impl Into<String>,
        data: Row,
        pk: impl Into<String>,
        pk_val: impl Into<SqlValue>,
    ) -> Self {
        Self {
            table: table.into(),
            action: WriteAction::Update,
            data,
            pk: Some(pk.into()),
            pk_val: Some(pk_val.into()),
        }
    }

    /// Parameterized statement for this write. Every interpolated name must be
    /// a safe identifier.
    pub fn to_statement(&self) -> Result<Statement> {
        check(&self.table, "table")?;
        if self.data.is_empty() {
            return Err(Error::validation("write has no data"));
        }
        for column in self.data.columns() {
            check(column, "column")?;
        }

        let params: Vec<SqlValue> = self.data.iter().map(|(_, value)| value.clone()).collect();
        match self.action {
            WriteAction::Insert => {
                let columns = self
                    .data
                    .columns()
                    .map(quote_ident)
                    .collect::<Vec<_>>()
                    .join(", ");
                let placeholders = vec!["?"; self.data.len()].join(", ");
                Ok(Statement::with_params(
                    format!(
                        "INSERT INTO {} ({columns}) VALUES ({placeholders})",
                        quote_ident(&self.table)
                    ),
                    params,
                ))
            }
            WriteAction::Update => {
                let pk = self
                    .pk
                    .as_deref()
                    .ok_or_else(|| Error::validation("update requires `pk`"))?;
                check(pk, "key column")?;
                let pk_val = self
                    .pk_val
                    .clone()
                    .filter(|value| !value.is_null())
                    .ok_or_else(|| Error::validation("update requires `pk_val`"))?;

                let assignments = self
                    .data
                    .columns()
                    .map(|column| format!("{} = ?", quote_ident(column)))
                    .collect::<Vec<_>>()
                    .join(", ");
                let mut params = params;
                params.push(pk_val);
                Ok(Statement::with_params(
                    format!(
                        "UPDATE {} SET {assignments} WHERE {} = ?",
                        quote_ident(&self.table),
                        quote_ident(pk)
                    ),
                    params,
                ))
            }
        }
    }
}

fn check(name: &str, what: &str) -> Result<()> {
    if is_safe_identifier(name) {
        Ok(())
    } else {
        Err(Error::validation(format!("invalid {what} name `{name}`")))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub operations: Vec<WriteRequest>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResponse {
    pub results: Vec<MutationResult>,
}

/// `GET /v1/changes` response: rows per table with a marker past `since`.
pub type ChangesResponse = BTreeMap<String, Vec<Row>>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangesQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}
