//! Statements and their outcomes

use serde::{Deserialize, Serialize};

use super::value::{Row, SqlValue};

/// A SQL-like statement with positional `?` parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    pub sql: String,
    #[serde(default)]
    pub params: Vec<SqlValue>,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    pub fn with_params(sql: impl Into<String>, params: Vec<SqlValue>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }

    #[must_use]
    pub fn bind(mut self, value: impl Into<SqlValue>) -> Self {
        self.params.push(value.into());
        self
    }

    pub(crate) fn libsql_params(&self) -> libsql::params::Params {
        libsql::params::Params::Positional(
            self.params.iter().cloned().map(libsql::Value::from).collect(),
        )
    }
}

/// Result of a statement that changed data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationResult {
    pub rows_affected: u64,
    /// Rowid assigned by the last insert, when the statement inserted a row.
    #[serde(default)]
    pub last_insert_id: Option<i64>,
}

/// Either the rows of a read or the effect of a mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "result", rename_all = "snake_case")]
pub enum QueryOutcome {
    Rows(Vec<Row>),
    Mutation(MutationResult),
}

impl QueryOutcome {
    pub const fn empty() -> Self {
        Self::Rows(Vec::new())
    }

    pub fn rows(&self) -> &[Row] {
        match self {
            Self::Rows(rows) => rows,
            Self::Mutation(_) => &[],
        }
    }

    pub fn into_rows(self) -> Vec<Row> {
        match self {
            Self::Rows(rows) => rows,
            Self::Mutation(_) => Vec::new(),
        }
    }

    pub const fn mutation(&self) -> Option<MutationResult> {
        match self {
            Self::Rows(_) => None,
            Self::Mutation(result) => Some(*result),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn outcome_wire_format_is_adjacently_tagged() {
        let outcome = QueryOutcome::Mutation(MutationResult {
            rows_affected: 1,
            last_insert_id: Some(87),
        });
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "kind": "mutation",
                "result": {"rows_affected": 1, "last_insert_id": 87}
            })
        );

        let rows: QueryOutcome =
            serde_json::from_str(r#"{"kind":"rows","result":[{"id":1}]}"#).unwrap();
        assert_eq!(rows.rows().len(), 1);
        assert_eq!(rows.mutation(), None);
    }

    #[test]
    fn statement_params_default_to_empty() {
        let statement: Statement = serde_json::from_str(r#"{"sql":"SELECT 1"}"#).unwrap();
        assert!(statement.params.is_empty());
        let bound = Statement::new("SELECT ?").bind(5).bind("x");
        assert_eq!(bound.params, vec![SqlValue::Integer(5), SqlValue::from("x")]);
    }
}
