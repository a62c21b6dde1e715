//! Table classification inputs: syncable tables, authoritative tables and
//! duplicate-detection rules.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::sql::is_safe_identifier;

/// A column in another table that holds this table's primary key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeyRef {
    pub table: String,
    pub column: String,
}

impl ForeignKeyRef {
    pub fn new(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            column: column.into(),
        }
    }
}

/// A domain table mirrored into the local cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncableTable {
    pub name: String,
    pub primary_key: Vec<String>,
    /// Creation or update timestamp used for incremental pull.
    pub change_marker: String,
    #[serde(default)]
    pub dependents: Vec<ForeignKeyRef>,
}

impl SyncableTable {
    pub fn new(name: &str, primary_key: &str, change_marker: &str) -> Self {
        Self {
            name: name.to_string(),
            primary_key: vec![primary_key.to_string()],
            change_marker: change_marker.to_string(),
            dependents: Vec::new(),
        }
    }

    #[must_use]
    pub fn referenced_by(mut self, table: &str, column: &str) -> Self {
        self.dependents.push(ForeignKeyRef::new(table, column));
        self
    }

    /// The primary-key column when the key is a single column.
    pub fn single_primary_key(&self) -> Option<&str> {
        match self.primary_key.as_slice() {
            [column] => Some(column),
            _ => None,
        }
    }
}

/// A derived column on the master row, recomputed after a duplicate merge.
///
/// `expression` is evaluated as `UPDATE <table> SET <column> = (<expression>)`
/// against the master row, so it may reference the row's own columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedField {
    pub column: String,
    pub expression: String,
}

/// Natural-identity key used to fold duplicate rows of one table together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateRule {
    pub table: String,
    pub key_columns: Vec<String>,
    /// Key columns normalized to a calendar date before comparison.
    #[serde(default)]
    pub date_columns: Vec<String>,
    /// Recomputed on the master in declaration order.
    #[serde(default)]
    pub derived: Vec<DerivedField>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSchema {
    /// Pull order; parents before children.
    pub tables: Vec<SyncableTable>,
    /// Tables that are always read and written against the remote store.
    #[serde(default)]
    pub authoritative: Vec<String>,
    #[serde(default)]
    pub duplicate_rules: Vec<DuplicateRule>,
}

impl SyncSchema {
    /// Load and validate a schema from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let payload = std::fs::read_to_string(path)?;
        let schema: Self = serde_json::from_str(&payload)?;
        schema.validate()?;
        Ok(schema)
    }

    pub fn table(&self, name: &str) -> Option<&SyncableTable> {
        self.tables
            .iter()
            .find(|table| table.name.eq_ignore_ascii_case(name))
    }

    pub fn is_syncable(&self, name: &str) -> bool {
        self.table(name).is_some()
    }

    pub fn is_authoritative(&self, name: &str) -> bool {
        self.authoritative
            .iter()
            .any(|table| table.eq_ignore_ascii_case(name))
    }

    /// The parent table whose primary key `table.column` holds, if declared.
    pub fn parent_of(&self, table: &str, column: &str) -> Option<&SyncableTable> {
        self.tables.iter().find(|parent| {
            parent.dependents.iter().any(|dependent| {
                dependent.table.eq_ignore_ascii_case(table)
                    && dependent.column.eq_ignore_ascii_case(column)
            })
        })
    }

    /// Rejects names that cannot be safely interpolated and rules pointing at
    /// unknown tables.
    pub fn validate(&self) -> Result<()> {
        for table in &self.tables {
            check_identifier(&table.name)?;
            check_identifier(&table.change_marker)?;
            if table.primary_key.is_empty() {
                return Err(Error::validation(format!(
                    "table `{}` must declare a primary key",
                    table.name
                )));
            }
            for column in &table.primary_key {
                check_identifier(column)?;
            }
            for dependent in &table.dependents {
                check_identifier(&dependent.table)?;
                check_identifier(&dependent.column)?;
            }
        }
        for table in &self.authoritative {
            check_identifier(table)?;
        }
        for rule in &self.duplicate_rules {
            let table = self.table(&rule.table).ok_or_else(|| {
                Error::validation(format!(
                    "duplicate rule references unknown table `{}`",
                    rule.table
                ))
            })?;
            if table.single_primary_key().is_none() {
                return Err(Error::validation(format!(
                    "duplicate rule on `{}` needs a single-column primary key",
                    rule.table
                )));
            }
            if rule.key_columns.is_empty() {
                return Err(Error::validation(format!(
                    "duplicate rule on `{}` has no key columns",
                    rule.table
                )));
            }
            for column in rule.key_columns.iter().chain(&rule.date_columns) {
                check_identifier(column)?;
            }
            for field in &rule.derived {
                check_identifier(&field.column)?;
            }
        }
        Ok(())
    }

    /// The built-in clinic schema.
    pub fn clinic() -> Self {
        let tables = vec![
            SyncableTable::new("branches", "branch_id", "updated_at")
                .referenced_by("employees", "branch_id")
                .referenced_by("registrations", "branch_id")
                .referenced_by("expenses", "branch_id"),
            SyncableTable::new("employees", "employee_id", "updated_at")
                .referenced_by("treatment_plans", "employee_id")
                .referenced_by("expenses", "employee_id"),
            SyncableTable::new("payment_methods", "method_id", "updated_at")
                .referenced_by("payments", "method_id"),
            SyncableTable::new("registrations", "registration_id", "updated_at")
                .referenced_by("patients", "registration_id")
                .referenced_by("payments", "registration_id")
                .referenced_by("tests", "registration_id"),
            SyncableTable::new("patients", "patient_id", "updated_at")
                .referenced_by("attendance", "patient_id")
                .referenced_by("treatment_plans", "patient_id")
                .referenced_by("payments", "patient_id")
                .referenced_by("tests", "patient_id"),
            SyncableTable::new("tests", "test_id", "updated_at")
                .referenced_by("test_items", "test_id")
                .referenced_by("payments", "test_id"),
            SyncableTable::new("test_items", "item_id", "updated_at"),
            SyncableTable::new("attendance", "attendance_id", "created_at"),
            SyncableTable::new("payments", "payment_id", "created_at"),
            SyncableTable::new("inquiries", "inquiry_id", "updated_at"),
            SyncableTable::new("treatment_plans", "plan_id", "updated_at"),
            SyncableTable::new("notifications", "notification_id", "created_at"),
            SyncableTable::new("expenses", "expense_id", "updated_at"),
        ];

        let duplicate_rules = vec![
            DuplicateRule {
                table: "registrations".to_string(),
                key_columns: vec!["patient_name".to_string(), "phone_number".to_string()],
                date_columns: Vec::new(),
                derived: vec![
                    DerivedField {
                        column: "paid_amount".to_string(),
                        expression: "SELECT COALESCE(SUM(p.amount), 0) FROM payments p \
                                     WHERE p.registration_id = registrations.registration_id"
                            .to_string(),
                    },
                    DerivedField {
                        column: "due_amount".to_string(),
                        expression: "MAX(COALESCE(total_amount, 0) - COALESCE(paid_amount, 0), 0)"
                            .to_string(),
                    },
                    DerivedField {
                        column: "status".to_string(),
                        expression: "CASE WHEN due_amount <= 0 THEN 'paid' \
                                     WHEN paid_amount > 0 THEN 'partial' ELSE 'pending' END"
                            .to_string(),
                    },
                ],
            },
            DuplicateRule {
                table: "tests".to_string(),
                key_columns: vec!["test_uid".to_string()],
                date_columns: Vec::new(),
                derived: vec![DerivedField {
                    column: "paid_amount".to_string(),
                    expression: "SELECT COALESCE(SUM(p.amount), 0) FROM payments p \
                                 WHERE p.test_id = tests.test_id"
                        .to_string(),
                }],
            },
            DuplicateRule {
                table: "attendance".to_string(),
                key_columns: vec!["patient_id".to_string(), "attendance_date".to_string()],
                date_columns: vec!["attendance_date".to_string()],
                derived: Vec::new(),
            },
        ];

        Self {
            tables,
            authoritative: ["users", "user_sessions", "system_settings", "roles"]
                .into_iter()
                .map(str::to_string)
                .collect(),
            duplicate_rules,
        }
    }
}

impl Default for SyncSchema {
    fn default() -> Self {
        Self::clinic()
    }
}

fn check_identifier(name: &str) -> Result<()> {
    if is_safe_identifier(name) {
        Ok(())
    } else {
        Err(Error::validation(format!("unsafe identifier `{name}`")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clinic_schema_is_valid() {
        let schema = SyncSchema::clinic();
        schema.validate().unwrap();
        assert!(schema.is_syncable("Registrations"));
        assert!(schema.is_authoritative("user_sessions"));
        assert!(!schema.is_authoritative("patients"));
    }

    #[test]
    fn parent_lookup_follows_dependents() {
        let schema = SyncSchema::clinic();
        assert_eq!(
            schema.parent_of("patients", "registration_id").map(|t| t.name.as_str()),
            Some("registrations")
        );
        assert!(schema.parent_of("patients", "patient_name").is_none());
    }

    #[test]
    fn validation_rejects_unsafe_identifiers() {
        let mut schema = SyncSchema::clinic();
        schema.tables[0].change_marker = "updated_at; DROP TABLE x".to_string();
        assert!(schema.validate().is_err());
    }

    #[test]
    fn validation_rejects_rules_on_unknown_tables() {
        let mut schema = SyncSchema::clinic();
        schema.duplicate_rules[0].table = "ghosts".to_string();
        let error = schema.validate().unwrap_err();
        assert!(error.to_string().contains("ghosts"));
    }

    #[test]
    fn schema_loads_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schema.json");
        let schema = SyncSchema {
            tables: vec![SyncableTable::new("visits", "visit_id", "updated_at")],
            authoritative: vec!["users".to_string()],
            duplicate_rules: Vec::new(),
        };
        std::fs::write(&path, serde_json::to_string(&schema).unwrap()).unwrap();

        assert_eq!(SyncSchema::from_json_file(&path).unwrap(), schema);
    }
}
