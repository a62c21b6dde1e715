//! Sync cursor and identity map document

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::value::SqlValue;

/// `(table, local_id)` key of an identity mapping.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct IdentityKey {
    pub table: String,
    pub local_id: i64,
}

impl IdentityKey {
    pub fn new(table: impl Into<String>, local_id: i64) -> Self {
        Self {
            table: table.into(),
            local_id,
        }
    }

    /// Document form: `"table:local_id"`.
    pub fn encode(&self) -> String {
        format!("{}:{}", self.table, self.local_id)
    }

    pub fn decode(value: &str) -> Option<Self> {
        let (table, id) = value.rsplit_once(':')?;
        if table.is_empty() {
            return None;
        }
        Some(Self::new(table, id.parse().ok()?))
    }
}

/// Persisted high-water marks and identity map.
///
/// Stored as a JSON document with the fields `global`, `tables` and
/// `idMappings` (`"table:local_id" -> remote_id`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncCursor {
    /// Highest change marker seen by the last pull in which every table merged.
    #[serde(default)]
    pub global: Option<SqlValue>,
    /// Per-table high-water marks.
    #[serde(default)]
    pub tables: BTreeMap<String, SqlValue>,
    #[serde(default, rename = "idMappings")]
    pub id_mappings: BTreeMap<String, i64>,
}

impl SyncCursor {
    pub fn table_marker(&self, table: &str) -> Option<&SqlValue> {
        self.tables.get(table)
    }

    /// Advances a table's marker; returns whether the stored value moved.
    /// Markers never rewind.
    pub fn advance_table(&mut self, table: &str, marker: &SqlValue) -> bool {
        if marker.is_null() {
            return false;
        }
        match self.tables.get(table) {
            Some(current) if current.sql_cmp(marker) != Ordering::Less => false,
            _ => {
                self.tables.insert(table.to_string(), marker.clone());
                true
            }
        }
    }

    pub fn advance_global(&mut self, marker: &SqlValue) -> bool {
        if marker.is_null() {
            return false;
        }
        match &self.global {
            Some(current) if current.sql_cmp(marker) != Ordering::Less => false,
            _ => {
                self.global = Some(marker.clone());
                true
            }
        }
    }

    pub fn remote_id(&self, table: &str, local_id: i64) -> Option<i64> {
        self.id_mappings
            .get(&IdentityKey::new(table, local_id).encode())
            .copied()
    }

    /// Records `(table, local_id) -> remote_id`, replacing any earlier mapping
    /// for the same key.
    pub fn record_mapping(&mut self, table: &str, local_id: i64, remote_id: i64) {
        self.id_mappings
            .insert(IdentityKey::new(table, local_id).encode(), remote_id);
    }

    pub fn remove_mapping(&mut self, table: &str, local_id: i64) -> Option<i64> {
        self.id_mappings
            .remove(&IdentityKey::new(table, local_id).encode())
    }

    /// Mappings whose local and remote ids still differ.
    pub fn unreconciled(&self) -> Vec<(IdentityKey, i64)> {
        self.id_mappings
            .iter()
            .filter_map(|(key, remote_id)| {
                let key = IdentityKey::decode(key)?;
                (key.local_id != *remote_id).then_some((key, *remote_id))
            })
            .collect()
    }
}
