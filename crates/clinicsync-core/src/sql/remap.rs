//! Rewrites bound identifiers in a captured statement.

use std::cell::RefCell;

use crate::models::{Statement, SyncCursor, SyncSchema, SyncableTable};

use super::{analyze, placeholder_columns};

/// Replaces provisional local ids bound to key columns with their remote ids
/// from the cursor's identity map.
pub fn remap_local_ids(statement: &Statement, schema: &SyncSchema, cursor: &SyncCursor) -> Statement {
    remap_ids(statement, schema, |table, local_id| {
        cursor.remote_id(table, local_id)
    })
}

/// Generic form of [`remap_local_ids`]: `lookup(table, id)` returns the
/// replacement id for a key of `table`, if any.
///
/// A parameter is a key of table `P` when it binds a column that `P` lists as
/// a dependent of its primary key, or when it binds the write target's own
/// primary key in an `UPDATE` or `DELETE`. Only parameters whose column can be
/// determined from the statement shape are considered.
pub fn remap_ids<F>(statement: &Statement, schema: &SyncSchema, lookup: F) -> Statement
where
    F: Fn(&str, i64) -> Option<i64>,
{
    let info = analyze(&statement.sql);
    let Some(target) = info.target() else {
        return statement.clone();
    };
    let own_table = schema.table(target);
    let own_key = own_table.and_then(SyncableTable::single_primary_key);
    let remap_own_key = info.mutation().is_some_and(|kind| !kind.creates_rows());

    let columns = placeholder_columns(&statement.sql);
    let params = statement
        .params
        .iter()
        .enumerate()
        .map(|(index, value)| {
            let Some(Some(column)) = columns.get(index) else {
                return value.clone();
            };
            let Some(id) = value.as_i64() else {
                return value.clone();
            };

            let owner = schema
                .parent_of(target, column)
                .map(|parent| parent.name.as_str())
                .or_else(|| {
                    let is_own_key =
                        remap_own_key && own_key.is_some_and(|key| key.eq_ignore_ascii_case(column));
                    is_own_key.then(|| own_table.map(|table| table.name.as_str())).flatten()
                });

            owner
                .and_then(|owner| lookup(owner, id))
                .map_or_else(|| value.clone(), |replacement| value.with_same_shape(replacement))
        })
        .collect();

    Statement::with_params(statement.sql.clone(), params)
}

/// Every `(table, id)` key a statement binds, in the sense of [`remap_ids`].
/// Table names are lowercased.
pub fn bound_keys(statement: &Statement, schema: &SyncSchema) -> Vec<(String, i64)> {
    let keys = RefCell::new(Vec::new());
    remap_ids(statement, schema, |table, id| {
        keys.borrow_mut().push((table.to_ascii_lowercase(), id));
        None
    });
    keys.into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SqlValue;
    use pretty_assertions::assert_eq;

    fn cursor() -> SyncCursor {
        let mut cursor = SyncCursor::default();
        cursor.record_mapping("registrations", 501, 87);
        cursor.record_mapping("patients", 12, 40);
        cursor
    }

    #[test]
    fn foreign_keys_are_remapped_in_inserts() {
        let statement = Statement::new(
            "INSERT INTO patients (patient_name, registration_id) VALUES (?, ?)",
        )
        .bind("A")
        .bind(501);

        let remapped = remap_local_ids(&statement, &SyncSchema::clinic(), &cursor());
        assert_eq!(remapped.params, vec![SqlValue::from("A"), SqlValue::Integer(87)]);
    }

    #[test]
    fn own_key_is_remapped_only_for_updates_and_deletes() {
        let update = Statement::new("UPDATE patients SET patient_name = ? WHERE patient_id = ?")
            .bind("B")
            .bind("12");
        let remapped = remap_local_ids(&update, &SyncSchema::clinic(), &cursor());
        assert_eq!(remapped.params, vec![SqlValue::from("B"), SqlValue::from("40")]);

        let insert = Statement::new("INSERT INTO patients (patient_id, patient_name) VALUES (?, ?)")
            .bind(12)
            .bind("C");
        let remapped = remap_local_ids(&insert, &SyncSchema::clinic(), &cursor());
        assert_eq!(remapped.params, insert.params);
    }

    #[test]
    fn unmapped_and_unrelated_values_are_untouched() {
        let statement = Statement::new(
            "UPDATE payments SET amount = ? WHERE registration_id = ? AND patient_id IN (?, ?)",
        )
        .bind(501)
        .bind(7)
        .bind(12)
        .bind(13);

        let remapped = remap_local_ids(&statement, &SyncSchema::clinic(), &cursor());
        assert_eq!(
            remapped.params,
            vec![
                SqlValue::Integer(501),
                SqlValue::Integer(7),
                SqlValue::Integer(40),
                SqlValue::Integer(13),
            ]
        );
    }

    #[test]
    fn bound_keys_name_parent_and_own_rows() {
        let update = Statement::new(
            "UPDATE patients SET registration_id = ? WHERE patient_id = ?",
        )
        .bind(501)
        .bind(12);
        assert_eq!(
            bound_keys(&update, &SyncSchema::clinic()),
            vec![("registrations".to_string(), 501), ("patients".to_string(), 12)]
        );

        let unrelated = Statement::new("UPDATE branches SET name = ?").bind("Main");
        assert!(bound_keys(&unrelated, &SyncSchema::clinic()).is_empty());
    }
}
