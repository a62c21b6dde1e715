//! Scalar values and ordered rows moved between the remote store and the cache

use std::cmp::Ordering;
use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// The closed set of scalar values a row cell can hold.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl SqlValue {
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Integer view of the value, accepting integral text such as `"501"`.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(value) => Some(*value),
            Self::Text(text) => text.trim().parse().ok(),
            #[allow(clippy::cast_possible_truncation)]
            Self::Real(value) if value.fract() == 0.0 => Some(*value as i64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    /// SQLite-style ordering: NULL < numbers < text.
    pub fn sql_cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Null, Self::Null) => Ordering::Equal,
            (Self::Null, _) => Ordering::Less,
            (_, Self::Null) => Ordering::Greater,
            (Self::Integer(a), Self::Integer(b)) => a.cmp(b),
            #[allow(clippy::cast_precision_loss)]
            (Self::Integer(a), Self::Real(b)) => (*a as f64).total_cmp(b),
            #[allow(clippy::cast_precision_loss)]
            (Self::Real(a), Self::Integer(b)) => a.total_cmp(&(*b as f64)),
            (Self::Real(a), Self::Real(b)) => a.total_cmp(b),
            (Self::Text(a), Self::Text(b)) => a.cmp(b),
            (Self::Text(_), _) => Ordering::Greater,
            (_, Self::Text(_)) => Ordering::Less,
        }
    }

    /// Returns a copy of `self` carrying `value` with the same representation
    /// (integer stays integer, integral text stays text).
    pub fn with_same_shape(&self, value: i64) -> Self {
        match self {
            Self::Text(_) => Self::Text(value.to_string()),
            _ => Self::Integer(value),
        }
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Integer(value) => write!(f, "{value}"),
            Self::Real(value) => write!(f, "{value}"),
            Self::Text(value) => write!(f, "{value}"),
        }
    }
}

impl From<libsql::Value> for SqlValue {
    fn from(value: libsql::Value) -> Self {
        match value {
            libsql::Value::Null => Self::Null,
            libsql::Value::Integer(value) => Self::Integer(value),
            libsql::Value::Real(value) => Self::Real(value),
            libsql::Value::Text(value) => Self::Text(value),
            libsql::Value::Blob(bytes) => Self::Text(String::from_utf8_lossy(&bytes).into_owned()),
        }
    }
}

impl From<SqlValue> for libsql::Value {
    fn from(value: SqlValue) -> Self {
        match value {
            SqlValue::Null => Self::Null,
            SqlValue::Integer(value) => Self::Integer(value),
            SqlValue::Real(value) => Self::Real(value),
            SqlValue::Text(value) => Self::Text(value),
        }
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for SqlValue {
    fn from(value: i32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<f64> for SqlValue {
    fn from(value: f64) -> Self {
        Self::Real(value)
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl<T: Into<Self>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

impl Serialize for SqlValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Null => serializer.serialize_none(),
            Self::Integer(value) => serializer.serialize_i64(*value),
            Self::Real(value) => serializer.serialize_f64(*value),
            Self::Text(value) => serializer.serialize_str(value),
        }
    }
}

struct SqlValueVisitor;

impl<'de> Visitor<'de> for SqlValueVisitor {
    type Value = SqlValue;

    fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("null, a number, a boolean or a string")
    }

    fn visit_unit<E>(self) -> Result<SqlValue, E> {
        Ok(SqlValue::Null)
    }

    fn visit_none<E>(self) -> Result<SqlValue, E> {
        Ok(SqlValue::Null)
    }

    fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> Result<SqlValue, D::Error> {
        deserializer.deserialize_any(self)
    }

    fn visit_bool<E>(self, value: bool) -> Result<SqlValue, E> {
        Ok(SqlValue::Integer(i64::from(value)))
    }

    fn visit_i64<E>(self, value: i64) -> Result<SqlValue, E> {
        Ok(SqlValue::Integer(value))
    }

    fn visit_u64<E: serde::de::Error>(self, value: u64) -> Result<SqlValue, E> {
        i64::try_from(value)
            .map(SqlValue::Integer)
            .map_err(|_| E::custom("integer out of range for a SQL value"))
    }

    fn visit_f64<E>(self, value: f64) -> Result<SqlValue, E> {
        Ok(SqlValue::Real(value))
    }

    fn visit_str<E>(self, value: &str) -> Result<SqlValue, E> {
        Ok(SqlValue::Text(value.to_string()))
    }

    fn visit_string<E>(self, value: String) -> Result<SqlValue, E> {
        Ok(SqlValue::Text(value))
    }
}

impl<'de> Deserialize<'de> for SqlValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(SqlValueVisitor)
    }
}

/// A row as an ordered mapping from column name to value.
///
/// Column order is preserved from the producing query and through JSON.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    cells: Vec<(String, SqlValue)>,
}

impl Row {
    pub const fn new() -> Self {
        Self { cells: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            cells: Vec::with_capacity(capacity),
        }
    }

    /// Builder-style insert, replacing an existing column of the same name.
    #[must_use]
    pub fn with(mut self, column: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        self.set(column, value);
        self
    }

    /// Sets a column, replacing an existing one with the same (case-insensitive) name.
    pub fn set(&mut self, column: impl Into<String>, value: impl Into<SqlValue>) {
        let column = column.into();
        let value = value.into();
        if let Some(cell) = self
            .cells
            .iter_mut()
            .find(|(name, _)| name.eq_ignore_ascii_case(&column))
        {
            cell.1 = value;
        } else {
            self.cells.push((column, value));
        }
    }

    /// Case-insensitive column lookup.
    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.cells
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(column))
            .map(|(_, value)| value)
    }

    pub fn contains(&self, column: &str) -> bool {
        self.get(column).is_some()
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.cells.iter().map(|(name, _)| name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SqlValue)> {
        self.cells.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

impl FromIterator<(String, SqlValue)> for Row {
    fn from_iter<I: IntoIterator<Item = (String, SqlValue)>>(iter: I) -> Self {
        let mut row = Self::new();
        for (column, value) in iter {
            row.set(column, value);
        }
        row
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.cells.len()))?;
        for (column, value) in &self.cells {
            map.serialize_entry(column, value)?;
        }
        map.end()
    }
}

struct RowVisitor;

impl<'de> Visitor<'de> for RowVisitor {
    type Value = Row;

    fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("an object mapping column names to scalar values")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Row, A::Error> {
        let mut row = Row::with_capacity(access.size_hint().unwrap_or(0));
        while let Some((column, value)) = access.next_entry::<String, SqlValue>()? {
            row.set(column, value);
        }
        Ok(row)
    }
}

impl<'de> Deserialize<'de> for Row {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_map(RowVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn row_lookup_is_case_insensitive() {
        let row = Row::new().with("Registration_ID", 10).with("patient_name", "A");
        assert_eq!(row.get("registration_id"), Some(&SqlValue::Integer(10)));
        assert!(row.contains("PATIENT_NAME"));
        assert!(!row.contains("phone_number"));
    }

    #[test]
    fn row_json_preserves_column_order() {
        let row = Row::new()
            .with("zeta", 1)
            .with("alpha", "x")
            .with("mid", SqlValue::Null);
        let json = serde_json::to_string(&row).unwrap();
        assert_eq!(json, r#"{"zeta":1,"alpha":"x","mid":null}"#);

        let parsed: Row = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.columns().collect::<Vec<_>>(), ["zeta", "alpha", "mid"]);
    }

    #[test]
    fn json_scalars_map_onto_the_closed_value_set() {
        let parsed: Vec<SqlValue> =
            serde_json::from_str(r#"[null, 3, 2.5, "t", true, false]"#).unwrap();
        assert_eq!(
            parsed,
            vec![
                SqlValue::Null,
                SqlValue::Integer(3),
                SqlValue::Real(2.5),
                SqlValue::Text("t".into()),
                SqlValue::Integer(1),
                SqlValue::Integer(0),
            ]
        );
        assert!(serde_json::from_str::<SqlValue>("[1]").is_err());
    }

    #[test]
    fn sql_ordering_follows_sqlite_type_classes() {
        assert_eq!(SqlValue::Null.sql_cmp(&SqlValue::Integer(0)), Ordering::Less);
        assert_eq!(
            SqlValue::Integer(2).sql_cmp(&SqlValue::Real(1.5)),
            Ordering::Greater
        );
        assert_eq!(
            SqlValue::Integer(99).sql_cmp(&SqlValue::Text("1".into())),
            Ordering::Less
        );
        assert_eq!(
            SqlValue::from("2024-01-02 00:00:00").sql_cmp(&SqlValue::from("2024-01-01 23:59:59")),
            Ordering::Greater
        );
    }

    #[test]
    fn integral_text_is_usable_as_an_id() {
        assert_eq!(SqlValue::from(" 501 ").as_i64(), Some(501));
        assert_eq!(SqlValue::Real(3.0).as_i64(), Some(3));
        assert_eq!(SqlValue::Real(3.5).as_i64(), None);
        assert_eq!(SqlValue::from("501").with_same_shape(87), SqlValue::from("87"));
        assert_eq!(SqlValue::Integer(501).with_same_shape(87), SqlValue::Integer(87));
    }
}
