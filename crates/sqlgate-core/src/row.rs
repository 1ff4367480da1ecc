//! Query result rows.

use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Column metadata shared across all rows in a result set.
///
/// Wrapped in `Arc` so all rows from the same query share one allocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    /// Column names in order
    names: Vec<String>,
    /// Name -> index mapping for O(1) lookup
    #[serde(skip)]
    name_to_index: HashMap<String, usize>,
}

impl ColumnInfo {
    /// Create new column info from a list of column names.
    pub fn new(names: Vec<String>) -> Self {
        let name_to_index = names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();
        Self {
            names,
            name_to_index,
        }
    }

    /// Get the number of columns.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Check if there are no columns.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Get the index of a column by name.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        // The index map is skipped by serde; fall back to a scan when a row
        // arrived over the envelope without it.
        if self.name_to_index.is_empty() && !self.names.is_empty() {
            return self.names.iter().position(|n| n == name);
        }
        self.name_to_index.get(name).copied()
    }

    /// Get the name of a column by index.
    pub fn name_at(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    /// Get all column names.
    pub fn names(&self) -> &[String] {
        &self.names
    }
}

/// A single row returned from a query.
///
/// Rows provide both index-based and name-based access to column values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    /// Column values in order
    values: Vec<Value>,
    /// Shared column metadata
    columns: Arc<ColumnInfo>,
}

impl Row {
    /// Create a new row with the given columns and values.
    ///
    /// For multiple rows from the same result set, prefer `with_columns`
    /// to share the column metadata.
    pub fn new(column_names: Vec<String>, values: Vec<Value>) -> Self {
        let columns = Arc::new(ColumnInfo::new(column_names));
        Self { values, columns }
    }

    /// Create a new row with shared column metadata.
    pub fn with_columns(columns: Arc<ColumnInfo>, values: Vec<Value>) -> Self {
        Self { values, columns }
    }

    /// Get the shared column metadata.
    pub fn column_info(&self) -> Arc<ColumnInfo> {
        Arc::clone(&self.columns)
    }

    /// Get the number of columns in this row.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Check if this row is empty.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Get a value by column index.
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Get a value by column name.
    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.columns.index_of(name).and_then(|i| self.values.get(i))
    }

    /// All values in column order.
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Consume the row, returning its values.
    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    /// View the row as name -> value entries.
    pub fn entries(&self) -> Entries {
        self.columns
            .names()
            .iter()
            .cloned()
            .zip(self.values.iter().cloned())
            .collect()
    }
}

/// A row rendered as key-value entries, the `queryEntries` result shape.
pub type Entries = BTreeMap<String, Value>;

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Row {
        Row::new(
            vec!["id".to_string(), "name".to_string()],
            vec![Value::Integer(1), Value::Text("a".into())],
        )
    }

    #[test]
    fn test_index_and_name_access() {
        let row = sample();
        assert_eq!(row.get(0), Some(&Value::Integer(1)));
        assert_eq!(row.get_by_name("name"), Some(&Value::Text("a".into())));
        assert_eq!(row.get_by_name("missing"), None);
        assert_eq!(row.get(2), None);
    }

    #[test]
    fn test_shared_columns() {
        let row = sample();
        let info = row.column_info();
        let second = Row::with_columns(info, vec![Value::Integer(2), Value::Null]);
        assert_eq!(second.get_by_name("id"), Some(&Value::Integer(2)));
    }

    #[test]
    fn test_entries_view() {
        let entries = sample().entries();
        assert_eq!(entries.get("id"), Some(&Value::Integer(1)));
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn test_serde_preserves_name_lookup() {
        let row = sample();
        let encoded = serde_json::to_string(&row).expect("serialize row");
        let decoded: Row = serde_json::from_str(&encoded).expect("deserialize row");
        // name_to_index is skipped on the wire; lookup must still work.
        assert_eq!(decoded.get_by_name("name"), Some(&Value::Text("a".into())));
    }
}
