use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::SqlConduitError;
use crate::types::RowValues;

/// A row from a database query result
///
/// Column names are shared across all rows of a result set; an index cache
/// avoids repeated string comparisons on lookup.
#[derive(Debug, Clone)]
pub struct Row {
    /// The column names for this row (shared across all rows in a result set)
    pub column_names: Arc<Vec<String>>,
    /// The values for this row
    pub values: Vec<RowValues>,
    #[doc(hidden)]
    column_index_cache: Arc<HashMap<String, usize>>,
}

impl Row {
    pub fn new(column_names: Arc<Vec<String>>, values: Vec<RowValues>) -> Self {
        let cache = Arc::new(
            column_names
                .iter()
                .enumerate()
                .map(|(i, name)| (name.clone(), i))
                .collect::<HashMap<_, _>>(),
        );
        Self {
            column_names,
            values,
            column_index_cache: cache,
        }
    }

    /// Get the index of a column by name
    #[must_use]
    pub fn column_index(&self, column_name: &str) -> Option<usize> {
        if let Some(&idx) = self.column_index_cache.get(column_name) {
            return Some(idx);
        }
        self.column_names.iter().position(|col| col == column_name)
    }

    /// Get a value from the row by column name
    #[must_use]
    pub fn get(&self, column_name: &str) -> Option<&RowValues> {
        self.column_index(column_name)
            .and_then(|idx| self.values.get(idx))
    }

    /// Get a value from the row by column index
    #[must_use]
    pub fn get_by_index(&self, index: usize) -> Option<&RowValues> {
        self.values.get(index)
    }
}

/// A result set from a database query
#[derive(Debug, Clone, Default)]
pub struct ResultSet {
    /// The rows returned by the query
    pub results: Vec<Row>,
    /// The number of rows affected (for DML statements)
    pub rows_affected: u64,
}

impl ResultSet {
    /// Create a new result set with a known capacity
    #[must_use]
    pub fn with_capacity(capacity: usize) -> ResultSet {
        ResultSet {
            results: Vec::with_capacity(capacity),
            rows_affected: 0,
        }
    }

    /// Add a row to the result set
    pub fn add_row(&mut self, row: Row) {
        self.results.push(row);
        self.rows_affected += 1;
    }

    /// Value at `column` of the first row, if any.
    #[must_use]
    pub fn scalar_at(&self, column: usize) -> Option<RowValues> {
        self.results
            .first()
            .and_then(|row| row.get_by_index(column))
            .cloned()
    }

    /// Values at `column` across all rows.
    #[must_use]
    pub fn column_at(&self, column: usize) -> Vec<RowValues> {
        self.results
            .iter()
            .filter_map(|row| row.get_by_index(column))
            .cloned()
            .collect()
    }

    /// Encode for storage in a query cache store.
    pub fn to_cache_bytes(&self) -> Result<Vec<u8>, SqlConduitError> {
        let columns = self
            .results
            .first()
            .map(|row| row.column_names.as_ref().clone())
            .unwrap_or_default();
        let mirror = CachedResultSet {
            columns,
            rows: self.results.iter().map(|row| row.values.clone()).collect(),
            rows_affected: self.rows_affected,
        };
        serde_json::to_vec(&mirror)
            .map_err(|e| SqlConduitError::CacheError(format!("encode failed: {e}")))
    }

    /// Decode a cached entry produced by [`ResultSet::to_cache_bytes`].
    pub fn from_cache_bytes(bytes: &[u8]) -> Result<Self, SqlConduitError> {
        let mirror: CachedResultSet = serde_json::from_slice(bytes)
            .map_err(|e| SqlConduitError::CacheError(format!("decode failed: {e}")))?;
        let columns = Arc::new(mirror.columns);
        let mut rs = ResultSet::with_capacity(mirror.rows.len());
        for values in mirror.rows {
            rs.results.push(Row::new(Arc::clone(&columns), values));
        }
        rs.rows_affected = mirror.rows_affected;
        Ok(rs)
    }
}

// Serde mirror; the per-row index cache is rebuilt on decode, not stored.
#[derive(Serialize, Deserialize)]
struct CachedResultSet {
    columns: Vec<String>,
    rows: Vec<Vec<RowValues>>,
    rows_affected: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_round_trip_preserves_rows() {
        let columns = Arc::new(vec!["id".to_string(), "name".to_string()]);
        let mut rs = ResultSet::with_capacity(2);
        rs.add_row(Row::new(
            Arc::clone(&columns),
            vec![RowValues::Int(1), RowValues::Text("alice".into())],
        ));
        rs.add_row(Row::new(
            Arc::clone(&columns),
            vec![RowValues::Int(2), RowValues::Null],
        ));

        let bytes = rs.to_cache_bytes().unwrap();
        let back = ResultSet::from_cache_bytes(&bytes).unwrap();
        assert_eq!(back.results.len(), 2);
        assert_eq!(back.results[0].get("name"), Some(&RowValues::Text("alice".into())));
        assert!(back.results[1].get("name").unwrap().is_null());
    }
}
