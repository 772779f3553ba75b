use crate::core::{Row, Value};
use serde::{Deserialize, Serialize};

/// Rows returned by the backend together with the affected-row count.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    /// Rows affected by a write, or rows returned by a read.
    pub row_count: u64,
}

impl QueryResult {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(columns: Vec<String>, rows: Vec<Row>) -> Self {
        let row_count = rows.len() as u64;
        Self {
            columns,
            rows,
            row_count,
        }
    }

    /// A result for a write statement that touched `row_count` rows.
    pub fn affected(row_count: u64) -> Self {
        Self {
            columns: Vec::new(),
            rows: Vec::new(),
            row_count,
        }
    }

    pub fn row_count(&self) -> u64 {
        self.row_count
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    /// Reads a cell by column name from the given row.
    pub fn get(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self.columns.iter().position(|c| c == column)?;
        self.rows.get(row)?.get(idx)
    }

    /// Converts each row into a JSON object keyed by column name.
    pub fn to_json_rows(&self) -> Vec<serde_json::Map<String, serde_json::Value>> {
        self.rows
            .iter()
            .map(|row| {
                self.columns
                    .iter()
                    .zip(row.iter())
                    .map(|(column, value)| (column.clone(), value.to_json()))
                    .collect()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cell_lookup_and_json_rows() {
        let result = QueryResult::new(
            vec!["id".into(), "name".into()],
            vec![vec![Value::Integer(1), Value::Text("John".into())]],
        );
        assert_eq!(result.row_count(), 1);
        assert_eq!(result.get(0, "name"), Some(&Value::Text("John".into())));
        assert_eq!(result.get(0, "missing"), None);

        let rows = result.to_json_rows();
        assert_eq!(rows[0]["name"], serde_json::json!("John"));
    }

    #[test]
    fn test_affected_has_no_rows() {
        let result = QueryResult::affected(3);
        assert_eq!(result.row_count(), 3);
        assert!(result.is_empty());
    }
}
