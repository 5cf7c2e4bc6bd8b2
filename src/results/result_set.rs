use std::sync::Arc;

use super::row::DbRow;

/// Rows of one query execution, materialised in memory.
#[derive(Debug, Clone, Default)]
pub struct ResultSet {
    /// The rows returned by the query
    pub results: Vec<DbRow>,
    column_names: Option<Arc<Vec<String>>>,
}

impl ResultSet {
    /// Create a new result set with a known capacity
    #[must_use]
    pub fn with_capacity(capacity: usize) -> ResultSet {
        ResultSet {
            results: Vec::with_capacity(capacity),
            column_names: None,
        }
    }

    /// Get the column names for this result set
    #[must_use]
    pub fn get_column_names(&self) -> Option<&Arc<Vec<String>>> {
        self.column_names.as_ref()
    }

    /// Add a row; the first row fixes the column names.
    pub fn add_row(&mut self, row: DbRow) {
        if self.column_names.is_none() {
            self.column_names = Some(Arc::clone(&row.column_names));
        }
        self.results.push(row);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.results.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Values of one column across every row, in row order.
    #[must_use]
    pub fn column(&self, column_name: &str) -> Vec<&crate::types::RowValues> {
        self.results
            .iter()
            .filter_map(|row| row.get(column_name))
            .collect()
    }
}

impl IntoIterator for ResultSet {
    type Item = DbRow;
    type IntoIter = std::vec::IntoIter<DbRow>;

    fn into_iter(self) -> Self::IntoIter {
        self.results.into_iter()
    }
}
