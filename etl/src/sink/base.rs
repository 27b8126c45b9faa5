use std::future::Future;

use crate::error::EtlResult;

/// Result set of one warehouse statement, with every value rendered as text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl QueryResult {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Option<String>>>) -> Self {
        Self { columns, rows }
    }

    /// Position of `column`, compared case-insensitively.
    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|name| name.eq_ignore_ascii_case(column))
    }

    /// Values of `column` across all rows, or `None` when the column is absent.
    pub fn values<'a>(
        &'a self,
        column: &str,
    ) -> Option<impl Iterator<Item = Option<&'a str>> + 'a> {
        let index = self.column_index(column)?;
        Some(
            self.rows
                .iter()
                .map(move |row| row.get(index).and_then(|value| value.as_deref())),
        )
    }
}

/// Executes SQL statements against the destination warehouse.
///
/// The stage uploader and the bulk loader only need statement execution, so a warehouse is
/// modelled as a single method. Implementations must classify credential failures as
/// [`crate::error::ErrorKind::AuthenticationFailed`].
pub trait WarehouseClient {
    fn execute(&self, statement: &str) -> impl Future<Output = EtlResult<QueryResult>> + Send;
}
