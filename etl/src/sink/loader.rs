use tracing::{debug, warn};

use crate::error::{ErrorKind, EtlResult};
use crate::etl_error;
use crate::events::LOAD_COMPLETED;
use crate::sink::base::{QueryResult, WarehouseClient};
use crate::sink::stage::{normalize_stage_ref, stage_error_kind};
use crate::transfer_event;

/// Builds the `COPY INTO` statement loading every Parquet file of `stage` into `table`.
///
/// Columns are matched by name, case-insensitively, so the column order of the destination
/// table does not matter.
pub fn copy_statement(table: &str, stage: &str) -> String {
    format!(
        "COPY INTO {table} FROM {stage} FILE_FORMAT = (TYPE = PARQUET) MATCH_BY_COLUMN_NAME = CASE_INSENSITIVE"
    )
}

/// Bulk loads the files of a stage into the destination table.
///
/// Snowflake skips files it has already loaded, so issuing the load again after a failure only
/// ingests what is missing. Files are never removed from the stage, whatever the outcome.
#[derive(Debug, Clone)]
pub struct BulkLoader<W> {
    warehouse: W,
    stage: String,
    table: String,
}

impl<W> BulkLoader<W>
where
    W: WarehouseClient,
{
    pub fn new(warehouse: W, stage: &str, table: impl Into<String>) -> Self {
        Self {
            warehouse,
            stage: normalize_stage_ref(stage),
            table: table.into(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Runs the load and returns the number of rows it ingested.
    pub async fn load(&self) -> EtlResult<u64> {
        #[cfg(feature = "failpoints")]
        crate::failpoints::etl_fail_point(
            crate::failpoints::LOAD_BEFORE_COPY,
            ErrorKind::LoadFailed,
        )?;

        debug!(table = %self.table, stage = %self.stage, "loading stage into table");
        let result = self
            .warehouse
            .execute(&copy_statement(&self.table, &self.stage))
            .await
            .map_err(|err| {
                etl_error!(
                    stage_error_kind(err.kind(), ErrorKind::LoadFailed),
                    "Bulk load failed",
                    format!("{} into {}", self.stage, self.table),
                    source: err
                )
            })?;

        let rows_loaded = rows_loaded(&result)?;
        transfer_event!(
            LOAD_COMPLETED,
            table = %self.table,
            stage = %self.stage,
            rows = rows_loaded,
            files = result.rows.len()
        );

        Ok(rows_loaded)
    }
}

/// Sums the `rows_loaded` column of a `COPY` result.
///
/// A load with nothing new to ingest returns a single status row without that column.
fn rows_loaded(result: &QueryResult) -> EtlResult<u64> {
    let Some(values) = result.values("rows_loaded") else {
        if !result.rows.is_empty() {
            warn!(columns = ?result.columns, "load result has no rows_loaded column");
        }
        return Ok(0);
    };

    let mut total = 0u64;
    for value in values.flatten() {
        let rows: u64 = value.trim().parse().map_err(|_| {
            etl_error!(
                ErrorKind::LoadFailed,
                "Load result has an invalid row count",
                value
            )
        })?;
        total += rows;
    }

    Ok(total)
}
