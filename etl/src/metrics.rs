//! Metric names emitted by the transfer pipeline.
//!
//! Recording goes through the `metrics` facade; nothing is exported unless the host process
//! installs a recorder.

/// Label holding the fully qualified source table.
pub const SOURCE_TABLE_LABEL: &str = "source_table";

/// Label holding the failing stage.
pub const STAGE_LABEL: &str = "stage";

/// Counter of rows decoded from read streams.
pub const ETL_TRANSFER_ROWS_READ_TOTAL: &str = "etl_transfer_rows_read_total";

/// Counter of rows written into staged Parquet files.
pub const ETL_TRANSFER_ROWS_STAGED_TOTAL: &str = "etl_transfer_rows_staged_total";

/// Counter of Parquet files uploaded to the stage.
pub const ETL_TRANSFER_FILES_UPLOADED_TOTAL: &str = "etl_transfer_files_uploaded_total";

/// Counter of bytes uploaded to the stage.
pub const ETL_TRANSFER_BYTES_UPLOADED_TOTAL: &str = "etl_transfer_bytes_uploaded_total";

/// Counter of rows reported by bulk loads.
pub const ETL_TRANSFER_ROWS_LOADED_TOTAL: &str = "etl_transfer_rows_loaded_total";

/// Counter of read streams reopened after a retryable error.
pub const ETL_TRANSFER_STREAM_RETRIES_TOTAL: &str = "etl_transfer_stream_retries_total";

/// Counter of failed transfers, labelled by [`STAGE_LABEL`].
pub const ETL_TRANSFER_FAILURES_TOTAL: &str = "etl_transfer_failures_total";

/// Histogram of transfer durations in seconds.
pub const ETL_TRANSFER_DURATION_SECONDS: &str = "etl_transfer_duration_seconds";
