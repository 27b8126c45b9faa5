//! Streaming transfer of a BigQuery table into Snowflake.
//!
//! Rows are read as Arrow record batches over one or more Storage Read API streams, written to
//! local Parquet files, uploaded to a Snowflake stage and bulk loaded with `COPY INTO`. The entry
//! point is [`transfer::run_transfer`].

pub mod backoff;
pub mod concurrency;
pub mod error;
pub mod events;
#[cfg(feature = "failpoints")]
pub mod failpoints;
mod macros;
pub mod metrics;
pub mod sink;
pub mod source;
pub mod state;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod transfer;
pub mod types;
