//! In-memory clients and fixtures for exercising transfers without BigQuery or Snowflake.
//!
//! [`memory_source::MemoryReadClient`] serves canned Arrow responses with scriptable transport
//! failures, [`memory_warehouse::MemoryWarehouse`] emulates a Snowflake stage and table, and
//! [`arrow`] produces payloads shaped like Storage Read API messages:
//!
//! ```rust,ignore
//! let (schema, responses) = encode_batches(&[test_batch(0, 100), test_batch(100, 50)]);
//! let client = MemoryReadClient::new(schema);
//! client.add_stream("s0", responses).await;
//!
//! let dir = tempfile::tempdir()?;
//! let result = run_transfer(
//!     test_transfer_config(dir.path()),
//!     client,
//!     MemoryWarehouse::new(),
//!     shutdown_rx,
//! )
//! .await?;
//! ```

pub mod arrow;
pub mod config;
pub mod memory_source;
pub mod memory_warehouse;

/// Creates a scratch directory for local data files.
pub fn local_data_dir() -> tempfile::TempDir {
    tempfile::Builder::new()
        .prefix("etl-transfer-")
        .tempdir()
        .expect("failed to create scratch directory")
}
