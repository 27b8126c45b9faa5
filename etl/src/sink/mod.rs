//! Staged load into the destination warehouse: Parquet serialization, stage upload and bulk load.

pub mod base;
pub mod loader;
pub mod serializer;
#[cfg(feature = "snowflake")]
pub mod snowflake;
pub mod stage;

pub use base::{QueryResult, WarehouseClient};
