//! Configuration for BigQuery to Snowflake transfers.
//!
//! Holds the typed [`shared::TransferConfig`] consumed by the pipeline together with the
//! hierarchical loader used by binaries to resolve it from files and environment variables.

pub mod environment;
pub mod load;
pub mod shared;
