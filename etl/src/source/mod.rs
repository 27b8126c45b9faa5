//! Reading a BigQuery table as Arrow record batches.
//!
//! [`session::ReadSessionManager`] negotiates a read session, one [`reader::StreamReader`] pulls
//! raw batches from each stream and [`reconstruct::RecordReconstructor`] turns them into
//! [`crate::types::Record`]s.

pub mod base;
#[cfg(feature = "bigquery")]
pub mod bigquery;
pub mod reader;
pub mod reconstruct;
pub mod session;

pub use base::{ReadClient, ReadRowsStream};
