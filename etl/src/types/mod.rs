//! Data types flowing through the transfer pipeline.

mod record;
mod session;
mod staged;

pub use record::*;
pub use session::*;
pub use staged::*;

/// Identifier of a single transfer run, used to name staged files.
pub type TransferId = uuid::Uuid;
