//! Coordination primitives shared by the transfer workers.
//!
//! Cancellation is broadcast through a watch channel from [`shutdown`]: every stream worker,
//! file writer and uploader holds its own receiver and stops at its next suspension point.

pub mod shutdown;
