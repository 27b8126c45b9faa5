mod backoff;
mod destination;
mod source;
mod staging;
mod transfer;
mod validation;

pub use backoff::*;
pub use destination::*;
pub use source::*;
pub use staging::*;
pub use transfer::*;
pub use validation::*;
