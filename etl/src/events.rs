//! Structured pipeline events.
//!
//! Every event is logged at info level with `transfer_event = true` so that log pipelines can
//! pick them out without parsing messages.

pub const SESSION_CREATED: &str = "session_created";
pub const STREAM_OPENED: &str = "stream_opened";
pub const BATCH_DECODED: &str = "batch_decoded";
pub const FILE_STAGED: &str = "file_staged";
pub const LOAD_COMPLETED: &str = "load_completed";

/// Logs a pipeline event with `transfer_event = true` added.
///
/// Takes one of the event name constants of this module followed by `key = value` fields.
#[macro_export]
macro_rules! transfer_event {
    ($event:expr $(, $($fields:tt)*)?) => {
        tracing::info!(
            message = $event,
            transfer_event = true,
            $($($fields)*)?
        )
    };
}
