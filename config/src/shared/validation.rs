use thiserror::Error;

/// Errors reported by configuration validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("`{0}` must not be empty")]
    EmptyField(&'static str),

    #[error("`max_stream_count` cannot be zero")]
    MaxStreamCountZero,

    #[error("`load.writer_concurrency` cannot be zero")]
    WriterConcurrencyZero,

    #[error("`load.upload_concurrency` cannot be zero")]
    UploadConcurrencyZero,

    #[error("invalid value for `{field}`: {constraint}")]
    InvalidFieldValue { field: String, constraint: String },
}
