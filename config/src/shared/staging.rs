use serde::{Deserialize, Serialize};

/// Compression codec for staged Parquet files.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    None,
    #[default]
    Snappy,
    Zstd,
    Gzip,
    Lz4,
}

/// When the bulk load runs relative to uploads.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LoadMode {
    /// One `COPY` after every file has been uploaded.
    #[default]
    AtEnd,
    /// One `COPY` after each confirmed upload, in completion order.
    PerFile,
}

/// Staged load tuning.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoadConfig {
    #[serde(default)]
    pub mode: LoadMode,
    /// Maximum number of Parquet files written concurrently. Default: 4
    #[serde(default = "default_writer_concurrency")]
    pub writer_concurrency: usize,
    /// Maximum number of concurrent uploads, also passed as `PARALLEL` to `PUT`. Default: 8
    #[serde(default = "default_upload_concurrency")]
    pub upload_concurrency: usize,
}

impl LoadConfig {
    pub const DEFAULT_WRITER_CONCURRENCY: usize = 4;
    pub const DEFAULT_UPLOAD_CONCURRENCY: usize = 8;
}

fn default_writer_concurrency() -> usize {
    LoadConfig::DEFAULT_WRITER_CONCURRENCY
}

fn default_upload_concurrency() -> usize {
    LoadConfig::DEFAULT_UPLOAD_CONCURRENCY
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            mode: LoadMode::default(),
            writer_concurrency: default_writer_concurrency(),
            upload_concurrency: default_upload_concurrency(),
        }
    }
}
