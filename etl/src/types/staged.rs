use std::path::PathBuf;

/// A Parquet file written under its final name in the local data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFile {
    pub path: PathBuf,
    pub file_name: String,
    pub rows: u64,
    pub bytes: u64,
}

/// A file confirmed present in the remote stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    /// Normalized stage reference, with a single leading `@`.
    pub stage: String,
    pub file_name: String,
    pub rows: u64,
    pub bytes: u64,
}

impl StagedFile {
    /// Stage path of the file, e.g. `@landing/events_1_00000.parquet`.
    pub fn stage_path(&self) -> String {
        format!("{}/{}", self.stage.trim_end_matches('/'), self.file_name)
    }
}
