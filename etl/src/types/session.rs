use std::fmt;

use bytes::Bytes;
use config::shared::SourceConfig;

/// Source table addressed as project, dataset and table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceTableRef {
    pub project_id: String,
    pub dataset_id: String,
    pub table_id: String,
}

impl SourceTableRef {
    pub fn new(
        project_id: impl Into<String>,
        dataset_id: impl Into<String>,
        table_id: impl Into<String>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            dataset_id: dataset_id.into(),
            table_id: table_id.into(),
        }
    }

    /// `projects/{project}`, the parent under which read sessions are created.
    pub fn parent(&self) -> String {
        format!("projects/{}", self.project_id)
    }

    /// `projects/{project}/datasets/{dataset}/tables/{table}`.
    pub fn path(&self) -> String {
        format!(
            "projects/{}/datasets/{}/tables/{}",
            self.project_id, self.dataset_id, self.table_id
        )
    }
}

impl From<&SourceConfig> for SourceTableRef {
    fn from(config: &SourceConfig) -> Self {
        SourceTableRef::new(&config.project_id, &config.dataset_id, &config.table_id)
    }
}

impl fmt::Display for SourceTableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.project_id, self.dataset_id, self.table_id)
    }
}

/// Server side column projection and filtering.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadOptions {
    pub selected_fields: Vec<String>,
    pub row_restriction: Option<String>,
}

impl From<&SourceConfig> for ReadOptions {
    fn from(config: &SourceConfig) -> Self {
        Self {
            selected_fields: config.selected_fields.clone(),
            row_restriction: config.row_restriction.clone(),
        }
    }
}

/// Handle to one stream of a read session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReadStreamHandle {
    pub name: String,
}

impl ReadStreamHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl fmt::Display for ReadStreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// A snapshot of a source table split into independently readable streams.
///
/// `schema_descriptor` holds the serialized Arrow IPC schema message needed to decode every batch
/// read under this session.
#[derive(Debug, Clone)]
pub struct ReadSession {
    pub name: String,
    pub schema_descriptor: Bytes,
    pub streams: Vec<ReadStreamHandle>,
}

/// One response of a `ReadRows` call.
#[derive(Debug, Clone)]
pub struct ReadRowsResponse {
    /// Body-only Arrow IPC record batch message.
    pub serialized_record_batch: Bytes,
    pub row_count: u64,
}

/// A batch pulled from a stream, not yet paired with the session schema.
#[derive(Debug, Clone)]
pub struct RawBatch {
    pub bytes: Bytes,
    pub row_count: u64,
    /// Stream offset of the first row of this batch.
    pub offset: u64,
}
