use std::fmt;

use secrecy::SecretString;
use serde::Deserialize;

/// BigQuery table read through the Storage Read API.
#[derive(Clone, Debug, Deserialize)]
pub struct SourceConfig {
    /// Project that owns the table. Sessions are billed to it as well.
    pub project_id: String,
    pub dataset_id: String,
    pub table_id: String,
    /// Service account key (JSON). When absent, application default credentials are used.
    #[serde(default)]
    pub service_account_key: Option<SecretString>,
    /// Columns to read; empty reads every column.
    #[serde(default)]
    pub selected_fields: Vec<String>,
    /// SQL predicate applied server side, e.g. `amount > 0`.
    #[serde(default)]
    pub row_restriction: Option<String>,
}

impl SourceConfig {
    /// Session parent, `projects/{project}`.
    pub fn parent(&self) -> String {
        format!("projects/{}", self.project_id)
    }

    /// Fully qualified table path, `projects/{p}/datasets/{d}/tables/{t}`.
    pub fn table_path(&self) -> String {
        format!(
            "projects/{}/datasets/{}/tables/{}",
            self.project_id, self.dataset_id, self.table_id
        )
    }
}

impl fmt::Display for SourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.project_id, self.dataset_id, self.table_id)
    }
}
