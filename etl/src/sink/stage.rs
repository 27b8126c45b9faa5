use std::path::Path;

use tracing::debug;

use crate::error::{ErrorKind, EtlError, EtlResult};
use crate::events::FILE_STAGED;
use crate::sink::base::{QueryResult, WarehouseClient};
use crate::types::{LocalFile, StagedFile};
use crate::{bail, etl_error, transfer_event};

/// Normalizes a stage reference to `@name[/path]`.
///
/// Surrounding whitespace and trailing slashes are removed and any run of leading `@` collapses
/// to a single one, so `@@landing/` becomes `@landing`. Normalizing twice yields the same
/// reference.
pub fn normalize_stage_ref(stage: &str) -> String {
    let name = stage
        .trim_start_matches(|c: char| c == '@' || c.is_whitespace())
        .trim_end_matches(|c: char| c == '/' || c.is_whitespace());
    format!("@{name}")
}

/// Quotes `value` as a SQL string literal.
pub(crate) fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

/// Builds the `PUT` statement uploading `path` to `stage`.
pub fn put_statement(path: &Path, stage: &str, parallel: usize) -> String {
    let url = format!("file://{}", path.display());
    format!(
        "PUT {} {stage} AUTO_COMPRESS = FALSE OVERWRITE = TRUE PARALLEL = {parallel}",
        quote_literal(&url)
    )
}

/// Builds the `LIST` statement matching `file_name` in `stage`.
pub fn list_statement(stage: &str, file_name: &str) -> String {
    let pattern = format!(".*{}", escape_pattern(file_name));
    format!("LIST {stage} PATTERN = {}", quote_literal(&pattern))
}

fn escape_pattern(file_name: &str) -> String {
    let mut escaped = String::with_capacity(file_name.len());
    for c in file_name.chars() {
        if matches!(
            c,
            '.' | '*' | '+' | '?' | '(' | ')' | '[' | ']' | '{' | '}' | '|' | '^' | '$' | '\\'
        ) {
            escaped.push('\\');
        }
        escaped.push(c);
    }

    escaped
}

/// Uploads local files to a named stage and confirms their presence.
#[derive(Debug, Clone)]
pub struct StageUploader<W> {
    warehouse: W,
    stage: String,
    parallel: usize,
}

impl<W> StageUploader<W>
where
    W: WarehouseClient,
{
    /// Creates an uploader for `stage`, normalizing the reference. `parallel` is passed to `PUT`.
    pub fn new(warehouse: W, stage: &str, parallel: usize) -> Self {
        Self {
            warehouse,
            stage: normalize_stage_ref(stage),
            parallel: parallel.max(1),
        }
    }

    pub fn stage(&self) -> &str {
        &self.stage
    }

    /// Uploads `file` and verifies it is listed in the stage afterwards.
    ///
    /// Fails with [`ErrorKind::UploadFailed`] when the file is missing locally, when the upload is
    /// rejected, or when the file cannot be found in the stage afterwards. Not retried here.
    pub async fn upload(&self, file: &LocalFile) -> EtlResult<StagedFile> {
        let path = tokio::fs::canonicalize(&file.path).await.map_err(|err| {
            etl_error!(
                ErrorKind::UploadFailed,
                "Local file cannot be resolved",
                file.path.display(),
                source: err
            )
        })?;

        let metadata = tokio::fs::metadata(&path).await.map_err(|err| {
            etl_error!(
                ErrorKind::UploadFailed,
                "Local file cannot be read",
                path.display(),
                source: err
            )
        })?;
        if !metadata.is_file() {
            bail!(
                ErrorKind::UploadFailed,
                "Local path is not a file",
                path.display()
            );
        }

        #[cfg(feature = "failpoints")]
        crate::failpoints::etl_fail_point(
            crate::failpoints::UPLOAD_BEFORE_PUT,
            ErrorKind::UploadFailed,
        )?;

        let put = put_statement(&path, &self.stage, self.parallel);
        debug!(file = %file.file_name, stage = %self.stage, "uploading file to stage");
        let result = self
            .warehouse
            .execute(&put)
            .await
            .map_err(|err| self.upload_error("Stage upload failed", file, err))?;
        check_put_status(&result, &file.file_name)?;

        let listed = self
            .warehouse
            .execute(&list_statement(&self.stage, &file.file_name))
            .await
            .map_err(|err| self.upload_error("Stage listing failed", file, err))?;
        if !is_listed(&listed, &file.file_name) {
            bail!(
                ErrorKind::UploadFailed,
                "Uploaded file is not present in the stage",
                format!("{} in {}", file.file_name, self.stage)
            );
        }

        transfer_event!(
            FILE_STAGED,
            file = %file.file_name,
            stage = %self.stage,
            bytes = metadata.len(),
            rows = file.rows
        );

        Ok(StagedFile {
            stage: self.stage.clone(),
            file_name: file.file_name.clone(),
            rows: file.rows,
            bytes: metadata.len(),
        })
    }

    fn upload_error(&self, description: &'static str, file: &LocalFile, err: EtlError) -> EtlError {
        etl_error!(
            stage_error_kind(err.kind(), ErrorKind::UploadFailed),
            description,
            format!("{} to {}", file.file_name, self.stage),
            source: err
        )
    }
}

/// Kind reported for a failed warehouse statement. Credential and cancellation failures keep
/// their own kind, everything else becomes `fallback`.
pub(crate) fn stage_error_kind(kind: ErrorKind, fallback: ErrorKind) -> ErrorKind {
    match kind {
        ErrorKind::AuthenticationFailed | ErrorKind::Cancelled | ErrorKind::Timeout => kind,
        _ => fallback,
    }
}

/// Checks the `status` column of a `PUT` result.
fn check_put_status(result: &QueryResult, file_name: &str) -> EtlResult<()> {
    let Some(statuses) = result.values("status") else {
        return Ok(());
    };

    for status in statuses.flatten() {
        if !status.eq_ignore_ascii_case("UPLOADED") && !status.eq_ignore_ascii_case("SKIPPED") {
            bail!(
                ErrorKind::UploadFailed,
                "Stage rejected the upload",
                format!("{file_name}: {status}")
            );
        }
    }

    Ok(())
}

/// Whether a `LIST` result contains `file_name`. Listed names are prefixed with the stage path.
fn is_listed(result: &QueryResult, file_name: &str) -> bool {
    let Some(names) = result.values("name") else {
        return false;
    };

    names.flatten().any(|name| {
        name == file_name
            || name
                .rsplit_once('/')
                .is_some_and(|(_, listed)| listed == file_name)
    })
}
