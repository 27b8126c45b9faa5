use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use parquet::file::reader::{FileReader, SerializedFileReader};
use tokio::sync::Mutex;

use crate::error::{ErrorKind, EtlError, EtlResult};
use crate::etl_error;
use crate::sink::base::{QueryResult, WarehouseClient};
use crate::sink::stage::normalize_stage_ref;

#[derive(Debug, Clone)]
struct StagedObject {
    size: u64,
    /// Row count from the Parquet footer, `None` when the file is not valid Parquet.
    rows: Option<u64>,
}

#[derive(Debug, Default)]
struct LoadedTable {
    files: HashSet<String>,
    rows: u64,
}

#[derive(Debug, Default)]
struct Inner {
    stages: HashMap<String, BTreeMap<String, StagedObject>>,
    tables: HashMap<String, LoadedTable>,
    failures: VecDeque<(String, ErrorKind)>,
    statements: Vec<String>,
}

/// In-memory warehouse understanding the `PUT`, `LIST` and `COPY INTO` statements issued by the
/// staged load.
///
/// `PUT` reads the local file and keeps its Parquet row count, `COPY INTO` loads every staged file
/// not loaded into the table before, mirroring Snowflake's load metadata. Staged files are never
/// removed.
#[derive(Debug, Clone, Default)]
pub struct MemoryWarehouse {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the next statement starting with `prefix` (case-insensitive) with `kind`.
    pub async fn fail_next(&self, prefix: &str, kind: ErrorKind) {
        let mut inner = self.inner.lock().await;
        inner.failures.push_back((prefix.to_ascii_uppercase(), kind));
    }

    /// Names of the files present in `stage`, sorted.
    pub async fn staged_files(&self, stage: &str) -> Vec<String> {
        let inner = self.inner.lock().await;
        inner
            .stages
            .get(&normalize_stage_ref(stage))
            .map(|files| files.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Rows loaded into `table` over all `COPY INTO` statements.
    pub async fn loaded_rows(&self, table: &str) -> u64 {
        let inner = self.inner.lock().await;
        inner.tables.get(table).map(|table| table.rows).unwrap_or(0)
    }

    /// Files loaded into `table`, sorted.
    pub async fn loaded_files(&self, table: &str) -> Vec<String> {
        let inner = self.inner.lock().await;
        let mut files: Vec<String> = inner
            .tables
            .get(table)
            .map(|table| table.files.iter().cloned().collect())
            .unwrap_or_default();
        files.sort();
        files
    }

    /// Every statement received, in order, including failed ones.
    pub async fn statements(&self) -> Vec<String> {
        self.inner.lock().await.statements.clone()
    }

    /// Statements starting with `prefix`, e.g. `COPY`.
    pub async fn statements_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.inner
            .lock()
            .await
            .statements
            .iter()
            .filter(|statement| starts_with_keyword(statement, prefix))
            .cloned()
            .collect()
    }

    async fn put(&self, statement: &str) -> EtlResult<QueryResult> {
        let (url, rest) = split_literal(statement)?;
        let stage = first_token(rest)?;
        let Some(path) = url.strip_prefix("file://") else {
            return Err(etl_error!(
                ErrorKind::UploadFailed,
                "PUT source is not a file url",
                url
            ));
        };

        let file_name = std::path::Path::new(path)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| {
                etl_error!(ErrorKind::UploadFailed, "PUT source has no file name", path)
            })?;
        let content = tokio::fs::read(path).await.map_err(|err| {
            etl_error!(
                ErrorKind::UploadFailed,
                "PUT source cannot be read",
                path,
                source: err
            )
        })?;

        let size = content.len() as u64;
        let rows = SerializedFileReader::new(Bytes::from(content))
            .ok()
            .map(|reader| reader.metadata().file_metadata().num_rows() as u64);

        let mut inner = self.inner.lock().await;
        inner
            .stages
            .entry(normalize_stage_ref(stage))
            .or_default()
            .insert(file_name.clone(), StagedObject { size, rows });

        Ok(QueryResult::new(
            vec![
                "source".to_owned(),
                "target".to_owned(),
                "source_size".to_owned(),
                "target_size".to_owned(),
                "status".to_owned(),
            ],
            vec![vec![
                Some(file_name.clone()),
                Some(file_name),
                Some(size.to_string()),
                Some(size.to_string()),
                Some("UPLOADED".to_owned()),
            ]],
        ))
    }

    async fn list(&self, statement: &str) -> EtlResult<QueryResult> {
        let rest = statement.trim_start()["LIST".len()..].trim_start();
        let stage = normalize_stage_ref(first_token(rest)?);
        let suffix = match split_literal(rest) {
            Ok((pattern, _)) => unescape_pattern(pattern.trim_start_matches(".*")),
            Err(_) => String::new(),
        };

        let inner = self.inner.lock().await;
        let stage_name = stage.trim_start_matches('@').to_ascii_lowercase();
        let rows = inner
            .stages
            .get(&stage)
            .map(|files| {
                files
                    .iter()
                    .filter(|(name, _)| name.ends_with(&suffix))
                    .map(|(name, object)| {
                        vec![
                            Some(format!("{stage_name}/{name}")),
                            Some(object.size.to_string()),
                        ]
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(QueryResult::new(
            vec!["name".to_owned(), "size".to_owned()],
            rows,
        ))
    }

    async fn copy(&self, statement: &str) -> EtlResult<QueryResult> {
        let mut tokens = statement.split_whitespace().skip(2);
        let table = tokens
            .next()
            .ok_or_else(|| etl_error!(ErrorKind::LoadFailed, "COPY has no table", statement))?
            .to_owned();
        let stage = match (tokens.next(), tokens.next()) {
            (Some(from), Some(stage)) if from.eq_ignore_ascii_case("FROM") => {
                normalize_stage_ref(stage)
            }
            _ => {
                return Err(etl_error!(
                    ErrorKind::LoadFailed,
                    "COPY has no source stage",
                    statement
                ));
            }
        };

        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let staged = inner.stages.get(&stage).cloned().unwrap_or_default();
        let loaded = inner.tables.entry(table.clone()).or_default();

        let mut results = Vec::new();
        for (name, object) in staged {
            if loaded.files.contains(&name) {
                continue;
            }

            let Some(rows) = object.rows else {
                return Err(etl_error!(
                    ErrorKind::LoadFailed,
                    "Staged file is not valid Parquet",
                    name
                ));
            };
            results.push((name, rows));
        }

        if results.is_empty() {
            return Ok(QueryResult::new(
                vec!["status".to_owned()],
                vec![vec![Some("Copy executed with 0 files processed.".to_owned())]],
            ));
        }

        let mut rows = Vec::with_capacity(results.len());
        for (name, count) in results {
            loaded.files.insert(name.clone());
            loaded.rows += count;
            rows.push(vec![
                Some(format!("{}/{name}", stage.trim_start_matches('@'))),
                Some("LOADED".to_owned()),
                Some(count.to_string()),
                Some(count.to_string()),
            ]);
        }

        Ok(QueryResult::new(
            vec![
                "file".to_owned(),
                "status".to_owned(),
                "rows_parsed".to_owned(),
                "rows_loaded".to_owned(),
            ],
            rows,
        ))
    }
}

impl WarehouseClient for MemoryWarehouse {
    async fn execute(&self, statement: &str) -> EtlResult<QueryResult> {
        {
            let mut inner = self.inner.lock().await;
            inner.statements.push(statement.to_owned());

            let failure = inner
                .failures
                .iter()
                .position(|(prefix, _)| starts_with_keyword(statement, prefix));
            if let Some((_, kind)) = failure.and_then(|index| inner.failures.remove(index)) {
                return Err(EtlError::from((kind, "Injected warehouse failure")));
            }
        }

        if starts_with_keyword(statement, "PUT") {
            self.put(statement).await
        } else if starts_with_keyword(statement, "LIST") {
            self.list(statement).await
        } else if starts_with_keyword(statement, "COPY") {
            self.copy(statement).await
        } else {
            Err(etl_error!(
                ErrorKind::InvalidState,
                "Unsupported statement",
                statement
            ))
        }
    }
}

fn starts_with_keyword(statement: &str, keyword: &str) -> bool {
    statement
        .trim_start()
        .get(..keyword.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(keyword))
}

/// Splits off the first single-quoted literal, returning it unescaped with the remaining input.
fn split_literal(input: &str) -> EtlResult<(String, &str)> {
    let Some(start) = input.find('\'') else {
        return Err(etl_error!(
            ErrorKind::InvalidState,
            "Statement has no string literal",
            input
        ));
    };

    let mut literal = String::new();
    let mut chars = input[start + 1..].char_indices();
    while let Some((index, c)) = chars.next() {
        match c {
            '\\' => {
                if let Some((_, escaped)) = chars.next() {
                    literal.push(escaped);
                }
            }
            '\'' => return Ok((literal, &input[start + 1 + index + 1..])),
            c => literal.push(c),
        }
    }

    Err(etl_error!(
        ErrorKind::InvalidState,
        "Unterminated string literal",
        input
    ))
}

fn first_token(input: &str) -> EtlResult<&str> {
    input
        .split_whitespace()
        .next()
        .ok_or_else(|| etl_error!(ErrorKind::InvalidState, "Statement is missing a stage", input))
}

fn unescape_pattern(pattern: &str) -> String {
    let mut unescaped = String::with_capacity(pattern.len());
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(escaped) = chars.next() {
                unescaped.push(escaped);
            }
        } else {
            unescaped.push(c);
        }
    }

    unescaped
}
