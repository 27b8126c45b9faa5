use std::sync::Arc;
use std::time::Duration;

use config::shared::{SnowflakeConfig, UploadLogin};
use reqwest::{Client, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use snowflake_api::SnowflakeApi;
use tracing::debug;

use crate::error::{ErrorKind, EtlError, EtlResult};
use crate::etl_error;
use crate::sink::base::{QueryResult, WarehouseClient};

/// Statement endpoint of the Snowflake SQL API.
const STATEMENTS_PATH: &str = "/api/v2/statements";

/// Delay between two polls of a statement still running.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Server side timeout of a single statement, in seconds.
const STATEMENT_TIMEOUT_SECS: u64 = 3600;

#[derive(Debug, Serialize)]
struct StatementRequest<'a> {
    statement: &'a str,
    timeout: u64,
    database: &'a str,
    schema: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    warehouse: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct RowType {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResultSetMetaData {
    #[serde(default)]
    row_type: Vec<RowType>,
    #[serde(default)]
    partition_info: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatementResponse {
    #[serde(default)]
    statement_handle: Option<String>,
    #[serde(default)]
    result_set_meta_data: Option<ResultSetMetaData>,
    #[serde(default)]
    data: Vec<Vec<Option<String>>>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// [`WarehouseClient`] talking to the Snowflake SQL API.
///
/// Statements are submitted to `/api/v2/statements` with the configured token as bearer
/// credential. Statements that do not finish within the request are polled by handle, and
/// multi-partition results are fetched partition by partition.
///
/// The SQL API does not run `PUT`, which needs a driver to move the local file into the stage's
/// storage. `PUT` statements go through a driver session logged in with the configured
/// [`UploadLogin`] instead.
#[derive(Clone)]
pub struct SnowflakeClient {
    client: Client,
    files: Arc<SnowflakeApi>,
    endpoint: String,
    token: SecretString,
    database: String,
    schema: String,
    warehouse: Option<String>,
    role: Option<String>,
}

impl SnowflakeClient {
    pub fn new(config: &SnowflakeConfig) -> EtlResult<Self> {
        let client = Client::builder().build().map_err(|err| {
            etl_error!(
                ErrorKind::InvalidState,
                "Failed to build Snowflake http client",
                source: err
            )
        })?;

        Ok(Self {
            client,
            files: Arc::new(upload_session(config)?),
            endpoint: config.endpoint(),
            token: config.token.clone(),
            database: config.database.clone(),
            schema: config.schema.clone(),
            warehouse: config.warehouse.clone(),
            role: config.role.clone(),
        })
    }

    async fn submit(&self, statement: &str) -> EtlResult<StatementResponse> {
        let body = StatementRequest {
            statement,
            timeout: STATEMENT_TIMEOUT_SECS,
            database: &self.database,
            schema: &self.schema,
            warehouse: self.warehouse.as_deref(),
            role: self.role.as_deref(),
        };

        let response = self
            .client
            .post(format!("{}{STATEMENTS_PATH}", self.endpoint))
            .bearer_auth(self.token.expose_secret())
            .header("X-Snowflake-Authorization-Token-Type", "OAUTH")
            .header("Accept", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        parse_response(response).await
    }

    async fn get(&self, url: String) -> EtlResult<StatementResponse> {
        let response = self
            .client
            .get(url)
            .bearer_auth(self.token.expose_secret())
            .header("X-Snowflake-Authorization-Token-Type", "OAUTH")
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(transport_error)?;

        parse_response(response).await
    }

    fn statement_url(&self, handle: &str) -> String {
        format!("{}{STATEMENTS_PATH}/{handle}", self.endpoint)
    }

    /// Runs a `PUT` through the driver session.
    ///
    /// The driver reports no per-file status, so the result is empty and presence in the stage is
    /// confirmed by the caller with `LIST`.
    async fn put(&self, statement: &str) -> EtlResult<QueryResult> {
        debug!("running PUT through the driver session");
        self.files.exec(statement).await.map_err(|err| {
            etl_error!(
                ErrorKind::UploadFailed,
                "Snowflake driver failed to upload the file",
                statement,
                source: err
            )
        })?;

        Ok(QueryResult::default())
    }
}

/// Builds the driver session used for `PUT`. Logging in happens on the first statement.
fn upload_session(config: &SnowflakeConfig) -> EtlResult<SnowflakeApi> {
    let warehouse = config.warehouse.as_deref();
    let role = config.role.as_deref();
    let database = Some(config.database.as_str());
    let schema = Some(config.schema.as_str());

    let session = match &config.upload_login {
        UploadLogin::Password { user, password } => SnowflakeApi::with_password_auth(
            &config.account,
            warehouse,
            database,
            schema,
            user,
            role,
            password.expose_secret(),
        ),
        UploadLogin::KeyPair { user, private_key } => SnowflakeApi::with_certificate_auth(
            &config.account,
            warehouse,
            database,
            schema,
            user,
            role,
            private_key.expose_secret(),
        ),
    };

    session.map_err(|err| {
        etl_error!(
            ErrorKind::AuthenticationFailed,
            "Failed to set up the Snowflake upload session",
            config.upload_login.user(),
            source: err
        )
    })
}

impl std::fmt::Debug for SnowflakeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnowflakeClient")
            .field("endpoint", &self.endpoint)
            .field("database", &self.database)
            .field("schema", &self.schema)
            .field("warehouse", &self.warehouse)
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}

impl WarehouseClient for SnowflakeClient {
    async fn execute(&self, statement: &str) -> EtlResult<QueryResult> {
        if is_put(statement) {
            return self.put(statement).await;
        }

        let mut response = self.submit(statement).await?;
        while response.result_set_meta_data.is_none() {
            let Some(handle) = response.statement_handle.clone() else {
                return Err(etl_error!(
                    ErrorKind::InvalidState,
                    "Snowflake response has neither result nor statement handle"
                ));
            };

            debug!(handle = %handle, "statement still running, polling");
            tokio::time::sleep(POLL_INTERVAL).await;
            response = self.get(self.statement_url(&handle)).await?;
        }

        let partitions = response
            .result_set_meta_data
            .as_ref()
            .map(|meta| meta.partition_info.len())
            .unwrap_or(0);
        if partitions > 1 {
            let Some(handle) = response.statement_handle.clone() else {
                return Err(etl_error!(
                    ErrorKind::InvalidState,
                    "Partitioned Snowflake result has no statement handle"
                ));
            };

            for partition in 1..partitions {
                let url = format!("{}?partition={partition}", self.statement_url(&handle));
                let next = self.get(url).await?;
                response.data.extend(next.data);
            }
        }

        Ok(into_query_result(response))
    }
}

fn is_put(statement: &str) -> bool {
    statement
        .trim_start()
        .get(..4)
        .is_some_and(|head| head.eq_ignore_ascii_case("PUT "))
}

fn transport_error(err: reqwest::Error) -> EtlError {
    etl_error!(
        ErrorKind::LoadFailed,
        "Snowflake request failed",
        source: err
    )
}

/// Reads a statement response, mapping error statuses to errors.
///
/// `200` carries a result, `202` a handle of a statement still running.
async fn parse_response(response: Response) -> EtlResult<StatementResponse> {
    let status = response.status();
    if status == StatusCode::OK || status == StatusCode::ACCEPTED {
        return response.json().await.map_err(|err| {
            etl_error!(
                ErrorKind::LoadFailed,
                "Invalid Snowflake response",
                source: err
            )
        });
    }

    let body = response.text().await.unwrap_or_default();
    Err(status_error(status, &body))
}

fn status_error(status: StatusCode, body: &str) -> EtlError {
    let message = serde_json::from_str::<StatementResponse>(body)
        .ok()
        .map(|response| {
            format!(
                "{}: {}",
                response.code.unwrap_or_default(),
                response.message.unwrap_or_default()
            )
        })
        .unwrap_or_else(|| body.to_owned());

    let kind = match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ErrorKind::AuthenticationFailed,
        _ => ErrorKind::LoadFailed,
    };

    etl_error!(
        kind,
        "Snowflake statement failed",
        format!("HTTP {status}: {message}")
    )
}

fn into_query_result(response: StatementResponse) -> QueryResult {
    let columns = response
        .result_set_meta_data
        .map(|meta| meta.row_type.into_iter().map(|column| column.name).collect())
        .unwrap_or_default();

    QueryResult::new(columns, response.data)
}
