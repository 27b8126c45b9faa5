use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use gcp_bigquery_client::google::cloud::bigquery::storage::v1::big_query_read_client::BigQueryReadClient as GrpcReadClient;
use gcp_bigquery_client::google::cloud::bigquery::storage::v1::read_rows_response::Rows;
use gcp_bigquery_client::google::cloud::bigquery::storage::v1::read_session::{
    Schema, TableReadOptions,
};
use gcp_bigquery_client::google::cloud::bigquery::storage::v1::{
    CreateReadSessionRequest, DataFormat, ReadRowsRequest, ReadSession as GrpcReadSession,
};
use gcp_bigquery_client::yup_oauth2::authenticator::DefaultAuthenticator;
use gcp_bigquery_client::yup_oauth2::{
    ServiceAccountAuthenticator, parse_service_account_key, read_service_account_key,
};
use secrecy::{ExposeSecret, SecretString};
use tonic::metadata::MetadataValue;
use tonic::transport::{Channel, ClientTlsConfig};
use tonic::{Code, Request, Status};
use tracing::{debug, info};

use crate::error::{ErrorKind, EtlError, EtlResult};
use crate::etl_error;
use crate::source::base::{ReadClient, ReadRowsStream};
use crate::types::{ReadOptions, ReadRowsResponse, ReadSession, ReadStreamHandle, SourceTableRef};

/// Storage Read API endpoint.
const BIGQUERY_STORAGE_ENDPOINT: &str = "https://bigquerystorage.googleapis.com";

/// OAuth scope granting read access to BigQuery.
const BIGQUERY_SCOPE: &str = "https://www.googleapis.com/auth/bigquery";

/// Deadline of a single `CreateReadSession` call.
const CREATE_SESSION_TIMEOUT: Duration = Duration::from_secs(600);

/// Environment variable pointing at a service account key file.
const GOOGLE_APPLICATION_CREDENTIALS: &str = "GOOGLE_APPLICATION_CREDENTIALS";

/// Maps a gRPC status of `CreateReadSession` to an error.
fn session_error(status: Status) -> EtlError {
    let kind = match status.code() {
        Code::DeadlineExceeded => ErrorKind::SourceDeadlineExceeded,
        Code::Unavailable => ErrorKind::SourceUnavailable,
        Code::Unauthenticated | Code::PermissionDenied => ErrorKind::AuthenticationFailed,
        _ => ErrorKind::SessionFailed,
    };

    etl_error!(
        kind,
        "BigQuery read session creation failed",
        format!("{:?}: {}", status.code(), status.message()),
        source: status
    )
}

/// Maps a gRPC status of `ReadRows` to an error.
fn read_error(status: Status) -> EtlError {
    let kind = match status.code() {
        Code::DeadlineExceeded => ErrorKind::SourceDeadlineExceeded,
        Code::Unavailable => ErrorKind::SourceUnavailable,
        Code::Unauthenticated | Code::PermissionDenied => ErrorKind::AuthenticationFailed,
        _ => ErrorKind::SourceTransportFailed,
    };

    etl_error!(
        kind,
        "BigQuery stream read failed",
        format!("{:?}: {}", status.code(), status.message()),
        source: status
    )
}

/// [`ReadClient`] backed by the BigQuery Storage Read API over gRPC.
///
/// Sessions are created with the Arrow data format. Every call carries a fresh OAuth token
/// obtained from the service account and the routing header expected by the API.
#[derive(Clone)]
pub struct BigQueryReadClient {
    grpc: GrpcReadClient<Channel>,
    authenticator: DefaultAuthenticator,
}

impl BigQueryReadClient {
    /// Creates a client authenticated with a service account key given as JSON.
    pub async fn new_with_key(service_account_key: &SecretString) -> EtlResult<Self> {
        let key = parse_service_account_key(service_account_key.expose_secret()).map_err(|err| {
            etl_error!(
                ErrorKind::AuthenticationFailed,
                "Invalid BigQuery service account key",
                source: err
            )
        })?;

        Self::from_key(key).await
    }

    /// Creates a client from the key file named by `GOOGLE_APPLICATION_CREDENTIALS`.
    pub async fn new_with_default_credentials() -> EtlResult<Self> {
        let path = std::env::var(GOOGLE_APPLICATION_CREDENTIALS).map_err(|err| {
            etl_error!(
                ErrorKind::AuthenticationFailed,
                "No BigQuery credentials configured",
                GOOGLE_APPLICATION_CREDENTIALS,
                source: err
            )
        })?;
        let key = read_service_account_key(&path).await.map_err(|err| {
            etl_error!(
                ErrorKind::AuthenticationFailed,
                "Failed to read BigQuery service account key file",
                path,
                source: err
            )
        })?;

        Self::from_key(key).await
    }

    /// Creates a client from an optional inline key, falling back to the default credentials.
    pub async fn new(service_account_key: Option<&SecretString>) -> EtlResult<Self> {
        match service_account_key {
            Some(key) => Self::new_with_key(key).await,
            None => Self::new_with_default_credentials().await,
        }
    }

    async fn from_key(
        key: gcp_bigquery_client::yup_oauth2::ServiceAccountKey,
    ) -> EtlResult<Self> {
        let authenticator = ServiceAccountAuthenticator::builder(key)
            .build()
            .await
            .map_err(|err| {
                etl_error!(
                    ErrorKind::AuthenticationFailed,
                    "Failed to build BigQuery authenticator",
                    source: err
                )
            })?;

        let tls = ClientTlsConfig::new().with_native_roots();
        let channel = Channel::from_static(BIGQUERY_STORAGE_ENDPOINT)
            .tls_config(tls)
            .map_err(|err| {
                etl_error!(
                    ErrorKind::SourceTransportFailed,
                    "Invalid BigQuery TLS configuration",
                    source: err
                )
            })?
            .connect()
            .await
            .map_err(|err| {
                etl_error!(
                    ErrorKind::SourceUnavailable,
                    "Failed to connect to the BigQuery Storage API",
                    BIGQUERY_STORAGE_ENDPOINT,
                    source: err
                )
            })?;

        info!(endpoint = BIGQUERY_STORAGE_ENDPOINT, "connected to bigquery storage api");

        Ok(Self {
            grpc: GrpcReadClient::new(channel),
            authenticator,
        })
    }

    /// Wraps `message` into a request with the authorization and routing headers set.
    async fn request<T>(&self, message: T, routing: String) -> EtlResult<Request<T>> {
        let token = self
            .authenticator
            .token(&[BIGQUERY_SCOPE])
            .await
            .map_err(|err| {
                etl_error!(
                    ErrorKind::AuthenticationFailed,
                    "Failed to obtain a BigQuery access token",
                    source: err
                )
            })?;
        let Some(token) = token.token() else {
            return Err(etl_error!(
                ErrorKind::AuthenticationFailed,
                "BigQuery access token is empty"
            ));
        };

        let authorization: MetadataValue<_> =
            format!("Bearer {token}").parse().map_err(|err| {
                etl_error!(
                    ErrorKind::AuthenticationFailed,
                    "BigQuery access token is not a valid header",
                    source: err
                )
            })?;
        let routing: MetadataValue<_> = routing.parse().map_err(|err| {
            etl_error!(
                ErrorKind::InvalidState,
                "Invalid BigQuery routing header",
                source: err
            )
        })?;

        let mut request = Request::new(message);
        request.metadata_mut().insert("authorization", authorization);
        request
            .metadata_mut()
            .insert("x-goog-request-params", routing);

        Ok(request)
    }
}

impl std::fmt::Debug for BigQueryReadClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BigQueryReadClient")
            .field("endpoint", &BIGQUERY_STORAGE_ENDPOINT)
            .finish_non_exhaustive()
    }
}

/// Builds the `CreateReadSession` request for `table`.
fn create_session_request(
    table: &SourceTableRef,
    max_stream_count: u32,
    options: &ReadOptions,
) -> CreateReadSessionRequest {
    let read_options = TableReadOptions {
        selected_fields: options.selected_fields.clone(),
        row_restriction: options.row_restriction.clone().unwrap_or_default(),
        ..Default::default()
    };

    CreateReadSessionRequest {
        parent: table.parent(),
        read_session: Some(GrpcReadSession {
            table: table.path(),
            data_format: DataFormat::Arrow as i32,
            read_options: Some(read_options),
            ..Default::default()
        }),
        max_stream_count: i32::try_from(max_stream_count).unwrap_or(i32::MAX),
        ..Default::default()
    }
}

/// Extracts the serialized Arrow schema and the streams from a created session.
fn into_read_session(session: GrpcReadSession) -> EtlResult<ReadSession> {
    let schema_descriptor = match session.schema {
        Some(Schema::ArrowSchema(schema)) => Bytes::from(schema.serialized_schema),
        Some(_) => {
            return Err(etl_error!(
                ErrorKind::SessionFailed,
                "Read session does not use the Arrow format",
                session.name
            ));
        }
        None => Bytes::new(),
    };

    let streams = session
        .streams
        .into_iter()
        .map(|stream| ReadStreamHandle::new(stream.name))
        .collect();

    Ok(ReadSession {
        name: session.name,
        schema_descriptor,
        streams,
    })
}

impl ReadClient for BigQueryReadClient {
    async fn create_read_session(
        &self,
        table: &SourceTableRef,
        max_stream_count: u32,
        options: &ReadOptions,
    ) -> EtlResult<ReadSession> {
        let message = create_session_request(table, max_stream_count, options);
        let mut request = self
            .request(message, format!("read_session.table={}", table.path()))
            .await?;
        request.set_timeout(CREATE_SESSION_TIMEOUT);

        let session = self
            .grpc
            .clone()
            .create_read_session(request)
            .await
            .map_err(session_error)?
            .into_inner();

        debug!(session = %session.name, streams = session.streams.len(), "read session created");

        into_read_session(session)
    }

    async fn read_rows(&self, stream: &ReadStreamHandle, offset: u64) -> EtlResult<ReadRowsStream> {
        let message = ReadRowsRequest {
            read_stream: stream.name.clone(),
            offset: i64::try_from(offset).map_err(|_| {
                etl_error!(
                    ErrorKind::InvalidState,
                    "Stream offset out of range",
                    offset
                )
            })?,
        };
        let request = self
            .request(message, format!("read_stream={}", stream.name))
            .await?;

        let responses = self
            .grpc
            .clone()
            .read_rows(request)
            .await
            .map_err(read_error)?
            .into_inner();

        let responses = responses.filter_map(|response| async move {
            match response {
                Ok(response) => match response.rows {
                    Some(Rows::ArrowRecordBatch(batch)) => Some(Ok(ReadRowsResponse {
                        serialized_record_batch: Bytes::from(batch.serialized_record_batch),
                        row_count: u64::try_from(response.row_count).unwrap_or(0),
                    })),
                    Some(_) => Some(Err(etl_error!(
                        ErrorKind::DecodeFailed,
                        "Stream response is not an Arrow record batch"
                    ))),
                    // Progress or throttling updates without rows.
                    None => None,
                },
                Err(status) => Some(Err(read_error(status))),
            }
        });

        Ok(responses.boxed())
    }
}
