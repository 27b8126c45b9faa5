use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{StreamExt, stream};
use tokio::sync::{Mutex, Notify};

use crate::error::{ErrorKind, EtlError, EtlResult};
use crate::etl_error;
use crate::source::base::{ReadClient, ReadRowsStream};
use crate::types::{ReadOptions, ReadRowsResponse, ReadSession, ReadStreamHandle, SourceTableRef};

/// Longest time [`MemoryReadClient::wait_until_hanging`] waits before failing the test.
const HANG_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Default)]
struct StreamFixture {
    responses: Vec<ReadRowsResponse>,
    /// One shot failure raised after the response with this index was delivered.
    fail_after: Option<(usize, ErrorKind)>,
    open_failures: VecDeque<ErrorKind>,
    read_offsets: Vec<u64>,
    hang: bool,
}

impl StreamFixture {
    /// Index of the response that starts at row `offset`.
    fn response_index(&self, offset: u64) -> Option<usize> {
        let mut rows = 0;
        for (index, response) in self.responses.iter().enumerate() {
            if rows == offset {
                return Some(index);
            }
            rows += response.row_count;
        }

        (rows == offset).then_some(self.responses.len())
    }
}

#[derive(Debug)]
struct Inner {
    schema: Bytes,
    streams: Vec<(String, StreamFixture)>,
    session_failures: VecDeque<ErrorKind>,
    session_requests: usize,
    last_options: Option<ReadOptions>,
}

impl Inner {
    fn stream_mut(&mut self, name: &str) -> Option<&mut StreamFixture> {
        self.streams
            .iter_mut()
            .find(|(stream, _)| stream == name)
            .map(|(_, fixture)| fixture)
    }
}

/// In-memory read API serving canned responses.
///
/// Sessions contain every stream added with [`MemoryReadClient::add_stream`], in insertion order.
/// Failures can be scripted per session call and per stream, and every `ReadRows` offset is
/// recorded so tests can check where streams were reopened.
#[derive(Debug, Clone)]
pub struct MemoryReadClient {
    inner: Arc<Mutex<Inner>>,
    hang_notify: Arc<Notify>,
}

impl MemoryReadClient {
    /// Creates a client whose sessions carry `schema` as the schema descriptor.
    pub fn new(schema: Bytes) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                schema,
                streams: Vec::new(),
                session_failures: VecDeque::new(),
                session_requests: 0,
                last_options: None,
            })),
            hang_notify: Arc::new(Notify::new()),
        }
    }

    pub async fn add_stream(&self, name: &str, responses: Vec<ReadRowsResponse>) {
        let mut inner = self.inner.lock().await;
        inner.streams.push((
            name.to_owned(),
            StreamFixture {
                responses,
                ..StreamFixture::default()
            },
        ));
    }

    /// Fails the next session requests with `kinds`, one per request.
    pub async fn fail_session_creation(&self, kinds: Vec<ErrorKind>) {
        let mut inner = self.inner.lock().await;
        inner.session_failures.extend(kinds);
    }

    pub async fn session_requests(&self) -> usize {
        self.inner.lock().await.session_requests
    }

    /// Options passed to the most recent session request.
    pub async fn last_read_options(&self) -> Option<ReadOptions> {
        self.inner.lock().await.last_options.clone()
    }

    /// Breaks the stream once, after `delivered` responses of it have been sent.
    pub async fn fail_stream_after(&self, stream: &str, delivered: usize, kind: ErrorKind) {
        let mut inner = self.inner.lock().await;
        if let Some(fixture) = inner.stream_mut(stream) {
            fixture.fail_after = Some((delivered, kind));
        }
    }

    /// Fails the next `ReadRows` call on the stream. Calls queue up.
    pub async fn fail_stream_open(&self, stream: &str, kind: ErrorKind) {
        let mut inner = self.inner.lock().await;
        if let Some(fixture) = inner.stream_mut(stream) {
            fixture.open_failures.push_back(kind);
        }
    }

    /// Keeps the stream open without further responses once its responses are sent.
    pub async fn hang_stream(&self, stream: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(fixture) = inner.stream_mut(stream) {
            fixture.hang = true;
        }
    }

    /// Waits until a stream marked with [`MemoryReadClient::hang_stream`] has sent all of its
    /// responses and is left pending.
    ///
    /// # Panics
    ///
    /// Panics if no stream starts hanging within [`HANG_WAIT_TIMEOUT`].
    pub async fn wait_until_hanging(&self) {
        if tokio::time::timeout(HANG_WAIT_TIMEOUT, self.hang_notify.notified())
            .await
            .is_err()
        {
            panic!("no read stream started hanging within {HANG_WAIT_TIMEOUT:?}");
        }
    }

    /// Offsets of every `ReadRows` call made on the stream.
    pub async fn read_offsets(&self, stream: &str) -> Vec<u64> {
        let mut inner = self.inner.lock().await;
        inner
            .stream_mut(stream)
            .map(|fixture| fixture.read_offsets.clone())
            .unwrap_or_default()
    }
}

impl ReadClient for MemoryReadClient {
    async fn create_read_session(
        &self,
        table: &SourceTableRef,
        _max_stream_count: u32,
        options: &ReadOptions,
    ) -> EtlResult<ReadSession> {
        let mut inner = self.inner.lock().await;
        inner.session_requests += 1;
        inner.last_options = Some(options.clone());

        if let Some(kind) = inner.session_failures.pop_front() {
            return Err(EtlError::from((kind, "Injected read session failure")));
        }

        Ok(ReadSession {
            name: format!("{}/sessions/memory-{}", table.parent(), inner.session_requests),
            schema_descriptor: inner.schema.clone(),
            streams: inner
                .streams
                .iter()
                .map(|(name, _)| ReadStreamHandle::new(name.clone()))
                .collect(),
        })
    }

    async fn read_rows(&self, stream: &ReadStreamHandle, offset: u64) -> EtlResult<ReadRowsStream> {
        let mut inner = self.inner.lock().await;
        let Some(fixture) = inner.stream_mut(&stream.name) else {
            return Err(etl_error!(
                ErrorKind::SourceTransportFailed,
                "Unknown read stream",
                stream.name
            ));
        };

        fixture.read_offsets.push(offset);
        if let Some(kind) = fixture.open_failures.pop_front() {
            return Err(EtlError::from((kind, "Injected stream open failure")));
        }

        let Some(start) = fixture.response_index(offset) else {
            return Err(etl_error!(
                ErrorKind::InvalidState,
                "Offset is not at a response boundary",
                format!("stream {stream} offset {offset}")
            ));
        };

        let mut end = fixture.responses.len();
        let mut failure = None;
        if let Some((delivered, kind)) = fixture.fail_after {
            if delivered >= start && delivered < end {
                end = delivered;
                failure = Some(kind);
                fixture.fail_after = None;
            }
        }

        let responses: Vec<EtlResult<ReadRowsResponse>> = fixture.responses[start..end]
            .iter()
            .cloned()
            .map(Ok)
            .collect();
        let head = stream::iter(responses);

        if let Some(kind) = failure {
            let error = EtlError::from((kind, "Injected stream failure"));
            return Ok(head.chain(stream::iter([Err(error)])).boxed());
        }

        if fixture.hang {
            let notify = self.hang_notify.clone();
            let tail = stream::once(async move {
                notify.notify_one();
                futures::future::pending::<EtlResult<ReadRowsResponse>>().await
            });
            return Ok(head.chain(tail).boxed());
        }

        Ok(head.boxed())
    }
}

/// Builds one client serving `streams`, each a list of responses, named `s0`, `s1`, ...
pub async fn memory_client_with_streams(
    schema: Bytes,
    streams: Vec<Vec<ReadRowsResponse>>,
) -> MemoryReadClient {
    let client = MemoryReadClient::new(schema);
    for (index, responses) in streams.into_iter().enumerate() {
        client.add_stream(&format!("s{index}"), responses).await;
    }

    client
}

