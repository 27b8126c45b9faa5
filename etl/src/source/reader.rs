use futures::StreamExt;
use metrics::counter;
use tracing::{debug, warn};

use crate::backoff::{BackoffPolicy, RetryDecision, RetryState};
use crate::concurrency::shutdown::{ShutdownResult, ShutdownRx};
use crate::error::{ErrorKind, EtlError, EtlResult};
use crate::events::STREAM_OPENED;
use crate::metrics::ETL_TRANSFER_STREAM_RETRIES_TOTAL;
use crate::source::base::{ReadClient, ReadRowsStream};
use crate::types::{RawBatch, ReadStreamHandle};
use crate::{bail, transfer_event};

/// Result of [`StreamReader::next`].
#[derive(Debug)]
pub enum StreamRead {
    Batch(RawBatch),
    /// The stream is exhausted. Further calls keep returning this.
    EndOfStream,
}

/// Sequential reader over one read stream.
///
/// The reader tracks the number of rows received so far. When the underlying call fails with a
/// retryable error it is reopened at that offset, so rows are neither skipped nor repeated. The
/// offset only moves once a response has been received in full.
pub struct StreamReader<C> {
    client: C,
    stream: ReadStreamHandle,
    offset: u64,
    responses: Option<ReadRowsStream>,
    retry: RetryState,
    shutdown_rx: ShutdownRx,
    exhausted: bool,
}

impl<C> StreamReader<C>
where
    C: ReadClient,
{
    /// Creates a reader for `stream`. The stream is opened lazily on the first read.
    pub fn open(
        client: C,
        stream: ReadStreamHandle,
        policy: BackoffPolicy,
        shutdown_rx: ShutdownRx,
    ) -> Self {
        Self {
            client,
            stream,
            offset: 0,
            responses: None,
            retry: RetryState::new(policy),
            shutdown_rx,
            exhausted: false,
        }
    }

    pub fn stream(&self) -> &ReadStreamHandle {
        &self.stream
    }

    /// Rows received so far, i.e. the offset a reopened call starts from.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Number of times the stream was reopened after a retryable error.
    pub fn retries(&self) -> u64 {
        self.retry.total_retries()
    }

    /// Returns the next raw batch of the stream.
    ///
    /// Retryable errors are absorbed until the retry budget is spent. Every other error, and
    /// cancellation through the shutdown channel, is returned to the caller.
    pub async fn next(&mut self) -> EtlResult<StreamRead> {
        loop {
            if self.exhausted {
                return Ok(StreamRead::EndOfStream);
            }

            if self.responses.is_none() {
                let opened = match self
                    .shutdown_rx
                    .run(self.client.read_rows(&self.stream, self.offset))
                    .await
                {
                    ShutdownResult::Ok(opened) => opened,
                    ShutdownResult::Shutdown => {
                        bail!(ErrorKind::Cancelled, "Stream read was cancelled")
                    }
                };

                match opened {
                    Ok(responses) => {
                        transfer_event!(
                            STREAM_OPENED,
                            stream = %self.stream,
                            offset = self.offset
                        );
                        self.responses = Some(responses);
                    }
                    Err(err) => {
                        self.backoff(err).await?;
                        continue;
                    }
                }
            }

            let Some(responses) = self.responses.as_mut() else {
                continue;
            };

            let next = match self.shutdown_rx.run(responses.next()).await {
                ShutdownResult::Ok(next) => next,
                ShutdownResult::Shutdown => {
                    bail!(ErrorKind::Cancelled, "Stream read was cancelled")
                }
            };

            match next {
                None => {
                    debug!(stream = %self.stream, offset = self.offset, "read stream exhausted");
                    self.exhausted = true;
                    self.responses = None;
                }
                Some(Ok(response)) => {
                    let batch = RawBatch {
                        bytes: response.serialized_record_batch,
                        row_count: response.row_count,
                        offset: self.offset,
                    };
                    self.offset += response.row_count;
                    self.retry.record_success();

                    return Ok(StreamRead::Batch(batch));
                }
                Some(Err(err)) => {
                    self.responses = None;
                    self.backoff(err).await?;
                }
            }
        }
    }

    /// Waits before reopening the stream, or returns `err` when it must not be retried.
    async fn backoff(&mut self, err: EtlError) -> EtlResult<()> {
        let RetryDecision { retry, delay } = self.retry.record_failure(&err);
        if !retry {
            return Err(err);
        }

        counter!(ETL_TRANSFER_STREAM_RETRIES_TOTAL).increment(1);
        warn!(
            stream = %self.stream,
            offset = self.offset,
            attempt = self.retry.attempts(),
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "read stream failed, reopening at last offset"
        );

        if let ShutdownResult::Shutdown = self.shutdown_rx.run(tokio::time::sleep(delay)).await {
            bail!(ErrorKind::Cancelled, "Stream read was cancelled");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use config::shared::BackoffConfig;

    use super::*;
    use crate::concurrency::shutdown::create_shutdown_channel;
    use crate::test_utils::arrow::{encode_batches, test_batch};
    use crate::test_utils::memory_source::MemoryReadClient;

    fn fast_policy(max_attempts: u32) -> BackoffPolicy {
        BackoffPolicy::new(BackoffConfig {
            initial_delay_ms: 1,
            multiplier: 2.0,
            max_delay_ms: 4,
            max_attempts,
        })
    }

    async fn drain(reader: &mut StreamReader<MemoryReadClient>) -> EtlResult<Vec<RawBatch>> {
        let mut batches = Vec::new();
        loop {
            match reader.next().await? {
                StreamRead::Batch(batch) => batches.push(batch),
                StreamRead::EndOfStream => return Ok(batches),
            }
        }
    }

    #[tokio::test]
    async fn resumes_at_last_received_offset() {
        let (schema, responses) =
            encode_batches(&[test_batch(0, 100), test_batch(100, 30), test_batch(130, 20)]);
        let client = MemoryReadClient::new(schema);
        client.add_stream("s0", responses).await;
        client
            .fail_stream_after("s0", 1, ErrorKind::SourceUnavailable)
            .await;
        let (_tx, rx) = create_shutdown_channel();

        let mut reader = StreamReader::open(
            client.clone(),
            ReadStreamHandle::new("s0"),
            fast_policy(3),
            rx,
        );
        let batches = drain(&mut reader).await.unwrap();

        let offsets: Vec<u64> = batches.iter().map(|batch| batch.offset).collect();
        assert_eq!(offsets, vec![0, 100, 130]);
        assert_eq!(reader.offset(), 150);
        assert_eq!(reader.retries(), 1);
        assert_eq!(client.read_offsets("s0").await, vec![0, 100]);
    }

    #[tokio::test]
    async fn retries_failed_opens() {
        let (schema, responses) = encode_batches(&[test_batch(0, 5)]);
        let client = MemoryReadClient::new(schema);
        client.add_stream("s0", responses).await;
        client
            .fail_stream_open("s0", ErrorKind::SourceDeadlineExceeded)
            .await;
        let (_tx, rx) = create_shutdown_channel();

        let mut reader =
            StreamReader::open(client.clone(), ReadStreamHandle::new("s0"), fast_policy(3), rx);
        let batches = drain(&mut reader).await.unwrap();

        assert_eq!(batches.len(), 1);
        assert_eq!(client.read_offsets("s0").await, vec![0, 0]);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let (schema, responses) = encode_batches(&[test_batch(0, 5), test_batch(5, 5)]);
        let client = MemoryReadClient::new(schema);
        client.add_stream("s0", responses).await;
        client
            .fail_stream_after("s0", 1, ErrorKind::SourceTransportFailed)
            .await;
        let (_tx, rx) = create_shutdown_channel();

        let mut reader =
            StreamReader::open(client.clone(), ReadStreamHandle::new("s0"), fast_policy(3), rx);

        assert!(matches!(reader.next().await.unwrap(), StreamRead::Batch(_)));
        let err = reader.next().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SourceTransportFailed);
        assert_eq!(client.read_offsets("s0").await, vec![0]);
    }

    #[tokio::test]
    async fn exhausted_retry_budget_surfaces_the_error() {
        let (schema, responses) = encode_batches(&[test_batch(0, 5)]);
        let client = MemoryReadClient::new(schema);
        client.add_stream("s0", responses).await;
        for _ in 0..3 {
            client
                .fail_stream_open("s0", ErrorKind::SourceUnavailable)
                .await;
        }
        let (_tx, rx) = create_shutdown_channel();

        let mut reader =
            StreamReader::open(client.clone(), ReadStreamHandle::new("s0"), fast_policy(2), rx);
        let err = reader.next().await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::SourceUnavailable);
        assert_eq!(client.read_offsets("s0").await.len(), 3);
    }

    #[tokio::test]
    async fn end_of_stream_is_sticky() {
        let (schema, _) = encode_batches(&[test_batch(0, 1)]);
        let client = MemoryReadClient::new(schema);
        client.add_stream("s0", Vec::new()).await;
        let (_tx, rx) = create_shutdown_channel();

        let mut reader =
            StreamReader::open(client.clone(), ReadStreamHandle::new("s0"), fast_policy(1), rx);

        assert!(matches!(reader.next().await.unwrap(), StreamRead::EndOfStream));
        assert!(matches!(reader.next().await.unwrap(), StreamRead::EndOfStream));
        assert_eq!(client.read_offsets("s0").await, vec![0]);
    }

    #[tokio::test]
    async fn shutdown_cancels_a_hanging_stream() {
        let (schema, responses) = encode_batches(&[test_batch(0, 5)]);
        let client = MemoryReadClient::new(schema);
        client.add_stream("s0", responses).await;
        client.hang_stream("s0").await;
        let (tx, rx) = create_shutdown_channel();

        let mut reader =
            StreamReader::open(client, ReadStreamHandle::new("s0"), fast_policy(1), rx);
        assert!(matches!(reader.next().await.unwrap(), StreamRead::Batch(_)));

        tx.shutdown();
        let err = reader.next().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }
}
