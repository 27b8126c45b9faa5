use std::future::Future;

use futures::stream::BoxStream;

use crate::error::EtlResult;
use crate::types::{ReadOptions, ReadRowsResponse, ReadSession, ReadStreamHandle, SourceTableRef};

/// Server streamed responses of one `ReadRows` call.
pub type ReadRowsStream = BoxStream<'static, EtlResult<ReadRowsResponse>>;

/// Access to a columnar read API such as the BigQuery Storage Read API.
///
/// Errors must be classified: transient transport failures are reported as
/// [`crate::error::ErrorKind::SourceDeadlineExceeded`] or
/// [`crate::error::ErrorKind::SourceUnavailable`] so that callers can retry them, credential
/// problems as [`crate::error::ErrorKind::AuthenticationFailed`].
///
/// Implementations are cloned into every stream worker, so cloning should be cheap.
pub trait ReadClient {
    /// Creates a read session over `table` with at most `max_stream_count` streams.
    fn create_read_session(
        &self,
        table: &SourceTableRef,
        max_stream_count: u32,
        options: &ReadOptions,
    ) -> impl Future<Output = EtlResult<ReadSession>> + Send;

    /// Opens `stream` starting at row `offset`.
    fn read_rows(
        &self,
        stream: &ReadStreamHandle,
        offset: u64,
    ) -> impl Future<Output = EtlResult<ReadRowsStream>> + Send;
}
