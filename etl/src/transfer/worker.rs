use metrics::counter;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::backoff::BackoffPolicy;
use crate::bail;
use crate::concurrency::shutdown::{ShutdownResult, ShutdownRx};
use crate::error::{ErrorKind, EtlResult};
use crate::events::BATCH_DECODED;
use crate::metrics::{ETL_TRANSFER_ROWS_READ_TOTAL, SOURCE_TABLE_LABEL};
use crate::source::base::ReadClient;
use crate::source::reader::{StreamRead, StreamReader};
use crate::source::reconstruct::RecordReconstructor;
use crate::state::TransferState;
use crate::transfer_event;
use crate::types::{ReadStreamHandle, Record};

/// Summary of a stream worker that read its stream to the end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSummary {
    pub rows: u64,
    pub records: u64,
    pub retries: u64,
}

/// Reads one stream to the end and forwards its records to the file batcher.
///
/// The worker owns its reader and its reconstructor. Records are sent in stream order; the
/// worker stops with [`ErrorKind::Cancelled`] once `shutdown_rx` fires or the receiving side is
/// gone.
pub struct StreamWorker<C> {
    reader: StreamReader<C>,
    reconstructor: RecordReconstructor,
    records_tx: mpsc::Sender<Record>,
    state: TransferState,
    table: String,
    shutdown_rx: ShutdownRx,
}

impl<C> StreamWorker<C>
where
    C: ReadClient,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: C,
        stream: ReadStreamHandle,
        reconstructor: RecordReconstructor,
        policy: BackoffPolicy,
        records_tx: mpsc::Sender<Record>,
        state: TransferState,
        table: String,
        shutdown_rx: ShutdownRx,
    ) -> Self {
        Self {
            reader: StreamReader::open(client, stream, policy, shutdown_rx.clone()),
            reconstructor,
            records_tx,
            state,
            table,
            shutdown_rx,
        }
    }

    pub async fn run(mut self) -> EtlResult<StreamSummary> {
        let stream = self.reader.stream().clone();
        let mut rows = 0;
        let mut records = 0;

        loop {
            let raw = match self.reader.next().await? {
                StreamRead::Batch(raw) => raw,
                StreamRead::EndOfStream => break,
            };

            let Some(record) = self.reconstructor.reconstruct(&raw)? else {
                debug!(stream = %stream, offset = raw.offset, "skipping batch without rows");
                continue;
            };

            let record_rows = record.num_rows() as u64;
            rows += record_rows;
            records += 1;
            self.state.add_rows_read(record_rows);
            counter!(ETL_TRANSFER_ROWS_READ_TOTAL, SOURCE_TABLE_LABEL => self.table.clone())
                .increment(record_rows);
            transfer_event!(
                BATCH_DECODED,
                stream = %stream,
                offset = raw.offset,
                rows = record_rows
            );

            match self.shutdown_rx.run(self.records_tx.send(record)).await {
                ShutdownResult::Ok(Ok(())) => {}
                ShutdownResult::Ok(Err(_)) | ShutdownResult::Shutdown => {
                    bail!(
                        ErrorKind::Cancelled,
                        "Stream worker stopped before its stream was exhausted",
                        stream
                    );
                }
            }
        }

        let summary = StreamSummary {
            rows,
            records,
            retries: self.reader.retries(),
        };
        info!(
            stream = %stream,
            rows = summary.rows,
            retries = summary.retries,
            "read stream completed"
        );

        Ok(summary)
    }
}
