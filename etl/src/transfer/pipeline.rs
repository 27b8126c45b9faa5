use std::collections::VecDeque;

use config::shared::{LoadMode, TransferConfig};
use metrics::counter;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::backoff::BackoffPolicy;
use crate::concurrency::shutdown::{ShutdownResult, ShutdownRx, create_shutdown_channel};
use crate::error::{ErrorKind, EtlError, EtlResult};
use crate::etl_error;
use crate::metrics::{
    ETL_TRANSFER_BYTES_UPLOADED_TOTAL, ETL_TRANSFER_FILES_UPLOADED_TOTAL,
    ETL_TRANSFER_ROWS_LOADED_TOTAL, ETL_TRANSFER_ROWS_STAGED_TOTAL, SOURCE_TABLE_LABEL,
};
use crate::sink::base::WarehouseClient;
use crate::sink::loader::BulkLoader;
use crate::sink::serializer::BatchSerializer;
use crate::sink::stage::StageUploader;
use crate::source::base::ReadClient;
use crate::source::reconstruct::RecordReconstructor;
use crate::state::TransferState;
use crate::transfer::TransferOutcome;
use crate::transfer::worker::{StreamSummary, StreamWorker};
use crate::types::{LocalFile, ReadSession, Record, StagedFile, TransferId};

/// Name of the `sequence`-th file staged by a transfer.
pub fn staged_file_name(table: &str, transfer_id: TransferId, sequence: u64) -> String {
    format!("{table}_{transfer_id}_{sequence:05}.parquet")
}

/// What the pipeline reports back once every task has finished.
#[derive(Debug)]
pub(super) struct PipelineReport {
    pub outcome: TransferOutcome,
    pub errors: Vec<EtlError>,
    pub rows_loaded: u64,
    pub files_loaded: u64,
}

/// Outcome bookkeeping of a running pipeline.
#[derive(Debug)]
struct Tracker {
    outcome: TransferOutcome,
    errors: Vec<EtlError>,
    /// Set on any failure or interruption. No new upload or load is started afterwards.
    stopping: bool,
}

impl Tracker {
    fn new() -> Self {
        Self {
            outcome: TransferOutcome::Success,
            errors: Vec::new(),
            stopping: false,
        }
    }

    fn escalate(&mut self, outcome: TransferOutcome) {
        if outcome.severity() > self.outcome.severity() {
            self.outcome = outcome;
        }
    }

    /// Whether `err` is only the echo of our own cancellation.
    fn is_echo(&self, err: &EtlError) -> bool {
        self.stopping && err.kind() == ErrorKind::Cancelled
    }

    /// Records a failed stream. Returns whether the transfer must now be cancelled.
    ///
    /// The files of a transfer with a failed stream hold only part of the table, so none of them
    /// may reach the stage.
    fn stream_failed(&mut self, err: EtlError) -> bool {
        if self.is_echo(&err) {
            return false;
        }

        error!(error = %err, "stream worker failed");
        self.errors.push(err);
        self.escalate(TransferOutcome::PartialFailure);

        self.begin_stop()
    }

    /// Records a failure of the staged load. Returns whether the transfer must now be cancelled.
    fn staging_failed(&mut self, err: EtlError) -> bool {
        if self.is_echo(&err) {
            return false;
        }

        error!(error = %err, "staged load failed");
        self.errors.push(err);
        self.escalate(TransferOutcome::Fatal);

        self.begin_stop()
    }

    /// Records an external cancellation or the deadline. Returns whether this starts the stop.
    fn interrupted(&mut self, outcome: TransferOutcome) -> bool {
        warn!(%outcome, "transfer interrupted");
        self.escalate(outcome);

        self.begin_stop()
    }

    fn begin_stop(&mut self) -> bool {
        let starting = !self.stopping;
        self.stopping = true;

        starting
    }
}

/// Which uploaded files the loads of [`LoadMode::PerFile`] have ingested.
///
/// A load ingests every file confirmed in the stage when it starts, so one load may cover several
/// uploads and the next one none.
#[derive(Debug, Default)]
struct LoadCoverage {
    confirmed: u64,
    requested: u64,
    in_flight: Option<u64>,
    loaded: u64,
}

impl LoadCoverage {
    fn upload_confirmed(&mut self) {
        self.confirmed += 1;
        self.requested += 1;
    }

    /// Takes the next requested load, if any and if no load is running.
    fn next_load(&mut self) -> bool {
        if self.in_flight.is_some() || self.requested == 0 {
            return false;
        }

        self.requested -= 1;
        self.in_flight = Some(self.confirmed);

        true
    }

    fn load_succeeded(&mut self) {
        if let Some(covered) = self.in_flight.take() {
            self.loaded = self.loaded.max(covered);
        }
    }

    fn load_failed(&mut self) {
        self.in_flight = None;
    }

    fn clear_requests(&mut self) {
        self.requested = 0;
    }
}

/// Records buffered for the next file.
#[derive(Debug, Default)]
struct FileBuffer {
    records: Vec<Record>,
    bytes: usize,
}

impl FileBuffer {
    fn push(&mut self, record: Record) {
        self.bytes += record.memory_size();
        self.records.push(record);
    }

    fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn take(&mut self) -> Vec<Record> {
        self.bytes = 0;
        std::mem::take(&mut self.records)
    }
}

/// The running part of a transfer, from stream workers to loads.
///
/// Stream workers fan their records into one bounded channel. The supervisor loop in
/// [`Pipeline::run`] groups records into files, writes at most `writer_concurrency` files at a
/// time on the blocking pool, uploads at most `upload_concurrency` files at a time and, in
/// [`LoadMode::PerFile`], issues one load per uploaded file, one after the other.
///
/// In [`LoadMode::AtEnd`] no file is uploaded before every stream has been read to the end, so the
/// stage never receives part of a transfer whose read failed.
pub(super) struct Pipeline<C, W> {
    config: TransferConfig,
    transfer_id: TransferId,
    client: C,
    policy: BackoffPolicy,
    serializer: BatchSerializer,
    uploader: StageUploader<W>,
    loader: BulkLoader<W>,
    state: TransferState,
    deadline: Instant,
    table_label: String,
}

impl<C, W> Pipeline<C, W>
where
    C: ReadClient + Clone + Send + Sync + 'static,
    W: WarehouseClient + Clone + Send + Sync + 'static,
{
    pub(super) fn new(
        config: TransferConfig,
        transfer_id: TransferId,
        client: C,
        warehouse: W,
        policy: BackoffPolicy,
        state: TransferState,
        deadline: Instant,
    ) -> Self {
        let serializer = BatchSerializer::new(
            config.local_dir.clone(),
            config.batch_size_bytes,
            config.compression,
        );
        let uploader = StageUploader::new(
            warehouse.clone(),
            &config.stage,
            config.load.upload_concurrency,
        );
        let loader = BulkLoader::new(
            warehouse,
            &config.stage,
            config.destination.qualified_table(),
        );
        let table_label = format!(
            "{}.{}.{}",
            config.source.project_id, config.source.dataset_id, config.source.table_id
        );

        Self {
            config,
            transfer_id,
            client,
            policy,
            serializer,
            uploader,
            loader,
            state,
            deadline,
            table_label,
        }
    }

    pub(super) async fn run(
        self,
        session: ReadSession,
        reconstructor: RecordReconstructor,
        mut shutdown_rx: ShutdownRx,
    ) -> PipelineReport {
        let (cancel_tx, cancel_rx) = create_shutdown_channel();
        let (records_tx, mut records_rx) = mpsc::channel(self.config.channel_capacity);

        let mut streams: JoinSet<EtlResult<StreamSummary>> = JoinSet::new();
        for stream in session.streams {
            let worker = StreamWorker::new(
                self.client.clone(),
                stream,
                reconstructor.clone(),
                self.policy.clone(),
                records_tx.clone(),
                self.state.clone(),
                self.table_label.clone(),
                cancel_rx.clone(),
            );
            streams.spawn(worker.run());
        }
        // The channel closes once every worker has dropped its sender.
        drop(records_tx);

        let writer_concurrency = self.config.load.writer_concurrency;
        let upload_concurrency = self.config.load.upload_concurrency;
        let per_file = self.config.load.mode == LoadMode::PerFile;

        let mut tracker = Tracker::new();
        let mut buffer = FileBuffer::default();
        let mut sequence = 0u64;
        let mut records_open = true;
        let mut writes: JoinSet<EtlResult<LocalFile>> = JoinSet::new();
        let mut uploads: JoinSet<EtlResult<StagedFile>> = JoinSet::new();
        let mut loads: JoinSet<EtlResult<u64>> = JoinSet::new();
        let mut pending_uploads: VecDeque<LocalFile> = VecDeque::new();
        let mut coverage = LoadCoverage::default();
        let mut uploaded: Vec<StagedFile> = Vec::new();
        let mut rows_loaded = 0u64;
        let mut files_loaded = 0u64;

        let deadline = tokio::time::sleep_until(self.deadline);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.wait(), if !tracker.stopping => {
                    if tracker.interrupted(TransferOutcome::Cancelled) {
                        cancel_tx.shutdown();
                    }
                }
                _ = &mut deadline, if !tracker.stopping => {
                    if tracker.interrupted(TransferOutcome::TimedOut) {
                        cancel_tx.shutdown();
                    }
                }
                Some(joined) = streams.join_next() => {
                    match flatten(joined, "Stream worker panicked") {
                        Ok(summary) => debug!(rows = summary.rows, "stream worker finished"),
                        Err(err) => {
                            if tracker.stream_failed(err) {
                                cancel_tx.shutdown();
                            }
                        }
                    }
                }
                Some(joined) = writes.join_next() => {
                    match flatten(joined, "File writer panicked") {
                        Ok(file) => {
                            self.state.add_file_written(file.rows);
                            let table = self.table_label.clone();
                            counter!(ETL_TRANSFER_ROWS_STAGED_TOTAL, SOURCE_TABLE_LABEL => table)
                                .increment(file.rows);
                            debug!(
                                file = %file.file_name,
                                rows = file.rows,
                                bytes = file.bytes,
                                "file written"
                            );
                            if !tracker.stopping {
                                pending_uploads.push_back(file);
                            }
                        }
                        Err(err) => {
                            if tracker.staging_failed(err) {
                                cancel_tx.shutdown();
                            }
                        }
                    }
                }
                Some(joined) = uploads.join_next() => {
                    match flatten(joined, "Upload task panicked") {
                        Ok(staged) => {
                            self.state.add_file_uploaded();
                            let table = self.table_label.clone();
                            counter!(
                                ETL_TRANSFER_FILES_UPLOADED_TOTAL,
                                SOURCE_TABLE_LABEL => table.clone()
                            )
                            .increment(1);
                            counter!(ETL_TRANSFER_BYTES_UPLOADED_TOTAL, SOURCE_TABLE_LABEL => table)
                                .increment(staged.bytes);
                            if per_file {
                                coverage.upload_confirmed();
                            }
                            uploaded.push(staged);
                        }
                        Err(err) => {
                            if tracker.staging_failed(err) {
                                cancel_tx.shutdown();
                            }
                        }
                    }
                }
                Some(joined) = loads.join_next() => {
                    match flatten(joined, "Load task panicked") {
                        Ok(rows) => {
                            self.record_load(rows);
                            rows_loaded += rows;
                            coverage.load_succeeded();
                            files_loaded = coverage.loaded;
                        }
                        Err(err) => {
                            coverage.load_failed();
                            if tracker.staging_failed(err) {
                                cancel_tx.shutdown();
                            }
                        }
                    }
                }
                record = records_rx.recv(),
                    if records_open && (tracker.stopping || writes.len() < writer_concurrency) =>
                {
                    match record {
                        Some(record) if !tracker.stopping => {
                            buffer.push(record);
                            if buffer.bytes >= self.config.file_size_bytes {
                                let records = buffer.take();
                                self.spawn_write(&mut writes, records, &mut sequence, &cancel_rx);
                            }
                        }
                        // Records arriving during teardown are dropped.
                        Some(_) => {}
                        None => {
                            records_open = false;
                            if !buffer.is_empty() && !tracker.stopping {
                                let records = buffer.take();
                                self.spawn_write(&mut writes, records, &mut sequence, &cancel_rx);
                            }
                        }
                    }
                }
                else => break,
            }

            let reads_done = !records_open && streams.is_empty();
            if tracker.stopping {
                pending_uploads.clear();
                coverage.clear_requests();
            } else {
                if per_file || reads_done {
                    while uploads.len() < upload_concurrency {
                        let Some(file) = pending_uploads.pop_front() else {
                            break;
                        };
                        self.spawn_upload(&mut uploads, file, &cancel_rx);
                    }
                }

                if coverage.next_load() {
                    debug!(files = coverage.confirmed, "loading staged files");
                    self.spawn_load(&mut loads, &cancel_rx);
                }
            }

            let idle = reads_done
                && writes.is_empty()
                && uploads.is_empty()
                && loads.is_empty()
                && pending_uploads.is_empty()
                && coverage.requested == 0;
            if idle {
                break;
            }
        }

        if !per_file && tracker.outcome == TransferOutcome::Success {
            if uploaded.is_empty() {
                info!("no files were staged, skipping load");
            } else {
                match self.load_at_end(&mut shutdown_rx).await {
                    Ok(rows) => {
                        self.record_load(rows);
                        rows_loaded = rows;
                        files_loaded = uploaded.len() as u64;
                    }
                    Err(err) if err.kind() == ErrorKind::Cancelled => {
                        tracker.interrupted(TransferOutcome::Cancelled);
                    }
                    Err(err) if err.kind() == ErrorKind::Timeout => {
                        tracker.interrupted(TransferOutcome::TimedOut);
                    }
                    Err(err) => {
                        tracker.staging_failed(err);
                    }
                }
            }
        }

        if tracker.outcome != TransferOutcome::Success && !uploaded.is_empty() {
            warn!(
                files = uploaded.len(),
                stage = %self.uploader.stage(),
                "staged files were kept in the stage without a completed load"
            );
        }

        PipelineReport {
            outcome: tracker.outcome,
            errors: tracker.errors,
            rows_loaded,
            files_loaded,
        }
    }

    fn spawn_write(
        &self,
        writes: &mut JoinSet<EtlResult<LocalFile>>,
        records: Vec<Record>,
        sequence: &mut u64,
        cancel_rx: &ShutdownRx,
    ) {
        let file_name = staged_file_name(&self.config.source.table_id, self.transfer_id, *sequence);
        *sequence += 1;

        let serializer = self.serializer.clone();
        let cancel_rx = cancel_rx.clone();
        writes.spawn_blocking(move || serializer.write(records, &file_name, &cancel_rx));
    }

    fn spawn_upload(
        &self,
        uploads: &mut JoinSet<EtlResult<StagedFile>>,
        file: LocalFile,
        cancel_rx: &ShutdownRx,
    ) {
        let uploader = self.uploader.clone();
        let mut cancel_rx = cancel_rx.clone();
        uploads.spawn(async move {
            match cancel_rx.run(uploader.upload(&file)).await {
                ShutdownResult::Ok(result) => result,
                ShutdownResult::Shutdown => Err(etl_error!(
                    ErrorKind::Cancelled,
                    "Upload was cancelled",
                    file.file_name
                )),
            }
        });
    }

    fn spawn_load(&self, loads: &mut JoinSet<EtlResult<u64>>, cancel_rx: &ShutdownRx) {
        let loader = self.loader.clone();
        let mut cancel_rx = cancel_rx.clone();
        loads.spawn(async move {
            match cancel_rx.run(loader.load()).await {
                ShutdownResult::Ok(result) => result,
                ShutdownResult::Shutdown => Err(etl_error!(
                    ErrorKind::Cancelled,
                    "Load was cancelled",
                    loader.table()
                )),
            }
        });
    }

    /// Runs the single load of [`LoadMode::AtEnd`], bounded by the deadline and `shutdown_rx`.
    async fn load_at_end(&self, shutdown_rx: &mut ShutdownRx) -> EtlResult<u64> {
        tokio::select! {
            biased;

            _ = shutdown_rx.wait() => Err(etl_error!(
                ErrorKind::Cancelled,
                "Load was cancelled",
                self.loader.table()
            )),
            _ = tokio::time::sleep_until(self.deadline) => Err(etl_error!(
                ErrorKind::Timeout,
                "Load exceeded the transfer deadline",
                self.loader.table()
            )),
            result = self.loader.load() => result,
        }
    }

    fn record_load(&self, rows: u64) {
        self.state.add_load_job(rows);
        counter!(ETL_TRANSFER_ROWS_LOADED_TOTAL, SOURCE_TABLE_LABEL => self.table_label.clone())
            .increment(rows);
    }
}

fn flatten<T>(
    joined: Result<EtlResult<T>, JoinError>,
    panic_description: &'static str,
) -> EtlResult<T> {
    match joined {
        Ok(result) => result,
        Err(err) if err.is_cancelled() => Err(etl_error!(
            ErrorKind::Cancelled,
            "Pipeline task was aborted"
        )),
        Err(err) => Err(etl_error!(
            ErrorKind::WorkerPanic,
            panic_description,
            err
        )),
    }
}
