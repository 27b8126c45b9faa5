//! End to end transfer of one table.
//!
//! [`run_transfer`] creates a read session, reads every stream concurrently, stages the records
//! as Parquet files and loads the stage into the destination table. The whole run is bounded by
//! the configured deadline and can be cancelled through a [`ShutdownRx`].

use std::fmt;
use std::time::Instant;

use config::shared::TransferConfig;
use metrics::{counter, histogram};
use tracing::{error, info};

use crate::backoff::BackoffPolicy;
use crate::concurrency::shutdown::ShutdownRx;
use crate::error::{ErrorKind, EtlError, EtlResult};
use crate::etl_error;
use crate::metrics::{
    ETL_TRANSFER_DURATION_SECONDS, ETL_TRANSFER_FAILURES_TOTAL, SOURCE_TABLE_LABEL, STAGE_LABEL,
};
use crate::sink::base::WarehouseClient;
use crate::source::base::ReadClient;
use crate::source::reconstruct::RecordReconstructor;
use crate::source::session::ReadSessionManager;
use crate::state::{TransferState, TransferStateSnapshot};
use crate::transfer::pipeline::Pipeline;
use crate::types::{ReadOptions, SourceTableRef, TransferId};

mod pipeline;
mod worker;

pub use pipeline::staged_file_name;
pub use worker::{StreamSummary, StreamWorker};

/// Terminal outcome of a transfer that got past session creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    Success,
    /// One or more streams failed after the session was created. Nothing more was loaded.
    PartialFailure,
    /// Writing, uploading or loading a file failed.
    Fatal,
    Cancelled,
    TimedOut,
}

impl TransferOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TransferOutcome::Success)
    }

    /// Rank used to keep the most severe outcome when several failures happen.
    fn severity(&self) -> u8 {
        match self {
            TransferOutcome::Success => 0,
            TransferOutcome::PartialFailure => 1,
            TransferOutcome::Fatal => 2,
            TransferOutcome::Cancelled | TransferOutcome::TimedOut => 3,
        }
    }
}

impl fmt::Display for TransferOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let outcome = match self {
            TransferOutcome::Success => "success",
            TransferOutcome::PartialFailure => "partial_failure",
            TransferOutcome::Fatal => "fatal",
            TransferOutcome::Cancelled => "cancelled",
            TransferOutcome::TimedOut => "timed_out",
        };

        f.write_str(outcome)
    }
}

/// Summary of a transfer.
#[derive(Debug, Clone)]
pub struct TransferResult {
    pub transfer_id: TransferId,
    /// Rows reported as loaded by the destination.
    pub rows_transferred: u64,
    /// Staged files covered by a successful load.
    pub files_loaded: u64,
    pub duration_ms: u64,
    pub outcome: TransferOutcome,
    /// Counters accumulated up to the end of the run, including after a failure.
    pub state: TransferStateSnapshot,
    /// Terminal error for every outcome but [`TransferOutcome::Success`].
    pub error: Option<EtlError>,
}

/// Transfers the configured BigQuery table into Snowflake.
///
/// Returns `Err` when the transfer never started: invalid configuration, or a read session that
/// could not be created, including one without streams under
/// [`config::shared::EmptySessionPolicy::Fail`]. Every later failure is reported through
/// [`TransferResult::outcome`] and [`TransferResult::error`] together with the counters reached so
/// far. Staged files are never deleted, whatever the outcome.
pub async fn run_transfer<C, W>(
    config: TransferConfig,
    read_client: C,
    warehouse: W,
    shutdown_rx: ShutdownRx,
) -> EtlResult<TransferResult>
where
    C: ReadClient + Clone + Send + Sync + 'static,
    W: WarehouseClient + Clone + Send + Sync + 'static,
{
    config.validate()?;

    let started = Instant::now();
    let deadline = tokio::time::Instant::now() + config.timeout();
    let transfer_id = TransferId::new_v4();
    let table = SourceTableRef::from(&config.source);
    let options = ReadOptions::from(&config.source);
    let policy = BackoffPolicy::new(config.backoff.clone());

    info!(
        %transfer_id,
        table = %table,
        destination = %config.destination.qualified_table(),
        stage = %config.stage,
        max_stream_count = config.max_stream_count,
        "starting transfer"
    );

    let manager =
        ReadSessionManager::new(read_client.clone(), policy.clone(), config.empty_session_policy);
    let mut session_shutdown_rx = shutdown_rx.clone();
    let session = match tokio::time::timeout_at(
        deadline,
        manager.create_session(
            &table,
            config.max_stream_count,
            &options,
            &mut session_shutdown_rx,
        ),
    )
    .await
    {
        Ok(Ok(session)) => session,
        Ok(Err(err)) => {
            record_failure(&table, &err);
            return Err(err);
        }
        Err(_) => {
            let err = etl_error!(
                ErrorKind::Timeout,
                "Read session creation exceeded the transfer deadline",
                format!("{} ms", config.timeout_ms)
            );
            record_failure(&table, &err);
            return Err(err);
        }
    };

    let state = TransferState::new();
    if session.streams.is_empty() {
        info!(%transfer_id, table = %table, "read session has no streams, nothing to transfer");
        return Ok(finish(
            &table,
            transfer_id,
            started,
            TransferOutcome::Success,
            &state,
            0,
            0,
            Vec::new(),
        ));
    }

    let reconstructor = RecordReconstructor::new(session.schema_descriptor.clone())?;
    let pipeline = Pipeline::new(
        config,
        transfer_id,
        read_client,
        warehouse,
        policy,
        state.clone(),
        deadline,
    );
    let report = pipeline.run(session, reconstructor, shutdown_rx).await;

    Ok(finish(
        &table,
        transfer_id,
        started,
        report.outcome,
        &state,
        report.rows_loaded,
        report.files_loaded,
        report.errors,
    ))
}

#[allow(clippy::too_many_arguments)]
fn finish(
    table: &SourceTableRef,
    transfer_id: TransferId,
    started: Instant,
    outcome: TransferOutcome,
    state: &TransferState,
    rows_loaded: u64,
    files_loaded: u64,
    mut errors: Vec<EtlError>,
) -> TransferResult {
    let duration = started.elapsed();
    histogram!(ETL_TRANSFER_DURATION_SECONDS, SOURCE_TABLE_LABEL => table.to_string())
        .record(duration.as_secs_f64());

    match outcome {
        TransferOutcome::Cancelled => {
            errors.insert(0, etl_error!(ErrorKind::Cancelled, "Transfer was cancelled"));
        }
        TransferOutcome::TimedOut => {
            errors.insert(
                0,
                etl_error!(ErrorKind::Timeout, "Transfer exceeded its deadline"),
            );
        }
        _ => {}
    }

    let error = match errors.len() {
        0 => None,
        1 => errors.pop(),
        _ => Some(EtlError::from(errors)),
    };
    if let Some(err) = &error {
        record_failure(table, err);
    }

    let result = TransferResult {
        transfer_id,
        rows_transferred: rows_loaded,
        files_loaded,
        duration_ms: duration.as_millis() as u64,
        outcome,
        state: state.snapshot(),
        error,
    };

    info!(
        %transfer_id,
        table = %table,
        outcome = %result.outcome,
        rows_transferred = result.rows_transferred,
        files_loaded = result.files_loaded,
        rows_read = result.state.rows_read,
        files_uploaded = result.state.files_uploaded,
        duration_ms = result.duration_ms,
        "transfer finished"
    );

    result
}

fn record_failure(table: &SourceTableRef, err: &EtlError) {
    error!(table = %table, error = %err, "transfer failed");
    counter!(
        ETL_TRANSFER_FAILURES_TOTAL,
        SOURCE_TABLE_LABEL => table.to_string(),
        STAGE_LABEL => err.stage().to_string()
    )
    .increment(1);
}
