use anyhow::bail;
use config::shared::TransferConfig;
use etl::concurrency::shutdown::create_shutdown_channel;
use etl::sink::snowflake::SnowflakeClient;
use etl::source::bigquery::BigQueryReadClient;
use etl::transfer::run_transfer;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};

/// Runs one transfer with the real BigQuery and Snowflake clients.
///
/// SIGINT and SIGTERM cancel the transfer. Any outcome other than success is returned as an
/// error so that the process exits with a failure status.
pub async fn start_transfer_with_config(config: TransferConfig) -> anyhow::Result<()> {
    info!("starting transfer service");
    log_config(&config);

    let read_client = BigQueryReadClient::new(config.source.service_account_key.as_ref()).await?;
    let warehouse = SnowflakeClient::new(&config.destination)?;

    let (shutdown_tx, shutdown_rx) = create_shutdown_channel();
    let shutdown_handle = tokio::spawn(async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(err) => {
                warn!(error = %err, "failed to register sigterm handler");
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("sigint (ctrl+c) received, cancelling transfer");
            }
            _ = sigterm.recv() => {
                info!("sigterm received, cancelling transfer");
            }
        }

        shutdown_tx.shutdown();
    });

    let result = run_transfer(config, read_client, warehouse, shutdown_rx).await;

    shutdown_handle.abort();
    let _ = shutdown_handle.await;

    let result = result?;
    if let Some(err) = result.error {
        bail!(
            "transfer {} finished with outcome {} after loading {} rows: {err}",
            result.transfer_id,
            result.outcome,
            result.rows_transferred
        );
    }

    info!(
        transfer_id = %result.transfer_id,
        rows_transferred = result.rows_transferred,
        files_loaded = result.files_loaded,
        duration_ms = result.duration_ms,
        "transfer completed"
    );

    Ok(())
}

fn log_config(config: &TransferConfig) {
    info!(
        source = %config.source,
        destination = %config.destination.qualified_table(),
        stage = %config.stage,
        max_stream_count = config.max_stream_count,
        batch_size_bytes = config.batch_size_bytes,
        file_size_bytes = config.file_size_bytes,
        compression = ?config.compression,
        load_mode = ?config.load.mode,
        writer_concurrency = config.load.writer_concurrency,
        upload_concurrency = config.load.upload_concurrency,
        timeout_ms = config.timeout_ms,
        local_dir = %config.local_dir.display(),
        "transfer configuration"
    );
}
