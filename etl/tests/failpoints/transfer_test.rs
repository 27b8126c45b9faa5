use std::path::Path;

use etl::concurrency::shutdown::create_shutdown_channel;
use etl::error::ErrorKind;
use etl::failpoints::{LOAD_BEFORE_COPY, SERIALIZE_BEFORE_PROMOTE, UPLOAD_BEFORE_PUT};
use etl::test_utils::arrow::{encode_batches, test_batch};
use etl::test_utils::config::{TEST_STAGE, TEST_TABLE, test_transfer_config};
use etl::test_utils::local_data_dir;
use etl::test_utils::memory_source::MemoryReadClient;
use etl::test_utils::memory_warehouse::MemoryWarehouse;
use etl::transfer::{TransferOutcome, run_transfer};
use fail::FailScenario;
use telemetry::tracing::init_test_tracing;

async fn client_with_rows(start: i64, rows: usize) -> MemoryReadClient {
    let (schema, responses) = encode_batches(&[test_batch(start, rows)]);
    let client = MemoryReadClient::new(schema);
    client.add_stream("s0", responses).await;

    client
}

fn local_files(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_promotion_leaves_no_partial_file() {
    let scenario = FailScenario::setup();
    fail::cfg(SERIALIZE_BEFORE_PROMOTE, "return").unwrap();
    init_test_tracing();

    let dir = local_data_dir();
    let warehouse = MemoryWarehouse::new();
    let (_tx, rx) = create_shutdown_channel();

    let result = run_transfer(
        test_transfer_config(dir.path()),
        client_with_rows(0, 50).await,
        warehouse.clone(),
        rx,
    )
    .await
    .unwrap();

    assert_eq!(result.outcome, TransferOutcome::Fatal);
    assert_eq!(result.error.unwrap().kind(), ErrorKind::SerializeFailed);
    assert_eq!(result.state.files_written, 0);
    assert!(local_files(dir.path()).is_empty());
    assert!(warehouse.statements().await.is_empty());

    scenario.teardown();
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_upload_issues_no_load() {
    let scenario = FailScenario::setup();
    fail::cfg(UPLOAD_BEFORE_PUT, "return").unwrap();
    init_test_tracing();

    let dir = local_data_dir();
    let warehouse = MemoryWarehouse::new();
    let (_tx, rx) = create_shutdown_channel();

    let result = run_transfer(
        test_transfer_config(dir.path()),
        client_with_rows(0, 50).await,
        warehouse.clone(),
        rx,
    )
    .await
    .unwrap();

    assert_eq!(result.outcome, TransferOutcome::Fatal);
    assert_eq!(result.error.unwrap().kind(), ErrorKind::UploadFailed);
    // The local file is kept for a later retry.
    assert_eq!(local_files(dir.path()).len(), 1);
    assert!(warehouse.statements().await.is_empty());

    scenario.teardown();
}

#[tokio::test(flavor = "multi_thread")]
async fn next_transfer_loads_files_left_by_a_failed_load() {
    let scenario = FailScenario::setup();
    fail::cfg(LOAD_BEFORE_COPY, "1*return->off").unwrap();
    init_test_tracing();

    let dir = local_data_dir();
    let warehouse = MemoryWarehouse::new();

    let (_tx, rx) = create_shutdown_channel();
    let failed = run_transfer(
        test_transfer_config(dir.path()),
        client_with_rows(0, 150).await,
        warehouse.clone(),
        rx,
    )
    .await
    .unwrap();

    assert_eq!(failed.outcome, TransferOutcome::Fatal);
    assert_eq!(failed.error.unwrap().kind(), ErrorKind::LoadFailed);
    assert_eq!(warehouse.staged_files(TEST_STAGE).await.len(), 1);
    assert_eq!(warehouse.loaded_rows(TEST_TABLE).await, 0);

    let (_tx, rx) = create_shutdown_channel();
    let retried = run_transfer(
        test_transfer_config(dir.path()),
        client_with_rows(150, 10).await,
        warehouse.clone(),
        rx,
    )
    .await
    .unwrap();

    assert_eq!(retried.outcome, TransferOutcome::Success);
    assert_eq!(retried.rows_transferred, 160);
    assert_eq!(warehouse.staged_files(TEST_STAGE).await.len(), 2);
    assert_eq!(warehouse.loaded_files(TEST_TABLE).await.len(), 2);
    assert_eq!(warehouse.loaded_rows(TEST_TABLE).await, 160);

    scenario.teardown();
}
