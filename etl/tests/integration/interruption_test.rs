use etl::concurrency::shutdown::create_shutdown_channel;
use etl::error::ErrorKind;
use etl::test_utils::arrow::{encode_batches, test_batch};
use etl::test_utils::config::{TEST_TABLE, test_transfer_config};
use etl::test_utils::local_data_dir;
use etl::test_utils::memory_source::MemoryReadClient;
use etl::test_utils::memory_warehouse::MemoryWarehouse;
use etl::transfer::{TransferOutcome, run_transfer};
use telemetry::tracing::init_test_tracing;

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_cancels_an_in_flight_transfer() {
    init_test_tracing();
    let dir = local_data_dir();
    let (schema, responses) = encode_batches(&[test_batch(0, 100)]);
    let client = MemoryReadClient::new(schema);
    client.add_stream("s0", responses).await;
    client.hang_stream("s0").await;
    let warehouse = MemoryWarehouse::new();
    let (tx, rx) = create_shutdown_channel();

    let config = test_transfer_config(dir.path());
    let transfer = tokio::spawn(run_transfer(config, client.clone(), warehouse.clone(), rx));

    // The stream has delivered its rows and now waits forever.
    client.wait_until_hanging().await;
    tx.shutdown();

    let result = transfer.await.unwrap().unwrap();

    assert_eq!(result.outcome, TransferOutcome::Cancelled);
    assert_eq!(result.error.unwrap().kind(), ErrorKind::Cancelled);
    assert_eq!(result.rows_transferred, 0);
    assert_eq!(result.state.rows_read, 100);
    assert_eq!(result.state.files_written, 0);
    assert!(warehouse.statements().await.is_empty());
    assert_eq!(warehouse.loaded_rows(TEST_TABLE).await, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn deadline_times_the_transfer_out() {
    init_test_tracing();
    let dir = local_data_dir();
    let (schema, responses) = encode_batches(&[test_batch(0, 10)]);
    let client = MemoryReadClient::new(schema);
    client.add_stream("s0", responses).await;
    client.hang_stream("s0").await;
    let warehouse = MemoryWarehouse::new();
    let mut config = test_transfer_config(dir.path());
    config.timeout_ms = 200;
    let (_tx, rx) = create_shutdown_channel();

    let result = run_transfer(config, client, warehouse.clone(), rx)
        .await
        .unwrap();

    assert_eq!(result.outcome, TransferOutcome::TimedOut);
    assert_eq!(result.error.unwrap().kind(), ErrorKind::Timeout);
    assert!(warehouse.statements_with_prefix("COPY").await.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn cancellation_before_the_session_is_an_error() {
    init_test_tracing();
    let dir = local_data_dir();
    let (schema, responses) = encode_batches(&[test_batch(0, 10)]);
    let client = MemoryReadClient::new(schema);
    client.add_stream("s0", responses).await;
    client
        .fail_session_creation(vec![ErrorKind::SourceUnavailable; 3])
        .await;
    let (tx, rx) = create_shutdown_channel();
    tx.shutdown();

    let err = run_transfer(
        test_transfer_config(dir.path()),
        client,
        MemoryWarehouse::new(),
        rx,
    )
    .await
    .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Cancelled);
}
