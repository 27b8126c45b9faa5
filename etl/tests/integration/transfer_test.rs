use std::collections::BTreeSet;
use std::fs::File;
use std::path::Path;

use arrow::array::Int64Array;
use config::shared::{EmptySessionPolicy, LoadMode};
use etl::concurrency::shutdown::create_shutdown_channel;
use etl::error::ErrorKind;
use etl::sink::serializer::PARTIAL_SUFFIX;
use etl::test_utils::arrow::{corrupt_body, encode_batches, test_batch, total_rows};
use etl::test_utils::config::{TEST_STAGE, TEST_TABLE, test_transfer_config};
use etl::test_utils::local_data_dir;
use etl::test_utils::memory_source::{MemoryReadClient, memory_client_with_streams};
use etl::test_utils::memory_warehouse::MemoryWarehouse;
use etl::transfer::{TransferOutcome, run_transfer};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use telemetry::tracing::init_test_tracing;

/// Ids of every row written to the Parquet files of `dir`, in file order.
fn written_ids(dir: &Path) -> Vec<i64> {
    let mut paths: Vec<_> = std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "parquet"))
        .collect();
    paths.sort();

    let mut ids = Vec::new();
    for path in paths {
        let reader = ParquetRecordBatchReaderBuilder::try_new(File::open(path).unwrap())
            .unwrap()
            .build()
            .unwrap();
        for batch in reader {
            let batch = batch.unwrap();
            let column = batch
                .column_by_name("id")
                .unwrap()
                .as_any()
                .downcast_ref::<Int64Array>()
                .unwrap();
            ids.extend(column.values().iter().copied());
        }
    }

    ids
}

fn partial_files(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter(|entry| {
                    entry
                        .as_ref()
                        .unwrap()
                        .file_name()
                        .to_string_lossy()
                        .ends_with(PARTIAL_SUFFIX)
                })
                .count()
        })
        .unwrap_or(0)
}

#[tokio::test(flavor = "multi_thread")]
async fn single_stream_with_an_empty_batch_loads_every_row() {
    init_test_tracing();
    let dir = local_data_dir();
    let (schema, responses) =
        encode_batches(&[test_batch(0, 100), test_batch(100, 0), test_batch(100, 50)]);
    let client = MemoryReadClient::new(schema);
    client.add_stream("s0", responses).await;
    let warehouse = MemoryWarehouse::new();
    let (_tx, rx) = create_shutdown_channel();

    let result = run_transfer(
        test_transfer_config(dir.path()),
        client.clone(),
        warehouse.clone(),
        rx,
    )
    .await
    .unwrap();

    assert_eq!(result.outcome, TransferOutcome::Success);
    assert_eq!(result.rows_transferred, 150);
    assert_eq!(result.files_loaded, 1);
    assert_eq!(result.state.rows_read, 150);
    assert_eq!(result.state.rows_staged, 150);
    assert_eq!(result.state.files_uploaded, 1);

    let staged = warehouse.staged_files(TEST_STAGE).await;
    assert_eq!(staged.len(), 1);
    assert_eq!(warehouse.loaded_files(TEST_TABLE).await, staged);
    assert_eq!(warehouse.loaded_rows(TEST_TABLE).await, 150);
    assert_eq!(warehouse.statements_with_prefix("COPY").await.len(), 1);

    // The empty batch neither ended the stream nor forced a reopen.
    assert_eq!(client.read_offsets("s0").await, vec![0]);
    assert_eq!(written_ids(dir.path()), (0..150).collect::<Vec<_>>());
    assert_eq!(partial_files(dir.path()), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn session_without_streams_fails_before_writing_files() {
    init_test_tracing();
    let dir = local_data_dir();
    let (schema, _) = encode_batches(&[test_batch(0, 1)]);
    let client = MemoryReadClient::new(schema);
    let warehouse = MemoryWarehouse::new();
    let (_tx, rx) = create_shutdown_channel();

    let err = run_transfer(
        test_transfer_config(dir.path()),
        client,
        warehouse.clone(),
        rx,
    )
    .await
    .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::SessionFailed);
    assert!(warehouse.statements().await.is_empty());
    assert!(written_ids(dir.path()).is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn session_without_streams_can_be_treated_as_empty() {
    init_test_tracing();
    let dir = local_data_dir();
    let (schema, _) = encode_batches(&[test_batch(0, 1)]);
    let client = MemoryReadClient::new(schema);
    let warehouse = MemoryWarehouse::new();
    let mut config = test_transfer_config(dir.path());
    config.empty_session_policy = EmptySessionPolicy::TreatAsEmpty;
    let (_tx, rx) = create_shutdown_channel();

    let result = run_transfer(config, client, warehouse.clone(), rx)
        .await
        .unwrap();

    assert_eq!(result.outcome, TransferOutcome::Success);
    assert_eq!(result.rows_transferred, 0);
    assert_eq!(result.files_loaded, 0);
    assert!(result.error.is_none());
    assert!(warehouse.statements().await.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn malformed_batch_fails_the_stream_without_retry() {
    init_test_tracing();
    let dir = local_data_dir();
    let (schema, mut responses) = encode_batches(&[test_batch(0, 100), test_batch(100, 50)]);
    responses[1].serialized_record_batch = corrupt_body(&responses[1].serialized_record_batch);
    let client = MemoryReadClient::new(schema);
    client.add_stream("s0", responses).await;
    let warehouse = MemoryWarehouse::new();
    let (_tx, rx) = create_shutdown_channel();

    let result = run_transfer(
        test_transfer_config(dir.path()),
        client.clone(),
        warehouse.clone(),
        rx,
    )
    .await
    .unwrap();

    assert_eq!(result.outcome, TransferOutcome::PartialFailure);
    assert_eq!(result.error.unwrap().kind(), ErrorKind::DecodeFailed);
    assert_eq!(result.rows_transferred, 0);
    assert_eq!(client.read_offsets("s0").await, vec![0]);
    assert!(warehouse.statements_with_prefix("COPY").await.is_empty());
    assert_eq!(warehouse.loaded_rows(TEST_TABLE).await, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_stream_stages_nothing_so_a_rerun_loads_each_row_once() {
    init_test_tracing();
    let dir = local_data_dir();
    let (schema, good) =
        encode_batches(&[test_batch(0, 40), test_batch(40, 30), test_batch(70, 30)]);
    let (_, mut broken) = encode_batches(&[test_batch(100, 25), test_batch(125, 25)]);
    broken[1].serialized_record_batch = corrupt_body(&broken[1].serialized_record_batch);
    let failing = memory_client_with_streams(schema.clone(), vec![good.clone(), broken]).await;
    let warehouse = MemoryWarehouse::new();
    let mut config = test_transfer_config(dir.path());
    // Every record rolls its own file, so files are written while the streams are still read.
    config.file_size_bytes = 1;
    let (_tx, rx) = create_shutdown_channel();

    let result = run_transfer(config, failing, warehouse.clone(), rx)
        .await
        .unwrap();

    assert_eq!(result.outcome, TransferOutcome::PartialFailure);
    assert_eq!(result.error.unwrap().kind(), ErrorKind::DecodeFailed);
    assert_eq!(result.state.files_uploaded, 0);
    assert!(warehouse.statements_with_prefix("PUT").await.is_empty());
    assert!(warehouse.staged_files(TEST_STAGE).await.is_empty());

    let (_, fixed) = encode_batches(&[test_batch(100, 25), test_batch(125, 25)]);
    let healthy = memory_client_with_streams(schema, vec![good, fixed]).await;
    let rerun_dir = local_data_dir();
    let (_tx, rx) = create_shutdown_channel();

    let rerun = run_transfer(
        test_transfer_config(rerun_dir.path()),
        healthy,
        warehouse.clone(),
        rx,
    )
    .await
    .unwrap();

    assert_eq!(rerun.outcome, TransferOutcome::Success);
    assert_eq!(rerun.rows_transferred, 150);
    assert_eq!(warehouse.loaded_rows(TEST_TABLE).await, 150);
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_load_keeps_staged_files() {
    init_test_tracing();
    let dir = local_data_dir();
    let (schema, responses) = encode_batches(&[test_batch(0, 100), test_batch(100, 50)]);
    let client = MemoryReadClient::new(schema);
    client.add_stream("s0", responses).await;
    let warehouse = MemoryWarehouse::new();
    warehouse.fail_next("COPY", ErrorKind::LoadFailed).await;
    let mut config = test_transfer_config(dir.path());
    // Every record rolls its own file.
    config.file_size_bytes = 1;
    let (_tx, rx) = create_shutdown_channel();

    let result = run_transfer(config, client, warehouse.clone(), rx)
        .await
        .unwrap();

    assert_eq!(result.outcome, TransferOutcome::Fatal);
    assert_eq!(result.error.unwrap().kind(), ErrorKind::LoadFailed);
    assert_eq!(result.rows_transferred, 0);
    assert_eq!(result.state.files_uploaded, 2);

    let staged = warehouse.staged_files(TEST_STAGE).await;
    assert_eq!(staged.len(), 2);
    let listed = warehouse.statements_with_prefix("LIST").await;
    assert_eq!(listed.len(), 2);
    assert_eq!(warehouse.statements_with_prefix("COPY").await.len(), 1);
    assert_eq!(warehouse.loaded_rows(TEST_TABLE).await, 0);
    assert!(warehouse.statements_with_prefix("REMOVE").await.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn interrupted_stream_resumes_without_gaps_or_duplicates() {
    init_test_tracing();
    let dir = local_data_dir();
    let batches = [test_batch(0, 100), test_batch(100, 50), test_batch(150, 25)];
    let (schema, responses) = encode_batches(&batches);
    let client = MemoryReadClient::new(schema);
    client.add_stream("s0", responses).await;
    client
        .fail_stream_after("s0", 1, ErrorKind::SourceUnavailable)
        .await;
    let warehouse = MemoryWarehouse::new();
    let (_tx, rx) = create_shutdown_channel();

    let result = run_transfer(
        test_transfer_config(dir.path()),
        client.clone(),
        warehouse.clone(),
        rx,
    )
    .await
    .unwrap();

    assert_eq!(result.outcome, TransferOutcome::Success);
    assert_eq!(client.read_offsets("s0").await, vec![0, 100]);
    assert_eq!(result.rows_transferred, total_rows(&batches));
    assert_eq!(written_ids(dir.path()), (0..175).collect::<Vec<_>>());
}

#[tokio::test(flavor = "multi_thread")]
async fn exhausted_retries_fail_the_stream() {
    init_test_tracing();
    let dir = local_data_dir();
    let (schema, responses) = encode_batches(&[test_batch(0, 10)]);
    let client = MemoryReadClient::new(schema);
    client.add_stream("s0", responses).await;
    for _ in 0..4 {
        client
            .fail_stream_open("s0", ErrorKind::SourceDeadlineExceeded)
            .await;
    }
    let warehouse = MemoryWarehouse::new();
    let (_tx, rx) = create_shutdown_channel();

    let result = run_transfer(
        test_transfer_config(dir.path()),
        client.clone(),
        warehouse.clone(),
        rx,
    )
    .await
    .unwrap();

    assert_eq!(result.outcome, TransferOutcome::PartialFailure);
    assert_eq!(
        result.error.unwrap().kind(),
        ErrorKind::SourceDeadlineExceeded
    );
    assert!(warehouse.statements_with_prefix("COPY").await.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn streams_are_read_concurrently_into_one_load() {
    init_test_tracing();
    let dir = local_data_dir();
    let (schema, first) = encode_batches(&[test_batch(0, 40), test_batch(40, 10)]);
    let (_, second) = encode_batches(&[test_batch(50, 30)]);
    let (_, third) = encode_batches(&[test_batch(80, 5), test_batch(85, 0), test_batch(85, 15)]);
    let client = memory_client_with_streams(schema, vec![first, second, third]).await;
    let warehouse = MemoryWarehouse::new();
    let (_tx, rx) = create_shutdown_channel();

    let result = run_transfer(
        test_transfer_config(dir.path()),
        client.clone(),
        warehouse.clone(),
        rx,
    )
    .await
    .unwrap();

    assert_eq!(result.outcome, TransferOutcome::Success);
    assert_eq!(result.rows_transferred, 100);
    assert_eq!(warehouse.loaded_rows(TEST_TABLE).await, 100);
    assert_eq!(warehouse.statements_with_prefix("COPY").await.len(), 1);
    for stream in ["s0", "s1", "s2"] {
        assert_eq!(client.read_offsets(stream).await, vec![0]);
    }

    // No ordering across streams, but every row exactly once.
    let ids: BTreeSet<i64> = written_ids(dir.path()).into_iter().collect();
    assert_eq!(ids, (0..100).collect::<BTreeSet<_>>());
}

#[tokio::test(flavor = "multi_thread")]
async fn per_file_mode_loads_after_every_upload() {
    init_test_tracing();
    let dir = local_data_dir();
    let (schema, responses) =
        encode_batches(&[test_batch(0, 20), test_batch(20, 30), test_batch(50, 10)]);
    let client = MemoryReadClient::new(schema);
    client.add_stream("s0", responses).await;
    let warehouse = MemoryWarehouse::new();
    let mut config = test_transfer_config(dir.path());
    config.file_size_bytes = 1;
    config.load.mode = LoadMode::PerFile;
    config.load.writer_concurrency = 1;
    config.load.upload_concurrency = 1;
    let (_tx, rx) = create_shutdown_channel();

    let result = run_transfer(config, client, warehouse.clone(), rx)
        .await
        .unwrap();

    assert_eq!(result.outcome, TransferOutcome::Success);
    assert_eq!(result.rows_transferred, 60);
    assert_eq!(result.files_loaded, 3);
    assert_eq!(result.state.load_jobs, 3);
    assert_eq!(warehouse.statements_with_prefix("COPY").await.len(), 3);
    assert_eq!(warehouse.loaded_files(TEST_TABLE).await.len(), 3);
    assert_eq!(warehouse.loaded_rows(TEST_TABLE).await, 60);
}

#[tokio::test(flavor = "multi_thread")]
async fn rolled_files_are_named_in_sequence() {
    init_test_tracing();
    let dir = local_data_dir();
    let (schema, responses) =
        encode_batches(&[test_batch(0, 10), test_batch(10, 10), test_batch(20, 10)]);
    let client = MemoryReadClient::new(schema);
    client.add_stream("s0", responses).await;
    let warehouse = MemoryWarehouse::new();
    let mut config = test_transfer_config(dir.path());
    config.file_size_bytes = 1;
    let (_tx, rx) = create_shutdown_channel();

    let result = run_transfer(config, client, warehouse.clone(), rx)
        .await
        .unwrap();

    let staged = warehouse.staged_files(TEST_STAGE).await;
    let transfer_id = result.transfer_id;
    assert_eq!(
        staged,
        (0..3)
            .map(|sequence| etl::transfer::staged_file_name("events", transfer_id, sequence))
            .collect::<Vec<_>>()
    );
    assert_eq!(result.files_loaded, 3);
    assert_eq!(result.rows_transferred, 30);
}

#[tokio::test(flavor = "multi_thread")]
async fn rejected_upload_is_fatal_and_skips_the_load() {
    init_test_tracing();
    let dir = local_data_dir();
    let (schema, responses) = encode_batches(&[test_batch(0, 10)]);
    let client = MemoryReadClient::new(schema);
    client.add_stream("s0", responses).await;
    let warehouse = MemoryWarehouse::new();
    warehouse.fail_next("PUT", ErrorKind::UploadFailed).await;
    let (_tx, rx) = create_shutdown_channel();

    let result = run_transfer(
        test_transfer_config(dir.path()),
        client,
        warehouse.clone(),
        rx,
    )
    .await
    .unwrap();

    assert_eq!(result.outcome, TransferOutcome::Fatal);
    assert_eq!(result.error.unwrap().kind(), ErrorKind::UploadFailed);
    assert!(warehouse.statements_with_prefix("COPY").await.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn read_options_are_forwarded_to_the_session() {
    init_test_tracing();
    let dir = local_data_dir();
    let (schema, responses) = encode_batches(&[test_batch(0, 5)]);
    let client = MemoryReadClient::new(schema);
    client.add_stream("s0", responses).await;
    let mut config = test_transfer_config(dir.path());
    config.source.selected_fields = vec!["id".to_owned(), "name".to_owned()];
    config.source.row_restriction = Some("id >= 0".to_owned());
    let (_tx, rx) = create_shutdown_channel();

    run_transfer(config, client.clone(), MemoryWarehouse::new(), rx)
        .await
        .unwrap();

    let options = client.last_read_options().await.unwrap();
    assert_eq!(options.selected_fields, vec!["id", "name"]);
    assert_eq!(options.row_restriction.as_deref(), Some("id >= 0"));
}
