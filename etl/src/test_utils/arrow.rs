//! Arrow fixtures shaped like Storage Read API payloads.

use std::sync::Arc;

use arrow::array::{Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::ipc::writer::StreamWriter;
use arrow::record_batch::RecordBatch;
use bytes::Bytes;

use crate::types::ReadRowsResponse;

/// Schema of every fixture batch: a non-null `id` and a nullable `name`.
pub fn test_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int64, false),
        Field::new("name", DataType::Utf8, true),
    ]))
}

/// Builds a batch of `rows` rows with ids starting at `start`. Every third name is null.
pub fn test_batch(start: i64, rows: usize) -> RecordBatch {
    let ids: Vec<i64> = (0..rows as i64).map(|i| start + i).collect();
    let names: Vec<Option<String>> = ids
        .iter()
        .map(|id| (id % 3 != 0).then(|| format!("name_{id}")))
        .collect();

    RecordBatch::try_new(
        test_schema(),
        vec![
            Arc::new(Int64Array::from(ids)),
            Arc::new(StringArray::from(names)),
        ],
    )
    .expect("fixture batch matches the fixture schema")
}

/// Splits an IPC stream of `batches` into a schema message and body-only batch messages.
///
/// The result mirrors a read session: the schema goes into the session descriptor, every batch
/// into one `ReadRows` response.
pub fn encode_batches(batches: &[RecordBatch]) -> (Bytes, Vec<ReadRowsResponse>) {
    let schema = batches
        .first()
        .map(|batch| batch.schema())
        .unwrap_or_else(test_schema);

    let mut writer = StreamWriter::try_new(Vec::new(), &schema).expect("stream writer");
    let schema_len = writer.get_ref().len();

    let mut boundaries = Vec::with_capacity(batches.len());
    for batch in batches {
        let start = writer.get_ref().len();
        writer.write(batch).expect("write fixture batch");
        boundaries.push((start, writer.get_ref().len(), batch.num_rows() as u64));
    }

    let buffer = Bytes::from(writer.into_inner().expect("stream writer buffer"));
    let responses = boundaries
        .into_iter()
        .map(|(start, end, row_count)| ReadRowsResponse {
            serialized_record_batch: buffer.slice(start..end),
            row_count,
        })
        .collect();

    (buffer.slice(..schema_len), responses)
}

/// Returns a body with a valid message prefix and garbage afterwards.
pub fn corrupt_body(body: &Bytes) -> Bytes {
    let keep = body.len().min(8);
    let mut corrupt = body[..keep].to_vec();
    corrupt.resize(body.len().max(keep + 64), 0xFF);

    Bytes::from(corrupt)
}

/// Total rows across `batches`.
pub fn total_rows(batches: &[RecordBatch]) -> u64 {
    batches.iter().map(|batch| batch.num_rows() as u64).sum()
}
