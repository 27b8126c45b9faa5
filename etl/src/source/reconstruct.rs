//! Turning body-only Arrow IPC messages into record batches.
//!
//! The Storage Read API sends the schema once per session and every batch without it. A batch is
//! decoded by appending its message to the schema message and reading the result as a regular
//! IPC stream.

use std::io::Cursor;

use arrow::datatypes::SchemaRef;
use arrow::ipc::reader::StreamReader;
use bytes::Bytes;

use crate::error::{ErrorKind, EtlResult};
use crate::types::{RawBatch, Record};
use crate::{bail, etl_error};

/// Decodes a serialized IPC schema message.
pub fn decode_schema(schema_descriptor: &[u8]) -> EtlResult<SchemaRef> {
    let reader = StreamReader::try_new(Cursor::new(schema_descriptor), None)?;

    Ok(reader.schema())
}

/// Decoder for the raw batches of one stream.
///
/// Each stream owns its reconstructor; clones share nothing but the immutable schema.
#[derive(Debug, Clone)]
pub struct RecordReconstructor {
    schema_descriptor: Bytes,
    schema: SchemaRef,
}

impl RecordReconstructor {
    pub fn new(schema_descriptor: Bytes) -> EtlResult<Self> {
        let schema = decode_schema(&schema_descriptor)?;

        Ok(Self {
            schema_descriptor,
            schema,
        })
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    /// Decodes the first record of `batch`.
    ///
    /// Returns `Ok(None)` when the batch holds no rows, which callers should treat as a reason to
    /// read again rather than as the end of the stream. Any decoding problem is reported as
    /// [`ErrorKind::DecodeFailed`], since the stream offset has already moved past the batch. This
    /// includes a decoded row count that differs from the count reported with the batch, in
    /// either direction.
    pub fn reconstruct(&self, batch: &RawBatch) -> EtlResult<Option<Record>> {
        // Every call decodes into a freshly allocated buffer, so returned records never alias
        // memory that a later call could reuse.
        let mut message = Vec::with_capacity(self.schema_descriptor.len() + batch.bytes.len());
        message.extend_from_slice(&self.schema_descriptor);
        message.extend_from_slice(&batch.bytes);

        let mut reader = StreamReader::try_new(Cursor::new(message), None).map_err(|err| {
            etl_error!(
                ErrorKind::DecodeFailed,
                "Failed to read schema of raw batch",
                format!("batch at offset {}", batch.offset),
                source: err
            )
        })?;

        let decoded = match reader.next() {
            None => None,
            Some(Ok(decoded)) => Some(decoded),
            Some(Err(err)) => bail!(
                ErrorKind::DecodeFailed,
                "Failed to decode raw batch",
                format!("batch at offset {}: {err}", batch.offset),
                source: err
            ),
        };

        let decoded_rows = decoded.as_ref().map_or(0, |decoded| decoded.num_rows() as u64);
        if decoded_rows != batch.row_count {
            bail!(
                ErrorKind::DecodeFailed,
                "Decoded row count differs from the reported row count",
                format!(
                    "batch at offset {}: decoded {decoded_rows} rows, reported {}",
                    batch.offset, batch.row_count
                )
            );
        }

        let Some(decoded) = decoded.filter(|decoded| decoded.num_rows() > 0) else {
            return Ok(None);
        };

        if decoded.schema() != self.schema {
            bail!(
                ErrorKind::DecodeFailed,
                "Decoded batch schema differs from session schema",
                format!("batch at offset {}", batch.offset)
            );
        }

        Ok(Some(Record::new(decoded)))
    }
}
