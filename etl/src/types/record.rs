use arrow::record_batch::RecordBatch;
use arrow::datatypes::SchemaRef;

/// A decoded record batch.
///
/// Records are moved through the pipeline and consumed exactly once by the file writer. The
/// underlying Arrow buffers are released when the last owner drops them.
#[derive(Debug, Clone)]
pub struct Record {
    batch: RecordBatch,
}

impl Record {
    pub fn new(batch: RecordBatch) -> Self {
        Self { batch }
    }

    pub fn num_rows(&self) -> usize {
        self.batch.num_rows()
    }

    pub fn schema(&self) -> SchemaRef {
        self.batch.schema()
    }

    /// Decoded size of the buffers backing this record.
    pub fn memory_size(&self) -> usize {
        self.batch.get_array_memory_size()
    }

    pub fn batch(&self) -> &RecordBatch {
        &self.batch
    }

    pub fn into_inner(self) -> RecordBatch {
        self.batch
    }
}
