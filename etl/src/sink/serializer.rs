use std::fs::{self, File};
use std::path::{Path, PathBuf};

use config::shared::Compression;
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression as ParquetCompression, GzipLevel, ZstdLevel};
use parquet::file::properties::{WriterProperties, WriterVersion};
use tracing::{debug, warn};

use crate::concurrency::shutdown::ShutdownRx;
use crate::error::{ErrorKind, EtlResult};
use crate::types::{LocalFile, Record};
use crate::{bail, etl_error};

/// Suffix of files that are still being written.
pub const PARTIAL_SUFFIX: &str = ".partial";

/// Removes a partially written file unless it was promoted.
struct PartialFile {
    path: PathBuf,
    promoted: bool,
}

impl PartialFile {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            promoted: false,
        }
    }

    fn promote(mut self, destination: &Path) -> EtlResult<()> {
        fs::rename(&self.path, destination).map_err(|err| {
            etl_error!(
                ErrorKind::SerializeFailed,
                "Failed to promote partial file",
                self.path.display(),
                source: err
            )
        })?;
        self.promoted = true;

        Ok(())
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if self.promoted {
            return;
        }

        if let Err(err) = fs::remove_file(&self.path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %err, "failed to remove partial file");
            }
        }
    }
}

/// Writes records to Parquet files in the local data directory.
///
/// Files are written under `<name>.partial` and renamed to `<name>` once fully flushed and
/// synced, so a file under its final name is always complete. Any failure, including
/// cancellation, removes the partial file.
#[derive(Debug, Clone)]
pub struct BatchSerializer {
    local_dir: PathBuf,
    batch_size_bytes: usize,
    compression: Compression,
}

impl BatchSerializer {
    pub fn new(local_dir: PathBuf, batch_size_bytes: usize, compression: Compression) -> Self {
        Self {
            local_dir,
            batch_size_bytes,
            compression,
        }
    }

    pub fn local_dir(&self) -> &Path {
        &self.local_dir
    }

    /// Writes `records` into the file `file_name`, consuming them.
    ///
    /// All records must share the schema of the first one. A row group is flushed whenever the
    /// buffered data reaches the configured batch size. Blocking; run it off the async runtime.
    pub fn write(
        &self,
        records: Vec<Record>,
        file_name: &str,
        shutdown_rx: &ShutdownRx,
    ) -> EtlResult<LocalFile> {
        let Some(schema) = records.first().map(Record::schema) else {
            bail!(
                ErrorKind::InvalidState,
                "No records to serialize",
                file_name
            );
        };

        fs::create_dir_all(&self.local_dir).map_err(|err| {
            etl_error!(
                ErrorKind::SerializeFailed,
                "Failed to create local data directory",
                self.local_dir.display(),
                source: err
            )
        })?;

        let final_path = self.local_dir.join(file_name);
        let partial = PartialFile::new(
            self.local_dir
                .join(format!("{file_name}{PARTIAL_SUFFIX}")),
        );

        let file = File::create(&partial.path).map_err(|err| {
            etl_error!(
                ErrorKind::SerializeFailed,
                "Failed to create partial file",
                partial.path.display(),
                source: err
            )
        })?;

        let mut writer =
            ArrowWriter::try_new(file, schema.clone(), Some(self.writer_properties()))?;
        let mut rows = 0u64;
        for record in records {
            if shutdown_rx.is_shutdown() {
                bail!(
                    ErrorKind::Cancelled,
                    "File write was cancelled",
                    file_name
                );
            }

            if record.schema() != schema {
                bail!(
                    ErrorKind::SerializeFailed,
                    "Record schema differs from the file schema",
                    file_name
                );
            }

            writer.write(record.batch())?;
            rows += record.num_rows() as u64;

            if writer.in_progress_size() >= self.batch_size_bytes {
                debug!(
                    file = file_name,
                    buffered_bytes = writer.in_progress_size(),
                    "flushing row group"
                );
                writer.flush()?;
            }
        }

        let file = writer.into_inner()?;
        file.sync_all().map_err(|err| {
            etl_error!(
                ErrorKind::SerializeFailed,
                "Failed to sync partial file",
                partial.path.display(),
                source: err
            )
        })?;
        drop(file);

        #[cfg(feature = "failpoints")]
        crate::failpoints::etl_fail_point(
            crate::failpoints::SERIALIZE_BEFORE_PROMOTE,
            ErrorKind::SerializeFailed,
        )?;

        partial.promote(&final_path)?;

        let bytes = fs::metadata(&final_path)
            .map_err(|err| {
                etl_error!(
                    ErrorKind::SerializeFailed,
                    "Failed to stat written file",
                    final_path.display(),
                    source: err
                )
            })?
            .len();

        Ok(LocalFile {
            path: final_path,
            file_name: file_name.to_owned(),
            rows,
            bytes,
        })
    }

    fn writer_properties(&self) -> WriterProperties {
        let compression = match self.compression {
            Compression::None => ParquetCompression::UNCOMPRESSED,
            Compression::Snappy => ParquetCompression::SNAPPY,
            Compression::Zstd => ParquetCompression::ZSTD(ZstdLevel::default()),
            Compression::Gzip => ParquetCompression::GZIP(GzipLevel::default()),
            Compression::Lz4 => ParquetCompression::LZ4_RAW,
        };

        WriterProperties::builder()
            .set_writer_version(WriterVersion::PARQUET_2_0)
            .set_compression(compression)
            .build()
    }
}

#[cfg(test)]
mod tests {
    use arrow::datatypes::{DataType, Field, Schema};
    use arrow::record_batch::RecordBatch;
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
    use std::sync::Arc;

    use super::*;
    use crate::concurrency::shutdown::create_shutdown_channel;
    use crate::test_utils::arrow::test_batch;

    fn records(sizes: &[usize]) -> Vec<Record> {
        let mut start = 0;
        sizes
            .iter()
            .map(|rows| {
                let batch = test_batch(start, *rows);
                start += *rows as i64;
                Record::new(batch)
            })
            .collect()
    }

    fn dir_entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .map(|entries| {
                entries
                    .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }

    #[test]
    fn written_file_is_complete_and_readable() {
        let dir = tempfile::tempdir().unwrap();
        let serializer =
            BatchSerializer::new(dir.path().join("data"), 64 * 1024 * 1024, Compression::Snappy);
        let (_tx, rx) = create_shutdown_channel();

        let file = serializer
            .write(records(&[100, 50]), "events_00000.parquet", &rx)
            .unwrap();

        assert_eq!(file.rows, 150);
        assert_eq!(file.file_name, "events_00000.parquet");
        assert_eq!(dir_entries(&dir.path().join("data")), vec!["events_00000.parquet"]);

        let reader = ParquetRecordBatchReaderBuilder::try_new(File::open(&file.path).unwrap())
            .unwrap();
        let metadata = reader.metadata().clone();
        assert_eq!(metadata.file_metadata().num_rows(), 150);
        assert_eq!(
            metadata.row_group(0).column(0).compression(),
            ParquetCompression::SNAPPY
        );
        assert_eq!(file.bytes, fs::metadata(&file.path).unwrap().len());
    }

    #[test]
    fn row_groups_are_flushed_at_batch_size() {
        let dir = tempfile::tempdir().unwrap();
        let serializer = BatchSerializer::new(dir.path().to_path_buf(), 1, Compression::Zstd);
        let (_tx, rx) = create_shutdown_channel();

        let file = serializer
            .write(records(&[10, 10, 10]), "events.parquet", &rx)
            .unwrap();

        let reader = ParquetRecordBatchReaderBuilder::try_new(File::open(&file.path).unwrap())
            .unwrap();
        assert_eq!(reader.metadata().num_row_groups(), 3);
        assert!(matches!(
            reader.metadata().row_group(0).column(0).compression(),
            ParquetCompression::ZSTD(_)
        ));
    }

    #[test]
    fn schema_mismatch_leaves_no_file_behind() {
        let dir = tempfile::tempdir().unwrap();
        let serializer =
            BatchSerializer::new(dir.path().to_path_buf(), 1024, Compression::None);
        let (_tx, rx) = create_shutdown_channel();

        let other_schema = Arc::new(Schema::new(vec![Field::new(
            "other",
            DataType::Int64,
            false,
        )]));
        let other = RecordBatch::try_new(
            other_schema,
            vec![Arc::new(arrow::array::Int64Array::from(vec![1, 2]))],
        )
        .unwrap();
        let mut input = records(&[5]);
        input.push(Record::new(other));

        let err = serializer
            .write(input, "events.parquet", &rx)
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::SerializeFailed);
        assert!(dir_entries(dir.path()).is_empty());
    }

    #[test]
    fn cancelled_write_is_not_promoted() {
        let dir = tempfile::tempdir().unwrap();
        let serializer =
            BatchSerializer::new(dir.path().to_path_buf(), 1024, Compression::Gzip);
        let (tx, rx) = create_shutdown_channel();
        tx.shutdown();

        let err = serializer
            .write(records(&[5]), "events.parquet", &rx)
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert!(dir_entries(dir.path()).is_empty());
    }

    #[test]
    fn empty_input_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let serializer =
            BatchSerializer::new(dir.path().to_path_buf(), 1024, Compression::Lz4);
        let (_tx, rx) = create_shutdown_channel();

        let err = serializer
            .write(Vec::new(), "events.parquet", &rx)
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }
}
