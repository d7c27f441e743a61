//! Arrow IPC spill files for external sort runs and repartition overflow.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::StreamWriter;
use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use lfq_common::{LfqError, Result};
use tracing::debug;

/// One spilled run on local disk, deleted on drop.
#[derive(Debug)]
pub struct SpillFile {
    path: PathBuf,
    rows: usize,
    bytes: u64,
}

impl SpillFile {
    /// Write `batches` as an IPC stream into a fresh file under `dir`.
    pub fn write(dir: &Path, tag: &str, schema: &SchemaRef, batches: &[RecordBatch]) -> Result<Self> {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        fs::create_dir_all(dir)?;
        let path = dir.join(format!(
            "lfq-{tag}-{}-{}.arrow",
            std::process::id(),
            NEXT.fetch_add(1, Ordering::Relaxed)
        ));

        let mut file = BufWriter::new(File::create(&path)?);
        {
            let mut writer = StreamWriter::try_new(&mut file, schema.as_ref())
                .map_err(|e| LfqError::Execution(format!("ipc writer init failed: {e}")))?;
            for b in batches {
                writer
                    .write(b)
                    .map_err(|e| LfqError::Execution(format!("ipc write failed: {e}")))?;
            }
            writer
                .finish()
                .map_err(|e| LfqError::Execution(format!("ipc finish failed: {e}")))?;
        }
        file.flush()?;

        let bytes = fs::metadata(&path)?.len();
        let rows = batches.iter().map(RecordBatch::num_rows).sum();
        debug!(path = %path.display(), rows, bytes, "spill run written");
        Ok(Self { path, rows, bytes })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Read the run back batch by batch.
    ///
    /// The returned iterator owns `self`, so the file lives until it is dropped.
    pub fn into_batches(self) -> Result<SpillReader> {
        let reader = StreamReader::try_new(BufReader::new(File::open(&self.path)?), None)
            .map_err(|e| LfqError::Execution(format!("spill decode failed: {e}")))?;
        Ok(SpillReader {
            reader,
            _file: self,
        })
    }
}

impl Drop for SpillFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            debug!(path = %self.path.display(), error = %e, "failed to remove spill file");
        }
    }
}

/// Iterator over the batches of one [`SpillFile`].
pub struct SpillReader {
    reader: StreamReader<BufReader<File>>,
    _file: SpillFile,
}

impl Iterator for SpillReader {
    type Item = Result<RecordBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        self.reader.next().map(|r| {
            r.map_err(|e| LfqError::Execution(format!("spill decode failed: {e}")))
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::array::Int64Array;
    use arrow_schema::{DataType, Field, Schema};

    use super::*;

    #[test]
    fn run_reads_back_and_is_removed() {
        let tmp = tempfile::tempdir().expect("temp dir");
        let dir = tmp.path().join("spill");
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]));
        let batch = RecordBatch::try_new(
            Arc::clone(&schema),
            vec![Arc::new(Int64Array::from(vec![3, 1, 2]))],
        )
        .expect("batch");
        let run = SpillFile::write(&dir, "test", &schema, &[batch.clone(), batch]).expect("write");
        let path = run.path().to_path_buf();
        assert_eq!(run.rows(), 6);
        assert!(run.bytes() > 0);
        let batches = run
            .into_batches()
            .expect("open")
            .collect::<Result<Vec<_>>>()
            .expect("read");
        assert_eq!(batches.len(), 2);
        assert!(!path.exists());
        assert!(path.starts_with(tmp.path()));
    }
}
