use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::record_batch::{RecordBatch, RecordBatchOptions};
use arrow_schema::SchemaRef;
use lfq_common::{LfqError, Result};
use lfq_execution::{
    ExecNode, OperatorMetrics, OutputPartitioning, SendableRecordBatchStream, TableSource,
    TableStatistics, TaskContext, empty_stream,
};
use lfq_execution::stream::adapt_stream;
use lfq_planner::Expr;
use parquet::arrow::ProjectionMask;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use tracing::debug;

fn parquet_err(path: &Path, e: impl std::fmt::Display) -> LfqError {
    LfqError::Execution(format!("parquet read of '{}' failed: {e}", path.display()))
}

fn open_builder(path: &Path) -> Result<ParquetRecordBatchReaderBuilder<File>> {
    let file = File::open(path)?;
    ParquetRecordBatchReaderBuilder::try_new(file).map_err(|e| parquet_err(path, e))
}

/// Table over one or more local parquet files sharing a schema.
#[derive(Debug, Clone)]
pub struct ParquetTable {
    paths: Vec<PathBuf>,
    schema: SchemaRef,
    stats: TableStatistics,
}

impl ParquetTable {
    /// Open `paths`, reading only footers. All files must agree on their fields.
    pub fn try_new(paths: Vec<PathBuf>) -> Result<Self> {
        let mut schema: Option<SchemaRef> = None;
        let (mut rows, mut bytes) = (0usize, 0usize);
        for path in &paths {
            let builder = open_builder(path)?;
            let file_schema = Arc::clone(builder.schema());
            match &schema {
                Some(s) if s.fields() != file_schema.fields() => {
                    return Err(LfqError::Schema(format!(
                        "parquet file '{}' does not match the schema of the first file",
                        path.display()
                    )));
                }
                Some(_) => {}
                None => schema = Some(file_schema),
            }
            let meta = builder.metadata();
            rows += usize::try_from(meta.file_metadata().num_rows()).unwrap_or(0);
            bytes += meta
                .row_groups()
                .iter()
                .map(|rg| usize::try_from(rg.total_byte_size()).unwrap_or(0))
                .sum::<usize>();
        }
        let schema = schema.ok_or_else(|| {
            LfqError::BuilderArgument("parquet table needs at least one file".to_string())
        })?;
        debug!(files = paths.len(), rows, bytes, "opened parquet table");
        Ok(Self {
            paths,
            schema,
            stats: TableStatistics {
                num_rows: Some(rows),
                total_bytes: Some(bytes),
            },
        })
    }

    /// A single file, or every `*.parquet` file of a directory in name order.
    pub fn try_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_dir() {
            return Self::try_new(vec![path.to_path_buf()]);
        }
        let mut files = Vec::new();
        for entry in fs::read_dir(path)? {
            let p = entry?.path();
            if p.extension().is_some_and(|ext| ext == "parquet") {
                files.push(p);
            }
        }
        files.sort();
        Self::try_new(files)
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }
}

impl TableSource for ParquetTable {
    fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    fn statistics(&self) -> TableStatistics {
        self.stats
    }

    fn scan(
        &self,
        projection: Option<&[usize]>,
        _filters: &[Expr],
        limit: Option<usize>,
    ) -> Result<Arc<dyn ExecNode>> {
        let schema = match projection {
            Some(p) => Arc::new(self.schema.project(p)?),
            None => Arc::clone(&self.schema),
        };
        Ok(Arc::new(ParquetScanExec {
            paths: self.paths.clone(),
            projection: projection.map(<[usize]>::to_vec),
            limit,
            schema,
            metrics: OperatorMetrics::new(),
        }))
    }
}

/// Leaf operator reading one parquet file per partition.
#[derive(Debug)]
pub struct ParquetScanExec {
    paths: Vec<PathBuf>,
    projection: Option<Vec<usize>>,
    limit: Option<usize>,
    schema: SchemaRef,
    metrics: OperatorMetrics,
}

impl ExecNode for ParquetScanExec {
    fn name(&self) -> &'static str {
        "ParquetScanExec"
    }

    fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    fn output_partitioning(&self) -> OutputPartitioning {
        OutputPartitioning::Unknown(self.paths.len().max(1))
    }

    fn children(&self) -> Vec<Arc<dyn ExecNode>> {
        vec![]
    }

    fn execute(&self, partition: usize, ctx: Arc<TaskContext>) -> Result<SendableRecordBatchStream> {
        let schema = Arc::clone(&self.schema);
        let Some(path) = self.paths.get(partition) else {
            return Ok(empty_stream(schema));
        };
        let mut builder = open_builder(path)?.with_batch_size(ctx.batch_size());

        // The mask reads columns in file order; `reorder` restores the
        // requested order afterwards.
        let mut reorder = None;
        if let Some(p) = &self.projection {
            let mut sorted = p.clone();
            sorted.sort_unstable();
            sorted.dedup();
            let mask = ProjectionMask::roots(builder.parquet_schema(), sorted.iter().copied());
            builder = builder.with_projection(mask);
            reorder = Some(
                p.iter()
                    .map(|i| sorted.binary_search(i).unwrap_or_default())
                    .collect::<Vec<_>>(),
            );
        }
        if let Some(n) = self.limit {
            builder = builder.with_limit(n);
        }
        let reader = builder.build().map_err(|e| parquet_err(path, e))?;
        debug!(file = %path.display(), partition, "parquet scan started");

        let out_schema = Arc::clone(&schema);
        let batches = reader.map(move |batch| -> Result<RecordBatch> {
            let batch = batch?;
            let batch = match &reorder {
                Some(r) => batch.project(r)?,
                None => batch,
            };
            let options = RecordBatchOptions::new().with_row_count(Some(batch.num_rows()));
            Ok(RecordBatch::try_new_with_options(
                Arc::clone(&out_schema),
                batch.columns().to_vec(),
                &options,
            )?)
        });
        Ok(adapt_stream(schema, futures::stream::iter(batches)))
    }

    fn metrics(&self) -> &OperatorMetrics {
        &self.metrics
    }

    fn details(&self) -> String {
        let mut s = format!("files={}", self.paths.len());
        if let Some(n) = self.limit {
            s.push_str(&format!(" limit={n}"));
        }
        s
    }
}
