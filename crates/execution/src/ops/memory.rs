use std::sync::Arc;

use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use lfq_common::Result;

use crate::context::TaskContext;
use crate::exec_node::{ExecNode, OutputPartitioning};
use crate::metrics::OperatorMetrics;
use crate::ops::rebatch;
use crate::stream::{SendableRecordBatchStream, memory_stream};

/// Leaf operator over batches already held in memory, one `Vec` per partition.
#[derive(Debug)]
pub struct MemoryExec {
    partitions: Vec<Vec<RecordBatch>>,
    projection: Option<Vec<usize>>,
    fetch: Option<usize>,
    schema: SchemaRef,
    metrics: OperatorMetrics,
}

impl MemoryExec {
    /// `source_schema` describes the stored batches; `projection` indexes it.
    pub fn try_new(
        partitions: Vec<Vec<RecordBatch>>,
        source_schema: SchemaRef,
        projection: Option<Vec<usize>>,
        fetch: Option<usize>,
    ) -> Result<Self> {
        let schema = match &projection {
            Some(p) => Arc::new(source_schema.project(p)?),
            None => source_schema,
        };
        let partitions = if partitions.is_empty() {
            vec![Vec::new()]
        } else {
            partitions
        };
        Ok(Self {
            partitions,
            projection,
            fetch,
            schema,
            metrics: OperatorMetrics::new(),
        })
    }
}

impl ExecNode for MemoryExec {
    fn name(&self) -> &'static str {
        "MemoryExec"
    }

    fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    fn output_partitioning(&self) -> OutputPartitioning {
        OutputPartitioning::Unknown(self.partitions.len())
    }

    fn children(&self) -> Vec<Arc<dyn ExecNode>> {
        vec![]
    }

    fn execute(&self, partition: usize, _ctx: Arc<TaskContext>) -> Result<SendableRecordBatchStream> {
        let mut remaining = self.fetch.unwrap_or(usize::MAX);
        let mut out = Vec::new();
        for batch in &self.partitions[partition] {
            if remaining == 0 {
                break;
            }
            let batch = match &self.projection {
                Some(p) => batch.project(p)?,
                None => batch.clone(),
            };
            let batch = if batch.num_rows() > remaining {
                batch.slice(0, remaining)
            } else {
                batch
            };
            remaining -= batch.num_rows();
            out.push(rebatch(&self.schema, batch)?);
        }
        Ok(memory_stream(Arc::clone(&self.schema), out))
    }

    fn metrics(&self) -> &OperatorMetrics {
        &self.metrics
    }

    fn details(&self) -> String {
        let rows: usize = self.partitions.iter().flatten().map(RecordBatch::num_rows).sum();
        let mut s = format!("partitions={} rows={rows}", self.partitions.len());
        if let Some(n) = self.fetch {
            s.push_str(&format!(" fetch={n}"));
        }
        s
    }
}
