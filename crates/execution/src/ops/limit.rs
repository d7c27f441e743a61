use std::sync::Arc;

use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use futures::StreamExt;
use lfq_common::{LfqError, Result};

use crate::context::TaskContext;
use crate::exec_node::{ExecNode, OutputPartitioning, execute_node};
use crate::metrics::OperatorMetrics;
use crate::stream::{SendableRecordBatchStream, adapt_stream};

struct LimitState {
    input: SendableRecordBatchStream,
    skip: usize,
    remaining: Option<usize>,
}

/// Skip then take rows; stops pulling input once `remaining` hits zero.
async fn next_limited(mut st: LimitState) -> Result<Option<(RecordBatch, LimitState)>> {
    loop {
        if st.remaining == Some(0) {
            return Ok(None);
        }
        let Some(batch) = st.input.next().await.transpose()? else {
            return Ok(None);
        };
        let mut batch = batch;
        if st.skip > 0 {
            if batch.num_rows() <= st.skip {
                st.skip -= batch.num_rows();
                continue;
            }
            batch = batch.slice(st.skip, batch.num_rows() - st.skip);
            st.skip = 0;
        }
        if let Some(r) = st.remaining.as_mut() {
            if batch.num_rows() > *r {
                batch = batch.slice(0, *r);
            }
            *r -= batch.num_rows();
        }
        if batch.num_rows() > 0 {
            return Ok(Some((batch, st)));
        }
    }
}

fn limit_stream(
    schema: SchemaRef,
    input: SendableRecordBatchStream,
    skip: usize,
    fetch: Option<usize>,
) -> SendableRecordBatchStream {
    let state = LimitState {
        input,
        skip,
        remaining: fetch,
    };
    adapt_stream(schema, futures::stream::try_unfold(state, next_limited))
}

/// Caps every partition at `fetch` rows. Used below a coalesce so each
/// partition stops early; the global limit above applies the exact offset.
pub struct LocalLimitExec {
    input: Arc<dyn ExecNode>,
    fetch: usize,
    metrics: OperatorMetrics,
}

impl LocalLimitExec {
    pub fn new(input: Arc<dyn ExecNode>, fetch: usize) -> Self {
        Self {
            input,
            fetch,
            metrics: OperatorMetrics::new(),
        }
    }
}

impl ExecNode for LocalLimitExec {
    fn name(&self) -> &'static str {
        "LocalLimitExec"
    }

    fn schema(&self) -> SchemaRef {
        self.input.schema()
    }

    fn output_partitioning(&self) -> OutputPartitioning {
        self.input.output_partitioning()
    }

    fn children(&self) -> Vec<Arc<dyn ExecNode>> {
        vec![Arc::clone(&self.input)]
    }

    fn execute(&self, partition: usize, ctx: Arc<TaskContext>) -> Result<SendableRecordBatchStream> {
        let input = execute_node(&self.input, partition, &ctx)?;
        Ok(limit_stream(self.schema(), input, 0, Some(self.fetch)))
    }

    fn metrics(&self) -> &OperatorMetrics {
        &self.metrics
    }

    fn details(&self) -> String {
        format!("fetch={}", self.fetch)
    }
}

/// Skip/fetch over a single-partition input.
pub struct GlobalLimitExec {
    input: Arc<dyn ExecNode>,
    skip: usize,
    fetch: Option<usize>,
    metrics: OperatorMetrics,
}

impl GlobalLimitExec {
    pub fn try_new(input: Arc<dyn ExecNode>, skip: usize, fetch: Option<usize>) -> Result<Self> {
        let n = input.output_partitioning().partition_count();
        if n != 1 {
            return Err(LfqError::Execution(format!(
                "GlobalLimitExec requires a single input partition, got {n}"
            )));
        }
        Ok(Self {
            input,
            skip,
            fetch,
            metrics: OperatorMetrics::new(),
        })
    }
}

impl ExecNode for GlobalLimitExec {
    fn name(&self) -> &'static str {
        "GlobalLimitExec"
    }

    fn schema(&self) -> SchemaRef {
        self.input.schema()
    }

    fn output_partitioning(&self) -> OutputPartitioning {
        OutputPartitioning::Unknown(1)
    }

    fn children(&self) -> Vec<Arc<dyn ExecNode>> {
        vec![Arc::clone(&self.input)]
    }

    fn execute(&self, partition: usize, ctx: Arc<TaskContext>) -> Result<SendableRecordBatchStream> {
        let input = execute_node(&self.input, partition, &ctx)?;
        Ok(limit_stream(self.schema(), input, self.skip, self.fetch))
    }

    fn metrics(&self) -> &OperatorMetrics {
        &self.metrics
    }

    fn details(&self) -> String {
        match self.fetch {
            Some(n) => format!("skip={} fetch={n}", self.skip),
            None => format!("skip={}", self.skip),
        }
    }
}
