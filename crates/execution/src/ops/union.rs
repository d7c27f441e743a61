use std::sync::Arc;

use arrow_schema::SchemaRef;
use futures::StreamExt;
use lfq_common::{LfqError, Result};

use crate::context::TaskContext;
use crate::exec_node::{ExecNode, OutputPartitioning, execute_node};
use crate::metrics::OperatorMetrics;
use crate::ops::rebatch;
use crate::stream::{SendableRecordBatchStream, adapt_stream};

/// Bag union: output partitions are the inputs' partitions laid end to end.
pub struct UnionExec {
    inputs: Vec<Arc<dyn ExecNode>>,
    schema: SchemaRef,
    metrics: OperatorMetrics,
}

impl UnionExec {
    pub fn new(inputs: Vec<Arc<dyn ExecNode>>, schema: SchemaRef) -> Self {
        Self {
            inputs,
            schema,
            metrics: OperatorMetrics::new(),
        }
    }
}

impl ExecNode for UnionExec {
    fn name(&self) -> &'static str {
        "UnionExec"
    }

    fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    fn output_partitioning(&self) -> OutputPartitioning {
        OutputPartitioning::Unknown(
            self.inputs
                .iter()
                .map(|i| i.output_partitioning().partition_count())
                .sum(),
        )
    }

    fn children(&self) -> Vec<Arc<dyn ExecNode>> {
        self.inputs.clone()
    }

    fn execute(&self, partition: usize, ctx: Arc<TaskContext>) -> Result<SendableRecordBatchStream> {
        let mut local = partition;
        for input in &self.inputs {
            let n = input.output_partitioning().partition_count();
            if local < n {
                let stream = execute_node(input, local, &ctx)?;
                let schema = self.schema();
                let out = stream.map(move |r| r.and_then(|b| rebatch(&schema, b)));
                return Ok(adapt_stream(self.schema(), out));
            }
            local -= n;
        }
        Err(LfqError::Execution(format!(
            "UnionExec has no partition {partition}"
        )))
    }

    fn metrics(&self) -> &OperatorMetrics {
        &self.metrics
    }

    fn details(&self) -> String {
        format!("inputs={}", self.inputs.len())
    }
}
