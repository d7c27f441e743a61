use std::sync::Arc;

use arrow::compute::cast;
use arrow::record_batch::{RecordBatch, RecordBatchOptions};
use arrow_schema::SchemaRef;
use futures::StreamExt;
use lfq_common::Result;
use lfq_planner::Expr;

use crate::context::TaskContext;
use crate::exec_node::{ExecNode, OutputPartitioning, execute_node};
use crate::expressions::{PhysicalExpr, compile_expr};
use crate::metrics::OperatorMetrics;
use crate::stream::{SendableRecordBatchStream, adapt_stream};

/// Evaluates one expression per output column.
pub struct ProjectionExec {
    input: Arc<dyn ExecNode>,
    exprs: Vec<Expr>,
    compiled: Arc<Vec<Arc<dyn PhysicalExpr>>>,
    schema: SchemaRef,
    metrics: OperatorMetrics,
}

impl ProjectionExec {
    /// `schema` is the output schema derived by the logical plan.
    pub fn try_new(input: Arc<dyn ExecNode>, exprs: Vec<Expr>, schema: SchemaRef) -> Result<Self> {
        let input_schema = input.schema();
        let compiled = exprs
            .iter()
            .map(|e| compile_expr(e, &input_schema))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            input,
            exprs,
            compiled: Arc::new(compiled),
            schema,
            metrics: OperatorMetrics::new(),
        })
    }
}

fn project_batch(
    exprs: &[Arc<dyn PhysicalExpr>],
    schema: &SchemaRef,
    batch: &RecordBatch,
) -> Result<RecordBatch> {
    let columns = exprs
        .iter()
        .zip(schema.fields())
        .map(|(e, f)| {
            let arr = e.evaluate(batch)?;
            if arr.data_type() == f.data_type() {
                Ok(arr)
            } else {
                Ok(cast(&arr, f.data_type())?)
            }
        })
        .collect::<Result<Vec<_>>>()?;
    let options = RecordBatchOptions::new().with_row_count(Some(batch.num_rows()));
    Ok(RecordBatch::try_new_with_options(
        Arc::clone(schema),
        columns,
        &options,
    )?)
}

impl ExecNode for ProjectionExec {
    fn name(&self) -> &'static str {
        "ProjectionExec"
    }

    fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    fn output_partitioning(&self) -> OutputPartitioning {
        OutputPartitioning::Unknown(self.input.output_partitioning().partition_count())
    }

    fn children(&self) -> Vec<Arc<dyn ExecNode>> {
        vec![Arc::clone(&self.input)]
    }

    fn execute(&self, partition: usize, ctx: Arc<TaskContext>) -> Result<SendableRecordBatchStream> {
        let input = execute_node(&self.input, partition, &ctx)?;
        let exprs = Arc::clone(&self.compiled);
        let schema = self.schema();
        let out_schema = Arc::clone(&schema);
        let out = input.map(move |r| r.and_then(|b| project_batch(&exprs, &schema, &b)));
        Ok(adapt_stream(out_schema, out))
    }

    fn metrics(&self) -> &OperatorMetrics {
        &self.metrics
    }

    fn details(&self) -> String {
        self.exprs
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }
}
