use std::sync::Arc;

use arrow::array::AsArray;
use arrow::compute::filter_record_batch;
use arrow::record_batch::RecordBatch;
use arrow_schema::{DataType, SchemaRef};
use futures::{StreamExt, TryStreamExt, future};
use lfq_common::{LfqError, Result};
use lfq_planner::Expr;

use crate::context::TaskContext;
use crate::exec_node::{ExecNode, OutputPartitioning, execute_node};
use crate::expressions::{PhysicalExpr, compile_expr};
use crate::metrics::OperatorMetrics;
use crate::stream::{SendableRecordBatchStream, adapt_stream};

/// Keeps rows whose predicate is `true`; `false` and null rows are dropped.
pub struct FilterExec {
    input: Arc<dyn ExecNode>,
    predicate: Expr,
    compiled: Arc<dyn PhysicalExpr>,
    metrics: OperatorMetrics,
}

impl FilterExec {
    pub fn try_new(input: Arc<dyn ExecNode>, predicate: Expr) -> Result<Self> {
        let compiled = compile_expr(&predicate, &input.schema())?;
        if !matches!(compiled.data_type(), DataType::Boolean | DataType::Null) {
            return Err(LfqError::Schema(format!(
                "filter predicate '{predicate}' is {}, expected boolean",
                compiled.data_type()
            )));
        }
        Ok(Self {
            input,
            predicate,
            compiled,
            metrics: OperatorMetrics::new(),
        })
    }
}

/// Apply `predicate` to `batch`.
pub fn filter_batch(predicate: &dyn PhysicalExpr, batch: &RecordBatch) -> Result<RecordBatch> {
    let mask = predicate.evaluate(batch)?;
    if mask.data_type() == &DataType::Null {
        return Ok(batch.slice(0, 0));
    }
    let mask = mask
        .as_boolean_opt()
        .ok_or_else(|| LfqError::Execution("filter predicate is not boolean".to_string()))?;
    Ok(filter_record_batch(batch, mask)?)
}

impl ExecNode for FilterExec {
    fn name(&self) -> &'static str {
        "FilterExec"
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
        let predicate = Arc::clone(&self.compiled);
        let out = input
            .map(move |r| r.and_then(|b| filter_batch(predicate.as_ref(), &b)))
            .try_filter(|b| future::ready(b.num_rows() > 0));
        Ok(adapt_stream(self.schema(), out))
    }

    fn metrics(&self) -> &OperatorMetrics {
        &self.metrics
    }

    fn details(&self) -> String {
        self.predicate.to_string()
    }
}
