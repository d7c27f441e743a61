//! Join without equi-keys: every left row is compared with every right row.
//!
//! The right side is collected into memory, then left batches are streamed
//! in slices sized so one candidate block stays near `batch_size` rows.

use std::sync::Arc;

use arrow::array::UInt32Array;
use arrow::compute::concat_batches;
use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use futures::{StreamExt, TryStreamExt};
use lfq_common::{LfqError, MemoryReservation, Result};
use lfq_planner::{Expr, JoinType};

use crate::context::TaskContext;
use crate::exec_node::{ExecNode, OutputPartitioning, execute_node};
use crate::metrics::OperatorMetrics;
use crate::ops::join_utils::{JoinParams, OutputBuffer, indices_where};
use crate::stream::{SendableRecordBatchStream, adapt_stream};

pub struct NestedLoopJoinExec {
    left: Arc<dyn ExecNode>,
    right: Arc<dyn ExecNode>,
    params: Arc<JoinParams>,
    metrics: OperatorMetrics,
}

impl NestedLoopJoinExec {
    /// Both inputs must have a single partition.
    pub fn try_new(
        left: Arc<dyn ExecNode>,
        right: Arc<dyn ExecNode>,
        filter: Option<Expr>,
        join_type: JoinType,
        schema: SchemaRef,
    ) -> Result<Self> {
        for side in [&left, &right] {
            if side.output_partitioning().partition_count() != 1 {
                return Err(LfqError::Execution(
                    "nested loop join requires single-partition inputs".to_string(),
                ));
            }
        }
        let params = JoinParams::try_new(left.schema(), right.schema(), vec![], filter, join_type, schema)?;
        Ok(Self {
            left,
            right,
            params: Arc::new(params),
            metrics: OperatorMetrics::new(),
        })
    }
}

struct LoopState {
    params: Arc<JoinParams>,
    right: RecordBatch,
    right_matched: Vec<bool>,
    left: SendableRecordBatchStream,
    out: OutputBuffer,
    batch_size: usize,
    done: bool,
    _reservation: MemoryReservation,
}

impl LoopState {
    fn join_slice(&mut self, left: &RecordBatch) -> Result<()> {
        let (ln, rn) = (left.num_rows() as u32, self.right.num_rows() as u32);
        let li = UInt32Array::from_iter_values((0..ln).flat_map(|i| std::iter::repeat(i).take(rn as usize)));
        let ri = UInt32Array::from_iter_values((0..ln).flat_map(|_| 0..rn));
        let (li, ri) = self.params.apply_filter(left, li, &self.right, ri)?;
        let mut left_matched = vec![false; ln as usize];
        for i in li.values() {
            left_matched[*i as usize] = true;
        }
        for i in ri.values() {
            self.right_matched[*i as usize] = true;
        }
        let jt = self.params.join_type;
        match jt {
            JoinType::Semi | JoinType::Anti => {
                let keep = indices_where(&left_matched, jt == JoinType::Semi);
                self.out.push(self.params.left_only(left, &keep)?)?;
            }
            _ => {
                self.out
                    .push(self.params.output(left, &li, &self.right, &ri)?)?;
                if jt.preserves_left() {
                    let idx = indices_where(&left_matched, false);
                    self.out.push(self.params.left_only(left, &idx)?)?;
                }
            }
        }
        Ok(())
    }

    fn join_batch(&mut self, batch: &RecordBatch) -> Result<()> {
        let step = (self.batch_size / self.right.num_rows().max(1)).max(1);
        let mut off = 0;
        while off < batch.num_rows() {
            let len = step.min(batch.num_rows() - off);
            self.join_slice(&batch.slice(off, len))?;
            off += len;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if self.params.join_type.preserves_right() {
            let idx = indices_where(&self.right_matched, false);
            self.out.push(self.params.right_only(&self.right, &idx)?)?;
        }
        self.out.flush()
    }
}

async fn next_joined(mut st: LoopState) -> Result<Option<(RecordBatch, LoopState)>> {
    loop {
        if let Some(batch) = st.out.pop() {
            return Ok(Some((batch, st)));
        }
        if st.done {
            return Ok(None);
        }
        match st.left.next().await.transpose()? {
            Some(batch) => st.join_batch(&batch)?,
            None => {
                st.done = true;
                st.finish()?;
            }
        }
    }
}

impl ExecNode for NestedLoopJoinExec {
    fn name(&self) -> &'static str {
        "NestedLoopJoinExec"
    }

    fn schema(&self) -> SchemaRef {
        Arc::clone(&self.params.schema)
    }

    fn output_partitioning(&self) -> OutputPartitioning {
        OutputPartitioning::Unknown(1)
    }

    fn children(&self) -> Vec<Arc<dyn ExecNode>> {
        vec![Arc::clone(&self.left), Arc::clone(&self.right)]
    }

    fn execute(&self, partition: usize, ctx: Arc<TaskContext>) -> Result<SendableRecordBatchStream> {
        let left = execute_node(&self.left, partition, &ctx)?;
        let mut right = execute_node(&self.right, partition, &ctx)?;
        let right_schema = self.right.schema();
        let params = Arc::clone(&self.params);
        let mut reservation = ctx
            .memory_pool()
            .reservation(format!("NestedLoopJoinExec[{partition}]"));
        let out = OutputBuffer::new(self.schema(), ctx.batch_size());
        let batch_size = ctx.batch_size();
        let fut = async move {
            let mut batches = Vec::new();
            while let Some(batch) = right.next().await.transpose()? {
                reservation.try_grow(batch.get_array_memory_size())?;
                batches.push(batch);
            }
            let right = concat_batches(&right_schema, &batches)?;
            let state = LoopState {
                params,
                right_matched: vec![false; right.num_rows()],
                right,
                left,
                out,
                batch_size,
                done: false,
                _reservation: reservation,
            };
            Ok::<_, LfqError>(futures::stream::try_unfold(state, next_joined))
        };
        Ok(adapt_stream(
            self.schema(),
            futures::stream::once(fut).try_flatten(),
        ))
    }

    fn metrics(&self) -> &OperatorMetrics {
        &self.metrics
    }

    fn details(&self) -> String {
        match &self.params.filter_expr {
            Some(f) => format!("type={} filter={f}", self.params.join_type),
            None => format!("type={}", self.params.join_type),
        }
    }
}
