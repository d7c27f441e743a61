use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use futures::Stream;
use lfq_common::{LfqError, Result};
use lfq_planner::Expr;
use tracing::debug;

use crate::context::TaskContext;
use crate::metrics::OperatorMetrics;
use crate::stream::{RecordBatchStream, SendableRecordBatchStream};

/// How an operator's output rows are spread over its partitions.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputPartitioning {
    /// `n` partitions with no placement guarantee.
    Unknown(usize),
    RoundRobin(usize),
    /// Rows with equal values of the expressions share a partition.
    Hash(Vec<Expr>, usize),
}

impl OutputPartitioning {
    pub fn partition_count(&self) -> usize {
        match self {
            OutputPartitioning::Unknown(n)
            | OutputPartitioning::RoundRobin(n)
            | OutputPartitioning::Hash(_, n) => *n,
        }
    }

    /// Output is already hash-distributed on exactly `exprs` into `n` parts.
    pub fn satisfies_hash(&self, exprs: &[Expr], n: usize) -> bool {
        match self {
            OutputPartitioning::Hash(have, m) => *m == n && have.as_slice() == exprs,
            _ => false,
        }
    }
}

/// A physical operator instance that can produce RecordBatches.
///
/// Operators are pull-based (consumer polls the stream), but may use bounded
/// channels internally for push-based parts (repartition, coalesce).
/// `execute` is called once per output partition of one execution; callers
/// go through [`execute_node`] so streams are instrumented uniformly.
pub trait ExecNode: Send + Sync {
    fn name(&self) -> &'static str;

    fn schema(&self) -> SchemaRef;

    fn output_partitioning(&self) -> OutputPartitioning;

    fn children(&self) -> Vec<Arc<dyn ExecNode>>;

    fn execute(&self, partition: usize, ctx: Arc<TaskContext>) -> Result<SendableRecordBatchStream>;

    fn metrics(&self) -> &OperatorMetrics;

    /// One-line operator parameters for explain output.
    fn details(&self) -> String {
        String::new()
    }
}

/// Execute one partition of `node` wrapped in an [`InstrumentedStream`].
pub fn execute_node(
    node: &Arc<dyn ExecNode>,
    partition: usize,
    ctx: &Arc<TaskContext>,
) -> Result<SendableRecordBatchStream> {
    let partitions = node.output_partitioning().partition_count();
    if partition >= partitions {
        return Err(LfqError::Execution(format!(
            "{} has {partitions} partitions, partition {partition} requested",
            node.name()
        )));
    }
    ctx.check_cancelled()?;
    let inner = node
        .execute(partition, Arc::clone(ctx))
        .map_err(|e| e.with_operator(node.name(), partition))?;
    Ok(Box::pin(InstrumentedStream {
        node: Arc::clone(node),
        partition,
        ctx: Arc::clone(ctx),
        inner,
        state: StreamState::NotStarted,
        rows: 0,
        batches: 0,
        bytes: 0,
        elapsed: Duration::ZERO,
    }))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    NotStarted,
    Running,
    Exhausted,
    Failed,
}

/// Operator stream wrapper enforcing the partition lifecycle.
///
/// Checks cancellation between batches, tags errors with the operator and
/// partition, and feeds [`OperatorMetrics`] plus the prometheus registry.
/// Once exhausted or failed it only yields `None`.
struct InstrumentedStream {
    node: Arc<dyn ExecNode>,
    partition: usize,
    ctx: Arc<TaskContext>,
    inner: SendableRecordBatchStream,
    state: StreamState,
    rows: u64,
    batches: u64,
    bytes: u64,
    elapsed: Duration,
}

impl InstrumentedStream {
    fn finish(&mut self, state: StreamState) {
        self.state = state;
        self.ctx.metrics().record_operator(
            &self.ctx.execution_id().to_string(),
            self.node.name(),
            self.partition,
            self.rows,
            self.batches,
            self.bytes,
            self.elapsed.as_secs_f64(),
        );
        debug!(
            operator = self.node.name(),
            partition = self.partition,
            rows = self.rows,
            batches = self.batches,
            elapsed_ms = self.elapsed.as_millis() as u64,
            failed = state == StreamState::Failed,
            "operator partition finished"
        );
    }

    fn fail(&mut self, err: LfqError) -> Poll<Option<Result<RecordBatch>>> {
        let err = if self.ctx.is_cancelled() {
            LfqError::Cancelled
        } else {
            err.with_operator(self.node.name(), self.partition)
        };
        self.finish(StreamState::Failed);
        Poll::Ready(Some(Err(err)))
    }
}

impl Stream for InstrumentedStream {
    type Item = Result<RecordBatch>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.state {
            StreamState::Exhausted | StreamState::Failed => return Poll::Ready(None),
            StreamState::NotStarted => {
                debug!(
                    operator = self.node.name(),
                    partition = self.partition,
                    "operator partition started"
                );
                self.state = StreamState::Running;
            }
            StreamState::Running => {}
        }
        if self.ctx.is_cancelled() {
            return self.fail(LfqError::Cancelled);
        }

        let start = Instant::now();
        let polled = self.inner.as_mut().poll_next(cx);
        let spent = start.elapsed();
        self.elapsed += spent;
        self.node.metrics().add_elapsed(spent);

        match polled {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Ok(batch))) => {
                if self.ctx.is_cancelled() {
                    return self.fail(LfqError::Cancelled);
                }
                self.rows += batch.num_rows() as u64;
                self.batches += 1;
                self.bytes += batch.get_array_memory_size() as u64;
                self.node.metrics().record_batch(&batch);
                Poll::Ready(Some(Ok(batch)))
            }
            Poll::Ready(Some(Err(e))) => self.fail(e),
            Poll::Ready(None) => {
                if self.ctx.is_cancelled() {
                    return self.fail(LfqError::Cancelled);
                }
                self.finish(StreamState::Exhausted);
                Poll::Ready(None)
            }
        }
    }
}

impl RecordBatchStream for InstrumentedStream {
    fn schema(&self) -> SchemaRef {
        self.node.schema()
    }
}
