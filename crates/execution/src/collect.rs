//! Drivers that run a physical plan to completion or hand out lazy streams.
//!
//! Every driver owns the end of an execution: once results are drained (or
//! the returned stream is dropped) the context's cancellation token is
//! released, which aborts background producers that are still parked.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use futures::stream::FuturesUnordered;
use futures::{Stream, StreamExt};
use lfq_common::{LfqError, Result};
use tracing::{info, warn};

use crate::context::TaskContext;
use crate::exec_node::{ExecNode, execute_node};
use crate::ops::CoalescePartitionsExec;
use crate::stream::{RecordBatchStream, SendableRecordBatchStream};

/// Run every partition concurrently and concatenate results in partition order.
pub async fn collect(plan: Arc<dyn ExecNode>, ctx: Arc<TaskContext>) -> Result<Vec<RecordBatch>> {
    let parts = collect_partitioned(plan, ctx).await?;
    Ok(parts.into_iter().flatten().collect())
}

/// Run every partition concurrently, keeping partition boundaries.
///
/// The first failing partition aborts the others and its error is returned.
pub async fn collect_partitioned(
    plan: Arc<dyn ExecNode>,
    ctx: Arc<TaskContext>,
) -> Result<Vec<Vec<RecordBatch>>> {
    let started = Instant::now();
    let partitions = plan.output_partitioning().partition_count();
    info!(
        execution_id = %ctx.execution_id(),
        operator = plan.name(),
        partitions,
        "execution started"
    );
    let result = drain_all(&plan, &ctx, partitions).await;
    ctx.cancellation().release();
    let outcome = match &result {
        Ok(_) => "ok",
        Err(e) if matches!(e.root(), LfqError::Cancelled) => "cancelled",
        Err(_) => "error",
    };
    ctx.metrics().record_query(outcome);
    match &result {
        Ok(parts) => info!(
            execution_id = %ctx.execution_id(),
            rows = parts.iter().flatten().map(|b| b.num_rows()).sum::<usize>(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "execution finished"
        ),
        Err(e) => warn!(execution_id = %ctx.execution_id(), error = %e, "execution failed"),
    }
    result
}

async fn drain_all(
    plan: &Arc<dyn ExecNode>,
    ctx: &Arc<TaskContext>,
    partitions: usize,
) -> Result<Vec<Vec<RecordBatch>>> {
    let mut pending = FuturesUnordered::new();
    for p in 0..partitions {
        let stream = execute_node(plan, p, ctx)?;
        let rx = ctx.spawn_with_result(drain(stream))?;
        pending.push(async move { (p, rx.await) });
    }
    let mut results: Vec<Option<Vec<RecordBatch>>> = vec![None; partitions];
    while let Some((p, outcome)) = pending.next().await {
        match outcome {
            Ok(Ok(batches)) => results[p] = Some(batches),
            Ok(Err(e)) => return Err(e),
            Err(_) if ctx.is_cancelled() => return Err(LfqError::Cancelled),
            Err(_) => {
                return Err(LfqError::Execution(format!(
                    "partition {p} task ended without a result"
                )));
            }
        }
    }
    Ok(results.into_iter().map(Option::unwrap_or_default).collect())
}

async fn drain(mut stream: SendableRecordBatchStream) -> Result<Vec<RecordBatch>> {
    let mut out = Vec::new();
    while let Some(batch) = stream.next().await.transpose()? {
        if batch.num_rows() > 0 {
            out.push(batch);
        }
    }
    Ok(out)
}

/// Lazy single stream over all partitions in partition order.
///
/// Nothing runs until the stream is polled. Dropping it ends the execution.
pub fn execute_stream(plan: Arc<dyn ExecNode>, ctx: Arc<TaskContext>) -> Result<SendableRecordBatchStream> {
    let plan: Arc<dyn ExecNode> = if plan.output_partitioning().partition_count() == 1 {
        plan
    } else {
        Arc::new(CoalescePartitionsExec::new(plan, true))
    };
    let inner = execute_node(&plan, 0, &ctx)?;
    Ok(Box::pin(ExecutionStream::new(inner, ctx)))
}

/// One lazy stream per output partition.
///
/// The execution ends when the last of the streams is dropped.
pub fn execute_stream_partitioned(
    plan: Arc<dyn ExecNode>,
    ctx: Arc<TaskContext>,
) -> Result<Vec<SendableRecordBatchStream>> {
    let guard = Arc::new(ReleaseOnDrop(Arc::clone(&ctx)));
    (0..plan.output_partitioning().partition_count())
        .map(|p| {
            let inner = execute_node(&plan, p, &ctx)?;
            Ok(Box::pin(ExecutionStream {
                inner,
                _guard: Arc::clone(&guard),
            }) as SendableRecordBatchStream)
        })
        .collect()
}

struct ReleaseOnDrop(Arc<TaskContext>);

impl Drop for ReleaseOnDrop {
    fn drop(&mut self) {
        self.0.cancellation().release();
    }
}

/// Stream handed to callers; releases the execution when dropped.
struct ExecutionStream {
    inner: SendableRecordBatchStream,
    _guard: Arc<ReleaseOnDrop>,
}

impl ExecutionStream {
    fn new(inner: SendableRecordBatchStream, ctx: Arc<TaskContext>) -> Self {
        Self {
            inner,
            _guard: Arc::new(ReleaseOnDrop(ctx)),
        }
    }
}

impl Stream for ExecutionStream {
    type Item = Result<RecordBatch>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl RecordBatchStream for ExecutionStream {
    fn schema(&self) -> SchemaRef {
        self.inner.schema()
    }
}
