use std::sync::Arc;

use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use futures::StreamExt;
use lfq_common::Result;
use tracing::debug;

use crate::context::TaskContext;
use crate::exec_node::{ExecNode, OutputPartitioning, execute_node};
use crate::metrics::OperatorMetrics;
use crate::stream::{SendableRecordBatchStream, adapt_stream, bounded_batch_channel};

/// Merges every input partition into one output partition.
///
/// With `preserve_order` partitions are drained one after another, so the
/// output is partition 0's rows, then partition 1's, and so on. Otherwise each
/// partition is driven by its own task feeding a bounded channel.
pub struct CoalescePartitionsExec {
    input: Arc<dyn ExecNode>,
    preserve_order: bool,
    metrics: OperatorMetrics,
}

impl CoalescePartitionsExec {
    pub fn new(input: Arc<dyn ExecNode>, preserve_order: bool) -> Self {
        Self {
            input,
            preserve_order,
            metrics: OperatorMetrics::new(),
        }
    }
}

struct ChainState {
    input: Arc<dyn ExecNode>,
    ctx: Arc<TaskContext>,
    next_partition: usize,
    partitions: usize,
    current: Option<SendableRecordBatchStream>,
}

async fn next_chained(mut st: ChainState) -> Result<Option<(RecordBatch, ChainState)>> {
    loop {
        if let Some(stream) = st.current.as_mut() {
            match stream.next().await.transpose()? {
                Some(batch) => return Ok(Some((batch, st))),
                None => st.current = None,
            }
        }
        if st.next_partition >= st.partitions {
            return Ok(None);
        }
        st.current = Some(execute_node(&st.input, st.next_partition, &st.ctx)?);
        st.next_partition += 1;
    }
}

impl ExecNode for CoalescePartitionsExec {
    fn name(&self) -> &'static str {
        "CoalescePartitionsExec"
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

    fn execute(&self, _partition: usize, ctx: Arc<TaskContext>) -> Result<SendableRecordBatchStream> {
        let partitions = self.input.output_partitioning().partition_count();
        if partitions == 1 {
            return execute_node(&self.input, 0, &ctx);
        }
        if self.preserve_order {
            let state = ChainState {
                input: Arc::clone(&self.input),
                ctx,
                next_partition: 0,
                partitions,
                current: None,
            };
            return Ok(adapt_stream(
                self.schema(),
                futures::stream::try_unfold(state, next_chained),
            ));
        }

        let (tx, rx) = bounded_batch_channel(self.schema(), ctx.channel_capacity());
        for p in 0..partitions {
            let mut tx = tx.clone();
            let input = Arc::clone(&self.input);
            let task_ctx = Arc::clone(&ctx);
            ctx.spawn(async move {
                let mut stream = match execute_node(&input, p, &task_ctx) {
                    Ok(s) => s,
                    Err(e) => {
                        let _ = tx.send_error(e).await;
                        return;
                    }
                };
                while let Some(item) = stream.next().await {
                    let sent = match item {
                        Ok(batch) => tx.send_batch(batch).await,
                        Err(e) => {
                            let _ = tx.send_error(e).await;
                            return;
                        }
                    };
                    if sent.is_err() {
                        debug!(partition = p, "coalesce consumer dropped, stopping producer");
                        return;
                    }
                }
            })?;
        }
        Ok(rx)
    }

    fn metrics(&self) -> &OperatorMetrics {
        &self.metrics
    }

    fn details(&self) -> String {
        format!("preserve_order={}", self.preserve_order)
    }
}
