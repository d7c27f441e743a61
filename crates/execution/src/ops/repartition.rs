//! Repartitioning through a shared distribution gate.
//!
//! Every input partition gets one producer task. Producers route each batch
//! to output queues (round robin per batch, or by key hash). An output keeps
//! at most `channel_capacity` batches in memory, charged to the memory pool;
//! further batches for it go to an IPC spill file until the consumer catches
//! up. Producers wait only while *every* still-open output is at capacity, so
//! a consumer that drains partitions one at a time never deadlocks against
//! its own producers, and a slow output costs disk rather than memory.
//! Per-execution state is dropped when the execution's token stops.

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll, Waker};

use arrow::compute::take_record_batch;
use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use futures::{Stream, StreamExt};
use lfq_common::{ExecutionId, LfqError, MemoryReservation, Result};
use lfq_planner::Expr;
use tracing::debug;

use crate::context::TaskContext;
use crate::exec_node::{ExecNode, OutputPartitioning, execute_node};
use crate::expressions::{PhysicalExpr, compile_expr, evaluate_all};
use crate::hash_utils::{hash_rows, key_converter, partition_indices};
use crate::metrics::OperatorMetrics;
use crate::spill::SpillFile;
use crate::stream::{RecordBatchStream, SendableRecordBatchStream};

/// Target distribution of a [`RepartitionExec`].
pub enum RepartitionScheme {
    RoundRobin(usize),
    Hash {
        exprs: Vec<Expr>,
        compiled: Vec<Arc<dyn PhysicalExpr>>,
        partitions: usize,
    },
}

impl RepartitionScheme {
    pub fn hash(exprs: Vec<Expr>, partitions: usize, input_schema: &SchemaRef) -> Result<Self> {
        let compiled = exprs
            .iter()
            .map(|e| compile_expr(e, input_schema))
            .collect::<Result<Vec<_>>>()?;
        Ok(RepartitionScheme::Hash {
            exprs,
            compiled,
            partitions,
        })
    }

    fn partition_count(&self) -> usize {
        match self {
            RepartitionScheme::RoundRobin(n) => *n,
            RepartitionScheme::Hash { partitions, .. } => *partitions,
        }
    }
}

type Executions = Mutex<HashMap<ExecutionId, OpenExecution>>;

pub struct RepartitionExec {
    input: Arc<dyn ExecNode>,
    scheme: Arc<RepartitionScheme>,
    executions: Arc<Executions>,
    metrics: Arc<OperatorMetrics>,
}

struct OpenExecution {
    gate: Arc<Gate>,
    opened: usize,
}

impl RepartitionExec {
    pub fn try_new(input: Arc<dyn ExecNode>, scheme: RepartitionScheme) -> Result<Self> {
        if scheme.partition_count() == 0 {
            return Err(LfqError::Execution(
                "repartition needs at least one output partition".to_string(),
            ));
        }
        Ok(Self {
            input,
            scheme: Arc::new(scheme),
            executions: Arc::new(Mutex::new(HashMap::new())),
            metrics: Arc::new(OperatorMetrics::new()),
        })
    }

    /// Executions still holding a gate for outputs not yet opened.
    pub fn open_executions(&self) -> usize {
        self.executions
            .lock()
            .expect("repartition lock poisoned")
            .len()
    }

    /// Shared gate for `ctx`'s execution; starts producers on first use.
    fn gate_for(&self, ctx: &Arc<TaskContext>) -> Result<Arc<Gate>> {
        let outputs = self.scheme.partition_count();
        let mut executions = self.executions.lock().expect("repartition lock poisoned");
        let id = ctx.execution_id();
        let (gate, start) = match executions.get_mut(&id) {
            Some(open) => {
                open.opened += 1;
                (Arc::clone(&open.gate), false)
            }
            None => {
                let inputs = self.input.output_partitioning().partition_count();
                let reservation = ctx
                    .memory_pool()
                    .reservation(format!("RepartitionExec[{id}]"));
                let gate = Arc::new(Gate::new(outputs, inputs, ctx.channel_capacity(), reservation));
                executions.insert(
                    id,
                    OpenExecution {
                        gate: Arc::clone(&gate),
                        opened: 1,
                    },
                );
                (gate, true)
            }
        };
        if executions.get(&id).is_some_and(|o| o.opened >= outputs) {
            executions.remove(&id);
        }
        drop(executions);

        if start {
            let registry: Weak<Executions> = Arc::downgrade(&self.executions);
            let stopped_gate = Arc::downgrade(&gate);
            ctx.cancellation().on_stop(move || {
                if let Some(executions) = registry.upgrade() {
                    executions
                        .lock()
                        .expect("repartition lock poisoned")
                        .remove(&id);
                }
                if let Some(gate) = stopped_gate.upgrade() {
                    gate.shutdown();
                }
            });

            let inputs = self.input.output_partitioning().partition_count();
            debug!(execution_id = %id, inputs, outputs, "starting repartition producers");
            for p in 0..inputs {
                let producer = Producer {
                    input: Arc::clone(&self.input),
                    scheme: Arc::clone(&self.scheme),
                    gate: Arc::clone(&gate),
                    ctx: Arc::clone(ctx),
                    metrics: Arc::clone(&self.metrics),
                    input_partition: p,
                };
                ctx.spawn(producer.run())?;
            }
        }
        Ok(gate)
    }
}

impl ExecNode for RepartitionExec {
    fn name(&self) -> &'static str {
        "RepartitionExec"
    }

    fn schema(&self) -> SchemaRef {
        self.input.schema()
    }

    fn output_partitioning(&self) -> OutputPartitioning {
        match self.scheme.as_ref() {
            RepartitionScheme::RoundRobin(n) => OutputPartitioning::RoundRobin(*n),
            RepartitionScheme::Hash {
                exprs, partitions, ..
            } => OutputPartitioning::Hash(exprs.clone(), *partitions),
        }
    }

    fn children(&self) -> Vec<Arc<dyn ExecNode>> {
        vec![Arc::clone(&self.input)]
    }

    fn execute(&self, partition: usize, ctx: Arc<TaskContext>) -> Result<SendableRecordBatchStream> {
        let gate = self.gate_for(&ctx)?;
        Ok(Box::pin(GateStream {
            gate,
            partition,
            schema: self.schema(),
        }))
    }

    fn metrics(&self) -> &OperatorMetrics {
        &self.metrics
    }

    fn details(&self) -> String {
        match self.scheme.as_ref() {
            RepartitionScheme::RoundRobin(n) => format!("round_robin={n}"),
            RepartitionScheme::Hash {
                exprs, partitions, ..
            } => format!(
                "hash=[{}] partitions={partitions}",
                exprs
                    .iter()
                    .map(|e| e.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        }
    }
}

enum Queued {
    Batch { batch: RecordBatch, bytes: usize },
    Spilled(SpillFile),
    Failed(LfqError),
}

struct Gate {
    state: Mutex<GateState>,
    capacity: usize,
}

struct GateState {
    queues: Vec<VecDeque<Queued>>,
    /// In-memory batches per output; spilled entries do not count.
    in_memory: Vec<usize>,
    open: Vec<bool>,
    consumer_wakers: Vec<Option<Waker>>,
    producer_wakers: Vec<Waker>,
    live_producers: usize,
    reservation: MemoryReservation,
}

impl GateState {
    fn has_room(&self, output: usize, capacity: usize) -> bool {
        self.open[output] && self.in_memory[output] < capacity
    }

    fn wake_consumer(&mut self, output: usize) {
        if let Some(w) = self.consumer_wakers[output].take() {
            w.wake();
        }
    }

    fn wake_producers(&mut self) {
        for w in self.producer_wakers.drain(..) {
            w.wake();
        }
    }
}

impl Gate {
    fn new(outputs: usize, producers: usize, capacity: usize, reservation: MemoryReservation) -> Self {
        Self {
            state: Mutex::new(GateState {
                queues: (0..outputs).map(|_| VecDeque::new()).collect(),
                in_memory: vec![0; outputs],
                open: vec![true; outputs],
                consumer_wakers: vec![None; outputs],
                producer_wakers: Vec::new(),
                live_producers: producers,
                reservation,
            }),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().expect("repartition gate poisoned")
    }

    /// Ready(true) when some open output has room, Ready(false) when no
    /// output is open anymore.
    fn poll_room(&self, cx: &mut Context<'_>) -> Poll<bool> {
        let mut st = self.lock();
        if !st.open.iter().any(|o| *o) {
            return Poll::Ready(false);
        }
        if (0..st.queues.len()).any(|o| st.has_room(o, self.capacity)) {
            Poll::Ready(true)
        } else {
            if !st.producer_wakers.iter().any(|w| w.will_wake(cx.waker())) {
                st.producer_wakers.push(cx.waker().clone());
            }
            Poll::Pending
        }
    }

    /// First output at or after `start` with in-memory room, for round robin.
    fn next_with_room(&self, start: usize) -> usize {
        let st = self.lock();
        let n = st.queues.len();
        (0..n)
            .map(|i| (start + i) % n)
            .find(|&o| st.has_room(o, self.capacity))
            .unwrap_or(start)
    }

    /// Queue `batch` in memory when `output` is under capacity and the pool
    /// grants its bytes; otherwise hand it back to be spilled.
    fn try_push(&self, output: usize, batch: RecordBatch) -> Option<RecordBatch> {
        let mut st = self.lock();
        if !st.open[output] {
            return None;
        }
        let bytes = batch.get_array_memory_size();
        if !st.has_room(output, self.capacity) || st.reservation.try_grow(bytes).is_err() {
            return Some(batch);
        }
        st.in_memory[output] += 1;
        st.queues[output].push_back(Queued::Batch { batch, bytes });
        st.wake_consumer(output);
        None
    }

    fn push_spilled(&self, output: usize, file: SpillFile) {
        let mut st = self.lock();
        if st.open[output] {
            st.queues[output].push_back(Queued::Spilled(file));
            st.wake_consumer(output);
        }
    }

    fn push_error(&self, err: &LfqError) {
        let mut st = self.lock();
        for o in 0..st.queues.len() {
            if st.open[o] {
                st.queues[o].push_back(Queued::Failed(err.duplicate()));
                st.wake_consumer(o);
            }
        }
    }

    fn producer_done(&self) {
        let mut st = self.lock();
        st.live_producers = st.live_producers.saturating_sub(1);
        if st.live_producers == 0 {
            for w in st.consumer_wakers.iter_mut().filter_map(Option::take) {
                w.wake();
            }
        }
    }

    /// Stop accepting batches for `output` and drop what it still queues.
    fn close(&self, output: usize) {
        let mut st = self.lock();
        st.open[output] = false;
        let dropped = std::mem::take(&mut st.queues[output]);
        let bytes: usize = dropped
            .iter()
            .map(|q| match q {
                Queued::Batch { bytes, .. } => *bytes,
                _ => 0,
            })
            .sum();
        st.reservation.shrink(bytes);
        st.in_memory[output] = 0;
        st.wake_producers();
        drop(st);
        drop(dropped);
    }

    fn shutdown(&self) {
        let outputs = self.lock().queues.len();
        for o in 0..outputs {
            self.close(o);
        }
    }
}

struct Producer {
    input: Arc<dyn ExecNode>,
    scheme: Arc<RepartitionScheme>,
    gate: Arc<Gate>,
    ctx: Arc<TaskContext>,
    metrics: Arc<OperatorMetrics>,
    input_partition: usize,
}

/// Decrements the live producer count however the producer exits.
struct ProducerGuard(Arc<Gate>);

impl Drop for ProducerGuard {
    fn drop(&mut self) {
        self.0.producer_done();
    }
}

impl Producer {
    async fn run(self) {
        let _guard = ProducerGuard(Arc::clone(&self.gate));
        if let Err(e) = self.pump().await {
            self.gate.push_error(&e);
        }
    }

    async fn pump(&self) -> Result<()> {
        let outputs = self.scheme.partition_count();
        let mut next_output = self.input_partition % outputs;
        let mut stream = execute_node(&self.input, self.input_partition, &self.ctx)?;
        while let Some(batch) = stream.next().await.transpose()? {
            let has_room = futures::future::poll_fn(|cx| {
                let token = self.ctx.cancellation();
                if token.should_stop() {
                    return Poll::Ready(false);
                }
                token.register_waker(cx.waker());
                self.gate.poll_room(cx)
            })
            .await;
            if !has_room {
                debug!(partition = self.input_partition, "repartition producer stopping");
                return Ok(());
            }
            match self.scheme.as_ref() {
                RepartitionScheme::RoundRobin(_) => {
                    if batch.num_rows() > 0 {
                        let output = self.gate.next_with_room(next_output);
                        self.route(output, batch)?;
                        next_output = (output + 1) % outputs;
                    }
                }
                RepartitionScheme::Hash { compiled, .. } => {
                    let keys = evaluate_all(compiled, &batch)?;
                    let types = keys.iter().map(|k| k.data_type().clone()).collect::<Vec<_>>();
                    let rows = key_converter(&types)?.convert_columns(&keys)?;
                    let hashes = hash_rows(self.ctx.hash_seed(), &rows);
                    for (output, idx) in partition_indices(&hashes, outputs).iter().enumerate() {
                        if !idx.is_empty() {
                            self.route(output, take_record_batch(&batch, idx)?)?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Hand `batch` to `output`, spilling it when the output has no room.
    fn route(&self, output: usize, batch: RecordBatch) -> Result<()> {
        let Some(batch) = self.gate.try_push(output, batch) else {
            return Ok(());
        };
        let tag = format!("repartition-{}", self.ctx.execution_id());
        let file = SpillFile::write(
            &self.ctx.spill_dir(),
            &tag,
            &batch.schema(),
            std::slice::from_ref(&batch),
        )?;
        self.metrics.record_spill(file.bytes());
        self.ctx.metrics().record_spill(
            &self.ctx.execution_id().to_string(),
            "RepartitionExec",
            file.bytes(),
        );
        self.gate.push_spilled(output, file);
        Ok(())
    }
}

/// Consumer side of one output partition.
struct GateStream {
    gate: Arc<Gate>,
    partition: usize,
    schema: SchemaRef,
}

fn read_spilled(file: SpillFile) -> Result<RecordBatch> {
    file.into_batches()?.next().unwrap_or_else(|| {
        Err(LfqError::Execution(
            "repartition spill file holds no batch".to_string(),
        ))
    })
}

impl Stream for GateStream {
    type Item = Result<RecordBatch>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let p = self.partition;
        let mut st = self.gate.lock();
        let next = st.queues[p].pop_front();
        match next {
            Some(Queued::Batch { batch, bytes }) => {
                st.in_memory[p] -= 1;
                st.reservation.shrink(bytes);
                st.wake_producers();
                Poll::Ready(Some(Ok(batch)))
            }
            Some(Queued::Spilled(file)) => {
                drop(st);
                Poll::Ready(Some(read_spilled(file)))
            }
            Some(Queued::Failed(e)) => Poll::Ready(Some(Err(e))),
            None if st.live_producers == 0 => Poll::Ready(None),
            None => {
                st.consumer_wakers[p] = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

impl RecordBatchStream for GateStream {
    fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }
}

impl Drop for GateStream {
    fn drop(&mut self) {
        self.gate.close(self.partition);
    }
}
