//! Stable sort with external spilling, and the k-way merge shared with
//! [`SortPreservingMergeExec`].
//!
//! A partition buffers input while its memory reservation can grow. When the
//! pool refuses, the buffer is sorted and written to `spill_dir` as an IPC
//! run, the reservation is released, and buffering continues. At end of input
//! the runs (plus whatever is still buffered) are merged. Ties keep input
//! order: runs hold consecutive input ranges and the merge prefers the
//! earlier run on equal keys.

use std::sync::Arc;

use arrow::array::{ArrayRef, UInt32Array};
use arrow::compute::{concat_batches, interleave, take_record_batch};
use arrow::record_batch::{RecordBatch, RecordBatchOptions};
use arrow::row::{RowConverter, Rows};
use arrow_schema::SchemaRef;
use futures::{StreamExt, TryStreamExt};
use lfq_common::{MemoryReservation, Result};
use lfq_planner::SortExpr;
use tracing::debug;

use crate::context::TaskContext;
use crate::exec_node::{ExecNode, OutputPartitioning, execute_node};
use crate::expressions::{PhysicalSortExpr, compile_sort_exprs};
use crate::hash_utils::sort_converter;
use crate::metrics::OperatorMetrics;
use crate::spill::SpillFile;
use crate::stream::{SendableRecordBatchStream, adapt_stream, memory_stream};

fn fmt_sort_exprs(exprs: &[SortExpr]) -> String {
    exprs
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Row converter matching the key types and directions of `exprs`.
pub fn converter_for(exprs: &[PhysicalSortExpr]) -> Result<RowConverter> {
    let types = exprs.iter().map(|e| e.expr.data_type()).collect::<Vec<_>>();
    let options = exprs.iter().map(|e| e.options).collect::<Vec<_>>();
    sort_converter(&types, &options)
}

/// Encode the sort keys of `batch`.
pub fn sort_key_rows(
    converter: &RowConverter,
    exprs: &[PhysicalSortExpr],
    batch: &RecordBatch,
) -> Result<Rows> {
    let keys = exprs
        .iter()
        .map(|e| e.expr.evaluate(batch))
        .collect::<Result<Vec<ArrayRef>>>()?;
    Ok(converter.convert_columns(&keys)?)
}

/// Sort `batches` as one sequence and re-chunk into `batch_size` rows.
pub fn sort_batches(
    schema: &SchemaRef,
    exprs: &[PhysicalSortExpr],
    batches: &[RecordBatch],
    batch_size: usize,
) -> Result<Vec<RecordBatch>> {
    let all = concat_batches(schema, batches)?;
    if all.num_rows() == 0 {
        return Ok(vec![]);
    }
    let converter = converter_for(exprs)?;
    let rows = sort_key_rows(&converter, exprs, &all)?;
    let mut order: Vec<u32> = (0..all.num_rows() as u32).collect();
    order.sort_by(|a, b| rows.row(*a as usize).cmp(&rows.row(*b as usize)));
    let sorted = take_record_batch(&all, &UInt32Array::from(order))?;
    Ok(chunk(sorted, batch_size))
}

fn chunk(batch: RecordBatch, batch_size: usize) -> Vec<RecordBatch> {
    let n = batch.num_rows();
    (0..n)
        .step_by(batch_size.max(1))
        .map(|off| batch.slice(off, batch_size.min(n - off)))
        .collect()
}

/// Per-partition sort; output partitioning equals the input's.
pub struct SortExec {
    input: Arc<dyn ExecNode>,
    exprs: Vec<SortExpr>,
    compiled: Arc<Vec<PhysicalSortExpr>>,
    metrics: Arc<OperatorMetrics>,
}

impl SortExec {
    pub fn try_new(input: Arc<dyn ExecNode>, exprs: Vec<SortExpr>) -> Result<Self> {
        let compiled = compile_sort_exprs(&exprs, &input.schema())?;
        Ok(Self {
            input,
            exprs,
            compiled: Arc::new(compiled),
            metrics: Arc::new(OperatorMetrics::new()),
        })
    }
}

struct ExternalSorter {
    schema: SchemaRef,
    exprs: Arc<Vec<PhysicalSortExpr>>,
    ctx: Arc<TaskContext>,
    metrics: Arc<OperatorMetrics>,
    reservation: MemoryReservation,
    buffered: Vec<RecordBatch>,
    runs: Vec<SpillFile>,
}

impl ExternalSorter {
    async fn sort(mut self, mut input: SendableRecordBatchStream) -> Result<SendableRecordBatchStream> {
        while let Some(batch) = input.next().await.transpose()? {
            if batch.num_rows() == 0 {
                continue;
            }
            let size = batch.get_array_memory_size();
            if self.reservation.try_grow(size).is_err() {
                if !self.buffered.is_empty() {
                    self.spill_buffered()?;
                }
                if self.reservation.try_grow(size).is_err() {
                    // Larger than the whole budget on its own.
                    let sorted = sort_batches(
                        &self.schema,
                        &self.exprs,
                        &[batch],
                        self.ctx.batch_size(),
                    )?;
                    self.write_run(&sorted)?;
                    continue;
                }
            }
            self.buffered.push(batch);
        }

        if self.runs.is_empty() {
            let sorted = sort_batches(
                &self.schema,
                &self.exprs,
                &self.buffered,
                self.ctx.batch_size(),
            )?;
            return Ok(memory_stream(Arc::clone(&self.schema), sorted));
        }
        if !self.buffered.is_empty() {
            self.spill_buffered()?;
        }
        debug!(runs = self.runs.len(), "merging sorted spill runs");
        let streams = std::mem::take(&mut self.runs)
            .into_iter()
            .map(|run| {
                let batches = run.into_batches()?;
                Ok(adapt_stream(
                    Arc::clone(&self.schema),
                    futures::stream::iter(batches),
                ))
            })
            .collect::<Result<Vec<_>>>()?;
        merge_streams(
            Arc::clone(&self.schema),
            streams,
            Arc::clone(&self.exprs),
            self.ctx.batch_size(),
        )
    }

    fn spill_buffered(&mut self) -> Result<()> {
        let buffered = std::mem::take(&mut self.buffered);
        let sorted = sort_batches(&self.schema, &self.exprs, &buffered, self.ctx.batch_size())?;
        drop(buffered);
        self.write_run(&sorted)?;
        self.reservation.free();
        Ok(())
    }

    fn write_run(&mut self, sorted: &[RecordBatch]) -> Result<()> {
        let tag = format!("sort-{}", self.ctx.execution_id());
        let run = SpillFile::write(&self.ctx.spill_dir(), &tag, &self.schema, sorted)?;
        self.metrics.record_spill(run.bytes());
        self.ctx.metrics().record_spill(
            &self.ctx.execution_id().to_string(),
            "SortExec",
            run.bytes(),
        );
        self.runs.push(run);
        Ok(())
    }
}

impl ExecNode for SortExec {
    fn name(&self) -> &'static str {
        "SortExec"
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
        let sorter = ExternalSorter {
            schema: self.schema(),
            exprs: Arc::clone(&self.compiled),
            reservation: ctx
                .memory_pool()
                .reservation(format!("SortExec[{partition}]")),
            ctx,
            metrics: Arc::clone(&self.metrics),
            buffered: Vec::new(),
            runs: Vec::new(),
        };
        let out = futures::stream::once(sorter.sort(input)).try_flatten();
        Ok(adapt_stream(self.schema(), out))
    }

    fn metrics(&self) -> &OperatorMetrics {
        &self.metrics
    }

    fn details(&self) -> String {
        fmt_sort_exprs(&self.exprs)
    }
}

struct Cursor {
    batch_idx: usize,
    rows: Rows,
    pos: usize,
}

struct MergeState {
    schema: SchemaRef,
    inputs: Vec<SendableRecordBatchStream>,
    exhausted: Vec<bool>,
    cursors: Vec<Option<Cursor>>,
    exprs: Arc<Vec<PhysicalSortExpr>>,
    converter: RowConverter,
    batches: Vec<RecordBatch>,
    pending: Vec<(usize, usize)>,
    batch_size: usize,
}

impl MergeState {
    async fn fill(&mut self) -> Result<()> {
        for i in 0..self.inputs.len() {
            while self.cursors[i].is_none() && !self.exhausted[i] {
                match self.inputs[i].next().await.transpose()? {
                    Some(b) if b.num_rows() == 0 => {}
                    Some(b) => {
                        let rows = sort_key_rows(&self.converter, &self.exprs, &b)?;
                        self.batches.push(b);
                        self.cursors[i] = Some(Cursor {
                            batch_idx: self.batches.len() - 1,
                            rows,
                            pos: 0,
                        });
                    }
                    None => self.exhausted[i] = true,
                }
            }
        }
        Ok(())
    }

    /// Index of the input holding the smallest current row; earlier inputs win ties.
    fn smallest(&self) -> Option<usize> {
        let mut best: Option<(usize, &Cursor)> = None;
        for (i, c) in self.cursors.iter().enumerate() {
            let Some(c) = c else { continue };
            match best {
                Some((_, b)) if c.rows.row(c.pos) >= b.rows.row(b.pos) => {}
                _ => best = Some((i, c)),
            }
        }
        best.map(|(i, _)| i)
    }

    fn flush(&mut self) -> Result<RecordBatch> {
        let num_rows = self.pending.len();
        let columns = (0..self.schema.fields().len())
            .map(|c| {
                let arrays = self
                    .batches
                    .iter()
                    .map(|b| b.column(c).as_ref())
                    .collect::<Vec<_>>();
                interleave(&arrays, &self.pending)
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;
        self.pending.clear();

        // Keep only batches still under a cursor.
        let mut kept = Vec::new();
        for c in self.cursors.iter_mut().flatten() {
            kept.push(self.batches[c.batch_idx].clone());
            c.batch_idx = kept.len() - 1;
        }
        self.batches = kept;

        let options = RecordBatchOptions::new().with_row_count(Some(num_rows));
        Ok(RecordBatch::try_new_with_options(
            Arc::clone(&self.schema),
            columns,
            &options,
        )?)
    }
}

async fn next_merged(mut st: MergeState) -> Result<Option<(RecordBatch, MergeState)>> {
    loop {
        st.fill().await?;
        let Some(i) = st.smallest() else {
            if st.pending.is_empty() {
                return Ok(None);
            }
            let out = st.flush()?;
            return Ok(Some((out, st)));
        };
        let Some(c) = st.cursors[i].as_mut() else {
            continue;
        };
        st.pending.push((c.batch_idx, c.pos));
        c.pos += 1;
        if c.pos == c.rows.num_rows() {
            st.cursors[i] = None;
        }
        if st.pending.len() >= st.batch_size {
            let out = st.flush()?;
            return Ok(Some((out, st)));
        }
    }
}

/// Merge streams that are each sorted on `exprs` into one sorted stream.
pub fn merge_streams(
    schema: SchemaRef,
    inputs: Vec<SendableRecordBatchStream>,
    exprs: Arc<Vec<PhysicalSortExpr>>,
    batch_size: usize,
) -> Result<SendableRecordBatchStream> {
    let n = inputs.len();
    let state = MergeState {
        schema: Arc::clone(&schema),
        inputs,
        exhausted: vec![false; n],
        cursors: (0..n).map(|_| None).collect(),
        converter: converter_for(&exprs)?,
        exprs,
        batches: Vec::new(),
        pending: Vec::new(),
        batch_size: batch_size.max(1),
    };
    Ok(adapt_stream(
        schema,
        futures::stream::try_unfold(state, next_merged),
    ))
}

/// Merges sorted partitions into a single sorted partition.
pub struct SortPreservingMergeExec {
    input: Arc<dyn ExecNode>,
    exprs: Vec<SortExpr>,
    compiled: Arc<Vec<PhysicalSortExpr>>,
    metrics: OperatorMetrics,
}

impl SortPreservingMergeExec {
    pub fn try_new(input: Arc<dyn ExecNode>, exprs: Vec<SortExpr>) -> Result<Self> {
        let compiled = compile_sort_exprs(&exprs, &input.schema())?;
        Ok(Self {
            input,
            exprs,
            compiled: Arc::new(compiled),
            metrics: OperatorMetrics::new(),
        })
    }
}

impl ExecNode for SortPreservingMergeExec {
    fn name(&self) -> &'static str {
        "SortPreservingMergeExec"
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
        let n = self.input.output_partitioning().partition_count();
        if n == 1 {
            return execute_node(&self.input, 0, &ctx);
        }
        let inputs = (0..n)
            .map(|p| execute_node(&self.input, p, &ctx))
            .collect::<Result<Vec<_>>>()?;
        merge_streams(
            self.schema(),
            inputs,
            Arc::clone(&self.compiled),
            ctx.batch_size(),
        )
    }

    fn metrics(&self) -> &OperatorMetrics {
        &self.metrics
    }

    fn details(&self) -> String {
        fmt_sort_exprs(&self.exprs)
    }
}
