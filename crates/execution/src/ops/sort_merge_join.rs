//! Sort-merge join over inputs sorted ascending (nulls first) on their keys.
//!
//! Both sides are read one key group at a time, so memory is bounded by the
//! largest group rather than the whole build side.

use std::cmp::Ordering;
use std::sync::Arc;

use arrow::array::UInt32Array;
use arrow::compute::concat_batches;
use arrow::compute::SortOptions;
use arrow::record_batch::RecordBatch;
use arrow::row::{RowConverter, Rows};
use arrow_schema::SchemaRef;
use futures::StreamExt;
use lfq_common::{LfqError, Result};
use lfq_planner::{Expr, JoinType};

use crate::context::TaskContext;
use crate::exec_node::{ExecNode, OutputPartitioning, execute_node};
use crate::expressions::{PhysicalExpr, evaluate_all};
use crate::hash_utils::{sort_converter, valid_key_rows};
use crate::metrics::OperatorMetrics;
use crate::ops::join_utils::{JoinParams, OutputBuffer, indices_where};
use crate::stream::{SendableRecordBatchStream, adapt_stream};

pub struct SortMergeJoinExec {
    left: Arc<dyn ExecNode>,
    right: Arc<dyn ExecNode>,
    params: Arc<JoinParams>,
    metrics: OperatorMetrics,
}

impl SortMergeJoinExec {
    /// Inputs must be co-partitioned on the keys and sorted on them within
    /// each partition.
    pub fn try_new(
        left: Arc<dyn ExecNode>,
        right: Arc<dyn ExecNode>,
        on: Vec<(Expr, Expr)>,
        filter: Option<Expr>,
        join_type: JoinType,
        schema: SchemaRef,
    ) -> Result<Self> {
        if on.is_empty() {
            return Err(LfqError::Execution(
                "sort-merge join requires at least one key pair".to_string(),
            ));
        }
        let (lp, rp) = (
            left.output_partitioning().partition_count(),
            right.output_partitioning().partition_count(),
        );
        if lp != rp {
            return Err(LfqError::Execution(format!(
                "sort-merge join inputs have {lp} and {rp} partitions"
            )));
        }
        let params = JoinParams::try_new(left.schema(), right.schema(), on, filter, join_type, schema)?;
        Ok(Self {
            left,
            right,
            params: Arc::new(params),
            metrics: OperatorMetrics::new(),
        })
    }
}

/// All consecutive rows of one side sharing a key.
struct KeyGroup {
    key: Box<[u8]>,
    valid: bool,
    batch: RecordBatch,
}

struct SideCursor {
    schema: SchemaRef,
    keys: Vec<Arc<dyn PhysicalExpr>>,
    converter: RowConverter,
    stream: SendableRecordBatchStream,
    current: Option<(RecordBatch, Rows, Vec<bool>)>,
    pos: usize,
}

impl SideCursor {
    fn new(
        schema: SchemaRef,
        keys: Vec<Arc<dyn PhysicalExpr>>,
        converter: RowConverter,
        stream: SendableRecordBatchStream,
    ) -> Self {
        Self {
            schema,
            keys,
            converter,
            stream,
            current: None,
            pos: 0,
        }
    }

    /// Pull the next input batch; `false` once the input is exhausted.
    async fn load(&mut self) -> Result<bool> {
        match self.stream.next().await.transpose()? {
            Some(batch) => {
                let key_cols = evaluate_all(&self.keys, &batch)?;
                let rows = self.converter.convert_columns(&key_cols)?;
                let valid = valid_key_rows(&key_cols, batch.num_rows());
                self.current = Some((batch, rows, valid));
                self.pos = 0;
                Ok(true)
            }
            None => {
                self.current = None;
                Ok(false)
            }
        }
    }

    fn remaining(&self) -> usize {
        self.current
            .as_ref()
            .map_or(0, |(b, _, _)| b.num_rows() - self.pos)
    }

    async fn next_group(&mut self) -> Result<Option<KeyGroup>> {
        while self.remaining() == 0 {
            if !self.load().await? {
                return Ok(None);
            }
        }
        let Some((_, rows, valid)) = &self.current else {
            return Ok(None);
        };
        let key: Box<[u8]> = rows.row(self.pos).as_ref().into();
        let valid = valid[self.pos];
        let mut parts = Vec::new();
        loop {
            let Some((batch, rows, _)) = &self.current else {
                break;
            };
            let start = self.pos;
            let n = batch.num_rows();
            let mut end = start;
            while end < n && rows.row(end).as_ref() == key.as_ref() {
                end += 1;
            }
            if end > start {
                parts.push(batch.slice(start, end - start));
            }
            self.pos = end;
            if end < n || !self.load().await? {
                break;
            }
        }
        let batch = concat_batches(&self.schema, &parts)?;
        Ok(Some(KeyGroup { key, valid, batch }))
    }
}

struct MergeJoinState {
    params: Arc<JoinParams>,
    left: SideCursor,
    right: SideCursor,
    left_group: Option<KeyGroup>,
    right_group: Option<KeyGroup>,
    started: bool,
    out: OutputBuffer,
    done: bool,
}

impl MergeJoinState {
    fn emit_left_unmatched(&mut self, group: &KeyGroup) -> Result<()> {
        let jt = self.params.join_type;
        if jt.preserves_left() || jt == JoinType::Anti {
            let idx = UInt32Array::from_iter_values(0..group.batch.num_rows() as u32);
            self.out.push(self.params.left_only(&group.batch, &idx)?)?;
        }
        Ok(())
    }

    fn emit_right_unmatched(&mut self, group: &KeyGroup) -> Result<()> {
        if self.params.join_type.preserves_right() {
            let idx = UInt32Array::from_iter_values(0..group.batch.num_rows() as u32);
            self.out.push(self.params.right_only(&group.batch, &idx)?)?;
        }
        Ok(())
    }

    fn join_groups(&mut self, l: &KeyGroup, r: &KeyGroup) -> Result<()> {
        let (ln, rn) = (l.batch.num_rows() as u32, r.batch.num_rows() as u32);
        let li = UInt32Array::from_iter_values((0..ln).flat_map(|i| std::iter::repeat(i).take(rn as usize)));
        let ri = UInt32Array::from_iter_values((0..ln).flat_map(|_| 0..rn));
        let (li, ri) = self.params.apply_filter(&l.batch, li, &r.batch, ri)?;
        let mut left_matched = vec![false; ln as usize];
        let mut right_matched = vec![false; rn as usize];
        for i in li.values() {
            left_matched[*i as usize] = true;
        }
        for i in ri.values() {
            right_matched[*i as usize] = true;
        }
        let jt = self.params.join_type;
        match jt {
            JoinType::Semi | JoinType::Anti => {
                let keep = indices_where(&left_matched, jt == JoinType::Semi);
                self.out.push(self.params.left_only(&l.batch, &keep)?)?;
            }
            _ => {
                self.out.push(self.params.output(&l.batch, &li, &r.batch, &ri)?)?;
                if jt.preserves_left() {
                    let idx = indices_where(&left_matched, false);
                    self.out.push(self.params.left_only(&l.batch, &idx)?)?;
                }
                if jt.preserves_right() {
                    let idx = indices_where(&right_matched, false);
                    self.out.push(self.params.right_only(&r.batch, &idx)?)?;
                }
            }
        }
        Ok(())
    }

    /// Advance the merge by one group comparison.
    async fn step(&mut self) -> Result<()> {
        if !self.started {
            self.started = true;
            self.left_group = self.left.next_group().await?;
            self.right_group = self.right.next_group().await?;
        }
        match (self.left_group.take(), self.right_group.take()) {
            (None, None) => {
                self.done = true;
                self.out.flush()?;
            }
            (Some(l), None) => {
                self.emit_left_unmatched(&l)?;
                self.left_group = self.left.next_group().await?;
            }
            (None, Some(r)) => {
                self.emit_right_unmatched(&r)?;
                self.right_group = self.right.next_group().await?;
            }
            (Some(l), Some(r)) => {
                let order = if !l.valid {
                    Ordering::Less
                } else if !r.valid {
                    Ordering::Greater
                } else {
                    l.key.as_ref().cmp(r.key.as_ref())
                };
                match order {
                    Ordering::Less => {
                        self.emit_left_unmatched(&l)?;
                        self.right_group = Some(r);
                        self.left_group = self.left.next_group().await?;
                    }
                    Ordering::Greater => {
                        self.emit_right_unmatched(&r)?;
                        self.left_group = Some(l);
                        self.right_group = self.right.next_group().await?;
                    }
                    Ordering::Equal => {
                        self.join_groups(&l, &r)?;
                        self.left_group = self.left.next_group().await?;
                        self.right_group = self.right.next_group().await?;
                    }
                }
            }
        }
        Ok(())
    }
}

async fn next_merged(mut st: MergeJoinState) -> Result<Option<(RecordBatch, MergeJoinState)>> {
    loop {
        if let Some(batch) = st.out.pop() {
            return Ok(Some((batch, st)));
        }
        if st.done {
            return Ok(None);
        }
        st.step().await?;
    }
}

impl ExecNode for SortMergeJoinExec {
    fn name(&self) -> &'static str {
        "SortMergeJoinExec"
    }

    fn schema(&self) -> SchemaRef {
        Arc::clone(&self.params.schema)
    }

    fn output_partitioning(&self) -> OutputPartitioning {
        OutputPartitioning::Unknown(self.left.output_partitioning().partition_count())
    }

    fn children(&self) -> Vec<Arc<dyn ExecNode>> {
        vec![Arc::clone(&self.left), Arc::clone(&self.right)]
    }

    fn execute(&self, partition: usize, ctx: Arc<TaskContext>) -> Result<SendableRecordBatchStream> {
        let options = vec![
            SortOptions {
                descending: false,
                nulls_first: true,
            };
            self.params.key_types.len()
        ];
        let cursor = |node: &Arc<dyn ExecNode>, keys: &[Arc<dyn PhysicalExpr>]| -> Result<SideCursor> {
            Ok(SideCursor::new(
                node.schema(),
                keys.to_vec(),
                sort_converter(&self.params.key_types, &options)?,
                execute_node(node, partition, &ctx)?,
            ))
        };
        let state = MergeJoinState {
            left: cursor(&self.left, &self.params.left_keys)?,
            right: cursor(&self.right, &self.params.right_keys)?,
            params: Arc::clone(&self.params),
            left_group: None,
            right_group: None,
            started: false,
            out: OutputBuffer::new(self.schema(), ctx.batch_size()),
            done: false,
        };
        Ok(adapt_stream(
            self.schema(),
            futures::stream::try_unfold(state, next_merged),
        ))
    }

    fn metrics(&self) -> &OperatorMetrics {
        &self.metrics
    }

    fn details(&self) -> String {
        let keys = self
            .params
            .on
            .iter()
            .map(|(l, r)| format!("{l} = {r}"))
            .collect::<Vec<_>>()
            .join(", ");
        let mut s = format!("type={} on=[{keys}]", self.params.join_type);
        if let Some(f) = &self.params.filter_expr {
            s.push_str(&format!(" filter={f}"));
        }
        s
    }
}
