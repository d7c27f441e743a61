//! Grouped aggregation.
//!
//! [`HashAggregateExec`] keeps one accumulator set per distinct key in a hash
//! table and emits when its input ends; exceeding the memory budget fails the
//! query with `OutOfMemory`. [`SortAggregateExec`] expects input sorted on the
//! group keys and emits each group as soon as the key changes, so it runs in
//! constant memory. Both expect rows of one group to live in one partition.

use std::collections::HashMap;
use std::sync::Arc;

use arrow::array::ArrayRef;
use arrow::record_batch::{RecordBatch, RecordBatchOptions};
use arrow::row::RowConverter;
use arrow_schema::SchemaRef;
use futures::{StreamExt, TryStreamExt};
use lfq_common::{LfqError, MemoryReservation, Result};
use lfq_planner::{Expr, ScalarValue};

use crate::aggregates::{Accumulator, GroupedAccumulator, PhysicalAggregate};
use crate::context::TaskContext;
use crate::exec_node::{ExecNode, OutputPartitioning, execute_node};
use crate::expressions::{PhysicalExpr, compile_expr, evaluate_all};
use crate::hash_utils::key_converter;
use crate::metrics::OperatorMetrics;
use crate::stream::{SendableRecordBatchStream, adapt_stream, memory_stream};

/// Compiled group keys and aggregates shared by both strategies.
struct AggregateParts {
    group_exprs: Vec<Expr>,
    aggr_exprs: Vec<Expr>,
    groups: Vec<Arc<dyn PhysicalExpr>>,
    aggs: Vec<Arc<PhysicalAggregate>>,
    schema: SchemaRef,
}

impl AggregateParts {
    fn try_new(
        input_schema: &SchemaRef,
        group_exprs: Vec<Expr>,
        aggr_exprs: Vec<Expr>,
        schema: SchemaRef,
    ) -> Result<Self> {
        let groups = group_exprs
            .iter()
            .map(|e| compile_expr(e, input_schema))
            .collect::<Result<Vec<_>>>()?;
        let aggs = aggr_exprs
            .iter()
            .map(|e| PhysicalAggregate::try_new(e, input_schema).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            group_exprs,
            aggr_exprs,
            groups,
            aggs,
            schema,
        })
    }

    fn converter(&self) -> Result<RowConverter> {
        let types = self.groups.iter().map(|g| g.data_type()).collect::<Vec<_>>();
        key_converter(&types)
    }

    fn details(&self) -> String {
        let join = |v: &[Expr]| v.iter().map(|e| e.to_string()).collect::<Vec<_>>().join(", ");
        format!(
            "group_by=[{}] aggs=[{}]",
            join(&self.group_exprs),
            join(&self.aggr_exprs)
        )
    }

    /// Assemble one output batch from decoded keys and aggregate columns.
    fn output_batch(&self, mut key_cols: Vec<ArrayRef>, agg_cols: Vec<ArrayRef>, rows: usize) -> Result<RecordBatch> {
        key_cols.extend(agg_cols);
        let options = RecordBatchOptions::new().with_row_count(Some(rows));
        Ok(RecordBatch::try_new_with_options(
            Arc::clone(&self.schema),
            key_cols,
            &options,
        )?)
    }
}

pub struct HashAggregateExec {
    input: Arc<dyn ExecNode>,
    parts: Arc<AggregateParts>,
    metrics: OperatorMetrics,
}

impl HashAggregateExec {
    /// Without group keys the input must have a single partition.
    pub fn try_new(
        input: Arc<dyn ExecNode>,
        group_exprs: Vec<Expr>,
        aggr_exprs: Vec<Expr>,
        schema: SchemaRef,
    ) -> Result<Self> {
        if group_exprs.is_empty() && input.output_partitioning().partition_count() != 1 {
            return Err(LfqError::Execution(
                "global aggregation requires a single input partition".to_string(),
            ));
        }
        let parts = AggregateParts::try_new(&input.schema(), group_exprs, aggr_exprs, schema)?;
        Ok(Self {
            input,
            parts: Arc::new(parts),
            metrics: OperatorMetrics::new(),
        })
    }
}

async fn hash_aggregate(
    parts: Arc<AggregateParts>,
    mut input: SendableRecordBatchStream,
    mut reservation: MemoryReservation,
    batch_size: usize,
) -> Result<SendableRecordBatchStream> {
    let converter = parts.converter()?;
    let global = parts.groups.is_empty();
    let mut index: HashMap<Box<[u8]>, usize> = HashMap::new();
    let mut keys: Vec<Box<[u8]>> = Vec::new();
    let mut key_bytes = 0usize;
    let mut accs = parts
        .aggs
        .iter()
        .map(|a| GroupedAccumulator::new(Arc::clone(a)))
        .collect::<Vec<_>>();
    let mut num_groups = usize::from(global);

    while let Some(batch) = input.next().await.transpose()? {
        let group_indices = if global {
            vec![0; batch.num_rows()]
        } else {
            let rows = converter.convert_columns(&evaluate_all(&parts.groups, &batch)?)?;
            rows.iter()
                .map(|r| {
                    if let Some(g) = index.get(r.as_ref()) {
                        return *g;
                    }
                    let key: Box<[u8]> = r.as_ref().into();
                    key_bytes += 2 * key.len() + 48;
                    keys.push(key.clone());
                    index.insert(key, num_groups);
                    num_groups += 1;
                    num_groups - 1
                })
                .collect::<Vec<_>>()
        };
        for (acc, agg) in accs.iter_mut().zip(&parts.aggs) {
            acc.update(&agg.evaluate_args(&batch)?, &group_indices, num_groups)?;
        }
        let in_use = key_bytes + accs.iter().map(GroupedAccumulator::size).sum::<usize>();
        reservation.try_resize(in_use)?;
    }

    for acc in accs.iter_mut() {
        acc.update(&[], &[], num_groups)?;
    }
    let key_cols = if global {
        vec![]
    } else {
        let parser = converter.parser();
        converter.convert_rows(keys.iter().map(|k| parser.parse(k)))?
    };
    let agg_cols = accs
        .iter()
        .map(GroupedAccumulator::evaluate)
        .collect::<Result<Vec<_>>>()?;
    drop(index);
    let out = parts.output_batch(key_cols, agg_cols, num_groups)?;
    let n = out.num_rows();
    let chunks = (0..n)
        .step_by(batch_size)
        .map(|off| out.slice(off, batch_size.min(n - off)))
        .collect::<Vec<_>>();
    Ok(memory_stream(Arc::clone(&parts.schema), chunks))
}

impl ExecNode for HashAggregateExec {
    fn name(&self) -> &'static str {
        "HashAggregateExec"
    }

    fn schema(&self) -> SchemaRef {
        Arc::clone(&self.parts.schema)
    }

    fn output_partitioning(&self) -> OutputPartitioning {
        OutputPartitioning::Unknown(self.input.output_partitioning().partition_count())
    }

    fn children(&self) -> Vec<Arc<dyn ExecNode>> {
        vec![Arc::clone(&self.input)]
    }

    fn execute(&self, partition: usize, ctx: Arc<TaskContext>) -> Result<SendableRecordBatchStream> {
        let input = execute_node(&self.input, partition, &ctx)?;
        let reservation = ctx
            .memory_pool()
            .reservation(format!("HashAggregateExec[{partition}]"));
        let fut = hash_aggregate(
            Arc::clone(&self.parts),
            input,
            reservation,
            ctx.batch_size(),
        );
        Ok(adapt_stream(
            self.schema(),
            futures::stream::once(fut).try_flatten(),
        ))
    }

    fn metrics(&self) -> &OperatorMetrics {
        &self.metrics
    }

    fn details(&self) -> String {
        self.parts.details()
    }
}

/// Streaming aggregation over input sorted on the group keys.
pub struct SortAggregateExec {
    input: Arc<dyn ExecNode>,
    parts: Arc<AggregateParts>,
    metrics: OperatorMetrics,
}

impl SortAggregateExec {
    pub fn try_new(
        input: Arc<dyn ExecNode>,
        group_exprs: Vec<Expr>,
        aggr_exprs: Vec<Expr>,
        schema: SchemaRef,
    ) -> Result<Self> {
        if group_exprs.is_empty() {
            return Err(LfqError::Execution(
                "sort aggregation requires group keys".to_string(),
            ));
        }
        let parts = AggregateParts::try_new(&input.schema(), group_exprs, aggr_exprs, schema)?;
        Ok(Self {
            input,
            parts: Arc::new(parts),
            metrics: OperatorMetrics::new(),
        })
    }
}

struct SortedGroups {
    parts: Arc<AggregateParts>,
    input: SendableRecordBatchStream,
    converter: RowConverter,
    current_key: Option<Box<[u8]>>,
    current: Vec<Box<dyn Accumulator>>,
    done_keys: Vec<Box<[u8]>>,
    done_values: Vec<Vec<ScalarValue>>,
    batch_size: usize,
    finished: bool,
}

impl SortedGroups {
    fn close_group(&mut self) -> Result<()> {
        if let Some(key) = self.current_key.take() {
            for (vals, acc) in self.done_values.iter_mut().zip(&self.current) {
                vals.push(acc.evaluate()?);
            }
            self.done_keys.push(key);
        }
        Ok(())
    }

    fn open_group(&mut self, key: Box<[u8]>) -> Result<()> {
        self.current = self
            .parts
            .aggs
            .iter()
            .map(|a| a.create_accumulator())
            .collect::<Result<Vec<_>>>()?;
        self.current_key = Some(key);
        Ok(())
    }

    fn consume(&mut self, batch: &RecordBatch) -> Result<()> {
        let rows = self
            .converter
            .convert_columns(&evaluate_all(&self.parts.groups, batch)?)?;
        let args = self
            .parts
            .aggs
            .iter()
            .map(|a| a.evaluate_args(batch))
            .collect::<Result<Vec<_>>>()?;
        let n = batch.num_rows();
        let mut start = 0;
        while start < n {
            let key = rows.row(start);
            let mut end = start + 1;
            while end < n && rows.row(end) == key {
                end += 1;
            }
            if self.current_key.as_deref() != Some(key.as_ref()) {
                self.close_group()?;
                self.open_group(key.as_ref().into())?;
            }
            for (acc, values) in self.current.iter_mut().zip(&args) {
                let sliced = values
                    .iter()
                    .map(|v| v.slice(start, end - start))
                    .collect::<Vec<_>>();
                acc.update_batch(&sliced, end - start)?;
            }
            start = end;
        }
        Ok(())
    }

    fn emit(&mut self) -> Result<RecordBatch> {
        let keys = std::mem::take(&mut self.done_keys);
        let parser = self.converter.parser();
        let key_cols = self
            .converter
            .convert_rows(keys.iter().map(|k| parser.parse(k)))?;
        let agg_cols = self
            .done_values
            .iter_mut()
            .zip(&self.parts.aggs)
            .map(|(vals, agg)| ScalarValue::iter_to_array(std::mem::take(vals), &agg.return_type))
            .collect::<Result<Vec<_>>>()?;
        self.parts.output_batch(key_cols, agg_cols, keys.len())
    }
}

async fn next_sorted_groups(mut st: SortedGroups) -> Result<Option<(RecordBatch, SortedGroups)>> {
    while !st.finished {
        match st.input.next().await.transpose()? {
            Some(batch) => {
                st.consume(&batch)?;
                if st.done_keys.len() >= st.batch_size {
                    let out = st.emit()?;
                    return Ok(Some((out, st)));
                }
            }
            None => {
                st.finished = true;
                st.close_group()?;
            }
        }
    }
    if st.done_keys.is_empty() {
        return Ok(None);
    }
    let out = st.emit()?;
    Ok(Some((out, st)))
}

impl ExecNode for SortAggregateExec {
    fn name(&self) -> &'static str {
        "SortAggregateExec"
    }

    fn schema(&self) -> SchemaRef {
        Arc::clone(&self.parts.schema)
    }

    fn output_partitioning(&self) -> OutputPartitioning {
        OutputPartitioning::Unknown(self.input.output_partitioning().partition_count())
    }

    fn children(&self) -> Vec<Arc<dyn ExecNode>> {
        vec![Arc::clone(&self.input)]
    }

    fn execute(&self, partition: usize, ctx: Arc<TaskContext>) -> Result<SendableRecordBatchStream> {
        let input = execute_node(&self.input, partition, &ctx)?;
        let state = SortedGroups {
            converter: self.parts.converter()?,
            parts: Arc::clone(&self.parts),
            input,
            current_key: None,
            current: Vec::new(),
            done_keys: Vec::new(),
            done_values: vec![Vec::new(); self.parts.aggs.len()],
            batch_size: ctx.batch_size(),
            finished: false,
        };
        Ok(adapt_stream(
            self.schema(),
            futures::stream::try_unfold(state, next_sorted_groups),
        ))
    }

    fn metrics(&self) -> &OperatorMetrics {
        &self.metrics
    }

    fn details(&self) -> String {
        self.parts.details()
    }
}
