//! Window functions over fully buffered partitions.
//!
//! A partition of this operator must hold every row of each window
//! partition it sees; the physical planner hash-partitions on the shared
//! `PARTITION BY` keys or coalesces to one partition. Rows keep their input
//! order and gain one column per window expression.
//!
//! With an `ORDER BY`, aggregates are cumulative up to and including the
//! current row's peers; without one they cover the whole window partition.

use std::sync::Arc;

use arrow::array::{ArrayRef, UInt32Array, UInt64Array};
use arrow::compute::{concat_batches, take};
use arrow::record_batch::{RecordBatch, RecordBatchOptions};
use arrow::row::RowConverter;
use arrow_schema::SchemaRef;
use futures::{StreamExt, TryStreamExt};
use lfq_common::{LfqError, MemoryReservation, Result};
use lfq_planner::{Expr, ScalarValue, WindowFunction};

use crate::aggregates::PhysicalAggregate;
use crate::context::TaskContext;
use crate::exec_node::{ExecNode, OutputPartitioning, execute_node};
use crate::expressions::{PhysicalExpr, PhysicalSortExpr, compile_expr, compile_sort_exprs, evaluate_all};
use crate::hash_utils::key_converter;
use crate::metrics::OperatorMetrics;
use crate::ops::sort::{converter_for, sort_key_rows};
use crate::stream::{SendableRecordBatchStream, adapt_stream, memory_stream};

enum WindowKind {
    RowNumber,
    Rank,
    DenseRank,
    Shift {
        value: Arc<dyn PhysicalExpr>,
        /// Positive looks back (`lag`), negative looks ahead (`lead`).
        back: i64,
    },
    Aggregate(Arc<PhysicalAggregate>),
}

struct WindowSpec {
    kind: WindowKind,
    partition_by: Vec<Arc<dyn PhysicalExpr>>,
    order_by: Vec<PhysicalSortExpr>,
}

impl WindowSpec {
    fn try_new(expr: &Expr, schema: &SchemaRef) -> Result<Self> {
        let Expr::WindowCall {
            func,
            args,
            partition_by,
            order_by,
        } = expr.clone().unalias()
        else {
            return Err(LfqError::Execution(format!("'{expr}' is not a window call")));
        };
        let kind = match func {
            WindowFunction::RowNumber => WindowKind::RowNumber,
            WindowFunction::Rank => WindowKind::Rank,
            WindowFunction::DenseRank => WindowKind::DenseRank,
            WindowFunction::Lag | WindowFunction::Lead => {
                let offset = match args.get(1) {
                    Some(Expr::Literal(v)) => v.as_i64(),
                    _ => None,
                }
                .ok_or_else(|| {
                    LfqError::Execution(format!("{func} needs a literal integer offset"))
                })?;
                let value = args
                    .first()
                    .ok_or_else(|| LfqError::Execution(format!("{func} needs a value argument")))?;
                WindowKind::Shift {
                    value: compile_expr(value, schema)?,
                    back: if func == WindowFunction::Lag {
                        offset
                    } else {
                        -offset
                    },
                }
            }
            WindowFunction::Aggregate(f) => {
                WindowKind::Aggregate(Arc::new(PhysicalAggregate::from_parts(f, false, &args, schema)?))
            }
        };
        Ok(Self {
            kind,
            partition_by: partition_by
                .iter()
                .map(|e| compile_expr(e, schema))
                .collect::<Result<Vec<_>>>()?,
            order_by: compile_sort_exprs(&order_by, schema)?,
        })
    }

    /// Compute the window column for all rows of `batch`.
    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        let n = batch.num_rows();
        let part_keys: Vec<Box<[u8]>> = if self.partition_by.is_empty() {
            vec![Box::default(); n]
        } else {
            let types = self.partition_by.iter().map(|e| e.data_type()).collect::<Vec<_>>();
            let rows = key_converter(&types)?.convert_columns(&evaluate_all(&self.partition_by, batch)?)?;
            rows.iter().map(|r| r.as_ref().into()).collect()
        };
        let order_keys: Vec<Box<[u8]>> = if self.order_by.is_empty() {
            vec![Box::default(); n]
        } else {
            let converter: RowConverter = converter_for(&self.order_by)?;
            let rows = sort_key_rows(&converter, &self.order_by, batch)?;
            rows.iter().map(|r| r.as_ref().into()).collect()
        };
        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|a, b| {
            part_keys[*a]
                .cmp(&part_keys[*b])
                .then_with(|| order_keys[*a].cmp(&order_keys[*b]))
        });

        // (start, end) ranges into `order` for each window partition.
        let mut partitions = Vec::new();
        let mut start = 0;
        for k in 1..=n {
            if k == n || part_keys[order[k]] != part_keys[order[start]] {
                partitions.push((start, k));
                start = k;
            }
        }
        let peers_end = |s: usize, e: usize| {
            let mut k = s + 1;
            while k < e && order_keys[order[k]] == order_keys[order[s]] {
                k += 1;
            }
            k
        };

        match &self.kind {
            WindowKind::RowNumber | WindowKind::Rank | WindowKind::DenseRank => {
                let mut out = vec![0u64; n];
                for &(s, e) in &partitions {
                    let mut peer_start = s;
                    let mut dense = 0u64;
                    while peer_start < e {
                        let peer_end = peers_end(peer_start, e);
                        dense += 1;
                        for k in peer_start..peer_end {
                            out[order[k]] = match self.kind {
                                WindowKind::RowNumber => (k - s + 1) as u64,
                                WindowKind::Rank => (peer_start - s + 1) as u64,
                                _ => dense,
                            };
                        }
                        peer_start = peer_end;
                    }
                }
                Ok(Arc::new(UInt64Array::from(out)))
            }
            WindowKind::Shift { value, back } => {
                let values = value.evaluate(batch)?;
                let mut idx: Vec<Option<u32>> = vec![None; n];
                for &(s, e) in &partitions {
                    for k in s..e {
                        let src = k as i64 - back;
                        if src >= s as i64 && src < e as i64 {
                            idx[order[k]] = Some(order[src as usize] as u32);
                        }
                    }
                }
                Ok(take(values.as_ref(), &UInt32Array::from(idx), None)?)
            }
            WindowKind::Aggregate(agg) => {
                let args = agg.evaluate_args(batch)?;
                let mut out: Vec<ScalarValue> = vec![ScalarValue::Null; n];
                for &(s, e) in &partitions {
                    let mut acc = agg.create_accumulator()?;
                    let mut peer_start = s;
                    while peer_start < e {
                        let peer_end = if self.order_by.is_empty() {
                            e
                        } else {
                            peers_end(peer_start, e)
                        };
                        let idx = UInt32Array::from_iter_values(
                            order[peer_start..peer_end].iter().map(|i| *i as u32),
                        );
                        let vals = args
                            .iter()
                            .map(|a| take(a.as_ref(), &idx, None))
                            .collect::<std::result::Result<Vec<_>, _>>()?;
                        acc.update_batch(&vals, peer_end - peer_start)?;
                        let v = acc.evaluate()?;
                        for k in peer_start..peer_end {
                            out[order[k]] = v.clone();
                        }
                        peer_start = peer_end;
                    }
                }
                ScalarValue::iter_to_array(out, &agg.return_type)
            }
        }
    }
}

pub struct WindowExec {
    input: Arc<dyn ExecNode>,
    window_exprs: Vec<Expr>,
    specs: Arc<Vec<WindowSpec>>,
    schema: SchemaRef,
    metrics: OperatorMetrics,
}

impl WindowExec {
    pub fn try_new(input: Arc<dyn ExecNode>, window_exprs: Vec<Expr>, schema: SchemaRef) -> Result<Self> {
        let input_schema = input.schema();
        let specs = window_exprs
            .iter()
            .map(|e| WindowSpec::try_new(e, &input_schema))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            input,
            window_exprs,
            specs: Arc::new(specs),
            schema,
            metrics: OperatorMetrics::new(),
        })
    }
}

async fn compute_windows(
    schema: SchemaRef,
    specs: Arc<Vec<WindowSpec>>,
    mut input: SendableRecordBatchStream,
    mut reservation: MemoryReservation,
    batch_size: usize,
) -> Result<SendableRecordBatchStream> {
    let input_schema = input.schema();
    let mut batches = Vec::new();
    while let Some(batch) = input.next().await.transpose()? {
        reservation.try_grow(batch.get_array_memory_size())?;
        batches.push(batch);
    }
    let all = concat_batches(&input_schema, &batches)?;
    drop(batches);
    let n = all.num_rows();
    if n == 0 {
        return Ok(memory_stream(schema, vec![]));
    }
    let mut columns = all.columns().to_vec();
    for spec in specs.iter() {
        let col = spec.evaluate(&all)?;
        let field = schema.field(columns.len());
        let col = if col.data_type() == field.data_type() {
            col
        } else {
            arrow::compute::cast(&col, field.data_type())?
        };
        columns.push(col);
    }
    let options = RecordBatchOptions::new().with_row_count(Some(n));
    let out = RecordBatch::try_new_with_options(Arc::clone(&schema), columns, &options)?;
    let chunks = (0..n)
        .step_by(batch_size)
        .map(|off| out.slice(off, batch_size.min(n - off)))
        .collect();
    Ok(memory_stream(schema, chunks))
}

impl ExecNode for WindowExec {
    fn name(&self) -> &'static str {
        "WindowExec"
    }

    fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    fn output_partitioning(&self) -> OutputPartitioning {
        self.input.output_partitioning()
    }

    fn children(&self) -> Vec<Arc<dyn ExecNode>> {
        vec![Arc::clone(&self.input)]
    }

    fn execute(&self, partition: usize, ctx: Arc<TaskContext>) -> Result<SendableRecordBatchStream> {
        let input = execute_node(&self.input, partition, &ctx)?;
        let reservation = ctx
            .memory_pool()
            .reservation(format!("WindowExec[{partition}]"));
        let fut = compute_windows(
            self.schema(),
            Arc::clone(&self.specs),
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
        self.window_exprs
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }
}
