//! INTERSECT and EXCEPT over co-partitioned inputs.
//!
//! The right side of each partition is reduced to a row-count map; left rows
//! are then kept or dropped as they stream past. Nulls compare equal.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use arrow::array::UInt32Array;
use arrow::compute::take_record_batch;
use arrow::record_batch::RecordBatch;
use arrow::row::RowConverter;
use arrow_schema::SchemaRef;
use futures::{StreamExt, TryStreamExt, future};
use lfq_common::{LfqError, MemoryReservation, Result};
use lfq_planner::SetOpKind;

use crate::context::TaskContext;
use crate::exec_node::{ExecNode, OutputPartitioning, execute_node};
use crate::hash_utils::key_converter;
use crate::metrics::OperatorMetrics;
use crate::ops::rebatch;
use crate::stream::{SendableRecordBatchStream, adapt_stream};

pub struct SetOpExec {
    op: SetOpKind,
    all: bool,
    left: Arc<dyn ExecNode>,
    right: Arc<dyn ExecNode>,
    schema: SchemaRef,
    metrics: OperatorMetrics,
}

impl SetOpExec {
    /// Equal rows of both inputs must land in the same partition index.
    pub fn try_new(
        op: SetOpKind,
        all: bool,
        left: Arc<dyn ExecNode>,
        right: Arc<dyn ExecNode>,
        schema: SchemaRef,
    ) -> Result<Self> {
        let (lp, rp) = (
            left.output_partitioning().partition_count(),
            right.output_partitioning().partition_count(),
        );
        if lp != rp {
            return Err(LfqError::Execution(format!(
                "set operation inputs have {lp} and {rp} partitions"
            )));
        }
        Ok(Self {
            op,
            all,
            left,
            right,
            schema,
            metrics: OperatorMetrics::new(),
        })
    }
}

/// Per-partition membership state built from the right input.
struct RowCounts {
    op: SetOpKind,
    all: bool,
    converter: RowConverter,
    counts: HashMap<Box<[u8]>, usize>,
    emitted: HashSet<Box<[u8]>>,
    _reservation: MemoryReservation,
}

impl RowCounts {
    /// Whether a left row with encoded value `row` is emitted.
    fn admit(&mut self, row: &[u8]) -> bool {
        let count = self.counts.get_mut(row);
        match (self.op, self.all) {
            (SetOpKind::Intersect, true) => match count {
                Some(c) if *c > 0 => {
                    *c -= 1;
                    true
                }
                _ => false,
            },
            (SetOpKind::Intersect, false) => match count {
                Some(c) if *c > 0 => {
                    *c = 0;
                    true
                }
                _ => false,
            },
            (SetOpKind::Except, true) => match count {
                Some(c) if *c > 0 => {
                    *c -= 1;
                    false
                }
                _ => true,
            },
            (SetOpKind::Except, false) => {
                count.is_none() && self.emitted.insert(row.into())
            }
        }
    }

    fn filter(&mut self, batch: &RecordBatch) -> Result<RecordBatch> {
        let rows = self.converter.convert_columns(batch.columns())?;
        let keep: Vec<u32> = rows
            .iter()
            .enumerate()
            .filter(|(_, r)| self.admit(r.as_ref()))
            .map(|(i, _)| i as u32)
            .collect();
        if keep.len() == batch.num_rows() {
            return Ok(batch.clone());
        }
        Ok(take_record_batch(batch, &UInt32Array::from(keep))?)
    }
}

async fn count_rows(
    op: SetOpKind,
    all: bool,
    mut right: SendableRecordBatchStream,
    mut reservation: MemoryReservation,
) -> Result<RowCounts> {
    let types = right
        .schema()
        .fields()
        .iter()
        .map(|f| f.data_type().clone())
        .collect::<Vec<_>>();
    let converter = key_converter(&types)?;
    let mut counts: HashMap<Box<[u8]>, usize> = HashMap::new();
    while let Some(batch) = right.next().await.transpose()? {
        let rows = converter.convert_columns(batch.columns())?;
        let mut added = 0;
        for r in rows.iter() {
            match counts.get_mut(r.as_ref()) {
                Some(c) => *c += 1,
                None => {
                    added += r.as_ref().len() + 48;
                    counts.insert(r.as_ref().into(), 1);
                }
            }
        }
        reservation.try_grow(added)?;
    }
    Ok(RowCounts {
        op,
        all,
        converter,
        counts,
        emitted: HashSet::new(),
        _reservation: reservation,
    })
}

impl ExecNode for SetOpExec {
    fn name(&self) -> &'static str {
        "SetOpExec"
    }

    fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    fn output_partitioning(&self) -> OutputPartitioning {
        OutputPartitioning::Unknown(self.left.output_partitioning().partition_count())
    }

    fn children(&self) -> Vec<Arc<dyn ExecNode>> {
        vec![Arc::clone(&self.left), Arc::clone(&self.right)]
    }

    fn execute(&self, partition: usize, ctx: Arc<TaskContext>) -> Result<SendableRecordBatchStream> {
        let left = execute_node(&self.left, partition, &ctx)?;
        let right = execute_node(&self.right, partition, &ctx)?;
        let reservation = ctx
            .memory_pool()
            .reservation(format!("SetOpExec[{partition}]"));
        let (op, all, schema) = (self.op, self.all, self.schema());
        let fut = async move {
            let mut counts = count_rows(op, all, right, reservation).await?;
            let out = left
                .map(move |r| r.and_then(|b| rebatch(&schema, counts.filter(&b)?)))
                .try_filter(|b| future::ready(b.num_rows() > 0));
            Ok::<_, LfqError>(out)
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
        format!("{:?} all={}", self.op, self.all)
    }
}
