//! Partitioned hash join.
//!
//! Each partition collects its build side into one batch plus a key table,
//! then streams the probe side through it. Rows with a null key never match.
//! Build rows that found no partner are emitted after the probe side ends
//! when the join type preserves the build side.

use std::collections::HashMap;
use std::sync::Arc;

use arrow::array::UInt32Array;
use arrow::compute::concat_batches;
use arrow::record_batch::RecordBatch;
use arrow::row::RowConverter;
use arrow_schema::SchemaRef;
use futures::{StreamExt, TryStreamExt};
use lfq_common::{LfqError, MemoryReservation, Result};
use lfq_planner::{Expr, JoinType};
use tracing::debug;

use crate::context::TaskContext;
use crate::exec_node::{ExecNode, OutputPartitioning, execute_node};
use crate::expressions::{PhysicalExpr, evaluate_all};
use crate::hash_utils::{key_converter, valid_key_rows};
use crate::metrics::OperatorMetrics;
use crate::ops::join_utils::{JoinParams, OutputBuffer, indices_where};
use crate::stream::{SendableRecordBatchStream, adapt_stream};

/// Input that is collected into the hash table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildSide {
    Left,
    Right,
}

pub struct HashJoinExec {
    left: Arc<dyn ExecNode>,
    right: Arc<dyn ExecNode>,
    params: Arc<JoinParams>,
    build_side: BuildSide,
    metrics: OperatorMetrics,
}

impl HashJoinExec {
    /// Both inputs must already be partitioned on their join keys with equal
    /// partition counts.
    pub fn try_new(
        left: Arc<dyn ExecNode>,
        right: Arc<dyn ExecNode>,
        on: Vec<(Expr, Expr)>,
        filter: Option<Expr>,
        join_type: JoinType,
        build_side: BuildSide,
        schema: SchemaRef,
    ) -> Result<Self> {
        if on.is_empty() {
            return Err(LfqError::Execution(
                "hash join requires at least one key pair".to_string(),
            ));
        }
        let (lp, rp) = (
            left.output_partitioning().partition_count(),
            right.output_partitioning().partition_count(),
        );
        if lp != rp {
            return Err(LfqError::Execution(format!(
                "hash join inputs have {lp} and {rp} partitions"
            )));
        }
        let params = JoinParams::try_new(left.schema(), right.schema(), on, filter, join_type, schema)?;
        Ok(Self {
            left,
            right,
            params: Arc::new(params),
            build_side,
            metrics: OperatorMetrics::new(),
        })
    }

    pub fn build_side(&self) -> BuildSide {
        self.build_side
    }
}

struct BuildTable {
    batch: RecordBatch,
    map: HashMap<Box<[u8]>, Vec<u32>>,
    matched: Vec<bool>,
    _reservation: MemoryReservation,
}

async fn build_table(
    schema: SchemaRef,
    keys: &[Arc<dyn PhysicalExpr>],
    converter: &RowConverter,
    mut input: SendableRecordBatchStream,
    mut reservation: MemoryReservation,
) -> Result<BuildTable> {
    let mut batches = Vec::new();
    while let Some(batch) = input.next().await.transpose()? {
        reservation.try_grow(batch.get_array_memory_size())?;
        batches.push(batch);
    }
    let batch = concat_batches(&schema, &batches)?;
    drop(batches);
    reservation.try_resize(batch.get_array_memory_size())?;

    let key_cols = evaluate_all(keys, &batch)?;
    let rows = converter.convert_columns(&key_cols)?;
    let valid = valid_key_rows(&key_cols, batch.num_rows());
    let mut map: HashMap<Box<[u8]>, Vec<u32>> = HashMap::new();
    let mut table_bytes = 0usize;
    for (i, row) in rows.iter().enumerate() {
        if !valid[i] {
            continue;
        }
        match map.get_mut(row.as_ref()) {
            Some(list) => list.push(i as u32),
            None => {
                table_bytes += row.as_ref().len() + 64;
                map.insert(row.as_ref().into(), vec![i as u32]);
            }
        }
    }
    table_bytes += 4 * batch.num_rows();
    reservation.try_grow(table_bytes)?;
    debug!(
        rows = batch.num_rows(),
        keys = map.len(),
        reserved = reservation.size(),
        "hash join build side collected"
    );
    Ok(BuildTable {
        matched: vec![false; batch.num_rows()],
        batch,
        map,
        _reservation: reservation,
    })
}

struct ProbeState {
    params: Arc<JoinParams>,
    build_side: BuildSide,
    table: BuildTable,
    probe: SendableRecordBatchStream,
    converter: RowConverter,
    out: OutputBuffer,
    probe_done: bool,
}

impl ProbeState {
    fn probe_keys(&self) -> &[Arc<dyn PhysicalExpr>] {
        match self.build_side {
            BuildSide::Left => &self.params.right_keys,
            BuildSide::Right => &self.params.left_keys,
        }
    }

    fn probe_batch(&mut self, batch: &RecordBatch) -> Result<()> {
        let n = batch.num_rows();
        let key_cols = evaluate_all(self.probe_keys(), batch)?;
        let rows = self.converter.convert_columns(&key_cols)?;
        let valid = valid_key_rows(&key_cols, n);
        let mut build_idx = Vec::new();
        let mut probe_idx = Vec::new();
        for (i, row) in rows.iter().enumerate() {
            if !valid[i] {
                continue;
            }
            if let Some(list) = self.table.map.get(row.as_ref()) {
                build_idx.extend_from_slice(list);
                probe_idx.extend(std::iter::repeat(i as u32).take(list.len()));
            }
        }
        let (build_idx, probe_idx) = (UInt32Array::from(build_idx), UInt32Array::from(probe_idx));
        let probe_is_left = self.build_side == BuildSide::Right;
        let (build_idx, probe_idx) = if probe_is_left {
            let (p, b) = self
                .params
                .apply_filter(batch, probe_idx, &self.table.batch, build_idx)?;
            (b, p)
        } else {
            self.params
                .apply_filter(&self.table.batch, build_idx, batch, probe_idx)?
        };

        for j in build_idx.values() {
            self.table.matched[*j as usize] = true;
        }
        let mut probe_matched = vec![false; n];
        for p in probe_idx.values() {
            probe_matched[*p as usize] = true;
        }

        let join_type = self.params.join_type;
        match join_type {
            JoinType::Semi | JoinType::Anti => {
                if probe_is_left {
                    let keep = indices_where(&probe_matched, join_type == JoinType::Semi);
                    self.out.push(self.params.left_only(batch, &keep)?)?;
                }
            }
            _ => {
                let pairs = if probe_is_left {
                    self.params
                        .output(batch, &probe_idx, &self.table.batch, &build_idx)?
                } else {
                    self.params
                        .output(&self.table.batch, &build_idx, batch, &probe_idx)?
                };
                self.out.push(pairs)?;
                let preserved = if probe_is_left {
                    join_type.preserves_left()
                } else {
                    join_type.preserves_right()
                };
                if preserved {
                    let unmatched = indices_where(&probe_matched, false);
                    let padded = if probe_is_left {
                        self.params.left_only(batch, &unmatched)?
                    } else {
                        self.params.right_only(batch, &unmatched)?
                    };
                    self.out.push(padded)?;
                }
            }
        }
        Ok(())
    }

    /// Emit build rows whose fate depends on the whole probe side.
    fn finish(&mut self) -> Result<()> {
        let join_type = self.params.join_type;
        let build_is_left = self.build_side == BuildSide::Left;
        let matched = &self.table.matched;
        match join_type {
            JoinType::Semi | JoinType::Anti => {
                if build_is_left {
                    let keep = indices_where(matched, join_type == JoinType::Semi);
                    self.out
                        .push(self.params.left_only(&self.table.batch, &keep)?)?;
                }
            }
            _ => {
                let preserved = if build_is_left {
                    join_type.preserves_left()
                } else {
                    join_type.preserves_right()
                };
                if preserved {
                    let unmatched = indices_where(matched, false);
                    let padded = if build_is_left {
                        self.params.left_only(&self.table.batch, &unmatched)?
                    } else {
                        self.params.right_only(&self.table.batch, &unmatched)?
                    };
                    self.out.push(padded)?;
                }
            }
        }
        self.out.flush()
    }
}

async fn next_probe(mut st: ProbeState) -> Result<Option<(RecordBatch, ProbeState)>> {
    loop {
        if let Some(batch) = st.out.pop() {
            return Ok(Some((batch, st)));
        }
        if st.probe_done {
            return Ok(None);
        }
        match st.probe.next().await.transpose()? {
            Some(batch) => st.probe_batch(&batch)?,
            None => {
                st.probe_done = true;
                st.finish()?;
            }
        }
    }
}

impl ExecNode for HashJoinExec {
    fn name(&self) -> &'static str {
        "HashJoinExec"
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
        let (build_node, probe_node) = match self.build_side {
            BuildSide::Left => (&self.left, &self.right),
            BuildSide::Right => (&self.right, &self.left),
        };
        let build = execute_node(build_node, partition, &ctx)?;
        let probe = execute_node(probe_node, partition, &ctx)?;
        let build_schema = build_node.schema();
        let params = Arc::clone(&self.params);
        let build_side = self.build_side;
        let reservation = ctx
            .memory_pool()
            .reservation(format!("HashJoinExec[{partition}]"));
        let out = OutputBuffer::new(self.schema(), ctx.batch_size());
        let fut = async move {
            let converter = key_converter(&params.key_types)?;
            let build_keys = match build_side {
                BuildSide::Left => &params.left_keys,
                BuildSide::Right => &params.right_keys,
            };
            let table = build_table(build_schema, build_keys, &converter, build, reservation).await?;
            let state = ProbeState {
                params: Arc::clone(&params),
                build_side,
                table,
                probe,
                converter,
                out,
                probe_done: false,
            };
            Ok::<_, LfqError>(futures::stream::try_unfold(state, next_probe))
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
        let keys = self
            .params
            .on
            .iter()
            .map(|(l, r)| format!("{l} = {r}"))
            .collect::<Vec<_>>()
            .join(", ");
        let mut s = format!(
            "type={} on=[{keys}] build={:?}",
            self.params.join_type, self.build_side
        );
        if let Some(f) = &self.params.filter_expr {
            s.push_str(&format!(" filter={f}"));
        }
        s
    }
}
