//! Pieces shared by the hash, sort-merge and nested-loop joins.
//!
//! Join keys are compiled against each input and cast to a common type, so
//! both sides encode to comparable rows. The residual filter is compiled
//! against the intermediate `left ++ right` schema (right names suffixed on
//! collision) and evaluated on candidate index pairs before any outer-join
//! padding is added.

use std::collections::VecDeque;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, AsArray, UInt32Array, new_null_array};
use arrow::compute::{concat_batches, filter, take};
use arrow::datatypes::UInt32Type;
use arrow::record_batch::{RecordBatch, RecordBatchOptions};
use arrow_schema::{DataType, Schema, SchemaRef};
use lfq_common::{LfqError, Result};
use lfq_planner::analyzer::comparison_coercion;
use lfq_planner::logical_plan::join_output_fields;
use lfq_planner::{Expr, JoinType};

use crate::expressions::{PhysicalExpr, coerce, compile_expr};

/// Compiled join description shared by every partition of a join operator.
pub struct JoinParams {
    pub join_type: JoinType,
    pub on: Vec<(Expr, Expr)>,
    pub filter_expr: Option<Expr>,
    pub left_keys: Vec<Arc<dyn PhysicalExpr>>,
    pub right_keys: Vec<Arc<dyn PhysicalExpr>>,
    pub key_types: Vec<DataType>,
    filter: Option<Arc<dyn PhysicalExpr>>,
    intermediate: SchemaRef,
    pub left_schema: SchemaRef,
    pub right_schema: SchemaRef,
    pub schema: SchemaRef,
}

impl JoinParams {
    pub fn try_new(
        left_schema: SchemaRef,
        right_schema: SchemaRef,
        on: Vec<(Expr, Expr)>,
        filter_expr: Option<Expr>,
        join_type: JoinType,
        schema: SchemaRef,
    ) -> Result<Self> {
        let mut left_keys = Vec::with_capacity(on.len());
        let mut right_keys = Vec::with_capacity(on.len());
        let mut key_types = Vec::with_capacity(on.len());
        for (l, r) in &on {
            let lk = compile_expr(l, &left_schema)?;
            let rk = compile_expr(r, &right_schema)?;
            let common = comparison_coercion(&lk.data_type(), &rk.data_type()).ok_or_else(|| {
                LfqError::Schema(format!(
                    "join key {l} ({}) is not comparable with {r} ({})",
                    lk.data_type(),
                    rk.data_type()
                ))
            })?;
            left_keys.push(coerce(lk, &common));
            right_keys.push(coerce(rk, &common));
            key_types.push(common);
        }
        let intermediate = Arc::new(Schema::new(join_output_fields(
            &left_schema,
            &right_schema,
            JoinType::Inner,
        )));
        let filter = filter_expr
            .as_ref()
            .map(|f| compile_expr(f, &intermediate))
            .transpose()?;
        Ok(Self {
            join_type,
            on,
            filter_expr,
            left_keys,
            right_keys,
            key_types,
            filter,
            intermediate,
            left_schema,
            right_schema,
            schema,
        })
    }

    pub fn has_filter(&self) -> bool {
        self.filter.is_some()
    }

    /// Keep the candidate pairs for which the residual filter is `true`.
    pub fn apply_filter(
        &self,
        left: &RecordBatch,
        left_idx: UInt32Array,
        right: &RecordBatch,
        right_idx: UInt32Array,
    ) -> Result<(UInt32Array, UInt32Array)> {
        let Some(predicate) = &self.filter else {
            return Ok((left_idx, right_idx));
        };
        if left_idx.is_empty() {
            return Ok((left_idx, right_idx));
        }
        let batch = assemble(&self.intermediate, left, &left_idx, Some((right, &right_idx)))?;
        let mask = predicate.evaluate(&batch)?;
        if mask.data_type() == &DataType::Null {
            return Ok((UInt32Array::from(Vec::<u32>::new()), UInt32Array::from(Vec::<u32>::new())));
        }
        let mask = mask
            .as_boolean_opt()
            .ok_or_else(|| LfqError::Execution("join filter is not boolean".to_string()))?;
        let l = filter(&left_idx, mask)?;
        let r = filter(&right_idx, mask)?;
        Ok((
            l.as_primitive::<UInt32Type>().clone(),
            r.as_primitive::<UInt32Type>().clone(),
        ))
    }

    /// Output batch for index pairs; a null index pads that side with nulls.
    pub fn output(
        &self,
        left: &RecordBatch,
        left_idx: &UInt32Array,
        right: &RecordBatch,
        right_idx: &UInt32Array,
    ) -> Result<RecordBatch> {
        if self.join_type.projects_right() {
            assemble(&self.schema, left, left_idx, Some((right, right_idx)))
        } else {
            assemble(&self.schema, left, left_idx, None)
        }
    }

    /// Left rows at `idx` with the right side null-padded (or absent).
    pub fn left_only(&self, left: &RecordBatch, idx: &UInt32Array) -> Result<RecordBatch> {
        let nulls = UInt32Array::new_null(idx.len());
        let empty = RecordBatch::new_empty(Arc::clone(&self.right_schema));
        self.output(left, idx, &empty, &nulls)
    }

    /// Right rows at `idx` with the left side null-padded.
    pub fn right_only(&self, right: &RecordBatch, idx: &UInt32Array) -> Result<RecordBatch> {
        let nulls = UInt32Array::new_null(idx.len());
        let empty = RecordBatch::new_empty(Arc::clone(&self.left_schema));
        self.output(&empty, &nulls, right, idx)
    }
}

fn take_side(batch: &RecordBatch, idx: &UInt32Array, out: &mut Vec<ArrayRef>) -> Result<()> {
    if idx.null_count() == idx.len() {
        for c in batch.columns() {
            out.push(new_null_array(c.data_type(), idx.len()));
        }
        return Ok(());
    }
    for c in batch.columns() {
        out.push(take(c.as_ref(), idx, None)?);
    }
    Ok(())
}

fn assemble(
    schema: &SchemaRef,
    left: &RecordBatch,
    left_idx: &UInt32Array,
    right: Option<(&RecordBatch, &UInt32Array)>,
) -> Result<RecordBatch> {
    let mut columns = Vec::with_capacity(schema.fields().len());
    take_side(left, left_idx, &mut columns)?;
    if let Some((batch, idx)) = right {
        take_side(batch, idx, &mut columns)?;
    }
    let options = RecordBatchOptions::new().with_row_count(Some(left_idx.len()));
    Ok(RecordBatch::try_new_with_options(
        Arc::clone(schema),
        columns,
        &options,
    )?)
}

/// Rows whose flag is `value`, as take indices.
pub fn indices_where(flags: &[bool], value: bool) -> UInt32Array {
    flags
        .iter()
        .enumerate()
        .filter(|(_, f)| **f == value)
        .map(|(i, _)| i as u32)
        .collect::<Vec<_>>()
        .into()
}

/// Gathers small join outputs into batches of roughly `batch_size` rows.
pub struct OutputBuffer {
    schema: SchemaRef,
    batch_size: usize,
    staged: Vec<RecordBatch>,
    staged_rows: usize,
    ready: VecDeque<RecordBatch>,
}

impl OutputBuffer {
    pub fn new(schema: SchemaRef, batch_size: usize) -> Self {
        Self {
            schema,
            batch_size: batch_size.max(1),
            staged: Vec::new(),
            staged_rows: 0,
            ready: VecDeque::new(),
        }
    }

    pub fn push(&mut self, batch: RecordBatch) -> Result<()> {
        if batch.num_rows() == 0 {
            return Ok(());
        }
        self.staged_rows += batch.num_rows();
        self.staged.push(batch);
        if self.staged_rows >= self.batch_size {
            self.flush()?;
        }
        Ok(())
    }

    /// Move everything staged into the ready queue.
    pub fn flush(&mut self) -> Result<()> {
        if self.staged.is_empty() {
            return Ok(());
        }
        let all = concat_batches(&self.schema, &self.staged)?;
        self.staged.clear();
        self.staged_rows = 0;
        let n = all.num_rows();
        let mut off = 0;
        while off < n {
            let len = self.batch_size.min(n - off);
            self.ready.push_back(all.slice(off, len));
            off += len;
        }
        Ok(())
    }

    pub fn pop(&mut self) -> Option<RecordBatch> {
        self.ready.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use arrow::array::{Int32Array, Int64Array};
    use arrow_schema::Field;
    use lfq_planner::expr_fn::col;

    use super::*;

    fn batch(name: &str, values: Vec<i64>) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new(name, DataType::Int64, false)]));
        RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(values))]).expect("batch")
    }

    #[test]
    fn left_join_pads_missing_side_with_nulls() {
        let l = batch("k", vec![1, 2]);
        let r = batch("k", vec![1]);
        let schema = Arc::new(Schema::new(join_output_fields(
            &l.schema(),
            &r.schema(),
            JoinType::Left,
        )));
        let params = JoinParams::try_new(
            l.schema(),
            r.schema(),
            vec![(col("k"), col("k"))],
            None,
            JoinType::Left,
            schema,
        )
        .expect("params");
        let out = params
            .left_only(&l, &UInt32Array::from(vec![1]))
            .expect("left only");
        assert_eq!(out.schema().field(1).name(), "k_right");
        assert_eq!(out.column(1).null_count(), 1);
        assert_eq!(out.column(0).as_primitive::<arrow::datatypes::Int64Type>().value(0), 2);
    }

    #[test]
    fn mixed_key_types_share_a_common_type() {
        let l = batch("a", vec![1]);
        let schema = Arc::new(Schema::new(vec![Field::new("b", DataType::Int32, false)]));
        let r = RecordBatch::try_new(Arc::clone(&schema), vec![Arc::new(Int32Array::from(vec![1]))])
            .expect("batch");
        let out_schema = Arc::new(Schema::new(join_output_fields(
            &l.schema(),
            &r.schema(),
            JoinType::Inner,
        )));
        let params = JoinParams::try_new(
            l.schema(),
            r.schema(),
            vec![(col("a"), col("b"))],
            Some(col("a").eq(col("b"))),
            JoinType::Inner,
            out_schema,
        )
        .expect("params");
        assert_eq!(params.key_types, vec![DataType::Int64]);
        let (li, ri) = params
            .apply_filter(&l, UInt32Array::from(vec![0]), &r, UInt32Array::from(vec![0]))
            .expect("filter");
        assert_eq!((li.len(), ri.len()), (1, 1));
    }

    #[test]
    fn output_buffer_rechunks() {
        let mut buf = OutputBuffer::new(batch("k", vec![]).schema(), 3);
        buf.push(batch("k", vec![1, 2])).expect("push");
        assert!(buf.pop().is_none());
        buf.push(batch("k", vec![3, 4])).expect("push");
        assert_eq!(buf.pop().map(|b| b.num_rows()), Some(3));
        buf.flush().expect("flush");
        assert_eq!(buf.pop().map(|b| b.num_rows()), Some(1));
    }
}
