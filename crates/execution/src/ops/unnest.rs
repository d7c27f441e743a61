//! Explodes list columns into one row per element.
//!
//! Several columns are zipped by position; the shorter lists are padded with
//! nulls. A row whose lists are all empty or null produces nothing, except
//! that with `preserve_nulls` a null list yields a single row with a null
//! element.

use std::sync::Arc;

use arrow::array::{Array, ArrayRef, AsArray, GenericListArray, OffsetSizeTrait, UInt64Array};
use arrow::compute::take;
use arrow::record_batch::{RecordBatch, RecordBatchOptions};
use arrow_schema::{DataType, SchemaRef};
use futures::{StreamExt, TryStreamExt, future};
use lfq_common::{LfqError, Result};
use lfq_planner::analyzer::resolve_column;

use crate::context::TaskContext;
use crate::exec_node::{ExecNode, OutputPartitioning, execute_node};
use crate::metrics::OperatorMetrics;
use crate::stream::{SendableRecordBatchStream, adapt_stream};

pub struct UnnestExec {
    input: Arc<dyn ExecNode>,
    columns: Vec<String>,
    indices: Vec<usize>,
    preserve_nulls: bool,
    schema: SchemaRef,
    metrics: OperatorMetrics,
}

impl UnnestExec {
    pub fn try_new(
        input: Arc<dyn ExecNode>,
        columns: Vec<String>,
        preserve_nulls: bool,
        schema: SchemaRef,
    ) -> Result<Self> {
        let input_schema = input.schema();
        let indices = columns
            .iter()
            .map(|c| resolve_column(&input_schema, c).map(|(i, _)| i))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            input,
            columns,
            indices,
            preserve_nulls,
            schema,
            metrics: OperatorMetrics::new(),
        })
    }
}

/// Child values plus `(offset, len)` per row, `None` for null lists.
struct ListParts {
    values: ArrayRef,
    rows: Vec<Option<(usize, usize)>>,
}

fn generic_parts<O: OffsetSizeTrait>(list: &GenericListArray<O>) -> ListParts {
    let offsets = list.value_offsets();
    let rows = (0..list.len())
        .map(|i| {
            if list.is_null(i) {
                None
            } else {
                let start = offsets[i].as_usize();
                Some((start, offsets[i + 1].as_usize() - start))
            }
        })
        .collect();
    ListParts {
        values: Arc::clone(list.values()),
        rows,
    }
}

fn list_parts(array: &ArrayRef) -> Result<ListParts> {
    match array.data_type() {
        DataType::List(_) => Ok(generic_parts(array.as_list::<i32>())),
        DataType::LargeList(_) => Ok(generic_parts(array.as_list::<i64>())),
        other => Err(LfqError::Execution(format!(
            "cannot unnest a column of type {other}"
        ))),
    }
}

fn unnest_batch(
    batch: &RecordBatch,
    indices: &[usize],
    preserve_nulls: bool,
    schema: &SchemaRef,
) -> Result<RecordBatch> {
    let lists = indices
        .iter()
        .map(|i| list_parts(batch.column(*i)))
        .collect::<Result<Vec<_>>>()?;
    let mut repeat: Vec<u64> = Vec::new();
    let mut elements: Vec<Vec<Option<u64>>> = vec![Vec::new(); lists.len()];
    for row in 0..batch.num_rows() {
        let longest = lists
            .iter()
            .map(|l| l.rows[row].map_or(0, |(_, len)| len))
            .max()
            .unwrap_or(0);
        let any_null = lists.iter().any(|l| l.rows[row].is_none());
        let out_rows = if longest == 0 && preserve_nulls && any_null {
            1
        } else {
            longest
        };
        for j in 0..out_rows {
            repeat.push(row as u64);
            for (list, out) in lists.iter().zip(elements.iter_mut()) {
                out.push(match list.rows[row] {
                    Some((start, len)) if j < len => Some((start + j) as u64),
                    _ => None,
                });
            }
        }
    }

    let repeat = UInt64Array::from(repeat);
    let mut columns = Vec::with_capacity(schema.fields().len());
    for (i, column) in batch.columns().iter().enumerate() {
        match indices.iter().position(|u| *u == i) {
            Some(k) => {
                let idx = UInt64Array::from(std::mem::take(&mut elements[k]));
                columns.push(take(lists[k].values.as_ref(), &idx, None)?);
            }
            None => columns.push(take(column.as_ref(), &repeat, None)?),
        }
    }
    let options = RecordBatchOptions::new().with_row_count(Some(repeat.len()));
    Ok(RecordBatch::try_new_with_options(
        Arc::clone(schema),
        columns,
        &options,
    )?)
}

impl ExecNode for UnnestExec {
    fn name(&self) -> &'static str {
        "UnnestExec"
    }

    fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    fn output_partitioning(&self) -> OutputPartitioning {
        OutputPartitioning::Unknown(self.input.output_partitioning().partition_count())
    }

    fn children(&self) -> Vec<Arc<dyn ExecNode>> {
        vec![Arc::clone(&self.input)]
    }

    fn execute(&self, partition: usize, ctx: Arc<TaskContext>) -> Result<SendableRecordBatchStream> {
        let input = execute_node(&self.input, partition, &ctx)?;
        let indices = self.indices.clone();
        let preserve_nulls = self.preserve_nulls;
        let schema = self.schema();
        let batch_size = ctx.batch_size();
        let out = input
            .map(move |r| {
                r.and_then(|b| {
                    let out = unnest_batch(&b, &indices, preserve_nulls, &schema)?;
                    let n = out.num_rows();
                    Ok(futures::stream::iter(
                        (0..n)
                            .step_by(batch_size)
                            .map(|off| Ok(out.slice(off, batch_size.min(n - off))))
                            .collect::<Vec<Result<RecordBatch>>>(),
                    ))
                })
            })
            .try_flatten()
            .try_filter(|b| future::ready(b.num_rows() > 0));
        Ok(adapt_stream(self.schema(), out))
    }

    fn metrics(&self) -> &OperatorMetrics {
        &self.metrics
    }

    fn details(&self) -> String {
        format!(
            "columns=[{}] preserve_nulls={}",
            self.columns.join(", "),
            self.preserve_nulls
        )
    }
}

#[cfg(test)]
mod tests {
    use arrow::array::{Int64Array, ListArray};
    use arrow::datatypes::Int64Type;
    use arrow_schema::{Field, Schema};

    use super::*;

    fn input() -> RecordBatch {
        let tags = ListArray::from_iter_primitive::<Int64Type, _, _>(vec![
            Some(vec![]),
            Some(vec![Some(7), Some(8)]),
            None,
        ]);
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("tags", tags.data_type().clone(), true),
        ]));
        RecordBatch::try_new(
            schema,
            vec![Arc::new(Int64Array::from(vec![1, 2, 3])), Arc::new(tags)],
        )
        .expect("batch")
    }

    fn out_schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("tags", DataType::Int64, true),
        ]))
    }

    #[test]
    fn empty_and_null_lists_are_dropped() {
        let out = unnest_batch(&input(), &[1], false, &out_schema()).expect("unnest");
        let ids = out.column(0).as_primitive::<Int64Type>();
        assert_eq!(ids.values().to_vec(), vec![2, 2]);
        let tags = out.column(1).as_primitive::<Int64Type>();
        assert_eq!(tags.values().to_vec(), vec![7, 8]);
    }

    #[test]
    fn preserve_nulls_keeps_null_list_rows() {
        let out = unnest_batch(&input(), &[1], true, &out_schema()).expect("unnest");
        let ids = out.column(0).as_primitive::<Int64Type>();
        assert_eq!(ids.values().to_vec(), vec![2, 2, 3]);
        assert!(out.column(1).is_null(2));
    }
}
