//! Aggregate accumulators used by hash/sort aggregation and window frames.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, AsArray, UInt32Array};
use arrow::compute::kernels::aggregate::{sum, sum_checked};
use arrow::compute::{cast, take};
use arrow::datatypes::{Float64Type, Int64Type, UInt64Type};
use arrow::record_batch::RecordBatch;
use arrow::row::{OwnedRow, RowConverter};
use arrow_schema::{DataType, SchemaRef};
use lfq_common::{LfqError, Result};
use lfq_planner::analyzer::aggregate_return_type;
use lfq_planner::{AggregateFunction, Expr, ScalarValue};

use crate::expressions::{PhysicalExpr, compile_expr, evaluate_all};
use crate::hash_utils::key_converter;

/// Running state of one aggregate over one group.
pub trait Accumulator: Send + fmt::Debug {
    /// Fold `num_rows` input rows. `values` is empty for `count(*)`.
    fn update_batch(&mut self, values: &[ArrayRef], num_rows: usize) -> Result<()>;
    /// Current result; does not reset the state.
    fn evaluate(&self) -> Result<ScalarValue>;
    /// Approximate heap bytes held.
    fn size(&self) -> usize;
}

/// Aggregate call compiled against its input schema.
pub struct PhysicalAggregate {
    pub func: AggregateFunction,
    pub distinct: bool,
    pub args: Vec<Arc<dyn PhysicalExpr>>,
    pub return_type: DataType,
}

impl fmt::Debug for PhysicalAggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhysicalAggregate")
            .field("func", &self.func)
            .field("distinct", &self.distinct)
            .field("return_type", &self.return_type)
            .finish()
    }
}

impl PhysicalAggregate {
    /// Compile an `AggregateCall`, possibly under an alias.
    pub fn try_new(expr: &Expr, input_schema: &SchemaRef) -> Result<Self> {
        match expr {
            Expr::Alias { expr, .. } => Self::try_new(expr, input_schema),
            Expr::AggregateCall {
                func,
                args,
                distinct,
            } => Self::from_parts(*func, *distinct, args, input_schema),
            other => Err(LfqError::Execution(format!(
                "'{other}' is not an aggregate call"
            ))),
        }
    }

    pub fn from_parts(
        func: AggregateFunction,
        distinct: bool,
        args: &[Expr],
        input_schema: &SchemaRef,
    ) -> Result<Self> {
        let args = args
            .iter()
            .map(|a| compile_expr(a, input_schema))
            .collect::<Result<Vec<_>>>()?;
        let input_type = args.first().map(|a| a.data_type());
        let return_type = aggregate_return_type(func, input_type.as_ref())?;
        Ok(Self {
            func,
            distinct,
            args,
            return_type,
        })
    }

    pub fn evaluate_args(&self, batch: &RecordBatch) -> Result<Vec<ArrayRef>> {
        evaluate_all(&self.args, batch)
    }

    pub fn create_accumulator(&self) -> Result<Box<dyn Accumulator>> {
        let input_type = self.args.first().map(|a| a.data_type());
        let plain = create_plain(self.func, &self.return_type)?;
        match (self.distinct, input_type) {
            (true, Some(t)) => Ok(Box::new(DistinctAccumulator {
                converter: key_converter(std::slice::from_ref(&t))?,
                seen: HashSet::new(),
                seen_bytes: 0,
                inner: plain,
            })),
            _ => Ok(plain),
        }
    }
}

fn create_plain(func: AggregateFunction, return_type: &DataType) -> Result<Box<dyn Accumulator>> {
    Ok(match func {
        AggregateFunction::Count => Box::new(CountAccumulator { count: 0 }),
        AggregateFunction::Sum => Box::new(SumAccumulator::try_new(return_type)?),
        AggregateFunction::Avg => Box::new(AvgAccumulator { sum: 0.0, count: 0 }),
        AggregateFunction::Stddev => Box::new(StddevAccumulator {
            count: 0,
            mean: 0.0,
            m2: 0.0,
        }),
        AggregateFunction::Median => Box::new(MedianAccumulator { values: Vec::new() }),
        AggregateFunction::Min | AggregateFunction::Max => Box::new(MinMaxAccumulator {
            value: ScalarValue::try_new_null(return_type)?,
            is_min: func == AggregateFunction::Min,
        }),
    })
}

fn non_null_count(array: &ArrayRef) -> usize {
    array.len() - array.logical_nulls().map(|n| n.null_count()).unwrap_or(0)
}

#[derive(Debug)]
struct CountAccumulator {
    count: i64,
}

impl Accumulator for CountAccumulator {
    fn update_batch(&mut self, values: &[ArrayRef], num_rows: usize) -> Result<()> {
        let n = match values.first() {
            Some(v) => non_null_count(v),
            None => num_rows,
        };
        self.count += n as i64;
        Ok(())
    }

    fn evaluate(&self) -> Result<ScalarValue> {
        Ok(ScalarValue::Int64(Some(self.count)))
    }

    fn size(&self) -> usize {
        std::mem::size_of::<Self>()
    }
}

#[derive(Debug)]
enum SumState {
    Int(Option<i64>),
    UInt(Option<u64>),
    Float(Option<f64>),
}

/// Integer sums are checked; overflow fails the query.
#[derive(Debug)]
struct SumAccumulator {
    state: SumState,
    sum_type: DataType,
}

impl SumAccumulator {
    fn try_new(return_type: &DataType) -> Result<Self> {
        let state = match return_type {
            DataType::Int64 => SumState::Int(None),
            DataType::UInt64 => SumState::UInt(None),
            DataType::Float64 => SumState::Float(None),
            other => {
                return Err(LfqError::Execution(format!("sum into {other} is not supported")));
            }
        };
        Ok(Self {
            state,
            sum_type: return_type.clone(),
        })
    }
}

fn overflow() -> LfqError {
    LfqError::Execution("integer overflow in sum".to_string())
}

impl Accumulator for SumAccumulator {
    fn update_batch(&mut self, values: &[ArrayRef], _num_rows: usize) -> Result<()> {
        let Some(v) = values.first() else {
            return Ok(());
        };
        let v = cast(v, &self.sum_type)?;
        match &mut self.state {
            SumState::Int(acc) => {
                if let Some(part) =
                    sum_checked(v.as_primitive::<Int64Type>()).map_err(|_| overflow())?
                {
                    *acc = Some(acc.unwrap_or(0).checked_add(part).ok_or_else(overflow)?);
                }
            }
            SumState::UInt(acc) => {
                if let Some(part) =
                    sum_checked(v.as_primitive::<UInt64Type>()).map_err(|_| overflow())?
                {
                    *acc = Some(acc.unwrap_or(0).checked_add(part).ok_or_else(overflow)?);
                }
            }
            SumState::Float(acc) => {
                if let Some(part) = sum(v.as_primitive::<Float64Type>()) {
                    *acc = Some(acc.unwrap_or(0.0) + part);
                }
            }
        }
        Ok(())
    }

    fn evaluate(&self) -> Result<ScalarValue> {
        Ok(match self.state {
            SumState::Int(v) => ScalarValue::Int64(v),
            SumState::UInt(v) => ScalarValue::UInt64(v),
            SumState::Float(v) => ScalarValue::Float64(v),
        })
    }

    fn size(&self) -> usize {
        std::mem::size_of::<Self>()
    }
}

#[derive(Debug)]
struct AvgAccumulator {
    sum: f64,
    count: u64,
}

impl Accumulator for AvgAccumulator {
    fn update_batch(&mut self, values: &[ArrayRef], _num_rows: usize) -> Result<()> {
        let Some(v) = values.first() else {
            return Ok(());
        };
        let v = cast(v, &DataType::Float64)?;
        let v = v.as_primitive::<Float64Type>();
        self.count += (v.len() - v.null_count()) as u64;
        self.sum += sum(v).unwrap_or(0.0);
        Ok(())
    }

    fn evaluate(&self) -> Result<ScalarValue> {
        Ok(ScalarValue::Float64(
            (self.count > 0).then(|| self.sum / self.count as f64),
        ))
    }

    fn size(&self) -> usize {
        std::mem::size_of::<Self>()
    }
}

/// Welford's running variance.
#[derive(Debug)]
struct StddevAccumulator {
    count: u64,
    mean: f64,
    m2: f64,
}

impl Accumulator for StddevAccumulator {
    fn update_batch(&mut self, values: &[ArrayRef], _num_rows: usize) -> Result<()> {
        let Some(v) = values.first() else {
            return Ok(());
        };
        let v = cast(v, &DataType::Float64)?;
        for x in v.as_primitive::<Float64Type>().iter().flatten() {
            self.count += 1;
            let delta = x - self.mean;
            self.mean += delta / self.count as f64;
            self.m2 += delta * (x - self.mean);
        }
        Ok(())
    }

    fn evaluate(&self) -> Result<ScalarValue> {
        Ok(ScalarValue::Float64(
            (self.count > 1).then(|| (self.m2 / (self.count - 1) as f64).sqrt()),
        ))
    }

    fn size(&self) -> usize {
        std::mem::size_of::<Self>()
    }
}

/// Buffers every non-null value; memory grows with the group.
#[derive(Debug)]
struct MedianAccumulator {
    values: Vec<f64>,
}

impl Accumulator for MedianAccumulator {
    fn update_batch(&mut self, values: &[ArrayRef], _num_rows: usize) -> Result<()> {
        let Some(v) = values.first() else {
            return Ok(());
        };
        let v = cast(v, &DataType::Float64)?;
        self.values.extend(v.as_primitive::<Float64Type>().iter().flatten());
        Ok(())
    }

    fn evaluate(&self) -> Result<ScalarValue> {
        if self.values.is_empty() {
            return Ok(ScalarValue::Float64(None));
        }
        let mut sorted = self.values.clone();
        sorted.sort_by(f64::total_cmp);
        let mid = sorted.len() / 2;
        let median = if sorted.len() % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        } else {
            sorted[mid]
        };
        Ok(ScalarValue::Float64(Some(median)))
    }

    fn size(&self) -> usize {
        std::mem::size_of::<Self>() + self.values.capacity() * std::mem::size_of::<f64>()
    }
}

#[derive(Debug)]
struct MinMaxAccumulator {
    value: ScalarValue,
    is_min: bool,
}

impl Accumulator for MinMaxAccumulator {
    fn update_batch(&mut self, values: &[ArrayRef], _num_rows: usize) -> Result<()> {
        let Some(v) = values.first() else {
            return Ok(());
        };
        for i in 0..v.len() {
            let candidate = ScalarValue::try_from_array(v.as_ref(), i)?;
            if candidate.is_null() {
                continue;
            }
            let replace = self.value.is_null()
                || match candidate.partial_cmp(&self.value) {
                    Some(std::cmp::Ordering::Less) => self.is_min,
                    Some(std::cmp::Ordering::Greater) => !self.is_min,
                    _ => false,
                };
            if replace {
                self.value = candidate;
            }
        }
        Ok(())
    }

    fn evaluate(&self) -> Result<ScalarValue> {
        Ok(self.value.clone())
    }

    fn size(&self) -> usize {
        std::mem::size_of::<Self>()
            + match &self.value {
                ScalarValue::Utf8(Some(s)) => s.capacity(),
                _ => 0,
            }
    }
}

/// Feeds each distinct non-null value to `inner` exactly once.
#[derive(Debug)]
struct DistinctAccumulator {
    converter: RowConverter,
    seen: HashSet<OwnedRow>,
    seen_bytes: usize,
    inner: Box<dyn Accumulator>,
}

impl Accumulator for DistinctAccumulator {
    fn update_batch(&mut self, values: &[ArrayRef], _num_rows: usize) -> Result<()> {
        let Some(v) = values.first() else {
            return Ok(());
        };
        let nulls = v.logical_nulls();
        let rows = self.converter.convert_columns(std::slice::from_ref(v))?;
        let mut fresh = Vec::new();
        for (i, row) in rows.iter().enumerate() {
            if nulls.as_ref().is_some_and(|n| n.is_null(i)) {
                continue;
            }
            if self.seen.insert(row.owned()) {
                self.seen_bytes += row.as_ref().len() + std::mem::size_of::<OwnedRow>();
                fresh.push(i as u32);
            }
        }
        if fresh.is_empty() {
            return Ok(());
        }
        let n = fresh.len();
        let picked = take(v.as_ref(), &UInt32Array::from(fresh), None)?;
        self.inner.update_batch(&[picked], n)
    }

    fn evaluate(&self) -> Result<ScalarValue> {
        self.inner.evaluate()
    }

    fn size(&self) -> usize {
        std::mem::size_of::<Self>() + self.seen_bytes + self.inner.size()
    }
}

/// One accumulator per group, fed by routing rows to their group.
pub struct GroupedAccumulator {
    agg: Arc<PhysicalAggregate>,
    groups: Vec<Box<dyn Accumulator>>,
    size: usize,
}

impl GroupedAccumulator {
    pub fn new(agg: Arc<PhysicalAggregate>) -> Self {
        Self {
            agg,
            groups: Vec::new(),
            size: 0,
        }
    }

    /// Fold `values` where row `i` belongs to group `group_indices[i]`.
    pub fn update(&mut self, values: &[ArrayRef], group_indices: &[usize], num_groups: usize) -> Result<()> {
        while self.groups.len() < num_groups {
            let acc = self.agg.create_accumulator()?;
            self.size += acc.size();
            self.groups.push(acc);
        }
        let num_rows = group_indices.len();
        if num_rows == 0 {
            return Ok(());
        }
        // Stable sort keeps input order within each group.
        let mut order: Vec<u32> = (0..num_rows as u32).collect();
        order.sort_by_key(|&i| group_indices[i as usize]);
        let mut start = 0;
        while start < num_rows {
            let g = group_indices[order[start] as usize];
            let mut end = start + 1;
            while end < num_rows && group_indices[order[end] as usize] == g {
                end += 1;
            }
            let run_values = if end - start == num_rows {
                values.to_vec()
            } else {
                let idx = UInt32Array::from(order[start..end].to_vec());
                values
                    .iter()
                    .map(|v| take(v.as_ref(), &idx, None))
                    .collect::<std::result::Result<Vec<_>, _>>()?
            };
            let acc = &mut self.groups[g];
            let before = acc.size();
            acc.update_batch(&run_values, end - start)?;
            self.size = self.size + acc.size() - before;
            start = end;
        }
        Ok(())
    }

    /// One output value per group, in group order.
    pub fn evaluate(&self) -> Result<ArrayRef> {
        let values = self
            .groups
            .iter()
            .map(|a| a.evaluate())
            .collect::<Result<Vec<_>>>()?;
        ScalarValue::iter_to_array(values, &self.agg.return_type)
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::array::{Int64Array, StringArray};
    use arrow_schema::{Field, Schema};
    use lfq_planner::expr_fn::{avg, col, count_distinct, count_star, max, median, stddev, sum};

    use super::*;

    fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("v", DataType::Int64, true),
            Field::new("s", DataType::Utf8, true),
        ]))
    }

    fn run(expr: Expr, values: Vec<Option<i64>>) -> Result<ScalarValue> {
        let agg = PhysicalAggregate::try_new(&expr, &schema())?;
        let n = values.len();
        let batch = RecordBatch::try_new(
            schema(),
            vec![
                Arc::new(Int64Array::from(values)),
                Arc::new(StringArray::from(vec![Some("b"); n])),
            ],
        )?;
        let mut acc = agg.create_accumulator()?;
        acc.update_batch(&agg.evaluate_args(&batch)?, n)?;
        acc.evaluate()
    }

    #[test]
    fn count_star_counts_nulls_count_distinct_does_not() {
        let vals = vec![Some(1), None, Some(1), Some(2)];
        assert_eq!(
            run(count_star(), vals.clone()).expect("count"),
            ScalarValue::Int64(Some(4))
        );
        assert_eq!(
            run(count_distinct(col("v")), vals).expect("count distinct"),
            ScalarValue::Int64(Some(2))
        );
    }

    #[test]
    fn sum_and_avg_skip_nulls() {
        let vals = vec![Some(1), None, Some(5)];
        assert_eq!(run(sum(col("v")), vals.clone()).expect("sum"), ScalarValue::Int64(Some(6)));
        assert_eq!(run(avg(col("v")), vals).expect("avg"), ScalarValue::Float64(Some(3.0)));
        assert_eq!(run(sum(col("v")), vec![None]).expect("sum"), ScalarValue::Int64(None));
    }

    #[test]
    fn stddev_and_median_over_non_null_values() {
        let vals = vec![Some(2), Some(4), None, Some(4), Some(6)];
        let ScalarValue::Float64(Some(sd)) = run(stddev(col("v")), vals.clone()).expect("stddev")
        else {
            panic!("stddev should be a float");
        };
        assert!((sd - (8.0f64 / 3.0).sqrt()).abs() < 1e-9, "{sd}");
        assert_eq!(run(median(col("v")), vals).expect("median"), ScalarValue::Float64(Some(4.0)));
        assert_eq!(
            run(median(col("v")), vec![Some(1), Some(4)]).expect("median"),
            ScalarValue::Float64(Some(2.5))
        );
        assert_eq!(run(stddev(col("v")), vec![Some(3)]).expect("stddev"), ScalarValue::Float64(None));
    }

    #[test]
    fn sum_overflow_is_an_execution_error() {
        let err = run(sum(col("v")), vec![Some(i64::MAX), Some(1)]).expect_err("overflow");
        assert!(matches!(err, LfqError::Execution(_)), "{err}");
    }

    #[test]
    fn grouped_accumulator_routes_rows() {
        let agg = Arc::new(PhysicalAggregate::try_new(&max(col("v")), &schema()).expect("agg"));
        let mut grouped = GroupedAccumulator::new(agg);
        let values: Vec<ArrayRef> = vec![Arc::new(Int64Array::from(vec![4, 9, 1, 7]))];
        grouped.update(&values, &[0, 1, 0, 1], 2).expect("update");
        let out = grouped.evaluate().expect("evaluate");
        let out = out.as_primitive::<Int64Type>();
        assert_eq!(out.values().to_vec(), vec![4, 9]);
    }
}
