//! Expression compilation and evaluation for execution operators.
//!
//! Input contract:
//! - logical expressions were validated against the same schema when their
//!   plan node was built, so column lookups and coercions succeed here;
//! - operand coercion follows `lfq_planner::analyzer`, with explicit casts
//!   inserted around operands whose type differs from the common type.
//!
//! Output contract:
//! - each evaluation returns an `ArrayRef` aligned to input batch row count.

use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, AsArray, BooleanArray, GenericStringArray, Int32Array, Int64Array,
    OffsetSizeTrait, new_null_array,
};
use arrow::compute::kernels::boolean::{and_kleene, not, or_kleene};
use arrow::compute::kernels::cast::{CastOptions, cast_with_options};
use arrow::compute::kernels::cmp::{eq, gt, gt_eq, lt, lt_eq, neq};
use arrow::compute::kernels::numeric::{add, div, mul, neg, rem, sub};
use arrow::compute::kernels::zip::zip;
use arrow::compute::{SortOptions, is_not_null, is_null};
use arrow::record_batch::RecordBatch;
use arrow_schema::{DataType, SchemaRef};
use lfq_common::{LfqError, Result};
use lfq_planner::analyzer::{arithmetic_coercion, comparison_coercion, resolve_column};
use lfq_planner::{Expr, Operator, ScalarFunc, ScalarValue, SortExpr, UnaryOp};

/// Executable expression for the execution engine.
///
/// Planner produces `Expr` trees over column names; execution compiles them
/// against a concrete input schema once, then evaluates per batch.
pub trait PhysicalExpr: Send + Sync {
    /// Static output data type of this expression.
    fn data_type(&self) -> DataType;
    /// Evaluate the expression for every row in `batch`.
    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef>;
}

/// Compiled ordering key.
#[derive(Clone)]
pub struct PhysicalSortExpr {
    pub expr: Arc<dyn PhysicalExpr>,
    pub options: SortOptions,
}

/// Compile planner Expr into a runnable expression.
pub fn compile_expr(expr: &Expr, input_schema: &SchemaRef) -> Result<Arc<dyn PhysicalExpr>> {
    match expr {
        Expr::Column(name) => {
            let (index, field) = resolve_column(input_schema, name)?;
            Ok(Arc::new(ColumnExpr {
                index,
                dt: field.data_type().clone(),
            }))
        }
        Expr::Literal(v) => Ok(Arc::new(LiteralExpr { v: v.clone() })),
        Expr::Alias { expr, .. } => compile_expr(expr, input_schema),
        Expr::Cast { expr, to_type } => {
            let inner = compile_expr(expr, input_schema)?;
            Ok(coerce(inner, to_type))
        }
        Expr::BinaryExpr { left, op, right } => {
            let l = compile_expr(left, input_schema)?;
            let r = compile_expr(right, input_schema)?;
            compile_binary(l, *op, r)
        }
        Expr::Unary { op, expr } => {
            let inner = compile_expr(expr, input_schema)?;
            Ok(match op {
                UnaryOp::Not => Arc::new(NotExpr {
                    inner: coerce(inner, &DataType::Boolean),
                }),
                UnaryOp::Negative => Arc::new(NegativeExpr { inner }),
                UnaryOp::IsNull => Arc::new(NullCheckExpr {
                    inner,
                    negated: false,
                }),
                UnaryOp::IsNotNull => Arc::new(NullCheckExpr {
                    inner,
                    negated: true,
                }),
            })
        }
        Expr::InList {
            expr,
            list,
            negated,
        } => {
            // x IN (a, b) evaluates as x = a OR x = b, which gives SQL null semantics.
            let any = list
                .iter()
                .map(|item| expr.as_ref().clone().eq(item.clone()))
                .reduce(Expr::or)
                .unwrap_or(Expr::Literal(ScalarValue::Boolean(Some(false))));
            let any = if *negated {
                Expr::Unary {
                    op: UnaryOp::Not,
                    expr: Arc::new(any),
                }
            } else {
                any
            };
            compile_expr(&any, input_schema)
        }
        Expr::ScalarFunction { func, args } => {
            let args = args
                .iter()
                .map(|a| compile_expr(a, input_schema))
                .collect::<Result<Vec<_>>>()?;
            compile_scalar_function(*func, args)
        }
        Expr::AggregateCall { .. } | Expr::WindowCall { .. } => Err(LfqError::Execution(format!(
            "'{expr}' cannot be evaluated row by row"
        ))),
    }
}

/// Compile a list of ordering keys.
pub fn compile_sort_exprs(exprs: &[SortExpr], input_schema: &SchemaRef) -> Result<Vec<PhysicalSortExpr>> {
    exprs
        .iter()
        .map(|s| {
            Ok(PhysicalSortExpr {
                expr: compile_expr(&s.expr, input_schema)?,
                options: SortOptions {
                    descending: !s.asc,
                    nulls_first: s.nulls_first,
                },
            })
        })
        .collect()
}

/// Evaluate every expression against `batch`.
pub fn evaluate_all(exprs: &[Arc<dyn PhysicalExpr>], batch: &RecordBatch) -> Result<Vec<ArrayRef>> {
    exprs.iter().map(|e| e.evaluate(batch)).collect()
}

/// Wrap `expr` in a cast unless it already produces `to`.
pub fn coerce(expr: Arc<dyn PhysicalExpr>, to: &DataType) -> Arc<dyn PhysicalExpr> {
    if expr.data_type() == *to {
        expr
    } else {
        Arc::new(CastExpr {
            inner: expr,
            to_type: to.clone(),
        })
    }
}

fn compile_binary(
    l: Arc<dyn PhysicalExpr>,
    op: Operator,
    r: Arc<dyn PhysicalExpr>,
) -> Result<Arc<dyn PhysicalExpr>> {
    let (lt, rt) = (l.data_type(), r.data_type());
    if op.is_logical() {
        return Ok(Arc::new(BoolBinaryExpr {
            left: coerce(l, &DataType::Boolean),
            right: coerce(r, &DataType::Boolean),
            op,
        }));
    }
    if op.is_comparison() {
        let common = comparison_coercion(&lt, &rt)
            .ok_or_else(|| LfqError::Schema(format!("cannot compare {lt} with {rt}")))?;
        return Ok(Arc::new(CmpExpr {
            left: coerce(l, &common),
            right: coerce(r, &common),
            op,
            operand_type: common,
        }));
    }
    let out = arithmetic_coercion(op, &lt, &rt).ok_or_else(|| {
        LfqError::Schema(format!("operator {op} is not defined for {lt} and {rt}"))
    })?;
    Ok(Arc::new(ArithExpr {
        left: coerce(l, &out),
        right: coerce(r, &out),
        op,
        out,
    }))
}

fn compile_scalar_function(
    func: ScalarFunc,
    args: Vec<Arc<dyn PhysicalExpr>>,
) -> Result<Arc<dyn PhysicalExpr>> {
    let single = |args: Vec<Arc<dyn PhysicalExpr>>| -> Result<Arc<dyn PhysicalExpr>> {
        let mut args = args;
        if args.len() != 1 {
            return Err(LfqError::Execution(format!(
                "{func} expects 1 argument, got {}",
                args.len()
            )));
        }
        Ok(args.remove(0))
    };
    match func {
        ScalarFunc::Coalesce => {
            let mut out = DataType::Null;
            for a in &args {
                let t = a.data_type();
                out = comparison_coercion(&out, &t)
                    .ok_or_else(|| LfqError::Schema(format!("coalesce arguments mix {out} and {t}")))?;
            }
            if args.is_empty() {
                return Err(LfqError::Schema(
                    "coalesce requires at least one argument".to_string(),
                ));
            }
            let args = args.into_iter().map(|a| coerce(a, &out)).collect();
            Ok(Arc::new(CoalesceExpr { args, out }))
        }
        ScalarFunc::Upper | ScalarFunc::Lower => {
            let arg = single(args)?;
            let arg = if arg.data_type() == DataType::Null {
                coerce(arg, &DataType::Utf8)
            } else {
                arg
            };
            Ok(Arc::new(CaseMapExpr {
                inner: arg,
                upper: func == ScalarFunc::Upper,
            }))
        }
        ScalarFunc::CharacterLength => {
            let arg = single(args)?;
            let arg = if arg.data_type() == DataType::Null {
                coerce(arg, &DataType::Utf8)
            } else {
                arg
            };
            Ok(Arc::new(CharLengthExpr { inner: arg }))
        }
        ScalarFunc::ArrayLength => Ok(Arc::new(ArrayLengthExpr {
            inner: single(args)?,
        })),
    }
}

// =====================
// Standard expressions
// =====================

struct ColumnExpr {
    index: usize,
    dt: DataType,
}

impl PhysicalExpr for ColumnExpr {
    fn data_type(&self) -> DataType {
        self.dt.clone()
    }

    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        if self.index >= batch.num_columns() {
            return Err(LfqError::Execution(format!(
                "column index {} out of range for batch with {} columns",
                self.index,
                batch.num_columns()
            )));
        }
        Ok(Arc::clone(batch.column(self.index)))
    }
}

struct LiteralExpr {
    v: ScalarValue,
}

impl PhysicalExpr for LiteralExpr {
    fn data_type(&self) -> DataType {
        self.v.data_type()
    }

    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        Ok(self.v.to_array_of_size(batch.num_rows()))
    }
}

/// Strict cast: values that cannot be represented fail the query instead of
/// silently becoming null.
struct CastExpr {
    inner: Arc<dyn PhysicalExpr>,
    to_type: DataType,
}

impl PhysicalExpr for CastExpr {
    fn data_type(&self) -> DataType {
        self.to_type.clone()
    }

    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        let arr = self.inner.evaluate(batch)?;
        let options = CastOptions {
            safe: false,
            ..Default::default()
        };
        cast_with_options(&arr, &self.to_type, &options).map_err(|e| {
            LfqError::Execution(format!(
                "cast from {} to {} failed: {e}",
                arr.data_type(),
                self.to_type
            ))
        })
    }
}

fn as_bool_array<'a>(arr: &'a ArrayRef, what: &str) -> Result<&'a BooleanArray> {
    arr.as_boolean_opt().ok_or_else(|| {
        LfqError::Execution(format!("{what} expects boolean, got {}", arr.data_type()))
    })
}

struct NotExpr {
    inner: Arc<dyn PhysicalExpr>,
}

impl PhysicalExpr for NotExpr {
    fn data_type(&self) -> DataType {
        DataType::Boolean
    }

    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        let arr = self.inner.evaluate(batch)?;
        Ok(Arc::new(not(as_bool_array(&arr, "NOT")?)?))
    }
}

struct NegativeExpr {
    inner: Arc<dyn PhysicalExpr>,
}

impl PhysicalExpr for NegativeExpr {
    fn data_type(&self) -> DataType {
        self.inner.data_type()
    }

    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        let arr = self.inner.evaluate(batch)?;
        if arr.data_type() == &DataType::Null {
            return Ok(arr);
        }
        neg(&arr).map_err(|e| LfqError::Execution(format!("negation failed: {e}")))
    }
}

struct NullCheckExpr {
    inner: Arc<dyn PhysicalExpr>,
    negated: bool,
}

impl PhysicalExpr for NullCheckExpr {
    fn data_type(&self) -> DataType {
        DataType::Boolean
    }

    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        let arr = self.inner.evaluate(batch)?;
        let out = if self.negated {
            is_not_null(&arr)?
        } else {
            is_null(&arr)?
        };
        Ok(Arc::new(out))
    }
}

/// Kleene AND/OR: `false AND null` is false, `true OR null` is true.
struct BoolBinaryExpr {
    left: Arc<dyn PhysicalExpr>,
    right: Arc<dyn PhysicalExpr>,
    op: Operator,
}

impl PhysicalExpr for BoolBinaryExpr {
    fn data_type(&self) -> DataType {
        DataType::Boolean
    }

    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        let l = self.left.evaluate(batch)?;
        let r = self.right.evaluate(batch)?;
        let lb = as_bool_array(&l, "AND/OR")?;
        let rb = as_bool_array(&r, "AND/OR")?;
        let out = match self.op {
            Operator::And => and_kleene(lb, rb)?,
            _ => or_kleene(lb, rb)?,
        };
        Ok(Arc::new(out))
    }
}

struct CmpExpr {
    left: Arc<dyn PhysicalExpr>,
    right: Arc<dyn PhysicalExpr>,
    op: Operator,
    operand_type: DataType,
}

impl PhysicalExpr for CmpExpr {
    fn data_type(&self) -> DataType {
        DataType::Boolean
    }

    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        if self.operand_type == DataType::Null {
            return Ok(new_null_array(&DataType::Boolean, batch.num_rows()));
        }
        let l = self.left.evaluate(batch)?;
        let r = self.right.evaluate(batch)?;
        let out = match self.op {
            Operator::Eq => eq(&l, &r),
            Operator::NotEq => neq(&l, &r),
            Operator::Lt => lt(&l, &r),
            Operator::LtEq => lt_eq(&l, &r),
            Operator::Gt => gt(&l, &r),
            Operator::GtEq => gt_eq(&l, &r),
            other => {
                return Err(LfqError::Execution(format!(
                    "{other} is not a comparison operator"
                )));
            }
        }
        .map_err(|e| LfqError::Execution(format!("comparison failed: {e}")))?;
        Ok(Arc::new(out))
    }
}

/// Integer arithmetic is checked: overflow and integer division by zero fail
/// the query.
struct ArithExpr {
    left: Arc<dyn PhysicalExpr>,
    right: Arc<dyn PhysicalExpr>,
    op: Operator,
    out: DataType,
}

impl PhysicalExpr for ArithExpr {
    fn data_type(&self) -> DataType {
        self.out.clone()
    }

    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        if self.out == DataType::Null {
            return Ok(new_null_array(&DataType::Null, batch.num_rows()));
        }
        let l = self.left.evaluate(batch)?;
        let r = self.right.evaluate(batch)?;
        match self.op {
            Operator::Plus => add(&l, &r),
            Operator::Minus => sub(&l, &r),
            Operator::Multiply => mul(&l, &r),
            Operator::Divide => div(&l, &r),
            Operator::Modulo => rem(&l, &r),
            other => {
                return Err(LfqError::Execution(format!(
                    "{other} is not an arithmetic operator"
                )));
            }
        }
        .map_err(|e| LfqError::Execution(format!("arithmetic '{}' failed: {e}", self.op)))
    }
}

struct CoalesceExpr {
    args: Vec<Arc<dyn PhysicalExpr>>,
    out: DataType,
}

impl PhysicalExpr for CoalesceExpr {
    fn data_type(&self) -> DataType {
        self.out.clone()
    }

    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        let mut acc: Option<ArrayRef> = None;
        for arg in &self.args {
            let next = arg.evaluate(batch)?;
            acc = Some(match acc {
                None => next,
                Some(cur) if cur.null_count() == 0 => return Ok(cur),
                Some(cur) => zip(&is_not_null(&cur)?, &cur, &next)?,
            });
        }
        Ok(acc.unwrap_or_else(|| new_null_array(&self.out, batch.num_rows())))
    }
}

struct CaseMapExpr {
    inner: Arc<dyn PhysicalExpr>,
    upper: bool,
}

fn map_strings<O: OffsetSizeTrait>(arr: &ArrayRef, upper: bool) -> ArrayRef {
    let out: GenericStringArray<O> = arr
        .as_string::<O>()
        .iter()
        .map(|v| v.map(|s| if upper { s.to_uppercase() } else { s.to_lowercase() }))
        .collect();
    Arc::new(out)
}

impl PhysicalExpr for CaseMapExpr {
    fn data_type(&self) -> DataType {
        self.inner.data_type()
    }

    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        let arr = self.inner.evaluate(batch)?;
        match arr.data_type() {
            DataType::Utf8 => Ok(map_strings::<i32>(&arr, self.upper)),
            DataType::LargeUtf8 => Ok(map_strings::<i64>(&arr, self.upper)),
            other => Err(LfqError::Execution(format!(
                "{} expects a string, got {other}",
                if self.upper { "upper" } else { "lower" }
            ))),
        }
    }
}

struct CharLengthExpr {
    inner: Arc<dyn PhysicalExpr>,
}

impl PhysicalExpr for CharLengthExpr {
    fn data_type(&self) -> DataType {
        match self.inner.data_type() {
            DataType::LargeUtf8 => DataType::Int64,
            _ => DataType::Int32,
        }
    }

    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        let arr = self.inner.evaluate(batch)?;
        match arr.data_type() {
            DataType::Utf8 => Ok(Arc::new(
                arr.as_string::<i32>()
                    .iter()
                    .map(|v| v.map(|s| s.chars().count() as i32))
                    .collect::<Int32Array>(),
            )),
            DataType::LargeUtf8 => Ok(Arc::new(
                arr.as_string::<i64>()
                    .iter()
                    .map(|v| v.map(|s| s.chars().count() as i64))
                    .collect::<Int64Array>(),
            )),
            other => Err(LfqError::Execution(format!(
                "character_length expects a string, got {other}"
            ))),
        }
    }
}

struct ArrayLengthExpr {
    inner: Arc<dyn PhysicalExpr>,
}

impl PhysicalExpr for ArrayLengthExpr {
    fn data_type(&self) -> DataType {
        DataType::Int64
    }

    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        let arr = self.inner.evaluate(batch)?;
        let lengths: Int64Array = match arr.data_type() {
            DataType::Null => return Ok(new_null_array(&DataType::Int64, arr.len())),
            DataType::List(_) => {
                let list = arr.as_list::<i32>();
                (0..list.len())
                    .map(|i| (!list.is_null(i)).then(|| i64::from(list.value_length(i))))
                    .collect()
            }
            DataType::LargeList(_) => {
                let list = arr.as_list::<i64>();
                (0..list.len())
                    .map(|i| (!list.is_null(i)).then(|| list.value_length(i)))
                    .collect()
            }
            DataType::FixedSizeList(_, n) => {
                let n = i64::from(*n);
                (0..arr.len())
                    .map(|i| (!arr.is_null(i)).then_some(n))
                    .collect()
            }
            other => {
                return Err(LfqError::Execution(format!(
                    "array_length expects a list, got {other}"
                )));
            }
        };
        Ok(Arc::new(lengths))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::array::{Array, AsArray, Int32Array, Int64Array, ListArray, StringArray};
    use arrow::datatypes::{Float64Type, Int32Type, Int64Type};
    use arrow::record_batch::RecordBatch;
    use arrow_schema::{DataType, Field, Schema};
    use lfq_common::LfqError;
    use lfq_planner::Expr;
    use lfq_planner::expr_fn::{array_length, character_length, coalesce, col, lit, upper};

    use super::compile_expr;

    fn batch() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("a", DataType::Int32, true),
            Field::new("b", DataType::Int64, true),
            Field::new("s", DataType::Utf8, true),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int32Array::from(vec![Some(1), None, Some(3)])),
                Arc::new(Int64Array::from(vec![Some(10), Some(20), None])),
                Arc::new(StringArray::from(vec![Some("ÄbC"), None, Some("x")])),
            ],
        )
        .expect("batch")
    }

    fn eval(expr: Expr, batch: &RecordBatch) -> Arc<dyn Array> {
        let compiled = compile_expr(&expr, batch.schema_ref()).expect("compile");
        compiled.evaluate(batch).expect("evaluate")
    }

    #[test]
    fn mixed_width_arithmetic_widens_operands() {
        let out = eval(col("a") + col("b"), &batch());
        let out = out.as_primitive::<Int64Type>();
        assert_eq!(out.iter().collect::<Vec<_>>(), vec![Some(11), None, None]);
    }

    #[test]
    fn division_computes_in_float() {
        let out = eval(col("b") / lit(4i64), &batch());
        let out = out.as_primitive::<Float64Type>();
        assert_eq!(out.value(0), 2.5);
    }

    #[test]
    fn integer_overflow_is_an_error() {
        let e = lit(i64::MAX) + col("b");
        let compiled = compile_expr(&e, batch().schema_ref()).expect("compile");
        let err = compiled.evaluate(&batch()).expect_err("overflow");
        assert!(matches!(err, LfqError::Execution(_)), "{err}");
    }

    #[test]
    fn in_list_follows_null_semantics() {
        let out = eval(col("a").in_list(vec![lit(1i32), lit(5i32)], false), &batch());
        let out = out.as_boolean();
        assert!(out.value(0));
        assert!(out.is_null(1));
        assert!(!out.value(2));
    }

    #[test]
    fn coalesce_and_string_functions() {
        let out = eval(coalesce(vec![col("b"), col("a")]), &batch());
        let out = out.as_primitive::<Int64Type>();
        assert_eq!(out.iter().collect::<Vec<_>>(), vec![Some(10), Some(20), Some(3)]);

        let out = eval(upper(col("s")), &batch());
        assert_eq!(out.as_string::<i32>().value(0), "ÄBC");

        let out = eval(character_length(col("s")), &batch());
        assert_eq!(out.as_primitive::<Int32Type>().value(0), 3);
    }

    #[test]
    fn array_length_counts_elements() {
        let list = ListArray::from_iter_primitive::<Int32Type, _, _>(vec![
            Some(vec![Some(1), Some(2)]),
            None,
            Some(vec![]),
        ]);
        let schema = Arc::new(Schema::new(vec![Field::new(
            "l",
            list.data_type().clone(),
            true,
        )]));
        let batch = RecordBatch::try_new(schema, vec![Arc::new(list)]).expect("batch");
        let out = eval(array_length(col("l")), &batch);
        let out = out.as_primitive::<Int64Type>();
        assert_eq!(out.iter().collect::<Vec<_>>(), vec![Some(2), None, Some(0)]);
    }

    #[test]
    fn strict_cast_rejects_unparseable_strings() {
        let e = col("s").cast(DataType::Int64);
        let compiled = compile_expr(&e, batch().schema_ref()).expect("compile");
        assert!(compiled.evaluate(&batch()).is_err());
    }
}
