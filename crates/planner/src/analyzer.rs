//! Type derivation and coercion rules.
//!
//! Expressions carry no types of their own. A plan node resolves its
//! expressions against its input schema when it is built, which is where
//! unknown columns, type mismatches, and impossible casts surface. Physical
//! expression compilation reuses the same coercion functions so both layers
//! agree on operand types.

use arrow::compute::can_cast_types;
use arrow_schema::{DataType, Field, Schema};
use lfq_common::{LfqError, Result};

use crate::expr::{AggregateFunction, Expr, Operator, ScalarFunc, UnaryOp, WindowFunction};

/// Resolve a column name to its index and field.
pub fn resolve_column<'a>(schema: &'a Schema, name: &str) -> Result<(usize, &'a Field)> {
    schema
        .fields()
        .iter()
        .enumerate()
        .find(|(_, f)| f.name() == name)
        .map(|(i, f)| (i, f.as_ref()))
        .ok_or_else(|| {
            let available = schema
                .fields()
                .iter()
                .map(|f| f.name().as_str())
                .collect::<Vec<_>>()
                .join(", ");
            LfqError::Schema(format!("unknown column '{name}' (available: {available})"))
        })
}

pub fn is_numeric(dt: &DataType) -> bool {
    numeric_rank(dt).is_some()
}

fn is_signed_int(dt: &DataType) -> bool {
    matches!(
        dt,
        DataType::Int8 | DataType::Int16 | DataType::Int32 | DataType::Int64
    )
}

fn is_unsigned_int(dt: &DataType) -> bool {
    matches!(
        dt,
        DataType::UInt8 | DataType::UInt16 | DataType::UInt32 | DataType::UInt64
    )
}

pub fn is_string(dt: &DataType) -> bool {
    matches!(dt, DataType::Utf8 | DataType::LargeUtf8)
}

fn numeric_rank(dt: &DataType) -> Option<u8> {
    Some(match dt {
        DataType::Int8 | DataType::UInt8 => 1,
        DataType::Int16 | DataType::UInt16 => 2,
        DataType::Int32 | DataType::UInt32 => 3,
        DataType::Int64 | DataType::UInt64 => 4,
        DataType::Float32 => 5,
        DataType::Float64 => 6,
        _ => return None,
    })
}

/// Smallest numeric type both operands widen to.
///
/// Mixed signed/unsigned integers meet at `Int64`.
pub fn wider_numeric(a: &DataType, b: &DataType) -> Option<DataType> {
    let ra = numeric_rank(a)?;
    let rb = numeric_rank(b)?;
    if a == b {
        return Some(a.clone());
    }
    if (is_signed_int(a) && is_unsigned_int(b)) || (is_unsigned_int(a) && is_signed_int(b)) {
        return Some(DataType::Int64);
    }
    Some(if ra >= rb { a.clone() } else { b.clone() })
}

/// Common type for comparing (or unifying) two values, if any.
pub fn comparison_coercion(l: &DataType, r: &DataType) -> Option<DataType> {
    if l == r {
        return Some(l.clone());
    }
    match (l, r) {
        (DataType::Null, other) | (other, DataType::Null) => Some(other.clone()),
        (a, b) if is_numeric(a) && is_numeric(b) => wider_numeric(a, b),
        (a, b) if is_string(a) && is_string(b) => Some(DataType::LargeUtf8),
        _ => None,
    }
}

/// Operand type both sides of an arithmetic operator are cast to.
///
/// Division always computes in `Float64`.
pub fn arithmetic_coercion(op: Operator, l: &DataType, r: &DataType) -> Option<DataType> {
    let l = if *l == DataType::Null { r } else { l };
    let r = if *r == DataType::Null { l } else { r };
    if !is_numeric(l) || !is_numeric(r) {
        return None;
    }
    if op == Operator::Divide {
        return Some(DataType::Float64);
    }
    wider_numeric(l, r)
}

/// Accumulator output type for `func` over an argument of type `arg`.
pub fn aggregate_return_type(func: AggregateFunction, arg: Option<&DataType>) -> Result<DataType> {
    let arg = match (func, arg) {
        (AggregateFunction::Count, _) => return Ok(DataType::Int64),
        (_, Some(a)) => a,
        (f, None) => {
            return Err(LfqError::Schema(format!("{f} requires one argument")));
        }
    };
    match func {
        AggregateFunction::Count => Ok(DataType::Int64),
        AggregateFunction::Sum => match arg {
            DataType::Null => Ok(DataType::Int64),
            a if is_signed_int(a) => Ok(DataType::Int64),
            a if is_unsigned_int(a) => Ok(DataType::UInt64),
            DataType::Float32 | DataType::Float64 => Ok(DataType::Float64),
            other => Err(LfqError::Schema(format!("sum is not defined for {other}"))),
        },
        AggregateFunction::Avg | AggregateFunction::Stddev | AggregateFunction::Median => {
            match arg {
                DataType::Null => Ok(DataType::Float64),
                a if is_numeric(a) => Ok(DataType::Float64),
                other => Err(LfqError::Schema(format!("{func} is not defined for {other}"))),
            }
        }
        AggregateFunction::Min | AggregateFunction::Max => match arg {
            a if is_numeric(a) || is_string(a) => Ok(a.clone()),
            DataType::Boolean | DataType::Null => Ok(arg.clone()),
            other => Err(LfqError::Schema(format!(
                "{func} is not defined for {other}"
            ))),
        },
    }
}

fn expect_arity(name: &dyn std::fmt::Display, args: &[Expr], n: usize) -> Result<()> {
    if args.len() != n {
        return Err(LfqError::Schema(format!(
            "{name} expects {n} argument(s), got {}",
            args.len()
        )));
    }
    Ok(())
}

fn list_element(dt: &DataType) -> Option<&DataType> {
    match dt {
        DataType::List(f) | DataType::LargeList(f) | DataType::FixedSizeList(f, _) => {
            Some(f.data_type())
        }
        _ => None,
    }
}

impl Expr {
    /// Output type of this expression over rows of `schema`.
    pub fn data_type(&self, schema: &Schema) -> Result<DataType> {
        match self {
            Expr::Column(name) => Ok(resolve_column(schema, name)?.1.data_type().clone()),
            Expr::Literal(v) => Ok(v.data_type()),
            Expr::Alias { expr, .. } => expr.data_type(schema),
            Expr::BinaryExpr { left, op, right } => {
                let lt = left.data_type(schema)?;
                let rt = right.data_type(schema)?;
                if op.is_comparison() {
                    comparison_coercion(&lt, &rt).ok_or_else(|| {
                        LfqError::Schema(format!("cannot compare {lt} with {rt} in '{self}'"))
                    })?;
                    Ok(DataType::Boolean)
                } else if op.is_logical() {
                    for t in [&lt, &rt] {
                        if !matches!(t, DataType::Boolean | DataType::Null) {
                            return Err(LfqError::Schema(format!(
                                "{op} requires boolean operands, got {t} in '{self}'"
                            )));
                        }
                    }
                    Ok(DataType::Boolean)
                } else {
                    arithmetic_coercion(*op, &lt, &rt).ok_or_else(|| {
                        LfqError::Schema(format!(
                            "operator {op} is not defined for {lt} and {rt} in '{self}'"
                        ))
                    })
                }
            }
            Expr::Unary { op, expr } => {
                let t = expr.data_type(schema)?;
                match op {
                    UnaryOp::Not if matches!(t, DataType::Boolean | DataType::Null) => {
                        Ok(DataType::Boolean)
                    }
                    UnaryOp::Not => Err(LfqError::Schema(format!(
                        "NOT requires a boolean operand, got {t}"
                    ))),
                    UnaryOp::Negative if is_numeric(&t) && !is_unsigned_int(&t) => Ok(t),
                    UnaryOp::Negative => Err(LfqError::Schema(format!(
                        "negation requires a signed numeric operand, got {t}"
                    ))),
                    UnaryOp::IsNull | UnaryOp::IsNotNull => Ok(DataType::Boolean),
                }
            }
            Expr::InList { expr, list, .. } => {
                let t = expr.data_type(schema)?;
                for item in list {
                    let it = item.data_type(schema)?;
                    comparison_coercion(&t, &it).ok_or_else(|| {
                        LfqError::Schema(format!("IN list item {item} ({it}) is not comparable with {t}"))
                    })?;
                }
                Ok(DataType::Boolean)
            }
            Expr::Cast { expr, to_type } => {
                let from = expr.data_type(schema)?;
                if from == *to_type || can_cast_types(&from, to_type) {
                    Ok(to_type.clone())
                } else {
                    Err(LfqError::UnsupportedCast {
                        from: from.to_string(),
                        to: to_type.to_string(),
                    })
                }
            }
            Expr::ScalarFunction { func, args } => match func {
                ScalarFunc::Coalesce => {
                    let mut out = DataType::Null;
                    if args.is_empty() {
                        return Err(LfqError::Schema(
                            "coalesce requires at least one argument".to_string(),
                        ));
                    }
                    for a in args {
                        let t = a.data_type(schema)?;
                        out = comparison_coercion(&out, &t).ok_or_else(|| {
                            LfqError::Schema(format!("coalesce arguments mix {out} and {t}"))
                        })?;
                    }
                    Ok(out)
                }
                ScalarFunc::Upper | ScalarFunc::Lower => {
                    expect_arity(func, args, 1)?;
                    match args[0].data_type(schema)? {
                        t if is_string(&t) => Ok(t),
                        DataType::Null => Ok(DataType::Utf8),
                        t => Err(LfqError::Schema(format!("{func} requires a string, got {t}"))),
                    }
                }
                ScalarFunc::CharacterLength => {
                    expect_arity(func, args, 1)?;
                    match args[0].data_type(schema)? {
                        DataType::Utf8 | DataType::Null => Ok(DataType::Int32),
                        DataType::LargeUtf8 => Ok(DataType::Int64),
                        t => Err(LfqError::Schema(format!("{func} requires a string, got {t}"))),
                    }
                }
                ScalarFunc::ArrayLength => {
                    expect_arity(func, args, 1)?;
                    let t = args[0].data_type(schema)?;
                    if list_element(&t).is_some() || t == DataType::Null {
                        Ok(DataType::Int64)
                    } else {
                        Err(LfqError::Schema(format!("{func} requires a list, got {t}")))
                    }
                }
            },
            Expr::AggregateCall { func, args, .. } => {
                if args.len() > 1 {
                    return Err(LfqError::Schema(format!(
                        "{func} takes at most one argument"
                    )));
                }
                let arg = args.first().map(|a| a.data_type(schema)).transpose()?;
                aggregate_return_type(*func, arg.as_ref())
            }
            Expr::WindowCall {
                func,
                args,
                partition_by,
                order_by,
            } => {
                for e in partition_by {
                    e.data_type(schema)?;
                }
                for s in order_by {
                    s.expr.data_type(schema)?;
                }
                match func {
                    WindowFunction::RowNumber | WindowFunction::Rank | WindowFunction::DenseRank => {
                        expect_arity(func, args, 0)?;
                        Ok(DataType::UInt64)
                    }
                    WindowFunction::Lag | WindowFunction::Lead => {
                        expect_arity(func, args, 2)?;
                        if args[1].data_type(schema)? != DataType::Int64
                            || !matches!(args[1], Expr::Literal(_))
                        {
                            return Err(LfqError::Schema(format!(
                                "{func} offset must be an integer literal"
                            )));
                        }
                        args[0].data_type(schema)
                    }
                    WindowFunction::Aggregate(agg) => {
                        let arg = args.first().map(|a| a.data_type(schema)).transpose()?;
                        aggregate_return_type(*agg, arg.as_ref())
                    }
                }
            }
        }
    }

    /// Whether this expression may produce nulls over rows of `schema`.
    pub fn nullable(&self, schema: &Schema) -> Result<bool> {
        Ok(match self {
            Expr::Column(name) => resolve_column(schema, name)?.1.is_nullable(),
            Expr::Literal(v) => v.is_null(),
            Expr::Alias { expr, .. } | Expr::Cast { expr, .. } => expr.nullable(schema)?,
            Expr::BinaryExpr { left, right, .. } => {
                left.nullable(schema)? || right.nullable(schema)?
            }
            Expr::Unary { op, expr } => match op {
                UnaryOp::IsNull | UnaryOp::IsNotNull => false,
                UnaryOp::Not | UnaryOp::Negative => expr.nullable(schema)?,
            },
            Expr::InList { expr, list, .. } => {
                let mut n = expr.nullable(schema)?;
                for e in list {
                    n |= e.nullable(schema)?;
                }
                n
            }
            Expr::ScalarFunction { func, args } => match func {
                ScalarFunc::Coalesce => {
                    let mut all = true;
                    for a in args {
                        all &= a.nullable(schema)?;
                    }
                    all
                }
                _ => {
                    let mut any = false;
                    for a in args {
                        any |= a.nullable(schema)?;
                    }
                    any
                }
            },
            Expr::AggregateCall { func, .. } => *func != AggregateFunction::Count,
            Expr::WindowCall { func, .. } => match func {
                WindowFunction::RowNumber | WindowFunction::Rank | WindowFunction::DenseRank => {
                    false
                }
                WindowFunction::Aggregate(AggregateFunction::Count) => false,
                _ => true,
            },
        })
    }

    /// Output field: display name, derived type, and nullability.
    pub fn to_field(&self, schema: &Schema) -> Result<Field> {
        Ok(Field::new(
            self.display_name(),
            self.data_type(schema)?,
            self.nullable(schema)?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr_fn::{avg, col, count_star, lit, sum};

    fn schema() -> Schema {
        Schema::new(vec![
            Field::new("a", DataType::Int32, false),
            Field::new("b", DataType::Int64, true),
            Field::new("s", DataType::Utf8, true),
            Field::new("u", DataType::UInt32, false),
        ])
    }

    #[test]
    fn arithmetic_widens_and_division_is_float() {
        let s = schema();
        assert_eq!((col("a") + col("b")).data_type(&s).expect("type"), DataType::Int64);
        assert_eq!((col("a") / col("b")).data_type(&s).expect("type"), DataType::Float64);
        assert_eq!((col("a") + col("u")).data_type(&s).expect("type"), DataType::Int64);
        assert!((col("a") + col("s")).data_type(&s).is_err());
    }

    #[test]
    fn unknown_column_is_schema_error() {
        let err = col("missing").data_type(&schema()).expect_err("must fail");
        assert!(matches!(err, LfqError::Schema(_)), "{err}");
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn impossible_cast_is_reported() {
        let s = Schema::new(vec![Field::new(
            "l",
            DataType::List(std::sync::Arc::new(Field::new("item", DataType::Int32, true))),
            true,
        )]);
        let err = col("l").cast(DataType::Boolean).data_type(&s).expect_err("no cast");
        assert!(matches!(err, LfqError::UnsupportedCast { .. }), "{err}");
    }

    #[test]
    fn aggregate_types_follow_accumulators() {
        let s = schema();
        assert_eq!(sum(col("a")).data_type(&s).expect("sum"), DataType::Int64);
        assert_eq!(sum(col("u")).data_type(&s).expect("sum"), DataType::UInt64);
        assert_eq!(avg(col("a")).data_type(&s).expect("avg"), DataType::Float64);
        let f = count_star().to_field(&s).expect("count");
        assert_eq!(f.name(), "count(*)");
        assert!(!f.is_nullable());
        assert!(sum(col("s")).data_type(&s).is_err());
    }

    #[test]
    fn comparison_requires_compatible_types() {
        let s = schema();
        assert!(col("s").eq(lit(1i64)).data_type(&s).is_err());
        assert_eq!(
            col("a").lt(lit(2.5)).data_type(&s).expect("cmp"),
            DataType::Boolean
        );
    }
}
