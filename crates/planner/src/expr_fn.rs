//! Free functions for building expressions.

use crate::expr::{AggregateFunction, Expr, ScalarFunc, WindowFunction};
use crate::scalar::ScalarValue;

/// Column reference by output name.
pub fn col(name: impl Into<String>) -> Expr {
    Expr::Column(name.into())
}

/// Literal from any value convertible to [`ScalarValue`].
pub fn lit(value: impl Into<ScalarValue>) -> Expr {
    Expr::Literal(value.into())
}

/// Untyped `NULL` literal.
pub fn lit_null() -> Expr {
    Expr::Literal(ScalarValue::Null)
}

fn agg(func: AggregateFunction, args: Vec<Expr>) -> Expr {
    Expr::AggregateCall {
        func,
        args,
        distinct: false,
    }
}

pub fn count(e: Expr) -> Expr {
    agg(AggregateFunction::Count, vec![e])
}

/// `count(*)`: number of input rows, nulls included.
pub fn count_star() -> Expr {
    agg(AggregateFunction::Count, vec![])
}

pub fn count_distinct(e: Expr) -> Expr {
    count(e).distinct()
}

pub fn sum(e: Expr) -> Expr {
    agg(AggregateFunction::Sum, vec![e])
}

pub fn min(e: Expr) -> Expr {
    agg(AggregateFunction::Min, vec![e])
}

pub fn max(e: Expr) -> Expr {
    agg(AggregateFunction::Max, vec![e])
}

pub fn avg(e: Expr) -> Expr {
    agg(AggregateFunction::Avg, vec![e])
}

/// Sample standard deviation; null below two values.
pub fn stddev(e: Expr) -> Expr {
    agg(AggregateFunction::Stddev, vec![e])
}

/// Middle value, averaging the two middle values for even counts.
pub fn median(e: Expr) -> Expr {
    agg(AggregateFunction::Median, vec![e])
}

pub fn coalesce(args: Vec<Expr>) -> Expr {
    Expr::ScalarFunction {
        func: ScalarFunc::Coalesce,
        args,
    }
}

pub fn upper(e: Expr) -> Expr {
    Expr::ScalarFunction {
        func: ScalarFunc::Upper,
        args: vec![e],
    }
}

pub fn lower(e: Expr) -> Expr {
    Expr::ScalarFunction {
        func: ScalarFunc::Lower,
        args: vec![e],
    }
}

pub fn character_length(e: Expr) -> Expr {
    Expr::ScalarFunction {
        func: ScalarFunc::CharacterLength,
        args: vec![e],
    }
}

pub fn array_length(e: Expr) -> Expr {
    Expr::ScalarFunction {
        func: ScalarFunc::ArrayLength,
        args: vec![e],
    }
}

fn window(func: WindowFunction, args: Vec<Expr>) -> Expr {
    Expr::WindowCall {
        func,
        args,
        partition_by: vec![],
        order_by: vec![],
    }
}

/// `row_number()`; attach a window clause with [`Expr::over`].
pub fn row_number() -> Expr {
    window(WindowFunction::RowNumber, vec![])
}

pub fn rank() -> Expr {
    window(WindowFunction::Rank, vec![])
}

pub fn dense_rank() -> Expr {
    window(WindowFunction::DenseRank, vec![])
}

pub fn lag(e: Expr, offset: i64) -> Expr {
    window(WindowFunction::Lag, vec![e, lit(offset)])
}

pub fn lead(e: Expr, offset: i64) -> Expr {
    window(WindowFunction::Lead, vec![e, lit(offset)])
}
