//! Expression model shared by the logical plan, the optimizer, and physical
//! expression compilation.
//!
//! Expressions are immutable trees. Children are held behind `Arc`, so
//! rewrites rebuild only the path from the changed node to the root and
//! share everything else.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use arrow_schema::DataType;
use lfq_common::Result;
use serde::{Deserialize, Serialize};

use crate::scalar::ScalarValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Plus,
    Minus,
    Multiply,
    Divide,
    Modulo,
    And,
    Or,
}

impl Operator {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            Operator::Eq
                | Operator::NotEq
                | Operator::Lt
                | Operator::LtEq
                | Operator::Gt
                | Operator::GtEq
        )
    }

    pub fn is_arithmetic(self) -> bool {
        matches!(
            self,
            Operator::Plus
                | Operator::Minus
                | Operator::Multiply
                | Operator::Divide
                | Operator::Modulo
        )
    }

    pub fn is_logical(self) -> bool {
        matches!(self, Operator::And | Operator::Or)
    }

    /// Operator with operands swapped (`a < b` == `b > a`).
    pub fn swap(self) -> Option<Operator> {
        match self {
            Operator::Eq => Some(Operator::Eq),
            Operator::NotEq => Some(Operator::NotEq),
            Operator::Lt => Some(Operator::Gt),
            Operator::LtEq => Some(Operator::GtEq),
            Operator::Gt => Some(Operator::Lt),
            Operator::GtEq => Some(Operator::LtEq),
            _ => None,
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operator::Eq => "=",
            Operator::NotEq => "!=",
            Operator::Lt => "<",
            Operator::LtEq => "<=",
            Operator::Gt => ">",
            Operator::GtEq => ">=",
            Operator::Plus => "+",
            Operator::Minus => "-",
            Operator::Multiply => "*",
            Operator::Divide => "/",
            Operator::Modulo => "%",
            Operator::And => "AND",
            Operator::Or => "OR",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Not,
    Negative,
    IsNull,
    IsNotNull,
}

/// Built-in row-wise functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScalarFunc {
    /// First non-null argument.
    Coalesce,
    Upper,
    Lower,
    /// Length in characters (not bytes).
    CharacterLength,
    /// Element count of a list value.
    ArrayLength,
}

impl fmt::Display for ScalarFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScalarFunc::Coalesce => "coalesce",
            ScalarFunc::Upper => "upper",
            ScalarFunc::Lower => "lower",
            ScalarFunc::CharacterLength => "character_length",
            ScalarFunc::ArrayLength => "array_length",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggregateFunction {
    /// Non-null argument count, or row count with no arguments.
    Count,
    Sum,
    Min,
    Max,
    Avg,
    /// Sample standard deviation.
    Stddev,
    Median,
}

impl fmt::Display for AggregateFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AggregateFunction::Count => "count",
            AggregateFunction::Sum => "sum",
            AggregateFunction::Min => "min",
            AggregateFunction::Max => "max",
            AggregateFunction::Avg => "avg",
            AggregateFunction::Stddev => "stddev",
            AggregateFunction::Median => "median",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WindowFunction {
    RowNumber,
    Rank,
    DenseRank,
    /// `lag(expr, offset)`: value `offset` rows before the current row.
    Lag,
    /// `lead(expr, offset)`: value `offset` rows after the current row.
    Lead,
    /// Aggregate evaluated over the window frame.
    Aggregate(AggregateFunction),
}

impl fmt::Display for WindowFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WindowFunction::RowNumber => f.write_str("row_number"),
            WindowFunction::Rank => f.write_str("rank"),
            WindowFunction::DenseRank => f.write_str("dense_rank"),
            WindowFunction::Lag => f.write_str("lag"),
            WindowFunction::Lead => f.write_str("lead"),
            WindowFunction::Aggregate(a) => write!(f, "{a}"),
        }
    }
}

/// One ordering key.
///
/// `SortExpr::from(expr)` is ascending with nulls first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortExpr {
    pub expr: Expr,
    pub asc: bool,
    pub nulls_first: bool,
}

impl SortExpr {
    pub fn new(expr: Expr, asc: bool, nulls_first: bool) -> Self {
        Self {
            expr,
            asc,
            nulls_first,
        }
    }
}

impl From<Expr> for SortExpr {
    fn from(expr: Expr) -> Self {
        SortExpr::new(expr, true, true)
    }
}

impl fmt::Display for SortExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}",
            self.expr,
            if self.asc { "ASC" } else { "DESC" },
            if self.nulls_first {
                "NULLS FIRST"
            } else {
                "NULLS LAST"
            }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Column(String),
    Literal(ScalarValue),
    BinaryExpr {
        left: Arc<Expr>,
        op: Operator,
        right: Arc<Expr>,
    },
    Unary {
        op: UnaryOp,
        expr: Arc<Expr>,
    },
    InList {
        expr: Arc<Expr>,
        list: Vec<Expr>,
        negated: bool,
    },
    Cast {
        expr: Arc<Expr>,
        to_type: DataType,
    },
    Alias {
        expr: Arc<Expr>,
        name: String,
    },
    ScalarFunction {
        func: ScalarFunc,
        args: Vec<Expr>,
    },
    AggregateCall {
        func: AggregateFunction,
        args: Vec<Expr>,
        distinct: bool,
    },
    WindowCall {
        func: WindowFunction,
        args: Vec<Expr>,
        partition_by: Vec<Expr>,
        order_by: Vec<SortExpr>,
    },
}

impl Expr {
    fn binary(self, op: Operator, other: Expr) -> Expr {
        Expr::BinaryExpr {
            left: Arc::new(self),
            op,
            right: Arc::new(other),
        }
    }

    fn unary(self, op: UnaryOp) -> Expr {
        Expr::Unary {
            op,
            expr: Arc::new(self),
        }
    }

    /// Rename the output of this expression. Nested aliases collapse.
    pub fn alias(self, name: impl Into<String>) -> Expr {
        Expr::Alias {
            expr: Arc::new(self.unalias()),
            name: name.into(),
        }
    }

    /// Cast to `to_type`; validity is checked when a plan node derives its schema.
    pub fn cast(self, to_type: DataType) -> Expr {
        Expr::Cast {
            expr: Arc::new(self),
            to_type,
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn eq(self, other: Expr) -> Expr {
        self.binary(Operator::Eq, other)
    }

    pub fn not_eq(self, other: Expr) -> Expr {
        self.binary(Operator::NotEq, other)
    }

    pub fn lt(self, other: Expr) -> Expr {
        self.binary(Operator::Lt, other)
    }

    pub fn lt_eq(self, other: Expr) -> Expr {
        self.binary(Operator::LtEq, other)
    }

    pub fn gt(self, other: Expr) -> Expr {
        self.binary(Operator::Gt, other)
    }

    pub fn gt_eq(self, other: Expr) -> Expr {
        self.binary(Operator::GtEq, other)
    }

    pub fn and(self, other: Expr) -> Expr {
        self.binary(Operator::And, other)
    }

    pub fn or(self, other: Expr) -> Expr {
        self.binary(Operator::Or, other)
    }

    pub fn is_null(self) -> Expr {
        self.unary(UnaryOp::IsNull)
    }

    pub fn is_not_null(self) -> Expr {
        self.unary(UnaryOp::IsNotNull)
    }

    pub fn in_list(self, list: Vec<Expr>, negated: bool) -> Expr {
        Expr::InList {
            expr: Arc::new(self),
            list,
            negated,
        }
    }

    pub fn sort(self, asc: bool, nulls_first: bool) -> SortExpr {
        SortExpr::new(self, asc, nulls_first)
    }

    /// Mark an aggregate call as `DISTINCT`. Other expressions are unchanged.
    pub fn distinct(self) -> Expr {
        match self {
            Expr::AggregateCall { func, args, .. } => Expr::AggregateCall {
                func,
                args,
                distinct: true,
            },
            other => other,
        }
    }

    /// Turn an aggregate call into a window aggregate, or set the window
    /// clause of an existing window call.
    pub fn over(self, partition_by: Vec<Expr>, order_by: Vec<SortExpr>) -> Expr {
        match self {
            Expr::AggregateCall { func, args, .. } => Expr::WindowCall {
                func: WindowFunction::Aggregate(func),
                args,
                partition_by,
                order_by,
            },
            Expr::WindowCall { func, args, .. } => Expr::WindowCall {
                func,
                args,
                partition_by,
                order_by,
            },
            Expr::Alias { expr, name } => {
                Expr::clone(&expr).over(partition_by, order_by).alias(name)
            }
            other => other,
        }
    }

    /// Strip a top-level alias.
    pub fn unalias(self) -> Expr {
        match self {
            Expr::Alias { expr, .. } => Expr::clone(&expr),
            other => other,
        }
    }

    /// Output column name: the alias if any, else the rendered expression.
    pub fn display_name(&self) -> String {
        match self {
            Expr::Alias { name, .. } => name.clone(),
            other => other.to_string(),
        }
    }

    /// Direct children, in evaluation order.
    pub fn children(&self) -> Vec<&Expr> {
        match self {
            Expr::Column(_) | Expr::Literal(_) => vec![],
            Expr::BinaryExpr { left, right, .. } => vec![left.as_ref(), right.as_ref()],
            Expr::Unary { expr, .. } | Expr::Cast { expr, .. } | Expr::Alias { expr, .. } => {
                vec![expr.as_ref()]
            }
            Expr::InList { expr, list, .. } => {
                let mut out = vec![expr.as_ref()];
                out.extend(list.iter());
                out
            }
            Expr::ScalarFunction { args, .. } | Expr::AggregateCall { args, .. } => {
                args.iter().collect()
            }
            Expr::WindowCall {
                args,
                partition_by,
                order_by,
                ..
            } => args
                .iter()
                .chain(partition_by.iter())
                .chain(order_by.iter().map(|s| &s.expr))
                .collect(),
        }
    }

    /// Rebuild this node with every child passed through `f`.
    pub fn map_children(&self, f: &mut dyn FnMut(&Expr) -> Result<Expr>) -> Result<Expr> {
        fn map_vec(v: &[Expr], f: &mut dyn FnMut(&Expr) -> Result<Expr>) -> Result<Vec<Expr>> {
            v.iter().map(|e| f(e)).collect()
        }
        Ok(match self {
            Expr::Column(_) | Expr::Literal(_) => self.clone(),
            Expr::BinaryExpr { left, op, right } => Expr::BinaryExpr {
                left: Arc::new(f(left)?),
                op: *op,
                right: Arc::new(f(right)?),
            },
            Expr::Unary { op, expr } => Expr::Unary {
                op: *op,
                expr: Arc::new(f(expr)?),
            },
            Expr::InList {
                expr,
                list,
                negated,
            } => Expr::InList {
                expr: Arc::new(f(expr)?),
                list: map_vec(list, f)?,
                negated: *negated,
            },
            Expr::Cast { expr, to_type } => Expr::Cast {
                expr: Arc::new(f(expr)?),
                to_type: to_type.clone(),
            },
            Expr::Alias { expr, name } => Expr::Alias {
                expr: Arc::new(f(expr)?),
                name: name.clone(),
            },
            Expr::ScalarFunction { func, args } => Expr::ScalarFunction {
                func: *func,
                args: map_vec(args, f)?,
            },
            Expr::AggregateCall {
                func,
                args,
                distinct,
            } => Expr::AggregateCall {
                func: *func,
                args: map_vec(args, f)?,
                distinct: *distinct,
            },
            Expr::WindowCall {
                func,
                args,
                partition_by,
                order_by,
            } => Expr::WindowCall {
                func: *func,
                args: map_vec(args, f)?,
                partition_by: map_vec(partition_by, f)?,
                order_by: order_by
                    .iter()
                    .map(|s| Ok(SortExpr::new(f(&s.expr)?, s.asc, s.nulls_first)))
                    .collect::<Result<Vec<_>>>()?,
            },
        })
    }

    /// Bottom-up rewrite: children first, then `f` on the rebuilt node.
    pub fn transform_up(&self, f: &mut dyn FnMut(Expr) -> Result<Expr>) -> Result<Expr> {
        let rebuilt = self.map_children(&mut |c| c.transform_up(&mut *f))?;
        f(rebuilt)
    }

    /// True if `pred` holds for this node or any descendant.
    pub fn exists(&self, pred: &dyn Fn(&Expr) -> bool) -> bool {
        pred(self) || self.children().into_iter().any(|c| c.exists(pred))
    }

    /// Column names referenced anywhere in the tree.
    pub fn column_refs(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns(&self, out: &mut BTreeSet<String>) {
        if let Expr::Column(c) = self {
            out.insert(c.clone());
        }
        for c in self.children() {
            c.collect_columns(out);
        }
    }

    pub fn contains_aggregate(&self) -> bool {
        self.exists(&|e| matches!(e, Expr::AggregateCall { .. }))
    }

    pub fn contains_window(&self) -> bool {
        self.exists(&|e| matches!(e, Expr::WindowCall { .. }))
    }
}

fn fmt_list(f: &mut fmt::Formatter<'_>, items: &[Expr]) -> fmt::Result {
    for (i, e) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{e}")?;
    }
    Ok(())
}

fn fmt_operand(f: &mut fmt::Formatter<'_>, e: &Expr) -> fmt::Result {
    match e {
        Expr::BinaryExpr { .. } => write!(f, "({e})"),
        _ => write!(f, "{e}"),
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Column(c) => f.write_str(c),
            Expr::Literal(v) => write!(f, "{v}"),
            Expr::BinaryExpr { left, op, right } => {
                fmt_operand(f, left)?;
                write!(f, " {op} ")?;
                fmt_operand(f, right)
            }
            Expr::Unary { op, expr } => match op {
                UnaryOp::Not => write!(f, "NOT {expr}"),
                UnaryOp::Negative => write!(f, "(- {expr})"),
                UnaryOp::IsNull => write!(f, "{expr} IS NULL"),
                UnaryOp::IsNotNull => write!(f, "{expr} IS NOT NULL"),
            },
            Expr::InList {
                expr,
                list,
                negated,
            } => {
                write!(f, "{expr} {}IN (", if *negated { "NOT " } else { "" })?;
                fmt_list(f, list)?;
                f.write_str(")")
            }
            Expr::Cast { expr, to_type } => write!(f, "CAST({expr} AS {to_type})"),
            Expr::Alias { expr, name } => write!(f, "{expr} AS {name}"),
            Expr::ScalarFunction { func, args } => {
                write!(f, "{func}(")?;
                fmt_list(f, args)?;
                f.write_str(")")
            }
            Expr::AggregateCall {
                func,
                args,
                distinct,
            } => {
                write!(f, "{func}(")?;
                if *distinct {
                    f.write_str("DISTINCT ")?;
                }
                if args.is_empty() {
                    f.write_str("*")?;
                } else {
                    fmt_list(f, args)?;
                }
                f.write_str(")")
            }
            Expr::WindowCall {
                func,
                args,
                partition_by,
                order_by,
            } => {
                write!(f, "{func}(")?;
                if args.is_empty() && matches!(func, WindowFunction::Aggregate(_)) {
                    f.write_str("*")?;
                } else {
                    fmt_list(f, args)?;
                }
                f.write_str(") OVER (")?;
                let mut sep = "";
                if !partition_by.is_empty() {
                    f.write_str("PARTITION BY ")?;
                    fmt_list(f, partition_by)?;
                    sep = " ";
                }
                if !order_by.is_empty() {
                    write!(f, "{sep}ORDER BY ")?;
                    for (i, s) in order_by.iter().enumerate() {
                        if i > 0 {
                            f.write_str(", ")?;
                        }
                        write!(f, "{s}")?;
                    }
                }
                f.write_str(")")
            }
        }
    }
}

macro_rules! impl_binary_op {
    ($trait:ident, $method:ident, $op:expr) => {
        impl std::ops::$trait for Expr {
            type Output = Expr;
            fn $method(self, rhs: Expr) -> Expr {
                self.binary($op, rhs)
            }
        }
    };
}

impl_binary_op!(Add, add, Operator::Plus);
impl_binary_op!(Sub, sub, Operator::Minus);
impl_binary_op!(Mul, mul, Operator::Multiply);
impl_binary_op!(Div, div, Operator::Divide);
impl_binary_op!(Rem, rem, Operator::Modulo);

impl std::ops::Not for Expr {
    type Output = Expr;
    fn not(self) -> Expr {
        self.unary(UnaryOp::Not)
    }
}

impl std::ops::Neg for Expr {
    type Output = Expr;
    fn neg(self) -> Expr {
        self.unary(UnaryOp::Negative)
    }
}

/// Split `a AND b AND c` into its conjuncts.
pub fn split_conjunction(e: &Expr) -> Vec<Expr> {
    match e {
        Expr::BinaryExpr {
            left,
            op: Operator::And,
            right,
        } => {
            let mut v = split_conjunction(left);
            v.extend(split_conjunction(right));
            v
        }
        Expr::Alias { expr, .. } => split_conjunction(expr),
        other => vec![other.clone()],
    }
}

/// Fold conjuncts back into one predicate; `None` when empty.
pub fn conjunction(exprs: impl IntoIterator<Item = Expr>) -> Option<Expr> {
    exprs.into_iter().reduce(|acc, e| acc.and(e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr_fn::{col, lit, sum};

    #[test]
    fn display_names_are_stable() {
        let e = (col("a") + lit(1i64)) * col("b");
        assert_eq!(e.display_name(), "(a + 1) * b");
        assert_eq!(sum(col("x")).distinct().display_name(), "sum(DISTINCT x)");
        assert_eq!(col("x").alias("y").alias("z").display_name(), "z");
    }

    #[test]
    fn conjunction_round_trips() {
        let parts = vec![col("a").gt(lit(1i64)), col("b").is_null(), !col("c")];
        let joined = conjunction(parts.clone()).expect("non-empty");
        assert_eq!(split_conjunction(&joined), parts);
        assert!(conjunction(Vec::new()).is_none());
    }

    #[test]
    fn transform_up_shares_nothing_mutable() {
        let e = col("a").eq(lit(1i64));
        let renamed = e
            .transform_up(&mut |e| {
                Ok(match e {
                    Expr::Column(c) if c == "a" => Expr::Column("b".into()),
                    other => other,
                })
            })
            .expect("rewrite");
        assert_eq!(e.column_refs().into_iter().collect::<Vec<_>>(), vec!["a"]);
        assert_eq!(renamed.column_refs().into_iter().collect::<Vec<_>>(), vec!["b"]);
    }
}
