//! Logical layer of the engine.
//!
//! Architecture role:
//! - expression model and typing rules
//! - immutable logical plan tree with validating constructors
//! - builder used by the DataFrame API
//! - rule-based optimizer and explain rendering
//!
//! Key modules:
//! - [`expr`] / [`expr_fn`]
//! - [`logical_plan`] / [`builder`]
//! - [`optimizer`]

pub mod analyzer;
pub mod builder;
pub mod explain;
pub mod expr;
pub mod expr_fn;
pub mod logical_plan;
pub mod optimizer;
pub mod scalar;

pub use builder::{JoinKeys, LogicalPlanBuilder};
pub use explain::explain_logical;
pub use expr::{
    AggregateFunction, Expr, Operator, ScalarFunc, SortExpr, UnaryOp, WindowFunction, conjunction,
    split_conjunction,
};
pub use logical_plan::{JoinType, LogicalPlan, Partitioning, SetOpKind};
pub use optimizer::{Optimizer, OptimizerConfig, OptimizerRule};
pub use scalar::ScalarValue;
