//! Immutable logical operator tree.
//!
//! Every node caches its output schema, computed by the `try_new`-style
//! constructors from the children's schemas and the node's parameters. Nodes
//! are never mutated: optimizer rules build replacements through the same
//! constructors (or [`LogicalPlan::with_new_inputs`]), so the cached schema is
//! always recomputed.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use arrow_schema::{DataType, Field, Schema, SchemaRef};
use lfq_common::{LfqError, Result};
use serde::{Deserialize, Serialize};

use crate::analyzer::{comparison_coercion, resolve_column};
use crate::expr::{Expr, SortExpr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JoinType {
    Inner,
    Left,
    Right,
    Full,
    /// Left rows with at least one match; output has the left schema.
    Semi,
    /// Left rows without any match; output has the left schema.
    Anti,
}

impl JoinType {
    /// Output contains right columns.
    pub fn projects_right(self) -> bool {
        !matches!(self, JoinType::Semi | JoinType::Anti)
    }

    /// Every left row appears in the output at least once.
    pub fn preserves_left(self) -> bool {
        matches!(self, JoinType::Left | JoinType::Full)
    }

    /// Every right row appears in the output at least once.
    pub fn preserves_right(self) -> bool {
        matches!(self, JoinType::Right | JoinType::Full)
    }
}

impl fmt::Display for JoinType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JoinType::Inner => "inner",
            JoinType::Left => "left",
            JoinType::Right => "right",
            JoinType::Full => "full",
            JoinType::Semi => "semi",
            JoinType::Anti => "anti",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for JoinType {
    type Err = LfqError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "inner" => Ok(JoinType::Inner),
            "left" => Ok(JoinType::Left),
            "right" => Ok(JoinType::Right),
            "full" | "outer" => Ok(JoinType::Full),
            "semi" => Ok(JoinType::Semi),
            "anti" => Ok(JoinType::Anti),
            other => Err(LfqError::BuilderArgument(format!(
                "unknown join type '{other}', expected inner|left|right|full|semi|anti"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SetOpKind {
    Intersect,
    Except,
}

/// Requested output partitioning of a `Repartition` node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Partitioning {
    RoundRobin(usize),
    Hash(Vec<Expr>, usize),
}

impl Partitioning {
    pub fn partition_count(&self) -> usize {
        match self {
            Partitioning::RoundRobin(n) | Partitioning::Hash(_, n) => *n,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogicalPlan {
    TableScan {
        table: String,
        /// Full schema of the source.
        source_schema: SchemaRef,
        /// Indices into `source_schema`; `None` reads every column.
        projection: Option<Vec<usize>>,
        /// Predicates the source may use to skip data. Always re-applied.
        filters: Vec<Expr>,
        /// Row-count hint; the source may return more.
        fetch: Option<usize>,
        schema: SchemaRef,
    },
    Projection {
        exprs: Vec<Expr>,
        input: Arc<LogicalPlan>,
        schema: SchemaRef,
    },
    Filter {
        predicate: Expr,
        input: Arc<LogicalPlan>,
    },
    Aggregate {
        group_exprs: Vec<Expr>,
        aggr_exprs: Vec<Expr>,
        input: Arc<LogicalPlan>,
        schema: SchemaRef,
    },
    Sort {
        exprs: Vec<SortExpr>,
        input: Arc<LogicalPlan>,
    },
    Join {
        left: Arc<LogicalPlan>,
        right: Arc<LogicalPlan>,
        /// Equi-join key pairs, left expression over the left schema.
        on: Vec<(Expr, Expr)>,
        /// Residual predicate over the joined (left ++ right) schema.
        filter: Option<Expr>,
        join_type: JoinType,
        schema: SchemaRef,
    },
    Limit {
        skip: usize,
        fetch: Option<usize>,
        input: Arc<LogicalPlan>,
    },
    /// Bag union (`UNION ALL`) of two or more inputs.
    Union {
        inputs: Vec<Arc<LogicalPlan>>,
        schema: SchemaRef,
    },
    SetOperation {
        op: SetOpKind,
        /// Bag semantics when true, set semantics otherwise.
        all: bool,
        left: Arc<LogicalPlan>,
        right: Arc<LogicalPlan>,
        schema: SchemaRef,
    },
    Distinct {
        input: Arc<LogicalPlan>,
    },
    Window {
        window_exprs: Vec<Expr>,
        input: Arc<LogicalPlan>,
        schema: SchemaRef,
    },
    Unnest {
        columns: Vec<String>,
        preserve_nulls: bool,
        input: Arc<LogicalPlan>,
        schema: SchemaRef,
    },
    Repartition {
        partitioning: Partitioning,
        input: Arc<LogicalPlan>,
    },
}

/// Field names must be unique within one node's output.
fn check_unique(fields: &[Field], what: &str) -> Result<()> {
    let mut seen = HashSet::new();
    for f in fields {
        if !seen.insert(f.name().as_str()) {
            return Err(LfqError::Schema(format!(
                "duplicate output column '{}' in {what}",
                f.name()
            )));
        }
    }
    Ok(())
}

fn exprs_to_fields(exprs: &[Expr], input: &Schema) -> Result<Vec<Field>> {
    exprs.iter().map(|e| e.to_field(input)).collect()
}

/// Rename right-side fields that collide with left names by appending
/// `_right` until the name is unique.
pub fn join_output_fields(left: &Schema, right: &Schema, join_type: JoinType) -> Vec<Field> {
    let mut used: HashSet<String> = left.fields().iter().map(|f| f.name().clone()).collect();
    let mut fields: Vec<Field> = left
        .fields()
        .iter()
        .map(|f| {
            let nullable = f.is_nullable() || join_type.preserves_right();
            f.as_ref().clone().with_nullable(nullable)
        })
        .collect();
    if !join_type.projects_right() {
        return fields;
    }
    for f in right.fields() {
        let mut name = f.name().clone();
        while used.contains(&name) {
            name.push_str("_right");
        }
        used.insert(name.clone());
        let nullable = f.is_nullable() || join_type.preserves_left();
        fields.push(Field::new(name, f.data_type().clone(), nullable));
    }
    fields
}

/// Schema of a set operation: names from `left`, nullability OR-ed.
fn set_op_schema(left: &Schema, right: &Schema, what: &str) -> Result<Schema> {
    if left.fields().len() != right.fields().len() {
        return Err(LfqError::Schema(format!(
            "{what} inputs have {} and {} columns",
            left.fields().len(),
            right.fields().len()
        )));
    }
    let fields = left
        .fields()
        .iter()
        .zip(right.fields().iter())
        .enumerate()
        .map(|(i, (l, r))| {
            if l.data_type() != r.data_type() {
                return Err(LfqError::Schema(format!(
                    "{what} column {i} ('{}') is {} on the left and {} on the right",
                    l.name(),
                    l.data_type(),
                    r.data_type()
                )));
            }
            Ok(l.as_ref()
                .clone()
                .with_nullable(l.is_nullable() || r.is_nullable()))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Schema::new(fields))
}

impl LogicalPlan {
    pub fn table_scan(
        table: impl Into<String>,
        source_schema: SchemaRef,
        projection: Option<Vec<usize>>,
        filters: Vec<Expr>,
        fetch: Option<usize>,
    ) -> Result<Self> {
        let schema = match &projection {
            Some(indices) => {
                for &i in indices {
                    if i >= source_schema.fields().len() {
                        return Err(LfqError::Schema(format!(
                            "projection index {i} out of range for {} columns",
                            source_schema.fields().len()
                        )));
                    }
                }
                Arc::new(source_schema.project(indices)?)
            }
            None => Arc::clone(&source_schema),
        };
        for f in &filters {
            f.data_type(&schema)?;
        }
        Ok(LogicalPlan::TableScan {
            table: table.into(),
            source_schema,
            projection,
            filters,
            fetch,
            schema,
        })
    }

    pub fn projection(input: Arc<LogicalPlan>, exprs: Vec<Expr>) -> Result<Self> {
        for e in &exprs {
            if e.contains_aggregate() {
                return Err(LfqError::Schema(format!(
                    "aggregate expression '{e}' is not allowed in a projection; use aggregate()"
                )));
            }
            if e.contains_window() {
                return Err(LfqError::Schema(format!(
                    "window expression '{e}' must be computed by a Window node"
                )));
            }
        }
        let fields = exprs_to_fields(&exprs, input.schema())?;
        check_unique(&fields, "projection")?;
        Ok(LogicalPlan::Projection {
            exprs,
            input,
            schema: Arc::new(Schema::new(fields)),
        })
    }

    pub fn filter(input: Arc<LogicalPlan>, predicate: Expr) -> Result<Self> {
        if predicate.contains_aggregate() || predicate.contains_window() {
            return Err(LfqError::Schema(format!(
                "filter predicate '{predicate}' may not contain aggregate or window calls"
            )));
        }
        match predicate.data_type(input.schema())? {
            DataType::Boolean | DataType::Null => {}
            other => {
                return Err(LfqError::Schema(format!(
                    "filter predicate '{predicate}' has type {other}, expected Boolean"
                )));
            }
        }
        Ok(LogicalPlan::Filter { predicate, input })
    }

    pub fn aggregate(
        input: Arc<LogicalPlan>,
        group_exprs: Vec<Expr>,
        aggr_exprs: Vec<Expr>,
    ) -> Result<Self> {
        for g in &group_exprs {
            if g.contains_aggregate() || g.contains_window() {
                return Err(LfqError::Schema(format!(
                    "group-by expression '{g}' may not contain aggregate or window calls"
                )));
            }
        }
        for a in &aggr_exprs {
            if !matches!(a.clone().unalias(), Expr::AggregateCall { .. }) {
                return Err(LfqError::Schema(format!(
                    "'{a}' is not an aggregate call"
                )));
            }
            let nested = match a.clone().unalias() {
                Expr::AggregateCall { args, .. } => args.iter().any(|x| x.contains_aggregate()),
                _ => false,
            };
            if nested {
                return Err(LfqError::Schema(format!(
                    "nested aggregate calls are not supported: '{a}'"
                )));
            }
        }
        let mut fields = exprs_to_fields(&group_exprs, input.schema())?;
        fields.extend(exprs_to_fields(&aggr_exprs, input.schema())?);
        check_unique(&fields, "aggregate")?;
        Ok(LogicalPlan::Aggregate {
            group_exprs,
            aggr_exprs,
            input,
            schema: Arc::new(Schema::new(fields)),
        })
    }

    pub fn sort(input: Arc<LogicalPlan>, exprs: Vec<SortExpr>) -> Result<Self> {
        if exprs.is_empty() {
            return Err(LfqError::BuilderArgument(
                "sort requires at least one key".to_string(),
            ));
        }
        for s in &exprs {
            s.expr.data_type(input.schema())?;
        }
        Ok(LogicalPlan::Sort { exprs, input })
    }

    pub fn join(
        left: Arc<LogicalPlan>,
        right: Arc<LogicalPlan>,
        on: Vec<(Expr, Expr)>,
        filter: Option<Expr>,
        join_type: JoinType,
    ) -> Result<Self> {
        for (l, r) in &on {
            let lt = l.data_type(left.schema())?;
            let rt = r.data_type(right.schema())?;
            if comparison_coercion(&lt, &rt).is_none() {
                return Err(LfqError::Schema(format!(
                    "join key {l} ({lt}) is not comparable with {r} ({rt})"
                )));
            }
        }
        // The residual filter sees both sides even for semi/anti joins.
        let full = Schema::new(join_output_fields(
            left.schema(),
            right.schema(),
            JoinType::Inner,
        ));
        if let Some(f) = &filter {
            match f.data_type(&full)? {
                DataType::Boolean | DataType::Null => {}
                other => {
                    return Err(LfqError::Schema(format!(
                        "join filter '{f}' has type {other}, expected Boolean"
                    )));
                }
            }
        }
        let schema = Schema::new(join_output_fields(left.schema(), right.schema(), join_type));
        Ok(LogicalPlan::Join {
            left,
            right,
            on,
            filter,
            join_type,
            schema: Arc::new(schema),
        })
    }

    pub fn limit(input: Arc<LogicalPlan>, skip: usize, fetch: Option<usize>) -> Self {
        LogicalPlan::Limit { skip, fetch, input }
    }

    pub fn union(inputs: Vec<Arc<LogicalPlan>>) -> Result<Self> {
        let Some(first) = inputs.first() else {
            return Err(LfqError::BuilderArgument(
                "union requires at least one input".to_string(),
            ));
        };
        let mut schema = first.schema().as_ref().clone();
        for other in &inputs[1..] {
            schema = set_op_schema(&schema, other.schema(), "union")?;
        }
        Ok(LogicalPlan::Union {
            inputs,
            schema: Arc::new(schema),
        })
    }

    pub fn set_operation(
        op: SetOpKind,
        all: bool,
        left: Arc<LogicalPlan>,
        right: Arc<LogicalPlan>,
    ) -> Result<Self> {
        let what = match op {
            SetOpKind::Intersect => "intersect",
            SetOpKind::Except => "except",
        };
        let mut schema = set_op_schema(left.schema(), right.schema(), what)?;
        if op == SetOpKind::Except {
            // Rows come only from the left input.
            schema = left.schema().as_ref().clone();
        }
        Ok(LogicalPlan::SetOperation {
            op,
            all,
            left,
            right,
            schema: Arc::new(schema),
        })
    }

    pub fn distinct(input: Arc<LogicalPlan>) -> Self {
        LogicalPlan::Distinct { input }
    }

    pub fn window(input: Arc<LogicalPlan>, window_exprs: Vec<Expr>) -> Result<Self> {
        for w in &window_exprs {
            if !matches!(w.clone().unalias(), Expr::WindowCall { .. }) {
                return Err(LfqError::Schema(format!("'{w}' is not a window call")));
            }
        }
        let mut fields: Vec<Field> = input
            .schema()
            .fields()
            .iter()
            .map(|f| f.as_ref().clone())
            .collect();
        fields.extend(exprs_to_fields(&window_exprs, input.schema())?);
        check_unique(&fields, "window")?;
        Ok(LogicalPlan::Window {
            window_exprs,
            input,
            schema: Arc::new(Schema::new(fields)),
        })
    }

    pub fn unnest(
        input: Arc<LogicalPlan>,
        columns: Vec<String>,
        preserve_nulls: bool,
    ) -> Result<Self> {
        if columns.is_empty() {
            return Err(LfqError::BuilderArgument(
                "unnest requires at least one column".to_string(),
            ));
        }
        let mut fields: Vec<Field> = input
            .schema()
            .fields()
            .iter()
            .map(|f| f.as_ref().clone())
            .collect();
        let mut seen = HashSet::new();
        for c in &columns {
            if !seen.insert(c.as_str()) {
                return Err(LfqError::BuilderArgument(format!(
                    "column '{c}' listed twice for unnest"
                )));
            }
            let (idx, field) = resolve_column(input.schema(), c)?;
            let element = match field.data_type() {
                DataType::List(inner) | DataType::LargeList(inner) => inner.data_type().clone(),
                other => {
                    return Err(LfqError::Schema(format!(
                        "cannot unnest column '{c}' of type {other}; expected a list"
                    )));
                }
            };
            fields[idx] = Field::new(c.clone(), element, true);
        }
        Ok(LogicalPlan::Unnest {
            columns,
            preserve_nulls,
            input,
            schema: Arc::new(Schema::new(fields)),
        })
    }

    pub fn repartition(input: Arc<LogicalPlan>, partitioning: Partitioning) -> Result<Self> {
        if partitioning.partition_count() == 0 {
            return Err(LfqError::BuilderArgument(
                "repartition requires at least one partition".to_string(),
            ));
        }
        if let Partitioning::Hash(exprs, _) = &partitioning {
            if exprs.is_empty() {
                return Err(LfqError::BuilderArgument(
                    "hash repartition requires at least one expression".to_string(),
                ));
            }
            for e in exprs {
                e.data_type(input.schema())?;
            }
        }
        Ok(LogicalPlan::Repartition {
            partitioning,
            input,
        })
    }

    /// Cached output schema.
    pub fn schema(&self) -> &SchemaRef {
        match self {
            LogicalPlan::TableScan { schema, .. }
            | LogicalPlan::Projection { schema, .. }
            | LogicalPlan::Aggregate { schema, .. }
            | LogicalPlan::Join { schema, .. }
            | LogicalPlan::Union { schema, .. }
            | LogicalPlan::SetOperation { schema, .. }
            | LogicalPlan::Window { schema, .. }
            | LogicalPlan::Unnest { schema, .. } => schema,
            LogicalPlan::Filter { input, .. }
            | LogicalPlan::Sort { input, .. }
            | LogicalPlan::Limit { input, .. }
            | LogicalPlan::Distinct { input }
            | LogicalPlan::Repartition { input, .. } => input.schema(),
        }
    }

    /// Node name used in explain output and log lines.
    pub fn name(&self) -> &'static str {
        match self {
            LogicalPlan::TableScan { .. } => "TableScan",
            LogicalPlan::Projection { .. } => "Projection",
            LogicalPlan::Filter { .. } => "Filter",
            LogicalPlan::Aggregate { .. } => "Aggregate",
            LogicalPlan::Sort { .. } => "Sort",
            LogicalPlan::Join { .. } => "Join",
            LogicalPlan::Limit { .. } => "Limit",
            LogicalPlan::Union { .. } => "Union",
            LogicalPlan::SetOperation { .. } => "SetOperation",
            LogicalPlan::Distinct { .. } => "Distinct",
            LogicalPlan::Window { .. } => "Window",
            LogicalPlan::Unnest { .. } => "Unnest",
            LogicalPlan::Repartition { .. } => "Repartition",
        }
    }

    pub fn inputs(&self) -> Vec<&Arc<LogicalPlan>> {
        match self {
            LogicalPlan::TableScan { .. } => vec![],
            LogicalPlan::Projection { input, .. }
            | LogicalPlan::Filter { input, .. }
            | LogicalPlan::Aggregate { input, .. }
            | LogicalPlan::Sort { input, .. }
            | LogicalPlan::Limit { input, .. }
            | LogicalPlan::Distinct { input }
            | LogicalPlan::Window { input, .. }
            | LogicalPlan::Unnest { input, .. }
            | LogicalPlan::Repartition { input, .. } => vec![input],
            LogicalPlan::Join { left, right, .. }
            | LogicalPlan::SetOperation { left, right, .. } => vec![left, right],
            LogicalPlan::Union { inputs, .. } => inputs.iter().collect(),
        }
    }

    /// Same operator and parameters over new inputs; the schema is re-derived.
    pub fn with_new_inputs(&self, mut inputs: Vec<Arc<LogicalPlan>>) -> Result<LogicalPlan> {
        let expected = self.inputs().len();
        if inputs.len() != expected {
            return Err(LfqError::OptimizationInvariant(format!(
                "{} expects {expected} inputs, got {}",
                self.name(),
                inputs.len()
            )));
        }
        match self {
            LogicalPlan::TableScan { .. } => Ok(self.clone()),
            LogicalPlan::Projection { exprs, .. } => {
                LogicalPlan::projection(inputs.remove(0), exprs.clone())
            }
            LogicalPlan::Filter { predicate, .. } => {
                LogicalPlan::filter(inputs.remove(0), predicate.clone())
            }
            LogicalPlan::Aggregate {
                group_exprs,
                aggr_exprs,
                ..
            } => LogicalPlan::aggregate(inputs.remove(0), group_exprs.clone(), aggr_exprs.clone()),
            LogicalPlan::Sort { exprs, .. } => LogicalPlan::sort(inputs.remove(0), exprs.clone()),
            LogicalPlan::Join {
                on,
                filter,
                join_type,
                ..
            } => {
                let left = inputs.remove(0);
                let right = inputs.remove(0);
                LogicalPlan::join(left, right, on.clone(), filter.clone(), *join_type)
            }
            LogicalPlan::Limit { skip, fetch, .. } => Ok(LogicalPlan::limit(inputs.remove(0), *skip, *fetch)),
            LogicalPlan::Union { .. } => LogicalPlan::union(inputs),
            LogicalPlan::SetOperation { op, all, .. } => {
                let left = inputs.remove(0);
                let right = inputs.remove(0);
                LogicalPlan::set_operation(*op, *all, left, right)
            }
            LogicalPlan::Distinct { .. } => Ok(LogicalPlan::distinct(inputs.remove(0))),
            LogicalPlan::Window { window_exprs, .. } => {
                LogicalPlan::window(inputs.remove(0), window_exprs.clone())
            }
            LogicalPlan::Unnest {
                columns,
                preserve_nulls,
                ..
            } => LogicalPlan::unnest(inputs.remove(0), columns.clone(), *preserve_nulls),
            LogicalPlan::Repartition { partitioning, .. } => {
                LogicalPlan::repartition(inputs.remove(0), partitioning.clone())
            }
        }
    }

    /// Expressions evaluated by this node (not its children).
    pub fn expressions(&self) -> Vec<&Expr> {
        match self {
            LogicalPlan::TableScan { filters, .. } => filters.iter().collect(),
            LogicalPlan::Projection { exprs, .. } => exprs.iter().collect(),
            LogicalPlan::Filter { predicate, .. } => vec![predicate],
            LogicalPlan::Aggregate {
                group_exprs,
                aggr_exprs,
                ..
            } => group_exprs.iter().chain(aggr_exprs.iter()).collect(),
            LogicalPlan::Sort { exprs, .. } => exprs.iter().map(|s| &s.expr).collect(),
            LogicalPlan::Join { on, filter, .. } => on
                .iter()
                .flat_map(|(l, r)| [l, r])
                .chain(filter.iter())
                .collect(),
            LogicalPlan::Window { window_exprs, .. } => window_exprs.iter().collect(),
            LogicalPlan::Repartition {
                partitioning: Partitioning::Hash(exprs, _),
                ..
            } => exprs.iter().collect(),
            LogicalPlan::Limit { .. }
            | LogicalPlan::Union { .. }
            | LogicalPlan::SetOperation { .. }
            | LogicalPlan::Distinct { .. }
            | LogicalPlan::Unnest { .. }
            | LogicalPlan::Repartition { .. } => vec![],
        }
    }

    /// Names of the output columns, in order.
    pub fn output_columns(&self) -> Vec<String> {
        self.schema()
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect()
    }
}

impl fmt::Display for LogicalPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&crate::explain::explain_logical(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr_fn::{col, lit, sum};

    fn scan(name: &str, fields: Vec<Field>) -> Arc<LogicalPlan> {
        Arc::new(
            LogicalPlan::table_scan(name, Arc::new(Schema::new(fields)), None, vec![], None)
                .expect("scan"),
        )
    }

    #[test]
    fn join_renames_colliding_right_columns() {
        let l = scan(
            "l",
            vec![
                Field::new("id", DataType::Int64, false),
                Field::new("v", DataType::Utf8, false),
            ],
        );
        let r = scan(
            "r",
            vec![
                Field::new("id", DataType::Int64, false),
                Field::new("v", DataType::Utf8, false),
            ],
        );
        let join = LogicalPlan::join(
            l,
            r,
            vec![(col("id"), col("id"))],
            None,
            JoinType::Left,
        )
        .expect("join");
        assert_eq!(join.output_columns(), vec!["id", "v", "id_right", "v_right"]);
        assert!(join.schema().field(3).is_nullable());
        assert!(!join.schema().field(0).is_nullable());
    }

    #[test]
    fn union_requires_matching_types() {
        let a = scan("a", vec![Field::new("x", DataType::Int64, false)]);
        let b = scan("b", vec![Field::new("y", DataType::Utf8, false)]);
        let err = LogicalPlan::union(vec![a.clone(), b]).expect_err("mismatch");
        assert!(matches!(err, LfqError::Schema(_)));
        let c = scan("c", vec![Field::new("z", DataType::Int64, true)]);
        let u = LogicalPlan::union(vec![a, c]).expect("union");
        assert_eq!(u.output_columns(), vec!["x"]);
        assert!(u.schema().field(0).is_nullable());
    }

    #[test]
    fn with_new_inputs_recomputes_schema() {
        let a = scan("a", vec![Field::new("x", DataType::Int32, false)]);
        let p = LogicalPlan::projection(a, vec![(col("x") + lit(1i64)).alias("y")]).expect("proj");
        assert_eq!(p.schema().field(0).data_type(), &DataType::Int64);
        let wider = scan("b", vec![Field::new("x", DataType::Float64, true)]);
        let p2 = p.with_new_inputs(vec![wider]).expect("rebuild");
        assert_eq!(p2.schema().field(0).data_type(), &DataType::Float64);
        assert!(p2.schema().field(0).is_nullable());
    }

    #[test]
    fn aggregate_rejects_duplicate_names() {
        let a = scan("a", vec![Field::new("x", DataType::Int64, false)]);
        let err = LogicalPlan::aggregate(
            a,
            vec![col("x")],
            vec![sum(col("x")).alias("x")],
        )
        .expect_err("duplicate");
        assert!(err.to_string().contains("duplicate"));
    }
}
