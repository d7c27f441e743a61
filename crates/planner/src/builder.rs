//! Incremental, side-effect-free construction of logical plans.
//!
//! Each builder call validates its arguments against the current schema and
//! returns a new builder wrapping a new plan node; the previous plan is left
//! untouched and stays shared by reference.

use std::sync::Arc;

use arrow_schema::SchemaRef;
use lfq_common::{LfqError, Result};

use crate::analyzer::resolve_column;
use crate::expr::{Expr, SortExpr, conjunction};
use crate::expr_fn::{coalesce, col};
use crate::logical_plan::{JoinType, LogicalPlan, Partitioning, SetOpKind};

/// Equi-join key specification accepted by joins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinKeys {
    /// Same column names on both sides; emitted once in the output.
    On(Vec<String>),
    /// Pairwise keys with possibly different names.
    Columns { left: Vec<String>, right: Vec<String> },
}

impl JoinKeys {
    /// Validate the "exactly one form" rule for optional key arguments.
    pub fn try_new(
        on: Option<Vec<String>>,
        left_on: Option<Vec<String>>,
        right_on: Option<Vec<String>>,
    ) -> Result<Self> {
        match (on, left_on, right_on) {
            (Some(_), Some(_), _) | (Some(_), _, Some(_)) => Err(LfqError::BuilderArgument(
                "specify either `on` or `left_on`/`right_on`, not both".to_string(),
            )),
            (Some(on), None, None) => {
                if on.is_empty() {
                    return Err(LfqError::BuilderArgument(
                        "`on` must name at least one column".to_string(),
                    ));
                }
                Ok(JoinKeys::On(on))
            }
            (None, Some(left), Some(right)) => {
                if left.is_empty() || left.len() != right.len() {
                    return Err(LfqError::BuilderArgument(format!(
                        "`left_on` and `right_on` must be non-empty and equally long, got {} and {}",
                        left.len(),
                        right.len()
                    )));
                }
                Ok(JoinKeys::Columns { left, right })
            }
            (None, Some(_), None) | (None, None, Some(_)) => Err(LfqError::BuilderArgument(
                "`left_on` and `right_on` must be given together".to_string(),
            )),
            (None, None, None) => Err(LfqError::BuilderArgument(
                "join requires `on` or `left_on`/`right_on`".to_string(),
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogicalPlanBuilder {
    plan: Arc<LogicalPlan>,
}

impl LogicalPlanBuilder {
    pub fn from(plan: Arc<LogicalPlan>) -> Self {
        Self { plan }
    }

    /// Full scan of `table` with the given source schema.
    pub fn scan(table: impl Into<String>, source_schema: SchemaRef) -> Result<Self> {
        Ok(Self::from(Arc::new(LogicalPlan::table_scan(
            table,
            source_schema,
            None,
            vec![],
            None,
        )?)))
    }

    pub fn schema(&self) -> &SchemaRef {
        self.plan.schema()
    }

    pub fn plan(&self) -> &Arc<LogicalPlan> {
        &self.plan
    }

    pub fn build(self) -> Arc<LogicalPlan> {
        self.plan
    }

    fn wrap(plan: LogicalPlan) -> Self {
        Self::from(Arc::new(plan))
    }

    /// Project `exprs`. Window calls are computed by an inserted Window node
    /// and referenced by name from the projection.
    pub fn select(self, exprs: Vec<Expr>) -> Result<Self> {
        let exprs: Vec<Expr> = exprs.into_iter().map(strip_nested_aliases).collect::<Result<_>>()?;
        let mut window_exprs: Vec<Expr> = Vec::new();
        for e in &exprs {
            collect_window_calls(e, &mut window_exprs);
        }
        let input = if window_exprs.is_empty() {
            self.plan
        } else {
            Arc::new(LogicalPlan::window(self.plan, window_exprs.clone())?)
        };
        let exprs = if window_exprs.is_empty() {
            exprs
        } else {
            exprs
                .iter()
                .map(|e| {
                    e.transform_up(&mut |node| {
                        Ok(match node {
                            w @ Expr::WindowCall { .. } => Expr::Column(w.display_name()),
                            other => other,
                        })
                    })
                })
                .collect::<Result<Vec<_>>>()?
        };
        Ok(Self::wrap(LogicalPlan::projection(input, exprs)?))
    }

    /// Keep rows satisfying every predicate.
    pub fn filter(self, predicates: Vec<Expr>) -> Result<Self> {
        let predicate = conjunction(predicates).ok_or_else(|| {
            LfqError::BuilderArgument("filter requires at least one predicate".to_string())
        })?;
        Ok(Self::wrap(LogicalPlan::filter(self.plan, predicate)?))
    }

    pub fn aggregate(self, group_exprs: Vec<Expr>, aggr_exprs: Vec<Expr>) -> Result<Self> {
        let group_exprs = group_exprs
            .into_iter()
            .map(strip_nested_aliases)
            .collect::<Result<_>>()?;
        let aggr_exprs = aggr_exprs
            .into_iter()
            .map(strip_nested_aliases)
            .collect::<Result<_>>()?;
        Ok(Self::wrap(LogicalPlan::aggregate(
            self.plan,
            group_exprs,
            aggr_exprs,
        )?))
    }

    pub fn sort(self, exprs: Vec<SortExpr>) -> Result<Self> {
        Ok(Self::wrap(LogicalPlan::sort(self.plan, exprs)?))
    }

    /// Equi-join on key column pairs plus an optional residual filter.
    pub fn join(
        self,
        right: Arc<LogicalPlan>,
        join_type: JoinType,
        left_keys: Vec<String>,
        right_keys: Vec<String>,
        filter: Option<Expr>,
    ) -> Result<Self> {
        if left_keys.is_empty() || left_keys.len() != right_keys.len() {
            return Err(LfqError::BuilderArgument(format!(
                "join needs equally many left and right keys, got {} and {}",
                left_keys.len(),
                right_keys.len()
            )));
        }
        for k in &left_keys {
            resolve_column(self.plan.schema(), k)?;
        }
        for k in &right_keys {
            resolve_column(right.schema(), k)?;
        }
        let on = left_keys
            .into_iter()
            .zip(right_keys)
            .map(|(l, r)| (col(l), col(r)))
            .collect();
        Ok(Self::wrap(LogicalPlan::join(
            self.plan, right, on, filter, join_type,
        )?))
    }

    /// Join using a [`JoinKeys`] specification.
    ///
    /// With [`JoinKeys::On`] each key column is emitted once: inner, left,
    /// semi and anti joins keep the left value, right joins the right value,
    /// and full joins the first non-null of the two.
    pub fn join_keys(self, right: Arc<LogicalPlan>, join_type: JoinType, keys: JoinKeys) -> Result<Self> {
        match keys {
            JoinKeys::Columns { left, right: rk } => self.join(right, join_type, left, rk, None),
            JoinKeys::On(names) => {
                let left_width = self.plan.schema().fields().len();
                let right_schema = Arc::clone(right.schema());
                let joined = self.join(right, join_type, names.clone(), names.clone(), None)?;
                if !join_type.projects_right() {
                    return Ok(joined);
                }
                let out_schema = Arc::clone(joined.schema());
                let mut exprs = Vec::with_capacity(out_schema.fields().len());
                for field in out_schema.fields().iter().take(left_width) {
                    let name = field.name();
                    if names.contains(name) {
                        let (ri, _) = resolve_column(&right_schema, name)?;
                        let right_name = out_schema.field(left_width + ri).name().clone();
                        let e = match join_type {
                            JoinType::Right => col(right_name).alias(name.clone()),
                            JoinType::Full => {
                                coalesce(vec![col(name.clone()), col(right_name)]).alias(name.clone())
                            }
                            _ => col(name.clone()),
                        };
                        exprs.push(e);
                    } else {
                        exprs.push(col(name.clone()));
                    }
                }
                for (ri, f) in right_schema.fields().iter().enumerate() {
                    if names.contains(f.name()) {
                        continue;
                    }
                    exprs.push(col(out_schema.field(left_width + ri).name().clone()));
                }
                joined.select(exprs)
            }
        }
    }

    /// Join on arbitrary predicates over the joined schema (left columns,
    /// then right columns with collisions suffixed `_right`).
    pub fn join_on(
        self,
        right: Arc<LogicalPlan>,
        join_type: JoinType,
        predicates: Vec<Expr>,
    ) -> Result<Self> {
        let filter = conjunction(predicates).ok_or_else(|| {
            LfqError::BuilderArgument("join_on requires at least one predicate".to_string())
        })?;
        Ok(Self::wrap(LogicalPlan::join(
            self.plan,
            right,
            vec![],
            Some(filter),
            join_type,
        )?))
    }

    /// Skip `skip` rows, then return at most `fetch` rows.
    pub fn limit(self, skip: usize, fetch: Option<usize>) -> Result<Self> {
        Ok(Self::wrap(LogicalPlan::limit(self.plan, skip, fetch)))
    }

    pub fn union(self, other: Arc<LogicalPlan>) -> Result<Self> {
        Ok(Self::wrap(LogicalPlan::union(vec![self.plan, other])?))
    }

    pub fn union_distinct(self, other: Arc<LogicalPlan>) -> Result<Self> {
        self.union(other)?.distinct()
    }

    pub fn intersect(self, other: Arc<LogicalPlan>, all: bool) -> Result<Self> {
        Ok(Self::wrap(LogicalPlan::set_operation(
            SetOpKind::Intersect,
            all,
            self.plan,
            other,
        )?))
    }

    pub fn except(self, other: Arc<LogicalPlan>, all: bool) -> Result<Self> {
        Ok(Self::wrap(LogicalPlan::set_operation(
            SetOpKind::Except,
            all,
            self.plan,
            other,
        )?))
    }

    pub fn distinct(self) -> Result<Self> {
        Ok(Self::wrap(LogicalPlan::distinct(self.plan)))
    }

    /// Append window expression columns to the input columns.
    pub fn window(self, window_exprs: Vec<Expr>) -> Result<Self> {
        Ok(Self::wrap(LogicalPlan::window(self.plan, window_exprs)?))
    }

    pub fn unnest(self, columns: Vec<String>, preserve_nulls: bool) -> Result<Self> {
        Ok(Self::wrap(LogicalPlan::unnest(
            self.plan,
            columns,
            preserve_nulls,
        )?))
    }

    pub fn repartition(self, partitioning: Partitioning) -> Result<Self> {
        Ok(Self::wrap(LogicalPlan::repartition(
            self.plan,
            partitioning,
        )?))
    }
}

/// Keep a top-level alias but drop aliases nested below it.
fn strip_nested_aliases(e: Expr) -> Result<Expr> {
    let strip = |inner: &Expr| {
        inner.transform_up(&mut |node| Ok(node.unalias()))
    };
    match e {
        Expr::Alias { expr, name } => Ok(strip(&expr)?.alias(name)),
        other => strip(&other),
    }
}

fn collect_window_calls(e: &Expr, out: &mut Vec<Expr>) {
    if let Expr::WindowCall { .. } = e {
        if !out.contains(e) {
            out.push(e.clone());
        }
        return;
    }
    for c in e.children() {
        collect_window_calls(c, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr_fn::{lit, row_number, sum};
    use arrow_schema::{DataType, Field, Schema};

    fn people() -> LogicalPlanBuilder {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("name", DataType::Utf8, true),
            Field::new("dept", DataType::Utf8, true),
        ]));
        LogicalPlanBuilder::scan("people", schema).expect("scan")
    }

    #[test]
    fn join_key_forms_are_exclusive() {
        let both = JoinKeys::try_new(
            Some(vec!["id".into()]),
            Some(vec!["id".into()]),
            Some(vec!["id".into()]),
        );
        assert!(matches!(both, Err(LfqError::BuilderArgument(_))));
        let none = JoinKeys::try_new(None, None, None);
        assert!(matches!(none, Err(LfqError::BuilderArgument(_))));
        let half = JoinKeys::try_new(None, Some(vec!["id".into()]), None);
        assert!(matches!(half, Err(LfqError::BuilderArgument(_))));
        let ok = JoinKeys::try_new(None, Some(vec!["a".into()]), Some(vec!["b".into()]));
        assert!(ok.is_ok());
    }

    #[test]
    fn building_never_mutates_the_source_plan() {
        let base = people();
        let before = Arc::clone(base.plan());
        let filtered = base
            .clone()
            .filter(vec![col("id").gt(lit(1i64))])
            .expect("filter");
        assert!(Arc::ptr_eq(base.plan(), &before));
        assert!(matches!(filtered.plan().as_ref(), LogicalPlan::Filter { .. }));
    }

    #[test]
    fn filter_rejects_non_boolean_predicates() {
        let err = people().filter(vec![col("id")]).expect_err("non-boolean");
        assert!(matches!(err, LfqError::Schema(_)));
    }

    #[test]
    fn select_unknown_column_fails_immediately() {
        let err = people().select(vec![col("salary")]).expect_err("unknown");
        assert!(matches!(err, LfqError::Schema(_)));
    }

    #[test]
    fn select_with_window_inserts_window_node() {
        let plan = people()
            .select(vec![
                col("id"),
                row_number()
                    .over(vec![col("dept")], vec![col("id").sort(true, true)])
                    .alias("rn"),
            ])
            .expect("select")
            .build();
        assert_eq!(plan.output_columns(), vec!["id", "rn"]);
        let LogicalPlan::Projection { input, .. } = plan.as_ref() else {
            panic!("expected projection, got {plan}");
        };
        assert!(matches!(input.as_ref(), LogicalPlan::Window { .. }));
    }

    #[test]
    fn join_on_names_dedups_key_column() {
        let right = people().build();
        let plan = people()
            .join_keys(right, JoinType::Full, JoinKeys::On(vec!["id".into()]))
            .expect("join")
            .build();
        assert_eq!(
            plan.output_columns(),
            vec!["id", "name", "dept", "name_right", "dept_right"]
        );
    }

    #[test]
    fn aggregate_output_is_groups_then_aggregates() {
        let plan = people()
            .aggregate(vec![col("dept")], vec![sum(col("id")).alias("total")])
            .expect("aggregate")
            .build();
        assert_eq!(plan.output_columns(), vec!["dept", "total"]);
    }
}
