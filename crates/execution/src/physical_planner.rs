//! Lowering of optimized logical plans to executable operator trees.

use std::sync::Arc;

use arrow_schema::DataType;
use lfq_common::{EngineConfig, LfqError, Result};
use lfq_planner::analyzer::comparison_coercion;
use lfq_planner::expr_fn::col;
use lfq_planner::{Expr, JoinType, LogicalPlan, Partitioning, SortExpr, conjunction};
use tracing::debug;

use crate::exec_node::ExecNode;
use crate::ops::hash_join::BuildSide;
use crate::ops::{
    CoalescePartitionsExec, FilterExec, GlobalLimitExec, HashAggregateExec, HashJoinExec,
    LocalLimitExec, NestedLoopJoinExec, ProjectionExec, RepartitionExec, RepartitionScheme,
    SetOpExec, SortAggregateExec, SortExec, SortMergeJoinExec, SortPreservingMergeExec,
    UnionExec, UnnestExec, WindowExec,
};
use crate::source::SourceProvider;

/// Lower `logical` to a physical operator tree.
///
/// Contracts:
/// - logical semantics are preserved, including the output schema;
/// - joins and grouped aggregates hash-partition their inputs into
///   `target_partitions` unless already partitioned that way;
/// - a hash table is chosen when the estimated build size fits in half the
///   memory budget (or is unknown), otherwise a sort-based operator;
/// - limits and global aggregates coalesce to one partition, sorts merge.
pub fn create_physical_plan(
    logical: &LogicalPlan,
    sources: &dyn SourceProvider,
    config: &EngineConfig,
) -> Result<Arc<dyn ExecNode>> {
    let planner = PhysicalPlanner {
        sources,
        partitions: config.target_partitions.max(1),
        mem_budget: config.mem_budget_bytes,
    };
    planner.plan(logical)
}

struct PhysicalPlanner<'a> {
    sources: &'a dyn SourceProvider,
    partitions: usize,
    mem_budget: usize,
}

impl PhysicalPlanner<'_> {
    fn plan(&self, logical: &LogicalPlan) -> Result<Arc<dyn ExecNode>> {
        let node: Arc<dyn ExecNode> = match logical {
            LogicalPlan::TableScan {
                table,
                projection,
                filters,
                fetch,
                schema,
                ..
            } => {
                let source = self.sources.source(table)?;
                let limit = if filters.is_empty() { *fetch } else { None };
                let scan = source.scan(projection.as_deref(), filters, limit)?;
                check_schema(&scan, schema, table)?;
                match conjunction(filters.iter().cloned()) {
                    Some(predicate) => Arc::new(FilterExec::try_new(scan, predicate)?),
                    None => scan,
                }
            }
            LogicalPlan::Projection {
                exprs,
                input,
                schema,
            } => Arc::new(ProjectionExec::try_new(
                self.plan(input)?,
                exprs.clone(),
                Arc::clone(schema),
            )?),
            LogicalPlan::Filter { predicate, input } => {
                Arc::new(FilterExec::try_new(self.plan(input)?, predicate.clone())?)
            }
            LogicalPlan::Aggregate {
                group_exprs,
                aggr_exprs,
                input,
                schema,
            } => {
                let child = self.plan(input)?;
                if group_exprs.is_empty() {
                    Arc::new(HashAggregateExec::try_new(
                        coalesce(child),
                        vec![],
                        aggr_exprs.clone(),
                        Arc::clone(schema),
                    )?)
                } else {
                    let child = self.hash_partitioned(child, group_exprs.clone())?;
                    let estimate = estimate_bytes(input, self.sources);
                    if estimate.is_some_and(|b| b > self.mem_budget) {
                        debug!(?estimate, "aggregate input exceeds budget, using sort aggregation");
                        let keys = group_exprs.iter().map(|e| SortExpr::from(e.clone())).collect();
                        Arc::new(SortAggregateExec::try_new(
                            Arc::new(SortExec::try_new(child, keys)?),
                            group_exprs.clone(),
                            aggr_exprs.clone(),
                            Arc::clone(schema),
                        )?)
                    } else {
                        Arc::new(HashAggregateExec::try_new(
                            child,
                            group_exprs.clone(),
                            aggr_exprs.clone(),
                            Arc::clone(schema),
                        )?)
                    }
                }
            }
            LogicalPlan::Sort { exprs, input } => {
                let child = self.plan(input)?;
                let sorted: Arc<dyn ExecNode> = Arc::new(SortExec::try_new(child, exprs.clone())?);
                if sorted.output_partitioning().partition_count() > 1 {
                    Arc::new(SortPreservingMergeExec::try_new(sorted, exprs.clone())?)
                } else {
                    sorted
                }
            }
            LogicalPlan::Join {
                left,
                right,
                on,
                filter,
                join_type,
                schema,
            } => {
                let (l, r) = (self.plan(left)?, self.plan(right)?);
                if on.is_empty() {
                    Arc::new(NestedLoopJoinExec::try_new(
                        coalesce(l),
                        coalesce(r),
                        filter.clone(),
                        *join_type,
                        Arc::clone(schema),
                    )?)
                } else {
                    self.plan_equi_join(left, right, l, r, on, filter, *join_type, schema)?
                }
            }
            LogicalPlan::Limit { skip, fetch, input } => {
                let child = self.plan(input)?;
                let child = if child.output_partitioning().partition_count() > 1 {
                    let local: Arc<dyn ExecNode> = match fetch {
                        Some(f) => Arc::new(LocalLimitExec::new(child, skip.saturating_add(*f))),
                        None => child,
                    };
                    Arc::new(CoalescePartitionsExec::new(local, true))
                } else {
                    child
                };
                Arc::new(GlobalLimitExec::try_new(child, *skip, *fetch)?)
            }
            LogicalPlan::Union { inputs, schema } => {
                let children = inputs
                    .iter()
                    .map(|i| self.plan(i))
                    .collect::<Result<Vec<_>>>()?;
                Arc::new(UnionExec::new(children, Arc::clone(schema)))
            }
            LogicalPlan::SetOperation {
                op,
                all,
                left,
                right,
                schema,
            } => {
                let l = self.plan(left)?;
                let r = self.plan(right)?;
                let l = self.hash_partitioned(l, column_exprs(left))?;
                let r = self.hash_partitioned(r, column_exprs(right))?;
                Arc::new(SetOpExec::try_new(*op, *all, l, r, Arc::clone(schema))?)
            }
            LogicalPlan::Distinct { input } => {
                let child = self.plan(input)?;
                let keys = column_exprs(input);
                let child = self.hash_partitioned(child, keys.clone())?;
                Arc::new(HashAggregateExec::try_new(
                    child,
                    keys,
                    vec![],
                    Arc::clone(input.schema()),
                )?)
            }
            LogicalPlan::Window {
                window_exprs,
                input,
                schema,
            } => {
                let child = self.plan(input)?;
                let child = match shared_partition_keys(window_exprs) {
                    Some(keys) => self.hash_partitioned(child, keys)?,
                    None => coalesce(child),
                };
                Arc::new(WindowExec::try_new(
                    child,
                    window_exprs.clone(),
                    Arc::clone(schema),
                )?)
            }
            LogicalPlan::Unnest {
                columns,
                preserve_nulls,
                input,
                schema,
            } => Arc::new(UnnestExec::try_new(
                self.plan(input)?,
                columns.clone(),
                *preserve_nulls,
                Arc::clone(schema),
            )?),
            LogicalPlan::Repartition {
                partitioning,
                input,
            } => {
                let child = self.plan(input)?;
                let scheme = match partitioning {
                    Partitioning::RoundRobin(n) => RepartitionScheme::RoundRobin(*n),
                    Partitioning::Hash(exprs, n) => {
                        RepartitionScheme::hash(exprs.clone(), *n, &child.schema())?
                    }
                };
                Arc::new(RepartitionExec::try_new(child, scheme)?)
            }
        };
        debug!(
            logical = logical.name(),
            physical = node.name(),
            partitions = node.output_partitioning().partition_count(),
            "lowered plan node"
        );
        Ok(node)
    }

    #[allow(clippy::too_many_arguments)]
    fn plan_equi_join(
        &self,
        left_plan: &LogicalPlan,
        right_plan: &LogicalPlan,
        left: Arc<dyn ExecNode>,
        right: Arc<dyn ExecNode>,
        on: &[(Expr, Expr)],
        filter: &Option<Expr>,
        join_type: JoinType,
        schema: &arrow_schema::SchemaRef,
    ) -> Result<Arc<dyn ExecNode>> {
        // Keys are hashed and sorted in their common type so that equal
        // values of different widths land in the same partition.
        let mut left_keys = Vec::with_capacity(on.len());
        let mut right_keys = Vec::with_capacity(on.len());
        for (l, r) in on {
            let lt = l.data_type(left_plan.schema())?;
            let rt = r.data_type(right_plan.schema())?;
            let common = comparison_coercion(&lt, &rt).ok_or_else(|| {
                LfqError::Schema(format!("join key {l} ({lt}) is not comparable with {r} ({rt})"))
            })?;
            left_keys.push(cast_to(l, &lt, &common));
            right_keys.push(cast_to(r, &rt, &common));
        }
        let left = self.hash_partitioned(left, left_keys.clone())?;
        let right = self.hash_partitioned(right, right_keys.clone())?;

        let left_bytes = estimate_bytes(left_plan, self.sources);
        let right_bytes = estimate_bytes(right_plan, self.sources);
        let build_side = match join_type {
            JoinType::Right => BuildSide::Left,
            JoinType::Inner => match (left_bytes, right_bytes) {
                (Some(l), Some(r)) if l < r => BuildSide::Left,
                _ => BuildSide::Right,
            },
            JoinType::Left | JoinType::Full | JoinType::Semi | JoinType::Anti => BuildSide::Right,
        };
        let build_bytes = match build_side {
            BuildSide::Left => left_bytes,
            BuildSide::Right => right_bytes,
        };
        if build_bytes.is_some_and(|b| b > self.mem_budget / 2) {
            debug!(?build_bytes, %join_type, "join build side exceeds budget, using sort-merge join");
            let sort_keys = |keys: &[Expr]| keys.iter().cloned().map(SortExpr::from).collect::<Vec<_>>();
            let left: Arc<dyn ExecNode> = Arc::new(SortExec::try_new(left, sort_keys(&left_keys))?);
            let right: Arc<dyn ExecNode> = Arc::new(SortExec::try_new(right, sort_keys(&right_keys))?);
            return Ok(Arc::new(SortMergeJoinExec::try_new(
                left,
                right,
                on.to_vec(),
                filter.clone(),
                join_type,
                Arc::clone(schema),
            )?));
        }
        debug!(?build_side, ?build_bytes, %join_type, "planning hash join");
        Ok(Arc::new(HashJoinExec::try_new(
            left,
            right,
            on.to_vec(),
            filter.clone(),
            join_type,
            build_side,
            Arc::clone(schema),
        )?))
    }

    /// Distribute `node` by `keys` over the configured partition count.
    fn hash_partitioned(&self, node: Arc<dyn ExecNode>, keys: Vec<Expr>) -> Result<Arc<dyn ExecNode>> {
        let n = self.partitions;
        if n == 1 {
            return Ok(coalesce(node));
        }
        if node.output_partitioning().satisfies_hash(&keys, n) {
            return Ok(node);
        }
        let scheme = RepartitionScheme::hash(keys, n, &node.schema())?;
        Ok(Arc::new(RepartitionExec::try_new(node, scheme)?))
    }
}

fn coalesce(node: Arc<dyn ExecNode>) -> Arc<dyn ExecNode> {
    if node.output_partitioning().partition_count() == 1 {
        node
    } else {
        Arc::new(CoalescePartitionsExec::new(node, false))
    }
}

fn cast_to(e: &Expr, from: &DataType, to: &DataType) -> Expr {
    if from == to {
        e.clone()
    } else {
        e.clone().cast(to.clone())
    }
}

fn column_exprs(plan: &LogicalPlan) -> Vec<Expr> {
    plan.schema()
        .fields()
        .iter()
        .map(|f| col(f.name().as_str()))
        .collect()
}

/// `PARTITION BY` keys shared by every window expression, if any.
fn shared_partition_keys(window_exprs: &[Expr]) -> Option<Vec<Expr>> {
    let mut shared: Option<&Vec<Expr>> = None;
    for e in window_exprs {
        let e = match e {
            Expr::Alias { expr, .. } => expr.as_ref(),
            other => other,
        };
        let Expr::WindowCall { partition_by, .. } = e else {
            return None;
        };
        if partition_by.is_empty() || shared.is_some_and(|s| s != partition_by) {
            return None;
        }
        shared = Some(partition_by);
    }
    shared.cloned()
}

fn check_schema(
    scan: &Arc<dyn ExecNode>,
    expected: &arrow_schema::SchemaRef,
    table: &str,
) -> Result<()> {
    let got = scan.schema();
    let same = got.fields().len() == expected.fields().len()
        && got
            .fields()
            .iter()
            .zip(expected.fields().iter())
            .all(|(g, e)| g.name() == e.name() && g.data_type() == e.data_type());
    if same {
        Ok(())
    } else {
        Err(LfqError::Schema(format!(
            "scan of '{table}' produced columns [{}], expected [{}]",
            field_list(&got),
            field_list(expected)
        )))
    }
}

fn field_list(schema: &arrow_schema::Schema) -> String {
    schema
        .fields()
        .iter()
        .map(|f| format!("{}: {}", f.name(), f.data_type()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Upper-bound estimate of the bytes `plan` produces, when sources report sizes.
pub fn estimate_bytes(plan: &LogicalPlan, sources: &dyn SourceProvider) -> Option<usize> {
    match plan {
        LogicalPlan::TableScan {
            table,
            source_schema,
            projection,
            ..
        } => {
            let total = sources.source(table).ok()?.statistics().total_bytes?;
            match projection {
                Some(p) if !source_schema.fields().is_empty() => {
                    Some(total.saturating_mul(p.len()) / source_schema.fields().len())
                }
                _ => Some(total),
            }
        }
        LogicalPlan::Projection { input, .. }
        | LogicalPlan::Filter { input, .. }
        | LogicalPlan::Aggregate { input, .. }
        | LogicalPlan::Sort { input, .. }
        | LogicalPlan::Limit { input, .. }
        | LogicalPlan::Distinct { input }
        | LogicalPlan::Window { input, .. }
        | LogicalPlan::Repartition { input, .. } => estimate_bytes(input, sources),
        LogicalPlan::SetOperation { left, .. } => estimate_bytes(left, sources),
        LogicalPlan::Join { left, right, .. } => {
            Some(estimate_bytes(left, sources)?.saturating_add(estimate_bytes(right, sources)?))
        }
        LogicalPlan::Union { inputs, .. } => inputs
            .iter()
            .try_fold(0usize, |acc, i| Some(acc.saturating_add(estimate_bytes(i, sources)?))),
        LogicalPlan::Unnest { .. } => None,
    }
}
