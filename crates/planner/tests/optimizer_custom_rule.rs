use std::sync::Arc;

use arrow_schema::{DataType, Field, Schema};
use lfq_planner::expr_fn::{col, lit};
use lfq_planner::{
    Expr, LogicalPlan, LogicalPlanBuilder, Operator, Optimizer, OptimizerConfig, OptimizerRule,
    ScalarValue,
};

struct GtToGte11Rule;

fn rewrite_expr(e: &Expr) -> lfq_common::Result<Expr> {
    e.transform_up(&mut |node| {
        Ok(match node {
            Expr::BinaryExpr {
                left,
                op: Operator::Gt,
                right,
            } if *right == Expr::Literal(ScalarValue::Int64(Some(10))) => Expr::BinaryExpr {
                left,
                op: Operator::GtEq,
                right: Arc::new(Expr::Literal(ScalarValue::Int64(Some(11)))),
            },
            other => other,
        })
    })
}

fn rewrite_plan(plan: &Arc<LogicalPlan>) -> lfq_common::Result<Arc<LogicalPlan>> {
    let inputs = plan
        .inputs()
        .into_iter()
        .map(rewrite_plan)
        .collect::<lfq_common::Result<Vec<_>>>()?;
    let rebuilt = match plan.as_ref() {
        LogicalPlan::TableScan {
            table,
            source_schema,
            projection,
            filters,
            fetch,
            ..
        } => LogicalPlan::table_scan(
            table.clone(),
            Arc::clone(source_schema),
            projection.clone(),
            filters.iter().map(rewrite_expr).collect::<lfq_common::Result<_>>()?,
            *fetch,
        )?,
        LogicalPlan::Filter { predicate, .. } => {
            LogicalPlan::filter(Arc::clone(&inputs[0]), rewrite_expr(predicate)?)?
        }
        other => other.with_new_inputs(inputs)?,
    };
    Ok(Arc::new(rebuilt))
}

impl OptimizerRule for GtToGte11Rule {
    fn name(&self) -> &str {
        "test_gt_to_gte_11"
    }

    fn rewrite(
        &self,
        plan: Arc<LogicalPlan>,
        _cfg: &OptimizerConfig,
    ) -> lfq_common::Result<Arc<LogicalPlan>> {
        rewrite_plan(&plan)
    }
}

fn scan() -> LogicalPlanBuilder {
    LogicalPlanBuilder::scan(
        "t",
        Arc::new(Schema::new(vec![
            Field::new("x", DataType::Int64, false),
            Field::new("y", DataType::Int64, false),
        ])),
    )
    .expect("scan")
}

#[test]
fn custom_optimizer_rule_rewrites_gt_to_gte_11() {
    let plan = scan()
        .filter(vec![col("x").gt(lit(10i64))])
        .expect("filter")
        .build();

    let optimizer = Optimizer::new();
    assert!(!optimizer.register_rule(Arc::new(GtToGte11Rule)));
    let optimized = optimizer
        .optimize(plan, &OptimizerConfig::default())
        .expect("optimize");
    match optimized.as_ref() {
        LogicalPlan::TableScan { filters, .. } => {
            assert_eq!(filters, &vec![col("x").gt_eq(lit(11i64))]);
        }
        other => panic!("expected table scan with pushed filter, got {other:?}"),
    }
}

#[test]
fn deregistered_rule_no_longer_runs() {
    let optimizer = Optimizer::new();
    optimizer.register_rule(Arc::new(GtToGte11Rule));
    assert!(optimizer.register_rule(Arc::new(GtToGte11Rule)));
    assert!(optimizer.deregister_rule("test_gt_to_gte_11"));
    assert!(!optimizer.deregister_rule("test_gt_to_gte_11"));

    let plan = scan()
        .filter(vec![col("x").gt(lit(10i64))])
        .expect("filter")
        .build();
    let optimized = optimizer
        .optimize(plan, &OptimizerConfig::default())
        .expect("optimize");
    match optimized.as_ref() {
        LogicalPlan::TableScan { filters, .. } => {
            assert_eq!(filters, &vec![col("x").gt(lit(10i64))]);
        }
        other => panic!("expected table scan, got {other:?}"),
    }
}
