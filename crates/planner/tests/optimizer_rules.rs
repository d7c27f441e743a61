use std::sync::Arc;

use arrow_schema::{DataType, Field, Schema, SchemaRef};
use lfq_planner::expr_fn::{col, count_star, lit, sum};
use lfq_planner::{JoinType, LogicalPlan, LogicalPlanBuilder, Optimizer, OptimizerConfig};

fn schema(cols: &[(&str, DataType)]) -> SchemaRef {
    Arc::new(Schema::new(
        cols.iter()
            .map(|(n, t)| Field::new(*n, t.clone(), true))
            .collect::<Vec<_>>(),
    ))
}

fn scan(name: &str, cols: &[(&str, DataType)]) -> LogicalPlanBuilder {
    LogicalPlanBuilder::scan(name, schema(cols)).expect("scan")
}

fn left() -> LogicalPlanBuilder {
    scan("l", &[("k", DataType::Int64), ("a", DataType::Int64)])
}

fn right() -> Arc<LogicalPlan> {
    scan("r", &[("k", DataType::Int64), ("b", DataType::Int64)]).build()
}

fn optimize(plan: Arc<LogicalPlan>) -> Arc<LogicalPlan> {
    Optimizer::new()
        .optimize(plan, &OptimizerConfig::default())
        .expect("optimize")
}

fn scan_filters(plan: &LogicalPlan) -> Vec<String> {
    match plan {
        LogicalPlan::TableScan { filters, .. } => filters.iter().map(|f| f.to_string()).collect(),
        other => panic!("expected scan, got\n{other}"),
    }
}

#[test]
fn filter_conjuncts_move_to_inner_join_sides() {
    let plan = left()
        .join(
            right(),
            JoinType::Inner,
            vec!["k".to_string()],
            vec!["k".to_string()],
            None,
        )
        .expect("join")
        .filter(vec![col("a").gt(lit(1i64)), col("b").lt(lit(5i64))])
        .expect("filter")
        .build();
    let out = optimize(Arc::clone(&plan));
    assert_eq!(out.output_columns(), plan.output_columns());
    let LogicalPlan::Join { left, right, .. } = out.as_ref() else {
        panic!("expected join at root, got\n{out}");
    };
    assert_eq!(scan_filters(left), vec!["a > 1"]);
    assert_eq!(scan_filters(right), vec!["b < 5"]);
}

#[test]
fn filter_on_null_extended_side_stays_above_left_join() {
    let plan = left()
        .join(
            right(),
            JoinType::Left,
            vec!["k".to_string()],
            vec!["k".to_string()],
            None,
        )
        .expect("join")
        .filter(vec![col("b").gt(lit(1i64))])
        .expect("filter")
        .build();
    let out = optimize(plan);
    assert!(
        matches!(out.as_ref(), LogicalPlan::Filter { .. }),
        "filter must not cross the null-extended side:\n{out}"
    );
}

#[test]
fn equality_predicates_become_join_keys() {
    let plan = left()
        .join_on(
            right(),
            JoinType::Inner,
            vec![col("a").eq(col("b")), col("a").gt(col("k_right"))],
        )
        .expect("join_on")
        .build();
    let out = optimize(plan);
    let LogicalPlan::Join { on, filter, .. } = out.as_ref() else {
        panic!("expected join, got\n{out}");
    };
    assert_eq!(on, &vec![(col("a"), col("b"))]);
    assert_eq!(filter.as_ref().map(|f| f.to_string()), Some("a > k_right".to_string()));
}

#[test]
fn stacked_limits_merge_and_cap_the_scan() {
    let plan = left()
        .limit(2, Some(10))
        .expect("limit")
        .limit(1, Some(3))
        .expect("limit")
        .build();
    let out = optimize(plan);
    let LogicalPlan::Limit { skip, fetch, input } = out.as_ref() else {
        panic!("expected limit, got\n{out}");
    };
    assert_eq!((*skip, *fetch), (3, Some(3)));
    assert!(matches!(
        input.as_ref(),
        LogicalPlan::TableScan { fetch: Some(6), .. }
    ));
}

#[test]
fn unused_columns_are_pruned_from_scan() {
    let plan = scan(
        "t",
        &[("a", DataType::Int64), ("b", DataType::Int64), ("c", DataType::Utf8)],
    )
    .filter(vec![col("b").gt(lit(0i64))])
    .expect("filter")
    .select(vec![col("a")])
    .expect("select")
    .build();
    let out = optimize(plan);
    let LogicalPlan::Projection { input, .. } = out.as_ref() else {
        panic!("expected projection, got\n{out}");
    };
    match input.as_ref() {
        LogicalPlan::TableScan { projection, .. } => assert_eq!(projection, &Some(vec![0, 1])),
        other => panic!("expected scan, got\n{other}"),
    }
}

#[test]
fn count_star_keeps_one_scan_column() {
    let plan = scan("t", &[("a", DataType::Int64), ("b", DataType::Int64)])
        .aggregate(vec![], vec![count_star()])
        .expect("aggregate")
        .build();
    let out = optimize(plan);
    let LogicalPlan::Aggregate { input, .. } = out.as_ref() else {
        panic!("expected aggregate, got\n{out}");
    };
    match input.as_ref() {
        LogicalPlan::TableScan { projection, .. } => assert_eq!(projection, &Some(vec![0])),
        other => panic!("expected scan, got\n{other}"),
    }
}

#[test]
fn repeated_subexpressions_are_computed_once() {
    let plan = scan("t", &[("a", DataType::Int64), ("b", DataType::Int64)])
        .select(vec![
            ((col("a") + lit(1i64)) * lit(2i64)).alias("x"),
            ((col("a") + lit(1i64)) * lit(3i64)).alias("y"),
        ])
        .expect("select")
        .build();
    let out = optimize(Arc::clone(&plan));
    assert_eq!(out.output_columns(), vec!["x", "y"]);
    let text = out.to_string();
    assert!(text.contains("a + 1 AS __common_expr_1"), "{text}");
    assert_eq!(text.matches("a + 1").count(), 1, "{text}");
}

#[test]
fn constants_fold_inside_pushed_filters() {
    let plan = left()
        .filter(vec![col("a").gt(lit(1i64) + lit(2i64))])
        .expect("filter")
        .build();
    let out = optimize(plan);
    assert_eq!(scan_filters(&out), vec!["a > 3"]);
}

#[test]
fn optimizing_twice_is_a_fixpoint() {
    let plan = left()
        .join(
            right(),
            JoinType::Inner,
            vec!["k".to_string()],
            vec!["k".to_string()],
            None,
        )
        .expect("join")
        .filter(vec![col("a").gt(lit(1i64))])
        .expect("filter")
        .aggregate(vec![col("k")], vec![sum(col("b"))])
        .expect("aggregate")
        .limit(0, Some(5))
        .expect("limit")
        .build();
    let once = optimize(plan);
    let twice = optimize(Arc::clone(&once));
    assert_eq!(once, twice, "\n{once}\nvs\n{twice}");
}

#[test]
fn logical_plan_serializes_to_json() {
    let plan = left()
        .filter(vec![col("a").gt(lit(1i64))])
        .expect("filter")
        .build();
    let json = serde_json::to_string(plan.as_ref()).expect("serialize");
    let back: LogicalPlan = serde_json::from_str(&json).expect("deserialize");
    assert_eq!(&back, plan.as_ref());
}
