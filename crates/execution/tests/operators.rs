use std::sync::Arc;

use arrow::array::{Array, AsArray, Int64Array, RecordBatch, StringArray};
use arrow::datatypes::{Int64Type, UInt64Type};
use arrow::util::display::array_value_to_string;
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use futures::executor::block_on;
use lfq_common::{EngineConfig, LfqError};
use lfq_execution::ops::hash_join::BuildSide;
use lfq_execution::ops::{
    CoalescePartitionsExec, HashAggregateExec, HashJoinExec, MemoryExec, NestedLoopJoinExec,
    RepartitionExec, RepartitionScheme, SetOpExec, SortExec, SortMergeJoinExec, WindowExec,
};
use lfq_execution::{CancellationToken, ExecNode, TaskContext, collect, collect_partitioned};
use lfq_planner::expr_fn::{col, lag, rank, row_number, sum};
use lfq_planner::logical_plan::join_output_fields;
use lfq_planner::{JoinType, SetOpKind, SortExpr};

fn kv_schema(value: &str) -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int64, true),
        Field::new(value, DataType::Utf8, true),
    ]))
}

fn kv(value: &str, ids: Vec<i64>, vals: Vec<&str>) -> Arc<dyn ExecNode> {
    let schema = kv_schema(value);
    let batch = RecordBatch::try_new(
        Arc::clone(&schema),
        vec![
            Arc::new(Int64Array::from(ids)),
            Arc::new(StringArray::from(vals)),
        ],
    )
    .expect("batch");
    Arc::new(MemoryExec::try_new(vec![vec![batch]], schema, None, None).expect("memory exec"))
}

fn numbers(name: &str, partitions: Vec<Vec<i64>>) -> Arc<dyn ExecNode> {
    let schema = Arc::new(Schema::new(vec![Field::new(name, DataType::Int64, true)]));
    let parts = partitions
        .into_iter()
        .map(|vals| {
            vec![RecordBatch::try_new(Arc::clone(&schema), vec![Arc::new(Int64Array::from(vals))])
                .expect("batch")]
        })
        .collect();
    Arc::new(MemoryExec::try_new(parts, schema, None, None).expect("memory exec"))
}

fn ctx() -> Arc<TaskContext> {
    Arc::new(TaskContext::new(EngineConfig::default()))
}

fn rows(batches: &[RecordBatch]) -> usize {
    batches.iter().map(|b| b.num_rows()).sum()
}

fn int_values(batches: &[RecordBatch], column: usize) -> Vec<Option<i64>> {
    batches
        .iter()
        .flat_map(|b| {
            let a = b.column(column).as_primitive::<Int64Type>();
            (0..a.len())
                .map(|i| a.is_valid(i).then(|| a.value(i)))
                .collect::<Vec<_>>()
        })
        .collect()
}

fn hash_join(
    left: Arc<dyn ExecNode>,
    right: Arc<dyn ExecNode>,
    join_type: JoinType,
    build: BuildSide,
) -> Vec<RecordBatch> {
    let schema = Arc::new(Schema::new(join_output_fields(
        &left.schema(),
        &right.schema(),
        join_type,
    )));
    let node: Arc<dyn ExecNode> = Arc::new(
        HashJoinExec::try_new(
            left,
            right,
            vec![(col("id"), col("id"))],
            None,
            join_type,
            build,
            schema,
        )
        .expect("hash join"),
    );
    block_on(collect(node, ctx())).expect("collect")
}

fn join(join_type: JoinType, build: BuildSide) -> Vec<RecordBatch> {
    let left = kv("l", vec![1, 2], vec!["a", "b"]);
    let right = kv("r", vec![2, 3], vec!["x", "y"]);
    hash_join(left, right, join_type, build)
}

/// Rows rendered as text and sorted, for order-insensitive comparison.
fn sorted_rows(batches: &[RecordBatch]) -> Vec<String> {
    let mut out: Vec<String> = batches
        .iter()
        .flat_map(|b| {
            (0..b.num_rows()).map(move |row| {
                b.columns()
                    .iter()
                    .map(|c| array_value_to_string(c, row).expect("render"))
                    .collect::<Vec<_>>()
                    .join("|")
            })
        })
        .collect();
    out.sort_unstable();
    out
}

#[test]
fn hash_join_types_follow_relational_semantics() {
    assert_eq!(rows(&join(JoinType::Inner, BuildSide::Right)), 1);
    assert_eq!(rows(&join(JoinType::Inner, BuildSide::Left)), 1);
    assert_eq!(rows(&join(JoinType::Left, BuildSide::Right)), 2);
    assert_eq!(rows(&join(JoinType::Right, BuildSide::Left)), 2);
    assert_eq!(rows(&join(JoinType::Full, BuildSide::Right)), 3);
    assert_eq!(rows(&join(JoinType::Semi, BuildSide::Right)), 1);
    assert_eq!(rows(&join(JoinType::Anti, BuildSide::Left)), 1);

    let left = join(JoinType::Left, BuildSide::Right);
    let ids = int_values(&left, 0);
    let right_ids = int_values(&left, 2);
    let unmatched = ids.iter().position(|v| *v == Some(1)).expect("id 1 present");
    assert_eq!(right_ids[unmatched], None);
}

fn nullable_keys(values: Vec<Option<i64>>) -> Arc<dyn ExecNode> {
    let schema = Arc::new(Schema::new(vec![Field::new("k", DataType::Int64, true)]));
    let batch = RecordBatch::try_new(Arc::clone(&schema), vec![Arc::new(Int64Array::from(values))])
        .expect("batch");
    Arc::new(MemoryExec::try_new(vec![vec![batch]], schema, None, None).expect("memory exec"))
}

#[test]
fn null_join_keys_never_match() {
    let left = nullable_keys(vec![None, Some(1)]);
    let right = nullable_keys(vec![None, Some(1)]);
    let schema = Arc::new(Schema::new(join_output_fields(
        &left.schema(),
        &right.schema(),
        JoinType::Inner,
    )));
    let node: Arc<dyn ExecNode> = Arc::new(
        HashJoinExec::try_new(
            left,
            right,
            vec![(col("k"), col("k"))],
            None,
            JoinType::Inner,
            BuildSide::Right,
            schema,
        )
        .expect("join"),
    );
    let out = block_on(collect(node, ctx())).expect("collect");
    assert_eq!(int_values(&out, 0), vec![Some(1)]);
}

#[test]
fn nested_loop_join_applies_non_equi_filter() {
    let left = numbers("a", vec![vec![1, 5, 9]]);
    let right = numbers("b", vec![vec![4, 6]]);
    let schema = Arc::new(Schema::new(join_output_fields(
        &left.schema(),
        &right.schema(),
        JoinType::Left,
    )));
    let node: Arc<dyn ExecNode> = Arc::new(
        NestedLoopJoinExec::try_new(left, right, Some(col("a").gt(col("b"))), JoinType::Left, schema)
            .expect("nested loop join"),
    );
    let out = block_on(collect(node, ctx())).expect("collect");
    let mut pairs: Vec<(Option<i64>, Option<i64>)> = int_values(&out, 0)
        .into_iter()
        .zip(int_values(&out, 1))
        .collect();
    pairs.sort_unstable();
    assert_eq!(
        pairs,
        vec![(Some(1), None), (Some(5), Some(4)), (Some(9), Some(4)), (Some(9), Some(6))]
    );
}

#[test]
fn sort_merge_join_agrees_with_hash_join() {
    let left = || kv("l", vec![3, 1, 2, 2], vec!["c", "a", "b", "bb"]);
    let right = || kv("r", vec![2, 3, 4], vec!["x", "y", "z"]);
    for join_type in [
        JoinType::Inner,
        JoinType::Left,
        JoinType::Right,
        JoinType::Full,
        JoinType::Semi,
        JoinType::Anti,
    ] {
        let schema = Arc::new(Schema::new(join_output_fields(
            &left().schema(),
            &right().schema(),
            join_type,
        )));
        let sorted = |n: Arc<dyn ExecNode>| -> Arc<dyn ExecNode> {
            Arc::new(SortExec::try_new(n, vec![SortExpr::from(col("id"))]).expect("sort"))
        };
        let smj: Arc<dyn ExecNode> = Arc::new(
            SortMergeJoinExec::try_new(
                sorted(left()),
                sorted(right()),
                vec![(col("id"), col("id"))],
                None,
                join_type,
                schema,
            )
            .expect("smj"),
        );
        let merged = block_on(collect(smj, ctx())).expect("collect");
        let hashed = hash_join(left(), right(), join_type, BuildSide::Right);
        assert_eq!(sorted_rows(&merged), sorted_rows(&hashed), "{join_type}");
    }

    let inner = hash_join(left(), right(), JoinType::Inner, BuildSide::Right);
    assert_eq!(
        sorted_rows(&inner),
        vec!["2|b|2|x", "2|bb|2|x", "3|c|3|y"],
    );
}

#[test]
fn hash_aggregate_after_hash_repartition() {
    let input = numbers("k", vec![vec![1, 2, 3, 1], vec![2, 1, 5]]);
    let repart: Arc<dyn ExecNode> = Arc::new(
        RepartitionExec::try_new(
            Arc::clone(&input),
            RepartitionScheme::hash(vec![col("k")], 3, &input.schema()).expect("scheme"),
        )
        .expect("repartition"),
    );
    let out_schema = Arc::new(Schema::new(vec![
        Field::new("k", DataType::Int64, true),
        Field::new("sum(k)", DataType::Int64, true),
    ]));
    let agg: Arc<dyn ExecNode> = Arc::new(
        HashAggregateExec::try_new(repart, vec![col("k")], vec![sum(col("k"))], out_schema)
            .expect("aggregate"),
    );
    let out = block_on(collect(agg, ctx())).expect("collect");
    let mut pairs: Vec<(i64, i64)> = int_values(&out, 0)
        .into_iter()
        .zip(int_values(&out, 1))
        .map(|(k, s)| (k.expect("key"), s.expect("sum")))
        .collect();
    pairs.sort_unstable();
    assert_eq!(pairs, vec![(1, 3), (2, 4), (3, 3), (5, 5)]);
}

#[test]
fn hash_repartition_is_deterministic() {
    let run = || {
        let input = numbers("k", vec![(0..200).collect()]);
        let node: Arc<dyn ExecNode> = Arc::new(
            RepartitionExec::try_new(
                Arc::clone(&input),
                RepartitionScheme::hash(vec![col("k")], 4, &input.schema()).expect("scheme"),
            )
            .expect("repartition"),
        );
        let parts = block_on(collect_partitioned(node, ctx())).expect("collect");
        parts
            .iter()
            .map(|p| {
                let mut v: Vec<i64> = int_values(p, 0).into_iter().flatten().collect();
                v.sort_unstable();
                v
            })
            .collect::<Vec<_>>()
    };
    let first = run();
    assert_eq!(first.iter().map(Vec::len).sum::<usize>(), 200);
    assert_eq!(first, run());
}

#[test]
fn unread_outputs_spill_instead_of_buffering() {
    let cfg = EngineConfig {
        channel_capacity: 1,
        ..EngineConfig::default()
    };
    let ctx = Arc::new(TaskContext::new(cfg));
    let schema = Arc::new(Schema::new(vec![Field::new("k", DataType::Int64, true)]));
    let batches = (0..40)
        .map(|b| {
            RecordBatch::try_new(
                Arc::clone(&schema),
                vec![Arc::new(Int64Array::from_iter_values(b * 5..b * 5 + 5))],
            )
            .expect("batch")
        })
        .collect();
    let input: Arc<dyn ExecNode> =
        Arc::new(MemoryExec::try_new(vec![batches], schema, None, None).expect("memory exec"));
    let repartition = Arc::new(
        RepartitionExec::try_new(
            Arc::clone(&input),
            RepartitionScheme::hash(vec![col("k")], 4, &input.schema()).expect("scheme"),
        )
        .expect("repartition"),
    );
    // Reads output 0 to the end before opening output 1.
    let sequential: Arc<dyn ExecNode> =
        Arc::new(CoalescePartitionsExec::new(repartition.clone(), true));
    let out = block_on(collect(sequential, Arc::clone(&ctx))).expect("collect");

    let mut values: Vec<i64> = int_values(&out, 0).into_iter().flatten().collect();
    values.sort_unstable();
    assert_eq!(values, (0..200).collect::<Vec<_>>());
    assert!(repartition.metrics().snapshot().spill_count > 0);
    assert_eq!(ctx.memory_pool().in_use(), 0);
}

#[test]
fn repartition_state_is_dropped_when_execution_is_released() {
    let token = CancellationToken::new();
    let ctx = Arc::new(TaskContext::new(EngineConfig::default()).with_cancellation(token.clone()));
    let input = numbers("v", vec![(0..100).collect()]);
    let repartition = Arc::new(
        RepartitionExec::try_new(input, RepartitionScheme::RoundRobin(2)).expect("repartition"),
    );
    let stream = repartition.execute(0, Arc::clone(&ctx)).expect("execute");
    assert_eq!(repartition.open_executions(), 1);
    drop(stream);
    token.release();
    assert_eq!(repartition.open_executions(), 0);
}

#[test]
fn sort_spills_under_a_tiny_budget_and_stays_ordered() {
    let cfg = EngineConfig {
        mem_budget_bytes: 1,
        batch_size_rows: 7,
        ..EngineConfig::default()
    };
    let ctx = Arc::new(TaskContext::new(cfg));
    let input = numbers("v", vec![vec![9, 3, 7], vec![1, 8, 2], vec![6, 5, 4]]);
    let coalesced: Arc<dyn ExecNode> =
        Arc::new(CoalescePartitionsExec::new(input, true));
    let sort = Arc::new(SortExec::try_new(coalesced, vec![SortExpr::from(col("v"))]).expect("sort"));
    let node: Arc<dyn ExecNode> = sort.clone();
    let out = block_on(collect(node, ctx)).expect("collect");
    let values: Vec<i64> = int_values(&out, 0).into_iter().flatten().collect();
    assert_eq!(values, (1..=9).collect::<Vec<_>>());
    assert!(sort.metrics().snapshot().spill_count > 0);
}

#[test]
fn hash_aggregate_over_budget_is_out_of_memory() {
    let cfg = EngineConfig {
        mem_budget_bytes: 64,
        ..EngineConfig::default()
    };
    let input = numbers("k", vec![(0..1000).collect()]);
    let schema = Arc::new(Schema::new(vec![Field::new("k", DataType::Int64, true)]));
    let agg: Arc<dyn ExecNode> =
        Arc::new(HashAggregateExec::try_new(input, vec![col("k")], vec![], schema).expect("agg"));
    let err = block_on(collect(agg, Arc::new(TaskContext::new(cfg)))).expect_err("must fail");
    assert!(matches!(err.root(), LfqError::OutOfMemory(_)), "{err}");
    assert!(matches!(err, LfqError::Operator { .. }), "{err}");
}

#[test]
fn cancelled_execution_reports_cancelled() {
    let ctx = ctx();
    ctx.cancellation().cancel();
    let err = block_on(collect(numbers("v", vec![vec![1, 2]]), ctx)).expect_err("cancelled");
    assert!(matches!(err, LfqError::Cancelled));
}

#[test]
fn set_operations_count_duplicates() {
    let run = |op, all| {
        let left = numbers("v", vec![vec![1, 1, 1, 2, 3]]);
        let right = numbers("v", vec![vec![1, 1, 3, 4]]);
        let schema = left.schema();
        let node: Arc<dyn ExecNode> =
            Arc::new(SetOpExec::try_new(op, all, left, right, schema).expect("set op"));
        let out = block_on(collect(node, ctx())).expect("collect");
        let mut v: Vec<i64> = int_values(&out, 0).into_iter().flatten().collect();
        v.sort_unstable();
        v
    };
    assert_eq!(run(SetOpKind::Intersect, true), vec![1, 1, 3]);
    assert_eq!(run(SetOpKind::Intersect, false), vec![1, 3]);
    assert_eq!(run(SetOpKind::Except, true), vec![1, 2]);
    assert_eq!(run(SetOpKind::Except, false), vec![2]);
}

#[test]
fn window_ranking_and_lag() {
    let input = numbers("v", vec![vec![10, 20, 20, 30]]);
    let exprs = vec![
        row_number().over(vec![], vec![SortExpr::from(col("v"))]),
        rank().over(vec![], vec![SortExpr::from(col("v"))]),
        lag(col("v"), 1).over(vec![], vec![SortExpr::from(col("v"))]),
    ];
    let schema = Arc::new(Schema::new(vec![
        Field::new("v", DataType::Int64, true),
        Field::new("rn", DataType::UInt64, false),
        Field::new("rk", DataType::UInt64, false),
        Field::new("prev", DataType::Int64, true),
    ]));
    let node: Arc<dyn ExecNode> =
        Arc::new(WindowExec::try_new(input, exprs, schema).expect("window"));
    let out = block_on(collect(node, ctx())).expect("collect");
    assert_eq!(out.len(), 1);
    let b = &out[0];
    assert_eq!(
        b.column(1).as_primitive::<UInt64Type>().values().to_vec(),
        vec![1, 2, 3, 4]
    );
    assert_eq!(
        b.column(2).as_primitive::<UInt64Type>().values().to_vec(),
        vec![1, 2, 2, 4]
    );
    assert_eq!(int_values(&out, 3), vec![None, Some(10), Some(20), Some(20)]);
}
