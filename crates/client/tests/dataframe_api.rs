use std::sync::Arc;

use arrow::array::{Array, AsArray, Int64Array, ListArray, RecordBatch, StringArray};
use arrow::datatypes::{Float64Type, Int64Type, UInt64Type};
use arrow::util::display::array_value_to_string;
use arrow_schema::{DataType, Field, Schema};
use lfq_client::{
    CancellationToken, DataFrame, Engine, JoinKeys, JoinType, SortExpr, col, count_star, lit,
    row_number, sum,
};
use lfq_common::{EngineConfig, LfqError};

fn engine() -> Engine {
    let cfg = EngineConfig {
        target_partitions: 2,
        worker_threads: Some(2),
        ..EngineConfig::default()
    };
    Engine::new(cfg).expect("engine")
}

fn people() -> RecordBatch {
    let schema = Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int64, false),
        Field::new("name", DataType::Utf8, true),
        Field::new("dept", DataType::Int64, true),
    ]));
    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(Int64Array::from(vec![1, 2, 3, 4])),
            Arc::new(StringArray::from(vec!["ann", "bob", "cid", "dee"])),
            Arc::new(Int64Array::from(vec![Some(10), Some(20), Some(10), None])),
        ],
    )
    .expect("people")
}

fn depts() -> RecordBatch {
    let schema = Arc::new(Schema::new(vec![
        Field::new("dept", DataType::Int64, false),
        Field::new("name", DataType::Utf8, false),
    ]));
    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(Int64Array::from(vec![10, 30])),
            Arc::new(StringArray::from(vec!["eng", "ops"])),
        ],
    )
    .expect("depts")
}

fn ints(batches: &[RecordBatch], name: &str) -> Vec<Option<i64>> {
    batches
        .iter()
        .flat_map(|b| {
            let idx = b.schema().index_of(name).expect("column");
            let a = b.column(idx).as_primitive::<Int64Type>().clone();
            (0..a.len())
                .map(|i| a.is_valid(i).then(|| a.value(i)))
                .collect::<Vec<_>>()
        })
        .collect()
}

fn strings(batches: &[RecordBatch], name: &str) -> Vec<Option<String>> {
    batches
        .iter()
        .flat_map(|b| {
            let idx = b.schema().index_of(name).expect("column");
            b.column(idx)
                .as_string::<i32>()
                .iter()
                .map(|v| v.map(str::to_string))
                .collect::<Vec<_>>()
        })
        .collect()
}

fn rows(batches: &[RecordBatch]) -> usize {
    batches.iter().map(|b| b.num_rows()).sum()
}

fn frame(engine: &Engine) -> DataFrame {
    engine.register_batches("people", vec![people()]).expect("register");
    engine.table("people").expect("table")
}

#[tokio::test]
async fn filter_aggregate_sort() {
    let engine = engine();
    let df = frame(&engine)
        .filter(vec![col("dept").is_not_null()])
        .expect("filter")
        .aggregate(vec![col("dept")], vec![sum(col("id")).alias("ids"), count_star()])
        .expect("aggregate")
        .sort(vec![SortExpr::from(col("dept"))])
        .expect("sort");
    let batches = df.collect().await.expect("collect");
    assert_eq!(ints(&batches, "dept"), vec![Some(10), Some(20)]);
    assert_eq!(ints(&batches, "ids"), vec![Some(4), Some(2)]);
    assert!(engine.prometheus_metrics().contains("lfq_queries_total"));
}

#[tokio::test]
async fn join_on_shared_key_emits_it_once_and_suffixes_collisions() {
    let engine = engine();
    let people = frame(&engine);
    engine.register_batches("depts", vec![depts()]).expect("register");
    let depts = engine.table("depts").expect("table");

    let joined = people
        .join(&depts, JoinType::Left, JoinKeys::On(vec!["dept".to_string()]))
        .expect("join")
        .sort(vec![SortExpr::from(col("id"))])
        .expect("sort");
    let names: Vec<String> = joined
        .schema()
        .fields()
        .iter()
        .map(|f| f.name().clone())
        .collect();
    assert_eq!(names, vec!["id", "name", "dept", "name_right"]);

    let batches = joined.collect().await.expect("collect");
    assert_eq!(
        strings(&batches, "name_right"),
        vec![Some("eng".to_string()), None, Some("eng".to_string()), None]
    );
}

#[test]
fn join_keys_require_exactly_one_form() {
    assert!(matches!(
        JoinKeys::try_new(Some(vec!["a".into()]), Some(vec!["a".into()]), None),
        Err(LfqError::BuilderArgument(_))
    ));
    assert!(matches!(
        JoinKeys::try_new(None, Some(vec!["a".into()]), None),
        Err(LfqError::BuilderArgument(_))
    ));
    assert!(JoinKeys::try_new(None, Some(vec!["a".into()]), Some(vec!["b".into()])).is_ok());
}

#[tokio::test]
async fn column_helpers_keep_order() {
    let engine = engine();
    let df = frame(&engine)
        .with_columns(vec![
            col("id").cast(DataType::Float64).alias("id"),
            lit(1i64).alias("one"),
        ])
        .expect("with_columns")
        .with_column_renamed("missing", "x")
        .expect("rename missing")
        .with_column_renamed("name", "who")
        .expect("rename")
        .drop_columns(&["dept"])
        .expect("drop");
    let schema = df.schema();
    let fields: Vec<(&str, &DataType)> = schema
        .fields()
        .iter()
        .map(|f| (f.name().as_str(), f.data_type()))
        .collect();
    assert_eq!(
        fields,
        vec![
            ("id", &DataType::Float64),
            ("who", &DataType::Utf8),
            ("one", &DataType::Int64)
        ]
    );

    let cast = frame(&engine)
        .cast_columns(&[("dept", DataType::Utf8)])
        .expect("cast");
    assert_eq!(cast.schema().field(2).data_type(), &DataType::Utf8);
    assert!(matches!(
        frame(&engine).cast_columns(&[("nope", DataType::Utf8)]),
        Err(LfqError::Schema(_))
    ));
}

#[tokio::test]
async fn window_in_select_numbers_rows_per_partition() {
    let engine = engine();
    let df = frame(&engine)
        .select(vec![
            col("id"),
            row_number()
                .over(vec![col("dept")], vec![SortExpr::from(col("id"))])
                .alias("rn"),
        ])
        .expect("select")
        .sort(vec![SortExpr::from(col("id"))])
        .expect("sort");
    let batches = df.collect().await.expect("collect");
    let rn: Vec<u64> = batches
        .iter()
        .flat_map(|b| b.column(1).as_primitive::<UInt64Type>().values().to_vec())
        .collect();
    assert_eq!(rn, vec![1, 1, 2, 1]);
}

#[tokio::test]
async fn set_operations() {
    let engine = engine();
    let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, true)]));
    let make = |vals: Vec<i64>| {
        RecordBatch::try_new(Arc::clone(&schema), vec![Arc::new(Int64Array::from(vals))])
            .expect("batch")
    };
    let a = engine.read_batches(vec![make(vec![1, 1, 2, 3])]).expect("a");
    let b = engine.read_batches(vec![make(vec![1, 1, 1, 3, 4])]).expect("b");

    let sorted = |df: DataFrame| df.sort(vec![SortExpr::from(col("v"))]).expect("sort");
    let intersect = sorted(a.intersect(&b).expect("intersect")).collect().await.expect("run");
    assert_eq!(ints(&intersect, "v"), vec![Some(1), Some(1), Some(3)]);
    let except = sorted(a.except_distinct(&b).expect("except")).collect().await.expect("run");
    assert_eq!(ints(&except, "v"), vec![Some(2)]);
    let union = sorted(a.union_distinct(&b).expect("union")).collect().await.expect("run");
    assert_eq!(ints(&union, "v"), vec![Some(1), Some(2), Some(3), Some(4)]);
    assert!(engine.list_tables().is_empty());
}

#[tokio::test]
async fn count_head_tail() {
    let engine = engine();
    let df = frame(&engine).sort(vec![SortExpr::from(col("id"))]).expect("sort");
    assert_eq!(df.count().await.expect("count"), 4);
    let head = df.head(2).expect("head").collect().await.expect("head rows");
    assert_eq!(ints(&head, "id"), vec![Some(1), Some(2)]);
    let tail = df.tail(3).await.expect("tail").collect().await.expect("tail rows");
    assert_eq!(ints(&tail, "id"), vec![Some(2), Some(3), Some(4)]);
    let text = df.to_string(2).await.expect("to_string");
    assert!(text.contains("ann") && !text.contains("cid"), "{text}");
}

#[tokio::test]
async fn unnest_zips_lists() {
    let engine = engine();
    let schema = Arc::new(Schema::new(vec![
        Field::new("k", DataType::Int64, false),
        Field::new(
            "xs",
            DataType::List(Arc::new(Field::new_list_field(DataType::Int64, true))),
            true,
        ),
    ]));
    let xs = ListArray::from_iter_primitive::<Int64Type, _, _>(vec![
        Some(vec![Some(1), Some(2)]),
        None,
        Some(vec![]),
    ]);
    let batch = RecordBatch::try_new(
        schema,
        vec![Arc::new(Int64Array::from(vec![1, 2, 3])), Arc::new(xs)],
    )
    .expect("batch");
    let df = engine.read_batches(vec![batch]).expect("read");

    let dropped = df.unnest_column("xs", false).expect("unnest").collect().await.expect("run");
    assert_eq!(ints(&dropped, "xs"), vec![Some(1), Some(2)]);
    let kept = df.unnest_column("xs", true).expect("unnest").collect().await.expect("run");
    assert_eq!(ints(&kept, "k"), vec![Some(1), Some(1), Some(2)]);
}

#[tokio::test]
async fn explain_lists_plans_and_metrics() {
    let engine = engine();
    let df = frame(&engine).filter(vec![col("id").gt(lit(1i64))]).expect("filter");

    let plans = df.explain(true, false).await.expect("explain").collect().await.expect("rows");
    assert_eq!(
        strings(&plans, "plan_type"),
        vec![
            Some("initial_logical_plan".to_string()),
            Some("logical_plan".to_string()),
            Some("physical_plan".to_string())
        ]
    );

    let analyzed = df.explain_string(false, true).await.expect("analyze");
    assert!(analyzed.contains("physical_plan_with_metrics:"), "{analyzed}");
    assert!(analyzed.contains("output_rows=3"), "{analyzed}");
}

#[tokio::test]
async fn cache_materializes_once() {
    let engine = engine();
    let cached = frame(&engine)
        .filter(vec![col("dept").eq(lit(10i64))])
        .expect("filter")
        .cache()
        .await
        .expect("cache");
    assert_eq!(cached.count().await.expect("count"), 2);
    assert_eq!(engine.list_tables(), vec!["people".to_string()]);
}

#[tokio::test]
async fn cancelled_stream_reports_cancelled() {
    use futures::StreamExt;

    let engine = engine();
    let token = CancellationToken::new();
    token.cancel();
    let outcome = frame(&engine).execute_stream_with_cancel(token);
    let err = match outcome {
        Err(e) => e,
        Ok(mut stream) => stream
            .next()
            .await
            .expect("an item")
            .expect_err("cancelled stream"),
    };
    assert!(matches!(err, LfqError::Cancelled), "{err}");
}

#[tokio::test]
async fn tiny_budget_falls_back_to_sort_based_aggregation() {
    let cfg = EngineConfig {
        target_partitions: 2,
        mem_budget_bytes: 256,
        batch_size_rows: 64,
        ..EngineConfig::default()
    };
    let engine = Engine::new(cfg).expect("engine");
    let schema = Arc::new(Schema::new(vec![Field::new("k", DataType::Int64, false)]));
    let batch = RecordBatch::try_new(
        Arc::clone(&schema),
        vec![Arc::new(Int64Array::from_iter_values((0..2000).map(|i| i % 500)))],
    )
    .expect("batch");
    let df = engine
        .read_batches(vec![batch])
        .expect("read")
        .aggregate(vec![col("k")], vec![count_star().alias("n")])
        .expect("aggregate");
    let plan = df.execution_plan().expect("plan");
    assert!(
        lfq_execution::explain_physical(&plan, false).contains("SortAggregateExec"),
        "{}",
        lfq_execution::explain_physical(&plan, false)
    );
    let batches = df.collect().await.expect("collect");
    let counts = ints(&batches, "n");
    assert_eq!(counts.len(), 500);
    assert!(counts.iter().all(|c| *c == Some(4)));
}

fn floats(batches: &[RecordBatch], name: &str) -> Vec<Option<f64>> {
    batches
        .iter()
        .flat_map(|b| {
            let idx = b.schema().index_of(name).expect("column");
            let a = b.column(idx).as_primitive::<Float64Type>().clone();
            (0..a.len())
                .map(|i| a.is_valid(i).then(|| a.value(i)))
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Every row rendered as text and sorted, for order-insensitive comparison.
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

fn sequence(engine: &Engine, n: i64) -> DataFrame {
    let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]));
    let batch = RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from_iter_values(0..n))])
        .expect("batch");
    engine.read_batches(vec![batch]).expect("read")
}

#[tokio::test]
async fn optimizer_does_not_change_results() {
    let run = |enable_optimizer: bool| async move {
        let engine = Engine::new(EngineConfig {
            target_partitions: 2,
            worker_threads: Some(2),
            enable_optimizer,
            ..EngineConfig::default()
        })
        .expect("engine");
        let people = frame(&engine);
        engine.register_batches("depts", vec![depts()]).expect("register");
        let depts = engine.table("depts").expect("table");
        let df = people
            .join(&depts, JoinType::Full, JoinKeys::On(vec!["dept".to_string()]))
            .expect("join")
            .filter(vec![col("id").gt(lit(1i64)).or(col("id").is_null())])
            .expect("filter")
            .with_column("twice", col("id") + col("id"))
            .expect("with_column")
            .select(vec![col("dept"), col("name_right"), col("twice")])
            .expect("select")
            .limit(10, 0)
            .expect("limit");
        df.execution_plan().expect("physical plan");
        sorted_rows(&df.collect().await.expect("collect"))
    };
    let optimized = run(true).await;
    assert_eq!(optimized, run(false).await);
    assert_eq!(optimized.len(), 4, "{optimized:?}");
}

#[tokio::test]
async fn chained_filters_equal_one_conjunction() {
    let engine = engine();
    let df = sequence(&engine, 50);
    let a = col("v").gt(lit(10i64));
    let b = col("v").lt(lit(30i64));
    let chained = df
        .filter(vec![a.clone()])
        .expect("filter a")
        .filter(vec![b.clone()])
        .expect("filter b");
    let conjunction = df.filter(vec![a.and(b)]).expect("filter a and b");
    let chained = sorted_rows(&chained.collect().await.expect("chained"));
    assert_eq!(chained, sorted_rows(&conjunction.collect().await.expect("conjunction")));
    assert_eq!(chained.len(), 19);
}

#[tokio::test]
async fn limit_returns_count_after_offset() {
    let engine = engine();
    let n = 10usize;
    let df = sequence(&engine, n as i64);
    for (count, offset) in [(3, 0), (3, 8), (4, 10), (5, 20), (0, 2), (0, 0), (20, 0)] {
        let limited = df.limit(count, offset).expect("limit");
        let batches = limited.collect().await.expect("collect");
        let expected = count.min(n.saturating_sub(offset));
        assert_eq!(rows(&batches), expected, "limit({count}, {offset})");
        let values = ints(&batches, "v");
        let first = (offset < n).then(|| offset as i64);
        assert_eq!(values.first().copied().flatten(), first.filter(|_| expected > 0));
        assert_eq!(limited.count().await.expect("count"), expected);
    }
}

#[tokio::test]
async fn count_matches_collected_rows() {
    let engine = engine();
    let df = sequence(&engine, 100);
    let frames = [
        df.filter(vec![col("v").gt_eq(lit(37i64))]).expect("filter"),
        df.filter(vec![col("v").lt(lit(0i64))]).expect("empty filter"),
        df.filter(vec![col("v").gt(lit(5i64))])
            .expect("filter")
            .limit(7, 3)
            .expect("limit"),
    ];
    for df in frames {
        let collected = rows(&df.collect().await.expect("collect"));
        assert_eq!(df.count().await.expect("count"), collected);
    }
}

#[tokio::test]
async fn union_distinct_with_itself_is_distinct() {
    let engine = engine();
    let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, true)]));
    let batch = RecordBatch::try_new(
        schema,
        vec![Arc::new(Int64Array::from(vec![Some(3), None, Some(1), Some(3), None]))],
    )
    .expect("batch");
    let df = engine.read_batches(vec![batch]).expect("read");
    let unioned = sorted_rows(&df.union_distinct(&df).expect("union").collect().await.expect("run"));
    let distinct = sorted_rows(&df.distinct().expect("distinct").collect().await.expect("run"));
    assert_eq!(unioned, distinct);
    assert_eq!(unioned.len(), 3);
}

#[tokio::test]
async fn describe_summarizes_each_column() {
    let engine = engine();
    let described = frame(&engine).describe().expect("describe");
    let names: Vec<String> = described
        .schema()
        .fields()
        .iter()
        .map(|f| f.name().clone())
        .collect();
    assert_eq!(names, vec!["describe", "id", "name", "dept"]);
    assert_eq!(described.schema().field(1).data_type(), &DataType::Float64);
    assert_eq!(described.schema().field(2).data_type(), &DataType::Utf8);

    let batches = described.collect().await.expect("collect");
    let labels: Vec<String> = strings(&batches, "describe").into_iter().flatten().collect();
    assert_eq!(
        labels,
        vec!["count", "null_count", "mean", "std", "min", "max", "median"]
    );
    let id = floats(&batches, "id");
    assert_eq!(id[0], Some(4.0));
    assert_eq!(id[1], Some(0.0));
    assert_eq!(id[2], Some(2.5));
    let std = id[3].expect("std");
    assert!((std - (5.0f64 / 3.0).sqrt()).abs() < 1e-9, "{std}");
    assert_eq!(&id[4..], &[Some(1.0), Some(4.0), Some(2.5)]);

    let dept = floats(&batches, "dept");
    assert_eq!(dept[0], Some(3.0));
    assert_eq!(dept[1], Some(1.0));
    assert_eq!(dept[6], Some(10.0));

    let name = strings(&batches, "name");
    assert_eq!(name[0].as_deref(), Some("4"));
    assert_eq!(name[1].as_deref(), Some("0"));
    assert_eq!(name[2], None);
    assert_eq!(name[4].as_deref(), Some("ann"));
    assert_eq!(name[5].as_deref(), Some("dee"));
}
