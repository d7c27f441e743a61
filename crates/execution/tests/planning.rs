use std::collections::HashMap;
use std::sync::Arc;

use arrow::array::{AsArray, Int64Array, RecordBatch, StringArray};
use arrow::datatypes::Int64Type;
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use futures::StreamExt;
use futures::executor::block_on;
use lfq_common::{EngineConfig, LfqError, Result};
use lfq_execution::ops::MemoryExec;
use lfq_execution::{
    ExecNode, SourceProvider, TableSource, TableStatistics, TaskContext, collect,
    create_physical_plan, execute_stream, explain_physical,
};
use lfq_planner::expr_fn::{col, count_star, lit, sum};
use lfq_planner::{Expr, JoinType, LogicalPlan, LogicalPlanBuilder, Optimizer, OptimizerConfig, SortExpr};

#[derive(Debug)]
struct Table {
    schema: SchemaRef,
    partitions: Vec<Vec<RecordBatch>>,
}

impl TableSource for Table {
    fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    fn statistics(&self) -> TableStatistics {
        let rows = self.partitions.iter().flatten().map(|b| b.num_rows()).sum();
        TableStatistics {
            num_rows: Some(rows),
            total_bytes: Some(
                self.partitions
                    .iter()
                    .flatten()
                    .map(|b| b.get_array_memory_size())
                    .sum(),
            ),
        }
    }

    fn scan(
        &self,
        projection: Option<&[usize]>,
        _filters: &[Expr],
        limit: Option<usize>,
    ) -> Result<Arc<dyn ExecNode>> {
        Ok(Arc::new(MemoryExec::try_new(
            self.partitions.clone(),
            Arc::clone(&self.schema),
            projection.map(<[usize]>::to_vec),
            limit,
        )?))
    }
}

#[derive(Default)]
struct Catalog {
    tables: HashMap<String, Arc<dyn TableSource>>,
}

impl SourceProvider for Catalog {
    fn source(&self, table: &str) -> Result<Arc<dyn TableSource>> {
        self.tables
            .get(table)
            .cloned()
            .ok_or_else(|| LfqError::Schema(format!("table '{table}' not found")))
    }
}

fn catalog() -> Catalog {
    let orders = Arc::new(Schema::new(vec![
        Field::new("customer", DataType::Int64, false),
        Field::new("amount", DataType::Int64, true),
    ]));
    let customers = Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int64, false),
        Field::new("name", DataType::Utf8, true),
    ]));
    let order_batch = |c: Vec<i64>, a: Vec<i64>| {
        RecordBatch::try_new(
            Arc::clone(&orders),
            vec![Arc::new(Int64Array::from(c)), Arc::new(Int64Array::from(a))],
        )
        .expect("orders batch")
    };
    let customer_batch = RecordBatch::try_new(
        Arc::clone(&customers),
        vec![
            Arc::new(Int64Array::from(vec![1, 2, 3])),
            Arc::new(StringArray::from(vec!["ann", "bob", "cid"])),
        ],
    )
    .expect("customers batch");

    let mut cat = Catalog::default();
    cat.tables.insert(
        "orders".to_string(),
        Arc::new(Table {
            schema: Arc::clone(&orders),
            partitions: vec![
                vec![order_batch(vec![1, 2, 1], vec![10, 20, 30])],
                vec![order_batch(vec![3, 1, 2], vec![5, 40, 1])],
            ],
        }),
    );
    cat.tables.insert(
        "customers".to_string(),
        Arc::new(Table {
            schema: customers,
            partitions: vec![vec![customer_batch]],
        }),
    );
    cat
}

fn config() -> EngineConfig {
    EngineConfig {
        target_partitions: 3,
        ..EngineConfig::default()
    }
}

fn run(plan: Arc<LogicalPlan>, cat: &Catalog) -> (Arc<dyn ExecNode>, Vec<RecordBatch>) {
    let cfg = config();
    let optimized = Optimizer::new()
        .optimize(plan, &OptimizerConfig::default())
        .expect("optimize");
    let physical = create_physical_plan(&optimized, cat, &cfg).expect("physical plan");
    let ctx = Arc::new(TaskContext::new(cfg));
    let batches = block_on(collect(Arc::clone(&physical), ctx)).expect("collect");
    (physical, batches)
}

fn scan(cat: &Catalog, table: &str) -> LogicalPlanBuilder {
    let schema = cat.source(table).expect("table").schema();
    LogicalPlanBuilder::scan(table, schema).expect("scan")
}

#[test]
fn join_aggregate_sort_runs_end_to_end() {
    let cat = catalog();
    let customers = scan(&cat, "customers").build();
    let plan = scan(&cat, "orders")
        .filter(vec![col("amount").gt(lit(2i64))])
        .expect("filter")
        .join(
            customers,
            JoinType::Inner,
            vec!["customer".to_string()],
            vec!["id".to_string()],
            None,
        )
        .expect("join")
        .aggregate(vec![col("name")], vec![sum(col("amount")), count_star()])
        .expect("aggregate")
        .sort(vec![SortExpr::from(col("name"))])
        .expect("sort")
        .build();
    let (_, batches) = run(plan, &cat);

    let names: Vec<String> = batches
        .iter()
        .flat_map(|b| {
            b.column(0)
                .as_string::<i32>()
                .iter()
                .map(|v| v.unwrap_or_default().to_string())
                .collect::<Vec<_>>()
        })
        .collect();
    let sums: Vec<i64> = batches
        .iter()
        .flat_map(|b| b.column(1).as_primitive::<Int64Type>().values().to_vec())
        .collect();
    assert_eq!(names, vec!["ann", "bob", "cid"]);
    assert_eq!(sums, vec![80, 20, 5]);
}

#[test]
fn limit_over_partitioned_scan_returns_exact_rows() {
    let cat = catalog();
    let plan = scan(&cat, "orders")
        .limit(1, Some(3))
        .expect("limit")
        .build();
    let (physical, batches) = run(plan, &cat);
    assert_eq!(batches.iter().map(|b| b.num_rows()).sum::<usize>(), 3);
    assert_eq!(physical.output_partitioning().partition_count(), 1);
}

#[test]
fn explain_reports_operator_metrics_after_execution() {
    let cat = catalog();
    let plan = scan(&cat, "orders")
        .aggregate(vec![col("customer")], vec![sum(col("amount"))])
        .expect("aggregate")
        .build();
    let (physical, _) = run(plan, &cat);
    let text = explain_physical(&physical, true);
    assert!(text.contains("HashAggregateExec"), "{text}");
    assert!(text.contains("RepartitionExec"), "{text}");
    assert!(text.contains("MemoryExec"), "{text}");
    assert!(text.contains("output_rows=6"), "{text}");
}

#[test]
fn plan_schema_matches_logical_schema() {
    let cat = catalog();
    let plan = scan(&cat, "orders")
        .select(vec![col("amount").alias("a"), col("customer")])
        .expect("select")
        .build();
    let physical = create_physical_plan(&plan, &cat, &config()).expect("physical plan");
    assert_eq!(physical.schema().as_ref(), plan.schema().as_ref());
}

#[tokio::test]
async fn streamed_results_arrive_in_sort_order() {
    let cat = catalog();
    let plan = scan(&cat, "orders")
        .sort(vec![SortExpr::from(col("amount"))])
        .expect("sort")
        .build();
    let physical = create_physical_plan(&plan, &cat, &config()).expect("physical plan");
    let ctx = Arc::new(TaskContext::new(config()));
    let mut stream = execute_stream(physical, ctx).expect("stream");
    let mut amounts = Vec::new();
    while let Some(batch) = stream.next().await {
        let batch = batch.expect("batch");
        amounts.extend(batch.column(1).as_primitive::<Int64Type>().values().iter().copied());
    }
    assert_eq!(amounts, vec![1, 5, 10, 20, 30, 40]);
}
