use std::path::Path;
use std::sync::Arc;

use arrow::array::{AsArray, RecordBatch, StringArray};
use arrow::datatypes::Int64Type;
use arrow::util::pretty::pretty_format_batches;
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use lfq_common::{LfqError, Result};
use lfq_execution::{
    CancellationToken, ExecNode, SendableRecordBatchStream, execute_stream,
    execute_stream_partitioned, explain_physical,
};
use lfq_planner::analyzer::{is_numeric, is_string};
use lfq_planner::expr_fn::{
    avg, coalesce, col, count, count_star, lit, max, median, min, stddev, sum,
};
use lfq_planner::{
    Expr, JoinKeys, JoinType, LogicalPlan, LogicalPlanBuilder, Partitioning, ScalarValue, SortExpr,
    explain_logical,
};
use lfq_storage::MemTable;
use tracing::debug;

use crate::session::SharedSession;
use crate::writer::{self, Compression};

/// Lazily evaluated query over an engine's tables.
///
/// Every transformation returns a new `DataFrame` sharing the session and
/// the input plan; nothing runs until an action (`collect`, `count`,
/// `show`, a writer) is awaited.
#[derive(Debug, Clone)]
pub struct DataFrame {
    session: SharedSession,
    plan: Arc<LogicalPlan>,
}

impl DataFrame {
    pub(crate) fn new(session: SharedSession, plan: Arc<LogicalPlan>) -> Self {
        Self { session, plan }
    }

    /// Full scan of a registered table.
    pub(crate) fn table(session: SharedSession, name: &str) -> Result<Self> {
        let schema = session.catalog.schema(name)?;
        let plan = LogicalPlanBuilder::scan(name, schema)?.build();
        Ok(Self::new(session, plan))
    }

    /// Register `table` under an engine-owned name and scan it.
    pub(crate) fn from_mem_table(session: SharedSession, kind: &str, table: MemTable) -> Result<Self> {
        let name = session.internal_table_name(kind);
        session.catalog.register(name.clone(), Arc::new(table))?;
        Self::table(session, &name)
    }

    fn builder(&self) -> LogicalPlanBuilder {
        LogicalPlanBuilder::from(Arc::clone(&self.plan))
    }

    fn with_plan(&self, builder: LogicalPlanBuilder) -> Self {
        Self::new(Arc::clone(&self.session), builder.build())
    }

    fn other_plan(&self, other: &DataFrame) -> Result<Arc<LogicalPlan>> {
        if !Arc::ptr_eq(&self.session, &other.session) {
            return Err(LfqError::BuilderArgument(
                "cannot combine DataFrames from different Engine instances".to_string(),
            ));
        }
        Ok(Arc::clone(&other.plan))
    }

    pub fn schema(&self) -> SchemaRef {
        Arc::clone(self.plan.schema())
    }

    pub fn select_columns(&self, names: &[&str]) -> Result<Self> {
        self.select(names.iter().map(|n| col(*n)).collect())
    }

    /// Project `exprs`; window calls among them get a Window node below.
    pub fn select(&self, exprs: Vec<Expr>) -> Result<Self> {
        Ok(self.with_plan(self.builder().select(exprs)?))
    }

    /// Remove the named columns. Names not present are ignored.
    pub fn drop_columns(&self, names: &[&str]) -> Result<Self> {
        let keep = self
            .plan
            .schema()
            .fields()
            .iter()
            .filter(|f| !names.contains(&f.name().as_str()))
            .map(|f| col(f.name().clone()))
            .collect();
        self.select(keep)
    }

    pub fn with_column(&self, name: &str, expr: Expr) -> Result<Self> {
        self.with_columns(vec![expr.alias(name)])
    }

    /// Replace same-named columns in place and append the others, in order.
    pub fn with_columns(&self, exprs: Vec<Expr>) -> Result<Self> {
        let mut pending: Vec<(String, Expr)> =
            exprs.into_iter().map(|e| (e.display_name(), e)).collect();
        let mut out = Vec::with_capacity(self.plan.schema().fields().len() + pending.len());
        for field in self.plan.schema().fields() {
            match pending.iter().position(|(n, _)| n == field.name()) {
                Some(i) => {
                    let (name, e) = pending.remove(i);
                    out.push(e.alias(name));
                }
                None => out.push(col(field.name().clone())),
            }
        }
        out.extend(pending.into_iter().map(|(name, e)| e.alias(name)));
        self.select(out)
    }

    /// Rename `old` to `new`; a missing `old` leaves the frame unchanged.
    pub fn with_column_renamed(&self, old: &str, new: &str) -> Result<Self> {
        let schema = self.plan.schema();
        if schema.index_of(old).is_err() {
            return Ok(self.clone());
        }
        let exprs = schema
            .fields()
            .iter()
            .map(|f| {
                if f.name() == old {
                    col(old).alias(new)
                } else {
                    col(f.name().clone())
                }
            })
            .collect();
        self.select(exprs)
    }

    /// Cast each named column to its target type, keeping names and order.
    pub fn cast_columns(&self, mapping: &[(&str, DataType)]) -> Result<Self> {
        let schema = self.plan.schema();
        for (name, _) in mapping {
            schema
                .index_of(name)
                .map_err(|_| LfqError::Schema(format!("cast of unknown column '{name}'")))?;
        }
        let exprs = schema
            .fields()
            .iter()
            .map(|f| match mapping.iter().find(|(n, _)| n == f.name()) {
                Some((name, ty)) => col(*name).cast(ty.clone()).alias(*name),
                None => col(f.name().clone()),
            })
            .collect();
        self.select(exprs)
    }

    /// Keep rows satisfying all `predicates`.
    pub fn filter(&self, predicates: Vec<Expr>) -> Result<Self> {
        Ok(self.with_plan(self.builder().filter(predicates)?))
    }

    pub fn aggregate(&self, group_by: Vec<Expr>, aggs: Vec<Expr>) -> Result<Self> {
        Ok(self.with_plan(self.builder().aggregate(group_by, aggs)?))
    }

    pub fn sort(&self, exprs: Vec<SortExpr>) -> Result<Self> {
        Ok(self.with_plan(self.builder().sort(exprs)?))
    }

    /// Skip `offset` rows, then keep at most `count`.
    pub fn limit(&self, count: usize, offset: usize) -> Result<Self> {
        Ok(self.with_plan(self.builder().limit(offset, Some(count))?))
    }

    pub fn head(&self, n: usize) -> Result<Self> {
        self.limit(n, 0)
    }

    /// Last `n` rows in the current order. Executes a count first.
    pub async fn tail(&self, n: usize) -> Result<Self> {
        let total = self.count().await?;
        self.limit(n, total.saturating_sub(n))
    }

    pub fn distinct(&self) -> Result<Self> {
        Ok(self.with_plan(self.builder().distinct()?))
    }

    /// Summary statistics, one row per statistic and a leading `describe`
    /// label column. Numeric columns report `Float64`, all others `Utf8`
    /// with only the statistics that apply to them.
    pub fn describe(&self) -> Result<Self> {
        let schema = self.plan.schema();
        let mut described: Option<LogicalPlanBuilder> = None;
        for stat in DescribeStat::ALL {
            let mut aggs = vec![count_star().alias(DESCRIBE_ROWS)];
            let mut exprs = vec![lit(stat.name()).alias("describe")];
            for field in schema.fields() {
                let name = field.name().as_str();
                let kind = ColumnKind::of(field.data_type());
                let out_type = kind.output_type();
                match stat.aggregate(name, kind) {
                    Some(agg) => {
                        aggs.push(agg.alias(name));
                        let value = if stat == DescribeStat::NullCount {
                            coalesce(vec![col(name), lit(0i64)])
                        } else {
                            col(name)
                        };
                        exprs.push(value.cast(out_type).alias(name));
                    }
                    None => {
                        let null = ScalarValue::try_new_null(&out_type)?;
                        exprs.push(lit(null).alias(name));
                    }
                }
            }
            let row = self.builder().aggregate(vec![], aggs)?.select(exprs)?;
            described = Some(match described {
                None => row,
                Some(acc) => acc.union(row.build())?,
            });
        }
        let described = described.ok_or_else(|| {
            LfqError::Execution("describe produced no statistics".to_string())
        })?;
        Ok(self.with_plan(described))
    }

    pub fn join(&self, right: &DataFrame, how: JoinType, keys: JoinKeys) -> Result<Self> {
        let right = self.other_plan(right)?;
        Ok(self.with_plan(self.builder().join_keys(right, how, keys)?))
    }

    /// Join on arbitrary predicates over left columns and (suffixed) right columns.
    pub fn join_on(&self, right: &DataFrame, how: JoinType, predicates: Vec<Expr>) -> Result<Self> {
        let right = self.other_plan(right)?;
        Ok(self.with_plan(self.builder().join_on(right, how, predicates)?))
    }

    pub fn union(&self, other: &DataFrame) -> Result<Self> {
        let other = self.other_plan(other)?;
        Ok(self.with_plan(self.builder().union(other)?))
    }

    pub fn union_distinct(&self, other: &DataFrame) -> Result<Self> {
        let other = self.other_plan(other)?;
        Ok(self.with_plan(self.builder().union_distinct(other)?))
    }

    /// Rows present in both inputs, keeping duplicates.
    pub fn intersect(&self, other: &DataFrame) -> Result<Self> {
        let other = self.other_plan(other)?;
        Ok(self.with_plan(self.builder().intersect(other, true)?))
    }

    pub fn intersect_distinct(&self, other: &DataFrame) -> Result<Self> {
        let other = self.other_plan(other)?;
        Ok(self.with_plan(self.builder().intersect(other, false)?))
    }

    pub fn except_all(&self, other: &DataFrame) -> Result<Self> {
        let other = self.other_plan(other)?;
        Ok(self.with_plan(self.builder().except(other, true)?))
    }

    pub fn except_distinct(&self, other: &DataFrame) -> Result<Self> {
        let other = self.other_plan(other)?;
        Ok(self.with_plan(self.builder().except(other, false)?))
    }

    /// Round-robin into `n` partitions.
    pub fn repartition(&self, n: usize) -> Result<Self> {
        Ok(self.with_plan(self.builder().repartition(Partitioning::RoundRobin(n))?))
    }

    pub fn repartition_by_hash(&self, exprs: Vec<Expr>, n: usize) -> Result<Self> {
        Ok(self.with_plan(self.builder().repartition(Partitioning::Hash(exprs, n))?))
    }

    pub fn unnest_columns(&self, columns: &[&str], preserve_nulls: bool) -> Result<Self> {
        let columns = columns.iter().map(|c| c.to_string()).collect();
        Ok(self.with_plan(self.builder().unnest(columns, preserve_nulls)?))
    }

    pub fn unnest_column(&self, column: &str, preserve_nulls: bool) -> Result<Self> {
        self.unnest_columns(&[column], preserve_nulls)
    }

    /// Apply a user function that builds on this frame.
    pub fn transform<F>(&self, f: F) -> Result<Self>
    where
        F: FnOnce(DataFrame) -> Result<DataFrame>,
    {
        f(self.clone())
    }

    pub fn logical_plan(&self) -> &Arc<LogicalPlan> {
        &self.plan
    }

    pub fn optimized_logical_plan(&self) -> Result<Arc<LogicalPlan>> {
        self.session.optimize(&self.plan)
    }

    pub fn execution_plan(&self) -> Result<Arc<dyn ExecNode>> {
        self.session.create_physical_plan(&self.plan)
    }

    async fn explain_rows(&self, verbose: bool, analyze: bool) -> Result<Vec<(&'static str, String)>> {
        let mut rows = Vec::new();
        if verbose {
            rows.push(("initial_logical_plan", explain_logical(&self.plan)));
        }
        let optimized = self.optimized_logical_plan()?;
        rows.push(("logical_plan", explain_logical(&optimized)));
        let physical = self.session.plan_physical(&optimized)?;
        if analyze {
            let ctx = self.session.task_context(None);
            self.session.runtime.execute(Arc::clone(&physical), ctx).await?;
            rows.push(("physical_plan_with_metrics", explain_physical(&physical, true)));
        } else {
            rows.push(("physical_plan", explain_physical(&physical, false)));
        }
        Ok(rows)
    }

    /// Plans as a two-column (`plan_type`, `plan`) frame.
    ///
    /// `verbose` adds the unoptimized logical plan. `analyze` executes the
    /// query and reports per-operator metrics instead of the bare physical plan.
    pub async fn explain(&self, verbose: bool, analyze: bool) -> Result<DataFrame> {
        let rows = self.explain_rows(verbose, analyze).await?;
        let schema = Arc::new(Schema::new(vec![
            Field::new("plan_type", DataType::Utf8, false),
            Field::new("plan", DataType::Utf8, false),
        ]));
        let batch = RecordBatch::try_new(
            Arc::clone(&schema),
            vec![
                Arc::new(StringArray::from_iter_values(rows.iter().map(|(t, _)| *t))),
                Arc::new(StringArray::from_iter_values(rows.iter().map(|(_, p)| p.as_str()))),
            ],
        )?;
        let table = MemTable::try_new(schema, vec![vec![batch]])?;
        DataFrame::from_mem_table(Arc::clone(&self.session), "explain", table)
    }

    pub async fn explain_string(&self, verbose: bool, analyze: bool) -> Result<String> {
        let rows = self.explain_rows(verbose, analyze).await?;
        let mut out = String::new();
        for (plan_type, plan) in rows {
            out.push_str(plan_type);
            out.push_str(":\n");
            out.push_str(&plan);
            if !plan.ends_with('\n') {
                out.push('\n');
            }
        }
        Ok(out)
    }

    pub async fn collect(&self) -> Result<Vec<RecordBatch>> {
        Ok(self.collect_partitioned().await?.into_iter().flatten().collect())
    }

    /// Batches grouped by output partition.
    pub async fn collect_partitioned(&self) -> Result<Vec<Vec<RecordBatch>>> {
        let query_id = self.session.next_query_id();
        debug!(%query_id, plan = %self.plan.name(), "collecting query");
        let physical = self.execution_plan()?;
        let ctx = self.session.task_context(None);
        self.session.runtime.execute(physical, ctx).await
    }

    /// Single ordered stream over all partitions.
    pub fn execute_stream(&self) -> Result<SendableRecordBatchStream> {
        execute_stream(self.execution_plan()?, self.session.task_context(None))
    }

    /// Like [`DataFrame::execute_stream`], stopped early once `token` is cancelled.
    pub fn execute_stream_with_cancel(&self, token: CancellationToken) -> Result<SendableRecordBatchStream> {
        execute_stream(self.execution_plan()?, self.session.task_context(Some(token)))
    }

    pub fn execute_stream_partitioned(&self) -> Result<Vec<SendableRecordBatchStream>> {
        execute_stream_partitioned(self.execution_plan()?, self.session.task_context(None))
    }

    pub async fn count(&self) -> Result<usize> {
        let counted = self
            .builder()
            .aggregate(vec![], vec![count_star().alias("count")])?;
        let batches = self.with_plan(counted).collect().await?;
        let n = batches
            .iter()
            .find(|b| b.num_rows() > 0)
            .map(|b| b.column(0).as_primitive::<Int64Type>().value(0))
            .unwrap_or_default();
        row_count(n)
    }

    /// First `n` rows rendered as a text table.
    pub async fn to_string(&self, n: usize) -> Result<String> {
        let mut batches = self.head(n)?.collect().await?;
        if batches.is_empty() {
            batches.push(RecordBatch::new_empty(self.schema()));
        }
        Ok(pretty_format_batches(&batches)?.to_string())
    }

    /// Print the first `n` rows to stdout.
    pub async fn show(&self, n: usize) -> Result<()> {
        println!("{}", self.to_string(n).await?);
        Ok(())
    }

    /// Execute once and keep the result as an in-memory table.
    pub async fn cache(&self) -> Result<DataFrame> {
        let partitions = self.collect_partitioned().await?;
        let table = MemTable::try_new(self.schema(), partitions)?;
        DataFrame::from_mem_table(Arc::clone(&self.session), "cache", table)
    }

    pub async fn write_csv(&self, path: impl AsRef<Path>, with_header: bool) -> Result<()> {
        let batches = self.collect().await?;
        writer::write_csv(path.as_ref(), &batches, with_header)
    }

    pub async fn write_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let batches = self.collect().await?;
        writer::write_json(path.as_ref(), &batches)
    }

    /// `level` defaults per codec; passing one for a codec without levels is an error.
    pub async fn write_parquet(
        &self,
        path: impl AsRef<Path>,
        compression: Compression,
        level: Option<u32>,
    ) -> Result<()> {
        // Reject a bad codec/level pair before running the query.
        compression.to_parquet(level)?;
        let batches = self.collect().await?;
        writer::write_parquet(path.as_ref(), self.schema(), &batches, compression, level)
    }
}

const DESCRIBE_ROWS: &str = "__lfq_describe_rows";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DescribeStat {
    Count,
    NullCount,
    Mean,
    Std,
    Min,
    Max,
    Median,
}

impl DescribeStat {
    const ALL: [DescribeStat; 7] = [
        DescribeStat::Count,
        DescribeStat::NullCount,
        DescribeStat::Mean,
        DescribeStat::Std,
        DescribeStat::Min,
        DescribeStat::Max,
        DescribeStat::Median,
    ];

    fn name(self) -> &'static str {
        match self {
            DescribeStat::Count => "count",
            DescribeStat::NullCount => "null_count",
            DescribeStat::Mean => "mean",
            DescribeStat::Std => "std",
            DescribeStat::Min => "min",
            DescribeStat::Max => "max",
            DescribeStat::Median => "median",
        }
    }

    /// `None` when the statistic does not apply to the column.
    fn aggregate(self, column: &str, kind: ColumnKind) -> Option<Expr> {
        let c = col(column);
        match (self, kind) {
            (DescribeStat::Count, _) => Some(count(c)),
            (DescribeStat::NullCount, _) => Some(sum(c.is_null().cast(DataType::Int64))),
            (DescribeStat::Mean, ColumnKind::Numeric) => Some(avg(c)),
            (DescribeStat::Std, ColumnKind::Numeric) => Some(stddev(c)),
            (DescribeStat::Median, ColumnKind::Numeric) => Some(median(c)),
            (DescribeStat::Min, ColumnKind::Numeric | ColumnKind::Ordered) => Some(min(c)),
            (DescribeStat::Max, ColumnKind::Numeric | ColumnKind::Ordered) => Some(max(c)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnKind {
    Numeric,
    /// Strings and booleans: min and max apply.
    Ordered,
    Other,
}

impl ColumnKind {
    fn of(data_type: &DataType) -> Self {
        if is_numeric(data_type) {
            ColumnKind::Numeric
        } else if is_string(data_type) || *data_type == DataType::Boolean {
            ColumnKind::Ordered
        } else {
            ColumnKind::Other
        }
    }

    fn output_type(self) -> DataType {
        match self {
            ColumnKind::Numeric => DataType::Float64,
            ColumnKind::Ordered | ColumnKind::Other => DataType::Utf8,
        }
    }
}

fn row_count(n: i64) -> Result<usize> {
    usize::try_from(n)
        .map_err(|_| LfqError::Execution(format!("count produced an invalid row count {n}")))
}

#[cfg(test)]
mod tests {
    use lfq_common::LfqError;

    use super::row_count;

    #[test]
    fn negative_row_count_is_an_execution_error() {
        assert_eq!(row_count(7).expect("count"), 7);
        let err = row_count(-1).expect_err("negative count");
        assert!(matches!(err, LfqError::Execution(_)), "{err}");
    }
}
