use std::path::Path;
use std::sync::Arc;

use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use lfq_common::{EngineConfig, Result};
use lfq_execution::TableSource;
use lfq_planner::OptimizerRule;
use lfq_storage::{MemTable, ParquetTable};
use tracing::info;

use crate::DataFrame;
use crate::session::{INTERNAL_TABLE_PREFIX, Session, SharedSession};

/// Entry point: owns the catalog, optimizer, metrics and worker runtime.
///
/// Cloning is cheap and shares all state.
#[derive(Debug, Clone)]
pub struct Engine {
    session: SharedSession,
}

impl Engine {
    /// Start an engine; fails with `InvalidConfig` for an invalid `config`.
    pub fn new(config: EngineConfig) -> Result<Self> {
        let session = Arc::new(Session::new(config)?);
        info!(
            target_partitions = session.config.target_partitions,
            mem_budget_bytes = session.config.mem_budget_bytes,
            "engine started"
        );
        Ok(Self { session })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.session.config
    }

    /// Register `source` under `name`, replacing any previous table.
    pub fn register_table(&self, name: impl Into<String>, source: Arc<dyn TableSource>) -> Result<()> {
        self.session.catalog.register(name, source)?;
        Ok(())
    }

    /// Single-partition in-memory table; the schema comes from the first batch.
    pub fn register_batches(&self, name: impl Into<String>, batches: Vec<RecordBatch>) -> Result<()> {
        self.register_table(name, Arc::new(MemTable::from_batches(batches)?))
    }

    /// In-memory table with one entry per partition.
    pub fn register_partitions(
        &self,
        name: impl Into<String>,
        schema: SchemaRef,
        partitions: Vec<Vec<RecordBatch>>,
    ) -> Result<()> {
        self.register_table(name, Arc::new(MemTable::try_new(schema, partitions)?))
    }

    /// A parquet file, or a directory of parquet files.
    pub fn register_parquet(&self, name: impl Into<String>, path: impl AsRef<Path>) -> Result<()> {
        self.register_table(name, Arc::new(ParquetTable::try_from_path(path)?))
    }

    pub fn read_batches(&self, batches: Vec<RecordBatch>) -> Result<DataFrame> {
        DataFrame::from_mem_table(
            Arc::clone(&self.session),
            "batches",
            MemTable::from_batches(batches)?,
        )
    }

    pub fn read_parquet(&self, path: impl AsRef<Path>) -> Result<DataFrame> {
        let name = self.session.internal_table_name("parquet");
        self.register_parquet(name.clone(), path)?;
        self.table(&name)
    }

    pub fn table(&self, name: &str) -> Result<DataFrame> {
        DataFrame::table(Arc::clone(&self.session), name)
    }

    /// Returns whether a table was removed.
    pub fn deregister_table(&self, name: &str) -> bool {
        self.session.catalog.deregister(name).is_some()
    }

    /// User-registered table names, sorted.
    pub fn list_tables(&self) -> Vec<String> {
        self.session
            .catalog
            .table_names()
            .into_iter()
            .filter(|n| !n.starts_with(INTERNAL_TABLE_PREFIX))
            .collect()
    }

    pub fn table_schema(&self, name: &str) -> Result<SchemaRef> {
        self.session.catalog.schema(name)
    }

    /// Add a rule run after the built-in rules; `true` if it replaced one.
    pub fn register_optimizer_rule(&self, rule: Arc<dyn OptimizerRule>) -> bool {
        self.session.optimizer.register_rule(rule)
    }

    pub fn deregister_optimizer_rule(&self, name: &str) -> bool {
        self.session.optimizer.deregister_rule(name)
    }

    pub fn prometheus_metrics(&self) -> String {
        self.session.prometheus_metrics()
    }

    /// Stop the worker runtime. DataFrames of this engine can no longer run.
    pub async fn shutdown(&self) -> Result<()> {
        self.session.runtime.shutdown().await
    }
}
