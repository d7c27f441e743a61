use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use lfq_common::{EngineConfig, MetricsRegistry, QueryId, Result};
use lfq_execution::{CancellationToken, ExecNode, TaskContext, create_physical_plan};
use lfq_planner::{LogicalPlan, Optimizer, OptimizerConfig};
use lfq_storage::Catalog;
use tracing::debug;

use crate::runtime::{EmbeddedRuntime, Runtime};

pub type SharedSession = Arc<Session>;

/// Prefix of catalog entries created for cached and in-memory DataFrames.
pub(crate) const INTERNAL_TABLE_PREFIX: &str = "__lfq_";

/// State shared by an [`Engine`](crate::Engine) and all DataFrames built from it.
#[derive(Debug)]
pub struct Session {
    pub config: EngineConfig,
    pub catalog: Catalog,
    pub metrics: MetricsRegistry,
    pub optimizer: Optimizer,
    pub runtime: Arc<dyn Runtime>,
    next_query: AtomicU64,
}

impl Session {
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let runtime = Arc::new(EmbeddedRuntime::new(&config)?);
        Ok(Self {
            config,
            catalog: Catalog::new(),
            metrics: MetricsRegistry::new(),
            optimizer: Optimizer::new(),
            runtime,
            next_query: AtomicU64::new(1),
        })
    }

    pub fn next_query_id(&self) -> QueryId {
        QueryId(self.next_query.fetch_add(1, Ordering::Relaxed))
    }

    /// Name for an engine-owned in-memory table.
    pub(crate) fn internal_table_name(&self, kind: &str) -> String {
        format!("{INTERNAL_TABLE_PREFIX}{kind}_{}", self.next_query_id())
    }

    pub fn optimize(&self, plan: &Arc<LogicalPlan>) -> Result<Arc<LogicalPlan>> {
        if !self.config.enable_optimizer {
            return Ok(Arc::clone(plan));
        }
        let cfg = OptimizerConfig {
            max_passes: self.config.optimizer_max_passes,
        };
        self.optimizer.optimize(Arc::clone(plan), &cfg)
    }

    /// Lower an already optimized plan.
    pub fn plan_physical(&self, optimized: &LogicalPlan) -> Result<Arc<dyn ExecNode>> {
        let physical = create_physical_plan(optimized, &self.catalog, &self.config)?;
        debug!(root = physical.name(), "physical plan created");
        Ok(physical)
    }

    pub fn create_physical_plan(&self, plan: &Arc<LogicalPlan>) -> Result<Arc<dyn ExecNode>> {
        let optimized = self.optimize(plan)?;
        self.plan_physical(&optimized)
    }

    /// Fresh context for one execution, bound to the engine runtime.
    pub fn task_context(&self, cancellation: Option<CancellationToken>) -> Arc<TaskContext> {
        let mut ctx = TaskContext::new(self.config.clone())
            .with_runtime(self.runtime.handle())
            .with_metrics(self.metrics.clone());
        if let Some(token) = cancellation {
            ctx = ctx.with_cancellation(token);
        }
        Arc::new(ctx)
    }

    pub fn prometheus_metrics(&self) -> String {
        self.metrics.render_prometheus()
    }
}
