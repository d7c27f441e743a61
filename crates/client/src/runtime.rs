use std::fmt::Debug;
use std::sync::{Arc, Mutex};

use arrow::record_batch::RecordBatch;
use futures::FutureExt;
use futures::future::BoxFuture;
use lfq_common::{EngineConfig, LfqError, Result};
use lfq_execution::{ExecNode, TaskContext, collect_partitioned};
use tokio::runtime::{Builder, Handle, Runtime as TokioRuntime};
use tracing::debug;

/// Something that can drive a physical plan to completion.
pub trait Runtime: Send + Sync + Debug {
    /// Handle on which operator tasks of new executions are spawned.
    fn handle(&self) -> Handle;

    /// Collect every partition of `plan`.
    fn execute(
        &self,
        plan: Arc<dyn ExecNode>,
        ctx: Arc<TaskContext>,
    ) -> BoxFuture<'static, Result<Vec<Vec<RecordBatch>>>>;

    fn shutdown(&self) -> BoxFuture<'static, Result<()>> {
        async { Ok(()) }.boxed()
    }
}

/// In-process runtime owning a dedicated multi-threaded tokio pool.
///
/// Queries run on the pool regardless of the caller's executor, so both
/// `block_on` callers and async callers on another runtime work.
#[derive(Debug)]
pub struct EmbeddedRuntime {
    handle: Handle,
    runtime: Mutex<Option<TokioRuntime>>,
}

impl EmbeddedRuntime {
    pub fn new(config: &EngineConfig) -> Result<Self> {
        let mut builder = Builder::new_multi_thread();
        builder.thread_name("lfq-worker").enable_time();
        if let Some(n) = config.worker_threads {
            builder.worker_threads(n);
        }
        let runtime = builder.build()?;
        debug!(worker_threads = ?config.worker_threads, "embedded runtime started");
        Ok(Self {
            handle: runtime.handle().clone(),
            runtime: Mutex::new(Some(runtime)),
        })
    }

    fn stop(&self) {
        let taken = self.runtime.lock().expect("runtime lock poisoned").take();
        if let Some(rt) = taken {
            // Does not block, so it is safe from inside another runtime.
            rt.shutdown_background();
            debug!("embedded runtime stopped");
        }
    }
}

impl Runtime for EmbeddedRuntime {
    fn handle(&self) -> Handle {
        self.handle.clone()
    }

    fn execute(
        &self,
        plan: Arc<dyn ExecNode>,
        ctx: Arc<TaskContext>,
    ) -> BoxFuture<'static, Result<Vec<Vec<RecordBatch>>>> {
        let task = self.handle.spawn(collect_partitioned(plan, ctx));
        async move {
            task.await
                .map_err(|e| LfqError::Execution(format!("query task failed: {e}")))?
        }
        .boxed()
    }

    fn shutdown(&self) -> BoxFuture<'static, Result<()>> {
        self.stop();
        async { Ok(()) }.boxed()
    }
}

impl Drop for EmbeddedRuntime {
    fn drop(&mut self) {
        self.stop();
    }
}
