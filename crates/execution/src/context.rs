//! Per-execution state handed to every operator partition.

use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::Waker;

use futures::channel::oneshot;
use lfq_common::metrics::global_metrics;
use lfq_common::{EngineConfig, ExecutionId, LfqError, MemoryPool, MetricsRegistry, Result};
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::{debug, info};

/// Cooperative cancellation flag shared by a query and its spawned tasks.
///
/// Cancelling sets the flag (checked by every operator stream between
/// batches) and aborts tasks registered through [`TaskContext::spawn`].
/// [`CancellationToken::release`] stops background tasks of a finished
/// execution without reporting it as cancelled.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<CancelState>,
}

#[derive(Debug, Default)]
struct CancelState {
    cancelled: AtomicBool,
    released: AtomicBool,
    tasks: Mutex<Vec<AbortHandle>>,
    waiters: Mutex<Vec<Waker>>,
    hooks: Mutex<Vec<StopHook>>,
}

struct StopHook(Box<dyn FnOnce() + Send>);

impl std::fmt::Debug for StopHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StopHook")
    }
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("query cancellation requested");
        self.stop_tasks();
    }

    /// Abort leftover background tasks once the consumer is done.
    pub fn release(&self) {
        if self.inner.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop_tasks();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Background producers should exit.
    pub fn should_stop(&self) -> bool {
        self.is_cancelled() || self.inner.released.load(Ordering::Acquire)
    }

    /// Wake `waker` when the token is cancelled or released.
    pub fn register_waker(&self, waker: &Waker) {
        let mut waiters = self.inner.waiters.lock().expect("cancel lock poisoned");
        if self.should_stop() {
            waker.wake_by_ref();
        } else if !waiters.iter().any(|w| w.will_wake(waker)) {
            waiters.push(waker.clone());
        }
    }

    /// Run `hook` once the token is cancelled or released; immediately if it
    /// already is. Operators use it to drop per-execution state.
    pub fn on_stop(&self, hook: impl FnOnce() + Send + 'static) {
        let mut hooks = self.inner.hooks.lock().expect("cancel lock poisoned");
        if self.should_stop() {
            drop(hooks);
            hook();
        } else {
            hooks.push(StopHook(Box::new(hook)));
        }
    }

    fn stop_tasks(&self) {
        let tasks = std::mem::take(&mut *self.inner.tasks.lock().expect("cancel lock poisoned"));
        let waiters =
            std::mem::take(&mut *self.inner.waiters.lock().expect("cancel lock poisoned"));
        let hooks = std::mem::take(&mut *self.inner.hooks.lock().expect("cancel lock poisoned"));
        debug!(
            tasks = tasks.len(),
            waiters = waiters.len(),
            "stopping background tasks"
        );
        for t in tasks {
            t.abort();
        }
        for w in waiters {
            w.wake();
        }
        for StopHook(hook) in hooks {
            hook();
        }
    }

    fn register(&self, handle: AbortHandle) {
        let mut tasks = self.inner.tasks.lock().expect("cancel lock poisoned");
        if self.should_stop() {
            handle.abort();
        } else {
            tasks.retain(|t| !t.is_finished());
            tasks.push(handle);
        }
    }
}

/// Execution-wide context: config knobs, memory pool, metrics sink,
/// cancellation, and the runtime background tasks are spawned on.
#[derive(Debug)]
pub struct TaskContext {
    execution_id: ExecutionId,
    config: EngineConfig,
    memory_pool: Arc<MemoryPool>,
    metrics: MetricsRegistry,
    cancellation: CancellationToken,
    runtime: Option<Handle>,
}

pub type SharedTaskContext = Arc<TaskContext>;

impl TaskContext {
    /// Fresh context with its own memory pool sized by `mem_budget_bytes`.
    ///
    /// Picks up the ambient tokio runtime when called from inside one.
    pub fn new(config: EngineConfig) -> Self {
        let memory_pool = MemoryPool::new(config.mem_budget_bytes);
        Self {
            execution_id: ExecutionId::next(),
            config,
            memory_pool,
            metrics: global_metrics().clone(),
            cancellation: CancellationToken::new(),
            runtime: Handle::try_current().ok(),
        }
    }

    #[must_use]
    pub fn with_runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: MetricsRegistry) -> Self {
        self.metrics = metrics;
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn execution_id(&self) -> ExecutionId {
        self.execution_id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Target batch size for operators that coalesce/split.
    pub fn batch_size(&self) -> usize {
        self.config.batch_size_rows.max(1)
    }

    pub fn spill_dir(&self) -> PathBuf {
        PathBuf::from(&self.config.spill_dir)
    }

    pub fn hash_seed(&self) -> u64 {
        self.config.hash_seed
    }

    pub fn channel_capacity(&self) -> usize {
        self.config.channel_capacity.max(1)
    }

    pub fn memory_pool(&self) -> &Arc<MemoryPool> {
        &self.memory_pool
    }

    pub fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// `Err(Cancelled)` once cancellation was requested.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(LfqError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Run `fut` in the background.
    ///
    /// Uses the tokio runtime when one is attached (the task is aborted on
    /// cancellation), otherwise a dedicated thread driving the future with
    /// `futures::executor::block_on`.
    pub fn spawn<F>(&self, fut: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match &self.runtime {
            Some(handle) => {
                let task = handle.spawn(fut);
                self.cancellation.register(task.abort_handle());
                Ok(())
            }
            None => {
                debug!(execution_id = %self.execution_id, "no runtime attached, spawning thread");
                std::thread::Builder::new()
                    .name(format!("lfq-exec-{}", self.execution_id))
                    .spawn(move || futures::executor::block_on(fut))
                    .map(|_| ())
                    .map_err(LfqError::from)
            }
        }
    }

    /// Like [`TaskContext::spawn`] but hands the output back through a oneshot.
    ///
    /// The receiver resolves to `Canceled` if the task was aborted.
    pub fn spawn_with_result<F, T>(&self, fut: F) -> Result<oneshot::Receiver<T>>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.spawn(async move {
            let _ = tx.send(fut.await);
        })?;
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_fails_after_cancel() {
        let ctx = TaskContext::new(EngineConfig::default());
        ctx.check_cancelled().expect("fresh context");
        ctx.cancellation().cancel();
        ctx.cancellation().cancel();
        assert!(matches!(ctx.check_cancelled(), Err(LfqError::Cancelled)));
    }

    #[test]
    fn release_stops_tasks_without_cancelling() {
        let token = CancellationToken::new();
        token.release();
        assert!(token.should_stop());
        assert!(!token.is_cancelled());
    }

    #[test]
    fn stop_hooks_run_once_on_release_or_when_late() {
        use std::sync::atomic::AtomicUsize;

        let token = CancellationToken::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        token.on_stop(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        token.release();
        token.cancel();
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        let counter = Arc::clone(&runs);
        token.on_stop(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn spawn_without_runtime_uses_a_thread() {
        let ctx = TaskContext::new(EngineConfig::default());
        let rx = ctx
            .spawn_with_result(async { 40 + 2 })
            .expect("spawn");
        assert_eq!(futures::executor::block_on(rx).expect("result"), 42);
    }
}
