//! The executor façade and its work queues.

use std::env;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use rayon::{ThreadPool, ThreadPoolBuilder};
use rustc_hash::FxHashMap;

use crate::action::{ActionRegistry, StaticStore, panic_message};
use crate::config::{ContextOptions, ExecutorConfig, IsolationStrategy, WorkQueueConfig};
use crate::error::{AggregateFailure, Error, Result};
use crate::ipc::DaemonPool;
use crate::pressure::ResourcePressure;
use crate::work::{
    Failure, ItemStatus, Outcome, Parameters, WorkItem, WorkItemHandle, WorkItemId,
};

use super::context::{CompletionCallback, IsolatedContext};
use super::slot::SlotSource;
use super::tracker::OutcomeTracker;

fn lock_error<T>(e: PoisonError<T>) -> Error {
    Error::Infrastructure(format!("Executor lock poisoned (thread panicked): {}", e))
}

fn build_pool(threads: usize, prefix: &'static str) -> Result<Arc<ThreadPool>> {
    ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(move |i| format!("{}-{}", prefix, i))
        .build()
        .map(Arc::new)
        .map_err(|e| Error::Infrastructure(format!("failed to start {} threads: {}", prefix, e)))
}

/// Daemon pool plus the threads that wait on it.
#[derive(Clone)]
struct ProcessBackend {
    pool: Arc<DaemonPool>,
    dispatchers: Arc<ThreadPool>,
    /// Owned pools are shut down with the executor; shared ones are not.
    owned: bool,
}

struct ExecutorInner {
    config: ExecutorConfig,
    registry: ActionRegistry,
    /// Static state shared by every `None`-strategy item.
    host_statics: StaticStore,
    workers: Arc<ThreadPool>,
    contexts: Mutex<FxHashMap<ContextOptions, Arc<IsolatedContext>>>,
    staging_root: PathBuf,
    process: Mutex<Option<ProcessBackend>>,
    shared_pool: Option<Arc<DaemonPool>>,
    pressure: Mutex<Option<Box<dyn ResourcePressure>>>,
    tracker: OutcomeTracker,
    callback: Option<Arc<dyn CompletionCallback>>,
    next_item: AtomicU64,
    live_queues: AtomicUsize,
    shut_down: AtomicBool,
}

impl ExecutorInner {
    fn context_for(&self, options: &ContextOptions) -> Result<Arc<IsolatedContext>> {
        let mut contexts = self.contexts.lock().map_err(lock_error)?;
        if let Some(context) = contexts.get(options) {
            return Ok(context.clone());
        }
        let context = IsolatedContext::load(options.clone(), &self.staging_root).map_err(|e| {
            match e {
                Error::LibraryLoad(e) => {
                    Error::Configuration(format!("cannot load context library: {}", e))
                }
                other => other,
            }
        })?;
        let context = Arc::new(context);
        tracing::debug!(context = %context.id(), "created isolated context");
        contexts.insert(options.clone(), context.clone());
        Ok(context)
    }

    /// Start the daemon pool on first use.
    fn process_backend(&self) -> Result<ProcessBackend> {
        let mut process = self.process.lock().map_err(lock_error)?;
        if let Some(backend) = process.as_ref() {
            return Ok(backend.clone());
        }

        let (pool, owned) = match &self.shared_pool {
            Some(pool) => (pool.clone(), false),
            None => {
                let pressure = self.pressure.lock().map_err(lock_error)?.take();
                let pool = match pressure {
                    Some(pressure) => {
                        DaemonPool::with_boxed_pressure(self.config.daemons.clone(), pressure)?
                    }
                    None => DaemonPool::new(self.config.daemons.clone())?,
                };
                (pool, true)
            }
        };
        tracing::info!(
            shared = !owned,
            max_daemons = pool.config().max_daemons,
            "daemon pool started"
        );
        let dispatchers = build_pool(pool.config().max_daemons, "workhive-dispatch")?;

        let backend = ProcessBackend {
            pool,
            dispatchers,
            owned,
        };
        *process = Some(backend.clone());
        Ok(backend)
    }

    fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }
}

/// Creates work queues and tracks every item submitted through them.
///
/// Cloning an `Executor` yields another handle to the same executor.
#[derive(Clone)]
pub struct Executor {
    inner: Arc<ExecutorInner>,
}

/// Builder for [`Executor`].
pub struct ExecutorBuilder {
    config: ExecutorConfig,
    registry: ActionRegistry,
    daemon_pool: Option<Arc<DaemonPool>>,
    pressure: Option<Box<dyn ResourcePressure>>,
    callback: Option<Arc<dyn CompletionCallback>>,
    staging_root: Option<PathBuf>,
}

impl ExecutorBuilder {
    pub fn config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a daemon pool that outlives this executor.
    pub fn daemon_pool(mut self, pool: Arc<DaemonPool>) -> Self {
        self.daemon_pool = Some(pool);
        self
    }

    /// Resource-pressure signal for an executor-owned daemon pool.
    pub fn pressure(mut self, pressure: impl ResourcePressure + 'static) -> Self {
        self.pressure = Some(Box::new(pressure));
        self
    }

    pub fn callback(mut self, callback: impl CompletionCallback + 'static) -> Self {
        self.callback = Some(Arc::new(callback));
        self
    }

    /// Directory for private copies of context libraries.
    pub fn staging_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.staging_root = Some(dir.into());
        self
    }

    pub fn build(self) -> Result<Executor> {
        self.config.validate()?;
        let workers = build_pool(self.config.max_workers, "workhive-worker")?;
        let staging_root = self
            .staging_root
            .unwrap_or_else(|| env::temp_dir().join("workhive-contexts"));

        Ok(Executor {
            inner: Arc::new(ExecutorInner {
                config: self.config,
                registry: self.registry,
                host_statics: StaticStore::new(),
                workers,
                contexts: Mutex::new(FxHashMap::default()),
                staging_root,
                process: Mutex::new(None),
                shared_pool: self.daemon_pool,
                pressure: Mutex::new(self.pressure),
                tracker: OutcomeTracker::default(),
                callback: self.callback,
                next_item: AtomicU64::new(1),
                live_queues: AtomicUsize::new(0),
                shut_down: AtomicBool::new(false),
            }),
        })
    }
}

impl Executor {
    /// Create an executor with default configuration.
    pub fn new(registry: ActionRegistry) -> Result<Self> {
        Self::builder(registry).build()
    }

    /// Create an executor with the given configuration.
    pub fn with_config(config: ExecutorConfig, registry: ActionRegistry) -> Result<Self> {
        Self::builder(registry).config(config).build()
    }

    pub fn builder(registry: ActionRegistry) -> ExecutorBuilder {
        ExecutorBuilder {
            config: ExecutorConfig::default(),
            registry,
            daemon_pool: None,
            pressure: None,
            callback: None,
            staging_root: None,
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &ActionRegistry {
        &self.inner.registry
    }

    /// Create a queue bound to `config`.
    ///
    /// Invalid configs fail here, before any work is submitted.
    pub fn new_work_queue(&self, config: WorkQueueConfig) -> Result<WorkQueue> {
        if self.inner.is_shut_down() {
            return Err(Error::ShutDown);
        }
        config.validate()?;

        let (source, threads) = match &config {
            WorkQueueConfig::None => (
                SlotSource::Inline {
                    registry: self.inner.registry.clone(),
                    statics: self.inner.host_statics.clone(),
                },
                self.inner.workers.clone(),
            ),
            WorkQueueConfig::IsolatedContext(options) => (
                SlotSource::Context {
                    registry: self.inner.registry.clone(),
                    context: self.inner.context_for(options)?,
                },
                self.inner.workers.clone(),
            ),
            WorkQueueConfig::IsolatedProcess(options) => {
                let backend = self.inner.process_backend()?;
                (
                    SlotSource::Daemon {
                        pool: backend.pool,
                        options: options.clone(),
                    },
                    backend.dispatchers,
                )
            }
        };

        self.inner.live_queues.fetch_add(1, Ordering::AcqRel);
        tracing::debug!(strategy = %config.strategy(), "created work queue");
        Ok(WorkQueue {
            inner: self.inner.clone(),
            config,
            source,
            threads,
        })
    }

    /// Wait for every item submitted so far, then return all outcomes.
    ///
    /// If any item failed, the error carries every outcome, including the
    /// successes. Outcomes arrive in completion order.
    pub fn await_all(&self) -> Result<Vec<(WorkItemId, Outcome)>> {
        let outcomes = self.inner.tracker.wait_all()?;
        let failed = outcomes.iter().filter(|(_, o)| o.is_failure()).count();
        tracing::debug!(completed = outcomes.len(), failed, "await_all finished");
        if failed > 0 {
            return Err(Error::Aggregate(AggregateFailure::new(outcomes)));
        }
        Ok(outcomes)
    }

    /// Items submitted but not yet completed.
    pub fn in_flight(&self) -> usize {
        self.inner.tracker.pending()
    }

    /// Work queues created by this executor and not yet dropped.
    pub fn queue_count(&self) -> usize {
        self.inner.live_queues.load(Ordering::Acquire)
    }

    /// The daemon pool, if one has been started or supplied.
    pub fn daemon_pool(&self) -> Option<Arc<DaemonPool>> {
        let started = self
            .inner
            .process
            .lock()
            .ok()
            .and_then(|p| p.as_ref().map(|b| b.pool.clone()));
        started.or_else(|| self.inner.shared_pool.clone())
    }

    /// Refuse new work and stop an executor-owned daemon pool.
    ///
    /// Items already running finish; shared pools keep their daemons.
    pub fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let backend = self.inner.process.lock().ok().and_then(|p| p.clone());
        if let Some(backend) = backend
            && backend.owned
        {
            backend.pool.shutdown();
        }
        tracing::debug!("executor shut down");
    }
}

impl Drop for ExecutorInner {
    fn drop(&mut self) {
        if let Ok(process) = self.process.get_mut()
            && let Some(backend) = process.take()
            && backend.owned
        {
            backend.pool.shutdown();
        }
    }
}

/// Per-caller handle bound to one isolation strategy and config.
pub struct WorkQueue {
    inner: Arc<ExecutorInner>,
    config: WorkQueueConfig,
    source: SlotSource,
    threads: Arc<ThreadPool>,
}

impl WorkQueue {
    pub fn config(&self) -> &WorkQueueConfig {
        &self.config
    }

    pub fn strategy(&self) -> IsolationStrategy {
        self.config.strategy()
    }

    /// Submit one item. Returns immediately; the outcome is collected by
    /// [`Executor::await_all`].
    pub fn submit(&self, action: &str, params: Parameters) -> Result<WorkItemHandle> {
        if action.is_empty() {
            return Err(Error::Configuration("action identifier is empty".to_string()));
        }
        if let Some(registry) = self.source.registry()
            && !registry.contains(action)
        {
            return Err(Error::UnknownAction(action.to_string()));
        }
        if self.inner.is_shut_down() {
            return Err(Error::ShutDown);
        }

        let id = WorkItemId::new(self.inner.next_item.fetch_add(1, Ordering::Relaxed));
        let item = WorkItem::new(id, action.to_string(), params);
        let handle = WorkItemHandle::new(id);

        self.inner.tracker.register()?;
        // Shutdown may have started between the check above and registration.
        if self.inner.is_shut_down() {
            self.inner.tracker.unregister();
            return Err(Error::ShutDown);
        }
        tracing::debug!(item = %id, action, strategy = %self.strategy(), "submitted");

        let job = Job {
            item,
            handle: handle.clone(),
            source: self.source.clone(),
            inner: self.inner.clone(),
        };
        self.threads.spawn(move || job.run());

        Ok(handle)
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        self.inner.live_queues.fetch_sub(1, Ordering::AcqRel);
    }
}

/// One item on its way through a worker thread.
struct Job {
    item: WorkItem,
    handle: WorkItemHandle,
    source: SlotSource,
    inner: Arc<ExecutorInner>,
}

impl Job {
    fn run(self) {
        let Job {
            item,
            handle,
            source,
            inner,
        } = self;
        handle.set_status(ItemStatus::Running);

        let callback = inner.callback.as_deref();
        if let Some(callback) = callback {
            notify(|| callback.on_item_started(item.id(), item.action()));
        }

        // The slot is dropped inside the closure, so a daemon is back in the
        // pool before the outcome becomes visible to waiters.
        let outcome = catch_unwind(AssertUnwindSafe(|| match source.open() {
            Ok(mut slot) => slot.run(&item),
            Err(e) => Outcome::Failure(Failure::infrastructure(format!(
                "no {} slot available: {}",
                item_strategy(&source),
                e
            ))),
        }))
        .unwrap_or_else(|payload| {
            Outcome::Failure(Failure::infrastructure(format!(
                "slot panicked: {}",
                panic_message(payload.as_ref())
            )))
        });

        if let Outcome::Failure(failure) = &outcome {
            tracing::debug!(item = %item.id(), "{}", failure);
        }
        if let Some(callback) = callback {
            notify(|| callback.on_item_completed(item.id(), &outcome));
        }

        handle.set_status(ItemStatus::Completed);
        inner.tracker.complete(item.id(), outcome);
    }
}

fn item_strategy(source: &SlotSource) -> IsolationStrategy {
    match source {
        SlotSource::Inline { .. } => IsolationStrategy::None,
        SlotSource::Context { .. } => IsolationStrategy::IsolatedContext,
        SlotSource::Daemon { .. } => IsolationStrategy::IsolatedProcess,
    }
}

/// Run a host callback, logging instead of propagating its panics.
fn notify(f: impl FnOnce()) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(f)) {
        tracing::error!("completion callback panicked: {}", panic_message(payload.as_ref()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionContext, ActionResult};
    use serde_json::Value;

    fn echo(params: &Parameters, _: &ActionContext<'_>) -> ActionResult {
        Ok(params.raw("value").cloned().unwrap_or(Value::Null))
    }

    fn executor() -> Executor {
        let mut registry = ActionRegistry::new();
        registry.register_fn("echo", echo);
        Executor::with_config(ExecutorConfig::default().with_max_workers(2), registry).unwrap()
    }

    #[test]
    fn test_executor_creation() {
        let executor = executor();
        assert_eq!(executor.in_flight(), 0);
        assert_eq!(executor.queue_count(), 0);
        assert!(executor.daemon_pool().is_none());
        assert!(executor.await_all().unwrap().is_empty());
    }

    #[test]
    fn test_queue_count_tracks_drops() {
        let executor = executor();
        let a = executor.new_work_queue(WorkQueueConfig::None).unwrap();
        let b = executor.new_work_queue(WorkQueueConfig::None).unwrap();
        assert_eq!(executor.queue_count(), 2);
        drop(a);
        assert_eq!(executor.queue_count(), 1);
        drop(b);
        assert_eq!(executor.queue_count(), 0);
    }

    #[test]
    fn test_submit_rejects_bad_actions_synchronously() {
        let executor = executor();
        let queue = executor.new_work_queue(WorkQueueConfig::None).unwrap();

        assert!(matches!(
            queue.submit("", Parameters::new()),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            queue.submit("nope", Parameters::new()),
            Err(Error::UnknownAction(name)) if name == "nope"
        ));
        assert_eq!(executor.in_flight(), 0);
    }

    #[test]
    fn test_zero_workers_is_configuration_error() {
        let result =
            Executor::with_config(ExecutorConfig::default().with_max_workers(0), ActionRegistry::new());
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[test]
    fn test_shutdown_refuses_new_work() {
        let executor = executor();
        let queue = executor.new_work_queue(WorkQueueConfig::None).unwrap();
        executor.shutdown();

        assert!(matches!(
            executor.new_work_queue(WorkQueueConfig::None),
            Err(Error::ShutDown)
        ));
        assert!(matches!(
            queue.submit("echo", Parameters::new()),
            Err(Error::ShutDown)
        ));
    }

    #[test]
    fn test_item_strategy_matches_source() {
        let source = SlotSource::Inline {
            registry: ActionRegistry::new(),
            statics: StaticStore::new(),
        };
        assert_eq!(item_strategy(&source), IsolationStrategy::None);
    }
}
