//! The scheduler: owns the file/task registries, the cache, the
//! concurrency semaphore, and the deadlock watchdog.

use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use color_eyre::Result;
use dashmap::DashMap;
use tokio::sync::{Mutex, Semaphore};
use tracing::{info, instrument, warn};

use crate::{
    cache::{self, CacheBackend},
    error::EngineError,
    file::File,
    id::TaskId,
    path::AbsFilePath,
    suspend::SchedulerStats,
    task::{Task, TaskBody},
};

/// Which cache backend a [`Context`] should open.
#[derive(Clone, Debug)]
pub enum CacheConfig {
    /// Backed by a SQLite file at this path; falls back to an in-memory
    /// cache (with a warning) if the file can't be opened.
    Persistent(AbsFilePath),
    /// The engine's `--no-cache` mode: nothing survives the process.
    InMemory,
}

/// How to construct the engine's cache and size its concurrency.
#[derive(Clone, Debug)]
pub struct Config {
    /// Number of tasks allowed to be concurrently `running` (not counting
    /// `suspended`). Corresponds to `make -j N`.
    pub jobs: usize,
    /// Which cache backend to open.
    pub cache: CacheConfig,
    /// How often the deadlock watchdog polls for a stalled scheduler.
    pub watchdog_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            jobs: 1,
            cache: CacheConfig::InMemory,
            watchdog_interval: Duration::from_millis(100),
        }
    }
}

struct Inner {
    files: DashMap<AbsFilePath, Arc<File>>,
    tasks: DashMap<TaskId, Arc<Task>>,
    cache: Arc<dyn CacheBackend>,
    semaphore: Arc<Semaphore>,
    stats: Arc<SchedulerStats>,
    start_coros: Mutex<Vec<Pin<Box<dyn Future<Output = Result<()>> + Send>>>>,
    config: Config,
}

/// The scheduler. Cheaply cloneable (it's an `Arc` underneath); clone it to
/// hand a handle to long-lived collaborators like [`crate::mapper`].
///
/// A process conceptually runs one of these per build; nothing stops a
/// caller (a test harness, most notably) from constructing several
/// independent ones side by side, since every other piece of this crate
/// takes its `Context` (or resources loaned from it) explicitly rather
/// than reaching for an implicit global. A CLI front-end that wants to
/// enforce "exactly one build at a time" for some other reason (a lock
/// file, say) is free to layer that on top.
#[derive(Clone)]
pub struct Context(Arc<Inner>);

/// The outcome of [`Context::task`]: whether the id was fresh or already
/// registered.
pub enum TaskLookup {
    Created(Arc<Task>),
    Existing(Arc<Task>),
}

impl TaskLookup {
    /// The task either way; use this when the caller doesn't care whether
    /// it was newly created.
    pub fn into_task(self) -> Arc<Task> {
        match self {
            TaskLookup::Created(task) | TaskLookup::Existing(task) => task,
        }
    }

    /// Fail if this id collided with an existing task. For callers (like
    /// the GCC `Compile` wrapper) that consider a collision a bug rather
    /// than a legitimate re-reference.
    pub fn into_fresh_task(self) -> Result<Arc<Task>> {
        match self {
            TaskLookup::Created(task) => Ok(task),
            TaskLookup::Existing(_) => Err(EngineError::DuplicateTaskId.into()),
        }
    }
}

impl Context {
    /// Open a new context.
    #[instrument(skip(config))]
    pub fn new(config: Config) -> Result<Self> {
        let cache: Arc<dyn CacheBackend> = match &config.cache {
            CacheConfig::Persistent(path) => cache::open_or_memory(path),
            CacheConfig::InMemory => Arc::new(cache::memory::MemoryCache::new()),
        };

        Ok(Self(Arc::new(Inner {
            files: DashMap::new(),
            tasks: DashMap::new(),
            cache,
            semaphore: Arc::new(Semaphore::new(config.jobs)),
            stats: Arc::new(SchedulerStats::default()),
            start_coros: Mutex::new(Vec::new()),
            config,
        })))
    }

    pub fn config(&self) -> &Config {
        &self.0.config
    }

    /// Intern the file at `path`, creating it if this is the first
    /// reference.
    pub fn file(&self, path: AbsFilePath) -> Arc<File> {
        self.0
            .files
            .entry(path.clone())
            .or_insert_with(|| Arc::new(File::new(path)))
            .clone()
    }

    /// Construct a task, or return the existing one registered under `id`.
    #[instrument(skip(self, body, dependencies, input_files, output_files), fields(id = %id))]
    #[allow(clippy::too_many_arguments)]
    pub fn task(
        &self,
        id: TaskId,
        body: impl TaskBody + 'static,
        dependencies: Vec<Arc<Task>>,
        input_files: Vec<Arc<File>>,
        output_files: Vec<Arc<File>>,
    ) -> TaskLookup {
        if let Some(existing) = self.0.tasks.get(&id) {
            return TaskLookup::Existing(Arc::clone(&existing));
        }

        let task = Task::new(
            id.clone(),
            Box::new(body),
            dependencies,
            input_files,
            output_files,
            Arc::clone(&self.0.semaphore),
            Arc::clone(&self.0.stats),
            Arc::clone(&self.0.cache),
        );

        match self.0.tasks.entry(id) {
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&task));
                TaskLookup::Created(task)
            }
            dashmap::mapref::entry::Entry::Occupied(entry) => {
                // Lost a race with another constructor for the same id;
                // the entry that won is authoritative.
                TaskLookup::Existing(Arc::clone(entry.get()))
            }
        }
    }

    /// Look up a previously registered task by id, e.g. for module mapper
    /// attribution.
    pub fn find_task(&self, id: &TaskId) -> Option<Arc<Task>> {
        self.0.tasks.get(id).map(|entry| Arc::clone(&entry))
    }

    /// Register a background initialisation to run once, before any root
    /// task begins driving. Used by [`crate::mapper`] to bind its
    /// listening socket ahead of the first compile task needing its port
    /// number.
    pub async fn start_async(&self, coro: impl Future<Output = Result<()>> + Send + 'static) {
        self.0.start_coros.lock().await.push(Box::pin(coro));
    }

    pub fn stats(&self) -> &SchedulerStats {
        &self.0.stats
    }

    pub fn cache(&self) -> &Arc<dyn CacheBackend> {
        &self.0.cache
    }

    /// Run every registered start coroutine to completion (sequentially,
    /// in registration order), then drive every root task to completion
    /// concurrently. Returns the first error encountered, from either a
    /// start coroutine, a task, or the deadlock watchdog.
    #[instrument(skip(self, roots))]
    pub async fn run(&self, roots: Vec<Arc<Task>>) -> Result<()> {
        let coros = std::mem::take(&mut *self.0.start_coros.lock().await);
        for coro in coros {
            coro.await?;
        }

        let watchdog_handle = {
            let ctx = self.clone();
            tokio::spawn(async move { ctx.watchdog().await })
        };
        let watchdog_abort = watchdog_handle.abort_handle();

        let mut tasks = tokio::task::JoinSet::new();
        for root in roots {
            tasks.spawn(async move { root.drive().await });
        }

        let result = tokio::select! {
            biased;
            res = drive_joinset(&mut tasks) => res,
            res = watchdog_handle => match res {
                Ok(inner) => inner,
                Err(join_err) if join_err.is_cancelled() => Ok(()),
                Err(join_err) => Err(join_err.into()),
            },
        };

        watchdog_abort.abort();
        tasks.abort_all();
        result
    }

    #[instrument(skip(self))]
    async fn watchdog(&self) -> Result<()> {
        loop {
            tokio::time::sleep(self.0.config.watchdog_interval).await;
            let active = self.0.stats.active();
            let suspended = self.0.stats.suspended();
            let idle_permits = self.0.semaphore.available_permits() == self.0.config.jobs;

            if active > 0 && active == suspended && idle_permits {
                warn!(active, suspended, "deadlock watchdog: every live task is suspended");
                return Err(EngineError::Stall.into());
            }
        }
    }
}

/// Drive a `JoinSet<Result<serde_json::Value>>` to completion, returning
/// the first error (if any) from any task.
async fn drive_joinset(tasks: &mut tokio::task::JoinSet<Result<serde_json::Value>>) -> Result<()> {
    while let Some(result) = tasks.join_next().await {
        match result {
            Ok(Ok(_)) => continue,
            Ok(Err(err)) => return Err(err),
            Err(join_err) => return Err(join_err.into()),
        }
    }
    info!("all root tasks completed");
    Ok(())
}
