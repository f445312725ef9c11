//! Task graph nodes and the execution driver.
//!
//! A [`Task`] is a node in the dependency graph: it knows its static
//! dependencies, its declared input and output [`File`]s, and a
//! [`TaskBody`] that does the actual work. [`Task::drive`] is the whole
//! execution algorithm (construction, caching, running, and recording the
//! result) described in this module's tests.

use std::{collections::BTreeMap, future::Future, pin::Pin, sync::Arc, time::Instant};

use color_eyre::{
    Result,
    eyre::{Context as _, ensure},
};
use futures::future::BoxFuture;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, instrument, trace};

use crate::{
    cache::{CacheBackend, CacheRecord},
    error::EngineError,
    file::File,
    fingerprint::Fingerprint,
    id::TaskId,
    suspend::{self, SchedulerStats},
};

/// A future-returning body phase, boxed for object safety: [`Task`] stores a
/// heterogeneous collection of [`TaskBody`] implementations behind a single
/// concrete type, so its methods cannot be generic.
pub type BodyFuture<'a, T> = BoxFuture<'a, Result<T>>;

/// The task-specific behavior a blueprint author implements.
///
/// Only [`TaskBody::run`] is mandatory; the rest have behavior-preserving
/// defaults. See the module docs on [`Task`] for how these phases compose
/// into the full execution algorithm.
pub trait TaskBody: Send + Sync + std::fmt::Debug {
    /// Pure, deterministic metadata that participates in the cache key
    /// alongside file fingerprints. Defaults to `null`, meaning the task's
    /// identity and file set are the entire cache key.
    fn input_metadata(&self) -> serde_json::Value {
        serde_json::Value::Null
    }

    /// Called after static dependencies and their input-file generators
    /// have completed. May return further tasks to drive and, via
    /// `handle.add_input_files`, declare additional inputs discovered from
    /// their results (for example, a dependency-file scan).
    fn dynamic_deps<'a>(&'a self, handle: &'a TaskHandle) -> BodyFuture<'a, Vec<Arc<Task>>> {
        let _ = handle;
        Box::pin(async { Ok(Vec::new()) })
    }

    /// Runs with no concurrency permit held, before the up-to-date check.
    /// Intended for early, possibly-blocking checks that don't need to
    /// count against the job limit (see the GCC collaborator's module
    /// pre-check).
    fn pre_run<'a>(&'a self, handle: &'a TaskHandle) -> BodyFuture<'a, ()> {
        let _ = handle;
        Box::pin(async { Ok(()) })
    }

    /// The task's actual work. Runs with a concurrency permit held, only if
    /// the up-to-date check fails.
    fn run<'a>(&'a self, handle: &'a TaskHandle) -> BodyFuture<'a, serde_json::Value>;

    /// Runs after the result is determined (whether from cache or from
    /// [`TaskBody::run`]), still holding the permit.
    fn post_run<'a>(&'a self, handle: &'a TaskHandle, result: &'a serde_json::Value) -> BodyFuture<'a, ()> {
        let _ = (handle, result);
        Box::pin(async { Ok(()) })
    }

    /// Called by the module mapper server when it observes a
    /// `MODULE-IMPORT` for a module attributed to this task. No-op unless
    /// the body cares to track this (see the GCC compile collaborator's
    /// `modules_required`).
    fn record_module_required(&self, module: &str) {
        let _ = module;
    }

    /// Called by the module mapper server when it observes a
    /// `MODULE-COMPILED` for a module attributed to this task.
    fn record_module_generated(&self, module: &str) {
        let _ = module;
    }
}

/// What a [`TaskBody`] is handed at each phase: a narrow view of its owning
/// [`Task`] that exposes exactly the operations the public contract allows
/// (adding inputs/outputs, suspending).
pub struct TaskHandle<'a> {
    task: &'a Task,
}

impl<'a> TaskHandle<'a> {
    /// Declare additional read dependencies. Valid at construction and
    /// again from within [`TaskBody::dynamic_deps`].
    pub async fn add_input_files(&self, files: impl IntoIterator<Item = Arc<File>>) {
        let mut input_files = self.task.input_files.lock().await;
        input_files.extend(files);
    }

    /// Release this task's concurrency permit for the duration of `fut`,
    /// reacquiring one before returning. See [`crate::suspend`].
    pub async fn mark_suspended<F: Future>(&self, fut: F) -> F::Output {
        self.task.mark_suspended(fut).await
    }

    pub fn id(&self) -> &TaskId {
        &self.task.id
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum EventKind {
    Running,
    Suspended,
    Done,
}

#[derive(Copy, Clone, Debug)]
pub struct Event {
    pub at: Instant,
    pub kind: EventKind,
}

struct DriverState {
    done: bool,
    result: Option<serde_json::Value>,
}

/// A node in the task graph.
///
/// Construct via [`crate::context::Context::task`], never directly: tasks
/// need a semaphore and cache handle wired up by the owning context, and
/// must be registered under their id before any output file can name them
/// as a generator.
pub struct Task {
    id: TaskId,
    body: Box<dyn TaskBody>,
    dependencies: Vec<Arc<Task>>,
    input_files: Mutex<Vec<Arc<File>>>,
    output_files: Vec<Arc<File>>,
    driver: Mutex<DriverState>,
    events: std::sync::Mutex<Vec<Event>>,
    semaphore: Arc<Semaphore>,
    stats: Arc<SchedulerStats>,
    cache: Arc<dyn CacheBackend>,
    /// The permit acquired for the current `running` phase (step 7 through
    /// step 9 of the execution algorithm), parked here so
    /// [`Task::mark_suspended`] can hand it to [`suspend::scoped`] and get
    /// a fresh one back without the `TaskBody` API needing to thread a
    /// permit through every call.
    current_permit: Mutex<Option<tokio::sync::OwnedSemaphorePermit>>,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task").field("id", &self.id).finish_non_exhaustive()
    }
}

impl Task {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: TaskId,
        body: Box<dyn TaskBody>,
        dependencies: Vec<Arc<Task>>,
        input_files: Vec<Arc<File>>,
        output_files: Vec<Arc<File>>,
        semaphore: Arc<Semaphore>,
        stats: Arc<SchedulerStats>,
        cache: Arc<dyn CacheBackend>,
    ) -> Arc<Self> {
        let task = Arc::new(Self {
            id,
            body,
            dependencies,
            input_files: Mutex::new(input_files),
            output_files,
            driver: Mutex::new(DriverState { done: false, result: None }),
            events: std::sync::Mutex::new(Vec::new()),
            semaphore,
            stats,
            cache,
            current_permit: Mutex::new(None),
        });
        for output in &task.output_files {
            // Errors here are a blueprint bug (two tasks claiming the same
            // output); propagating them is the caller's job via
            // `Context::task`'s return value, not ours.
            let _ = output.set_generator(&task);
        }
        task
    }

    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn output_files(&self) -> &[Arc<File>] {
        &self.output_files
    }

    fn record_event(&self, kind: EventKind) {
        self.events
            .lock()
            .expect("task events mutex poisoned")
            .push(Event { at: Instant::now(), kind });
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().expect("task events mutex poisoned").clone()
    }

    /// Whether this task's body is currently executing with a permit held
    /// (as opposed to suspended, waiting, or finished). Used by tests that
    /// assert a concurrency bound.
    pub fn is_running(&self) -> bool {
        matches!(
            self.events().last(),
            Some(Event { kind: EventKind::Running, .. })
        )
    }

    pub fn record_module_required(&self, module: &str) {
        self.body.record_module_required(module);
    }

    pub fn record_module_generated(&self, module: &str) {
        self.body.record_module_generated(module);
    }

    /// Release this task's concurrency permit for the duration of `fut`,
    /// reacquiring one before returning. Exposed publicly so external
    /// collaborators driving this task from outside its own body (the
    /// module mapper, attributing an external compiler's blocking
    /// `MODULE-IMPORT` query to this task) can suspend it too.
    pub async fn mark_suspended<F: Future>(&self, fut: F) -> F::Output {
        let permit = self
            .current_permit
            .lock()
            .await
            .take()
            .expect("mark_suspended called while not holding a permit");

        self.record_event(EventKind::Suspended);
        let (permit, output) = suspend::scoped(&self.stats, &self.semaphore, permit, fut).await;
        self.record_event(EventKind::Running);

        *self.current_permit.lock().await = Some(permit);
        output
    }

    /// Run the full execution algorithm, memoized: a second call after
    /// completion returns the cached in-memory result immediately, and
    /// concurrent calls serialize on the task's driver lock rather than
    /// running the body twice.
    #[instrument(name = "Task::drive", skip(self), fields(id = %self.id))]
    pub async fn drive(self: &Arc<Self>) -> Result<serde_json::Value> {
        let mut driver = self.driver.lock().await;
        if driver.done {
            return Ok(driver
                .result
                .clone()
                .expect("done task must have a result"));
        }

        self.stats.enter_active();
        let outcome = self.drive_locked(&mut driver).await;
        self.stats.leave_active();

        match outcome {
            Ok(result) => {
                driver.result = Some(result.clone());
                driver.done = true;
                self.record_event(EventKind::Done);
                Ok(result)
            }
            Err(err) => Err(err),
        }
    }

    async fn drive_locked(self: &Arc<Self>, _driver: &mut DriverState) -> Result<serde_json::Value> {
        // Steps 3: static dependencies and statically declared inputs.
        self.drive_deps_and_inputs().await?;

        // Step 4: dynamic dependencies.
        let handle = TaskHandle { task: self };
        let dynamic = self
            .body
            .dynamic_deps(&handle)
            .await
            .context("dynamic_deps")?;
        drive_all(&dynamic).await?;

        // Step 5: inputs discovered via step 4 may have generators of
        // their own; drive them too.
        self.drive_inputs_only().await?;

        // Step 6: pre_run, no permit held.
        self.body.pre_run(&handle).await.context("pre_run")?;

        // Step 7: acquire a permit, enter the running state. Parked in
        // `current_permit` so `TaskBody::run`/`post_run` can suspend it via
        // `mark_suspended` (e.g. while blocked on a module import) and get
        // it back before we release it below.
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .expect("semaphore closed");
        *self.current_permit.lock().await = Some(permit);
        self.record_event(EventKind::Running);

        let result = self.run_or_reuse(&handle).await;
        let result = match result {
            Ok(result) => result,
            Err(err) => {
                self.current_permit.lock().await.take();
                return Err(err);
            }
        };

        // Step 9: post_run.
        if let Err(err) = self.body.post_run(&handle, &result).await.context("post_run") {
            self.current_permit.lock().await.take();
            return Err(err);
        }

        self.current_permit.lock().await.take();
        Ok(result)
    }

    async fn drive_deps_and_inputs(self: &Arc<Self>) -> Result<()> {
        let deps = drive_all(&self.dependencies);
        let inputs = self.drive_inputs_only();
        let (deps, inputs) = tokio::join!(deps, inputs);
        deps?;
        inputs?;
        Ok(())
    }

    async fn drive_inputs_only(&self) -> Result<()> {
        let files = self.input_files.lock().await.clone();
        futures::future::try_join_all(files.iter().map(|file| file.run())).await?;
        Ok(())
    }

    async fn run_or_reuse(self: &Arc<Self>, handle: &TaskHandle<'_>) -> Result<serde_json::Value> {
        if self.uptodate().await? {
            let record = self
                .cache
                .get(&self.id.mangled())
                .context("read cache record")?
                .expect("uptodate() implies a cache record exists");
            trace!(id = %self.id, "cache hit");
            return Ok(record.result);
        }

        debug!(id = %self.id, "running task body");
        let result = self.body.run(handle).await.context("run")?;
        self.write_cache_record(&result).await?;
        Ok(result)
    }

    async fn all_files(&self) -> Vec<Arc<File>> {
        let inputs = self.input_files.lock().await.clone();
        inputs.into_iter().chain(self.output_files.iter().cloned()).collect()
    }

    #[instrument(name = "Task::uptodate", skip(self), fields(id = %self.id))]
    async fn uptodate(&self) -> Result<bool> {
        let Some(record) = self.cache.get(&self.id.mangled()).context("read cache record")? else {
            return Ok(false);
        };

        if record.input_metadata != self.body.input_metadata() {
            trace!(id = %self.id, "input_metadata changed");
            return Ok(false);
        }

        for file in self.input_files.lock().await.iter() {
            ensure!(
                crate::fs::exists(file.path().as_std_path()).await,
                EngineError::MissingDeclaredInput
            );
        }

        for file in self.all_files().await {
            let Some(fingerprint) = record.file_fingerprints.get(file.path()) else {
                trace!(id = %self.id, path = ?file.path(), "no recorded fingerprint");
                return Ok(false);
            };
            if !fingerprint.check(file.path()).await.context("check fingerprint")? {
                trace!(id = %self.id, path = ?file.path(), "fingerprint mismatch");
                return Ok(false);
            }
        }

        for file in &self.output_files {
            if !crate::fs::exists(file.path().as_std_path()).await {
                trace!(id = %self.id, path = ?file.path(), "declared output missing");
                return Ok(false);
            }
        }

        Ok(true)
    }

    async fn write_cache_record(&self, result: &serde_json::Value) -> Result<()> {
        let mut file_fingerprints = BTreeMap::new();
        for file in self.all_files().await {
            let fingerprint = Fingerprint::create(file.path())
                .await
                .with_context(|| format!("fingerprint output/input {:?}", file.path()))?;
            file_fingerprints.insert(file.path().clone(), fingerprint);
        }

        let record = CacheRecord {
            input_metadata: self.body.input_metadata(),
            file_fingerprints,
            result: result.clone(),
        };
        self.cache
            .set(&self.id.mangled(), record)
            .context("write cache record")
    }
}

fn drive_all(tasks: &[Arc<Task>]) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
    Box::pin(async move {
        futures::future::try_join_all(tasks.iter().map(|task| task.drive())).await?;
        Ok(())
    })
}

/// A [`TaskBody`] with a plain async closure for `run` and everything else
/// defaulted; useful for tests and small blueprint tasks that don't need
/// dynamic dependencies or module awareness.
pub struct FnBody<F> {
    run: F,
}

impl<F> std::fmt::Debug for FnBody<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnBody").finish_non_exhaustive()
    }
}

impl<F> FnBody<F> {
    pub fn new(run: F) -> Self {
        Self { run }
    }
}

impl<F, Fut> TaskBody for FnBody<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<serde_json::Value>> + Send + 'static,
{
    fn run<'a>(&'a self, _handle: &'a TaskHandle) -> BodyFuture<'a, serde_json::Value> {
        Box::pin((self.run)())
    }
}
