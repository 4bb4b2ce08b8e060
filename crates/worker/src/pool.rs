//! Pools of stateless workers
//!
//! An [`ActorPool`] owns `N` identical workers, each on its own OS thread with
//! its own instance of a capability (a text codec, a predictor). Work is fed
//! through one shared job channel, so at most `N` tasks run at a time and any
//! excess waits until a worker frees up.
//!
//! Results come back in completion order, never submission order. Callers must
//! carry their own correlation key inside each result.
//!
//! A worker that panics is treated as a dead process. Depending on the
//! [`RestartPolicy`] the pool either builds a fresh instance from the factory
//! and retries the in-flight task, or reports the failure to the caller. Once
//! the restart budget of a worker is spent the worker retires; when no workers
//! remain every pending and future task fails with [`BatchGenError::ActorDied`].

use batchgen_common::{BatchGenError, Result, METRICS};
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// What happens when a worker crashes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RestartPolicy {
    /// How many times one worker may be rebuilt
    pub max_restarts: u32,

    /// How many times an in-flight task is re-run on the rebuilt worker
    pub max_task_retries: u32,
}

impl RestartPolicy {
    /// Crashed workers are never replaced
    pub const NEVER: RestartPolicy = RestartPolicy {
        max_restarts: 0,
        max_task_retries: 0,
    };

    pub fn new(max_restarts: u32, max_task_retries: u32) -> Self {
        Self {
            max_restarts,
            max_task_retries,
        }
    }
}

/// Builds the capability instance for a worker slot
pub type ActorFactory<A> = Arc<dyn Fn(usize) -> Result<A> + Send + Sync>;

type TaskFn<A, T, R> = dyn Fn(&mut A, &T) -> Result<R> + Send + Sync;

/// Unwind payload used by a worker that terminates itself
#[derive(Debug)]
pub struct WorkerExit {
    pub reason: String,
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker exited: {}", self.reason)
    }
}

/// Terminate the calling worker unconditionally
///
/// The current actor instance is discarded and the pool applies its restart
/// policy, exactly as if the worker process had exited. Must only be called
/// from code running inside a pool worker.
pub fn exit_worker(reason: impl Into<String>) -> ! {
    panic::resume_unwind(Box::new(WorkerExit {
        reason: reason.into(),
    }))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(exit) = payload.downcast_ref::<WorkerExit>() {
        exit.to_string()
    } else if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// A unit of work with its own reply path
trait Task<A>: Send {
    /// Run against an actor and deliver the result
    fn run(&mut self, actor: &mut A);

    /// Deliver a failure instead of a result
    fn fail(self: Box<Self>, error: BatchGenError);
}

type Job<A> = Box<dyn Task<A>>;

struct MapTask<A, T, R> {
    input: T,
    func: Arc<TaskFn<A, T, R>>,
    results: Sender<Result<R>>,
    /// Set once nobody will read the result
    cancelled: Arc<AtomicBool>,
}

impl<A, T, R> Task<A> for MapTask<A, T, R>
where
    T: Send,
    R: Send,
{
    fn run(&mut self, actor: &mut A) {
        if self.cancelled.load(Ordering::SeqCst) {
            return;
        }
        let output = (self.func)(actor, &self.input);
        // The consumer may have stopped listening
        let _ = self.results.send(output);
    }

    fn fail(self: Box<Self>, error: BatchGenError) {
        let _ = self.results.send(Err(error));
    }
}

fn fail_orphaned<A>(jobs: &Receiver<Job<A>>, pool: &str) {
    for task in jobs.try_iter() {
        task.fail(BatchGenError::actor_died(format!(
            "pool {} has no live workers",
            pool
        )));
    }
}

struct WorkerContext<A> {
    pool: String,
    slot: usize,
    factory: ActorFactory<A>,
    policy: RestartPolicy,
    jobs: Receiver<Job<A>>,
    live: Arc<AtomicUsize>,
}

impl<A> WorkerContext<A> {
    fn name(&self) -> String {
        format!("{}-{}", self.pool, self.slot)
    }

    fn build_actor(&self) -> Result<A> {
        match panic::catch_unwind(AssertUnwindSafe(|| (self.factory)(self.slot))) {
            Ok(actor) => actor,
            Err(payload) => Err(BatchGenError::internal(format!(
                "factory panicked: {}",
                panic_message(&*payload)
            ))),
        }
    }

    /// Remove this worker from the pool for good
    fn retire(&self) {
        METRICS.pool.actor_deaths.inc();
        let remaining = self.live.fetch_sub(1, Ordering::SeqCst) - 1;
        error!(worker = %self.name(), remaining, "Worker retired");
        if remaining == 0 {
            fail_orphaned(&self.jobs, &self.pool);
        }
    }

    fn run(self) {
        let name = self.name();
        let mut actor = match self.build_actor() {
            Ok(actor) => actor,
            Err(e) => {
                error!(worker = %name, "Failed to start worker: {}", e);
                self.retire();
                return;
            }
        };
        debug!(worker = %name, "Worker started");

        let mut restarts = 0u32;
        while let Ok(mut task) = self.jobs.recv() {
            let mut retries = 0u32;
            loop {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| task.run(&mut actor)));
                let Err(payload) = outcome else { break };

                let reason = panic_message(&*payload);
                warn!(worker = %name, "Worker crashed: {}", reason);

                if restarts >= self.policy.max_restarts {
                    task.fail(BatchGenError::actor_died(format!(
                        "{} crashed with no restarts left: {}",
                        name, reason
                    )));
                    self.retire();
                    return;
                }

                restarts += 1;
                METRICS.pool.actor_restarts.inc();
                actor = match self.build_actor() {
                    Ok(actor) => actor,
                    Err(e) => {
                        task.fail(BatchGenError::actor_died(format!(
                            "{} could not be restarted: {}",
                            name, e
                        )));
                        self.retire();
                        return;
                    }
                };
                info!(
                    worker = %name,
                    "Worker restarted ({}/{})",
                    restarts, self.policy.max_restarts
                );

                if retries >= self.policy.max_task_retries {
                    task.fail(BatchGenError::TaskCrashed(format!(
                        "{} crashed while running the task: {}",
                        name, reason
                    )));
                    break;
                }
                retries += 1;
            }
        }

        debug!(worker = %name, "Worker stopped");
    }
}

/// Fixed set of identical workers exposing one capability
pub struct ActorPool<A: 'static> {
    name: String,
    size: usize,
    jobs: Option<Sender<Job<A>>>,
    /// Kept to fail queued jobs when every worker is gone
    orphans: Receiver<Job<A>>,
    live: Arc<AtomicUsize>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl<A: 'static> ActorPool<A> {
    /// Start `size` workers, each building its actor with `factory(slot)`
    pub fn spawn<F>(name: impl Into<String>, size: usize, policy: RestartPolicy, factory: F) -> Result<Self>
    where
        F: Fn(usize) -> Result<A> + Send + Sync + 'static,
    {
        let name = name.into();
        if size == 0 {
            return Err(BatchGenError::config(format!("pool {} needs at least one worker", name)));
        }

        let factory: ActorFactory<A> = Arc::new(factory);
        let (jobs_tx, jobs_rx) = channel::unbounded::<Job<A>>();
        let live = Arc::new(AtomicUsize::new(size));

        let mut handles = Vec::with_capacity(size);
        for slot in 0..size {
            let context = WorkerContext {
                pool: name.clone(),
                slot,
                factory: factory.clone(),
                policy,
                jobs: jobs_rx.clone(),
                live: live.clone(),
            };
            let handle = thread::Builder::new()
                .name(format!("{}-{}", name, slot))
                .spawn(move || context.run())?;
            handles.push(handle);
        }

        info!(pool = %name, size, ?policy, "Actor pool started");

        Ok(Self {
            name,
            size,
            jobs: Some(jobs_tx),
            orphans: jobs_rx,
            live,
            handles: Mutex::new(handles),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configured number of workers
    pub fn size(&self) -> usize {
        self.size
    }

    /// Workers that have not retired
    pub fn live_workers(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    fn submit(&self, task: Job<A>) {
        METRICS.pool.tasks_submitted.inc();

        let Some(jobs) = &self.jobs else {
            task.fail(BatchGenError::actor_died(format!("pool {} is shut down", self.name)));
            return;
        };

        if let Err(channel::SendError(task)) = jobs.send(task) {
            task.fail(BatchGenError::actor_died(format!("pool {} is shut down", self.name)));
            return;
        }

        // The last worker may have retired before this job was queued
        if self.live.load(Ordering::SeqCst) == 0 {
            fail_orphaned(&self.orphans, &self.name);
        }
    }

    /// Apply `func` to every input on the pool's workers
    ///
    /// Inputs are pulled lazily, keeping at most `size()` tasks of this call
    /// outstanding. Results are yielded as soon as any worker finishes.
    pub fn map_unordered<T, R, F, I>(&self, func: F, inputs: I) -> MapUnordered<'_, A, T, R, I::IntoIter>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(&mut A, &T) -> Result<R> + Send + Sync + 'static,
        I: IntoIterator<Item = T>,
    {
        let (results_tx, results_rx) = channel::unbounded();
        MapUnordered {
            pool: self,
            func: Arc::new(func),
            inputs: inputs.into_iter(),
            results_tx,
            results_rx,
            outstanding: 0,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl<A: 'static> Drop for ActorPool<A> {
    fn drop(&mut self) {
        // Closing the job channel lets idle workers exit
        self.jobs.take();
        for handle in self.handles.lock().drain(..) {
            if handle.join().is_err() {
                warn!(pool = %self.name, "Worker thread panicked during shutdown");
            }
        }
        debug!(pool = %self.name, "Actor pool shut down");
    }
}

/// Lazy, unordered result stream returned by [`ActorPool::map_unordered`]
///
/// Dropping the stream early cancels its tasks that have not started yet.
/// Tasks already running on a worker finish and their results are discarded.
pub struct MapUnordered<'a, A: 'static, T, R, I> {
    pool: &'a ActorPool<A>,
    func: Arc<TaskFn<A, T, R>>,
    inputs: I,
    results_tx: Sender<Result<R>>,
    results_rx: Receiver<Result<R>>,
    outstanding: usize,
    cancelled: Arc<AtomicBool>,
}

impl<'a, A, T, R, I> MapUnordered<'a, A, T, R, I>
where
    A: 'static,
    T: Send + 'static,
    R: Send + 'static,
    I: Iterator<Item = T>,
{
    fn top_up(&mut self) {
        while self.outstanding < self.pool.size() {
            let Some(input) = self.inputs.next() else { break };
            self.pool.submit(Box::new(MapTask {
                input,
                func: self.func.clone(),
                results: self.results_tx.clone(),
                cancelled: self.cancelled.clone(),
            }));
            self.outstanding += 1;
        }
    }
}

impl<'a, A: 'static, T, R, I> Drop for MapUnordered<'a, A, T, R, I> {
    fn drop(&mut self) {
        if self.outstanding > 0 {
            debug!(pool = %self.pool.name(), outstanding = self.outstanding, "Cancelling unread tasks");
        }
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

impl<'a, A, T, R, I> Iterator for MapUnordered<'a, A, T, R, I>
where
    A: 'static,
    T: Send + 'static,
    R: Send + 'static,
    I: Iterator<Item = T>,
{
    type Item = Result<R>;

    fn next(&mut self) -> Option<Self::Item> {
        self.top_up();
        if self.outstanding == 0 {
            return None;
        }

        // Every submitted task replies exactly once, and we hold a sender
        let result = self
            .results_rx
            .recv()
            .unwrap_or_else(|_| Err(BatchGenError::internal("result channel closed")));
        self.outstanding -= 1;
        Some(result)
    }
}
