//! The worker pool
//!
//! ```text
//! Running --shutdown()--> Draining --last worker exits--> Stopped
//! ```
//!
//! While draining, queued jobs still run unless the run was cancelled, in
//! which case they complete with a cancelled error without starting. Running
//! jobs are never interrupted.
//!
//! A worker that blocks (waiting on a job handle, or on an identical memoized
//! call held by another job) is replaced by an extra worker for the length of
//! the wait. Once the blocked worker resumes, one surplus worker retires at
//! its next idle point, so at most `size` workers are running jobs outside
//! a blocking wait.

use crate::job::{Job, JobHandle};
use fbuild_core::{Error, Result};
use fbuild_utils::blocking::{self, BlockingHook};
use fbuild_utils::cancel::CancellationToken;
use parking_lot::{Condvar, Mutex};
use std::cell::Cell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Upper bound on how long an idle worker sleeps before re-checking state
const IDLE_POLL: Duration = Duration::from_millis(100);

thread_local! {
    /// Address of the pool the current thread works for, 0 if none
    static CURRENT_POOL: Cell<usize> = const { Cell::new(0) };
}

/// Lifecycle of a [`Scheduler`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Accepting and running jobs
    Running,
    /// Shutdown requested; queued jobs are finished or cancelled
    Draining,
    /// All workers have exited
    Stopped,
}

struct Queue {
    jobs: VecDeque<Job>,
    state: SchedulerState,
    /// Worker threads started and not yet exited
    live: usize,
    /// Workers parked in a blocking wait
    blocked: usize,
    /// Surplus workers asked to exit at their next idle point
    retiring: usize,
}

impl Queue {
    fn active(&self) -> usize {
        self.live.saturating_sub(self.blocked + self.retiring)
    }
}

/// State shared by the scheduler and its workers
struct Shared {
    queue: Mutex<Queue>,
    /// Signalled when a job is queued or the state changes
    available: Condvar,
    /// Signalled when the last worker exits
    stopped: Condvar,
    token: CancellationToken,
    size: usize,
    next_id: AtomicU64,
    next_worker: AtomicUsize,
    completed: AtomicU64,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    fn address(self: &Arc<Self>) -> usize {
        Arc::as_ptr(self) as usize
    }

    fn is_current_worker(self: &Arc<Self>) -> bool {
        CURRENT_POOL.with(|pool| pool.get() == self.address())
    }

    /// Start a worker thread. The caller has already counted it in `live`.
    fn spawn_worker(self: &Arc<Self>) -> Result<()> {
        let index = self.next_worker.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("fbuild-worker-{index}"))
            .spawn(move || worker_loop(shared));
        match spawned {
            Ok(handle) => {
                self.workers.lock().push(handle);
                Ok(())
            }
            Err(e) => {
                self.queue.lock().live -= 1;
                Err(Error::configuration(format!(
                    "cannot start worker thread: {e}"
                )))
            }
        }
    }

    /// Run `job`, or cancel it if the run has been cancelled
    fn dispatch(&self, job: Job) {
        if self.token.is_cancelled() {
            job.cancel();
        } else {
            job.run();
        }
        self.completed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Keeps the pool at `size` workers that are free to run jobs
struct Compensator(Arc<Shared>);

impl BlockingHook for Compensator {
    fn enter(&self) {
        let shared = &self.0;
        let mut queue = shared.queue.lock();
        queue.blocked += 1;
        if queue.retiring > 0 {
            // A surplus worker has not left yet; keep it instead
            queue.retiring -= 1;
            return;
        }
        if queue.active() >= shared.size {
            return;
        }
        queue.live += 1;
        drop(queue);

        debug!("worker blocked; starting a replacement");
        if let Err(e) = shared.spawn_worker() {
            warn!("{e}");
        }
    }

    fn exit(&self) {
        let shared = &self.0;
        let mut queue = shared.queue.lock();
        queue.blocked = queue.blocked.saturating_sub(1);
        if queue.active() > shared.size {
            queue.retiring += 1;
            shared.available.notify_all();
        }
    }
}

/// Pool of `size` worker threads, grown temporarily while workers block
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Scheduler {
    /// Start `size` workers. Cancelling `token` makes the pool stop starting
    /// queued jobs.
    pub fn new(size: usize, token: CancellationToken) -> Result<Self> {
        if size == 0 {
            return Err(Error::configuration("scheduler needs at least one worker"));
        }

        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                jobs: VecDeque::new(),
                state: SchedulerState::Running,
                live: 0,
                blocked: 0,
                retiring: 0,
            }),
            available: Condvar::new(),
            stopped: Condvar::new(),
            token: token.clone(),
            size,
            next_id: AtomicU64::new(0),
            next_worker: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
            workers: Mutex::new(Vec::with_capacity(size)),
        });

        let weak = Arc::downgrade(&shared);
        token.on_cancel(move || {
            if let Some(shared) = weak.upgrade() {
                shared.available.notify_all();
            }
        });

        let scheduler = Self { shared };
        for _ in 0..size {
            scheduler.shared.queue.lock().live += 1;
            scheduler.shared.spawn_worker()?;
        }
        debug!(workers = size, "scheduler started");

        Ok(scheduler)
    }

    pub fn size(&self) -> usize {
        self.shared.size
    }

    pub fn state(&self) -> SchedulerState {
        self.shared.queue.lock().state
    }

    /// Worker threads currently alive, replacements included
    pub fn live_workers(&self) -> usize {
        self.shared.queue.lock().live
    }

    pub fn token(&self) -> &CancellationToken {
        &self.shared.token
    }

    /// Queue `f` under `name`.
    ///
    /// Fails with a scheduler-closed error once shutdown has begun.
    pub fn submit<T, F>(&self, name: impl Into<String>, f: F) -> Result<JobHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let name = name.into();
        let mut queue = self.shared.queue.lock();
        if queue.state != SchedulerState::Running {
            debug!(job = %name, state = ?queue.state, "rejecting job");
            return Err(Error::scheduler_closed(name));
        }

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (job, slot) = Job::new(id, name.clone(), f);
        queue.jobs.push_back(job);
        drop(queue);
        self.shared.available.notify_one();

        Ok(JobHandle::new(id, name, slot))
    }

    /// Run `f` over every item as separate jobs and collect the results in
    /// input order. All jobs settle before the first error is returned.
    pub fn map<I, T, R, F>(&self, name: &str, items: I, f: F) -> Result<Vec<R>>
    where
        I: IntoIterator<Item = T>,
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(T) -> Result<R> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let mut handles = Vec::new();
        for (index, item) in items.into_iter().enumerate() {
            let f = Arc::clone(&f);
            handles.push(self.submit(format!("{name}[{index}]"), move || f(item))?);
        }

        let mut results = Vec::with_capacity(handles.len());
        let mut first_error = None;
        for handle in handles {
            match handle.wait() {
                Ok(value) => results.push(value),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(results),
        }
    }

    /// Stop accepting jobs, let the workers finish and join them.
    ///
    /// Safe to call any number of times from any thread. Called from inside
    /// a job it only starts draining and returns, since it cannot wait for
    /// its own worker; the last worker to exit then marks the pool stopped,
    /// and a later call from outside the pool waits for that. Queued jobs
    /// are cancelled instead of run when the token has been cancelled.
    pub fn shutdown(&self) {
        let cancelled: Vec<Job> = {
            let mut queue = self.shared.queue.lock();
            if queue.state == SchedulerState::Running {
                debug!(queued = queue.jobs.len(), "scheduler draining");
                queue.state = SchedulerState::Draining;
            }
            self.shared.available.notify_all();
            if self.shared.token.is_cancelled() {
                queue.jobs.drain(..).collect()
            } else {
                Vec::new()
            }
        };
        if !cancelled.is_empty() {
            info!(jobs = cancelled.len(), "cancelling queued jobs");
        }
        for job in cancelled {
            job.cancel();
        }

        if self.shared.is_current_worker() {
            debug!("shutdown requested from a job; not waiting for workers");
            return;
        }

        {
            let mut queue = self.shared.queue.lock();
            while queue.live > 0 {
                self.shared.stopped.wait(&mut queue);
            }
            queue.state = SchedulerState::Stopped;
        }

        let handles = std::mem::take(&mut *self.shared.workers.lock());
        for handle in handles {
            if handle.join().is_err() {
                error!("worker thread panicked");
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("size", &self.shared.size)
            .field("state", &self.state())
            .finish()
    }
}

/// Counts the worker out when its thread ends, even by unwinding
struct WorkerExit(Arc<Shared>);

impl Drop for WorkerExit {
    fn drop(&mut self) {
        blocking::uninstall();
        let shared = &self.0;
        let mut queue = shared.queue.lock();
        queue.live -= 1;
        if queue.live == 0 && queue.state != SchedulerState::Running {
            queue.state = SchedulerState::Stopped;
            shared.stopped.notify_all();
            debug!(
                jobs = shared.completed.load(Ordering::Relaxed),
                "scheduler stopped"
            );
        }
    }
}

fn worker_loop(shared: Arc<Shared>) {
    CURRENT_POOL.with(|pool| pool.set(shared.address()));
    blocking::install(Arc::new(Compensator(Arc::clone(&shared))));
    let _exit = WorkerExit(Arc::clone(&shared));
    loop {
        let job = {
            let mut queue = shared.queue.lock();
            loop {
                if queue.retiring > 0 {
                    queue.retiring -= 1;
                    debug!("surplus worker retiring");
                    break None;
                }
                if let Some(job) = queue.jobs.pop_front() {
                    break Some(job);
                }
                if queue.state != SchedulerState::Running {
                    break None;
                }
                shared.available.wait_for(&mut queue, IDLE_POLL);
            }
        };
        match job {
            Some(job) => shared.dispatch(job),
            None => break,
        }
    }
    debug!("worker exiting");
}
