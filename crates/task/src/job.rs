//! Jobs and the handles used to wait for them

use fbuild_core::{Error, Result};
use fbuild_utils::blocking::block_in_place;
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, info_span};

pub(crate) enum Disposition {
    Run,
    Cancel,
}

/// A queued unit of work with its result already wired to a [`JobSlot`]
pub(crate) struct Job {
    id: u64,
    name: String,
    work: Box<dyn FnOnce(Disposition) + Send>,
}

impl Job {
    pub(crate) fn new<T, F>(id: u64, name: String, f: F) -> (Self, Arc<JobSlot<T>>)
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let slot = Arc::new(JobSlot::new());
        let completion = Arc::clone(&slot);
        let job_name = name.clone();
        let work = Box::new(move |disposition: Disposition| {
            let result = match disposition {
                Disposition::Run => match panic::catch_unwind(AssertUnwindSafe(f)) {
                    Ok(result) => result,
                    Err(payload) => {
                        let message = panic_message(payload.as_ref());
                        tracing::error!(job = %job_name, "job panicked: {message}");
                        Err(Error::job_panicked(job_name, message))
                    }
                },
                Disposition::Cancel => Err(Error::job_cancelled(job_name)),
            };
            completion.complete(result);
        });
        (Self { id, name, work }, slot)
    }

    pub(crate) fn run(self) {
        let span = info_span!("job", id = self.id, name = %self.name);
        let _enter = span.enter();
        debug!("job started");
        (self.work)(Disposition::Run);
        debug!("job finished");
    }

    pub(crate) fn cancel(self) {
        debug!(id = self.id, name = %self.name, "job cancelled before start");
        (self.work)(Disposition::Cancel);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Where a job leaves its result
pub(crate) struct JobSlot<T> {
    result: Mutex<Option<Result<T>>>,
    done: Condvar,
}

impl<T> JobSlot<T> {
    fn new() -> Self {
        Self {
            result: Mutex::new(None),
            done: Condvar::new(),
        }
    }

    fn complete(&self, result: Result<T>) {
        *self.result.lock() = Some(result);
        self.done.notify_all();
    }
}

/// Handle to a submitted job
pub struct JobHandle<T> {
    id: u64,
    name: String,
    slot: Arc<JobSlot<T>>,
}

impl<T> JobHandle<T> {
    pub(crate) fn new(id: u64, name: String, slot: Arc<JobSlot<T>>) -> Self {
        Self { id, name, slot }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.slot.result.lock().is_some()
    }

    /// Block until the job has finished and return its result.
    ///
    /// Called from a worker, the pool starts a replacement worker for as
    /// long as this one is blocked, so the job waited on always gets a
    /// thread.
    pub fn wait(self) -> Result<T> {
        let mut result = self.slot.result.lock();
        if result.is_none() {
            block_in_place(|| {
                while result.is_none() {
                    self.slot.done.wait(&mut result);
                }
            });
        }
        match result.take() {
            Some(result) => result,
            None => Err(Error::job_cancelled(self.name.clone())),
        }
    }
}

impl<T> std::fmt::Debug for JobHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("finished", &self.is_finished())
            .finish()
    }
}
