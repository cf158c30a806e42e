//! Job scheduling for fbuild
//!
//! A pool of worker threads runs submitted jobs. Jobs may submit and wait on
//! other jobs; while a worker is blocked in such a wait the pool runs an
//! extra worker in its place, so nested waits cannot starve the pool.

pub mod job;
pub mod scheduler;

pub use job::JobHandle;
pub use scheduler::{Scheduler, SchedulerState};
