//! Marking regions where a pooled thread blocks
//!
//! A thread pool installs a [`BlockingHook`] on each of its workers. Code
//! that is about to park the current thread (waiting on another job, or on a
//! lock held by another job) wraps the wait in [`block_in_place`], which lets
//! the pool start a replacement worker for the duration of the wait. Threads
//! without a hook block normally.

use std::cell::RefCell;
use std::sync::Arc;

/// Notified when a thread of the pool enters and leaves a blocking region
pub trait BlockingHook: Send + Sync {
    fn enter(&self);
    fn exit(&self);
}

thread_local! {
    static HOOK: RefCell<Option<Arc<dyn BlockingHook>>> = const { RefCell::new(None) };
}

/// Install `hook` for the current thread, replacing any previous one
pub fn install(hook: Arc<dyn BlockingHook>) {
    HOOK.with(|current| *current.borrow_mut() = Some(hook));
}

/// Remove the hook of the current thread
pub fn uninstall() {
    HOOK.with(|current| current.borrow_mut().take());
}

struct Region(Arc<dyn BlockingHook>);

impl Drop for Region {
    fn drop(&mut self) {
        self.0.exit();
    }
}

/// Run `wait`, telling the current thread's pool that it is blocked until
/// `wait` returns or unwinds
pub fn block_in_place<R>(wait: impl FnOnce() -> R) -> R {
    let region = HOOK.with(|current| current.borrow().clone()).map(|hook| {
        hook.enter();
        Region(hook)
    });
    let result = wait();
    drop(region);
    result
}
