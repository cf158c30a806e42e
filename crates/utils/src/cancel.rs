//! Cooperative cancellation shared by the scheduler, the memoizer and the
//! interrupt handler.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

type Callback = Box<dyn Fn() + Send + Sync>;

struct Inner {
    cancelled: AtomicBool,
    callbacks: Mutex<Vec<Callback>>,
}

/// A cloneable flag that flips once from "running" to "cancelled".
///
/// Nothing is interrupted forcibly: components poll [`is_cancelled`] at safe
/// points, or register a callback with [`on_cancel`] to wake up threads that
/// are parked on their own condition variables.
///
/// [`is_cancelled`]: CancellationToken::is_cancelled
/// [`on_cancel`]: CancellationToken::on_cancel
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                callbacks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Cancel the token. Returns `true` for the call that performed the
    /// transition; later calls are no-ops.
    pub fn cancel(&self) -> bool {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return false;
        }
        tracing::debug!("cancellation requested");
        let callbacks = std::mem::take(&mut *self.inner.callbacks.lock());
        for callback in &callbacks {
            callback();
        }
        true
    }

    /// Run `callback` once when the token is cancelled, or immediately if it
    /// already is.
    pub fn on_cancel<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        {
            let mut callbacks = self.inner.callbacks.lock();
            if !self.is_cancelled() {
                callbacks.push(Box::new(callback));
                return;
            }
        }
        callback();
    }
}
