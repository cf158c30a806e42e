//! Interrupt handling with deferred delivery.
//!
//! SIGINT and SIGTERM never kill the process directly. A background thread
//! receives them and cancels the run's [`CancellationToken`], so running jobs
//! finish naturally and the cache is still persisted. While a [`MaskGuard`]
//! is alive, delivery is postponed until the last guard drops.

use crate::cancel::CancellationToken;
use fbuild_core::Result;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;

#[derive(Default)]
struct Delivery {
    masked: usize,
    pending: bool,
    received: Option<i32>,
}

struct State {
    token: CancellationToken,
    delivery: Mutex<Delivery>,
}

impl State {
    fn deliver(&self, signal: i32) {
        let mut delivery = self.delivery.lock();
        delivery.received = Some(signal);
        if delivery.masked > 0 {
            tracing::warn!(signal, "interrupt received during persistence; deferring");
            delivery.pending = true;
            return;
        }
        drop(delivery);
        tracing::warn!(signal, "interrupt received; finishing running jobs");
        self.token.cancel();
    }

    fn unmask(&self) {
        let mut delivery = self.delivery.lock();
        delivery.masked = delivery.masked.saturating_sub(1);
        if delivery.masked == 0 && delivery.pending {
            delivery.pending = false;
            drop(delivery);
            tracing::debug!("delivering deferred interrupt");
            self.token.cancel();
        }
    }
}

/// Routes OS interrupts into a cancellation token
pub struct InterruptHandler {
    state: Arc<State>,
    #[cfg(unix)]
    signals: Option<signal_hook::iterator::Handle>,
    thread: Option<JoinHandle<()>>,
}

/// Keeps interrupt delivery deferred while alive
#[must_use = "interrupts are only masked while the guard is alive"]
pub struct MaskGuard {
    state: Arc<State>,
}

impl Drop for MaskGuard {
    fn drop(&mut self) {
        self.state.unmask();
    }
}

impl InterruptHandler {
    /// Install handlers for SIGINT and SIGTERM that cancel `token`
    pub fn install(token: CancellationToken) -> Result<Self> {
        let mut handler = Self::detached(token);
        handler.register()?;
        Ok(handler)
    }

    /// A handler that is not connected to OS signals. Signals can still be
    /// injected with [`notify`](Self::notify).
    pub fn detached(token: CancellationToken) -> Self {
        Self {
            state: Arc::new(State {
                token,
                delivery: Mutex::new(Delivery::default()),
            }),
            #[cfg(unix)]
            signals: None,
            thread: None,
        }
    }

    #[cfg(unix)]
    fn register(&mut self) -> Result<()> {
        use signal_hook::consts::{SIGINT, SIGTERM};
        use signal_hook::iterator::Signals;

        let mut signals = Signals::new([SIGINT, SIGTERM]).map_err(|e| {
            fbuild_core::Error::configuration(format!("failed to register signal handlers: {e}"))
        })?;
        self.signals = Some(signals.handle());

        let state = Arc::clone(&self.state);
        let thread = std::thread::Builder::new()
            .name("fbuild-signals".to_string())
            .spawn(move || {
                for signal in signals.forever() {
                    state.deliver(signal);
                }
            })
            .map_err(|e| fbuild_core::Error::file_system("", "spawn signal thread", e))?;
        self.thread = Some(thread);
        Ok(())
    }

    #[cfg(not(unix))]
    fn register(&mut self) -> Result<()> {
        tracing::debug!("signal handling is not available on this platform");
        Ok(())
    }

    /// Deliver `signal` as if the OS had sent it
    pub fn notify(&self, signal: i32) {
        self.state.deliver(signal);
    }

    /// Defer interrupt delivery until the returned guard is dropped
    pub fn mask(&self) -> MaskGuard {
        self.state.delivery.lock().masked += 1;
        MaskGuard {
            state: Arc::clone(&self.state),
        }
    }

    /// The last signal received, if any
    pub fn received(&self) -> Option<i32> {
        self.state.delivery.lock().received
    }

    pub fn token(&self) -> &CancellationToken {
        &self.state.token
    }

    /// Terminate the process the way the received signal would have.
    ///
    /// Returns only if no signal was received or the default action could not
    /// be emulated.
    pub fn reraise(&self) {
        let Some(signal) = self.received() else {
            return;
        };
        self.close();
        #[cfg(unix)]
        {
            if let Err(e) = signal_hook::low_level::emulate_default_handler(signal) {
                tracing::error!(signal, "failed to re-raise interrupt: {e}");
            }
        }
        #[cfg(not(unix))]
        let _ = signal;
    }

    fn close(&self) {
        #[cfg(unix)]
        {
            if let Some(handle) = &self.signals {
                handle.close();
            }
        }
    }
}

impl Drop for InterruptHandler {
    fn drop(&mut self) {
        self.close();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
