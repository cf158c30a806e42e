//! Shared utilities for fbuild
//!
//! Small building blocks used by the cache, the scheduler and the driver:
//! crash-safe file replacement, logging setup, cooperative cancellation, the
//! interrupt handler that feeds it and the hook pools use to replace blocked
//! workers.

pub mod atomic_file;
pub mod blocking;
pub mod cancel;
pub mod interrupt;
pub mod logging;

pub use atomic_file::*;
pub use cancel::*;
pub use interrupt::*;
pub use logging::*;
