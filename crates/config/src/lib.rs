//! Runtime options for fbuild
//!
//! This crate holds the validated settings a single invocation runs with:
//! worker count, build root, state and log file names, output styling and
//! the file signature policy used by the cache.

pub mod config;
pub mod signature;

pub use config::*;
pub use signature::*;
