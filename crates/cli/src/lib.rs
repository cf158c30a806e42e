//! fbuild driver
//!
//! A build script is a [`Registry`] of named targets. [`main`] parses the
//! command line, creates the [`Context`] (build cache, scheduler, interrupt
//! handling), runs the requested targets and persists the cache on the way
//! out.
//!
//! ```no_run
//! use fbuild::{FileDependency, Registry};
//!
//! fn main() -> std::process::ExitCode {
//!     let registry = Registry::new().target("build", |context| {
//!         let object = context.memoize(
//!             "compile",
//!             "main.c",
//!             &[FileDependency::input("main.c"), FileDependency::output("build/main.o")],
//!             |_| Ok("build/main.o".to_string()),
//!         )?;
//!         tracing::info!("compiled {}", object.value);
//!         Ok(())
//!     });
//!     fbuild::main(registry)
//! }
//! ```

pub mod cli;
pub mod commands;
pub mod context;
pub mod demo;
pub mod registry;
mod run;

pub use context::Context;
pub use registry::Registry;
pub use run::{exit_code, main, run, FAILURE_EXIT_CODE};

// Types build scripts use with the context
pub use fbuild_cache::{CallStatus, FileDependency, Memoized, Recorder};
pub use fbuild_config::{BuildOptions, SignaturePolicy};
pub use fbuild_core::{Error, ErrorKind, Result};
