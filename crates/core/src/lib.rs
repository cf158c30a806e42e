//! Core errors and constants for `fbuild`.
//!
//! Every other crate in the workspace reports failures through the single
//! [`Error`] enum defined here. Each variant belongs to exactly one
//! [`ErrorKind`], which is what the command line driver inspects when it
//! decides between "report and exit 1", "recover locally" and "shut down
//! because the user pressed Ctrl-C".
//!
//! ## Key Components
//!
//! - **`errors`**: the `Error` enum, `ErrorKind`, the `Result` alias and the
//!   `ResultExt` context helpers.
//! - **`constants`**: default file names and environment variable names shared
//!   by the configuration layer and the driver.

pub mod constants;
pub mod errors;

pub use self::{
    constants::*,
    errors::{Error, ErrorKind, Result, ResultExt},
};
