/// Constants used throughout the fbuild codebase
// Default locations, all resolved relative to the build root
pub const DEFAULT_BUILDROOT: &str = "build";
pub const DEFAULT_STATE_FILE: &str = "fbuild-state.db";
pub const DEFAULT_LOG_FILE: &str = "fbuild.log";

// Default target when none is named on the command line
pub const DEFAULT_TARGET: &str = "build";

// Environment variable names
pub const FBUILD_JOBS_VAR: &str = "FBUILD_JOBS";
pub const FBUILD_BUILDROOT_VAR: &str = "FBUILD_BUILDROOT";
pub const FBUILD_SIGNATURE_VAR: &str = "FBUILD_SIGNATURE";

// Exit status used when an interrupt cannot be re-raised
pub const INTERRUPTED_EXIT_CODE: i32 = 130;
