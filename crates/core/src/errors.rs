use std::path::PathBuf;

/// Result type alias for fbuild operations
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`].
///
/// The driver decides how to react to a failure by kind alone: configuration
/// and build errors are reported and end the process with status 1, cache I/O
/// errors are recovered where they occur, and interrupts trigger an orderly
/// shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Missing target, bad option, clearing an unknown cache key
    Configuration,
    /// A build function (or a job running one) reported failure
    Build,
    /// The persisted state file could not be read or written
    CacheIo,
    /// The run was cancelled by an external signal
    Interrupted,
    /// The scheduler refused or dropped a job
    Scheduler,
}

/// Core error type for fbuild operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration errors
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// A target named on the command line is not registered
    #[error("no target named '{name}' is registered")]
    TargetNotFound { name: String },

    /// Failure reported by a build function
    #[error("build error: {message}")]
    Build {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// File system operations performed on behalf of a build step
    #[error("file system {operation} operation failed for '{path}': {source}")]
    FileSystem {
        path: PathBuf,
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// Reading or writing the persisted cache state failed
    #[error("cache state '{path}': {message}")]
    CacheIo {
        path: PathBuf,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Arguments or results of a memoized call could not be (de)serialized
    #[error("failed to serialize {context}: {message}")]
    Serialization { context: String, message: String },

    /// JSON serialization/deserialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: serde_json::Error,
    },

    /// The run was interrupted before the operation could start
    #[error("interrupted")]
    Interrupted,

    /// The scheduler is draining or stopped and refuses new jobs
    #[error("scheduler is closed; job '{job}' was not accepted")]
    SchedulerClosed { job: String },

    /// A queued job was dropped during shutdown before it ran
    #[error("job '{job}' was cancelled before it started")]
    JobCancelled { job: String },

    /// A job panicked while running
    #[error("job '{job}' panicked: {message}")]
    JobPanicked { job: String, message: String },
}

// Conversion implementations
impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::FileSystem {
            path: PathBuf::new(),
            operation: "unknown".to_string(),
            source: error,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::Json {
            message: error.to_string(),
            source: error,
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(error: anyhow::Error) -> Self {
        Error::Build {
            message: format!("{error:#}"),
            source: Some(error.into()),
        }
    }
}

impl Error {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Configuration { .. } | Error::TargetNotFound { .. } => ErrorKind::Configuration,
            Error::Build { .. }
            | Error::FileSystem { .. }
            | Error::Serialization { .. }
            | Error::Json { .. }
            | Error::JobPanicked { .. } => ErrorKind::Build,
            Error::CacheIo { .. } => ErrorKind::CacheIo,
            Error::Interrupted => ErrorKind::Interrupted,
            Error::SchedulerClosed { .. } | Error::JobCancelled { .. } => ErrorKind::Scheduler,
        }
    }

    /// True when this error stems from cancellation rather than a real
    /// failure: the run was interrupted, or a queued job was dropped because
    /// of it. A closed scheduler is a real failure.
    pub fn is_interrupt(&self) -> bool {
        matches!(self, Error::Interrupted | Error::JobCancelled { .. })
    }

    /// Create a configuration error
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Error::Configuration {
            message: message.into(),
        }
    }

    /// Create a missing-target error
    #[must_use]
    pub fn target_not_found(name: impl Into<String>) -> Self {
        Error::TargetNotFound { name: name.into() }
    }

    /// Create a build error
    #[must_use]
    pub fn build(message: impl Into<String>) -> Self {
        Error::Build {
            message: message.into(),
            source: None,
        }
    }

    /// Create a build error wrapping its cause
    #[must_use]
    pub fn build_with_source(
        message: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Error::Build {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a file system error with context
    #[must_use]
    pub fn file_system(
        path: impl Into<PathBuf>,
        operation: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        Error::FileSystem {
            path: path.into(),
            operation: operation.into(),
            source,
        }
    }

    /// Create a cache state error
    #[must_use]
    pub fn cache_io(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Error::CacheIo {
            path: path.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a cache state error wrapping its cause
    #[must_use]
    pub fn cache_io_with_source(
        path: impl Into<PathBuf>,
        message: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Error::CacheIo {
            path: path.into(),
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a serialization error
    #[must_use]
    pub fn serialization(context: impl Into<String>, message: impl ToString) -> Self {
        Error::Serialization {
            context: context.into(),
            message: message.to_string(),
        }
    }

    /// Create a scheduler-closed error
    #[must_use]
    pub fn scheduler_closed(job: impl Into<String>) -> Self {
        Error::SchedulerClosed { job: job.into() }
    }

    /// Create a cancelled-job error
    #[must_use]
    pub fn job_cancelled(job: impl Into<String>) -> Self {
        Error::JobCancelled { job: job.into() }
    }

    /// Create a panicked-job error
    #[must_use]
    pub fn job_panicked(job: impl Into<String>, message: impl Into<String>) -> Self {
        Error::JobPanicked {
            job: job.into(),
            message: message.into(),
        }
    }
}

// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to a Result, keeping the error's kind
    fn context(self, message: impl Into<String>) -> Result<T>;

    /// Add context with a lazy message
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: Into<Error>,
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        let message = message.into();
        self.map_err(|e| wrap(message, e.into()))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| wrap(f(), e.into()))
    }
}

fn wrap(message: String, base: Error) -> Error {
    match base.kind() {
        ErrorKind::Configuration => Error::Configuration {
            message: format!("{message}: {base}"),
        },
        ErrorKind::CacheIo => {
            let path = match &base {
                Error::CacheIo { path, .. } => path.clone(),
                _ => PathBuf::new(),
            };
            Error::cache_io_with_source(path, message, base)
        }
        // Cancellation must stay recognisable after wrapping
        ErrorKind::Interrupted | ErrorKind::Scheduler => base,
        ErrorKind::Build => Error::build_with_source(message, base),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_are_classified() {
        assert_eq!(Error::configuration("x").kind(), ErrorKind::Configuration);
        assert_eq!(Error::target_not_found("build").kind(), ErrorKind::Configuration);
        assert_eq!(Error::build("boom").kind(), ErrorKind::Build);
        assert_eq!(Error::cache_io("state.db", "bad").kind(), ErrorKind::CacheIo);
        assert_eq!(Error::Interrupted.kind(), ErrorKind::Interrupted);
        assert_eq!(Error::scheduler_closed("j").kind(), ErrorKind::Scheduler);
        assert_eq!(Error::job_panicked("j", "oops").kind(), ErrorKind::Build);
    }

    #[test]
    fn test_io_error_becomes_build_kind() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert_eq!(err.kind(), ErrorKind::Build);
    }

    #[test]
    fn test_anyhow_error_becomes_build_error() {
        let err: Error = anyhow::anyhow!("compiler exited with 1").into();
        assert_eq!(err.kind(), ErrorKind::Build);
        assert!(err.to_string().contains("compiler exited with 1"));
    }

    #[test]
    fn test_context_keeps_kind() {
        let result: Result<()> = Err(Error::configuration("unknown function"));
        let err = result.context("clearing cache").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(err.to_string().contains("clearing cache"));

        let result: Result<()> = Err(Error::build("link failed"));
        let err = result.with_context(|| "target build".to_string()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Build);
    }

    #[test]
    fn test_context_does_not_hide_interrupts() {
        let result: Result<()> = Err(Error::Interrupted);
        let err = result.context("compiling a.c").unwrap_err();
        assert!(matches!(err, Error::Interrupted));
        assert!(err.is_interrupt());
    }

    #[test]
    fn test_closed_scheduler_is_not_an_interrupt() {
        assert!(Error::job_cancelled("compile").is_interrupt());
        let closed = Error::scheduler_closed("compile");
        assert_eq!(closed.kind(), ErrorKind::Scheduler);
        assert!(!closed.is_interrupt());
    }

    #[test]
    fn test_target_not_found_names_target() {
        let err = Error::target_not_found("install");
        assert_eq!(err.to_string(), "no target named 'install' is registered");
    }
}
