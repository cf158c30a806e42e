//! Runtime options for one fbuild invocation
//!
//! `BuildOptions` is built once from the command line (plus environment
//! overrides and whatever a build script's `post_options` hook adds), then
//! validated and shared read-only with every component of the run.

use crate::signature::SignaturePolicy;
use fbuild_core::{
    Error, Result, DEFAULT_BUILDROOT, DEFAULT_LOG_FILE, DEFAULT_STATE_FILE, FBUILD_BUILDROOT_VAR,
    FBUILD_JOBS_VAR, FBUILD_SIGNATURE_VAR,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Settings that affect how a build runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOptions {
    /// Verbosity level for diagnostics (count of `-v`)
    pub verbose: u8,

    /// Number of scheduler workers
    pub jobs: usize,

    /// Whether terminal output may use ANSI colors
    pub color: bool,

    /// Annotate log lines with the worker thread
    pub show_threads: bool,

    /// Ignore the persisted cache and start from an empty one
    pub force_configuration: bool,

    /// Root directory for build outputs, state and logs
    pub buildroot: PathBuf,

    /// Cache state file name, resolved under `buildroot`
    pub state_file: PathBuf,

    /// Log file name, resolved under `buildroot`
    pub log_file: PathBuf,

    /// How file dependencies are signed
    pub signature_policy: SignaturePolicy,

    /// Persist the cache at exit
    pub save_database: bool,

    /// Free-form settings a build script may add in its `post_options` hook
    pub extra: BTreeMap<String, String>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            verbose: 0,
            jobs: 1,
            color: true,
            show_threads: false,
            force_configuration: false,
            buildroot: PathBuf::from(DEFAULT_BUILDROOT),
            state_file: PathBuf::from(DEFAULT_STATE_FILE),
            log_file: PathBuf::from(DEFAULT_LOG_FILE),
            signature_policy: SignaturePolicy::default(),
            save_database: true,
            extra: BTreeMap::new(),
        }
    }
}

impl BuildOptions {
    /// Options rooted at `buildroot`, everything else default
    pub fn with_buildroot(buildroot: impl Into<PathBuf>) -> Self {
        Self {
            buildroot: buildroot.into(),
            ..Default::default()
        }
    }

    /// Check the invariants other components rely on
    pub fn validate(&self) -> Result<()> {
        if self.jobs == 0 {
            return Err(Error::configuration("--jobs must be at least 1"));
        }
        if self.buildroot.as_os_str().is_empty() {
            return Err(Error::configuration("--buildroot must not be empty"));
        }
        check_relative_name("--state-file", &self.state_file)?;
        check_relative_name("--log-file", &self.log_file)?;
        Ok(())
    }

    /// Absolute or buildroot-relative location of the cache state file
    pub fn state_path(&self) -> PathBuf {
        self.buildroot.join(&self.state_file)
    }

    /// Location of the log file
    pub fn log_path(&self) -> PathBuf {
        self.buildroot.join(&self.log_file)
    }

    /// Apply `FBUILD_*` environment variables.
    ///
    /// Only fields still at their default are overridden so that explicit
    /// command line flags keep precedence.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|name| std::env::var(name).ok())
    }

    /// Same as [`apply_env`](Self::apply_env) with an explicit lookup
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = BuildOptions::default();

        if self.jobs == defaults.jobs {
            if let Some(value) = lookup(FBUILD_JOBS_VAR) {
                self.jobs = value.trim().parse().map_err(|_| {
                    Error::configuration(format!("{FBUILD_JOBS_VAR}='{value}' is not a number"))
                })?;
                tracing::debug!(jobs = self.jobs, "jobs taken from environment");
            }
        }

        if self.buildroot == defaults.buildroot {
            if let Some(value) = lookup(FBUILD_BUILDROOT_VAR).filter(|v| !v.is_empty()) {
                self.buildroot = PathBuf::from(value);
            }
        }

        if self.signature_policy == defaults.signature_policy {
            if let Some(value) = lookup(FBUILD_SIGNATURE_VAR) {
                self.signature_policy = value.parse()?;
            }
        }

        Ok(())
    }
}

fn check_relative_name(flag: &str, name: &Path) -> Result<()> {
    if name.as_os_str().is_empty() {
        return Err(Error::configuration(format!("{flag} must not be empty")));
    }
    if name.is_absolute() {
        return Err(Error::configuration(format!(
            "{flag} '{}' must be relative to the build root",
            name.display()
        )));
    }
    Ok(())
}
