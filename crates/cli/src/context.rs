//! Run context for one invocation
//!
//! The context owns the build cache, the scheduler and the interrupt handler
//! for the lifetime of the process and is handed to every target. It is cheap
//! to clone so jobs can carry it onto worker threads.

use fbuild_cache::{Database, DatabaseStats, FileDependency, MemoStats, Memoized, Memoizer, Recorder};
use fbuild_config::BuildOptions;
use fbuild_core::{Error, Result};
use fbuild_task::{JobHandle, Scheduler};
use fbuild_utils::cancel::CancellationToken;
use fbuild_utils::interrupt::InterruptHandler;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Shared state of one fbuild run
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

struct Inner {
    options: BuildOptions,
    interrupts: InterruptHandler,
    scheduler: Scheduler,
    memoizer: RwLock<Arc<Memoizer>>,
    saved: AtomicBool,
}

impl Context {
    /// Validate `options` and start the scheduler. The cache starts empty
    /// until [`load_configuration`](Self::load_configuration) is called.
    pub fn new(options: BuildOptions, interrupts: InterruptHandler) -> Result<Self> {
        options.validate()?;
        let token = interrupts.token().clone();
        let scheduler = Scheduler::new(options.jobs, token.clone())?;
        let database = Database::new(options.signature_policy);
        let memoizer = Memoizer::new(Arc::new(database), token);

        Ok(Self {
            inner: Arc::new(Inner {
                options,
                interrupts,
                scheduler,
                memoizer: RwLock::new(Arc::new(memoizer)),
                saved: AtomicBool::new(false),
            }),
        })
    }

    pub fn options(&self) -> &BuildOptions {
        &self.inner.options
    }

    pub fn buildroot(&self) -> &Path {
        &self.inner.options.buildroot
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    pub fn token(&self) -> &CancellationToken {
        self.inner.interrupts.token()
    }

    pub fn interrupts(&self) -> &InterruptHandler {
        &self.inner.interrupts
    }

    pub fn memoizer(&self) -> Arc<Memoizer> {
        Arc::clone(&self.inner.memoizer.read())
    }

    pub fn database(&self) -> Arc<Database> {
        Arc::clone(self.memoizer().database())
    }

    /// Create the build root directory
    pub fn create_buildroot(&self) -> Result<()> {
        let buildroot = self.buildroot();
        fs::create_dir_all(buildroot)
            .map_err(|e| Error::file_system(buildroot, "create build root", e))?;
        debug!(buildroot = %buildroot.display(), "build root ready");
        Ok(())
    }

    /// Replace the in-memory cache with the persisted one.
    ///
    /// With `--configure` the persisted state is ignored and the run starts
    /// from an empty cache. A missing or unreadable state file also yields an
    /// empty cache.
    pub fn load_configuration(&self) {
        let options = self.options();
        let policy = options.signature_policy;
        let database = if options.force_configuration {
            info!("reconfiguring; previous build cache ignored");
            Database::new(policy)
        } else {
            Database::load(&options.state_path(), policy)
        };
        let memoizer = Memoizer::new(Arc::new(database), self.token().clone());
        *self.inner.memoizer.write() = Arc::new(memoizer);
    }

    /// Persist the cache.
    ///
    /// Only the first call does anything; later calls return `Ok`. Interrupts
    /// are deferred until the state file has been replaced.
    pub fn save_configuration(&self) -> Result<()> {
        if self.inner.saved.swap(true, Ordering::SeqCst) {
            debug!("build cache already saved");
            return Ok(());
        }
        if !self.options().save_database {
            info!("not saving the build cache");
            return Ok(());
        }

        let _mask = self.inner.interrupts.mask();
        let path = self.options().state_path();
        self.database().save(&path)?;
        debug!(path = %path.display(), "build cache saved");
        Ok(())
    }

    /// Memoize `body` as a call to `function` with `args`
    pub fn memoize<A, T, F>(
        &self,
        function: &str,
        args: &A,
        declared: &[FileDependency],
        body: F,
    ) -> Result<Memoized<T>>
    where
        A: Serialize + ?Sized,
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut Recorder<'_>) -> Result<T>,
    {
        self.memoizer().memoize(function, args, declared, body)
    }

    /// Queue `f` on the scheduler
    pub fn submit<T, F>(&self, name: impl Into<String>, f: F) -> Result<JobHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        self.inner.scheduler.submit(name, f)
    }

    /// The signal that interrupted the run, if any
    pub fn interrupted(&self) -> Option<i32> {
        self.inner.interrupts.received()
    }

    /// Drain and stop the scheduler
    pub fn shutdown(&self) {
        self.inner.scheduler.shutdown();
    }

    pub fn memo_stats(&self) -> MemoStats {
        self.memoizer().stats()
    }

    pub fn cache_stats(&self) -> DatabaseStats {
        self.database().stats()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("buildroot", &self.buildroot())
            .field("scheduler", &self.inner.scheduler)
            .field("saved", &self.inner.saved.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fbuild_core::ErrorKind;
    use tempfile::TempDir;

    fn context(dir: &TempDir) -> Context {
        let options = BuildOptions::with_buildroot(dir.path().join("build"));
        Context::new(options, InterruptHandler::detached(CancellationToken::new())).unwrap()
    }

    #[test]
    fn test_invalid_options_are_rejected() {
        let options = BuildOptions {
            jobs: 0,
            ..Default::default()
        };
        let err = Context::new(options, InterruptHandler::detached(CancellationToken::new()))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_save_happens_once() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        ctx.create_buildroot().unwrap();
        ctx.memoize("f", &1, &[], |_| Ok(1)).unwrap();

        ctx.save_configuration().unwrap();
        let state = ctx.options().state_path();
        assert!(state.exists());

        fs::remove_file(&state).unwrap();
        ctx.save_configuration().unwrap();
        assert!(!state.exists());
    }

    #[test]
    fn test_do_not_save_database_skips_persistence() {
        let dir = TempDir::new().unwrap();
        let mut options = BuildOptions::with_buildroot(dir.path().join("build"));
        options.save_database = false;
        let ctx = Context::new(options, InterruptHandler::detached(CancellationToken::new())).unwrap();
        ctx.create_buildroot().unwrap();
        ctx.memoize("f", &1, &[], |_| Ok(1)).unwrap();

        ctx.save_configuration().unwrap();
        assert!(!ctx.options().state_path().exists());
    }

    #[test]
    fn test_interrupt_during_save_is_deferred() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        ctx.create_buildroot().unwrap();

        let guard = ctx.interrupts().mask();
        ctx.interrupts().notify(2);
        assert!(!ctx.token().is_cancelled());
        drop(guard);
        assert!(ctx.token().is_cancelled());

        // The cancelled run still persists its cache
        ctx.save_configuration().unwrap();
        assert!(ctx.options().state_path().exists());
        assert_eq!(ctx.interrupted(), Some(2));
    }

    #[test]
    fn test_reconfigure_ignores_saved_state() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        ctx.create_buildroot().unwrap();
        ctx.memoize("f", &1, &[], |_| Ok(1)).unwrap();
        ctx.save_configuration().unwrap();

        let reloaded = context(&dir);
        reloaded.load_configuration();
        assert_eq!(reloaded.cache_stats().entries, 1);

        let mut options = reloaded.options().clone();
        options.force_configuration = true;
        let forced = Context::new(options, InterruptHandler::detached(CancellationToken::new())).unwrap();
        forced.load_configuration();
        assert_eq!(forced.cache_stats().entries, 0);
    }
}
