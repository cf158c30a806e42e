//! Call memoization
//!
//! A call is keyed by its function name, arguments and declared files.
//! Files and sub-calls discovered while the body runs are recorded in the
//! entry after it returns and are checked on every later lookup, but they
//! are not part of the key: when one of them changes the body runs again and
//! the entry under the same key is overwritten.

use crate::entry::CacheEntry;
use crate::fingerprint::{
    encode_args, fingerprint_encoded, FileDependency, FileKind, Fingerprint, SignedFile,
};
use crate::store::Database;
use dashmap::DashMap;
use fbuild_core::{Error, Result};
use fbuild_utils::blocking::block_in_place;
use fbuild_utils::cancel::CancellationToken;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, debug_span, info, warn};

/// Whether a result came from the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Hit,
    Executed,
}

/// The result of a memoized call
#[derive(Debug, Clone)]
pub struct Memoized<T> {
    pub value: T,
    pub fingerprint: Fingerprint,
    pub status: CallStatus,
}

impl<T> Memoized<T> {
    pub fn was_cached(&self) -> bool {
        self.status == CallStatus::Hit
    }

    pub fn into_value(self) -> T {
        self.value
    }
}

/// Counters for one run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemoStats {
    /// Results served from the cache
    pub hits: u64,
    /// Calls that found no usable entry, even after waiting for an
    /// identical call in progress
    pub misses: u64,
    /// Bodies actually run
    pub executions: u64,
}

/// Collects what a running body touched
pub struct Recorder<'m> {
    memoizer: &'m Memoizer,
    files: Vec<FileDependency>,
    calls: Vec<Fingerprint>,
}

impl<'m> Recorder<'m> {
    fn new(memoizer: &'m Memoizer) -> Self {
        Self {
            memoizer,
            files: Vec::new(),
            calls: Vec::new(),
        }
    }

    /// Record a file the body read
    pub fn input(&mut self, path: impl Into<PathBuf>) {
        self.files.push(FileDependency::input(path));
    }

    /// Record a file the body wrote
    pub fn output(&mut self, path: impl Into<PathBuf>) {
        self.files.push(FileDependency::output(path));
    }

    /// Record a memoized call whose result the body used, for example one
    /// that ran as a separate job
    pub fn depends_on<T>(&mut self, call: &Memoized<T>) {
        self.calls.push(call.fingerprint);
    }

    /// Memoize a nested call and record the dependency on it
    pub fn call<A, T, F>(
        &mut self,
        function: &str,
        args: &A,
        declared: &[FileDependency],
        body: F,
    ) -> Result<T>
    where
        A: Serialize + ?Sized,
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut Recorder<'_>) -> Result<T>,
    {
        let result = self.memoizer.memoize(function, args, declared, body)?;
        self.depends_on(&result);
        Ok(result.value)
    }

    pub fn memoizer(&self) -> &'m Memoizer {
        self.memoizer
    }
}

/// Runs cacheable calls at most once per fingerprint
pub struct Memoizer {
    database: Arc<Database>,
    token: CancellationToken,
    /// One lock per fingerprint currently being computed
    in_flight: DashMap<Fingerprint, Arc<Mutex<()>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    executions: AtomicU64,
}

impl Memoizer {
    pub fn new(database: Arc<Database>, token: CancellationToken) -> Self {
        Self {
            database,
            token,
            in_flight: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            executions: AtomicU64::new(0),
        }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.database
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn stats(&self) -> MemoStats {
        MemoStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            executions: self.executions.load(Ordering::Relaxed),
        }
    }

    /// Return the cached result of `function(args)` or run `body` to
    /// produce it.
    ///
    /// Concurrent calls with the same fingerprint wait for the first one and
    /// then reuse its result. On a scheduler worker that wait lets the pool
    /// start a replacement worker. A failing body stores nothing and its error is
    /// returned as is. Once the run is cancelled, cache hits are still served
    /// but no new body is started.
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
        let policy = self.database.policy();
        let encoded = encode_args(args)?;
        let declared = declared
            .iter()
            .map(|dependency| dependency.sign(policy))
            .collect::<Result<Vec<_>>>()?;
        let fingerprint = fingerprint_encoded(function, &encoded, &declared);

        let span = debug_span!("memoize", function, fingerprint = %fingerprint.short());
        let _enter = span.enter();

        if let Some(hit) = self.cached(fingerprint) {
            return Ok(hit);
        }

        let slot = self
            .in_flight
            .entry(fingerprint)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let result = {
            let _guard = match slot.try_lock() {
                Some(guard) => guard,
                None => {
                    debug!("waiting for the same call in another job");
                    block_in_place(|| slot.lock())
                }
            };
            // Another caller may have finished the same call while we waited
            match self.cached(fingerprint) {
                Some(hit) => Ok(hit),
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    self.execute(function, encoded, declared, fingerprint, body)
                }
            }
        };
        drop(slot);
        self.in_flight
            .remove_if(&fingerprint, |_, slot| Arc::strong_count(slot) == 1);

        result
    }

    fn cached<T: DeserializeOwned>(&self, fingerprint: Fingerprint) -> Option<Memoized<T>> {
        let entry = self.database.lookup_fresh(&fingerprint)?;
        match bincode::deserialize(&entry.value) {
            Ok(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!("cache hit");
                Some(Memoized {
                    value,
                    fingerprint,
                    status: CallStatus::Hit,
                })
            }
            Err(e) => {
                warn!(
                    "cached value of {} cannot be decoded; running again: {e}",
                    entry.function
                );
                None
            }
        }
    }

    fn execute<T, F>(
        &self,
        function: &str,
        args: String,
        declared: Vec<SignedFile>,
        fingerprint: Fingerprint,
        body: F,
    ) -> Result<Memoized<T>>
    where
        T: Serialize,
        F: FnOnce(&mut Recorder<'_>) -> Result<T>,
    {
        if self.token.is_cancelled() {
            debug!("run cancelled; not starting");
            return Err(Error::Interrupted);
        }

        info!("{function}({args})");
        let started = Instant::now();
        let mut recorder = Recorder::new(self);
        self.executions.fetch_add(1, Ordering::Relaxed);
        let value = match body(&mut recorder) {
            Ok(value) => value,
            Err(e) => {
                debug!("call failed; nothing cached: {e}");
                return Err(e);
            }
        };

        let encoded_value = bincode::serialize(&value)
            .map_err(|e| Error::serialization(format!("result of {function}"), e))?;
        let Recorder { files, calls, .. } = recorder;
        let files = self.manifest(declared, files)?;

        debug!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            files = files.len(),
            calls = calls.len(),
            "caching result"
        );
        self.database.store(
            fingerprint,
            CacheEntry {
                function: function.to_string(),
                args,
                value: encoded_value,
                files,
                calls,
            },
        );

        Ok(Memoized {
            value,
            fingerprint,
            status: CallStatus::Executed,
        })
    }

    /// Declared inputs keep the signature they were keyed with. Outputs and
    /// discovered files are signed now that the body has finished.
    fn manifest(
        &self,
        declared: Vec<SignedFile>,
        discovered: Vec<FileDependency>,
    ) -> Result<Vec<SignedFile>> {
        let policy = self.database.policy();
        let mut seen = HashSet::new();
        let mut files = Vec::with_capacity(declared.len() + discovered.len());

        for file in declared {
            let file = match file.kind {
                FileKind::Input => file,
                FileKind::Output => FileDependency::output(file.path).sign(policy)?,
            };
            if seen.insert((file.path.clone(), file.kind)) {
                files.push(file);
            }
        }
        for dependency in discovered {
            if seen.insert((dependency.path.clone(), dependency.kind)) {
                files.push(dependency.sign(policy)?);
            }
        }
        Ok(files)
    }
}

impl std::fmt::Debug for Memoizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memoizer")
            .field("stats", &self.stats())
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}
