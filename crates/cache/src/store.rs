//! The cache store
//!
//! All tables live behind one coarse lock. File signing happens outside the
//! lock so that workers checking freshness do not serialize on disk I/O.

use crate::entry::{CacheEntry, StateDump};
use crate::fingerprint::{normalize_path, sign_file, FileSignature, Fingerprint, SignedFile};
use crate::format;
use fbuild_config::SignaturePolicy;
use fbuild_core::{Error, Result};
use fbuild_utils::atomic_file::write_atomic;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Entry counts reported after a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DatabaseStats {
    pub entries: usize,
    pub functions: usize,
    pub files: usize,
}

#[derive(Default)]
struct Tables {
    entries: BTreeMap<Fingerprint, CacheEntry>,
    by_function: HashMap<String, HashSet<Fingerprint>>,
    by_file: HashMap<PathBuf, HashSet<Fingerprint>>,
    /// callee -> callers that recorded a call to it
    dependents: HashMap<Fingerprint, HashSet<Fingerprint>>,
}

impl Tables {
    fn from_entries(entries: BTreeMap<Fingerprint, CacheEntry>) -> Self {
        let mut tables = Tables::default();
        for (fingerprint, entry) in entries {
            tables.insert(fingerprint, entry);
        }
        tables
    }

    fn insert(&mut self, fingerprint: Fingerprint, entry: CacheEntry) {
        if let Some(old) = self.entries.remove(&fingerprint) {
            self.unindex(fingerprint, &old);
        }
        self.by_function
            .entry(entry.function.clone())
            .or_default()
            .insert(fingerprint);
        for file in &entry.files {
            self.by_file
                .entry(file.path.clone())
                .or_default()
                .insert(fingerprint);
        }
        for callee in &entry.calls {
            self.dependents.entry(*callee).or_default().insert(fingerprint);
        }
        self.entries.insert(fingerprint, entry);
    }

    fn unindex(&mut self, fingerprint: Fingerprint, entry: &CacheEntry) {
        remove_from(&mut self.by_function, &entry.function, &fingerprint);
        for file in &entry.files {
            remove_from(&mut self.by_file, &file.path, &fingerprint);
        }
        for callee in &entry.calls {
            remove_from(&mut self.dependents, callee, &fingerprint);
        }
    }

    /// Remove `seeds` and every entry that transitively called one of them
    fn remove_cascade(&mut self, seeds: impl IntoIterator<Item = Fingerprint>) -> usize {
        let mut pending: Vec<Fingerprint> = seeds.into_iter().collect();
        let mut removed = 0;
        while let Some(fingerprint) = pending.pop() {
            let Some(entry) = self.entries.remove(&fingerprint) else {
                continue;
            };
            self.unindex(fingerprint, &entry);
            if let Some(callers) = self.dependents.remove(&fingerprint) {
                pending.extend(callers);
            }
            debug!(
                fingerprint = %fingerprint.short(),
                function = %entry.function,
                "invalidated cache entry"
            );
            removed += 1;
        }
        removed
    }

    /// Files of `root` and of everything it called, or `None` when a recorded
    /// call no longer has an entry
    fn closure_files(&self, root: Fingerprint) -> Option<Vec<SignedFile>> {
        let mut files = Vec::new();
        let mut seen = HashSet::new();
        let mut pending = vec![root];
        while let Some(fingerprint) = pending.pop() {
            if !seen.insert(fingerprint) {
                continue;
            }
            let entry = self.entries.get(&fingerprint)?;
            files.extend(entry.files.iter().cloned());
            pending.extend(entry.calls.iter().copied());
        }
        Some(files)
    }
}

fn remove_from<K, Q>(index: &mut HashMap<K, HashSet<Fingerprint>>, key: &Q, fingerprint: &Fingerprint)
where
    K: std::borrow::Borrow<Q> + std::hash::Hash + Eq,
    Q: std::hash::Hash + Eq + ?Sized,
{
    if let Some(set) = index.get_mut(key) {
        set.remove(fingerprint);
        if set.is_empty() {
            index.remove(key);
        }
    }
}

/// Memoizes signatures while checking many files that may repeat
struct SignatureCheck {
    policy: SignaturePolicy,
    seen: HashMap<PathBuf, Option<FileSignature>>,
}

impl SignatureCheck {
    fn new(policy: SignaturePolicy) -> Self {
        Self {
            policy,
            seen: HashMap::new(),
        }
    }

    fn is_current(&mut self, file: &SignedFile) -> bool {
        let policy = self.policy;
        let current = self
            .seen
            .entry(file.path.clone())
            .or_insert_with(|| match sign_file(&file.path, policy) {
                Ok(signature) => Some(signature),
                Err(e) => {
                    debug!(path = %file.path.display(), "cannot re-sign dependency: {e}");
                    None
                }
            });
        current.as_ref() == Some(&file.signature)
    }
}

/// Persistent mapping from fingerprint to cache entry
pub struct Database {
    tables: Mutex<Tables>,
    policy: SignaturePolicy,
}

impl Database {
    /// An empty store
    pub fn new(policy: SignaturePolicy) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            policy,
        }
    }

    /// Load the store persisted at `path`.
    ///
    /// Never fails: a missing, unreadable, foreign or corrupt file yields an
    /// empty store. Entries whose files changed since they were recorded are
    /// pruned along with their dependents.
    pub fn load(path: &Path, policy: SignaturePolicy) -> Self {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no state file; starting with an empty cache");
                return Self::new(policy);
            }
            Err(e) => {
                warn!(path = %path.display(), "cannot read state file, starting with an empty cache: {e}");
                return Self::new(policy);
            }
        };

        let entries: BTreeMap<Fingerprint, CacheEntry> = match format::decode(&bytes) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = %path.display(), "ignoring state file, starting with an empty cache: {e}");
                return Self::new(policy);
            }
        };

        let loaded = entries.len();
        let mut tables = Tables::from_entries(entries);
        let pruned = prune(&mut tables, policy);
        info!(
            path = %path.display(),
            entries = loaded - pruned,
            pruned,
            "loaded build cache"
        );

        Self {
            tables: Mutex::new(tables),
            policy,
        }
    }

    /// Persist all entries to `path` atomically
    pub fn save(&self, path: &Path) -> Result<()> {
        let bytes = {
            let tables = self.tables.lock();
            format::encode(&tables.entries)
                .map_err(|e| Error::cache_io_with_source(path, "cannot encode cache", e))?
        };
        write_atomic(path, &bytes)
            .map_err(|e| Error::cache_io_with_source(path, "cannot write state file", e))?;
        debug!(path = %path.display(), bytes = bytes.len(), "saved build cache");
        Ok(())
    }

    pub fn policy(&self) -> SignaturePolicy {
        self.policy
    }

    /// The entry stored under `fingerprint`, valid or not
    pub fn lookup(&self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        self.tables.lock().entries.get(fingerprint).cloned()
    }

    /// The entry stored under `fingerprint` if every file it and its
    /// recorded sub-calls depend on still has its recorded signature
    pub fn lookup_fresh(&self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        let (entry, files) = {
            let tables = self.tables.lock();
            let entry = tables.entries.get(fingerprint)?.clone();
            let Some(files) = tables.closure_files(*fingerprint) else {
                debug!(fingerprint = %fingerprint.short(), "a recorded sub-call is gone");
                return None;
            };
            (entry, files)
        };

        let mut check = SignatureCheck::new(self.policy);
        if let Some(stale) = files.iter().find(|file| !check.is_current(file)) {
            debug!(
                fingerprint = %fingerprint.short(),
                path = %stale.path.display(),
                "dependency changed"
            );
            return None;
        }
        Some(entry)
    }

    /// Insert or overwrite the entry for `fingerprint`
    pub fn store(&self, fingerprint: Fingerprint, entry: CacheEntry) {
        self.tables.lock().insert(fingerprint, entry);
    }

    /// Remove every entry of `function` and everything that called them.
    /// Returns whether anything matched.
    pub fn clear_function(&self, function: &str) -> bool {
        let mut tables = self.tables.lock();
        let Some(seeds) = tables.by_function.get(function).cloned() else {
            return false;
        };
        let removed = tables.remove_cascade(seeds);
        info!(function, removed, "cleared cache entries for function");
        removed > 0
    }

    /// Remove every entry that recorded `path` and everything that called
    /// them. Returns whether anything matched.
    ///
    /// `path` is compared after lexical normalization, the way dependencies
    /// are recorded.
    pub fn clear_file(&self, path: &Path) -> bool {
        let path = normalize_path(path);
        let mut tables = self.tables.lock();
        let Some(seeds) = tables.by_file.get(&path).cloned() else {
            return false;
        };
        let removed = tables.remove_cascade(seeds);
        info!(path = %path.display(), removed, "cleared cache entries for file");
        removed > 0
    }

    pub fn dump(&self) -> StateDump {
        StateDump::from_entries(&self.tables.lock().entries)
    }

    pub fn stats(&self) -> DatabaseStats {
        let tables = self.tables.lock();
        DatabaseStats {
            entries: tables.entries.len(),
            functions: tables.by_function.len(),
            files: tables.by_file.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.tables.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("policy", &self.policy)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Drop entries with changed files or dangling calls, plus their dependents
fn prune(tables: &mut Tables, policy: SignaturePolicy) -> usize {
    let mut check = SignatureCheck::new(policy);
    let stale: Vec<Fingerprint> = tables
        .entries
        .iter()
        .filter(|(_, entry)| {
            entry.calls.iter().any(|call| !tables.entries.contains_key(call))
                || entry.files.iter().any(|file| !check.is_current(file))
        })
        .map(|(fingerprint, _)| *fingerprint)
        .collect();
    tables.remove_cascade(stale)
}
