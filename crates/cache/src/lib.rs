//! Persistent build cache for fbuild
//!
//! This crate provides:
//! - Fingerprints over a function, its arguments and its file dependencies
//! - A versioned, checksummed state file format
//! - The [`Database`] of cache entries with targeted and cascading invalidation
//! - The [`Memoizer`], which runs each fingerprint at most once per process

pub mod entry;
pub mod fingerprint;
pub mod format;
pub mod memoizer;
pub mod store;

pub use entry::{CacheEntry, EntryDump, FileDump, StateDump};
pub use fingerprint::{
    encode_args, fingerprint, normalize_path, sign_file, FileDependency, FileKind, FileSignature, Fingerprint,
    FingerprintBuilder, SignedFile,
};
pub use format::{FormatError, STATE_MAGIC, STATE_VERSION};
pub use memoizer::{CallStatus, MemoStats, Memoized, Memoizer, Recorder};
pub use store::{Database, DatabaseStats};
