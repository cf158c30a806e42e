//! Fingerprint engine
//!
//! A [`Fingerprint`] is the SHA-256 of a function name, the JSON form of its
//! arguments and the signatures of the files it declares. Every field is
//! framed with a tag and a length so that no two different inputs share a
//! byte stream.

use fbuild_config::SignaturePolicy;
use fbuild_core::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Component, Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Stable identity of one memoized call
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(#[serde(with = "hex_digest")] [u8; 32]);

impl Fingerprint {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First 12 hex digits, enough to tell entries apart in logs
    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }

    pub fn from_hex(text: &str) -> Result<Self> {
        let bytes = hex::decode(text)
            .map_err(|e| Error::configuration(format!("invalid fingerprint '{text}': {e}")))?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| {
            Error::configuration(format!("fingerprint '{text}' is not 64 hex digits"))
        })?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.short())
    }
}

/// Whether a build step reads or writes a file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Input,
    Output,
}

impl FileKind {
    fn tag(self) -> u8 {
        match self {
            FileKind::Input => b'i',
            FileKind::Output => b'o',
        }
    }
}

/// What a file looked like when it was signed
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileSignature {
    /// The file did not exist
    Absent,
    /// Size and modification time
    Metadata {
        size: u64,
        mtime_secs: i64,
        mtime_nanos: u32,
    },
    /// Size and SHA-256 of the content
    Content {
        size: u64,
        #[serde(with = "hex_digest")]
        digest: [u8; 32],
    },
}

impl FileSignature {
    pub fn is_absent(&self) -> bool {
        matches!(self, FileSignature::Absent)
    }

    fn feed(&self, hasher: &mut Sha256) {
        match self {
            FileSignature::Absent => hasher.update([0u8]),
            FileSignature::Metadata {
                size,
                mtime_secs,
                mtime_nanos,
            } => {
                hasher.update([1u8]);
                hasher.update(size.to_le_bytes());
                hasher.update(mtime_secs.to_le_bytes());
                hasher.update(mtime_nanos.to_le_bytes());
            }
            FileSignature::Content { size, digest } => {
                hasher.update([2u8]);
                hasher.update(size.to_le_bytes());
                hasher.update(digest);
            }
        }
    }
}

impl fmt::Display for FileSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileSignature::Absent => f.write_str("absent"),
            FileSignature::Metadata {
                size,
                mtime_secs,
                mtime_nanos,
            } => write!(f, "size={size} mtime={mtime_secs}.{mtime_nanos:09}"),
            FileSignature::Content { size, digest } => {
                write!(f, "size={size} sha256={}", hex::encode(&digest[..8]))
            }
        }
    }
}

/// A file a call declares before it runs
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileDependency {
    pub path: PathBuf,
    pub kind: FileKind,
}

impl FileDependency {
    pub fn input(path: impl Into<PathBuf>) -> Self {
        Self {
            path: normalize_path(&path.into()),
            kind: FileKind::Input,
        }
    }

    pub fn output(path: impl Into<PathBuf>) -> Self {
        Self {
            path: normalize_path(&path.into()),
            kind: FileKind::Output,
        }
    }

    /// Sign the file as it is right now
    pub fn sign(&self, policy: SignaturePolicy) -> Result<SignedFile> {
        Ok(SignedFile {
            path: self.path.clone(),
            kind: self.kind,
            signature: sign_file(&self.path, policy)?,
        })
    }
}

/// Lexically clean `path` so that `./src/a.c` and `src/x/../a.c` name the
/// same dependency as `src/a.c`. The file system is not consulted.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match clean.components().next_back() {
                Some(Component::Normal(_)) => {
                    clean.pop();
                }
                // `/..` is `/`
                Some(Component::RootDir | Component::Prefix(_)) => {}
                _ => clean.push(".."),
            },
            other => clean.push(other.as_os_str()),
        }
    }
    if clean.as_os_str().is_empty() {
        clean.push(".");
    }
    clean
}

/// A file dependency together with its recorded signature
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SignedFile {
    pub path: PathBuf,
    pub kind: FileKind,
    pub signature: FileSignature,
}

impl SignedFile {
    /// True when signing the file again yields the recorded signature.
    ///
    /// Unreadable files count as changed.
    pub fn is_current(&self, policy: SignaturePolicy) -> bool {
        match sign_file(&self.path, policy) {
            Ok(current) => current == self.signature,
            Err(e) => {
                tracing::debug!(path = %self.path.display(), "cannot re-sign dependency: {e}");
                false
            }
        }
    }
}

/// Compute the signature of `path` under `policy`.
///
/// A missing file yields [`FileSignature::Absent`]. Under the metadata policy
/// a file whose modification time cannot be read is hashed instead.
pub fn sign_file(path: &Path, policy: SignaturePolicy) -> Result<FileSignature> {
    let metadata = match fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(FileSignature::Absent),
        Err(e) => return Err(Error::file_system(path, "read metadata", e)),
    };

    let mtime = metadata.modified().ok();
    if policy == SignaturePolicy::Metadata || metadata.is_dir() {
        if let Some(mtime) = mtime {
            let (mtime_secs, mtime_nanos) = split_time(mtime);
            return Ok(FileSignature::Metadata {
                size: metadata.len(),
                mtime_secs,
                mtime_nanos,
            });
        }
        tracing::trace!(path = %path.display(), "no modification time; hashing content");
    }

    if metadata.is_dir() {
        return Ok(FileSignature::Metadata {
            size: metadata.len(),
            mtime_secs: 0,
            mtime_nanos: 0,
        });
    }

    hash_file(path)
}

fn split_time(time: SystemTime) -> (i64, u32) {
    match time.duration_since(UNIX_EPOCH) {
        Ok(after) => (after.as_secs() as i64, after.subsec_nanos()),
        Err(before) => {
            let before = before.duration();
            (-(before.as_secs() as i64), before.subsec_nanos())
        }
    }
}

/// Hash a file's content in chunks
fn hash_file(path: &Path) -> Result<FileSignature> {
    let file =
        File::open(path).map_err(|e| Error::file_system(path, "open file for hashing", e))?;
    let mut reader = BufReader::with_capacity(8192, file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    let mut size = 0u64;

    loop {
        let bytes_read = reader
            .read(&mut buffer)
            .map_err(|e| Error::file_system(path, "read file chunk for hashing", e))?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
        size += bytes_read as u64;
    }

    Ok(FileSignature::Content {
        size,
        digest: hasher.finalize().into(),
    })
}

/// Serialize call arguments into the canonical form that is hashed and kept
/// in the cache entry for diagnostics
pub fn encode_args<A: Serialize + ?Sized>(args: &A) -> Result<String> {
    serde_json::to_string(args).map_err(|e| Error::serialization("call arguments", e))
}

/// Incremental fingerprint computation
pub struct FingerprintBuilder {
    hasher: Sha256,
}

impl FingerprintBuilder {
    pub fn new(function: &str) -> Self {
        let mut builder = Self {
            hasher: Sha256::new(),
        };
        builder.field(b'f', function.as_bytes());
        builder
    }

    /// Add the canonical argument encoding produced by [`encode_args`]
    pub fn args(&mut self, encoded: &str) -> &mut Self {
        self.field(b'a', encoded.as_bytes());
        self
    }

    /// Add a declared file.
    ///
    /// Outputs contribute only their path. Their content is what the call
    /// produces, so it is checked after the fact instead of being part of
    /// the key.
    pub fn file(&mut self, file: &SignedFile) -> &mut Self {
        let path = file.path.to_string_lossy();
        self.field(file.kind.tag(), path.as_bytes());
        if file.kind == FileKind::Input {
            file.signature.feed(&mut self.hasher);
        }
        self
    }

    pub fn finish(self) -> Fingerprint {
        Fingerprint(self.hasher.finalize().into())
    }

    fn field(&mut self, tag: u8, bytes: &[u8]) {
        self.hasher.update([tag]);
        self.hasher.update((bytes.len() as u64).to_le_bytes());
        self.hasher.update(bytes);
    }
}

/// Fingerprint of `function` called with `args` over the signed `files`.
///
/// Files are hashed in a canonical order, so the order of declaration does
/// not matter.
pub fn fingerprint<A: Serialize + ?Sized>(
    function: &str,
    args: &A,
    files: &[SignedFile],
) -> Result<Fingerprint> {
    let encoded = encode_args(args)?;
    Ok(fingerprint_encoded(function, &encoded, files))
}

pub(crate) fn fingerprint_encoded(
    function: &str,
    encoded: &str,
    files: &[SignedFile],
) -> Fingerprint {
    let mut sorted: Vec<&SignedFile> = files.iter().collect();
    sorted.sort_by(|a, b| (&a.path, a.kind).cmp(&(&b.path, b.kind)));

    let mut builder = FingerprintBuilder::new(function);
    builder.args(encoded);
    for file in sorted {
        builder.file(file);
    }
    builder.finish()
}

/// Hex in human-readable formats, raw bytes otherwise
mod hex_digest {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&hex::encode(bytes))
        } else {
            serde::Serialize::serialize(bytes, serializer)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 32], D::Error> {
        if deserializer.is_human_readable() {
            let text = String::deserialize(deserializer)?;
            let bytes = hex::decode(&text).map_err(D::Error::custom)?;
            bytes
                .try_into()
                .map_err(|_| D::Error::custom("expected 32 bytes"))
        } else {
            <[u8; 32]>::deserialize(deserializer)
        }
    }
}
