use fbuild_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How file dependencies are signed when fingerprinting a call.
///
/// `Metadata` compares size and modification time only; touching a file
/// counts as a change even if its bytes are identical. `Content` hashes the
/// bytes, so only real edits invalidate cached results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignaturePolicy {
    #[default]
    Metadata,
    Content,
}

impl SignaturePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignaturePolicy::Metadata => "metadata",
            SignaturePolicy::Content => "content",
        }
    }
}

impl fmt::Display for SignaturePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignaturePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "metadata" | "mtime" => Ok(SignaturePolicy::Metadata),
            "content" | "hash" => Ok(SignaturePolicy::Content),
            other => Err(Error::configuration(format!(
                "unknown signature policy '{other}' (expected 'metadata' or 'content')"
            ))),
        }
    }
}
