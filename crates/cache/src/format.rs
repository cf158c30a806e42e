//! State file format
//!
//! ```text
//! +-------+---------+--------+--------+----------------+
//! | magic | version | crc32c | length | bincode payload |
//! | 4     | 2       | 4      | 8      | length bytes    |
//! +-------+---------+--------+--------+----------------+
//! ```
//!
//! The header is itself bincode-encoded with fixed-width little-endian
//! integers.

use crc32c::crc32c;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Magic bytes at the start of every state file
pub const STATE_MAGIC: [u8; 4] = *b"FBDB";

/// Current state file version. Files with any other version are ignored.
pub const STATE_VERSION: u16 = 1;

const HEADER_LEN: usize = 18;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct StateHeader {
    magic: [u8; 4],
    version: u16,
    payload_crc: u32,
    payload_len: u64,
}

/// Why a state file was rejected
#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    #[error("file is {0} bytes, shorter than the header")]
    Truncated(usize),

    #[error("not an fbuild state file (magic {0:02x?})")]
    BadMagic([u8; 4]),

    #[error("unsupported state version {found} (expected {STATE_VERSION})")]
    UnsupportedVersion { found: u16 },

    #[error("payload length mismatch: header says {expected}, found {actual}")]
    LengthMismatch { expected: u64, actual: u64 },

    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    Checksum { expected: u32, actual: u32 },

    #[error("cannot encode state: {0}")]
    Encode(String),

    #[error("cannot decode state: {0}")]
    Decode(String),
}

/// Frame `payload` with a header
pub fn encode<T: Serialize>(payload: &T) -> Result<Vec<u8>, FormatError> {
    let body = bincode::serialize(payload).map_err(|e| FormatError::Encode(e.to_string()))?;
    let header = StateHeader {
        magic: STATE_MAGIC,
        version: STATE_VERSION,
        payload_crc: crc32c(&body),
        payload_len: body.len() as u64,
    };
    let mut bytes = bincode::serialize(&header).map_err(|e| FormatError::Encode(e.to_string()))?;
    debug_assert_eq!(bytes.len(), HEADER_LEN);
    bytes.extend_from_slice(&body);
    Ok(bytes)
}

/// Validate the header and checksum, then decode the payload
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, FormatError> {
    if bytes.len() < HEADER_LEN {
        return Err(FormatError::Truncated(bytes.len()));
    }
    let (head, body) = bytes.split_at(HEADER_LEN);
    let header: StateHeader =
        bincode::deserialize(head).map_err(|e| FormatError::Decode(e.to_string()))?;

    if header.magic != STATE_MAGIC {
        return Err(FormatError::BadMagic(header.magic));
    }
    if header.version != STATE_VERSION {
        return Err(FormatError::UnsupportedVersion {
            found: header.version,
        });
    }
    if header.payload_len != body.len() as u64 {
        return Err(FormatError::LengthMismatch {
            expected: header.payload_len,
            actual: body.len() as u64,
        });
    }
    let actual = crc32c(body);
    if actual != header.payload_crc {
        return Err(FormatError::Checksum {
            expected: header.payload_crc,
            actual,
        });
    }

    bincode::deserialize(body).map_err(|e| FormatError::Decode(e.to_string()))
}
