//! The binary form of a compiled tiling case, as read back by the runtime.
//!
//! Layout: `MAGIC | version: u8 | adler32(payload): u32 LE | payload`, where
//! the payload is the bincode encoding of a [TilingCaseKey].

use serde::{Deserialize, Serialize};

use crate::case::TilingCase;

pub const MAGIC: [u8; 4] = *b"ATCK";
pub const FORMAT_VERSION: u8 = 1;
const HEADER_LEN: usize = MAGIC.len() + 1 + 4;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TilingCaseKey {
    pub tiling_key: u64,
    pub case: TilingCase,
}

#[derive(thiserror::Error, Debug)]
pub enum EncodeError {
    #[error("Failed to serialize tiling case: {0}")]
    Payload(#[from] bincode::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum DecodeError {
    #[error("Encoded case is {0} bytes; shorter than its header")]
    Truncated(usize),
    #[error("Bad magic bytes")]
    BadMagic,
    #[error("Unsupported format version {0}")]
    UnsupportedVersion(u8),
    #[error("Checksum mismatch: header says {expected:#010x}, payload hashes to {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },
    #[error("Failed to deserialize tiling case: {0}")]
    Payload(#[from] bincode::Error),
    #[error("Stored key {stored} does not match the case's key {computed}")]
    KeyMismatch { stored: u64, computed: u64 },
}

impl From<TilingCase> for TilingCaseKey {
    fn from(case: TilingCase) -> Self {
        TilingCaseKey {
            tiling_key: case.tiling_key(),
            case,
        }
    }
}

pub fn encode(case: &TilingCase) -> Result<Vec<u8>, EncodeError> {
    let key = TilingCaseKey::from(case.clone());
    let payload = bincode::serialize(&key)?;
    let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
    bytes.extend_from_slice(&MAGIC);
    bytes.push(FORMAT_VERSION);
    bytes.extend_from_slice(&adler::adler32_slice(&payload).to_le_bytes());
    bytes.extend_from_slice(&payload);
    Ok(bytes)
}

pub fn decode(bytes: &[u8]) -> Result<TilingCaseKey, DecodeError> {
    if bytes.len() < HEADER_LEN {
        return Err(DecodeError::Truncated(bytes.len()));
    }
    let (header, payload) = bytes.split_at(HEADER_LEN);
    if header[..MAGIC.len()] != MAGIC {
        return Err(DecodeError::BadMagic);
    }
    let version = header[MAGIC.len()];
    if version != FORMAT_VERSION {
        return Err(DecodeError::UnsupportedVersion(version));
    }
    let mut checksum = [0; 4];
    checksum.copy_from_slice(&header[MAGIC.len() + 1..]);
    let expected = u32::from_le_bytes(checksum);
    let actual = adler::adler32_slice(payload);
    if expected != actual {
        return Err(DecodeError::ChecksumMismatch { expected, actual });
    }
    let key: TilingCaseKey = bincode::deserialize(payload)?;
    let computed = key.case.tiling_key();
    if key.tiling_key != computed {
        return Err(DecodeError::KeyMismatch {
            stored: key.tiling_key,
            computed,
        });
    }
    Ok(key)
}
