//! Image content digests.
//!
//! The registry keys every record by a SHA-256 digest of the raw image data,
//! computed by the capture pipeline before any in-camera processing.

use std::fmt;
use std::io::Read;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::error::{RegistryError, Result};

/// Length of an image digest in bytes.
pub const IMAGE_HASH_LEN: usize = 32;

/// Chunk size used when hashing from a reader.
const READ_CHUNK_SIZE: usize = 8192;

/// A 32-byte image content digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ImageHash([u8; IMAGE_HASH_LEN]);

impl ImageHash {
    /// All-zero digest, used as the canonical "not found" value.
    pub const ZERO: Self = Self([0u8; IMAGE_HASH_LEN]);

    pub const fn new(bytes: [u8; IMAGE_HASH_LEN]) -> Self {
        Self(bytes)
    }

    /// Build from a byte slice, rejecting anything that is not 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let array: [u8; IMAGE_HASH_LEN] = bytes
            .try_into()
            .map_err(|_| RegistryError::InvalidHashLength(bytes.len()))?;
        Ok(Self(array))
    }

    /// Parse a hex digest, with or without a `0x` prefix.
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        let trimmed = hex_str.trim();
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);
        let bytes = hex::decode(digits)
            .map_err(|e| RegistryError::InvalidInput(format!("Invalid hex digest: {e}")))?;
        Self::from_slice(&bytes)
    }

    /// SHA-256 of in-memory image data.
    pub fn digest(data: &[u8]) -> Self {
        let result = Sha256::digest(data);
        let mut bytes = [0u8; IMAGE_HASH_LEN];
        bytes.copy_from_slice(&result);
        Self(bytes)
    }

    /// SHA-256 of a stream, read in fixed-size chunks.
    ///
    /// Large RAW files never need to be held in memory at once.
    pub fn digest_reader<R: Read>(mut reader: R) -> Result<Self> {
        let mut hasher = Sha256::new();
        let mut buffer = [0u8; READ_CHUNK_SIZE];
        loop {
            let read = reader
                .read(&mut buffer)
                .map_err(|e| RegistryError::InvalidInput(format!("Failed to read image data: {e}")))?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
        }
        let mut bytes = [0u8; IMAGE_HASH_LEN];
        bytes.copy_from_slice(&hasher.finalize());
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; IMAGE_HASH_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; IMAGE_HASH_LEN]
    }
}

impl From<[u8; IMAGE_HASH_LEN]> for ImageHash {
    fn from(bytes: [u8; IMAGE_HASH_LEN]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for ImageHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for ImageHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for ImageHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ImageHash({})", self.to_hex())
    }
}

impl FromStr for ImageHash {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl Serialize for ImageHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ImageHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}
