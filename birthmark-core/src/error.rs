use std::time::Duration;

use thiserror::Error;

use crate::backend::BackendKind;
use crate::hash::ImageHash;

/// Default ceiling on records per batch.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 100;

/// Default tolerance for capture timestamps ahead of ledger time (seconds).
pub const DEFAULT_FUTURE_TOLERANCE_SECS: u64 = 300;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Duplicate hash: {image_hash} is already recorded{}", fmt_index(.index))]
    DuplicateHash {
        image_hash: ImageHash,
        index: Option<usize>,
    },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid hash length: expected 32 bytes, got {0}")]
    InvalidHashLength(usize),

    #[error("Batch column length mismatch: expected {expected}, `{field}` has {actual}")]
    LengthMismatch {
        field: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Batch too large: {size} records exceeds maximum of {max}")]
    BatchTooLarge { size: usize, max: usize },

    #[error("Capture timestamp {captured_at} is beyond allowed {max_allowed}{}", fmt_index(.index))]
    FutureTimestamp {
        captured_at: u64,
        max_allowed: u64,
        index: Option<usize>,
    },

    #[error("Transaction {} for {image_hash} not confirmed on {backend} within {waited:?}", .tx_id.as_deref().unwrap_or("<unsent>"))]
    TransactionTimeout {
        backend: BackendKind,
        image_hash: ImageHash,
        tx_id: Option<String>,
        waited: Duration,
    },

    #[error("Backend {backend} unavailable{}: {reason}", fmt_hash(.image_hash))]
    BackendUnavailable {
        backend: BackendKind,
        reason: String,
        image_hash: Option<ImageHash>,
    },

    #[error("Rejected by {backend}{}: {reason}", fmt_hash(.image_hash))]
    Rejected {
        backend: BackendKind,
        reason: String,
        image_hash: Option<ImageHash>,
    },

    #[error("Decode error{}{}: {reason}", fmt_backend(.backend), fmt_hash(.image_hash))]
    DecodeError {
        reason: String,
        backend: Option<BackendKind>,
        image_hash: Option<ImageHash>,
    },

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

fn fmt_index(index: &Option<usize>) -> String {
    index.map(|i| format!(" (batch index {i})")).unwrap_or_default()
}

fn fmt_hash(image_hash: &Option<ImageHash>) -> String {
    image_hash.map(|h| format!(" for {h}")).unwrap_or_default()
}

fn fmt_backend(backend: &Option<BackendKind>) -> String {
    backend.map(|b| format!(" from {b}")).unwrap_or_default()
}

/// Coarse error taxonomy shared by every backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    DuplicateHash,
    InvalidInput,
    FutureTimestamp,
    TransactionTimeout,
    BackendUnavailable,
    DecodeError,
    Rejected,
}

impl RegistryError {
    pub(crate) fn unavailable(backend: BackendKind, reason: impl Into<String>) -> Self {
        Self::BackendUnavailable {
            backend,
            reason: reason.into(),
            image_hash: None,
        }
    }

    pub(crate) fn rejected(backend: BackendKind, reason: impl Into<String>) -> Self {
        Self::Rejected {
            backend,
            reason: reason.into(),
            image_hash: None,
        }
    }

    pub(crate) fn decode(reason: impl Into<String>) -> Self {
        Self::DecodeError {
            reason: reason.into(),
            backend: None,
            image_hash: None,
        }
    }

    /// Fill in the backend and hash an error concerns, where the variant
    /// carries them and they are not already set.
    pub(crate) fn concerning(mut self, kind: BackendKind, hash: Option<ImageHash>) -> Self {
        match &mut self {
            Self::BackendUnavailable { image_hash, .. } | Self::Rejected { image_hash, .. } => {
                if image_hash.is_none() {
                    *image_hash = hash;
                }
            }
            Self::DecodeError {
                backend,
                image_hash,
                ..
            } => {
                backend.get_or_insert(kind);
                if image_hash.is_none() {
                    *image_hash = hash;
                }
            }
            _ => {}
        }
        self
    }

    /// The image hash the error concerns, when known.
    pub fn image_hash(&self) -> Option<&ImageHash> {
        match self {
            Self::DuplicateHash { image_hash, .. } | Self::TransactionTimeout { image_hash, .. } => {
                Some(image_hash)
            }
            Self::BackendUnavailable { image_hash, .. }
            | Self::Rejected { image_hash, .. }
            | Self::DecodeError { image_hash, .. } => image_hash.as_ref(),
            _ => None,
        }
    }

    /// Collapse the variant into the shared taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::DuplicateHash { .. } => ErrorKind::DuplicateHash,
            Self::InvalidInput(_)
            | Self::InvalidHashLength(_)
            | Self::LengthMismatch { .. }
            | Self::BatchTooLarge { .. } => ErrorKind::InvalidInput,
            Self::FutureTimestamp { .. } => ErrorKind::FutureTimestamp,
            Self::TransactionTimeout { .. } => ErrorKind::TransactionTimeout,
            Self::BackendUnavailable { .. } => ErrorKind::BackendUnavailable,
            Self::Rejected { .. } => ErrorKind::Rejected,
            Self::DecodeError { .. } | Self::SerializationError(_) => ErrorKind::DecodeError,
        }
    }

    /// Only connectivity failures are safe to retry blindly.
    ///
    /// A timed-out write may already be committed; callers must verify by
    /// hash before submitting it again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::BackendUnavailable { .. })
    }

    /// Stable identifier for programmatic handling.
    pub fn code(&self) -> &'static str {
        match self {
            Self::DuplicateHash { .. } => "DUPLICATE_HASH",
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::InvalidHashLength(_) => "INVALID_HASH_LENGTH",
            Self::LengthMismatch { .. } => "LENGTH_MISMATCH",
            Self::BatchTooLarge { .. } => "BATCH_TOO_LARGE",
            Self::FutureTimestamp { .. } => "FUTURE_TIMESTAMP",
            Self::TransactionTimeout { .. } => "TRANSACTION_TIMEOUT",
            Self::BackendUnavailable { .. } => "BACKEND_UNAVAILABLE",
            Self::Rejected { .. } => "REJECTED",
            Self::DecodeError { .. } => "DECODE_ERROR",
            Self::SerializationError(_) => "SERIALIZATION_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, RegistryError>;
