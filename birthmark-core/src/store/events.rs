//! Append-only event log for off-registry indexers.
//!
//! Events never carry coordinates: precise locations stay readable from the
//! store itself but are not broadcast.

use serde::{Deserialize, Serialize};

use crate::error::{RegistryError, Result};
use crate::hash::ImageHash;
use crate::record::CAMERA_ID_LEN;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum RegistryEvent {
    HashRecorded {
        image_hash: ImageHash,
        captured_at: u64,
        #[serde(with = "crate::record::hex_array")]
        camera_id: [u8; CAMERA_ID_LEN],
        has_geolocation: bool,
        sequence_marker: u64,
    },
    BatchRecorded {
        count: u64,
        sequence_marker: u64,
    },
}

impl RegistryEvent {
    pub fn sequence_marker(&self) -> u64 {
        match self {
            Self::HashRecorded {
                sequence_marker, ..
            }
            | Self::BatchRecorded {
                sequence_marker, ..
            } => *sequence_marker,
        }
    }

    /// Serialize the event to CBOR bytes.
    pub fn to_cbor(&self) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes)
            .map_err(|e| RegistryError::SerializationError(e.to_string()))?;
        Ok(bytes)
    }

    /// Deserialize an event from CBOR bytes.
    pub fn from_cbor(bytes: &[u8]) -> Result<Self> {
        ciborium::from_reader(bytes).map_err(|e| RegistryError::SerializationError(e.to_string()))
    }
}

/// An event with its position in the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggedEvent {
    pub log_index: u64,
    pub event: RegistryEvent,
}

/// Append-only list of emitted events, stored apart from the record table.
#[derive(Debug, Default)]
pub struct EventLog {
    entries: Vec<LoggedEvent>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn append(&mut self, event: RegistryEvent) -> u64 {
        let log_index = self.entries.len() as u64;
        self.entries.push(LoggedEvent { log_index, event });
        log_index
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn all(&self) -> &[LoggedEvent] {
        &self.entries
    }

    /// Events at or after `cursor`, for incremental indexing.
    pub fn since(&self, cursor: u64) -> &[LoggedEvent] {
        let start = usize::try_from(cursor)
            .unwrap_or(usize::MAX)
            .min(self.entries.len());
        &self.entries[start..]
    }
}
