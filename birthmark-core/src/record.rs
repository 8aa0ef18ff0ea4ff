//! Registry record types.
//!
//! A record exists in three shapes:
//! - [`CaptureRecord`] - what the capture pipeline hands over
//! - [`EncodedRecord`] - the fixed-width form a ledger stores
//! - [`RegistryEntry`] - an encoded record plus its ledger-assigned sequence marker

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backend::TxId;
use crate::hash::ImageHash;

/// Width of the on-ledger camera identifier field.
pub const CAMERA_ID_LEN: usize = 32;

/// GPS coordinates in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Geolocation {
    pub latitude: f64,
    pub longitude: f64,
}

impl Geolocation {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

/// Application-level record supplied by the capture pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureRecord {
    /// SHA-256 of the raw image data
    pub image_hash: ImageHash,
    /// When the image was captured (caller clock, not ledger time)
    pub captured_at: DateTime<Utc>,
    /// Camera identifier, possibly pseudonymous
    pub camera_id: String,
    /// Optional capture location
    pub geolocation: Option<Geolocation>,
}

impl CaptureRecord {
    pub fn new(
        image_hash: ImageHash,
        captured_at: DateTime<Utc>,
        camera_id: impl Into<String>,
    ) -> Self {
        Self {
            image_hash,
            captured_at,
            camera_id: camera_id.into(),
            geolocation: None,
        }
    }

    pub fn with_geolocation(mut self, latitude: f64, longitude: f64) -> Self {
        self.geolocation = Some(Geolocation::new(latitude, longitude));
        self
    }
}

/// Fixed-width record as stored on a ledger.
///
/// Latitude and longitude are microdegrees; both are zero whenever
/// `has_geolocation` is false.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EncodedRecord {
    pub image_hash: ImageHash,
    /// Unix seconds
    pub captured_at: u64,
    #[serde(with = "hex_array")]
    pub camera_id: [u8; CAMERA_ID_LEN],
    pub latitude: i64,
    pub longitude: i64,
    pub has_geolocation: bool,
}

/// A committed record together with its commit position.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub record: EncodedRecord,
    /// Block height or slot at which the record was committed
    pub sequence_marker: u64,
}

/// Result of a lookup.
///
/// A missing hash is an expected outcome: `found` is false and `entry`
/// holds canonical zero values.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Verification {
    pub found: bool,
    pub entry: RegistryEntry,
    /// Transaction that committed the entry, when the ledger can say
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_id: Option<TxId>,
}

impl Verification {
    pub fn found(entry: RegistryEntry) -> Self {
        Self {
            found: true,
            entry,
            tx_id: None,
        }
    }

    /// Attach the committing transaction. Ignored for a missing hash.
    pub fn with_tx_id(mut self, tx_id: Option<TxId>) -> Self {
        if self.found {
            self.tx_id = tx_id;
        }
        self
    }

    pub fn not_found() -> Self {
        Self::default()
    }

    /// The stored entry, if the hash was recorded.
    pub fn entry(&self) -> Option<&RegistryEntry> {
        self.found.then_some(&self.entry)
    }

    pub fn into_entry(self) -> Option<RegistryEntry> {
        self.found.then_some(self.entry)
    }
}

/// A decoded record with where and when it was committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifiedRecord {
    pub record: CaptureRecord,
    pub sequence_marker: u64,
    /// Committing transaction, when the ledger can say
    pub tx_id: Option<TxId>,
    /// Network label of the ledger that answered
    pub network: String,
}

/// Registry introspection counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RegistryStats {
    pub total_count: u64,
    pub commit_position: u64,
    /// Committed write transactions; a batch counts once. `None` where the
    /// ledger does not track it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_transactions: Option<u64>,
}

pub(crate) mod hex_array {
    use serde::{Deserialize, Deserializer, Serializer};

    use super::CAMERA_ID_LEN;

    pub fn serialize<S: Serializer>(bytes: &[u8; CAMERA_ID_LEN], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; CAMERA_ID_LEN], D::Error> {
        let s = String::deserialize(d)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|v: Vec<u8>| serde::de::Error::invalid_length(v.len(), &"32 bytes"))
    }
}
