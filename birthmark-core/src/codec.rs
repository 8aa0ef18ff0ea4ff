//! Record codec.
//!
//! Converts [`CaptureRecord`]s to and from the fixed-width representation
//! ledgers store. Encoding is deterministic and lossy in two documented ways:
//!
//! - camera identifiers longer than 32 bytes are truncated (at a UTF-8
//!   character boundary), shorter ones are zero padded
//! - coordinates are scaled to integer microdegrees with round-half-away-from-zero,
//!   so decoding may differ from the input by less than one microdegree
//!
//! Capture timestamps are stored as whole Unix seconds.
//!
//! Two byte layouts are provided:
//!
//! | Layout | Size | Use |
//! |--------|------|-----|
//! | [`RegistryEntry::to_bytes`] | 193 bytes | persisted value: six 32-byte words + flag byte |
//! | [`EncodedRecord::to_packed`] | 89 bytes | compact instruction payload |

use chrono::{DateTime, Utc};

use crate::error::{RegistryError, Result};
use crate::hash::{ImageHash, IMAGE_HASH_LEN};
use crate::record::{
    CaptureRecord, EncodedRecord, Geolocation, RegistryEntry, Verification, VerifiedRecord,
    CAMERA_ID_LEN,
};

/// Fixed-point scale for coordinates (microdegrees).
pub const GEO_SCALE: f64 = 1_000_000.0;

/// Size of one big-endian word in the persisted layout.
pub const WORD_LEN: usize = 32;

/// Size of a persisted [`RegistryEntry`].
pub const STORED_RECORD_LEN: usize = 6 * WORD_LEN + 1;

/// Size of a packed [`EncodedRecord`].
pub const PACKED_RECORD_LEN: usize = IMAGE_HASH_LEN + 8 + CAMERA_ID_LEN + 8 + 8 + 1;

const MAX_LATITUDE_MICRO: i64 = 90_000_000;
const MAX_LONGITUDE_MICRO: i64 = 180_000_000;

/// Encode an application record into its fixed-width form.
pub fn encode(record: &CaptureRecord) -> Result<EncodedRecord> {
    let captured_at = u64::try_from(record.captured_at.timestamp()).map_err(|_| {
        RegistryError::InvalidInput(format!(
            "Capture timestamp {} precedes the Unix epoch",
            record.captured_at
        ))
    })?;

    let (latitude, longitude, has_geolocation) = match record.geolocation {
        Some(geo) => (
            to_microdegrees(geo.latitude, 90.0, "latitude")?,
            to_microdegrees(geo.longitude, 180.0, "longitude")?,
            true,
        ),
        None => (0, 0, false),
    };

    Ok(EncodedRecord {
        image_hash: record.image_hash,
        captured_at,
        camera_id: encode_camera_id(&record.camera_id),
        latitude,
        longitude,
        has_geolocation,
    })
}

/// Decode a fixed-width record back into application form.
///
/// Coordinates are ignored when `has_geolocation` is false.
pub fn decode(record: &EncodedRecord) -> Result<CaptureRecord> {
    let secs = i64::try_from(record.captured_at)
        .map_err(|_| RegistryError::decode("Capture timestamp out of range"))?;
    let captured_at: DateTime<Utc> = DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| RegistryError::decode("Capture timestamp out of range"))?;

    let geolocation = if record.has_geolocation {
        check_micro_range(record.latitude, MAX_LATITUDE_MICRO, "latitude")?;
        check_micro_range(record.longitude, MAX_LONGITUDE_MICRO, "longitude")?;
        Some(Geolocation {
            latitude: from_microdegrees(record.latitude),
            longitude: from_microdegrees(record.longitude),
        })
    } else {
        None
    };

    Ok(CaptureRecord {
        image_hash: record.image_hash,
        captured_at,
        camera_id: decode_camera_id(&record.camera_id)?,
        geolocation,
    })
}

/// Decode a found lookup, keeping its commit details.
///
/// `None` when the hash was not found.
pub fn decode_verification(verification: Verification, network: &str) -> Result<Option<VerifiedRecord>> {
    let Verification { found, entry, tx_id } = verification;
    if !found {
        return Ok(None);
    }
    Ok(Some(VerifiedRecord {
        record: decode(&entry.record)?,
        sequence_marker: entry.sequence_marker,
        tx_id,
        network: network.to_string(),
    }))
}

/// Truncate or zero-pad a camera identifier to exactly 32 bytes.
pub fn encode_camera_id(camera_id: &str) -> [u8; CAMERA_ID_LEN] {
    let mut end = camera_id.len().min(CAMERA_ID_LEN);
    while !camera_id.is_char_boundary(end) {
        end -= 1;
    }

    let mut out = [0u8; CAMERA_ID_LEN];
    out[..end].copy_from_slice(&camera_id.as_bytes()[..end]);
    out
}

/// Strip zero padding and validate UTF-8.
pub fn decode_camera_id(bytes: &[u8; CAMERA_ID_LEN]) -> Result<String> {
    let end = bytes
        .iter()
        .rposition(|&b| b != 0)
        .map(|i| i + 1)
        .unwrap_or(0);
    String::from_utf8(bytes[..end].to_vec())
        .map_err(|e| RegistryError::decode(format!("Camera id is not valid UTF-8: {e}")))
}

/// Scale decimal degrees to microdegrees, rounding half away from zero.
pub fn to_microdegrees(degrees: f64, bound: f64, axis: &str) -> Result<i64> {
    if !degrees.is_finite() || degrees.abs() > bound {
        return Err(RegistryError::InvalidInput(format!(
            "{axis} {degrees} outside [-{bound}, {bound}]"
        )));
    }
    Ok((degrees * GEO_SCALE).round() as i64)
}

pub fn from_microdegrees(micro: i64) -> f64 {
    micro as f64 / GEO_SCALE
}

fn check_micro_range(value: i64, bound: i64, axis: &str) -> Result<()> {
    if value.unsigned_abs() > bound.unsigned_abs() {
        return Err(RegistryError::decode(format!(
            "Stored {axis} {value} out of range"
        )));
    }
    Ok(())
}

// =============================================================================
// Word helpers (big-endian, 32 bytes, two's complement for signed values)
// =============================================================================

pub(crate) fn word_u64(value: u64) -> [u8; WORD_LEN] {
    let mut word = [0u8; WORD_LEN];
    word[WORD_LEN - 8..].copy_from_slice(&value.to_be_bytes());
    word
}

pub(crate) fn word_i64(value: i64) -> [u8; WORD_LEN] {
    let fill = if value < 0 { 0xff } else { 0x00 };
    let mut word = [fill; WORD_LEN];
    word[WORD_LEN - 8..].copy_from_slice(&value.to_be_bytes());
    word
}

pub(crate) fn word_bool(value: bool) -> [u8; WORD_LEN] {
    word_u64(value as u64)
}

pub(crate) fn read_word_u64(word: &[u8]) -> Result<u64> {
    let (prefix, tail) = split_word(word)?;
    if prefix.iter().any(|&b| b != 0) {
        return Err(RegistryError::decode(
            "Unsigned word exceeds 64 bits",
        ));
    }
    Ok(u64::from_be_bytes(tail))
}

pub(crate) fn read_word_i64(word: &[u8]) -> Result<i64> {
    let (prefix, tail) = split_word(word)?;
    let value = i64::from_be_bytes(tail);
    let fill = if value < 0 { 0xff } else { 0x00 };
    if prefix.iter().any(|&b| b != fill) {
        return Err(RegistryError::decode(
            "Signed word exceeds 64 bits",
        ));
    }
    Ok(value)
}

pub(crate) fn read_word_bool(word: &[u8]) -> Result<bool> {
    match read_word_u64(word)? {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(RegistryError::decode(format!(
            "Invalid boolean word: {other}"
        ))),
    }
}

fn split_word(word: &[u8]) -> Result<(&[u8], [u8; 8])> {
    if word.len() != WORD_LEN {
        return Err(RegistryError::decode(format!(
            "Expected {WORD_LEN}-byte word, got {}",
            word.len()
        )));
    }
    let mut tail = [0u8; 8];
    tail.copy_from_slice(&word[WORD_LEN - 8..]);
    Ok((&word[..WORD_LEN - 8], tail))
}

fn read_flag(byte: u8) -> Result<bool> {
    match byte {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(RegistryError::decode(format!(
            "Invalid geolocation flag byte: {other}"
        ))),
    }
}

fn check_geolocation_invariant(record: &EncodedRecord) -> Result<()> {
    if !record.has_geolocation && (record.latitude != 0 || record.longitude != 0) {
        return Err(RegistryError::decode(
            "Coordinates present without geolocation flag",
        ));
    }
    Ok(())
}

impl RegistryEntry {
    /// Serialize to the 193-byte persisted layout.
    pub fn to_bytes(&self) -> [u8; STORED_RECORD_LEN] {
        let r = &self.record;
        let mut out = [0u8; STORED_RECORD_LEN];
        out[0..32].copy_from_slice(r.image_hash.as_bytes());
        out[32..64].copy_from_slice(&word_u64(r.captured_at));
        out[64..96].copy_from_slice(&r.camera_id);
        out[96..128].copy_from_slice(&word_i64(r.latitude));
        out[128..160].copy_from_slice(&word_i64(r.longitude));
        out[160..192].copy_from_slice(&word_u64(self.sequence_marker));
        out[192] = r.has_geolocation as u8;
        out
    }

    /// Parse the 193-byte persisted layout.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != STORED_RECORD_LEN {
            return Err(RegistryError::decode(format!(
                "Stored record must be {STORED_RECORD_LEN} bytes, got {}",
                bytes.len()
            )));
        }

        let mut camera_id = [0u8; CAMERA_ID_LEN];
        camera_id.copy_from_slice(&bytes[64..96]);

        let record = EncodedRecord {
            image_hash: ImageHash::from_slice(&bytes[0..32])?,
            captured_at: read_word_u64(&bytes[32..64])?,
            camera_id,
            latitude: read_word_i64(&bytes[96..128])?,
            longitude: read_word_i64(&bytes[128..160])?,
            has_geolocation: read_flag(bytes[192])?,
        };
        check_geolocation_invariant(&record)?;

        Ok(Self {
            record,
            sequence_marker: read_word_u64(&bytes[160..192])?,
        })
    }
}

impl EncodedRecord {
    /// Serialize to the 89-byte packed layout.
    pub fn to_packed(&self) -> [u8; PACKED_RECORD_LEN] {
        let mut out = [0u8; PACKED_RECORD_LEN];
        out[0..32].copy_from_slice(self.image_hash.as_bytes());
        out[32..40].copy_from_slice(&self.captured_at.to_be_bytes());
        out[40..72].copy_from_slice(&self.camera_id);
        out[72..80].copy_from_slice(&self.latitude.to_be_bytes());
        out[80..88].copy_from_slice(&self.longitude.to_be_bytes());
        out[88] = self.has_geolocation as u8;
        out
    }

    /// Parse the 89-byte packed layout.
    pub fn from_packed(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != PACKED_RECORD_LEN {
            return Err(RegistryError::decode(format!(
                "Packed record must be {PACKED_RECORD_LEN} bytes, got {}",
                bytes.len()
            )));
        }

        let mut camera_id = [0u8; CAMERA_ID_LEN];
        camera_id.copy_from_slice(&bytes[40..72]);

        let record = Self {
            image_hash: ImageHash::from_slice(&bytes[0..32])?,
            captured_at: u64::from_be_bytes(fixed(&bytes[32..40])),
            camera_id,
            latitude: i64::from_be_bytes(fixed(&bytes[72..80])),
            longitude: i64::from_be_bytes(fixed(&bytes[80..88])),
            has_geolocation: read_flag(bytes[88])?,
        };
        check_geolocation_invariant(&record)?;
        Ok(record)
    }
}

fn fixed(slice: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(slice);
    out
}

// =============================================================================
// Columnar batches
// =============================================================================

/// Arrays-of-fields form of a batch, as taken by ledger batch entry points.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchColumns {
    pub image_hashes: Vec<ImageHash>,
    pub captured_at: Vec<u64>,
    pub camera_ids: Vec<[u8; CAMERA_ID_LEN]>,
    pub latitudes: Vec<i64>,
    pub longitudes: Vec<i64>,
    pub has_geolocation: Vec<bool>,
}

impl BatchColumns {
    pub fn from_records(records: &[EncodedRecord]) -> Self {
        let mut columns = Self::default();
        for r in records {
            columns.image_hashes.push(r.image_hash);
            columns.captured_at.push(r.captured_at);
            columns.camera_ids.push(r.camera_id);
            columns.latitudes.push(r.latitude);
            columns.longitudes.push(r.longitude);
            columns.has_geolocation.push(r.has_geolocation);
        }
        columns
    }

    pub fn len(&self) -> usize {
        self.image_hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.image_hashes.is_empty()
    }

    /// Zip the columns back into records, failing if any column length differs.
    pub fn into_records(self) -> Result<Vec<EncodedRecord>> {
        let expected = self.image_hashes.len();
        for (field, actual) in [
            ("captured_at", self.captured_at.len()),
            ("camera_ids", self.camera_ids.len()),
            ("latitudes", self.latitudes.len()),
            ("longitudes", self.longitudes.len()),
            ("has_geolocation", self.has_geolocation.len()),
        ] {
            if actual != expected {
                return Err(RegistryError::LengthMismatch {
                    field,
                    expected,
                    actual,
                });
            }
        }

        Ok(self
            .image_hashes
            .into_iter()
            .zip(self.captured_at)
            .zip(self.camera_ids)
            .zip(self.latitudes)
            .zip(self.longitudes)
            .zip(self.has_geolocation)
            .map(
                |(((((image_hash, captured_at), camera_id), latitude), longitude), has_geolocation)| {
                    EncodedRecord {
                        image_hash,
                        captured_at,
                        camera_id,
                        latitude,
                        longitude,
                        has_geolocation,
                    }
                },
            )
            .collect())
    }
}
