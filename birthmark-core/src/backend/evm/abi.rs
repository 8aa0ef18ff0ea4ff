//! Registry contract ABI.
//!
//! Hand-encoded: every argument is either a static 32-byte word or a dynamic
//! array of static words, so the head/tail layout stays small.

use sha3::{Digest, Keccak256};

use crate::codec::{
    read_word_bool, read_word_i64, read_word_u64, word_bool, word_i64, word_u64, BatchColumns,
    WORD_LEN,
};
use crate::error::{RegistryError, Result};
use crate::hash::ImageHash;
use crate::record::{EncodedRecord, RegistryEntry, RegistryStats, Verification, CAMERA_ID_LEN};
use crate::store::RegistryEvent;

pub const RECORD_HASH: &str = "recordHash(bytes32,uint256,bytes32,int256,int256,bool)";
pub const BATCH_RECORD_HASHES: &str =
    "batchRecordHashes(bytes32[],uint256[],bytes32[],int256[],int256[],bool[])";
pub const VERIFY_HASH: &str = "verifyHash(bytes32)";
pub const BATCH_VERIFY_EXISTENCE: &str = "batchVerifyExistence(bytes32[])";
pub const GET_STATS: &str = "getStats()";

pub const HASH_RECORDED_EVENT: &str = "HashRecorded(bytes32,uint256,bytes32,bool,uint256)";
pub const BATCH_RECORDED_EVENT: &str = "BatchRecorded(uint256,uint256)";

const HASH_ALREADY_RECORDED: &str = "HashAlreadyRecorded(bytes32)";
const BATCH_DUPLICATE_HASH: &str = "BatchDuplicateHash(uint256,bytes32)";
const FUTURE_TIMESTAMP: &str = "FutureTimestamp(uint256,uint256)";
const BATCH_TOO_LARGE: &str = "BatchTooLarge(uint256,uint256)";
const LENGTH_MISMATCH: &str = "LengthMismatch()";
const ERROR_STRING: &str = "Error(string)";

/// First four bytes of the Keccak-256 of a function or error signature.
pub fn selector(signature: &str) -> [u8; 4] {
    let digest = keccak256(signature.as_bytes());
    [digest[0], digest[1], digest[2], digest[3]]
}

/// Topic 0 of an event.
pub fn event_topic(signature: &str) -> [u8; 32] {
    keccak256(signature.as_bytes())
}

pub(crate) fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Keccak256::digest(data));
    out
}

// =============================================================================
// Calldata
// =============================================================================

pub fn encode_record_hash(record: &EncodedRecord) -> Vec<u8> {
    let mut data = Vec::with_capacity(4 + 6 * WORD_LEN);
    data.extend_from_slice(&selector(RECORD_HASH));
    data.extend_from_slice(record.image_hash.as_bytes());
    data.extend_from_slice(&word_u64(record.captured_at));
    data.extend_from_slice(&record.camera_id);
    data.extend_from_slice(&word_i64(record.latitude));
    data.extend_from_slice(&word_i64(record.longitude));
    data.extend_from_slice(&word_bool(record.has_geolocation));
    data
}

pub fn encode_batch_record_hashes(columns: &BatchColumns) -> Vec<u8> {
    let arrays: [Vec<[u8; WORD_LEN]>; 6] = [
        columns.image_hashes.iter().map(|h| *h.as_bytes()).collect(),
        columns.captured_at.iter().map(|&t| word_u64(t)).collect(),
        columns.camera_ids.clone(),
        columns.latitudes.iter().map(|&v| word_i64(v)).collect(),
        columns.longitudes.iter().map(|&v| word_i64(v)).collect(),
        columns.has_geolocation.iter().map(|&b| word_bool(b)).collect(),
    ];
    encode_call_with_arrays(BATCH_RECORD_HASHES, &arrays)
}

pub fn encode_verify_hash(image_hash: &ImageHash) -> Vec<u8> {
    let mut data = selector(VERIFY_HASH).to_vec();
    data.extend_from_slice(image_hash.as_bytes());
    data
}

pub fn encode_batch_verify_existence(image_hashes: &[ImageHash]) -> Vec<u8> {
    let words: Vec<[u8; WORD_LEN]> = image_hashes.iter().map(|h| *h.as_bytes()).collect();
    encode_call_with_arrays(BATCH_VERIFY_EXISTENCE, &[words])
}

pub fn encode_get_stats() -> Vec<u8> {
    selector(GET_STATS).to_vec()
}

/// Selector, then one offset per array, then each array as length + elements.
fn encode_call_with_arrays(signature: &str, arrays: &[Vec<[u8; WORD_LEN]>]) -> Vec<u8> {
    let mut head = Vec::with_capacity(arrays.len() * WORD_LEN);
    let mut tail = Vec::new();
    let head_len = arrays.len() * WORD_LEN;

    for array in arrays {
        head.extend_from_slice(&word_u64((head_len + tail.len()) as u64));
        tail.extend_from_slice(&word_u64(array.len() as u64));
        for word in array {
            tail.extend_from_slice(word);
        }
    }

    let mut data = selector(signature).to_vec();
    data.extend_from_slice(&head);
    data.extend_from_slice(&tail);
    data
}

// =============================================================================
// Return data
// =============================================================================

/// Decode `verifyHash` output:
/// `(exists, capturedAt, cameraId, latitude, longitude, hasGeolocation, blockNumber)`.
pub fn decode_verify_hash(image_hash: &ImageHash, data: &[u8]) -> Result<Verification> {
    let words = words(data, 7)?;
    if !read_word_bool(words[0])? {
        return Ok(Verification::not_found());
    }

    let mut camera_id = [0u8; CAMERA_ID_LEN];
    camera_id.copy_from_slice(words[2]);
    let record = EncodedRecord {
        image_hash: *image_hash,
        captured_at: read_word_u64(words[1])?,
        camera_id,
        latitude: read_word_i64(words[3])?,
        longitude: read_word_i64(words[4])?,
        has_geolocation: read_word_bool(words[5])?,
    };
    if !record.has_geolocation && (record.latitude != 0 || record.longitude != 0) {
        return Err(RegistryError::decode(
            "Contract returned coordinates without geolocation flag",
        ));
    }

    Ok(Verification::found(RegistryEntry {
        record,
        sequence_marker: read_word_u64(words[6])?,
    }))
}

/// Decode a single dynamic `bool[]` return value.
pub fn decode_bool_array(data: &[u8]) -> Result<Vec<bool>> {
    let offset = to_usize(read_word_u64(word_at(data, 0)?)?)?;
    let len = to_usize(read_word_u64(word_at(data, offset)?)?)?;
    (0..len)
        .map(|i| {
            let start = offset + WORD_LEN * (i + 1);
            read_word_bool(word_at(data, start)?)
        })
        .collect()
}

/// Decode `getStats` output: `(totalCount, blockNumber)`.
pub fn decode_stats(data: &[u8]) -> Result<RegistryStats> {
    let words = words(data, 2)?;
    Ok(RegistryStats {
        total_count: read_word_u64(words[0])?,
        commit_position: read_word_u64(words[1])?,
        total_transactions: None,
    })
}

// =============================================================================
// Logs
// =============================================================================

/// Decode a registry log entry; logs from other events yield `None`.
pub fn decode_log(topics: &[[u8; 32]], data: &[u8]) -> Result<Option<RegistryEvent>> {
    let Some(topic0) = topics.first() else {
        return Ok(None);
    };

    if *topic0 == event_topic(HASH_RECORDED_EVENT) {
        let image_hash = topics
            .get(1)
            .map(|t| ImageHash::new(*t))
            .ok_or_else(|| RegistryError::decode("HashRecorded log missing hash topic"))?;
        let words = words(data, 4)?;
        let mut camera_id = [0u8; CAMERA_ID_LEN];
        camera_id.copy_from_slice(words[1]);
        return Ok(Some(RegistryEvent::HashRecorded {
            image_hash,
            captured_at: read_word_u64(words[0])?,
            camera_id,
            has_geolocation: read_word_bool(words[2])?,
            sequence_marker: read_word_u64(words[3])?,
        }));
    }

    if *topic0 == event_topic(BATCH_RECORDED_EVENT) {
        let words = words(data, 2)?;
        return Ok(Some(RegistryEvent::BatchRecorded {
            count: read_word_u64(words[0])?,
            sequence_marker: read_word_u64(words[1])?,
        }));
    }

    Ok(None)
}

// =============================================================================
// Reverts
// =============================================================================

/// A decoded contract revert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Revert {
    HashAlreadyRecorded(ImageHash),
    BatchDuplicateHash { index: u64, image_hash: ImageHash },
    FutureTimestamp { captured_at: u64, max_allowed: u64 },
    BatchTooLarge { size: u64, max: u64 },
    LengthMismatch,
    Message(String),
    Unknown(Vec<u8>),
}

impl Revert {
    pub fn decode(data: &[u8]) -> Self {
        if data.len() < 4 {
            return Self::Unknown(data.to_vec());
        }
        let (sel, args) = data.split_at(4);
        Self::decode_args(sel, args).unwrap_or_else(|| Self::Unknown(data.to_vec()))
    }

    fn decode_args(sel: &[u8], args: &[u8]) -> Option<Self> {
        let word = |i: usize| word_at(args, i * WORD_LEN).ok();
        let uint = |i: usize| word(i).and_then(|w| read_word_u64(w).ok());
        let hash = |i: usize| word(i).and_then(|w| ImageHash::from_slice(w).ok());

        if sel == selector(HASH_ALREADY_RECORDED) {
            Some(Self::HashAlreadyRecorded(hash(0)?))
        } else if sel == selector(BATCH_DUPLICATE_HASH) {
            Some(Self::BatchDuplicateHash {
                index: uint(0)?,
                image_hash: hash(1)?,
            })
        } else if sel == selector(FUTURE_TIMESTAMP) {
            Some(Self::FutureTimestamp {
                captured_at: uint(0)?,
                max_allowed: uint(1)?,
            })
        } else if sel == selector(BATCH_TOO_LARGE) {
            Some(Self::BatchTooLarge {
                size: uint(0)?,
                max: uint(1)?,
            })
        } else if sel == selector(LENGTH_MISMATCH) {
            Some(Self::LengthMismatch)
        } else if sel == selector(ERROR_STRING) {
            let offset = usize::try_from(uint(0)?).ok()?;
            let len = usize::try_from(read_word_u64(word_at(args, offset).ok()?).ok()?).ok()?;
            let start = offset.checked_add(WORD_LEN)?;
            let bytes = args.get(start..start.checked_add(len)?)?;
            Some(Self::Message(String::from_utf8_lossy(bytes).into_owned()))
        } else {
            None
        }
    }

    /// Map into the shared error taxonomy.
    pub fn into_error(self) -> RegistryError {
        use crate::backend::BackendKind;

        match self {
            Self::HashAlreadyRecorded(image_hash) => RegistryError::DuplicateHash {
                image_hash,
                index: None,
            },
            Self::BatchDuplicateHash { index, image_hash } => RegistryError::DuplicateHash {
                image_hash,
                index: usize::try_from(index).ok(),
            },
            Self::FutureTimestamp {
                captured_at,
                max_allowed,
            } => RegistryError::FutureTimestamp {
                captured_at,
                max_allowed,
                index: None,
            },
            Self::BatchTooLarge { size, max } => RegistryError::BatchTooLarge {
                size: usize::try_from(size).unwrap_or(usize::MAX),
                max: usize::try_from(max).unwrap_or(usize::MAX),
            },
            Self::LengthMismatch => {
                RegistryError::InvalidInput("Contract rejected batch: column lengths differ".into())
            }
            Self::Message(reason) => RegistryError::rejected(BackendKind::Evm, reason),
            Self::Unknown(data) => RegistryError::rejected(
                BackendKind::Evm,
                format!("execution reverted (0x{})", hex::encode(data)),
            ),
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn words(data: &[u8], count: usize) -> Result<Vec<&[u8]>> {
    if data.len() < count * WORD_LEN {
        return Err(RegistryError::decode(format!(
            "Expected {count} return words, got {} bytes",
            data.len()
        )));
    }
    Ok(data.chunks_exact(WORD_LEN).take(count).collect())
}

fn word_at(data: &[u8], offset: usize) -> Result<&[u8]> {
    offset
        .checked_add(WORD_LEN)
        .and_then(|end| data.get(offset..end))
        .ok_or_else(|| RegistryError::decode(format!("Return data truncated at {offset}")))
}

fn to_usize(value: u64) -> Result<usize> {
    usize::try_from(value).map_err(|_| RegistryError::decode("Offset out of range"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_camera_id;

    fn sample() -> EncodedRecord {
        EncodedRecord {
            image_hash: ImageHash::digest(b"abi"),
            captured_at: 1_732_000_000,
            camera_id: encode_camera_id("camera_001"),
            latitude: 45_523_100,
            longitude: -122_676_500,
            has_geolocation: true,
        }
    }

    #[test]
    fn test_known_selector() {
        // keccak256("transfer(address,uint256)")
        assert_eq!(hex::encode(selector("transfer(address,uint256)")), "a9059cbb");
        assert_eq!(hex::encode(selector(ERROR_STRING)), "08c379a0");
    }

    #[test]
    fn test_record_hash_calldata_layout() {
        let record = sample();
        let data = encode_record_hash(&record);
        assert_eq!(data.len(), 4 + 6 * 32);
        assert_eq!(&data[..4], &selector(RECORD_HASH));
        assert_eq!(&data[4..36], record.image_hash.as_bytes());
        // negative longitude is sign-extended
        assert!(data[4 + 4 * 32..4 + 4 * 32 + 24].iter().all(|&b| b == 0xff));
        assert_eq!(data[data.len() - 1], 1);
    }

    #[test]
    fn test_batch_calldata_offsets() {
        let records = vec![sample(), sample()];
        let data = encode_batch_record_hashes(&BatchColumns::from_records(&records));
        let args = &data[4..];

        // six arrays, each two elements: length word + two words
        assert_eq!(args.len(), 6 * 32 + 6 * 3 * 32);
        let first = read_word_u64(&args[..32]).unwrap();
        let second = read_word_u64(&args[32..64]).unwrap();
        assert_eq!(first, 192);
        assert_eq!(second, 192 + 96);
        assert_eq!(read_word_u64(&args[192..224]).unwrap(), 2);
    }

    #[test]
    fn test_decode_verify_hash_found_and_missing() {
        let record = sample();
        let mut data = Vec::new();
        data.extend_from_slice(&word_bool(true));
        data.extend_from_slice(&word_u64(record.captured_at));
        data.extend_from_slice(&record.camera_id);
        data.extend_from_slice(&word_i64(record.latitude));
        data.extend_from_slice(&word_i64(record.longitude));
        data.extend_from_slice(&word_bool(true));
        data.extend_from_slice(&word_u64(19_000_123));

        let verification = decode_verify_hash(&record.image_hash, &data).unwrap();
        assert!(verification.found);
        assert_eq!(verification.entry.record, record);
        assert_eq!(verification.entry.sequence_marker, 19_000_123);

        let missing = vec![0u8; 7 * 32];
        assert_eq!(
            decode_verify_hash(&record.image_hash, &missing).unwrap(),
            Verification::not_found()
        );
        assert!(decode_verify_hash(&record.image_hash, &missing[..64]).is_err());
    }

    #[test]
    fn test_decode_bool_array() {
        let mut data = Vec::new();
        data.extend_from_slice(&word_u64(32));
        data.extend_from_slice(&word_u64(2));
        data.extend_from_slice(&word_bool(true));
        data.extend_from_slice(&word_bool(false));
        assert_eq!(decode_bool_array(&data).unwrap(), vec![true, false]);

        assert!(decode_bool_array(&data[..96]).is_err());
    }

    #[test]
    fn test_decode_custom_reverts() {
        let hash = ImageHash::digest(b"dup");
        let mut data = selector(HASH_ALREADY_RECORDED).to_vec();
        data.extend_from_slice(hash.as_bytes());
        let err = Revert::decode(&data).into_error();
        assert!(matches!(err, RegistryError::DuplicateHash { image_hash, index: None } if image_hash == hash));

        let mut data = selector(BATCH_DUPLICATE_HASH).to_vec();
        data.extend_from_slice(&word_u64(5));
        data.extend_from_slice(hash.as_bytes());
        let err = Revert::decode(&data).into_error();
        assert!(matches!(err, RegistryError::DuplicateHash { index: Some(5), .. }));

        let mut data = selector(FUTURE_TIMESTAMP).to_vec();
        data.extend_from_slice(&word_u64(2_000));
        data.extend_from_slice(&word_u64(1_300));
        assert_eq!(
            Revert::decode(&data),
            Revert::FutureTimestamp {
                captured_at: 2_000,
                max_allowed: 1_300
            }
        );

        let mut data = selector(BATCH_TOO_LARGE).to_vec();
        data.extend_from_slice(&word_u64(101));
        data.extend_from_slice(&word_u64(100));
        assert!(matches!(
            Revert::decode(&data).into_error(),
            RegistryError::BatchTooLarge { size: 101, max: 100 }
        ));
    }

    #[test]
    fn test_decode_error_string_revert() {
        let message = b"Unauthorized submitter";
        let mut data = selector(ERROR_STRING).to_vec();
        data.extend_from_slice(&word_u64(32));
        data.extend_from_slice(&word_u64(message.len() as u64));
        let mut padded = message.to_vec();
        padded.resize(32, 0);
        data.extend_from_slice(&padded);

        assert_eq!(
            Revert::decode(&data),
            Revert::Message("Unauthorized submitter".into())
        );
        assert!(matches!(
            Revert::decode(&data).into_error(),
            RegistryError::Rejected { .. }
        ));
    }

    #[test]
    fn test_unknown_revert_is_rejected() {
        assert_eq!(Revert::decode(&[0xde, 0xad]), Revert::Unknown(vec![0xde, 0xad]));
        let truncated = selector(HASH_ALREADY_RECORDED).to_vec();
        assert!(matches!(Revert::decode(&truncated), Revert::Unknown(_)));
    }

    #[test]
    fn test_decode_hash_recorded_log() {
        let record = sample();
        let topics = [event_topic(HASH_RECORDED_EVENT), *record.image_hash.as_bytes()];
        let mut data = Vec::new();
        data.extend_from_slice(&word_u64(record.captured_at));
        data.extend_from_slice(&record.camera_id);
        data.extend_from_slice(&word_bool(true));
        data.extend_from_slice(&word_u64(42));

        let event = decode_log(&topics, &data).unwrap().unwrap();
        assert_eq!(
            event,
            RegistryEvent::HashRecorded {
                image_hash: record.image_hash,
                captured_at: record.captured_at,
                camera_id: record.camera_id,
                has_geolocation: true,
                sequence_marker: 42,
            }
        );

        let foreign = [keccak256(b"Transfer(address,address,uint256)")];
        assert_eq!(decode_log(&foreign, &data).unwrap(), None);
    }
}
