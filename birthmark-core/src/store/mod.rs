//! Registry store: the authoritative append-only table of records.
//!
//! This is the reference semantics every ledger must honour. The simulated
//! backend hosts it in process; the EVM contract and Solana program implement
//! the same rules on-chain.
//!
//! - one entry per image hash, never overwritten, never deleted
//! - capture timestamps bounded by ledger time plus a tolerance
//! - batches are validated in full before anything is inserted
//! - every insertion emits a `HashRecorded` event; batches also emit `BatchRecorded`
//!
//! Storage is an arena of entries plus a hash-indexed table into it. The
//! event log lives beside the table and is only ever appended to.

pub mod events;

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use tracing::debug;

use crate::codec::BatchColumns;
use crate::config::RegistryPolicy;
use crate::error::{RegistryError, Result};
use crate::hash::ImageHash;
use crate::record::{EncodedRecord, RegistryEntry, RegistryStats, Verification};

pub use events::{EventLog, LoggedEvent, RegistryEvent};

/// Ledger state the hosting backend supplies for one commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitContext {
    /// Ledger time, Unix seconds
    pub now: u64,
    /// Commit position (block height, slot) for this transaction
    pub position: u64,
}

/// Host wall clock in Unix seconds.
pub(crate) fn unix_now() -> u64 {
    u64::try_from(Utc::now().timestamp()).unwrap_or(0)
}

#[derive(Debug)]
pub struct RegistryStore {
    entries: Vec<RegistryEntry>,
    index: HashMap<ImageHash, usize>,
    total_count: u64,
    transaction_count: u64,
    commit_position: u64,
    events: EventLog,
    policy: RegistryPolicy,
}

impl RegistryStore {
    pub fn new(policy: RegistryPolicy) -> Self {
        Self {
            entries: Vec::new(),
            index: HashMap::new(),
            total_count: 0,
            transaction_count: 0,
            commit_position: 0,
            events: EventLog::new(),
            policy,
        }
    }

    pub fn policy(&self) -> &RegistryPolicy {
        &self.policy
    }

    /// Record a single entry.
    ///
    /// An existing hash is `DuplicateHash` whatever the new payload carries,
    /// so uniqueness is checked before the timestamp bound.
    pub fn record(&mut self, ctx: CommitContext, record: EncodedRecord) -> Result<RegistryEntry> {
        if self.exists(&record.image_hash) {
            return Err(RegistryError::DuplicateHash {
                image_hash: record.image_hash,
                index: None,
            });
        }
        self.check_timestamp(ctx, &record, None)?;

        let position = self.advance(ctx);
        let entry = self.insert(record, position);
        self.transaction_count += 1;
        debug!(
            image_hash = %entry.record.image_hash,
            sequence_marker = position,
            "Record committed"
        );
        Ok(entry)
    }

    /// Record a batch atomically.
    ///
    /// Every entry is validated before the first insertion, so a failure at
    /// any index leaves the store untouched. A hash repeated inside the batch
    /// is reported exactly like a hash already in the store.
    pub fn batch_record(&mut self, ctx: CommitContext, records: Vec<EncodedRecord>) -> Result<usize> {
        let max = self.policy.max_batch_size;
        if records.len() > max {
            return Err(RegistryError::BatchTooLarge {
                size: records.len(),
                max,
            });
        }
        if records.is_empty() {
            return Ok(0);
        }

        let mut seen = HashSet::with_capacity(records.len());
        for (i, record) in records.iter().enumerate() {
            if self.exists(&record.image_hash) || !seen.insert(record.image_hash) {
                return Err(RegistryError::DuplicateHash {
                    image_hash: record.image_hash,
                    index: Some(i),
                });
            }
            self.check_timestamp(ctx, record, Some(i))?;
        }

        let position = self.advance(ctx);
        let count = records.len();
        for record in records {
            self.insert(record, position);
        }
        self.transaction_count += 1;
        self.events.append(RegistryEvent::BatchRecorded {
            count: count as u64,
            sequence_marker: position,
        });
        debug!(count, sequence_marker = position, "Batch committed");
        Ok(count)
    }

    /// Arrays-of-fields entry point; column lengths must agree.
    pub fn batch_record_columns(&mut self, ctx: CommitContext, columns: BatchColumns) -> Result<usize> {
        let records = columns.into_records()?;
        self.batch_record(ctx, records)
    }

    pub fn verify(&self, image_hash: &ImageHash) -> Verification {
        match self.index.get(image_hash) {
            Some(&i) => Verification::found(self.entries[i].clone()),
            None => Verification::not_found(),
        }
    }

    pub fn batch_verify(&self, image_hashes: &[ImageHash]) -> Vec<bool> {
        image_hashes.iter().map(|h| self.exists(h)).collect()
    }

    pub fn exists(&self, image_hash: &ImageHash) -> bool {
        self.index.contains_key(image_hash)
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            total_count: self.total_count,
            commit_position: self.commit_position,
            total_transactions: Some(self.transaction_count),
        }
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    /// Events appended at or after log index `cursor`.
    pub fn events_since(&self, cursor: u64) -> &[LoggedEvent] {
        self.events.since(cursor)
    }

    /// Committed entries in insertion order.
    pub fn entries(&self) -> &[RegistryEntry] {
        &self.entries
    }

    fn check_timestamp(
        &self,
        ctx: CommitContext,
        record: &EncodedRecord,
        index: Option<usize>,
    ) -> Result<()> {
        let max_allowed = ctx.now.saturating_add(self.policy.future_tolerance.as_secs());
        if record.captured_at > max_allowed {
            return Err(RegistryError::FutureTimestamp {
                captured_at: record.captured_at,
                max_allowed,
                index,
            });
        }
        Ok(())
    }

    /// Sequence markers never move backwards, whatever the host supplies.
    fn advance(&mut self, ctx: CommitContext) -> u64 {
        self.commit_position = self.commit_position.max(ctx.position);
        self.commit_position
    }

    fn insert(&mut self, record: EncodedRecord, sequence_marker: u64) -> RegistryEntry {
        let entry = RegistryEntry {
            record,
            sequence_marker,
        };
        self.index.insert(entry.record.image_hash, self.entries.len());
        self.entries.push(entry.clone());
        self.total_count += 1;
        self.events.append(RegistryEvent::HashRecorded {
            image_hash: entry.record.image_hash,
            captured_at: entry.record.captured_at,
            camera_id: entry.record.camera_id,
            has_geolocation: entry.record.has_geolocation,
            sequence_marker,
        });
        entry
    }
}

impl Default for RegistryStore {
    fn default() -> Self {
        Self::new(RegistryPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_camera_id;
    use std::time::Duration;

    const NOW: u64 = 1_750_000_000;

    fn ctx(position: u64) -> CommitContext {
        CommitContext { now: NOW, position }
    }

    fn record(tag: &str) -> EncodedRecord {
        EncodedRecord {
            image_hash: ImageHash::digest(tag.as_bytes()),
            captured_at: NOW - 60,
            camera_id: encode_camera_id("camera_001"),
            latitude: 45_523_100,
            longitude: -122_676_500,
            has_geolocation: true,
        }
    }

    #[test]
    fn test_record_and_verify() {
        let mut store = RegistryStore::default();
        let entry = store.record(ctx(1000), record("a")).unwrap();
        assert_eq!(entry.sequence_marker, 1000);

        let verification = store.verify(&record("a").image_hash);
        assert!(verification.found);
        assert_eq!(verification.entry, entry);
        assert_eq!(store.stats().total_count, 1);
    }

    #[test]
    fn test_duplicate_leaves_store_unchanged() {
        let mut store = RegistryStore::default();
        store.record(ctx(1000), record("a")).unwrap();

        let mut different_payload = record("a");
        different_payload.camera_id = encode_camera_id("camera_999");
        let err = store.record(ctx(1001), different_payload).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateHash { index: None, .. }));

        assert_eq!(store.stats().total_count, 1);
        let stored = store.verify(&record("a").image_hash).entry;
        assert_eq!(stored.record.camera_id, encode_camera_id("camera_001"));
        assert_eq!(store.events().len(), 1);
    }

    #[test]
    fn test_replay_with_future_timestamp_is_duplicate() {
        let mut store = RegistryStore::default();
        store.record(ctx(1000), record("h1")).unwrap();

        let mut replay = record("h1");
        replay.captured_at = NOW + 3600;
        let err = store.record(ctx(1001), replay).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateHash { index: None, .. }));
        assert_eq!(store.stats().total_count, 1);
    }

    #[test]
    fn test_batch_duplicate_with_future_timestamp_is_duplicate() {
        let mut store = RegistryStore::default();
        store.record(ctx(1000), record("existing")).unwrap();

        let mut records: Vec<_> = (0..10).map(|i| record(&format!("fut-{i}"))).collect();
        let mut replay = record("existing");
        replay.captured_at = NOW + 3600;
        records[5] = replay;

        let err = store.batch_record(ctx(1001), records).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateHash { index: Some(5), .. }));
        assert_eq!(store.stats().total_count, 1);
    }

    #[test]
    fn test_future_timestamp_tolerance() {
        let mut store = RegistryStore::default();

        let mut within = record("within");
        within.captured_at = NOW + 300;
        assert!(store.record(ctx(1), within).is_ok());

        let mut beyond = record("beyond");
        beyond.captured_at = NOW + 301;
        let err = store.record(ctx(1), beyond).unwrap_err();
        assert!(matches!(
            err,
            RegistryError::FutureTimestamp {
                max_allowed,
                index: None,
                ..
            } if max_allowed == NOW + 300
        ));
    }

    #[test]
    fn test_tolerance_is_policy() {
        let mut store = RegistryStore::new(RegistryPolicy {
            future_tolerance: Duration::from_secs(0),
            ..Default::default()
        });
        let mut r = record("strict");
        r.captured_at = NOW + 1;
        assert!(store.record(ctx(1), r).is_err());
    }

    #[test]
    fn test_batch_too_large_commits_nothing() {
        let mut store = RegistryStore::default();
        let records: Vec<_> = (0..101).map(|i| record(&format!("big-{i}"))).collect();
        let err = store.batch_record(ctx(1000), records).unwrap_err();
        assert!(matches!(err, RegistryError::BatchTooLarge { size: 101, max: 100 }));
        assert_eq!(store.stats().total_count, 0);
    }

    #[test]
    fn test_batch_is_atomic_on_duplicate() {
        let mut store = RegistryStore::default();
        store.record(ctx(1000), record("existing")).unwrap();

        let mut records: Vec<_> = (0..10).map(|i| record(&format!("batch-{i}"))).collect();
        records[5] = record("existing");

        let err = store.batch_record(ctx(1001), records).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateHash { index: Some(5), .. }));
        assert_eq!(store.stats().total_count, 1);
        assert!(!store.exists(&record("batch-0").image_hash));
        assert_eq!(store.events().len(), 1);
    }

    #[test]
    fn test_in_batch_duplicate_reported_at_second_occurrence() {
        let mut store = RegistryStore::default();
        let records = vec![record("x"), record("y"), record("x")];
        let err = store.batch_record(ctx(1), records).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateHash { index: Some(2), .. }));
        assert_eq!(store.stats().total_count, 0);
    }

    #[test]
    fn test_empty_batch_is_noop() {
        let mut store = RegistryStore::default();
        assert_eq!(store.batch_record(ctx(1), Vec::new()).unwrap(), 0);
        assert!(store.events().is_empty());
        assert_eq!(store.stats().total_count, 0);
        assert_eq!(store.stats().total_transactions, Some(0));
    }

    #[test]
    fn test_batch_events() {
        let mut store = RegistryStore::default();
        let records: Vec<_> = (0..3).map(|i| record(&format!("ev-{i}"))).collect();
        assert_eq!(store.batch_record(ctx(1002), records).unwrap(), 3);

        let events = store.events().all();
        assert_eq!(events.len(), 4);
        assert!(events[..3]
            .iter()
            .all(|e| matches!(e.event, RegistryEvent::HashRecorded { sequence_marker: 1002, .. })));
        assert_eq!(
            events[3].event,
            RegistryEvent::BatchRecorded {
                count: 3,
                sequence_marker: 1002
            }
        );
    }

    #[test]
    fn test_stats_count_transactions() {
        let mut store = RegistryStore::default();
        store.record(ctx(1), record("t1")).unwrap();
        let batch: Vec<_> = (0..4).map(|i| record(&format!("t-batch-{i}"))).collect();
        store.batch_record(ctx(2), batch).unwrap();
        store.batch_record(ctx(3), Vec::new()).unwrap();
        assert!(store.record(ctx(4), record("t1")).is_err());

        let stats = store.stats();
        assert_eq!(stats.total_count, 5);
        assert_eq!(stats.total_transactions, Some(2));
    }

    #[test]
    fn test_sequence_markers_never_decrease() {
        let mut store = RegistryStore::default();
        store.record(ctx(1005), record("late")).unwrap();
        let entry = store.record(ctx(1001), record("stale-host")).unwrap();
        assert_eq!(entry.sequence_marker, 1005);
        assert_eq!(store.stats().commit_position, 1005);
    }

    #[test]
    fn test_batch_verify_preserves_order() {
        let mut store = RegistryStore::default();
        store.record(ctx(1), record("h1")).unwrap();
        let result = store.batch_verify(&[
            record("h1").image_hash,
            record("unknown").image_hash,
            record("h1").image_hash,
        ]);
        assert_eq!(result, vec![true, false, true]);
    }

    #[test]
    fn test_columns_mismatch_rejected_first() {
        let mut store = RegistryStore::default();
        let mut columns = BatchColumns::from_records(&[record("c1"), record("c2")]);
        columns.camera_ids.pop();
        let err = store.batch_record_columns(ctx(1), columns).unwrap_err();
        assert!(matches!(err, RegistryError::LengthMismatch { .. }));
        assert_eq!(store.stats().total_count, 0);
    }
}
