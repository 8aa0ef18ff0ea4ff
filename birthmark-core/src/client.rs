//! Registry client: the entry point applications use.
//!
//! Encodes application records, enforces batch limits before anything is
//! dispatched, and forwards to whichever ledger the configuration selected.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use crate::backend::{create_backend, BackendKind, LedgerBackend, Receipt};
use crate::codec;
use crate::config::{RegistryConfig, RegistryPolicy};
use crate::error::{RegistryError, Result};
use crate::hash::ImageHash;
use crate::record::{
    CaptureRecord, Geolocation, RegistryEntry, RegistryStats, Verification, VerifiedRecord,
};

/// Outcome of an idempotent write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Committed by this call
    Recorded(Receipt),
    /// An identical record was already committed
    AlreadyRecorded(RegistryEntry),
}

/// Registry client bound to one ledger backend.
///
/// ## Example
///
/// ```no_run
/// use birthmark_core::{CaptureRecord, ImageHash, RegistryClient};
/// use chrono::Utc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = RegistryClient::simulated();
/// let hash = ImageHash::digest(b"raw sensor bytes");
/// let record = CaptureRecord::new(hash, Utc::now(), "cam_001").with_geolocation(45.5231, -122.6765);
///
/// let receipt = client.record(&record).await?;
/// assert!(client.verify(&hash).await?.found);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RegistryClient {
    backend: Arc<dyn LedgerBackend>,
    policy: RegistryPolicy,
}

impl RegistryClient {
    /// Create a client, building the configured backend.
    pub fn new(config: RegistryConfig) -> Result<Self> {
        let policy = config.policy.clone();
        let backend = create_backend(config.backend, config.policy)?;
        info!(backend = %backend.kind(), "Registry client created");
        Ok(Self { backend, policy })
    }

    /// Wrap an existing backend.
    pub fn with_backend(backend: Arc<dyn LedgerBackend>, policy: RegistryPolicy) -> Self {
        Self { backend, policy }
    }

    pub fn from_env() -> Result<Self> {
        Self::new(RegistryConfig::from_env()?)
    }

    /// Client on a fresh in-process simulated ledger.
    pub fn simulated() -> Self {
        let policy = RegistryPolicy::default();
        let backend = Arc::new(crate::backend::SimulatedLedger::new(
            Default::default(),
            policy.clone(),
        ));
        Self { backend, policy }
    }

    pub fn backend(&self) -> &Arc<dyn LedgerBackend> {
        &self.backend
    }

    pub fn kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn policy(&self) -> &RegistryPolicy {
        &self.policy
    }

    /// Record one capture.
    #[instrument(level = "debug", skip_all, fields(backend = %self.kind(), image_hash = %record.image_hash))]
    pub async fn record(&self, record: &CaptureRecord) -> Result<Receipt> {
        let encoded = codec::encode(record)?;
        let receipt = self
            .backend
            .record_hash(&encoded)
            .await
            .map_err(|e| e.concerning(self.kind(), Some(record.image_hash)))?;
        info!(
            tx_id = ?receipt.tx_id,
            sequence_marker = receipt.sequence_marker,
            "Record committed"
        );
        Ok(receipt)
    }

    /// Record one capture, treating an identical existing record as success.
    ///
    /// A different record under the same hash is still `DuplicateHash`.
    /// Useful after a `TransactionTimeout`, when the first attempt may have
    /// landed.
    #[instrument(level = "debug", skip_all, fields(backend = %self.kind(), image_hash = %record.image_hash))]
    pub async fn record_idempotent(&self, record: &CaptureRecord) -> Result<RecordOutcome> {
        let encoded = codec::encode(record)?;
        match self.backend.record_hash(&encoded).await {
            Ok(receipt) => Ok(RecordOutcome::Recorded(receipt)),
            Err(RegistryError::DuplicateHash { image_hash, index }) => {
                let existing = self.backend.verify_hash(&encoded.image_hash).await?;
                match existing.into_entry() {
                    Some(entry) if entry.record == encoded => {
                        debug!(sequence_marker = entry.sequence_marker, "Identical record already committed");
                        Ok(RecordOutcome::AlreadyRecorded(entry))
                    }
                    _ => {
                        warn!("Hash already recorded with different metadata");
                        Err(RegistryError::DuplicateHash { image_hash, index })
                    }
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Record a batch atomically.
    ///
    /// The size limit is checked before anything is encoded or dispatched;
    /// an empty batch returns an empty receipt without touching the ledger.
    #[instrument(level = "debug", skip_all, fields(backend = %self.kind(), count = records.len()))]
    pub async fn batch_record(&self, records: &[CaptureRecord]) -> Result<Receipt> {
        if records.len() > self.policy.max_batch_size {
            return Err(RegistryError::BatchTooLarge {
                size: records.len(),
                max: self.policy.max_batch_size,
            });
        }
        if records.is_empty() {
            return Ok(Receipt::empty());
        }

        let encoded = records
            .iter()
            .enumerate()
            .map(|(i, record)| {
                codec::encode(record).map_err(|e| match e {
                    RegistryError::InvalidInput(msg) => {
                        RegistryError::InvalidInput(format!("batch index {i}: {msg}"))
                    }
                    other => other,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let receipt = self
            .backend
            .batch_record_hashes(&encoded)
            .await
            .map_err(|e| e.concerning(self.kind(), None))?;
        info!(
            tx_id = ?receipt.tx_id,
            sequence_marker = receipt.sequence_marker,
            count = receipt.count,
            "Batch committed"
        );
        Ok(receipt)
    }

    /// Raw lookup. A missing hash is `found == false`.
    pub async fn verify(&self, image_hash: &ImageHash) -> Result<Verification> {
        self.backend
            .verify_hash(image_hash)
            .await
            .map_err(|e| e.concerning(self.kind(), Some(*image_hash)))
    }

    /// Lookup decoded back into application form, with the committing
    /// transaction and network where the ledger reports them.
    pub async fn verify_record(&self, image_hash: &ImageHash) -> Result<Option<VerifiedRecord>> {
        let verification = self.verify(image_hash).await?;
        codec::decode_verification(verification, self.backend.network())
            .map_err(|e| e.concerning(self.kind(), Some(*image_hash)))
    }

    pub async fn batch_verify(&self, image_hashes: &[ImageHash]) -> Result<Vec<bool>> {
        self.backend
            .batch_verify_existence(image_hashes)
            .await
            .map_err(|e| e.concerning(self.kind(), None))
    }

    pub async fn stats(&self) -> Result<RegistryStats> {
        self.backend.stats().await
    }

    /// Hash raw image data and record it.
    pub async fn hash_and_record(
        &self,
        image_data: &[u8],
        captured_at: DateTime<Utc>,
        camera_id: &str,
        geolocation: Option<Geolocation>,
    ) -> Result<(ImageHash, Receipt)> {
        let image_hash = ImageHash::digest(image_data);
        let record = CaptureRecord {
            image_hash,
            captured_at,
            camera_id: camera_id.to_string(),
            geolocation,
        };
        let receipt = self.record(&record).await?;
        Ok((image_hash, receipt))
    }

    /// Hash raw image data and look it up.
    pub async fn hash_and_verify(&self, image_data: &[u8]) -> Result<Option<VerifiedRecord>> {
        self.verify_record(&ImageHash::digest(image_data)).await
    }
}

impl std::fmt::Debug for RegistryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryClient")
            .field("backend", &self.backend.kind())
            .field("policy", &self.policy)
            .finish()
    }
}
