//! Birthmark Core - append-only image hash registry
//!
//! Records the content hash of a captured image, with its capture metadata,
//! into an append-only ledger, and lets anyone later confirm the hash was
//! recorded and read back what was recorded with it.
//!
//! # Features
//!
//! - One operation set (record, verify, batch record, batch verify) over
//!   interchangeable ledgers
//! - Simulated in-process ledger for tests and demos
//! - EVM registry contract over JSON-RPC (feature `evm`)
//! - Solana registry program (feature `solana`)
//! - Fixed-width record codec shared by every ledger
//! - All-or-nothing batches with the offending index reported on failure
//!
//! # Example
//!
//! ```no_run
//! use birthmark_core::{CaptureRecord, ImageHash, RegistryClient};
//! use chrono::Utc;
//!
//! # async fn example() -> birthmark_core::Result<()> {
//! let client = RegistryClient::simulated();
//!
//! let hash = ImageHash::digest(b"raw sensor data");
//! let record = CaptureRecord::new(hash, Utc::now(), "cam_001")
//!     .with_geolocation(45.5231, -122.6765);
//! client.record(&record).await?;
//!
//! let verification = client.verify(&hash).await?;
//! assert!(verification.found);
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod hash;
pub mod record;
pub mod store;

// Re-export main types for convenience
pub use backend::{
    create_backend, BackendConfig, BackendKind, LedgerBackend, Receipt, SimulatedConfig,
    SimulatedLedger, TxId,
};
pub use client::{RecordOutcome, RegistryClient};
pub use codec::{decode, encode, BatchColumns};
pub use config::{RegistryConfig, RegistryPolicy};
pub use error::{
    ErrorKind, RegistryError, Result, DEFAULT_FUTURE_TOLERANCE_SECS, DEFAULT_MAX_BATCH_SIZE,
};
pub use hash::ImageHash;
pub use record::{
    CaptureRecord, EncodedRecord, Geolocation, RegistryEntry, RegistryStats, Verification,
    VerifiedRecord,
};
pub use store::{CommitContext, RegistryEvent, RegistryStore};

#[cfg(feature = "evm")]
pub use backend::{EvmConfig, EvmLedger};

#[cfg(feature = "solana")]
pub use backend::{SolanaConfig, SolanaLedger};

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    /// Integration test: hash an image, record it, verify it, reject the replay.
    #[tokio::test]
    async fn test_full_registry_workflow() {
        // Step 1: Hash the raw image
        let image = b"raw bayer data".to_vec();
        let hash = ImageHash::digest(&image);

        // Step 2: Record it through a simulated ledger
        let client = RegistryClient::simulated();
        let record = CaptureRecord::new(hash, Utc::now(), "cam_001").with_geolocation(45.5231, -122.6765);
        let receipt = client.record(&record).await.expect("Failed to record");
        assert!(receipt.tx_id.is_some());

        // Step 3: Verify it is there with the same metadata
        let verification = client.verify(&hash).await.expect("Verification failed");
        assert!(verification.found);
        assert_eq!(verification.entry.record, encode(&record).unwrap());
        assert_eq!(verification.entry.sequence_marker, receipt.sequence_marker);

        // Step 4: A replay is refused and changes nothing
        let err = client.record(&record).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateHash);
        assert_eq!(client.stats().await.unwrap().total_count, 1);
    }

    /// Different images never share a registry slot.
    #[tokio::test]
    async fn test_different_content_different_entries() {
        let client = RegistryClient::simulated();
        let (a, _) = client
            .hash_and_record(b"Content A", Utc::now(), "cam_001", None)
            .await
            .expect("Failed to record A");
        let (b, _) = client
            .hash_and_record(b"Content B", Utc::now(), "cam_001", None)
            .await
            .expect("Failed to record B");

        assert_ne!(a, b);
        assert_eq!(client.batch_verify(&[a, b]).await.unwrap(), vec![true, true]);
    }
}
