//! Ledger backends.
//!
//! Every backend exposes the same operation set with the same semantics,
//! whichever ledger holds the records:
//!
//! - **Simulated** - in-process store with a simulated block clock (testing, demos)
//! - **EVM** - registry contract reached over JSON-RPC (feature `evm`)
//! - **Solana** - registry program with one account per hash (feature `solana`)
//!
//! ## Quick Start
//!
//! ```no_run
//! use birthmark_core::backend::{create_backend, BackendConfig};
//! use birthmark_core::RegistryPolicy;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let backend = create_backend(BackendConfig::default(), RegistryPolicy::default())?;
//! let stats = backend.stats().await?;
//! println!("{} records", stats.total_count);
//! # Ok(())
//! # }
//! ```

#[cfg(feature = "evm")]
pub mod evm;
pub mod simulated;
#[cfg(feature = "solana")]
pub mod solana;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::RegistryPolicy;
use crate::error::{RegistryError, Result};
use crate::hash::ImageHash;
use crate::record::{EncodedRecord, RegistryStats, Verification};

#[cfg(feature = "evm")]
pub use evm::{EvmAddress, EvmConfig, EvmLedger};
pub use simulated::{SimulatedConfig, SimulatedLedger};
#[cfg(feature = "solana")]
pub use solana::{SolanaConfig, SolanaLedger};

/// Operation set every ledger implements.
///
/// Implementations must be thread-safe (`Send + Sync`). Writes are submitted
/// once and never resubmitted internally; reads may retry transient failures.
#[async_trait]
pub trait LedgerBackend: Send + Sync {
    /// Which ledger this is.
    fn kind(&self) -> BackendKind;

    /// Network label reported with verified records.
    fn network(&self) -> &str;

    /// Commit one record.
    async fn record_hash(&self, record: &EncodedRecord) -> Result<Receipt>;

    /// Look up a hash. An unknown hash is `found == false`, not an error.
    async fn verify_hash(&self, image_hash: &ImageHash) -> Result<Verification>;

    /// Commit a batch atomically: all records or none.
    async fn batch_record_hashes(&self, records: &[EncodedRecord]) -> Result<Receipt>;

    /// Existence flags in input order.
    async fn batch_verify_existence(&self, image_hashes: &[ImageHash]) -> Result<Vec<bool>>;

    async fn stats(&self) -> Result<RegistryStats>;
}

/// Identifies a ledger family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Simulated,
    Evm,
    Solana,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Simulated => "simulated",
            Self::Evm => "evm",
            Self::Solana => "solana",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "simulated" | "mock" => Ok(Self::Simulated),
            "evm" | "ethereum" => Ok(Self::Evm),
            "solana" => Ok(Self::Solana),
            other => Err(RegistryError::InvalidInput(format!(
                "Unknown backend: {other}"
            ))),
        }
    }
}

/// Backend-opaque transaction identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxId(String);

impl TxId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for TxId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Outcome of a committed write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    /// `None` only when nothing was submitted (empty batch)
    pub tx_id: Option<TxId>,
    /// Commit position shared by every record in the write
    pub sequence_marker: u64,
    /// Records committed
    pub count: usize,
}

impl Receipt {
    pub(crate) fn committed(tx_id: TxId, sequence_marker: u64, count: usize) -> Self {
        Self {
            tx_id: Some(tx_id),
            sequence_marker,
            count,
        }
    }

    /// Receipt for a batch with nothing in it.
    pub fn empty() -> Self {
        Self {
            tx_id: None,
            sequence_marker: 0,
            count: 0,
        }
    }
}

/// Configuration for creating ledger backends.
#[derive(Debug, Clone)]
pub enum BackendConfig {
    /// In-process simulated ledger
    Simulated(SimulatedConfig),

    /// EVM registry contract
    #[cfg(feature = "evm")]
    Evm(EvmConfig),

    /// Solana registry program
    #[cfg(feature = "solana")]
    Solana(SolanaConfig),
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::Simulated(SimulatedConfig::default())
    }
}

impl BackendConfig {
    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Simulated(_) => BackendKind::Simulated,
            #[cfg(feature = "evm")]
            Self::Evm(_) => BackendKind::Evm,
            #[cfg(feature = "solana")]
            Self::Solana(_) => BackendKind::Solana,
        }
    }

    pub(crate) fn from_lookup(
        kind: BackendKind,
        lookup: &dyn Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        match kind {
            BackendKind::Simulated => Ok(Self::Simulated(SimulatedConfig::from_lookup(lookup)?)),
            #[cfg(feature = "evm")]
            BackendKind::Evm => Ok(Self::Evm(EvmConfig::from_lookup(lookup)?)),
            #[cfg(feature = "solana")]
            BackendKind::Solana => Ok(Self::Solana(SolanaConfig::from_lookup(lookup)?)),
            #[allow(unreachable_patterns)]
            other => Err(RegistryError::unavailable(
                other,
                format!("built without the `{other}` feature"),
            )),
        }
    }
}

/// Create a ledger backend from configuration.
///
/// Selection happens once, here; callers hold the result as a trait object.
pub fn create_backend(
    config: BackendConfig,
    policy: RegistryPolicy,
) -> Result<Arc<dyn LedgerBackend>> {
    match config {
        BackendConfig::Simulated(sim_config) => {
            let backend = SimulatedLedger::new(sim_config, policy);
            Ok(Arc::new(backend))
        }
        #[cfg(feature = "evm")]
        BackendConfig::Evm(evm_config) => {
            let backend = EvmLedger::new(evm_config, policy)?;
            Ok(Arc::new(backend))
        }
        #[cfg(feature = "solana")]
        BackendConfig::Solana(solana_config) => {
            let backend = SolanaLedger::new(solana_config, policy)?;
            Ok(Arc::new(backend))
        }
    }
}

/// Reject oversized batches before anything reaches a ledger.
pub(crate) fn check_batch_size(len: usize, policy: &RegistryPolicy) -> Result<()> {
    if len > policy.max_batch_size {
        return Err(RegistryError::BatchTooLarge {
            size: len,
            max: policy.max_batch_size,
        });
    }
    Ok(())
}
