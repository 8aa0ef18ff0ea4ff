//! Simulated ledger for testing and demos.
//!
//! Hosts a [`RegistryStore`] in process behind a single `RwLock` and fakes a
//! block clock: height starts at a genesis value and advances after a fixed
//! number of committed transactions. Records never leave the process.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use sha3::{Digest, Sha3_256};
use tracing::{debug, info, instrument};

use super::{check_batch_size, BackendKind, LedgerBackend, Receipt, TxId};
use crate::config::{self, RegistryPolicy};
use crate::error::Result;
use crate::hash::ImageHash;
use crate::record::{EncodedRecord, RegistryStats, Verification};
use crate::store::{unix_now, CommitContext, LoggedEvent, RegistryStore};

/// Block height of the first simulated block.
pub const DEFAULT_GENESIS_HEIGHT: u64 = 1000;

/// Transactions per simulated block.
pub const DEFAULT_TXS_PER_BLOCK: u64 = 10;

const TX_ID_PREFIX: &str = "sim_tx_";

/// Configuration for the simulated ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedConfig {
    /// Label mixed into transaction ids
    pub network: String,
    pub genesis_height: u64,
    pub txs_per_block: u64,
    /// Artificial delay before each commit
    pub latency: Duration,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            network: "simulated".to_string(),
            genesis_height: DEFAULT_GENESIS_HEIGHT,
            txs_per_block: DEFAULT_TXS_PER_BLOCK,
            latency: Duration::ZERO,
        }
    }
}

impl SimulatedConfig {
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub(crate) fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            network: config::var(lookup, "BIRTHMARK_NETWORK").unwrap_or(defaults.network),
            latency: config::parse_var::<u64>(lookup, "BIRTHMARK_SIMULATED_LATENCY_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.latency),
            ..defaults
        })
    }
}

#[derive(Debug)]
struct ChainState {
    store: RegistryStore,
    /// Committing transaction per recorded hash
    tx_ids: HashMap<ImageHash, TxId>,
    height: u64,
    txs_in_block: u64,
    tx_counter: u64,
}

impl ChainState {
    fn context(&self) -> CommitContext {
        CommitContext {
            now: unix_now(),
            position: self.height,
        }
    }

    /// Book a committed transaction: mint its id and tick the block clock.
    fn seal(&mut self, network: &str, payload: &[u8], txs_per_block: u64) -> TxId {
        let tx_id = simulated_tx_id(self.tx_counter, network, payload);
        self.tx_counter += 1;
        self.txs_in_block += 1;
        if self.txs_in_block >= txs_per_block.max(1) {
            self.height += 1;
            self.txs_in_block = 0;
        }
        tx_id
    }
}

/// In-process ledger hosting the reference registry store.
pub struct SimulatedLedger {
    config: SimulatedConfig,
    state: RwLock<ChainState>,
}

impl SimulatedLedger {
    pub fn new(config: SimulatedConfig, policy: RegistryPolicy) -> Self {
        info!(
            network = %config.network,
            genesis_height = config.genesis_height,
            "Simulated ledger created"
        );
        let state = ChainState {
            store: RegistryStore::new(policy),
            tx_ids: HashMap::new(),
            height: config.genesis_height,
            txs_in_block: 0,
            tx_counter: 0,
        };
        Self {
            config,
            state: RwLock::new(state),
        }
    }

    pub fn network(&self) -> &str {
        &self.config.network
    }

    /// Height of the block currently being filled.
    pub fn block_height(&self) -> u64 {
        self.state.read().height
    }

    /// Snapshot of every emitted event.
    pub fn events(&self) -> Vec<LoggedEvent> {
        self.state.read().store.events().all().to_vec()
    }

    pub fn events_since(&self, cursor: u64) -> Vec<LoggedEvent> {
        self.state.read().store.events_since(cursor).to_vec()
    }

    async fn simulate_latency(&self) {
        if !self.config.latency.is_zero() {
            tokio::time::sleep(self.config.latency).await;
        }
    }

    fn commit_one(&self, record: &EncodedRecord) -> Result<Receipt> {
        let mut state = self.state.write();
        let ctx = state.context();
        let entry = state.store.record(ctx, record.clone())?;
        let tx_id = state.seal(
            &self.config.network,
            &record.to_packed(),
            self.config.txs_per_block,
        );
        state.tx_ids.insert(record.image_hash, tx_id.clone());
        Ok(Receipt::committed(tx_id, entry.sequence_marker, 1))
    }

    fn commit_batch(&self, records: &[EncodedRecord]) -> Result<Receipt> {
        let mut state = self.state.write();
        let ctx = state.context();
        let count = state.store.batch_record(ctx, records.to_vec())?;
        let sequence_marker = state.store.stats().commit_position;

        let payload: Vec<u8> = records.iter().flat_map(|r| r.to_packed()).collect();
        let tx_id = state.seal(&self.config.network, &payload, self.config.txs_per_block);
        for record in records {
            state.tx_ids.insert(record.image_hash, tx_id.clone());
        }
        Ok(Receipt::committed(tx_id, sequence_marker, count))
    }
}

impl Default for SimulatedLedger {
    fn default() -> Self {
        Self::new(SimulatedConfig::default(), RegistryPolicy::default())
    }
}

#[async_trait]
impl LedgerBackend for SimulatedLedger {
    fn kind(&self) -> BackendKind {
        BackendKind::Simulated
    }

    fn network(&self) -> &str {
        &self.config.network
    }

    #[instrument(level = "debug", skip_all, fields(backend = "simulated", image_hash = %record.image_hash))]
    async fn record_hash(&self, record: &EncodedRecord) -> Result<Receipt> {
        self.simulate_latency().await;
        let receipt = self.commit_one(record)?;
        info!(
            tx_id = ?receipt.tx_id,
            sequence_marker = receipt.sequence_marker,
            "Hash recorded"
        );
        Ok(receipt)
    }

    #[instrument(level = "debug", skip_all, fields(backend = "simulated", image_hash = %image_hash))]
    async fn verify_hash(&self, image_hash: &ImageHash) -> Result<Verification> {
        let verification = {
            let state = self.state.read();
            let tx_id = state.tx_ids.get(image_hash).cloned();
            state.store.verify(image_hash).with_tx_id(tx_id)
        };
        debug!(found = verification.found, "Hash verified");
        Ok(verification)
    }

    #[instrument(level = "debug", skip_all, fields(backend = "simulated", count = records.len()))]
    async fn batch_record_hashes(&self, records: &[EncodedRecord]) -> Result<Receipt> {
        {
            let state = self.state.read();
            check_batch_size(records.len(), state.store.policy())?;
        }
        if records.is_empty() {
            return Ok(Receipt::empty());
        }

        self.simulate_latency().await;
        let receipt = self.commit_batch(records)?;
        info!(
            tx_id = ?receipt.tx_id,
            sequence_marker = receipt.sequence_marker,
            count = receipt.count,
            "Batch recorded"
        );
        Ok(receipt)
    }

    #[instrument(level = "debug", skip_all, fields(backend = "simulated", count = image_hashes.len()))]
    async fn batch_verify_existence(&self, image_hashes: &[ImageHash]) -> Result<Vec<bool>> {
        Ok(self.state.read().store.batch_verify(image_hashes))
    }

    /// `total_transactions` counts committed writes, failed ones excluded.
    async fn stats(&self) -> Result<RegistryStats> {
        Ok(self.state.read().store.stats())
    }
}

/// `sim_tx_` + first 16 bytes of SHA3-256(counter || network || payload), hex.
fn simulated_tx_id(counter: u64, network: &str, payload: &[u8]) -> TxId {
    let mut hasher = Sha3_256::new();
    hasher.update(counter.to_le_bytes());
    hasher.update(network.as_bytes());
    hasher.update(payload);
    let digest = hasher.finalize();
    TxId::new(format!("{TX_ID_PREFIX}{}", hex::encode(&digest[..16])))
}
