//! EVM registry contract backend.
//!
//! The registry contract is deployed separately; this module speaks its ABI
//! over JSON-RPC.
//!
//! ## Write path
//!
//! 1. `eth_call` preflight from the submitter, so reverts (duplicate, future
//!    timestamp, oversize batch) surface without broadcasting anything
//! 2. one `eth_sendTransaction` from the node-managed submitter account,
//!    never retried
//! 3. poll `eth_getTransactionReceipt` and `eth_blockNumber` until the
//!    receipt is `confirmations` blocks deep, bounded by `confirmation_timeout`
//!
//! Reads are plain `eth_call`s retried with exponential backoff. A found
//! record's committing transaction comes from its `HashRecorded` log in the
//! block the record names.
//!
//! ## Environment
//!
//! Required: `EVM_RPC_URL`, `EVM_CONTRACT_ADDRESS`, `EVM_SUBMITTER`
//! Optional: `EVM_API_KEY` (sent as a bearer token), `EVM_CONFIRMATIONS`,
//! `EVM_NETWORK` (label reported with verified records)

pub mod abi;
pub mod rpc;

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};
use url::Url;
use zeroize::Zeroizing;

use self::abi::Revert;
use self::rpc::{decode_hex, encode_hex, parse_quantity, to_quantity, RetryConfig, RpcClient, RpcFailure};
use super::{check_batch_size, BackendKind, LedgerBackend, Receipt, TxId};
use crate::codec::BatchColumns;
use crate::config::{self, RegistryPolicy};
use crate::error::{RegistryError, Result};
use crate::hash::ImageHash;
use crate::record::{EncodedRecord, RegistryStats, Verification};
use crate::store::RegistryEvent;

/// Default block depth before a write counts as committed.
pub const DEFAULT_CONFIRMATIONS: u64 = 3;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// A 20-byte account or contract address.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct EvmAddress([u8; 20]);

impl EvmAddress {
    pub const fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl FromStr for EvmAddress {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let digits = trimmed.strip_prefix("0x").unwrap_or(trimmed);
        let bytes = hex::decode(digits)
            .map_err(|e| RegistryError::InvalidInput(format!("Invalid address `{s}`: {e}")))?;
        let array: [u8; 20] = bytes.try_into().map_err(|v: Vec<u8>| {
            RegistryError::InvalidInput(format!("Address must be 20 bytes, got {}", v.len()))
        })?;
        Ok(Self(array))
    }
}

impl fmt::Display for EvmAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for EvmAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EvmAddress({self})")
    }
}

/// Configuration for the EVM registry backend.
#[derive(Clone)]
pub struct EvmConfig {
    /// JSON-RPC endpoint
    pub rpc_url: Url,
    /// Label reported with verified records
    pub network: String,
    /// Deployed registry contract
    pub contract_address: EvmAddress,
    /// Authorized submitter, unlocked on the node
    pub submitter: EvmAddress,
    /// Bearer token for hosted RPC providers
    pub api_key: Option<Zeroizing<String>>,
    /// Block depth required before a write is reported committed
    pub confirmations: u64,
    pub request_timeout: Duration,
    pub confirmation_timeout: Duration,
    pub poll_interval: Duration,
    /// Explicit gas limit; the node estimates when unset
    pub gas_limit: Option<u64>,
    pub retry: RetryConfig,
}

impl fmt::Debug for EvmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvmConfig")
            .field("rpc_url", &self.rpc_url.as_str())
            .field("network", &self.network)
            .field("contract_address", &self.contract_address)
            .field("submitter", &self.submitter)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("confirmations", &self.confirmations)
            .field("request_timeout", &self.request_timeout)
            .field("confirmation_timeout", &self.confirmation_timeout)
            .field("poll_interval", &self.poll_interval)
            .field("gas_limit", &self.gas_limit)
            .finish()
    }
}

impl EvmConfig {
    pub fn new(rpc_url: Url, contract_address: EvmAddress, submitter: EvmAddress) -> Self {
        Self {
            rpc_url,
            network: "evm".to_string(),
            contract_address,
            submitter,
            api_key: None,
            confirmations: DEFAULT_CONFIRMATIONS,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            confirmation_timeout: DEFAULT_CONFIRMATION_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            gas_limit: None,
            retry: RetryConfig::default(),
        }
    }

    /// Create configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(&|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self> {
        let backend = BackendKind::Evm;
        let rpc_url = config::parse_rpc_url(&config::required_var(lookup, "EVM_RPC_URL", backend)?, backend)?;
        let contract_address = config::required_var(lookup, "EVM_CONTRACT_ADDRESS", backend)?.parse::<EvmAddress>()?;
        let submitter = config::required_var(lookup, "EVM_SUBMITTER", backend)?.parse::<EvmAddress>()?;

        let mut evm = Self::new(rpc_url, contract_address, submitter);
        evm.api_key = config::var(lookup, "EVM_API_KEY").map(Zeroizing::new);
        if let Some(confirmations) = config::parse_var::<u64>(lookup, "EVM_CONFIRMATIONS")? {
            evm.confirmations = confirmations;
        }
        if let Some(network) = config::var(lookup, "EVM_NETWORK") {
            evm.network = network;
        }
        Ok(evm)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransactionReceipt {
    #[serde(default)]
    block_number: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogEntry {
    topics: Vec<String>,
    data: String,
    #[serde(default)]
    transaction_hash: Option<String>,
}

enum Mined {
    Succeeded(u64),
    Reverted(u64),
}

/// Registry contract client.
pub struct EvmLedger {
    rpc: RpcClient,
    config: EvmConfig,
    policy: RegistryPolicy,
}

impl EvmLedger {
    #[instrument(level = "debug", skip_all, fields(
        rpc_url = %config.rpc_url,
        contract = %config.contract_address,
        confirmations = config.confirmations
    ))]
    pub fn new(config: EvmConfig, policy: RegistryPolicy) -> Result<Self> {
        let rpc = RpcClient::new(
            config.rpc_url.clone(),
            config.api_key.clone(),
            config.request_timeout,
            config.retry.clone(),
        )?;
        info!("EVM registry client created");
        Ok(Self {
            rpc,
            config,
            policy,
        })
    }

    /// Registry events from the contract logs, for indexers.
    #[instrument(level = "debug", skip(self))]
    pub async fn recorded_events(&self, from_block: u64, to_block: u64) -> Result<Vec<RegistryEvent>> {
        let topics = [
            encode_hex(&abi::event_topic(abi::HASH_RECORDED_EVENT)),
            encode_hex(&abi::event_topic(abi::BATCH_RECORDED_EVENT)),
        ];
        let filter = json!([{
            "address": self.config.contract_address.to_string(),
            "fromBlock": to_quantity(from_block),
            "toBlock": to_quantity(to_block),
            "topics": [topics],
        }]);
        let logs: Vec<LogEntry> = self
            .rpc
            .call_with_retry("eth_getLogs", filter)
            .await
            .map_err(RpcFailure::into_error)?;

        let mut events = Vec::with_capacity(logs.len());
        for log in logs {
            let topics = log
                .topics
                .iter()
                .map(|t| {
                    let bytes = decode_hex(t)?;
                    <[u8; 32]>::try_from(bytes.as_slice())
                        .map_err(|_| RegistryError::decode(format!("Invalid log topic `{t}`")))
                })
                .collect::<Result<Vec<_>>>()?;
            if let Some(event) = abi::decode_log(&topics, &decode_hex(&log.data)?)? {
                events.push(event);
            }
        }
        debug!(count = events.len(), "Decoded registry events");
        Ok(events)
    }

    /// Transaction whose `HashRecorded` log for `image_hash` sits in `block`.
    ///
    /// Lookup failures leave the id unknown rather than failing the read.
    async fn recording_tx(&self, image_hash: &ImageHash, block: u64) -> Option<TxId> {
        let filter = json!([{
            "address": self.config.contract_address.to_string(),
            "fromBlock": to_quantity(block),
            "toBlock": to_quantity(block),
            "topics": [
                encode_hex(&abi::event_topic(abi::HASH_RECORDED_EVENT)),
                encode_hex(image_hash.as_bytes()),
            ],
        }]);
        match self.rpc.call_with_retry::<Vec<LogEntry>>("eth_getLogs", filter).await {
            Ok(logs) => logs
                .into_iter()
                .find_map(|log| log.transaction_hash)
                .map(TxId::new),
            Err(failure) => {
                warn!(block, error = %failure.into_error(), "Recording log lookup failed");
                None
            }
        }
    }

    /// Read-only contract call, retried on transient failures.
    async fn read(&self, data: Vec<u8>) -> Result<Vec<u8>> {
        let params = json!([
            { "to": self.config.contract_address.to_string(), "data": encode_hex(&data) },
            "latest"
        ]);
        let result: String = self
            .rpc
            .call_with_retry("eth_call", params)
            .await
            .map_err(RpcFailure::into_error)?;
        decode_hex(&result)
    }

    fn transaction(&self, data: &[u8]) -> Value {
        let mut tx = json!({
            "from": self.config.submitter.to_string(),
            "to": self.config.contract_address.to_string(),
            "data": encode_hex(data),
        });
        if let Some(gas) = self.config.gas_limit {
            tx["gas"] = Value::String(to_quantity(gas));
        }
        tx
    }

    /// Execute the write against current state without broadcasting.
    async fn preflight(&self, data: &[u8]) -> Result<()> {
        let params = json!([self.transaction(data), "latest"]);
        match self.rpc.call::<String>("eth_call", params).await {
            Ok(_) => Ok(()),
            Err(failure) => Err(map_write_failure(failure)),
        }
    }

    /// Broadcast once. A timeout here leaves the outcome unknown.
    async fn send(&self, data: &[u8], image_hash: ImageHash, started: Instant) -> Result<String> {
        let params = json!([self.transaction(data)]);
        match self.rpc.call::<String>("eth_sendTransaction", params).await {
            Ok(tx_hash) => Ok(tx_hash),
            Err(RpcFailure::Transport {
                timed_out: true,
                message,
                ..
            }) => {
                warn!(error = %message, "Send timed out, outcome unknown");
                Err(RegistryError::TransactionTimeout {
                    backend: BackendKind::Evm,
                    image_hash,
                    tx_id: None,
                    waited: started.elapsed(),
                })
            }
            Err(failure) => Err(map_write_failure(failure)),
        }
    }

    async fn await_confirmation(&self, tx_hash: &str, image_hash: ImageHash, started: Instant) -> Result<Mined> {
        match tokio::time::timeout(self.config.confirmation_timeout, self.poll_receipt(tx_hash)).await {
            Ok(mined) => Ok(mined),
            Err(_) => {
                warn!(tx_id = %tx_hash, "Confirmation timed out");
                Err(RegistryError::TransactionTimeout {
                    backend: BackendKind::Evm,
                    image_hash,
                    tx_id: Some(tx_hash.to_string()),
                    waited: started.elapsed(),
                })
            }
        }
    }

    /// Poll until mined and deep enough. Errors while polling are logged and
    /// retried; only the surrounding timeout ends the wait.
    async fn poll_receipt(&self, tx_hash: &str) -> Mined {
        let required = self.config.confirmations.max(1);
        loop {
            match self.mined_status(tx_hash, required).await {
                Ok(Some(mined)) => return mined,
                Ok(None) => {}
                Err(e) => warn!(tx_id = %tx_hash, error = %e, "Receipt poll failed"),
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    async fn mined_status(&self, tx_hash: &str, required: u64) -> Result<Option<Mined>> {
        let receipt: Option<TransactionReceipt> = self
            .rpc
            .call_with_retry("eth_getTransactionReceipt", json!([tx_hash]))
            .await
            .map_err(RpcFailure::into_error)?;
        let Some(receipt) = receipt else {
            return Ok(None);
        };
        let Some(block) = receipt.block_number.as_deref() else {
            return Ok(None);
        };
        let block = parse_quantity(block)?;

        if receipt.status.as_deref() == Some("0x0") {
            return Ok(Some(Mined::Reverted(block)));
        }

        let head: String = self
            .rpc
            .call_with_retry("eth_blockNumber", json!([]))
            .await
            .map_err(RpcFailure::into_error)?;
        let depth = parse_quantity(&head)?.saturating_sub(block) + 1;
        debug!(tx_id = %tx_hash, block, depth, "Receipt observed");
        Ok((depth >= required).then_some(Mined::Succeeded(block)))
    }

    /// A mined revert means state changed between preflight and inclusion;
    /// the usual cause is a concurrent writer of the same hash.
    async fn explain_revert(&self, image_hashes: &[ImageHash], batch: bool) -> RegistryError {
        match self.batch_verify_existence(image_hashes).await {
            Ok(exists) => match exists.iter().position(|&e| e) {
                Some(i) => RegistryError::DuplicateHash {
                    image_hash: image_hashes[i],
                    index: batch.then_some(i),
                },
                None => RegistryError::rejected(BackendKind::Evm, "transaction reverted"),
            },
            Err(e) => e,
        }
    }

    async fn submit(&self, data: Vec<u8>, image_hashes: &[ImageHash], batch: bool) -> Result<(TxId, u64)> {
        let started = Instant::now();
        let first = image_hashes.first().copied().unwrap_or(ImageHash::ZERO);

        self.preflight(&data).await?;
        let tx_hash = self.send(&data, first, started).await?;
        info!(tx_id = %tx_hash, "Transaction broadcast");

        match self.await_confirmation(&tx_hash, first, started).await? {
            Mined::Succeeded(block) => {
                info!(
                    tx_id = %tx_hash,
                    block,
                    latency_ms = started.elapsed().as_millis() as u64,
                    "Transaction confirmed"
                );
                Ok((TxId::new(tx_hash), block))
            }
            Mined::Reverted(block) => {
                warn!(tx_id = %tx_hash, block, "Transaction reverted on inclusion");
                Err(self.explain_revert(image_hashes, batch).await)
            }
        }
    }
}

/// Map a failed preflight or send into the registry taxonomy.
fn map_write_failure(failure: RpcFailure) -> RegistryError {
    match failure {
        RpcFailure::Node(obj) => match obj.revert_data() {
            Some(data) if !data.is_empty() => Revert::decode(&data).into_error(),
            _ => RegistryError::rejected(BackendKind::Evm, obj.message),
        },
        other => other.into_error(),
    }
}

#[async_trait]
impl LedgerBackend for EvmLedger {
    fn kind(&self) -> BackendKind {
        BackendKind::Evm
    }

    fn network(&self) -> &str {
        &self.config.network
    }

    #[instrument(level = "debug", skip_all, fields(backend = "evm", image_hash = %record.image_hash))]
    async fn record_hash(&self, record: &EncodedRecord) -> Result<Receipt> {
        let data = abi::encode_record_hash(record);
        let (tx_id, block) = self.submit(data, &[record.image_hash], false).await?;
        Ok(Receipt::committed(tx_id, block, 1))
    }

    #[instrument(level = "debug", skip_all, fields(backend = "evm", image_hash = %image_hash))]
    async fn verify_hash(&self, image_hash: &ImageHash) -> Result<Verification> {
        let output = self.read(abi::encode_verify_hash(image_hash)).await?;
        let mut verification = abi::decode_verify_hash(image_hash, &output)?;
        if verification.found {
            let tx_id = self
                .recording_tx(image_hash, verification.entry.sequence_marker)
                .await;
            verification = verification.with_tx_id(tx_id);
        }
        debug!(found = verification.found, "Hash verified");
        Ok(verification)
    }

    #[instrument(level = "debug", skip_all, fields(backend = "evm", count = records.len()))]
    async fn batch_record_hashes(&self, records: &[EncodedRecord]) -> Result<Receipt> {
        check_batch_size(records.len(), &self.policy)?;
        if records.is_empty() {
            return Ok(Receipt::empty());
        }

        let data = abi::encode_batch_record_hashes(&BatchColumns::from_records(records));
        let hashes: Vec<ImageHash> = records.iter().map(|r| r.image_hash).collect();
        let (tx_id, block) = self.submit(data, &hashes, true).await?;
        Ok(Receipt::committed(tx_id, block, records.len()))
    }

    #[instrument(level = "debug", skip_all, fields(backend = "evm", count = image_hashes.len()))]
    async fn batch_verify_existence(&self, image_hashes: &[ImageHash]) -> Result<Vec<bool>> {
        if image_hashes.is_empty() {
            return Ok(Vec::new());
        }
        let output = self
            .read(abi::encode_batch_verify_existence(image_hashes))
            .await?;
        let flags = abi::decode_bool_array(&output)?;
        if flags.len() != image_hashes.len() {
            return Err(RegistryError::decode(format!(
                "Contract returned {} flags for {} hashes",
                flags.len(),
                image_hashes.len()
            )));
        }
        Ok(flags)
    }

    async fn stats(&self) -> Result<RegistryStats> {
        let output = self.read(abi::encode_get_stats()).await?;
        abi::decode_stats(&output)
    }
}
