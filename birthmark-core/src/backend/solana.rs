//! Solana registry program backend.
//!
//! Each recorded hash lives in its own program-derived account, seeded with
//! `["birthmark", image_hash]`, holding the 193-byte persisted record. The
//! registry state account (`["registry"]`) keeps the running total.
//!
//! Instruction data:
//!
//! | Tag | Instruction | Payload |
//! |-----|-------------|---------|
//! | 0 | Record | packed record (89 bytes) |
//! | 1 | BatchRecord | `u8` count, then packed records |
//!
//! Accounts: payer (signer), registry state, system program, then one record
//! account per hash in payload order.
//!
//! Transactions are capped at 1232 bytes, so batches on this ledger top out
//! well below the registry-wide batch ceiling. An oversize batch is rejected
//! locally as invalid input.
//!
//! ## Environment
//!
//! Required: `SOLANA_PROGRAM_ID`, `SOLANA_KEYPAIR_PATH`
//! Optional: `SOLANA_RPC_URL` (defaults to devnet), `SOLANA_CONFIRMATIONS`,
//! `SOLANA_NETWORK` (label reported with verified records)

use std::collections::HashSet;
use std::future::Future;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use solana_client::client_error::{ClientError, ClientErrorKind};
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_config::RpcSendTransactionConfig;
use solana_sdk::{
    commitment_config::CommitmentConfig,
    instruction::{AccountMeta, Instruction, InstructionError},
    message::Message,
    pubkey::Pubkey,
    signature::{read_keypair_file, Keypair, Signature, Signer},
    system_program,
    transaction::{Transaction, TransactionError},
};
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::{check_batch_size, BackendKind, LedgerBackend, Receipt, TxId};
use crate::codec::{PACKED_RECORD_LEN, STORED_RECORD_LEN};
use crate::config::{self, RegistryPolicy};
use crate::error::{RegistryError, Result};
use crate::hash::ImageHash;
use crate::record::{EncodedRecord, RegistryEntry, RegistryStats, Verification};
use crate::store::unix_now;

/// Solana Devnet RPC endpoint.
pub const DEVNET_RPC_URL: &str = "https://api.devnet.solana.com";

/// Largest serialized transaction the cluster accepts.
pub const MAX_TRANSACTION_SIZE: usize = 1232;

pub const RECORD_SEED: &[u8] = b"birthmark";
pub const REGISTRY_SEED: &[u8] = b"registry";

/// Most accounts one `getMultipleAccounts` request may name.
const MAX_ACCOUNTS_PER_REQUEST: usize = 100;

const TAG_RECORD: u8 = 0;
const TAG_BATCH_RECORD: u8 = 1;

const ERR_DUPLICATE_HASH: u32 = 0;
const ERR_FUTURE_TIMESTAMP: u32 = 1;
const ERR_BATCH_TOO_LARGE: u32 = 2;
const ERR_MALFORMED: u32 = 3;

const DEFAULT_CONFIRMATIONS: u64 = 1;
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Configuration for the Solana registry backend.
#[derive(Debug, Clone)]
pub struct SolanaConfig {
    pub rpc_url: Url,
    /// Label reported with verified records
    pub network: String,
    /// Deployed registry program
    pub program_id: Pubkey,
    /// Payer and submitter keypair (JSON byte array file)
    pub keypair_path: PathBuf,
    /// Confirmations required; a finalized (rooted) slot always satisfies it
    pub confirmations: u64,
    pub request_timeout: Duration,
    pub confirmation_timeout: Duration,
    pub poll_interval: Duration,
}

impl SolanaConfig {
    pub fn new(rpc_url: Url, program_id: Pubkey, keypair_path: impl Into<PathBuf>) -> Self {
        Self {
            rpc_url,
            network: "solana".to_string(),
            program_id,
            keypair_path: keypair_path.into(),
            confirmations: DEFAULT_CONFIRMATIONS,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            confirmation_timeout: DEFAULT_CONFIRMATION_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Create configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(&|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self> {
        let backend = BackendKind::Solana;
        let rpc_url = config::var(lookup, "SOLANA_RPC_URL").unwrap_or_else(|| DEVNET_RPC_URL.to_string());
        let rpc_url = config::parse_rpc_url(&rpc_url, backend)?;

        let program_id = config::required_var(lookup, "SOLANA_PROGRAM_ID", backend)?;
        let program_id = Pubkey::from_str(&program_id).map_err(|e| {
            RegistryError::InvalidInput(format!("Invalid SOLANA_PROGRAM_ID `{program_id}`: {e}"))
        })?;
        let keypair_path = config::required_var(lookup, "SOLANA_KEYPAIR_PATH", backend)?;

        let mut solana = Self::new(rpc_url, program_id, keypair_path);
        if let Some(confirmations) = config::parse_var::<u64>(lookup, "SOLANA_CONFIRMATIONS")? {
            solana.confirmations = confirmations;
        }
        if let Some(network) = config::var(lookup, "SOLANA_NETWORK") {
            solana.network = network;
        }
        Ok(solana)
    }
}

/// Record account address for a hash.
pub fn record_address(program_id: &Pubkey, image_hash: &ImageHash) -> Pubkey {
    Pubkey::find_program_address(&[RECORD_SEED, image_hash.as_bytes()], program_id).0
}

/// Registry state account address.
pub fn registry_address(program_id: &Pubkey) -> Pubkey {
    Pubkey::find_program_address(&[REGISTRY_SEED], program_id).0
}

/// Instruction data for a single record or a batch.
pub fn instruction_data(records: &[EncodedRecord], batch: bool) -> Result<Vec<u8>> {
    if !batch {
        let [record] = records else {
            return Err(RegistryError::InvalidInput(
                "Record instruction takes exactly one record".into(),
            ));
        };
        let mut data = Vec::with_capacity(1 + PACKED_RECORD_LEN);
        data.push(TAG_RECORD);
        data.extend_from_slice(&record.to_packed());
        return Ok(data);
    }

    let count = u8::try_from(records.len()).map_err(|_| {
        RegistryError::InvalidInput(format!("Batch of {} does not fit one instruction", records.len()))
    })?;
    let mut data = Vec::with_capacity(2 + records.len() * PACKED_RECORD_LEN);
    data.push(TAG_BATCH_RECORD);
    data.push(count);
    for record in records {
        data.extend_from_slice(&record.to_packed());
    }
    Ok(data)
}

/// Serialized size of a transaction carrying `message` with its signatures.
fn transaction_size(message: &Message) -> usize {
    let signatures = usize::from(message.header.num_required_signatures);
    // compact-u16 length prefix is a single byte below 128 signatures
    1 + signatures * 64 + message.serialize().len()
}

/// Registry program failures, by custom error code.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ProgramFailure {
    DuplicateHash,
    FutureTimestamp,
    BatchTooLarge,
    Malformed,
    Other(String),
}

fn classify(err: &TransactionError) -> ProgramFailure {
    match err {
        TransactionError::InstructionError(_, InstructionError::Custom(code)) => match *code {
            ERR_DUPLICATE_HASH => ProgramFailure::DuplicateHash,
            ERR_FUTURE_TIMESTAMP => ProgramFailure::FutureTimestamp,
            ERR_BATCH_TOO_LARGE => ProgramFailure::BatchTooLarge,
            ERR_MALFORMED => ProgramFailure::Malformed,
            other => ProgramFailure::Other(format!("custom program error {other}")),
        },
        // the record account already being allocated means the same thing
        TransactionError::InstructionError(_, InstructionError::AccountAlreadyInitialized) => {
            ProgramFailure::DuplicateHash
        }
        other => ProgramFailure::Other(other.to_string()),
    }
}

fn client_unavailable(context: &str, e: &ClientError) -> RegistryError {
    RegistryError::unavailable(BackendKind::Solana, format!("{context}: {e}"))
}

fn is_timeout(e: &ClientError) -> bool {
    matches!(e.kind(), ClientErrorKind::Reqwest(inner) if inner.is_timeout())
}

/// Existence flags fetched at most `MAX_ACCOUNTS_PER_REQUEST` at a time,
/// in input order.
async fn existence_in_chunks<F, Fut>(addresses: &[Pubkey], mut fetch: F) -> Result<Vec<bool>>
where
    F: FnMut(Vec<Pubkey>) -> Fut,
    Fut: Future<Output = Result<Vec<bool>>>,
{
    let mut flags = Vec::with_capacity(addresses.len());
    for chunk in addresses.chunks(MAX_ACCOUNTS_PER_REQUEST) {
        let chunk_flags = fetch(chunk.to_vec()).await?;
        if chunk_flags.len() != chunk.len() {
            return Err(RegistryError::decode(format!(
                "Node returned {} accounts for {} addresses",
                chunk_flags.len(),
                chunk.len()
            )));
        }
        flags.extend(chunk_flags);
    }
    Ok(flags)
}

/// Registry program client.
pub struct SolanaLedger {
    rpc: RpcClient,
    payer: Keypair,
    config: SolanaConfig,
    policy: RegistryPolicy,
    registry: Pubkey,
}

impl SolanaLedger {
    #[instrument(level = "debug", skip_all, fields(
        rpc_url = %config.rpc_url,
        program_id = %config.program_id
    ))]
    pub fn new(config: SolanaConfig, policy: RegistryPolicy) -> Result<Self> {
        let payer = read_keypair_file(&config.keypair_path).map_err(|e| {
            RegistryError::unavailable(
                BackendKind::Solana,
                format!("Failed to read keypair {}: {e}", config.keypair_path.display()),
            )
        })?;
        let rpc = RpcClient::new_with_timeout_and_commitment(
            config.rpc_url.to_string(),
            config.request_timeout,
            CommitmentConfig::confirmed(),
        );
        let registry = registry_address(&config.program_id);

        info!(payer = %payer.pubkey(), "Solana registry client created");
        Ok(Self {
            rpc,
            payer,
            config,
            policy,
            registry,
        })
    }

    pub fn payer(&self) -> Pubkey {
        self.payer.pubkey()
    }

    fn instruction(&self, records: &[EncodedRecord], batch: bool) -> Result<Instruction> {
        let mut accounts = vec![
            AccountMeta::new(self.payer.pubkey(), true),
            AccountMeta::new(self.registry, false),
            AccountMeta::new_readonly(system_program::id(), false),
        ];
        accounts.extend(
            records
                .iter()
                .map(|r| AccountMeta::new(record_address(&self.config.program_id, &r.image_hash), false)),
        );
        Ok(Instruction::new_with_bytes(
            self.config.program_id,
            &instruction_data(records, batch)?,
            accounts,
        ))
    }

    /// Exact index of the first hash already recorded or repeated in the submission.
    async fn precheck_duplicates(&self, records: &[EncodedRecord], batch: bool) -> Result<()> {
        let mut seen = HashSet::with_capacity(records.len());
        for (i, record) in records.iter().enumerate() {
            if !seen.insert(record.image_hash) {
                return Err(RegistryError::DuplicateHash {
                    image_hash: record.image_hash,
                    index: Some(i),
                });
            }
        }

        let hashes: Vec<ImageHash> = records.iter().map(|r| r.image_hash).collect();
        let exists = self.batch_verify_existence(&hashes).await?;
        match exists.iter().position(|&e| e) {
            Some(i) => Err(RegistryError::DuplicateHash {
                image_hash: hashes[i],
                index: batch.then_some(i),
            }),
            None => Ok(()),
        }
    }

    async fn program_error(
        &self,
        failure: ProgramFailure,
        records: &[EncodedRecord],
        batch: bool,
    ) -> RegistryError {
        match failure {
            ProgramFailure::DuplicateHash => {
                // a concurrent writer landed first; find which hash
                if let Err(e) = self.precheck_duplicates(records, batch).await {
                    return e;
                }
                RegistryError::rejected(BackendKind::Solana, "program reported a duplicate hash")
            }
            ProgramFailure::FutureTimestamp => {
                let max_allowed = unix_now().saturating_add(self.policy.future_tolerance.as_secs());
                let offender = records
                    .iter()
                    .enumerate()
                    .max_by_key(|(_, r)| r.captured_at);
                RegistryError::FutureTimestamp {
                    captured_at: offender.map(|(_, r)| r.captured_at).unwrap_or_default(),
                    max_allowed,
                    index: offender.and_then(|(i, _)| batch.then_some(i)),
                }
            }
            ProgramFailure::BatchTooLarge => RegistryError::BatchTooLarge {
                size: records.len(),
                max: self.policy.max_batch_size,
            },
            ProgramFailure::Malformed => {
                RegistryError::InvalidInput("Program rejected malformed instruction".into())
            }
            ProgramFailure::Other(reason) => RegistryError::rejected(BackendKind::Solana, reason),
        }
    }

    async fn submit(&self, records: &[EncodedRecord], batch: bool) -> Result<(TxId, u64)> {
        let started = Instant::now();
        let first = records.first().map(|r| r.image_hash).unwrap_or(ImageHash::ZERO);

        self.precheck_duplicates(records, batch).await?;

        let instruction = self.instruction(records, batch)?;
        let message = Message::new(&[instruction], Some(&self.payer.pubkey()));
        let size = transaction_size(&message);
        if size > MAX_TRANSACTION_SIZE {
            return Err(RegistryError::InvalidInput(format!(
                "Transaction of {size} bytes for {} records exceeds the {MAX_TRANSACTION_SIZE}-byte limit",
                records.len()
            )));
        }

        let blockhash = self
            .rpc
            .get_latest_blockhash()
            .await
            .map_err(|e| client_unavailable("Failed to get recent blockhash", &e))?;
        let transaction = Transaction::new(&[&self.payer], message, blockhash);
        let signature = transaction.signatures[0];

        let simulation = self
            .rpc
            .simulate_transaction(&transaction)
            .await
            .map_err(|e| client_unavailable("Simulation failed", &e))?;
        if let Some(err) = simulation.value.err {
            debug!(logs = ?simulation.value.logs, "Simulation rejected transaction");
            return Err(self.program_error(classify(&err), records, batch).await);
        }

        let send_config = RpcSendTransactionConfig {
            skip_preflight: true,
            ..Default::default()
        };
        if let Err(e) = self
            .rpc
            .send_transaction_with_config(&transaction, send_config)
            .await
        {
            if let Some(err) = e.get_transaction_error() {
                return Err(self.program_error(classify(&err), records, batch).await);
            }
            if is_timeout(&e) {
                warn!(tx_id = %signature, "Send timed out, outcome unknown");
                return Err(RegistryError::TransactionTimeout {
                    backend: BackendKind::Solana,
                    image_hash: first,
                    tx_id: Some(signature.to_string()),
                    waited: started.elapsed(),
                });
            }
            return Err(client_unavailable("Failed to send transaction", &e));
        }
        info!(tx_id = %signature, "Transaction sent");

        let outcome = tokio::time::timeout(
            self.config.confirmation_timeout,
            self.poll_status(&signature),
        )
        .await;
        match outcome {
            Ok(Ok(slot)) => {
                info!(
                    tx_id = %signature,
                    slot,
                    latency_ms = started.elapsed().as_millis() as u64,
                    "Transaction confirmed"
                );
                Ok((TxId::new(signature.to_string()), slot))
            }
            Ok(Err(err)) => {
                warn!(tx_id = %signature, error = %err, "Transaction failed on inclusion");
                Err(self.program_error(classify(&err), records, batch).await)
            }
            Err(_) => {
                warn!(tx_id = %signature, "Confirmation timed out");
                Err(RegistryError::TransactionTimeout {
                    backend: BackendKind::Solana,
                    image_hash: first,
                    tx_id: Some(signature.to_string()),
                    waited: started.elapsed(),
                })
            }
        }
    }

    /// Poll until confirmed deep enough; the landed slot on success.
    async fn poll_status(&self, signature: &Signature) -> std::result::Result<u64, TransactionError> {
        let required = self.config.confirmations.max(1);
        loop {
            match self.rpc.get_signature_statuses(&[*signature]).await {
                Ok(response) => {
                    if let Some(Some(status)) = response.value.into_iter().next() {
                        if let Some(err) = status.err {
                            return Err(err);
                        }
                        // None means rooted, which is as deep as it gets
                        let deep_enough = status
                            .confirmations
                            .map_or(true, |c| c as u64 >= required);
                        if deep_enough {
                            return Ok(status.slot);
                        }
                        debug!(tx_id = %signature, confirmations = ?status.confirmations, "Awaiting confirmations");
                    }
                }
                Err(e) => warn!(tx_id = %signature, error = %e, "Status poll failed"),
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// Signature of the transaction that created a record account.
    ///
    /// Record accounts are never written after creation, so the oldest
    /// successful signature touching one is its creator. Lookup failures
    /// leave the id unknown rather than failing the read.
    async fn creating_signature(&self, address: &Pubkey) -> Option<TxId> {
        match self.rpc.get_signatures_for_address(address).await {
            Ok(signatures) => signatures
                .iter()
                .rev()
                .find(|s| s.err.is_none())
                .map(|s| TxId::new(s.signature.clone())),
            Err(e) => {
                warn!(account = %address, error = %e, "Signature lookup failed");
                None
            }
        }
    }
}

fn decode_record_account(image_hash: &ImageHash, data: &[u8]) -> Result<RegistryEntry> {
    let bytes = data.get(..STORED_RECORD_LEN).ok_or_else(|| {
        RegistryError::decode(format!(
            "Record account holds {} bytes, expected {STORED_RECORD_LEN}",
            data.len()
        ))
    })?;
    let entry = RegistryEntry::from_bytes(bytes)?;
    if entry.record.image_hash != *image_hash {
        return Err(RegistryError::decode(format!(
            "Record account for {image_hash} holds {}",
            entry.record.image_hash
        )));
    }
    Ok(entry)
}

#[async_trait]
impl LedgerBackend for SolanaLedger {
    fn kind(&self) -> BackendKind {
        BackendKind::Solana
    }

    fn network(&self) -> &str {
        &self.config.network
    }

    #[instrument(level = "debug", skip_all, fields(backend = "solana", image_hash = %record.image_hash))]
    async fn record_hash(&self, record: &EncodedRecord) -> Result<Receipt> {
        let (tx_id, slot) = self.submit(std::slice::from_ref(record), false).await?;
        Ok(Receipt::committed(tx_id, slot, 1))
    }

    #[instrument(level = "debug", skip_all, fields(backend = "solana", image_hash = %image_hash))]
    async fn verify_hash(&self, image_hash: &ImageHash) -> Result<Verification> {
        let address = record_address(&self.config.program_id, image_hash);
        let response = self
            .rpc
            .get_account_with_commitment(&address, self.rpc.commitment())
            .await
            .map_err(|e| client_unavailable("Failed to fetch record account", &e))?;

        let verification = match response.value {
            Some(account) => {
                let entry = decode_record_account(image_hash, &account.data)?;
                Verification::found(entry).with_tx_id(self.creating_signature(&address).await)
            }
            None => Verification::not_found(),
        };
        debug!(found = verification.found, "Hash verified");
        Ok(verification)
    }

    #[instrument(level = "debug", skip_all, fields(backend = "solana", count = records.len()))]
    async fn batch_record_hashes(&self, records: &[EncodedRecord]) -> Result<Receipt> {
        check_batch_size(records.len(), &self.policy)?;
        if records.is_empty() {
            return Ok(Receipt::empty());
        }
        let (tx_id, slot) = self.submit(records, true).await?;
        Ok(Receipt::committed(tx_id, slot, records.len()))
    }

    #[instrument(level = "debug", skip_all, fields(backend = "solana", count = image_hashes.len()))]
    async fn batch_verify_existence(&self, image_hashes: &[ImageHash]) -> Result<Vec<bool>> {
        if image_hashes.is_empty() {
            return Ok(Vec::new());
        }
        let addresses: Vec<Pubkey> = image_hashes
            .iter()
            .map(|h| record_address(&self.config.program_id, h))
            .collect();
        let rpc = &self.rpc;
        existence_in_chunks(&addresses, move |chunk| async move {
            let accounts = rpc
                .get_multiple_accounts(&chunk)
                .await
                .map_err(|e| client_unavailable("Failed to fetch record accounts", &e))?;
            Ok(accounts.iter().map(Option::is_some).collect())
        })
        .await
    }

    async fn stats(&self) -> Result<RegistryStats> {
        let response = self
            .rpc
            .get_account_with_commitment(&self.registry, self.rpc.commitment())
            .await
            .map_err(|e| client_unavailable("Failed to fetch registry account", &e))?;
        let total_count = match response.value {
            Some(account) => {
                let bytes: [u8; 8] = account
                    .data
                    .get(..8)
                    .and_then(|b| b.try_into().ok())
                    .ok_or_else(|| RegistryError::decode("Registry account too small"))?;
                u64::from_le_bytes(bytes)
            }
            None => 0,
        };
        let commit_position = self
            .rpc
            .get_slot()
            .await
            .map_err(|e| client_unavailable("Failed to fetch slot", &e))?;
        Ok(RegistryStats {
            total_count,
            commit_position,
            total_transactions: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_camera_id;
    use chrono::Utc;
    use solana_sdk::signature::write_keypair_file;

    fn record(tag: &str) -> EncodedRecord {
        EncodedRecord {
            image_hash: ImageHash::digest(tag.as_bytes()),
            captured_at: 1_732_000_000,
            camera_id: encode_camera_id("camera_001"),
            latitude: 45_523_100,
            longitude: -122_676_500,
            has_geolocation: true,
        }
    }

    fn ledger_with_temp_keypair(dir: &tempfile::TempDir) -> SolanaLedger {
        let path = dir.path().join("payer.json");
        write_keypair_file(&Keypair::new(), &path).unwrap();
        let config = SolanaConfig::new(
            Url::parse("http://127.0.0.1:8899").unwrap(),
            Pubkey::new_unique(),
            path,
        );
        SolanaLedger::new(config, RegistryPolicy::default()).unwrap()
    }

    #[test]
    fn test_pdas_are_deterministic_and_distinct() {
        let program = Pubkey::new_unique();
        let a = record_address(&program, &record("a").image_hash);
        assert_eq!(a, record_address(&program, &record("a").image_hash));
        assert_ne!(a, record_address(&program, &record("b").image_hash));
        assert_ne!(a, registry_address(&program));
        assert!(!a.is_on_curve());
    }

    #[test]
    fn test_instruction_layout() {
        let single = instruction_data(&[record("a")], false).unwrap();
        assert_eq!(single.len(), 1 + PACKED_RECORD_LEN);
        assert_eq!(single[0], TAG_RECORD);
        assert_eq!(EncodedRecord::from_packed(&single[1..]).unwrap(), record("a"));

        let batch = instruction_data(&[record("a"), record("b")], true).unwrap();
        assert_eq!(batch[..2], [TAG_BATCH_RECORD, 2]);
        assert_eq!(batch.len(), 2 + 2 * PACKED_RECORD_LEN);

        assert!(instruction_data(&[record("a"), record("b")], false).is_err());
    }

    #[test]
    fn test_custom_error_classification() {
        let err = TransactionError::InstructionError(0, InstructionError::Custom(0));
        assert_eq!(classify(&err), ProgramFailure::DuplicateHash);
        let err = TransactionError::InstructionError(0, InstructionError::Custom(1));
        assert_eq!(classify(&err), ProgramFailure::FutureTimestamp);
        let err = TransactionError::InstructionError(0, InstructionError::Custom(2));
        assert_eq!(classify(&err), ProgramFailure::BatchTooLarge);
        let err = TransactionError::InstructionError(0, InstructionError::Custom(3));
        assert_eq!(classify(&err), ProgramFailure::Malformed);
        let err = TransactionError::InstructionError(0, InstructionError::Custom(77));
        assert!(matches!(classify(&err), ProgramFailure::Other(_)));
        assert!(matches!(
            classify(&TransactionError::BlockhashNotFound),
            ProgramFailure::Other(_)
        ));
    }

    #[test]
    fn test_record_account_decoding() {
        let entry = RegistryEntry {
            record: record("acct"),
            sequence_marker: 310_000_000,
        };
        let mut data = entry.to_bytes().to_vec();
        assert_eq!(decode_record_account(&entry.record.image_hash, &data).unwrap(), entry);

        assert!(decode_record_account(&record("other").image_hash, &data).is_err());
        data.truncate(100);
        assert!(decode_record_account(&entry.record.image_hash, &data).is_err());
    }

    #[test]
    fn test_transaction_size_limits_batches() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger_with_temp_keypair(&dir);

        let size_for = |n: usize| {
            let records: Vec<_> = (0..n).map(|i| record(&format!("s-{i}"))).collect();
            let ix = ledger.instruction(&records, true).unwrap();
            transaction_size(&Message::new(&[ix], Some(&ledger.payer())))
        };
        assert!(size_for(1) <= MAX_TRANSACTION_SIZE);
        assert!(size_for(100) > MAX_TRANSACTION_SIZE);
    }

    #[tokio::test]
    async fn test_existence_queried_in_chunks() {
        let addresses: Vec<Pubkey> = (0..250).map(|_| Pubkey::new_unique()).collect();
        let recorded: HashSet<Pubkey> = addresses.iter().step_by(7).copied().collect();

        let mut sizes = Vec::new();
        let flags = existence_in_chunks(&addresses, |chunk| {
            sizes.push(chunk.len());
            let found: Vec<bool> = chunk.iter().map(|a| recorded.contains(a)).collect();
            async move { Ok(found) }
        })
        .await
        .unwrap();

        assert_eq!(sizes, vec![100, 100, 50]);
        let expected: Vec<bool> = addresses.iter().map(|a| recorded.contains(a)).collect();
        assert_eq!(flags, expected);
    }

    #[tokio::test]
    async fn test_short_chunk_answer_is_decode_error() {
        let addresses: Vec<Pubkey> = (0..3).map(|_| Pubkey::new_unique()).collect();
        let result = existence_in_chunks(&addresses, |_| async { Ok(vec![true]) }).await;
        assert!(matches!(result, Err(RegistryError::DecodeError { .. })));
    }

    #[test]
    fn test_config_from_lookup() {
        let program = Pubkey::new_unique().to_string();
        let lookup = |name: &str| match name {
            "SOLANA_PROGRAM_ID" => Some(program.clone()),
            "SOLANA_KEYPAIR_PATH" => Some("/tmp/payer.json".to_string()),
            "SOLANA_CONFIRMATIONS" => Some("32".to_string()),
            _ => None,
        };
        let config = SolanaConfig::from_lookup(&lookup).unwrap();
        assert_eq!(config.rpc_url.as_str(), "https://api.devnet.solana.com/");
        assert_eq!(config.confirmations, 32);
        assert_eq!(config.network, "solana");

        let missing = |_: &str| -> Option<String> { None };
        assert!(matches!(
            SolanaConfig::from_lookup(&missing),
            Err(RegistryError::BackendUnavailable { backend: BackendKind::Solana, .. })
        ));
    }

    #[test]
    fn test_missing_keypair_is_unavailable() {
        let config = SolanaConfig::new(
            Url::parse(DEVNET_RPC_URL).unwrap(),
            Pubkey::new_unique(),
            "/nonexistent/payer.json",
        );
        assert!(matches!(
            SolanaLedger::new(config, RegistryPolicy::default()),
            Err(RegistryError::BackendUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_in_batch_duplicate_caught_before_network() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger_with_temp_keypair(&dir);
        let records = vec![record("x"), record("y"), record("x")];
        assert!(matches!(
            ledger.batch_record_hashes(&records).await,
            Err(RegistryError::DuplicateHash { index: Some(2), .. })
        ));
    }

    #[tokio::test]
    #[ignore = "requires network access to a cluster with the registry program deployed"]
    async fn test_live_record_and_verify() {
        let config = SolanaConfig::from_env().unwrap();
        let ledger = SolanaLedger::new(config, RegistryPolicy::default()).unwrap();

        let mut live = record(&Utc::now().to_rfc3339());
        live.captured_at = unix_now();
        let receipt = ledger.record_hash(&live).await.unwrap();

        let verification = ledger.verify_hash(&live.image_hash).await.unwrap();
        assert!(verification.found);
        assert_eq!(verification.entry.sequence_marker, receipt.sequence_marker);
    }
}
