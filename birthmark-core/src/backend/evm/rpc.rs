//! Ethereum JSON-RPC transport with retry and backoff for reads.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use backoff::{future::retry_notify, ExponentialBackoff};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;
use zeroize::Zeroizing;

use crate::backend::BackendKind;
use crate::error::{RegistryError, Result};

/// Retry settings for idempotent calls.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_interval: Duration,
    pub max_interval: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

/// Error object returned by the node.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

impl RpcErrorObject {
    /// Raw revert bytes, when the node attached them.
    pub fn revert_data(&self) -> Option<Vec<u8>> {
        let raw = match self.data.as_ref()? {
            Value::String(s) => s.as_str(),
            Value::Object(obj) => obj.get("data")?.as_str()?,
            _ => return None,
        };
        decode_hex(raw).ok()
    }
}

/// Why a call failed, before mapping into the registry taxonomy.
#[derive(Debug)]
pub enum RpcFailure {
    /// Connection, TLS or HTTP-level failure
    Transport { message: String, transient: bool, timed_out: bool },
    /// The node answered with an error object
    Node(RpcErrorObject),
    /// The node answered with something unparseable
    Malformed(String),
}

impl RpcFailure {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Transport { transient: true, .. })
    }

    pub fn into_error(self) -> RegistryError {
        match self {
            Self::Transport { message, .. } => RegistryError::unavailable(BackendKind::Evm, message),
            Self::Node(obj) => RegistryError::rejected(
                BackendKind::Evm,
                format!("RPC error {}: {}", obj.code, obj.message),
            ),
            Self::Malformed(message) => RegistryError::decode(message),
        }
    }
}

/// JSON-RPC client for one node endpoint.
pub struct RpcClient {
    client: Client,
    url: Url,
    api_key: Option<Zeroizing<String>>,
    retry: RetryConfig,
    timeout: Duration,
    next_id: AtomicU64,
}

impl RpcClient {
    pub fn new(
        url: Url,
        api_key: Option<Zeroizing<String>>,
        timeout: Duration,
        retry: RetryConfig,
    ) -> Result<Self> {
        let mut builder = Client::builder().timeout(timeout);
        if url.scheme() == "https" {
            builder = builder
                .https_only(true)
                .min_tls_version(reqwest::tls::Version::TLS_1_2);
        }
        let client = builder.build().map_err(|e| {
            RegistryError::unavailable(BackendKind::Evm, format!("Failed to create HTTP client: {e}"))
        })?;

        Ok(Self {
            client,
            url,
            api_key,
            retry,
            timeout,
            next_id: AtomicU64::new(1),
        })
    }

    /// Single attempt. Used for anything that must not be repeated.
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> std::result::Result<T, RpcFailure> {
        let start = Instant::now();
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };

        let mut builder = self.client.post(self.url.clone()).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key.as_str());
        }

        let response = builder.send().await.map_err(|e| RpcFailure::Transport {
            message: format!("{method} request failed: {e}"),
            transient: is_transient_error(&e),
            timed_out: e.is_timeout(),
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(RpcFailure::Transport {
                message: format!("{method} returned HTTP status {status}"),
                transient: is_transient_status(status),
                timed_out: status == StatusCode::GATEWAY_TIMEOUT,
            });
        }

        let body: RpcResponse = response
            .json()
            .await
            .map_err(|e| RpcFailure::Malformed(format!("Invalid {method} response: {e}")))?;

        debug!(
            method,
            latency_ms = start.elapsed().as_millis() as u64,
            "RPC call completed"
        );

        if let Some(error) = body.error {
            return Err(RpcFailure::Node(error));
        }
        serde_json::from_value(body.result.unwrap_or(Value::Null))
            .map_err(|e| RpcFailure::Malformed(format!("Unexpected {method} result: {e}")))
    }

    /// Call with exponential backoff on transient transport failures.
    ///
    /// Only for idempotent reads.
    pub async fn call_with_retry<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> std::result::Result<T, RpcFailure> {
        let backoff = ExponentialBackoff {
            initial_interval: self.retry.initial_interval,
            max_interval: self.retry.max_interval,
            max_elapsed_time: Some(self.timeout * self.retry.max_retries.max(1)),
            ..Default::default()
        };

        retry_notify(
            backoff,
            || {
                let params = params.clone();
                async move {
                    self.call::<T>(method, params).await.map_err(|failure| {
                        if failure.is_transient() {
                            backoff::Error::transient(failure)
                        } else {
                            backoff::Error::permanent(failure)
                        }
                    })
                }
            },
            |failure: RpcFailure, duration: Duration| {
                warn!(
                    method,
                    error = ?failure,
                    retry_after_ms = duration.as_millis() as u64,
                    "Retry scheduled"
                );
            },
        )
        .await
    }
}

/// Check if a reqwest error is transient and should be retried.
pub fn is_transient_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request()
}

/// Check if an HTTP status code indicates a transient error.
pub fn is_transient_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::TOO_MANY_REQUESTS
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
            | StatusCode::BAD_GATEWAY
    )
}

/// `0x`-prefixed hex string to bytes.
pub fn decode_hex(raw: &str) -> Result<Vec<u8>> {
    let digits = raw.strip_prefix("0x").unwrap_or(raw);
    hex::decode(digits).map_err(|e| RegistryError::decode(format!("Invalid hex `{raw}`: {e}")))
}

pub fn encode_hex(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

/// Parse a JSON-RPC quantity (`0x`-prefixed, no leading zeros required).
pub fn parse_quantity(raw: &str) -> Result<u64> {
    let digits = raw
        .strip_prefix("0x")
        .ok_or_else(|| RegistryError::decode(format!("Quantity `{raw}` missing 0x prefix")))?;
    if digits.is_empty() {
        return Err(RegistryError::decode("Empty quantity"));
    }
    u64::from_str_radix(digits, 16)
        .map_err(|e| RegistryError::decode(format!("Invalid quantity `{raw}`: {e}")))
}

pub fn to_quantity(value: u64) -> String {
    format!("0x{value:x}")
}
