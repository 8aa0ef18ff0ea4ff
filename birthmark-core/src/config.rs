//! Registry configuration.
//!
//! Everything can be built in code; `from_env` reads the same settings from
//! environment variables:
//!
//! | Variable | Meaning | Default |
//! |----------|---------|---------|
//! | `BIRTHMARK_BACKEND` | `simulated`, `evm` or `solana` | `simulated` |
//! | `BIRTHMARK_FUTURE_TOLERANCE_SECS` | allowed clock skew ahead of ledger time | 300 |
//! | `BIRTHMARK_MAX_BATCH_SIZE` | records per batch | 100 |
//! | `BIRTHMARK_NETWORK` | simulated network label | `simulated` |
//! | `BIRTHMARK_SIMULATED_LATENCY_MS` | artificial commit latency | 0 |
//!
//! Ledger-specific variables are documented on `EvmConfig` and `SolanaConfig`.

use std::str::FromStr;
use std::time::Duration;

use url::Url;

use crate::backend::{BackendConfig, BackendKind};
use crate::error::{RegistryError, Result, DEFAULT_FUTURE_TOLERANCE_SECS, DEFAULT_MAX_BATCH_SIZE};

/// Policy values every store enforces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryPolicy {
    /// How far a capture timestamp may sit ahead of ledger time
    pub future_tolerance: Duration,
    /// Maximum records accepted in one batch
    pub max_batch_size: usize,
}

impl Default for RegistryPolicy {
    fn default() -> Self {
        Self {
            future_tolerance: Duration::from_secs(DEFAULT_FUTURE_TOLERANCE_SECS),
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
        }
    }
}

impl RegistryPolicy {
    /// Read policy overrides from the environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(&env_lookup)
    }

    pub(crate) fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let future_tolerance = parse_var::<u64>(lookup, "BIRTHMARK_FUTURE_TOLERANCE_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.future_tolerance);

        let max_batch_size = parse_var::<usize>(lookup, "BIRTHMARK_MAX_BATCH_SIZE")?
            .unwrap_or(defaults.max_batch_size);
        if max_batch_size == 0 {
            return Err(RegistryError::InvalidInput(
                "BIRTHMARK_MAX_BATCH_SIZE must be at least 1".into(),
            ));
        }

        Ok(Self {
            future_tolerance,
            max_batch_size,
        })
    }
}

/// Full client configuration: which ledger, and the policy it enforces.
#[derive(Debug, Clone, Default)]
pub struct RegistryConfig {
    pub backend: BackendConfig,
    pub policy: RegistryPolicy,
}

impl RegistryConfig {
    pub fn simulated() -> Self {
        Self::default()
    }

    /// Build configuration from environment variables.
    ///
    /// An unknown backend name is `InvalidInput`; a known ledger with missing
    /// connection settings is `BackendUnavailable`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(&env_lookup)
    }

    pub(crate) fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self> {
        let kind = match lookup("BIRTHMARK_BACKEND") {
            Some(name) => name.parse::<BackendKind>()?,
            None => BackendKind::Simulated,
        };
        let policy = RegistryPolicy::from_lookup(lookup)?;
        let backend = BackendConfig::from_lookup(kind, lookup)?;
        Ok(Self { backend, policy })
    }
}

fn env_lookup(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

/// Fetch a variable, treating blank values as unset.
pub(crate) fn var(lookup: &dyn Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Fetch a variable the chosen ledger cannot run without.
pub(crate) fn required_var(
    lookup: &dyn Fn(&str) -> Option<String>,
    name: &str,
    backend: BackendKind,
) -> Result<String> {
    var(lookup, name).ok_or_else(|| {
        RegistryError::unavailable(backend, format!("{name} environment variable not set"))
    })
}

pub(crate) fn parse_var<T>(lookup: &dyn Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    var(lookup, name)
        .map(|raw| {
            raw.parse::<T>()
                .map_err(|e| RegistryError::InvalidInput(format!("Invalid {name} `{raw}`: {e}")))
        })
        .transpose()
}

/// Parse an RPC endpoint, accepting only http(s).
pub(crate) fn parse_rpc_url(raw: &str, backend: BackendKind) -> Result<Url> {
    let url = Url::parse(raw)
        .map_err(|e| RegistryError::InvalidInput(format!("Invalid {backend} RPC URL `{raw}`: {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        scheme => Err(RegistryError::InvalidInput(format!(
            "Unsupported {backend} RPC URL scheme `{scheme}`"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults_select_simulated() {
        let config = RegistryConfig::from_lookup(&lookup_from(&[])).unwrap();
        assert!(matches!(config.backend, BackendConfig::Simulated(_)));
        assert_eq!(config.policy, RegistryPolicy::default());
        assert_eq!(config.policy.max_batch_size, 100);
        assert_eq!(config.policy.future_tolerance, Duration::from_secs(300));
    }

    #[test]
    fn test_policy_overrides() {
        let lookup = lookup_from(&[
            ("BIRTHMARK_FUTURE_TOLERANCE_SECS", "60"),
            ("BIRTHMARK_MAX_BATCH_SIZE", " 25 "),
        ]);
        let policy = RegistryPolicy::from_lookup(&lookup).unwrap();
        assert_eq!(policy.future_tolerance, Duration::from_secs(60));
        assert_eq!(policy.max_batch_size, 25);
    }

    #[test]
    fn test_malformed_numbers_rejected() {
        let lookup = lookup_from(&[("BIRTHMARK_MAX_BATCH_SIZE", "lots")]);
        assert!(matches!(
            RegistryPolicy::from_lookup(&lookup),
            Err(RegistryError::InvalidInput(_))
        ));

        let lookup = lookup_from(&[("BIRTHMARK_MAX_BATCH_SIZE", "0")]);
        assert!(RegistryPolicy::from_lookup(&lookup).is_err());
    }

    #[test]
    fn test_unknown_backend_is_invalid_input() {
        let lookup = lookup_from(&[("BIRTHMARK_BACKEND", "carrier-pigeon")]);
        let err = RegistryConfig::from_lookup(&lookup).unwrap_err();
        assert!(matches!(err, RegistryError::InvalidInput(ref msg) if msg.contains("Unknown backend")));
    }

    #[test]
    fn test_simulated_settings() {
        let lookup = lookup_from(&[
            ("BIRTHMARK_BACKEND", "mock"),
            ("BIRTHMARK_NETWORK", "polygon-amoy"),
            ("BIRTHMARK_SIMULATED_LATENCY_MS", "15"),
        ]);
        let config = RegistryConfig::from_lookup(&lookup).unwrap();
        match config.backend {
            BackendConfig::Simulated(sim) => {
                assert_eq!(sim.network, "polygon-amoy");
                assert_eq!(sim.latency, Duration::from_millis(15));
            }
            other => panic!("expected simulated config, got {other:?}"),
        }
    }

    #[test]
    fn test_blank_values_are_unset() {
        let lookup = lookup_from(&[("BIRTHMARK_BACKEND", "simulated"), ("BIRTHMARK_NETWORK", "  ")]);
        assert_eq!(var(&lookup, "BIRTHMARK_NETWORK"), None);
    }

    #[test]
    fn test_rpc_url_validation() {
        assert!(parse_rpc_url("https://rpc.example.org", BackendKind::Evm).is_ok());
        assert!(matches!(
            parse_rpc_url("ftp://rpc.example.org", BackendKind::Evm),
            Err(RegistryError::InvalidInput(_))
        ));
        assert!(parse_rpc_url("not a url", BackendKind::Solana).is_err());
    }
}
