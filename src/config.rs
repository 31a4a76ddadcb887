//! Configuration for the flow tracker: RPC endpoints, per-chain timeouts and
//! poll intervals, and the forwarding-registration sub-job.

use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::{env, fs};

use clap::Parser;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::Chain;
use crate::timeout::TimeoutConfig;

/// CLI arguments for the `flowtrack-cli` binary.
#[derive(Parser, Debug)]
#[command(name = "flowtrack-cli")]
#[command(about = "Cross-chain USDC transfer tracker")]
pub struct CliArgs {
    /// Path to the JSON configuration file.
    #[arg(long, short, env = "CONFIG", default_value = "config.json")]
    pub config: PathBuf,
}

/// A transparent wrapper that resolves environment variables during deserialization.
///
/// Supports both literal values and environment variable references:
/// - Literal: `"https://rpc.example.com"`
/// - Simple env var: `"$NOBLE_RPC_URL"`
/// - Braced env var: `"${NOBLE_RPC_URL}"`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiteralOrEnv<T>(T);

impl<T> LiteralOrEnv<T> {
    pub fn inner(&self) -> &T {
        &self.0
    }

    pub fn into_inner(self) -> T {
        self.0
    }

    fn parse_env_var_syntax(s: &str) -> Option<String> {
        if let Some(stripped) = s.strip_prefix("${") {
            stripped.strip_suffix('}').map(str::to_string)
        } else if let Some(stripped) = s.strip_prefix('$') {
            if !stripped.is_empty() && stripped.chars().all(|c| c.is_alphanumeric() || c == '_') {
                Some(stripped.to_string())
            } else {
                None
            }
        } else {
            None
        }
    }
}

impl<T> Deref for LiteralOrEnv<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T> DerefMut for LiteralOrEnv<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl<'de, T> Deserialize<'de> for LiteralOrEnv<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let value = if let Some(var_name) = Self::parse_env_var_syntax(&s) {
            env::var(&var_name).map_err(|_| {
                serde::de::Error::custom(format!(
                    "environment variable '{}' not found (referenced as '{}')",
                    var_name, s
                ))
            })?
        } else {
            s
        };
        value
            .parse::<T>()
            .map(LiteralOrEnv)
            .map_err(|e| serde::de::Error::custom(format!("failed to parse value: {}", e)))
    }
}

impl<T> Serialize for LiteralOrEnv<T>
where
    T: Serialize,
{
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.0.serialize(serializer)
    }
}

/// RPC connection settings for a single chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainRpcConfig {
    /// HTTP(S) URL for the chain's RPC/LCD/REST endpoint.
    pub http: LiteralOrEnv<Url>,
    /// Poll interval override for this chain, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_ms: Option<u64>,
    /// Client-side rate limit, requests per second.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<u32>,
    /// Maximum block span of a single `eth_getLogs` call for this chain; only
    /// meaningful for the EVM endpoint. Unset falls back to
    /// [`crate::rpc::evm::DEFAULT_MAX_BLOCK_RANGE`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_block_range: Option<u64>,
}

/// RPC endpoints for all three chains (spec.md §7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcEndpoints {
    pub evm: ChainRpcConfig,
    pub noble: ChainRpcConfig,
    pub namada: ChainRpcConfig,
}

impl RpcEndpoints {
    pub fn get(&self, chain: Chain) -> &ChainRpcConfig {
        match chain {
            Chain::Evm => &self.evm,
            Chain::Noble => &self.noble,
            Chain::Namada => &self.namada,
        }
    }
}

/// Default poll interval applied when a chain's `interval_ms` is unset.
pub fn default_poll_interval_ms() -> u64 {
    5_000
}

/// Forwarding-registration sub-job settings (spec.md §4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationConfig {
    /// Minimum Noble gas-token balance (in base units) required before the
    /// registration tx is broadcast.
    #[serde(default = "registration_defaults::default_min_balance")]
    pub min_balance_base_units: u128,
    /// How many times to retry balance polling before giving up with
    /// `UserActionRequired`.
    #[serde(default = "registration_defaults::default_balance_poll_attempts")]
    pub balance_poll_attempts: u32,
    #[serde(default = "registration_defaults::default_balance_poll_interval_ms")]
    pub balance_poll_interval_ms: u64,
}

mod registration_defaults {
    pub fn default_min_balance() -> u128 {
        1
    }
    pub fn default_balance_poll_attempts() -> u32 {
        12
    }
    pub fn default_balance_poll_interval_ms() -> u64 {
        5_000
    }
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            min_balance_base_units: registration_defaults::default_min_balance(),
            balance_poll_attempts: registration_defaults::default_balance_poll_attempts(),
            balance_poll_interval_ms: registration_defaults::default_balance_poll_interval_ms(),
        }
    }
}

/// Noble LCD (Cosmos SDK REST) settings backing the forwarding-registration
/// sub-job's balance check and broadcast (spec.md §4.6, §7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NobleLcdConfig {
    pub base_url: LiteralOrEnv<Url>,
    /// Base64-encoded, pre-signed registration transaction bytes. Signing is
    /// delegated outside this crate; this is whatever the signer produced.
    pub signed_tx_base64: LiteralOrEnv<String>,
}

/// Global-timeout multiplier and clamps (spec.md §4.7), serialized form of
/// [`crate::timeout::GlobalTimeoutBounds`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalTimeoutConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multiplier: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_timeout_ms: Option<u64>,
}

impl From<GlobalTimeoutConfig> for crate::timeout::GlobalTimeoutBounds {
    fn from(value: GlobalTimeoutConfig) -> Self {
        Self {
            multiplier: value.multiplier,
            min_timeout_ms: value.min_timeout_ms,
            max_timeout_ms: value.max_timeout_ms,
        }
    }
}

/// Top-level flow-tracker configuration, loaded from a JSON file with
/// environment-variable fallbacks for secrets and endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub rpc: RpcEndpoints,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub global_timeout: GlobalTimeoutConfig,
    #[serde(default)]
    pub registration: RegistrationConfig,
    pub noble_lcd: NobleLcdConfig,
}

/// Configuration load/parse failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file at {0}: {1}")]
    FileRead(PathBuf, std::io::Error),
    #[error("failed to parse config file: {0}")]
    JsonParse(#[from] serde_json::Error),
}

impl Config {
    /// Loads configuration from CLI arguments (`--config`, default `config.json`).
    pub fn load() -> Result<Self, ConfigError> {
        let cli_args = CliArgs::parse();
        let config_path = Path::new(&cli_args.config)
            .canonicalize()
            .map_err(|e| ConfigError::FileRead(cli_args.config, e))?;
        Self::load_from_path(config_path)
    }

    /// Loads and parses configuration from an explicit path, bypassing CLI
    /// argument parsing (used when a caller already has its own `clap::Parser`).
    pub fn load_from_path(path: PathBuf) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(&path).map_err(|e| ConfigError::FileRead(path, e))?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// The poll interval this chain should use: its own override, else the
    /// crate-wide default.
    pub fn poll_interval_ms(&self, chain: Chain) -> u64 {
        self.rpc
            .get(chain)
            .interval_ms
            .unwrap_or_else(default_poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_or_env_resolves_braced_var() {
        unsafe {
            env::set_var("FLOWTRACK_TEST_VAR", "42");
        }
        let wrapped: LiteralOrEnv<u32> =
            serde_json::from_str("\"${FLOWTRACK_TEST_VAR}\"").unwrap();
        assert_eq!(wrapped.into_inner(), 42);
        unsafe {
            env::remove_var("FLOWTRACK_TEST_VAR");
        }
    }

    #[test]
    fn literal_or_env_passes_through_literal() {
        let wrapped: LiteralOrEnv<u32> = serde_json::from_str("\"7\"").unwrap();
        assert_eq!(wrapped.into_inner(), 7);
    }

    #[test]
    fn rpc_endpoints_round_trip_from_json() {
        let json = r#"{
            "evm": {"http": "https://evm.example.com"},
            "noble": {"http": "https://noble.example.com", "interval_ms": 3000},
            "namada": {"http": "https://namada.example.com"}
        }"#;
        let endpoints: RpcEndpoints = serde_json::from_str(json).unwrap();
        assert_eq!(
            endpoints.get(Chain::Noble).interval_ms,
            Some(3000)
        );
    }
}
