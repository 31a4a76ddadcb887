//! Timeout configuration (spec.md §4.7): per-chain timeout resolution and the
//! bounded-multiple global flow timeout.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::Chain;
use crate::metadata::FlowType;
use crate::timestamp::EpochMillis;

/// Default per-chain timeout when config is absent or non-positive: 20 minutes.
pub const DEFAULT_CHAIN_TIMEOUT_MS: u64 = 20 * 60 * 1000;

/// Default multiplier applied to the summed per-chain timeouts to derive the
/// global flow timeout.
pub const DEFAULT_GLOBAL_TIMEOUT_MULTIPLIER: f64 = 1.5;

/// Per-chain, per-direction timeout overrides, keyed the way a JSON config file
/// would express them: `{ "evm": { "deposit": 900000, "payment": 1200000 } }`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default)]
    pub chains: HashMap<Chain, DirectionTimeouts>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirectionTimeouts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deposit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment: Option<u64>,
}

impl TimeoutConfig {
    /// `getChainTimeout`: reads the configured value for `(chain, flow_type)`,
    /// falling back to [`DEFAULT_CHAIN_TIMEOUT_MS`] when absent or non-positive.
    pub fn chain_timeout_ms(&self, chain: Chain, flow_type: FlowType) -> u64 {
        let configured = self.chains.get(&chain).and_then(|d| match flow_type {
            FlowType::Deposit => d.deposit,
            FlowType::Payment => d.payment,
        });
        match configured {
            Some(ms) if ms > 0 => ms,
            _ => DEFAULT_CHAIN_TIMEOUT_MS,
        }
    }
}

/// Bounds applied after multiplying the summed per-chain timeouts.
#[derive(Debug, Clone, Copy, Default)]
pub struct GlobalTimeoutBounds {
    pub multiplier: Option<f64>,
    pub min_timeout_ms: Option<u64>,
    pub max_timeout_ms: Option<u64>,
}

/// `calculateGlobalTimeout`: sums the per-chain timeouts for the direction's
/// chain order, multiplies by `bounds.multiplier` (default
/// [`DEFAULT_GLOBAL_TIMEOUT_MULTIPLIER`]), then clamps to the optional bounds.
pub fn calculate_global_timeout_ms(
    config: &TimeoutConfig,
    flow_type: FlowType,
    bounds: GlobalTimeoutBounds,
) -> u64 {
    let sum: u64 = flow_type
        .chain_order()
        .iter()
        .map(|&chain| config.chain_timeout_ms(chain, flow_type))
        .sum();
    let multiplier = bounds.multiplier.unwrap_or(DEFAULT_GLOBAL_TIMEOUT_MULTIPLIER);
    let mut total = (sum as f64 * multiplier).round() as u64;
    if let Some(min) = bounds.min_timeout_ms {
        total = total.max(min);
    }
    if let Some(max) = bounds.max_timeout_ms {
        total = total.min(max);
    }
    total
}

/// Computes the absolute deadline the orchestrator arms its global timer at.
pub fn global_timeout_at(
    config: &TimeoutConfig,
    flow_type: FlowType,
    bounds: GlobalTimeoutBounds,
    started_at: EpochMillis,
) -> EpochMillis {
    started_at.checked_add_ms(calculate_global_timeout_ms(config, flow_type, bounds) as i64)
}
