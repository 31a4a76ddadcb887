//! The persisted data model (spec.md §3): transaction records, polling state,
//! per-chain status and stage lists.
//!
//! This module only defines the types and the pure merge/migration logic
//! ([`store`]); how a [`PollingState`] actually reaches disk is delegated to the
//! [`store::StateStore`] trait, since persistent key-value storage is explicitly
//! out of scope (spec.md §1) and is treated as an opaque ordered map.

pub mod store;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Chain, PollError};
use crate::metadata::{FlowMetadata, FlowType};
use crate::timestamp::EpochMillis;

/// Flow-level status (spec.md §3). Monotonic away from `Pending` only into a
/// terminal state; once terminal, only `retry` (a full state reset) re-enters
/// `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    Pending,
    Success,
    PollingError,
    PollingTimeout,
    TxError,
    UserActionRequired,
    Cancelled,
}

impl FlowStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, FlowStatus::Pending)
    }
}

/// Per-chain status, the same vocabulary as [`FlowStatus`] plus no further
/// distinction — a chain either mirrors the flow's outcome or is still working.
pub type ChainStatusKind = FlowStatus;

/// The outer transaction's lifecycle status, set by `checkFlowCompletion`
/// (spec.md §4.1) and consulted nowhere else in the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionOuterStatus {
    Pending,
    Broadcasted,
    Finalized,
    Error,
    Undetermined,
}

/// Sub-stages within a chain leg (spec.md §3). Ordinals below are the order a
/// chain's own stages are expected to occur in, used only for display grouping —
/// the state manager never reorders stages itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageName {
    EvmPolling,
    EvmMintConfirmed,
    EvmMintPolling,
    NoblePolling,
    NobleCctpMinted,
    NobleForwardingRegistration,
    NobleIbcForwarded,
    NobleReceived,
    NobleCctpBurned,
    NamadaPolling,
    NamadaReceived,
    NamadaIbcSent,
}

impl StageName {
    /// The chain this stage belongs to, used to stamp `metadata.chain` when
    /// flattening stages for display (spec.md §9).
    pub fn chain(self) -> Chain {
        match self {
            StageName::EvmPolling | StageName::EvmMintConfirmed | StageName::EvmMintPolling => {
                Chain::Evm
            }
            StageName::NoblePolling
            | StageName::NobleCctpMinted
            | StageName::NobleForwardingRegistration
            | StageName::NobleIbcForwarded
            | StageName::NobleReceived
            | StageName::NobleCctpBurned => Chain::Noble,
            StageName::NamadaPolling | StageName::NamadaReceived | StageName::NamadaIbcSent => {
                Chain::Namada
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Confirmed,
}

/// One entry in a chain's stage timeline (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainStage {
    pub stage: StageName,
    pub status: StageStatus,
    #[serde(default = "default_source")]
    pub source: String,
    pub occurred_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

fn default_source() -> String {
    "poller".to_string()
}

impl ChainStage {
    pub fn confirmed(stage: StageName) -> Self {
        Self {
            stage,
            status: StageStatus::Confirmed,
            source: default_source(),
            occurred_at: crate::timestamp::now_iso8601(),
            tx_hash: None,
            message: None,
            metadata: None,
        }
    }

    pub fn pending(stage: StageName) -> Self {
        Self {
            status: StageStatus::Pending,
            ..Self::confirmed(stage)
        }
    }

    pub fn with_tx_hash(mut self, tx_hash: impl Into<String>) -> Self {
        self.tx_hash = Some(tx_hash.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Per-chain poller configuration: timeout and poll interval.
///
/// `legacy_metadata` is not part of the current layout — it is the annex a
/// pre-migration record carried (spec.md §9: "Legacy state migration") and is
/// only ever populated by old data flowing in through [`store::StateStore`];
/// fresh writes never set it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainParams {
    #[serde(default)]
    pub timeout_ms: u64,
    #[serde(default)]
    pub interval_ms: u64,
    #[serde(default, rename = "metadata", skip_serializing_if = "Option::is_none")]
    pub legacy_metadata: Option<serde_json::Value>,
}

impl ChainParams {
    pub fn new(timeout_ms: u64, interval_ms: u64) -> Self {
        Self {
            timeout_ms,
            interval_ms,
            legacy_metadata: None,
        }
    }
}

/// Status of one leg of the flow (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainStatus {
    pub status: ChainStatusKind,
    #[serde(default)]
    pub completed_stages: Vec<StageName>,
    #[serde(default)]
    pub stages: Vec<ChainStage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_category: Option<crate::error::ErrorCategory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_recoverable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery_action: Option<crate::error::RecoveryAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_occurred_at: Option<EpochMillis>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_occurred_at: Option<EpochMillis>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_retry_at: Option<EpochMillis>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<EpochMillis>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl Default for ChainStatus {
    fn default() -> Self {
        Self {
            status: FlowStatus::Pending,
            completed_stages: Vec::new(),
            stages: Vec::new(),
            error_type: None,
            error_message: None,
            error_code: None,
            error_category: None,
            is_recoverable: None,
            recovery_action: None,
            error_occurred_at: None,
            timeout_occurred_at: None,
            retry_count: 0,
            last_retry_at: None,
            completed_at: None,
            metadata: serde_json::Value::Null,
        }
    }
}

impl ChainStatus {
    /// Apply a [`PollError`] to this chain's status, recording every field the
    /// wire error taxonomy carries (spec.md §6).
    pub fn apply_error(&mut self, err: &PollError) {
        self.status = match err.severity {
            crate::error::ErrorSeverity::TxError => FlowStatus::TxError,
            crate::error::ErrorSeverity::UserActionRequired => FlowStatus::UserActionRequired,
            crate::error::ErrorSeverity::PollingError => FlowStatus::PollingError,
            crate::error::ErrorSeverity::PollingTimeout => FlowStatus::PollingTimeout,
        };
        self.error_type = Some(format!("{}", err.severity));
        self.error_message = Some(err.message.clone());
        self.error_code = err.code.clone();
        self.error_category = err.category;
        self.is_recoverable = err.is_recoverable;
        self.recovery_action = err.recovery_action;
        self.error_occurred_at = Some(err.occurred_at);
        if matches!(err.severity, crate::error::ErrorSeverity::PollingTimeout) {
            self.timeout_occurred_at = Some(err.occurred_at);
        }
    }
}

/// The core's own persisted state (spec.md §3), one per transaction id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingState {
    pub flow_status: FlowStatus,
    pub flow_type: FlowType,
    pub started_at: EpochMillis,
    pub last_updated_at: EpochMillis,
    pub global_timeout_at: EpochMillis,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_chain: Option<Chain>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_completed_stage: Option<StageName>,
    #[serde(default)]
    pub metadata: FlowMetadata,
    #[serde(default)]
    pub chain_status: HashMap<Chain, ChainStatus>,
    #[serde(default)]
    pub chain_params: HashMap<Chain, ChainParams>,
}

impl PollingState {
    pub fn new(flow_type: FlowType, metadata: FlowMetadata) -> Self {
        let now = EpochMillis::now();
        Self {
            flow_status: FlowStatus::Pending,
            flow_type,
            started_at: now,
            last_updated_at: now,
            global_timeout_at: now,
            current_chain: None,
            latest_completed_stage: None,
            metadata,
            chain_status: HashMap::new(),
            chain_params: HashMap::new(),
        }
    }
}

/// A read-only view over the handful of transaction-record fields the core may
/// consult as fallbacks (spec.md §3); everything else about the record is opaque.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub flow_type: FlowType,
    pub created_at: EpochMillis,
    pub hash: Option<String>,
    pub block_height: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub polling_state: Option<PollingState>,
    #[serde(default)]
    pub status: TransactionOuterStatus,
    /// Fallback reconstruction fields used only by `start()`'s rehydration path
    /// when `metadata` is empty (spec.md §4.1).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namada_block_height: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namada_ibc_tx_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount_base_units: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forwarding_address: Option<String>,
}

impl Default for TransactionOuterStatus {
    fn default() -> Self {
        TransactionOuterStatus::Pending
    }
}
