//! Error taxonomy shared by every poller and by the orchestrator.
//!
//! A flat, serde-friendly enum with a `Display` impl derived from its
//! snake_case serialization, split along three axes: severity
//! ([`ErrorSeverity`]), category ([`ErrorCategory`]) and recovery guidance
//! ([`RecoveryAction`]).

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Severity of a poller failure; determines how `ChainStatus.status` is set and
/// whether the orchestrator can keep walking the chain order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    /// An on-chain negative signal (e.g. a failed IBC acknowledgement). Unretriable.
    TxError,
    /// A deterministic gate requiring external action (e.g. insufficient balance).
    UserActionRequired,
    /// Transport or logic error; retried locally, terminal after budget exhaustion.
    PollingError,
    /// Deadline exceeded at chain or global scope.
    PollingTimeout,
}

impl ErrorSeverity {
    /// Priority used by `checkFlowCompletion` when multiple chains have failed:
    /// higher values win when picking the flow-level terminal status.
    pub fn priority(self) -> u8 {
        match self {
            ErrorSeverity::UserActionRequired => 3,
            ErrorSeverity::TxError => 2,
            ErrorSeverity::PollingError => 1,
            ErrorSeverity::PollingTimeout => 0,
        }
    }
}

impl Display for ErrorSeverity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let json = serde_json::to_string(self).map_err(|_| std::fmt::Error)?;
        write!(f, "{}", json.trim_matches('"'))
    }
}

/// Coarse classification used to decide retry eligibility in [`crate::rpc::retry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Network,
    Rpc,
    Unknown,
}

/// Guidance surfaced alongside a terminal error, consumed by the outer shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    Retry,
    CheckConnection,
    CheckRpcStatus,
    ContactSupport,
    None,
}

/// The chain a [`PollError`] originated from, for display grouping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Chain {
    Evm,
    Noble,
    Namada,
}

impl Display for Chain {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Chain::Evm => write!(f, "evm"),
            Chain::Noble => write!(f, "noble"),
            Chain::Namada => write!(f, "namada"),
        }
    }
}

/// The error a poller returns on a failed [`crate::pollers::ChainPoller::poll`] call.
///
/// This is the wire shape from spec.md §6 ("Error taxonomy surfaced to the outside
/// world"), constructed by RPC adapters and poller logic and consumed by
/// `FlowOrchestrator::process_chain_result`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollError {
    pub severity: ErrorSeverity,
    pub message: String,
    pub occurred_at: crate::timestamp::EpochMillis,
    pub code: Option<String>,
    pub category: Option<ErrorCategory>,
    pub is_recoverable: Option<bool>,
    pub recovery_action: Option<RecoveryAction>,
    pub chain: Option<Chain>,
}

impl PollError {
    pub fn new(severity: ErrorSeverity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            occurred_at: crate::timestamp::EpochMillis::now(),
            code: None,
            category: None,
            is_recoverable: None,
            recovery_action: None,
            chain: None,
        }
    }

    pub fn with_category(mut self, category: ErrorCategory) -> Self {
        self.category = Some(category);
        self
    }

    pub fn with_chain(mut self, chain: Chain) -> Self {
        self.chain = Some(chain);
        self
    }

    pub fn with_recovery(mut self, recoverable: bool, action: RecoveryAction) -> Self {
        self.is_recoverable = Some(recoverable);
        self.recovery_action = Some(action);
        self
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorSeverity::PollingError, "Polling cancelled")
            .with_recovery(true, RecoveryAction::Retry)
    }

    pub fn aborted() -> Self {
        Self::new(ErrorSeverity::PollingError, "Polling aborted")
            .with_recovery(true, RecoveryAction::Retry)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorSeverity::PollingTimeout, message)
    }

    pub fn tx_error(message: impl Into<String>) -> Self {
        Self::new(ErrorSeverity::TxError, message)
            .with_recovery(false, RecoveryAction::ContactSupport)
    }

    pub fn user_action_required(message: impl Into<String>) -> Self {
        Self::new(ErrorSeverity::UserActionRequired, message)
            .with_recovery(true, RecoveryAction::Retry)
    }
}

/// A flow-identifying error raised outside the per-chain poll loop (e.g. a
/// prerequisite that never resolves), used by [`crate::orchestrator`].
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("missing prerequisite '{key}' for chain {chain} in {flow_type} flow")]
    MissingPrerequisite {
        key: &'static str,
        chain: Chain,
        flow_type: &'static str,
    },
    #[error("no polling state exists for transaction {0}")]
    NoState(String),
}
