//! Per-chain, per-direction polling strategies (spec.md §4.2-§4.4).
//!
//! Every poller implements the same shape: given what's known so far
//! ([`FlowMetadata`]) and a deadline, it watches its chain until the leg's
//! stage is confirmed, producing the [`ChainStage`] entries to persist and any
//! metadata learned along the way. The orchestrator owns sequencing and
//! timeout bookkeeping; a poller only ever answers "is my leg done yet".

pub mod evm;
pub mod namada;
pub mod noble;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{Chain, PollError};
use crate::metadata::{FlowMetadata, FlowType};
use crate::state::{ChainStage, StageName};
use crate::timestamp::EpochMillis;

/// Inputs a poller needs to watch its leg of a flow.
#[derive(Clone)]
pub struct PollParams {
    pub chain: Chain,
    pub flow_type: FlowType,
    pub metadata: FlowMetadata,
    pub chain_timeout_at: EpochMillis,
    pub interval_ms: u64,
    pub cancel: CancellationToken,
}

/// What a completed poll contributed: the stage(s) observed and any new
/// metadata fields discovered (merged into the flow's [`FlowMetadata`] via
/// [`FlowMetadata::merge_from`]).
#[derive(Debug, Clone, Default)]
pub struct ChainPollResult {
    pub stages: Vec<ChainStage>,
    pub metadata_patch: FlowMetadata,
}

/// A chain-direction-specific polling strategy.
#[async_trait]
pub trait ChainPoller: Send + Sync {
    /// Polls until the leg is confirmed, the deadline in `params` passes, or
    /// `params.cancel` fires. Returns the accumulated stages/metadata on
    /// success; a terminal [`PollError`] otherwise (including timeout and
    /// cancellation, which callers distinguish via `err.severity`).
    async fn poll(&self, params: PollParams) -> Result<ChainPollResult, PollError>;
}

/// Repeatedly calls `check` at `interval_ms` until it returns `Some`, the
/// chain deadline passes, or cancellation fires. `check` returning `Err`
/// short-circuits immediately — pollers use this for terminal on-chain
/// signals (e.g. a failed IBC acknowledgement) that a timeout should not mask.
pub(crate) async fn poll_until<F, Fut, T>(
    params: &PollParams,
    mut check: F,
) -> Result<T, PollError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<Option<T>, PollError>>,
{
    let mut interval = tokio::time::interval(std::time::Duration::from_millis(params.interval_ms));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        if params.cancel.is_cancelled() {
            return Err(PollError::cancelled());
        }
        if EpochMillis::now() >= params.chain_timeout_at {
            return Err(PollError::timeout(format!(
                "{} polling timed out for {:?} flow",
                params.chain, params.flow_type
            )));
        }
        if let Some(value) = check().await? {
            return Ok(value);
        }
        tokio::select! {
            _ = interval.tick() => {}
            _ = params.cancel.cancelled() => return Err(PollError::cancelled()),
        }
    }
}

/// Convenience for building a confirmed stage with a tx hash attached, the
/// shape every poller produces on success.
pub(crate) fn confirmed_stage(stage: StageName, tx_hash: impl Into<String>) -> ChainStage {
    ChainStage::confirmed(stage).with_tx_hash(tx_hash)
}
