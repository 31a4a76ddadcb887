//! Process-wide registry of in-flight flows, caching a running flow's
//! cancellation handle in a process-wide map the way a connection pool caches
//! its connections.
//!
//! [`FlowOrchestrator`] itself is stateless aside from its pollers and config —
//! all mutable progress lives in the [`crate::state::store::StateStore`]. What
//! this module adds is bookkeeping for the *task* driving a transaction id, so
//! a caller can cancel a running poll loop or ask whether one is already in
//! flight without holding onto a `JoinHandle` itself.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::error::OrchestratorError;
use crate::metadata::FlowMetadata;
use crate::metadata::FlowType;
use crate::orchestrator::FlowOrchestrator;

struct TrackedFlow {
    cancel_token: CancellationToken,
    handle: JoinHandle<Result<(), OrchestratorError>>,
}

/// Tracks which transaction ids currently have a polling task running, and
/// owns the [`FlowOrchestrator`] that drives them.
pub struct FlowRegistry {
    orchestrator: Arc<FlowOrchestrator>,
    tracked: DashMap<String, TrackedFlow>,
}

impl FlowRegistry {
    pub fn new(orchestrator: Arc<FlowOrchestrator>) -> Self {
        Self {
            orchestrator,
            tracked: DashMap::new(),
        }
    }

    /// `true` if a polling task for this transaction id is currently running.
    pub fn is_tracked(&self, tx_id: &str) -> bool {
        self.tracked.contains_key(tx_id)
    }

    /// Number of transactions with a live polling task.
    pub fn active_count(&self) -> usize {
        self.tracked.len()
    }

    /// Begins tracking a new transaction, spawning its polling loop in the
    /// background. A second call for the same id while one is already running
    /// is a no-op — the orchestrator's own `start`/`resume` merge on the
    /// persisted record, but a duplicate task would poll the same chain twice.
    pub fn start(self: &Arc<Self>, tx_id: String, flow_type: FlowType, metadata: FlowMetadata) {
        if self.is_tracked(&tx_id) {
            return;
        }
        let cancel_token = CancellationToken::new();
        let orchestrator = self.orchestrator.clone();
        let registry = Arc::clone(self);
        let spawned_id = tx_id.clone();
        let spawned_cancel = cancel_token.clone();
        let handle = tokio::spawn(async move {
            let result = orchestrator
                .start(&spawned_id, flow_type, metadata, spawned_cancel)
                .await;
            if let Err(ref err) = result {
                error!(tx_id = spawned_id, %err, "flow task exited with an error");
            }
            registry.tracked.remove(&spawned_id);
            result
        });
        self.tracked.insert(tx_id, TrackedFlow { cancel_token, handle });
    }

    /// Resumes a transaction whose polling task isn't currently running
    /// (e.g. after a process restart), re-reading its persisted state.
    pub fn resume(self: &Arc<Self>, tx_id: String) {
        if self.is_tracked(&tx_id) {
            return;
        }
        let cancel_token = CancellationToken::new();
        let orchestrator = self.orchestrator.clone();
        let registry = Arc::clone(self);
        let spawned_id = tx_id.clone();
        let spawned_cancel = cancel_token.clone();
        let handle = tokio::spawn(async move {
            let result = orchestrator.resume(&spawned_id, spawned_cancel).await;
            if let Err(ref err) = result {
                error!(tx_id = spawned_id, %err, "flow task exited with an error");
            }
            registry.tracked.remove(&spawned_id);
            result
        });
        self.tracked.insert(tx_id, TrackedFlow { cancel_token, handle });
    }

    /// Cancels a transaction's polling task if one is running, and marks its
    /// persisted state cancelled regardless (the orchestrator's `cancel` is
    /// idempotent against an already-terminal flow).
    pub async fn cancel(&self, tx_id: &str) -> Result<(), OrchestratorError> {
        let cancel_token = self
            .tracked
            .get(tx_id)
            .map(|entry| entry.cancel_token.clone())
            .unwrap_or_else(CancellationToken::new);
        self.orchestrator.cancel(tx_id, &cancel_token).await
    }

    /// Retries a terminal, non-cancelled flow, spawning a fresh polling task.
    /// Fails if one is already running for this id.
    pub fn retry(self: &Arc<Self>, tx_id: String) -> Result<(), OrchestratorError> {
        if self.is_tracked(&tx_id) {
            return Err(OrchestratorError::NoState(format!(
                "{tx_id} already has a polling task running"
            )));
        }
        let cancel_token = CancellationToken::new();
        let orchestrator = self.orchestrator.clone();
        let registry = Arc::clone(self);
        let spawned_id = tx_id.clone();
        let spawned_cancel = cancel_token.clone();
        let handle = tokio::spawn(async move {
            let result = orchestrator.retry(&spawned_id, spawned_cancel).await;
            if let Err(ref err) = result {
                error!(tx_id = spawned_id, %err, "flow task exited with an error");
            }
            registry.tracked.remove(&spawned_id);
            result
        });
        self.tracked.insert(tx_id, TrackedFlow { cancel_token, handle });
        Ok(())
    }

    /// Cancels every tracked task and waits for them to unwind, used on
    /// graceful shutdown alongside [`crate::sig_down::SigDown`].
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.tracked.iter().map(|e| e.key().clone()).collect();
        for id in &ids {
            if let Some((_, tracked)) = self.tracked.remove(id) {
                tracked.cancel_token.cancel();
                let _ = tracked.handle.await;
            }
        }
    }
}
