//! The flow state machine (spec.md §4.1) that drives a transfer across its
//! three legs in order, persisting progress after every step so a crash or a
//! `resume()` call picks up exactly where polling left off.

use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::GlobalTimeoutConfig;
use crate::error::{Chain, ErrorSeverity, OrchestratorError, PollError};
use crate::metadata::{FlowMetadata, FlowType};
use crate::pollers::{ChainPoller, PollParams};
use crate::state::store::{StateStore, get_polling_state};
use crate::state::{ChainParams, FlowStatus, PollingState, TransactionOuterStatus, TransactionRecord};
use crate::timeout::{self, TimeoutConfig};
use crate::timestamp::EpochMillis;

/// Cooldown between automatic retries of a leg that failed with
/// `UserActionRequired` (spec.md §4.1 "retry loop") — the gate (e.g. a
/// balance threshold) may clear on its own, so the orchestrator keeps the
/// flow alive and re-polls the same chain rather than going terminal.
const USER_ACTION_RETRY_COOLDOWN_MS: u64 = 30_000;

/// Everything the orchestrator needs to drive a transaction from start to
/// terminal status: the pollers for each chain and the timeout policy.
pub struct FlowOrchestrator {
    store: Arc<dyn StateStore>,
    pollers: HashMap<Chain, Arc<dyn ChainPoller>>,
    timeout_config: TimeoutConfig,
    global_timeout_config: GlobalTimeoutConfig,
}

impl FlowOrchestrator {
    pub fn new(
        store: Arc<dyn StateStore>,
        pollers: HashMap<Chain, Arc<dyn ChainPoller>>,
        timeout_config: TimeoutConfig,
        global_timeout_config: GlobalTimeoutConfig,
    ) -> Self {
        Self {
            store,
            pollers,
            timeout_config,
            global_timeout_config,
        }
    }

    /// Begins tracking a new transaction. If one already exists for this id,
    /// falls back to [`Self::resume`] rather than erroring, so callers don't
    /// need to distinguish first-seen from reconnecting webhooks.
    pub async fn start(
        &self,
        tx_id: &str,
        flow_type: FlowType,
        metadata: FlowMetadata,
        cancel: CancellationToken,
    ) -> Result<(), OrchestratorError> {
        if self.store.load(tx_id).await.is_some() {
            return self.resume(tx_id, cancel).await;
        }
        let mut state = PollingState::new(flow_type, metadata.clone());
        state.global_timeout_at = timeout::global_timeout_at(
            &self.timeout_config,
            flow_type,
            self.global_timeout_config.clone().into(),
            state.started_at,
        );
        state.current_chain = flow_type.chain_order().first().copied();
        let record = TransactionRecord {
            flow_type,
            created_at: state.started_at,
            hash: metadata.tx_hash,
            block_height: None,
            polling_state: Some(state),
            status: TransactionOuterStatus::Pending,
            namada_block_height: metadata.namada_block_height,
            namada_ibc_tx_hash: metadata.namada_ibc_tx_hash,
            recipient: metadata.recipient,
            amount_base_units: metadata.amount_base_units,
            forwarding_address: metadata.forwarding_address,
        };
        self.store.save(tx_id, record).await;
        info!(tx_id, ?flow_type, "started tracking flow");
        self.execute(tx_id, cancel).await
    }

    /// Resumes an existing transaction's polling loop from its persisted
    /// `current_chain`, e.g. after a process restart.
    pub async fn resume(&self, tx_id: &str, cancel: CancellationToken) -> Result<(), OrchestratorError> {
        let state = get_polling_state(self.store.as_ref(), tx_id)
            .await
            .ok_or_else(|| OrchestratorError::NoState(tx_id.to_string()))?;
        if state.flow_status.is_terminal() {
            info!(tx_id, status = ?state.flow_status, "flow already terminal, nothing to resume");
            return Ok(());
        }
        self.execute(tx_id, cancel).await
    }

    /// Marks a flow cancelled. The in-flight poll (if any) observes
    /// `cancel_token` and returns a [`PollError::cancelled`], which
    /// [`Self::execute`] translates into `FlowStatus::Cancelled`.
    pub async fn cancel(&self, tx_id: &str, cancel_token: &CancellationToken) -> Result<(), OrchestratorError> {
        cancel_token.cancel();
        let mut record = self
            .store
            .load(tx_id)
            .await
            .ok_or_else(|| OrchestratorError::NoState(tx_id.to_string()))?;
        if let Some(state) = record.polling_state.as_mut() {
            if !state.flow_status.is_terminal() {
                state.flow_status = FlowStatus::Cancelled;
                state.last_updated_at = EpochMillis::now();
                record.status = outer_status_for(state.flow_status);
            }
        }
        self.store.save(tx_id, record).await;
        Ok(())
    }

    /// Resets a terminal, non-success flow back to `Pending` on its first
    /// chain and re-enters [`Self::execute`] — the only path back out of a
    /// terminal status besides `Cancelled` staying cancelled.
    pub async fn retry(&self, tx_id: &str, cancel: CancellationToken) -> Result<(), OrchestratorError> {
        let mut record = self
            .store
            .load(tx_id)
            .await
            .ok_or_else(|| OrchestratorError::NoState(tx_id.to_string()))?;
        {
            let state = record
                .polling_state
                .as_mut()
                .ok_or_else(|| OrchestratorError::NoState(tx_id.to_string()))?;
            state.flow_status = FlowStatus::Pending;
            state.current_chain = state.flow_type.chain_order().first().copied();
            state.global_timeout_at = timeout::global_timeout_at(
                &self.timeout_config,
                state.flow_type,
                self.global_timeout_config.clone().into(),
                EpochMillis::now(),
            );
        }
        record.status = TransactionOuterStatus::Pending;
        self.store.save(tx_id, record).await;
        self.execute(tx_id, cancel).await
    }

    /// Walks the flow's chain order starting at `current_chain`, running each
    /// chain job in turn and persisting after every step.
    async fn execute(&self, tx_id: &str, cancel: CancellationToken) -> Result<(), OrchestratorError> {
        loop {
            let mut record = self
                .store
                .load(tx_id)
                .await
                .ok_or_else(|| OrchestratorError::NoState(tx_id.to_string()))?;
            let mut state = record
                .polling_state
                .take()
                .ok_or_else(|| OrchestratorError::NoState(tx_id.to_string()))?;

            if state.flow_status.is_terminal() {
                return Ok(());
            }

            if EpochMillis::now() >= state.global_timeout_at {
                state.flow_status = FlowStatus::PollingTimeout;
                state.last_updated_at = EpochMillis::now();
                record.status = outer_status_for(state.flow_status);
                record.polling_state = Some(state);
                self.store.save(tx_id, record).await;
                warn!(tx_id, "global timeout exceeded");
                return Ok(());
            }

            let Some(chain) = state.current_chain else {
                self.finish_flow(tx_id, &mut record, &mut state).await;
                return Ok(());
            };

            match self.execute_chain_job(tx_id, &mut state, chain, &cancel).await {
                Ok(()) => {
                    let chain_order = state.flow_type.chain_order();
                    let position = chain_order.iter().position(|&c| c == chain);
                    state.current_chain = position.and_then(|i| chain_order.get(i + 1)).copied();
                    state.latest_completed_stage = state
                        .chain_status
                        .get(&chain)
                        .and_then(|cs| cs.stages.last())
                        .map(|s| s.stage);
                    state.last_updated_at = EpochMillis::now();
                    if state.current_chain.is_none() {
                        self.finish_flow(tx_id, &mut record, &mut state).await;
                        return Ok(());
                    }
                    record.polling_state = Some(state);
                    self.store.save(tx_id, record).await;
                }
                Err(err) if err.severity == ErrorSeverity::UserActionRequired => {
                    state.chain_status.entry(chain).or_default().apply_error(&err);
                    state.last_updated_at = EpochMillis::now();
                    record.polling_state = Some(state);
                    self.store.save(tx_id, record).await;
                    warn!(
                        tx_id, %chain, message = %err.message,
                        "chain leg requires user action, retrying automatically after cooldown"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(std::time::Duration::from_millis(USER_ACTION_RETRY_COOLDOWN_MS)) => {}
                        _ = cancel.cancelled() => {
                            self.cancel(tx_id, &cancel).await?;
                            return Ok(());
                        }
                    }
                }
                Err(err) => {
                    state.chain_status.entry(chain).or_default().apply_error(&err);
                    state.flow_status = flow_status_for_error(&err);
                    state.last_updated_at = EpochMillis::now();
                    record.status = outer_status_for(state.flow_status);
                    warn!(tx_id, %chain, severity = ?err.severity, message = %err.message, "chain leg failed");
                    record.polling_state = Some(state);
                    self.store.save(tx_id, record).await;
                    return Ok(());
                }
            }
        }
    }

    /// Runs one chain's poller and folds its results into `state`. A Noble
    /// deposit's forwarding-registration gate lives inside that poller now,
    /// not here, so this is just dispatch plus timeout/interval bookkeeping.
    async fn execute_chain_job(
        &self,
        tx_id: &str,
        state: &mut PollingState,
        chain: Chain,
        cancel: &CancellationToken,
    ) -> Result<(), PollError> {
        let poller = self
            .pollers
            .get(&chain)
            .ok_or_else(|| PollError::new(ErrorSeverity::PollingError, format!("no poller registered for {chain}")))?
            .clone();

        let interval_ms = state
            .chain_params
            .get(&chain)
            .map(|p| p.interval_ms)
            .filter(|&ms| ms > 0)
            .unwrap_or(5_000);
        let chain_timeout_ms = self.timeout_config.chain_timeout_ms(chain, state.flow_type);
        let chain_timeout_at = EpochMillis::now().checked_add_ms(chain_timeout_ms as i64);
        state
            .chain_params
            .insert(chain, ChainParams::new(chain_timeout_ms, interval_ms));

        let params = PollParams {
            chain,
            flow_type: state.flow_type,
            metadata: state.metadata.clone(),
            chain_timeout_at,
            interval_ms,
            cancel: cancel.clone(),
        };

        info!(tx_id, %chain, "polling chain leg");
        let result = poller.poll(params).await?;

        let status = state.chain_status.entry(chain).or_default();
        for stage in result.stages {
            status.completed_stages.push(stage.stage);
            status.stages.push(stage);
        }
        status.status = FlowStatus::Success;
        status.completed_at = Some(EpochMillis::now());
        state.metadata.merge_from(result.metadata_patch);
        Ok(())
    }

    /// Sets the outer transaction status once every chain in the flow's order
    /// has completed successfully, and persists the final state.
    async fn finish_flow(&self, tx_id: &str, record: &mut TransactionRecord, state: &mut PollingState) {
        let all_succeeded = state
            .flow_type
            .chain_order()
            .iter()
            .all(|chain| matches!(state.chain_status.get(chain), Some(cs) if cs.status == FlowStatus::Success));
        state.flow_status = if all_succeeded { FlowStatus::Success } else { FlowStatus::PollingError };
        state.last_updated_at = EpochMillis::now();
        record.status = outer_status_for(state.flow_status);
        record.polling_state = Some(state.clone());
        self.store.save(tx_id, record.clone()).await;
        info!(tx_id, status = ?state.flow_status, "flow complete");
    }
}

fn flow_status_for_error(err: &PollError) -> FlowStatus {
    if err.message == "Polling cancelled" || err.message == "Polling aborted" {
        return FlowStatus::Cancelled;
    }
    match err.severity {
        ErrorSeverity::TxError => FlowStatus::TxError,
        ErrorSeverity::UserActionRequired => FlowStatus::UserActionRequired,
        ErrorSeverity::PollingError => FlowStatus::PollingError,
        ErrorSeverity::PollingTimeout => FlowStatus::PollingTimeout,
    }
}

/// Maps the core `FlowStatus` onto the outer record's lifecycle vocabulary
/// (spec.md §3), used by callers presenting status to the outside world.
pub fn outer_status_for(flow_status: FlowStatus) -> TransactionOuterStatus {
    match flow_status {
        FlowStatus::Pending => TransactionOuterStatus::Pending,
        FlowStatus::Success => TransactionOuterStatus::Finalized,
        FlowStatus::Cancelled | FlowStatus::PollingTimeout => TransactionOuterStatus::Undetermined,
        // Still in motion — the orchestrator retries this automatically
        // rather than surfacing a hard failure (spec.md's `checkFlowCompletion`).
        FlowStatus::UserActionRequired => TransactionOuterStatus::Broadcasted,
        FlowStatus::TxError | FlowStatus::PollingError => TransactionOuterStatus::Error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::store::InMemoryStateStore;
    use crate::state::{ChainStage, StageName};

    struct ImmediateSuccessPoller {
        stage: StageName,
        patch: FlowMetadata,
    }

    #[async_trait::async_trait]
    impl ChainPoller for ImmediateSuccessPoller {
        async fn poll(&self, _params: PollParams) -> Result<crate::pollers::ChainPollResult, PollError> {
            Ok(crate::pollers::ChainPollResult {
                stages: vec![ChainStage::confirmed(self.stage).with_tx_hash("0xabc")],
                metadata_patch: self.patch.clone(),
            })
        }
    }

    struct AlwaysFailingPoller;

    #[async_trait::async_trait]
    impl ChainPoller for AlwaysFailingPoller {
        async fn poll(&self, _params: PollParams) -> Result<crate::pollers::ChainPollResult, PollError> {
            Err(PollError::tx_error("simulated on-chain failure"))
        }
    }

    fn deposit_metadata() -> FlowMetadata {
        FlowMetadata {
            tx_hash: Some("0xdeposit".to_string()),
            forwarding_address: Some("noble1forward".to_string()),
            namada_receiver: Some("tnam1receiver".to_string()),
            cctp_nonce: Some(1),
            packet_sequence: Some(2),
            start_height: Some(100),
            ..Default::default()
        }
    }

    fn build_orchestrator(
        pollers: HashMap<Chain, Arc<dyn ChainPoller>>,
        store: Arc<dyn StateStore>,
    ) -> FlowOrchestrator {
        FlowOrchestrator::new(store, pollers, TimeoutConfig::default(), GlobalTimeoutConfig::default())
    }

    #[tokio::test]
    async fn start_walks_every_chain_and_reaches_success() {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
        let mut pollers: HashMap<Chain, Arc<dyn ChainPoller>> = HashMap::new();
        pollers.insert(
            Chain::Evm,
            Arc::new(ImmediateSuccessPoller {
                stage: StageName::EvmPolling,
                patch: FlowMetadata::default(),
            }),
        );
        pollers.insert(
            Chain::Noble,
            Arc::new(ImmediateSuccessPoller {
                stage: StageName::NobleCctpMinted,
                patch: FlowMetadata::default(),
            }),
        );
        pollers.insert(
            Chain::Namada,
            Arc::new(ImmediateSuccessPoller {
                stage: StageName::NamadaReceived,
                patch: FlowMetadata::default(),
            }),
        );
        let orchestrator = build_orchestrator(pollers, store.clone());

        orchestrator
            .start("tx-1", FlowType::Deposit, deposit_metadata(), CancellationToken::new())
            .await
            .unwrap();

        let state = get_polling_state(store.as_ref(), "tx-1").await.unwrap();
        assert_eq!(state.flow_status, FlowStatus::Success);
        assert!(state.current_chain.is_none());
        for chain in FlowType::Deposit.chain_order() {
            assert_eq!(state.chain_status.get(chain).unwrap().status, FlowStatus::Success);
        }
    }

    #[tokio::test]
    async fn a_failing_leg_sets_flow_to_its_error_severity_and_stops() {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
        let mut pollers: HashMap<Chain, Arc<dyn ChainPoller>> = HashMap::new();
        pollers.insert(
            Chain::Evm,
            Arc::new(ImmediateSuccessPoller {
                stage: StageName::EvmPolling,
                patch: FlowMetadata::default(),
            }),
        );
        pollers.insert(Chain::Noble, Arc::new(AlwaysFailingPoller));
        pollers.insert(
            Chain::Namada,
            Arc::new(ImmediateSuccessPoller {
                stage: StageName::NamadaReceived,
                patch: FlowMetadata::default(),
            }),
        );
        let orchestrator = build_orchestrator(pollers, store.clone());

        orchestrator
            .start("tx-2", FlowType::Deposit, deposit_metadata(), CancellationToken::new())
            .await
            .unwrap();

        let state = get_polling_state(store.as_ref(), "tx-2").await.unwrap();
        assert_eq!(state.flow_status, FlowStatus::TxError);
        assert_eq!(state.current_chain, Some(Chain::Noble));
        assert_eq!(
            state.chain_status.get(&Chain::Noble).unwrap().error_message.as_deref(),
            Some("simulated on-chain failure")
        );
    }

    #[tokio::test]
    async fn cancel_marks_a_pending_flow_cancelled_without_touching_a_terminal_one() {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
        let mut pollers: HashMap<Chain, Arc<dyn ChainPoller>> = HashMap::new();
        pollers.insert(Chain::Evm, Arc::new(AlwaysFailingPoller));
        pollers.insert(Chain::Noble, Arc::new(AlwaysFailingPoller));
        pollers.insert(Chain::Namada, Arc::new(AlwaysFailingPoller));
        let orchestrator = build_orchestrator(pollers, store.clone());

        orchestrator
            .start("tx-3", FlowType::Deposit, deposit_metadata(), CancellationToken::new())
            .await
            .unwrap();
        // The flow already terminated (TxError) by the time start() returns;
        // cancel() must not clobber that terminal status.
        let cancel_token = CancellationToken::new();
        orchestrator.cancel("tx-3", &cancel_token).await.unwrap();
        let state = get_polling_state(store.as_ref(), "tx-3").await.unwrap();
        assert_eq!(state.flow_status, FlowStatus::TxError);
    }

    #[tokio::test]
    async fn retry_resets_a_terminal_flow_back_to_its_first_chain() {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
        let mut pollers: HashMap<Chain, Arc<dyn ChainPoller>> = HashMap::new();
        pollers.insert(Chain::Evm, Arc::new(AlwaysFailingPoller));
        pollers.insert(
            Chain::Noble,
            Arc::new(ImmediateSuccessPoller {
                stage: StageName::NobleCctpMinted,
                patch: FlowMetadata::default(),
            }),
        );
        pollers.insert(
            Chain::Namada,
            Arc::new(ImmediateSuccessPoller {
                stage: StageName::NamadaReceived,
                patch: FlowMetadata::default(),
            }),
        );
        let orchestrator = build_orchestrator(pollers, store.clone());

        orchestrator
            .start("tx-4", FlowType::Deposit, deposit_metadata(), CancellationToken::new())
            .await
            .unwrap();
        let failed = get_polling_state(store.as_ref(), "tx-4").await.unwrap();
        assert_eq!(failed.flow_status, FlowStatus::TxError);

        // Swap in a working EVM poller and retry from scratch.
        let mut retried_pollers: HashMap<Chain, Arc<dyn ChainPoller>> = HashMap::new();
        retried_pollers.insert(
            Chain::Evm,
            Arc::new(ImmediateSuccessPoller {
                stage: StageName::EvmPolling,
                patch: FlowMetadata::default(),
            }),
        );
        retried_pollers.insert(
            Chain::Noble,
            Arc::new(ImmediateSuccessPoller {
                stage: StageName::NobleCctpMinted,
                patch: FlowMetadata::default(),
            }),
        );
        retried_pollers.insert(
            Chain::Namada,
            Arc::new(ImmediateSuccessPoller {
                stage: StageName::NamadaReceived,
                patch: FlowMetadata::default(),
            }),
        );
        let retried_orchestrator = build_orchestrator(retried_pollers, store.clone());
        retried_orchestrator
            .retry("tx-4", CancellationToken::new())
            .await
            .unwrap();

        let state = get_polling_state(store.as_ref(), "tx-4").await.unwrap();
        assert_eq!(state.flow_status, FlowStatus::Success);
    }

    /// E4: a chain exceeding its timeout while earlier legs already succeeded
    /// settles into `PollingTimeout` (outer `Undetermined`) without the
    /// current chain ever being (re-)polled, and a subsequent `retry()`
    /// starts cleanly from a fresh deadline.
    #[tokio::test]
    async fn global_timeout_settles_non_terminal_progress_without_blocking_retry() {
        struct PanicIfPolledPoller;
        #[async_trait::async_trait]
        impl ChainPoller for PanicIfPolledPoller {
            async fn poll(&self, _params: PollParams) -> Result<crate::pollers::ChainPollResult, PollError> {
                panic!("a chain past the global deadline must not be polled");
            }
        }

        let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
        let mut pollers: HashMap<Chain, Arc<dyn ChainPoller>> = HashMap::new();
        pollers.insert(Chain::Evm, Arc::new(PanicIfPolledPoller));
        pollers.insert(Chain::Noble, Arc::new(PanicIfPolledPoller));
        pollers.insert(Chain::Namada, Arc::new(PanicIfPolledPoller));
        let orchestrator = build_orchestrator(pollers, store.clone());

        let metadata = deposit_metadata();
        let mut state = PollingState::new(FlowType::Deposit, metadata.clone());
        state.current_chain = Some(Chain::Namada);
        state.latest_completed_stage = Some(StageName::NobleCctpMinted);
        // Deadline already behind "now": the loop must bail before touching
        // the Namada poller at all.
        state.global_timeout_at = EpochMillis::now();
        for (chain, stage) in [(Chain::Evm, StageName::EvmMintConfirmed), (Chain::Noble, StageName::NobleCctpMinted)] {
            let status = state.chain_status.entry(chain).or_default();
            status.status = FlowStatus::Success;
            status.stages.push(ChainStage::confirmed(stage));
            status.completed_stages.push(stage);
        }
        let record = TransactionRecord {
            flow_type: FlowType::Deposit,
            created_at: state.started_at,
            hash: metadata.tx_hash.clone(),
            block_height: None,
            polling_state: Some(state),
            status: TransactionOuterStatus::Pending,
            namada_block_height: None,
            namada_ibc_tx_hash: None,
            recipient: None,
            amount_base_units: None,
            forwarding_address: metadata.forwarding_address.clone(),
        };
        store.save("tx-5", record).await;

        orchestrator.resume("tx-5", CancellationToken::new()).await.unwrap();

        let state = get_polling_state(store.as_ref(), "tx-5").await.unwrap();
        assert_eq!(state.flow_status, FlowStatus::PollingTimeout);
        assert_eq!(outer_status_for(state.flow_status), TransactionOuterStatus::Undetermined);
        assert_eq!(state.chain_status.get(&Chain::Evm).unwrap().status, FlowStatus::Success);
        assert_eq!(state.chain_status.get(&Chain::Noble).unwrap().status, FlowStatus::Success);

        // A subsequent retry starts cleanly on a fresh deadline and can still
        // reach success.
        let mut retried_pollers: HashMap<Chain, Arc<dyn ChainPoller>> = HashMap::new();
        retried_pollers.insert(
            Chain::Evm,
            Arc::new(ImmediateSuccessPoller { stage: StageName::EvmPolling, patch: FlowMetadata::default() }),
        );
        retried_pollers.insert(
            Chain::Noble,
            Arc::new(ImmediateSuccessPoller { stage: StageName::NobleCctpMinted, patch: FlowMetadata::default() }),
        );
        retried_pollers.insert(
            Chain::Namada,
            Arc::new(ImmediateSuccessPoller { stage: StageName::NamadaReceived, patch: FlowMetadata::default() }),
        );
        let retried = build_orchestrator(retried_pollers, store.clone());
        retried.retry("tx-5", CancellationToken::new()).await.unwrap();
        let state = get_polling_state(store.as_ref(), "tx-5").await.unwrap();
        assert_eq!(state.flow_status, FlowStatus::Success);
    }

    /// E5: a cancellation fired mid-poll is observed as `PollError::cancelled`
    /// by the in-flight leg, and the orchestrator settles the flow into
    /// `Cancelled` without ever entering a later chain.
    #[tokio::test]
    async fn cancellation_mid_poll_settles_cancelled_with_no_further_chain_entered() {
        struct CancelAwarePoller;
        #[async_trait::async_trait]
        impl ChainPoller for CancelAwarePoller {
            async fn poll(&self, params: PollParams) -> Result<crate::pollers::ChainPollResult, PollError> {
                params.cancel.cancelled().await;
                Err(PollError::cancelled())
            }
        }

        let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
        let mut pollers: HashMap<Chain, Arc<dyn ChainPoller>> = HashMap::new();
        pollers.insert(Chain::Evm, Arc::new(CancelAwarePoller));
        pollers.insert(
            Chain::Noble,
            Arc::new(ImmediateSuccessPoller { stage: StageName::NobleCctpMinted, patch: FlowMetadata::default() }),
        );
        pollers.insert(
            Chain::Namada,
            Arc::new(ImmediateSuccessPoller { stage: StageName::NamadaReceived, patch: FlowMetadata::default() }),
        );
        let orchestrator = Arc::new(build_orchestrator(pollers, store.clone()));

        let cancel = CancellationToken::new();
        let run_cancel = cancel.clone();
        let orchestrator_clone = orchestrator.clone();
        let handle = tokio::spawn(async move {
            orchestrator_clone.start("tx-6", FlowType::Deposit, deposit_metadata(), run_cancel).await
        });
        cancel.cancel();
        handle.await.unwrap().unwrap();

        let state = get_polling_state(store.as_ref(), "tx-6").await.unwrap();
        assert_eq!(state.flow_status, FlowStatus::Cancelled);
        assert_eq!(state.current_chain, Some(Chain::Evm));
        assert!(!state.chain_status.contains_key(&Chain::Noble));
        assert!(!state.chain_status.contains_key(&Chain::Namada));
    }

    /// E6: resuming from persisted state that already shows EVM succeeded
    /// picks up at Noble rather than re-running EVM.
    #[tokio::test]
    async fn resume_after_crash_continues_from_the_persisted_current_chain() {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());

        struct PanicIfPolledPoller;
        #[async_trait::async_trait]
        impl ChainPoller for PanicIfPolledPoller {
            async fn poll(&self, _params: PollParams) -> Result<crate::pollers::ChainPollResult, PollError> {
                panic!("EVM leg must not be re-polled on resume");
            }
        }

        let mut pollers: HashMap<Chain, Arc<dyn ChainPoller>> = HashMap::new();
        pollers.insert(Chain::Evm, Arc::new(PanicIfPolledPoller));
        pollers.insert(
            Chain::Noble,
            Arc::new(ImmediateSuccessPoller { stage: StageName::NobleCctpMinted, patch: FlowMetadata::default() }),
        );
        pollers.insert(
            Chain::Namada,
            Arc::new(ImmediateSuccessPoller { stage: StageName::NamadaReceived, patch: FlowMetadata::default() }),
        );
        let orchestrator = build_orchestrator(pollers, store.clone());

        let mut metadata = deposit_metadata();
        metadata.cctp_nonce = Some(704111);
        let mut state = PollingState::new(FlowType::Deposit, metadata.clone());
        state.current_chain = Some(Chain::Noble);
        state.latest_completed_stage = Some(StageName::EvmMintConfirmed);
        state.chain_status.entry(Chain::Evm).or_default().status = FlowStatus::Success;
        state
            .chain_status
            .get_mut(&Chain::Evm)
            .unwrap()
            .stages
            .push(ChainStage::confirmed(StageName::EvmMintConfirmed).with_tx_hash("0xdeposit"));
        state.chain_status.get_mut(&Chain::Evm).unwrap().completed_stages.push(StageName::EvmMintConfirmed);
        let record = TransactionRecord {
            flow_type: FlowType::Deposit,
            created_at: state.started_at,
            hash: metadata.tx_hash.clone(),
            block_height: None,
            polling_state: Some(state),
            status: TransactionOuterStatus::Pending,
            namada_block_height: None,
            namada_ibc_tx_hash: None,
            recipient: None,
            amount_base_units: None,
            forwarding_address: metadata.forwarding_address.clone(),
        };
        store.save("tx-7", record).await;

        orchestrator.resume("tx-7", CancellationToken::new()).await.unwrap();

        let state = get_polling_state(store.as_ref(), "tx-7").await.unwrap();
        assert_eq!(state.flow_status, FlowStatus::Success);
        assert_eq!(
            state.chain_status.get(&Chain::Evm).unwrap().status,
            FlowStatus::Success
        );
    }

    /// Invariant 7: `cancel()` then `retry()` clears every chain's status and
    /// resets `flowStatus` to `pending`, and a subsequent successful run
    /// reaches `success` from a fresh scan.
    #[tokio::test]
    async fn cancel_then_retry_clears_chain_status_and_can_reach_success() {
        struct CancelAwarePoller;
        #[async_trait::async_trait]
        impl ChainPoller for CancelAwarePoller {
            async fn poll(&self, params: PollParams) -> Result<crate::pollers::ChainPollResult, PollError> {
                params.cancel.cancelled().await;
                Err(PollError::cancelled())
            }
        }

        let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
        let mut pollers: HashMap<Chain, Arc<dyn ChainPoller>> = HashMap::new();
        pollers.insert(Chain::Evm, Arc::new(CancelAwarePoller));
        pollers.insert(Chain::Noble, Arc::new(AlwaysFailingPoller));
        pollers.insert(Chain::Namada, Arc::new(AlwaysFailingPoller));
        let orchestrator = Arc::new(build_orchestrator(pollers, store.clone()));

        let cancel = CancellationToken::new();
        let run_cancel = cancel.clone();
        let orchestrator_clone = orchestrator.clone();
        let handle = tokio::spawn(async move {
            orchestrator_clone.start("tx-8", FlowType::Deposit, deposit_metadata(), run_cancel).await
        });
        cancel.cancel();
        handle.await.unwrap().unwrap();
        orchestrator.cancel("tx-8", &CancellationToken::new()).await.unwrap();
        let cancelled = get_polling_state(store.as_ref(), "tx-8").await.unwrap();
        assert_eq!(cancelled.flow_status, FlowStatus::Cancelled);

        let mut retried_pollers: HashMap<Chain, Arc<dyn ChainPoller>> = HashMap::new();
        retried_pollers.insert(
            Chain::Evm,
            Arc::new(ImmediateSuccessPoller { stage: StageName::EvmPolling, patch: FlowMetadata::default() }),
        );
        retried_pollers.insert(
            Chain::Noble,
            Arc::new(ImmediateSuccessPoller { stage: StageName::NobleCctpMinted, patch: FlowMetadata::default() }),
        );
        retried_pollers.insert(
            Chain::Namada,
            Arc::new(ImmediateSuccessPoller { stage: StageName::NamadaReceived, patch: FlowMetadata::default() }),
        );
        let retried = build_orchestrator(retried_pollers, store.clone());
        retried.retry("tx-8", CancellationToken::new()).await.unwrap();

        let state = get_polling_state(store.as_ref(), "tx-8").await.unwrap();
        assert_eq!(state.flow_status, FlowStatus::Success);
        for chain in FlowType::Deposit.chain_order() {
            assert_eq!(state.chain_status.get(chain).unwrap().status, FlowStatus::Success);
        }
    }
}
