//! Read-only EVM JSON-RPC adapter (spec.md §6/§7).
//!
//! Only the read surface is used — block headers, logs, the current head —
//! since tracking a transfer never requires this crate to hold a key or
//! broadcast a transaction on the EVM side.

use alloy_primitives::{Address, B256, TxHash};
use alloy_provider::{Provider, ProviderBuilder, RootProvider};
use alloy_rpc_types_eth::{Block, BlockNumberOrTag, Filter, Log, TransactionReceipt};
use tokio_util::sync::CancellationToken;

use crate::error::{ErrorSeverity, PollError};
use crate::rpc::retry::{RetryPolicy, retry_with_backoff};

/// Thin wrapper around an Alloy [`RootProvider`], retried per [`RetryPolicy`].
pub struct EvmClient {
    provider: RootProvider,
    retry_policy: RetryPolicy,
}

impl EvmClient {
    pub fn new(rpc_url: url::Url) -> Self {
        Self {
            provider: ProviderBuilder::new()
                .disable_recommended_fillers()
                .connect_http(rpc_url),
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub async fn latest_block_number(&self, cancel: &CancellationToken) -> Result<u64, PollError> {
        retry_with_backoff(&self.retry_policy, cancel, || async {
            self.provider
                .get_block_number()
                .await
                .map_err(|e| rpc_error(e.to_string()))
        })
        .await
    }

    pub async fn block_by_number(
        &self,
        number: u64,
        cancel: &CancellationToken,
    ) -> Result<Option<Block>, PollError> {
        retry_with_backoff(&self.retry_policy, cancel, || async {
            self.provider
                .get_block_by_number(BlockNumberOrTag::Number(number))
                .await
                .map_err(|e| rpc_error(e.to_string()))
        })
        .await
    }

    pub async fn transaction_receipt(
        &self,
        tx_hash: TxHash,
        cancel: &CancellationToken,
    ) -> Result<Option<TransactionReceipt>, PollError> {
        retry_with_backoff(&self.retry_policy, cancel, || async {
            self.provider
                .get_transaction_receipt(tx_hash)
                .await
                .map_err(|e| rpc_error(e.to_string()))
        })
        .await
    }

    /// Fetches logs for `address` emitting `topic0` (e.g. the CCTP
    /// `MessageReceived` event signature) in `[from_block, to_block]`,
    /// optionally narrowed by `topic2` (e.g. an indexed nonce). The range is
    /// walked in `max_block_range`-sized chunks rather than issued as one
    /// call, since most EVM JSON-RPC providers cap the block span of a single
    /// `eth_getLogs` request.
    pub async fn get_logs(
        &self,
        address: Address,
        from_block: u64,
        to_block: u64,
        topic0: B256,
        topic2: Option<B256>,
        max_block_range: u64,
        cancel: &CancellationToken,
    ) -> Result<Vec<Log>, PollError> {
        let max_block_range = max_block_range.max(1);
        let mut out = Vec::new();
        let mut chunk_start = from_block;
        while chunk_start <= to_block {
            if cancel.is_cancelled() {
                return Err(PollError::cancelled());
            }
            let chunk_end = chunk_start
                .saturating_add(max_block_range.saturating_sub(1))
                .min(to_block);
            let logs = retry_with_backoff(&self.retry_policy, cancel, || async {
                let mut filter = Filter::new()
                    .address(address)
                    .from_block(chunk_start)
                    .to_block(chunk_end)
                    .event_signature(topic0);
                if let Some(topic2) = topic2 {
                    filter = filter.topic2(topic2);
                }
                self.provider
                    .get_logs(&filter)
                    .await
                    .map_err(|e| rpc_error(e.to_string()))
            })
            .await?;
            out.extend(logs);
            if chunk_end == to_block {
                break;
            }
            chunk_start = chunk_end + 1;
        }
        Ok(out)
    }
}

/// Default `eth_getLogs` block-range cap applied when a deployment doesn't
/// override it (spec.md §7 "maxBlockRange").
pub const DEFAULT_MAX_BLOCK_RANGE: u64 = 2_000;

fn rpc_error(message: String) -> PollError {
    PollError::new(ErrorSeverity::PollingError, message)
        .with_category(crate::error::ErrorCategory::Rpc)
        .with_recovery(true, crate::error::RecoveryAction::CheckRpcStatus)
}
