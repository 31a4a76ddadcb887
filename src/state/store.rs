//! The polling state manager (spec.md §4.5): read/merge/write over a single
//! persistent record per transaction, plus legacy-layout migration (spec.md §9).
//!
//! Persistence itself is an opaque ordered map (spec.md §1 Non-goals) — callers
//! provide a [`StateStore`] implementation; [`InMemoryStateStore`] is a
//! `DashMap`-backed reference implementation used by tests and the CLI.

use std::collections::HashMap;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::Chain;
use crate::metadata::FlowMetadata;
use crate::state::{ChainParams, ChainStage, ChainStatus, PollingState, TransactionRecord};
use crate::timestamp::EpochMillis;

/// Abstracts the read-modify-write cycle over a transaction's polling state.
///
/// Implementations need only guarantee that `load`/`save` round-trip a
/// [`TransactionRecord`] for a given id; the merge and migration semantics live
/// in this module and are backend-agnostic.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self, tx_id: &str) -> Option<TransactionRecord>;
    async fn save(&self, tx_id: &str, record: TransactionRecord);
}

/// Reference in-memory implementation, standing in for the browser/localStorage
/// or server-side KV store this crate does not own.
#[derive(Default)]
pub struct InMemoryStateStore {
    records: DashMap<String, TransactionRecord>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn load(&self, tx_id: &str) -> Option<TransactionRecord> {
        self.records.get(tx_id).map(|r| r.clone())
    }

    async fn save(&self, tx_id: &str, record: TransactionRecord) {
        self.records.insert(tx_id.to_string(), record);
    }
}

/// Reads a transaction's polling state, migrating the legacy layout on the way
/// out (spec.md §9: "Legacy state migration").
///
/// Old records stored the flow's initial metadata under
/// `chainParams[initialChain].metadata` instead of top-level `metadata`. This
/// relocates it, folds in any stray `metadata` annexes left on other chains'
/// `chainParams`, and persists the migrated shape so future reads skip the work.
pub async fn get_polling_state(
    store: &dyn StateStore,
    tx_id: &str,
) -> Option<PollingState> {
    let mut record = store.load(tx_id).await?;
    let mut state = record.polling_state.take()?;
    if migrate_legacy_metadata(&mut state) {
        record.polling_state = Some(state.clone());
        store.save(tx_id, record).await;
    }
    Some(state)
}

/// Returns `true` if a migration was actually performed.
///
/// Old records stored the flow's initial metadata under
/// `chainParams[initialChain].metadata` rather than top-level `metadata`. On
/// detecting that layout, relocate it to `state.metadata`, fold in any other
/// chain's stray `chainParams[*].metadata` annex on top, and strip the legacy
/// annexes out of `chain_params` so the record normalizes on first read.
fn migrate_legacy_metadata(state: &mut PollingState) -> bool {
    if !state.metadata.is_empty() {
        return false;
    }
    let mut reconstructed = FlowMetadata::default();
    let mut changed = false;
    // The initial chain's annex is authoritative; apply it first.
    if let Some(initial_chain) = state.current_chain {
        if let Some(params) = state.chain_params.get(&initial_chain) {
            if let Some(annex) = params.legacy_metadata.clone() {
                if let Ok(partial) = serde_json::from_value::<FlowMetadata>(annex) {
                    reconstructed.merge_from(partial);
                    changed = true;
                }
            }
        }
    }
    // Any other chain may have left a result-metadata annex from a prior resume.
    for params in state.chain_params.values() {
        if let Some(annex) = params.legacy_metadata.clone() {
            if let Ok(partial) = serde_json::from_value::<FlowMetadata>(annex) {
                reconstructed.merge_from(partial);
                changed = true;
            }
        }
    }
    if changed {
        state.metadata = reconstructed;
        for params in state.chain_params.values_mut() {
            params.legacy_metadata = None;
        }
    }
    changed
}

/// A partial update to top-level [`PollingState`] fields, applied by
/// [`update_polling_state`]. All fields are optional; only `Some` ones are
/// applied — a deep merge where top-level scalars overwrite rather than merge.
#[derive(Debug, Default)]
pub struct PollingStatePatch {
    pub flow_status: Option<crate::state::FlowStatus>,
    pub current_chain: Option<Option<Chain>>,
    pub latest_completed_stage: Option<crate::state::StageName>,
    pub global_timeout_at: Option<EpochMillis>,
    pub metadata: Option<FlowMetadata>,
    pub chain_params: Option<HashMap<Chain, ChainParams>>,
}

/// `updatePollingState` (spec.md §4.5): deep-merges a patch into the stored
/// state and stamps `lastUpdatedAt`.
pub async fn update_polling_state(
    store: &dyn StateStore,
    tx_id: &str,
    patch: PollingStatePatch,
) {
    let Some(mut record) = store.load(tx_id).await else {
        return;
    };
    let Some(state) = record.polling_state.as_mut() else {
        return;
    };
    if let Some(flow_status) = patch.flow_status {
        state.flow_status = flow_status;
    }
    if let Some(current_chain) = patch.current_chain {
        state.current_chain = current_chain;
    }
    if let Some(stage) = patch.latest_completed_stage {
        state.latest_completed_stage = Some(stage);
    }
    if let Some(global_timeout_at) = patch.global_timeout_at {
        state.global_timeout_at = global_timeout_at;
    }
    if let Some(metadata) = patch.metadata {
        state.metadata.merge_from(metadata);
    }
    if let Some(chain_params) = patch.chain_params {
        // An empty patch is a no-op when existing params are non-empty — protects
        // against accidental clears (spec.md §4.5).
        if !(chain_params.is_empty() && !state.chain_params.is_empty()) {
            for (chain, params) in chain_params {
                state.chain_params.insert(chain, params);
            }
        }
    }
    state.last_updated_at = EpochMillis::now();
    store.save(tx_id, record).await;
}

/// `updateChainStatus` (spec.md §4.5): merges a partial [`ChainStatus`] into
/// `chain_status[chain]`, preserving fields the caller omitted.
pub async fn update_chain_status<F>(store: &dyn StateStore, tx_id: &str, chain: Chain, patch: F)
where
    F: FnOnce(&mut ChainStatus),
{
    let Some(mut record) = store.load(tx_id).await else {
        return;
    };
    let Some(state) = record.polling_state.as_mut() else {
        return;
    };
    let entry = state.chain_status.entry(chain).or_default();
    patch(entry);
    state.last_updated_at = EpochMillis::now();
    store.save(tx_id, record).await;
}

/// `addChainStage` (spec.md §4.5): appends a stage to a chain's stage list.
pub async fn add_chain_stage(store: &dyn StateStore, tx_id: &str, chain: Chain, stage: ChainStage) {
    update_chain_status(store, tx_id, chain, |status| {
        merge_stages(&mut status.stages, vec![stage]);
    })
    .await;
}

/// The stage merge rule (spec.md §4.5): for each incoming stage, find an
/// existing entry with the same `stage` name. If found, keep the first
/// `occurredAt`, overwrite `status`, and deep-merge `metadata`; otherwise append.
///
/// Used both for live poller results and for legacy `clientStages` migration
/// (spec.md §9), which reclassifies entries by their `metadata.chain` field
/// before calling into this same routine per chain.
pub fn merge_stages(existing: &mut Vec<ChainStage>, incoming: Vec<ChainStage>) {
    for new_stage in incoming {
        if let Some(found) = existing.iter_mut().find(|s| s.stage == new_stage.stage) {
            found.status = new_stage.status;
            found.tx_hash = new_stage.tx_hash.or_else(|| found.tx_hash.take());
            found.message = new_stage.message.or_else(|| found.message.take());
            found.metadata = match (found.metadata.take(), new_stage.metadata) {
                (Some(mut existing_meta), Some(incoming_meta)) => {
                    merge_json(&mut existing_meta, incoming_meta);
                    Some(existing_meta)
                }
                (existing_meta, None) => existing_meta,
                (None, incoming_meta) => incoming_meta,
            };
            // occurred_at is deliberately left untouched: the first timestamp wins.
        } else {
            existing.push(new_stage);
        }
    }
}

/// Flattens a flow's stages for display (spec.md §9): iterate the direction's
/// chain order and concatenate each chain's stages, stamping `metadata.chain` on
/// each entry so a downstream UI can group by chain without re-deriving it from
/// `StageName`.
pub fn flatten_stages_for_display(state: &PollingState) -> Vec<ChainStage> {
    let mut out = Vec::new();
    for &chain in state.flow_type.chain_order() {
        let Some(status) = state.chain_status.get(&chain) else {
            continue;
        };
        for stage in &status.stages {
            let mut stage = stage.clone();
            let mut meta = stage.metadata.take().unwrap_or(serde_json::json!({}));
            if let serde_json::Value::Object(map) = &mut meta {
                map.insert("chain".to_string(), serde_json::json!(chain.to_string()));
            }
            stage.metadata = Some(meta);
            out.push(stage);
        }
    }
    out
}

/// Migrates a legacy flat `clientStages` list (spec.md §9) by reclassifying each
/// entry into its owning chain's bucket using the entry's stored
/// `metadata.chain` field, falling back to the stage name's canonical chain when
/// the annex is missing.
pub fn migrate_legacy_client_stages(raw: Vec<ChainStage>) -> HashMap<Chain, Vec<ChainStage>> {
    let mut buckets: HashMap<Chain, Vec<ChainStage>> = HashMap::new();
    for stage in raw {
        let chain = stage
            .metadata
            .as_ref()
            .and_then(|m| m.get("chain"))
            .and_then(|v| v.as_str())
            .and_then(|s| match s {
                "evm" => Some(Chain::Evm),
                "noble" => Some(Chain::Noble),
                "namada" => Some(Chain::Namada),
                _ => None,
            })
            .unwrap_or_else(|| stage.stage.chain());
        buckets.entry(chain).or_default().push(stage);
    }
    buckets
}

fn merge_json(base: &mut serde_json::Value, incoming: serde_json::Value) {
    if let (serde_json::Value::Object(base_map), serde_json::Value::Object(incoming_map)) =
        (&mut *base, &incoming)
    {
        for (k, v) in incoming_map {
            base_map.insert(k.clone(), v.clone());
        }
    } else if !incoming.is_null() {
        *base = incoming;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{StageName, StageStatus};

    #[test]
    fn merge_stages_preserves_first_occurred_at_and_overwrites_status() {
        let mut existing = vec![ChainStage {
            occurred_at: "2026-01-01T00:00:00Z".to_string(),
            ..ChainStage::pending(StageName::NobleCctpMinted)
        }];
        let incoming = vec![ChainStage {
            occurred_at: "2026-01-01T00:05:00Z".to_string(),
            ..ChainStage::confirmed(StageName::NobleCctpMinted)
        }];
        merge_stages(&mut existing, incoming);
        assert_eq!(existing.len(), 1);
        assert_eq!(existing[0].occurred_at, "2026-01-01T00:00:00Z");
        assert_eq!(existing[0].status, StageStatus::Confirmed);
    }

    #[test]
    fn merge_stages_appends_unseen_stage() {
        let mut existing = vec![ChainStage::confirmed(StageName::NoblePolling)];
        merge_stages(&mut existing, vec![ChainStage::confirmed(StageName::NobleCctpMinted)]);
        assert_eq!(existing.len(), 2);
    }

    #[test]
    fn migrates_legacy_metadata_from_chain_params() {
        let mut state = PollingState::new(crate::metadata::FlowType::Deposit, FlowMetadata::default());
        state.current_chain = Some(Chain::Evm);
        let mut params = ChainParams::new(0, 0);
        params.legacy_metadata = Some(serde_json::json!({"cctpNonce": 704111}));
        state.chain_params.insert(Chain::Evm, params);

        assert!(migrate_legacy_metadata(&mut state));
        assert_eq!(state.metadata.cctp_nonce, Some(704_111));
        assert!(state.chain_params[&Chain::Evm].legacy_metadata.is_none());
    }

    #[test]
    fn migrate_legacy_metadata_is_noop_when_metadata_present() {
        let mut state = PollingState::new(
            crate::metadata::FlowType::Deposit,
            FlowMetadata {
                cctp_nonce: Some(1),
                ..Default::default()
            },
        );
        assert!(!migrate_legacy_metadata(&mut state));
    }

    #[test]
    fn legacy_client_stages_reclassify_by_metadata_chain() {
        let stages = vec![
            ChainStage::confirmed(StageName::NobleCctpMinted)
                .with_metadata(serde_json::json!({"chain": "noble"})),
            ChainStage::confirmed(StageName::EvmMintConfirmed),
        ];
        let buckets = migrate_legacy_client_stages(stages);
        assert_eq!(buckets[&Chain::Noble].len(), 1);
        assert_eq!(buckets[&Chain::Evm].len(), 1);
    }

    #[tokio::test]
    async fn chain_params_empty_patch_is_noop_when_existing_nonempty() {
        let store = InMemoryStateStore::new();
        let mut state = PollingState::new(
            crate::metadata::FlowType::Deposit,
            FlowMetadata::default(),
        );
        state.chain_params.insert(Chain::Evm, ChainParams::new(1_000, 100));
        store
            .save(
                "tx1",
                TransactionRecord {
                    flow_type: crate::metadata::FlowType::Deposit,
                    created_at: EpochMillis::now(),
                    hash: None,
                    block_height: None,
                    polling_state: Some(state),
                    status: crate::state::TransactionOuterStatus::Pending,
                    namada_block_height: None,
                    namada_ibc_tx_hash: None,
                    recipient: None,
                    amount_base_units: None,
                    forwarding_address: None,
                },
            )
            .await;

        update_polling_state(
            &store,
            "tx1",
            PollingStatePatch {
                chain_params: Some(HashMap::new()),
                ..Default::default()
            },
        )
        .await;

        let state = get_polling_state(&store, "tx1").await.unwrap();
        assert!(state.chain_params.contains_key(&Chain::Evm));
    }
}
