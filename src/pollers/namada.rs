//! Namada-leg polling (spec.md §4.4).
//!
//! Namada is the anchor chain: the last leg of a deposit (receiving USDC
//! forwarded from Noble over IBC) and the first leg of a payment (the user's
//! own IBC send out to Noble). Neither side is searched by transaction hash —
//! CometBFT's tx indexer only covers Namada's wrapper transactions, not the
//! inner IBC events this crate actually needs, so both legs read block-level
//! events out of `block_results` directly.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{ErrorSeverity, PollError};
use crate::metadata::{FlowMetadata, NamadaDepositInputs, NamadaPaymentInputs};
use crate::rpc::tendermint::{TendermintClient, TmEvent, find_events};
use crate::state::StageName;

use super::{ChainPollResult, ChainPoller, PollParams, confirmed_stage, poll_until};

const IBC_ACK_EVENT: &str = "write_acknowledgement";
const IBC_ACK_SEQ_ATTR: &str = "packet_sequence";
const IBC_ACK_RESULT_ATTR: &str = "packet_ack";
const IBC_ACK_SUCCESS: &str = "{\"result\":\"AQ==\"}";
const IBC_ACK_INNER_TX_HASH_ATTR: &str = "inner-tx-hash";
const IBC_SEND_PACKET_EVENT: &str = "send_packet";
const IBC_SEND_PACKET_SEQ_ATTR: &str = "packet_sequence";
const IBC_SEND_PACKET_INNER_TX_HASH_ATTR: &str = "inner-tx-hash";

pub struct NamadaPoller {
    client: TendermintClient,
}

impl NamadaPoller {
    pub fn new(client: TendermintClient) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl ChainPoller for NamadaPoller {
    async fn poll(&self, params: PollParams) -> Result<ChainPollResult, PollError> {
        match params.flow_type {
            crate::metadata::FlowType::Deposit => self.poll_deposit(params).await,
            crate::metadata::FlowType::Payment => self.poll_payment(params).await,
        }
    }
}

impl NamadaPoller {
    /// Deposit: the terminal leg. Walk forward from `start_height` one block
    /// at a time, re-reading `status` for the chain head each outer pass,
    /// looking for the `write_acknowledgement` of Noble's forwarded packet. A
    /// single height whose `block_results` call fails is skipped rather than
    /// treated as terminal — the next pass picks the cursor back up.
    async fn poll_deposit(&self, params: PollParams) -> Result<ChainPollResult, PollError> {
        let inputs = NamadaDepositInputs::from_metadata(&params.metadata)
            .map_err(|e| PollError::new(ErrorSeverity::PollingError, e.to_string()))?;

        let cursor = AtomicU64::new(inputs.start_height);

        let hash = poll_until(&params, || async {
            let status = self.client.status(&params.cancel).await?;
            let latest: u64 = status.sync_info.latest_block_height.parse().map_err(|_| {
                PollError::new(ErrorSeverity::PollingError, "namada status returned non-numeric height")
            })?;

            let mut height = cursor.load(Ordering::SeqCst);
            let mut found = None;
            while height <= latest {
                if params.cancel.is_cancelled() {
                    return Err(PollError::cancelled());
                }
                match self.client.block_results(height, &params.cancel).await {
                    Ok(block) => {
                        let events = block.all_events();
                        if let Some(ack) = find_matching_ack(&events, inputs.packet_sequence) {
                            found = Some(ack);
                            height += 1;
                            break;
                        }
                    }
                    Err(_) => {
                        // Transient RPC hiccup on this one height; keep walking.
                    }
                }
                height += 1;
            }
            cursor.store(height, Ordering::SeqCst);

            match found {
                Some(ack) => {
                    if ack.packet_ack.as_deref() != Some(IBC_ACK_SUCCESS) {
                        return Err(PollError::tx_error(format!(
                            "namada ibc acknowledgement for packet {} was not successful: {:?}",
                            inputs.packet_sequence, ack.packet_ack
                        )));
                    }
                    Ok(Some(ack.inner_tx_hash.unwrap_or_default()))
                }
                None => Ok(None),
            }
        })
        .await?;

        Ok(ChainPollResult {
            stages: vec![confirmed_stage(StageName::NamadaReceived, hash)],
            metadata_patch: FlowMetadata::default(),
        })
    }

    /// Payment: the initiating leg. The caller already knows the exact block
    /// height and inner tx hash of the user's own IBC-send (it's their own
    /// wallet's submission, not something to search for), so this reads that
    /// one block's events directly rather than polling.
    async fn poll_payment(&self, params: PollParams) -> Result<ChainPollResult, PollError> {
        let inputs = NamadaPaymentInputs::from_metadata(&params.metadata)
            .map_err(|e| PollError::new(ErrorSeverity::PollingError, e.to_string()))?;

        let block = self
            .client
            .block_results(inputs.namada_block_height, &params.cancel)
            .await?;
        let events = block.all_events();

        let packet_sequence = find_send_packet_sequence(&events, &inputs.namada_ibc_tx_hash).ok_or_else(|| {
            PollError::new(
                ErrorSeverity::PollingError,
                format!(
                    "no send_packet event at namada height {} matches inner tx hash {}",
                    inputs.namada_block_height, inputs.namada_ibc_tx_hash
                ),
            )
        })?;

        Ok(ChainPollResult {
            stages: vec![confirmed_stage(StageName::NamadaIbcSent, inputs.namada_ibc_tx_hash)],
            metadata_patch: FlowMetadata {
                packet_sequence: Some(packet_sequence),
                ..Default::default()
            },
        })
    }
}

struct MatchedAck {
    packet_ack: Option<String>,
    inner_tx_hash: Option<String>,
}

/// Scans a block's events for the `write_acknowledgement` keyed by
/// `packet_sequence`, returning its ack result and the Namada inner
/// transaction hash that carried it.
fn find_matching_ack(events: &[TmEvent], packet_sequence: u64) -> Option<MatchedAck> {
    let sequence_str = packet_sequence.to_string();
    find_events(events, IBC_ACK_EVENT).find_map(|event| {
        let seq = event.attributes.iter().find(|a| a.key == IBC_ACK_SEQ_ATTR)?;
        if seq.value != sequence_str {
            return None;
        }
        let packet_ack = event
            .attributes
            .iter()
            .find(|a| a.key == IBC_ACK_RESULT_ATTR)
            .map(|a| a.value.clone());
        let inner_tx_hash = event
            .attributes
            .iter()
            .find(|a| a.key == IBC_ACK_INNER_TX_HASH_ATTR)
            .map(|a| a.value.clone());
        Some(MatchedAck { packet_ack, inner_tx_hash })
    })
}

/// Scans a block's events for the `send_packet` whose own inner tx hash
/// (case-insensitive) matches the user's submitted transaction, returning its
/// packet sequence.
fn find_send_packet_sequence(events: &[TmEvent], namada_ibc_tx_hash: &str) -> Option<u64> {
    let expected = namada_ibc_tx_hash.to_lowercase();
    find_events(events, IBC_SEND_PACKET_EVENT).find_map(|event| {
        let inner_hash = event
            .attributes
            .iter()
            .find(|a| a.key == IBC_SEND_PACKET_INNER_TX_HASH_ATTR)?;
        if inner_hash.value.to_lowercase() != expected {
            return None;
        }
        event
            .attributes
            .iter()
            .find(|a| a.key == IBC_SEND_PACKET_SEQ_ATTR)
            .and_then(|a| a.value.parse().ok())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::tendermint::TmEventAttribute;

    fn ack_event(sequence: &str, ack: &str, inner_tx_hash: &str) -> TmEvent {
        TmEvent {
            kind: IBC_ACK_EVENT.to_string(),
            attributes: vec![
                TmEventAttribute { key: IBC_ACK_SEQ_ATTR.to_string(), value: sequence.to_string() },
                TmEventAttribute { key: IBC_ACK_RESULT_ATTR.to_string(), value: ack.to_string() },
                TmEventAttribute {
                    key: IBC_ACK_INNER_TX_HASH_ATTR.to_string(),
                    value: inner_tx_hash.to_string(),
                },
            ],
        }
    }

    fn send_packet_event(sequence: &str, inner_tx_hash: &str) -> TmEvent {
        TmEvent {
            kind: IBC_SEND_PACKET_EVENT.to_string(),
            attributes: vec![
                TmEventAttribute { key: IBC_SEND_PACKET_SEQ_ATTR.to_string(), value: sequence.to_string() },
                TmEventAttribute {
                    key: IBC_SEND_PACKET_INNER_TX_HASH_ATTR.to_string(),
                    value: inner_tx_hash.to_string(),
                },
            ],
        }
    }

    #[test]
    fn finds_ack_matching_packet_sequence() {
        let events = vec![ack_event("7", IBC_ACK_SUCCESS, "ABCDEF")];
        let found = find_matching_ack(&events, 7).unwrap();
        assert_eq!(found.packet_ack.as_deref(), Some(IBC_ACK_SUCCESS));
        assert_eq!(found.inner_tx_hash.as_deref(), Some("ABCDEF"));
    }

    #[test]
    fn ignores_ack_with_different_sequence() {
        let events = vec![ack_event("8", IBC_ACK_SUCCESS, "ABCDEF")];
        assert!(find_matching_ack(&events, 7).is_none());
    }

    #[test]
    fn detects_unsuccessful_ack() {
        let events = vec![ack_event("7", "{\"result\":\"AA==\"}", "ABCDEF")];
        let found = find_matching_ack(&events, 7).unwrap();
        assert_ne!(found.packet_ack.as_deref(), Some(IBC_ACK_SUCCESS));
    }

    #[test]
    fn finds_send_packet_by_inner_tx_hash_case_insensitively() {
        let events = vec![send_packet_event("12", "abcDEF123")];
        assert_eq!(find_send_packet_sequence(&events, "ABCdef123"), Some(12));
    }

    #[test]
    fn rejects_send_packet_with_different_inner_tx_hash() {
        let events = vec![send_packet_event("12", "abcDEF123")];
        assert_eq!(find_send_packet_sequence(&events, "zzz"), None);
    }
}
