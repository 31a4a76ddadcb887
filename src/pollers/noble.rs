//! Noble-leg polling (spec.md §4.3, §4.6).
//!
//! Noble sits in the middle of both directions and does double duty: for a
//! deposit it mints USDC via CCTP, registers (if needed) the recipient's
//! forwarding account, then auto-forwards the mint on over IBC; for a payment
//! it receives USDC over IBC (with the burn back to EVM folded into the same
//! transaction) then watches for the CCTP burn event to learn the nonce the
//! EVM leg will key off of.

use serde_json::Value;

use crate::config::RegistrationConfig;
use crate::error::{ErrorSeverity, PollError};
use crate::metadata::{FlowMetadata, NobleDepositInputs, NoblePaymentInputs};
use crate::registration::{self, RegistrationTxBuilder};
use crate::rpc::tendermint::{
    QueryClause, TendermintClient, TmEvent, TxResult, build_tx_search_query, find_attribute,
    find_events,
};
use crate::state::StageName;
use crate::timestamp::EpochMillis;

use super::{ChainPollResult, ChainPoller, PollParams, poll_until};

const CCTP_MINT_EVENT: &str = "circle.cctp.v1.MessageReceived";
const CCTP_MINT_NONCE_ATTR: &str = "nonce";
const ACCOUNT_REGISTERED_EVENT: &str = "noble.forwarding.v1.AccountRegistered";
const ACCOUNT_REGISTERED_ATTR: &str = "account";
const IBC_SEND_PACKET_EVENT: &str = "send_packet";
const IBC_SEND_PACKET_SEQ_ATTR: &str = "packet_sequence";
const IBC_SEND_PACKET_DATA_ATTR: &str = "packet_data";
const IBC_ACK_EVENT: &str = "write_acknowledgement";
const IBC_ACK_SEQ_ATTR: &str = "packet_sequence";
const IBC_ACK_RESULT_ATTR: &str = "packet_ack";
const IBC_ACK_SUCCESS: &str = "{\"result\":\"AQ==\"}";
const CCTP_BURN_EVENT: &str = "circle.cctp.v1.DepositForBurn";
const CCTP_BURN_NONCE_ATTR: &str = "nonce";
const NOBLE_USDC_DENOM: &str = "uusdc";

/// Upper bound on how long `poll_deposit` searches for the CCTP mint tx and
/// its follow-on fallbacks, distinct from the flow's overall chain timeout
/// (spec.md §4.3 "Noble mint search window").
const MINT_SEARCH_TIMEOUT_MS: i64 = 120_000;
const MINT_SEARCH_INTERVAL_MS: u64 = 3_000;

pub struct NoblePoller {
    client: TendermintClient,
    registration_builder: std::sync::Arc<dyn RegistrationTxBuilder>,
    registration_config: RegistrationConfig,
}

impl NoblePoller {
    pub fn new(
        client: TendermintClient,
        registration_builder: std::sync::Arc<dyn RegistrationTxBuilder>,
        registration_config: RegistrationConfig,
    ) -> Self {
        Self { client, registration_builder, registration_config }
    }

    /// A copy of `params` scoped down to the mint-search window: a shorter
    /// poll interval and a deadline capped at `now + MINT_SEARCH_TIMEOUT_MS`,
    /// never later than the flow's own chain deadline.
    fn mint_search_params(&self, params: &PollParams) -> PollParams {
        let mut scoped = params.clone();
        scoped.interval_ms = MINT_SEARCH_INTERVAL_MS;
        let capped = EpochMillis::now().checked_add_ms(MINT_SEARCH_TIMEOUT_MS);
        scoped.chain_timeout_at = scoped.chain_timeout_at.min(capped);
        scoped
    }

    async fn find_tx_by_clause(
        &self,
        params: &PollParams,
        clause: QueryClause,
    ) -> Result<Option<(String, u64, TxResult)>, PollError> {
        let query = build_tx_search_query(&[clause])?;
        let response = self.client.tx_search(&query, &params.cancel).await?;
        for entry in response.txs {
            if entry.tx_result.failed() {
                return Err(PollError::tx_error(format!(
                    "noble transaction {} failed: {}",
                    entry.hash, entry.tx_result.log
                )));
            }
            let height: u64 = entry.height.parse().map_err(|_| {
                PollError::new(ErrorSeverity::PollingError, "noble tx_search entry has non-numeric height")
            })?;
            return Ok(Some((entry.hash, height, entry.tx_result)));
        }
        Ok(None)
    }
}

#[async_trait::async_trait]
impl ChainPoller for NoblePoller {
    async fn poll(&self, params: PollParams) -> Result<ChainPollResult, PollError> {
        match params.flow_type {
            crate::metadata::FlowType::Deposit => self.poll_deposit(params).await,
            crate::metadata::FlowType::Payment => self.poll_payment(params).await,
        }
    }
}

impl NoblePoller {
    /// Deposit: wait for the CCTP mint keyed by the EVM-side nonce, ensure
    /// the recipient's forwarding account is registered, then locate the IBC
    /// forward out to Namada — falling back progressively if the forward
    /// can't be matched exactly (spec.md §4.3/§4.6).
    async fn poll_deposit(&self, params: PollParams) -> Result<ChainPollResult, PollError> {
        let inputs = NobleDepositInputs::from_metadata(&params.metadata)
            .map_err(|e| PollError::new(ErrorSeverity::PollingError, e.to_string()))?;

        let mint_search = self.mint_search_params(&params);
        let (mint_hash, mint_height, _) = poll_until(&mint_search, || {
            self.find_tx_by_clause(
                &mint_search,
                QueryClause::quoted(
                    format!("{CCTP_MINT_EVENT}.{CCTP_MINT_NONCE_ATTR}"),
                    inputs.cctp_nonce.to_string(),
                ),
            )
        })
        .await?;

        let registration_stage = registration::ensure_forwarding_registered(
            self.registration_builder.as_ref(),
            &inputs.forwarding_address,
            &self.registration_config,
            &params.cancel,
        )
        .await?;

        let expected_amount = params.metadata.expected_amount_uusdc.as_deref();

        let mint_block = self.client.block_results(mint_height, &params.cancel).await?;
        let mint_events = mint_block.all_events();
        let mut packet_sequence = find_matching_send_packet(
            &mint_events,
            &inputs.namada_receiver,
            &inputs.forwarding_address,
            expected_amount,
        );

        let mut fallback_events: Vec<TmEvent> = Vec::new();
        if packet_sequence.is_none() {
            let registered_search = self.mint_search_params(&params);
            if let Some((_, registered_height, _)) = poll_until(&registered_search, || {
                self.find_tx_by_clause(
                    &registered_search,
                    QueryClause::new(
                        format!("{ACCOUNT_REGISTERED_EVENT}.{ACCOUNT_REGISTERED_ATTR}"),
                        inputs.forwarding_address.clone(),
                    ),
                )
            })
            .await
            .map(Some)
            .or_else(|err| if err.severity == ErrorSeverity::PollingTimeout { Ok(None) } else { Err(err) })?
            {
                let registered_block = self
                    .client
                    .block_results(registered_height, &params.cancel)
                    .await?;
                fallback_events = registered_block.all_events();
                packet_sequence = find_matching_send_packet(
                    &fallback_events,
                    &inputs.namada_receiver,
                    &inputs.forwarding_address,
                    expected_amount,
                );
            }
        }

        let packet_sequence = match packet_sequence {
            Some(seq) => seq,
            None => any_send_packet_sequence(&mint_events)
                .or_else(|| any_send_packet_sequence(&fallback_events))
                .ok_or_else(|| {
                    PollError::new(
                        ErrorSeverity::PollingError,
                        "no send_packet event found for noble ibc forward after mint and registration",
                    )
                })?,
        };

        Ok(ChainPollResult {
            stages: vec![
                super::confirmed_stage(StageName::NobleCctpMinted, mint_hash.clone()),
                registration_stage,
                super::confirmed_stage(StageName::NobleIbcForwarded, mint_hash),
            ],
            metadata_patch: FlowMetadata {
                packet_sequence: Some(packet_sequence),
                ..Default::default()
            },
        })
    }

    /// Payment: wait for the IBC receive keyed by Namada's packet sequence,
    /// require a successful acknowledgement, then read the CCTP burn nonce
    /// out of the same transaction's events.
    async fn poll_payment(&self, params: PollParams) -> Result<ChainPollResult, PollError> {
        let inputs = NoblePaymentInputs::from_metadata(&params.metadata)
            .map_err(|e| PollError::new(ErrorSeverity::PollingError, e.to_string()))?;

        let (recv_hash, _, recv_result) = poll_until(&params, || {
            self.find_tx_by_clause(
                &params,
                QueryClause::new(
                    format!("{IBC_ACK_EVENT}.{IBC_ACK_SEQ_ATTR}"),
                    inputs.packet_sequence.to_string(),
                ),
            )
        })
        .await?;

        let ack = find_attribute(&recv_result.events, IBC_ACK_EVENT, IBC_ACK_RESULT_ATTR);
        if ack != Some(IBC_ACK_SUCCESS) {
            return Err(PollError::tx_error(format!(
                "noble ibc acknowledgement for packet {} was not successful: {:?}",
                inputs.packet_sequence, ack
            )));
        }

        let cctp_nonce: u64 = find_attribute(&recv_result.events, CCTP_BURN_EVENT, CCTP_BURN_NONCE_ATTR)
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| {
                PollError::new(ErrorSeverity::PollingError, "cctp burn missing nonce attribute")
            })?;

        Ok(ChainPollResult {
            stages: vec![
                super::confirmed_stage(StageName::NobleReceived, recv_hash.clone()),
                super::confirmed_stage(StageName::NobleCctpBurned, recv_hash),
            ],
            metadata_patch: FlowMetadata {
                cctp_nonce: Some(cctp_nonce),
                ..Default::default()
            },
        })
    }
}

/// Finds a `send_packet` event whose `packet_data` (a JSON object) matches
/// the expected denom, receiver, sender and (if known) amount, returning its
/// `packet_sequence`. Field-by-field JSON comparison is used rather than raw
/// string equality since the indexer doesn't guarantee key order.
fn find_matching_send_packet(
    events: &[TmEvent],
    namada_receiver: &str,
    forwarding_address: &str,
    expected_amount_uusdc: Option<&str>,
) -> Option<u64> {
    for event in find_events(events, IBC_SEND_PACKET_EVENT) {
        let Some(data_attr) = event
            .attributes
            .iter()
            .find(|a| a.key == IBC_SEND_PACKET_DATA_ATTR)
        else {
            continue;
        };
        let Ok(packet_data) = serde_json::from_str::<Value>(&data_attr.value) else {
            continue;
        };
        if packet_data.get("denom").and_then(Value::as_str) != Some(NOBLE_USDC_DENOM) {
            continue;
        }
        if packet_data.get("receiver").and_then(Value::as_str) != Some(namada_receiver) {
            continue;
        }
        if packet_data.get("sender").and_then(Value::as_str) != Some(forwarding_address) {
            continue;
        }
        if let Some(expected_amount) = expected_amount_uusdc {
            if packet_data.get("amount").and_then(Value::as_str) != Some(expected_amount) {
                continue;
            }
        }
        let sequence = event
            .attributes
            .iter()
            .find(|a| a.key == IBC_SEND_PACKET_SEQ_ATTR)
            .and_then(|a| a.value.parse().ok());
        if sequence.is_some() {
            return sequence;
        }
    }
    None
}

/// Last-resort fallback: the sequence of the first `send_packet` event found
/// at all, used when field matching fails to find an exact counterpart
/// (spec.md §4.3's final fallback step).
fn any_send_packet_sequence(events: &[TmEvent]) -> Option<u64> {
    find_events(events, IBC_SEND_PACKET_EVENT)
        .find_map(|event| event.attributes.iter().find(|a| a.key == IBC_SEND_PACKET_SEQ_ATTR))
        .and_then(|a| a.value.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::tendermint::TmEventAttribute;

    fn packet_event(denom: &str, receiver: &str, sender: &str, amount: &str, sequence: &str) -> TmEvent {
        let packet_data = serde_json::json!({
            "denom": denom,
            "receiver": receiver,
            "sender": sender,
            "amount": amount,
        })
        .to_string();
        TmEvent {
            kind: IBC_SEND_PACKET_EVENT.to_string(),
            attributes: vec![
                TmEventAttribute { key: IBC_SEND_PACKET_DATA_ATTR.to_string(), value: packet_data },
                TmEventAttribute { key: IBC_SEND_PACKET_SEQ_ATTR.to_string(), value: sequence.to_string() },
            ],
        }
    }

    #[test]
    fn finds_matching_send_packet_by_json_fields() {
        let events = vec![packet_event("uusdc", "tnam1receiver", "noble1forward", "100", "7")];
        let sequence = find_matching_send_packet(&events, "tnam1receiver", "noble1forward", Some("100"));
        assert_eq!(sequence, Some(7));
    }

    #[test]
    fn rejects_send_packet_with_wrong_receiver() {
        let events = vec![packet_event("uusdc", "tnam1other", "noble1forward", "100", "7")];
        let sequence = find_matching_send_packet(&events, "tnam1receiver", "noble1forward", Some("100"));
        assert_eq!(sequence, None);
    }

    #[test]
    fn ignores_amount_when_not_known_yet() {
        let events = vec![packet_event("uusdc", "tnam1receiver", "noble1forward", "999", "9")];
        let sequence = find_matching_send_packet(&events, "tnam1receiver", "noble1forward", None);
        assert_eq!(sequence, Some(9));
    }

    #[test]
    fn any_send_packet_sequence_returns_first_match() {
        let events = vec![packet_event("uusdc", "x", "y", "1", "42")];
        assert_eq!(any_send_packet_sequence(&events), Some(42));
    }

    #[test]
    fn ack_success_literal_matches_spec_constant() {
        assert_eq!(IBC_ACK_SUCCESS, "{\"result\":\"AQ==\"}");
    }
}
