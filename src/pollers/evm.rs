//! EVM-leg polling (spec.md §4.2).
//!
//! Two distinct modes share one chain: `nonce mode` watches for the CCTP
//! `MessageReceived` log completing a payment (the EVM leg is last in a
//! payment flow), while `transfer mode` confirms the user's initiating
//! deposit transaction and extracts the CCTP nonce and burn details a
//! deposit needs downstream.

use std::str::FromStr;

use alloy_primitives::{Address, B256, TxHash, keccak256};

use crate::error::{ErrorSeverity, PollError};
use crate::metadata::{EvmPaymentInputs, FlowMetadata, FlowType};
use crate::rpc::evm::{DEFAULT_MAX_BLOCK_RANGE, EvmClient};
use crate::state::StageName;

use super::{ChainPollResult, ChainPoller, PollParams, confirmed_stage, poll_until};

/// `MessageReceived(address indexed caller, uint32 sourceDomain, uint64 indexed nonce, bytes32 sender, bytes messageBody)`
const MESSAGE_RECEIVED_SIGNATURE: &str =
    "MessageReceived(address,uint32,uint64,bytes32,bytes)";

pub struct EvmPoller {
    client: EvmClient,
    max_block_range: u64,
}

impl EvmPoller {
    pub fn new(client: EvmClient) -> Self {
        Self::with_max_block_range(client, DEFAULT_MAX_BLOCK_RANGE)
    }

    pub fn with_max_block_range(client: EvmClient, max_block_range: u64) -> Self {
        Self { client, max_block_range }
    }
}

#[async_trait::async_trait]
impl ChainPoller for EvmPoller {
    async fn poll(&self, params: PollParams) -> Result<ChainPollResult, PollError> {
        match params.flow_type {
            FlowType::Deposit => self.poll_transfer_mode(params).await,
            FlowType::Payment => self.poll_nonce_mode(params).await,
        }
    }
}

impl EvmPoller {
    /// Transfer mode: the flow is already identified by the user's deposit
    /// `tx_hash`; confirm it mined successfully and pull the CCTP nonce and
    /// burn details out of its `MessageReceived` log so Noble's poller knows
    /// what to watch for.
    async fn poll_transfer_mode(&self, params: PollParams) -> Result<ChainPollResult, PollError> {
        let tx_hash_str = params
            .metadata
            .tx_hash
            .clone()
            .ok_or_else(|| PollError::new(ErrorSeverity::PollingError, "missing evm tx_hash to confirm"))?;
        let tx_hash = TxHash::from_str(&tx_hash_str)
            .map_err(|e| PollError::new(ErrorSeverity::PollingError, format!("invalid tx_hash: {e}")))?;

        let receipt = poll_until(&params, || async {
            self.client.transaction_receipt(tx_hash, &params.cancel).await
        })
        .await?;

        if !receipt.status() {
            return Err(PollError::tx_error(format!(
                "evm deposit transaction {tx_hash_str} reverted"
            )));
        }

        let message = receipt
            .logs()
            .iter()
            .find_map(extract_cctp_message)
            .ok_or_else(|| {
                PollError::new(
                    ErrorSeverity::PollingError,
                    "deposit transaction mined but no CCTP MessageReceived log found",
                )
            })?;

        let burn = BurnMessage::decode(&message.message_body);

        Ok(ChainPollResult {
            stages: vec![confirmed_stage(StageName::EvmMintConfirmed, tx_hash_str)],
            metadata_patch: FlowMetadata {
                cctp_nonce: Some(message.nonce),
                source_domain: Some(message.source_domain),
                ..Default::default()
            }
            .with_burn(burn),
        })
    }

    /// Nonce mode: the EVM leg completes a payment. Scan for the
    /// `MessageReceived` log carrying the nonce learned from Noble's burn and
    /// validate the `BurnMessage` body against the expected recipient/amount.
    async fn poll_nonce_mode(&self, params: PollParams) -> Result<ChainPollResult, PollError> {
        let inputs = EvmPaymentInputs::from_metadata(&params.metadata)
            .map_err(|e| PollError::new(ErrorSeverity::PollingError, e.to_string()))?;
        let message_transmitter_address = params
            .metadata
            .message_transmitter_address
            .clone()
            .ok_or_else(|| {
                PollError::new(ErrorSeverity::PollingError, "missing message_transmitter_address")
            })?;
        let address = Address::from_str(&message_transmitter_address).map_err(|e| {
            PollError::new(
                ErrorSeverity::PollingError,
                format!("invalid message_transmitter_address: {e}"),
            )
        })?;
        let start_block = params
            .metadata
            .start_block
            .or_else(|| params.metadata.start_height)
            .unwrap_or(0);
        let recipient = params.metadata.recipient.clone();
        let expected_amount = params
            .metadata
            .amount_base_units
            .as_ref()
            .map(|s| {
                s.parse::<u128>().map_err(|e| {
                    PollError::new(ErrorSeverity::PollingError, format!("invalid amount_base_units: {e}"))
                })
            })
            .transpose()?;
        let expected_source_domain = params.metadata.source_domain;
        let topic0 = event_signature_topic(MESSAGE_RECEIVED_SIGNATURE);
        let topic2 = pad_u64_to_topic(inputs.cctp_nonce);

        let log = poll_until(&params, || async {
            let latest = self.client.latest_block_number(&params.cancel).await?;
            if start_block > latest {
                return Ok(None);
            }
            let logs = self
                .client
                .get_logs(address, start_block, latest, topic0, Some(topic2), self.max_block_range, &params.cancel)
                .await?;
            for log in logs {
                let Some(message) = extract_cctp_message(&log) else { continue };
                if message.nonce != inputs.cctp_nonce {
                    continue;
                }
                let burn = BurnMessage::decode(&message.message_body);
                if !burn_matches(
                    burn.as_ref(),
                    recipient.as_deref(),
                    expected_amount,
                    expected_source_domain,
                    message.source_domain,
                ) {
                    continue;
                }
                return Ok(Some(log));
            }
            Ok(None)
        })
        .await?;

        let tx_hash = log
            .transaction_hash
            .map(|h| format!("{h:#x}"))
            .unwrap_or_default();

        Ok(ChainPollResult {
            stages: vec![confirmed_stage(StageName::EvmMintConfirmed, tx_hash)],
            metadata_patch: FlowMetadata::default(),
        })
    }
}

impl FlowMetadata {
    fn with_burn(mut self, burn: Option<BurnMessage>) -> Self {
        if let Some(burn) = burn {
            self.recipient.get_or_insert(burn.mint_recipient_hex);
            self.amount_base_units.get_or_insert(burn.amount.to_string());
        }
        self
    }
}

fn burn_matches(
    burn: Option<&BurnMessage>,
    recipient: Option<&str>,
    expected_amount: Option<u128>,
    expected_source_domain: Option<u32>,
    event_source_domain: u32,
) -> bool {
    if let Some(expected_source_domain) = expected_source_domain {
        if expected_source_domain != event_source_domain {
            return false;
        }
    }
    let Some(burn) = burn else { return false };
    if let Some(recipient) = recipient {
        let recipient_tail = recipient.to_lowercase();
        let recipient_tail = recipient_tail.trim_start_matches("0x");
        if !burn.mint_recipient_hex.to_lowercase().ends_with(recipient_tail) {
            return false;
        }
    }
    if let Some(expected_amount) = expected_amount {
        if burn.amount != expected_amount {
            return false;
        }
    }
    true
}

/// The decoded `MessageReceived` event: the indexed `nonce` plus the
/// non-indexed `sourceDomain` and `messageBody` fields from `log.data`.
struct CctpMessage {
    nonce: u64,
    source_domain: u32,
    message_body: Vec<u8>,
}

/// CCTP's `MessageReceived` event is `(address indexed caller, uint32
/// sourceDomain, uint64 indexed nonce, bytes32 sender, bytes messageBody)`:
/// `topics[1]` is the caller, `topics[2]` is the nonce, and the three
/// non-indexed fields are ABI-encoded in `log.data` as a `(uint32, bytes32,
/// bytes)` tuple — a fixed head (sourceDomain padded, sender, and an offset
/// to the dynamic tail) followed by the length-prefixed `messageBody` bytes.
fn extract_cctp_message(log: &alloy_rpc_types_eth::Log) -> Option<CctpMessage> {
    let topics = log.topics();
    let nonce_topic: &B256 = topics.get(2)?;
    let nonce = be_bytes_to_u64(nonce_topic.as_slice())?;

    let data = log.data().data.as_ref();
    if data.len() < 96 {
        return None;
    }
    let source_domain = be_bytes_to_u32(&data[0..32])?;
    let tail_offset = be_bytes_to_usize(&data[64..96])?;
    if data.len() < tail_offset + 32 {
        return None;
    }
    let body_len = be_bytes_to_usize(&data[tail_offset..tail_offset + 32])?;
    let body_start = tail_offset + 32;
    let body_end = body_start.checked_add(body_len)?;
    if data.len() < body_end {
        return None;
    }
    let message_body = data[body_start..body_end].to_vec();

    Some(CctpMessage { nonce, source_domain, message_body })
}

/// A decoded CCTP `BurnMessage` body: `mintRecipient` at bytes 36..68 (a
/// bytes32 left-padded 20-byte EVM address) and `amount` at bytes 68..100
/// (a uint256 that must fit in a u128 for any real USDC transfer).
struct BurnMessage {
    mint_recipient_hex: String,
    amount: u128,
}

impl BurnMessage {
    fn decode(body: &[u8]) -> Option<Self> {
        if body.len() < 100 {
            return None;
        }
        let mint_recipient = &body[36..68];
        let mint_recipient_hex = format!("0x{}", hex_encode(&mint_recipient[12..32]));
        let amount_bytes = &body[68..100];
        if amount_bytes[..16].iter().any(|b| *b != 0) {
            return None;
        }
        let mut buf = [0u8; 16];
        buf.copy_from_slice(&amount_bytes[16..32]);
        let amount = u128::from_be_bytes(buf);
        Some(Self { mint_recipient_hex, amount })
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn be_bytes_to_u64(bytes: &[u8]) -> Option<u64> {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes.get(bytes.len().checked_sub(8)?..)?);
    Some(u64::from_be_bytes(buf))
}

fn be_bytes_to_u32(bytes: &[u8]) -> Option<u32> {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(bytes.get(bytes.len().checked_sub(4)?..)?);
    Some(u32::from_be_bytes(buf))
}

fn be_bytes_to_usize(bytes: &[u8]) -> Option<usize> {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes.get(bytes.len().checked_sub(8)?..)?);
    Some(u64::from_be_bytes(buf) as usize)
}

/// Computes a log topic from an event signature string.
fn event_signature_topic(signature: &str) -> B256 {
    keccak256(signature.as_bytes())
}

/// Pads a `u64` nonce into the last 8 bytes of a 32-byte indexed topic.
fn pad_u64_to_topic(nonce: u64) -> B256 {
    let mut bytes = [0u8; 32];
    bytes[24..].copy_from_slice(&nonce.to_be_bytes());
    B256::from(bytes)
}
