//! The cross-chain correlation bag (spec.md §3, §9).
//!
//! `FlowMetadata` is the single source of truth every poller reads its inputs from
//! and writes its outputs to. It is deliberately loose — every hop adds keys — but
//! modeled as an all-`Option` struct rather than a free-form map so that a typo'd
//! key can't silently vanish, per the Design Notes' suggestion for a "typed facade".
//! [`FlowMetadata::merge_from`] implements the one merge law that matters:
//! a field already `Some` is never clobbered by an incoming `None`.

use serde::{Deserialize, Serialize};

use crate::error::{Chain, OrchestratorError};

/// Direction of a cross-chain transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowType {
    Deposit,
    Payment,
}

impl FlowType {
    pub fn as_str(self) -> &'static str {
        match self {
            FlowType::Deposit => "deposit",
            FlowType::Payment => "payment",
        }
    }

    /// The chain order this direction walks, per spec.md §2/§4.1.
    pub fn chain_order(self) -> &'static [Chain] {
        match self {
            FlowType::Deposit => &[Chain::Evm, Chain::Noble, Chain::Namada],
            FlowType::Payment => &[Chain::Namada, Chain::Noble, Chain::Evm],
        }
    }
}

/// The shared metadata bag. Every field is optional; absence is meaningful.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_type: Option<FlowType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount_base_units: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_amount_uusdc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namada_receiver: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forwarding_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usdc_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_transmitter_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_domain: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_block: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_height: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cctp_nonce: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packet_sequence: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namada_block_height: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namada_ibc_tx_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evm_chain_key: Option<String>,
}

impl FlowMetadata {
    /// Merge `other` into `self`, filtering absent values so a late-arriving
    /// partial result can never erase an earlier correlation id (invariant 6).
    pub fn merge_from(&mut self, other: FlowMetadata) {
        macro_rules! merge_field {
            ($field:ident) => {
                if other.$field.is_some() {
                    self.$field = other.$field;
                }
            };
        }
        merge_field!(chain_key);
        merge_field!(tx_hash);
        merge_field!(flow_type);
        merge_field!(recipient);
        merge_field!(amount_base_units);
        merge_field!(expected_amount_uusdc);
        merge_field!(namada_receiver);
        merge_field!(forwarding_address);
        merge_field!(fallback);
        merge_field!(usdc_address);
        merge_field!(message_transmitter_address);
        merge_field!(source_domain);
        merge_field!(start_block);
        merge_field!(start_height);
        merge_field!(cctp_nonce);
        merge_field!(packet_sequence);
        merge_field!(namada_block_height);
        merge_field!(namada_ibc_tx_hash);
        merge_field!(evm_chain_key);
    }

    pub fn is_empty(&self) -> bool {
        serde_json::to_value(self)
            .map(|v| v.as_object().is_none_or(|o| o.is_empty()))
            .unwrap_or(true)
    }
}

/// Per-chain "view" that fails loudly when a prerequisite the chain's poller
/// needs is missing, instead of the poller discovering a `None` mid-flight.
pub struct NobleDepositInputs {
    pub cctp_nonce: u64,
    pub forwarding_address: String,
    pub namada_receiver: String,
}

impl NobleDepositInputs {
    pub fn from_metadata(meta: &FlowMetadata) -> Result<Self, OrchestratorError> {
        let cctp_nonce = meta.cctp_nonce.ok_or(OrchestratorError::MissingPrerequisite {
            key: "cctpNonce",
            chain: Chain::Noble,
            flow_type: "deposit",
        })?;
        let forwarding_address =
            meta.forwarding_address
                .clone()
                .ok_or(OrchestratorError::MissingPrerequisite {
                    key: "forwardingAddress",
                    chain: Chain::Noble,
                    flow_type: "deposit",
                })?;
        let namada_receiver =
            meta.namada_receiver
                .clone()
                .ok_or(OrchestratorError::MissingPrerequisite {
                    key: "namadaReceiver",
                    chain: Chain::Noble,
                    flow_type: "deposit",
                })?;
        Ok(Self {
            cctp_nonce,
            forwarding_address,
            namada_receiver,
        })
    }
}

pub struct NoblePaymentInputs {
    pub packet_sequence: u64,
}

impl NoblePaymentInputs {
    pub fn from_metadata(meta: &FlowMetadata) -> Result<Self, OrchestratorError> {
        Ok(Self {
            packet_sequence: meta
                .packet_sequence
                .ok_or(OrchestratorError::MissingPrerequisite {
                    key: "packetSequence",
                    chain: Chain::Noble,
                    flow_type: "payment",
                })?,
        })
    }
}

pub struct NamadaDepositInputs {
    pub packet_sequence: u64,
    pub namada_receiver: String,
    pub start_height: u64,
}

impl NamadaDepositInputs {
    pub fn from_metadata(meta: &FlowMetadata) -> Result<Self, OrchestratorError> {
        let packet_sequence = meta
            .packet_sequence
            .ok_or(OrchestratorError::MissingPrerequisite {
                key: "packetSequence",
                chain: Chain::Namada,
                flow_type: "deposit",
            })?;
        let namada_receiver =
            meta.namada_receiver
                .clone()
                .ok_or(OrchestratorError::MissingPrerequisite {
                    key: "namadaReceiver",
                    chain: Chain::Namada,
                    flow_type: "deposit",
                })?;
        let start_height = meta.start_height.ok_or(OrchestratorError::MissingPrerequisite {
            key: "startHeight",
            chain: Chain::Namada,
            flow_type: "deposit",
        })?;
        Ok(Self {
            packet_sequence,
            namada_receiver,
            start_height,
        })
    }
}

pub struct EvmPaymentInputs {
    pub cctp_nonce: u64,
}

impl EvmPaymentInputs {
    pub fn from_metadata(meta: &FlowMetadata) -> Result<Self, OrchestratorError> {
        Ok(Self {
            cctp_nonce: meta.cctp_nonce.ok_or(OrchestratorError::MissingPrerequisite {
                key: "cctpNonce",
                chain: Chain::Evm,
                flow_type: "payment",
            })?,
        })
    }
}

pub struct NamadaPaymentInputs {
    pub namada_block_height: u64,
    pub namada_ibc_tx_hash: String,
}

impl NamadaPaymentInputs {
    pub fn from_metadata(meta: &FlowMetadata) -> Result<Self, OrchestratorError> {
        let namada_block_height =
            meta.namada_block_height
                .ok_or(OrchestratorError::MissingPrerequisite {
                    key: "namadaBlockHeight",
                    chain: Chain::Namada,
                    flow_type: "payment",
                })?;
        let namada_ibc_tx_hash =
            meta.namada_ibc_tx_hash
                .clone()
                .ok_or(OrchestratorError::MissingPrerequisite {
                    key: "namadaIbcTxHash",
                    chain: Chain::Namada,
                    flow_type: "payment",
                })?;
        Ok(Self {
            namada_block_height,
            namada_ibc_tx_hash,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_never_overwrites_with_none() {
        let mut base = FlowMetadata {
            cctp_nonce: Some(704_111),
            ..Default::default()
        };
        let partial = FlowMetadata {
            packet_sequence: Some(17),
            ..Default::default()
        };
        base.merge_from(partial);
        assert_eq!(base.cctp_nonce, Some(704_111));
        assert_eq!(base.packet_sequence, Some(17));
    }

    #[test]
    fn merge_overwrites_when_incoming_is_some() {
        let mut base = FlowMetadata {
            cctp_nonce: Some(1),
            ..Default::default()
        };
        base.merge_from(FlowMetadata {
            cctp_nonce: Some(2),
            ..Default::default()
        });
        assert_eq!(base.cctp_nonce, Some(2));
    }
}
