//! Cross-chain USDC transfer tracker.
//!
//! Tracks a single logical transfer as it moves across three chains — an EVM
//! chain, the Noble CCTP/IBC hub, and Namada — in either direction:
//!
//! - **Deposit**: EVM → Noble (CCTP mint) → Namada (IBC receive)
//! - **Payment**: Namada → Noble (IBC receive) → EVM (CCTP mint)
//!
//! # Modules
//!
//! - [`config`] — RPC endpoints, timeouts and registration settings.
//! - [`error`] — the poll error taxonomy and chain/severity vocabulary.
//! - [`metadata`] — the cross-chain correlation bag and its merge law.
//! - [`state`] — the persisted polling-state data model and its store.
//! - [`timeout`] — per-chain and global timeout calculation.
//! - [`timestamp`] — epoch and ISO-8601 timestamp helpers.
//! - [`rpc`] — Tendermint and EVM JSON-RPC adapters with retry/backoff.
//! - [`height`] — block-height-from-timestamp lookups.
//! - [`pollers`] — the per-chain, per-direction polling strategies.
//! - [`registration`] — the Noble forwarding-registration sub-job.
//! - [`registration_lcd`] — the Noble LCD REST client backing it.
//! - [`orchestrator`] — the flow state machine tying pollers together.
//! - [`registry`] — the process-wide table of running orchestrators.
//! - [`sig_down`] — graceful shutdown signal handling.
//! - [`telemetry`] — OpenTelemetry tracing/metrics setup.

pub mod config;
pub mod error;
pub mod height;
pub mod metadata;
pub mod orchestrator;
pub mod pollers;
pub mod registration;
pub mod registration_lcd;
pub mod registry;
pub mod rpc;
pub mod sig_down;
pub mod state;
pub mod telemetry;
pub mod timeout;
pub mod timestamp;
