//! RPC adapters for the three chains, plus the shared retry/backoff policy
//! (spec.md §7) used by every poller when it talks to a remote node.

pub mod evm;
pub mod retry;
pub mod tendermint;

pub use retry::{RetryPolicy, classify_transport_error, retry_with_backoff};
