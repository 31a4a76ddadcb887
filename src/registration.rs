//! Noble forwarding-registration sub-job (spec.md §4.6).
//!
//! Before Noble will auto-forward a CCTP mint on to Namada over IBC, the
//! recipient's forwarding account has to exist on-chain. Registering it costs
//! gas, so this waits for the account to hold a minimum balance before
//! broadcasting, and treats "already registered" as success rather than an
//! error — a retried deposit must not fail here just because an earlier
//! attempt already did this step.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::RegistrationConfig;
use crate::error::{PollError, RecoveryAction};
use crate::state::{ChainStage, StageName};

/// Delegated transaction construction/broadcast, kept behind a trait since it
/// depends on a signer this crate deliberately does not hold (spec.md §1
/// Non-goals: no custody, no broadcasting outside of what registration needs).
#[async_trait]
pub trait RegistrationTxBuilder: Send + Sync {
    /// Current balance of the forwarding account's gas-paying address, in
    /// base units.
    async fn query_balance(&self, forwarding_address: &str) -> Result<u128, PollError>;

    /// `true` if the forwarding account already exists and is registered.
    async fn is_already_registered(&self, forwarding_address: &str) -> Result<bool, PollError>;

    /// Broadcasts the registration transaction, returning its hash.
    async fn broadcast_registration(&self, forwarding_address: &str) -> Result<String, PollError>;
}

/// Runs the registration sub-job to completion: gate on balance, broadcast,
/// and treat a pre-existing registration as an immediate success.
pub async fn ensure_forwarding_registered(
    builder: &dyn RegistrationTxBuilder,
    forwarding_address: &str,
    config: &RegistrationConfig,
    cancel: &CancellationToken,
) -> Result<ChainStage, PollError> {
    if builder.is_already_registered(forwarding_address).await? {
        return Ok(ChainStage::confirmed(StageName::NobleForwardingRegistration)
            .with_message("forwarding account already registered"));
    }

    let mut attempts = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Err(PollError::cancelled());
        }
        let balance = builder.query_balance(forwarding_address).await?;
        if balance >= config.min_balance_base_units {
            break;
        }
        attempts += 1;
        if attempts >= config.balance_poll_attempts {
            return Err(PollError::user_action_required(format!(
                "forwarding account {forwarding_address} never reached the minimum balance \
                 ({} base units) required to register after {attempts} attempts",
                config.min_balance_base_units
            ))
            .with_recovery(true, RecoveryAction::Retry));
        }
        tokio::select! {
            _ = tokio::time::sleep(std::time::Duration::from_millis(config.balance_poll_interval_ms)) => {}
            _ = cancel.cancelled() => return Err(PollError::cancelled()),
        }
    }

    // Re-check for a race: another process may have registered the account
    // while this one was waiting on balance.
    if builder.is_already_registered(forwarding_address).await? {
        return Ok(ChainStage::confirmed(StageName::NobleForwardingRegistration)
            .with_message("forwarding account registered concurrently"));
    }

    let tx_hash = builder.broadcast_registration(forwarding_address).await?;
    Ok(ChainStage::confirmed(StageName::NobleForwardingRegistration).with_tx_hash(tx_hash))
}

impl ChainStage {
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::atomic::AtomicU64;
    use std::sync::atomic::Ordering;

    struct StubBuilder {
        already_registered: bool,
        balance_after_attempts: u32,
        calls: AtomicU32,
        balance: AtomicU64,
    }

    #[async_trait]
    impl RegistrationTxBuilder for StubBuilder {
        async fn query_balance(&self, _forwarding_address: &str) -> Result<u128, PollError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call + 1 >= self.balance_after_attempts {
                self.balance.store(10, Ordering::SeqCst);
            }
            Ok(self.balance.load(Ordering::SeqCst) as u128)
        }

        async fn is_already_registered(&self, _forwarding_address: &str) -> Result<bool, PollError> {
            Ok(self.already_registered)
        }

        async fn broadcast_registration(&self, _forwarding_address: &str) -> Result<String, PollError> {
            Ok("noble1tx...hash".to_string())
        }
    }

    #[tokio::test]
    async fn skips_broadcast_when_already_registered() {
        let builder = StubBuilder {
            already_registered: true,
            balance_after_attempts: 0,
            calls: AtomicU32::new(0),
            balance: AtomicU64::new(0),
        };
        let config = RegistrationConfig::default();
        let cancel = CancellationToken::new();
        let stage = ensure_forwarding_registered(&builder, "noble1forward", &config, &cancel)
            .await
            .unwrap();
        assert!(stage.tx_hash.is_none());
    }

    #[tokio::test]
    async fn waits_for_balance_then_broadcasts() {
        let builder = StubBuilder {
            already_registered: false,
            balance_after_attempts: 2,
            calls: AtomicU32::new(0),
            balance: AtomicU64::new(0),
        };
        let mut config = RegistrationConfig::default();
        config.balance_poll_interval_ms = 1;
        config.balance_poll_attempts = 5;
        let cancel = CancellationToken::new();
        let stage = ensure_forwarding_registered(&builder, "noble1forward", &config, &cancel)
            .await
            .unwrap();
        assert_eq!(stage.tx_hash.as_deref(), Some("noble1tx...hash"));
    }

    #[tokio::test]
    async fn race_recheck_skips_broadcast_when_registered_while_waiting_on_balance() {
        struct RaceBuilder {
            registered: std::sync::atomic::AtomicBool,
            broadcasts: AtomicU32,
        }

        #[async_trait]
        impl RegistrationTxBuilder for RaceBuilder {
            async fn query_balance(&self, _forwarding_address: &str) -> Result<u128, PollError> {
                Ok(10)
            }
            async fn is_already_registered(&self, _forwarding_address: &str) -> Result<bool, PollError> {
                // First call (pre-balance-wait) says not yet registered; by the
                // time the post-wait recheck runs, another process has won the race.
                Ok(self.registered.swap(true, Ordering::SeqCst))
            }
            async fn broadcast_registration(&self, _forwarding_address: &str) -> Result<String, PollError> {
                self.broadcasts.fetch_add(1, Ordering::SeqCst);
                Ok("noble1tx...hash".to_string())
            }
        }

        let builder = RaceBuilder {
            registered: std::sync::atomic::AtomicBool::new(false),
            broadcasts: AtomicU32::new(0),
        };
        let config = RegistrationConfig::default();
        let cancel = CancellationToken::new();
        let stage = ensure_forwarding_registered(&builder, "noble1forward", &config, &cancel)
            .await
            .unwrap();
        assert!(stage.tx_hash.is_none());
        assert_eq!(builder.broadcasts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn calling_twice_on_an_already_registered_recipient_never_broadcasts() {
        struct CountingBuilder {
            broadcasts: AtomicU32,
        }

        #[async_trait]
        impl RegistrationTxBuilder for CountingBuilder {
            async fn query_balance(&self, _forwarding_address: &str) -> Result<u128, PollError> {
                Ok(0)
            }
            async fn is_already_registered(&self, _forwarding_address: &str) -> Result<bool, PollError> {
                Ok(true)
            }
            async fn broadcast_registration(&self, _forwarding_address: &str) -> Result<String, PollError> {
                self.broadcasts.fetch_add(1, Ordering::SeqCst);
                Ok("noble1tx...hash".to_string())
            }
        }

        let builder = CountingBuilder { broadcasts: AtomicU32::new(0) };
        let config = RegistrationConfig::default();
        let cancel = CancellationToken::new();

        for _ in 0..2 {
            let stage = ensure_forwarding_registered(&builder, "noble1forward", &config, &cancel)
                .await
                .unwrap();
            assert!(stage.tx_hash.is_none());
            assert_eq!(
                stage.message.as_deref(),
                Some("forwarding account already registered")
            );
        }
        assert_eq!(builder.broadcasts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn gives_up_after_exhausting_attempts() {
        let builder = StubBuilder {
            already_registered: false,
            balance_after_attempts: 1000,
            calls: AtomicU32::new(0),
            balance: AtomicU64::new(0),
        };
        let mut config = RegistrationConfig::default();
        config.balance_poll_interval_ms = 1;
        config.balance_poll_attempts = 3;
        let cancel = CancellationToken::new();
        let result = ensure_forwarding_registered(&builder, "noble1forward", &config, &cancel).await;
        assert!(result.is_err());
    }
}
