//! `flowtrack-cli`: a thin command-line front end over the [`flowtrack`]
//! library for operating a single flow's orchestrator registry by hand.
//!
//! Environment:
//! - `.env` values loaded at startup
//! - `--config` (or `CONFIG`) selects the JSON configuration file
//! - `OTEL_*` variables enable OpenTelemetry export, same as the library crate

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use dotenvy::dotenv;

use flowtrack::config::Config;
use flowtrack::error::{Chain, PollError};
use flowtrack::height::{find_evm_block_for_timestamp, find_tendermint_height_for_timestamp};
use flowtrack::metadata::{FlowMetadata, FlowType};
use flowtrack::orchestrator::FlowOrchestrator;
use flowtrack::pollers::ChainPoller;
use flowtrack::pollers::evm::EvmPoller;
use flowtrack::pollers::namada::NamadaPoller;
use flowtrack::pollers::noble::NoblePoller;
use flowtrack::registration_lcd::LcdRegistrationBuilder;
use flowtrack::registry::FlowRegistry;
use flowtrack::rpc::evm::EvmClient;
use flowtrack::rpc::tendermint::TendermintClient;
use flowtrack::sig_down::SigDown;
use flowtrack::state::store::{InMemoryStateStore, StateStore, get_polling_state};
use flowtrack::telemetry::Telemetry;
use flowtrack::timestamp::EpochSeconds;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "flowtrack-cli")]
#[command(about = "Cross-chain USDC transfer tracker")]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(long, short, env = "CONFIG", default_value = "config.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Starts tracking a new transfer and runs it to a terminal status.
    Start {
        tx_id: String,
        #[arg(long, value_enum)]
        flow_type: CliFlowType,
        #[arg(long)]
        tx_hash: Option<String>,
        #[arg(long)]
        forwarding_address: Option<String>,
        #[arg(long)]
        namada_receiver: Option<String>,
        #[arg(long)]
        recipient: Option<String>,
        #[arg(long)]
        amount_base_units: Option<String>,
        #[arg(long)]
        usdc_address: Option<String>,
        #[arg(long)]
        cctp_nonce: Option<u64>,
        #[arg(long)]
        packet_sequence: Option<u64>,
        #[arg(long)]
        start_block: Option<u64>,
        #[arg(long)]
        start_height: Option<u64>,
        /// When `start_block`/`start_height` are omitted, resolves them from
        /// this Unix timestamp instead of scanning from genesis.
        #[arg(long)]
        start_timestamp_secs: Option<u64>,
    },
    /// Resumes an existing transfer's polling loop from its persisted state.
    Resume { tx_id: String },
    /// Marks a transfer cancelled.
    Cancel { tx_id: String },
    /// Resets a terminal, non-cancelled transfer back to its first chain.
    Retry { tx_id: String },
    /// Prints a transfer's current status.
    Status { tx_id: String },
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum CliFlowType {
    Deposit,
    Payment,
}

impl From<CliFlowType> for FlowType {
    fn from(value: CliFlowType) -> Self {
        match value {
            CliFlowType::Deposit => FlowType::Deposit,
            CliFlowType::Payment => FlowType::Payment,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    let _telemetry = Telemetry::new();

    let cli = Cli::parse();
    let config_path = cli.config.canonicalize().unwrap_or(cli.config.clone());
    let config = Config::load_from_path(config_path)?;

    let sig_down = SigDown::try_new()?;

    let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
    let pollers = build_pollers(&config);
    let orchestrator = Arc::new(FlowOrchestrator::new(
        store.clone(),
        pollers,
        config.timeouts.clone(),
        config.global_timeout.clone(),
    ));
    let registry = Arc::new(FlowRegistry::new(orchestrator));

    match cli.command {
        Command::Start {
            tx_id,
            flow_type,
            tx_hash,
            forwarding_address,
            namada_receiver,
            recipient,
            amount_base_units,
            usdc_address,
            cctp_nonce,
            packet_sequence,
            start_block,
            start_height,
            start_timestamp_secs,
        } => {
            let flow_type: FlowType = flow_type.into();
            let (start_block, start_height) = resolve_start_positions(
                &config,
                flow_type,
                start_block,
                start_height,
                start_timestamp_secs,
            )
            .await?;
            let metadata = FlowMetadata {
                tx_hash,
                forwarding_address,
                namada_receiver,
                recipient,
                amount_base_units,
                usdc_address,
                cctp_nonce,
                packet_sequence,
                start_block,
                start_height,
                ..Default::default()
            };
            registry.start(tx_id.clone(), flow_type, metadata);
            wait_for_shutdown_or_completion(&registry, &tx_id, &sig_down).await;
            print_status(store.as_ref(), &tx_id).await;
        }
        Command::Resume { tx_id } => {
            registry.resume(tx_id.clone());
            wait_for_shutdown_or_completion(&registry, &tx_id, &sig_down).await;
            print_status(store.as_ref(), &tx_id).await;
        }
        Command::Cancel { tx_id } => {
            registry.cancel(&tx_id).await?;
            print_status(store.as_ref(), &tx_id).await;
        }
        Command::Retry { tx_id } => {
            registry.retry(tx_id.clone())?;
            wait_for_shutdown_or_completion(&registry, &tx_id, &sig_down).await;
            print_status(store.as_ref(), &tx_id).await;
        }
        Command::Status { tx_id } => {
            print_status(store.as_ref(), &tx_id).await;
        }
    }

    registry.shutdown().await;
    Ok(())
}

/// Resolves `start_block`/`start_height` from `start_timestamp_secs` when the
/// caller didn't pass an explicit position, so a flow can be started without
/// scanning from each chain's genesis.
async fn resolve_start_positions(
    config: &Config,
    flow_type: FlowType,
    start_block: Option<u64>,
    start_height: Option<u64>,
    start_timestamp_secs: Option<u64>,
) -> Result<(Option<u64>, Option<u64>), Box<dyn std::error::Error>> {
    let Some(secs) = start_timestamp_secs else {
        return Ok((start_block, start_height));
    };
    let target = EpochSeconds(secs);
    let cancel = CancellationToken::new();

    match flow_type {
        FlowType::Deposit if start_block.is_none() => {
            let client = EvmClient::new(config.rpc.get(Chain::Evm).http.inner().clone());
            let block = find_evm_block_for_timestamp(&client, target, &cancel)
                .await
                .map_err(poll_error_to_boxed)?;
            Ok((Some(block), start_height))
        }
        FlowType::Payment if start_height.is_none() => {
            let client = TendermintClient::new(config.rpc.get(Chain::Namada).http.inner().clone());
            let height = find_tendermint_height_for_timestamp(&client, target, &cancel)
                .await
                .map_err(poll_error_to_boxed)?;
            Ok((start_block, Some(height)))
        }
        _ => Ok((start_block, start_height)),
    }
}

fn poll_error_to_boxed(err: PollError) -> Box<dyn std::error::Error> {
    err.message.into()
}

fn build_pollers(config: &Config) -> HashMap<Chain, Arc<dyn ChainPoller>> {
    let mut pollers: HashMap<Chain, Arc<dyn ChainPoller>> = HashMap::new();
    let evm_rpc = config.rpc.get(Chain::Evm);
    pollers.insert(
        Chain::Evm,
        Arc::new(EvmPoller::with_max_block_range(
            EvmClient::new(evm_rpc.http.inner().clone()),
            evm_rpc.max_block_range.unwrap_or(flowtrack::rpc::evm::DEFAULT_MAX_BLOCK_RANGE),
        )),
    );
    let registration_builder = Arc::new(LcdRegistrationBuilder::new(
        config.noble_lcd.base_url.inner().clone(),
        config.noble_lcd.signed_tx_base64.inner().clone(),
    ));
    pollers.insert(
        Chain::Noble,
        Arc::new(NoblePoller::new(
            TendermintClient::new(config.rpc.get(Chain::Noble).http.inner().clone()),
            registration_builder,
            config.registration.clone(),
        )),
    );
    pollers.insert(
        Chain::Namada,
        Arc::new(NamadaPoller::new(TendermintClient::new(
            config.rpc.get(Chain::Namada).http.inner().clone(),
        ))),
    );
    pollers
}

/// Waits until either the flow's polling task completes on its own or a
/// shutdown signal arrives, in which case the registry is cancelled and the
/// task is allowed to unwind before returning.
async fn wait_for_shutdown_or_completion(registry: &Arc<FlowRegistry>, tx_id: &str, sig_down: &SigDown) {
    let cancel = sig_down.cancellation_token();
    let mut cancel_requested = false;
    loop {
        if !registry.is_tracked(tx_id) {
            return;
        }
        if cancel.is_cancelled() && !cancel_requested {
            cancel_requested = true;
            let _ = registry.cancel(tx_id).await;
        }
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    }
}

async fn print_status(store: &dyn StateStore, tx_id: &str) {
    match get_polling_state(store, tx_id).await {
        Some(state) => {
            println!(
                "{tx_id}: {:?} (current_chain={:?}, current={:?})",
                state.flow_status, state.current_chain, state.latest_completed_stage
            );
        }
        None => println!("{tx_id}: no tracked state"),
    }
}
