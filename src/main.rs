use clap::{Args, Parser, Subcommand};
use eyre::WrapErr;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use bridge_relayer::api;
use bridge_relayer::config::{Config, ConfigOverrides};
use bridge_relayer::db::PgStore;
use bridge_relayer::ledger::evm::{EvmDestinationClient, EvmSourceClient, LocalKeySigner};
use bridge_relayer::relayer::Relayer;

#[derive(Parser)]
#[command(name = "bridge-relayer")]
#[command(about = "Relays bridge burns from a source chain as mints on a destination chain", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start relaying until SIGINT/SIGTERM
    Start(StartArgs),
}

#[derive(Args)]
struct StartArgs {
    /// Source chain RPC endpoint (overrides SOURCE_RPC_URL)
    #[arg(long)]
    source_endpoint: Option<String>,

    /// Destination chain RPC endpoint (overrides DESTINATION_RPC_URL)
    #[arg(long)]
    destination_endpoint: Option<String>,

    /// Bridge contract on the source chain (overrides SOURCE_CONTRACT)
    #[arg(long)]
    source_contract: Option<String>,

    /// Bridge contract on the destination chain (overrides DESTINATION_CONTRACT)
    #[arg(long)]
    destination_contract: Option<String>,

    /// First block to scan when no cursor is stored (overrides FROM_BLOCK)
    #[arg(long)]
    from_block: Option<u64>,

    /// Poll interval in milliseconds (overrides POLL_INTERVAL_MS)
    #[arg(long)]
    poll_interval: Option<u64>,

    /// Source blocks required on top of an event (overrides CONFIRMATION_DEPTH)
    #[arg(long)]
    confirmation_depth: Option<u64>,

    /// Concurrent submissions (overrides MAX_IN_FLIGHT)
    #[arg(long)]
    max_in_flight: Option<usize>,

    /// Load environment variables from this file instead of .env
    #[arg(long)]
    env_file: Option<String>,
}

impl StartArgs {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            source_endpoint: self.source_endpoint.clone(),
            destination_endpoint: self.destination_endpoint.clone(),
            source_contract: self.source_contract.clone(),
            destination_contract: self.destination_contract.clone(),
            from_block: self.from_block,
            poll_interval_ms: self.poll_interval,
            confirmation_depth: self.confirmation_depth,
            max_in_flight: self.max_in_flight,
        }
    }
}

fn main() -> eyre::Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async {
            match cli.command {
                Commands::Start(args) => start(args).await,
            }
        })
}

async fn start(args: StartArgs) -> eyre::Result<()> {
    init_logging();

    tracing::info!("Starting bridge relayer");

    let config = Config::load(args.env_file.as_deref(), &args.overrides())?;
    tracing::info!(
        source_chain_id = config.source.chain_id,
        destination_chain_id = config.destination.chain_id,
        "Configuration loaded"
    );

    let store = Arc::new(PgStore::connect(&config.database.url).await?);
    tracing::info!("Database connected, migrations complete");

    let source = Arc::new(
        EvmSourceClient::new(&config.source.rpc_url, config.source.chain_id)
            .await
            .wrap_err("Failed to connect to source chain")?,
    );
    let destination = Arc::new(
        EvmDestinationClient::new(
            &config.destination.rpc_url,
            config.destination_contract()?,
            config.destination.chain_id,
        )
        .await
        .wrap_err("Failed to connect to destination chain")?,
    );
    let signer = Arc::new(LocalKeySigner::new(
        &config.destination.private_key,
        config.destination.chain_id,
    )?);

    let relayer = Relayer::new(
        store.clone(),
        source,
        destination,
        signer,
        config.scan_settings()?,
        config.relay_settings()?,
        config.gas_policy(),
    );

    let api_addr = SocketAddr::from(([0, 0, 0, 0], config.api_port));
    let chain_id = config.source.chain_id;
    tokio::spawn(async move {
        if let Err(e) = api::start_api_server(api_addr, store, chain_id).await {
            tracing::error!(error = %e, "API server error");
        }
    });

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        signal_cancel.cancel();
    });

    let result = relayer.run(cancel).await;
    match &result {
        Ok(()) => tracing::info!("Bridge relayer stopped"),
        Err(e) => tracing::error!(error = ?e, "Bridge relayer stopped with an error"),
    }
    result
}

/// Initialize tracing; `LOG_FORMAT=json` switches to JSON lines
fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,bridge_relayer=debug"));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

/// Wait for shutdown signals (SIGINT/SIGTERM)
async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
