//! Command-line interface for the cardgate device gateway.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use cardgate_core::config::{defaults, env_vars};
use cardgate_core::GatewayConfig;
use cardgate_devices::{
    CallbackResolver, DeviceRegistry, HttpSubscriptionBackend, MaintenanceScheduler,
    SubnetResolver, SubscriptionManager,
};
use cardgate_events::{
    EventDispatcher, HttpPrescriptionGateway, ListenerGroup, PemKeystore, PrescriptionGateway,
    RelayHealth, WebSocketRelay,
};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Cardgate - card terminal event gateway.
#[derive(Parser, Debug)]
#[command(name = "cardgate")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,

    /// Configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Run listeners and subscription maintenance until Ctrl-C.
    Serve,
    /// Unsubscribe and optionally re-subscribe devices once.
    Manage {
        /// Device host; all devices when omitted.
        #[arg(long)]
        host: Option<String>,
        /// Callback host the devices push events to.
        #[arg(long)]
        event_to_host: Option<String>,
        /// Ask the device to drop the subscription even if it disagrees.
        #[arg(long)]
        force: bool,
        /// Subscribe again after unsubscribing.
        #[arg(long)]
        subscribe: bool,
    },
    /// List the cards currently inserted in the devices.
    Cards {
        /// Device host; all devices when omitted.
        #[arg(long)]
        host: Option<String>,
        /// Card type filter.
        #[arg(long, default_value = "SMC-B")]
        card_type: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    // reqwest, tokio-rustls and tungstenite share one provider
    let _ = rustls::crypto::ring::default_provider().install_default();

    let config = load_config(args.config)?;

    match args.command {
        Command::Serve => run_server(config).await,
        Command::Manage {
            host,
            event_to_host,
            force,
            subscribe,
        } => run_manage(config, host, event_to_host, force, subscribe).await,
        Command::Cards { host, card_type } => list_cards(config, host, &card_type).await,
    }
}

fn init_logging(verbose: bool) {
    let default_directive = if verbose { "cardgate=debug" } else { "cardgate=info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));

    if env_vars::log_json() {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .compact()
            .init();
    }
}

/// `--config`, then `CARDGATE_CONFIG`, then the default path. A missing
/// default file yields the built-in defaults.
fn load_config(path: Option<PathBuf>) -> Result<GatewayConfig> {
    let explicit = path.or_else(|| env_vars::config_path().map(PathBuf::from));
    match explicit {
        Some(path) => GatewayConfig::load(&path)
            .with_context(|| format!("Failed to load configuration from {}", path.display())),
        None => {
            let path = PathBuf::from(defaults::CONFIG_PATH);
            if path.exists() {
                GatewayConfig::load(&path)
                    .with_context(|| format!("Failed to load configuration from {}", path.display()))
            } else {
                warn!(path = %path.display(), "No configuration file, using defaults");
                GatewayConfig::from_toml("").context("Invalid default configuration")
            }
        }
    }
}

fn build_manager(config: &GatewayConfig) -> Result<Arc<SubscriptionManager>> {
    let registry = DeviceRegistry::from_config(config).context("Failed to build device registry")?;
    let backend = HttpSubscriptionBackend::new(Duration::from_secs(config.backend.timeout_secs));
    Ok(Arc::new(SubscriptionManager::new(
        Arc::new(registry),
        Arc::new(backend),
        config.subscriptions.clone(),
    )))
}

async fn run_server(config: GatewayConfig) -> Result<()> {
    let manager = build_manager(&config)?;
    let devices = manager.registry().all();

    let keystore = PemKeystore::new(config.tls.cert_path.clone(), config.tls.key_path.clone());
    let gateway: Arc<dyn PrescriptionGateway> = Arc::new(HttpPrescriptionGateway::new(
        config.prescriptions.bridge_url.clone(),
        Duration::from_secs(config.prescriptions.timeout_secs),
    ));
    let pharmacy_handle = config.prescriptions.pharmacy_handle.clone();

    let listeners = ListenerGroup::start(&devices, &keystore, &config.listener, |device| {
        let relay = WebSocketRelay::new(device.relay_endpoint(), RelayHealth::new());
        Arc::new(EventDispatcher::new(
            gateway.clone(),
            Arc::new(relay),
            pharmacy_handle.clone(),
        ))
    })
    .await;
    if listeners.len() < devices.len() {
        warn!(
            started = listeners.len(),
            configured = devices.len(),
            "Some device listeners did not start"
        );
    }

    let resolver = Arc::new(SubnetResolver::new(
        config.subscriptions.event_to_host.clone(),
    ));
    let scheduler = Arc::new(MaintenanceScheduler::with_default_retrier(
        manager.clone(),
        resolver,
    ));
    let cancel = CancellationToken::new();
    let maintenance = scheduler.start(cancel.clone());

    info!(devices = devices.len(), "Cardgate running, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutting down");

    listeners.shutdown().await;
    cancel.cancel();
    if tokio::time::timeout(config.listener.shutdown_grace(), maintenance)
        .await
        .is_err()
    {
        warn!("Maintenance tick still running at shutdown");
    }
    Ok(())
}

async fn run_manage(
    config: GatewayConfig,
    host: Option<String>,
    event_to_host: Option<String>,
    force: bool,
    subscribe: bool,
) -> Result<()> {
    let manager = build_manager(&config)?;
    let devices = manager.registry().find_by_host(host.as_deref());

    let event_to_host = match event_to_host.or_else(|| config.subscriptions.event_to_host.clone()) {
        Some(event_to_host) => event_to_host,
        None => match devices.first() {
            Some(device) => SubnetResolver::new(None)
                .resolve(device)
                .await
                .map(|callback| callback.host)
                .ok_or_else(|| anyhow!("Cannot determine the callback host, pass --event-to-host"))?,
            // nothing matches; manage reports that itself
            None => String::new(),
        },
    };

    for status in manager
        .manage(host.as_deref(), &event_to_host, force, subscribe)
        .await
    {
        println!("{}", status);
    }
    Ok(())
}

async fn list_cards(config: GatewayConfig, host: Option<String>, card_type: &str) -> Result<()> {
    let manager = build_manager(&config)?;
    let inventory = manager.cards(host.as_deref(), card_type).await;
    if inventory.is_empty() {
        println!(
            "No configuration is found for the given host: {}",
            host.unwrap_or_default()
        );
        return Ok(());
    }

    for (device, cards) in inventory {
        match cards {
            Ok(cards) => {
                println!("{}: {} card(s)", device.key(), cards.len());
                for card in cards {
                    println!(
                        "  {} type={} slot={} ct={} holder={}",
                        card.card_handle,
                        card.card_type,
                        card.slot_id.as_deref().unwrap_or("-"),
                        card.ct_id.as_deref().unwrap_or("-"),
                        card.card_holder_name.as_deref().unwrap_or("-"),
                    );
                }
            }
            Err(e) => println!("{}: {}", device.key(), e),
        }
    }
    Ok(())
}
