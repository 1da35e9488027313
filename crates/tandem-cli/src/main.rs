//! Tandem CLI
//!
//! Thin wrapper around tandem-core for inspecting and adjusting the local
//! sync state.
//!
//! ## Usage
//!
//! ```bash
//! # Show this device's identity and sync settings
//! tandem info
//!
//! # Rename this device
//! tandem name "Kitchen Tablet"
//!
//! # Turn automatic sync on or off
//! tandem enable
//! tandem disable
//!
//! # Inspect or change the sync configuration
//! tandem config show
//! tandem config set --domains memory,preferences --network any --interval-hours 2
//!
//! # List or forget paired devices
//! tandem devices
//! tandem unpair <device_id>
//!
//! # Pair and sync two simulated devices in memory
//! tandem demo --payload-kib 256
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tandem_core::{
    CoordinatorDeps, CoordinatorSettings, DeviceClass, DomainProviders, InMemoryProvider,
    LoopbackPeer, LoopbackTransport, MemoryStore, NetworkConstraint, RedbStore, SyncConfiguration,
    SyncCoordinator, SyncDomain, SyncEvent, TransportKind, TransportSet,
};
use tokio::sync::broadcast;
use tracing::debug;

/// Tandem - cross-device sync
#[derive(Parser)]
#[command(name = "tandem")]
#[command(version = "0.1.0")]
#[command(about = "Tandem - encrypted cross-device state sync")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Data directory (default: ~/.tandem/data)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show device identity and sync status
    Info,

    /// Rename this device
    Name {
        /// New display name
        name: String,
    },

    /// Enable automatic sync
    Enable,

    /// Disable automatic sync
    Disable,

    /// Sync configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// List paired devices
    Devices,

    /// Forget a paired device
    Unpair {
        /// Device id as shown by `devices`
        device_id: String,
    },

    /// Pair two in-memory devices and push a package between them
    Demo {
        /// Size of the memory domain blob to send
        #[arg(long, default_value_t = 64)]
        payload_kib: usize,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the current configuration
    Show,
    /// Change one or more configuration fields
    Set {
        /// Comma-separated domains: memory, preferences, personality
        #[arg(long, value_delimiter = ',')]
        domains: Option<Vec<SyncDomain>>,
        /// Networks automatic sync may use
        #[arg(long, value_enum)]
        network: Option<NetworkArg>,
        /// Whether the background scheduler may start sessions
        #[arg(long)]
        auto_sync: Option<bool>,
        /// Hours between timer-driven syncs
        #[arg(long)]
        interval_hours: Option<u64>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum NetworkArg {
    Any,
    Unmetered,
}

impl From<NetworkArg> for NetworkConstraint {
    fn from(arg: NetworkArg) -> Self {
        match arg {
            NetworkArg::Any => NetworkConstraint::Any,
            NetworkArg::Unmetered => NetworkConstraint::UnmeteredOnly,
        }
    }
}

fn setup_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();
}

/// Get the default data directory (~/.tandem/data)
fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".tandem")
        .join("data")
}

/// Coordinator over the on-disk store. No transports are registered, so it
/// can manage state but not reach other devices.
async fn open_coordinator(data_dir: &Path) -> Result<SyncCoordinator> {
    let store = RedbStore::open(data_dir.join("tandem.redb"))?;
    let coordinator = SyncCoordinator::new(
        CoordinatorDeps::new(Arc::new(store), TransportSet::new(), DomainProviders::new()),
        CoordinatorSettings::default(),
    );
    coordinator.initialize().await?;
    Ok(coordinator)
}

fn interval_from_hours(hours: u64) -> Result<Duration> {
    hours
        .checked_mul(3600)
        .map(Duration::from_secs)
        .ok_or_else(|| anyhow::anyhow!("interval of {} hours is too large", hours))
}

fn print_config(config: &SyncConfiguration) {
    let domains: Vec<String> = config.sync_domains.iter().map(|d| d.to_string()).collect();
    let network = match config.network_constraint {
        NetworkConstraint::Any => "any",
        NetworkConstraint::UnmeteredOnly => "unmetered only",
    };
    println!("Configuration:");
    println!("  Domains: {}", domains.join(", "));
    println!("  Network: {}", network);
    println!(
        "  Auto-sync: {}",
        if config.auto_sync_enabled { "on" } else { "off" }
    );
    println!(
        "  Interval: {}h",
        config.auto_sync_interval.as_secs() / 3600
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    if let Commands::Demo { payload_kib } = cli.command {
        return run_demo(payload_kib).await;
    }

    let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);
    let coordinator = open_coordinator(&data_dir).await?;

    match cli.command {
        Commands::Info => {
            let identity = coordinator
                .identity()
                .ok_or_else(|| anyhow::anyhow!("identity not loaded"))?;

            println!("Tandem v0.1.0");
            println!();
            println!("Device:");
            println!("  ID: {}", identity.id);
            println!("  Name: {}", identity.display_name);
            println!();
            println!(
                "Sync: {}",
                if coordinator.is_sync_enabled() {
                    "enabled"
                } else {
                    "disabled"
                }
            );
            println!("Paired devices: {}", coordinator.paired_devices().len());
            println!("Data directory: {}", data_dir.display());
        }

        Commands::Name { name } => {
            coordinator.set_device_name(&name).await?;
            if let Some(name) = coordinator.device_name() {
                println!("Device name set to '{}'", name);
            }
        }

        Commands::Enable => {
            coordinator.set_sync_enabled(true).await?;
            println!("Sync enabled");
        }

        Commands::Disable => {
            coordinator.set_sync_enabled(false).await?;
            println!("Sync disabled");
        }

        Commands::Config { action } => match action {
            ConfigAction::Show => print_config(&coordinator.sync_config()),
            ConfigAction::Set {
                domains,
                network,
                auto_sync,
                interval_hours,
            } => {
                let mut config = coordinator.sync_config();
                if let Some(domains) = domains {
                    config.sync_domains = domains.into_iter().collect();
                }
                if let Some(network) = network {
                    config.network_constraint = network.into();
                }
                if let Some(auto_sync) = auto_sync {
                    config.auto_sync_enabled = auto_sync;
                }
                if let Some(hours) = interval_hours {
                    config.auto_sync_interval = interval_from_hours(hours)?;
                }
                coordinator.update_sync_config(config).await?;
                print_config(&coordinator.sync_config());
            }
        },

        Commands::Devices => {
            let devices = coordinator.paired_devices();
            if devices.is_empty() {
                println!("No paired devices.");
            } else {
                println!("Paired devices ({}):", devices.len());
                for device in devices {
                    let last_sync = device
                        .last_sync_time
                        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                        .unwrap_or_else(|| "never".to_string());
                    println!(
                        "  {} [{}] {} via {} - {} (last sync: {})",
                        device.id,
                        device.device_class,
                        device.name,
                        device.transport_kind,
                        device.status,
                        last_sync
                    );
                }
            }
        }

        Commands::Unpair { device_id } => {
            if coordinator.unpair(&device_id).await? {
                println!("Unpaired {}", device_id);
            } else {
                println!("Device {} is not paired.", device_id);
            }
        }

        Commands::Demo { .. } => unreachable!("handled above"),
    }

    coordinator.shutdown().await;
    Ok(())
}

/// Build an in-memory device whose transport can be linked to others
async fn demo_device(
    name: &str,
    class: DeviceClass,
) -> Result<(SyncCoordinator, Arc<LoopbackTransport>, Arc<InMemoryProvider>)> {
    let transport = Arc::new(LoopbackTransport::new(TransportKind::LocalNetwork));
    let provider = Arc::new(InMemoryProvider::new());
    let providers = SyncDomain::ALL
        .into_iter()
        .fold(DomainProviders::new(), |p, d| p.with(d, provider.clone()));

    let coordinator = SyncCoordinator::new(
        CoordinatorDeps::new(
            Arc::new(MemoryStore::new()),
            TransportSet::new().with(transport.clone()),
            providers,
        ),
        CoordinatorSettings {
            device_class: class,
            ..Default::default()
        },
    );
    coordinator.initialize().await?;
    coordinator.set_device_name(name).await?;
    Ok((coordinator, transport, provider))
}

async fn run_demo(payload_kib: usize) -> Result<()> {
    let (phone, phone_net, phone_data) = demo_device("Demo Phone", DeviceClass::Phone).await?;
    let (tablet, _, tablet_data) = demo_device("Demo Tablet", DeviceClass::Tablet).await?;

    let tablet_id = tablet
        .device_id()
        .ok_or_else(|| anyhow::anyhow!("tablet identity not loaded"))?;
    phone_net.add_peer(
        LoopbackPeer::new(tablet_id.clone(), "Demo Tablet", DeviceClass::Tablet)
            .linked_to(Arc::new(tablet.clone())),
    );

    phone_data.set(SyncDomain::Memory, vec![0x5A; payload_kib * 1024]);
    phone_data.set(SyncDomain::Preferences, b"theme=dark".to_vec());
    phone_data.set(SyncDomain::Personality, b"humor=dry".to_vec());

    let paired = phone
        .pair(&tablet_id, "Demo Tablet", TransportKind::LocalNetwork)
        .await?;
    println!("Paired with {} ({})", paired.name, paired.id);

    let mut events = phone.subscribe();
    let session_id = phone.sync_with_device(&tablet_id)?;
    println!("Started {}", session_id);

    loop {
        let event = match tokio::time::timeout(Duration::from_secs(30), events.recv())
            .await
            .map_err(|_| anyhow::anyhow!("demo session did not finish"))?
        {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "Progress output fell behind");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => anyhow::bail!("event stream closed"),
        };
        match event {
            SyncEvent::SyncProgress { progress, .. } => println!("  progress {}%", progress),
            SyncEvent::SyncCompleted { result, .. } => {
                println!(
                    "Completed: {} bytes sent, {} domains",
                    result.bytes_sent, result.items_synced
                );
                break;
            }
            SyncEvent::SyncFailed { error, .. } => anyhow::bail!("sync failed: {}", error),
            SyncEvent::SyncCancelled { .. } => anyhow::bail!("sync cancelled"),
            _ => {}
        }
    }

    let received = tablet_data
        .get(SyncDomain::Memory)
        .map(|b| b.len())
        .unwrap_or(0);
    println!("Tablet now holds {} bytes of memory data", received);

    phone.shutdown().await;
    tablet.shutdown().await;
    Ok(())
}
