//! IMU Sync Gateway CLI
//!
//! Synchronized multi-node motion capture.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use imu_sync_gateway::{
    config::Config,
    core::ExportFormat,
    device::{DeviceId, DeviceRegistry, SimDevice, SimulatedTransport},
    session::{SessionController, SessionRequest, SessionSettings},
    stats::{create_shared_stats_with_persistence, CollectionStats},
    VERSION,
};

type Controller = SessionController<SimulatedTransport>;

#[derive(Parser)]
#[command(name = "imu-gateway")]
#[command(version = VERSION)]
#[command(about = "Synchronized motion capture from multiple IMU sensor nodes", long_about = None)]
struct Cli {
    /// Device registry file (defaults to the configured path)
    #[arg(long, global = true)]
    registry: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered devices
    Devices,

    /// Check which registered devices are reachable
    Scan {
        /// Discovery window in seconds
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Collect synchronized frames and write them to a file
    Collect {
        /// Devices to collect from
        devices: Vec<String>,

        /// Use every reachable device
        #[arg(long, conflicts_with = "devices")]
        all: bool,

        /// Collection time in seconds
        #[arg(long, short, default_value = "10")]
        duration: u64,

        /// Sampling period in milliseconds (defaults to the configured value)
        #[arg(long)]
        sampling_ms: Option<u16>,

        /// Use the sampling period of a named profile
        #[arg(long, conflicts_with = "sampling_ms")]
        profile: Option<String>,

        /// Output format (csv or json)
        #[arg(long)]
        format: Option<ExportFormat>,

        /// Output file (defaults to a timestamped file in the export directory)
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// Put devices into deep sleep
    Sleep {
        /// Devices to put to sleep
        devices: Vec<String>,

        /// Every reachable device
        #[arg(long, conflicts_with = "devices")]
        all: bool,
    },

    /// Show cumulative collection statistics
    Status,

    /// Show configuration
    Config,

    /// Run the HTTP session driver
    #[cfg(feature = "server")]
    Serve {
        /// Port to bind to (0 for random)
        #[arg(long, default_value = "8765")]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let cli = Cli::parse();
    let config = Config::load().context("loading configuration")?;

    match cli.command {
        Commands::Devices => cmd_devices(&config, cli.registry),
        Commands::Scan { timeout } => cmd_scan(&config, cli.registry, timeout).await,
        Commands::Collect {
            devices,
            all,
            duration,
            sampling_ms,
            profile,
            format,
            output,
        } => {
            let options = CollectOptions {
                devices,
                all,
                duration: Duration::from_secs(duration),
                sampling_ms,
                profile,
                format,
                output,
            };
            cmd_collect(&config, cli.registry, options).await
        }
        Commands::Sleep { devices, all } => cmd_sleep(&config, cli.registry, devices, all).await,
        Commands::Status => cmd_status(&config),
        Commands::Config => cmd_config(&config),
        #[cfg(feature = "server")]
        Commands::Serve { port } => cmd_serve(&config, cli.registry, port).await,
    }
}

fn load_registry(config: &Config, path: Option<PathBuf>) -> anyhow::Result<DeviceRegistry> {
    let path = path.unwrap_or_else(|| config.registry_path.clone());
    DeviceRegistry::load(&path).with_context(|| format!("reading device registry {path:?}"))
}

/// Controller over the in-process simulated link, one simulated node per registry entry.
fn build_controller(config: &Config, registry: DeviceRegistry) -> Arc<Controller> {
    let nodes = registry
        .entries()
        .map(|(id, address)| {
            let tag = id.as_str().bytes().next().unwrap_or(b'?');
            SimDevice::new(address.as_str(), tag)
        })
        .collect();

    let stats = create_shared_stats_with_persistence(config.stats_path());
    Arc::new(SessionController::new(
        Arc::new(SimulatedTransport::new(nodes)),
        Arc::new(registry),
        SessionSettings::from_config(config),
        stats,
    ))
}

/// Resolve the device selection after a scan.
fn select_devices(
    controller: &Controller,
    devices: Vec<String>,
    all: bool,
) -> anyhow::Result<BTreeSet<DeviceId>> {
    let selected: BTreeSet<DeviceId> = if all {
        controller.registry().online_ids()
    } else {
        devices.into_iter().map(DeviceId::new).collect()
    };
    if selected.is_empty() {
        anyhow::bail!("no devices selected (name devices or pass --all)");
    }
    controller.registry().ensure_selectable(&selected)?;
    Ok(selected)
}

fn cmd_devices(config: &Config, registry: Option<PathBuf>) -> anyhow::Result<()> {
    let registry = load_registry(config, registry)?;

    println!("Registered devices ({})", registry.len());
    println!("==================");
    for (id, address) in registry.entries() {
        println!("  {id:<12} {address}");
    }
    Ok(())
}

async fn cmd_scan(
    config: &Config,
    registry: Option<PathBuf>,
    timeout: Option<u64>,
) -> anyhow::Result<()> {
    let controller = build_controller(config, load_registry(config, registry)?);
    let timeout = timeout
        .map(Duration::from_secs)
        .unwrap_or(config.scan_timeout);

    let status = controller.scan(timeout).await?;
    for (id, online) in &status {
        println!("  {id:<12} {}", if *online { "online" } else { "offline" });
    }
    Ok(())
}

struct CollectOptions {
    devices: Vec<String>,
    all: bool,
    duration: Duration,
    sampling_ms: Option<u16>,
    profile: Option<String>,
    format: Option<ExportFormat>,
    output: Option<PathBuf>,
}

async fn cmd_collect(
    config: &Config,
    registry: Option<PathBuf>,
    options: CollectOptions,
) -> anyhow::Result<()> {
    if let Err(e) = config.ensure_directories() {
        eprintln!("Warning: Could not create directories: {e}");
    }

    let controller = build_controller(config, load_registry(config, registry)?);
    controller.scan(config.scan_timeout).await?;
    let devices = select_devices(&controller, options.devices, options.all)?;

    let sampling_ms = match &options.profile {
        Some(name) => {
            let profile = config.profile(name)?;
            println!(
                "Profile {name}: {}ms, {} (no classifier bound, collecting only)",
                profile.sampling_ms, profile.mode
            );
            profile.sampling_ms
        }
        None => options.sampling_ms.unwrap_or(config.sampling_ms),
    };
    let format = options.format.unwrap_or(config.export_format);

    println!("IMU Sync Gateway v{VERSION}");
    println!();
    println!(
        "Collecting from {} device(s) for {}s at {}ms",
        devices.len(),
        options.duration.as_secs(),
        sampling_ms
    );
    println!("Press Ctrl+C to stop early");
    println!();

    let stopper = controller.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        stopper.stop();
    }) {
        eprintln!("Warning: Could not install Ctrl+C handler: {e}");
    }

    let request =
        SessionRequest::new(devices, options.duration).with_sampling_ms(sampling_ms);
    let log = controller.start_session(request).await?;

    let path = options
        .output
        .unwrap_or_else(|| config.export_path.join(log.file_name(format)));
    log.save(&path, format)
        .with_context(|| format!("writing frames to {path:?}"))?;

    println!();
    println!("Collected {} frames ({})", log.len(), controller.state());
    println!("Saved to {path:?}");
    println!();
    println!("{}", controller.stats().summary());
    Ok(())
}

async fn cmd_sleep(
    config: &Config,
    registry: Option<PathBuf>,
    devices: Vec<String>,
    all: bool,
) -> anyhow::Result<()> {
    let controller = build_controller(config, load_registry(config, registry)?);
    controller.scan(config.scan_timeout).await?;
    let devices = select_devices(&controller, devices, all)?;

    println!("Sending deep sleep to {} device(s)", devices.len());
    let asleep = controller.sleep_devices(&devices).await?;
    for id in &devices {
        println!(
            "  {id:<12} {}",
            if asleep.contains(id) { "asleep" } else { "no response" }
        );
    }
    Ok(())
}

fn cmd_status(config: &Config) -> anyhow::Result<()> {
    println!("IMU Sync Gateway Status");
    println!("=======================");
    println!();
    println!("Registry: {:?}", config.registry_path);
    println!("Exports:  {:?}", config.export_path);
    println!();

    let stats_path = config.stats_path();
    if !stats_path.exists() {
        println!("No previous session data found.");
        return Ok(());
    }

    let totals = CollectionStats::read_persisted(&stats_path)
        .with_context(|| format!("reading {stats_path:?}"))?;
    println!("Cumulative Statistics (since {}):", totals.since.format("%Y-%m-%d %H:%M"));
    println!("  Sessions completed:    {}", totals.sessions_completed);
    println!("  Samples received:      {}", totals.samples_received);
    println!("  Frames emitted:        {}", totals.frames_emitted);
    println!("  Incomplete discarded:  {}", totals.incomplete_discarded);
    println!(
        "  Dropped samples:       {} ignored, {} malformed, {} duplicate, {} late",
        totals.samples_ignored, totals.samples_malformed, totals.samples_duplicate, totals.samples_late
    );
    println!(
        "  Classifications:       {} ({} failed)",
        totals.classifications, totals.classification_failures
    );
    Ok(())
}

fn cmd_config(config: &Config) -> anyhow::Result<()> {
    println!("Configuration");
    println!("=============");
    println!();
    println!("Config file: {:?}", Config::config_path());
    println!();
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}

#[cfg(feature = "server")]
async fn cmd_serve(config: &Config, registry: Option<PathBuf>, port: u16) -> anyhow::Result<()> {
    use imu_sync_gateway::server::{run, ServerConfig};

    if let Err(e) = config.ensure_directories() {
        eprintln!("Warning: Could not create directories: {e}");
    }
    let controller = build_controller(config, load_registry(config, registry)?);

    let mut server_config = ServerConfig::new(port);
    server_config.scan_timeout = config.scan_timeout;
    server_config.sampling_ms = config.sampling_ms;
    server_config.profiles = config.profiles.clone();
    server_config.export_dir = Some(config.export_path.clone());
    server_config.export_format = config.export_format;

    let (addr, shutdown_tx) = run(server_config, controller.clone()).await?;
    println!("Listening on http://{addr}");
    println!("Press Ctrl+C to stop");

    let (quit_tx, quit_rx) = tokio::sync::oneshot::channel::<()>();
    let quit_tx = std::sync::Mutex::new(Some(quit_tx));
    ctrlc::set_handler(move || {
        controller.stop();
        if let Some(tx) = quit_tx.lock().ok().and_then(|mut tx| tx.take()) {
            let _ = tx.send(());
        }
    })
    .context("installing Ctrl+C handler")?;

    let _ = quit_rx.await;
    let _ = shutdown_tx.send(());
    println!("Server stopped");
    Ok(())
}
