//! lanwatch Daemon - Main entry point
//!
//! Runs LAN discovery on the system interfaces and reports device changes.

mod config;

use anyhow::Result;
use clap::Parser;
use lanwatch_discovery::{InterfaceProvider, LanDeviceInfo, LanDiscovery, SystemInterfaces};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "lanwatch")]
#[command(about = "LAN device presence discovery daemon")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "lanwatch.toml")]
    config: PathBuf,

    /// Interfaces to run discovery on (overrides the configuration)
    #[arg(short, long, value_delimiter = ',')]
    interfaces: Vec<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Collect replies for a while, print the devices and exit
    #[arg(long)]
    list_once: bool,

    /// Write a default configuration file and exit
    #[arg(long)]
    write_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_thread_names(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("lanwatch v{}", env!("CARGO_PKG_VERSION"));

    if args.write_config {
        config::save_default_config(&args.config)?;
        info!(path = %args.config.display(), "Default configuration written");
        return Ok(());
    }

    // Load configuration
    let mut config = config::load_config(&args.config)?;

    let provider = SystemInterfaces::new(config.interfaces.clone());
    let poller = provider.spawn();

    // Interfaces: CLI, then configuration, then everything the OS reports
    if !args.interfaces.is_empty() {
        config.discovery.interfaces = args.interfaces;
    }
    if config.discovery.interfaces.is_empty() {
        let mut names: Vec<String> = provider.interfaces().into_keys().collect();
        names.sort();
        config.discovery.interfaces = names;
    }

    info!(
        interfaces = ?config.discovery.interfaces,
        port = config.discovery.port,
        "Configuration loaded"
    );

    let engine = LanDiscovery::new(config.discovery.clone(), provider.clone());

    if args.list_once {
        info!("Running single discovery pass");
        engine.init().await?;
        tokio::time::sleep(Duration::from_secs(config.daemon.list_wait_secs)).await;

        let mut devices: Vec<LanDeviceInfo> = engine.list_devices().await?.into_values().collect();
        devices.sort_by(|a, b| a.id.0.cmp(&b.id.0));
        println!("Discovered {} devices:", devices.len());
        for device in devices {
            let ip = device
                .ip
                .map(|ip| ip.to_string())
                .unwrap_or_else(|| "-".to_string());
            let status = if device.online { "online" } else { "offline" };
            println!("  - {} at {} ({})", device.id, ip, status);
        }
    } else {
        let json_events = config.daemon.json_events;
        engine.subscribe("daemon", report_change, json_events).await?;
        engine.init().await?;

        info!("Running, press Ctrl-C to stop");
        tokio::signal::ctrl_c().await?;
        info!("Shutting down");
    }

    engine.deinit().await?;
    poller.abort();
    Ok(())
}

async fn report_change(device: LanDeviceInfo, json: bool) {
    if json {
        match serde_json::to_string(&device) {
            Ok(line) => println!("{}", line),
            Err(e) => tracing::warn!(error = %e, "Failed to encode device change"),
        }
        return;
    }
    info!(
        device = %device.id,
        online = device.online,
        ip = ?device.ip,
        "Device changed"
    );
}
