//! Device simulator
//!
//! Connects a managed device to the broker using a TOML configuration,
//! answers management requests and reports a periodic heartbeat.

use clap::{Parser, Subcommand};
use devmgmt_client::config::DeviceConfig;
use devmgmt_client::device::{Device, DeviceBuilder, DeviceEvent};
use devmgmt_client::management::{ConfigUpdate, Reply, UNSUPPORTED_OPERATION};
use devmgmt_client::observability::init_default_logging;
use devmgmt_client::transport::mqtt::MqttClient;
use devmgmt_client::transport::QoS;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::process;
use tokio::signal;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Device simulator for the device management protocol
#[derive(Parser)]
#[command(name = "device-sim")]
#[command(about = "Simulated device speaking the device management protocol over MQTT")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "DEVICE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and run until interrupted
    Run {
        /// Extra application topics to subscribe to
        #[arg(short, long = "subscribe", value_name = "TOPIC")]
        subscribe: Vec<String>,

        /// Seconds between heartbeat STATUS reports (0 disables)
        #[arg(long, default_value_t = 30)]
        heartbeat_secs: u64,
    },
    /// Validate the configuration
    Config {
        /// Show the parsed configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    info!("Starting device-sim v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run {
            subscribe,
            heartbeat_secs,
        } => run_device(config, subscribe, heartbeat_secs).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Device shutdown complete");
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<DeviceConfig, Box<dyn std::error::Error>> {
    match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            Ok(DeviceConfig::load_from_file(path)?)
        }
        None => {
            let default_paths = ["device.toml", "config/device.toml"];

            for path_str in default_paths {
                let path = PathBuf::from(path_str);
                if path.exists() {
                    info!("Loading configuration from: {}", path.display());
                    return Ok(DeviceConfig::load_from_file(&path)?);
                }
            }

            Err("No configuration file found. Provide one with -c/--config or create device.toml".into())
        }
    }
}

fn control_handler(name: &str, args: Vec<Value>) -> Reply {
    match name {
        "ping" => Reply::ok("pong"),
        other => {
            debug!(control = other, ?args, "Unsupported control");
            Reply::error(UNSUPPORTED_OPERATION)
        }
    }
}

fn config_handler(update: ConfigUpdate) -> Reply {
    match update {
        ConfigUpdate::Entry { name, value } => {
            info!(%name, %value, "Configuration entry updated");
        }
        ConfigUpdate::Snapshot(snapshot) => {
            info!(%snapshot, "Configuration loaded");
        }
    }
    Reply::ok(Value::Null)
}

async fn run_device(
    config: DeviceConfig,
    topics: Vec<String>,
    heartbeat_secs: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    info!("Device starting with id: {}", config.device.id);

    let transport = MqttClient::from_config(&config)?;

    let mut builder = DeviceBuilder::new(config.device.id.clone())
        .initial_load(config.device.initial_load)
        .transaction_timeout(config.management.transaction_timeout())
        .register_control_handler(control_handler)
        .register_config_handler(config_handler);
    if let Some(device_type) = &config.device.device_type {
        builder = builder.device_type(device_type.clone());
    }
    let (device, events) = builder.build(transport)?;

    device.connect().await?;

    for topic in &topics {
        match device.subscribe(topic, QoS::AtLeastOnce).await {
            Ok(()) => info!(%topic, "Subscribed"),
            Err(e) => warn!(%topic, error = %e, "Subscription failed"),
        }
    }

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    info!("Device is running");

    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
        _ = drive(&device, events, heartbeat_secs) => {
            error!("Device event stream ended, shutting down...");
        }
    }

    device.close(true).await?;
    Ok(())
}

/// Log device events and send heartbeats until the event stream ends
async fn drive(
    device: &Device<MqttClient>,
    mut events: mpsc::UnboundedReceiver<DeviceEvent>,
    heartbeat_secs: u64,
) {
    let mut heartbeat = interval(Duration::from_secs(heartbeat_secs.max(1)));
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut beats: u64 = 0;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    DeviceEvent::Message { topic, payload } => {
                        info!(%topic, payload = %String::from_utf8_lossy(&payload), "Message received");
                    }
                    DeviceEvent::Error(e) => warn!(error = %e, "Device error"),
                    DeviceEvent::ManagementActive => info!("Management active"),
                    other => debug!(event = ?other, "Device event"),
                }
            }
            _ = heartbeat.tick(), if heartbeat_secs > 0 => {
                if !device.is_managed() {
                    continue;
                }
                beats += 1;
                if let Err(e) = device.report_status("heartbeat", json!(beats)).await {
                    warn!(error = %e, "Heartbeat failed");
                }
            }
        }
    }
}

fn handle_config_command(
    config: &DeviceConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    config.tls_material()?;

    if show {
        println!("Current device configuration:");
        println!("{}", toml::to_string_pretty(config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}
