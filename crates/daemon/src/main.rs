//! vusb-sync daemon
//!
//! Keeps a running guest's emulated USB topology synchronized with watched
//! physical host USB devices: watched devices are hot-plugged into the
//! guest's virtual USB controller when they appear on the host and
//! hot-unplugged when they disappear.

mod config;
mod domain;
mod monitor;
mod orchestrator;
mod store;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use common::{HostDevice, setup_logging};
use tracing::info;

use config::{DeviceIdFilter, RuntimeConfig};
use monitor::{RusbTopology, Topology};
use orchestrator::ExitOutcome;

#[derive(Parser, Debug)]
#[command(name = "vusb-syncd")]
#[command(
    author,
    version,
    about = "Keep a guest's virtual USB topology in sync with host hotplug"
)]
#[command(long_about = "
Watches host USB hubs and vendor:product ids and mirrors their devices
into a running guest's virtual USB controller: attach on hotplug, detach
on removal, with the guest's config store and device emulator kept
consistent.

EXAMPLES:
    # Watch two hubs for the guest \"workstation\"
    vusb-syncd --guest workstation --hub usb3 --hub 1-1

    # Watch one specific device, wherever it is plugged in
    vusb-syncd --guest workstation --device 046d:c52b

    # Wait for the guest to boot instead of failing
    vusb-syncd --guest workstation --hub usb3 --wait

    # Classify the host topology without touching any guest
    vusb-syncd --list-devices

CONFIGURATION:
    Defaults are read from the config file (--config, or the default
    path); command-line flags override it.
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Save default configuration to the default location and exit
    #[arg(long)]
    save_config: bool,

    /// Guest name to watch
    #[arg(short, long, value_name = "NAME")]
    guest: Option<String>,

    /// USB hub to watch (for example "usb3", "1-1"); repeatable
    #[arg(short = 'u', long = "hub", value_name = "PATH")]
    hubs: Vec<String>,

    /// Device id to watch anywhere on the bus; repeatable
    #[arg(short = 'd', long = "device", value_name = "VENDOR:PRODUCT")]
    devices: Vec<DeviceIdFilter>,

    /// Control socket path (default: derived from the domain id)
    #[arg(long, value_name = "PATH")]
    control_socket: Option<PathBuf>,

    /// Config-store socket path
    #[arg(long, value_name = "PATH")]
    store_socket: Option<PathBuf>,

    /// Controller version for created controllers (1, 2 or 3)
    #[arg(long, value_name = "VERSION")]
    usb_version: Option<u8>,

    /// Keep retrying while the guest does not exist yet
    #[arg(short, long)]
    wait: bool,

    /// List and classify host USB devices, then exit
    #[arg(long)]
    list_devices: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    if args.save_config {
        let config = RuntimeConfig::default();
        let path = RuntimeConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(ExitCode::SUCCESS);
    }

    let mut config = match &args.config {
        Some(path) => RuntimeConfig::load(path).context("Failed to load configuration")?,
        None => RuntimeConfig::load_or_default()?,
    };

    // CLI overrides on top of the file.
    if let Some(guest) = args.guest {
        config.guest.name = guest;
    }
    config.watch.hubs.extend(args.hubs);
    config.watch.devices.extend(args.devices);
    if let Some(path) = args.control_socket {
        config.guest.control_socket = Some(path);
    }
    if let Some(path) = args.store_socket {
        config.store.socket = path;
    }
    if let Some(version) = args.usb_version {
        config.guest.usb_version = version;
    }
    if args.wait {
        config.guest.wait = true;
    }
    if let Some(level) = args.log_level {
        config.log_level = level;
    }

    setup_logging(&config.log_level).context("Failed to setup logging")?;
    info!("vusb-syncd v{}", env!("CARGO_PKG_VERSION"));

    if args.list_devices {
        return list_devices_mode();
    }

    config.validate()?;
    let outcome = orchestrator::run(config).await?;
    Ok(match outcome {
        ExitOutcome::Completed => ExitCode::SUCCESS,
        ExitOutcome::GuestNotFound => ExitCode::from(2),
        ExitOutcome::Interrupted => ExitCode::from(130),
    })
}

/// Print the classified host topology without touching any guest.
fn list_devices_mode() -> Result<ExitCode> {
    let topology = RusbTopology::new().context("Failed to open the USB context")?;
    let tree = topology.snapshot().context("Failed to enumerate devices")?;
    for root in &tree {
        print_tree(root, 0);
    }
    Ok(ExitCode::SUCCESS)
}

fn print_tree(device: &HostDevice, depth: usize) {
    let kind = if device.is_hub() {
        "hub"
    } else if device.is_candidate_leaf() {
        "device"
    } else {
        "node"
    };
    println!("{}{} ({})", "  ".repeat(depth), device, kind);
    for child in &device.children {
        print_tree(child, depth + 1);
    }
}
