//! Runtime configuration
//!
//! Assembled from an optional TOML file plus CLI overrides. The daemon
//! consumes these as already-validated values: [`RuntimeConfig::validate`]
//! runs after merging, before anything touches the guest.

use anyhow::{Context, Result, bail};
use protocol::ControllerModel;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub guest: GuestSettings,
    #[serde(default)]
    pub watch: WatchSettings,
    #[serde(default)]
    pub store: StoreSettings,
    /// Default log filter; `RUST_LOG` and `--log-level` override it.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuestSettings {
    /// Guest name, resolved to a domain id at startup.
    #[serde(default)]
    pub name: String,
    /// Explicit control socket path. When absent, derived from the domain
    /// id.
    #[serde(default)]
    pub control_socket: Option<PathBuf>,
    /// Controller version for lazily created controllers (1, 2 or 3).
    #[serde(default = "default_usb_version")]
    pub usb_version: u8,
    /// Keep retrying instead of failing while the guest does not exist.
    #[serde(default)]
    pub wait: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WatchSettings {
    /// Hub sys names or topological paths to watch.
    #[serde(default)]
    pub hubs: Vec<String>,
    /// vendor:product pairs to watch anywhere on the bus.
    #[serde(default)]
    pub devices: Vec<DeviceIdFilter>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    /// Config-store socket path.
    #[serde(default = "default_store_socket")]
    pub socket: PathBuf,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            socket: default_store_socket(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            guest: GuestSettings {
                name: String::new(),
                control_socket: None,
                usb_version: default_usb_version(),
                wait: false,
            },
            watch: WatchSettings::default(),
            store: StoreSettings::default(),
            log_level: default_log_level(),
        }
    }
}

fn default_usb_version() -> u8 {
    2
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_store_socket() -> PathBuf {
    PathBuf::from("/run/vmm/store.sock")
}

/// A `vendor:product` watch target, hex with or without `0x` prefixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceIdFilter {
    pub vendor: u16,
    pub product: u16,
}

#[derive(Debug, Error)]
#[error("expected VENDOR:PRODUCT as hex pair, e.g. 046d:c52b")]
pub struct FilterParseError;

impl FromStr for DeviceIdFilter {
    type Err = FilterParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (vendor, product) = s.split_once(':').ok_or(FilterParseError)?;
        let parse = |part: &str| {
            let part = part.trim().trim_start_matches("0x");
            u16::from_str_radix(part, 16).map_err(|_| FilterParseError)
        };
        Ok(Self {
            vendor: parse(vendor)?,
            product: parse(product)?,
        })
    }
}

impl TryFrom<String> for DeviceIdFilter {
    type Error = FilterParseError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<DeviceIdFilter> for String {
    fn from(filter: DeviceIdFilter) -> Self {
        filter.to_string()
    }
}

impl fmt::Display for DeviceIdFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor, self.product)
    }
}

impl RuntimeConfig {
    /// Default config file location.
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("vusb-sync").join("config.toml")
        } else {
            PathBuf::from("/etc/vusb-sync/config.toml")
        }
    }

    /// Load from an explicit path.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("parsing config file {}", path.display()))
    }

    /// Load from the default path if a file exists there, otherwise start
    /// from defaults.
    pub fn load_or_default() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Write this configuration as TOML.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let contents = toml::to_string_pretty(self).context("serializing configuration")?;
        fs::write(path, contents)
            .with_context(|| format!("writing config file {}", path.display()))
    }

    /// Check the merged configuration before startup.
    pub fn validate(&self) -> Result<()> {
        if self.guest.name.is_empty() {
            bail!("no guest name configured (use --guest or the config file)");
        }
        if self.watch.hubs.is_empty() && self.watch.devices.is_empty() {
            bail!("nothing to watch: configure at least one hub or device id");
        }
        self.controller_model()?;
        Ok(())
    }

    /// Controller model for lazily created controllers.
    pub fn controller_model(&self) -> Result<ControllerModel> {
        ControllerModel::from_version(self.guest.usb_version).ok_or_else(|| {
            anyhow::anyhow!(
                "unsupported controller version {} (expected 1, 2 or 3)",
                self.guest.usb_version
            )
        })
    }

    /// Control socket path: explicit, or derived from the domain id.
    pub fn control_socket_for(&self, domain_id: &str) -> PathBuf {
        match &self.guest.control_socket {
            Some(path) => path.clone(),
            None => PathBuf::from(format!("/run/vmm/control-{}.sock", domain_id)),
        }
    }
}
