//! Domain value types shared between the protocol client and the daemon

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Sentinel host address: the binding is known from the config store, but
/// the emulator has no live record of the physical device, so its bus and
/// address are unknown. Detach refuses such mappings.
pub const UNKNOWN_HOST: i64 = -1;

/// Binding of one guest controller/port slot to one host device.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct VirtualUsbMapping {
    /// Virtual controller id (0-based, monotonic).
    pub controller: u32,
    /// Port on the controller (1-based).
    pub port: u32,
    /// Physical bus number on the host, or [`UNKNOWN_HOST`].
    pub hostbus: i64,
    /// Physical device address on the host, or [`UNKNOWN_HOST`].
    pub hostaddr: i64,
}

impl VirtualUsbMapping {
    /// Mapping for a slot whose physical address could not be recovered.
    pub fn unknown_host(controller: u32, port: u32) -> Self {
        Self {
            controller,
            port,
            hostbus: UNKNOWN_HOST,
            hostaddr: UNKNOWN_HOST,
        }
    }

    /// Whether the physical address is known well enough to detach.
    pub fn has_host_address(&self) -> bool {
        self.hostaddr > 0
    }

    /// Deterministic emulator device id for this mapping.
    pub fn device_id(&self) -> String {
        usb_device_id(self.hostbus, self.hostaddr)
    }
}

// Two mappings that point at the same physical device are the same logical
// attachment, regardless of which controller/port slot was chosen.
impl PartialEq for VirtualUsbMapping {
    fn eq(&self, other: &Self) -> bool {
        self.hostbus == other.hostbus && self.hostaddr == other.hostaddr
    }
}

impl Eq for VirtualUsbMapping {}

impl Hash for VirtualUsbMapping {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hostbus.hash(state);
        self.hostaddr.hash(state);
    }
}

impl fmt::Display for VirtualUsbMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "controller {} port {} (hostbus {} hostaddr {})",
            self.controller, self.port, self.hostbus, self.hostaddr
        )
    }
}

/// Emulated USB controller model, selected by the configured version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControllerModel {
    /// Version 1: UHCI, 2 ports.
    Uhci,
    /// Version 2: EHCI, 6 ports.
    Ehci,
    /// Version 3: xHCI, 15 ports.
    Xhci,
}

impl ControllerModel {
    /// Resolve a configured controller version (1, 2 or 3).
    pub fn from_version(version: u8) -> Option<Self> {
        match version {
            1 => Some(ControllerModel::Uhci),
            2 => Some(ControllerModel::Ehci),
            3 => Some(ControllerModel::Xhci),
            _ => None,
        }
    }

    /// The configured version this model corresponds to.
    pub fn version(self) -> u8 {
        match self {
            ControllerModel::Uhci => 1,
            ControllerModel::Ehci => 2,
            ControllerModel::Xhci => 3,
        }
    }

    /// Number of ports the emulated controller exposes.
    pub fn ports(self) -> u32 {
        match self {
            ControllerModel::Uhci => 2,
            ControllerModel::Ehci => 6,
            ControllerModel::Xhci => 15,
        }
    }

    /// Emulator driver name for `device_add`.
    pub fn driver(self) -> &'static str {
        match self {
            ControllerModel::Uhci => "piix3-usb-uhci",
            ControllerModel::Ehci => "usb-ehci",
            ControllerModel::Xhci => "nec-usb-xhci",
        }
    }

    /// Reverse lookup from an object-introspection type tag, e.g.
    /// `child<nec-usb-xhci>`.
    pub fn from_type_tag(tag: &str) -> Option<Self> {
        match tag {
            "child<piix3-usb-uhci>" => Some(ControllerModel::Uhci),
            "child<usb-ehci>" => Some(ControllerModel::Ehci),
            "child<nec-usb-xhci>" => Some(ControllerModel::Xhci),
            _ => None,
        }
    }
}

/// Guest lifecycle events delivered on the control socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestEvent {
    /// The guest rebooted.
    Reset,
    /// The guest shut down.
    Shutdown,
}

impl GuestEvent {
    /// Map an emulator event name onto a lifecycle event.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "RESET" => Some(GuestEvent::Reset),
            "SHUTDOWN" => Some(GuestEvent::Shutdown),
            _ => None,
        }
    }
}

/// Deterministic emulator device id for a host bus/address pair.
pub fn usb_device_id(hostbus: i64, hostaddr: i64) -> String {
    format!("usb-{}-{}", hostbus, hostaddr)
}

/// Emulator object id of a virtual controller.
pub fn controller_id(controller: u32) -> String {
    format!("usb-ctl-{}", controller)
}

/// Emulator bus name of a virtual controller.
pub fn controller_bus(controller: u32) -> String {
    format!("usb-ctl-{}.0", controller)
}

/// Parse the controller index out of an emulator object id.
pub fn parse_controller_id(name: &str) -> Option<u32> {
    name.strip_prefix("usb-ctl-")?.parse().ok()
}
