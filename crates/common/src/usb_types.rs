//! Host-side USB device snapshots
//!
//! A [`HostDevice`] is an immutable value snapshot of one node in the host
//! USB topology, including its children. Snapshots are re-queried from the
//! topology source whenever current state is needed; they are never mutated
//! in place, so references cannot go stale across hotplug events.

use serde::{Deserialize, Serialize};
use std::fmt;

/// USB device class code reported by hubs.
pub const USB_CLASS_HUB: u8 = 9;

/// Snapshot of one host USB device node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostDevice {
    /// Hierarchical topological path; a child's path extends its parent's.
    pub device_path: String,
    /// Host bus number.
    pub bus: u8,
    /// Host device address on the bus.
    pub address: u8,
    /// USB vendor id.
    pub vendor_id: u16,
    /// USB product id.
    pub product_id: u16,
    /// Stable host-side identifier (e.g. `usb3`, `3-1.4`); used as the
    /// config-store value recording which device occupies a slot.
    pub sys_name: String,
    /// Device class attribute, when the node exposes one.
    pub device_class: Option<u8>,
    /// Immediate children, captured at snapshot time.
    pub children: Vec<HostDevice>,
}

impl HostDevice {
    /// A hub reports device class 9.
    pub fn is_hub(&self) -> bool {
        self.device_class == Some(USB_CLASS_HUB)
    }

    /// A candidate leaf is a real function endpoint: not a hub, but with a
    /// device class attribute (bus-level placeholder nodes have none).
    pub fn is_candidate_leaf(&self) -> bool {
        !self.is_hub() && self.device_class.is_some()
    }

    /// Vendor:product identity match.
    pub fn matches_id(&self, vendor_id: u16, product_id: u16) -> bool {
        self.vendor_id == vendor_id && self.product_id == product_id
    }

    /// Immediate children that are candidate leaves.
    pub fn candidate_children(&self) -> impl Iterator<Item = &HostDevice> {
        self.children.iter().filter(|c| c.is_candidate_leaf())
    }

    /// True when this device sits exactly one level below `parent_path`.
    pub fn is_child_of(&self, parent_path: &str) -> bool {
        self.device_path
            .strip_prefix(parent_path)
            .and_then(|rest| rest.strip_prefix('/'))
            .is_some_and(|rest| !rest.is_empty() && !rest.contains('/'))
    }
}

impl fmt::Display for HostDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{:04x}:{:04x}] bus {} addr {}",
            self.sys_name, self.vendor_id, self.product_id, self.bus, self.address
        )
    }
}
