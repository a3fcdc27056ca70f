//! Host USB topology access
//!
//! The production source is rusb: enumeration builds a value tree of
//! [`HostDevice`] snapshots with sysfs-style names derived from each
//! device's bus and port chain, and a hotplug callback feeds raw
//! arrive/leave notifications into a channel that [`Topology::poll`]
//! drains. Everything is re-resolved from a fresh snapshot when needed;
//! no live handles are held across hotplug events.

use std::sync::mpsc;
use std::time::Duration;

use common::HostDevice;
use rusb::{Context, Device, Hotplug, HotplugBuilder, Registration, UsbContext};
use tracing::{debug, trace};

use super::MonitorError;

/// Raw add/remove notification from the topology source. Carries only the
/// physical slot; the device is re-resolved from a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyEvent {
    Arrived { bus: u8, address: u8 },
    Left { bus: u8, address: u8 },
}

/// Snapshot-and-event access to the host USB topology.
pub trait Topology: Send {
    /// Current device tree, one root hub per host bus.
    fn snapshot(&self) -> Result<Vec<HostDevice>, MonitorError>;

    /// Wait at most `timeout` for bus activity, then return the raw
    /// events observed. An empty vec is a normal, quiet poll.
    fn poll(&mut self, timeout: Duration) -> Result<Vec<TopologyEvent>, MonitorError>;

    /// Resolve one device by topological path or sys name.
    fn device_by_path(&self, path: &str) -> Result<Option<HostDevice>, MonitorError> {
        fn find(nodes: &[HostDevice], path: &str) -> Option<HostDevice> {
            for node in nodes {
                if node.device_path == path || node.sys_name == path {
                    return Some(node.clone());
                }
                if let Some(hit) = find(&node.children, path) {
                    return Some(hit);
                }
            }
            None
        }
        Ok(find(&self.snapshot()?, path))
    }
}

/// One enumerated device, before tree assembly.
struct Seed {
    bus: u8,
    address: u8,
    vendor_id: u16,
    product_id: u16,
    device_class: Option<u8>,
    /// Port chain from the root hub; empty for root hubs.
    chain: Vec<u8>,
}

fn seed_sys_name(seed: &Seed) -> String {
    if seed.chain.is_empty() {
        format!("usb{}", seed.bus)
    } else {
        let ports: Vec<String> = seed.chain.iter().map(u8::to_string).collect();
        format!("{}-{}", seed.bus, ports.join("."))
    }
}

fn build_node(seed: &Seed, parent_path: &str, all: &[Seed]) -> HostDevice {
    let sys_name = seed_sys_name(seed);
    let device_path = format!("{}/{}", parent_path, sys_name);
    let children = all
        .iter()
        .filter(|c| {
            c.bus == seed.bus
                && c.chain.len() == seed.chain.len() + 1
                && c.chain.starts_with(&seed.chain)
        })
        .map(|c| build_node(c, &device_path, all))
        .collect();
    HostDevice {
        device_path,
        bus: seed.bus,
        address: seed.address,
        vendor_id: seed.vendor_id,
        product_id: seed.product_id,
        sys_name,
        device_class: seed.device_class,
        children,
    }
}

fn collect_seeds(context: &Context) -> Result<Vec<Seed>, MonitorError> {
    let mut seeds = Vec::new();
    for device in context.devices()?.iter() {
        let chain = match device.port_numbers() {
            Ok(chain) => chain,
            Err(e) => {
                trace!("skipping device without port chain: {}", e);
                continue;
            }
        };
        let descriptor = match device.device_descriptor() {
            Ok(descriptor) => descriptor,
            Err(e) => {
                debug!(
                    bus = device.bus_number(),
                    address = device.address(),
                    "skipping device with unreadable descriptor: {}",
                    e
                );
                continue;
            }
        };
        seeds.push(Seed {
            bus: device.bus_number(),
            address: device.address(),
            vendor_id: descriptor.vendor_id(),
            product_id: descriptor.product_id(),
            device_class: Some(descriptor.class_code()),
            chain,
        });
    }
    Ok(seeds)
}

/// Forwards rusb hotplug callbacks into the poll channel.
struct HotplugForwarder {
    tx: mpsc::Sender<TopologyEvent>,
}

impl Hotplug<Context> for HotplugForwarder {
    fn device_arrived(&mut self, device: Device<Context>) {
        let _ = self.tx.send(TopologyEvent::Arrived {
            bus: device.bus_number(),
            address: device.address(),
        });
    }

    fn device_left(&mut self, device: Device<Context>) {
        let _ = self.tx.send(TopologyEvent::Left {
            bus: device.bus_number(),
            address: device.address(),
        });
    }
}

/// rusb-backed topology source.
pub struct RusbTopology {
    context: Context,
    raw_rx: mpsc::Receiver<TopologyEvent>,
    _registration: Registration<Context>,
}

impl RusbTopology {
    pub fn new() -> Result<Self, MonitorError> {
        let context = Context::new()?;
        let (tx, raw_rx) = mpsc::channel();
        let registration = HotplugBuilder::new()
            .enumerate(false)
            .register(&context, Box::new(HotplugForwarder { tx }))?;
        debug!("hotplug callbacks registered");
        Ok(Self {
            context,
            raw_rx,
            _registration: registration,
        })
    }
}

impl Topology for RusbTopology {
    fn snapshot(&self) -> Result<Vec<HostDevice>, MonitorError> {
        let seeds = collect_seeds(&self.context)?;
        Ok(seeds
            .iter()
            .filter(|s| s.chain.is_empty())
            .map(|s| build_node(s, "", &seeds))
            .collect())
    }

    fn poll(&mut self, timeout: Duration) -> Result<Vec<TopologyEvent>, MonitorError> {
        // handle_events drives the hotplug callbacks; the channel then
        // holds whatever fired during the wait.
        self.context.handle_events(Some(timeout))?;
        Ok(self.raw_rx.try_iter().collect())
    }
}
