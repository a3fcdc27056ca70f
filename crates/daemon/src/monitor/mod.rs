//! Hotplug monitoring
//!
//! [`DeviceMonitor`] classifies the host USB topology against the active
//! subscriptions and turns raw bus activity into add/remove events for the
//! orchestrator. It runs as a cooperative loop on a dedicated worker
//! thread, polling the topology source with a bounded timeout so the
//! shutdown flag is observed promptly.

pub mod topology;

pub use topology::{RusbTopology, Topology, TopologyEvent};

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use common::{HostDevice, MonitorEvent, MonitorWorker};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Monitor setup and topology errors
#[derive(Debug, Error)]
pub enum MonitorError {
    /// A hub subscription pointed at a non-hub device
    #[error("device {0} is not a hub")]
    NotAHub(String),

    /// A watched path did not resolve to any device
    #[error("no such device: {0}")]
    NoSuchDevice(String),

    /// USB context failure
    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),
}

/// Bound on one poll iteration, so shutdown is noticed quickly.
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// One watch target.
#[derive(Debug, Clone)]
enum Subscription {
    /// Everything directly below one hub, one level, excluding hubs.
    Hub { root_path: String },
    /// A vendor:product pair anywhere on the bus.
    DeviceId { vendor_id: u16, product_id: u16 },
}

/// Classifies host USB topology and produces a filtered add/remove event
/// stream.
pub struct DeviceMonitor<T: Topology> {
    topology: T,
    subscriptions: Vec<Subscription>,
    /// Last sys name seen per physical slot; removals only carry the slot,
    /// so this is what names them.
    seen: HashMap<(u8, u8), String>,
}

impl<T: Topology> DeviceMonitor<T> {
    pub fn new(topology: T) -> Self {
        Self {
            topology,
            subscriptions: Vec::new(),
            seen: HashMap::new(),
        }
    }

    fn has_hub(&self, path: &str) -> bool {
        self.subscriptions
            .iter()
            .any(|s| matches!(s, Subscription::Hub { root_path } if root_path == path))
    }

    fn remember(&mut self, device: &HostDevice) {
        self.seen
            .insert((device.bus, device.address), device.sys_name.clone());
    }

    /// Watch one hub. Returns its current candidate-leaf children so the
    /// caller can adopt or attach them.
    pub fn add_hub(&mut self, path: &str) -> Result<Vec<HostDevice>, MonitorError> {
        let hub = self
            .topology
            .device_by_path(path)?
            .ok_or_else(|| MonitorError::NoSuchDevice(path.to_string()))?;
        if !hub.is_hub() {
            return Err(MonitorError::NotAHub(hub.sys_name));
        }
        info!(hub = %hub.sys_name, "watching hub");
        let leaves: Vec<HostDevice> = hub.candidate_children().cloned().collect();
        for leaf in &leaves {
            self.remember(leaf);
        }
        if !self.has_hub(&hub.device_path) {
            self.subscriptions.push(Subscription::Hub {
                root_path: hub.device_path,
            });
        }
        Ok(leaves)
    }

    /// Watch a vendor:product pair anywhere on the bus. Current matches
    /// are returned; a match that is itself a hub is promoted to a hub
    /// subscription and contributes its candidate-leaf children instead.
    pub fn add_device_id(
        &mut self,
        vendor_id: u16,
        product_id: u16,
    ) -> Result<Vec<HostDevice>, MonitorError> {
        info!(
            "watching device id {:04x}:{:04x}",
            vendor_id, product_id
        );
        self.subscriptions.push(Subscription::DeviceId {
            vendor_id,
            product_id,
        });

        let snapshot = self.topology.snapshot()?;
        let mut matched = Vec::new();
        let mut stack: Vec<&HostDevice> = snapshot.iter().collect();
        while let Some(node) = stack.pop() {
            stack.extend(node.children.iter());
            if !node.matches_id(vendor_id, product_id) {
                continue;
            }
            if node.is_hub() {
                debug!(hub = %node.sys_name, "device id match is a hub; watching its ports");
                matched.extend(node.candidate_children().cloned());
                if !self.has_hub(&node.device_path) {
                    self.subscriptions.push(Subscription::Hub {
                        root_path: node.device_path.clone(),
                    });
                }
            } else if node.is_candidate_leaf() {
                matched.push(node.clone());
            }
        }
        for device in &matched {
            self.remember(device);
        }
        Ok(matched)
    }

    /// Physical `(bus, address)` pairs of every device currently on the
    /// host, for startup reconciliation.
    pub fn connected_addresses(&self) -> Result<HashSet<(u8, u8)>, MonitorError> {
        let mut addresses = HashSet::new();
        let snapshot = self.topology.snapshot()?;
        let mut stack: Vec<&HostDevice> = snapshot.iter().collect();
        while let Some(node) = stack.pop() {
            addresses.insert((node.bus, node.address));
            stack.extend(node.children.iter());
        }
        Ok(addresses)
    }

    /// Whether an added device belongs to any subscription. A device-id
    /// match that is a hub is promoted to a hub subscription on the fly;
    /// its children arrive as their own events.
    fn classify_add(&mut self, device: &HostDevice) -> bool {
        let mut promote = None;
        let mut matched = false;
        for sub in &self.subscriptions {
            match sub {
                Subscription::Hub { root_path } => {
                    if device.is_candidate_leaf() && device.is_child_of(root_path) {
                        matched = true;
                    }
                }
                Subscription::DeviceId {
                    vendor_id,
                    product_id,
                } => {
                    if device.matches_id(*vendor_id, *product_id) {
                        if device.is_hub() {
                            promote = Some(device.device_path.clone());
                        } else if device.is_candidate_leaf() {
                            matched = true;
                        }
                    }
                }
            }
        }
        if let Some(root_path) = promote {
            if !self.has_hub(&root_path) {
                info!(hub = %root_path, "promoting device id match to hub watch");
                self.subscriptions.push(Subscription::Hub { root_path });
            }
        }
        matched
    }

    fn handle_arrival(&mut self, bus: u8, address: u8, worker: &MonitorWorker) {
        // The raw event only names the slot; resolve the device from a
        // fresh snapshot.
        let snapshot = match self.topology.snapshot() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("snapshot failed after arrival: {}", e);
                return;
            }
        };
        let Some(device) = find_by_address(&snapshot, bus, address) else {
            debug!(bus, address, "arrived device vanished before it was resolved");
            return;
        };
        self.remember(&device);
        trace!(device = %device, "device arrived");
        if self.classify_add(&device) {
            debug!(device = %device, "watched device added");
            if worker.send_event(MonitorEvent::DeviceAdded(device)).is_err() {
                debug!("event channel closed");
            }
        }
    }

    /// Cooperative poll loop. Emits `DeviceAdded` for subscription matches
    /// and `DeviceRemoved` for every resolvable removal; exits when the
    /// owner sets the shutdown flag.
    pub fn run(mut self, worker: MonitorWorker) {
        info!("hotplug monitor started");
        while !worker.should_shutdown() {
            let events = match self.topology.poll(POLL_TIMEOUT) {
                Ok(events) => events,
                Err(e) => {
                    warn!("topology poll failed: {}", e);
                    std::thread::sleep(POLL_TIMEOUT);
                    continue;
                }
            };
            for event in events {
                match event {
                    TopologyEvent::Arrived { bus, address } => {
                        self.handle_arrival(bus, address, &worker);
                    }
                    TopologyEvent::Left { bus, address } => {
                        match self.seen.remove(&(bus, address)) {
                            Some(sys_name) => {
                                debug!(%sys_name, "device removed");
                                let event = MonitorEvent::DeviceRemoved { sys_name };
                                if worker.send_event(event).is_err() {
                                    debug!("event channel closed");
                                    return;
                                }
                            }
                            None => {
                                trace!(bus, address, "removal of a device never seen")
                            }
                        }
                    }
                }
            }
        }
        info!("hotplug monitor stopped");
    }
}

fn find_by_address(nodes: &[HostDevice], bus: u8, address: u8) -> Option<HostDevice> {
    for node in nodes {
        if node.bus == bus && node.address == address {
            return Some(node.clone());
        }
        if let Some(hit) = find_by_address(&node.children, bus, address) {
            return Some(hit);
        }
    }
    None
}

/// Run the monitor loop on a dedicated worker thread.
pub fn spawn_monitor<T: Topology + 'static>(
    monitor: DeviceMonitor<T>,
    worker: MonitorWorker,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("hotplug-monitor".to_string())
        .spawn(move || monitor.run(worker))
        .expect("Failed to spawn hotplug monitor thread")
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{MonitorEvent, USB_CLASS_HUB, create_monitor_bridge};
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn leaf(bus: u8, address: u8, sys_name: &str, path: &str) -> HostDevice {
        HostDevice {
            device_path: path.to_string(),
            bus,
            address,
            vendor_id: 0x046d,
            product_id: 0xc52b,
            sys_name: sys_name.to_string(),
            device_class: Some(0),
            children: Vec::new(),
        }
    }

    fn hub(bus: u8, address: u8, sys_name: &str, path: &str, children: Vec<HostDevice>) -> HostDevice {
        HostDevice {
            device_path: path.to_string(),
            bus,
            address,
            vendor_id: 0x05e3,
            product_id: 0x0608,
            sys_name: sys_name.to_string(),
            device_class: Some(USB_CLASS_HUB),
            children,
        }
    }

    fn root_hub(bus: u8, children: Vec<HostDevice>) -> HostDevice {
        HostDevice {
            vendor_id: 0x1d6b,
            product_id: 0x0002,
            ..hub(bus, 1, &format!("usb{}", bus), &format!("/usb{}", bus), children)
        }
    }

    /// Fixed-snapshot topology with a scripted event sequence.
    struct StubTopology {
        tree: Arc<Mutex<Vec<HostDevice>>>,
        script: Arc<Mutex<VecDeque<Vec<TopologyEvent>>>>,
    }

    impl StubTopology {
        fn new(tree: Vec<HostDevice>) -> Self {
            Self {
                tree: Arc::new(Mutex::new(tree)),
                script: Arc::new(Mutex::new(VecDeque::new())),
            }
        }

        fn with_script(tree: Vec<HostDevice>, script: Vec<Vec<TopologyEvent>>) -> Self {
            let stub = Self::new(tree);
            *stub.script.lock().unwrap() = script.into();
            stub
        }
    }

    impl Topology for StubTopology {
        fn snapshot(&self) -> Result<Vec<HostDevice>, MonitorError> {
            Ok(self.tree.lock().unwrap().clone())
        }

        fn poll(&mut self, _timeout: Duration) -> Result<Vec<TopologyEvent>, MonitorError> {
            match self.script.lock().unwrap().pop_front() {
                Some(batch) => Ok(batch),
                None => {
                    std::thread::sleep(Duration::from_millis(1));
                    Ok(Vec::new())
                }
            }
        }
    }

    fn two_leaf_hub_tree() -> Vec<HostDevice> {
        vec![root_hub(
            3,
            vec![hub(
                3,
                2,
                "3-1",
                "/usb3/3-1",
                vec![
                    leaf(3, 7, "3-1.1", "/usb3/3-1/3-1.1"),
                    leaf(3, 8, "3-1.4", "/usb3/3-1/3-1.4"),
                ],
            )],
        )]
    }

    #[test]
    fn test_add_hub_returns_candidate_leaf_children() {
        let mut monitor = DeviceMonitor::new(StubTopology::new(two_leaf_hub_tree()));
        let leaves = monitor.add_hub("3-1").unwrap();
        let names: Vec<&str> = leaves.iter().map(|d| d.sys_name.as_str()).collect();
        assert_eq!(names, vec!["3-1.1", "3-1.4"]);
    }

    #[test]
    fn test_add_hub_rejects_non_hub() {
        let mut monitor = DeviceMonitor::new(StubTopology::new(two_leaf_hub_tree()));
        assert!(matches!(
            monitor.add_hub("3-1.1"),
            Err(MonitorError::NotAHub(_))
        ));
        assert!(matches!(
            monitor.add_hub("9-9"),
            Err(MonitorError::NoSuchDevice(_))
        ));
    }

    #[test]
    fn test_add_device_id_matches_leaves_anywhere() {
        let mut monitor = DeviceMonitor::new(StubTopology::new(two_leaf_hub_tree()));
        let matched = monitor.add_device_id(0x046d, 0xc52b).unwrap();
        assert_eq!(matched.len(), 2);
    }

    #[test]
    fn test_add_device_id_promotes_hub_match() {
        let mut monitor = DeviceMonitor::new(StubTopology::new(two_leaf_hub_tree()));
        // 05e3:0608 is the inner hub: its leaf children are returned and
        // the hub itself becomes a watch.
        let matched = monitor.add_device_id(0x05e3, 0x0608).unwrap();
        let names: Vec<&str> = matched.iter().map(|d| d.sys_name.as_str()).collect();
        assert_eq!(names, vec!["3-1.1", "3-1.4"]);
        assert!(monitor.has_hub("/usb3/3-1"));
    }

    #[test]
    fn test_connected_addresses_cover_whole_tree() {
        let monitor = DeviceMonitor::new(StubTopology::new(two_leaf_hub_tree()));
        let addresses = monitor.connected_addresses().unwrap();
        assert_eq!(addresses.len(), 4);
        assert!(addresses.contains(&(3, 7)));
        assert!(addresses.contains(&(3, 1)));
    }

    #[tokio::test]
    async fn test_run_emits_matched_adds_and_all_removals() {
        // Snapshot already holds 3-1.4; the script walks through an
        // arrival of it, an arrival outside the watched hub, its removal,
        // and a removal of a device never seen.
        let mut tree = two_leaf_hub_tree();
        tree.push(root_hub(2, vec![leaf(2, 4, "2-3", "/usb2/2-3")]));
        let stub = StubTopology::with_script(
            tree,
            vec![
                vec![
                    TopologyEvent::Arrived { bus: 3, address: 8 },
                    TopologyEvent::Arrived { bus: 2, address: 4 },
                ],
                vec![
                    TopologyEvent::Left { bus: 3, address: 8 },
                    TopologyEvent::Left { bus: 9, address: 9 },
                ],
            ],
        );

        let mut monitor = DeviceMonitor::new(stub);
        monitor.add_hub("3-1").unwrap();

        let (bridge, worker) = create_monitor_bridge();
        let handle = spawn_monitor(monitor, worker);

        let added = bridge.recv_event().await.unwrap();
        assert!(matches!(
            added,
            MonitorEvent::DeviceAdded(ref d) if d.sys_name == "3-1.4"
        ));

        // 2-3 arrived outside the watch: no add event. The removal of a
        // slot never seen (9, 9) cannot be named and is dropped, so the
        // next event is 3-1.4 leaving.
        let removed = bridge.recv_event().await.unwrap();
        assert!(matches!(
            removed,
            MonitorEvent::DeviceRemoved { ref sys_name } if sys_name == "3-1.4"
        ));

        bridge.shutdown();
        handle.join().unwrap();
    }

    #[tokio::test]
    async fn test_run_promotes_device_id_hub_then_matches_children() {
        let tree = two_leaf_hub_tree();
        let stub = StubTopology::with_script(
            tree,
            vec![
                // The hub arrives first, then a device below it.
                vec![TopologyEvent::Arrived { bus: 3, address: 2 }],
                vec![TopologyEvent::Arrived { bus: 3, address: 7 }],
            ],
        );

        let mut monitor = DeviceMonitor::new(stub);
        // Subscribe to the hub's vendor:product, not a path: nothing is
        // returned up front on an empty bus match set.
        monitor.subscriptions.push(Subscription::DeviceId {
            vendor_id: 0x05e3,
            product_id: 0x0608,
        });

        let (bridge, worker) = create_monitor_bridge();
        let handle = spawn_monitor(monitor, worker);

        let added = bridge.recv_event().await.unwrap();
        assert!(matches!(
            added,
            MonitorEvent::DeviceAdded(ref d) if d.sys_name == "3-1.1"
        ));

        bridge.shutdown();
        handle.join().unwrap();
    }
}
