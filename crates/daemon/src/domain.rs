//! Guest domain coordination
//!
//! [`GuestDomain`] maps host devices onto virtual controller/port slots and
//! keeps the two control surfaces consistent. Every mutating operation
//! follows the same two-phase shape: stage the config-store writes in a
//! transaction, issue the control-protocol command, then commit. When the
//! command fails the transaction is aborted instead, so neither surface is
//! left half-applied.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use common::HostDevice;
use protocol::{ControlClient, ControllerModel, VirtualUsbMapping};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::store::{self, ConfigStore, StoreError};

/// Errors from the attach/detach/create-controller transactional path.
///
/// By the time one of these is returned, the staged config-store writes of
/// the failing operation have been discarded.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("config store failed: {0}")]
    Store(#[from] StoreError),

    #[error("control protocol failed: {0}")]
    Protocol(#[from] protocol::ProtocolError),
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;

/// Control-protocol surface the coordinator drives. Seam for tests; the
/// production implementation is [`ControlClient`].
#[async_trait]
pub trait UsbControl: Send + Sync {
    async fn attach_usb(
        &self,
        hostbus: i64,
        hostaddr: i64,
        controller: u32,
        port: u32,
    ) -> protocol::Result<()>;

    async fn detach_usb(&self, hostbus: i64, hostaddr: i64) -> protocol::Result<()>;

    async fn add_controller(&self, controller: u32, model: ControllerModel)
    -> protocol::Result<()>;

    async fn usb_controller_ids(&self) -> protocol::Result<Vec<u32>>;

    async fn attached_devices(&self, controller: u32) -> protocol::Result<Vec<VirtualUsbMapping>>;
}

#[async_trait]
impl UsbControl for ControlClient {
    async fn attach_usb(
        &self,
        hostbus: i64,
        hostaddr: i64,
        controller: u32,
        port: u32,
    ) -> protocol::Result<()> {
        ControlClient::attach_usb(self, hostbus, hostaddr, controller, port).await
    }

    async fn detach_usb(&self, hostbus: i64, hostaddr: i64) -> protocol::Result<()> {
        ControlClient::detach_usb(self, hostbus, hostaddr).await
    }

    async fn add_controller(
        &self,
        controller: u32,
        model: ControllerModel,
    ) -> protocol::Result<()> {
        ControlClient::add_controller(self, controller, model).await
    }

    async fn usb_controller_ids(&self) -> protocol::Result<Vec<u32>> {
        ControlClient::usb_controller_ids(self).await
    }

    async fn attached_devices(&self, controller: u32) -> protocol::Result<Vec<VirtualUsbMapping>> {
        ControlClient::attached_devices(self, controller).await
    }
}

/// Look up a guest's domain id by name.
pub async fn resolve_domain_id(
    store: &dyn ConfigStore,
    name: &str,
) -> std::result::Result<Option<String>, StoreError> {
    for id in store.list(store::DOMAIN_LIST_ROOT).await? {
        if store.read(&store::domain_name_path(&id)).await?.as_deref() == Some(name) {
            return Ok(Some(id));
        }
    }
    Ok(None)
}

/// Coordinator for one guest's virtual USB topology.
pub struct GuestDomain {
    domain_id: String,
    store: Arc<dyn ConfigStore>,
    control: Arc<dyn UsbControl>,
    model: ControllerModel,
}

impl GuestDomain {
    pub fn new(
        domain_id: String,
        store: Arc<dyn ConfigStore>,
        control: Arc<dyn UsbControl>,
        model: ControllerModel,
    ) -> Self {
        Self {
            domain_id,
            store,
            control,
            model,
        }
    }

    pub fn domain_id(&self) -> &str {
        &self.domain_id
    }

    /// Controller ids recorded in the config store, ascending.
    async fn store_controller_ids(&self) -> Result<Vec<u32>> {
        let mut ids: Vec<u32> = self
            .store
            .list(&store::usb_root(&self.domain_id))
            .await?
            .iter()
            .filter_map(|name| name.parse().ok())
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    /// Port numbers of one controller, ascending.
    async fn store_ports(&self, controller: u32) -> Result<Vec<u32>> {
        let mut ports: Vec<u32> = self
            .store
            .list(&store::ports_root(&self.domain_id, controller))
            .await?
            .iter()
            .filter_map(|name| name.parse().ok())
            .collect();
        ports.sort_unstable();
        Ok(ports)
    }

    /// Stage the given writes, run the control-protocol command, then
    /// commit, or abort and surface the first error. The one place both
    /// surfaces are touched together.
    async fn store_and_command<F, Fut>(&self, writes: Vec<(String, String)>, command: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = protocol::Result<()>>,
    {
        let mut txn = self.store.begin().await?;
        for (path, value) in &writes {
            if let Err(e) = txn.write(path, value).await {
                let _ = txn.abort().await;
                return Err(e.into());
            }
        }
        if let Err(e) = command().await {
            warn!("command failed, discarding staged store writes: {}", e);
            let _ = txn.abort().await;
            return Err(e.into());
        }
        txn.commit().await?;
        Ok(())
    }

    /// First free controller/port slot, scanning controllers then ports in
    /// ascending order. When every slot is occupied (or no controller
    /// exists yet), a new controller with the next unused id is created
    /// and its first port returned.
    pub async fn find_next_open_slot(&self) -> Result<(u32, u32)> {
        let controllers = self.store_controller_ids().await?;
        for &controller in &controllers {
            for port in self.store_ports(controller).await? {
                let value = self
                    .store
                    .read(&store::port_path(&self.domain_id, controller, port))
                    .await?;
                if value.unwrap_or_default().is_empty() {
                    debug!(controller, port, "choosing open slot");
                    return Ok((controller, port));
                }
            }
        }

        let next = controllers.last().map_or(0, |last| last + 1);
        self.create_controller(next).await?;
        Ok((next, 1))
    }

    /// Create controller `controller`: descriptor and empty port list in
    /// one store transaction, gated on the emulator accepting the device.
    async fn create_controller(&self, controller: u32) -> Result<()> {
        info!(
            controller,
            version = self.model.version(),
            ports = self.model.ports(),
            "creating USB controller"
        );
        let root = store::controller_root(&self.domain_id, controller);
        let mut writes = vec![
            (format!("{}/type", root), "emulated".to_string()),
            (format!("{}/usb-ver", root), self.model.version().to_string()),
            (format!("{}/num-ports", root), self.model.ports().to_string()),
        ];
        for port in 1..=self.model.ports() {
            writes.push((
                store::port_path(&self.domain_id, controller, port),
                String::new(),
            ));
        }
        self.store_and_command(writes, || self.control.add_controller(controller, self.model))
            .await
    }

    /// Attach one host device: allocate a slot, record the device's sys
    /// name in it, and pass the device through. On command failure the
    /// slot write is rolled back and the error surfaced.
    pub async fn attach_device(&self, device: &HostDevice) -> Result<VirtualUsbMapping> {
        let (controller, port) = self.find_next_open_slot().await?;
        let hostbus = i64::from(device.bus);
        let hostaddr = i64::from(device.address);
        info!(device = %device, controller, port, "attaching device");
        self.store_and_command(
            vec![(
                store::port_path(&self.domain_id, controller, port),
                device.sys_name.clone(),
            )],
            || self.control.attach_usb(hostbus, hostaddr, controller, port),
        )
        .await?;
        Ok(VirtualUsbMapping {
            controller,
            port,
            hostbus,
            hostaddr,
        })
    }

    /// Detach a mapped device: clear the slot and remove the device as one
    /// unit. Returns `Ok(false)` without touching either surface when the
    /// mapping carries no usable host address: the emulator could not be
    /// told which device to drop, and the surfaces would desynchronize
    /// silently.
    pub async fn detach_device(&self, mapping: &VirtualUsbMapping) -> Result<bool> {
        if !mapping.has_host_address() {
            warn!(
                controller = mapping.controller,
                port = mapping.port,
                "not enough information to detach device; leaving slot alone"
            );
            return Ok(false);
        }
        info!(%mapping, "detaching device");
        self.store_and_command(
            vec![(
                store::port_path(&self.domain_id, mapping.controller, mapping.port),
                String::new(),
            )],
            || self.control.detach_usb(mapping.hostbus, mapping.hostaddr),
        )
        .await?;
        Ok(true)
    }

    /// Find the slot recording `sys_name`, if any, and recover the live
    /// host bus/address for it from the emulator (the store alone does not
    /// carry those). Falls back to the unknown-host sentinel when the
    /// emulator has no record of the slot.
    pub async fn find_mapping(&self, sys_name: &str) -> Result<Option<VirtualUsbMapping>> {
        for controller in self.store_controller_ids().await? {
            for port in self.store_ports(controller).await? {
                let value = self
                    .store
                    .read(&store::port_path(&self.domain_id, controller, port))
                    .await?;
                if value.as_deref() != Some(sys_name) {
                    continue;
                }
                let live = self
                    .control
                    .attached_devices(controller)
                    .await?
                    .into_iter()
                    .find(|m| m.port == port);
                let mapping =
                    live.unwrap_or_else(|| VirtualUsbMapping::unknown_host(controller, port));
                debug!(%sys_name, %mapping, "found existing mapping");
                return Ok(Some(mapping));
            }
        }
        Ok(None)
    }

    /// Every live attachment the emulator reports, across all controllers.
    /// Used at startup to find devices attached by a previous run that are
    /// no longer physically present.
    pub async fn attached_devices(&self) -> Result<Vec<VirtualUsbMapping>> {
        let mut mappings = Vec::new();
        for controller in self.control.usb_controller_ids().await? {
            mappings.extend(self.control.attached_devices(controller).await?);
        }
        Ok(mappings)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::store::{MemStore, port_path};
    use protocol::ProtocolError;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Scripted control surface: records commands, tracks live
    /// attachments, and can be told to reject attaches.
    #[derive(Default)]
    pub(crate) struct MockControl {
        pub commands: StdMutex<Vec<String>>,
        pub controllers: StdMutex<Vec<u32>>,
        pub attached: StdMutex<Vec<VirtualUsbMapping>>,
        pub fail_attach: AtomicBool,
    }

    impl MockControl {
        pub fn log(&self, entry: String) {
            self.commands.lock().unwrap().push(entry);
        }

        pub fn command_log(&self) -> Vec<String> {
            self.commands.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl UsbControl for MockControl {
        async fn attach_usb(
            &self,
            hostbus: i64,
            hostaddr: i64,
            controller: u32,
            port: u32,
        ) -> protocol::Result<()> {
            self.log(format!("attach usb-{}-{} @{}:{}", hostbus, hostaddr, controller, port));
            if self.fail_attach.load(Ordering::SeqCst) {
                return Err(ProtocolError::Command {
                    class: "GenericError".to_string(),
                    desc: "attach rejected".to_string(),
                });
            }
            self.attached.lock().unwrap().push(VirtualUsbMapping {
                controller,
                port,
                hostbus,
                hostaddr,
            });
            Ok(())
        }

        async fn detach_usb(&self, hostbus: i64, hostaddr: i64) -> protocol::Result<()> {
            self.log(format!("detach usb-{}-{}", hostbus, hostaddr));
            self.attached
                .lock()
                .unwrap()
                .retain(|m| !(m.hostbus == hostbus && m.hostaddr == hostaddr));
            Ok(())
        }

        async fn add_controller(
            &self,
            controller: u32,
            model: ControllerModel,
        ) -> protocol::Result<()> {
            self.log(format!("add controller {} ({})", controller, model.driver()));
            self.controllers.lock().unwrap().push(controller);
            Ok(())
        }

        async fn usb_controller_ids(&self) -> protocol::Result<Vec<u32>> {
            let mut ids = self.controllers.lock().unwrap().clone();
            ids.sort_unstable();
            Ok(ids)
        }

        async fn attached_devices(
            &self,
            controller: u32,
        ) -> protocol::Result<Vec<VirtualUsbMapping>> {
            Ok(self
                .attached
                .lock()
                .unwrap()
                .iter()
                .filter(|m| m.controller == controller)
                .copied()
                .collect())
        }
    }

    pub(crate) fn leaf_device(sys_name: &str, bus: u8, address: u8) -> HostDevice {
        HostDevice {
            device_path: format!("/usb{}/{}", bus, sys_name),
            bus,
            address,
            vendor_id: 0x046d,
            product_id: 0xc52b,
            sys_name: sys_name.to_string(),
            device_class: Some(0),
            children: Vec::new(),
        }
    }

    pub(crate) fn domain_with(
        store: MemStore,
        model: ControllerModel,
    ) -> (GuestDomain, Arc<MockControl>) {
        let control = Arc::new(MockControl::default());
        let domain = GuestDomain::new(
            "4".to_string(),
            Arc::new(store),
            Arc::clone(&control) as Arc<dyn UsbControl>,
            model,
        );
        (domain, control)
    }

    async fn seeded_store(controller: u32, ports: u32) -> MemStore {
        let store = MemStore::new();
        for port in 1..=ports {
            store.insert(&port_path("4", controller, port), "").await;
        }
        store
    }

    #[tokio::test]
    async fn test_open_slot_skips_occupied_ports() {
        let store = seeded_store(0, 2).await;
        store.insert(&port_path("4", 0, 1), "3-1.2").await;
        let (domain, _control) = domain_with(store, ControllerModel::Ehci);

        assert_eq!(domain.find_next_open_slot().await.unwrap(), (0, 2));
    }

    #[tokio::test]
    async fn test_attach_records_sys_name_in_chosen_slot() {
        let store = seeded_store(0, 2).await;
        let (domain, control) = domain_with(store.clone(), ControllerModel::Ehci);

        let mapping = domain
            .attach_device(&leaf_device("3-1.4", 3, 7))
            .await
            .unwrap();
        assert_eq!((mapping.controller, mapping.port), (0, 1));
        assert_eq!(mapping.hostbus, 3);
        assert_eq!(mapping.hostaddr, 7);
        assert_eq!(
            store.get(&port_path("4", 0, 1)).await.as_deref(),
            Some("3-1.4")
        );
        assert_eq!(control.command_log(), vec!["attach usb-3-7 @0:1"]);
    }

    #[tokio::test]
    async fn test_failed_attach_rolls_back_slot_write() {
        let store = seeded_store(0, 2).await;
        let (domain, control) = domain_with(store.clone(), ControllerModel::Ehci);
        control.fail_attach.store(true, Ordering::SeqCst);

        let err = domain
            .attach_device(&leaf_device("3-1.4", 3, 7))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::Protocol(_)));
        // The slot write was staged in the aborted transaction.
        assert_eq!(store.get(&port_path("4", 0, 1)).await.as_deref(), Some(""));
    }

    #[tokio::test]
    async fn test_attach_detach_round_trip() {
        let store = seeded_store(0, 2).await;
        let (domain, _control) = domain_with(store.clone(), ControllerModel::Ehci);

        let device = leaf_device("3-1.4", 3, 7);
        let mapping = domain.attach_device(&device).await.unwrap();
        assert!(domain.find_mapping("3-1.4").await.unwrap().is_some());

        assert!(domain.detach_device(&mapping).await.unwrap());
        assert_eq!(domain.find_mapping("3-1.4").await.unwrap(), None);
        assert_eq!(store.get(&port_path("4", 0, 1)).await.as_deref(), Some(""));
    }

    #[tokio::test]
    async fn test_detach_refuses_unknown_host_address() {
        let store = seeded_store(0, 2).await;
        store.insert(&port_path("4", 0, 1), "3-1.4").await;
        let (domain, control) = domain_with(store.clone(), ControllerModel::Ehci);

        let mapping = VirtualUsbMapping::unknown_host(0, 1);
        assert!(!domain.detach_device(&mapping).await.unwrap());
        // Neither surface was touched.
        assert!(control.command_log().is_empty());
        assert_eq!(
            store.get(&port_path("4", 0, 1)).await.as_deref(),
            Some("3-1.4")
        );
    }

    #[tokio::test]
    async fn test_controller_creation_is_monotonic() {
        // No controller exists: ids 0, 1, 2 appear in order, each with the
        // configured port count.
        let store = MemStore::new();
        let (domain, control) = domain_with(store.clone(), ControllerModel::Uhci);

        // Uhci has 2 ports: each pair of attaches fills one controller.
        for i in 0..6u8 {
            domain
                .attach_device(&leaf_device(&format!("3-1.{}", i), 3, 10 + i))
                .await
                .unwrap();
        }
        assert_eq!(control.controllers.lock().unwrap().clone(), vec![0, 1, 2]);
        for controller in 0..3u32 {
            let ports = store
                .list(&crate::store::ports_root("4", controller))
                .await
                .unwrap();
            assert_eq!(ports.len(), 2);
        }
        assert_eq!(
            store.get("/domain/4/device/usb/1/num-ports").await.as_deref(),
            Some("2")
        );
        assert_eq!(
            store.get("/domain/4/device/usb/1/usb-ver").await.as_deref(),
            Some("1")
        );
    }

    #[tokio::test]
    async fn test_version_port_counts_applied_on_creation() {
        for (model, expected) in [
            (ControllerModel::Uhci, 2u32),
            (ControllerModel::Ehci, 6),
            (ControllerModel::Xhci, 15),
        ] {
            let store = MemStore::new();
            let (domain, _control) = domain_with(store.clone(), model);
            assert_eq!(domain.find_next_open_slot().await.unwrap(), (0, 1));
            let ports = store.list(&crate::store::ports_root("4", 0)).await.unwrap();
            assert_eq!(ports.len() as u32, expected);
        }
    }

    #[tokio::test]
    async fn test_find_mapping_recovers_live_address() {
        let store = seeded_store(0, 2).await;
        let (domain, _control) = domain_with(store.clone(), ControllerModel::Ehci);

        domain
            .attach_device(&leaf_device("3-1.4", 3, 7))
            .await
            .unwrap();
        let found = domain.find_mapping("3-1.4").await.unwrap().unwrap();
        assert_eq!(found.hostbus, 3);
        assert_eq!(found.hostaddr, 7);
    }

    #[tokio::test]
    async fn test_find_mapping_without_live_record_is_unknown_host() {
        // Slot value present, but the emulator knows nothing about it.
        let store = seeded_store(0, 2).await;
        store.insert(&port_path("4", 0, 2), "3-1.4").await;
        let (domain, _control) = domain_with(store, ControllerModel::Ehci);

        let found = domain.find_mapping("3-1.4").await.unwrap().unwrap();
        assert_eq!((found.controller, found.port), (0, 2));
        assert!(!found.has_host_address());
    }

    #[tokio::test]
    async fn test_resolve_domain_id_by_name() {
        let store = MemStore::new();
        store.insert("/domain-list/0/name", "Domain-0").await;
        store.insert("/domain-list/4/name", "workstation").await;

        let id = resolve_domain_id(&store, "workstation").await.unwrap();
        assert_eq!(id.as_deref(), Some("4"));
        assert_eq!(resolve_domain_id(&store, "missing").await.unwrap(), None);
    }
}
