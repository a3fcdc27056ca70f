//! USB pass-through queries built on [`ControlClient::send`]
//!
//! The emulator's object-introspection commands (`qom-list`/`qom-get`) are
//! the only way to recover the live port/hostbus/hostaddr of devices that
//! were attached by a previous run: controllers show up as typed children
//! of `peripheral`, and each attached device hangs off its controller bus
//! as a `link<usb-host>`.

use serde::Deserialize;
use serde_json::{Value, json};
use tracing::trace;

use crate::client::ControlClient;
use crate::error::Result;
use crate::types::{
    ControllerModel, VirtualUsbMapping, controller_bus, controller_id, parse_controller_id,
    usb_device_id,
};

/// One entry of a `qom-list` reply.
#[derive(Debug, Clone, Deserialize)]
pub struct QomEntry {
    /// Property or child name.
    pub name: String,
    /// Type tag, e.g. `child<usb-ehci>` or `link<usb-host>`.
    #[serde(rename = "type")]
    pub ty: String,
}

/// Numbers come back either as JSON numbers or as decimal strings,
/// depending on the property.
fn as_number(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

impl ControlClient {
    /// List the members of one introspection path.
    pub async fn qom_list(&self, path: &str) -> Result<Vec<QomEntry>> {
        let reply = self.send("qom-list", Some(json!({ "path": path }))).await?;
        Ok(serde_json::from_value(reply)?)
    }

    /// Read one introspection property.
    pub async fn qom_get(&self, path: &str, property: &str) -> Result<Value> {
        self.send(
            "qom-get",
            Some(json!({ "path": path, "property": property })),
        )
        .await
    }

    /// Ids of all virtual USB controllers the emulator currently exposes,
    /// ascending.
    pub async fn usb_controller_ids(&self) -> Result<Vec<u32>> {
        let peripherals = self.qom_list("peripheral").await?;
        let mut ids: Vec<u32> = peripherals
            .iter()
            .filter(|entry| ControllerModel::from_type_tag(&entry.ty).is_some())
            .filter_map(|entry| parse_controller_id(&entry.name))
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    /// Live attachments on one controller, recovered through the
    /// introspection links. Entries whose port cannot be read are skipped.
    pub async fn attached_devices(&self, controller: u32) -> Result<Vec<VirtualUsbMapping>> {
        let bus = controller_bus(controller);
        let entries = self.qom_list(&bus).await?;
        let mut mappings = Vec::new();
        for entry in entries.into_iter().filter(|e| e.ty == "link<usb-host>") {
            let device_path = match self.qom_get(&bus, &entry.name).await? {
                Value::String(path) if !path.is_empty() => path,
                _ => continue,
            };
            let Some(port) = as_number(&self.qom_get(&device_path, "port").await?) else {
                continue;
            };
            let hostbus = as_number(&self.qom_get(&device_path, "hostbus").await?);
            let hostaddr = as_number(&self.qom_get(&device_path, "hostaddr").await?);
            let mapping = VirtualUsbMapping {
                controller,
                port: port as u32,
                hostbus: hostbus.unwrap_or(crate::types::UNKNOWN_HOST),
                hostaddr: hostaddr.unwrap_or(crate::types::UNKNOWN_HOST),
            };
            trace!(%mapping, "live attachment");
            mappings.push(mapping);
        }
        Ok(mappings)
    }

    /// Live attachments across every controller.
    pub async fn all_attached_devices(&self) -> Result<Vec<VirtualUsbMapping>> {
        let mut mappings = Vec::new();
        for controller in self.usb_controller_ids().await? {
            mappings.extend(self.attached_devices(controller).await?);
        }
        Ok(mappings)
    }

    /// Pass one host device through to a controller port.
    pub async fn attach_usb(
        &self,
        hostbus: i64,
        hostaddr: i64,
        controller: u32,
        port: u32,
    ) -> Result<()> {
        self.send(
            "device_add",
            Some(json!({
                "id": usb_device_id(hostbus, hostaddr),
                "driver": "usb-host",
                "bus": controller_bus(controller),
                "port": port.to_string(),
                "hostbus": hostbus.to_string(),
                "hostaddr": hostaddr.to_string(),
            })),
        )
        .await
        .map(drop)
    }

    /// Remove a passed-through device by its deterministic id.
    pub async fn detach_usb(&self, hostbus: i64, hostaddr: i64) -> Result<()> {
        self.send(
            "device_del",
            Some(json!({ "id": usb_device_id(hostbus, hostaddr) })),
        )
        .await
        .map(drop)
    }

    /// Create a new virtual USB controller.
    pub async fn add_controller(&self, controller: u32, model: ControllerModel) -> Result<()> {
        self.send(
            "device_add",
            Some(json!({
                "driver": model.driver(),
                "id": controller_id(controller),
            })),
        )
        .await
        .map(drop)
    }
}
