//! Watch orchestration
//!
//! Wires the coordinator, the control client, and the hotplug monitor
//! together: reconcile current attachments against the connected devices
//! at startup, then dispatch monitor and guest lifecycle events until the
//! guest goes away or the process is interrupted.
//!
//! The known-device map lives here and nowhere else. Every mutation of it,
//! and every coordinator call made on behalf of an event, happens under its
//! single mutex, so reconciliation and the two event handlers never
//! interleave their store/protocol command sequences.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use common::{HostDevice, MonitorEvent, create_monitor_bridge};
use protocol::{ControlClient, GuestEvent, VirtualUsbMapping};
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

use crate::config::RuntimeConfig;
use crate::domain::{CoordinatorError, GuestDomain, UsbControl, resolve_domain_id};
use crate::monitor::{self, DeviceMonitor, RusbTopology};
use crate::store::{ConfigStore, WireStore};

/// Outcome of one [`run`] invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// The guest shut down and the watch completed cleanly.
    Completed,
    /// The guest name did not resolve (and waiting was not requested).
    GuestNotFound,
    /// The process received an interrupt.
    Interrupted,
}

/// Why one watch pass ended.
enum WatchEnd {
    GuestReset,
    GuestShutdown,
    GuestNotFound,
    Interrupted,
}

/// Delay between guest lookups while waiting for it to exist.
const GUEST_WAIT_DELAY: Duration = Duration::from_secs(5);

/// Startup store retry: the store may not be answering yet.
const STORE_RETRY_ATTEMPTS: u32 = 10;
const STORE_RETRY_DELAY: Duration = Duration::from_secs(3);

/// Retry `op` on store errors with a fixed delay, a bounded number of
/// times. Used only on the startup path.
async fn with_store_retry<T, F, Fut>(what: &str, mut op: F) -> std::result::Result<T, CoordinatorError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, CoordinatorError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Err(CoordinatorError::Store(e)) if attempt < STORE_RETRY_ATTEMPTS => {
                warn!(
                    "{} failed on the store ({}); retry {}/{} in {}s",
                    what,
                    e,
                    attempt,
                    STORE_RETRY_ATTEMPTS,
                    STORE_RETRY_DELAY.as_secs()
                );
                attempt += 1;
                tokio::time::sleep(STORE_RETRY_DELAY).await;
            }
            other => return other,
        }
    }
}

/// Event-side state: the coordinator plus the known-device map.
pub(crate) struct Orchestrator {
    domain: Arc<GuestDomain>,
    known: Mutex<HashMap<String, VirtualUsbMapping>>,
}

impl Orchestrator {
    pub(crate) fn new(domain: Arc<GuestDomain>) -> Self {
        Self {
            domain,
            known: Mutex::new(HashMap::new()),
        }
    }

    #[cfg(test)]
    pub(crate) async fn known(&self) -> HashMap<String, VirtualUsbMapping> {
        self.known.lock().await.clone()
    }

    /// Startup reconciliation: adopt or attach every subscribed device
    /// currently connected, then detach every live attachment whose
    /// physical device is gone from the host bus.
    pub(crate) async fn reconcile(
        &self,
        present: &[HostDevice],
        connected: &HashSet<(u8, u8)>,
    ) -> std::result::Result<(), CoordinatorError> {
        let mut known = self.known.lock().await;

        for device in present {
            if known.contains_key(&device.sys_name) {
                continue;
            }
            debug!(device = %device, "found at startup");
            let mapping = match self.domain.find_mapping(&device.sys_name).await? {
                Some(mapping) => {
                    debug!(device = %device.sys_name, %mapping, "adopting existing attachment");
                    mapping
                }
                None => self.domain.attach_device(device).await?,
            };
            known.insert(device.sys_name.clone(), mapping);
        }

        for mapping in self.domain.attached_devices().await? {
            let physically_present = match (
                u8::try_from(mapping.hostbus),
                u8::try_from(mapping.hostaddr),
            ) {
                (Ok(bus), Ok(address)) => connected.contains(&(bus, address)),
                _ => false,
            };
            if physically_present {
                continue;
            }
            info!(%mapping, "attachment has no physical device; detaching");
            if self.domain.detach_device(&mapping).await? {
                known.retain(|_, m| m != &mapping);
            }
        }

        info!("reconciled {} device(s)", known.len());
        Ok(())
    }

    /// Add-event handler. Failures are logged, never propagated: one
    /// refused device must not stop the event loop.
    pub(crate) async fn handle_added(&self, device: &HostDevice) {
        let mut known = self.known.lock().await;
        if known.contains_key(&device.sys_name) {
            trace!(device = %device.sys_name, "already attached; skipping");
            return;
        }
        // A previous run, or an operator, may have attached it already.
        let result = match self.domain.find_mapping(&device.sys_name).await {
            Ok(Some(mapping)) => Ok(mapping),
            Ok(None) => self.domain.attach_device(device).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(mapping) => {
                known.insert(device.sys_name.clone(), mapping);
            }
            Err(e) => warn!(device = %device, "attach failed: {}", e),
        }
    }

    /// Remove-event handler. Removals of devices that were never mapped
    /// are no-ops.
    pub(crate) async fn handle_removed(&self, sys_name: &str) {
        let mut known = self.known.lock().await;
        let Some(mapping) = known.get(sys_name).copied() else {
            trace!(%sys_name, "removal of an unmapped device; ignoring");
            return;
        };
        match self.domain.detach_device(&mapping).await {
            Ok(true) => {
                known.remove(sys_name);
                info!(%sys_name, "device detached");
            }
            // Not enough information to detach; the slot stays recorded so
            // a later startup reconciliation can clear it.
            Ok(false) => {}
            Err(e) => warn!(%sys_name, "detach failed: {}", e),
        }
    }
}

/// Watch one guest until it goes away or the process is interrupted.
/// Re-enters the watch after a guest reset.
pub async fn run(config: RuntimeConfig) -> Result<ExitOutcome> {
    loop {
        match run_watch(&config).await? {
            WatchEnd::GuestReset => info!("guest reset; re-entering watch"),
            WatchEnd::GuestShutdown => {
                info!("guest shut down; watch complete");
                return Ok(ExitOutcome::Completed);
            }
            WatchEnd::GuestNotFound => return Ok(ExitOutcome::GuestNotFound),
            WatchEnd::Interrupted => return Ok(ExitOutcome::Interrupted),
        }
    }
}

async fn run_watch(config: &RuntimeConfig) -> Result<WatchEnd> {
    let store: Arc<dyn ConfigStore> = Arc::new(
        with_store_retry("store connect", || async {
            WireStore::connect(&config.store.socket)
                .await
                .map_err(CoordinatorError::from)
        })
        .await
        .context("connecting to the config store")?,
    );

    let domain_id = loop {
        let resolved = resolve_domain_id(store.as_ref(), &config.guest.name)
            .await
            .context("resolving the guest name")?;
        match resolved {
            Some(id) => break id,
            None if config.guest.wait => {
                info!(guest = %config.guest.name, "guest not found; waiting");
                tokio::time::sleep(GUEST_WAIT_DELAY).await;
            }
            None => {
                warn!(guest = %config.guest.name, "guest not found");
                return Ok(WatchEnd::GuestNotFound);
            }
        }
    };
    info!(guest = %config.guest.name, domain_id = %domain_id, "watching guest");

    let control = Arc::new(ControlClient::new(config.control_socket_for(&domain_id)));
    let guest_events = control.events();
    let domain = Arc::new(GuestDomain::new(
        domain_id,
        store,
        Arc::clone(&control) as Arc<dyn UsbControl>,
        config.controller_model()?,
    ));

    let mut device_monitor =
        DeviceMonitor::new(RusbTopology::new().context("opening the USB context")?);
    let mut present = Vec::new();
    for hub in &config.watch.hubs {
        present.extend(
            device_monitor
                .add_hub(hub)
                .with_context(|| format!("watching hub {}", hub))?,
        );
    }
    for filter in &config.watch.devices {
        present.extend(
            device_monitor
                .add_device_id(filter.vendor, filter.product)
                .with_context(|| format!("watching device id {}", filter))?,
        );
    }
    let connected = device_monitor
        .connected_addresses()
        .context("snapshotting the host bus")?;

    let orchestrator = Orchestrator::new(domain);
    with_store_retry("startup reconciliation", || {
        orchestrator.reconcile(&present, &connected)
    })
    .await
    .context("reconciling startup state")?;

    let (bridge, worker) = create_monitor_bridge();
    let monitor_thread = monitor::spawn_monitor(device_monitor, worker);

    let end = loop {
        tokio::select! {
            event = bridge.recv_event() => match event {
                Ok(MonitorEvent::DeviceAdded(device)) => {
                    orchestrator.handle_added(&device).await;
                }
                Ok(MonitorEvent::DeviceRemoved { sys_name }) => {
                    orchestrator.handle_removed(&sys_name).await;
                }
                Err(e) => {
                    anyhow::bail!("hotplug monitor stopped unexpectedly: {}", e);
                }
            },
            event = guest_events.recv() => match event {
                Ok(GuestEvent::Reset) => break WatchEnd::GuestReset,
                Ok(GuestEvent::Shutdown) => break WatchEnd::GuestShutdown,
                Err(e) => anyhow::bail!("guest event channel closed: {}", e),
            },
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received");
                break WatchEnd::Interrupted;
            }
        }
    };

    // Cooperative teardown: the monitor notices the flag within one poll.
    bridge.shutdown();
    control.close().await;
    if monitor_thread.join().is_err() {
        warn!("hotplug monitor thread panicked during shutdown");
    }
    Ok(end)
}
