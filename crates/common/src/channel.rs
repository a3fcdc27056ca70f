//! Async channel bridge between the Tokio runtime and the hotplug worker thread

use crate::usb_types::HostDevice;
use async_channel::{Receiver, Sender, bounded};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Hotplug notifications from the monitor worker thread.
///
/// `DeviceAdded` is only emitted for devices matching an active
/// subscription; `DeviceRemoved` is emitted for every resolvable removal,
/// and the receiver decides relevance.
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    /// A watched device appeared on the host bus.
    DeviceAdded(HostDevice),
    /// A previously seen device left the host bus.
    DeviceRemoved {
        /// Last known stable identifier of the removed device.
        sys_name: String,
    },
}

/// Handle for the Tokio runtime (async)
pub struct MonitorBridge {
    event_rx: Receiver<MonitorEvent>,
    shutdown: Arc<AtomicBool>,
}

impl MonitorBridge {
    /// Receive the next hotplug event from the worker thread
    pub async fn recv_event(&self) -> crate::Result<MonitorEvent> {
        self.event_rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Signal the worker loop to exit at its next poll iteration
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }
}

/// Handle for the hotplug worker thread (blocking)
pub struct MonitorWorker {
    event_tx: Sender<MonitorEvent>,
    shutdown: Arc<AtomicBool>,
}

impl MonitorWorker {
    /// Send an event to the Tokio runtime (blocking)
    pub fn send_event(&self, event: MonitorEvent) -> crate::Result<()> {
        self.event_tx
            .send_blocking(event)
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// True once the owner has requested shutdown
    pub fn should_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

/// Create the channel bridge between the Tokio runtime and the hotplug
/// worker thread.
///
/// Returns (MonitorBridge for Tokio, MonitorWorker for the worker thread)
pub fn create_monitor_bridge() -> (MonitorBridge, MonitorWorker) {
    let (event_tx, event_rx) = bounded(256);
    let shutdown = Arc::new(AtomicBool::new(false));

    (
        MonitorBridge {
            event_rx,
            shutdown: Arc::clone(&shutdown),
        },
        MonitorWorker { event_tx, shutdown },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_monitor_bridge() {
        let (bridge, worker) = create_monitor_bridge();

        // Spawn a thread to simulate the hotplug worker
        let handle = std::thread::spawn(move || {
            worker
                .send_event(MonitorEvent::DeviceRemoved {
                    sys_name: "3-1.4".to_string(),
                })
                .unwrap();
            worker.should_shutdown()
        });

        let event = bridge.recv_event().await.unwrap();
        assert!(matches!(
            event,
            MonitorEvent::DeviceRemoved { ref sys_name } if sys_name == "3-1.4"
        ));
        assert!(!handle.join().unwrap());
    }

    #[tokio::test]
    async fn test_shutdown_flag_is_visible_to_worker() {
        let (bridge, worker) = create_monitor_bridge();
        assert!(!worker.should_shutdown());
        bridge.shutdown();
        assert!(worker.should_shutdown());
    }
}
