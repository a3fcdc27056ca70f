//! Common utilities for vusb-sync
//!
//! This crate provides shared functionality between the control-protocol
//! crate and the sync daemon: host USB device snapshots and classification,
//! error handling, logging setup, and the async channel bridge between the
//! hotplug worker thread and the Tokio runtime.

pub mod channel;
pub mod error;
pub mod logging;
pub mod usb_types;

pub use channel::{MonitorBridge, MonitorEvent, MonitorWorker, create_monitor_bridge};
pub use error::{Error, Result};
pub use logging::setup_logging;
pub use usb_types::{HostDevice, USB_CLASS_HUB};
