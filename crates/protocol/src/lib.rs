//! Guest control-protocol client for vusb-sync
//!
//! The guest's device emulator speaks a line-delimited JSON protocol over a
//! local unix socket: requests are `{"execute": ..., "arguments": ...}`
//! objects, replies carry either a `"return"` or an `"error"` member, and
//! unsolicited lifecycle notifications carry an `"event"` member. This
//! crate provides the reconnecting client for that protocol plus the USB
//! pass-through commands built on top of it, and the domain value types
//! shared with the daemon.

pub mod client;
pub mod error;
pub mod query;
pub mod types;
pub mod wire;

pub use client::{ControlClient, LinkState};
pub use error::{ProtocolError, Result};
pub use query::QomEntry;
pub use types::{
    ControllerModel, GuestEvent, VirtualUsbMapping, controller_bus, controller_id,
    parse_controller_id, usb_device_id,
};
