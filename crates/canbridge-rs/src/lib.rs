//! Protocol core of the CAN gateway.
//!
//! Bridges many browser clients to CANopen-SDO devices and a vendor
//! bootloader on one CAN bus: discovery, parameter telemetry, parameter
//! and mapping mutation, scheduled transmission and remote firmware
//! updates, under a single-writer bus discipline.
//!
//! The crate is transport-agnostic: hardware sits behind the
//! [`CanInterface`] trait, persistence behind [`RegistryStorage`] and
//! [`ConfigStorage`], and the public surface is a pair of bounded channels
//! carrying typed [`Command`]s in and [`OutboundEvent`]s out, serialized by
//! the [`envelope`] module.

// --- Foundation Modules ---
pub mod clock;
pub mod config;
pub mod crc;
pub mod frame;
pub mod hal;
pub mod types;

// --- Bus Layers ---
pub mod io;
pub mod sdo;

// --- Device State ---
pub mod discovery;
pub mod firmware;
pub mod schema;
pub mod session;

// --- Periodic Work ---
pub mod interval;
pub mod spot;

// --- Public Surface ---
pub mod command;
pub mod dispatch;
pub mod envelope;
pub mod locks;

#[cfg(test)]
pub(crate) mod testutil;

// --- Top-level Exports ---
pub use command::{Command, Event, OutboundEvent};
pub use config::{ConfigStorage, GatewaySettings};
pub use dispatch::{
    COMMAND_ENQUEUE_TIMEOUT_MS, COMMAND_QUEUE_CAPACITY, EVENT_QUEUE_CAPACITY, Gateway,
};
pub use discovery::{DeviceRecord, DeviceRegistry, RegistryStorage};
pub use frame::CanFrame;
pub use hal::{AcceptanceFilter, CanInterface, CanSettings, GatewayError};
pub use locks::ClientId;
pub use types::{BaudRate, NodeId, SerialNumber};
