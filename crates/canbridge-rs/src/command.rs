// crates/canbridge-rs/src/command.rs

//! The typed vocabulary between the transport and the protocol task:
//! commands flowing in, events flowing out.

use crate::interval::CanIoConfig;
use crate::locks::ClientId;
use crate::session::{CanMapping, ErrorLogEntry, MappingRequest};
use crate::types::NodeId;
use std::collections::BTreeMap;

/// Commands the dispatcher executes. Client-scoped commands carry the id
/// of the WebSocket client that submitted them so replies and lock checks
/// can be attributed.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    StartScan { start: NodeId, end: NodeId },
    StopScan,
    Connect { client: ClientId, node: NodeId },
    Disconnect { client: ClientId },
    SetDeviceName { serial: String, name: String },
    DeleteDevice { serial: String },
    RenameDevice { serial: String, name: String },
    GetNodeId { client: ClientId },
    SetNodeId { client: ClientId, node: NodeId },
    StartSpotValues { client: ClientId, param_ids: Vec<u32>, interval_ms: u64 },
    StopSpotValues { client: ClientId },
    UpdateParam { client: ClientId, param_id: u32, value: f64 },
    GetParamSchema { client: ClientId },
    GetParamValues { client: ClientId },
    ReloadParams { client: ClientId },
    ResetDevice { client: ClientId },
    GetCanMappings { client: ClientId },
    AddCanMapping { client: ClientId, mapping: MappingRequest },
    RemoveCanMapping { client: ClientId, read_index: u16 },
    SaveToFlash { client: ClientId },
    LoadFromFlash { client: ClientId },
    LoadDefaults { client: ClientId },
    StartDevice { client: ClientId },
    StopDevice { client: ClientId },
    ListErrors { client: ClientId },
    SendCanMessage { client: ClientId, id: u16, data: Vec<u8> },
    StartCanInterval { id: String, cob_id: u16, data: Vec<u8>, interval_ms: u64 },
    StopCanInterval { id: String },
    UpdateCanInterval { id: String, cob_id: u16, data: Vec<u8>, interval_ms: u64 },
    StartCanIoInterval { cob_id: u16, interval_ms: u64, config: CanIoConfig },
    StopCanIoInterval,
    UpdateCanIoFlags { config: CanIoConfig },
    /// Firmware image received over HTTP; starts the updater.
    StartOta { client: Option<ClientId>, firmware: Vec<u8> },
    /// Issued by the transport when a WebSocket client goes away.
    ClientDisconnected { client: ClientId },
}

/// Events produced by the protocol task. Success/error tag pairs on the
/// wire share one variant with an `ok` flag; the serializer splits them.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    DeviceDiscovered { node: NodeId, serial: String, name: String, last_seen: u64 },
    ScanStatus { active: bool },
    ScanProgress { current_node: NodeId, start_node: NodeId, end_node: NodeId },
    Connected { node: NodeId, serial: String },
    Disconnected,
    NodeIdInfo { id: NodeId, speed: u8 },
    NodeIdSet { id: NodeId, success: bool },
    SpotValuesStatus { active: bool },
    SpotValues { values: BTreeMap<u32, f64> },
    DeviceNameSet { serial: String, success: bool },
    DeviceDeleted { serial: String, success: bool },
    DeviceRenamed { serial: String, success: bool },
    DeviceUnlocked { node: NodeId },
    CanMessageSent { success: bool },
    CanIntervalStatus { id: String, active: bool },
    CanIoIntervalStatus { active: bool },
    CanMappingsData { mappings: Vec<CanMapping> },
    CanMappingAdded { success: bool },
    CanMappingRemoved { success: bool },
    ParamSchemaData { schema: serde_json::Value },
    ParamSchemaError { message: String },
    ParamValuesData { values: BTreeMap<String, f64> },
    ParamValuesError { message: String },
    ParamUpdate { param_id: u32, value: f64, error: Option<String> },
    ParamsReloaded,
    ParamsError { message: String },
    DeviceReset { error: Option<String> },
    SaveToFlash { error: Option<String> },
    LoadFromFlash { error: Option<String> },
    LoadDefaults { error: Option<String> },
    StartDevice { error: Option<String> },
    StopDevice { error: Option<String> },
    ListErrorsSuccess { errors: Vec<ErrorLogEntry> },
    JsonProgress { percent: u8 },
    OtaProgress { percent: u8 },
    OtaSuccess,
    OtaError { message: String },
    /// Generic error surface. `kind` is a machine-readable discriminator
    /// (for example `device_locked`, which also carries node and serial).
    Error {
        message: String,
        kind: Option<&'static str>,
        node: Option<NodeId>,
        serial: Option<String>,
    },
}

impl Event {
    /// Shorthand for a plain error with only a message.
    pub fn error(message: impl Into<String>) -> Event {
        Event::Error {
            message: message.into(),
            kind: None,
            node: None,
            serial: None,
        }
    }

    pub fn device_locked(node: NodeId, serial: Option<String>) -> Event {
        Event::Error {
            message: "Device is locked by another client".to_string(),
            kind: Some("device_locked"),
            node: Some(node),
            serial,
        }
    }
}

/// An event plus its delivery scope: `None` broadcasts to every client,
/// `Some(client)` goes to one requester.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundEvent {
    pub target: Option<ClientId>,
    pub event: Event,
}

impl OutboundEvent {
    pub fn broadcast(event: Event) -> Self {
        OutboundEvent {
            target: None,
            event,
        }
    }

    pub fn to_client(client: ClientId, event: Event) -> Self {
        OutboundEvent {
            target: Some(client),
            event,
        }
    }
}
