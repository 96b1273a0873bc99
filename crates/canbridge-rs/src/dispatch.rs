// crates/canbridge-rs/src/dispatch.rs

//! The command dispatcher. One instance owns every piece of bus-side
//! state and runs as the protocol task: the single consumer of the
//! command queue and the only producer of events.

use crate::clock;
use crate::command::{Command, Event, OutboundEvent};
use crate::config::GatewaySettings;
use crate::discovery::{DeviceRegistry, RegistryStorage, ScanCursor, ScanEvent};
use crate::firmware::{FirmwareUpdater, UpdateEvent, UpdateState};
use crate::frame::CanFrame;
use crate::hal::{AcceptanceFilter, CanInterface, GatewayError};
use crate::interval::IntervalTransmitter;
use crate::io::CanIo;
use crate::locks::{ClientId, ClientLockManager};
use crate::schema::param_sdo_address;
use crate::sdo::SdoWriteResult;
use crate::sdo::frame::abort;
use crate::session::{
    DeviceCommand, DeviceSession, SessionEvent, SessionState, param_value_to_wire,
};
use crate::spot::SpotValueManager;
use crate::types::{NodeId, valid_node_id};
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use log::{debug, info, warn};
use std::time::Duration;

/// Command queue depth on the transport side.
pub const COMMAND_QUEUE_CAPACITY: usize = 10;
/// Event queue depth toward the transport.
pub const EVENT_QUEUE_CAPACITY: usize = 20;
/// How long the transport may wait to enqueue a command.
pub const COMMAND_ENQUEUE_TIMEOUT_MS: u64 = 100;

/// Retry budget for the reconnect after a firmware update.
const POST_UPDATE_RETRIES: u32 = 10;
/// Delay between the reset command and arming the bootloader exchange.
const BOOTLOADER_ENTRY_DELAY_US: u64 = 500_000;
/// Minimum spacing of "scan paused" log lines.
const SCAN_PAUSE_LOG_INTERVAL_US: u64 = 5_000_000;
const PARAM_WRITE_TIMEOUT_MS: u64 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectKind {
    Connect,
    SetNodeId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SchemaRequest {
    Get,
    Reload,
}

/// A firmware image waiting out the reboot-into-bootloader delay.
struct PendingOta {
    client: Option<ClientId>,
    firmware: Vec<u8>,
    ready_at_us: u64,
}

pub struct Gateway<I: CanInterface, R: RegistryStorage> {
    io: CanIo<I>,
    session: DeviceSession,
    registry: DeviceRegistry<R>,
    scanner: ScanCursor,
    spot: SpotValueManager,
    intervals: IntervalTransmitter,
    updater: FirmwareUpdater,
    locks: ClientLockManager,
    settings: GatewaySettings,
    commands: Receiver<Command>,
    events: Sender<OutboundEvent>,
    pending_connect: Option<(ClientId, ConnectKind)>,
    pending_schema: Option<(ClientId, SchemaRequest)>,
    pending_ota: Option<PendingOta>,
    post_update_reconnect: bool,
    scan_pause_logged_us: u64,
}

impl<I: CanInterface, R: RegistryStorage> Gateway<I, R> {
    pub fn new(
        iface: I,
        storage: R,
        settings: GatewaySettings,
        commands: Receiver<Command>,
        events: Sender<OutboundEvent>,
    ) -> Result<Self, GatewayError> {
        let settings = settings.normalized();
        let mut io = CanIo::new(iface);
        io.init_for_scanning(&settings.can_settings())?;
        Ok(Gateway {
            io,
            session: DeviceSession::new(),
            registry: DeviceRegistry::new(storage),
            scanner: ScanCursor::new(),
            spot: SpotValueManager::new(),
            intervals: IntervalTransmitter::new(),
            updater: FirmwareUpdater::new(),
            locks: ClientLockManager::new(),
            settings,
            commands,
            events,
            pending_connect: None,
            pending_schema: None,
            pending_ota: None,
            post_update_reconnect: false,
            scan_pause_logged_us: 0,
        })
    }

    pub fn registry(&self) -> &DeviceRegistry<R> {
        &self.registry
    }

    pub fn io(&self) -> &CanIo<I> {
        &self.io
    }

    pub fn io_mut(&mut self) -> &mut CanIo<I> {
        &mut self.io
    }

    pub fn intervals(&self) -> &IntervalTransmitter {
        &self.intervals
    }

    pub fn session(&self) -> &DeviceSession {
        &self.session
    }

    /// The protocol task main loop. Returns when the transport side drops
    /// the command channel.
    pub fn run(&mut self) {
        info!("protocol task running");
        loop {
            match self.commands.try_recv() {
                Ok(command) => self.handle_command(command, clock::now_us()),
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => {
                    info!("command channel closed, protocol task exiting");
                    return;
                }
            }
            self.poll(clock::now_us());
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// One scheduling step: at most one command, then the periodic work.
    /// Exposed so tests can drive the loop with a synthetic clock.
    pub fn run_step(&mut self, now_us: u64) {
        if let Ok(command) = self.commands.try_recv() {
            self.handle_command(command, now_us);
        }
        self.poll(now_us);
    }

    fn poll(&mut self, now_us: u64) {
        // Session acquisition state machines.
        for event in self.session.tick(&mut self.io, now_us) {
            self.handle_session_event(event, now_us);
        }

        // Bootloader traffic. A staged image arms the updater once the
        // device has had time to reboot into its bootloader.
        if let Some(pending) = self.pending_ota.take_if(|p| now_us >= p.ready_at_us)
            && let Err(reason) = self.updater.begin(pending.firmware)
        {
            self.emit_ota_error(pending.client, reason);
        }
        self.updater.tick(now_us);
        while let Some(frame) = self.io.take_bootloader_frame() {
            for event in self.updater.handle_frame(&frame, &mut self.io, now_us) {
                self.handle_update_event(event);
            }
        }
        if self.updater.state() == UpdateState::RequestJson {
            self.updater.finish();
            if self.session.connected_node().is_some() {
                info!("re-acquiring device after firmware update");
                self.post_update_reconnect = true;
                self.session
                    .reconnect_with_retries(POST_UPDATE_RETRIES, now_us);
            }
        }

        // Telemetry and scheduled transmissions.
        if self.session.state() == SessionState::Idle
            && let Some(batch) = self.spot.tick(&mut self.io, &mut self.session, now_us)
        {
            self.broadcast(Event::SpotValues { values: batch });
        }
        self.intervals.tick(&mut self.io, now_us);

        // Discovery. Scans need the wide filter and an unconnected idle
        // session; otherwise they stay paused.
        if self.scanner.is_active() {
            let paused = self.session.state() != SessionState::Idle
                || self.session.connected_node().is_some()
                || self.io.filter() != AcceptanceFilter::Scanning;
            if paused {
                if now_us.saturating_sub(self.scan_pause_logged_us) >= SCAN_PAUSE_LOG_INTERVAL_US {
                    debug!("continuous scan paused while the session is in use");
                    self.scan_pause_logged_us = now_us;
                }
            } else {
                for event in self.scanner.advance(&mut self.io, now_us) {
                    self.handle_scan_event(event, now_us);
                }
            }
        }

        // Passive heartbeats noted by the receive path.
        for (node, stamp_ms) in self.io.take_seen_nodes() {
            self.registry.heartbeat(node, stamp_ms);
        }

        self.io.pump(now_us);
    }

    fn handle_session_event(&mut self, event: SessionEvent, now_us: u64) {
        match event {
            SessionEvent::ConnectionReady { node, serial } => {
                self.registry.upsert(&serial, node, now_us / 1000);
                if self.session.schema().is_none()
                    && let Some(document) = self.registry.load_schema(serial.cache_key())
                {
                    self.session.install_cached_schema(document);
                }
                self.post_update_reconnect = false;
                match self.pending_connect.take() {
                    Some((client, ConnectKind::SetNodeId)) => {
                        self.emit_to(
                            client,
                            Event::NodeIdSet {
                                id: node,
                                success: true,
                            },
                        );
                    }
                    _ => {
                        self.broadcast(Event::Connected {
                            node,
                            serial: serial.to_string(),
                        });
                    }
                }
            }
            SessionEvent::SerialTimeout { retries_left } => {
                debug!("device still absent, {} reconnect attempts left", retries_left);
            }
            SessionEvent::SerialFailed => {
                if self.post_update_reconnect {
                    self.post_update_reconnect = false;
                    self.broadcast(Event::OtaError {
                        message: "Device did not reappear after the update".to_string(),
                    });
                } else if let Some((client, kind)) = self.pending_connect.take() {
                    if let Some(node) = self.session.connected_node() {
                        self.locks.release(node);
                    }
                    match kind {
                        ConnectKind::Connect => {
                            self.emit_to(client, Event::error("Device did not respond"));
                        }
                        ConnectKind::SetNodeId => {
                            let id = self.session.connected_node().unwrap_or_default();
                            self.emit_to(client, Event::NodeIdSet { id, success: false });
                        }
                    }
                }
            }
            SessionEvent::SchemaProgress { percent } => {
                self.broadcast(Event::JsonProgress { percent });
            }
            SessionEvent::SchemaReady => {
                if let Some(serial) = self.session.serial()
                    && let Some(document) = self.session.schema_document().map(<[u8]>::to_vec)
                {
                    self.registry.store_schema(serial.cache_key(), &document);
                }
                let schema = self
                    .session
                    .schema()
                    .map(|s| s.raw().clone())
                    .unwrap_or_default();
                match self.pending_schema.take() {
                    Some((client, SchemaRequest::Get)) => {
                        self.emit_to(client, Event::ParamSchemaData { schema });
                    }
                    Some((client, SchemaRequest::Reload)) => {
                        self.emit_to(client, Event::ParamsReloaded);
                    }
                    None => {}
                }
            }
            SessionEvent::SchemaFailed => match self.pending_schema.take() {
                Some((client, SchemaRequest::Get)) => {
                    self.emit_to(
                        client,
                        Event::ParamSchemaError {
                            message: "Parameter schema download failed".to_string(),
                        },
                    );
                }
                Some((client, SchemaRequest::Reload)) => {
                    self.emit_to(
                        client,
                        Event::ParamsError {
                            message: "Parameter schema download failed".to_string(),
                        },
                    );
                }
                None => {}
            },
        }
    }

    fn handle_update_event(&mut self, event: UpdateEvent) {
        match event {
            UpdateEvent::Progress { percent } => {
                self.broadcast(Event::OtaProgress { percent });
            }
            UpdateEvent::Done => self.broadcast(Event::OtaSuccess),
            UpdateEvent::Failed { reason } => {
                self.broadcast(Event::OtaError {
                    message: reason.to_string(),
                });
            }
        }
    }

    fn handle_scan_event(&mut self, event: ScanEvent, now_us: u64) {
        match event {
            ScanEvent::Progress { node } => {
                let (start_node, end_node) = self.scanner.range();
                self.broadcast(Event::ScanProgress {
                    current_node: node,
                    start_node,
                    end_node,
                });
            }
            ScanEvent::Discovered { node, serial } => {
                let record = self.registry.upsert(&serial, node, now_us / 1000);
                self.broadcast(Event::DeviceDiscovered {
                    node,
                    serial: serial.to_string(),
                    name: record.name,
                    last_seen: record.last_seen,
                });
            }
        }
    }

    fn handle_command(&mut self, command: Command, now_us: u64) {
        match command {
            Command::StartScan { start, end } => {
                if self.session.connected_node().is_some()
                    || self.session.state() != SessionState::Idle
                    || self.updater.is_active()
                    || self.pending_ota.is_some()
                {
                    self.broadcast(Event::error("Device is busy"));
                    return;
                }
                if let Err(e) = self.io.reset_to_scanning_mode() {
                    self.broadcast(Event::error(e.to_string()));
                    return;
                }
                self.scanner.start(start, end);
                self.broadcast(Event::ScanStatus { active: true });
            }
            Command::StopScan => {
                self.scanner.stop();
                if let Err(e) = self.io.reset_to_scanning_mode() {
                    warn!("scanning filter not restored: {}", e);
                }
                self.broadcast(Event::ScanStatus { active: false });
            }
            Command::Connect { client, node } => {
                self.start_connect(client, node, ConnectKind::Connect, now_us);
            }
            Command::SetNodeId { client, node } => {
                self.start_connect(client, node, ConnectKind::SetNodeId, now_us);
            }
            Command::Disconnect { client } => {
                self.release_client(client);
                self.emit_to(client, Event::Disconnected);
            }
            Command::ClientDisconnected { client } => {
                self.release_client(client);
            }
            Command::GetNodeId { client } => {
                self.emit_to(
                    client,
                    Event::NodeIdInfo {
                        id: self.session.connected_node().unwrap_or_default(),
                        speed: self.settings.can_speed,
                    },
                );
            }
            Command::SetDeviceName { serial, name } => {
                let success = self.registry.set_name(&serial, &name);
                self.broadcast(Event::DeviceNameSet { serial, success });
            }
            Command::DeleteDevice { serial } => {
                let success = self.registry.delete(&serial);
                self.broadcast(Event::DeviceDeleted { serial, success });
            }
            Command::RenameDevice { serial, name } => {
                let success = self.registry.rename(&serial, &name);
                self.broadcast(Event::DeviceRenamed { serial, success });
            }
            Command::StartSpotValues {
                client,
                param_ids,
                interval_ms,
            } => {
                if self.require_holder(client).is_none() {
                    return;
                }
                self.spot.start(param_ids, interval_ms);
                self.broadcast(Event::SpotValuesStatus { active: true });
            }
            Command::StopSpotValues { client: _ } => {
                if let Some(batch) = self.spot.stop() {
                    self.broadcast(Event::SpotValues { values: batch });
                }
                self.broadcast(Event::SpotValuesStatus { active: false });
            }
            Command::UpdateParam {
                client,
                param_id,
                value,
            } => {
                let Some(node) = self.require_holder(client) else {
                    return;
                };
                if self.session.state() != SessionState::Idle {
                    self.broadcast(Event::ParamUpdate {
                        param_id,
                        value,
                        error: Some("Device is busy".to_string()),
                    });
                    return;
                }
                let (index, sub) = param_sdo_address(param_id);
                let raw = param_value_to_wire(value) as u32;
                let error = match self
                    .io
                    .write_and_wait(node, index, sub, raw, PARAM_WRITE_TIMEOUT_MS)
                {
                    SdoWriteResult::Ok => None,
                    SdoWriteResult::Abort(code) => Some(abort::text(code).to_string()),
                    SdoWriteResult::Timeout => Some("No response from device".to_string()),
                };
                self.broadcast(Event::ParamUpdate {
                    param_id,
                    value,
                    error,
                });
            }
            Command::GetParamSchema { client } => {
                if let Some(schema) = self.session.schema() {
                    let schema = schema.raw().clone();
                    self.emit_to(client, Event::ParamSchemaData { schema });
                } else if self.session.connected_node().is_none() {
                    self.emit_to(
                        client,
                        Event::ParamSchemaError {
                            message: "No device connected".to_string(),
                        },
                    );
                } else {
                    match self.session.begin_schema_download(&mut self.io, now_us) {
                        Ok(()) => self.pending_schema = Some((client, SchemaRequest::Get)),
                        Err(_) => self.emit_to(
                            client,
                            Event::ParamSchemaError {
                                message: "Device is busy".to_string(),
                            },
                        ),
                    }
                }
            }
            Command::GetParamValues { client } => {
                match self.session.schema() {
                    None => self.emit_to(
                        client,
                        Event::ParamValuesError {
                            message: "No parameter schema".to_string(),
                        },
                    ),
                    Some(schema) => {
                        // Latest streamed values win over the snapshot the
                        // schema document carried.
                        let latest = self.spot.latest();
                        let values = schema
                            .params()
                            .iter()
                            .filter_map(|(name, info)| {
                                let value = info
                                    .id
                                    .and_then(|id| latest.get(&id).copied())
                                    .or(info.value)?;
                                Some((name.clone(), value))
                            })
                            .collect();
                        self.emit_to(client, Event::ParamValuesData { values });
                    }
                }
            }
            Command::ReloadParams { client } => {
                if self.session.connected_node().is_none() {
                    self.emit_to(
                        client,
                        Event::ParamsError {
                            message: "No device connected".to_string(),
                        },
                    );
                    return;
                }
                self.session.clear_schema();
                match self.session.begin_schema_download(&mut self.io, now_us) {
                    Ok(()) => self.pending_schema = Some((client, SchemaRequest::Reload)),
                    Err(_) => self.emit_to(
                        client,
                        Event::ParamsError {
                            message: "Device is busy".to_string(),
                        },
                    ),
                }
            }
            Command::ResetDevice { client } => {
                let error = self.run_device_command(client, DeviceCommand::Reset);
                self.broadcast(Event::DeviceReset { error });
            }
            Command::SaveToFlash { client } => {
                let error = self.run_device_command(client, DeviceCommand::Save);
                self.broadcast(Event::SaveToFlash { error });
            }
            Command::LoadFromFlash { client } => {
                let error = self.run_device_command(client, DeviceCommand::Load);
                self.broadcast(Event::LoadFromFlash { error });
            }
            Command::LoadDefaults { client } => {
                let error = self.run_device_command(client, DeviceCommand::Defaults);
                self.broadcast(Event::LoadDefaults { error });
            }
            Command::StartDevice { client } => {
                let error = self.run_device_command(client, DeviceCommand::Start);
                self.broadcast(Event::StartDevice { error });
            }
            Command::StopDevice { client } => {
                let error = self.run_device_command(client, DeviceCommand::Stop);
                self.broadcast(Event::StopDevice { error });
            }
            Command::GetCanMappings { client } => {
                if self.session.connected_node().is_none() {
                    self.emit_to(client, Event::error("No device connected"));
                    return;
                }
                if self.session.state() != SessionState::Idle {
                    self.emit_to(client, Event::error("Device is busy"));
                    return;
                }
                match self.session.read_can_mappings(&mut self.io) {
                    Ok(mappings) => self.emit_to(client, Event::CanMappingsData { mappings }),
                    Err(e) => self.emit_to(client, Event::error(e.to_string())),
                }
            }
            Command::AddCanMapping { client, mapping } => {
                let success = self.mutate_mappings(client, |gateway| {
                    gateway.session.add_can_mapping(&mut gateway.io, &mapping)
                });
                if let Some(success) = success {
                    self.broadcast(Event::CanMappingAdded { success });
                }
            }
            Command::RemoveCanMapping { client, read_index } => {
                let success = self.mutate_mappings(client, |gateway| {
                    gateway
                        .session
                        .remove_can_mapping(&mut gateway.io, read_index)
                        .and_then(|removed| {
                            if removed {
                                Ok(())
                            } else {
                                Err(GatewayError::SdoAbort(abort::UNKNOWN_INDEX))
                            }
                        })
                });
                if let Some(success) = success {
                    self.broadcast(Event::CanMappingRemoved { success });
                }
            }
            Command::ListErrors { client } => {
                if self.session.connected_node().is_none()
                    || self.session.state() != SessionState::Idle
                {
                    self.emit_to(client, Event::error("Device is busy"));
                    return;
                }
                let errors = self.session.read_error_log(&mut self.io);
                self.emit_to(client, Event::ListErrorsSuccess { errors });
            }
            Command::SendCanMessage {
                client,
                id,
                data,
            } => {
                let success = match CanFrame::new(id, &data) {
                    Ok(frame) => self.io.tx_submit(frame).is_ok(),
                    Err(_) => false,
                };
                self.emit_to(client, Event::CanMessageSent { success });
            }
            Command::StartCanInterval {
                id,
                cob_id,
                data,
                interval_ms,
            }
            | Command::UpdateCanInterval {
                id,
                cob_id,
                data,
                interval_ms,
            } => {
                self.intervals.upsert(&id, cob_id, data, interval_ms);
                self.broadcast(Event::CanIntervalStatus { id, active: true });
            }
            Command::StopCanInterval { id } => {
                self.intervals.remove(&id);
                self.broadcast(Event::CanIntervalStatus { id, active: false });
            }
            Command::StartCanIoInterval {
                cob_id,
                interval_ms,
                config,
            } => {
                self.intervals.canio_start(cob_id, interval_ms, config);
                self.broadcast(Event::CanIoIntervalStatus { active: true });
            }
            Command::StopCanIoInterval => {
                self.intervals.canio_stop();
                self.broadcast(Event::CanIoIntervalStatus { active: false });
            }
            Command::UpdateCanIoFlags { config } => {
                if !self.intervals.canio_update(config) {
                    self.broadcast(Event::error("Control frame transmission is not active"));
                }
            }
            Command::StartOta { client, firmware } => {
                self.start_ota(client, firmware, now_us);
            }
        }
    }

    fn start_connect(
        &mut self,
        client: ClientId,
        node: NodeId,
        kind: ConnectKind,
        now_us: u64,
    ) {
        if !valid_node_id(node) {
            self.emit_to(client, Event::error("Node id out of range"));
            return;
        }
        if let Some(holder) = self.locks.holder(node)
            && holder != client
        {
            let serial = self.registry.by_node(node).map(|(s, _)| s.to_string());
            self.emit_to(client, Event::device_locked(node, serial));
            return;
        }
        if self.updater.is_active() || self.pending_ota.is_some() {
            self.emit_to(client, Event::error("Firmware update in progress"));
            return;
        }
        self.locks.acquire(node, client);
        self.intervals.clear();
        self.spot.stop();
        if let Err(e) = self.io.init_for_device(node, &self.settings.can_settings()) {
            self.locks.release(node);
            self.emit_to(client, Event::error(e.to_string()));
            return;
        }
        self.session.connect(node, now_us);
        self.pending_connect = Some((client, kind));
    }

    fn release_client(&mut self, client: ClientId) {
        if let Some(node) = self.locks.release_client(client) {
            self.intervals.clear();
            self.spot.stop();
            self.session.disconnect();
            if let Err(e) = self.io.reset_to_scanning_mode() {
                warn!("scanning filter not restored: {}", e);
            }
            self.broadcast(Event::DeviceUnlocked { node });
        }
    }

    fn check_holder(&self, client: ClientId) -> Result<NodeId, GatewayError> {
        let node = self
            .session
            .connected_node()
            .ok_or(GatewayError::SessionBusy)?;
        if self.locks.holder(node) == Some(client) {
            Ok(node)
        } else {
            Err(GatewayError::LockConflict { node })
        }
    }

    /// Lock gate for device-mutating commands: the client must hold the
    /// lock on the connected node. Emits the failure event itself.
    fn require_holder(&mut self, client: ClientId) -> Option<NodeId> {
        match self.check_holder(client) {
            Ok(node) => Some(node),
            Err(GatewayError::LockConflict { node }) => {
                let serial = self.registry.by_node(node).map(|(s, _)| s.to_string());
                self.emit_to(client, Event::device_locked(node, serial));
                None
            }
            Err(_) => {
                self.emit_to(client, Event::error("No device connected"));
                None
            }
        }
    }

    /// Shared guard + execution for the six device commands. Returns the
    /// error text for the resulting event, `None` on success.
    fn run_device_command(
        &mut self,
        client: ClientId,
        command: DeviceCommand,
    ) -> Option<String> {
        if self.require_holder(client).is_none() {
            return Some("Device is locked".to_string());
        }
        if self.session.state() != SessionState::Idle {
            return Some("Device is busy".to_string());
        }
        if self.session.device_command(&mut self.io, command) {
            None
        } else {
            Some("Device did not confirm the command".to_string())
        }
    }

    /// Guard + execution for mapping mutations. `None` means the guards
    /// already emitted an event and no status should follow.
    fn mutate_mappings<F>(&mut self, client: ClientId, operation: F) -> Option<bool>
    where
        F: FnOnce(&mut Self) -> Result<(), GatewayError>,
    {
        self.require_holder(client)?;
        if self.session.state() != SessionState::Idle {
            self.emit_to(client, Event::error("Device is busy"));
            return None;
        }
        match operation(self) {
            Ok(()) => Some(true),
            Err(e) => {
                debug!("mapping operation failed: {}", e);
                Some(false)
            }
        }
    }

    fn start_ota(&mut self, client: Option<ClientId>, firmware: Vec<u8>, now_us: u64) {
        let Some(node) = self.session.connected_node() else {
            self.emit_ota_error(client, "No device connected");
            return;
        };
        if self.session.state() != SessionState::Idle
            || self.updater.is_active()
            || self.pending_ota.is_some()
        {
            self.emit_ota_error(client, "Device is busy");
            return;
        }
        // Kick the application into its bootloader. The reset rarely gets
        // acknowledged, the device is already rebooting; the updater is
        // armed from poll() once the entry delay has elapsed.
        self.io
            .set_value(node, crate::session::COMMAND_INDEX, DeviceCommand::Reset.sub(), 0);
        self.pending_ota = Some(PendingOta {
            client,
            firmware,
            ready_at_us: now_us + BOOTLOADER_ENTRY_DELAY_US,
        });
    }

    fn emit_ota_error(&mut self, client: Option<ClientId>, message: &str) {
        let event = Event::OtaError {
            message: message.to_string(),
        };
        match client {
            Some(client) => self.emit_to(client, event),
            None => self.broadcast(event),
        }
    }

    fn broadcast(&self, event: Event) {
        self.emit(OutboundEvent::broadcast(event));
    }

    fn emit_to(&self, client: ClientId, event: Event) {
        self.emit(OutboundEvent::to_client(client, event));
    }

    fn emit(&self, event: OutboundEvent) {
        if self.events.try_send(event).is_err() {
            warn!("event queue full, event dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::event_tag;
    use crate::testutil::{MemoryRegistry, MockCan, expedited_upload, sdo_abort};
    use crossbeam_channel::bounded;

    struct Harness {
        gateway: Gateway<MockCan, MemoryRegistry>,
        commands: Sender<Command>,
        events: Receiver<OutboundEvent>,
        now_us: u64,
    }

    fn harness(mock: MockCan) -> Harness {
        let _ = env_logger::builder().is_test(true).try_init();
        let (command_tx, command_rx) = bounded(COMMAND_QUEUE_CAPACITY);
        let (event_tx, event_rx) = bounded(256);
        let gateway = Gateway::new(
            mock,
            MemoryRegistry::default(),
            GatewaySettings::default(),
            command_rx,
            event_tx,
        )
        .unwrap();
        Harness {
            gateway,
            commands: command_tx,
            events: event_rx,
            now_us: 1_000_000,
        }
    }

    impl Harness {
        fn send(&self, command: Command) {
            self.commands.send(command).unwrap();
        }

        /// Runs `steps` scheduling steps, advancing the synthetic clock.
        fn run(&mut self, steps: u32, step_us: u64) {
            for _ in 0..steps {
                self.gateway.run_step(self.now_us);
                self.now_us += step_us;
            }
        }

        fn drain(&self) -> Vec<OutboundEvent> {
            self.events.try_iter().collect()
        }

        /// Connects `client` to `node` and asserts the session settles.
        fn connect(&mut self, client: ClientId, node: NodeId) {
            self.send(Command::Connect { client, node });
            self.run(10, 60_000);
            let events = self.drain();
            assert!(
                events
                    .iter()
                    .any(|e| matches!(e.event, Event::Connected { node: n, .. } if n == node)),
                "connect did not settle: {events:?}"
            );
            assert_eq!(self.gateway.session.state(), SessionState::Idle);
        }
    }

    /// Responder for a device at `node`: answers serial reads with `words`
    /// and parameter reads with `id * 32` (so values decode to the id).
    fn device_responder(
        node: NodeId,
        words: [u32; 4],
    ) -> impl FnMut(&CanFrame) -> Vec<CanFrame> + Send {
        move |req| {
            if req.id != 0x600 | u16::from(node) || req.data()[0] != 0x40 {
                return vec![];
            }
            let index = u16::from_le_bytes([req.data()[1], req.data()[2]]);
            let sub = req.data()[3];
            if index == crate::session::SERIAL_INDEX {
                vec![expedited_upload(node, index, sub, words[usize::from(sub)])]
            } else if let Some(id) = crate::schema::param_id_from_address(index, sub) {
                vec![expedited_upload(node, index, sub, id * 32)]
            } else {
                vec![]
            }
        }
    }

    fn tags(events: &[OutboundEvent]) -> Vec<&'static str> {
        events.iter().map(|e| event_tag(&e.event)).collect()
    }

    #[test]
    fn discovery_registers_and_announces_a_device() {
        let mut mock = MockCan::new();
        mock.respond_with(device_responder(2, [0xA, 0xB, 0xC, 0xD]));
        let mut h = harness(mock);

        h.send(Command::StartScan { start: 1, end: 3 });
        h.run(12, 60_000);

        let events = h.drain();
        let interesting: Vec<&OutboundEvent> = events
            .iter()
            .filter(|e| {
                matches!(
                    e.event,
                    Event::ScanStatus { .. }
                        | Event::ScanProgress { .. }
                        | Event::DeviceDiscovered { .. }
                )
            })
            .collect();

        assert_eq!(interesting[0].event, Event::ScanStatus { active: true });
        assert_eq!(
            interesting[1].event,
            Event::ScanProgress {
                current_node: 1,
                start_node: 1,
                end_node: 3
            }
        );
        assert_eq!(
            interesting[2].event,
            Event::ScanProgress {
                current_node: 2,
                start_node: 1,
                end_node: 3
            }
        );
        match &interesting[3].event {
            Event::DeviceDiscovered { node, serial, .. } => {
                assert_eq!(*node, 2);
                assert_eq!(serial, "0000000A-0000000B-0000000C-0000000D");
            }
            other => panic!("expected discovery, got {other:?}"),
        }

        let record = h
            .gateway
            .registry()
            .get("0000000A-0000000B-0000000C-0000000D")
            .expect("device registered");
        assert_eq!(record.node_id, 2);
    }

    #[test]
    fn update_param_surfaces_the_range_abort() {
        let mut mock = MockCan::new();
        mock.respond_with(device_responder(5, [1, 2, 3, 4]));
        let mut h = harness(mock);
        h.connect(1, 5);

        // From here on the device rejects writes with "value out of range".
        h.gateway
            .io_mut()
            .interface_mut()
            .respond_with(|req: &CanFrame| {
                if req.data()[0] == 0x23 {
                    let index = u16::from_le_bytes([req.data()[1], req.data()[2]]);
                    vec![sdo_abort(5, index, req.data()[3], abort::VALUE_RANGE)]
                } else {
                    vec![]
                }
            });

        h.send(Command::UpdateParam {
            client: 1,
            param_id: 0x1234,
            value: 7.5,
        });
        h.run(2, 60_000);

        let events: Vec<OutboundEvent> = h
            .drain()
            .into_iter()
            .filter(|e| matches!(e.event, Event::ParamUpdate { .. }))
            .collect();
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].event,
            Event::ParamUpdate {
                param_id: 0x1234,
                value: 7.5,
                error: Some("Value out of range".to_string())
            }
        );
    }

    #[test]
    fn second_client_cannot_claim_a_locked_node() {
        let mut mock = MockCan::new();
        mock.respond_with(device_responder(7, [1, 2, 3, 4]));
        let mut h = harness(mock);
        h.connect(1, 7);

        let sent_before = h.gateway.io().interface().sent.len();
        h.send(Command::Connect { client: 2, node: 7 });
        h.run(2, 60_000);

        let events = h.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].target, Some(2));
        match &events[0].event {
            Event::Error { kind, node, .. } => {
                assert_eq!(*kind, Some("device_locked"));
                assert_eq!(*node, Some(7));
            }
            other => panic!("expected lock error, got {other:?}"),
        }
        assert_eq!(
            h.gateway.io().interface().sent.len(),
            sent_before,
            "a refused connect puts nothing on the bus"
        );
    }

    #[test]
    fn spot_values_batch_within_one_window() {
        let mut mock = MockCan::new();
        mock.respond_with(device_responder(5, [1, 2, 3, 4]));
        let mut h = harness(mock);
        h.connect(1, 5);

        h.send(Command::StartSpotValues {
            client: 1,
            param_ids: vec![100, 200],
            interval_ms: 1000,
        });
        h.run(220, 10_000); // 2.2 s of virtual time

        let events = h.drain();
        let spot_events: Vec<&OutboundEvent> = events
            .iter()
            .filter(|e| matches!(e.event, Event::SpotValues { .. }))
            .collect();
        assert_eq!(spot_events.len(), 2, "one batch per elapsed window");
        for event in &spot_events {
            match &event.event {
                Event::SpotValues { values } => {
                    assert_eq!(values.get(&100), Some(&100.0));
                    assert_eq!(values.get(&200), Some(&200.0));
                }
                _ => unreachable!(),
            }
        }
    }

    #[test]
    fn firmware_update_happy_path_and_reconnect() {
        let mut mock = MockCan::new();
        mock.respond_with(device_responder(3, [9, 9, 9, 9]));
        let mut h = harness(mock);
        h.connect(1, 3);

        h.send(Command::StartOta {
            client: None,
            firmware: vec![0x5A; 2050],
        });
        // The updater arms only after the bootloader entry delay.
        h.run(10, 60_000);

        let feed = |h: &mut Harness, data: &[u8]| {
            let frame = CanFrame::new(0x7DE, data).unwrap();
            h.gateway.io_mut().interface_mut().push_rx(frame);
            h.run(1, 10_000);
        };

        feed(&mut h, &[0x33, 1]);
        feed(&mut h, b"S");
        for page in 0..3 {
            for _ in 0..128 {
                feed(&mut h, b"P");
            }
            feed(&mut h, b"C");
            feed(&mut h, if page < 2 { b"P" } else { b"D" });
        }

        let ota_tags: Vec<&'static str> = h
            .drain()
            .iter()
            .filter_map(|e| {
                let tag = event_tag(&e.event);
                (tag == "otaProgress" || tag == "otaSuccess").then_some(tag)
            })
            .collect();
        assert_eq!(
            ota_tags,
            vec!["otaProgress", "otaProgress", "otaProgress", "otaSuccess"]
        );

        // The device rebooted; serial acquisition runs again and settles.
        h.run(10, 60_000);
        let events = h.drain();
        assert!(
            events
                .iter()
                .any(|e| matches!(e.event, Event::Connected { node: 3, .. })),
            "device did not reconnect: {events:?}"
        );
        assert_eq!(h.gateway.session.state(), SessionState::Idle);
        assert_eq!(h.gateway.updater.state(), UpdateState::Idle);
    }

    #[test]
    fn disconnect_during_scan_releases_but_keeps_scanning() {
        let mut mock = MockCan::new();
        mock.respond_with(device_responder(7, [1, 2, 3, 4]));
        let mut h = harness(mock);

        h.send(Command::StartScan { start: 1, end: 10 });
        h.run(2, 60_000);
        h.connect(1, 7);
        h.send(Command::StartCanInterval {
            id: "beacon".to_string(),
            cob_id: 0x100,
            data: vec![0xAA],
            interval_ms: 100,
        });
        h.run(2, 60_000);
        h.drain();

        h.send(Command::ClientDisconnected { client: 1 });
        h.run(8, 60_000);

        let events = h.drain();
        assert!(
            events
                .iter()
                .any(|e| e.event == Event::DeviceUnlocked { node: 7 }),
            "unlock not broadcast: {events:?}"
        );
        assert!(
            !tags(&events).contains(&"scanStatus"),
            "scan status must not change on disconnect"
        );
        assert!(
            tags(&events).contains(&"scanProgress"),
            "scan should resume after the filter is restored"
        );
        assert!(h.gateway.intervals().is_empty());
        assert_eq!(
            h.gateway.io().interface().active_filter(),
            Some(AcceptanceFilter::Scanning)
        );
    }

    #[test]
    fn start_scan_while_connected_reports_busy() {
        let mut mock = MockCan::new();
        mock.respond_with(device_responder(4, [1, 2, 3, 4]));
        let mut h = harness(mock);
        h.connect(1, 4);

        h.send(Command::StartScan { start: 1, end: 5 });
        h.run(1, 60_000);
        let events = h.drain();
        assert!(events.iter().any(|e| {
            matches!(&e.event, Event::Error { message, .. } if message == "Device is busy")
        }));
    }

    #[test]
    fn node_id_info_reports_session_and_speed() {
        let mut mock = MockCan::new();
        mock.respond_with(device_responder(9, [1, 2, 3, 4]));
        let mut h = harness(mock);
        h.connect(6, 9);

        h.send(Command::GetNodeId { client: 6 });
        h.run(1, 60_000);
        let events = h.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].target, Some(6));
        assert_eq!(events[0].event, Event::NodeIdInfo { id: 9, speed: 2 });
    }

    #[test]
    fn send_can_message_reports_submission() {
        let mut h = harness(MockCan::new());
        h.send(Command::SendCanMessage {
            client: 1,
            id: 0x123,
            data: vec![1, 2, 3],
        });
        h.run(1, 60_000);
        let events = h.drain();
        assert_eq!(events[0].event, Event::CanMessageSent { success: true });
        assert!(
            h.gateway
                .io()
                .interface()
                .sent
                .iter()
                .any(|f| f.id == 0x123 && f.data() == [1, 2, 3])
        );
    }

    #[test]
    fn device_commands_need_the_lock() {
        let mut mock = MockCan::new();
        mock.respond_with(device_responder(4, [1, 2, 3, 4]));
        let mut h = harness(mock);
        h.connect(1, 4);

        h.send(Command::SaveToFlash { client: 99 });
        h.run(2, 60_000);
        let events = h.drain();
        assert!(
            events
                .iter()
                .any(|e| matches!(&e.event, Event::Error { kind: Some("device_locked"), .. })),
            "{events:?}"
        );
        assert!(events.iter().any(|e| {
            matches!(&e.event, Event::SaveToFlash { error: Some(_) })
        }));
    }

    #[test]
    fn interval_updates_replace_in_place() {
        let mut h = harness(MockCan::new());
        h.send(Command::StartCanInterval {
            id: "beacon".to_string(),
            cob_id: 0x100,
            data: vec![1],
            interval_ms: 100,
        });
        h.send(Command::UpdateCanInterval {
            id: "beacon".to_string(),
            cob_id: 0x200,
            data: vec![2],
            interval_ms: 250,
        });
        h.run(2, 60_000);

        let events = h.drain();
        assert_eq!(
            events
                .iter()
                .filter(|e| e.event
                    == Event::CanIntervalStatus {
                        id: "beacon".to_string(),
                        active: true
                    })
                .count(),
            2
        );
        assert_eq!(h.gateway.intervals().len(), 1);
    }

    #[test]
    fn get_param_values_uses_schema_and_stream_cache() {
        let mut mock = MockCan::new();
        mock.respond_with(device_responder(5, [1, 2, 3, 4]));
        let mut h = harness(mock);
        h.connect(1, 5);
        h.gateway.session.install_cached_schema(
            br#"{"boost": {"id": 100, "unit": "dig", "value": 3.0}}"#.to_vec(),
        );

        h.send(Command::GetParamValues { client: 1 });
        h.run(1, 60_000);
        let events = h.drain();
        match &events[0].event {
            Event::ParamValuesData { values } => {
                assert_eq!(values.get("boost"), Some(&3.0), "schema snapshot value");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
