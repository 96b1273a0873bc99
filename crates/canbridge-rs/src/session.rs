// crates/canbridge-rs/src/session.rs

//! Connection session for the currently attached device: serial
//! acquisition, schema download, parameter rate limiting, device commands,
//! the CAN mapping table and the error log.

use crate::frame::CanFrame;
use crate::hal::{CanInterface, GatewayError};
use crate::io::CanIo;
use crate::schema::ParamSchema;
use crate::sdo::frame::{SdoResponse, decode_response};
use crate::sdo::SdoWriteResult;
use crate::types::{NodeId, SerialNumber};
use log::{debug, info, warn};
use serde::Serialize;

/// Serial number words, read at sub-indices 0..=3.
pub const SERIAL_INDEX: u16 = 0x5000;
/// Parameter document, segmented upload at sub-index 0.
pub const SCHEMA_INDEX: u16 = 0x5001;
/// Device command object; the sub-index selects the command.
pub const COMMAND_INDEX: u16 = 0x5002;
/// Error log timestamps, sub-indices 0..=254.
pub const ERROR_TIME_INDEX: u16 = 0x5003;
/// Error log error numbers, sub-indices 0..=254.
pub const ERROR_NUM_INDEX: u16 = 0x5004;

/// Read side of the mapping table, one index per entry.
pub const MAPPING_TX_READ_BASE: u16 = 0x3100;
pub const MAPPING_RX_READ_BASE: u16 = 0x3180;
/// Write side of the mapping table.
pub const MAPPING_TX_WRITE_INDEX: u16 = 0x3000;
pub const MAPPING_RX_WRITE_INDEX: u16 = 0x3001;

const OBTAIN_SERIAL_TIMEOUT_US: u64 = 5_000_000;
const SERIAL_PROBE_RETRY_US: u64 = 100_000;
const SCHEMA_SEGMENT_TIMEOUT_US: u64 = 5_000_000;
const SCHEMA_PROGRESS_INTERVAL_US: u64 = 200_000;
const DEVICE_COMMAND_TIMEOUT_MS: u64 = 200;
const MAPPING_PROBE_TIMEOUT_MS: u64 = 100;
const MAPPING_WALK_LIMIT: u16 = 100;
const ERROR_LOG_PROBE_TIMEOUT_MS: u64 = 100;

/// Default minimum spacing between parameter read requests.
pub const DEFAULT_PARAM_REQUEST_INTERVAL_US: u64 = 500;

/// Converts a raw wire value (signed 32-bit fixed point, 5 fractional
/// bits) to its real value.
pub fn param_value_from_wire(raw: i32) -> f64 {
    f64::from(raw) / 32.0
}

/// The inverse of [`param_value_from_wire`], truncating toward zero.
pub fn param_value_to_wire(value: f64) -> i32 {
    (value * 32.0).trunc() as i32
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Error,
    ObtainSerial,
    ObtainSchema,
}

/// Commands executed through the device command object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceCommand {
    Save,
    Load,
    Reset,
    Defaults,
    Start,
    Stop,
}

impl DeviceCommand {
    pub fn sub(&self) -> u8 {
        match self {
            DeviceCommand::Save => 0,
            DeviceCommand::Load => 1,
            DeviceCommand::Reset => 2,
            DeviceCommand::Defaults => 3,
            DeviceCommand::Start => 4,
            DeviceCommand::Stop => 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MappingDirection {
    Tx,
    Rx,
}

impl MappingDirection {
    pub fn read_base(&self) -> u16 {
        match self {
            MappingDirection::Tx => MAPPING_TX_READ_BASE,
            MappingDirection::Rx => MAPPING_RX_READ_BASE,
        }
    }

    pub fn write_index(&self) -> u16 {
        match self {
            MappingDirection::Tx => MAPPING_TX_WRITE_INDEX,
            MappingDirection::Rx => MAPPING_RX_WRITE_INDEX,
        }
    }
}

/// One row of the device's CAN mapping table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CanMapping {
    pub direction: MappingDirection,
    #[serde(rename = "cobId")]
    pub cob_id: u16,
    #[serde(rename = "paramId")]
    pub param_id: u32,
    pub position: u8,
    pub length: u8,
    pub gain: f64,
    pub offset: i8,
    #[serde(rename = "readIndex")]
    pub read_index: u16,
    #[serde(rename = "readSubIndex")]
    pub read_subindex: u8,
}

/// A mapping to be added, as submitted by a client.
#[derive(Debug, Clone, PartialEq)]
pub struct MappingRequest {
    pub direction: MappingDirection,
    pub cob_id: u16,
    pub param_id: u32,
    pub position: u8,
    pub length: u8,
    pub gain: f64,
    pub offset: i8,
}

/// One decoded error log row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorLogEntry {
    #[serde(rename = "timeMs")]
    pub time_ms: u64,
    pub error: u32,
    pub description: String,
}

/// Notable session transitions, surfaced by [`DeviceSession::tick`].
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    ConnectionReady { node: NodeId, serial: SerialNumber },
    /// Serial acquisition overran its 5 s budget but another attempt from
    /// the retry budget is starting.
    SerialTimeout { retries_left: u32 },
    /// Serial acquisition gave up; the session is idle again.
    SerialFailed,
    SchemaProgress { percent: u8 },
    SchemaReady,
    SchemaFailed,
}

pub struct DeviceSession {
    node_id: Option<NodeId>,
    state: SessionState,
    serial: Option<SerialNumber>,
    partial_serial: [u32; 4],
    serial_part: u8,
    state_entered_us: u64,
    last_probe_us: u64,
    retries: u32,
    schema: Option<ParamSchema>,
    schema_doc: Vec<u8>,
    schema_buf: Vec<u8>,
    schema_total: usize,
    schema_toggle: bool,
    schema_last_segment_us: u64,
    schema_last_progress_us: u64,
    min_param_request_interval_us: u64,
    last_param_request_us: u64,
}

impl Default for DeviceSession {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceSession {
    pub fn new() -> Self {
        DeviceSession {
            node_id: None,
            state: SessionState::Idle,
            serial: None,
            partial_serial: [0; 4],
            serial_part: 0,
            state_entered_us: 0,
            last_probe_us: 0,
            retries: 0,
            schema: None,
            schema_doc: Vec::new(),
            schema_buf: Vec::new(),
            schema_total: 0,
            schema_toggle: false,
            schema_last_segment_us: 0,
            schema_last_progress_us: 0,
            min_param_request_interval_us: DEFAULT_PARAM_REQUEST_INTERVAL_US,
            last_param_request_us: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn connected_node(&self) -> Option<NodeId> {
        self.node_id
    }

    pub fn serial(&self) -> Option<SerialNumber> {
        self.serial
    }

    pub fn schema(&self) -> Option<&ParamSchema> {
        self.schema.as_ref()
    }

    /// The raw bytes of the last successfully downloaded document, for the
    /// per-device cache.
    pub fn schema_document(&self) -> Option<&[u8]> {
        if self.schema.is_some() && !self.schema_doc.is_empty() {
            Some(&self.schema_doc)
        } else {
            None
        }
    }

    /// Starts a session with `node`. Switching to a different node discards
    /// the cached schema.
    pub fn connect(&mut self, node: NodeId, now_us: u64) {
        if self.node_id != Some(node) {
            debug!("device switch, dropping cached schema");
            self.schema = None;
            self.schema_doc.clear();
        }
        self.node_id = Some(node);
        self.serial = None;
        self.retries = 0;
        self.begin_obtain_serial(now_us);
    }

    /// Re-enters serial acquisition with a bounded retry budget. Used after
    /// a firmware update while the device reboots.
    pub fn reconnect_with_retries(&mut self, retries: u32, now_us: u64) {
        self.retries = retries;
        self.serial = None;
        self.begin_obtain_serial(now_us);
    }

    pub fn disconnect(&mut self) {
        self.node_id = None;
        self.serial = None;
        self.schema = None;
        self.schema_doc.clear();
        self.state = SessionState::Idle;
    }

    fn begin_obtain_serial(&mut self, now_us: u64) {
        self.state = SessionState::ObtainSerial;
        self.serial_part = 0;
        self.partial_serial = [0; 4];
        self.state_entered_us = now_us;
        self.last_probe_us = 0;
    }

    /// Installs a schema document loaded from the cache instead of the bus.
    pub fn install_cached_schema(&mut self, document: Vec<u8>) -> bool {
        match ParamSchema::parse(&document) {
            Ok(schema) => {
                info!("installed cached parameter document ({} params)", schema.len());
                self.schema = Some(schema);
                self.schema_doc = document;
                true
            }
            Err(e) => {
                warn!("cached parameter document unusable: {}", e);
                false
            }
        }
    }

    pub fn clear_schema(&mut self) {
        self.schema = None;
        self.schema_doc.clear();
    }

    /// Initiates the segmented download of the parameter document.
    pub fn begin_schema_download<I: CanInterface>(
        &mut self,
        io: &mut CanIo<I>,
        now_us: u64,
    ) -> Result<(), GatewayError> {
        let node = self.node_id.ok_or(GatewayError::SessionBusy)?;
        if self.state != SessionState::Idle {
            return Err(GatewayError::SessionBusy);
        }
        self.schema_buf.clear();
        self.schema_total = 0;
        self.schema_toggle = false;
        io.sdo_clear_pending();
        io.request_element(node, SCHEMA_INDEX, 0);
        self.state = SessionState::ObtainSchema;
        self.state_entered_us = now_us;
        self.schema_last_segment_us = now_us;
        self.schema_last_progress_us = 0;
        Ok(())
    }

    // --- Parameter request rate limit ---

    pub fn can_send_parameter_request(&self, now_us: u64) -> bool {
        now_us.saturating_sub(self.last_param_request_us) >= self.min_param_request_interval_us
    }

    pub fn mark_parameter_request_sent(&mut self, now_us: u64) {
        self.last_param_request_us = now_us;
    }

    /// Drives whichever acquisition state is active. Must be called from
    /// the protocol loop after the I/O pump.
    pub fn tick<I: CanInterface>(&mut self, io: &mut CanIo<I>, now_us: u64) -> Vec<SessionEvent> {
        match self.state {
            SessionState::ObtainSerial => self.tick_obtain_serial(io, now_us),
            SessionState::ObtainSchema => self.tick_obtain_schema(io, now_us),
            SessionState::Idle | SessionState::Error => Vec::new(),
        }
    }

    fn tick_obtain_serial<I: CanInterface>(
        &mut self,
        io: &mut CanIo<I>,
        now_us: u64,
    ) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        let Some(node) = self.node_id else {
            self.state = SessionState::Idle;
            return events;
        };

        while let Some(frame) = io.sdo_recv() {
            if !from_node(&frame, node) {
                continue;
            }
            if let SdoResponse::UploadExpedited { index, sub, value } = decode_response(&frame)
                && index == SERIAL_INDEX
                && sub == self.serial_part
            {
                self.partial_serial[usize::from(sub)] = value;
                self.serial_part += 1;
                if self.serial_part == 4 {
                    let serial = SerialNumber(self.partial_serial);
                    info!("node {} identified as {}", node, serial);
                    self.serial = Some(serial);
                    self.state = SessionState::Idle;
                    events.push(SessionEvent::ConnectionReady { node, serial });
                    return events;
                }
                io.request_element(node, SERIAL_INDEX, self.serial_part);
                self.last_probe_us = now_us;
            }
        }

        if now_us.saturating_sub(self.state_entered_us) > OBTAIN_SERIAL_TIMEOUT_US {
            if self.retries > 0 {
                self.retries -= 1;
                debug!(
                    "serial acquisition timed out, {} retries left",
                    self.retries
                );
                events.push(SessionEvent::SerialTimeout {
                    retries_left: self.retries,
                });
                self.begin_obtain_serial(now_us);
            } else {
                warn!("serial acquisition timed out, falling back to idle");
                self.state = SessionState::Idle;
                events.push(SessionEvent::SerialFailed);
            }
        } else if now_us.saturating_sub(self.last_probe_us) >= SERIAL_PROBE_RETRY_US {
            io.sdo_clear_pending();
            io.request_element(node, SERIAL_INDEX, self.serial_part);
            self.last_probe_us = now_us;
        }

        events
    }

    fn tick_obtain_schema<I: CanInterface>(
        &mut self,
        io: &mut CanIo<I>,
        now_us: u64,
    ) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        let Some(node) = self.node_id else {
            self.state = SessionState::Idle;
            return events;
        };

        while let Some(frame) = io.sdo_recv() {
            if !from_node(&frame, node) {
                continue;
            }
            match decode_response(&frame) {
                SdoResponse::UploadInitiate { index, sub, size }
                    if index == SCHEMA_INDEX && sub == 0 =>
                {
                    self.schema_total = size.unwrap_or(0) as usize;
                    debug!("parameter document download, {} bytes", self.schema_total);
                    self.schema_toggle = false;
                    io.request_segment(node, false);
                    self.schema_last_segment_us = now_us;
                }
                SdoResponse::UploadExpedited { index, sub, value }
                    if index == SCHEMA_INDEX && sub == 0 =>
                {
                    // Tiny documents fit in one expedited frame.
                    let bytes = value.to_le_bytes();
                    let len = bytes.iter().rposition(|b| *b != 0).map_or(0, |p| p + 1);
                    self.schema_buf = bytes[..len].to_vec();
                    self.complete_schema(&mut events);
                    return events;
                }
                SdoResponse::Segment { toggle, last, data } => {
                    if toggle != self.schema_toggle {
                        warn!("segment toggle mismatch, aborting schema download");
                        self.fail_schema(&mut events);
                        return events;
                    }
                    self.schema_buf.extend_from_slice(&data);
                    self.schema_last_segment_us = now_us;
                    if self.schema_total > 0
                        && now_us.saturating_sub(self.schema_last_progress_us)
                            >= SCHEMA_PROGRESS_INTERVAL_US
                    {
                        let percent =
                            ((self.schema_buf.len() * 100 / self.schema_total).min(100)) as u8;
                        events.push(SessionEvent::SchemaProgress { percent });
                        self.schema_last_progress_us = now_us;
                    }
                    if last {
                        self.complete_schema(&mut events);
                        return events;
                    }
                    self.schema_toggle = !self.schema_toggle;
                    io.request_segment(node, self.schema_toggle);
                }
                SdoResponse::Abort { code, .. } => {
                    warn!("device aborted schema download: {:#010X}", code);
                    self.fail_schema(&mut events);
                    return events;
                }
                _ => {}
            }
        }

        if now_us.saturating_sub(self.schema_last_segment_us) > SCHEMA_SEGMENT_TIMEOUT_US {
            warn!(
                "schema download stalled after {} bytes, discarding",
                self.schema_buf.len()
            );
            self.fail_schema(&mut events);
        }

        events
    }

    fn complete_schema(&mut self, events: &mut Vec<SessionEvent>) {
        self.state = SessionState::Idle;
        let document = core::mem::take(&mut self.schema_buf);
        match ParamSchema::parse(&document) {
            Ok(schema) => {
                info!(
                    "parameter document complete: {} bytes, {} params",
                    document.len(),
                    schema.len()
                );
                self.schema = Some(schema);
                self.schema_doc = document;
                events.push(SessionEvent::SchemaProgress { percent: 100 });
                events.push(SessionEvent::SchemaReady);
            }
            Err(e) => {
                warn!("downloaded parameter document unusable: {}", e);
                events.push(SessionEvent::SchemaFailed);
            }
        }
    }

    fn fail_schema(&mut self, events: &mut Vec<SessionEvent>) {
        self.schema_buf.clear();
        self.schema_total = 0;
        self.state = SessionState::Idle;
        events.push(SessionEvent::SchemaFailed);
    }

    // --- Device commands ---

    /// Executes one device command, reporting plain success or failure.
    pub fn device_command<I: CanInterface>(
        &mut self,
        io: &mut CanIo<I>,
        command: DeviceCommand,
    ) -> bool {
        let Some(node) = self.node_id else {
            return false;
        };
        match io.write_and_wait(
            node,
            COMMAND_INDEX,
            command.sub(),
            0,
            DEVICE_COMMAND_TIMEOUT_MS,
        ) {
            SdoWriteResult::Ok => true,
            SdoWriteResult::Abort(code) => {
                warn!("device command {:?} aborted: {:#010X}", command, code);
                false
            }
            SdoWriteResult::Timeout => {
                warn!("device command {:?} timed out", command);
                false
            }
        }
    }

    // --- CAN mapping table ---

    /// Walks both directions of the mapping table. An abort terminates a
    /// direction; a bus timeout aborts the whole walk so a stalled device
    /// is not mistaken for an empty table.
    pub fn read_can_mappings<I: CanInterface>(
        &mut self,
        io: &mut CanIo<I>,
    ) -> Result<Vec<CanMapping>, GatewayError> {
        let node = self.node_id.ok_or(GatewayError::SessionBusy)?;
        let mut mappings = Vec::new();
        for direction in [MappingDirection::Tx, MappingDirection::Rx] {
            let base = direction.read_base();
            for slot in 0..MAPPING_WALK_LIMIT {
                let index = base + slot;
                let Some(cob) = self.mapping_word(io, node, index, 0)? else {
                    break;
                };
                let Some(packed) = self.mapping_word(io, node, index, 1)? else {
                    break;
                };
                let Some(gains) = self.mapping_word(io, node, index, 2)? else {
                    break;
                };
                mappings.push(CanMapping {
                    direction,
                    cob_id: (cob & 0x7FF) as u16,
                    param_id: packed & 0xFFFF,
                    position: ((packed >> 16) & 0xFF) as u8,
                    length: ((packed >> 24) & 0xFF) as u8,
                    gain: unpack_gain(gains),
                    offset: (gains >> 24) as u8 as i8,
                    read_index: index,
                    read_subindex: 0,
                });
            }
        }
        Ok(mappings)
    }

    fn mapping_word<I: CanInterface>(
        &mut self,
        io: &mut CanIo<I>,
        node: NodeId,
        index: u16,
        sub: u8,
    ) -> Result<Option<u32>, GatewayError> {
        match io.request_and_wait(node, index, sub, MAPPING_PROBE_TIMEOUT_MS) {
            None => Err(GatewayError::RxTimeout),
            Some(frame) => match decode_response(&frame) {
                SdoResponse::UploadExpedited { value, .. } => Ok(Some(value)),
                SdoResponse::Abort { .. } => Ok(None),
                _ => Err(GatewayError::InvalidFrame),
            },
        }
    }

    /// Writes a new mapping entry. All three words must be accepted.
    pub fn add_can_mapping<I: CanInterface>(
        &mut self,
        io: &mut CanIo<I>,
        request: &MappingRequest,
    ) -> Result<(), GatewayError> {
        let node = self.node_id.ok_or(GatewayError::SessionBusy)?;
        if request.position > 63 || !(1..=32).contains(&request.length) {
            return Err(GatewayError::BadInput("mapping position or length out of range"));
        }
        let index = request.direction.write_index();
        let words = [
            u32::from(request.cob_id),
            request.param_id & 0xFFFF
                | (u32::from(request.position) << 16)
                | (u32::from(request.length) << 24),
            pack_gain(request.gain) | (u32::from(request.offset as u8) << 24),
        ];
        for (sub, value) in words.iter().enumerate() {
            match io.write_and_wait(node, index, sub as u8, *value, DEVICE_COMMAND_TIMEOUT_MS) {
                SdoWriteResult::Ok => {}
                SdoWriteResult::Abort(code) => return Err(GatewayError::SdoAbort(code)),
                SdoWriteResult::Timeout => return Err(GatewayError::RxTimeout),
            }
        }
        Ok(())
    }

    /// Removes the entry behind a read-side index. `Ok(false)` means the
    /// device knows no such mapping.
    pub fn remove_can_mapping<I: CanInterface>(
        &mut self,
        io: &mut CanIo<I>,
        read_index: u16,
    ) -> Result<bool, GatewayError> {
        let node = self.node_id.ok_or(GatewayError::SessionBusy)?;
        match io.write_and_wait(node, read_index, 0, 0, DEVICE_COMMAND_TIMEOUT_MS) {
            SdoWriteResult::Ok => Ok(true),
            SdoWriteResult::Abort(_) => Ok(false),
            SdoWriteResult::Timeout => Err(GatewayError::RxTimeout),
        }
    }

    /// Deletes every mapping of one direction, returning how many were
    /// removed. The device aborts the write once the direction is empty.
    pub fn clear_can_mappings<I: CanInterface>(
        &mut self,
        io: &mut CanIo<I>,
        direction: MappingDirection,
    ) -> Result<u32, GatewayError> {
        let node = self.node_id.ok_or(GatewayError::SessionBusy)?;
        let mut removed = 0;
        for _ in 0..MAPPING_WALK_LIMIT {
            match io.write_and_wait(node, direction.read_base(), 0, 0, DEVICE_COMMAND_TIMEOUT_MS) {
                SdoWriteResult::Ok => removed += 1,
                SdoWriteResult::Abort(_) => return Ok(removed),
                SdoWriteResult::Timeout => return Err(GatewayError::RxTimeout),
            }
        }
        Ok(removed)
    }

    // --- Error log ---

    /// Reads the device error log. Entries stop at the first missing row.
    pub fn read_error_log<I: CanInterface>(&mut self, io: &mut CanIo<I>) -> Vec<ErrorLogEntry> {
        let Some(node) = self.node_id else {
            return Vec::new();
        };
        let tick_ms = self
            .schema
            .as_ref()
            .map(ParamSchema::uptime_tick_ms)
            .unwrap_or(10);
        let mut entries = Vec::new();
        for sub in 0..=254u8 {
            let Some(time) =
                io.request_value(node, ERROR_TIME_INDEX, sub, ERROR_LOG_PROBE_TIMEOUT_MS)
            else {
                break;
            };
            let Some(error) =
                io.request_value(node, ERROR_NUM_INDEX, sub, ERROR_LOG_PROBE_TIMEOUT_MS)
            else {
                break;
            };
            if time == 0 && error == 0 {
                break;
            }
            let error = error as u32;
            let description = self
                .schema
                .as_ref()
                .and_then(|s| s.lasterr_text(error))
                .map(str::to_string)
                .unwrap_or_else(|| format!("Error {}", error));
            entries.push(ErrorLogEntry {
                time_ms: u64::from(time as u32) * tick_ms,
                error,
                description,
            });
        }
        entries
    }
}

fn from_node(frame: &CanFrame, node: NodeId) -> bool {
    frame.id & 0x7F == u16::from(node)
}

/// Gain is stored as a signed 24-bit integer in thousandths.
fn pack_gain(gain: f64) -> u32 {
    let raw = (gain * 1000.0).round().clamp(-8_388_608.0, 8_388_607.0) as i32;
    (raw as u32) & 0x00FF_FFFF
}

fn unpack_gain(word: u32) -> f64 {
    let raw = ((word << 8) as i32) >> 8;
    f64::from(raw) / 1000.0
}
