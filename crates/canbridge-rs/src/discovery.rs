// crates/canbridge-rs/src/discovery.rs

//! Bus discovery: the continuous scan cursor, the one-shot scan, and the
//! registry of devices seen on this bus.

use crate::hal::{CanInterface, GatewayError};
use crate::io::CanIo;
use crate::sdo::frame::{SdoResponse, decode_response};
use crate::session::SERIAL_INDEX;
use crate::types::{NodeId, SerialNumber};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Spacing between continuous-scan probes.
pub const SCAN_DELAY_MS: u64 = 50;
const PROBE_TIMEOUT_MS: u64 = 100;

/// One registry row. `last_seen` is a monotonic millisecond stamp, an
/// ordering key rather than a wall-clock time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub name: String,
    #[serde(rename = "nodeId")]
    pub node_id: NodeId,
    #[serde(rename = "lastSeen")]
    pub last_seen: u64,
}

/// Persistence backend for the device registry and the per-device schema
/// cache (keyed by the fourth serial word).
pub trait RegistryStorage {
    fn load(&mut self) -> Result<BTreeMap<String, DeviceRecord>, GatewayError>;
    fn save(&mut self, devices: &BTreeMap<String, DeviceRecord>) -> Result<(), GatewayError>;
    fn load_schema(&mut self, key: u32) -> Result<Option<Vec<u8>>, GatewayError>;
    fn store_schema(&mut self, key: u32, document: &[u8]) -> Result<(), GatewayError>;
}

/// Known devices, keyed by serial string. The in-memory map is the source
/// of truth at runtime; mutations write through to storage, passive
/// heartbeats update memory only.
pub struct DeviceRegistry<S: RegistryStorage> {
    devices: BTreeMap<String, DeviceRecord>,
    storage: S,
}

impl<S: RegistryStorage> DeviceRegistry<S> {
    pub fn new(mut storage: S) -> Self {
        let devices = match storage.load() {
            Ok(devices) => devices,
            Err(e) => {
                warn!("device registry unreadable, starting empty: {}", e);
                BTreeMap::new()
            }
        };
        DeviceRegistry { devices, storage }
    }

    pub fn devices(&self) -> &BTreeMap<String, DeviceRecord> {
        &self.devices
    }

    pub fn get(&self, serial: &str) -> Option<&DeviceRecord> {
        self.devices.get(serial)
    }

    /// Looks a device up by its current node id.
    pub fn by_node(&self, node: NodeId) -> Option<(&str, &DeviceRecord)> {
        self.devices
            .iter()
            .find(|(_, record)| record.node_id == node)
            .map(|(serial, record)| (serial.as_str(), record))
    }

    /// Records a device sighting with a known serial. New devices get their
    /// serial as the initial display name. Returns the resulting record.
    pub fn upsert(&mut self, serial: &SerialNumber, node: NodeId, now_ms: u64) -> DeviceRecord {
        let key = serial.to_string();
        let record = self
            .devices
            .entry(key.clone())
            .or_insert_with(|| DeviceRecord {
                name: key.clone(),
                node_id: node,
                last_seen: now_ms,
            });
        record.node_id = node;
        record.last_seen = now_ms;
        let record = record.clone();
        self.persist();
        record
    }

    /// Updates `last_seen` for whichever device currently answers at
    /// `node`. Memory only; the write-through happens on real mutations.
    pub fn heartbeat(&mut self, node: NodeId, now_ms: u64) {
        if let Some(record) = self
            .devices
            .values_mut()
            .find(|record| record.node_id == node)
        {
            record.last_seen = now_ms;
        }
    }

    pub fn set_name(&mut self, serial: &str, name: &str) -> bool {
        match self.devices.get_mut(serial) {
            Some(record) => {
                record.name = name.to_string();
                self.persist();
                true
            }
            None => false,
        }
    }

    pub fn rename(&mut self, serial: &str, name: &str) -> bool {
        self.set_name(serial, name)
    }

    pub fn delete(&mut self, serial: &str) -> bool {
        let removed = self.devices.remove(serial).is_some();
        if removed {
            self.persist();
        }
        removed
    }

    fn persist(&mut self) {
        if let Err(e) = self.storage.save(&self.devices) {
            warn!("device registry not persisted: {}", e);
        }
    }

    pub fn load_schema(&mut self, key: u32) -> Option<Vec<u8>> {
        match self.storage.load_schema(key) {
            Ok(document) => document,
            Err(e) => {
                warn!("schema cache unreadable for {:x}: {}", key, e);
                None
            }
        }
    }

    pub fn store_schema(&mut self, key: u32, document: &[u8]) {
        if let Err(e) = self.storage.store_schema(key, document) {
            warn!("schema cache not written for {:x}: {}", key, e);
        }
    }
}

/// Continuous-scan progress notes.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanEvent {
    /// Probing moved on to this node.
    Progress { node: NodeId },
    /// A device answered all four serial probes.
    Discovered { node: NodeId, serial: SerialNumber },
}

/// Cursor of the continuous scan. One serial-part probe per tick; a failed
/// probe moves to the next node with the part counter reset.
pub struct ScanCursor {
    active: bool,
    start_node: NodeId,
    end_node: NodeId,
    current_node: NodeId,
    serial_part: u8,
    partial_serial: [u32; 4],
    last_probe_us: u64,
    announced_node: Option<NodeId>,
}

impl Default for ScanCursor {
    fn default() -> Self {
        Self::new()
    }
}

impl ScanCursor {
    pub fn new() -> Self {
        ScanCursor {
            active: false,
            start_node: 1,
            end_node: 1,
            current_node: 1,
            serial_part: 0,
            partial_serial: [0; 4],
            last_probe_us: 0,
            announced_node: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn current_node(&self) -> NodeId {
        self.current_node
    }

    pub fn serial_part(&self) -> u8 {
        self.serial_part
    }

    pub fn range(&self) -> (NodeId, NodeId) {
        (self.start_node, self.end_node)
    }

    pub fn start(&mut self, start_node: NodeId, end_node: NodeId) {
        self.active = true;
        self.start_node = start_node;
        self.end_node = end_node.max(start_node);
        self.current_node = start_node;
        self.serial_part = 0;
        self.partial_serial = [0; 4];
        self.last_probe_us = 0;
        self.announced_node = None;
        info!("continuous scan started, nodes {}..={}", start_node, self.end_node);
    }

    pub fn stop(&mut self) {
        if self.active {
            info!("continuous scan stopped");
        }
        self.active = false;
    }

    /// Runs at most one probe. Returns progress notes for the dispatcher.
    pub fn advance<I: CanInterface>(
        &mut self,
        io: &mut CanIo<I>,
        now_us: u64,
    ) -> Vec<ScanEvent> {
        let mut events = Vec::new();
        if !self.active {
            return events;
        }
        if now_us.saturating_sub(self.last_probe_us) < SCAN_DELAY_MS * 1000 {
            return events;
        }
        self.last_probe_us = now_us;

        if self.announced_node != Some(self.current_node) {
            self.announced_node = Some(self.current_node);
            events.push(ScanEvent::Progress {
                node: self.current_node,
            });
        }

        match probe_serial_part(io, self.current_node, self.serial_part) {
            Some(word) => {
                self.partial_serial[usize::from(self.serial_part)] = word;
                if self.serial_part == 3 {
                    let serial = SerialNumber(self.partial_serial);
                    info!("scan discovered node {} ({})", self.current_node, serial);
                    events.push(ScanEvent::Discovered {
                        node: self.current_node,
                        serial,
                    });
                    self.next_node();
                } else {
                    self.serial_part += 1;
                }
            }
            None => {
                debug!(
                    "node {} silent at serial part {}",
                    self.current_node, self.serial_part
                );
                self.next_node();
            }
        }
        events
    }

    /// Advances to the next node, wrapping at the end of the range. The
    /// part counter is always zero right after a node change.
    fn next_node(&mut self) {
        self.serial_part = 0;
        self.partial_serial = [0; 4];
        self.current_node = if self.current_node >= self.end_node {
            self.start_node
        } else {
            self.current_node + 1
        };
    }
}

/// One-shot sweep of `[start, end]`: four serial probes per node, 100 ms
/// each. The caller restores filters and session state afterwards.
pub fn scan_bus<I: CanInterface>(
    io: &mut CanIo<I>,
    start: NodeId,
    end: NodeId,
) -> Vec<(NodeId, SerialNumber)> {
    let mut found = Vec::new();
    for node in start..=end.max(start) {
        let mut words = [0u32; 4];
        let mut complete = true;
        for part in 0..4u8 {
            match probe_serial_part(io, node, part) {
                Some(word) => words[usize::from(part)] = word,
                None => {
                    complete = false;
                    break;
                }
            }
        }
        if complete {
            found.push((node, SerialNumber(words)));
        }
    }
    found
}

/// Requests one serial word and waits for a matching answer. Aborts, wrong
/// identifiers and timeouts all count as failed probes.
fn probe_serial_part<I: CanInterface>(
    io: &mut CanIo<I>,
    node: NodeId,
    part: u8,
) -> Option<u32> {
    io.sdo_clear_pending();
    if !io.request_element_nonblocking(node, SERIAL_INDEX, part) {
        return None;
    }
    let frame = io.wait_for_response(PROBE_TIMEOUT_MS)?;
    if frame.id & 0x7F != u16::from(node) {
        return None;
    }
    match decode_response(&frame) {
        SdoResponse::UploadExpedited { index, sub, value }
            if index == SERIAL_INDEX && sub == part =>
        {
            Some(value)
        }
        _ => None,
    }
}
