//! Shared test doubles: a scriptable CAN interface and in-memory storage.

use crate::discovery::{DeviceRecord, RegistryStorage};
use crate::frame::CanFrame;
use crate::hal::{AcceptanceFilter, CanInterface, CanSettings, GatewayError};
use crate::types::NodeId;
use std::collections::{BTreeMap, VecDeque};

type Responder = Box<dyn FnMut(&CanFrame) -> Vec<CanFrame> + Send>;

/// A CAN interface whose bus is a script: frames can be queued for receive
/// directly, or produced by a responder closure invoked on every send.
pub struct MockCan {
    pub sent: Vec<CanFrame>,
    pub rx: VecDeque<CanFrame>,
    pub configure_calls: Vec<AcceptanceFilter>,
    pub filter_calls: Vec<AcceptanceFilter>,
    pub fail_send: bool,
    responder: Option<Responder>,
}

impl MockCan {
    pub fn new() -> Self {
        MockCan {
            sent: Vec::new(),
            rx: VecDeque::new(),
            configure_calls: Vec::new(),
            filter_calls: Vec::new(),
            fail_send: false,
            responder: None,
        }
    }

    pub fn push_rx(&mut self, frame: CanFrame) {
        self.rx.push_back(frame);
    }

    pub fn respond_with<F>(&mut self, responder: F)
    where
        F: FnMut(&CanFrame) -> Vec<CanFrame> + Send + 'static,
    {
        self.responder = Some(Box::new(responder));
    }

    /// The last filter installed, via either configure or set_filter.
    pub fn active_filter(&self) -> Option<AcceptanceFilter> {
        self.filter_calls
            .last()
            .or(self.configure_calls.last())
            .copied()
    }
}

impl CanInterface for MockCan {
    fn configure(
        &mut self,
        _settings: &CanSettings,
        filter: AcceptanceFilter,
    ) -> Result<(), GatewayError> {
        self.configure_calls.push(filter);
        self.filter_calls.push(filter);
        Ok(())
    }

    fn set_filter(&mut self, filter: AcceptanceFilter) -> Result<(), GatewayError> {
        self.filter_calls.push(filter);
        Ok(())
    }

    fn send(&mut self, frame: &CanFrame) -> Result<(), GatewayError> {
        if self.fail_send {
            return Err(GatewayError::Io("mock send failure"));
        }
        self.sent.push(*frame);
        if let Some(responder) = self.responder.as_mut() {
            for reply in responder(frame) {
                self.rx.push_back(reply);
            }
        }
        Ok(())
    }

    fn try_receive(&mut self) -> Result<Option<CanFrame>, GatewayError> {
        Ok(self.rx.pop_front())
    }
}

/// Builds an expedited upload response from `node` for `index:sub`.
pub fn expedited_upload(node: NodeId, index: u16, sub: u8, value: u32) -> CanFrame {
    let mut data = [0u8; 8];
    data[0] = 0x43;
    data[1..3].copy_from_slice(&index.to_le_bytes());
    data[3] = sub;
    data[4..8].copy_from_slice(&value.to_le_bytes());
    CanFrame::new(0x580 | u16::from(node), &data).unwrap()
}

/// Builds a download confirmation from `node`.
pub fn download_ack(node: NodeId, index: u16, sub: u8) -> CanFrame {
    let mut data = [0u8; 8];
    data[0] = 0x60;
    data[1..3].copy_from_slice(&index.to_le_bytes());
    data[3] = sub;
    CanFrame::new(0x580 | u16::from(node), &data).unwrap()
}

/// Builds an abort response from `node`.
pub fn sdo_abort(node: NodeId, index: u16, sub: u8, code: u32) -> CanFrame {
    let mut data = [0u8; 8];
    data[0] = 0x80;
    data[1..3].copy_from_slice(&index.to_le_bytes());
    data[3] = sub;
    data[4..8].copy_from_slice(&code.to_le_bytes());
    CanFrame::new(0x580 | u16::from(node), &data).unwrap()
}

/// In-memory registry store, recording how often it was saved.
#[derive(Default)]
pub struct MemoryRegistry {
    pub devices: BTreeMap<String, DeviceRecord>,
    pub schemas: BTreeMap<u32, Vec<u8>>,
    pub saves: u32,
}

impl RegistryStorage for MemoryRegistry {
    fn load(&mut self) -> Result<BTreeMap<String, DeviceRecord>, GatewayError> {
        Ok(self.devices.clone())
    }

    fn save(&mut self, devices: &BTreeMap<String, DeviceRecord>) -> Result<(), GatewayError> {
        self.devices = devices.clone();
        self.saves += 1;
        Ok(())
    }

    fn load_schema(&mut self, key: u32) -> Result<Option<Vec<u8>>, GatewayError> {
        Ok(self.schemas.get(&key).cloned())
    }

    fn store_schema(&mut self, key: u32, document: &[u8]) -> Result<(), GatewayError> {
        self.schemas.insert(key, document.to_vec());
        Ok(())
    }
}
