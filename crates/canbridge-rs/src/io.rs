// crates/canbridge-rs/src/io.rs

//! CAN I/O layer. Owns the sole transceiver handle, the transmit queue and
//! the typed receive queues the rest of the core drains.
//!
//! The receive path fans out by identifier class: SDO responses land in the
//! SDO queue (and note a heartbeat for the source node, throttled), frames
//! from the bootloader land in their own queue, everything else is dropped.

use crate::frame::{CanFrame, FrameClass, classify};
use crate::hal::{AcceptanceFilter, CanInterface, CanSettings, GatewayError};
use crate::types::NodeId;
use log::{trace, warn};
use std::collections::{BTreeMap, VecDeque};

/// Transmit queue depth.
pub const TX_QUEUE_CAPACITY: usize = 20;
/// SDO response queue depth.
pub const SDO_QUEUE_CAPACITY: usize = 10;
/// Bootloader response queue depth.
pub const BOOT_QUEUE_CAPACITY: usize = 4;

/// Minimum spacing between heartbeat notes for the same node.
const HEARTBEAT_THROTTLE_MS: u64 = 1000;

pub struct CanIo<I: CanInterface> {
    iface: I,
    filter: AcceptanceFilter,
    tx: VecDeque<CanFrame>,
    sdo: VecDeque<CanFrame>,
    boot: VecDeque<CanFrame>,
    /// `(node, stamp_ms)` pairs drained by the dispatcher.
    seen: Vec<(NodeId, u64)>,
    last_seen_note_ms: BTreeMap<NodeId, u64>,
}

impl<I: CanInterface> CanIo<I> {
    pub fn new(iface: I) -> Self {
        CanIo {
            iface,
            filter: AcceptanceFilter::Scanning,
            tx: VecDeque::with_capacity(TX_QUEUE_CAPACITY),
            sdo: VecDeque::with_capacity(SDO_QUEUE_CAPACITY),
            boot: VecDeque::with_capacity(BOOT_QUEUE_CAPACITY),
            seen: Vec::new(),
            last_seen_note_ms: BTreeMap::new(),
        }
    }

    /// Brings the bus up with the wide filter used while probing for
    /// devices: the whole SDO response range plus the bootloader id.
    pub fn init_for_scanning(&mut self, settings: &CanSettings) -> Result<(), GatewayError> {
        self.filter = AcceptanceFilter::Scanning;
        self.sdo.clear();
        self.iface.configure(settings, self.filter)
    }

    /// Brings the bus up admitting only `0x580 | node` and the bootloader id.
    pub fn init_for_device(
        &mut self,
        node: NodeId,
        settings: &CanSettings,
    ) -> Result<(), GatewayError> {
        self.filter = AcceptanceFilter::Device(node);
        self.sdo.clear();
        self.iface.configure(settings, self.filter)
    }

    /// Reinstalls the scanning filter without reinitialising the bus.
    pub fn reset_to_scanning_mode(&mut self) -> Result<(), GatewayError> {
        self.filter = AcceptanceFilter::Scanning;
        self.iface.set_filter(self.filter)
    }

    pub fn filter(&self) -> AcceptanceFilter {
        self.filter
    }

    /// Non-blocking enqueue onto the transmit queue.
    pub fn tx_submit(&mut self, frame: CanFrame) -> Result<(), GatewayError> {
        if self.tx.len() >= TX_QUEUE_CAPACITY {
            return Err(GatewayError::TxQueueFull);
        }
        self.tx.push_back(frame);
        Ok(())
    }

    pub fn tx_space(&self) -> usize {
        TX_QUEUE_CAPACITY - self.tx.len()
    }

    /// Pops the oldest pending SDO response, if any.
    pub fn sdo_recv(&mut self) -> Option<CanFrame> {
        self.sdo.pop_front()
    }

    /// Drains the SDO response queue. Called before every request/response
    /// pair to bound the window in which a stale response could be taken
    /// for the current one.
    pub fn sdo_clear_pending(&mut self) {
        self.sdo.clear();
    }

    pub fn take_bootloader_frame(&mut self) -> Option<CanFrame> {
        self.boot.pop_front()
    }

    /// Hands out the heartbeat notes collected since the last call.
    pub fn take_seen_nodes(&mut self) -> Vec<(NodeId, u64)> {
        core::mem::take(&mut self.seen)
    }

    pub fn interface(&self) -> &I {
        &self.iface
    }

    pub fn interface_mut(&mut self) -> &mut I {
        &mut self.iface
    }

    /// One cooperative I/O round: drain the transmit queue to the hardware
    /// in submission order, then poll and route every pending receive frame.
    pub fn pump(&mut self, now_us: u64) {
        while let Some(frame) = self.tx.front() {
            match self.iface.send(frame) {
                Ok(()) => {
                    self.tx.pop_front();
                }
                Err(e) => {
                    warn!("CAN send failed, keeping {} queued frames: {}", self.tx.len(), e);
                    break;
                }
            }
        }

        loop {
            match self.iface.try_receive() {
                Ok(Some(frame)) => self.route(frame, now_us),
                Ok(None) => break,
                Err(e) => {
                    warn!("CAN receive failed: {}", e);
                    break;
                }
            }
        }
    }

    fn route(&mut self, frame: CanFrame, now_us: u64) {
        match classify(frame.id) {
            FrameClass::Bootloader => {
                if self.boot.len() >= BOOT_QUEUE_CAPACITY {
                    warn!("bootloader queue full, dropping oldest frame");
                    self.boot.pop_front();
                }
                self.boot.push_back(frame);
            }
            FrameClass::SdoResponse(node) => {
                if !self.filter.admits(frame.id) {
                    trace!("dropping SDO response from node {} (filtered)", node);
                    return;
                }
                self.note_heartbeat(node, now_us / 1000);
                if self.sdo.len() >= SDO_QUEUE_CAPACITY {
                    warn!("SDO response queue full, dropping oldest frame");
                    self.sdo.pop_front();
                }
                self.sdo.push_back(frame);
            }
            FrameClass::Other => {
                trace!("discarding frame with id {:#05X}", frame.id);
            }
        }
    }

    fn note_heartbeat(&mut self, node: NodeId, now_ms: u64) {
        let due = match self.last_seen_note_ms.get(&node) {
            Some(last) => now_ms.saturating_sub(*last) >= HEARTBEAT_THROTTLE_MS,
            None => true,
        };
        if due {
            self.last_seen_note_ms.insert(node, now_ms);
            self.seen.push((node, now_ms));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockCan;

    fn io_in_scanning_mode() -> CanIo<MockCan> {
        let mut io = CanIo::new(MockCan::new());
        io.init_for_scanning(&crate::config::GatewaySettings::default().can_settings())
            .unwrap();
        io
    }

    #[test]
    fn tx_queue_rejects_when_full() {
        let mut io = io_in_scanning_mode();
        let frame = CanFrame::new(0x100, &[1]).unwrap();
        for _ in 0..TX_QUEUE_CAPACITY {
            io.tx_submit(frame).unwrap();
        }
        assert_eq!(io.tx_submit(frame), Err(GatewayError::TxQueueFull));
        assert_eq!(io.tx_space(), 0);
    }

    #[test]
    fn pump_preserves_tx_submission_order() {
        let mut io = io_in_scanning_mode();
        for i in 0..5u8 {
            io.tx_submit(CanFrame::new(0x100 + u16::from(i), &[i]).unwrap())
                .unwrap();
        }
        io.pump(0);
        let sent: Vec<u16> = io.interface().sent.iter().map(|f| f.id).collect();
        assert_eq!(sent, vec![0x100, 0x101, 0x102, 0x103, 0x104]);
    }

    #[test]
    fn rx_routes_by_identifier_class() {
        let mut io = io_in_scanning_mode();
        let mock = io.interface_mut();
        mock.push_rx(CanFrame::new(0x7DE, &[b'S']).unwrap());
        mock.push_rx(CanFrame::new(0x582, &[0x43, 0, 0x50, 0, 1, 0, 0, 0]).unwrap());
        mock.push_rx(CanFrame::new(0x181, &[0xFF]).unwrap());
        io.pump(0);

        assert_eq!(io.take_bootloader_frame().unwrap().id, 0x7DE);
        assert_eq!(io.sdo_recv().unwrap().id, 0x582);
        assert!(io.sdo_recv().is_none());
    }

    #[test]
    fn device_filter_drops_responses_from_other_nodes() {
        let mut io = CanIo::new(MockCan::new());
        io.init_for_device(7, &crate::config::GatewaySettings::default().can_settings())
            .unwrap();
        let mock = io.interface_mut();
        mock.push_rx(CanFrame::new(0x587, &[0x60, 0, 0, 0, 0, 0, 0, 0]).unwrap());
        mock.push_rx(CanFrame::new(0x588, &[0x60, 0, 0, 0, 0, 0, 0, 0]).unwrap());
        io.pump(0);
        assert_eq!(io.sdo_recv().unwrap().id, 0x587);
        assert!(io.sdo_recv().is_none());
    }

    #[test]
    fn heartbeats_are_throttled_per_node() {
        let mut io = io_in_scanning_mode();
        for tick in 0..3u64 {
            io.interface_mut()
                .push_rx(CanFrame::new(0x585, &[0x60, 0, 0, 0, 0, 0, 0, 0]).unwrap());
            io.pump(tick * 100_000); // 100 ms apart
        }
        assert_eq!(io.take_seen_nodes(), vec![(5, 0)]);

        io.interface_mut()
            .push_rx(CanFrame::new(0x585, &[0x60, 0, 0, 0, 0, 0, 0, 0]).unwrap());
        io.pump(1_500_000); // 1.5 s, past the throttle window
        assert_eq!(io.take_seen_nodes(), vec![(5, 1500)]);
    }

    #[test]
    fn clear_pending_empties_the_sdo_queue() {
        let mut io = io_in_scanning_mode();
        io.interface_mut()
            .push_rx(CanFrame::new(0x581, &[0x60, 0, 0, 0, 0, 0, 0, 0]).unwrap());
        io.pump(0);
        io.sdo_clear_pending();
        assert!(io.sdo_recv().is_none());
    }
}
