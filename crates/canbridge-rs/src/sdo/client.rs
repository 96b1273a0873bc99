// crates/canbridge-rs/src/sdo/client.rs

//! Client-side SDO operations, implemented directly on the I/O layer so
//! waiting callers keep the transmit and receive paths moving.

use super::frame::{
    SdoResponse, decode_response, expedited_i32, read_request, segment_request, write_request,
};
use crate::clock;
use crate::frame::CanFrame;
use crate::hal::CanInterface;
use crate::io::CanIo;
use crate::types::NodeId;
use log::warn;
use std::time::{Duration, Instant};

/// Outcome of a write-and-wait exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdoWriteResult {
    /// The device confirmed the download.
    Ok,
    /// The device rejected the write with this abort code.
    Abort(u32),
    /// No response arrived before the deadline.
    Timeout,
}

impl<I: CanInterface> CanIo<I> {
    /// Fire-and-forget read of `index:sub`. A full transmit queue is logged
    /// and the request dropped; periodic callers retry on their own cadence.
    pub fn request_element(&mut self, node: NodeId, index: u16, sub: u8) {
        if self.tx_submit(read_request(node, index, sub)).is_err() {
            warn!(
                "dropping read request for {:#06X}:{} to node {}: transmit queue full",
                index, sub, node
            );
        }
    }

    /// Like [`CanIo::request_element`] but reports whether the request was
    /// queued, so callers can keep the work item for the next iteration.
    pub fn request_element_nonblocking(&mut self, node: NodeId, index: u16, sub: u8) -> bool {
        self.tx_submit(read_request(node, index, sub)).is_ok()
    }

    /// Fire-and-forget expedited write.
    pub fn set_value(&mut self, node: NodeId, index: u16, sub: u8, value: u32) {
        if self.tx_submit(write_request(node, index, sub, value)).is_err() {
            warn!(
                "dropping write to {:#06X}:{} on node {}: transmit queue full",
                index, sub, node
            );
        }
    }

    /// Waits until the SDO response queue yields a frame or the deadline
    /// passes, pumping the bus in between. `None` means timeout; an abort
    /// still yields the frame so callers can inspect the code.
    pub fn wait_for_response(&mut self, timeout_ms: u64) -> Option<CanFrame> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            self.pump(clock::now_us());
            if let Some(frame) = self.sdo_recv() {
                return Some(frame);
            }
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Clears pending responses, writes `value` and inspects the reply.
    pub fn write_and_wait(
        &mut self,
        node: NodeId,
        index: u16,
        sub: u8,
        value: u32,
        timeout_ms: u64,
    ) -> SdoWriteResult {
        self.sdo_clear_pending();
        if self.tx_submit(write_request(node, index, sub, value)).is_err() {
            warn!("write to {:#06X}:{} not sent: transmit queue full", index, sub);
            return SdoWriteResult::Timeout;
        }
        match self.wait_for_response(timeout_ms) {
            None => SdoWriteResult::Timeout,
            Some(frame) => match decode_response(&frame) {
                SdoResponse::Abort { code, .. } => SdoWriteResult::Abort(code),
                _ => SdoWriteResult::Ok,
            },
        }
    }

    /// Clears pending responses, requests `index:sub` and returns the raw
    /// response frame.
    pub fn request_and_wait(
        &mut self,
        node: NodeId,
        index: u16,
        sub: u8,
        timeout_ms: u64,
    ) -> Option<CanFrame> {
        self.sdo_clear_pending();
        if self.tx_submit(read_request(node, index, sub)).is_err() {
            warn!("read of {:#06X}:{} not sent: transmit queue full", index, sub);
            return None;
        }
        self.wait_for_response(timeout_ms)
    }

    /// Convenience wrapper extracting the signed 32-bit payload of an
    /// expedited read. Aborts and timeouts both come back as `None`.
    pub fn request_value(
        &mut self,
        node: NodeId,
        index: u16,
        sub: u8,
        timeout_ms: u64,
    ) -> Option<i32> {
        self.request_and_wait(node, index, sub, timeout_ms)
            .as_ref()
            .and_then(expedited_i32)
    }

    /// Requests the next upload segment with the given toggle.
    pub fn request_segment(&mut self, node: NodeId, toggle: bool) {
        if self.tx_submit(segment_request(node, toggle)).is_err() {
            warn!("segment request to node {} not sent: transmit queue full", node);
        }
    }
}
