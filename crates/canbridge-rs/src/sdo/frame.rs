// crates/canbridge-rs/src/sdo/frame.rs

//! SDO wire codec.
//!
//! Requests are always sent as full 8-byte frames: command byte, little
//! endian index in bytes 1..=2, sub-index in byte 3, 32-bit little endian
//! value (or zeroes) in bytes 4..=7.

use crate::frame::CanFrame;
use crate::types::{COB_SDO_REQUEST, COB_SDO_RESPONSE, NodeId};

/// Command byte of an expedited read request.
pub const CCS_READ: u8 = 0x40;
/// Command byte of an expedited 4-byte write request.
pub const CCS_WRITE: u8 = 0x23;
/// Command byte of an abort, in either direction.
pub const CS_ABORT: u8 = 0x80;
/// Base command byte of an upload segment request; the toggle bit is bit 4.
pub const CCS_SEGMENT: u8 = 0x60;

/// SDO abort codes surfaced to clients.
pub mod abort {
    /// The index/sub-index does not exist on the device.
    pub const UNKNOWN_INDEX: u32 = 0x0602_0000;
    /// The written value is outside the parameter's range.
    pub const VALUE_RANGE: u32 = 0x0609_0030;
    /// Catch-all device-side failure.
    pub const GENERAL: u32 = 0x0800_0000;

    pub fn text(code: u32) -> &'static str {
        match code {
            UNKNOWN_INDEX => "Unknown index",
            VALUE_RANGE => "Value out of range",
            GENERAL => "General error",
            _ => "SDO abort",
        }
    }
}

pub fn request_cob(node: NodeId) -> u16 {
    COB_SDO_REQUEST | u16::from(node)
}

pub fn response_cob(node: NodeId) -> u16 {
    COB_SDO_RESPONSE | u16::from(node)
}

fn request_frame(node: NodeId, command: u8, index: u16, sub: u8, value: u32) -> CanFrame {
    let mut data = [0u8; 8];
    data[0] = command;
    data[1..3].copy_from_slice(&index.to_le_bytes());
    data[3] = sub;
    data[4..8].copy_from_slice(&value.to_le_bytes());
    // The id and length are in range by construction.
    CanFrame::new(request_cob(node), &data).unwrap()
}

/// Builds an expedited read request.
pub fn read_request(node: NodeId, index: u16, sub: u8) -> CanFrame {
    request_frame(node, CCS_READ, index, sub, 0)
}

/// Builds an expedited 4-byte write request.
pub fn write_request(node: NodeId, index: u16, sub: u8, value: u32) -> CanFrame {
    request_frame(node, CCS_WRITE, index, sub, value)
}

/// Builds the request for the next upload segment.
pub fn segment_request(node: NodeId, toggle: bool) -> CanFrame {
    let mut data = [0u8; 8];
    data[0] = CCS_SEGMENT | (u8::from(toggle) << 4);
    CanFrame::new(request_cob(node), &data).unwrap()
}

/// A decoded SDO response frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SdoResponse {
    /// Expedited upload carrying the 32-bit value in bytes 4..=7.
    UploadExpedited { index: u16, sub: u8, value: u32 },
    /// Segmented upload handshake; `size` is present when the device
    /// announced the total transfer size.
    UploadInitiate {
        index: u16,
        sub: u8,
        size: Option<u32>,
    },
    /// Confirmation of an expedited download.
    DownloadAck { index: u16, sub: u8 },
    /// One upload segment. `last` marks the final segment.
    Segment {
        toggle: bool,
        last: bool,
        data: Vec<u8>,
    },
    /// The device rejected the operation.
    Abort { index: u16, sub: u8, code: u32 },
    /// A command specifier this gateway does not use.
    Unknown,
}

/// Decodes a frame taken from the SDO response queue.
pub fn decode_response(frame: &CanFrame) -> SdoResponse {
    let d = frame.padded();
    let cmd = d[0];
    let index = u16::from_le_bytes([d[1], d[2]]);
    let sub = d[3];
    let value = u32::from_le_bytes([d[4], d[5], d[6], d[7]]);

    match cmd >> 5 {
        // Upload segment: toggle in bit 4, last in bit 0, free bytes in 3..=1.
        0 => {
            let last = cmd & 0x01 != 0;
            let len = 7 - usize::from((cmd >> 1) & 0x07);
            SdoResponse::Segment {
                toggle: cmd & 0x10 != 0,
                last,
                data: d[1..1 + len].to_vec(),
            }
        }
        2 => {
            if cmd & 0x02 != 0 {
                SdoResponse::UploadExpedited { index, sub, value }
            } else {
                SdoResponse::UploadInitiate {
                    index,
                    sub,
                    size: (cmd & 0x01 != 0).then_some(value),
                }
            }
        }
        3 => SdoResponse::DownloadAck { index, sub },
        4 => SdoResponse::Abort {
            index,
            sub,
            code: value,
        },
        _ => SdoResponse::Unknown,
    }
}

/// Extracts the signed 32-bit payload of an expedited upload, if that is
/// what the frame holds.
pub fn expedited_i32(frame: &CanFrame) -> Option<i32> {
    match decode_response(frame) {
        SdoResponse::UploadExpedited { value, .. } => Some(value as i32),
        _ => None,
    }
}
