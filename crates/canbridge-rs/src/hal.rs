// crates/canbridge-rs/src/hal.rs

use crate::frame::CanFrame;
use crate::types::{BaudRate, COB_BOOT_RESPONSE, COB_SDO_RESPONSE, COB_SDO_RESPONSE_END, NodeId};
use core::fmt;

/// Portable error type for the gateway core.
///
/// Bus-level failures are reported through events and never terminate the
/// protocol task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayError {
    /// The transmit queue has no free slot.
    TxQueueFull,
    /// No frame arrived before the deadline.
    RxTimeout,
    /// The device rejected an SDO operation with the given abort code.
    SdoAbort(u32),
    /// The command requires an idle session but the session is busy.
    SessionBusy,
    /// Another client holds the write lock for this node.
    LockConflict { node: NodeId },
    /// A state machine overran its time budget and self-recovered.
    ProtocolTimeout,
    /// Malformed input from the transport. Logged and dropped.
    BadInput(&'static str),
    /// A frame could not be constructed or is not valid on this bus.
    InvalidFrame,
    /// The underlying CAN driver reported a fault.
    Io(&'static str),
    /// The persistence backend reported a fault.
    Storage(&'static str),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TxQueueFull => write!(f, "Transmit queue is full"),
            Self::RxTimeout => write!(f, "No response from device"),
            Self::SdoAbort(code) => write!(f, "SDO transfer aborted with code {:#010X}", code),
            Self::SessionBusy => write!(f, "Device is busy"),
            Self::LockConflict { node } => write!(f, "Node {} is locked by another client", node),
            Self::ProtocolTimeout => write!(f, "Protocol state timed out"),
            Self::BadInput(s) => write!(f, "Bad input: {}", s),
            Self::InvalidFrame => write!(f, "Invalid CAN frame"),
            Self::Io(s) => write!(f, "I/O error: {}", s),
            Self::Storage(s) => write!(f, "Storage error: {}", s),
        }
    }
}

impl std::error::Error for GatewayError {}

/// Hardware acceptance filter installed on the transceiver.
///
/// The same predicate is applied in software on the receive path, so the
/// admission invariant holds even on backends whose hardware filter is
/// wider than requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AcceptanceFilter {
    /// Admits the bootloader response id and the whole SDO response range
    /// `0x580..=0x5FF` (mask on the low 7 bits).
    #[default]
    Scanning,
    /// Admits the bootloader response id and `0x580 | node` only.
    Device(NodeId),
}

impl AcceptanceFilter {
    pub fn admits(&self, id: u16) -> bool {
        if id == COB_BOOT_RESPONSE {
            return true;
        }
        match self {
            AcceptanceFilter::Scanning => {
                (COB_SDO_RESPONSE..=COB_SDO_RESPONSE_END).contains(&id)
            }
            AcceptanceFilter::Device(node) => id == COB_SDO_RESPONSE | u16::from(*node),
        }
    }
}

/// Physical bus parameters. Pin numbers are meaningful for embedded
/// transceivers; host backends may ignore them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanSettings {
    pub baud: BaudRate,
    pub tx_pin: u8,
    pub rx_pin: u8,
    pub enable_pin: u8,
}

/// Abstraction over the CAN transceiver.
///
/// The core owns exactly one implementation of this trait and is its only
/// caller; implementations do not need to be re-entrant.
pub trait CanInterface {
    /// (Re)initialises the transceiver with bus parameters and installs the
    /// given acceptance filter.
    fn configure(
        &mut self,
        settings: &CanSettings,
        filter: AcceptanceFilter,
    ) -> Result<(), GatewayError>;

    /// Swaps the acceptance filter without touching bus parameters.
    fn set_filter(&mut self, filter: AcceptanceFilter) -> Result<(), GatewayError>;

    /// Writes one frame to the bus. Frames must leave in call order.
    fn send(&mut self, frame: &CanFrame) -> Result<(), GatewayError>;

    /// Polls for one received frame without blocking.
    fn try_receive(&mut self) -> Result<Option<CanFrame>, GatewayError>;
}
