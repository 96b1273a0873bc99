//! SocketCAN implementation of the gateway's CAN interface, plus
//! file-backed persistence for the registry and settings.
//!
//! Bit rate and transceiver pins are interface properties on Linux
//! (configured with `ip link` before the gateway starts), so
//! [`CanSettings`] is accepted but only the acceptance filter is applied
//! here.

pub mod storage;

use canbridge_rs::types::{COB_BOOT_RESPONSE, COB_SDO_RESPONSE};
use canbridge_rs::{AcceptanceFilter, CanInterface, CanSettings, GatewayError};
use log::{info, warn};
use socketcan::{CanFilter, CanSocket, EmbeddedFrame, Id, Socket, SocketOptions, StandardId};

pub use storage::{FileConfigStorage, FileRegistryStorage};

pub struct SocketcanInterface {
    socket: CanSocket,
    interface_name: String,
}

impl SocketcanInterface {
    /// Opens the named interface in non-blocking mode.
    pub fn open(interface_name: &str) -> Result<Self, GatewayError> {
        let socket = CanSocket::open(interface_name).map_err(|e| {
            warn!("cannot open {}: {}", interface_name, e);
            GatewayError::Io("cannot open CAN interface")
        })?;
        socket
            .set_nonblocking(true)
            .map_err(|_| GatewayError::Io("cannot switch CAN socket to non-blocking"))?;
        info!("SocketCAN interface {} opened", interface_name);
        Ok(SocketcanInterface {
            socket,
            interface_name: interface_name.to_string(),
        })
    }

    pub fn interface_name(&self) -> &str {
        &self.interface_name
    }

    fn apply_filter(&mut self, filter: AcceptanceFilter) -> Result<(), GatewayError> {
        let filters = match filter {
            AcceptanceFilter::Scanning => [
                CanFilter::new(u32::from(COB_BOOT_RESPONSE), 0x7FF),
                CanFilter::new(u32::from(COB_SDO_RESPONSE), 0x780),
            ],
            AcceptanceFilter::Device(node) => [
                CanFilter::new(u32::from(COB_BOOT_RESPONSE), 0x7FF),
                CanFilter::new(u32::from(COB_SDO_RESPONSE) | u32::from(node), 0x7FF),
            ],
        };
        self.socket
            .set_filters(&filters)
            .map_err(|_| GatewayError::Io("cannot install CAN acceptance filter"))
    }
}

impl CanInterface for SocketcanInterface {
    fn configure(
        &mut self,
        settings: &CanSettings,
        filter: AcceptanceFilter,
    ) -> Result<(), GatewayError> {
        // The kernel owns bit timing on Linux; flag a mismatch rather than
        // silently running at the wrong rate.
        info!(
            "{} expected at {} bit/s (set via ip link)",
            self.interface_name,
            settings.baud.bits_per_second()
        );
        self.apply_filter(filter)
    }

    fn set_filter(&mut self, filter: AcceptanceFilter) -> Result<(), GatewayError> {
        self.apply_filter(filter)
    }

    fn send(&mut self, frame: &canbridge_rs::CanFrame) -> Result<(), GatewayError> {
        let id = StandardId::new(frame.id).ok_or(GatewayError::InvalidFrame)?;
        let frame = socketcan::CanFrame::new(id, frame.data()).ok_or(GatewayError::InvalidFrame)?;
        self.socket
            .write_frame(&frame)
            .map_err(|_| GatewayError::Io("CAN frame not written"))
    }

    fn try_receive(&mut self) -> Result<Option<canbridge_rs::CanFrame>, GatewayError> {
        match self.socket.read_frame() {
            Ok(frame) => {
                let Id::Standard(id) = frame.id() else {
                    // Extended identifiers never belong to this protocol.
                    return Ok(None);
                };
                let frame = canbridge_rs::CanFrame::new(id.as_raw(), frame.data())
                    .map_err(|_| GatewayError::InvalidFrame)?;
                Ok(Some(frame))
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => {
                warn!("CAN read failed on {}: {}", self.interface_name, e);
                Err(GatewayError::Io("CAN read failed"))
            }
        }
    }
}
