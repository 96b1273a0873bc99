// crates/canbridge-rs/src/types.rs

use core::fmt;

/// Node ids are 7-bit bus addresses.
pub type NodeId = u8;

/// Lowest assignable node id.
pub const MIN_NODE_ID: NodeId = 1;
/// Highest assignable node id.
pub const MAX_NODE_ID: NodeId = 127;

// --- Identifier classes used on the bus ---

/// SDO request identifier base (gateway to device): `0x600 | node`.
pub const COB_SDO_REQUEST: u16 = 0x600;
/// SDO response identifier base (device to gateway): `0x580 | node`.
pub const COB_SDO_RESPONSE: u16 = 0x580;
/// Upper bound (inclusive) of the SDO response identifier range.
pub const COB_SDO_RESPONSE_END: u16 = 0x5FF;
/// Bootloader command identifier (gateway to device).
pub const COB_BOOT_COMMAND: u16 = 0x7DD;
/// Bootloader response identifier (device to gateway).
pub const COB_BOOT_RESPONSE: u16 = 0x7DE;

/// Returns true for a usable device address.
pub fn valid_node_id(id: NodeId) -> bool {
    (MIN_NODE_ID..=MAX_NODE_ID).contains(&id)
}

/// Supported bus bit rates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BaudRate {
    B125k,
    B250k,
    #[default]
    B500k,
}

impl BaudRate {
    /// Maps the persisted `canSpeed` setting (0, 1 or 2) to a bit rate.
    pub fn from_setting(value: u8) -> Option<BaudRate> {
        match value {
            0 => Some(BaudRate::B125k),
            1 => Some(BaudRate::B250k),
            2 => Some(BaudRate::B500k),
            _ => None,
        }
    }

    /// The inverse of [`BaudRate::from_setting`].
    pub fn setting(&self) -> u8 {
        match self {
            BaudRate::B125k => 0,
            BaudRate::B250k => 1,
            BaudRate::B500k => 2,
        }
    }

    pub fn bits_per_second(&self) -> u32 {
        match self {
            BaudRate::B125k => 125_000,
            BaudRate::B250k => 250_000,
            BaudRate::B500k => 500_000,
        }
    }
}

/// 128-bit device serial number, read as four 32-bit words.
///
/// The fourth word doubles as the key of the cached parameter document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SerialNumber(pub [u32; 4]);

impl SerialNumber {
    /// Word used to key the per-device schema cache.
    pub fn cache_key(&self) -> u32 {
        self.0[3]
    }
}

impl fmt::Display for SerialNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:08X}-{:08X}-{:08X}-{:08X}",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}
