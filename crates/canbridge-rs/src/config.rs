// crates/canbridge-rs/src/config.rs

use crate::hal::{CanSettings, GatewayError};
use crate::types::{BaudRate, MAX_NODE_ID, MIN_NODE_ID};
use serde::{Deserialize, Serialize};

/// Schema tag for the persisted settings blob. Bumped when keys change.
pub const SETTINGS_VERSION: u32 = 1;

/// Persisted gateway configuration. Field names match the keys used by the
/// settings endpoint and the on-disk store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    pub version: u32,
    #[serde(rename = "canRXPin")]
    pub can_rx_pin: u8,
    #[serde(rename = "canTXPin")]
    pub can_tx_pin: u8,
    /// 0 disables the transceiver enable line.
    #[serde(rename = "canEnablePin")]
    pub can_enable_pin: u8,
    /// 0 = 125k, 1 = 250k, 2 = 500k.
    #[serde(rename = "canSpeed")]
    pub can_speed: u8,
    #[serde(rename = "scanStartNode")]
    pub scan_start_node: u8,
    #[serde(rename = "scanEndNode")]
    pub scan_end_node: u8,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        GatewaySettings {
            version: SETTINGS_VERSION,
            can_rx_pin: 4,
            can_tx_pin: 5,
            can_enable_pin: 0,
            can_speed: BaudRate::B500k.setting(),
            scan_start_node: 1,
            scan_end_node: 32,
        }
    }
}

impl GatewaySettings {
    pub fn baud(&self) -> BaudRate {
        BaudRate::from_setting(self.can_speed).unwrap_or_default()
    }

    pub fn can_settings(&self) -> CanSettings {
        CanSettings {
            baud: self.baud(),
            tx_pin: self.can_tx_pin,
            rx_pin: self.can_rx_pin,
            enable_pin: self.can_enable_pin,
        }
    }

    /// Clamps out-of-range values back into their documented domains.
    pub fn normalized(mut self) -> Self {
        if BaudRate::from_setting(self.can_speed).is_none() {
            self.can_speed = BaudRate::default().setting();
        }
        self.scan_start_node = self.scan_start_node.clamp(MIN_NODE_ID, MAX_NODE_ID);
        self.scan_end_node = self.scan_end_node.clamp(self.scan_start_node, MAX_NODE_ID);
        self.version = SETTINGS_VERSION;
        self
    }
}

/// Persistence backend for [`GatewaySettings`].
pub trait ConfigStorage {
    fn load(&mut self) -> Result<GatewaySettings, GatewayError>;
    fn save(&mut self, settings: &GatewaySettings) -> Result<(), GatewayError>;
}
