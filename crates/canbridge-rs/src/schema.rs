// crates/canbridge-rs/src/schema.rs

//! The device-provided parameter document and the mapping between
//! parameter ids and SDO addresses.
//!
//! Devices publish a JSON object keyed by parameter name; each entry
//! carries at least a unit string and, for addressable parameters, a
//! numeric id. Unit strings of the form `0=None,1=Overvoltage` are enum
//! label maps; the `lasterr` parameter's map labels the device error log.

use crate::hal::GatewayError;
use serde_json::Value;
use std::collections::BTreeMap;

/// Base SDO index parameters are addressed under.
pub const PARAM_INDEX_BASE: u16 = 0x2100;

/// Maps a parameter id to the SDO `(index, sub)` it is read and written at.
pub fn param_sdo_address(id: u32) -> (u16, u8) {
    (PARAM_INDEX_BASE + (id >> 8) as u16, (id & 0xFF) as u8)
}

/// The inverse of [`param_sdo_address`], used to attribute responses.
pub fn param_id_from_address(index: u16, sub: u8) -> Option<u32> {
    let offset = index.checked_sub(PARAM_INDEX_BASE)?;
    if offset > 0xFF {
        return None;
    }
    Some((u32::from(offset) << 8) | u32::from(sub))
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamInfo {
    /// Absent for display-only entries; those cannot be read over the bus.
    pub id: Option<u32>,
    pub unit: String,
    pub value: Option<f64>,
    /// Present when the unit string encodes an enum label map.
    pub enums: Option<BTreeMap<u32, String>>,
}

/// Parsed parameter document, plus the raw JSON it came from so the
/// transport can hand the original to clients.
#[derive(Debug, Clone, Default)]
pub struct ParamSchema {
    params: BTreeMap<String, ParamInfo>,
    raw: Value,
}

impl ParamSchema {
    pub fn parse(document: &[u8]) -> Result<Self, GatewayError> {
        let raw: Value = serde_json::from_slice(document)
            .map_err(|_| GatewayError::BadInput("parameter document is not valid JSON"))?;
        let object = raw
            .as_object()
            .ok_or(GatewayError::BadInput("parameter document is not an object"))?;

        let mut params = BTreeMap::new();
        for (name, attrs) in object {
            let unit = attrs
                .get("unit")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let info = ParamInfo {
                id: attrs.get("id").and_then(Value::as_u64).map(|id| id as u32),
                value: attrs.get("value").and_then(Value::as_f64),
                enums: parse_enum_unit(&unit),
                unit,
            };
            params.insert(name.clone(), info);
        }
        Ok(ParamSchema { params, raw })
    }

    pub fn raw(&self) -> &Value {
        &self.raw
    }

    pub fn get(&self, name: &str) -> Option<&ParamInfo> {
        self.params.get(name)
    }

    pub fn params(&self) -> &BTreeMap<String, ParamInfo> {
        &self.params
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn name_for_id(&self, id: u32) -> Option<&str> {
        self.params
            .iter()
            .find(|(_, info)| info.id == Some(id))
            .map(|(name, _)| name.as_str())
    }

    pub fn id_for_name(&self, name: &str) -> Option<u32> {
        self.params.get(name).and_then(|info| info.id)
    }

    /// Checks that a parameter id exists in this document.
    pub fn knows_id(&self, id: u32) -> bool {
        self.params.values().any(|info| info.id == Some(id))
    }

    /// Label for an error-log entry, from the `lasterr` enum map.
    pub fn lasterr_text(&self, error: u32) -> Option<&str> {
        self.params
            .get("lasterr")
            .and_then(|info| info.enums.as_ref())
            .and_then(|map| map.get(&error))
            .map(String::as_str)
    }

    /// Error-log tick length: devices whose `uptime` counts seconds stamp
    /// log entries in seconds, all others in 10 ms ticks.
    pub fn uptime_tick_ms(&self) -> u64 {
        match self.params.get("uptime").map(|info| info.unit.as_str()) {
            Some("sec") | Some("s") => 1000,
            _ => 10,
        }
    }
}

fn parse_enum_unit(unit: &str) -> Option<BTreeMap<u32, String>> {
    if !unit.contains('=') {
        return None;
    }
    let mut map = BTreeMap::new();
    for entry in unit.split(',') {
        let (num, label) = entry.split_once('=')?;
        let num = num.trim().parse::<u32>().ok()?;
        map.insert(num, label.trim().to_string());
    }
    Some(map)
}
