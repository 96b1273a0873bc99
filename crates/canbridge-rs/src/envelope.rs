// crates/canbridge-rs/src/envelope.rs

//! The public wire vocabulary: events become `{"event": tag, "data": {..}}`
//! envelopes, inbound `{"action": tag, "data": {..}}` messages become typed
//! commands. Both mappings are exhaustive; anything else is rejected.

use crate::command::{Command, Event};
use crate::hal::GatewayError;
use crate::interval::CanIoConfig;
use crate::locks::ClientId;
use crate::session::{MappingDirection, MappingRequest};
use crate::types::NodeId;
use serde_json::{Map, Value, json};

/// The envelope tag for an event.
pub fn event_tag(event: &Event) -> &'static str {
    match event {
        Event::DeviceDiscovered { .. } => "deviceDiscovered",
        Event::ScanStatus { .. } => "scanStatus",
        Event::ScanProgress { .. } => "scanProgress",
        Event::Connected { .. } => "connected",
        Event::Disconnected => "disconnected",
        Event::NodeIdInfo { .. } => "nodeIdInfo",
        Event::NodeIdSet { .. } => "nodeIdSet",
        Event::SpotValuesStatus { .. } => "spotValuesStatus",
        Event::SpotValues { .. } => "spotValues",
        Event::DeviceNameSet { .. } => "deviceNameSet",
        Event::DeviceDeleted { .. } => "deviceDeleted",
        Event::DeviceRenamed { .. } => "deviceRenamed",
        Event::DeviceUnlocked { .. } => "deviceUnlocked",
        Event::CanMessageSent { .. } => "canMessageSent",
        Event::CanIntervalStatus { .. } => "canIntervalStatus",
        Event::CanIoIntervalStatus { .. } => "canIoIntervalStatus",
        Event::CanMappingsData { .. } => "canMappingsData",
        Event::CanMappingAdded { .. } => "canMappingAdded",
        Event::CanMappingRemoved { .. } => "canMappingRemoved",
        Event::ParamSchemaData { .. } => "paramSchemaData",
        Event::ParamSchemaError { .. } => "paramSchemaError",
        Event::ParamValuesData { .. } => "paramValuesData",
        Event::ParamValuesError { .. } => "paramValuesError",
        Event::ParamUpdate { error: None, .. } => "paramUpdateSuccess",
        Event::ParamUpdate { error: Some(_), .. } => "paramUpdateError",
        Event::ParamsReloaded => "paramsReloaded",
        Event::ParamsError { .. } => "paramsError",
        Event::DeviceReset { error: None } => "deviceReset",
        Event::DeviceReset { error: Some(_) } => "deviceResetError",
        Event::SaveToFlash { error: None } => "saveToFlashSuccess",
        Event::SaveToFlash { error: Some(_) } => "saveToFlashError",
        Event::LoadFromFlash { error: None } => "loadFromFlashSuccess",
        Event::LoadFromFlash { error: Some(_) } => "loadFromFlashError",
        Event::LoadDefaults { error: None } => "loadDefaultsSuccess",
        Event::LoadDefaults { error: Some(_) } => "loadDefaultsError",
        Event::StartDevice { error: None } => "startDeviceSuccess",
        Event::StartDevice { error: Some(_) } => "startDeviceError",
        Event::StopDevice { error: None } => "stopDeviceSuccess",
        Event::StopDevice { error: Some(_) } => "stopDeviceError",
        Event::ListErrorsSuccess { .. } => "listErrorsSuccess",
        Event::JsonProgress { .. } => "jsonProgress",
        Event::OtaProgress { .. } => "otaProgress",
        Event::OtaSuccess => "otaSuccess",
        Event::OtaError { .. } => "otaError",
        Event::Error { .. } => "error",
    }
}

/// Serializes one event into its public envelope.
pub fn to_envelope(event: &Event) -> Value {
    let data = match event {
        Event::DeviceDiscovered {
            node,
            serial,
            name,
            last_seen,
        } => json!({
            "nodeId": node,
            "serial": serial,
            "name": name,
            "lastSeen": last_seen,
        }),
        Event::ScanStatus { active } => json!({ "active": active }),
        Event::ScanProgress {
            current_node,
            start_node,
            end_node,
        } => json!({
            "currentNode": current_node,
            "startNode": start_node,
            "endNode": end_node,
        }),
        Event::Connected { node, serial } => json!({ "nodeId": node, "serial": serial }),
        Event::Disconnected => json!({}),
        Event::NodeIdInfo { id, speed } => json!({ "id": id, "speed": speed }),
        Event::NodeIdSet { id, success } => json!({ "id": id, "success": success }),
        Event::SpotValuesStatus { active } => json!({ "active": active }),
        Event::SpotValues { values } => {
            let mut map = Map::new();
            for (id, value) in values {
                map.insert(id.to_string(), json!(value));
            }
            json!({ "values": map })
        }
        Event::DeviceNameSet { serial, success } => {
            json!({ "serial": serial, "success": success })
        }
        Event::DeviceDeleted { serial, success } => {
            json!({ "serial": serial, "success": success })
        }
        Event::DeviceRenamed { serial, success } => {
            json!({ "serial": serial, "success": success })
        }
        Event::DeviceUnlocked { node } => json!({ "nodeId": node }),
        Event::CanMessageSent { success } => json!({ "success": success }),
        Event::CanIntervalStatus { id, active } => json!({ "id": id, "active": active }),
        Event::CanIoIntervalStatus { active } => json!({ "active": active }),
        Event::CanMappingsData { mappings } => {
            json!({ "mappings": serde_json::to_value(mappings).unwrap_or(Value::Null) })
        }
        Event::CanMappingAdded { success } => json!({ "success": success }),
        Event::CanMappingRemoved { success } => json!({ "success": success }),
        Event::ParamSchemaData { schema } => json!({ "schema": schema }),
        Event::ParamSchemaError { message } => json!({ "error": message }),
        Event::ParamValuesData { values } => {
            json!({ "values": serde_json::to_value(values).unwrap_or(Value::Null) })
        }
        Event::ParamValuesError { message } => json!({ "error": message }),
        Event::ParamUpdate {
            param_id,
            value,
            error,
        } => match error {
            None => json!({ "paramId": param_id, "value": value }),
            Some(text) => json!({ "paramId": param_id, "value": value, "error": text }),
        },
        Event::ParamsReloaded => json!({}),
        Event::ParamsError { message } => json!({ "error": message }),
        Event::DeviceReset { error }
        | Event::SaveToFlash { error }
        | Event::LoadFromFlash { error }
        | Event::LoadDefaults { error }
        | Event::StartDevice { error }
        | Event::StopDevice { error } => match error {
            None => json!({}),
            Some(text) => json!({ "error": text }),
        },
        Event::ListErrorsSuccess { errors } => {
            json!({ "errors": serde_json::to_value(errors).unwrap_or(Value::Null) })
        }
        Event::JsonProgress { percent } => json!({ "progress": percent }),
        Event::OtaProgress { percent } => json!({ "progress": percent }),
        Event::OtaSuccess => json!({}),
        Event::OtaError { message } => json!({ "error": message }),
        Event::Error {
            message,
            kind,
            node,
            serial,
        } => {
            let mut map = Map::new();
            map.insert("message".to_string(), json!(message));
            if let Some(kind) = kind {
                map.insert("type".to_string(), json!(kind));
            }
            if let Some(node) = node {
                map.insert("nodeId".to_string(), json!(node));
            }
            if let Some(serial) = serial {
                map.insert("serial".to_string(), json!(serial));
            }
            Value::Object(map)
        }
    };
    json!({ "event": event_tag(event), "data": data })
}

// --- Inbound action parsing ---

fn field<'a>(data: &'a Value, key: &'static str) -> Result<&'a Value, GatewayError> {
    let value = data.get(key).ok_or(GatewayError::BadInput("missing field"))?;
    Ok(value)
}

fn u64_field(data: &Value, key: &'static str) -> Result<u64, GatewayError> {
    field(data, key)?
        .as_u64()
        .ok_or(GatewayError::BadInput("expected unsigned integer"))
}

fn node_field(data: &Value, key: &'static str) -> Result<NodeId, GatewayError> {
    let raw = u64_field(data, key)?;
    let node = NodeId::try_from(raw).map_err(|_| GatewayError::BadInput("node id out of range"))?;
    if !crate::types::valid_node_id(node) {
        return Err(GatewayError::BadInput("node id out of range"));
    }
    Ok(node)
}

fn str_field<'a>(data: &'a Value, key: &'static str) -> Result<&'a str, GatewayError> {
    field(data, key)?
        .as_str()
        .ok_or(GatewayError::BadInput("expected string"))
}

fn f64_field(data: &Value, key: &'static str) -> Result<f64, GatewayError> {
    field(data, key)?
        .as_f64()
        .ok_or(GatewayError::BadInput("expected number"))
}

fn bytes_field(data: &Value, key: &'static str) -> Result<Vec<u8>, GatewayError> {
    field(data, key)?
        .as_array()
        .ok_or(GatewayError::BadInput("expected byte array"))?
        .iter()
        .map(|v| {
            v.as_u64()
                .and_then(|b| u8::try_from(b).ok())
                .ok_or(GatewayError::BadInput("byte out of range"))
        })
        .collect()
}

fn cob_field(data: &Value, key: &'static str) -> Result<u16, GatewayError> {
    let raw = u64_field(data, key)?;
    if raw > u64::from(crate::frame::MAX_STANDARD_ID) {
        return Err(GatewayError::BadInput("identifier out of range"));
    }
    Ok(raw as u16)
}

fn canio_config(data: &Value) -> Result<CanIoConfig, GatewayError> {
    Ok(CanIoConfig {
        pot: u64_field(data, "pot")? as u16,
        pot2: u64_field(data, "pot2")? as u16,
        canio: u64_field(data, "canio")? as u8,
        cruisespeed: u64_field(data, "cruisespeed")? as u16,
        regenpreset: u64_field(data, "regenpreset")? as u8,
        use_crc: data.get("useCrc").and_then(Value::as_bool).unwrap_or(false),
    })
}

/// Parses one inbound text message into a command attributed to `client`.
pub fn parse_action(client: ClientId, text: &str) -> Result<Command, GatewayError> {
    let message: Value =
        serde_json::from_str(text).map_err(|_| GatewayError::BadInput("not valid JSON"))?;
    let action = message
        .get("action")
        .and_then(Value::as_str)
        .ok_or(GatewayError::BadInput("missing action"))?;
    let data = message.get("data").cloned().unwrap_or(Value::Null);

    let command = match action {
        "startScan" => Command::StartScan {
            start: node_field(&data, "startNode")?,
            end: node_field(&data, "endNode")?,
        },
        "stopScan" => Command::StopScan,
        "connect" => Command::Connect {
            client,
            node: node_field(&data, "nodeId")?,
        },
        "disconnect" => Command::Disconnect { client },
        "setDeviceName" => Command::SetDeviceName {
            serial: str_field(&data, "serial")?.to_string(),
            name: str_field(&data, "name")?.to_string(),
        },
        "deleteDevice" => Command::DeleteDevice {
            serial: str_field(&data, "serial")?.to_string(),
        },
        "renameDevice" => Command::RenameDevice {
            serial: str_field(&data, "serial")?.to_string(),
            name: str_field(&data, "name")?.to_string(),
        },
        "getNodeId" => Command::GetNodeId { client },
        "setNodeId" => Command::SetNodeId {
            client,
            node: node_field(&data, "nodeId")?,
        },
        "startSpotValues" => Command::StartSpotValues {
            client,
            param_ids: field(&data, "paramIds")?
                .as_array()
                .ok_or(GatewayError::BadInput("expected id array"))?
                .iter()
                .map(|v| {
                    v.as_u64()
                        .map(|id| id as u32)
                        .ok_or(GatewayError::BadInput("expected numeric parameter id"))
                })
                .collect::<Result<_, _>>()?,
            interval_ms: u64_field(&data, "interval")?,
        },
        "stopSpotValues" => Command::StopSpotValues { client },
        "updateParam" => Command::UpdateParam {
            client,
            param_id: u64_field(&data, "paramId")? as u32,
            value: f64_field(&data, "value")?,
        },
        "getParamSchema" => Command::GetParamSchema { client },
        "getParamValues" => Command::GetParamValues { client },
        "reloadParams" => Command::ReloadParams { client },
        "resetDevice" => Command::ResetDevice { client },
        "getCanMappings" => Command::GetCanMappings { client },
        "addCanMapping" => Command::AddCanMapping {
            client,
            mapping: MappingRequest {
                direction: match str_field(&data, "direction")? {
                    "tx" => MappingDirection::Tx,
                    "rx" => MappingDirection::Rx,
                    _ => return Err(GatewayError::BadInput("direction must be tx or rx")),
                },
                cob_id: cob_field(&data, "cobId")?,
                param_id: u64_field(&data, "paramId")? as u32,
                position: u64_field(&data, "position")? as u8,
                length: u64_field(&data, "length")? as u8,
                gain: f64_field(&data, "gain")?,
                offset: f64_field(&data, "offset")? as i8,
            },
        },
        "removeCanMapping" => Command::RemoveCanMapping {
            client,
            read_index: u64_field(&data, "readIndex")? as u16,
        },
        "saveToFlash" => Command::SaveToFlash { client },
        "loadFromFlash" => Command::LoadFromFlash { client },
        "loadDefaults" => Command::LoadDefaults { client },
        "startDevice" => Command::StartDevice { client },
        "stopDevice" => Command::StopDevice { client },
        "listErrors" => Command::ListErrors { client },
        "sendCanMessage" => Command::SendCanMessage {
            client,
            id: cob_field(&data, "id")?,
            data: bytes_field(&data, "data")?,
        },
        "startCanInterval" => Command::StartCanInterval {
            id: str_field(&data, "id")?.to_string(),
            cob_id: cob_field(&data, "cobId")?,
            data: bytes_field(&data, "data")?,
            interval_ms: u64_field(&data, "interval")?,
        },
        "stopCanInterval" => Command::StopCanInterval {
            id: str_field(&data, "id")?.to_string(),
        },
        "startCanIoInterval" => Command::StartCanIoInterval {
            cob_id: cob_field(&data, "cobId")?,
            interval_ms: u64_field(&data, "interval")?,
            config: canio_config(&data)?,
        },
        "stopCanIoInterval" => Command::StopCanIoInterval,
        "updateCanIoFlags" => Command::UpdateCanIoFlags {
            config: canio_config(&data)?,
        },
        _ => return Err(GatewayError::BadInput("unknown action")),
    };
    Ok(command)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn envelope_shape_is_event_plus_data() {
        let value = to_envelope(&Event::ScanStatus { active: true });
        assert_eq!(value["event"], "scanStatus");
        assert_eq!(value["data"]["active"], true);
    }

    #[test]
    fn success_error_pairs_split_by_flag() {
        assert_eq!(event_tag(&Event::SaveToFlash { error: None }), "saveToFlashSuccess");
        let busy = Some("Device is busy".to_string());
        assert_eq!(
            event_tag(&Event::SaveToFlash { error: busy.clone() }),
            "saveToFlashError"
        );
        assert_eq!(event_tag(&Event::DeviceReset { error: None }), "deviceReset");
        assert_eq!(
            event_tag(&Event::DeviceReset { error: busy }),
            "deviceResetError"
        );
        assert_eq!(
            event_tag(&Event::ParamUpdate {
                param_id: 1,
                value: 0.0,
                error: None
            }),
            "paramUpdateSuccess"
        );
        assert_eq!(
            event_tag(&Event::ParamUpdate {
                param_id: 1,
                value: 0.0,
                error: Some("Value out of range".into())
            }),
            "paramUpdateError"
        );
    }

    #[test]
    fn param_update_error_carries_id_value_and_text() {
        let value = to_envelope(&Event::ParamUpdate {
            param_id: 0x1234,
            value: 7.5,
            error: Some("Value out of range".into()),
        });
        assert_eq!(value["event"], "paramUpdateError");
        assert_eq!(value["data"]["paramId"], 0x1234);
        assert_eq!(value["data"]["value"], 7.5);
        assert_eq!(value["data"]["error"], "Value out of range");
    }

    #[test]
    fn spot_values_are_keyed_by_id_string() {
        let mut values = BTreeMap::new();
        values.insert(100u32, 1.5);
        values.insert(200u32, -3.0);
        let value = to_envelope(&Event::SpotValues { values });
        assert_eq!(value["data"]["values"]["100"], 1.5);
        assert_eq!(value["data"]["values"]["200"], -3.0);
    }

    #[test]
    fn locked_error_carries_type_node_and_serial() {
        let value = to_envelope(&Event::device_locked(7, Some("AAAA".into())));
        assert_eq!(value["event"], "error");
        assert_eq!(value["data"]["type"], "device_locked");
        assert_eq!(value["data"]["nodeId"], 7);
        assert_eq!(value["data"]["serial"], "AAAA");
    }

    #[test]
    fn parses_connect() {
        let command =
            parse_action(3, r#"{"action": "connect", "data": {"nodeId": 7}}"#).unwrap();
        assert_eq!(command, Command::Connect { client: 3, node: 7 });
    }

    #[test]
    fn parses_start_spot_values() {
        let command = parse_action(
            1,
            r#"{"action": "startSpotValues", "data": {"paramIds": [100, 200], "interval": 1000}}"#,
        )
        .unwrap();
        assert_eq!(
            command,
            Command::StartSpotValues {
                client: 1,
                param_ids: vec![100, 200],
                interval_ms: 1000
            }
        );
    }

    #[test]
    fn parses_add_can_mapping() {
        let command = parse_action(
            1,
            r#"{"action": "addCanMapping", "data": {"direction": "rx", "cobId": 287,
                "paramId": 17, "position": 8, "length": 16, "gain": -0.5, "offset": 3}}"#,
        )
        .unwrap();
        match command {
            Command::AddCanMapping { mapping, .. } => {
                assert_eq!(mapping.direction, MappingDirection::Rx);
                assert_eq!(mapping.cob_id, 287);
                assert_eq!(mapping.gain, -0.5);
                assert_eq!(mapping.offset, 3);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn parses_send_can_message_bytes() {
        let command = parse_action(
            1,
            r#"{"action": "sendCanMessage", "data": {"id": 291, "data": [1, 2, 255]}}"#,
        )
        .unwrap();
        assert_eq!(
            command,
            Command::SendCanMessage {
                client: 1,
                id: 291,
                data: vec![1, 2, 255]
            }
        );
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(parse_action(1, "not json").is_err());
        assert!(parse_action(1, r#"{"data": {}}"#).is_err());
        assert!(parse_action(1, r#"{"action": "selfDestruct"}"#).is_err());
        assert!(parse_action(1, r#"{"action": "connect", "data": {"nodeId": 0}}"#).is_err());
        assert!(parse_action(1, r#"{"action": "connect", "data": {"nodeId": 柒}}"#).is_err());
        assert!(
            parse_action(1, r#"{"action": "sendCanMessage", "data": {"id": 5000, "data": []}}"#)
                .is_err()
        );
    }

    #[test]
    fn every_action_in_the_vocabulary_parses() {
        let cases = [
            r#"{"action": "startScan", "data": {"startNode": 1, "endNode": 3}}"#,
            r#"{"action": "stopScan"}"#,
            r#"{"action": "connect", "data": {"nodeId": 7}}"#,
            r#"{"action": "disconnect"}"#,
            r#"{"action": "setDeviceName", "data": {"serial": "A", "name": "n"}}"#,
            r#"{"action": "deleteDevice", "data": {"serial": "A"}}"#,
            r#"{"action": "renameDevice", "data": {"serial": "A", "name": "n"}}"#,
            r#"{"action": "getNodeId"}"#,
            r#"{"action": "setNodeId", "data": {"nodeId": 9}}"#,
            r#"{"action": "startSpotValues", "data": {"paramIds": [1], "interval": 500}}"#,
            r#"{"action": "stopSpotValues"}"#,
            r#"{"action": "updateParam", "data": {"paramId": 1, "value": 2.5}}"#,
            r#"{"action": "getParamSchema"}"#,
            r#"{"action": "getParamValues"}"#,
            r#"{"action": "reloadParams"}"#,
            r#"{"action": "resetDevice"}"#,
            r#"{"action": "getCanMappings"}"#,
            r#"{"action": "addCanMapping", "data": {"direction": "tx", "cobId": 1,
                "paramId": 1, "position": 0, "length": 8, "gain": 1.0, "offset": 0}}"#,
            r#"{"action": "removeCanMapping", "data": {"readIndex": 12544}}"#,
            r#"{"action": "saveToFlash"}"#,
            r#"{"action": "loadFromFlash"}"#,
            r#"{"action": "loadDefaults"}"#,
            r#"{"action": "startDevice"}"#,
            r#"{"action": "stopDevice"}"#,
            r#"{"action": "listErrors"}"#,
            r#"{"action": "sendCanMessage", "data": {"id": 1, "data": []}}"#,
            r#"{"action": "startCanInterval", "data": {"id": "x", "cobId": 1, "data": [0], "interval": 100}}"#,
            r#"{"action": "stopCanInterval", "data": {"id": "x"}}"#,
            r#"{"action": "startCanIoInterval", "data": {"cobId": 63, "interval": 100,
                "pot": 0, "pot2": 0, "canio": 0, "cruisespeed": 0, "regenpreset": 0, "useCrc": true}}"#,
            r#"{"action": "stopCanIoInterval"}"#,
            r#"{"action": "updateCanIoFlags", "data": {"pot": 1, "pot2": 2, "canio": 3,
                "cruisespeed": 4, "regenpreset": 5}}"#,
        ];
        for case in cases {
            assert!(parse_action(1, case).is_ok(), "failed to parse {case}");
        }
    }
}
