//! JSON message schema and multi-part assembly for the NDSI sockets.
//!
//! Every message starts with the sensor UUID part (UTF-8 bytes of the
//! hyphenated UUID string):
//!
//! - data:         `[uuid][header][payload]`
//! - notification: `[uuid][UpdateControlMessage json]`
//! - command:      `[uuid][SensorCommand json]`

use super::header::FrameHeader;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Value carried by a control.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ControlValue {
    Int(i64),
    Bool(bool),
    Str(String),
}

/// Declared type of a control's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::AsRefStr)]
pub enum ValueType {
    #[strum(serialize = "integer")]
    Integer,
    #[strum(serialize = "bool")]
    Boolean,
    #[strum(serialize = "string")]
    String,
}

impl ControlValue {
    pub fn value_type(&self) -> ValueType {
        match self {
            ControlValue::Int(_) => ValueType::Integer,
            ControlValue::Bool(_) => ValueType::Boolean,
            ControlValue::Str(_) => ValueType::String,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            ControlValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ControlValue::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<i64> for ControlValue {
    fn from(value: i64) -> Self {
        ControlValue::Int(value)
    }
}

impl From<i32> for ControlValue {
    fn from(value: i32) -> Self {
        ControlValue::Int(value.into())
    }
}

impl From<u32> for ControlValue {
    fn from(value: u32) -> Self {
        ControlValue::Int(value.into())
    }
}

impl From<bool> for ControlValue {
    fn from(value: bool) -> Self {
        ControlValue::Bool(value)
    }
}

impl From<&str> for ControlValue {
    fn from(value: &str) -> Self {
        ControlValue::Str(value.to_string())
    }
}

impl From<String> for ControlValue {
    fn from(value: String) -> Self {
        ControlValue::Str(value)
    }
}

/// One entry of an enumerated control's option list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ControlEnumOption {
    pub idx: i64,
    pub label: String,
}

/// Descriptive change record for a control, as produced by its getter.
///
/// Only the populated fields are serialized. `res` and `def` keep the short
/// names NDSI subscribers look up.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ControlChanges {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<ControlValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<i64>,
    #[serde(rename = "res", skip_serializing_if = "Option::is_none")]
    pub resolution: Option<i64>,
    #[serde(rename = "def", skip_serializing_if = "Option::is_none")]
    pub default: Option<ControlValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dtype: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub readonly: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub map: Option<Vec<ControlEnumOption>>,
}

/// Body of a notification socket message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpdateControlMessage {
    pub subject: &'static str,
    pub control_id: String,
    pub seq: u64,
    pub changes: ControlChanges,
}

impl UpdateControlMessage {
    pub fn update(control_id: impl Into<String>, seq: u64, changes: ControlChanges) -> Self {
        Self {
            subject: "update",
            control_id: control_id.into(),
            seq,
            changes,
        }
    }
}

/// Attach descriptor handed to the discovery collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorAttach {
    #[serde(rename = "sensor_name")]
    pub name: String,
    #[serde(rename = "sensor_uuid")]
    pub uuid: String,
    #[serde(rename = "sensor_type")]
    pub sensor_type: String,
    #[serde(rename = "notify_endpoint")]
    pub notification_url: String,
    #[serde(rename = "command_endpoint")]
    pub command_url: String,
    #[serde(rename = "data_endpoint")]
    pub data_url: String,
}

/// Raw command body as it arrives on the wire.
#[derive(Debug, Deserialize)]
struct RawCommand {
    action: String,
    #[serde(default)]
    control_id: Option<String>,
    #[serde(default)]
    value: Option<serde_json::Value>,
}

/// Value of a `set_control_value` command, decoded from its JSON type.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandValue {
    Int(i64),
    Bool(bool),
    Str(String),
    Null,
    Unknown(&'static str),
}

impl From<Option<serde_json::Value>> for CommandValue {
    fn from(value: Option<serde_json::Value>) -> Self {
        use serde_json::Value;

        match value {
            None | Some(Value::Null) => CommandValue::Null,
            Some(Value::Bool(b)) => CommandValue::Bool(b),
            Some(Value::String(s)) => CommandValue::Str(s),
            Some(Value::Number(n)) => match n.as_i64() {
                Some(i) => CommandValue::Int(i),
                None if n.is_u64() => CommandValue::Unknown("integer out of range"),
                None => CommandValue::Unknown("float"),
            },
            Some(Value::Array(_)) => CommandValue::Unknown("array"),
            Some(Value::Object(_)) => CommandValue::Unknown("object"),
        }
    }
}

/// A decoded, validated command.
#[derive(Debug, Clone, PartialEq)]
pub enum SensorCommand {
    RefreshControls,
    SetControlValue {
        control_id: String,
        value: ControlValue,
    },
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("expected [uuid][json] command, got {0} part(s)")]
    MissingParts(usize),

    #[error("malformed command json: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unknown command action '{0}'")]
    UnknownAction(String),

    #[error("set_control_value without control_id")]
    MissingControlId,

    #[error("set_control_value for '{0}' without a value")]
    MissingValue(String),

    #[error("set_control_value for '{control_id}' with unsupported {kind} value")]
    UnsupportedValue {
        control_id: String,
        kind: &'static str,
    },
}

impl SensorCommand {
    /// Decode a command JSON body. Unknown actions and ill-typed values are
    /// rejected here so nothing ambiguous reaches the control registry.
    pub fn parse(body: &[u8]) -> Result<Self, CommandError> {
        let raw: RawCommand = serde_json::from_slice(body)?;

        match raw.action.as_str() {
            "refresh_controls" => Ok(SensorCommand::RefreshControls),
            "set_control_value" => {
                let control_id = raw.control_id.ok_or(CommandError::MissingControlId)?;
                let value = match CommandValue::from(raw.value) {
                    CommandValue::Int(i) => ControlValue::Int(i),
                    CommandValue::Bool(b) => ControlValue::Bool(b),
                    CommandValue::Str(s) => ControlValue::Str(s),
                    CommandValue::Null => return Err(CommandError::MissingValue(control_id)),
                    CommandValue::Unknown(kind) => {
                        return Err(CommandError::UnsupportedValue { control_id, kind });
                    }
                };
                Ok(SensorCommand::SetControlValue { control_id, value })
            }
            _ => Err(CommandError::UnknownAction(raw.action)),
        }
    }

    /// Decode a received multi-part command message.
    pub fn from_parts(parts: &[Bytes]) -> Result<Self, CommandError> {
        match parts {
            [_uuid, body, ..] => Self::parse(body),
            _ => Err(CommandError::MissingParts(parts.len())),
        }
    }
}

pub fn frame_message(uuid: &str, header: &FrameHeader, payload: Bytes) -> Vec<Bytes> {
    vec![
        Bytes::copy_from_slice(uuid.as_bytes()),
        Bytes::copy_from_slice(&header.encode()),
        payload,
    ]
}

pub fn notification_message(
    uuid: &str,
    message: &UpdateControlMessage,
) -> serde_json::Result<Vec<Bytes>> {
    Ok(vec![
        Bytes::copy_from_slice(uuid.as_bytes()),
        Bytes::from(serde_json::to_vec(message)?),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ndsi::header::{FLAG_ALL, HEADER_LEN};

    #[test]
    fn test_parse_set_control_value_dispatches_on_json_type() {
        let int = SensorCommand::parse(
            br#"{"action":"set_control_value","control_id":"exposure_time","value":500}"#,
        )
        .unwrap();
        assert_eq!(
            int,
            SensorCommand::SetControlValue {
                control_id: "exposure_time".into(),
                value: ControlValue::Int(500),
            }
        );

        let boolean = SensorCommand::parse(
            br#"{"action":"set_control_value","control_id":"auto_exposure","value":false}"#,
        )
        .unwrap();
        assert!(matches!(
            boolean,
            SensorCommand::SetControlValue { value: ControlValue::Bool(false), .. }
        ));

        let string = SensorCommand::parse(
            br#"{"action":"set_control_value","control_id":"name","value":"near"}"#,
        )
        .unwrap();
        assert!(matches!(
            string,
            SensorCommand::SetControlValue { value: ControlValue::Str(ref s), .. } if s == "near"
        ));
    }

    #[test]
    fn test_parse_refresh_controls() {
        assert_eq!(
            SensorCommand::parse(br#"{"action":"refresh_controls"}"#).unwrap(),
            SensorCommand::RefreshControls
        );
    }

    #[test]
    fn test_parse_rejects_bad_commands() {
        assert!(matches!(
            SensorCommand::parse(br#"{"action":"set_control_value","value":1}"#),
            Err(CommandError::MissingControlId)
        ));
        assert!(matches!(
            SensorCommand::parse(br#"{"action":"set_control_value","control_id":"x","value":null}"#),
            Err(CommandError::MissingValue(_))
        ));
        assert!(matches!(
            SensorCommand::parse(br#"{"action":"set_control_value","control_id":"x","value":1.5}"#),
            Err(CommandError::UnsupportedValue { kind: "float", .. })
        ));
        assert!(matches!(
            SensorCommand::parse(
                br#"{"action":"set_control_value","control_id":"x","value":18446744073709551615}"#
            ),
            Err(CommandError::UnsupportedValue { kind: "integer out of range", .. })
        ));
        assert!(matches!(
            SensorCommand::parse(br#"{"action":"set_control_value","control_id":"x","value":[1]}"#),
            Err(CommandError::UnsupportedValue { kind: "array", .. })
        ));
        assert!(matches!(
            SensorCommand::parse(br#"{"action":"reboot"}"#),
            Err(CommandError::UnknownAction(_))
        ));
        assert!(matches!(
            SensorCommand::parse(b"not json"),
            Err(CommandError::Malformed(_))
        ));
    }

    #[test]
    fn test_from_parts_requires_body() {
        let parts = vec![Bytes::from_static(b"uuid")];
        assert!(matches!(
            SensorCommand::from_parts(&parts),
            Err(CommandError::MissingParts(1))
        ));
    }

    #[test]
    fn test_update_message_schema() {
        let changes = ControlChanges {
            value: Some(ControlValue::Int(300)),
            min: Some(1),
            max: Some(2000),
            resolution: Some(1),
            default: Some(ControlValue::Int(2000)),
            dtype: Some(ValueType::Integer.to_string()),
            caption: Some("Exposure time".into()),
            readonly: Some(false),
            map: None,
        };
        let msg = UpdateControlMessage::update("exposure_time", 7, changes);
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();

        assert_eq!(json["subject"], "update");
        assert_eq!(json["control_id"], "exposure_time");
        assert_eq!(json["seq"], 7);
        assert_eq!(json["changes"]["value"], 300);
        assert_eq!(json["changes"]["res"], 1);
        assert_eq!(json["changes"]["def"], 2000);
        assert_eq!(json["changes"]["dtype"], "integer");
        assert_eq!(json["changes"]["readonly"], false);
        assert!(json["changes"].get("map").is_none());
    }

    #[test]
    fn test_enum_map_serialization() {
        let changes = ControlChanges {
            value: Some(ControlValue::Int(1)),
            map: Some(vec![
                ControlEnumOption { idx: 0, label: "MODE_9_5FPS".into() },
                ControlEnumOption { idx: 1, label: "MODE_5_45FPS".into() },
            ]),
            ..Default::default()
        };
        let json = serde_json::to_value(&changes).unwrap();

        assert_eq!(json["map"][1]["idx"], 1);
        assert_eq!(json["map"][1]["label"], "MODE_5_45FPS");
    }

    #[test]
    fn test_frame_message_parts() {
        let payload = Bytes::from_static(b"abc");
        let header = FrameHeader::for_payload(FLAG_ALL, 4, 4, 0, 0.0, 0, &payload);
        let parts = frame_message("0b7d", &header, payload);

        assert_eq!(parts.len(), 3);
        assert_eq!(&parts[0][..], b"0b7d");
        assert_eq!(parts[1].len(), HEADER_LEN);
        assert_eq!(&parts[2][..], b"abc");
    }

    #[test]
    fn test_attach_descriptor_keys() {
        let attach = SensorAttach {
            name: "pico - 0005".into(),
            uuid: "u".into(),
            sensor_type: "royale_full".into(),
            notification_url: "tcp://10.0.0.2:4000".into(),
            command_url: "tcp://10.0.0.2:4001".into(),
            data_url: "tcp://10.0.0.2:4002".into(),
        };
        let json = serde_json::to_value(&attach).unwrap();

        assert_eq!(json["sensor_type"], "royale_full");
        assert_eq!(json["notify_endpoint"], "tcp://10.0.0.2:4000");
        assert_eq!(json["command_endpoint"], "tcp://10.0.0.2:4001");
        assert_eq!(json["data_endpoint"], "tcp://10.0.0.2:4002");
    }
}
