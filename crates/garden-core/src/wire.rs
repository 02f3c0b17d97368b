use crate::model::{
    deserialize_id, deserialize_reading_value, DeviceMode, SwitchState, ThresholdDirection,
    Thresholds,
};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;

/// Inbound event names as emitted by the garden server.
pub mod events {
    pub const TEMPERATURE_UPDATE: &str = "temperature_update";
    pub const TEMPERATURE_LEGACY: &str = "temperature";
    pub const HUMIDITY_UPDATE: &str = "humidity_update";
    pub const HUMIDITY_LEGACY: &str = "humidity";
    pub const LIGHT_UPDATE: &str = "light_update";
    pub const LIGHT_LEGACY: &str = "light";
    pub const SOIL_MOISTURE_UPDATE: &str = "soil_moisture_update";
    pub const SOIL_MOISTURE_LEGACY: &str = "soilMoisture";
    pub const PUMP_STATE_UPDATE: &str = "pump_state_update";
    pub const PUMP_STATE_LEGACY: &str = "pump_status";
    pub const LED_STATE_UPDATE: &str = "led_state_update";
    pub const LED_STATE_LEGACY: &str = "led_status";

    pub const DEVICE_ACK: &str = "device_ack";
    pub const DEVICE_ACK_LEGACY: &str = "control_ack";
    pub const TIMER_SET: &str = "timer_set";
    pub const TIMER_EXECUTED: &str = "timer_executed";
    pub const TIMER_CANCELLED: &str = "timer_cancelled";
    pub const TIMER_ERROR: &str = "timer_error";
    pub const AUTO_MODE_ACK: &str = "auto_mode_ack";
    pub const THRESHOLD_ACK: &str = "threshold_ack";

    pub const NOTIFICATION: &str = "new_notification";
    pub const NOTIFICATION_LEGACY: &str = "notification";
    pub const NOTIFICATION_READ: &str = "notification_read";
    pub const ONLINE_USERS: &str = "online_users";
    pub const ERROR: &str = "error";
    pub const SERVER_ERROR: &str = "server_error";
}

/// One text message on the channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelFrame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl ChannelFrame {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    pub fn decode_data<T: DeserializeOwned>(&self) -> Result<T, FrameError> {
        serde_json::from_value(self.data.clone()).map_err(|err| FrameError::Decode(err.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryPayload {
    #[serde(default, alias = "feedKey", alias = "feed_key")]
    pub device_key: String,
    #[serde(deserialize_with = "deserialize_reading_value")]
    pub value: f64,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, alias = "deviceName")]
    pub source_device_name: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    #[default]
    #[serde(alias = "success")]
    Ok,
    #[serde(alias = "failed")]
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceAckPayload {
    #[serde(alias = "feedKey")]
    pub device_key: String,
    #[serde(default)]
    pub state: Option<SwitchState>,
    #[serde(default)]
    pub mode: Option<DeviceMode>,
    #[serde(default)]
    pub status: AckStatus,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TimerPayload {
    #[serde(alias = "feedKey")]
    pub device_key: String,
    #[serde(default)]
    pub value: Option<SwitchState>,
    #[serde(default)]
    pub execute_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AutoModeAckPayload {
    #[serde(alias = "feedKey")]
    pub device_key: String,
    pub enabled: bool,
    #[serde(default)]
    pub thresholds: Option<Thresholds>,
    #[serde(default)]
    pub status: AckStatus,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ThresholdAckPayload {
    #[serde(alias = "feedKey")]
    pub device_key: String,
    pub thresholds: Thresholds,
    #[serde(default)]
    pub status: AckStatus,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NotificationReadPayload {
    #[serde(alias = "notificationId", deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(default)]
    pub receiver_id: Option<String>,
}

/// The server has sent both a bare list and a wrapped object over time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum PresencePayload {
    List(Vec<String>),
    Wrapped { users: Vec<String> },
}

impl PresencePayload {
    pub fn into_users(self) -> Vec<String> {
        match self {
            PresencePayload::List(users) => users,
            PresencePayload::Wrapped { users } => users,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorPayload {
    pub message: String,
    #[serde(default)]
    pub code: Option<String>,
}

/// Client to server commands. Serializes to the same `{event, data}` shape as
/// [`ChannelFrame`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientCommand {
    DeviceControl(DeviceControlPayload),
    SetTimer(SetTimerPayload),
    CancelTimer(CancelTimerPayload),
    SetAutoMode(SetAutoModePayload),
    UpdateThreshold(UpdateThresholdPayload),
    Register(RegisterPayload),
    SendNotification(SendNotificationPayload),
    MarkNotificationRead(MarkNotificationReadPayload),
}

impl ClientCommand {
    pub fn event_name(&self) -> &'static str {
        match self {
            ClientCommand::DeviceControl(_) => "device_control",
            ClientCommand::SetTimer(_) => "set_timer",
            ClientCommand::CancelTimer(_) => "cancel_timer",
            ClientCommand::SetAutoMode(_) => "set_auto_mode",
            ClientCommand::UpdateThreshold(_) => "update_threshold",
            ClientCommand::Register(_) => "register",
            ClientCommand::SendNotification(_) => "send_notification",
            ClientCommand::MarkNotificationRead(_) => "mark_notification_read",
        }
    }

    pub fn device_key(&self) -> Option<&str> {
        match self {
            ClientCommand::DeviceControl(p) => Some(&p.device_key),
            ClientCommand::SetTimer(p) => Some(&p.device_key),
            ClientCommand::CancelTimer(p) => Some(&p.device_key),
            ClientCommand::SetAutoMode(p) => Some(&p.device_key),
            ClientCommand::UpdateThreshold(p) => Some(&p.device_key),
            _ => None,
        }
    }

    pub fn to_frame(&self) -> Result<ChannelFrame, FrameError> {
        let value = serde_json::to_value(self).map_err(|err| FrameError::Encode(err.to_string()))?;
        serde_json::from_value(value).map_err(|err| FrameError::Encode(err.to_string()))
    }

    pub fn from_frame(frame: &ChannelFrame) -> Result<Self, FrameError> {
        let value =
            serde_json::to_value(frame).map_err(|err| FrameError::Decode(err.to_string()))?;
        serde_json::from_value(value).map_err(|err| FrameError::Decode(err.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceControlPayload {
    pub device_key: String,
    pub value: SwitchState,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SetTimerPayload {
    pub device_key: String,
    pub value: SwitchState,
    pub delay_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CancelTimerPayload {
    pub device_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SetAutoModePayload {
    pub device_key: String,
    pub enabled: bool,
    pub thresholds: Thresholds,
    pub direction: ThresholdDirection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateThresholdPayload {
    pub device_key: String,
    pub thresholds: Thresholds,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RegisterPayload {
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SendNotificationPayload {
    pub receiver_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MarkNotificationReadPayload {
    pub id: String,
    pub receiver_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

pub fn encode_frame<T: Serialize>(value: &T, max_frame_bytes: usize) -> Result<String, FrameError> {
    let encoded = serde_json::to_string(value).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    Ok(encoded)
}

pub fn decode_frame(text: &str, max_frame_bytes: usize) -> Result<ChannelFrame, FrameError> {
    let raw = text.trim_end_matches(['\r', '\n']);
    if raw.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: raw.len(),
            max: max_frame_bytes,
        });
    }
    serde_json::from_str(raw).map_err(|err| FrameError::Decode(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn commands_serialize_as_event_and_data() {
        let command = ClientCommand::SetAutoMode(SetAutoModePayload {
            device_key: "V10".to_string(),
            enabled: true,
            thresholds: Thresholds::new(30.0, 60.0),
            direction: ThresholdDirection::Above,
        });
        let frame = command.to_frame().expect("frame");
        assert_eq!(frame.event, "set_auto_mode");
        assert_eq!(frame.event, command.event_name());
        assert_eq!(
            frame.data,
            json!({
                "deviceKey": "V10",
                "enabled": true,
                "thresholds": {"min": 30.0, "max": 60.0},
                "direction": "above"
            })
        );
        assert_eq!(ClientCommand::from_frame(&frame).expect("decode"), command);
    }

    #[test]
    fn telemetry_accepts_switch_labels_and_numeric_strings() {
        let pump = ChannelFrame::new("pump_status", json!({"feedKey": "V10", "value": "ON"}));
        let payload: TelemetryPayload = pump.decode_data().expect("pump payload");
        assert_eq!(payload.device_key, "V10");
        assert_eq!(payload.value, 1.0);

        let soil = ChannelFrame::new(
            "soilMoisture",
            json!({"deviceKey": "V3", "value": "41.5", "deviceName": "bed-2"}),
        );
        let payload: TelemetryPayload = soil.decode_data().expect("soil payload");
        assert_eq!(payload.value, 41.5);
        assert_eq!(payload.source_device_name.as_deref(), Some("bed-2"));
    }

    #[test]
    fn ack_status_defaults_to_ok() {
        let frame = ChannelFrame::new("device_ack", json!({"deviceKey": "V10", "state": "OFF"}));
        let ack: DeviceAckPayload = frame.decode_data().expect("ack");
        assert_eq!(ack.status, AckStatus::Ok);
        assert_eq!(ack.state, Some(SwitchState::Off));

        let failed = ChannelFrame::new(
            "device_ack",
            json!({"deviceKey": "V10", "status": "failed", "message": "relay stuck"}),
        );
        let ack: DeviceAckPayload = failed.decode_data().expect("failed ack");
        assert_eq!(ack.status, AckStatus::Error);
    }

    #[test]
    fn presence_accepts_list_or_wrapped_users() {
        let bare: PresencePayload = serde_json::from_value(json!(["a@x", "b@x"])).expect("list");
        assert_eq!(bare.into_users(), vec!["a@x", "b@x"]);
        let wrapped: PresencePayload =
            serde_json::from_value(json!({"users": ["c@x"]})).expect("wrapped");
        assert_eq!(wrapped.into_users(), vec!["c@x"]);
    }

    #[test]
    fn decode_rejects_oversized_and_malformed_frames() {
        let oversized = format!("{{\"event\":\"x\",\"data\":\"{}\"}}", "x".repeat(2_000));
        assert!(matches!(
            decode_frame(&oversized, 1_024),
            Err(FrameError::OversizedFrame { .. })
        ));
        assert!(matches!(
            decode_frame("{\"event\":", DEFAULT_MAX_FRAME_BYTES),
            Err(FrameError::Decode(_))
        ));
        let frame = decode_frame(
            "{\"event\":\"online_users\",\"data\":[\"a@x\"]}\n",
            DEFAULT_MAX_FRAME_BYTES,
        )
        .expect("valid frame");
        assert_eq!(frame.event, events::ONLINE_USERS);
    }

    #[test]
    fn encoder_rejects_oversized_payload() {
        let command = ClientCommand::SendNotification(SendNotificationPayload {
            receiver_id: "a@x".to_string(),
            message: "x".repeat(128),
        });
        assert!(matches!(
            encode_frame(&command, 64),
            Err(FrameError::OversizedFrame { .. })
        ));
    }
}
