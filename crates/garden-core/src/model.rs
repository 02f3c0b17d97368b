use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MetricKind {
    Temperature,
    Humidity,
    Light,
    SoilMoisture,
    PumpState,
    LedState,
}

impl MetricKind {
    pub const ALL: [MetricKind; 6] = [
        MetricKind::Temperature,
        MetricKind::Humidity,
        MetricKind::Light,
        MetricKind::SoilMoisture,
        MetricKind::PumpState,
        MetricKind::LedState,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Temperature => "temperature",
            MetricKind::Humidity => "humidity",
            MetricKind::Light => "light",
            MetricKind::SoilMoisture => "soilMoisture",
            MetricKind::PumpState => "pumpState",
            MetricKind::LedState => "ledState",
        }
    }

    /// Actuator state slots carry 0/1 rather than a physical measurement.
    pub fn is_switch(&self) -> bool {
        matches!(self, MetricKind::PumpState | MetricKind::LedState)
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKind {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase().replace(['_', '-'], "");
        match normalized.as_str() {
            "temperature" | "temp" => Ok(MetricKind::Temperature),
            "humidity" => Ok(MetricKind::Humidity),
            "light" => Ok(MetricKind::Light),
            "soilmoisture" | "soil" => Ok(MetricKind::SoilMoisture),
            "pumpstate" | "pump" => Ok(MetricKind::PumpState),
            "ledstate" | "led" => Ok(MetricKind::LedState),
            other => Err(format!("Unknown metric kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorReading {
    pub device_key: String,
    pub metric: MetricKind,
    pub value: f64,
    pub timestamp: Option<DateTime<Utc>>,
    pub source_device_name: Option<String>,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SwitchState {
    #[serde(rename = "ON", alias = "on", alias = "On")]
    On,
    #[serde(rename = "OFF", alias = "off", alias = "Off")]
    Off,
}

impl SwitchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SwitchState::On => "ON",
            SwitchState::Off => "OFF",
        }
    }

    pub fn is_on(&self) -> bool {
        matches!(self, SwitchState::On)
    }
}

impl fmt::Display for SwitchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SwitchState {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "on" | "1" | "true" | "open" => Ok(SwitchState::On),
            "off" | "0" | "false" | "close" | "closed" => Ok(SwitchState::Off),
            other => Err(format!("Unknown switch state: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceCategory {
    Sensor,
    Actuator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceMode {
    #[default]
    Manual,
    Automatic,
}

impl DeviceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceMode::Manual => "manual",
            DeviceMode::Automatic => "automatic",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Thresholds {
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
}

impl Thresholds {
    pub fn new(min: f64, max: f64) -> Self {
        Self {
            min: Some(min),
            max: Some(max),
        }
    }
}

/// Which side of the threshold band switches an actuator on.
///
/// Pumps water when the reading climbs above `max`; grow lights switch on
/// when the reading drops below `min`. The mapping per device kind is
/// configuration, not a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdDirection {
    Above,
    Below,
}

impl ThresholdDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThresholdDirection::Above => "above",
            ThresholdDirection::Below => "below",
        }
    }
}

impl FromStr for ThresholdDirection {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "above" | "gt" | ">" => Ok(ThresholdDirection::Above),
            "below" | "lt" | "<" => Ok(ThresholdDirection::Below),
            other => Err(format!("Unknown threshold direction: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    #[serde(deserialize_with = "deserialize_id")]
    pub device_id: String,
    pub display_name: String,
    pub feed_key: String,
    pub category: DeviceCategory,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub thresholds: Thresholds,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub mode: DeviceMode,
    #[serde(default)]
    pub last_command_state: Option<SwitchState>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(deserialize_with = "deserialize_id")]
    pub sender_id: String,
    #[serde(deserialize_with = "deserialize_id")]
    pub receiver_id: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub read: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaginationInfo {
    pub total_count: usize,
    pub page_size: usize,
    pub current_page: usize,
    pub page_count: usize,
}

impl PaginationInfo {
    pub fn derive(total_count: usize, page_size: usize, current_page: usize) -> Self {
        let page_size = page_size.max(1);
        let page_count = total_count.div_ceil(page_size);
        Self {
            total_count,
            page_size,
            current_page: current_page.clamp(1, page_count.max(1)),
            page_count,
        }
    }
}

/// Pagination block as reported by the notifications endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaginationMeta {
    pub total_count: usize,
    #[serde(default)]
    pub page_size: Option<usize>,
    #[serde(default)]
    pub current_page: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPage {
    #[serde(default)]
    pub notifications: Vec<Notification>,
    #[serde(default)]
    pub pagination: Option<PaginationMeta>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

/// Deserialize an ID that can be either a string or a number into a String
pub(crate) fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    match val {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(serde::de::Error::custom("expected string or number for id")),
    }
}

/// Readings arrive as numbers, numeric strings, booleans or ON/OFF labels
/// depending on the feed.
pub(crate) fn deserialize_reading_value<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    match val {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| serde::de::Error::custom("reading value out of range")),
        Value::Bool(b) => Ok(if b { 1.0 } else { 0.0 }),
        Value::String(s) => {
            if let Ok(number) = s.trim().parse::<f64>() {
                return Ok(number);
            }
            s.parse::<SwitchState>()
                .map(|state| if state.is_on() { 1.0 } else { 0.0 })
                .map_err(serde::de::Error::custom)
        }
        _ => Err(serde::de::Error::custom(
            "expected number, string or bool for reading value",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_kind_accepts_legacy_spellings() {
        assert_eq!(
            "soil_moisture".parse::<MetricKind>(),
            Ok(MetricKind::SoilMoisture)
        );
        assert_eq!(
            "soilMoisture".parse::<MetricKind>(),
            Ok(MetricKind::SoilMoisture)
        );
        assert_eq!("pump".parse::<MetricKind>(), Ok(MetricKind::PumpState));
        assert_eq!("LED_STATE".parse::<MetricKind>(), Ok(MetricKind::LedState));
        assert!("pressure".parse::<MetricKind>().is_err());
    }

    #[test]
    fn pagination_rounds_page_count_up() {
        let info = PaginationInfo::derive(23, 10, 1);
        assert_eq!(info.page_count, 3);
        assert_eq!(PaginationInfo::derive(0, 10, 4).page_count, 0);
        assert_eq!(PaginationInfo::derive(0, 10, 4).current_page, 1);
        assert_eq!(PaginationInfo::derive(20, 10, 9).current_page, 2);
    }

    #[test]
    fn device_parses_rest_shape_with_numeric_id() {
        let device: Device = serde_json::from_value(serde_json::json!({
            "deviceId": 42,
            "displayName": "Drip pump",
            "feedKey": "V10",
            "category": "actuator",
            "kind": "pump",
            "thresholds": {"min": 30, "max": 60},
            "isActive": true,
            "mode": "automatic",
            "lastCommandState": "on"
        }))
        .expect("parse device");
        assert_eq!(device.device_id, "42");
        assert_eq!(device.mode, DeviceMode::Automatic);
        assert_eq!(device.last_command_state, Some(SwitchState::On));
        assert_eq!(device.thresholds.max, Some(60.0));
    }

    #[test]
    fn notification_defaults_to_unread() {
        let notification: Notification = serde_json::from_value(serde_json::json!({
            "id": "n1",
            "senderId": 7,
            "receiverId": "a@x",
            "message": "pump failed",
            "createdAt": "2026-03-01T10:00:00Z"
        }))
        .expect("parse notification");
        assert!(!notification.read);
        assert_eq!(notification.sender_id, "7");
    }
}
