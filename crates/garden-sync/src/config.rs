use garden_core::wire::DEFAULT_MAX_FRAME_BYTES;
use garden_core::ThresholdDirection;
use std::collections::HashMap;
use std::time::Duration;

const DEFAULT_WS_URL: &str = "ws://127.0.0.1:4000/ws";
const DEFAULT_API_URL: &str = "http://127.0.0.1:4000";
const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;
const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_CONNECT_WAIT_MS: u64 = 3_000;
const DEFAULT_PAGE_SIZE: usize = 10;
const DEFAULT_RECENT_NOTIFICATIONS: usize = 5;

#[derive(Clone, Debug, PartialEq)]
pub struct SyncConfig {
    pub ws_url: String,
    pub api_url: String,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub max_reconnect_attempts: u32,
    /// How long a sent command may wait for its acknowledgment.
    pub command_timeout: Duration,
    /// How long a command issued while offline waits for the channel.
    pub connect_wait: Duration,
    pub notification_page_size: usize,
    pub recent_notifications: usize,
    pub max_frame_bytes: usize,
    pub threshold_directions: HashMap<String, ThresholdDirection>,
    pub default_threshold_direction: ThresholdDirection,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            ws_url: DEFAULT_WS_URL.to_string(),
            api_url: DEFAULT_API_URL.to_string(),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(10),
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            command_timeout: Duration::from_millis(DEFAULT_COMMAND_TIMEOUT_MS),
            connect_wait: Duration::from_millis(DEFAULT_CONNECT_WAIT_MS),
            notification_page_size: DEFAULT_PAGE_SIZE,
            recent_notifications: DEFAULT_RECENT_NOTIFICATIONS,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            threshold_directions: default_threshold_directions(),
            default_threshold_direction: ThresholdDirection::Above,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let mut threshold_directions = defaults.threshold_directions.clone();
        if let Some(raw) = resolve_string(&lookup, "GARDEN_THRESHOLD_DIRECTIONS") {
            threshold_directions.extend(parse_threshold_directions(&raw));
        }
        Self {
            ws_url: resolve_string(&lookup, "GARDEN_WS_URL").unwrap_or(defaults.ws_url),
            api_url: resolve_string(&lookup, "GARDEN_API_URL").unwrap_or(defaults.api_url),
            max_reconnect_attempts: resolve_parsed(&lookup, "GARDEN_MAX_RECONNECT_ATTEMPTS")
                .unwrap_or(defaults.max_reconnect_attempts),
            command_timeout: resolve_parsed(&lookup, "GARDEN_COMMAND_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.command_timeout),
            connect_wait: resolve_parsed(&lookup, "GARDEN_CONNECT_WAIT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.connect_wait),
            notification_page_size: resolve_parsed(&lookup, "GARDEN_NOTIFICATION_PAGE_SIZE")
                .filter(|size: &usize| *size > 0)
                .unwrap_or(defaults.notification_page_size),
            threshold_directions,
            ..defaults
        }
    }

    pub fn threshold_direction(&self, device_kind: &str) -> ThresholdDirection {
        self.threshold_directions
            .get(&device_kind.trim().to_lowercase())
            .copied()
            .unwrap_or(self.default_threshold_direction)
    }
}

fn default_threshold_directions() -> HashMap<String, ThresholdDirection> {
    HashMap::from([
        ("pump".to_string(), ThresholdDirection::Above),
        ("led".to_string(), ThresholdDirection::Below),
    ])
}

/// Parses `pump=above,led=below`; malformed pairs are skipped.
fn parse_threshold_directions(raw: &str) -> Vec<(String, ThresholdDirection)> {
    raw.split(',')
        .filter_map(|pair| {
            let (kind, direction) = pair.split_once('=')?;
            let kind = kind.trim().to_lowercase();
            if kind.is_empty() {
                return None;
            }
            direction.parse().ok().map(|direction| (kind, direction))
        })
        .collect()
}

fn resolve_string(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn resolve_parsed<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    resolve_string(lookup, key).and_then(|value| value.parse().ok())
}
