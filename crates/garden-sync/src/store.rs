use crate::connection::ConnectionSnapshot;
use garden_core::{Device, DeviceMode, MetricKind, SensorReading, SwitchState, Thresholds};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadingFlag {
    User,
    Devices,
    Notifications,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct LoadingFlags {
    pub user: bool,
    pub devices: bool,
    pub notifications: bool,
}

impl LoadingFlags {
    fn with(mut self, flag: LoadingFlag, value: bool) -> Self {
        match flag {
            LoadingFlag::User => self.user = value,
            LoadingFlag::Devices => self.devices = value,
            LoadingFlag::Notifications => self.notifications = value,
        }
        self
    }
}

/// One immutable snapshot of the dashboard's shared state.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreState {
    pub connection: ConnectionSnapshot,
    /// Latest reading per metric; a newer reading replaces the slot.
    pub readings: BTreeMap<MetricKind, SensorReading>,
    pub devices: Vec<Device>,
    pub selected_location: Option<String>,
    pub loading: LoadingFlags,
    /// Number of actions applied since the initial state.
    pub revision: u64,
}

impl StoreState {
    pub fn reading(&self, metric: MetricKind) -> Option<&SensorReading> {
        self.readings.get(&metric)
    }

    pub fn device(&self, device_key: &str) -> Option<&Device> {
        self.devices.iter().find(|device| device.feed_key == device_key)
    }

    /// Readings are only live while the channel is connected and not degraded.
    pub fn readings_are_live(&self) -> bool {
        self.connection.state == crate::connection::ConnectionState::Connected
            && !self.connection.degraded
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StoreAction {
    Connection(ConnectionSnapshot),
    SensorReading(SensorReading),
    /// REST device snapshot for a location. Dropped when the location is no
    /// longer selected.
    ReplaceDevices {
        location: String,
        devices: Vec<Device>,
    },
    /// Device snapshot for a location failed to load.
    DevicesUnavailable {
        location: String,
    },
    SelectLocation(Option<String>),
    SetLoading {
        flag: LoadingFlag,
        value: bool,
    },
    DeviceAcked {
        device_key: String,
        state: Option<SwitchState>,
        mode: Option<DeviceMode>,
    },
    DeviceThresholds {
        device_key: String,
        thresholds: Thresholds,
    },
}

impl StoreAction {
    pub fn kind(&self) -> &'static str {
        match self {
            StoreAction::Connection(_) => "connection",
            StoreAction::SensorReading(_) => "sensor_reading",
            StoreAction::ReplaceDevices { .. } => "replace_devices",
            StoreAction::DevicesUnavailable { .. } => "devices_unavailable",
            StoreAction::SelectLocation(_) => "select_location",
            StoreAction::SetLoading { .. } => "set_loading",
            StoreAction::DeviceAcked { .. } => "device_acked",
            StoreAction::DeviceThresholds { .. } => "device_thresholds",
        }
    }
}

/// Applies one action. Never mutates `state`; the same action log replayed
/// from the same initial state always yields the same result.
pub fn reduce(state: &StoreState, action: &StoreAction) -> StoreState {
    let mut next = state.clone();
    next.revision = state.revision + 1;
    match action {
        StoreAction::Connection(snapshot) => {
            next.connection = snapshot.clone();
        }
        StoreAction::SensorReading(reading) => {
            next.readings.insert(reading.metric, reading.clone());
        }
        StoreAction::ReplaceDevices { location, devices } => {
            if state.selected_location.as_deref() == Some(location.as_str()) {
                next.devices = devices.clone();
                next.loading = next.loading.with(LoadingFlag::Devices, false);
            }
        }
        StoreAction::DevicesUnavailable { location } => {
            if state.selected_location.as_deref() == Some(location.as_str()) {
                next.loading = next.loading.with(LoadingFlag::Devices, false);
            }
        }
        StoreAction::SelectLocation(location) => {
            if state.selected_location != *location {
                next.selected_location = location.clone();
                next.devices = Vec::new();
                next.loading = next
                    .loading
                    .with(LoadingFlag::Devices, location.is_some());
            }
        }
        StoreAction::SetLoading { flag, value } => {
            next.loading = next.loading.with(*flag, *value);
        }
        StoreAction::DeviceAcked {
            device_key,
            state: switch,
            mode,
        } => {
            if let Some(device) = next
                .devices
                .iter_mut()
                .find(|device| device.feed_key == *device_key)
            {
                if let Some(switch) = switch {
                    device.last_command_state = Some(*switch);
                    device.is_active = switch.is_on();
                }
                if let Some(mode) = mode {
                    device.mode = *mode;
                }
            }
        }
        StoreAction::DeviceThresholds {
            device_key,
            thresholds,
        } => {
            if let Some(device) = next
                .devices
                .iter_mut()
                .find(|device| device.feed_key == *device_key)
            {
                device.thresholds = *thresholds;
            }
        }
    }
    next
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

pub type Listener = Box<dyn Fn(&Arc<StoreState>) + Send>;

/// Owns the current snapshot and fans every new one out to listeners.
pub struct Store {
    state: Arc<StoreState>,
    listeners: BTreeMap<SubscriptionId, Listener>,
    next_id: u64,
}

impl Default for Store {
    fn default() -> Self {
        Self::new(StoreState::default())
    }
}

impl Store {
    pub fn new(initial: StoreState) -> Self {
        Self {
            state: Arc::new(initial),
            listeners: BTreeMap::new(),
            next_id: 1,
        }
    }

    pub fn state(&self) -> Arc<StoreState> {
        Arc::clone(&self.state)
    }

    pub fn dispatch(&mut self, action: &StoreAction) -> Arc<StoreState> {
        self.state = Arc::new(reduce(&self.state, action));
        trace!(
            event = "sync_store_dispatch",
            action = action.kind(),
            revision = self.state.revision
        );
        for listener in self.listeners.values() {
            listener(&self.state);
        }
        Arc::clone(&self.state)
    }

    pub fn subscribe(&mut self, listener: Listener) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.listeners.insert(id, listener);
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.listeners.remove(&id).is_some()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}
