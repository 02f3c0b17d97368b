use crate::error::DispatchError;
use crate::store::StoreAction;
use chrono::{DateTime, Utc};
use garden_core::wire::{
    events, AutoModeAckPayload, DeviceAckPayload, ErrorPayload, NotificationReadPayload,
    PresencePayload, TelemetryPayload, ThresholdAckPayload, TimerPayload,
};
use garden_core::{ChannelFrame, FrameError, MetricKind, Notification, SensorReading};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerPhase {
    Set,
    Executed,
    Cancelled,
    Error,
}

impl TimerPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimerPhase::Set => "set",
            TimerPhase::Executed => "executed",
            TimerPhase::Cancelled => "cancelled",
            TimerPhase::Error => "error",
        }
    }
}

/// Typed result of demultiplexing one inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum DomainAction {
    Store(StoreAction),
    DeviceAck(DeviceAckPayload),
    Timer {
        phase: TimerPhase,
        payload: TimerPayload,
    },
    AutoModeAck(AutoModeAckPayload),
    ThresholdAck(ThresholdAckPayload),
    NotificationPushed(Notification),
    NotificationRead(NotificationReadPayload),
    Presence(Vec<String>),
    ServerError(ErrorPayload),
}

pub type Handler =
    Arc<dyn Fn(&Value, DateTime<Utc>) -> Result<DomainAction, FrameError> + Send + Sync>;

/// Event name to transform table. At most one handler per event name.
#[derive(Clone, Default)]
pub struct Dispatcher {
    handlers: HashMap<String, Handler>,
    decode_failures: u64,
    unknown_events: u64,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table covering every event the garden server emits, legacy names
    /// included.
    pub fn with_defaults() -> Self {
        let mut dispatcher = Self::new();
        let telemetry = [
            (events::TEMPERATURE_UPDATE, MetricKind::Temperature),
            (events::TEMPERATURE_LEGACY, MetricKind::Temperature),
            (events::HUMIDITY_UPDATE, MetricKind::Humidity),
            (events::HUMIDITY_LEGACY, MetricKind::Humidity),
            (events::LIGHT_UPDATE, MetricKind::Light),
            (events::LIGHT_LEGACY, MetricKind::Light),
            (events::SOIL_MOISTURE_UPDATE, MetricKind::SoilMoisture),
            (events::SOIL_MOISTURE_LEGACY, MetricKind::SoilMoisture),
            (events::PUMP_STATE_UPDATE, MetricKind::PumpState),
            (events::PUMP_STATE_LEGACY, MetricKind::PumpState),
            (events::LED_STATE_UPDATE, MetricKind::LedState),
            (events::LED_STATE_LEGACY, MetricKind::LedState),
        ];
        for (event, metric) in telemetry {
            dispatcher.register(event, telemetry_handler(metric));
        }

        for event in [events::DEVICE_ACK, events::DEVICE_ACK_LEGACY] {
            dispatcher.register(event, decoded(DomainAction::DeviceAck));
        }
        for (event, phase) in [
            (events::TIMER_SET, TimerPhase::Set),
            (events::TIMER_EXECUTED, TimerPhase::Executed),
            (events::TIMER_CANCELLED, TimerPhase::Cancelled),
            (events::TIMER_ERROR, TimerPhase::Error),
        ] {
            dispatcher.register(
                event,
                decoded(move |payload: TimerPayload| DomainAction::Timer { phase, payload }),
            );
        }
        dispatcher.register(events::AUTO_MODE_ACK, decoded(DomainAction::AutoModeAck));
        dispatcher.register(events::THRESHOLD_ACK, decoded(DomainAction::ThresholdAck));
        for event in [events::NOTIFICATION, events::NOTIFICATION_LEGACY] {
            dispatcher.register(event, decoded(DomainAction::NotificationPushed));
        }
        dispatcher.register(
            events::NOTIFICATION_READ,
            decoded(DomainAction::NotificationRead),
        );
        dispatcher.register(
            events::ONLINE_USERS,
            decoded(|payload: PresencePayload| DomainAction::Presence(payload.into_users())),
        );
        for event in [events::ERROR, events::SERVER_ERROR] {
            dispatcher.register(event, decoded(DomainAction::ServerError));
        }
        dispatcher
    }

    /// Installs `handler` for `event`, returning the handler it replaced.
    pub fn register(&mut self, event: impl Into<String>, handler: Handler) -> Option<Handler> {
        self.handlers.insert(event.into(), handler)
    }

    pub fn unregister(&mut self, event: &str) -> Option<Handler> {
        self.handlers.remove(event)
    }

    pub fn handles(&self, event: &str) -> bool {
        self.handlers.contains_key(event)
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    pub fn decode_failures(&self) -> u64 {
        self.decode_failures
    }

    pub fn unknown_events(&self) -> u64 {
        self.unknown_events
    }

    /// Unknown events yield `Ok(None)`. A known event with a malformed payload
    /// yields an error and never reaches the store.
    pub fn dispatch(
        &mut self,
        frame: &ChannelFrame,
        received_at: DateTime<Utc>,
    ) -> Result<Option<DomainAction>, DispatchError> {
        let Some(handler) = self.handlers.get(&frame.event) else {
            self.unknown_events += 1;
            debug!(event = "sync_dispatch_unknown", event_name = %frame.event);
            return Ok(None);
        };
        match handler(&frame.data, received_at) {
            Ok(action) => Ok(Some(action)),
            Err(source) => {
                self.decode_failures += 1;
                warn!(
                    event = "sync_dispatch_error",
                    event_name = %frame.event,
                    failures = self.decode_failures,
                    error = %source
                );
                Err(DispatchError {
                    event: frame.event.clone(),
                    source,
                })
            }
        }
    }
}

fn decode<T: DeserializeOwned>(data: &Value) -> Result<T, FrameError> {
    T::deserialize(data).map_err(|err| FrameError::Decode(err.to_string()))
}

fn decoded<T, F>(wrap: F) -> Handler
where
    T: DeserializeOwned,
    F: Fn(T) -> DomainAction + Send + Sync + 'static,
{
    Arc::new(move |data: &Value, _received_at: DateTime<Utc>| {
        decode(data).map(&wrap)
    })
}

fn telemetry_handler(metric: MetricKind) -> Handler {
    Arc::new(move |data: &Value, received_at: DateTime<Utc>| {
        let payload: TelemetryPayload = decode(data)?;
        Ok(DomainAction::Store(StoreAction::SensorReading(
            SensorReading {
                device_key: payload.device_key,
                metric,
                value: payload.value,
                timestamp: payload.timestamp,
                source_device_name: payload.source_device_name,
                received_at,
            },
        )))
    })
}
