use crate::dispatcher::TimerPhase;
use crate::error::CommandError;
use chrono::{DateTime, Utc};
use garden_core::wire::{
    CancelTimerPayload, DeviceControlPayload, SetAutoModePayload, SetTimerPayload, TimerPayload,
    UpdateThresholdPayload,
};
use garden_core::{ClientCommand, SwitchState, ThresholdDirection, Thresholds};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum CommandKind {
    Actuator {
        value: SwitchState,
    },
    SetTimer {
        value: SwitchState,
        delay: Duration,
    },
    CancelTimer,
    AutoMode {
        enabled: bool,
        thresholds: Thresholds,
        direction: ThresholdDirection,
    },
    UpdateThresholds {
        thresholds: Thresholds,
    },
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Actuator { .. } => "actuator",
            CommandKind::SetTimer { .. } => "set_timer",
            CommandKind::CancelTimer => "cancel_timer",
            CommandKind::AutoMode { .. } => "auto_mode",
            CommandKind::UpdateThresholds { .. } => "update_thresholds",
        }
    }

    pub fn to_command(&self, device_key: &str) -> ClientCommand {
        let device_key = device_key.to_string();
        match self {
            CommandKind::Actuator { value } => ClientCommand::DeviceControl(DeviceControlPayload {
                device_key,
                value: *value,
            }),
            CommandKind::SetTimer { value, delay } => ClientCommand::SetTimer(SetTimerPayload {
                device_key,
                value: *value,
                delay_secs: delay.as_secs(),
            }),
            CommandKind::CancelTimer => {
                ClientCommand::CancelTimer(CancelTimerPayload { device_key })
            }
            CommandKind::AutoMode {
                enabled,
                thresholds,
                direction,
            } => ClientCommand::SetAutoMode(SetAutoModePayload {
                device_key,
                enabled: *enabled,
                thresholds: *thresholds,
                direction: *direction,
            }),
            CommandKind::UpdateThresholds { thresholds } => {
                ClientCommand::UpdateThreshold(UpdateThresholdPayload {
                    device_key,
                    thresholds: *thresholds,
                })
            }
        }
    }

    fn enables_auto_mode(&self) -> bool {
        matches!(self, CommandKind::AutoMode { enabled: true, .. })
    }
}

/// Which acknowledgment event answered a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    Device,
    AutoMode,
    Threshold,
}

impl AckKind {
    fn answers(&self, kind: &CommandKind) -> bool {
        matches!(
            (self, kind),
            (AckKind::Device, CommandKind::Actuator { .. })
                | (AckKind::AutoMode, CommandKind::AutoMode { .. })
                | (AckKind::Threshold, CommandKind::UpdateThresholds { .. })
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub device_key: String,
    pub kind: AckKind,
    /// Server message when the ack reports failure.
    pub rejected: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandPhase {
    /// Waiting for the channel to connect before it can be sent.
    Deferred,
    /// On the wire, waiting for an acknowledgment.
    Sent,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingCommand {
    pub command_id: u64,
    pub device_key: String,
    pub kind: CommandKind,
    pub issued_at: Instant,
    pub timeout_at: Instant,
    pub phase: CommandPhase,
    /// Emit `cancel_timer` ahead of this command when it is sent.
    pub cancel_timer_first: bool,
}

impl PendingCommand {
    fn commands(&self) -> Vec<ClientCommand> {
        let mut commands = Vec::with_capacity(2);
        if self.cancel_timer_first {
            commands.push(CommandKind::CancelTimer.to_command(&self.device_key));
        }
        commands.push(self.kind.to_command(&self.device_key));
        commands
    }
}

/// Server-confirmed timer for a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledTimer {
    pub device_key: String,
    pub value: Option<SwitchState>,
    pub execute_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IssueOutcome {
    pub command_id: u64,
    /// Frames to send now, in order. Empty while deferred.
    pub emit: Vec<ClientCommand>,
    pub superseded: Option<Resolution>,
    pub cancelled_timer: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub command_id: u64,
    pub device_key: String,
    pub result: Result<(), CommandError>,
}

/// Tracks in-flight device commands and server-side timers.
///
/// At most one pending command exists per device key; a newer command for
/// the same key supersedes the older one.
#[derive(Debug)]
pub struct CommandCorrelator {
    command_timeout: Duration,
    connect_wait: Duration,
    next_id: u64,
    pending: HashMap<String, PendingCommand>,
    timers: BTreeMap<String, ScheduledTimer>,
}

impl CommandCorrelator {
    pub fn new(command_timeout: Duration, connect_wait: Duration) -> Self {
        Self {
            command_timeout,
            connect_wait,
            next_id: 1,
            pending: HashMap::new(),
            timers: BTreeMap::new(),
        }
    }

    pub fn issue(
        &mut self,
        device_key: &str,
        kind: CommandKind,
        connected: bool,
        now: Instant,
    ) -> IssueOutcome {
        let command_id = self.next_id;
        self.next_id += 1;

        let superseded = self.pending.remove(device_key);
        let mut cancel_timer_first = false;
        if kind.enables_auto_mode() {
            let had_timer = self.timers.remove(device_key).is_some();
            let had_timer_command = superseded
                .as_ref()
                .map(|prev| matches!(prev.kind, CommandKind::SetTimer { .. }))
                .unwrap_or(false);
            cancel_timer_first = had_timer || had_timer_command;
        }

        let (phase, timeout_at) = if connected {
            (CommandPhase::Sent, now + self.command_timeout)
        } else {
            (CommandPhase::Deferred, now + self.connect_wait)
        };
        let pending = PendingCommand {
            command_id,
            device_key: device_key.to_string(),
            kind,
            issued_at: now,
            timeout_at,
            phase,
            cancel_timer_first,
        };
        let emit = if connected {
            pending.commands()
        } else {
            Vec::new()
        };
        info!(
            event = "sync_command_issue",
            command_id,
            device_key,
            kind = pending.kind.as_str(),
            deferred = !connected,
            cancel_timer = cancel_timer_first
        );
        self.pending.insert(device_key.to_string(), pending);

        IssueOutcome {
            command_id,
            emit,
            superseded: superseded.map(|prev| Resolution {
                command_id: prev.command_id,
                device_key: prev.device_key.clone(),
                result: Err(CommandError::Superseded {
                    device_key: prev.device_key,
                }),
            }),
            cancelled_timer: cancel_timer_first,
        }
    }

    /// Moves every deferred command to `Sent`, oldest first, and returns the
    /// frames to send.
    pub fn flush_deferred(&mut self, now: Instant) -> Vec<ClientCommand> {
        let mut deferred: Vec<&mut PendingCommand> = self
            .pending
            .values_mut()
            .filter(|pending| pending.phase == CommandPhase::Deferred)
            .collect();
        deferred.sort_by_key(|pending| pending.command_id);
        let mut commands = Vec::new();
        for pending in deferred {
            pending.phase = CommandPhase::Sent;
            pending.timeout_at = now + self.command_timeout;
            commands.extend(pending.commands());
        }
        commands
    }

    pub fn on_ack(&mut self, ack: &Ack) -> Option<Resolution> {
        let matches = self
            .pending
            .get(&ack.device_key)
            .map(|pending| pending.phase == CommandPhase::Sent && ack.kind.answers(&pending.kind))
            .unwrap_or(false);
        if !matches {
            debug!(
                event = "sync_command_ack_unmatched",
                device_key = %ack.device_key
            );
            return None;
        }
        let pending = self.pending.remove(&ack.device_key)?;
        Some(resolve(pending, ack.rejected.clone()))
    }

    /// Maintains the timer table and resolves the matching timer command.
    pub fn on_timer(&mut self, phase: TimerPhase, payload: &TimerPayload) -> Option<Resolution> {
        match phase {
            TimerPhase::Set => {
                self.timers.insert(
                    payload.device_key.clone(),
                    ScheduledTimer {
                        device_key: payload.device_key.clone(),
                        value: payload.value,
                        execute_at: payload.execute_at,
                    },
                );
            }
            TimerPhase::Executed | TimerPhase::Cancelled | TimerPhase::Error => {
                self.timers.remove(&payload.device_key);
            }
        }

        let answers = match self.pending.get(&payload.device_key) {
            Some(pending) if pending.phase == CommandPhase::Sent => matches!(
                (phase, &pending.kind),
                (TimerPhase::Set, CommandKind::SetTimer { .. })
                    | (TimerPhase::Cancelled, CommandKind::CancelTimer)
                    | (TimerPhase::Error, CommandKind::SetTimer { .. })
                    | (TimerPhase::Error, CommandKind::CancelTimer)
            ),
            _ => false,
        };
        if !answers {
            return None;
        }
        let pending = self.pending.remove(&payload.device_key)?;
        let rejected = (phase == TimerPhase::Error).then(|| {
            payload
                .message
                .clone()
                .unwrap_or_else(|| "timer error".to_string())
        });
        Some(resolve(pending, rejected))
    }

    /// Clears every entry whose deadline has passed.
    pub fn expire(&mut self, now: Instant) -> Vec<Resolution> {
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, pending)| pending.timeout_at <= now)
            .map(|(key, _)| key.clone())
            .collect();
        let mut resolutions: Vec<Resolution> = expired
            .into_iter()
            .filter_map(|key| self.pending.remove(&key))
            .map(|pending| {
                let error = match pending.phase {
                    CommandPhase::Deferred => CommandError::DispatchTimeout {
                        device_key: pending.device_key.clone(),
                        wait_ms: self.connect_wait.as_millis() as u64,
                    },
                    CommandPhase::Sent => CommandError::NotAcknowledged {
                        device_key: pending.device_key.clone(),
                        timeout_ms: self.command_timeout.as_millis() as u64,
                    },
                };
                warn!(
                    event = "sync_command_timeout",
                    command_id = pending.command_id,
                    device_key = %pending.device_key,
                    error = %error
                );
                Resolution {
                    command_id: pending.command_id,
                    device_key: pending.device_key,
                    result: Err(error),
                }
            })
            .collect();
        resolutions.sort_by_key(|resolution| resolution.command_id);
        resolutions
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|pending| pending.timeout_at).min()
    }

    pub fn pending(&self) -> Vec<PendingCommand> {
        let mut pending: Vec<PendingCommand> = self.pending.values().cloned().collect();
        pending.sort_by_key(|pending| pending.command_id);
        pending
    }

    pub fn pending_for(&self, device_key: &str) -> Option<&PendingCommand> {
        self.pending.get(device_key)
    }

    pub fn scheduled_timers(&self) -> Vec<ScheduledTimer> {
        self.timers.values().cloned().collect()
    }

    pub fn timer_for(&self, device_key: &str) -> Option<&ScheduledTimer> {
        self.timers.get(device_key)
    }

    /// Fails every pending command, used when the service stops.
    pub fn drain(&mut self) -> Vec<Resolution> {
        let mut drained: Vec<Resolution> = self
            .pending
            .drain()
            .map(|(_, pending)| Resolution {
                command_id: pending.command_id,
                device_key: pending.device_key,
                result: Err(CommandError::ServiceStopped),
            })
            .collect();
        drained.sort_by_key(|resolution| resolution.command_id);
        drained
    }
}

fn resolve(pending: PendingCommand, rejected: Option<String>) -> Resolution {
    let result = match rejected {
        Some(message) => {
            warn!(
                event = "sync_command_rejected",
                command_id = pending.command_id,
                device_key = %pending.device_key,
                message = %message
            );
            Err(CommandError::Rejected {
                device_key: pending.device_key.clone(),
                message,
            })
        }
        None => {
            info!(
                event = "sync_command_acked",
                command_id = pending.command_id,
                device_key = %pending.device_key,
                kind = pending.kind.as_str()
            );
            Ok(())
        }
    };
    Resolution {
        command_id: pending.command_id,
        device_key: pending.device_key,
        result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(5);
    const WAIT: Duration = Duration::from_secs(3);

    fn correlator() -> CommandCorrelator {
        CommandCorrelator::new(TIMEOUT, WAIT)
    }

    fn ack(device_key: &str, kind: AckKind) -> Ack {
        Ack {
            device_key: device_key.to_string(),
            kind,
            rejected: None,
        }
    }

    fn timer_payload(device_key: &str) -> TimerPayload {
        TimerPayload {
            device_key: device_key.to_string(),
            value: Some(SwitchState::On),
            execute_at: None,
            message: None,
        }
    }

    fn auto_mode() -> CommandKind {
        CommandKind::AutoMode {
            enabled: true,
            thresholds: Thresholds::new(30.0, 60.0),
            direction: ThresholdDirection::Above,
        }
    }

    #[test]
    fn deferred_command_is_sent_exactly_once_on_flush() {
        let now = Instant::now();
        let mut correlator = correlator();
        let outcome = correlator.issue(
            "V10",
            CommandKind::Actuator {
                value: SwitchState::On,
            },
            false,
            now,
        );
        assert!(outcome.emit.is_empty());
        assert_eq!(
            correlator.pending_for("V10").map(|p| p.phase),
            Some(CommandPhase::Deferred)
        );

        let sent = correlator.flush_deferred(now + Duration::from_secs(1));
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].event_name(), "device_control");
        assert!(correlator.flush_deferred(now + Duration::from_secs(2)).is_empty());

        let resolution = correlator.on_ack(&ack("V10", AckKind::Device)).expect("resolved");
        assert_eq!(resolution.command_id, outcome.command_id);
        assert!(resolution.result.is_ok());
        assert!(correlator.pending().is_empty());
    }

    #[test]
    fn unacknowledged_command_times_out_and_clears() {
        let now = Instant::now();
        let mut correlator = correlator();
        correlator.issue(
            "V10",
            CommandKind::Actuator {
                value: SwitchState::Off,
            },
            true,
            now,
        );
        assert_eq!(correlator.next_deadline(), Some(now + TIMEOUT));
        assert!(correlator.expire(now + Duration::from_secs(4)).is_empty());

        let expired = correlator.expire(now + TIMEOUT);
        assert_eq!(expired.len(), 1);
        assert!(matches!(
            expired[0].result,
            Err(CommandError::NotAcknowledged { .. })
        ));
        assert!(correlator.pending_for("V10").is_none());
        assert!(correlator.next_deadline().is_none());
    }

    #[test]
    fn deferred_command_reports_dispatch_timeout() {
        let now = Instant::now();
        let mut correlator = correlator();
        correlator.issue("V11", CommandKind::CancelTimer, false, now);
        let expired = correlator.expire(now + WAIT);
        assert!(matches!(
            expired[0].result,
            Err(CommandError::DispatchTimeout { wait_ms: 3_000, .. })
        ));
    }

    #[test]
    fn enabling_auto_mode_cancels_the_scheduled_timer() {
        let now = Instant::now();
        let mut correlator = correlator();
        correlator.on_timer(TimerPhase::Set, &timer_payload("V10"));
        assert!(correlator.timer_for("V10").is_some());

        let outcome = correlator.issue("V10", auto_mode(), true, now);
        assert!(outcome.cancelled_timer);
        let events: Vec<&str> = outcome.emit.iter().map(|c| c.event_name()).collect();
        assert_eq!(events, vec!["cancel_timer", "set_auto_mode"]);
        assert!(correlator.timer_for("V10").is_none());
    }

    #[test]
    fn enabling_auto_mode_supersedes_a_pending_timer_command() {
        let now = Instant::now();
        let mut correlator = correlator();
        let timer = correlator.issue(
            "V10",
            CommandKind::SetTimer {
                value: SwitchState::On,
                delay: Duration::from_secs(600),
            },
            false,
            now,
        );
        let outcome = correlator.issue("V10", auto_mode(), false, now);
        let superseded = outcome.superseded.expect("timer command superseded");
        assert_eq!(superseded.command_id, timer.command_id);
        assert!(matches!(
            superseded.result,
            Err(CommandError::Superseded { .. })
        ));

        let sent: Vec<&str> = correlator
            .flush_deferred(now)
            .iter()
            .map(|c| c.event_name())
            .collect();
        assert_eq!(sent, vec!["cancel_timer", "set_auto_mode"]);
    }

    #[test]
    fn acks_only_resolve_matching_command_kinds() {
        let now = Instant::now();
        let mut correlator = correlator();
        correlator.issue("V10", auto_mode(), true, now);
        assert!(correlator.on_ack(&ack("V10", AckKind::Device)).is_none());
        assert!(correlator.on_ack(&ack("V99", AckKind::AutoMode)).is_none());

        let rejected = correlator
            .on_ack(&Ack {
                device_key: "V10".to_string(),
                kind: AckKind::AutoMode,
                rejected: Some("thresholds out of range".to_string()),
            })
            .expect("resolved");
        assert!(matches!(rejected.result, Err(CommandError::Rejected { .. })));
    }

    #[test]
    fn timer_lifecycle_maintains_the_table() {
        let now = Instant::now();
        let mut correlator = correlator();
        correlator.issue(
            "V12",
            CommandKind::SetTimer {
                value: SwitchState::On,
                delay: Duration::from_secs(60),
            },
            true,
            now,
        );
        let resolution = correlator
            .on_timer(TimerPhase::Set, &timer_payload("V12"))
            .expect("timer_set resolves set_timer");
        assert!(resolution.result.is_ok());
        assert_eq!(correlator.scheduled_timers().len(), 1);

        assert!(correlator
            .on_timer(TimerPhase::Executed, &timer_payload("V12"))
            .is_none());
        assert!(correlator.scheduled_timers().is_empty());
    }
}
