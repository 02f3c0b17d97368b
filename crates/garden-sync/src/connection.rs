use garden_core::ChannelFrame;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

const OUTBOX_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        }
    }
}

/// Read-only view of the connection published to the store.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ConnectionSnapshot {
    pub state: ConnectionState,
    pub attempt: u32,
    pub last_error: Option<String>,
    /// Set once the retry budget is exhausted; cleared by the next successful
    /// connect. While set, readings must not be presented as live.
    pub degraded: bool,
    #[serde(skip)]
    pub backoff_deadline: Option<Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub max_attempts: u32,
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (1-based): doubles from `initial`
    /// up to `max`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let mut delay = self.initial;
        for _ in 1..attempt {
            delay = next_backoff(delay, self.max);
            if delay >= self.max {
                break;
            }
        }
        delay.min(self.max)
    }
}

fn next_backoff(current: Duration, max: Duration) -> Duration {
    let next = current + current;
    if next > max {
        max
    } else {
        next
    }
}

/// Side effects the owner must carry out for one state transition.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub snapshot: ConnectionSnapshot,
    /// Open a new transport tagged with this generation.
    pub open: Option<u64>,
    /// Tear down the transport with this generation.
    pub close: Option<u64>,
    /// Frames queued while the channel was down, in enqueue order.
    pub flushed: Vec<ChannelFrame>,
    pub fatal: bool,
}

impl Transition {
    fn new(snapshot: ConnectionSnapshot) -> Self {
        Self {
            snapshot,
            open: None,
            close: None,
            flushed: Vec::new(),
            fatal: false,
        }
    }
}

/// Connection lifecycle state machine.
///
/// Pure with respect to time and I/O: every method takes the current instant
/// where it matters and returns the effects of the transition, or `None` when
/// the input does not change the state. Each returned [`Transition`] is one
/// emission to subscribers.
#[derive(Debug)]
pub struct ConnectionManager {
    policy: BackoffPolicy,
    state: ConnectionState,
    attempt: u32,
    last_error: Option<String>,
    degraded: bool,
    retry_at: Option<Instant>,
    generation: u64,
    link_open: bool,
    outbox: VecDeque<ChannelFrame>,
}

impl ConnectionManager {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            state: ConnectionState::Disconnected,
            attempt: 0,
            last_error: None,
            degraded: false,
            retry_at: None,
            generation: 0,
            link_open: false,
            outbox: VecDeque::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn retry_deadline(&self) -> Option<Instant> {
        self.retry_at
    }

    pub fn queued(&self) -> usize {
        self.outbox.len()
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            state: self.state,
            attempt: self.attempt,
            last_error: self.last_error.clone(),
            degraded: self.degraded,
            backoff_deadline: self.retry_at,
        }
    }

    pub fn connect(&mut self) -> Option<Transition> {
        match self.state {
            ConnectionState::Connected | ConnectionState::Connecting => None,
            ConnectionState::Disconnected => {
                self.attempt = 0;
                self.degraded = false;
                Some(self.begin_connecting())
            }
            ConnectionState::Reconnecting => Some(self.begin_connecting()),
        }
    }

    /// User-initiated teardown. Sticky: nothing moves the manager out of
    /// `Disconnected` until the next [`connect`](Self::connect).
    pub fn disconnect(&mut self) -> Option<Transition> {
        if self.state == ConnectionState::Disconnected && !self.link_open {
            return None;
        }
        let close = self.link_open.then_some(self.generation);
        self.generation += 1;
        self.link_open = false;
        self.retry_at = None;
        self.attempt = 0;
        self.state = ConnectionState::Disconnected;
        info!(event = "sync_connection_disconnect", reason = "user");
        let mut transition = Transition::new(self.snapshot());
        transition.close = close;
        Some(transition)
    }

    pub fn on_opened(&mut self, generation: u64) -> Option<Transition> {
        if generation != self.generation || self.state != ConnectionState::Connecting {
            return None;
        }
        self.state = ConnectionState::Connected;
        self.attempt = 0;
        self.last_error = None;
        self.degraded = false;
        self.retry_at = None;
        info!(event = "sync_connection_open", generation);
        let mut transition = Transition::new(self.snapshot());
        transition.flushed = self.outbox.drain(..).collect();
        Some(transition)
    }

    /// Transport failure or drop, including a failed connect attempt.
    pub fn on_closed(&mut self, generation: u64, reason: &str, now: Instant) -> Option<Transition> {
        if generation != self.generation
            || !matches!(
                self.state,
                ConnectionState::Connected | ConnectionState::Connecting
            )
        {
            return None;
        }
        self.link_open = false;
        self.last_error = Some(reason.to_string());
        self.attempt = self.attempt.saturating_add(1);

        if self.attempt > self.policy.max_attempts {
            warn!(
                event = "sync_connection_fatal",
                attempts = self.policy.max_attempts,
                error = %reason
            );
            self.state = ConnectionState::Disconnected;
            self.degraded = true;
            self.retry_at = None;
            let mut transition = Transition::new(self.snapshot());
            transition.fatal = true;
            return Some(transition);
        }

        let delay = self.policy.delay_for(self.attempt);
        self.state = ConnectionState::Reconnecting;
        self.retry_at = Some(now + delay);
        warn!(
            event = "sync_connection_retry",
            attempt = self.attempt,
            delay_ms = delay.as_millis() as u64,
            error = %reason
        );
        Some(Transition::new(self.snapshot()))
    }

    pub fn on_retry_due(&mut self, now: Instant) -> Option<Transition> {
        if self.state != ConnectionState::Reconnecting {
            return None;
        }
        match self.retry_at {
            Some(deadline) if deadline <= now => Some(self.begin_connecting()),
            _ => None,
        }
    }

    /// Holds a frame until the next successful open. The oldest frame is
    /// dropped once the outbox is full.
    pub fn queue(&mut self, frame: ChannelFrame) {
        if self.outbox.len() >= OUTBOX_CAPACITY {
            if let Some(dropped) = self.outbox.pop_front() {
                warn!(
                    event = "sync_outbox_drop",
                    reason = "queue_full",
                    dropped_event = %dropped.event,
                    capacity = OUTBOX_CAPACITY
                );
            }
        }
        self.outbox.push_back(frame);
    }

    fn begin_connecting(&mut self) -> Transition {
        let close = self.link_open.then_some(self.generation);
        self.generation += 1;
        self.link_open = true;
        self.retry_at = None;
        self.state = ConnectionState::Connecting;
        let mut transition = Transition::new(self.snapshot());
        transition.open = Some(self.generation);
        transition.close = close;
        transition
    }
}
