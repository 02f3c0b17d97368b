use crate::commands::{
    Ack, AckKind, CommandCorrelator, CommandKind, PendingCommand, Resolution, ScheduledTimer,
};
use crate::config::SyncConfig;
use crate::connection::{
    BackoffPolicy, ConnectionManager, ConnectionSnapshot, ConnectionState, Transition,
};
use crate::dispatcher::{Dispatcher, DomainAction, TimerPhase};
use crate::error::{CommandError, SyncError, UiError};
use crate::notifications::{NotificationReconciler, ReadMark};
use crate::presence::PresenceTracker;
use crate::rest::RestApi;
use crate::store::{Listener, LoadingFlag, Store, StoreAction, StoreState, SubscriptionId};
use crate::transport::{spawn_link, Connector, LinkEvent, LinkHandle};
use chrono::{DateTime, Utc};
use garden_core::wire::{
    encode_frame, AckStatus, MarkNotificationReadPayload, SendNotificationPayload,
};
use garden_core::{
    ChannelFrame, ClientCommand, Device, DeviceMode, Notification, NotificationPage,
    PaginationInfo, SwitchState, ThresholdDirection, Thresholds, UserProfile,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

const REQUEST_QUEUE: usize = 256;
const ERROR_FANOUT: usize = 64;

/// Everything a UI renders, published after each processed input.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub store: Arc<StoreState>,
    pub unread_count: usize,
    pub pagination: PaginationInfo,
    pub recent: Vec<Notification>,
    pub online_users: Vec<String>,
    pub pending_commands: Vec<PendingCommand>,
    pub scheduled_timers: Vec<ScheduledTimer>,
}

impl Snapshot {
    fn empty(page_size: usize) -> Self {
        Self {
            store: Arc::new(StoreState::default()),
            unread_count: 0,
            pagination: PaginationInfo::derive(0, page_size, 1),
            recent: Vec::new(),
            online_users: Vec::new(),
            pending_commands: Vec::new(),
            scheduled_timers: Vec::new(),
        }
    }

    pub fn connection(&self) -> &ConnectionSnapshot {
        &self.store.connection
    }
}

enum Request {
    Connect,
    Disconnect,
    Issue {
        device_key: String,
        kind: CommandKind,
        reply: oneshot::Sender<Result<(), CommandError>>,
    },
    RegisterPresence(String),
    SendNotification {
        receiver_id: String,
        message: String,
    },
    SeedNotifications(NotificationPage),
    SeedDevices {
        location: String,
        devices: Vec<Device>,
    },
    DevicesUnavailable(String),
    SelectLocation(Option<String>),
    SetLoading {
        flag: LoadingFlag,
        value: bool,
    },
    MarkReadLocal {
        id: String,
        reply: oneshot::Sender<Result<Option<ReadMark>, SyncError>>,
    },
    ConfirmRead(ReadMark),
    RollbackRead {
        id: String,
        message: String,
    },
    QueryPage {
        page: usize,
        page_size: usize,
        reply: oneshot::Sender<Vec<Notification>>,
    },
    SetCurrentPage(usize),
    Subscribe {
        listener: Listener,
        reply: oneshot::Sender<SubscriptionId>,
    },
    Unsubscribe {
        id: SubscriptionId,
        reply: oneshot::Sender<bool>,
    },
    Shutdown,
}

/// The single owner of the channel and every sync component.
///
/// Runs as one task and processes handle requests, link events, the
/// reconnect deadline and command deadlines strictly one at a time.
pub struct SyncService {
    config: Arc<SyncConfig>,
    connector: Arc<dyn Connector>,
    connection: ConnectionManager,
    dispatcher: Dispatcher,
    store: Store,
    notifications: NotificationReconciler,
    commands: CommandCorrelator,
    presence: PresenceTracker,
    link: Option<LinkHandle>,
    link_events: mpsc::UnboundedSender<LinkEvent>,
    responders: HashMap<u64, oneshot::Sender<Result<(), CommandError>>>,
    snapshot_tx: watch::Sender<Snapshot>,
    errors_tx: broadcast::Sender<UiError>,
}

impl SyncService {
    pub fn spawn(
        config: SyncConfig,
        connector: Arc<dyn Connector>,
        rest: Arc<dyn RestApi>,
    ) -> SyncHandle {
        Self::spawn_with_dispatcher(config, connector, rest, Dispatcher::with_defaults())
    }

    pub fn spawn_with_dispatcher(
        config: SyncConfig,
        connector: Arc<dyn Connector>,
        rest: Arc<dyn RestApi>,
        dispatcher: Dispatcher,
    ) -> SyncHandle {
        let config = Arc::new(config);
        let (requests_tx, requests_rx) = mpsc::channel(REQUEST_QUEUE);
        let (link_events_tx, link_events_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) =
            watch::channel(Snapshot::empty(config.notification_page_size));
        let (errors_tx, _) = broadcast::channel(ERROR_FANOUT);

        let service = SyncService {
            connection: ConnectionManager::new(BackoffPolicy {
                initial: config.initial_backoff,
                max: config.max_backoff,
                max_attempts: config.max_reconnect_attempts,
            }),
            dispatcher,
            store: Store::default(),
            notifications: NotificationReconciler::new(config.notification_page_size),
            commands: CommandCorrelator::new(config.command_timeout, config.connect_wait),
            presence: PresenceTracker::new(),
            link: None,
            link_events: link_events_tx,
            responders: HashMap::new(),
            snapshot_tx,
            errors_tx: errors_tx.clone(),
            connector,
            config: Arc::clone(&config),
        };
        tokio::spawn(service.run(requests_rx, link_events_rx));

        SyncHandle {
            requests: requests_tx,
            snapshot: snapshot_rx,
            errors: errors_tx,
            rest,
            config,
        }
    }

    async fn run(
        mut self,
        mut requests: mpsc::Receiver<Request>,
        mut link_events: mpsc::UnboundedReceiver<LinkEvent>,
    ) {
        info!(event = "sync_service_start", ws_url = %self.config.ws_url);
        loop {
            let retry_at = self.connection.retry_deadline();
            let command_at = self.commands.next_deadline();
            tokio::select! {
                request = requests.recv() => match request {
                    Some(Request::Shutdown) | None => break,
                    Some(request) => self.handle_request(request),
                },
                Some(event) = link_events.recv() => self.handle_link_event(event),
                _ = sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                    if let Some(transition) = self.connection.on_retry_due(Instant::now()) {
                        self.apply_transition(transition);
                    }
                }
                _ = sleep_until(command_at.unwrap_or_else(Instant::now)), if command_at.is_some() => {
                    for resolution in self.commands.expire(Instant::now()) {
                        self.resolve(resolution);
                    }
                }
            }
            self.publish();
        }
        self.stop();
    }

    fn handle_request(&mut self, request: Request) {
        match request {
            Request::Connect => {
                if let Some(transition) = self.connection.connect() {
                    info!(event = "sync_connect", ws_url = %self.config.ws_url);
                    self.apply_transition(transition);
                }
            }
            Request::Disconnect => {
                if let Some(transition) = self.connection.disconnect() {
                    self.apply_transition(transition);
                }
            }
            Request::Issue {
                device_key,
                kind,
                reply,
            } => self.issue(device_key, kind, reply),
            Request::RegisterPresence(user_id) => {
                let command = self.presence.register(&user_id);
                if self.connection.is_connected() {
                    self.send_command(&command);
                }
            }
            Request::SendNotification {
                receiver_id,
                message,
            } => {
                self.send_command(&ClientCommand::SendNotification(SendNotificationPayload {
                    receiver_id,
                    message,
                }));
            }
            Request::SeedNotifications(page) => {
                self.notifications.replace_snapshot(page);
                self.store.dispatch(&StoreAction::SetLoading {
                    flag: LoadingFlag::Notifications,
                    value: false,
                });
            }
            Request::SeedDevices { location, devices } => {
                self.store
                    .dispatch(&StoreAction::ReplaceDevices { location, devices });
            }
            Request::DevicesUnavailable(location) => {
                self.store
                    .dispatch(&StoreAction::DevicesUnavailable { location });
            }
            Request::SelectLocation(location) => {
                self.store.dispatch(&StoreAction::SelectLocation(location));
            }
            Request::SetLoading { flag, value } => {
                self.store.dispatch(&StoreAction::SetLoading { flag, value });
            }
            Request::MarkReadLocal { id, reply } => {
                let _ = reply.send(self.notifications.mark_read_optimistic(&id));
            }
            Request::ConfirmRead(mark) => {
                self.notifications.confirm_read(&mark.id);
                self.send_command(&ClientCommand::MarkNotificationRead(
                    MarkNotificationReadPayload {
                        id: mark.id,
                        receiver_id: mark.receiver_id,
                    },
                ));
            }
            Request::RollbackRead { id, message } => {
                if self.notifications.rollback_read(&id) {
                    warn!(event = "sync_read_rollback", notification_id = %id, error = %message);
                    self.report(UiError::ReadMarkRejected { id, message });
                }
            }
            Request::QueryPage {
                page,
                page_size,
                reply,
            } => {
                let _ = reply.send(self.notifications.page(page, page_size));
            }
            Request::SetCurrentPage(page) => self.notifications.set_current_page(page),
            Request::Subscribe { listener, reply } => {
                let _ = reply.send(self.store.subscribe(listener));
            }
            Request::Unsubscribe { id, reply } => {
                let _ = reply.send(self.store.unsubscribe(id));
            }
            Request::Shutdown => {}
        }
    }

    fn issue(
        &mut self,
        device_key: String,
        kind: CommandKind,
        reply: oneshot::Sender<Result<(), CommandError>>,
    ) {
        let connected = self.connection.is_connected();
        let outcome = self
            .commands
            .issue(&device_key, kind, connected, Instant::now());
        if let Some(superseded) = outcome.superseded {
            self.resolve(superseded);
        }
        self.responders.insert(outcome.command_id, reply);
        for command in &outcome.emit {
            self.send_command(command);
        }
        if !connected {
            if let Some(transition) = self.connection.connect() {
                self.apply_transition(transition);
            }
        }
    }

    fn handle_link_event(&mut self, event: LinkEvent) {
        if event.generation() != self.connection.generation() {
            debug!(
                event = "sync_link_event_stale",
                generation = event.generation(),
                current = self.connection.generation()
            );
            return;
        }
        match event {
            LinkEvent::Opened { generation } => {
                if let Some(transition) = self.connection.on_opened(generation) {
                    self.apply_transition(transition);
                }
            }
            LinkEvent::Closed { generation, reason } => {
                if let Some(transition) =
                    self.connection
                        .on_closed(generation, &reason, Instant::now())
                {
                    self.apply_transition(transition);
                }
            }
            LinkEvent::Frame {
                generation,
                frame,
                received_at,
            } => {
                if !self.connection.is_connected() {
                    debug!(
                        event = "sync_frame_stale",
                        generation,
                        event_name = %frame.event
                    );
                    return;
                }
                self.handle_frame(&frame, received_at);
            }
        }
    }

    fn handle_frame(&mut self, frame: &ChannelFrame, received_at: DateTime<Utc>) {
        let action = match self.dispatcher.dispatch(frame, received_at) {
            Ok(Some(action)) => action,
            Ok(None) | Err(_) => return,
        };
        match action {
            DomainAction::Store(action) => {
                self.store.dispatch(&action);
            }
            DomainAction::DeviceAck(ack) => {
                let rejected = rejection(ack.status, ack.message.as_deref());
                let resolution = self.commands.on_ack(&Ack {
                    device_key: ack.device_key.clone(),
                    kind: AckKind::Device,
                    rejected: rejected.clone(),
                });
                if rejected.is_none() {
                    self.store.dispatch(&StoreAction::DeviceAcked {
                        device_key: ack.device_key,
                        state: ack.state,
                        mode: ack.mode,
                    });
                }
                if let Some(resolution) = resolution {
                    self.resolve(resolution);
                }
            }
            DomainAction::Timer { phase, payload } => {
                debug!(
                    event = "sync_timer",
                    phase = phase.as_str(),
                    device_key = %payload.device_key
                );
                if phase == TimerPhase::Executed && payload.value.is_some() {
                    self.store.dispatch(&StoreAction::DeviceAcked {
                        device_key: payload.device_key.clone(),
                        state: payload.value,
                        mode: None,
                    });
                }
                if let Some(resolution) = self.commands.on_timer(phase, &payload) {
                    self.resolve(resolution);
                }
            }
            DomainAction::AutoModeAck(ack) => {
                let rejected = rejection(ack.status, ack.message.as_deref());
                let resolution = self.commands.on_ack(&Ack {
                    device_key: ack.device_key.clone(),
                    kind: AckKind::AutoMode,
                    rejected: rejected.clone(),
                });
                if rejected.is_none() {
                    let mode = if ack.enabled {
                        DeviceMode::Automatic
                    } else {
                        DeviceMode::Manual
                    };
                    self.store.dispatch(&StoreAction::DeviceAcked {
                        device_key: ack.device_key.clone(),
                        state: None,
                        mode: Some(mode),
                    });
                    if let Some(thresholds) = ack.thresholds {
                        self.store.dispatch(&StoreAction::DeviceThresholds {
                            device_key: ack.device_key,
                            thresholds,
                        });
                    }
                }
                if let Some(resolution) = resolution {
                    self.resolve(resolution);
                }
            }
            DomainAction::ThresholdAck(ack) => {
                let rejected = rejection(ack.status, ack.message.as_deref());
                let resolution = self.commands.on_ack(&Ack {
                    device_key: ack.device_key.clone(),
                    kind: AckKind::Threshold,
                    rejected: rejected.clone(),
                });
                if rejected.is_none() {
                    self.store.dispatch(&StoreAction::DeviceThresholds {
                        device_key: ack.device_key,
                        thresholds: ack.thresholds,
                    });
                }
                if let Some(resolution) = resolution {
                    self.resolve(resolution);
                }
            }
            DomainAction::NotificationPushed(notification) => {
                self.notifications.push(notification);
            }
            DomainAction::NotificationRead(read) => {
                self.notifications.apply_remote_read(&read.id);
            }
            DomainAction::Presence(users) => {
                self.presence.replace(users);
            }
            DomainAction::ServerError(error) => {
                warn!(
                    event = "sync_server_error",
                    message = %error.message,
                    code = error.code.as_deref().unwrap_or("")
                );
                self.report(UiError::Server {
                    message: error.message,
                    code: error.code,
                });
            }
        }
    }

    fn apply_transition(&mut self, transition: Transition) {
        if transition.close.is_some() {
            self.close_link();
        }
        let state = transition.snapshot.state;
        let last_error = transition.snapshot.last_error.clone();
        self.store
            .dispatch(&StoreAction::Connection(transition.snapshot));

        if let Some(generation) = transition.open {
            self.close_link();
            self.link = Some(spawn_link(
                Arc::clone(&self.connector),
                generation,
                self.link_events.clone(),
                self.config.max_frame_bytes,
            ));
        }

        if state == ConnectionState::Connected {
            if let Some(register) = self.presence.reregistration() {
                self.send_command(&register);
            }
            for frame in &transition.flushed {
                self.transmit(frame);
            }
            for command in self.commands.flush_deferred(Instant::now()) {
                self.send_command(&command);
            }
        }

        if transition.fatal {
            self.report(UiError::FatalConnectivity {
                attempts: self.config.max_reconnect_attempts,
                last_error: last_error.unwrap_or_default(),
            });
        }
    }

    fn close_link(&mut self) {
        if let Some(link) = self.link.take() {
            debug!(event = "sync_link_close", generation = link.generation());
            link.close();
        }
    }

    fn send_command(&mut self, command: &ClientCommand) {
        match command.to_frame() {
            Ok(frame) if self.connection.is_connected() => self.transmit(&frame),
            Ok(frame) => {
                debug!(
                    event = "sync_command_queued",
                    command = command.event_name(),
                    device_key = command.device_key().unwrap_or("-")
                );
                self.connection.queue(frame);
            }
            Err(err) => warn!(
                event = "sync_command_encode_error",
                command = command.event_name(),
                error = %err
            ),
        }
    }

    fn transmit(&self, frame: &ChannelFrame) {
        let Some(link) = &self.link else {
            warn!(event = "sync_send_dropped", reason = "no_link", event_name = %frame.event);
            return;
        };
        let result = encode_frame(frame, self.config.max_frame_bytes)
            .map_err(SyncError::from)
            .and_then(|text| link.send(text).map_err(SyncError::from));
        match result {
            Ok(()) => debug!(event = "sync_send", event_name = %frame.event),
            Err(err) => warn!(event = "sync_send_error", event_name = %frame.event, error = %err),
        }
    }

    fn resolve(&mut self, resolution: Resolution) {
        let Resolution {
            command_id, result, ..
        } = resolution;
        let failure = result.as_ref().err().cloned();
        let delivered = match self.responders.remove(&command_id) {
            Some(reply) => reply.send(result).is_ok(),
            None => false,
        };
        if let (false, Some(error)) = (delivered, failure) {
            self.report(UiError::CommandFailed(error));
        }
    }

    fn report(&self, error: UiError) {
        // No receivers is fine; errors are advisory.
        let _ = self.errors_tx.send(error);
    }

    fn publish(&self) {
        let next = Snapshot {
            store: self.store.state(),
            unread_count: self.notifications.unread_count(),
            pagination: self.notifications.pagination(),
            recent: self
                .notifications
                .recent(self.config.recent_notifications),
            online_users: self.presence.online(),
            pending_commands: self.commands.pending(),
            scheduled_timers: self.commands.scheduled_timers(),
        };
        self.snapshot_tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    fn stop(&mut self) {
        for resolution in self.commands.drain() {
            if let Some(reply) = self.responders.remove(&resolution.command_id) {
                let _ = reply.send(resolution.result);
            }
        }
        self.close_link();
        info!(event = "sync_service_stop");
    }
}

fn rejection(status: AckStatus, message: Option<&str>) -> Option<String> {
    match status {
        AckStatus::Ok => None,
        AckStatus::Error => Some(message.unwrap_or("rejected by device").to_string()),
    }
}

/// Cloneable entry point to the running [`SyncService`].
#[derive(Clone)]
pub struct SyncHandle {
    requests: mpsc::Sender<Request>,
    snapshot: watch::Receiver<Snapshot>,
    errors: broadcast::Sender<UiError>,
    rest: Arc<dyn RestApi>,
    config: Arc<SyncConfig>,
}

impl SyncHandle {
    async fn request(&self, request: Request) -> Result<(), SyncError> {
        self.requests
            .send(request)
            .await
            .map_err(|_| SyncError::ServiceStopped)
    }

    async fn query<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Request,
    ) -> Result<T, SyncError> {
        let (reply, response) = oneshot::channel();
        self.request(build(reply)).await?;
        response.await.map_err(|_| SyncError::ServiceStopped)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub async fn connect(&self) -> Result<(), SyncError> {
        self.request(Request::Connect).await
    }

    /// Closes the channel and stops automatic reconnection until the next
    /// [`connect`](Self::connect).
    pub async fn disconnect(&self) -> Result<(), SyncError> {
        self.request(Request::Disconnect).await
    }

    pub fn is_connected(&self) -> bool {
        self.snapshot.borrow().connection().state == ConnectionState::Connected
    }

    pub fn connection(&self) -> ConnectionSnapshot {
        self.snapshot.borrow().connection().clone()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Snapshot> {
        self.snapshot.clone()
    }

    pub fn errors(&self) -> broadcast::Receiver<UiError> {
        self.errors.subscribe()
    }

    /// Registers a store listener that runs on the service task after every
    /// store update.
    pub async fn subscribe(&self, listener: Listener) -> Result<SubscriptionId, SyncError> {
        self.query(|reply| Request::Subscribe { listener, reply })
            .await
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) -> Result<bool, SyncError> {
        self.query(|reply| Request::Unsubscribe { id, reply }).await
    }

    async fn issue(&self, device_key: &str, kind: CommandKind) -> Result<(), CommandError> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(Request::Issue {
                device_key: device_key.to_string(),
                kind,
                reply,
            })
            .await
            .map_err(|_| CommandError::ServiceStopped)?;
        response.await.map_err(|_| CommandError::ServiceStopped)?
    }

    pub async fn set_actuator(&self, device_key: &str, value: SwitchState) -> Result<(), CommandError> {
        self.issue(device_key, CommandKind::Actuator { value }).await
    }

    pub async fn set_timer(
        &self,
        device_key: &str,
        value: SwitchState,
        delay: Duration,
    ) -> Result<(), CommandError> {
        self.issue(device_key, CommandKind::SetTimer { value, delay })
            .await
    }

    pub async fn cancel_timer(&self, device_key: &str) -> Result<(), CommandError> {
        self.issue(device_key, CommandKind::CancelTimer).await
    }

    /// Switches automatic mode. Enabling it also cancels any timer on the
    /// device. The switching direction comes from the device kind.
    pub async fn set_auto_mode(
        &self,
        device_key: &str,
        enabled: bool,
        thresholds: Thresholds,
    ) -> Result<(), CommandError> {
        let direction = self.direction_for(device_key);
        self.issue(
            device_key,
            CommandKind::AutoMode {
                enabled,
                thresholds,
                direction,
            },
        )
        .await
    }

    pub async fn update_thresholds(
        &self,
        device_key: &str,
        thresholds: Thresholds,
    ) -> Result<(), CommandError> {
        self.issue(device_key, CommandKind::UpdateThresholds { thresholds })
            .await
    }

    fn direction_for(&self, device_key: &str) -> ThresholdDirection {
        let snapshot = self.snapshot.borrow();
        match snapshot.store.device(device_key) {
            Some(device) => self.config.threshold_direction(&device.kind),
            None => self.config.default_threshold_direction,
        }
    }

    pub async fn register_presence(&self, user_id: &str) -> Result<(), SyncError> {
        self.request(Request::RegisterPresence(user_id.to_string()))
            .await
    }

    pub async fn send_notification(&self, receiver_id: &str, message: &str) -> Result<(), SyncError> {
        self.request(Request::SendNotification {
            receiver_id: receiver_id.to_string(),
            message: message.to_string(),
        })
        .await
    }

    pub async fn load_current_user(&self) -> Result<UserProfile, SyncError> {
        self.set_loading(LoadingFlag::User, true).await?;
        let result = self.rest.current_user().await;
        self.set_loading(LoadingFlag::User, false).await?;
        Ok(result?)
    }

    /// Fetches a notification page and replaces the known set with it.
    pub async fn load_notifications(&self, user_id: &str, page: usize) -> Result<(), SyncError> {
        self.set_loading(LoadingFlag::Notifications, true).await?;
        match self
            .rest
            .notifications(user_id, page, self.config.notification_page_size)
            .await
        {
            Ok(snapshot) => self.request(Request::SeedNotifications(snapshot)).await,
            Err(err) => {
                warn!(event = "sync_notifications_load_error", user_id, error = %err);
                self.set_loading(LoadingFlag::Notifications, false).await?;
                Err(err.into())
            }
        }
    }

    /// Switches location and loads its devices. A slower response for a
    /// location that is no longer selected is discarded.
    pub async fn select_location(&self, location_id: &str) -> Result<(), SyncError> {
        self.request(Request::SelectLocation(Some(location_id.to_string())))
            .await?;
        match self.rest.devices_for_location(location_id).await {
            Ok(devices) => {
                self.request(Request::SeedDevices {
                    location: location_id.to_string(),
                    devices,
                })
                .await
            }
            Err(err) => {
                warn!(event = "sync_devices_load_error", location_id, error = %err);
                self.request(Request::DevicesUnavailable(location_id.to_string()))
                    .await?;
                Err(err.into())
            }
        }
    }

    /// Optimistically marks a notification read, confirms with the server and
    /// rolls back when the server refuses.
    pub async fn mark_read(&self, id: &str) -> Result<(), SyncError> {
        let mark = self
            .query(|reply| Request::MarkReadLocal {
                id: id.to_string(),
                reply,
            })
            .await??;
        let Some(mark) = mark else {
            return Ok(());
        };
        match self.rest.mark_notification_read(&mark.id).await {
            Ok(()) => self.request(Request::ConfirmRead(mark)).await,
            Err(err) => {
                self.request(Request::RollbackRead {
                    id: mark.id,
                    message: err.to_string(),
                })
                .await?;
                Err(err.into())
            }
        }
    }

    pub async fn page(&self, page: usize, page_size: usize) -> Result<Vec<Notification>, SyncError> {
        self.query(|reply| Request::QueryPage {
            page,
            page_size,
            reply,
        })
        .await
    }

    /// Shows `page` of the full listing, fetching it from the server when it
    /// lies outside the loaded window.
    pub async fn open_page(
        &self,
        user_id: &str,
        page: usize,
    ) -> Result<Vec<Notification>, SyncError> {
        let pagination = self.snapshot.borrow().pagination;
        let mut items = self.page(page, pagination.page_size).await?;
        if items.is_empty() && page >= 1 && page <= pagination.page_count {
            self.load_notifications(user_id, page).await?;
            let page_size = self.snapshot.borrow().pagination.page_size;
            items = self.page(page, page_size).await?;
        }
        self.set_current_page(page).await?;
        Ok(items)
    }

    pub async fn set_current_page(&self, page: usize) -> Result<(), SyncError> {
        self.request(Request::SetCurrentPage(page)).await
    }

    pub fn recent(&self) -> Vec<Notification> {
        self.snapshot.borrow().recent.clone()
    }

    async fn set_loading(&self, flag: LoadingFlag, value: bool) -> Result<(), SyncError> {
        self.request(Request::SetLoading { flag, value }).await
    }

    /// Stops the service, failing pending commands, and waits for it to exit.
    pub async fn shutdown(&self) {
        if self.requests.send(Request::Shutdown).await.is_ok() {
            self.requests.closed().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RestError;
    use crate::transport::memory::{MemoryConnector, MemoryPeer};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct StubRest {
        notifications: Vec<Notification>,
        devices: Vec<Device>,
        reject_reads: bool,
        paginate: bool,
        fail_devices: bool,
        read_calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RestApi for StubRest {
        async fn current_user(&self) -> Result<UserProfile, RestError> {
            Ok(UserProfile {
                id: "1".to_string(),
                email: "a@x".to_string(),
                display_name: None,
                role: None,
            })
        }

        async fn notifications(
            &self,
            _user_id: &str,
            page: usize,
            page_size: usize,
        ) -> Result<NotificationPage, RestError> {
            if !self.paginate {
                return Ok(NotificationPage {
                    notifications: self.notifications.clone(),
                    pagination: None,
                });
            }
            let start = (page.max(1) - 1) * page_size;
            Ok(NotificationPage {
                notifications: self
                    .notifications
                    .iter()
                    .skip(start)
                    .take(page_size)
                    .cloned()
                    .collect(),
                pagination: Some(garden_core::PaginationMeta {
                    total_count: self.notifications.len(),
                    page_size: Some(page_size),
                    current_page: Some(page),
                }),
            })
        }

        async fn mark_notification_read(&self, id: &str) -> Result<(), RestError> {
            if let Ok(mut calls) = self.read_calls.lock() {
                calls.push(id.to_string());
            }
            if self.reject_reads {
                return Err(RestError::Status {
                    status: 409,
                    message: "already archived".to_string(),
                });
            }
            Ok(())
        }

        async fn devices_for_location(&self, _location_id: &str) -> Result<Vec<Device>, RestError> {
            if self.fail_devices {
                return Err(RestError::Network("connection reset".to_string()));
            }
            Ok(self.devices.clone())
        }
    }

    fn config() -> SyncConfig {
        SyncConfig {
            max_reconnect_attempts: 3,
            ..SyncConfig::default()
        }
    }

    fn notification(id: usize) -> Notification {
        Notification {
            id: format!("n{id}"),
            sender_id: "system".to_string(),
            receiver_id: "a@x".to_string(),
            message: format!("message {id}"),
            created_at: Utc.with_ymd_and_hms(2026, 3, 1, 10, id as u32, 0).unwrap(),
            read: false,
        }
    }

    fn pump() -> Device {
        Device {
            device_id: "7".to_string(),
            display_name: "Drip pump".to_string(),
            feed_key: "V10".to_string(),
            category: garden_core::DeviceCategory::Actuator,
            kind: "pump".to_string(),
            thresholds: Thresholds::default(),
            is_active: true,
            mode: DeviceMode::Manual,
            last_command_state: Some(SwitchState::On),
        }
    }

    async fn wait_for(handle: &SyncHandle, predicate: impl FnMut(&Snapshot) -> bool) {
        let mut rx = handle.watch();
        rx.wait_for(predicate).await.map(|_| ()).expect("service alive");
    }

    async fn connected(
        handle: &SyncHandle,
        peers: &mut mpsc::UnboundedReceiver<MemoryPeer>,
    ) -> MemoryPeer {
        handle.connect().await.expect("connect");
        let peer = peers.recv().await.expect("accepted");
        wait_for(handle, |s| s.connection().state == ConnectionState::Connected).await;
        peer
    }

    #[tokio::test(start_paused = true)]
    async fn offline_command_is_sent_once_after_connecting() {
        let (connector, mut peers) = MemoryConnector::new();
        let handle = SyncService::spawn(config(), connector, Arc::new(StubRest::default()));
        assert!(!handle.is_connected());

        let issuer = handle.clone();
        let issued = tokio::spawn(async move { issuer.set_actuator("V10", SwitchState::On).await });

        let mut peer = peers.recv().await.expect("connect requested by command");
        let frame = peer.next_frame().await.expect("command frame");
        assert_eq!(frame.event, "device_control");
        assert_eq!(frame.data, json!({"deviceKey": "V10", "value": "ON"}));

        peer.push("device_ack", json!({"deviceKey": "V10", "state": "ON"}));
        assert_eq!(issued.await.expect("join"), Ok(()));
        assert!(peer.drain().is_empty());
        assert!(handle.snapshot().pending_commands.is_empty());
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn unacknowledged_command_fails_after_timeout() {
        let (connector, mut peers) = MemoryConnector::new();
        let handle = SyncService::spawn(config(), connector, Arc::new(StubRest::default()));
        let _peer = connected(&handle, &mut peers).await;

        let started = Instant::now();
        let result = handle.set_actuator("V10", SwitchState::Off).await;
        assert!(matches!(result, Err(CommandError::NotAcknowledged { .. })));
        assert!(started.elapsed() >= Duration::from_millis(5_000));
        if let Err(err) = &result {
            assert!(err.is_retryable());
        }
        wait_for(&handle, |s| s.pending_commands.is_empty()).await;
    }

    #[tokio::test(start_paused = true)]
    async fn offline_command_reports_dispatch_timeout() {
        let (connector, _peers) = MemoryConnector::refusing();
        let handle = SyncService::spawn(
            SyncConfig {
                max_reconnect_attempts: 50,
                ..config()
            },
            connector,
            Arc::new(StubRest::default()),
        );
        let result = handle.set_actuator("V10", SwitchState::On).await;
        assert!(matches!(
            result,
            Err(CommandError::DispatchTimeout { wait_ms: 3_000, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn enabling_auto_mode_cancels_the_pending_timer() {
        let (connector, mut peers) = MemoryConnector::new();
        let handle = SyncService::spawn(config(), connector, Arc::new(StubRest::default()));
        let mut peer = connected(&handle, &mut peers).await;

        peer.push(
            "timer_set",
            json!({"deviceKey": "V10", "value": "ON", "executeAt": "2026-03-01T12:00:00Z"}),
        );
        wait_for(&handle, |s| s.scheduled_timers.len() == 1).await;

        let issuer = handle.clone();
        let switched = tokio::spawn(async move {
            issuer
                .set_auto_mode("V10", true, Thresholds::new(30.0, 60.0))
                .await
        });
        let first = peer.next_frame().await.expect("cancel");
        let second = peer.next_frame().await.expect("auto mode");
        assert_eq!(first.event, "cancel_timer");
        assert_eq!(second.event, "set_auto_mode");
        assert_eq!(second.data["direction"], json!("above"));
        assert!(handle.snapshot().scheduled_timers.is_empty());

        peer.push("auto_mode_ack", json!({"deviceKey": "V10", "enabled": true}));
        assert_eq!(switched.await.expect("join"), Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn drop_reconnects_and_disconnect_stops_retries() {
        let (connector, mut peers) = MemoryConnector::new();
        let handle = SyncService::spawn(config(), connector, Arc::new(StubRest::default()));
        let peer = connected(&handle, &mut peers).await;
        handle.register_presence("a@x").await.expect("register");

        peer.fail("socket reset");
        wait_for(&handle, |s| s.connection().state == ConnectionState::Reconnecting).await;
        assert_eq!(handle.connection().attempt, 1);

        let mut second = peers.recv().await.expect("automatic reconnect");
        wait_for(&handle, |s| s.connection().state == ConnectionState::Connected).await;
        assert_eq!(handle.connection().attempt, 0);
        let register = second.next_frame().await.expect("re-register");
        assert_eq!(register.event, "register");
        assert_eq!(register.data, json!({"userId": "a@x"}));

        handle.disconnect().await.expect("disconnect");
        wait_for(&handle, |s| s.connection().state == ConnectionState::Disconnected).await;
        second.push("temperature_update", json!({"deviceKey": "V1", "value": 20.0}));
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(peers.try_recv().is_err());
        let snapshot = handle.snapshot();
        assert_eq!(snapshot.connection().state, ConnectionState::Disconnected);
        assert!(snapshot.store.readings.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_surface_fatal_error() {
        let (connector, _peers) = MemoryConnector::refusing();
        let handle = SyncService::spawn(
            SyncConfig {
                max_reconnect_attempts: 2,
                ..config()
            },
            connector,
            Arc::new(StubRest::default()),
        );
        let mut errors = handle.errors();
        handle.connect().await.expect("connect");

        match errors.recv().await.expect("fatal error") {
            UiError::FatalConnectivity { attempts, last_error } => {
                assert_eq!(attempts, 2);
                assert!(last_error.contains("refused"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        wait_for(&handle, |s| s.connection().degraded).await;
        assert_eq!(handle.connection().state, ConnectionState::Disconnected);
        assert!(!handle.snapshot().store.readings_are_live());
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_read_mark_rolls_back() {
        let (connector, _peers) = MemoryConnector::new();
        let rest = Arc::new(StubRest {
            notifications: (1..=3).map(notification).collect(),
            reject_reads: true,
            ..StubRest::default()
        });
        let handle = SyncService::spawn(config(), connector, rest.clone());
        let mut errors = handle.errors();

        handle.load_notifications("a@x", 1).await.expect("load");
        wait_for(&handle, |s| s.unread_count == 3).await;

        let result = handle.mark_read("n2").await;
        assert!(matches!(
            result,
            Err(SyncError::Rest(RestError::Status { status: 409, .. }))
        ));
        wait_for(&handle, |s| s.unread_count == 3).await;
        assert_eq!(
            errors.recv().await.expect("soft error"),
            UiError::ReadMarkRejected {
                id: "n2".to_string(),
                message: "server returned 409: already archived".to_string(),
            }
        );
        assert_eq!(
            rest.read_calls.lock().map(|calls| calls.clone()).unwrap_or_default(),
            vec!["n2".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn confirmed_read_is_broadcast_on_the_channel() {
        let (connector, mut peers) = MemoryConnector::new();
        let rest = Arc::new(StubRest {
            notifications: (1..=3).map(notification).collect(),
            ..StubRest::default()
        });
        let handle = SyncService::spawn(config(), connector, rest);
        let mut peer = connected(&handle, &mut peers).await;
        handle.load_notifications("a@x", 1).await.expect("load");

        handle.mark_read("n1").await.expect("mark read");
        let frame = peer.next_frame().await.expect("read broadcast");
        assert_eq!(frame.event, "mark_notification_read");
        assert_eq!(frame.data, json!({"id": "n1", "receiverId": "a@x"}));
        wait_for(&handle, |s| s.unread_count == 2).await;
    }

    #[tokio::test(start_paused = true)]
    async fn pushed_notifications_are_deduplicated() {
        let (connector, mut peers) = MemoryConnector::new();
        let handle = SyncService::spawn(config(), connector, Arc::new(StubRest::default()));
        let peer = connected(&handle, &mut peers).await;

        let pushed = serde_json::to_value(notification(9)).expect("encode");
        peer.push("new_notification", pushed.clone());
        peer.push("notification", pushed);
        peer.push("online_users", json!(["a@x", "b@x"]));
        wait_for(&handle, |s| s.online_users.len() == 2).await;

        let snapshot = handle.snapshot();
        assert_eq!(snapshot.recent.len(), 1);
        assert_eq!(snapshot.unread_count, 1);
        assert_eq!(snapshot.pagination.total_count, 1);
        assert_eq!(handle.page(1, 10).await.expect("page").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn telemetry_and_stale_location_snapshots_reach_the_store_in_order() {
        let (connector, mut peers) = MemoryConnector::new();
        let handle = SyncService::spawn(config(), connector, Arc::new(StubRest::default()));
        let peer = connected(&handle, &mut peers).await;

        peer.push("soilMoisture", json!({"deviceKey": "V3", "value": "41.5"}));
        peer.push("soil_moisture_update", json!({"deviceKey": "V3", "value": 39}));
        wait_for(&handle, |s| {
            s.store
                .reading(garden_core::MetricKind::SoilMoisture)
                .map(|r| r.value == 39.0)
                .unwrap_or(false)
        })
        .await;

        handle.select_location("greenhouse").await.expect("select");
        wait_for(&handle, |s| {
            s.store.selected_location.as_deref() == Some("greenhouse") && !s.store.loading.devices
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn store_listeners_see_each_update() {
        let (connector, _peers) = MemoryConnector::new();
        let handle = SyncService::spawn(config(), connector, Arc::new(StubRest::default()));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let id = handle
            .subscribe(Box::new(move |state: &Arc<StoreState>| {
                if let Ok(mut seen) = sink.lock() {
                    seen.push(state.revision);
                }
            }))
            .await
            .expect("subscribe");

        handle.load_current_user().await.expect("user");
        assert!(handle.unsubscribe(id).await.expect("unsubscribe"));
        handle.load_current_user().await.expect("user");

        let revisions = seen.lock().map(|seen| seen.clone()).unwrap_or_default();
        assert_eq!(revisions, vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn executed_timer_updates_the_device() {
        let (connector, mut peers) = MemoryConnector::new();
        let rest = Arc::new(StubRest {
            devices: vec![pump()],
            ..StubRest::default()
        });
        let handle = SyncService::spawn(config(), connector, rest);
        let peer = connected(&handle, &mut peers).await;
        handle.select_location("greenhouse").await.expect("select");
        wait_for(&handle, |s| s.store.device("V10").is_some()).await;

        peer.push(
            "timer_set",
            json!({"deviceKey": "V10", "value": "OFF", "executeAt": "2026-03-01T12:00:00Z"}),
        );
        wait_for(&handle, |s| s.scheduled_timers.len() == 1).await;
        peer.push("timer_executed", json!({"deviceKey": "V10", "value": "OFF"}));
        wait_for(&handle, |s| s.scheduled_timers.is_empty()).await;

        let snapshot = handle.snapshot();
        let device = snapshot.store.device("V10").expect("pump loaded");
        assert_eq!(device.last_command_state, Some(SwitchState::Off));
        assert!(!device.is_active);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_device_load_clears_loading_for_the_selected_location() {
        let (connector, _peers) = MemoryConnector::new();
        let rest = Arc::new(StubRest {
            fail_devices: true,
            ..StubRest::default()
        });
        let handle = SyncService::spawn(config(), connector, rest);

        let result = handle.select_location("orchard").await;
        assert!(matches!(result, Err(SyncError::Rest(RestError::Network(_)))));
        wait_for(&handle, |s| {
            s.store.selected_location.as_deref() == Some("orchard") && !s.store.loading.devices
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn opening_an_unloaded_page_fetches_it() {
        let (connector, _peers) = MemoryConnector::new();
        let rest = Arc::new(StubRest {
            notifications: (1..=23).map(notification).collect(),
            paginate: true,
            ..StubRest::default()
        });
        let handle = SyncService::spawn(config(), connector, rest);
        handle.load_notifications("1", 1).await.expect("load");
        wait_for(&handle, |s| s.pagination.total_count == 23).await;
        assert_eq!(handle.snapshot().pagination.page_count, 3);

        let second: Vec<String> = handle
            .open_page("1", 2)
            .await
            .expect("page 2")
            .into_iter()
            .map(|n| n.id)
            .collect();
        assert_eq!(second.len(), 10);
        assert_eq!(second.first().map(String::as_str), Some("n11"));
        wait_for(&handle, |s| s.pagination.current_page == 2).await;

        let last = handle.open_page("1", 3).await.expect("page 3");
        assert_eq!(last.len(), 3);
        assert_eq!(handle.snapshot().pagination.total_count, 23);
    }
}
