//! Real-time synchronization layer for the garden dashboard: one channel to
//! the server, a reducer-backed store, notification reconciliation, device
//! command correlation and presence.

pub mod commands;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod notifications;
pub mod presence;
pub mod rest;
pub mod service;
pub mod store;
pub mod transport;

pub use commands::{CommandCorrelator, CommandKind, PendingCommand, ScheduledTimer};
pub use config::SyncConfig;
pub use connection::{ConnectionManager, ConnectionSnapshot, ConnectionState};
pub use dispatcher::{Dispatcher, DomainAction};
pub use error::{CommandError, DispatchError, RestError, SyncError, TransportError, UiError};
pub use notifications::NotificationReconciler;
pub use presence::PresenceTracker;
pub use rest::{HttpRestApi, RestApi, StaticToken, TokenSource};
pub use service::{Snapshot, SyncHandle, SyncService};
pub use store::{reduce, LoadingFlag, Store, StoreAction, StoreState, SubscriptionId};
pub use transport::{Connector, Link, LinkEvent, WsConnector};
