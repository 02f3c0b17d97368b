use garden_core::FrameError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("receive failed: {0}")]
    Receive(String),
    #[error("connection closed: {0}")]
    Closed(String),
}

/// A known event whose payload did not match the expected shape.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {event} payload: {source}")]
pub struct DispatchError {
    pub event: String,
    #[source]
    pub source: FrameError,
}

#[derive(Debug, Error)]
pub enum RestError {
    #[error("no authentication token available")]
    MissingToken,
    #[error("invalid url: {0}")]
    Url(String),
    #[error("request failed: {0}")]
    Network(String),
    #[error("server returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("invalid response: {0}")]
    Decode(String),
}

/// Recoverable failure of a single device command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("no acknowledgment for {device_key} within {timeout_ms}ms")]
    NotAcknowledged { device_key: String, timeout_ms: u64 },
    #[error("command for {device_key} rejected: {message}")]
    Rejected { device_key: String, message: String },
    #[error("channel not connected within {wait_ms}ms; command for {device_key} was not sent")]
    DispatchTimeout { device_key: String, wait_ms: u64 },
    #[error("command for {device_key} superseded by a newer command")]
    Superseded { device_key: String },
    #[error("sync service stopped")]
    ServiceStopped,
}

impl CommandError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, CommandError::ServiceStopped)
    }

    pub fn device_key(&self) -> Option<&str> {
        match self {
            CommandError::NotAcknowledged { device_key, .. }
            | CommandError::Rejected { device_key, .. }
            | CommandError::DispatchTimeout { device_key, .. }
            | CommandError::Superseded { device_key } => Some(device_key),
            CommandError::ServiceStopped => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error(transparent)]
    Rest(#[from] RestError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("notification {0} is not known")]
    UnknownNotification(String),
    #[error("sync service stopped")]
    ServiceStopped,
}

/// Errors that need user awareness, fanned out to every UI consumer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UiError {
    #[error("connection lost after {attempts} attempts: {last_error}")]
    FatalConnectivity { attempts: u32, last_error: String },
    #[error("could not mark notification {id} read: {message}")]
    ReadMarkRejected { id: String, message: String },
    #[error(transparent)]
    CommandFailed(CommandError),
    #[error("server error: {message}")]
    Server {
        message: String,
        code: Option<String>,
    },
}
