use crate::error::TransportError;
use crate::rest::TokenSource;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use garden_core::wire::decode_frame;
use garden_core::ChannelFrame;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

/// How long a released link may take to send its close frame.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug)]
enum Outbound {
    Text(String),
    Close,
}

/// Everything a link task reports back, tagged with the generation it was
/// opened for so the owner can ignore links it already gave up on.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Opened {
        generation: u64,
    },
    Frame {
        generation: u64,
        frame: ChannelFrame,
        received_at: DateTime<Utc>,
    },
    Closed {
        generation: u64,
        reason: String,
    },
}

impl LinkEvent {
    pub fn generation(&self) -> u64 {
        match self {
            LinkEvent::Opened { generation }
            | LinkEvent::Frame { generation, .. }
            | LinkEvent::Closed { generation, .. } => *generation,
        }
    }
}

/// One open text channel to the server.
#[async_trait]
pub trait Link: Send {
    async fn send(&mut self, text: String) -> Result<(), TransportError>;

    /// Next text message. `None` once the server has closed the channel.
    async fn recv(&mut self) -> Option<Result<String, TransportError>>;

    async fn close(&mut self);
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Link>, TransportError>;
}

/// WebSocket connector authenticating with a bearer token in the handshake.
pub struct WsConnector {
    url: String,
    tokens: Arc<dyn TokenSource>,
}

impl WsConnector {
    pub fn new(url: impl Into<String>, tokens: Arc<dyn TokenSource>) -> Self {
        Self {
            url: url.into(),
            tokens,
        }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Box<dyn Link>, TransportError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|err| TransportError::Connect(err.to_string()))?;
        if let Some(token) = self.tokens.token().await {
            let header = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|err| TransportError::Connect(format!("invalid token header: {err}")))?;
            request.headers_mut().insert("Authorization", header);
        }
        let (stream, _) = connect_async(request)
            .await
            .map_err(|err| TransportError::Connect(err.to_string()))?;
        Ok(Box::new(WsLink { stream }))
    }
}

struct WsLink {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Link for WsLink {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|err| TransportError::Send(err.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Close(_)) => return None,
                Ok(_) => {}
                Err(err) => return Some(Err(TransportError::Receive(err.to_string()))),
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}

/// Owner side of a running link task.
#[derive(Debug)]
pub struct LinkHandle {
    generation: u64,
    outbound: mpsc::UnboundedSender<Outbound>,
    task: JoinHandle<()>,
}

impl LinkHandle {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn send(&self, text: String) -> Result<(), TransportError> {
        self.outbound
            .send(Outbound::Text(text))
            .map_err(|_| TransportError::Closed("link task stopped".to_string()))
    }

    /// Asks the link to send a close frame and stop without reporting a
    /// close. A link still connecting after `CLOSE_GRACE` is aborted.
    pub fn close(self) {
        let LinkHandle {
            generation,
            outbound,
            mut task,
        } = self;
        if outbound.send(Outbound::Close).is_err() {
            return;
        }
        tokio::spawn(async move {
            if tokio::time::timeout(CLOSE_GRACE, &mut task).await.is_err() {
                debug!(event = "sync_link_abort", generation);
                task.abort();
            }
        });
    }
}

/// Connects in the background and pumps frames both ways until either side
/// closes. Every inbound frame lands on `events` in receipt order.
pub fn spawn_link(
    connector: Arc<dyn Connector>,
    generation: u64,
    events: mpsc::UnboundedSender<LinkEvent>,
    max_frame_bytes: usize,
) -> LinkHandle {
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Outbound>();
    let task = tokio::spawn(async move {
        let mut link = match connector.connect().await {
            Ok(link) => link,
            Err(err) => {
                warn!(event = "sync_link_connect_error", generation, error = %err);
                let _ = events.send(LinkEvent::Closed {
                    generation,
                    reason: err.to_string(),
                });
                return;
            }
        };
        if events.send(LinkEvent::Opened { generation }).is_err() {
            link.close().await;
            return;
        }

        let reason = loop {
            tokio::select! {
                incoming = link.recv() => match incoming {
                    Some(Ok(text)) => match decode_frame(&text, max_frame_bytes) {
                        Ok(frame) => {
                            let event = LinkEvent::Frame {
                                generation,
                                frame,
                                received_at: Utc::now(),
                            };
                            if events.send(event).is_err() {
                                break None;
                            }
                        }
                        Err(err) => {
                            warn!(event = "sync_link_frame_error", generation, error = %err);
                        }
                    },
                    Some(Err(err)) => break Some(err.to_string()),
                    None => break Some("closed by server".to_string()),
                },
                outgoing = outbound_rx.recv() => match outgoing {
                    Some(Outbound::Text(text)) => {
                        if let Err(err) = link.send(text).await {
                            break Some(err.to_string());
                        }
                    }
                    Some(Outbound::Close) | None => break None,
                },
            }
        };

        link.close().await;
        match reason {
            Some(reason) => {
                debug!(event = "sync_link_closed", generation, reason = %reason);
                let _ = events.send(LinkEvent::Closed { generation, reason });
            }
            None => debug!(event = "sync_link_released", generation),
        }
    });
    LinkHandle {
        generation,
        outbound,
        task,
    }
}

#[cfg(test)]
pub(crate) mod memory {
    //! In-process connector used by the service tests.

    use super::*;
    use serde_json::Value;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// Server end of one accepted in-memory link.
    pub struct MemoryPeer {
        to_client: mpsc::UnboundedSender<Result<String, TransportError>>,
        from_client: mpsc::UnboundedReceiver<String>,
        closed: Arc<AtomicBool>,
    }

    impl MemoryPeer {
        /// Whether the client ended the link with a close.
        pub fn closed_by_client(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        pub fn push(&self, event: &str, data: Value) {
            let frame = ChannelFrame::new(event, data);
            if let Ok(text) = serde_json::to_string(&frame) {
                let _ = self.to_client.send(Ok(text));
            }
        }

        pub fn fail(&self, reason: &str) {
            let _ = self
                .to_client
                .send(Err(TransportError::Receive(reason.to_string())));
        }

        pub async fn next_frame(&mut self) -> Option<ChannelFrame> {
            let text = self.from_client.recv().await?;
            serde_json::from_str(&text).ok()
        }

        /// Frames already delivered, without waiting.
        pub fn drain(&mut self) -> Vec<ChannelFrame> {
            let mut frames = Vec::new();
            while let Ok(text) = self.from_client.try_recv() {
                if let Ok(frame) = serde_json::from_str(&text) {
                    frames.push(frame);
                }
            }
            frames
        }
    }

    struct MemoryLink {
        inbound: mpsc::UnboundedReceiver<Result<String, TransportError>>,
        outbound: mpsc::UnboundedSender<String>,
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Link for MemoryLink {
        async fn send(&mut self, text: String) -> Result<(), TransportError> {
            self.outbound
                .send(text)
                .map_err(|_| TransportError::Send("peer gone".to_string()))
        }

        async fn recv(&mut self) -> Option<Result<String, TransportError>> {
            self.inbound.recv().await
        }

        async fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
            self.inbound.close();
        }
    }

    /// Accepts or refuses connects following a script; accepts once the
    /// script runs out unless `refuse_all` is set.
    pub struct MemoryConnector {
        script: Mutex<VecDeque<bool>>,
        refuse_all: bool,
        accepted: mpsc::UnboundedSender<MemoryPeer>,
    }

    impl MemoryConnector {
        pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MemoryPeer>) {
            Self::scripted(Vec::new(), false)
        }

        pub fn refusing() -> (Arc<Self>, mpsc::UnboundedReceiver<MemoryPeer>) {
            Self::scripted(Vec::new(), true)
        }

        pub fn scripted(
            accept: Vec<bool>,
            refuse_all: bool,
        ) -> (Arc<Self>, mpsc::UnboundedReceiver<MemoryPeer>) {
            let (accepted, peers) = mpsc::unbounded_channel();
            let connector = Arc::new(Self {
                script: Mutex::new(accept.into()),
                refuse_all,
                accepted,
            });
            (connector, peers)
        }
    }

    #[async_trait]
    impl Connector for MemoryConnector {
        async fn connect(&self) -> Result<Box<dyn Link>, TransportError> {
            let scripted = self
                .script
                .lock()
                .map_err(|_| TransportError::Connect("script poisoned".to_string()))?
                .pop_front();
            if !scripted.unwrap_or(!self.refuse_all) {
                return Err(TransportError::Connect("connection refused".to_string()));
            }
            let (to_client, inbound) = mpsc::unbounded_channel();
            let (outbound, from_client) = mpsc::unbounded_channel();
            let closed = Arc::new(AtomicBool::new(false));
            self.accepted
                .send(MemoryPeer {
                    to_client,
                    from_client,
                    closed: Arc::clone(&closed),
                })
                .map_err(|_| TransportError::Connect("no listener".to_string()))?;
            Ok(Box::new(MemoryLink {
                inbound,
                outbound,
                closed,
            }))
        }
    }
}
