//! # WebSocket Transport
//!
//! The framed text channel underneath the connection manager.
//!
//! ## Layering
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Transport Layering                               │
//! │                                                                         │
//! │  ConnectionManager (actor: state machine, heartbeat, lanes)            │
//! │        │                                                                │
//! │        │ Connector::connect()                                           │
//! │        ▼                                                                │
//! │  ┌──────────────────┐        ┌──────────────────┐                      │
//! │  │ Box<FrameWriter> │        │ Box<FrameReader> │                      │
//! │  │  send(text)      │        │  recv() → text   │                      │
//! │  │  close()         │        │  None = closed   │                      │
//! │  └────────┬─────────┘        └────────┬─────────┘                      │
//! │           │                           │                                 │
//! │           ▼                           ▼                                 │
//! │  TungsteniteConnector: split WebSocketStream (SplitSink / SplitStream) │
//! │  MemoryConnector (tests): in-process channels                          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The transport knows nothing about reconnects; a failed `connect()` or a
//! closed reader is reported upward and the manager decides what happens.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{SyncError, SyncResult};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Type alias for the WebSocket write half.
pub type WsSink = SplitSink<WsStream, WsMessage>;

/// Type alias for the WebSocket read half.
pub type WsSource = SplitStream<WsStream>;

// =============================================================================
// Traits
// =============================================================================

/// Write half of an open channel.
#[async_trait]
pub trait FrameWriter: Send {
    async fn send(&mut self, frame: String) -> SyncResult<()>;

    /// Best-effort close handshake.
    async fn close(&mut self) -> SyncResult<()>;
}

/// Read half of an open channel.
#[async_trait]
pub trait FrameReader: Send {
    /// Next text frame. `None` once the peer closed the channel.
    async fn recv(&mut self) -> Option<SyncResult<String>>;
}

/// An open channel split into its halves.
pub type Link = (Box<dyn FrameWriter>, Box<dyn FrameReader>);

/// Opens channels to the backend.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> SyncResult<Link>;
}

// =============================================================================
// Tungstenite Implementation
// =============================================================================

/// Connects with `tokio-tungstenite` (TLS through native-tls for `wss://`).
#[derive(Debug, Clone)]
pub struct TungsteniteConnector {
    url: Url,
}

impl TungsteniteConnector {
    pub fn new(url: &str) -> SyncResult<Self> {
        Ok(TungsteniteConnector {
            url: Url::parse(url)?,
        })
    }
}

#[async_trait]
impl Connector for TungsteniteConnector {
    async fn connect(&self) -> SyncResult<Link> {
        let (ws_stream, response) = connect_async(self.url.as_str()).await?;
        debug!(status = ?response.status(), "WebSocket handshake complete");

        let (write, read) = ws_stream.split();
        Ok((
            Box::new(TungsteniteWriter { sink: write }),
            Box::new(TungsteniteReader { stream: read }),
        ))
    }
}

struct TungsteniteWriter {
    sink: WsSink,
}

#[async_trait]
impl FrameWriter for TungsteniteWriter {
    async fn send(&mut self, frame: String) -> SyncResult<()> {
        self.sink.send(WsMessage::Text(frame.into())).await?;
        Ok(())
    }

    async fn close(&mut self) -> SyncResult<()> {
        self.sink.send(WsMessage::Close(None)).await?;
        Ok(())
    }
}

struct TungsteniteReader {
    stream: WsSource,
}

#[async_trait]
impl FrameReader for TungsteniteReader {
    async fn recv(&mut self) -> Option<SyncResult<String>> {
        loop {
            match self.stream.next().await? {
                Ok(WsMessage::Text(text)) => return Some(Ok(text.to_string())),
                Ok(WsMessage::Close(frame)) => {
                    info!(?frame, "Received close frame");
                    return None;
                }
                Ok(WsMessage::Binary(_)) => {
                    warn!("Received unexpected binary message");
                }
                // tungstenite answers protocol pings itself
                Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_)) | Ok(WsMessage::Frame(_)) => {}
                Err(e) => return Some(Err(SyncError::from(e))),
            }
        }
    }
}
