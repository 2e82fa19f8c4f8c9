//! Transport seam between [`BridgeConnection`] and the network.
//!
//! A [`Connector`] opens one websocket [`Session`], which is split into a
//! [`FrameWriter`] and a [`FrameReader`] so the session pump can send and
//! receive concurrently.  [`WsConnector`] is the production implementation
//! on top of `tokio-tungstenite`; [`memory::MemoryConnector`] keeps
//! everything in-process for tests and dry runs.
//!
//! [`BridgeConnection`]: crate::connection::BridgeConnection

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use simbridge_types::BridgeError;
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

pub mod memory;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Something that happened on the read half of a session.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A UTF-8 text frame.
    Text(String),
    /// The peer closed the session, or the stream ended.
    Closed,
    /// The read half failed.
    Error(String),
}

/// Write half of a session.
#[async_trait]
pub trait FrameWriter: Send {
    /// Write one text frame.
    async fn send_text(&mut self, text: String) -> Result<(), BridgeError>;

    /// Send a close frame and flush.  Errors are ignored by callers.
    async fn close(&mut self) -> Result<(), BridgeError>;
}

/// Read half of a session.
#[async_trait]
pub trait FrameReader: Send {
    /// Wait for the next event.  After [`TransportEvent::Closed`] or
    /// [`TransportEvent::Error`] the reader is not polled again.
    async fn next_event(&mut self) -> TransportEvent;
}

/// One live transport session.
pub struct Session {
    pub writer: Box<dyn FrameWriter>,
    pub reader: Box<dyn FrameReader>,
}

/// Opens sessions to an endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &str) -> Result<Session, BridgeError>;
}

// ---------------------------------------------------------------------------
// tokio-tungstenite implementation
// ---------------------------------------------------------------------------

/// [`Connector`] for `ws://` endpoints using `tokio-tungstenite`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, endpoint: &str) -> Result<Session, BridgeError> {
        let (ws_stream, _response) = connect_async(endpoint)
            .await
            .map_err(|e| BridgeError::Transport(format!("connect to {endpoint}: {e}")))?;
        let (sink, stream) = ws_stream.split();
        Ok(Session {
            writer: Box::new(WsWriter { sink }),
            reader: Box::new(WsReader { stream }),
        })
    }
}

struct WsWriter {
    sink: SplitSink<WsStream, Message>,
}

#[async_trait]
impl FrameWriter for WsWriter {
    async fn send_text(&mut self, text: String) -> Result<(), BridgeError> {
        self.sink
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| BridgeError::Transport(format!("ws send: {e}")))
    }

    async fn close(&mut self) -> Result<(), BridgeError> {
        // Closing the sink makes tungstenite emit the close frame.
        self.sink
            .close()
            .await
            .map_err(|e| BridgeError::Transport(format!("ws close: {e}")))
    }
}

struct WsReader {
    stream: SplitStream<WsStream>,
}

#[async_trait]
impl FrameReader for WsReader {
    async fn next_event(&mut self) -> TransportEvent {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    return TransportEvent::Text(text.as_str().to_string());
                }
                Some(Ok(Message::Close(_))) | None => return TransportEvent::Closed,
                Some(Err(e)) => return TransportEvent::Error(e.to_string()),
                // Ping/pong are answered by tungstenite; binary frames are not
                // part of the rosbridge JSON protocol.
                Some(Ok(_)) => continue,
            }
        }
    }
}

