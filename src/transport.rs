//! Transport layer
//!
//! Wraps a duplex channel into a structured message reader/writer pair.
//! The WebSocket transport carries one JSON-RPC message per text frame;
//! the in-memory transport backs tests and same-process embedding.

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::config::LanguageServerUrl;
use crate::error::{BridgeError, BridgeResult};
use crate::protocol::Message;

/// Reading half of a transport.
///
/// `read` produces a lazy, infinite, non-restartable sequence of inbound
/// messages; `Ok(None)` marks orderly channel close and is terminal.
#[async_trait]
pub trait MessageReader: Send {
    async fn read(&mut self) -> BridgeResult<Option<Message>>;
}

/// Writing half of a transport.
#[async_trait]
pub trait MessageWriter: Send {
    /// Write one outbound message; fails if the channel is not open.
    async fn write(&mut self, message: &Message) -> BridgeResult<()>;

    /// Close the channel. Further writes fail with a transport error.
    async fn close(&mut self) -> BridgeResult<()>;
}

pub type BoxReader = Box<dyn MessageReader>;
pub type BoxWriter = Box<dyn MessageWriter>;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Open a WebSocket to the language server and split it into halves.
///
/// The channel is opened eagerly; closing it is the caller's
/// responsibility. Establishment failures map to `BridgeError::Connect`.
pub async fn connect_websocket(
    url: &LanguageServerUrl,
) -> BridgeResult<(WebSocketReader, WebSocketWriter)> {
    let url = url.formatted();
    let (websocket, _) = connect_async(&url).await.map_err(|e| {
        tracing::error!("Failed to connect to {}: {}", url, e);
        BridgeError::Connect(format!("WebSocket connection failed: {}", e))
    })?;

    tracing::info!("WebSocket connected to {}", url);
    let (sink, stream) = websocket.split();
    Ok((
        WebSocketReader { stream },
        WebSocketWriter {
            sink,
            is_closed: false,
        },
    ))
}

/// Reading half of a WebSocket transport
pub struct WebSocketReader {
    stream: SplitStream<WsStream>,
}

#[async_trait]
impl MessageReader for WebSocketReader {
    async fn read(&mut self) -> BridgeResult<Option<Message>> {
        loop {
            match self.stream.next().await {
                Some(Ok(WsMessage::Text(text))) => {
                    tracing::trace!("LSP <- {}", text);
                    return Message::parse(&text)
                        .map(Some)
                        .map_err(|e| BridgeError::Transport(format!("invalid message: {}", e)));
                }
                Some(Ok(WsMessage::Binary(data))) => {
                    let text = String::from_utf8(data).map_err(|e| {
                        BridgeError::Transport(format!("non-UTF8 binary frame: {}", e))
                    })?;
                    tracing::trace!("LSP <- {}", text);
                    return Message::parse(&text)
                        .map(Some)
                        .map_err(|e| BridgeError::Transport(format!("invalid message: {}", e)));
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    tracing::info!("WebSocket closed by server: {:?}", frame);
                    return Ok(None);
                }
                // Pings are auto-answered by the protocol layer
                Some(Ok(WsMessage::Ping(_))) | Some(Ok(WsMessage::Pong(_))) => continue,
                Some(Ok(WsMessage::Frame(_))) => {
                    tracing::warn!("Unexpected raw WebSocket frame");
                    continue;
                }
                Some(Err(e)) => {
                    return Err(BridgeError::Transport(format!("WebSocket error: {}", e)));
                }
                None => {
                    tracing::info!("WebSocket stream ended");
                    return Ok(None);
                }
            }
        }
    }
}

/// Writing half of a WebSocket transport
pub struct WebSocketWriter {
    sink: SplitSink<WsStream, WsMessage>,
    is_closed: bool,
}

#[async_trait]
impl MessageWriter for WebSocketWriter {
    async fn write(&mut self, message: &Message) -> BridgeResult<()> {
        if self.is_closed {
            return Err(BridgeError::Transport("channel is closed".to_string()));
        }

        let json = message.to_json()?;
        tracing::trace!("LSP -> {}", json);

        self.sink.send(WsMessage::Text(json)).await.map_err(|e| {
            self.is_closed = true;
            BridgeError::Transport(format!("WebSocket write failed: {}", e))
        })
    }

    async fn close(&mut self) -> BridgeResult<()> {
        if !self.is_closed {
            self.is_closed = true;
            if let Err(e) = self.sink.send(WsMessage::Close(None)).await {
                tracing::warn!("Error sending close frame: {}", e);
            }
            if let Err(e) = self.sink.close().await {
                tracing::warn!("Error closing WebSocket sink: {}", e);
            }
        }
        Ok(())
    }
}

/// One side of an in-memory duplex channel
pub struct MemoryEndpoint {
    pub reader: MemoryReader,
    pub writer: MemoryWriter,
}

/// Create a pair of connected in-memory endpoints.
///
/// Frames are JSON strings, mirroring the WebSocket text-frame framing.
/// Dropping or closing one side's writer terminates the peer's read
/// sequence, which lets tests simulate a server-initiated close.
pub fn memory_pair() -> (MemoryEndpoint, MemoryEndpoint) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();

    (
        MemoryEndpoint {
            reader: MemoryReader { rx: a_rx },
            writer: MemoryWriter { tx: Some(b_tx) },
        },
        MemoryEndpoint {
            reader: MemoryReader { rx: b_rx },
            writer: MemoryWriter { tx: Some(a_tx) },
        },
    )
}

/// Reading half of an in-memory transport
pub struct MemoryReader {
    rx: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl MessageReader for MemoryReader {
    async fn read(&mut self) -> BridgeResult<Option<Message>> {
        match self.rx.recv().await {
            Some(json) => Message::parse(&json)
                .map(Some)
                .map_err(|e| BridgeError::Transport(format!("invalid message: {}", e))),
            None => Ok(None),
        }
    }
}

/// Writing half of an in-memory transport
pub struct MemoryWriter {
    tx: Option<mpsc::UnboundedSender<String>>,
}

#[async_trait]
impl MessageWriter for MemoryWriter {
    async fn write(&mut self, message: &Message) -> BridgeResult<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| BridgeError::Transport("channel is closed".to_string()))?;
        let json = message.to_json()?;
        tx.send(json)
            .map_err(|_| BridgeError::Transport("peer endpoint dropped".to_string()))
    }

    async fn close(&mut self) -> BridgeResult<()> {
        self.tx = None;
        Ok(())
    }
}
