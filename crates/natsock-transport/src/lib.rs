//! Transport layer for the natsock client.
//!
//! # Purpose
//! Defines the byte-stream contract the connection core drives, and provides
//! the WebSocket implementation. The protocol layer treats the concatenation
//! of received chunks as an opaque byte stream; framing above it is the wire
//! codec's business, TLS below it is the transport's.
//!
//! # Design notes
//! A connected transport is split into a writer half and a reader half so the
//! read loop can own the receive side while publishers share the send side
//! behind a mutex. `close` lives on the writer half, which is also how the
//! keep-alive watchdog forces a dead connection down.
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("transport io: {0}")]
    Io(String),
    #[error("transport closed")]
    Closed,
}

/// Write half of a connected transport. Callers are expected to serialize
/// access so each `send` puts one whole protocol command on the wire.
#[async_trait]
pub trait TransportWriter: Send {
    async fn send(&mut self, bytes: Bytes) -> Result<()>;
    async fn close(&mut self) -> Result<()>;
    fn is_connected(&self) -> bool;
}

/// Read half of a connected transport. `Ok(None)` is an orderly close; any
/// error is a broken link.
#[async_trait]
pub trait TransportReader: Send {
    async fn receive(&mut self) -> Result<Option<Bytes>>;
}

/// Factory invoked once per (re)connect attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        url: &str,
    ) -> Result<(Box<dyn TransportWriter>, Box<dyn TransportReader>)>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connector for `ws://` and `wss://` endpoints.
///
/// ```no_run
/// use natsock_transport::{Connector, WsConnector};
///
/// async fn open() -> natsock_transport::Result<()> {
///     let (_writer, _reader) = WsConnector.connect("wss://demo.nats.io:8443").await?;
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(
        &self,
        url: &str,
    ) -> Result<(Box<dyn TransportWriter>, Box<dyn TransportReader>)> {
        let (stream, response) = connect_async(url)
            .await
            .map_err(|err| Error::Connect(err.to_string()))?;
        debug!(status = %response.status(), url, "websocket established");
        let (sink, stream) = stream.split();
        Ok((
            Box::new(WsWriter {
                sink,
                connected: true,
            }),
            Box::new(WsReader { stream }),
        ))
    }
}

struct WsWriter {
    sink: SplitSink<WsStream, Message>,
    connected: bool,
}

#[async_trait]
impl TransportWriter for WsWriter {
    async fn send(&mut self, bytes: Bytes) -> Result<()> {
        if !self.connected {
            return Err(Error::Closed);
        }
        self.sink
            .send(Message::Binary(bytes.to_vec()))
            .await
            .map_err(|err| {
                self.connected = false;
                Error::Io(err.to_string())
            })
    }

    async fn close(&mut self) -> Result<()> {
        self.connected = false;
        // A close error usually means the peer is already gone; the reader
        // observes end-of-stream either way.
        if let Err(err) = self.sink.close().await {
            debug!(error = %err, "websocket close");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

struct WsReader {
    stream: SplitStream<WsStream>,
}

#[async_trait]
impl TransportReader for WsReader {
    async fn receive(&mut self) -> Result<Option<Bytes>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Binary(bytes))) => return Ok(Some(Bytes::from(bytes))),
                Some(Ok(Message::Text(text))) => return Ok(Some(Bytes::from(text.into_bytes()))),
                // Control frames are the WebSocket layer's concern.
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Err(err)) => return Err(Error::Io(err.to_string())),
            }
        }
    }
}
