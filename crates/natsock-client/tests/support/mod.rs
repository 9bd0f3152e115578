// Scripted in-memory transport for driving the client against exact wire bytes.
use async_trait::async_trait;
use bytes::Bytes;
use natsock_transport::{Connector, Error, Result, TransportReader, TransportWriter};
use tokio::sync::{mpsc, watch};

pub const INFO: &str = r#"{"server_id":"test","version":"2.10.0","headers":true,"max_payload":1048576,"proto":1}"#;

/// Test-side handle: one per accepted connection, in connect order.
pub struct MockServer {
    sessions: mpsc::UnboundedReceiver<ServerSession>,
}

impl MockServer {
    pub async fn next_session(&mut self) -> ServerSession {
        self.sessions.recv().await.expect("connector dropped")
    }
}

/// Connector handed to the client; every connect attempt yields a fresh
/// session on the server side.
pub struct MockConnector {
    sessions: mpsc::UnboundedSender<ServerSession>,
}

pub fn mock_pair() -> (MockConnector, MockServer) {
    let (tx, rx) = mpsc::unbounded_channel();
    (MockConnector { sessions: tx }, MockServer { sessions: rx })
}

/// The server side of one transport session. Dropping it simulates a
/// transport failure.
pub struct ServerSession {
    to_client: mpsc::UnboundedSender<Bytes>,
    from_client: mpsc::UnboundedReceiver<Bytes>,
}

impl ServerSession {
    /// Feed bytes to the client as one received chunk.
    pub fn send(&self, text: impl Into<String>) {
        let _ = self.to_client.send(Bytes::from(text.into().into_bytes()));
    }

    /// Next write the client performed. One protocol command per write,
    /// except the handshake's combined `CONNECT ...\r\nPING\r\n`.
    pub async fn recv(&mut self) -> String {
        let bytes = self.from_client.recv().await.expect("client write");
        String::from_utf8(bytes.to_vec()).expect("client writes are utf-8 commands")
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        _url: &str,
    ) -> Result<(Box<dyn TransportWriter>, Box<dyn TransportReader>)> {
        let (to_client, client_rx) = mpsc::unbounded_channel();
        let (client_tx, from_client) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);
        self.sessions
            .send(ServerSession {
                to_client,
                from_client,
            })
            .map_err(|_| Error::Connect("mock server dropped".to_string()))?;
        Ok((
            Box::new(MockWriter {
                tx: client_tx,
                closed: closed_tx,
            }),
            Box::new(MockReader {
                rx: client_rx,
                closed: closed_rx,
            }),
        ))
    }
}

struct MockWriter {
    tx: mpsc::UnboundedSender<Bytes>,
    closed: watch::Sender<bool>,
}

#[async_trait]
impl TransportWriter for MockWriter {
    async fn send(&mut self, bytes: Bytes) -> Result<()> {
        if *self.closed.borrow() {
            return Err(Error::Closed);
        }
        self.tx
            .send(bytes)
            .map_err(|_| Error::Io("peer went away".to_string()))
    }

    async fn close(&mut self) -> Result<()> {
        let _ = self.closed.send(true);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !*self.closed.borrow()
    }
}

struct MockReader {
    rx: mpsc::UnboundedReceiver<Bytes>,
    closed: watch::Receiver<bool>,
}

#[async_trait]
impl TransportReader for MockReader {
    async fn receive(&mut self) -> Result<Option<Bytes>> {
        if *self.closed.borrow() {
            return Ok(None);
        }
        tokio::select! {
            chunk = self.rx.recv() => Ok(chunk),
            // A local close (or the writer half being dropped) ends the read side.
            _ = self.closed.changed() => Ok(None),
        }
    }
}

/// Play the server's half of the opening handshake and return the client's
/// inbox prefix (trailing dot included).
pub async fn handshake(session: &mut ServerSession) -> String {
    session.send(format!("INFO {INFO}\r\n"));
    let opening = session.recv().await;
    assert!(opening.starts_with("CONNECT {"), "unexpected opening: {opening}");
    assert!(opening.ends_with("PING\r\n"), "unexpected opening: {opening}");
    session.send("PONG\r\n");
    let sub = session.recv().await;
    let mut tokens = sub.split_ascii_whitespace();
    assert_eq!(tokens.next(), Some("SUB"), "expected inbox SUB, got: {sub}");
    let wildcard = tokens.next().expect("inbox subject").to_string();
    assert!(wildcard.ends_with(".*"), "inbox subject: {wildcard}");
    wildcard.trim_end_matches('*').to_string()
}
