// Error taxonomy for connection-level operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Transport failure, handshake timeout, unexpected EOF, or a write while
    /// the link is down.
    #[error("connection: {0}")]
    Connection(String),
    /// The server rejected our credentials, or the auth handler failed.
    #[error("authentication: {0}")]
    Authentication(String),
    /// Any other `-ERR` from the server.
    #[error("server error: {0}")]
    Server(String),
    /// The request deadline elapsed before a reply arrived.
    #[error("request timed out on '{subject}'")]
    RequestTimeout { subject: String },
    /// The reply carried a 503 status: nothing was listening.
    #[error("no responders on '{subject}'")]
    NoResponders { subject: String },
    /// A frame could not be serialized or parsed.
    #[error("protocol: {0}")]
    Protocol(#[from] natsock_wire::Error),
    /// The connection was closed by the user; terminal.
    #[error("connection closed")]
    Closed,
}

impl From<natsock_transport::Error> for Error {
    fn from(err: natsock_transport::Error) -> Self {
        Self::Connection(err.to_string())
    }
}
