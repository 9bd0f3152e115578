// Connection lifecycle states and the asynchronous event feed.

/// Lifecycle of a connection. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

/// Events published on the broadcast channel returned by `Client::events`.
///
/// Errors observed on the read or keep-alive loops are reported here rather
/// than returned to any caller; they do not by themselves terminate the
/// connection.
#[derive(Debug, Clone)]
pub enum Event {
    StatusChanged(Status),
    /// The server sent `-ERR`.
    ServerError(String),
    /// A local failure on a background loop (parse error, failed PONG, ...).
    ClientError(String),
    /// A message was dropped because a subscription queue was full under the
    /// drop-new policy.
    SlowConsumer { sid: u64, subject: String },
}
