// Inbound message value handed to subscriptions and request callers.
use bytes::Bytes;
use natsock_wire::HeaderMap;

/// A message received from the server, headers already decoded when present.
///
/// ```
/// use natsock_client::Message;
///
/// let msg = Message::new("orders.new", None, bytes::Bytes::from_static(b"{}"));
/// assert_eq!(msg.subject, "orders.new");
/// assert!(!msg.is_no_responders());
/// ```
#[derive(Debug, Clone)]
pub struct Message {
    pub subject: String,
    pub reply: Option<String>,
    pub payload: Bytes,
    pub headers: Option<HeaderMap>,
}

impl Message {
    pub fn new(subject: impl Into<String>, reply: Option<String>, payload: Bytes) -> Self {
        Self {
            subject: subject.into(),
            reply,
            payload,
            headers: None,
        }
    }

    pub fn with_headers(
        subject: impl Into<String>,
        reply: Option<String>,
        headers: HeaderMap,
        payload: Bytes,
    ) -> Self {
        Self {
            subject: subject.into(),
            reply,
            payload,
            headers: Some(headers),
        }
    }

    /// Status code from the header block, if any.
    pub fn status(&self) -> Option<u16> {
        self.headers.as_ref().and_then(HeaderMap::status)
    }

    pub fn is_no_responders(&self) -> bool {
        self.headers
            .as_ref()
            .is_some_and(HeaderMap::is_no_responders)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.as_ref().and_then(|headers| headers.get(name))
    }
}
