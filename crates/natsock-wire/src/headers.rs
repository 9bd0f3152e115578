//! NATS message header codec.
//!
//! Headers are an ordered multi-map with case-insensitive lookup, carried on
//! the wire as `NATS/1.0[ <code>[ <desc>]]\r\n(<key>: <value>\r\n)*\r\n`.
use bytes::{BufMut, Bytes, BytesMut};

use crate::{Error, Result};

const HEADER_VERSION: &str = "NATS/1.0";

/// Status code a server attaches to a reply when no subscriber was listening.
pub const STATUS_NO_RESPONDERS: u16 = 503;

/// Ordered header multi-map plus the optional status line.
///
/// ```
/// use natsock_wire::HeaderMap;
///
/// let mut headers = HeaderMap::new();
/// headers.append("Nats-Rollup", "sub");
/// assert_eq!(headers.get("nats-rollup"), Some("sub"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
    status: Option<u16>,
    description: Option<String>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a value; later appends for the same name keep registration order.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Replace every value registered under `name` with a single one.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.entries.push((name.to_string(), value.into()));
    }

    /// First value registered under `name`, case-insensitive.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Every value registered under `name`, in registration order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.entries
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.status.is_none()
    }

    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn set_status(&mut self, code: u16, description: impl Into<String>) {
        self.status = Some(code);
        let description = description.into();
        self.description = (!description.is_empty()).then_some(description);
    }

    /// Whether this header block carries the 503 no-responders sentinel.
    pub fn is_no_responders(&self) -> bool {
        self.status == Some(STATUS_NO_RESPONDERS)
    }

    /// Serialize to the wire form, status line included when present.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_VERSION.len() + 4 + 32 * self.entries.len());
        buf.put_slice(HEADER_VERSION.as_bytes());
        if let Some(code) = self.status {
            buf.put_slice(format!(" {code}").as_bytes());
            if let Some(description) = &self.description {
                buf.put_slice(b" ");
                buf.put_slice(description.as_bytes());
            }
        }
        buf.put_slice(b"\r\n");
        for (name, value) in &self.entries {
            buf.put_slice(name.as_bytes());
            buf.put_slice(b": ");
            buf.put_slice(value.as_bytes());
            buf.put_slice(b"\r\n");
        }
        buf.put_slice(b"\r\n");
        buf.freeze()
    }

    /// Parse a complete header block as carried inside an HMSG frame.
    pub fn parse(block: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(block).map_err(|_| Error::InvalidUtf8)?;
        let mut lines = text.split("\r\n");
        let status_line = lines
            .next()
            .ok_or_else(|| Error::Headers("empty header block".to_string()))?;
        let rest = status_line
            .strip_prefix(HEADER_VERSION)
            .ok_or_else(|| Error::Headers(format!("bad version line: {status_line}")))?;

        let mut headers = Self::new();
        let rest = rest.trim();
        if !rest.is_empty() {
            let (code, description) = match rest.split_once(' ') {
                Some((code, description)) => (code, description.trim()),
                None => (rest, ""),
            };
            let code: u16 = code
                .parse()
                .map_err(|_| Error::Headers(format!("bad status code: {code}")))?;
            headers.set_status(code, description);
        }

        for line in lines {
            if line.is_empty() {
                continue;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| Error::Headers(format!("missing separator: {line}")))?;
            headers.append(name.trim(), value.trim());
        }
        Ok(headers)
    }
}
