// Typed protocol operations and the outbound serializer.
use bytes::{BufMut, Bytes, BytesMut};

use crate::headers::HeaderMap;
use crate::info::{ConnectInfo, ServerInfo};
use crate::Result;

/// One complete inbound operation extracted from the byte stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerOp {
    Ping,
    Pong,
    Ok,
    Err(String),
    Info(ServerInfo),
    Msg {
        subject: String,
        sid: u64,
        reply: Option<String>,
        payload: Bytes,
    },
    HMsg {
        subject: String,
        sid: u64,
        reply: Option<String>,
        headers: HeaderMap,
        payload: Bytes,
    },
}

/// One outbound command. `encode` produces the exact wire form as a single
/// contiguous buffer so the transport sends each command in one write.
#[derive(Debug, Clone)]
pub enum ClientOp {
    Connect(ConnectInfo),
    Pub {
        subject: String,
        reply: Option<String>,
        payload: Bytes,
    },
    HPub {
        subject: String,
        reply: Option<String>,
        headers: HeaderMap,
        payload: Bytes,
    },
    Sub {
        subject: String,
        queue_group: Option<String>,
        sid: u64,
    },
    Unsub {
        sid: u64,
        max: Option<u64>,
    },
    Ping,
    Pong,
}

impl ClientOp {
    pub fn encode(&self) -> Result<Bytes> {
        match self {
            Self::Connect(info) => {
                let json = serde_json::to_string(info)?;
                let mut buf = BytesMut::with_capacity(json.len() + 11);
                buf.put_slice(b"CONNECT ");
                buf.put_slice(json.as_bytes());
                buf.put_slice(b"\r\n");
                Ok(buf.freeze())
            }
            Self::Pub {
                subject,
                reply,
                payload,
            } => {
                let mut buf = BytesMut::with_capacity(subject.len() + payload.len() + 32);
                buf.put_slice(b"PUB ");
                buf.put_slice(subject.as_bytes());
                if let Some(reply) = reply {
                    buf.put_slice(b" ");
                    buf.put_slice(reply.as_bytes());
                }
                buf.put_slice(format!(" {}\r\n", payload.len()).as_bytes());
                buf.put_slice(payload);
                buf.put_slice(b"\r\n");
                Ok(buf.freeze())
            }
            Self::HPub {
                subject,
                reply,
                headers,
                payload,
            } => {
                let header_block = headers.encode();
                let header_len = header_block.len();
                let total_len = header_len + payload.len();
                let mut buf = BytesMut::with_capacity(subject.len() + total_len + 40);
                buf.put_slice(b"HPUB ");
                buf.put_slice(subject.as_bytes());
                if let Some(reply) = reply {
                    buf.put_slice(b" ");
                    buf.put_slice(reply.as_bytes());
                }
                buf.put_slice(format!(" {header_len} {total_len}\r\n").as_bytes());
                buf.put_slice(&header_block);
                buf.put_slice(payload);
                buf.put_slice(b"\r\n");
                Ok(buf.freeze())
            }
            Self::Sub {
                subject,
                queue_group,
                sid,
            } => {
                let line = match queue_group {
                    Some(queue) => format!("SUB {subject} {queue} {sid}\r\n"),
                    None => format!("SUB {subject} {sid}\r\n"),
                };
                Ok(Bytes::from(line))
            }
            Self::Unsub { sid, max } => {
                let line = match max {
                    Some(max) => format!("UNSUB {sid} {max}\r\n"),
                    None => format!("UNSUB {sid}\r\n"),
                };
                Ok(Bytes::from(line))
            }
            Self::Ping => Ok(Bytes::from_static(b"PING\r\n")),
            Self::Pong => Ok(Bytes::from_static(b"PONG\r\n")),
        }
    }
}
