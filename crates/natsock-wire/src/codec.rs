//! Incremental parser for the inbound NATS byte stream.
//!
//! # Purpose
//! Accumulates transport chunks in an append buffer and extracts one complete
//! operation at a time, consuming exactly the bytes each operation occupies.
//!
//! # Design notes
//! MSG/HMSG are only consumed once the full payload plus trailing CRLF is
//! buffered, so a partial frame never advances the read cursor. A malformed
//! MSG/HMSG command line is reported as a `ServerOp::Err` diagnostic and the
//! line is dropped, which resynchronizes the stream at the next CRLF.
use bytes::Bytes;

use crate::headers::HeaderMap;
use crate::op::ServerOp;
use crate::{Error, Result};

const DEFAULT_CAPACITY: usize = 64 * 1024;

/// Append buffer with read/write cursors over a growable backing store.
///
/// Unread bytes compact to the front when the tail runs out of room; the
/// store doubles when compaction alone cannot fit an incoming chunk.
#[derive(Debug)]
pub struct ReadBuffer {
    buf: Vec<u8>,
    read: usize,
    write: usize,
}

impl Default for ReadBuffer {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl ReadBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity.max(256)],
            read: 0,
            write: 0,
        }
    }

    /// Append a chunk received from the transport.
    pub fn extend(&mut self, chunk: &[u8]) {
        if self.buf.len() - self.write < chunk.len() {
            self.make_room(chunk.len());
        }
        self.buf[self.write..self.write + chunk.len()].copy_from_slice(chunk);
        self.write += chunk.len();
    }

    fn make_room(&mut self, needed: usize) {
        if self.read > 0 {
            self.buf.copy_within(self.read..self.write, 0);
            self.write -= self.read;
            self.read = 0;
        }
        while self.buf.len() - self.write < needed {
            self.buf.resize(self.buf.len() * 2, 0);
        }
    }

    pub fn unread(&self) -> &[u8] {
        &self.buf[self.read..self.write]
    }

    pub fn len(&self) -> usize {
        self.write - self.read
    }

    pub fn is_empty(&self) -> bool {
        self.read == self.write
    }

    fn consume(&mut self, n: usize) {
        self.read += n;
        debug_assert!(self.read <= self.write);
        if self.read == self.write {
            self.read = 0;
            self.write = 0;
        }
    }
}

enum Step {
    Incomplete,
    Op { consumed: usize, op: ServerOp },
    Fail { consumed: usize, error: Error },
}

/// Extract at most one complete operation from the buffer.
///
/// Returns `Ok(None)` when the buffered bytes are only a prefix of a frame;
/// nothing is consumed in that case. On `Err`, the offending command line has
/// been consumed so the caller can report and keep reading.
pub fn try_parse(buf: &mut ReadBuffer) -> Result<Option<ServerOp>> {
    let step = parse_step(buf.unread());
    match step {
        Step::Incomplete => Ok(None),
        Step::Op { consumed, op } => {
            buf.consume(consumed);
            Ok(Some(op))
        }
        Step::Fail { consumed, error } => {
            buf.consume(consumed);
            Err(error)
        }
    }
}

fn parse_step(bytes: &[u8]) -> Step {
    if bytes.len() >= 6 {
        match &bytes[..6] {
            b"PING\r\n" => {
                return Step::Op {
                    consumed: 6,
                    op: ServerOp::Ping,
                }
            }
            b"PONG\r\n" => {
                return Step::Op {
                    consumed: 6,
                    op: ServerOp::Pong,
                }
            }
            _ => {}
        }
    }

    let Some(line_len) = find_crlf(bytes) else {
        return Step::Incomplete;
    };
    let consumed_line = line_len + 2;
    let line = match std::str::from_utf8(&bytes[..line_len]) {
        Ok(line) => line,
        Err(_) => {
            return Step::Fail {
                consumed: consumed_line,
                error: Error::InvalidUtf8,
            }
        }
    };

    let (command, args) = match line.split_once(' ') {
        Some((command, args)) => (command, args),
        None => (line, ""),
    };

    match command {
        "+OK" => Step::Op {
            consumed: consumed_line,
            op: ServerOp::Ok,
        },
        "-ERR" => {
            let text = args.trim().trim_matches('\'').to_string();
            Step::Op {
                consumed: consumed_line,
                op: ServerOp::Err(text),
            }
        }
        "INFO" => match serde_json::from_str(args.trim()) {
            Ok(info) => Step::Op {
                consumed: consumed_line,
                op: ServerOp::Info(info),
            },
            Err(err) => Step::Fail {
                consumed: consumed_line,
                error: Error::Json(err),
            },
        },
        "MSG" => parse_msg(bytes, line, args, consumed_line),
        "HMSG" => parse_hmsg(bytes, line, args, consumed_line),
        _ => Step::Fail {
            consumed: consumed_line,
            error: Error::UnknownCommand(line.to_string()),
        },
    }
}

fn parse_msg(bytes: &[u8], line: &str, args: &str, consumed_line: usize) -> Step {
    let tokens: Vec<&str> = args.split_ascii_whitespace().collect();
    let (subject, sid, reply, payload_len) = match tokens.as_slice() {
        [subject, sid, len] => (*subject, *sid, None, *len),
        [subject, sid, reply, len] => (*subject, *sid, Some(*reply), *len),
        _ => return malformed(consumed_line, line),
    };
    let Ok(sid) = sid.parse::<u64>() else {
        return malformed(consumed_line, line);
    };
    let Ok(payload_len) = payload_len.parse::<usize>() else {
        return malformed(consumed_line, line);
    };

    let needed = consumed_line + payload_len + 2;
    if bytes.len() < needed {
        return Step::Incomplete;
    }
    if &bytes[needed - 2..needed] != b"\r\n" {
        return malformed(needed, line);
    }
    Step::Op {
        consumed: needed,
        op: ServerOp::Msg {
            subject: subject.to_string(),
            sid,
            reply: reply.map(str::to_string),
            payload: Bytes::copy_from_slice(&bytes[consumed_line..consumed_line + payload_len]),
        },
    }
}

fn parse_hmsg(bytes: &[u8], line: &str, args: &str, consumed_line: usize) -> Step {
    let tokens: Vec<&str> = args.split_ascii_whitespace().collect();
    let (subject, sid, reply, header_len, total_len) = match tokens.as_slice() {
        [subject, sid, header_len, total_len] => (*subject, *sid, None, *header_len, *total_len),
        [subject, sid, reply, header_len, total_len] => {
            (*subject, *sid, Some(*reply), *header_len, *total_len)
        }
        _ => return malformed(consumed_line, line),
    };
    let Ok(sid) = sid.parse::<u64>() else {
        return malformed(consumed_line, line);
    };
    let (Ok(header_len), Ok(total_len)) = (header_len.parse::<usize>(), total_len.parse::<usize>())
    else {
        return malformed(consumed_line, line);
    };
    if header_len > total_len {
        return malformed(consumed_line, line);
    }

    let needed = consumed_line + total_len + 2;
    if bytes.len() < needed {
        return Step::Incomplete;
    }
    if &bytes[needed - 2..needed] != b"\r\n" {
        return malformed(needed, line);
    }
    let headers = match HeaderMap::parse(&bytes[consumed_line..consumed_line + header_len]) {
        Ok(headers) => headers,
        Err(err) => {
            return Step::Op {
                consumed: needed,
                op: ServerOp::Err(format!("bad header block in '{line}': {err}")),
            }
        }
    };
    Step::Op {
        consumed: needed,
        op: ServerOp::HMsg {
            subject: subject.to_string(),
            sid,
            reply: reply.map(str::to_string),
            headers,
            payload: Bytes::copy_from_slice(
                &bytes[consumed_line + header_len..consumed_line + total_len],
            ),
        },
    }
}

fn malformed(consumed: usize, line: &str) -> Step {
    Step::Op {
        consumed,
        op: ServerOp::Err(format!("malformed message frame: '{line}'")),
    }
}

fn find_crlf(bytes: &[u8]) -> Option<usize> {
    bytes.windows(2).position(|pair| pair == b"\r\n")
}
