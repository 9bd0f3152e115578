// In-process JetStream fake: speaks the NATS wire protocol over the mock
// transport so object-store tests exercise the full client stack.
use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use bytes::Bytes;
use natsock_client::{Client, ConnectOptions};
use natsock_jetstream::Context;
use natsock_transport::{Connector, Error, Result, TransportReader, TransportWriter};
use natsock_wire::HeaderMap;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};

/// Connect a client to a fresh fake server and wrap it in a JetStream context.
pub async fn jetstream() -> Context {
    let (connector, sessions) = mock_pair();
    tokio::spawn(run_server(sessions));
    let options = ConnectOptions::new("ws://fake").reconnect_jitter(false);
    let client = Client::connect_with(options, Box::new(connector))
        .await
        .expect("connect to fake server");
    Context::new(client)
}

// ---- mock transport ------------------------------------------------------

struct Session {
    to_client: mpsc::UnboundedSender<Bytes>,
    from_client: mpsc::UnboundedReceiver<Bytes>,
}

struct MockConnector {
    sessions: mpsc::UnboundedSender<Session>,
}

fn mock_pair() -> (MockConnector, mpsc::UnboundedReceiver<Session>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (MockConnector { sessions: tx }, rx)
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
            .send(Session {
                to_client,
                from_client,
            })
            .map_err(|_| Error::Connect("fake server stopped".to_string()))?;
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
            _ = self.closed.changed() => Ok(None),
        }
    }
}

// ---- server state --------------------------------------------------------

#[derive(Default)]
struct State {
    streams: HashMap<String, StreamRecord>,
}

#[derive(Default)]
struct StreamRecord {
    subjects: Vec<String>,
    messages: Vec<StoredMessage>,
    next_seq: u64,
}

struct StoredMessage {
    seq: u64,
    subject: String,
    payload: Bytes,
}

async fn run_server(mut sessions: mpsc::UnboundedReceiver<Session>) {
    let mut state = State::default();
    while let Some(session) = sessions.recv().await {
        serve_session(session, &mut state).await;
    }
}

async fn serve_session(mut session: Session, state: &mut State) {
    let mut inbox_sid = 1u64;
    session.send_raw(
        b"INFO {\"server_id\":\"fake\",\"version\":\"2.10.0\",\"headers\":true}\r\n".to_vec(),
    );
    while let Some(chunk) = session.from_client.recv().await {
        let Some(line_end) = find_crlf(&chunk) else {
            continue;
        };
        let line = std::str::from_utf8(&chunk[..line_end]).expect("command line");
        let body = &chunk[line_end + 2..];
        let tokens: Vec<&str> = line.split_ascii_whitespace().collect();
        match tokens[0] {
            "CONNECT" | "PING" => session.send_raw(b"PONG\r\n".to_vec()),
            "PONG" | "UNSUB" => {}
            "SUB" => {
                let subject = tokens[1];
                let sid: u64 = tokens.last().unwrap().parse().expect("sid");
                if subject.starts_with("_INBOX.") {
                    inbox_sid = sid;
                }
            }
            "PUB" => {
                let (subject, reply, len) = match tokens.as_slice() {
                    ["PUB", subject, len] => (*subject, None, *len),
                    ["PUB", subject, reply, len] => (*subject, Some(*reply), *len),
                    other => panic!("bad PUB: {other:?}"),
                };
                let len: usize = len.parse().expect("payload length");
                let payload = Bytes::copy_from_slice(&body[..len]);
                handle_publish(state, &session, inbox_sid, subject, reply, None, payload);
            }
            "HPUB" => {
                let (subject, reply, header_len, total_len) = match tokens.as_slice() {
                    ["HPUB", subject, hlen, tlen] => (*subject, None, *hlen, *tlen),
                    ["HPUB", subject, reply, hlen, tlen] => (*subject, Some(*reply), *hlen, *tlen),
                    other => panic!("bad HPUB: {other:?}"),
                };
                let header_len: usize = header_len.parse().expect("header length");
                let total_len: usize = total_len.parse().expect("total length");
                let headers = HeaderMap::parse(&body[..header_len]).expect("headers");
                let payload = Bytes::copy_from_slice(&body[header_len..total_len]);
                handle_publish(
                    state,
                    &session,
                    inbox_sid,
                    subject,
                    reply,
                    Some(headers),
                    payload,
                );
            }
            other => panic!("fake server got unexpected command: {other}"),
        }
    }
}

fn handle_publish(
    state: &mut State,
    session: &Session,
    inbox_sid: u64,
    subject: &str,
    reply: Option<&str>,
    headers: Option<HeaderMap>,
    payload: Bytes,
) {
    if let Some(operation) = subject.strip_prefix("$JS.API.") {
        let reply = reply.expect("api requests carry a reply subject");
        if let Some(stream) = operation.strip_prefix("DIRECT.GET.") {
            handle_direct_get(state, session, inbox_sid, reply, stream, &payload);
        } else {
            let response = handle_api(state, operation, &payload);
            session.send_msg(reply, inbox_sid, response.to_string().as_bytes());
        }
        return;
    }

    // A stream publish: append to the first stream whose subjects match.
    let Some((name, record)) = state
        .streams
        .iter_mut()
        .find(|(_, record)| {
            record
                .subjects
                .iter()
                .any(|pattern| subject_matches(pattern, subject))
        })
        .map(|(name, record)| (name.clone(), record))
    else {
        if let Some(reply) = reply {
            let error = json!({"error": {"code": 503, "description": "no stream for subject"}});
            session.send_msg(reply, inbox_sid, error.to_string().as_bytes());
        }
        return;
    };

    let rollup = headers
        .as_ref()
        .and_then(|headers| headers.get("Nats-Rollup"))
        == Some("sub");
    if rollup {
        record.messages.retain(|message| message.subject != subject);
    }
    let seq = record.next_seq;
    record.next_seq += 1;
    record.messages.push(StoredMessage {
        seq,
        subject: subject.to_string(),
        payload,
    });
    if let Some(reply) = reply {
        let ack = json!({"stream": name, "seq": seq, "duplicate": false});
        session.send_msg(reply, inbox_sid, ack.to_string().as_bytes());
    }
}

fn handle_api(state: &mut State, operation: &str, payload: &[u8]) -> Value {
    if let Some(name) = operation.strip_prefix("STREAM.CREATE.") {
        let config: Value = serde_json::from_slice(payload).expect("stream config");
        let subjects = config["subjects"]
            .as_array()
            .map(|subjects| {
                subjects
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        state.streams.insert(
            name.to_string(),
            StreamRecord {
                subjects,
                messages: Vec::new(),
                next_seq: 1,
            },
        );
        return json!({"config": config, "state": {"messages": 0}});
    }
    if let Some(name) = operation.strip_prefix("STREAM.INFO.") {
        let Some(record) = state.streams.get(name) else {
            return not_found();
        };
        let request: Value = if payload.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(payload).expect("info request")
        };
        let mut info = json!({
            "config": {"name": name, "subjects": record.subjects},
            "state": {
                "messages": record.messages.len(),
                "first_seq": record.messages.first().map_or(0, |m| m.seq),
                "last_seq": record.next_seq.saturating_sub(1),
            }
        });
        if let Some(filter) = request["subjects_filter"].as_str() {
            // Real servers cap the subject map per reply; serving small pages
            // here keeps clients honest about walking the offset.
            const PAGE_SIZE: usize = 3;
            let offset = request["offset"].as_u64().unwrap_or(0) as usize;
            let mut counts: BTreeMap<String, u64> = BTreeMap::new();
            for message in &record.messages {
                if subject_matches(filter, &message.subject) {
                    *counts.entry(message.subject.clone()).or_default() += 1;
                }
            }
            info["state"]["num_subjects"] = json!(counts.len());
            let page: serde_json::Map<String, Value> = counts
                .into_iter()
                .skip(offset)
                .take(PAGE_SIZE)
                .map(|(subject, count)| (subject, json!(count)))
                .collect();
            info["state"]["subjects"] = Value::Object(page);
        }
        return info;
    }
    if let Some(name) = operation.strip_prefix("STREAM.DELETE.") {
        return if state.streams.remove(name).is_some() {
            json!({"success": true})
        } else {
            not_found()
        };
    }
    if let Some(name) = operation.strip_prefix("STREAM.PURGE.") {
        let Some(record) = state.streams.get_mut(name) else {
            return not_found();
        };
        let request: Value = serde_json::from_slice(payload).expect("purge request");
        let before = record.messages.len();
        if let Some(filter) = request["filter"].as_str() {
            record
                .messages
                .retain(|message| !subject_matches(filter, &message.subject));
        } else {
            record.messages.clear();
        }
        return json!({"success": true, "purged": before - record.messages.len()});
    }
    panic!("fake server got unexpected api operation: {operation}");
}

fn handle_direct_get(
    state: &State,
    session: &Session,
    inbox_sid: u64,
    reply: &str,
    stream: &str,
    payload: &[u8],
) {
    let request: Value = serde_json::from_slice(payload).expect("direct get request");
    let found = state.streams.get(stream).and_then(|record| {
        if let Some(subject) = request["last_by_subj"].as_str() {
            record
                .messages
                .iter()
                .rev()
                .find(|message| message.subject == subject)
        } else if let Some(subject) = request["next_by_subj"].as_str() {
            let from = request["seq"].as_u64().unwrap_or(0);
            record
                .messages
                .iter()
                .find(|message| message.subject == subject && message.seq >= from)
        } else {
            let seq = request["seq"].as_u64().unwrap_or(0);
            record.messages.iter().find(|message| message.seq == seq)
        }
    });
    match found {
        Some(message) => {
            let mut headers = HeaderMap::new();
            headers.append("Nats-Sequence", message.seq.to_string());
            headers.append("Nats-Subject", message.subject.clone());
            session.send_hmsg(reply, inbox_sid, &headers, &message.payload);
        }
        None => {
            let mut headers = HeaderMap::new();
            headers.set_status(404, "Message Not Found");
            session.send_hmsg(reply, inbox_sid, &headers, b"");
        }
    }
}

fn not_found() -> Value {
    json!({"error": {"code": 404, "err_code": 10059, "description": "stream not found"}})
}

impl Session {
    fn send_raw(&self, bytes: Vec<u8>) {
        let _ = self.to_client.send(Bytes::from(bytes));
    }

    fn send_msg(&self, subject: &str, sid: u64, payload: &[u8]) {
        let mut frame = format!("MSG {subject} {sid} {}\r\n", payload.len()).into_bytes();
        frame.extend_from_slice(payload);
        frame.extend_from_slice(b"\r\n");
        self.send_raw(frame);
    }

    fn send_hmsg(&self, subject: &str, sid: u64, headers: &HeaderMap, payload: &[u8]) {
        let block = headers.encode();
        let total = block.len() + payload.len();
        let mut frame =
            format!("HMSG {subject} {sid} {} {total}\r\n", block.len()).into_bytes();
        frame.extend_from_slice(&block);
        frame.extend_from_slice(payload);
        frame.extend_from_slice(b"\r\n");
        self.send_raw(frame);
    }
}

fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');
    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(expected), Some(actual)) if expected == actual => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

fn find_crlf(bytes: &[u8]) -> Option<usize> {
    bytes.windows(2).position(|pair| pair == b"\r\n")
}
