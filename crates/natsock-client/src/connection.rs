//! Connection core: handshake, read loop, keep-alive, reconnect.
//!
//! # Purpose
//! Owns one transport session and drives the protocol over it: the
//! INFO → CONNECT → PING/PONG handshake, a background read loop that routes
//! inbound operations, a keep-alive loop that detects dead links, and an
//! exponential-backoff reconnect loop that replays subscriptions.
//!
//! # Design notes
//! The transport's write half sits behind a mutex and every outbound command
//! is one `send` call, so frames never interleave. The read half and parse
//! buffer are owned by the read loop alone (the handshake, which precedes
//! it, uses them first). Registry and request map are owned by the shared
//! state and borrow nothing back; loops reach them through `Arc<Shared>`.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use bytes::{Bytes, BytesMut};
use natsock_transport::{Connector, TransportReader, TransportWriter, WsConnector};
use natsock_wire::{try_parse, ClientOp, ConnectInfo, HeaderMap, ReadBuffer, ServerInfo, ServerOp};
use rand::Rng;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::auth::AuthCredentials;
use crate::config::ConnectOptions;
use crate::error::{Error, Result};
use crate::events::{Event, Status};
use crate::inbox::RequestMap;
use crate::message::Message;
use crate::subscriptions::{Registry, Subscription, SubscriptionEntry};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Handle to one connection. Cheap to clone; all clones share the session.
#[derive(Clone)]
pub struct Client {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

pub(crate) struct Shared {
    options: ConnectOptions,
    connector: Box<dyn Connector>,
    writer: Mutex<Option<Box<dyn TransportWriter>>>,
    registry: Registry,
    requests: RequestMap,
    request_counter: AtomicU64,
    flush_waiters: StdMutex<VecDeque<oneshot::Sender<()>>>,
    pings_out: AtomicU32,
    status: StdMutex<Status>,
    events: broadcast::Sender<Event>,
    server_info: StdMutex<ServerInfo>,
    user_closed: AtomicBool,
    session_stop: StdMutex<Option<watch::Sender<bool>>>,
}

struct SessionParts {
    reader: Box<dyn TransportReader>,
    buffer: ReadBuffer,
}

impl Client {
    /// Connect over WebSocket to the configured URL.
    pub async fn connect(options: ConnectOptions) -> Result<Self> {
        Self::connect_with(options, Box::new(WsConnector)).await
    }

    /// Connect through a caller-provided transport factory.
    pub async fn connect_with(
        options: ConnectOptions,
        connector: Box<dyn Connector>,
    ) -> Result<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let shared = Arc::new(Shared {
            options,
            connector,
            writer: Mutex::new(None),
            registry: Registry::new(),
            requests: RequestMap::new(),
            request_counter: AtomicU64::new(0),
            flush_waiters: StdMutex::new(VecDeque::new()),
            pings_out: AtomicU32::new(0),
            status: StdMutex::new(Status::Disconnected),
            events,
            server_info: StdMutex::new(ServerInfo::default()),
            user_closed: AtomicBool::new(false),
            session_stop: StdMutex::new(None),
        });
        shared.set_status(Status::Connecting);
        let parts = match establish(&shared).await {
            Ok(parts) => parts,
            Err(err) => {
                shared.set_status(Status::Disconnected);
                return Err(err);
            }
        };
        spawn_session(&shared, parts);
        shared.set_status(Status::Connected);
        Ok(Self { shared })
    }

    pub fn status(&self) -> Status {
        self.shared.status()
    }

    /// The most recent INFO the server sent.
    pub fn server_info(&self) -> ServerInfo {
        self.shared.server_info.lock().unwrap().clone()
    }

    /// Subscribe to status changes and asynchronous errors.
    pub fn events(&self) -> broadcast::Receiver<Event> {
        self.shared.events.subscribe()
    }

    pub async fn publish(&self, subject: &str, payload: Bytes) -> Result<()> {
        self.publish_op(subject, None, None, payload).await
    }

    pub async fn publish_with_reply(
        &self,
        subject: &str,
        reply: &str,
        payload: Bytes,
    ) -> Result<()> {
        self.publish_op(subject, Some(reply.to_string()), None, payload)
            .await
    }

    pub async fn publish_with_headers(
        &self,
        subject: &str,
        headers: HeaderMap,
        payload: Bytes,
    ) -> Result<()> {
        self.publish_op(subject, None, Some(headers), payload).await
    }

    async fn publish_op(
        &self,
        subject: &str,
        reply: Option<String>,
        headers: Option<HeaderMap>,
        payload: Bytes,
    ) -> Result<()> {
        self.shared.ensure_can_send()?;
        let op = match headers {
            Some(headers) => ClientOp::HPub {
                subject: subject.to_string(),
                reply,
                headers,
                payload,
            },
            None => ClientOp::Pub {
                subject: subject.to_string(),
                reply,
                payload,
            },
        };
        self.shared.send_op(op).await
    }

    /// Publish and await a single reply under the configured request timeout.
    pub async fn request(&self, subject: &str, payload: Bytes) -> Result<Message> {
        self.request_inner(subject, None, payload).await
    }

    pub async fn request_with_headers(
        &self,
        subject: &str,
        headers: HeaderMap,
        payload: Bytes,
    ) -> Result<Message> {
        self.request_inner(subject, Some(headers), payload).await
    }

    async fn request_inner(
        &self,
        subject: &str,
        headers: Option<HeaderMap>,
        payload: Bytes,
    ) -> Result<Message> {
        let shared = &self.shared;
        shared.ensure_can_send()?;
        let request_id = shared.request_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let (reply, receiver) = shared.requests.register(request_id);
        let op = match headers {
            Some(headers) => ClientOp::HPub {
                subject: subject.to_string(),
                reply: Some(reply.clone()),
                headers,
                payload,
            },
            None => ClientOp::Pub {
                subject: subject.to_string(),
                reply: Some(reply.clone()),
                payload,
            },
        };
        if let Err(err) = shared.send_op(op).await {
            shared.requests.remove(&reply);
            return Err(err);
        }
        let message = match tokio::time::timeout(shared.options.request_timeout, receiver).await {
            Ok(Ok(message)) => message,
            Ok(Err(_)) => {
                return Err(Error::Connection(
                    "connection lost while awaiting reply".to_string(),
                ))
            }
            Err(_) => {
                shared.requests.remove(&reply);
                return Err(Error::RequestTimeout {
                    subject: subject.to_string(),
                });
            }
        };
        if message.is_no_responders() {
            return Err(Error::NoResponders {
                subject: subject.to_string(),
            });
        }
        Ok(message)
    }

    pub async fn subscribe(&self, subject: &str) -> Result<Subscription> {
        self.subscribe_inner(subject, None).await
    }

    pub async fn queue_subscribe(&self, subject: &str, queue_group: &str) -> Result<Subscription> {
        self.subscribe_inner(subject, Some(queue_group.to_string()))
            .await
    }

    async fn subscribe_inner(
        &self,
        subject: &str,
        queue_group: Option<String>,
    ) -> Result<Subscription> {
        let shared = &self.shared;
        shared.ensure_can_send()?;
        let sid = shared.registry.next_sid();
        let (sender, receiver) = mpsc::channel(shared.options.subscription_capacity);
        shared.registry.insert(
            sid,
            SubscriptionEntry {
                subject: subject.to_string(),
                queue_group: queue_group.clone(),
                sender,
            },
        );
        let op = ClientOp::Sub {
            subject: subject.to_string(),
            queue_group,
            sid,
        };
        if let Err(err) = shared.send_op(op).await {
            shared.registry.remove(sid);
            return Err(err);
        }
        Ok(Subscription {
            sid,
            subject: subject.to_string(),
            receiver,
            shared: Arc::clone(shared),
        })
    }

    /// Round-trip a PING so everything written before it is known processed.
    pub async fn flush(&self) -> Result<()> {
        let shared = &self.shared;
        shared.ensure_can_send()?;
        let (tx, rx) = oneshot::channel();
        shared.flush_waiters.lock().unwrap().push_back(tx);
        if let Err(err) = shared.send_op(ClientOp::Ping).await {
            shared.flush_waiters.lock().unwrap().pop_back();
            return Err(err);
        }
        match tokio::time::timeout(shared.options.request_timeout, rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(Error::Connection(
                "connection lost while awaiting flush".to_string(),
            )),
            Err(_) => Err(Error::RequestTimeout {
                subject: "flush".to_string(),
            }),
        }
    }

    /// Close the connection. Terminal; pending requests fail and background
    /// loops stop. Safe to call more than once.
    pub async fn close(&self) {
        let shared = &self.shared;
        if shared.user_closed.swap(true, Ordering::SeqCst) {
            return;
        }
        shared.set_status(Status::Closed);
        shared.stop_session();
        {
            let mut writer = shared.writer.lock().await;
            if let Some(mut writer) = writer.take() {
                let _ = writer.close().await;
            }
        }
        shared.fail_pending();
    }
}

impl Shared {
    pub(crate) fn registry(&self) -> &Registry {
        &self.registry
    }

    fn status(&self) -> Status {
        *self.status.lock().unwrap()
    }

    fn set_status(&self, next: Status) {
        {
            let mut status = self.status.lock().unwrap();
            if *status == next || *status == Status::Closed {
                return;
            }
            *status = next;
        }
        self.emit(Event::StatusChanged(next));
    }

    fn emit(&self, event: Event) {
        let _ = self.events.send(event);
    }

    fn ensure_can_send(&self) -> Result<()> {
        match self.status() {
            Status::Connected => Ok(()),
            Status::Closed => Err(Error::Closed),
            _ => Err(Error::Connection("connection is down".to_string())),
        }
    }

    pub(crate) async fn send_op(&self, op: ClientOp) -> Result<()> {
        let bytes = op.encode()?;
        let mut writer = self.writer.lock().await;
        match writer.as_mut() {
            Some(writer) => Ok(writer.send(bytes).await?),
            None => {
                if self.status() == Status::Closed {
                    Err(Error::Closed)
                } else {
                    Err(Error::Connection("not connected".to_string()))
                }
            }
        }
    }

    /// Fail every pending request and flush waiter with connection loss.
    fn fail_pending(&self) {
        self.requests.fail_all();
        self.flush_waiters.lock().unwrap().clear();
    }

    fn stop_session(&self) {
        if let Some(stop) = self.session_stop.lock().unwrap().take() {
            let _ = stop.send(true);
        }
    }

    fn begin_session(&self) -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        let previous = self.session_stop.lock().unwrap().replace(tx);
        if let Some(previous) = previous {
            let _ = previous.send(true);
        }
        rx
    }
}

async fn establish(shared: &Arc<Shared>) -> Result<SessionParts> {
    let timeout = shared.options.connect_timeout;
    match tokio::time::timeout(timeout, handshake(shared)).await {
        Ok(result) => result,
        Err(_) => Err(Error::Connection(format!(
            "handshake timed out after {timeout:?}"
        ))),
    }
}

async fn handshake(shared: &Arc<Shared>) -> Result<SessionParts> {
    let (mut writer, mut reader) = shared.connector.connect(&shared.options.url).await?;
    let mut buffer = ReadBuffer::with_capacity(shared.options.receive_buffer_size);

    let info = loop {
        match try_parse(&mut buffer)? {
            Some(ServerOp::Info(info)) => break info,
            Some(ServerOp::Err(text)) => return Err(classify_server_error(text)),
            Some(_) => {}
            None => {
                let chunk = reader.receive().await?.ok_or_else(|| {
                    Error::Connection("connection closed before INFO".to_string())
                })?;
                buffer.extend(&chunk);
            }
        }
    };

    let credentials = match &shared.options.auth {
        Some(auth) => auth.credentials(&info.nonce).map_err(|err| match err {
            Error::Authentication(_) => err,
            other => Error::Authentication(other.to_string()),
        })?,
        None => AuthCredentials::default(),
    };
    let connect = ConnectInfo {
        headers: shared.options.headers,
        no_responders: shared.options.no_responders,
        name: shared.options.name.clone(),
        jwt: credentials.jwt,
        sig: credentials.signature,
        auth_token: credentials.auth_token,
        user: credentials.user,
        pass: credentials.pass,
        nkey: credentials.nkey,
        ..ConnectInfo::default()
    };

    // CONNECT and the verification PING go out as one write.
    let mut opening = BytesMut::new();
    opening.extend_from_slice(&ClientOp::Connect(connect).encode()?);
    opening.extend_from_slice(&ClientOp::Ping.encode()?);
    writer.send(opening.freeze()).await?;

    loop {
        match try_parse(&mut buffer)? {
            Some(ServerOp::Pong) => break,
            Some(ServerOp::Ok) => {}
            Some(ServerOp::Ping) => writer.send(ClientOp::Pong.encode()?).await?,
            Some(ServerOp::Err(text)) => return Err(classify_server_error(text)),
            Some(_) => {}
            None => {
                let chunk = reader.receive().await?.ok_or_else(|| {
                    Error::Connection("connection closed during handshake".to_string())
                })?;
                buffer.extend(&chunk);
            }
        }
    }

    debug!(server_id = %info.server_id, version = %info.version, "handshake complete");
    *shared.server_info.lock().unwrap() = info;
    shared.pings_out.store(0, Ordering::Relaxed);
    {
        let mut guard = shared.writer.lock().await;
        *guard = Some(writer);
    }

    // Fresh inbox per session. Stale pending requests were failed when the
    // previous session dropped; install clears any that raced in since.
    let wildcard = shared.requests.install_fresh();
    let inbox_sid = shared.registry.next_sid();
    shared
        .send_op(ClientOp::Sub {
            subject: wildcard,
            queue_group: None,
            sid: inbox_sid,
        })
        .await?;

    Ok(SessionParts { reader, buffer })
}

fn classify_server_error(text: String) -> Error {
    if text.to_ascii_lowercase().contains("auth") {
        Error::Authentication(text)
    } else {
        Error::Server(text)
    }
}

fn spawn_session(shared: &Arc<Shared>, parts: SessionParts) {
    let stop = shared.begin_session();
    tokio::spawn(read_loop(Arc::clone(shared), parts.reader, parts.buffer));
    tokio::spawn(ping_loop(Arc::clone(shared), stop));
}

async fn read_loop(
    shared: Arc<Shared>,
    mut reader: Box<dyn TransportReader>,
    mut buffer: ReadBuffer,
) {
    let reason = loop {
        loop {
            match try_parse(&mut buffer) {
                Ok(Some(op)) => handle_op(&shared, op).await,
                Ok(None) => break,
                // The offending line was consumed; the stream resynchronizes.
                Err(err) => shared.emit(Event::ClientError(format!("protocol error: {err}"))),
            }
        }
        match reader.receive().await {
            Ok(Some(chunk)) => buffer.extend(&chunk),
            Ok(None) => break "connection closed by peer".to_string(),
            Err(err) => break err.to_string(),
        }
    };
    debug!(reason = %reason, "read loop exited");
    on_disconnect(shared).await;
}

async fn handle_op(shared: &Arc<Shared>, op: ServerOp) {
    match op {
        ServerOp::Ping => {
            if let Err(err) = shared.send_op(ClientOp::Pong).await {
                shared.emit(Event::ClientError(format!("failed to answer PING: {err}")));
            }
        }
        ServerOp::Pong => {
            shared.pings_out.store(0, Ordering::Relaxed);
            let waiter = shared.flush_waiters.lock().unwrap().pop_front();
            if let Some(waiter) = waiter {
                let _ = waiter.send(());
            }
        }
        ServerOp::Ok => {}
        ServerOp::Err(text) => shared.emit(Event::ServerError(text)),
        ServerOp::Info(info) => {
            *shared.server_info.lock().unwrap() = info;
        }
        ServerOp::Msg {
            subject,
            sid,
            reply,
            payload,
        } => deliver(shared, sid, Message::new(subject, reply, payload)).await,
        ServerOp::HMsg {
            subject,
            sid,
            reply,
            headers,
            payload,
        } => {
            deliver(
                shared,
                sid,
                Message::with_headers(subject, reply, headers, payload),
            )
            .await
        }
    }
}

async fn deliver(shared: &Arc<Shared>, sid: u64, message: Message) {
    // Replies win over subscriptions: anything under the inbox prefix goes to
    // the request correlator and never reaches the registry.
    if shared.requests.matches(&message.subject) {
        shared.requests.resolve(message);
        return;
    }
    if let Some(event) = shared
        .registry
        .dispatch(sid, message, shared.options.queue_policy)
        .await
    {
        shared.emit(event);
    }
}

async fn on_disconnect(shared: Arc<Shared>) {
    shared.stop_session();
    {
        let mut writer = shared.writer.lock().await;
        *writer = None;
    }
    shared.fail_pending();
    if shared.user_closed.load(Ordering::SeqCst) {
        return;
    }
    if shared.options.allow_reconnect {
        shared.set_status(Status::Reconnecting);
        reconnect_loop(shared).await;
    } else {
        shared.set_status(Status::Disconnected);
    }
}

async fn reconnect_loop(shared: Arc<Shared>) {
    let mut delay = shared.options.reconnect_delay;
    let mut attempts: u32 = 0;
    loop {
        if shared.user_closed.load(Ordering::SeqCst) {
            return;
        }
        if let Some(max) = shared.options.max_reconnect_attempts {
            if attempts >= max {
                warn!(attempts, "reconnect attempts exhausted");
                shared.set_status(Status::Disconnected);
                return;
            }
        }
        attempts += 1;
        let wait = if shared.options.reconnect_jitter {
            jittered(delay)
        } else {
            delay
        };
        tokio::time::sleep(wait).await;
        delay = (delay * 2).min(shared.options.max_reconnect_delay);

        match establish(&shared).await {
            Ok(parts) => {
                if shared.user_closed.load(Ordering::SeqCst) {
                    let mut writer = shared.writer.lock().await;
                    if let Some(mut writer) = writer.take() {
                        let _ = writer.close().await;
                    }
                    return;
                }
                if let Err(err) = replay_subscriptions(&shared).await {
                    shared.emit(Event::ClientError(format!(
                        "subscription replay failed: {err}"
                    )));
                    let mut writer = shared.writer.lock().await;
                    if let Some(mut writer) = writer.take() {
                        let _ = writer.close().await;
                    }
                    continue;
                }
                spawn_session(&shared, parts);
                shared.set_status(Status::Connected);
                debug!(attempts, "reconnected");
                return;
            }
            Err(err) => {
                shared.emit(Event::ClientError(format!("reconnect failed: {err}")));
            }
        }
    }
}

async fn replay_subscriptions(shared: &Arc<Shared>) -> Result<()> {
    for op in shared.registry.replay_ops() {
        shared.send_op(op).await?;
    }
    Ok(())
}

async fn ping_loop(shared: Arc<Shared>, mut stop: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(shared.options.ping_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately.
    interval.tick().await;
    loop {
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    return;
                }
            }
            _ = interval.tick() => {
                let outstanding = shared.pings_out.fetch_add(1, Ordering::Relaxed) + 1;
                if outstanding > shared.options.max_ping_out {
                    warn!(outstanding, "keep-alive pings unanswered; forcing the link down");
                    let mut writer = shared.writer.lock().await;
                    if let Some(writer) = writer.as_mut() {
                        let _ = writer.close().await;
                    }
                    return;
                }
                if let Err(err) = shared.send_op(ClientOp::Ping).await {
                    shared.emit(Event::ClientError(format!("keep-alive ping failed: {err}")));
                    return;
                }
            }
        }
    }
}

fn jittered(delay: std::time::Duration) -> std::time::Duration {
    let factor = rand::thread_rng().gen_range(0.75..=1.25);
    delay.mul_f64(factor)
}
