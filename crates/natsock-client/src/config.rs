// Connection options and their defaults.
use std::sync::Arc;
use std::time::Duration;

use crate::auth::Authenticator;

pub(crate) const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub(crate) const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
pub(crate) const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(250);
pub(crate) const DEFAULT_MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);
pub(crate) const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);
pub(crate) const DEFAULT_MAX_PING_OUT: u32 = 3;
pub(crate) const DEFAULT_RECEIVE_BUFFER_SIZE: usize = 64 * 1024;
pub(crate) const DEFAULT_SUBSCRIPTION_CAPACITY: usize = 512;

/// What dispatch does when a subscription queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueuePolicy {
    /// Wait for the consumer. Per-subscription ordering is preserved; a slow
    /// consumer stalls delivery for the whole connection.
    #[default]
    Block,
    /// Drop the new message and emit a slow-consumer event.
    DropNew,
}

/// Options the connection recognizes. Builder-style setters over defaults.
///
/// ```
/// use natsock_client::ConnectOptions;
/// use std::time::Duration;
///
/// let options = ConnectOptions::new("wss://nats.example.com:443")
///     .name("billing")
///     .request_timeout(Duration::from_secs(2));
/// assert!(options.allow_reconnect);
/// ```
#[derive(Clone)]
pub struct ConnectOptions {
    pub url: String,
    pub name: Option<String>,
    pub auth: Option<Arc<dyn Authenticator>>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub allow_reconnect: bool,
    /// `None` means retry forever.
    pub max_reconnect_attempts: Option<u32>,
    pub reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    /// Apply ±25% uniform jitter to each backoff delay.
    pub reconnect_jitter: bool,
    /// Advertise header support in CONNECT.
    pub headers: bool,
    /// Ask the server for 503 statuses on requests nobody answers.
    pub no_responders: bool,
    pub receive_buffer_size: usize,
    pub ping_interval: Duration,
    /// Unanswered keep-alive PINGs tolerated before the link is declared dead.
    pub max_ping_out: u32,
    pub subscription_capacity: usize,
    pub queue_policy: QueuePolicy,
}

impl ConnectOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            name: None,
            auth: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            allow_reconnect: true,
            max_reconnect_attempts: None,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            max_reconnect_delay: DEFAULT_MAX_RECONNECT_DELAY,
            reconnect_jitter: true,
            headers: true,
            no_responders: true,
            receive_buffer_size: DEFAULT_RECEIVE_BUFFER_SIZE,
            ping_interval: DEFAULT_PING_INTERVAL,
            max_ping_out: DEFAULT_MAX_PING_OUT,
            subscription_capacity: DEFAULT_SUBSCRIPTION_CAPACITY,
            queue_policy: QueuePolicy::default(),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn auth(mut self, auth: Arc<dyn Authenticator>) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn allow_reconnect(mut self, allow: bool) -> Self {
        self.allow_reconnect = allow;
        self
    }

    pub fn max_reconnect_attempts(mut self, attempts: Option<u32>) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn max_reconnect_delay(mut self, delay: Duration) -> Self {
        self.max_reconnect_delay = delay;
        self
    }

    pub fn reconnect_jitter(mut self, jitter: bool) -> Self {
        self.reconnect_jitter = jitter;
        self
    }

    pub fn headers(mut self, headers: bool) -> Self {
        self.headers = headers;
        self
    }

    pub fn no_responders(mut self, no_responders: bool) -> Self {
        self.no_responders = no_responders;
        self
    }

    pub fn receive_buffer_size(mut self, size: usize) -> Self {
        self.receive_buffer_size = size;
        self
    }

    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn max_ping_out(mut self, max: u32) -> Self {
        self.max_ping_out = max;
        self
    }

    pub fn subscription_capacity(mut self, capacity: usize) -> Self {
        self.subscription_capacity = capacity.max(1);
        self
    }

    pub fn queue_policy(mut self, policy: QueuePolicy) -> Self {
        self.queue_policy = policy;
        self
    }
}
