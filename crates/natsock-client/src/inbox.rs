//! Request/reply correlation under a per-connection wildcard inbox.
//!
//! # Design notes
//! Every successful (re)connect installs a fresh random prefix, so replies
//! addressed to a previous session can never resolve a new request. Pending
//! entries are failed by dropping their senders; awaiting callers observe the
//! closed channel as a connection-loss error.
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Mutex;

use rand::RngCore;
use tokio::sync::oneshot;

use crate::message::Message;

pub(crate) struct RequestMap {
    state: Mutex<InboxState>,
}

struct InboxState {
    prefix: String,
    pending: HashMap<String, oneshot::Sender<Message>>,
}

impl RequestMap {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(InboxState {
                prefix: String::new(),
                pending: HashMap::new(),
            }),
        }
    }

    /// Fail whatever is still pending, install a fresh prefix, and return the
    /// wildcard subject to subscribe for the new session.
    pub(crate) fn install_fresh(&self) -> String {
        let mut state = self.state.lock().unwrap();
        state.pending.clear();
        state.prefix = new_inbox_prefix();
        format!("{}*", state.prefix)
    }

    pub(crate) fn matches(&self, subject: &str) -> bool {
        let state = self.state.lock().unwrap();
        !state.prefix.is_empty() && subject.starts_with(&state.prefix)
    }

    /// Reserve a reply subject for the given request id.
    pub(crate) fn register(&self, request_id: u64) -> (String, oneshot::Receiver<Message>) {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock().unwrap();
        let reply = format!("{}{request_id}", state.prefix);
        state.pending.insert(reply.clone(), tx);
        (reply, rx)
    }

    pub(crate) fn remove(&self, reply: &str) {
        self.state.lock().unwrap().pending.remove(reply);
    }

    /// Resolve the pending request addressed by the message's subject.
    /// Replies with no waiter (late, cancelled, or stale) are dropped.
    pub(crate) fn resolve(&self, message: Message) {
        let sender = self.state.lock().unwrap().pending.remove(&message.subject);
        if let Some(sender) = sender {
            let _ = sender.send(message);
        }
    }

    pub(crate) fn fail_all(&self) {
        self.state.lock().unwrap().pending.clear();
    }
}

fn new_inbox_prefix() -> String {
    let mut entropy = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut entropy);
    let mut prefix = String::with_capacity(7 + 32 + 1);
    prefix.push_str("_INBOX.");
    for byte in entropy {
        let _ = write!(prefix, "{byte:02x}");
    }
    prefix.push('.');
    prefix
}
