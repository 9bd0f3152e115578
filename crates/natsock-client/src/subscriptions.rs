//! Subscription registry and the consumer-facing subscription handle.
//!
//! # Purpose
//! Tracks active subscriptions by sid and routes inbound messages to their
//! bounded delivery queues. The read loop calls `dispatch`; user code never
//! runs there, it consumes from the queue on its own task.
//!
//! # Design notes
//! Messages for one subscription are delivered in wire order because the read
//! loop dispatches sequentially. An entry is active from insert until remove;
//! a removed sid never dispatches again and is never reallocated for the
//! lifetime of the connection.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use natsock_wire::ClientOp;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::config::QueuePolicy;
use crate::connection::Shared;
use crate::error::Result;
use crate::events::Event;
use crate::message::Message;

pub(crate) struct SubscriptionEntry {
    pub(crate) subject: String,
    pub(crate) queue_group: Option<String>,
    pub(crate) sender: mpsc::Sender<Message>,
}

pub(crate) struct Registry {
    next_sid: AtomicU64,
    entries: Mutex<HashMap<u64, SubscriptionEntry>>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            next_sid: AtomicU64::new(0),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate the next sid. Monotonic; never reused.
    pub(crate) fn next_sid(&self) -> u64 {
        self.next_sid.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn insert(&self, sid: u64, entry: SubscriptionEntry) {
        self.entries.lock().unwrap().insert(sid, entry);
    }

    /// Deactivate and forget. Removing twice is a no-op.
    pub(crate) fn remove(&self, sid: u64) -> bool {
        self.entries.lock().unwrap().remove(&sid).is_some()
    }

    /// Route one message. Returns an event for the caller to publish when the
    /// delivery was degraded; the registry itself stays unaware of the event
    /// channel.
    pub(crate) async fn dispatch(
        &self,
        sid: u64,
        message: Message,
        policy: QueuePolicy,
    ) -> Option<Event> {
        let (sender, subject) = {
            let entries = self.entries.lock().unwrap();
            match entries.get(&sid) {
                Some(entry) => (entry.sender.clone(), entry.subject.clone()),
                None => return None,
            }
        };
        match policy {
            QueuePolicy::Block => {
                if sender.send(message).await.is_err() {
                    self.remove(sid);
                }
                None
            }
            QueuePolicy::DropNew => match sender.try_send(message) {
                Ok(()) => None,
                Err(TrySendError::Full(_)) => Some(Event::SlowConsumer { sid, subject }),
                Err(TrySendError::Closed(_)) => {
                    self.remove(sid);
                    None
                }
            },
        }
    }

    /// SUB commands for every active entry, for replay after reconnect. Sids
    /// are preserved so server-side state matches the local registry.
    pub(crate) fn replay_ops(&self) -> Vec<ClientOp> {
        let entries = self.entries.lock().unwrap();
        let mut ops: Vec<(u64, ClientOp)> = entries
            .iter()
            .map(|(sid, entry)| {
                (
                    *sid,
                    ClientOp::Sub {
                        subject: entry.subject.clone(),
                        queue_group: entry.queue_group.clone(),
                        sid: *sid,
                    },
                )
            })
            .collect();
        ops.sort_by_key(|(sid, _)| *sid);
        ops.into_iter().map(|(_, op)| op).collect()
    }
}

/// An active subscription. Messages arrive in wire order through `next`.
///
/// Dropping the handle deactivates the subscription locally; `unsubscribe`
/// also tells the server to stop sending.
pub struct Subscription {
    pub(crate) sid: u64,
    pub(crate) subject: String,
    pub(crate) receiver: mpsc::Receiver<Message>,
    pub(crate) shared: Arc<Shared>,
}

impl Subscription {
    pub fn sid(&self) -> u64 {
        self.sid
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Next message, or `None` once the subscription is gone.
    pub async fn next(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }

    pub fn try_next(&mut self) -> Option<Message> {
        self.receiver.try_recv().ok()
    }

    /// Remove the registration and send UNSUB.
    pub async fn unsubscribe(mut self) -> Result<()> {
        self.shared.registry().remove(self.sid);
        self.receiver.close();
        self.shared
            .send_op(ClientOp::Unsub {
                sid: self.sid,
                max: None,
            })
            .await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // Local deactivation only; no wire traffic from a Drop.
        self.shared.registry().remove(self.sid);
    }
}
