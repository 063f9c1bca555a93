//! In-process topic bus shared by every application attached to a hub provider.
//!
//! Topics are plain strings. Each topic is backed by its own broadcast channel,
//! so a subscriber sees messages published after it subscribed, in publish
//! order, and never blocks the publisher or the other subscribers of the topic.

use std::collections::HashMap;
use std::fmt;

use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Unit carried on every topic.
pub type Message = serde_json::Value;

/// Device to application traffic.
pub const TOPIC_EVENTS: &str = "events";
/// Application to device traffic.
pub const TOPIC_COMMANDS: &str = "commands";
/// Command type reserved for control requests.
pub const CONTROL_SERVICE: &str = "controlService";
/// Field naming the command type of a device command.
pub const CMD_FIELD: &str = "cmd";
/// Field holding the command body.
pub const CMD_PAYLOAD: &str = "payload";

pub const DEFAULT_CAPACITY: usize = 128;

/// Topic carrying device commands of the given type, e.g. `commands.controlService`.
pub fn command_topic(kind: &str) -> String {
    format!("{TOPIC_COMMANDS}.{kind}")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Message,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus channel closed")]
    Closed,
}

pub type BusResult<T> = Result<T, BusError>;

pub trait Bus: Send + Sync {
    fn subscribe(&self, topic: &str) -> Subscription;
    fn publish(&self, topic: &str, payload: Message) -> BusResult<()>;
}

/// Live view of one topic for one subscriber.
pub struct Subscription {
    topic: String,
    rx: broadcast::Receiver<BusMessage>,
}

impl Subscription {
    fn new(topic: &str, rx: broadcast::Receiver<BusMessage>) -> Self {
        Self {
            topic: topic.to_string(),
            rx,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Waits for the next message. Returns `None` once the bus is closed.
    ///
    /// A subscriber that falls more than the bus capacity behind loses the
    /// oldest messages; the gap is logged and delivery resumes with the
    /// oldest message still buffered.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        loop {
            match self.rx.recv().await {
                Ok(msg) => return Some(msg),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        target: "hub.bus",
                        topic = %self.topic,
                        skipped,
                        "subscriber lagged, dropped messages"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Feeds every message to `handler` until the bus closes.
    ///
    /// Handler errors are logged under `name` and the loop keeps going, so
    /// one failing subscriber never affects the others.
    pub async fn for_each_logged<H, E>(mut self, name: impl Into<String>, mut handler: H)
    where
        H: FnMut(BusMessage) -> Result<(), E>,
        E: fmt::Display,
    {
        let name = name.into();
        while let Some(msg) = self.recv().await {
            if let Err(err) = handler(msg) {
                warn!(
                    target: "hub.bus",
                    subscriber = %name,
                    topic = %self.topic,
                    error = %err,
                    "subscriber handler failed"
                );
            }
        }
        debug!(target: "hub.bus", subscriber = %name, topic = %self.topic, "subscription ended");
    }

    pub fn into_stream(self) -> BoxStream<'static, BusMessage> {
        stream::unfold(self, |mut sub| async move {
            sub.recv().await.map(|msg| (msg, sub))
        })
        .boxed()
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .finish()
    }
}

#[derive(Default)]
struct Topics {
    closed: bool,
    senders: HashMap<String, broadcast::Sender<BusMessage>>,
}

/// In-memory bus; one instance per provider.
pub struct LocalBus {
    capacity: usize,
    topics: RwLock<Topics>,
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// `capacity` bounds how far a single subscriber may fall behind.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            topics: RwLock::new(Topics::default()),
        }
    }

    /// Ends every subscription and rejects further publishes.
    pub fn close(&self) {
        let mut guard = self.topics.write();
        guard.closed = true;
        let dropped = guard.senders.len();
        guard.senders.clear();
        debug!(target: "hub.bus", topics = dropped, "bus closed");
    }

    pub fn is_closed(&self) -> bool {
        self.topics.read().closed
    }

    /// Number of live subscriptions on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .senders
            .get(topic)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    /// Number of topics that currently have a channel.
    pub fn topic_count(&self) -> usize {
        self.topics.read().senders.len()
    }

    /// Drops the channel of `topic` once its last subscriber is gone.
    fn prune(&self, topic: &str) {
        let mut guard = self.topics.write();
        let idle = guard
            .senders
            .get(topic)
            .is_some_and(|sender| sender.receiver_count() == 0);
        if idle {
            guard.senders.remove(topic);
            trace!(target: "hub.bus", topic, "idle topic dropped");
        }
    }
}

impl Bus for LocalBus {
    fn subscribe(&self, topic: &str) -> Subscription {
        {
            let guard = self.topics.read();
            if let Some(sender) = guard.senders.get(topic) {
                return Subscription::new(topic, sender.subscribe());
            }
        }
        let mut guard = self.topics.write();
        if guard.closed {
            // Closed bus: hand out a subscription that ends immediately.
            return Subscription::new(topic, broadcast::channel(1).1);
        }
        let capacity = self.capacity;
        let rx = guard
            .senders
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(capacity).0)
            .subscribe();
        Subscription::new(topic, rx)
    }

    /// Channels are created by `subscribe` only, so publishing to a topic
    /// nobody listens to allocates nothing.
    fn publish(&self, topic: &str, payload: Message) -> BusResult<()> {
        let delivered = {
            let guard = self.topics.read();
            if guard.closed {
                return Err(BusError::Closed);
            }
            let Some(sender) = guard.senders.get(topic) else {
                trace!(target: "hub.bus", topic, "no subscribers");
                return Ok(());
            };
            sender
                .send(BusMessage {
                    topic: topic.to_string(),
                    payload,
                })
                .unwrap_or(0)
        };
        trace!(target: "hub.bus", topic, delivered, "published");
        if delivered == 0 {
            self.prune(topic);
        }
        Ok(())
    }
}

/// Runs `handler` for every message on `topic` on its own task.
///
/// See [`Subscription::for_each_logged`]. The task ends when the bus closes.
pub fn spawn_handler<B, H, E>(bus: &B, topic: &str, name: &str, handler: H) -> JoinHandle<()>
where
    B: Bus + ?Sized,
    H: FnMut(BusMessage) -> Result<(), E> + Send + 'static,
    E: fmt::Display + 'static,
{
    tokio::spawn(bus.subscribe(topic).for_each_logged(name.to_string(), handler))
}
