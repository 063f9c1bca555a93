//! The hub connection seam and the bus-backed proxy applications use instead.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use hub_bus::{
    command_topic, Bus, BusResult, Message, Subscription, CMD_FIELD, CMD_PAYLOAD, TOPIC_COMMANDS,
    TOPIC_EVENTS,
};
use serde_json::Map;

use crate::error::ConnectionError;

/// Physical connection to a message hub.
///
/// Implementations are handed to the provider once and owned by the device
/// bridge from then on.
#[async_trait]
pub trait HubDevice: Send + Sync + 'static {
    /// Identifies the physical connection. Two devices reporting the same id
    /// are treated as the same connection.
    fn connection_id(&self) -> String;

    /// Inbound messages from the hub. Called once by the bridge.
    fn events(&self) -> BoxStream<'static, Message>;

    async fn send_command(&self, command: Message) -> Result<(), ConnectionError>;
}

/// Device view for applications: reads and writes go through bus topics,
/// never through the connection itself.
#[derive(Clone)]
pub struct HubClient {
    bus: Arc<dyn Bus>,
}

impl HubClient {
    pub fn new(bus: Arc<dyn Bus>) -> Self {
        Self { bus }
    }

    /// Every message received from the hub.
    pub fn events(&self) -> Subscription {
        self.bus.subscribe(TOPIC_EVENTS)
    }

    /// Hub commands whose `cmd` field equals `kind`.
    pub fn commands(&self, kind: &str) -> Subscription {
        self.bus.subscribe(&command_topic(kind))
    }

    /// Queues `command` for the hub connection.
    pub fn send_command(&self, command: Message) -> BusResult<()> {
        self.bus.publish(TOPIC_COMMANDS, command)
    }

    /// Builds a `{cmd, payload}` command message.
    pub fn command(kind: &str, payload: Message) -> Message {
        let mut body = Map::new();
        body.insert(CMD_FIELD.to_string(), Message::String(kind.to_string()));
        body.insert(CMD_PAYLOAD.to_string(), payload);
        Message::Object(body)
    }
}
