//! Device gateway bridge: the only code that touches the hub connection.
//!
//! Inbound hub messages are republished on `events`, and device commands
//! (messages with a string `cmd`) additionally on `commands.<cmd>`. Messages
//! applications publish on `commands` are written to the connection by a
//! dedicated task, so a slow connection only holds up outbound commands.

use std::collections::HashSet;
use std::sync::{Arc, OnceLock};

use futures::StreamExt;
use hub_bus::{
    command_topic, Bus, BusError, BusResult, Message, CMD_FIELD, TOPIC_COMMANDS, TOPIC_EVENTS,
};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::device::HubDevice;
use crate::engine::Topology;
use crate::error::BridgeError;

static LIVE_CONNECTIONS: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();

fn live_connections() -> &'static Mutex<HashSet<String>> {
    LIVE_CONNECTIONS.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Process-wide claim on a connection id, released on drop.
struct ConnectionLease {
    connection_id: String,
}

impl ConnectionLease {
    fn acquire(connection_id: String) -> Result<Self, BridgeError> {
        if !live_connections().lock().insert(connection_id.clone()) {
            return Err(BridgeError::ConnectionInUse(connection_id));
        }
        debug!(target: "hub.bridge", connection = %connection_id, "connection lease acquired");
        Ok(Self { connection_id })
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        live_connections().lock().remove(&self.connection_id);
        debug!(target: "hub.bridge", connection = %self.connection_id, "connection lease released");
    }
}

/// Returns true while a bridge owns `connection_id`.
pub fn connection_in_use(connection_id: &str) -> bool {
    live_connections().lock().contains(connection_id)
}

pub struct DeviceGatewayBridge {
    device: Arc<dyn HubDevice>,
    bus: Arc<dyn Bus>,
    lease: Arc<ConnectionLease>,
}

impl DeviceGatewayBridge {
    /// Takes ownership of `device`. Fails if another live bridge already
    /// owns the same connection.
    pub fn new<D: HubDevice>(device: D, bus: Arc<dyn Bus>) -> Result<Self, BridgeError> {
        let lease = ConnectionLease::acquire(device.connection_id())?;
        Ok(Self {
            device: Arc::new(device),
            bus,
            lease: Arc::new(lease),
        })
    }

    pub fn connection_id(&self) -> &str {
        &self.lease.connection_id
    }

    /// Adds the inbound and outbound pumps to `topology`.
    ///
    /// The outbound subscription is taken here, so commands published from
    /// now on reach the connection once the job runs.
    pub fn install(self, topology: &mut Topology) {
        let DeviceGatewayBridge { device, bus, lease } = self;
        let mut outbound = bus.subscribe(TOPIC_COMMANDS);

        let inbound_device = device.clone();
        let inbound_lease = lease.clone();
        topology.add_task("device-events", async move {
            let connection = inbound_lease.connection_id.as_str();
            let mut events = inbound_device.events();
            while let Some(msg) = events.next().await {
                match republish(bus.as_ref(), msg) {
                    Ok(()) => {}
                    Err(BusError::Closed) => {
                        debug!(
                            target: "hub.bridge",
                            connection,
                            "bus closed, stopping inbound pump"
                        );
                        return Ok(());
                    }
                }
            }
            info!(target: "hub.bridge", connection, "device event stream ended");
            Ok(())
        });

        topology.add_task("device-commands", async move {
            let connection = lease.connection_id.as_str();
            while let Some(msg) = outbound.recv().await {
                if let Err(err) = device.send_command(msg.payload).await {
                    warn!(
                        target: "hub.bridge",
                        connection,
                        error = %err,
                        "failed to send command to hub"
                    );
                }
            }
            debug!(target: "hub.bridge", connection, "command subscription ended");
            Ok(())
        });
    }
}

fn republish(bus: &dyn Bus, msg: Message) -> BusResult<()> {
    let command_kind = msg
        .get(CMD_FIELD)
        .and_then(Message::as_str)
        .map(command_topic);
    match command_kind {
        Some(topic) => {
            bus.publish(TOPIC_EVENTS, msg.clone())?;
            bus.publish(&topic, msg)
        }
        None => bus.publish(TOPIC_EVENTS, msg),
    }
}
