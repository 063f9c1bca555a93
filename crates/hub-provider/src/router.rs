//! Routes `controlService` device commands into the control registry.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use control_registry::{ControlError, ControlRegistry, ControlRequest};
use hub_bus::{BusMessage, Message, Subscription, CMD_PAYLOAD, CONTROL_SERVICE};
use tracing::{debug, error};

use crate::device::HubClient;
use crate::engine::Topology;

/// Decodes the `payload` of a control command and dispatches it.
pub fn route_command(registry: &ControlRegistry, command: &Message) -> Result<(), ControlError> {
    let payload = command.get(CMD_PAYLOAD).cloned().ok_or_else(|| {
        ControlError::Malformed(format!("command has no `{CMD_PAYLOAD}` field"))
    })?;
    let request = ControlRequest::from_value(payload)?;
    registry.dispatch(&request)
}

/// Standing subscription on `commands.controlService`.
///
/// Failures are logged and the command is dropped; there is no response
/// channel back to the hub.
pub struct ControlCommandRouter {
    registry: Arc<ControlRegistry>,
    commands: Subscription,
}

impl ControlCommandRouter {
    pub fn new(client: &HubClient, registry: Arc<ControlRegistry>) -> Self {
        Self {
            registry,
            commands: client.commands(CONTROL_SERVICE),
        }
    }

    pub fn install(self, topology: &mut Topology) {
        topology.add_task("control-router", self.run());
    }

    async fn run(self) -> anyhow::Result<()> {
        let ControlCommandRouter { registry, commands } = self;
        let route = move |msg: BusMessage| -> Result<(), ControlError> {
            let outcome =
                catch_unwind(AssertUnwindSafe(|| route_command(&registry, &msg.payload)));
            match outcome {
                Ok(result) => {
                    result?;
                    debug!(target: "hub.control", "control command dispatched");
                }
                Err(_) => {
                    error!(target: "hub.control", "control operation panicked");
                }
            }
            Ok(())
        };
        commands.for_each_logged("control-router", route).await;
        Ok(())
    }
}
