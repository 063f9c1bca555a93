mod config;
mod stdio_device;
mod telemetry;

use std::sync::Arc;

use anyhow::Context;
use hub_bus::Message;
use hub_provider::{DirectSubmitter, HubClient, HubProvider};
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::stdio_device::StdioDevice;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = AppConfig::from_env();
    let log_level = telemetry::init_tracing(&cfg.log_filter);

    let (device, stdin_closed) = StdioDevice::new(cfg.connection_id.clone());
    let provider = HubProvider::new(device, Arc::new(DirectSubmitter::new()), cfg.provider.clone())
        .context("building hub provider")?;
    let _log_control = provider
        .control_registry()
        .register_scoped("log", "root", log_level.control_operations())
        .context("registering log control")?;
    register_echo(&provider)?;

    info!(
        connection_id = %cfg.connection_id,
        bus_capacity = cfg.provider.bus_capacity,
        "starting hubd"
    );
    let jobs = provider.start().await.context("starting system applications")?;
    for job in &jobs {
        info!(job = job.name(), id = job.id(), "system application running");
    }

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(err) = res {
                warn!(error = %err, "failed to listen for ctrl-c");
            }
            info!("shutdown requested");
        }
        _ = stdin_closed.notified() => {
            info!("hub connection closed");
        }
    }

    for job in jobs {
        job.cancel();
    }
    Ok(())
}

/// `echo` republishes every non-command hub event as a command of kind
/// `prefix` (default `echo`).
fn register_echo(provider: &HubProvider) -> anyhow::Result<()> {
    let client = provider.client();
    provider
        .application_service()
        .register_application("echo", move |topology, config| {
            let prefix = config
                .get("prefix")
                .and_then(Message::as_str)
                .unwrap_or("echo")
                .to_string();
            let client: HubClient = client.clone();
            let mut events = client.events();
            topology.add_task("echo", async move {
                while let Some(msg) = events.recv().await {
                    if msg.payload.get(hub_bus::CMD_FIELD).is_some() {
                        continue;
                    }
                    client.send_command(HubClient::command(&prefix, msg.payload))?;
                }
                Ok(())
            });
            Ok(())
        })?;
    Ok(())
}
