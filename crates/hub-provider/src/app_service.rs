//! Named applications that can be submitted locally or from the hub.
//!
//! The service registers itself as control `appService/hub` with a `submit`
//! operation taking `{"name": ..., "config": {...}}`.

use std::collections::BTreeMap;
use std::sync::Arc;

use control_registry::{HandlerError, OperationSet};
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::engine::{Job, JobConfig, Topology};
use crate::error::ProviderError;
use crate::provider::JobLauncher;

pub const APP_SERVICE_CONTROL: &str = "appService";
pub const APP_SERVICE_ID: &str = "hub";

/// Populates a topology for one application. Receives the submission config.
pub type AppBuilder = Arc<dyn Fn(&mut Topology, &Value) -> anyhow::Result<()> + Send + Sync>;

pub struct ApplicationService {
    launcher: Arc<JobLauncher>,
    apps: RwLock<BTreeMap<String, AppBuilder>>,
}

#[derive(Deserialize)]
struct SubmitArgs {
    name: String,
    #[serde(default)]
    config: Value,
}

impl ApplicationService {
    pub(crate) fn new(launcher: Arc<JobLauncher>) -> Self {
        Self {
            launcher,
            apps: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn register_application<F>(
        &self,
        name: impl Into<String>,
        builder: F,
    ) -> Result<(), ProviderError>
    where
        F: Fn(&mut Topology, &Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let name = name.into();
        let mut guard = self.apps.write();
        if guard.contains_key(&name) {
            return Err(ProviderError::DuplicateApplication(name));
        }
        info!(target: "hub.lifecycle", app = %name, "application registered");
        guard.insert(name, Arc::new(builder));
        Ok(())
    }

    pub fn applications(&self) -> Vec<String> {
        self.apps.read().keys().cloned().collect()
    }

    /// Builds the named application and submits it as a job of the same name.
    pub async fn submit_application(
        &self,
        name: &str,
        config: Value,
    ) -> Result<Job, ProviderError> {
        let builder = self
            .apps
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ProviderError::UnknownApplication(name.to_string()))?;

        let mut topology = self.launcher.new_topology(Some(name));
        builder(&mut topology, &config).map_err(|source| ProviderError::Build {
            app: name.to_string(),
            source,
        })?;

        self.launcher
            .submit(topology, JobConfig::named(name))
            .await
            .map_err(|source| ProviderError::Submission {
                app: name.to_string(),
                source,
            })
    }

    /// Operations exposed through the control registry.
    ///
    /// `submit` validates its arguments and hands the submission to a task;
    /// the outcome is logged.
    pub(crate) fn control_operations(self: &Arc<Self>) -> OperationSet {
        let service = Arc::downgrade(self);
        OperationSet::new().with("submit", move |args| {
            let args: SubmitArgs = serde_json::from_value(args)?;
            let service = service
                .upgrade()
                .ok_or_else(|| HandlerError::new("application service is gone"))?;
            if !service.apps.read().contains_key(&args.name) {
                return Err(HandlerError::new(format!("no application named `{}`", args.name)));
            }
            let runtime = tokio::runtime::Handle::try_current()
                .map_err(|err| HandlerError::new(format!("no runtime to submit on: {err}")))?;
            runtime.spawn(async move {
                match service.submit_application(&args.name, args.config).await {
                    Ok(job) => {
                        info!(
                            target: "hub.lifecycle",
                            app = %args.name,
                            job = %job.id(),
                            "application submitted by control request"
                        );
                    }
                    Err(err) => {
                        warn!(
                            target: "hub.lifecycle",
                            app = %args.name,
                            error = %err,
                            "control request failed to submit application"
                        );
                    }
                }
            });
            Ok(())
        })
    }
}
