//! Lifecycle manager: one hub connection shared by every submitted topology.
//!
//! Construction creates the bus, claims the hub connection for the device
//! bridge, and prepares the system applications. `start` submits them in
//! registration order and stops at the first submission that fails; jobs that
//! were already submitted keep running.

use std::fmt;
use std::sync::Arc;

use control_registry::{ControlRegistration, ControlRegistry, OperationSet};
use hub_bus::{Bus, LocalBus};
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::app_service::{ApplicationService, APP_SERVICE_CONTROL, APP_SERVICE_ID};
use crate::bridge::DeviceGatewayBridge;
use crate::config::ProviderConfig;
use crate::device::{HubClient, HubDevice};
use crate::engine::{Job, JobConfig, Submitter, Topology};
use crate::error::{ProviderError, SubmissionError};
use crate::router::ControlCommandRouter;

pub const DEVICE_APP_ROLE: &str = "Device";
pub const CONTROL_APP_ROLE: &str = "CommandsToControl";
/// Control type under which every submitted job is registered.
pub const JOB_CONTROL: &str = "job";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Constructed,
    Starting,
    Started,
    StartFailed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LifecycleState::Constructed => "constructed",
            LifecycleState::Starting => "starting",
            LifecycleState::Started => "started",
            LifecycleState::StartFailed => "start_failed",
        };
        f.write_str(label)
    }
}

/// Submits topologies and registers a `job/<name>` control with a `cancel`
/// operation for each job until it finishes.
pub(crate) struct JobLauncher {
    submitter: Arc<dyn Submitter>,
    registry: Arc<ControlRegistry>,
}

impl JobLauncher {
    fn new(submitter: Arc<dyn Submitter>, registry: Arc<ControlRegistry>) -> Self {
        Self {
            submitter,
            registry,
        }
    }

    pub(crate) fn new_topology(&self, name: Option<&str>) -> Topology {
        self.submitter.new_topology(name)
    }

    pub(crate) async fn submit(
        &self,
        topology: Topology,
        config: JobConfig,
    ) -> Result<Job, SubmissionError> {
        let job = self.submitter.submit(topology, config).await?;
        self.register_job_control(&job);
        Ok(job)
    }

    fn register_job_control(&self, job: &Job) {
        let target = job.clone();
        let ops = OperationSet::new().with("cancel", move |_| {
            target.cancel();
            Ok(())
        });
        match self.registry.register_scoped(JOB_CONTROL, job.name(), ops) {
            Ok(registration) => {
                let job = job.clone();
                tokio::spawn(async move {
                    job.wait().await;
                    drop(registration);
                });
            }
            Err(err) => {
                warn!(
                    target: "hub.lifecycle",
                    job = %job.name(),
                    error = %err,
                    "job control not registered"
                );
            }
        }
    }
}

struct SystemApp {
    name: String,
    topology: Topology,
}

pub struct HubProvider {
    config: ProviderConfig,
    bus: Arc<LocalBus>,
    registry: Arc<ControlRegistry>,
    launcher: Arc<JobLauncher>,
    applications: Arc<ApplicationService>,
    system_apps: Mutex<Vec<SystemApp>>,
    state: Mutex<LifecycleState>,
    _app_service_control: ControlRegistration,
}

impl HubProvider {
    /// Builds a provider that registers controls in the process-wide registry.
    ///
    /// The provider owns the `appService/hub` control of that registry, so
    /// only one provider built this way can live in a process at a time; a
    /// second one fails with [`ProviderError::Control`]. Use
    /// [`HubProvider::with_registry`] to run several providers side by side.
    pub fn new<D: HubDevice>(
        device: D,
        submitter: Arc<dyn Submitter>,
        config: ProviderConfig,
    ) -> Result<Self, ProviderError> {
        Self::with_registry(device, submitter, config, ControlRegistry::global())
    }

    pub fn with_registry<D: HubDevice>(
        device: D,
        submitter: Arc<dyn Submitter>,
        config: ProviderConfig,
        registry: Arc<ControlRegistry>,
    ) -> Result<Self, ProviderError> {
        let bus = Arc::new(LocalBus::with_capacity(config.bus_capacity));
        let shared_bus: Arc<dyn Bus> = bus.clone();
        let bridge = DeviceGatewayBridge::new(device, shared_bus.clone())?;

        let launcher = Arc::new(JobLauncher::new(submitter, registry.clone()));
        let applications = Arc::new(ApplicationService::new(launcher.clone()));
        let app_service_control = registry.register_scoped(
            APP_SERVICE_CONTROL,
            APP_SERVICE_ID,
            applications.control_operations(),
        )?;

        let provider = Self {
            config,
            bus,
            registry,
            launcher,
            applications,
            system_apps: Mutex::new(Vec::new()),
            state: Mutex::new(LifecycleState::Constructed),
            _app_service_control: app_service_control,
        };
        provider.create_device_app(bridge)?;
        provider.create_control_app()?;
        Ok(provider)
    }

    fn create_device_app(&self, bridge: DeviceGatewayBridge) -> Result<(), ProviderError> {
        let mut topology = self.new_topology(Some(&self.system_app_name(DEVICE_APP_ROLE)));
        info!(
            target: "hub.lifecycle",
            connection = %bridge.connection_id(),
            "hub connection attached"
        );
        bridge.install(&mut topology);
        self.register_system_app(topology)
    }

    fn create_control_app(&self) -> Result<(), ProviderError> {
        let mut topology = self.new_topology(Some(&self.system_app_name(CONTROL_APP_ROLE)));
        ControlCommandRouter::new(&self.client(), self.registry.clone()).install(&mut topology);
        self.register_system_app(topology)
    }

    pub fn system_app_name(&self, role: &str) -> String {
        format!("{}{}", self.config.job_name_prefix, role)
    }

    /// Queues `topology` to be submitted by [`HubProvider::start`], after the
    /// applications registered before it. The topology name becomes the job name.
    pub fn register_system_app(&self, topology: Topology) -> Result<(), ProviderError> {
        let state = *self.state.lock();
        if state != LifecycleState::Constructed {
            return Err(ProviderError::InvalidState(state));
        }
        let name = topology.name().to_string();
        info!(target: "hub.lifecycle", app = %name, "system application registered");
        self.system_apps.lock().push(SystemApp { name, topology });
        Ok(())
    }

    /// Names of the system applications still waiting to be submitted.
    pub fn system_app_names(&self) -> Vec<String> {
        self.system_apps
            .lock()
            .iter()
            .map(|app| app.name.clone())
            .collect()
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock()
    }

    /// Submits the system applications in order, each one acknowledged before
    /// the next is submitted.
    pub async fn start(&self) -> Result<Vec<Job>, ProviderError> {
        {
            let mut state = self.state.lock();
            if *state != LifecycleState::Constructed {
                return Err(ProviderError::InvalidState(*state));
            }
            *state = LifecycleState::Starting;
        }

        let apps = std::mem::take(&mut *self.system_apps.lock());
        let mut jobs = Vec::with_capacity(apps.len());
        for SystemApp { name, topology } in apps {
            match self.launcher.submit(topology, JobConfig::named(&name)).await {
                Ok(job) => {
                    info!(
                        target: "hub.lifecycle",
                        app = %name,
                        job = %job.id(),
                        "system application started"
                    );
                    jobs.push(job);
                }
                Err(source) => {
                    *self.state.lock() = LifecycleState::StartFailed;
                    error!(
                        target: "hub.lifecycle",
                        app = %name,
                        error = %source,
                        "system application failed to start"
                    );
                    return Err(ProviderError::Submission { app: name, source });
                }
            }
        }

        *self.state.lock() = LifecycleState::Started;
        Ok(jobs)
    }

    pub fn new_topology(&self, name: Option<&str>) -> Topology {
        self.launcher.new_topology(name)
    }

    /// Submits a user topology. The job is controllable as `job/<name>`.
    pub async fn submit(
        &self,
        topology: Topology,
        config: JobConfig,
    ) -> Result<Job, SubmissionError> {
        self.launcher.submit(topology, config).await
    }

    pub fn bus(&self) -> Arc<dyn Bus> {
        self.bus.clone()
    }

    /// Device proxy for applications.
    pub fn client(&self) -> HubClient {
        HubClient::new(self.bus())
    }

    pub fn control_registry(&self) -> Arc<ControlRegistry> {
        self.registry.clone()
    }

    pub fn application_service(&self) -> Arc<ApplicationService> {
        self.applications.clone()
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }
}

impl Drop for HubProvider {
    fn drop(&mut self) {
        self.bus.close();
    }
}
