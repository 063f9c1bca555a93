//! Hub provider: many topologies sharing one connection to a message hub.
//!
//! - [`bridge`] owns the hub connection and connects it to the bus
//! - [`router`] forwards `controlService` commands to the control registry
//! - [`provider`] registers the system applications and starts them in order
//! - [`app_service`] submits named applications, locally or by control request
//!
//! Applications never see the connection; they use a [`HubClient`] backed by
//! the provider's bus.

pub mod app_service;
pub mod bridge;
pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod provider;
pub mod router;

pub use app_service::{ApplicationService, APP_SERVICE_CONTROL, APP_SERVICE_ID};
pub use config::ProviderConfig;
pub use device::{HubClient, HubDevice};
pub use engine::{DirectSubmitter, Job, JobConfig, JobState, JobTracker, Submitter, Topology};
pub use error::{BridgeError, ConnectionError, ProviderError, SubmissionError};
pub use provider::{HubProvider, LifecycleState, JOB_CONTROL};
pub use router::route_command;
