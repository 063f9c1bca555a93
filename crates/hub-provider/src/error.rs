use control_registry::ControlError;
use hub_bus::BusError;
use thiserror::Error;

use crate::provider::LifecycleState;

/// Failure talking to the physical hub connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection closed")]
    Closed,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// The execution engine could not create a job.
#[derive(Debug, Error)]
pub enum SubmissionError {
    #[error("job `{0}` is already running")]
    DuplicateJob(String),
    #[error("topology `{0}` has no tasks")]
    EmptyTopology(String),
    #[error("invalid job config: {0}")]
    InvalidConfig(String),
    #[error("engine rejected job: {0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("connection `{0}` is already owned by a live bridge")]
    ConnectionInUse(String),
    #[error(transparent)]
    Bus(#[from] BusError),
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error(transparent)]
    Bridge(#[from] BridgeError),
    #[error("failed to submit application `{app}`: {source}")]
    Submission {
        app: String,
        #[source]
        source: SubmissionError,
    },
    #[error("system applications are {0}")]
    InvalidState(LifecycleState),
    #[error("no application named `{0}`")]
    UnknownApplication(String),
    #[error("application `{0}` is already registered")]
    DuplicateApplication(String),
    #[error("failed to build application `{app}`: {source}")]
    Build {
        app: String,
        #[source]
        source: anyhow::Error,
    },
    #[error(transparent)]
    Control(#[from] ControlError),
}
