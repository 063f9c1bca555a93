use thiserror::Error;

/// Failure reported by a registered operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(format!("invalid arguments: {err}"))
    }
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("no control registered for {kind}/{id}")]
    NotFound { kind: String, id: String },
    #[error("control {kind}/{id} has no operation `{op}`")]
    UnknownOperation { kind: String, id: String, op: String },
    #[error("control {kind}/{id} is already registered")]
    AlreadyRegistered { kind: String, id: String },
    #[error("malformed control request: {0}")]
    Malformed(String),
    #[error("operation `{op}` on {kind}/{id} failed: {source}")]
    Handler {
        kind: String,
        id: String,
        op: String,
        #[source]
        source: HandlerError,
    },
}

impl ControlError {
    /// True when the request named a target or operation that does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ControlError::NotFound { .. } | ControlError::UnknownOperation { .. }
        )
    }
}
