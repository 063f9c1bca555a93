use control_registry::{HandlerError, OperationSet};
use serde_json::Value;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

/// Handle for changing the log filter of a running process.
#[derive(Clone)]
pub struct LogLevel {
    handle: reload::Handle<EnvFilter, Registry>,
}

/// Installs the global subscriber. Logs go to stderr; stdout carries hub traffic.
pub fn init_tracing(filter: &str) -> LogLevel {
    let env_filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter_layer, handle) = reload::Layer::new(env_filter);
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_writer(std::io::stderr);
    Registry::default().with(filter_layer).with(fmt_layer).init();
    LogLevel { handle }
}

impl LogLevel {
    pub fn set(&self, filter: &str) -> Result<(), HandlerError> {
        let env_filter = EnvFilter::try_new(filter)
            .map_err(|err| HandlerError::new(format!("invalid filter `{filter}`: {err}")))?;
        self.handle
            .reload(env_filter)
            .map_err(|err| HandlerError::new(err.to_string()))
    }

    /// `setLevel` with `{"level": "DEBUG"}`; any filter directive is accepted.
    pub fn control_operations(self) -> OperationSet {
        OperationSet::new().with("setLevel", move |args: Value| {
            let level = args
                .get("level")
                .and_then(Value::as_str)
                .ok_or("missing `level`")?;
            self.set(&level.to_ascii_lowercase())
        })
    }
}
