use serde::Deserialize;

/// Provider construction settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct ProviderConfig {
    /// How many messages a single subscriber may fall behind before it
    /// starts losing the oldest ones.
    pub bus_capacity: usize,
    /// Prefix of the system job names, e.g. `Hub` gives `HubDevice`.
    pub job_name_prefix: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            bus_capacity: hub_bus::DEFAULT_CAPACITY,
            job_name_prefix: "Hub".into(),
        }
    }
}
