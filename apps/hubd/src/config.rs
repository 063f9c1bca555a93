use hub_provider::ProviderConfig;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub log_filter: String,
    pub connection_id: String,
    pub provider: ProviderConfig,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = ProviderConfig::default();
        let log_filter = lookup("HUBD_LOG")
            .or_else(|| lookup("RUST_LOG"))
            .unwrap_or_else(|| "info".into());
        let connection_id = lookup("HUBD_CONNECTION_ID").unwrap_or_else(|| "stdio".into());
        let bus_capacity = lookup("HUBD_BUS_CAPACITY")
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.bus_capacity);
        let job_name_prefix = lookup("HUBD_JOB_PREFIX").unwrap_or(defaults.job_name_prefix);
        Self {
            log_filter,
            connection_id,
            provider: ProviderConfig {
                bus_capacity,
                job_name_prefix,
            },
        }
    }
}
