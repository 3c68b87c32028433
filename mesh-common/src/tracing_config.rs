use crate::SafeDisplay;
use serde::{Deserialize, Serialize};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

/// Logging configuration, following the teacher's `golem_common::tracing`
/// convention of a dedicated config struct with a `local_dev` constructor for
/// binaries' defaults.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TracingConfig {
    pub file_name: Option<String>,
    pub json: bool,
    pub env_filter: String,
}

impl TracingConfig {
    pub fn local_dev(service_name: &str) -> Self {
        Self {
            file_name: None,
            json: false,
            env_filter: format!("info,{service_name}=debug"),
        }
    }

    /// Installs a global subscriber. Call once, from the binary's `main`.
    pub fn init(&self) {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.env_filter.clone()));

        let registry = Registry::default().with(filter);

        if self.json {
            let _ = registry
                .with(tracing_subscriber::fmt::layer().json())
                .try_init();
        } else {
            let _ = registry.with(tracing_subscriber::fmt::layer()).try_init();
        }
    }
}

impl SafeDisplay for TracingConfig {
    fn to_safe_string(&self) -> String {
        format!(
            "file_name: {:?}\njson: {}\nenv_filter: {}",
            self.file_name, self.json, self.env_filter
        )
    }
}
