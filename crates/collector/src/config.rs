//! Collector configuration: defaults, YAML file, `KMETA_*` environment overrides.

use std::path::Path;
use std::time::Duration;

use kmeta_buffer::{BufferConfig, DEFAULT_FLUSH_INTERVAL, DEFAULT_FLUSH_SIZE, DEFAULT_QUEUE_CAPACITY};
use kmeta_core::ResourceType;
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const DEFAULT_CONFIG_NAME: &str = "kmeta";
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading config {path}: {source}")]
    Io { path: String, source: std::io::Error },
    #[error("parsing config: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Name the callbacks are registered under.
    pub config_name: String,
    pub pod: bool,
    pub service: bool,
    /// Derive pod->service relationships; needs both `pod` and `service`.
    pub pod_service_link: bool,
    /// Keep-alive re-send interval handed to the watch side.
    #[serde(with = "secs")]
    pub interval: Duration,
    #[serde(with = "secs")]
    pub flush_interval: Duration,
    pub flush_size: usize,
    pub queue_capacity: usize,
    /// Restrict kube watchers to one namespace.
    pub namespace: Option<String>,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            config_name: DEFAULT_CONFIG_NAME.to_string(),
            pod: true,
            service: true,
            pod_service_link: true,
            interval: DEFAULT_INTERVAL,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            flush_size: DEFAULT_FLUSH_SIZE,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            namespace: None,
        }
    }
}

impl CollectorConfig {
    pub fn from_yaml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(s)?)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.display().to_string(), source })?;
        Self::from_yaml_str(&text)
    }

    /// Apply overrides from the process environment.
    pub fn with_env(self) -> Self {
        self.with_env_from(|k| std::env::var(k).ok())
    }

    /// Apply `KMETA_*` overrides from `get`. Unparseable values are ignored.
    pub fn with_env_from(mut self, get: impl Fn(&str) -> Option<String>) -> Self {
        let flag = |k: &str| get(k).and_then(|s| parse_bool(&s));
        let num = |k: &str| get(k).and_then(|s| s.trim().parse::<u64>().ok());
        if let Some(v) = get("KMETA_CONFIG_NAME").filter(|s| !s.is_empty()) {
            self.config_name = v;
        }
        if let Some(v) = flag("KMETA_POD") {
            self.pod = v;
        }
        if let Some(v) = flag("KMETA_SERVICE") {
            self.service = v;
        }
        if let Some(v) = flag("KMETA_POD_SERVICE_LINK") {
            self.pod_service_link = v;
        }
        if let Some(v) = num("KMETA_INTERVAL_SECS") {
            self.interval = Duration::from_secs(v);
        }
        if let Some(v) = num("KMETA_FLUSH_INTERVAL_SECS") {
            self.flush_interval = Duration::from_secs(v);
        }
        if let Some(v) = num("KMETA_FLUSH_SIZE") {
            self.flush_size = v as usize;
        }
        if let Some(v) = num("KMETA_QUEUE_CAP") {
            self.queue_capacity = v as usize;
        }
        if let Some(v) = get("KMETA_NAMESPACE") {
            self.namespace = if v.is_empty() { None } else { Some(v) };
        }
        self
    }

    /// Reject unusable settings. A link without both entity kinds is
    /// switched off with a warning rather than rejected.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.flush_size == 0 {
            return Err(ConfigError::Invalid("flush_size must be > 0".into()));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid("queue_capacity must be > 0".into()));
        }
        if self.flush_interval.is_zero() {
            return Err(ConfigError::Invalid("flush_interval must be > 0".into()));
        }
        if self.config_name.is_empty() {
            return Err(ConfigError::Invalid("config_name must not be empty".into()));
        }
        if self.pod_service_link && !(self.pod && self.service) {
            warn!(pod = self.pod, service = self.service, "pod_service_link needs pod and service; disabled");
            self.pod_service_link = false;
        }
        Ok(())
    }

    /// Enabled kinds in registration order.
    pub fn enabled_kinds(&self) -> Vec<ResourceType> {
        ResourceType::ALL
            .into_iter()
            .filter(|k| match k {
                ResourceType::Pod => self.pod,
                ResourceType::Service => self.service,
                ResourceType::PodService => self.pod && self.service && self.pod_service_link,
            })
            .collect()
    }

    pub fn buffer_config(&self) -> BufferConfig {
        BufferConfig {
            queue_capacity: self.queue_capacity,
            flush_size: self.flush_size,
            flush_interval: self.flush_interval,
        }
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Durations as (fractional) seconds.
mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let v = f64::deserialize(d)?;
        Duration::try_from_secs_f64(v)
            .map_err(|e| serde::de::Error::custom(format!("duration must be a non-negative number of seconds: {}", e)))
    }
}
