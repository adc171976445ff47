//! Site configuration, loaded once at service start from YAML, plus the
//! environment-driven settings shared by the service binaries. Providers and
//! their adapter bindings are immutable after startup; changing them means
//! restarting the executor.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    /// The provider table references an adapter implementation that is not
    /// registered at this site.
    UnknownAdapter { provider: String, api_class: String, adapter: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(msg) => write!(f, "cannot read config: {msg}"),
            ConfigError::Parse(msg) => write!(f, "cannot parse config: {msg}"),
            ConfigError::UnknownAdapter {
                provider,
                api_class,
                adapter,
            } => write!(
                f,
                "provider {provider}: api_class {api_class} is bound to unknown adapter {adapter}"
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Binding of one api_class to an adapter implementation within a provider.
/// Extra fields are the adapter's static configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AdapterBinding {
    pub adapter: String,
    #[serde(flatten, default)]
    pub config: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    #[serde(default)]
    pub description: Option<String>,
    /// Directory adapters of this provider materialize large outputs into.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    #[serde(default)]
    pub interface: BTreeMap<String, AdapterBinding>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    /// Eviction budget for sealed cache entries, in bytes.
    #[serde(default = "default_byte_budget")]
    pub byte_budget: u64,
    /// Values serialized above this size go to the blob store by reference.
    #[serde(default = "default_inline_limit")]
    pub inline_limit: usize,
    #[serde(default)]
    pub blob_root: Option<PathBuf>,
}

fn default_byte_budget() -> u64 {
    256 * 1024 * 1024
}

fn default_inline_limit() -> usize {
    64 * 1024
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            byte_budget: default_byte_budget(),
            inline_limit: default_inline_limit(),
            blob_root: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SiteConfig {
    pub site: String,
    #[serde(default)]
    pub contact: Option<String>,
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_interval_ms: u64,
    /// Soft per-node timeout; adapters may lower it via their binding.
    #[serde(default = "default_node_timeout_ms")]
    pub node_timeout_ms: u64,
    /// Hard per-request timeout; the whole request is cancelled past it.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Retry budget for transient broker failures.
    #[serde(default = "default_broker_retries")]
    pub broker_retries: u32,
    /// Retry budget for adapters failing with upstream-unavailable.
    #[serde(default = "default_upstream_retries")]
    pub upstream_retries: u32,
    #[serde(default = "default_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default)]
    pub cache: CacheConfig,
    pub providers: BTreeMap<String, ProviderConfig>,
}

fn default_heartbeat_ms() -> u64 {
    5_000
}

fn default_node_timeout_ms() -> u64 {
    10 * 60 * 1_000
}

fn default_request_timeout_ms() -> u64 {
    60 * 60 * 1_000
}

fn default_broker_retries() -> u32 {
    3
}

fn default_upstream_retries() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    250
}

impl SiteConfig {
    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        Self::from_yaml(&raw)
    }

    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    #[must_use]
    pub fn node_timeout(&self) -> Duration {
        Duration::from_millis(self.node_timeout_ms)
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    #[must_use]
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// A site offering the builtin `dfm` provider with every registered
    /// api_class bound to its stock adapter. The shape tests and local
    /// development start from.
    #[must_use]
    pub fn builtin(site: impl Into<String>) -> Self {
        let yaml = r#"
site: placeholder
providers:
  dfm:
    description: Builtin provider
    interface:
      dfm.api.dfm.Constant: {adapter: constant}
      dfm.api.dfm.GreetMe: {adapter: greetme}
      dfm.api.dfm.SignalClient: {adapter: signal_client}
      dfm.api.dfm.SendMessage: {adapter: send_message}
      dfm.api.dfm.AwaitMessage: {adapter: await_message}
      dfm.api.dfm.Zip2: {adapter: zip2}
      dfm.api.testing.Sleepy: {adapter: sleepy}
      dfm.api.testing.EmitSeries: {adapter: emit_series}
      dfm.api.testing.Square: {adapter: square}
      dfm.api.data_loader.LoadModelData: {adapter: load_model_data}
"#;
        let mut config = Self::from_yaml(yaml).expect("builtin site config parses");
        config.site = site.into();
        config
    }
}

/// Log output shape, selected via `LOG_FORMAT`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "plain" | "pretty" => Ok(LogFormat::Plain),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format {other:?}")),
        }
    }
}

/// Environment-driven settings shared by the service binaries.
#[derive(Debug, Clone)]
pub struct EnvSettings {
    pub broker_url: String,
    pub auth_api_key: Option<String>,
    pub log_format: LogFormat,
    /// Recorded for deployments that wire an exporter; unused otherwise.
    pub otel_endpoint: Option<String>,
}

impl EnvSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        let broker_url =
            std::env::var("BROKER_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379/0".to_string());
        let auth_api_key = std::env::var("AUTH_API_KEY").ok().filter(|k| !k.is_empty());
        let log_format = match std::env::var("LOG_FORMAT") {
            Ok(raw) => raw.parse().map_err(ConfigError::Parse)?,
            Err(_) => LogFormat::default(),
        };
        let otel_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok();
        Ok(EnvSettings {
            broker_url,
            auth_api_key,
            log_format,
            otel_endpoint,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_provider_table() {
        let yaml = r#"
site: test-site
heartbeat_interval_ms: 1000
providers:
  dfm:
    description: Builtin
    interface:
      dfm.api.dfm.Constant: {adapter: constant}
  weather:
    cache_dir: /tmp/weather
    interface:
      dfm.api.data_loader.LoadModelData:
        adapter: load_model_data
        region: eu
"#;
        let config = SiteConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.site, "test-site");
        assert_eq!(config.heartbeat_interval(), Duration::from_millis(1000));
        assert_eq!(config.providers.len(), 2);
        let binding = &config.providers["weather"].interface["dfm.api.data_loader.LoadModelData"];
        assert_eq!(binding.adapter, "load_model_data");
        assert_eq!(binding.config["region"], "eu");
    }

    #[test]
    fn rejects_unknown_keys() {
        let yaml = r#"
site: test-site
providers: {}
surprise: true
"#;
        assert!(SiteConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn builtin_covers_the_registry() {
        let config = SiteConfig::builtin("local");
        let dfm = &config.providers["dfm"];
        for spec in crate::api::registry() {
            assert!(
                dfm.interface.contains_key(spec.api_class),
                "builtin provider is missing {}",
                spec.api_class
            );
        }
    }
}
