//! Application settings and configuration management

use crate::error::{AppError, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Settings {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub admission: AdmissionConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

/// Routing defaults
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct RoutingConfig {
    /// Backend used when a request names no backend or model alias
    #[serde(default)]
    pub default_backend: Option<String>,
}

/// Gateway-wide admission bounds
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AdmissionConfig {
    /// Maximum in-flight upstream requests across all backends
    #[serde(default = "default_global_max_in_flight")]
    pub global_max_in_flight: usize,
}

fn default_global_max_in_flight() -> usize {
    256
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            global_max_in_flight: default_global_max_in_flight(),
        }
    }
}

/// Streaming relay behavior
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RelayConfig {
    /// Events buffered between the backend stream and the client connection
    #[serde(default = "default_read_ahead")]
    pub read_ahead: usize,
    /// Deadline for the first token after admission
    #[serde(default = "default_first_token_timeout")]
    pub first_token_timeout_ms: u64,
    /// Deadline for the whole stream
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
    /// Replace backend-reported error text with a generic message
    #[serde(default = "default_true")]
    pub sanitize_errors: bool,
}

fn default_read_ahead() -> usize {
    8
}

fn default_first_token_timeout() -> u64 {
    30_000
}

fn default_request_timeout() -> u64 {
    300_000
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            read_ahead: default_read_ahead(),
            first_token_timeout_ms: default_first_token_timeout(),
            request_timeout_ms: default_request_timeout(),
            sanitize_errors: true,
        }
    }
}

impl RelayConfig {
    pub fn first_token_timeout(&self) -> Duration {
        Duration::from_millis(self.first_token_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Health tracking policy
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthConfig {
    /// Consecutive failures that move a backend to Degraded
    #[serde(default = "default_degraded_after")]
    pub degraded_after: u32,
    /// Consecutive failures that move a backend to Unavailable
    #[serde(default = "default_unavailable_after")]
    pub unavailable_after: u32,
    /// Failures older than this no longer count as consecutive
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,
    /// Probe interval for backends already marked Unavailable
    #[serde(default = "default_unavailable_probe_interval")]
    pub unavailable_probe_interval_secs: u64,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
}

fn default_degraded_after() -> u32 {
    3
}

fn default_unavailable_after() -> u32 {
    5
}

fn default_window_secs() -> u64 {
    60
}

fn default_probe_interval() -> u64 {
    10
}

fn default_unavailable_probe_interval() -> u64 {
    30
}

fn default_probe_timeout() -> u64 {
    5
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            degraded_after: default_degraded_after(),
            unavailable_after: default_unavailable_after(),
            window_secs: default_window_secs(),
            probe_interval_secs: default_probe_interval(),
            unavailable_probe_interval_secs: default_unavailable_probe_interval(),
            probe_timeout_secs: default_probe_timeout(),
        }
    }
}

/// Wire dialect spoken by a backend
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ProtocolType {
    /// vLLM OpenAI-compatible server
    #[default]
    Vllm,
    /// TensorRT-LLM OpenAI-compatible frontend
    #[serde(alias = "trtllm")]
    TensorrtLlm,
    /// Any other OpenAI-compatible server
    #[serde(rename = "openai")]
    OpenAi,
}

impl std::fmt::Display for ProtocolType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolType::Vllm => write!(f, "vllm"),
            ProtocolType::TensorrtLlm => write!(f, "tensorrt-llm"),
            ProtocolType::OpenAi => write!(f, "openai"),
        }
    }
}

/// Authentication towards a backend
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct BackendAuth {
    #[serde(default)]
    pub token_env: Option<String>,
    #[serde(default)]
    pub header_name: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
}

/// Backend configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendConfig {
    pub name: String,

    #[serde(default)]
    pub protocol: ProtocolType,

    /// Base address, e.g. `http://vllm:8000`
    pub endpoint: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub auth: BackendAuth,

    #[serde(default = "default_health_check_path")]
    pub health_check_path: String,

    /// Connect timeout towards the backend
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,

    /// Additional aliases clients may use in the `model` field
    #[serde(default)]
    pub models: Vec<String>,

    /// Model id sent upstream when the requested one is not served
    #[serde(default)]
    pub served_model: Option<String>,

    #[serde(default = "default_true")]
    pub supports_streaming: bool,

    #[serde(default)]
    pub max_context: Option<u32>,

    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,

    #[serde(default = "default_queue_timeout")]
    pub queue_timeout_ms: u64,
}

fn default_health_check_path() -> String {
    "/health".to_string()
}

fn default_timeout() -> u64 {
    5_000
}

fn default_max_concurrency() -> usize {
    4
}

fn default_queue_depth() -> usize {
    16
}

fn default_queue_timeout() -> u64 {
    2_000
}

/// YAML backends configuration file structure
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct BackendsConfig {
    #[serde(default)]
    pub version: String,

    #[serde(default)]
    pub routing: RoutingConfig,

    #[serde(default)]
    pub backends: Vec<BackendConfig>,
}

/// Locations the settings were loaded from, kept for hot reload
#[derive(Debug, Clone)]
pub struct ConfigPaths {
    pub gateway: PathBuf,
    pub backends: Option<PathBuf>,
}

impl Default for ConfigPaths {
    fn default() -> Self {
        Self {
            gateway: PathBuf::from("config/gateway.yaml"),
            backends: Some(PathBuf::from("config/backends.yaml")),
        }
    }
}

impl ConfigPaths {
    /// Paths from `LLM_GATEWAY_CONFIG` / `LLM_GATEWAY_BACKENDS`, falling back to `config/`
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            gateway: std::env::var("LLM_GATEWAY_CONFIG")
                .map(PathBuf::from)
                .unwrap_or(defaults.gateway),
            backends: std::env::var("LLM_GATEWAY_BACKENDS")
                .map(PathBuf::from)
                .ok()
                .or(defaults.backends),
        }
    }
}

impl Settings {
    /// Load settings from configuration files and environment variables
    pub fn load(paths: &ConfigPaths) -> Result<Self> {
        Self::load_from_paths(&paths.gateway, paths.backends.as_deref())
    }

    /// Load settings from YAML/TOML configuration files
    pub fn load_from_paths(gateway_config: &Path, backends_config: Option<&Path>) -> Result<Self> {
        let format = if gateway_config
            .extension()
            .map_or(false, |ext| ext == "yaml" || ext == "yml")
        {
            FileFormat::Yaml
        } else {
            FileFormat::Toml
        };

        let mut config_builder = Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8080)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "json")?;

        if gateway_config.exists() {
            config_builder = config_builder.add_source(File::from(gateway_config).format(format));
        }

        config_builder = config_builder.add_source(
            Environment::with_prefix("LLM_GATEWAY")
                .separator("__")
                .try_parsing(true),
        );

        let config = config_builder.build()?;
        let mut settings: Settings = config.try_deserialize()?;

        // The backends file wins over inline backends when present
        if let Some(backends_path) = backends_config {
            if backends_path.exists() {
                let backends_config = Self::load_backends_config(backends_path)?;
                settings.backends = backends_config.backends;
                if backends_config.routing.default_backend.is_some() {
                    settings.routing = backends_config.routing;
                }
            }
        }

        settings.validate()?;
        Ok(settings)
    }

    /// Load backends configuration from YAML file
    pub fn load_backends_config<P: AsRef<Path>>(path: P) -> Result<BackendsConfig> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            AppError::Config(config::ConfigError::Message(format!(
                "Failed to read backends config: {}",
                e
            )))
        })?;

        serde_yaml::from_str(&content).map_err(|e| {
            AppError::Config(config::ConfigError::Message(format!(
                "Failed to parse backends config: {}",
                e
            )))
        })
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: String| Err(AppError::Config(config::ConfigError::Message(message)));

        if self.server.port == 0 {
            return invalid("Server port cannot be 0".to_string());
        }
        if self.relay.read_ahead == 0 {
            return invalid("relay.read_ahead must be at least 1".to_string());
        }
        if self.health.degraded_after == 0 {
            return invalid("health.degraded_after must be at least 1".to_string());
        }
        if self.health.unavailable_after < self.health.degraded_after {
            return invalid(format!(
                "health.unavailable_after ({}) must not be lower than health.degraded_after ({})",
                self.health.unavailable_after, self.health.degraded_after
            ));
        }

        let mut names = HashSet::new();
        for backend in &self.backends {
            if backend.name.is_empty() {
                return invalid("Backend name cannot be empty".to_string());
            }
            if !names.insert(backend.name.as_str()) {
                return invalid(format!("Backend '{}' is defined twice", backend.name));
            }
            if backend.endpoint.is_empty() {
                return invalid(format!("Backend '{}' must have an endpoint", backend.name));
            }
            if backend.max_concurrency == 0 {
                return invalid(format!(
                    "Backend '{}' must allow at least one concurrent request",
                    backend.name
                ));
            }
        }

        if let Some(default) = &self.routing.default_backend {
            if !self.get_enabled_backends().iter().any(|b| &b.name == default) {
                return invalid(format!(
                    "Default backend '{}' is not an enabled backend",
                    default
                ));
            }
        }

        Ok(())
    }

    /// Get enabled backends
    pub fn get_enabled_backends(&self) -> Vec<&BackendConfig> {
        self.backends.iter().filter(|b| b.enabled).collect()
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: default_host(),
                port: default_port(),
            },
            logging: LoggingConfig {
                level: default_log_level(),
                format: default_log_format(),
            },
            routing: RoutingConfig::default(),
            admission: AdmissionConfig::default(),
            relay: RelayConfig::default(),
            health: HealthConfig::default(),
            backends: vec![],
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            protocol: ProtocolType::default(),
            endpoint: String::new(),
            enabled: true,
            auth: BackendAuth::default(),
            health_check_path: default_health_check_path(),
            timeout_ms: default_timeout(),
            models: vec![],
            served_model: None,
            supports_streaming: true,
            max_context: None,
            max_concurrency: default_max_concurrency(),
            queue_depth: default_queue_depth(),
            queue_timeout_ms: default_queue_timeout(),
        }
    }
}
