//! Configuration management for the historical datastore.
//!
//! Values are layered: built-in defaults, then an optional config file
//! (`$HDS_CONFIG`, default `config/historical-datastore`), then environment
//! variables such as `HDS__HTTP__BIND_PORT=8085`.

use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::Deserialize;
use std::collections::HashMap;
use thiserror::Error;
use url::Url;

/// Environment variable naming the config file
pub const CONFIG_PATH_ENV: &str = "HDS_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config/historical-datastore";

/// Errors found when validating a loaded configuration
#[derive(Error, Debug, PartialEq)]
pub enum ConfigValidationError {
    #[error("Missing required configuration: {0}")]
    MissingField(String),

    #[error("Invalid configuration value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

/// Main configuration for the datastore service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Instance identifier; generated when empty
    #[serde(default)]
    pub service_id: String,
    /// Version advertised in response content types
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub grpc: GrpcConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub pki: PkiConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// HTTP API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_http_port")]
    pub bind_port: u16,
    /// Externally reachable base URL, used for links in responses
    #[serde(default = "default_public_endpoint")]
    pub public_endpoint: String,
}

/// gRPC API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct GrpcConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_grpc_port")]
    pub bind_port: u16,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegistryConfig {
    #[serde(default)]
    pub backend: RegistryBackendConfig,
}

/// Registry storage backend
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryBackendConfig {
    /// `memory`, `redb` or its alias `leveldb`
    #[serde(rename = "type", default = "default_registry_backend")]
    pub backend_type: String,
    /// Directory of the embedded database
    #[serde(default)]
    pub dsn: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DataConfig {
    #[serde(default)]
    pub backend: DataBackendConfig,
    /// Register unknown streams on first submission
    #[serde(default = "default_true")]
    pub auto_registration: bool,
}

/// Data storage backend
#[derive(Debug, Clone, Deserialize)]
pub struct DataBackendConfig {
    /// `sqlite` or `senmlstore`
    #[serde(rename = "type", default = "default_data_backend")]
    pub backend_type: String,
    /// SQLite DSN (`:memory:` or a file path) or a senmlstore directory
    #[serde(default = "default_data_dsn")]
    pub dsn: String,
}

/// Request validation on the HTTP boundary
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Validator implementation; `token` is built in
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub provider_url: String,
    #[serde(default)]
    pub client_id: String,
    /// Accept HTTP basic credentials as tokens (`user:password`)
    #[serde(default)]
    pub basic_enabled: bool,
    /// Per-token rules: path prefixes a token may access; absent means all
    #[serde(default)]
    pub authz: HashMap<String, Vec<String>>,
    /// Accepted bearer tokens
    #[serde(default)]
    pub tokens: Vec<String>,
}

/// Certificates of the gRPC server
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PkiConfig {
    #[serde(default)]
    pub ca_cert: String,
    #[serde(default)]
    pub server_cert: String,
    #[serde(default)]
    pub server_key: String,
}

impl PkiConfig {
    pub fn is_empty(&self) -> bool {
        self.ca_cert.is_empty() && self.server_cert.is_empty() && self.server_key.is_empty()
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// `json` or `pretty`
    #[serde(default = "default_log_format")]
    pub format: String,
}

/// Prometheus exporter configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_api_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    8085
}

fn default_grpc_port() -> u16 {
    8088
}

fn default_public_endpoint() -> String {
    "http://localhost:8085".to_string()
}

fn default_registry_backend() -> String {
    "memory".to_string()
}

fn default_data_backend() -> String {
    "sqlite".to_string()
}

fn default_data_dsn() -> String {
    ":memory:".to_string()
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            bind_port: default_http_port(),
            public_endpoint: default_public_endpoint(),
        }
    }
}

impl Default for GrpcConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: default_bind_addr(),
            bind_port: default_grpc_port(),
        }
    }
}

impl Default for RegistryBackendConfig {
    fn default() -> Self {
        Self {
            backend_type: default_registry_backend(),
            dsn: String::new(),
        }
    }
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            backend: DataBackendConfig::default(),
            auto_registration: true,
        }
    }
}

impl Default for DataBackendConfig {
    fn default() -> Self {
        Self {
            backend_type: default_data_backend(),
            dsn: default_data_dsn(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_id: String::new(),
            api_version: default_api_version(),
            http: HttpConfig::default(),
            grpc: GrpcConfig::default(),
            registry: RegistryConfig::default(),
            data: DataConfig::default(),
            auth: AuthConfig::default(),
            pki: PkiConfig::default(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from the config file and environment variables.
    ///
    /// Later sources override earlier ones:
    /// 1. Built-in defaults
    /// 2. The file named by `HDS_CONFIG` (default `config/historical-datastore`)
    /// 3. Environment variables (e.g. `HDS__DATA__BACKEND__TYPE=senmlstore`)
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
        Self::load_from(&path)
    }

    pub fn load_from(path: &str) -> Result<Self, ConfigError> {
        let config = ConfigBuilder::builder()
            .set_default("http.bind_addr", default_bind_addr())?
            .set_default("http.bind_port", i64::from(default_http_port()))?
            .set_default("grpc.bind_port", i64::from(default_grpc_port()))?
            .set_default("logging.level", default_log_level())?
            .add_source(File::with_name(path).required(false))
            .add_source(
                Environment::with_prefix("HDS")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut config: Config = config.try_deserialize()?;
        if config.service_id.is_empty() {
            config.service_id = uuid::Uuid::new_v4().to_string();
        }
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.http.bind_addr.is_empty() {
            return Err(ConfigValidationError::MissingField("http.bind_addr".into()));
        }
        if self.http.bind_port == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "http.bind_port".into(),
                message: "Port must be greater than 0".into(),
            });
        }
        if self.http.public_endpoint.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "http.public_endpoint".into(),
            ));
        }
        if let Err(e) = Url::parse(&self.http.public_endpoint) {
            return Err(ConfigValidationError::InvalidValue {
                field: "http.public_endpoint".into(),
                message: e.to_string(),
            });
        }

        match self.registry.backend.backend_type.as_str() {
            "memory" => {}
            "redb" | "leveldb" => {
                if self.registry.backend.dsn.is_empty() {
                    return Err(ConfigValidationError::MissingField(
                        "registry.backend.dsn".into(),
                    ));
                }
            }
            other => {
                return Err(ConfigValidationError::InvalidValue {
                    field: "registry.backend.type".into(),
                    message: format!("unknown backend '{other}'"),
                })
            }
        }

        match self.data.backend.backend_type.as_str() {
            "sqlite" | "senmlstore" => {
                if self.data.backend.dsn.is_empty() {
                    return Err(ConfigValidationError::MissingField("data.backend.dsn".into()));
                }
            }
            other => {
                return Err(ConfigValidationError::InvalidValue {
                    field: "data.backend.type".into(),
                    message: format!("unknown backend '{other}'"),
                })
            }
        }
        if self.data.backend.backend_type == "senmlstore" && self.data.backend.dsn == ":memory:" {
            return Err(ConfigValidationError::InvalidValue {
                field: "data.backend.dsn".into(),
                message: "senmlstore needs a directory".into(),
            });
        }

        if self.grpc.enabled {
            if self.grpc.bind_port == 0 {
                return Err(ConfigValidationError::InvalidValue {
                    field: "grpc.bind_port".into(),
                    message: "Port must be greater than 0".into(),
                });
            }
            let pki = &self.pki;
            if !pki.is_empty() && (pki.server_cert.is_empty() || pki.server_key.is_empty()) {
                return Err(ConfigValidationError::InvalidValue {
                    field: "pki".into(),
                    message: "server_cert and server_key must be set together".into(),
                });
            }
        }

        if self.auth.enabled {
            match self.auth.provider.as_str() {
                "" => return Err(ConfigValidationError::MissingField("auth.provider".into())),
                "token" => {}
                other => {
                    return Err(ConfigValidationError::InvalidValue {
                        field: "auth.provider".into(),
                        message: format!("unsupported provider '{other}'"),
                    })
                }
            }
        }

        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            return Err(ConfigValidationError::InvalidValue {
                field: "logging.format".into(),
                message: "must be json or pretty".into(),
            });
        }
        Ok(())
    }
}
