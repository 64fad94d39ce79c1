//! Configuration structures for logship.
//!
//! Configuration is loaded from TOML files and can be overridden via CLI flags.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::model::ConfigId;
use crate::transform::ExprEnv;

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Durable message store configuration
    pub store: StoreConfig,

    /// Broker (Kafka) configuration
    pub broker: BrokerConfig,

    /// Ordered list of syslog source configurations
    #[serde(default)]
    pub sources: Vec<SyslogSourceConfig>,

    /// Metrics exporter configuration
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Logging configuration
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

/// Durable store configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    /// Directory holding the embedded database
    pub directory: PathBuf,

    /// Capacity of the bounded ingest channel
    #[serde(default = "default_ingest_channel_capacity")]
    pub ingest_channel_capacity: usize,

    /// Maximum number of messages in SENT awaiting broker confirmation
    #[serde(default = "default_max_sent_inflight")]
    pub max_sent_inflight: usize,
}

/// Broker producer configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BrokerConfig {
    /// Broker bootstrap servers
    pub bootstrap_servers: Vec<String>,

    /// Client identifier presented to the broker
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Per-message delivery timeout in milliseconds
    #[serde(default = "default_message_timeout_ms")]
    pub message_timeout_ms: u64,

    /// Producer queue flush timeout on close, in milliseconds
    #[serde(default = "default_flush_timeout_ms")]
    pub flush_timeout_ms: u64,

    /// Security configuration
    #[serde(default)]
    pub security: BrokerSecurityConfig,
}

/// Broker security configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BrokerSecurityConfig {
    /// Security protocol (PLAINTEXT, SSL, SASL_SSL, SASL_PLAINTEXT)
    pub protocol: Option<String>,

    /// SASL mechanism (PLAIN, SCRAM-SHA-256, SCRAM-SHA-512)
    pub sasl_mechanism: Option<String>,

    /// SASL username
    pub sasl_username: Option<String>,

    /// SASL password
    pub sasl_password: Option<String>,

    /// SSL CA certificate location
    pub ssl_ca_location: Option<PathBuf>,

    /// SSL client certificate location
    pub ssl_cert_location: Option<PathBuf>,

    /// SSL client key location
    pub ssl_key_location: Option<PathBuf>,
}

/// Wire format of a syslog source.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SyslogFormat {
    /// Detect RFC5424 vs RFC3164 per message
    #[default]
    Auto,
    /// RFC5424 structured syslog
    Rfc5424,
    /// Legacy BSD syslog
    Rfc3164,
    /// One JSON document per frame
    Json,
}

/// Transport protocol of a syslog source.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SourceProtocol {
    /// Stream socket, newline framed
    #[default]
    Tcp,
    /// Datagram socket, one message per datagram
    Udp,
    /// Unix domain socket
    Unix,
}

/// Configuration of a single syslog source.
///
/// Identified everywhere by its content-hash [`ConfigId`], so reloads and
/// restarts never orphan messages that are still in flight.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct SyslogSourceConfig {
    /// Transport protocol
    #[serde(default)]
    pub protocol: SourceProtocol,

    /// Bind address for the listeners
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Ports to listen on
    #[serde(default)]
    pub ports: Vec<u16>,

    /// Unix socket path, for `protocol = "unix"`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unix_socket_path: Option<String>,

    /// Wire format
    #[serde(default)]
    pub format: SyslogFormat,

    /// Filter predicate; messages failing it are dropped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_expr: Option<String>,

    /// Topic expression
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic_expr: Option<String>,

    /// Topic template with `{field}` substitution; ignored when
    /// `topic_expr` is set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic_template: Option<String>,

    /// Partition key expression
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_expr: Option<String>,

    /// Partition key template; ignored when `partition_expr` is set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_template: Option<String>,

    /// Skip RFC5424 structured data parsing
    #[serde(default)]
    pub dont_parse_structured_data: bool,

    /// Per-connection read timeout in seconds, reset after each frame
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
}

impl Default for SyslogSourceConfig {
    fn default() -> Self {
        Self {
            protocol: SourceProtocol::Tcp,
            bind_addr: default_bind_addr(),
            ports: Vec::new(),
            unix_socket_path: None,
            format: SyslogFormat::Auto,
            filter_expr: None,
            topic_expr: None,
            topic_template: None,
            partition_expr: None,
            partition_template: None,
            dont_parse_structured_data: false,
            read_timeout_secs: default_read_timeout_secs(),
        }
    }
}

impl SyslogSourceConfig {
    /// Content-hash identifier of this configuration.
    ///
    /// Identical configurations hash identically across restarts, which is
    /// what re-associates recovered messages with their source config.
    pub fn config_id(&self) -> ConfigId {
        let canonical =
            serde_json::to_vec(self).expect("source config serialisation is infallible");
        ConfigId::from_content(&canonical)
    }

    /// Read timeout as a [`Duration`], `None` when disabled.
    pub fn read_timeout(&self) -> Option<Duration> {
        if self.read_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.read_timeout_secs))
        }
    }
}

/// Metrics exporter configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    /// HTTP listen address for `/metrics` and health endpoints
    #[serde(default = "default_metrics_address")]
    pub address: String,

    /// Metric name prefix
    #[serde(default = "default_metrics_prefix")]
    pub prefix: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            address: default_metrics_address(),
            prefix: default_metrics_prefix(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitoringConfig {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Log format
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::default(),
            log_format: LogFormat::default(),
        }
    }
}

/// Log level.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace level
    Trace,
    /// Debug level
    Debug,
    /// Info level (default)
    #[default]
    Info,
    /// Warn level
    Warn,
    /// Error level
    Error,
}

impl LogLevel {
    /// Directive string for the tracing filter.
    pub fn as_directive(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Log format.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON format (default)
    #[default]
    Json,
    /// Plain text format
    Text,
}

// Default value functions
fn default_ingest_channel_capacity() -> usize {
    4096
}
fn default_max_sent_inflight() -> usize {
    1024
}
fn default_client_id() -> String {
    "logship".to_string()
}
fn default_message_timeout_ms() -> u64 {
    30000
}
fn default_flush_timeout_ms() -> u64 {
    10000
}
fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}
fn default_read_timeout_secs() -> u64 {
    120
}
fn default_metrics_address() -> String {
    "0.0.0.0:9090".to_string()
}
fn default_metrics_prefix() -> String {
    "logship".to_string()
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// Compiles every filter, topic and partition expression, so a
    /// structurally invalid expression fails the load (and therefore the
    /// reload) instead of poisoning messages at forward time.
    pub fn validate(&self) -> crate::Result<()> {
        if self.store.directory.as_os_str().is_empty() {
            return Err(crate::Error::Config("Store directory is required".into()));
        }

        if self.store.ingest_channel_capacity == 0 {
            return Err(crate::Error::Config(
                "Ingest channel capacity must be positive".into(),
            ));
        }

        if self.store.max_sent_inflight == 0 {
            return Err(crate::Error::Config(
                "max_sent_inflight must be positive".into(),
            ));
        }

        if self.broker.bootstrap_servers.is_empty() {
            return Err(crate::Error::Config(
                "At least one bootstrap server required".into(),
            ));
        }

        for (index, source) in self.sources.iter().enumerate() {
            if source.protocol == SourceProtocol::Unix && source.unix_socket_path.is_none() {
                return Err(crate::Error::Config(format!(
                    "Source {}: unix protocol requires unix_socket_path",
                    index
                )));
            }

            ExprEnv::compile(source).map_err(|e| {
                crate::Error::Config(format!("Source {}: {}", index, e))
            })?;
        }

        Ok(())
    }
}
