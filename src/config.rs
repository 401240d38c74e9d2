//! Configuration management for the ingestion pipeline
//!
//! This module handles loading, parsing, validating, and managing
//! configuration from files, environment variables, and CLI overrides.
//! Environment variables win over the file; CLI flags win over both.

use crate::credentials::ServiceCredentials;
use crate::error::{IngestError, Result};
use crate::registry::TopicFilter;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Main configuration structure
///
/// Holds everything the pipeline consumes: tenant identity, broker
/// coordinates, downstream service settings, and ambient behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Landscape name (e.g. "dev", "prod")
    #[serde(default)]
    pub landscape: String,

    /// Tenant name
    #[serde(default)]
    pub tenant: String,

    /// Coordination service used for topic discovery
    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    /// Kafka consumer settings
    #[serde(default)]
    pub kafka: KafkaConfig,

    /// Downstream service bindings
    #[serde(default)]
    pub services: ServicesConfig,

    /// Downstream HTTP behavior
    #[serde(default)]
    pub downstream: DownstreamConfig,

    /// Shutdown behavior
    #[serde(default)]
    pub shutdown: ShutdownConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Coordination service endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Host name
    #[serde(default = "default_coordinator_host")]
    pub host: String,

    /// Port
    #[serde(default = "default_coordinator_port")]
    pub port: u16,
}

fn default_coordinator_host() -> String {
    "localhost".to_string()
}

fn default_coordinator_port() -> u16 {
    9092
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            host: default_coordinator_host(),
            port: default_coordinator_port(),
        }
    }
}

impl CoordinatorConfig {
    /// `host:port` address.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Kafka consumer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConfig {
    /// Broker list (comma-separated); defaults to the coordinator address
    #[serde(default)]
    pub brokers: Option<String>,

    /// Prefix every tenant topic starts with
    #[serde(default)]
    pub topic_prefix: String,

    /// Marker identifying raw-data topics
    #[serde(default = "default_topic_suffix")]
    pub topic_suffix: String,

    /// Consumer session timeout in milliseconds
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,

    /// Offset reset policy ("earliest" or "latest")
    #[serde(default = "default_auto_offset_reset")]
    pub auto_offset_reset: String,

    /// Let the client commit offsets in the background
    #[serde(default = "default_enable_auto_commit")]
    pub enable_auto_commit: bool,

    /// Upper bound on the topic listing call
    #[serde(default = "default_discovery_timeout")]
    pub discovery_timeout_secs: u64,

    /// Security configuration
    #[serde(default)]
    pub security: Option<KafkaSecurityConfig>,
}

fn default_topic_suffix() -> String {
    "-raw-data".to_string()
}

fn default_session_timeout_ms() -> u64 {
    15_000
}

fn default_auto_offset_reset() -> String {
    "earliest".to_string()
}

fn default_enable_auto_commit() -> bool {
    true
}

fn default_discovery_timeout() -> u64 {
    10
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: None,
            topic_prefix: String::new(),
            topic_suffix: default_topic_suffix(),
            session_timeout_ms: default_session_timeout_ms(),
            auto_offset_reset: default_auto_offset_reset(),
            enable_auto_commit: default_enable_auto_commit(),
            discovery_timeout_secs: default_discovery_timeout(),
            security: None,
        }
    }
}

/// Kafka security configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaSecurityConfig {
    /// Security protocol (PLAINTEXT, SSL, SASL_PLAINTEXT, SASL_SSL)
    pub protocol: String,

    /// SASL mechanism (PLAIN, SCRAM-SHA-256, SCRAM-SHA-512)
    #[serde(default)]
    pub sasl_mechanism: Option<String>,

    /// SASL username
    #[serde(default)]
    pub sasl_username: Option<String>,

    /// SASL password (prefer env var KAFKA_SASL_PASSWORD)
    #[serde(default)]
    pub sasl_password: Option<String>,

    /// CA certificate path for SSL protocols
    #[serde(default)]
    pub ssl_ca_location: Option<String>,
}

/// Downstream service bindings
///
/// Explicit credentials take precedence over `VCAP_SERVICES` lookups by
/// binding name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServicesConfig {
    /// Service binding names searched in `VCAP_SERVICES`
    #[serde(default)]
    pub binding_names: BindingNames,

    /// Explicit metadata service credentials
    #[serde(default)]
    pub metadata: Option<ServiceCredentials>,

    /// Explicit raw-data service credentials
    #[serde(default)]
    pub raw_data: Option<ServiceCredentials>,

    /// Explicit location service credentials
    #[serde(default)]
    pub location: Option<ServiceCredentials>,
}

/// Cloud Foundry service instance names
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindingNames {
    #[serde(default = "default_metadata_binding")]
    pub metadata: String,
    #[serde(default = "default_raw_data_binding")]
    pub raw_data: String,
    #[serde(default = "default_location_binding")]
    pub location: String,
}

fn default_metadata_binding() -> String {
    "iot-hub-service-odata-shared-new-metadata".to_string()
}

fn default_raw_data_binding() -> String {
    "iot-hub-service-odata-shared-new-rawdata".to_string()
}

fn default_location_binding() -> String {
    "iot-hub-service-odata-shared-new-location".to_string()
}

impl Default for BindingNames {
    fn default() -> Self {
        Self {
            metadata: default_metadata_binding(),
            raw_data: default_raw_data_binding(),
            location: default_location_binding(),
        }
    }
}

/// Downstream HTTP configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownstreamConfig {
    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub timeout_secs: u64,

    /// Maximum in-flight requests per service
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,

    /// Retry policy for transient failures
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_request_timeout() -> u64 {
    30
}

fn default_max_concurrent_requests() -> usize {
    16
}

impl Default for DownstreamConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_request_timeout(),
            max_concurrent_requests: default_max_concurrent_requests(),
            retry: RetryConfig::default(),
        }
    }
}

/// Retry policy for downstream requests
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryConfig {
    /// Total attempts including the first one (1 disables retries)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff before the second attempt, doubled afterwards
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Backoff ceiling
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    200
}

fn default_max_backoff_ms() -> u64 {
    5_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

/// Shutdown configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// Let in-flight messages finish before exiting
    #[serde(default = "default_drain")]
    pub drain: bool,

    /// Upper bound on the drain phase
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,
}

fn default_drain() -> bool {
    true
}

fn default_drain_timeout() -> u64 {
    30
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain: default_drain(),
            drain_timeout_secs: default_drain_timeout(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error) or a full filter directive
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Enable JSON-formatted logs
    #[serde(default)]
    pub json_format: bool,

    /// Log file path (if None, STDOUT only)
    #[serde(default)]
    pub file_path: Option<PathBuf>,

    /// Include raw message payloads in debug logs
    #[serde(default)]
    pub include_payload: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
            file_path: None,
            include_payload: false,
        }
    }
}

impl Config {
    /// Load configuration from file with environment and CLI overrides
    ///
    /// A missing file is not an error: defaults plus environment variables
    /// are enough for a platform deployment.
    ///
    /// # Errors
    ///
    /// Returns error if the file exists but cannot be read or parsed
    pub fn load(path: &str, cli: &crate::cli::Cli) -> Result<Self> {
        let mut config = if Path::new(path).exists() {
            Self::from_file(path)?
        } else {
            tracing::warn!("Config file not found at {}, using defaults", path);
            Self::default()
        };

        config.apply_env_vars();
        config.apply_cli_overrides(cli);

        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| IngestError::Config(format!("Failed to read config file: {}", e)))?;
        serde_yaml::from_str(&contents)
            .map_err(|e| IngestError::Config(format!("Failed to parse config: {}", e)).into())
    }

    fn apply_env_vars(&mut self) {
        if let Ok(landscape) = std::env::var("LANDSCAPE_NAME") {
            self.landscape = landscape;
        }

        if let Ok(tenant) = std::env::var("TENANT_NAME") {
            self.tenant = tenant;
        }

        if let Ok(host) = std::env::var("COORDINATOR_HOST") {
            self.coordinator.host = host;
        }

        if let Some(port) = env_parse("COORDINATOR_PORT") {
            self.coordinator.port = port;
        }

        if let Ok(prefix) = std::env::var("KAFKA_TOPIC_PREFIX") {
            self.kafka.topic_prefix = prefix;
        }

        if let Ok(brokers) = std::env::var("KAFKA_BROKERS") {
            self.kafka.brokers = Some(brokers);
        }

        if let Some(timeout) = env_parse("KAFKA_SESSION_TIMEOUT_MS") {
            self.kafka.session_timeout_ms = timeout;
        }

        if let Ok(policy) = std::env::var("KAFKA_AUTO_OFFSET_RESET") {
            self.kafka.auto_offset_reset = policy;
        }

        // Kafka security: the protocol variable populates or replaces the block,
        // the password variable can also complete a file-provided block.
        if let Ok(protocol) = std::env::var("KAFKA_SECURITY_PROTOCOL") {
            self.kafka.security = Some(KafkaSecurityConfig {
                protocol,
                sasl_mechanism: std::env::var("KAFKA_SASL_MECHANISM").ok(),
                sasl_username: std::env::var("KAFKA_SASL_USERNAME").ok(),
                sasl_password: std::env::var("KAFKA_SASL_PASSWORD").ok(),
                ssl_ca_location: std::env::var("KAFKA_SSL_CA_LOCATION").ok(),
            });
            tracing::debug!("Populated kafka.security from KAFKA_* env vars");
        } else if let Some(security) = self.kafka.security.as_mut() {
            if security.sasl_password.is_none() {
                security.sasl_password = std::env::var("KAFKA_SASL_PASSWORD").ok();
            }
        }

        if let Ok(level) = std::env::var("INGESTION_LOG_LEVEL") {
            self.logging.level = level;
        }

        if let Some(json_logs) = env_parse("INGESTION_JSON_LOGS") {
            self.logging.json_format = json_logs;
        }

        if let Ok(log_file) = std::env::var("INGESTION_LOG_FILE") {
            self.logging.file_path = Some(PathBuf::from(log_file));
        }

        if let Some(max) = env_parse("INGESTION_MAX_CONCURRENT_REQUESTS") {
            self.downstream.max_concurrent_requests = max;
        }

        if let Some(drain) = env_parse("INGESTION_DRAIN_ON_SHUTDOWN") {
            self.shutdown.drain = drain;
        }
    }

    fn apply_cli_overrides(&mut self, cli: &crate::cli::Cli) {
        if let Some(landscape) = &cli.landscape {
            self.landscape = landscape.clone();
        }

        if let Some(tenant) = &cli.tenant {
            self.tenant = tenant.clone();
        }

        if cli.verbose {
            self.logging.level = "debug".to_string();
        }
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `IngestError::Config` naming the first invalid setting
    pub fn validate(&self) -> Result<()> {
        if self.landscape.trim().is_empty() {
            return Err(IngestError::Config(
                "landscape must be set (LANDSCAPE_NAME)".to_string(),
            )
            .into());
        }

        if self.tenant.trim().is_empty() {
            return Err(
                IngestError::Config("tenant must be set (TENANT_NAME)".to_string()).into(),
            );
        }

        if self.coordinator.host.trim().is_empty() {
            return Err(IngestError::Config("coordinator.host cannot be empty".to_string()).into());
        }

        if self.coordinator.port == 0 {
            return Err(
                IngestError::Config("coordinator.port must be greater than 0".to_string()).into(),
            );
        }

        if self.kafka.topic_suffix.is_empty() {
            return Err(IngestError::Config("kafka.topic_suffix cannot be empty".to_string()).into());
        }

        let valid_policies = ["earliest", "latest"];
        if !valid_policies.contains(&self.kafka.auto_offset_reset.as_str()) {
            return Err(IngestError::Config(format!(
                "Invalid kafka.auto_offset_reset: {}. Must be one of: {}",
                self.kafka.auto_offset_reset,
                valid_policies.join(", ")
            ))
            .into());
        }

        if self.kafka.session_timeout_ms == 0 {
            return Err(IngestError::Config(
                "kafka.session_timeout_ms must be greater than 0".to_string(),
            )
            .into());
        }

        if self.kafka.discovery_timeout_secs == 0 {
            return Err(IngestError::Config(
                "kafka.discovery_timeout_secs must be greater than 0".to_string(),
            )
            .into());
        }

        if let Some(security) = &self.kafka.security {
            let valid_protocols = ["PLAINTEXT", "SSL", "SASL_PLAINTEXT", "SASL_SSL"];
            if !valid_protocols.contains(&security.protocol.to_uppercase().as_str()) {
                return Err(IngestError::Config(format!(
                    "Invalid kafka.security.protocol: {}. Must be one of: {}",
                    security.protocol,
                    valid_protocols.join(", ")
                ))
                .into());
            }
        }

        if self.downstream.timeout_secs == 0 {
            return Err(IngestError::Config(
                "downstream.timeout_secs must be greater than 0".to_string(),
            )
            .into());
        }

        if self.downstream.max_concurrent_requests == 0 {
            return Err(IngestError::Config(
                "downstream.max_concurrent_requests must be greater than 0".to_string(),
            )
            .into());
        }

        if self.downstream.retry.max_attempts == 0 {
            return Err(IngestError::Config(
                "downstream.retry.max_attempts must be greater than 0".to_string(),
            )
            .into());
        }

        if self.downstream.retry.initial_backoff_ms > self.downstream.retry.max_backoff_ms {
            return Err(IngestError::Config(
                "downstream.retry.initial_backoff_ms cannot exceed max_backoff_ms".to_string(),
            )
            .into());
        }

        Ok(())
    }

    /// Broker list used by the consumers.
    pub fn brokers(&self) -> String {
        self.kafka
            .brokers
            .clone()
            .filter(|b| !b.trim().is_empty())
            .unwrap_or_else(|| self.coordinator.address())
    }

    /// Topic filter for this landscape and tenant.
    pub fn topic_filter(&self) -> TopicFilter {
        TopicFilter::new(
            &self.kafka.topic_prefix,
            &self.landscape,
            &self.tenant,
            &self.kafka.topic_suffix,
        )
    }

    /// Copy with every secret replaced, for display.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if let Some(security) = copy.kafka.security.as_mut() {
            if security.sasl_password.is_some() {
                security.sasl_password = Some(REDACTED.to_string());
            }
        }
        for creds in [
            &mut copy.services.metadata,
            &mut copy.services.raw_data,
            &mut copy.services.location,
        ]
        .into_iter()
        .flatten()
        {
            creds.password = REDACTED.to_string();
        }
        copy
    }
}

const REDACTED: &str = "********";

impl Default for Config {
    fn default() -> Self {
        Self {
            landscape: String::new(),
            tenant: String::new(),
            coordinator: CoordinatorConfig::default(),
            kafka: KafkaConfig::default(),
            services: ServicesConfig::default(),
            downstream: DownstreamConfig::default(),
            shutdown: ShutdownConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Reads and parses an environment variable, warning when it is unusable.
fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => {
            tracing::debug!(variable = name, "Env override applied");
            Some(value)
        }
        Err(_) => {
            tracing::warn!("Invalid value for {}: {}", name, raw);
            None
        }
    }
}
