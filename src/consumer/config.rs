//! Consumer group options.
//!
//! Every matched topic gets its own consumer group, named
//! `ingestion_<landscape>_<tenant>_<topic>`, so groups are never shared
//! across topics and restarts resume from the same committed offsets.
//!
//! # Example
//!
//! ```rust
//! use iot_ingestion::consumer::config::GroupOptions;
//!
//! let options = GroupOptions::new("localhost:9092", "dev", "acme");
//! let subscription = options.for_topic("iot-dev-acme-sensors-raw-data");
//!
//! assert_eq!(
//!     subscription.group_id,
//!     "ingestion_dev_acme_iot-dev-acme-sensors-raw-data"
//! );
//! ```

use rdkafka::config::ClientConfig;
use std::time::Duration;

use crate::config::{Config, KafkaSecurityConfig};

/// Partition assignment strategy shared by every group.
pub const ASSIGNMENT_STRATEGY: &str = "roundrobin";

/// Settings common to all subscriptions of one process.
#[derive(Debug, Clone)]
pub struct GroupOptions {
    /// Kafka broker addresses (comma-separated).
    pub brokers: String,

    /// Landscape part of the group id.
    pub landscape: String,

    /// Tenant part of the group id.
    pub tenant: String,

    /// Session timeout for group membership.
    pub session_timeout: Duration,

    /// Offset reset policy ("earliest" or "latest").
    pub auto_offset_reset: String,

    /// Whether to enable auto-commit.
    pub enable_auto_commit: bool,

    /// Security settings, if any.
    pub security: Option<KafkaSecurityConfig>,
}

impl GroupOptions {
    /// Creates options with the default session and offset settings.
    pub fn new(brokers: &str, landscape: &str, tenant: &str) -> Self {
        Self {
            brokers: brokers.to_string(),
            landscape: landscape.to_string(),
            tenant: tenant.to_string(),
            session_timeout: Duration::from_millis(15_000),
            auto_offset_reset: "earliest".to_string(),
            enable_auto_commit: true,
            security: None,
        }
    }

    /// Builds the options from the loaded configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            brokers: config.brokers(),
            landscape: config.landscape.clone(),
            tenant: config.tenant.clone(),
            session_timeout: Duration::from_millis(config.kafka.session_timeout_ms),
            auto_offset_reset: config.kafka.auto_offset_reset.clone(),
            enable_auto_commit: config.kafka.enable_auto_commit,
            security: config.kafka.security.clone(),
        }
    }

    /// Sets the session timeout.
    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    /// Sets the offset reset policy.
    pub fn with_auto_offset_reset(mut self, policy: &str) -> Self {
        self.auto_offset_reset = policy.to_string();
        self
    }

    /// Deterministic consumer group id for `topic`.
    pub fn group_id_for(&self, topic: &str) -> String {
        format!("ingestion_{}_{}_{}", self.landscape, self.tenant, topic)
    }

    /// Options for the subscription to `topic`.
    pub fn for_topic(&self, topic: &str) -> SubscriptionOptions {
        SubscriptionOptions {
            topic: topic.to_string(),
            group_id: self.group_id_for(topic),
            group: self.clone(),
        }
    }
}

/// Everything needed to open one subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionOptions {
    /// Topic to consume.
    pub topic: String,

    /// Consumer group dedicated to the topic.
    pub group_id: String,

    group: GroupOptions,
}

impl SubscriptionOptions {
    /// Returns the Kafka configuration as key-value pairs.
    pub fn kafka_settings(&self) -> Vec<(String, String)> {
        let mut settings = vec![
            ("bootstrap.servers".to_string(), self.group.brokers.clone()),
            ("group.id".to_string(), self.group_id.clone()),
            (
                "client.id".to_string(),
                format!("ingestion-{}-{}", self.group.landscape, self.group.tenant),
            ),
            (
                "partition.assignment.strategy".to_string(),
                ASSIGNMENT_STRATEGY.to_string(),
            ),
            (
                "auto.offset.reset".to_string(),
                self.group.auto_offset_reset.clone(),
            ),
            (
                "enable.auto.commit".to_string(),
                self.group.enable_auto_commit.to_string(),
            ),
            (
                "session.timeout.ms".to_string(),
                self.group.session_timeout.as_millis().to_string(),
            ),
        ];

        settings.extend(security_settings(self.group.security.as_ref()));
        settings
    }

    /// rdkafka client configuration for this subscription.
    pub fn client_config(&self) -> ClientConfig {
        client_config(self.kafka_settings())
    }
}

/// Security-related client settings.
pub fn security_settings(security: Option<&KafkaSecurityConfig>) -> Vec<(String, String)> {
    let Some(security) = security else {
        return vec![(
            "security.protocol".to_string(),
            "PLAINTEXT".to_string(),
        )];
    };

    let mut settings = vec![(
        "security.protocol".to_string(),
        security.protocol.to_uppercase(),
    )];

    if let Some(mechanism) = &security.sasl_mechanism {
        settings.push(("sasl.mechanism".to_string(), mechanism.clone()));
    }
    if let Some(username) = &security.sasl_username {
        settings.push(("sasl.username".to_string(), username.clone()));
    }
    if let Some(password) = &security.sasl_password {
        settings.push(("sasl.password".to_string(), password.clone()));
    }
    if let Some(ca) = &security.ssl_ca_location {
        settings.push(("ssl.ca.location".to_string(), ca.clone()));
    }

    settings
}

/// Collects key-value pairs into an rdkafka `ClientConfig`.
pub fn client_config(settings: Vec<(String, String)>) -> ClientConfig {
    let mut config = ClientConfig::new();
    for (key, value) in settings {
        config.set(key, value);
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setting<'a>(settings: &'a [(String, String)], key: &str) -> Option<&'a str> {
        settings
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn test_group_id_is_deterministic_and_per_topic() {
        let options = GroupOptions::new("localhost:9092", "dev", "acme");
        let a = options.group_id_for("iot-dev-acme-a-raw-data");
        let b = options.group_id_for("iot-dev-acme-b-raw-data");

        assert_eq!(a, "ingestion_dev_acme_iot-dev-acme-a-raw-data");
        assert_eq!(a, options.group_id_for("iot-dev-acme-a-raw-data"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_kafka_settings_defaults() {
        let options = GroupOptions::new("broker:9092", "dev", "acme");
        let settings = options.for_topic("t").kafka_settings();

        assert_eq!(setting(&settings, "bootstrap.servers"), Some("broker:9092"));
        assert_eq!(setting(&settings, "group.id"), Some("ingestion_dev_acme_t"));
        assert_eq!(
            setting(&settings, "partition.assignment.strategy"),
            Some("roundrobin")
        );
        assert_eq!(setting(&settings, "auto.offset.reset"), Some("earliest"));
        assert_eq!(setting(&settings, "enable.auto.commit"), Some("true"));
        assert_eq!(setting(&settings, "session.timeout.ms"), Some("15000"));
        assert_eq!(setting(&settings, "security.protocol"), Some("PLAINTEXT"));
        assert!(setting(&settings, "sasl.username").is_none());
    }

    #[test]
    fn test_kafka_settings_with_sasl() {
        let mut options = GroupOptions::new("broker:9093", "dev", "acme")
            .with_session_timeout(Duration::from_secs(20))
            .with_auto_offset_reset("latest");
        options.security = Some(KafkaSecurityConfig {
            protocol: "sasl_ssl".to_string(),
            sasl_mechanism: Some("SCRAM-SHA-256".to_string()),
            sasl_username: Some("user".to_string()),
            sasl_password: Some("pass".to_string()),
            ssl_ca_location: Some("/etc/ssl/ca.pem".to_string()),
        });

        let settings = options.for_topic("t").kafka_settings();
        assert_eq!(setting(&settings, "security.protocol"), Some("SASL_SSL"));
        assert_eq!(setting(&settings, "sasl.mechanism"), Some("SCRAM-SHA-256"));
        assert_eq!(setting(&settings, "sasl.username"), Some("user"));
        assert_eq!(setting(&settings, "sasl.password"), Some("pass"));
        assert_eq!(setting(&settings, "ssl.ca.location"), Some("/etc/ssl/ca.pem"));
        assert_eq!(setting(&settings, "session.timeout.ms"), Some("20000"));
        assert_eq!(setting(&settings, "auto.offset.reset"), Some("latest"));
    }

    #[test]
    fn test_from_config() {
        let mut config = Config {
            landscape: "prod".to_string(),
            tenant: "globex".to_string(),
            ..Config::default()
        };
        config.kafka.session_timeout_ms = 30_000;
        config.kafka.enable_auto_commit = false;

        let options = GroupOptions::from_config(&config);
        assert_eq!(options.brokers, "localhost:9092");
        assert_eq!(options.session_timeout, Duration::from_secs(30));
        assert!(!options.enable_auto_commit);
        assert_eq!(options.group_id_for("x"), "ingestion_prod_globex_x");
    }

    #[test]
    fn test_client_config_carries_settings() {
        let options = GroupOptions::new("broker:9092", "dev", "acme");
        let config = options.for_topic("t").client_config();
        assert_eq!(config.get("group.id"), Some("ingestion_dev_acme_t"));
        assert_eq!(config.get("bootstrap.servers"), Some("broker:9092"));
    }
}
