//! Topic discovery and tenant filtering.
//!
//! The registry lists every topic the broker cluster knows once at startup
//! and keeps those belonging to this landscape and tenant. Matching is a
//! plain substring test on the name, so a tenant whose name extends another
//! tenant's (e.g. `acme` and `acme-eu`) will also match the longer one's
//! topics.

use async_trait::async_trait;
use rdkafka::consumer::{BaseConsumer, Consumer};
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::{Config, KafkaSecurityConfig};
use crate::consumer::config::{client_config, security_settings};
use crate::error::IngestError;

/// Extra time the registry grants a lister beyond the discovery timeout, so
/// the metadata client's own timeout fires first and the client is dropped.
const DISCOVERY_GRACE: Duration = Duration::from_millis(500);

/// Marker every raw-data topic carries.
pub const RAW_DATA_MARKER: &str = "-raw-data";

/// Decides which topic names belong to the working set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicFilter {
    tenant_marker: String,
    suffix: String,
}

impl TopicFilter {
    /// Creates a filter for `<prefix><landscape>-<tenant>` topics carrying `suffix`.
    ///
    /// # Examples
    ///
    /// ```
    /// use iot_ingestion::registry::TopicFilter;
    ///
    /// let filter = TopicFilter::new("iot-", "dev", "acme", "-raw-data");
    /// assert!(filter.matches("iot-dev-acme-sensors-raw-data"));
    /// assert!(!filter.matches("iot-dev-acme-sensors-events"));
    /// ```
    pub fn new(prefix: &str, landscape: &str, tenant: &str, suffix: &str) -> Self {
        Self {
            tenant_marker: format!("{}{}-{}", prefix, landscape, tenant),
            suffix: suffix.to_string(),
        }
    }

    /// Whether `topic` belongs to the working set.
    pub fn matches(&self, topic: &str) -> bool {
        topic.contains(&self.tenant_marker) && topic.contains(&self.suffix)
    }

    /// Matching topics, in name order.
    pub fn apply<'a, I>(&self, topics: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let matched: BTreeSet<&String> = topics.into_iter().filter(|t| self.matches(t)).collect();
        matched.into_iter().cloned().collect()
    }
}

/// Filters `all` down to the raw-data topics of one landscape and tenant.
pub fn filter_for_tenant(
    all: &BTreeSet<String>,
    prefix: &str,
    landscape: &str,
    tenant: &str,
) -> Vec<String> {
    TopicFilter::new(prefix, landscape, tenant, RAW_DATA_MARKER).apply(all)
}

/// Lists the topic names known to the cluster.
#[async_trait]
pub trait TopicLister: Send + Sync {
    /// # Errors
    ///
    /// Returns `IngestError::Discovery` if the listing cannot be read.
    async fn list_topics(&self) -> Result<BTreeSet<String>, IngestError>;
}

/// Lists topics from broker metadata.
///
/// A client is created for each listing and dropped as soon as the
/// metadata has been read.
#[derive(Debug, Clone)]
pub struct KafkaMetadataLister {
    brokers: String,
    timeout: Duration,
    security: Option<KafkaSecurityConfig>,
}

impl KafkaMetadataLister {
    pub fn new(brokers: &str, timeout: Duration) -> Self {
        Self {
            brokers: brokers.to_string(),
            timeout,
            security: None,
        }
    }

    pub fn with_security(mut self, security: Option<KafkaSecurityConfig>) -> Self {
        self.security = security;
        self
    }

    /// Builds a lister from the loaded configuration.
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            &config.brokers(),
            Duration::from_secs(config.kafka.discovery_timeout_secs),
        )
        .with_security(config.kafka.security.clone())
    }

    fn settings(&self) -> Vec<(String, String)> {
        let mut settings = vec![("bootstrap.servers".to_string(), self.brokers.clone())];
        settings.extend(security_settings(self.security.as_ref()));
        settings
    }

    fn fetch_blocking(&self) -> Result<BTreeSet<String>, IngestError> {
        let consumer: BaseConsumer = client_config(self.settings())
            .create()
            .map_err(|e| IngestError::Discovery(format!("cannot create metadata client: {}", e)))?;

        let metadata = consumer.fetch_metadata(None, self.timeout).map_err(|e| {
            IngestError::Discovery(format!("cannot read topics from {}: {}", self.brokers, e))
        })?;

        Ok(metadata
            .topics()
            .iter()
            .map(|topic| topic.name().to_string())
            .filter(|name| !name.starts_with("__"))
            .collect())
    }
}

#[async_trait]
impl TopicLister for KafkaMetadataLister {
    async fn list_topics(&self) -> Result<BTreeSet<String>, IngestError> {
        let lister = self.clone();
        tokio::task::spawn_blocking(move || lister.fetch_blocking())
            .await
            .map_err(|e| IngestError::Discovery(format!("metadata task failed: {}", e)))?
    }
}

/// Runs discovery and filtering.
pub struct TopicRegistry {
    lister: Box<dyn TopicLister>,
    filter: TopicFilter,
    timeout: Duration,
}

impl TopicRegistry {
    pub fn new(lister: Box<dyn TopicLister>, filter: TopicFilter, timeout: Duration) -> Self {
        Self {
            lister,
            filter,
            timeout,
        }
    }

    /// Lists all topics, bounded by the discovery timeout plus a short grace.
    ///
    /// # Errors
    ///
    /// Returns `IngestError::Discovery` on failure or timeout.
    pub async fn discover_topics(&self) -> Result<BTreeSet<String>, IngestError> {
        let all = tokio::time::timeout(self.timeout + DISCOVERY_GRACE, self.lister.list_topics())
            .await
            .map_err(|_| {
                IngestError::Discovery(format!(
                    "topic listing timed out after {}s",
                    self.timeout.as_secs()
                ))
            })??;

        debug!(count = all.len(), "Listed topics");
        Ok(all)
    }

    /// Discovers the working set for this landscape and tenant.
    pub async fn discover(&self) -> Result<Vec<String>, IngestError> {
        let all = self.discover_topics().await?;
        let matched = self.filter.apply(&all);
        info!(
            total = all.len(),
            matched = matched.len(),
            topics = ?matched,
            "Topic discovery complete"
        );
        Ok(matched)
    }
}
