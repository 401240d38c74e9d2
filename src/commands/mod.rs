/*!
Command handlers for the CLI

This module provides command handlers invoked by the CLI entrypoint.

It exposes three top-level command modules:

- `run`          - Discover topics and run the enrichment pipeline
- `topics`       - Print the matched topic working set
- `check_config` - Print the resolved configuration

These handlers are small and wire together the library components:
registry, consumer group manager, pipeline and downstream clients.
*/

use crate::config::Config;
use crate::consumer::{ConsumerFactory, ConsumerGroupManager, GroupOptions, KafkaConsumerFactory};
use crate::credentials::CredentialResolver;
use crate::downstream::{HttpRecordStores, RecordStores};
use crate::error::{IngestError, Result};
use crate::pipeline::EnrichmentPipeline;
use crate::registry::{KafkaMetadataLister, TopicRegistry};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Builds the topic registry for the configured landscape and tenant.
pub fn topic_registry(config: &Config) -> TopicRegistry {
    TopicRegistry::new(
        Box::new(KafkaMetadataLister::from_config(config)),
        config.topic_filter(),
        Duration::from_secs(config.kafka.discovery_timeout_secs),
    )
}

/// Resolves when SIGINT or SIGTERM is received.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}

// Pipeline command handler
pub mod r#run {
    //! Full ingestion run.
    //!
    //! Credentials and discovery are resolved first; any failure there is
    //! fatal. Subscriptions then run until the shutdown signal, after which
    //! every subscription is closed before returning.

    use super::*;

    /// Run the pipeline against the configured Kafka cluster and services.
    ///
    /// # Arguments
    ///
    /// * `config` - Validated configuration (consumed)
    /// * `drain` - Wait for in-flight writes on shutdown
    pub async fn run_ingestion(config: Config, drain: bool) -> Result<()> {
        let resolver = CredentialResolver::from_env(config.services.clone())?;
        let endpoints = resolver.resolve_all()?;
        let stores = HttpRecordStores::new(endpoints, &config.downstream).map_err(|e| {
            IngestError::Config(format!("Failed to build downstream clients: {}", e))
        })?;

        let registry = topic_registry(&config);

        run_with(
            &config,
            &registry,
            Arc::new(KafkaConsumerFactory::new()),
            Arc::new(stores),
            drain,
            shutdown_signal(),
        )
        .await
    }

    /// Runs the pipeline with explicit collaborators until `shutdown` resolves.
    ///
    /// Returns cleanly without waiting for `shutdown` when no topic matches.
    pub async fn run_with<F>(
        config: &Config,
        registry: &TopicRegistry,
        factory: Arc<dyn ConsumerFactory>,
        stores: Arc<dyn RecordStores>,
        drain: bool,
        shutdown: F,
    ) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let topics = registry.discover().await?;
        if topics.is_empty() {
            tracing::warn!(
                landscape = %config.landscape,
                tenant = %config.tenant,
                "No matching topics found, nothing to consume"
            );
            return Ok(());
        }

        let pipeline = EnrichmentPipeline::new(stores)
            .with_payload_logging(config.logging.include_payload);
        let manager = ConsumerGroupManager::new(factory)
            .with_drain_timeout(Duration::from_secs(config.shutdown.drain_timeout_secs));
        let options = GroupOptions::from_config(config);

        let subscriptions = manager
            .start(&topics, &options, Arc::new(pipeline))
            .await?;
        tracing::info!(count = subscriptions.len(), "Ingestion running");

        shutdown.await;

        manager.shutdown(subscriptions, drain).await;
        Ok(())
    }
}

// Topic listing command handler
pub mod topics {
    use super::*;

    /// Discover and print the working set with each topic's group id.
    pub async fn list_topics(config: Config) -> Result<()> {
        let topics = topic_registry(&config).discover().await?;
        print!("{}", render_topics(&topics, &GroupOptions::from_config(&config)));
        Ok(())
    }

    /// One `<topic>\t<group id>` line per topic.
    pub fn render_topics(topics: &[String], options: &GroupOptions) -> String {
        if topics.is_empty() {
            return "No matching topics\n".to_string();
        }
        topics
            .iter()
            .map(|topic| format!("{}\t{}\n", topic, options.group_id_for(topic)))
            .collect()
    }
}

// Configuration check command handler
pub mod check_config {
    use super::*;

    /// Print the resolved configuration with secrets redacted.
    pub fn check_config(config: &Config) -> Result<()> {
        print!("{}", render_config(config)?);
        Ok(())
    }

    /// Redacted YAML rendering of the configuration.
    pub fn render_config(config: &Config) -> Result<String> {
        let yaml = serde_yaml::to_string(&config.redacted()).map_err(IngestError::from)?;
        Ok(format!(
            "# Configuration is valid\n# brokers: {}\n{}",
            config.brokers(),
            yaml
        ))
    }
}
