//! IoT ingestion - Kafka telemetry enrichment pipeline library
//!
//! This library provides the building blocks of the ingestion service:
//! topic discovery, per-topic consumer groups, message enrichment and the
//! HTTP clients for the downstream record services.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//!
//! - `registry`: Topic discovery and tenant filtering
//! - `consumer`: Consumer group manager and the Kafka subscription transport
//! - `pipeline`: Message parsing, location derivation and write dispatch
//! - `downstream`: Metadata, raw-data and location service clients
//! - `credentials`: Service credential resolution (config or `VCAP_SERVICES`)
//! - `config`: Configuration management and validation
//! - `logging` / `metrics`: Ambient observability
//! - `error`: Error types and result aliases
//! - `cli` / `commands`: Command-line interface and handlers
//!
//! # Example
//!
//! ```no_run
//! use iot_ingestion::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config/config.yaml", &Default::default())?;
//!     config.validate()?;
//!
//!     iot_ingestion::commands::run::run_ingestion(config, true).await
//! }
//! ```

pub mod cli;
pub mod commands;
pub mod config;
pub mod consumer;
pub mod credentials;
pub mod downstream;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod registry;

// Re-export commonly used types
pub use config::Config;
pub use consumer::{ConsumerGroupManager, RecordHandler, Subscriptions};
pub use error::{IngestError, Result};
pub use pipeline::EnrichmentPipeline;
pub use registry::TopicRegistry;
