//! Error types for the ingestion pipeline
//!
//! This module defines the error taxonomy shared by topic discovery,
//! the consumer group manager and the enrichment pipeline, using
//! `thiserror` for ergonomic error handling.
//!
//! Only [`IngestError::Discovery`], [`IngestError::Config`] and
//! [`IngestError::Credentials`] are fatal; every other variant is logged
//! and the pipeline moves on to the next message.

use thiserror::Error;

use crate::downstream::DownstreamError;

/// Main error type for ingestion operations
#[derive(Error, Debug)]
pub enum IngestError {
    /// Topic discovery failed; nothing can be consumed
    #[error("Topic discovery failed: {0}")]
    Discovery(String),

    /// Payload is not a valid telemetry message
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// Metadata service could not be reached or answered with an error
    #[error("Device lookup failed for {device_id}: {source}")]
    DeviceLookup {
        /// Device that was being resolved
        device_id: String,
        /// Underlying downstream failure
        #[source]
        source: DownstreamError,
    },

    /// Metadata service returned an empty result set
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// A record write (raw data, location, device touch) failed
    #[error("Write to {service} failed: {source}")]
    DownstreamWrite {
        /// Logical service name ("raw_data", "location", "metadata")
        service: &'static str,
        /// Underlying downstream failure
        #[source]
        source: DownstreamError,
    },

    /// Consumer subscription could not be created or failed
    #[error("Subscription error on topic {topic}: {message}")]
    Subscription {
        /// Topic of the failing subscription
        topic: String,
        /// Transport error description
        message: String,
    },

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Service credentials could not be resolved
    #[error("Credentials error: {0}")]
    Credentials(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl IngestError {
    /// Short, stable label used for log fields and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Discovery(_) => "discovery",
            Self::MalformedMessage(_) => "malformed_message",
            Self::DeviceLookup { .. } => "device_lookup",
            Self::DeviceNotFound(_) => "device_not_found",
            Self::DownstreamWrite { .. } => "downstream_write",
            Self::Subscription { .. } => "subscription",
            Self::Config(_) => "config",
            Self::Credentials(_) => "credentials",
            Self::Io(_) => "io",
            Self::Yaml(_) => "yaml",
        }
    }

    /// Whether the error must stop the process.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Discovery(_) | Self::Config(_) | Self::Credentials(_)
        )
    }
}

/// Result type alias for ingestion operations
///
/// Uses `anyhow::Error` so startup paths can attach context while
/// still carrying an [`IngestError`] underneath.
pub type Result<T> = anyhow::Result<T>;
