//! Downstream record services.
//!
//! The pipeline talks to three HTTP services: metadata (device lookup and
//! last-contact updates), raw data, and location. [`RecordStores`] is the
//! seam the pipeline depends on; [`HttpRecordStores`] is the production
//! implementation built from one [`ServiceClient`] per service.

pub mod client;
pub mod stores;

pub use client::ServiceClient;
pub use stores::HttpRecordStores;

use async_trait::async_trait;
use thiserror::Error;

use crate::pipeline::message::{Device, DeviceTouch, LocationRecord, RawDataRecord};

/// Errors that can occur while talking to a downstream service.
#[derive(Error, Debug)]
pub enum DownstreamError {
    /// HTTP transport error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// API error with status code.
    #[error("API error ({status}): {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Response body.
        message: String,
    },

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The service's concurrency limiter was closed.
    #[error("Service client closed")]
    Closed,
}

impl DownstreamError {
    /// Transport failures, HTTP 429 and HTTP 5xx are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(e) => !e.is_builder() && !e.is_decode(),
            Self::Api { status, .. } => *status == 429 || (500..600).contains(status),
            Self::Serialization(_) | Self::Closed => false,
        }
    }

    /// Label used for the request outcome metric.
    pub fn outcome(&self) -> &'static str {
        match self {
            Self::Http(_) => "transport_error",
            Self::Api { status, .. } if *status >= 500 => "server_error",
            Self::Api { .. } => "client_error",
            Self::Serialization(_) => "serialization_error",
            Self::Closed => "closed",
        }
    }
}

/// Operations the enrichment pipeline needs from the record services.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RecordStores: Send + Sync {
    /// Looks a device up by id; `Ok(None)` when the service knows no such device.
    async fn lookup_device(&self, device_id: &str) -> Result<Option<Device>, DownstreamError>;

    /// Writes one raw-data record.
    async fn create_raw_data(&self, record: &RawDataRecord) -> Result<(), DownstreamError>;

    /// Writes one location record.
    async fn create_location(&self, record: &LocationRecord) -> Result<(), DownstreamError>;

    /// Updates the device's last-contact time.
    async fn touch_device(&self, touch: &DeviceTouch) -> Result<(), DownstreamError>;
}
