//! HTTP implementation of [`RecordStores`].

use async_trait::async_trait;
use reqwest::{Client, Method};
use std::time::Duration;
use tracing::debug;

use super::{DownstreamError, RecordStores, ServiceClient};
use crate::config::DownstreamConfig;
use crate::credentials::ServiceEndpoints;
use crate::pipeline::message::{Device, DeviceCollection, DeviceTouch, LocationRecord, RawDataRecord};

/// Record stores backed by the metadata, raw-data and location services.
#[derive(Debug, Clone)]
pub struct HttpRecordStores {
    metadata: ServiceClient,
    raw_data: ServiceClient,
    location: ServiceClient,
}

impl HttpRecordStores {
    /// Builds the three clients over one shared connection pool.
    ///
    /// Each service still gets its own concurrency limiter.
    pub fn new(endpoints: ServiceEndpoints, config: &DownstreamConfig) -> Result<Self, DownstreamError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            metadata: ServiceClient::with_client(client.clone(), endpoints.metadata, config),
            raw_data: ServiceClient::with_client(client.clone(), endpoints.raw_data, config),
            location: ServiceClient::with_client(client, endpoints.location, config),
        })
    }
}

/// OData entity path for a device: `device('<id>')`.
///
/// Quotes are doubled per OData literal rules; characters that would
/// end the path segment are percent-encoded.
pub fn device_path(device_id: &str) -> String {
    let mut escaped = String::with_capacity(device_id.len() + 2);
    for c in device_id.chars() {
        match c {
            '\'' => escaped.push_str("''"),
            '%' => escaped.push_str("%25"),
            '/' => escaped.push_str("%2F"),
            '?' => escaped.push_str("%3F"),
            '#' => escaped.push_str("%23"),
            other => escaped.push(other),
        }
    }
    format!("/device('{}')", escaped)
}

#[async_trait]
impl RecordStores for HttpRecordStores {
    async fn lookup_device(&self, device_id: &str) -> Result<Option<Device>, DownstreamError> {
        let collection: Option<DeviceCollection> =
            self.metadata.get_json(&device_path(device_id)).await?;
        let device = collection.and_then(DeviceCollection::into_first);
        debug!(device_id, found = device.is_some(), "Device lookup completed");
        Ok(device)
    }

    async fn create_raw_data(&self, record: &RawDataRecord) -> Result<(), DownstreamError> {
        self.raw_data.send_json(Method::POST, "/raw_data", record).await
    }

    async fn create_location(&self, record: &LocationRecord) -> Result<(), DownstreamError> {
        self.location.send_json(Method::POST, "/location", record).await
    }

    async fn touch_device(&self, touch: &DeviceTouch) -> Result<(), DownstreamError> {
        self.metadata
            .send_json(Method::PATCH, &device_path(&touch.device_id), touch)
            .await
    }
}
