//! Message enrichment pipeline.
//!
//! Every consumed record goes through the same steps:
//!
//! 1. parse the payload into an [`InboundMessage`]
//! 2. resolve the device from the metadata service
//! 3. write the raw-data record
//! 4. derive and write the location record, only after step 3 succeeded
//! 5. touch the device's last-contact time
//!
//! Steps 1 and 2 run inline, so they follow offset order within a
//! subscription. A message that fails either step is dropped and nothing is
//! written. Steps 3 to 5 run as one spawned task group (raw data then
//! location on one branch, touch on the other) tracked for draining, so the
//! writes of one message may overlap with parsing the next.

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn, Instrument, Span};

use super::location::derive_location;
use super::message::{Device, DeviceTouch, InboundMessage, RawDataRecord};
use crate::consumer::{ConsumedRecord, RecordHandler};
use crate::downstream::{DownstreamError, RecordStores};
use crate::error::IngestError;

/// Result of one downstream write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// Not attempted: no location in the readings, or raw data failed.
    Skipped,
    Failed(String),
}

impl WriteOutcome {
    pub fn is_written(&self) -> bool {
        matches!(self, Self::Written)
    }
}

impl fmt::Display for WriteOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Written => f.write_str("written"),
            Self::Skipped => f.write_str("skipped"),
            Self::Failed(_) => f.write_str("failed"),
        }
    }
}

/// Outcome of the write phase for one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub raw_data: WriteOutcome,
    pub location: WriteOutcome,
    pub touch: WriteOutcome,
}

/// Turns consumed records into downstream writes.
pub struct EnrichmentPipeline {
    stores: Arc<dyn RecordStores>,
    tracker: TaskTracker,
    cancellation: CancellationToken,
    include_payload: bool,
}

impl EnrichmentPipeline {
    /// Creates a pipeline writing to `stores`.
    pub fn new(stores: Arc<dyn RecordStores>) -> Self {
        Self {
            stores,
            tracker: TaskTracker::new(),
            cancellation: CancellationToken::new(),
            include_payload: false,
        }
    }

    /// Logs raw payloads at debug level.
    pub fn with_payload_logging(mut self, enabled: bool) -> Self {
        self.include_payload = enabled;
        self
    }

    /// Number of write task groups still running.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Parses a payload and resolves its device.
    ///
    /// # Errors
    ///
    /// Returns `MalformedMessage`, `DeviceLookup` or `DeviceNotFound`; in
    /// every case the message must be dropped without writes.
    pub async fn resolve(&self, payload: &[u8]) -> Result<(InboundMessage, Device), IngestError> {
        if self.include_payload {
            debug!(payload = %String::from_utf8_lossy(payload), "Received payload");
        }

        let message = InboundMessage::parse(payload)?;

        let device = self
            .stores
            .lookup_device(&message.device_id)
            .await
            .map_err(|source| IngestError::DeviceLookup {
                device_id: message.device_id.clone(),
                source,
            })?
            .ok_or_else(|| IngestError::DeviceNotFound(message.device_id.clone()))?;

        debug!(
            device_id = %message.device_id,
            readings = message.values.len(),
            "Device resolved"
        );
        Ok((message, device))
    }

    /// Runs all five steps inline and returns the write report.
    pub async fn process(&self, payload: &[u8]) -> Result<DispatchReport, IngestError> {
        let (message, device) = self.resolve(payload).await?;
        Ok(dispatch(self.stores.as_ref(), &message, &device, Utc::now()).await)
    }
}

/// Writes raw data, location and the device touch for a resolved message.
///
/// Raw data and location run in sequence on one branch; the touch runs
/// concurrently on another. Failures are logged and reported, never raised.
pub async fn dispatch(
    stores: &dyn RecordStores,
    message: &InboundMessage,
    device: &Device,
    created_at: DateTime<Utc>,
) -> DispatchReport {
    let records = async {
        let raw = RawDataRecord::new(message, device, created_at);
        if let Err(e) = stores.create_raw_data(&raw).await {
            return (write_failed("raw_data", e), WriteOutcome::Skipped);
        }

        let location = match derive_location(message, device, created_at) {
            Some(record) => match stores.create_location(&record).await {
                Ok(()) => WriteOutcome::Written,
                Err(e) => write_failed("location", e),
            },
            None => WriteOutcome::Skipped,
        };

        (WriteOutcome::Written, location)
    };

    let touch = async {
        match stores.touch_device(&DeviceTouch::for_message(message)).await {
            Ok(()) => WriteOutcome::Written,
            Err(e) => write_failed("device_touch", e),
        }
    };

    let ((raw_data, location), touch) = tokio::join!(records, touch);

    DispatchReport {
        raw_data,
        location,
        touch,
    }
}

fn write_failed(service: &'static str, source: DownstreamError) -> WriteOutcome {
    let error = IngestError::DownstreamWrite { service, source };
    warn!(service, error = %error, "Downstream write failed");
    WriteOutcome::Failed(error.to_string())
}

#[async_trait::async_trait]
impl RecordHandler for EnrichmentPipeline {
    async fn handle(&self, record: ConsumedRecord) -> Result<(), IngestError> {
        let (message, device) = self.resolve(&record.payload).await?;

        let stores = Arc::clone(&self.stores);
        let cancellation = self.cancellation.clone();
        let created_at = Utc::now();

        self.tracker.spawn(
            async move {
                tokio::select! {
                    report = dispatch(stores.as_ref(), &message, &device, created_at) => {
                        debug!(
                            device_id = %message.device_id,
                            raw_data = %report.raw_data,
                            location = %report.location,
                            touch = %report.touch,
                            "Message dispatched"
                        );
                    }
                    _ = cancellation.cancelled() => {
                        warn!(device_id = %message.device_id, "Dispatch abandoned");
                    }
                }
            }
            .instrument(Span::current()),
        );

        Ok(())
    }

    async fn drain(&self) {
        self.tracker.close();
        info!(in_flight = self.tracker.len(), "Draining in-flight writes");
        self.tracker.wait().await;
    }

    fn abandon(&self) {
        self.tracker.close();
        self.cancellation.cancel();
    }
}
