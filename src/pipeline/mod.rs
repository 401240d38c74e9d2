//! Message enrichment pipeline.
//!
//! Parses telemetry messages, resolves their device and fans the result
//! out to the raw-data, location and metadata services.

pub mod location;
pub mod message;
#[allow(clippy::module_inception)]
pub mod pipeline;

pub use location::{derive_location, LocationFix};
pub use message::{Device, DeviceTouch, InboundMessage, LocationRecord, RawDataRecord, Reading};
pub use pipeline::{dispatch, DispatchReport, EnrichmentPipeline, WriteOutcome};
