//! Telemetry message and record types.
//!
//! This module provides the serde schemas for everything that flows
//! through the enrichment pipeline: the inbound bus payload, the device
//! resolved from the metadata service, and the records written to the
//! downstream services.
//!
//! # Example
//!
//! ```rust
//! use iot_ingestion::pipeline::message::InboundMessage;
//!
//! let payload = br#"{
//!   "device_id": "d1",
//!   "values": [{"latitude": "10.5"}, {"longitude": "20.25"}],
//!   "receive_time": 1700000000000
//! }"#;
//!
//! let message = InboundMessage::parse(payload).unwrap();
//! assert_eq!(message.device_id, "d1");
//! assert_eq!(message.values.len(), 2);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::error::IngestError;

/// A single telemetry reading: one JSON object such as `{"speed": "3.2"}`.
pub type Reading = Map<String, JsonValue>;

/// Telemetry message consumed from a raw-data topic.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    /// Identifier of the device that produced the message.
    pub device_id: String,

    /// Ordered readings, each a key/value object.
    pub values: Vec<Reading>,

    /// Producer-side receive time.
    pub receive_time: DateTime<Utc>,
}

#[derive(Deserialize)]
struct WireMessage {
    device_id: Option<String>,
    #[serde(default)]
    values: Option<Vec<Reading>>,
    receive_time: Option<JsonValue>,
}

impl InboundMessage {
    /// Decodes and validates a raw bus payload.
    ///
    /// # Errors
    ///
    /// Returns `IngestError::MalformedMessage` if the payload is not JSON,
    /// if `device_id` is missing or empty, if any entry of `values` is not
    /// an object, or if `receive_time` is missing or unreadable.
    ///
    /// `receive_time` is accepted as epoch milliseconds (integer or float,
    /// fractions truncated) or as an RFC 3339 string.
    pub fn parse(payload: &[u8]) -> Result<Self, IngestError> {
        let wire: WireMessage = serde_json::from_slice(payload)
            .map_err(|e| IngestError::MalformedMessage(e.to_string()))?;

        let device_id = wire
            .device_id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| IngestError::MalformedMessage("missing device_id".to_string()))?;

        let receive_time = wire
            .receive_time
            .filter(|v| !v.is_null())
            .ok_or_else(|| IngestError::MalformedMessage("missing receive_time".to_string()))
            .and_then(|v| parse_receive_time(&v))?;

        Ok(Self {
            device_id,
            values: wire.values.unwrap_or_default(),
            receive_time,
        })
    }
}

fn parse_receive_time(value: &JsonValue) -> Result<DateTime<Utc>, IngestError> {
    let parsed = match value {
        JsonValue::Number(n) => match n.as_i64() {
            Some(millis) => DateTime::<Utc>::from_timestamp_millis(millis),
            None => n
                .as_f64()
                .filter(|f| f.is_finite() && f.abs() < i64::MAX as f64)
                .and_then(|f| DateTime::<Utc>::from_timestamp_millis(f.trunc() as i64)),
        },
        JsonValue::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        _ => None,
    };

    parsed.ok_or_else(|| IngestError::MalformedMessage(format!("invalid receive_time: {}", value)))
}

/// Device record returned by the metadata service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// Store-side identifier.
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Project the device is assigned to.
    #[serde(default)]
    pub project_id: Option<String>,

    /// Group the device is assigned to.
    #[serde(default)]
    pub group_id: Option<String>,
}

/// OData collection wrapper: `{"value": [...]}`.
#[derive(Debug, Deserialize)]
pub struct DeviceCollection {
    /// Matching devices; absent is treated like empty.
    #[serde(default)]
    pub value: Option<Vec<Device>>,
}

impl DeviceCollection {
    /// First device of the collection, if any.
    pub fn into_first(self) -> Option<Device> {
        self.value.and_then(|devices| devices.into_iter().next())
    }
}

/// Raw telemetry record posted to the raw-data service.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawDataRecord {
    /// Project of the owning device.
    pub project_id: Option<String>,
    /// Group of the owning device.
    pub group_id: Option<String>,
    /// Owning device.
    pub device_id: String,
    /// Readings copied from the message.
    pub values: Vec<Reading>,
    /// Producer receive time.
    #[serde(with = "timestamp")]
    pub recorded_time: DateTime<Utc>,
    /// Time the record was built.
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
}

impl RawDataRecord {
    /// Builds the raw-data record for a message and its resolved device.
    pub fn new(message: &InboundMessage, device: &Device, created_at: DateTime<Utc>) -> Self {
        Self {
            project_id: device.project_id.clone(),
            group_id: device.group_id.clone(),
            device_id: message.device_id.clone(),
            values: message.values.clone(),
            recorded_time: message.receive_time,
            created_at,
        }
    }
}

/// Location record posted to the location service.
///
/// `elevation` and `heading` serialize as an empty string when unknown.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocationRecord {
    /// Owning device.
    pub device_id: String,
    /// Project of the owning device.
    pub project_id: Option<String>,
    /// Group of the owning device.
    pub group_id: Option<String>,
    /// Latitude in decimal degrees.
    pub latitude: f64,
    /// Longitude in decimal degrees.
    pub longitude: f64,
    /// Accuracy in meters.
    pub accuracy: i64,
    /// Elevation in meters.
    #[serde(serialize_with = "empty_when_none")]
    pub elevation: Option<i64>,
    /// Speed, 0 when unknown.
    pub speed: f64,
    /// Heading exactly as reported.
    #[serde(serialize_with = "empty_when_none")]
    pub heading: Option<JsonValue>,
    /// Producer receive time.
    #[serde(with = "timestamp")]
    pub recorded_time: DateTime<Utc>,
    /// Time the record was built.
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
}

/// Last-contact update for a device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceTouch {
    /// Device to update; part of the request path, not the body.
    #[serde(skip_serializing)]
    pub device_id: String,
    /// Last time the device was heard from.
    #[serde(with = "timestamp")]
    pub last_contact: DateTime<Utc>,
}

impl DeviceTouch {
    /// Builds the touch for a message.
    pub fn for_message(message: &InboundMessage) -> Self {
        Self {
            device_id: message.device_id.clone(),
            last_contact: message.receive_time,
        }
    }
}

fn empty_when_none<T, S>(value: &Option<T>, serializer: S) -> Result<S::Ok, S::Error>
where
    T: Serialize,
    S: serde::Serializer,
{
    match value {
        Some(v) => v.serialize(serializer),
        None => serializer.serialize_str(""),
    }
}

/// RFC 3339 timestamps with millisecond precision and a `Z` suffix.
mod timestamp {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_rfc3339_opts(SecondsFormat::Millis, true))
    }
}
