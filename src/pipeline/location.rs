//! Location derivation from telemetry readings.
//!
//! Readings arrive as an ordered list of single-key objects. A location
//! exists when the list carries a non-zero numeric `latitude` and
//! `longitude`; the optional fields fall back to fixed defaults.

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use super::message::{Device, InboundMessage, LocationRecord, Reading};

/// Accuracy reported when the device did not send one.
pub const UNKNOWN_ACCURACY: i64 = 99_999;

/// Speed reported when the device did not send one.
pub const DEFAULT_SPEED: f64 = 0.0;

/// Location fields collected from one scan over the readings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocationFix {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub elevation: Option<i64>,
    pub speed: Option<f64>,
    pub accuracy: Option<i64>,
    pub heading: Option<JsonValue>,
}

impl LocationFix {
    /// Scans the readings once; the last usable occurrence of a key wins.
    ///
    /// Occurrences that cannot be read as a number are skipped, so they
    /// never override an earlier numeric value.
    pub fn scan(values: &[Reading]) -> Self {
        let mut fix = Self::default();

        for reading in values {
            if let Some(v) = reading.get("latitude").and_then(as_number) {
                fix.latitude = Some(v);
            }
            if let Some(v) = reading.get("longitude").and_then(as_number) {
                fix.longitude = Some(v);
            }
            if let Some(v) = reading.get("elevation").and_then(as_integer) {
                fix.elevation = Some(v);
            }
            if let Some(v) = reading.get("speed").and_then(as_number) {
                fix.speed = Some(v);
            }
            if let Some(v) = reading.get("accuracy").and_then(as_integer) {
                fix.accuracy = Some(v);
            }
            if let Some(v) = reading.get("heading").filter(|v| !v.is_null()) {
                fix.heading = Some(v.clone());
            }
        }

        fix
    }

    /// Latitude and longitude, when both are present and non-zero.
    pub fn coordinates(&self) -> Option<(f64, f64)> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lon)) if lat != 0.0 && lon != 0.0 => Some((lat, lon)),
            _ => None,
        }
    }
}

/// Builds the location record for a message, if it carries a position.
pub fn derive_location(
    message: &InboundMessage,
    device: &Device,
    created_at: DateTime<Utc>,
) -> Option<LocationRecord> {
    let fix = LocationFix::scan(&message.values);
    let (latitude, longitude) = fix.coordinates()?;

    Some(LocationRecord {
        device_id: message.device_id.clone(),
        project_id: device.project_id.clone(),
        group_id: device.group_id.clone(),
        latitude,
        longitude,
        accuracy: fix.accuracy.unwrap_or(UNKNOWN_ACCURACY),
        elevation: fix.elevation,
        speed: fix.speed.unwrap_or(DEFAULT_SPEED),
        heading: fix.heading,
        recorded_time: message.receive_time,
        created_at,
    })
}

fn as_number(value: &JsonValue) -> Option<f64> {
    let n = match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    n.is_finite().then_some(n)
}

fn as_integer(value: &JsonValue) -> Option<i64> {
    as_number(value).map(|n| n.trunc() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn readings(values: JsonValue) -> Vec<Reading> {
        serde_json::from_value(values).unwrap()
    }

    fn message(values: JsonValue) -> InboundMessage {
        InboundMessage {
            device_id: "d1".to_string(),
            values: readings(values),
            receive_time: DateTime::<Utc>::from_timestamp_millis(1_700_000_000_000).unwrap(),
        }
    }

    fn device() -> Device {
        Device {
            id: Some("d1".to_string()),
            project_id: Some("p1".to_string()),
            group_id: Some("g1".to_string()),
        }
    }

    #[test]
    fn test_location_with_defaults() {
        let msg = message(json!([
            {"latitude": "10.5"},
            {"longitude": "20.25"},
            {"speed": "3.2"}
        ]));
        let record = derive_location(&msg, &device(), Utc::now()).unwrap();

        assert_eq!(record.device_id, "d1");
        assert_eq!(record.project_id.as_deref(), Some("p1"));
        assert_eq!(record.group_id.as_deref(), Some("g1"));
        assert_eq!(record.latitude, 10.5);
        assert_eq!(record.longitude, 20.25);
        assert_eq!(record.speed, 3.2);
        assert_eq!(record.accuracy, UNKNOWN_ACCURACY);
        assert!(record.elevation.is_none());
        assert!(record.heading.is_none());

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["elevation"], json!(""));
        assert_eq!(value["heading"], json!(""));
        assert_eq!(value["accuracy"], json!(99999));
    }

    #[test]
    fn test_last_occurrence_wins() {
        let msg = message(json!([
            {"latitude": "1.0"},
            {"longitude": 2.0},
            {"accuracy": "15"},
            {"latitude": 3.5},
            {"accuracy": 7.9},
            {"heading": "N"},
            {"heading": "NE"}
        ]));
        let record = derive_location(&msg, &device(), Utc::now()).unwrap();

        assert_eq!(record.latitude, 3.5);
        assert_eq!(record.longitude, 2.0);
        assert_eq!(record.accuracy, 7);
        assert_eq!(record.heading, Some(json!("NE")));
    }

    #[test]
    fn test_non_numeric_occurrence_does_not_override() {
        let fix = LocationFix::scan(&readings(json!([
            {"latitude": "10"},
            {"latitude": "north"}
        ])));
        assert_eq!(fix.latitude, Some(10.0));
    }

    #[test]
    fn test_elevation_truncates_to_integer() {
        let msg = message(json!([
            {"latitude": 1, "longitude": 1, "elevation": "120.8"}
        ]));
        let record = derive_location(&msg, &device(), Utc::now()).unwrap();
        assert_eq!(record.elevation, Some(120));
    }

    #[test]
    fn test_missing_longitude_yields_no_location() {
        let msg = message(json!([{"latitude": "10.5"}, {"speed": 1}]));
        assert!(derive_location(&msg, &device(), Utc::now()).is_none());
    }

    #[test]
    fn test_zero_coordinates_yield_no_location() {
        let msg = message(json!([{"latitude": 0}, {"longitude": "20"}]));
        assert!(derive_location(&msg, &device(), Utc::now()).is_none());

        let msg = message(json!([{"latitude": "0.0"}, {"longitude": "0"}]));
        assert!(derive_location(&msg, &device(), Utc::now()).is_none());
    }

    #[test]
    fn test_no_readings_yield_no_location() {
        let msg = message(json!([]));
        assert!(derive_location(&msg, &device(), Utc::now()).is_none());
    }

    #[test]
    fn test_recorded_time_comes_from_message() {
        let msg = message(json!([{"latitude": 1}, {"longitude": 1}]));
        let record = derive_location(&msg, &device(), Utc::now()).unwrap();
        assert_eq!(record.recorded_time, msg.receive_time);
    }
}
