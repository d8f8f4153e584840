use chrono::{DateTime, Utc};

/// Identifier used when the request path does not carry a usable sensor id.
pub const UNKNOWN_SENSOR_ID: &str = "null";

/// One reading as reported by an AirGradient monitor.
///
/// Every value is optional on the wire and decodes to zero when absent, so a
/// missing field cannot be told apart from a genuine zero reading.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Measures {
    pub wifi: i64,
    pub co2: i64,
    pub pm01: i64,
    pub pm02: i64,
    pub pm10: i64,
    pub pm003_count: i64,
    pub tvoc_index: i64,
    pub nox_index: i64,
    pub temperature: f64,
    pub humidity: i64,
}

/// A decoded reading stamped with the sensor identity and the receipt time.
///
/// Points are moved from the HTTP handler through the handoff queue into the
/// batch writer and are never mutated along the way.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub sensor_id: String,
    pub observed_at: DateTime<Utc>,
    pub measures: Measures,
}

impl Point {
    pub fn new(sensor_id: impl Into<String>, observed_at: DateTime<Utc>, measures: Measures) -> Self {
        let sensor_id = sensor_id.into();
        let sensor_id = if sensor_id.is_empty() {
            UNKNOWN_SENSOR_ID.to_string()
        } else {
            sensor_id
        };
        Self {
            sensor_id,
            observed_at,
            measures,
        }
    }
}
