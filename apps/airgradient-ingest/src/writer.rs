use crate::handoff::{HandoffReceiver, PipelineStats};
use crate::point::Point;
use crate::store::{ErrorStream, FieldValue, StorePoint, WriteApi};
use std::sync::Arc;

pub const MEASUREMENT: &str = "air_quality";

pub fn to_store_point(measurement: &str, point: Point) -> StorePoint {
    let m = point.measures;
    StorePoint {
        measurement: measurement.to_string(),
        tags: vec![("id".to_string(), point.sensor_id)],
        fields: vec![
            ("wifi", FieldValue::Integer(m.wifi)),
            ("co2", FieldValue::Integer(m.co2)),
            ("pm1", FieldValue::Integer(m.pm01)),
            ("pm25", FieldValue::Integer(m.pm02)),
            ("pm10", FieldValue::Integer(m.pm10)),
            ("pm003", FieldValue::Integer(m.pm003_count)),
            ("tvoc", FieldValue::Integer(m.tvoc_index)),
            ("nox", FieldValue::Integer(m.nox_index)),
            ("temp", FieldValue::Float(m.temperature)),
            ("rel_humidity", FieldValue::Integer(m.humidity)),
        ],
        timestamp: point.observed_at,
    }
}

/// Sole consumer of the handoff queue. Returns once the queue is closed and
/// empty; individual write failures never stop it.
pub async fn run_batch_writer<W: WriteApi>(
    mut rx: HandoffReceiver,
    api: W,
    measurement: String,
    stats: Arc<PipelineStats>,
) {
    while let Some(point) = rx.recv().await {
        tracing::debug!(sensor = %point.sensor_id, "submitting point");
        api.write_point(to_store_point(&measurement, point));
        stats.record_written();
    }
    tracing::info!("handoff queue closed; batch writer stopping");
}

/// Logs asynchronous write failures until the store client goes away.
pub async fn drain_errors(mut errors: ErrorStream, stats: Arc<PipelineStats>) {
    while let Some(err) = errors.recv().await {
        stats.record_write_error();
        tracing::error!(op = "influx.write", error = %err, "encountered error on writing to InfluxDB");
    }
}
