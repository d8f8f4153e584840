use crate::handoff::{HandoffSender, StatsSnapshot};
use crate::lifecycle::{Phase, PhaseTracker};
use crate::point::{Measures, Point, UNKNOWN_SENSOR_ID};
use axum::extract::rejection::{BytesRejection, PathRejection};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct HttpState {
    pub handoff: HandoffSender,
    pub phase: Arc<PhaseTracker>,
}

#[derive(Debug, Error)]
pub enum IngressError {
    #[error("cannot read body")]
    UnreadableBody(#[source] BytesRejection),
    #[error("failed to unmarshal")]
    Malformed(#[source] serde_json::Error),
    #[error("pipeline unavailable")]
    PipelineClosed,
}

impl IntoResponse for IngressError {
    fn into_response(self) -> Response {
        let status = match self {
            IngressError::UnreadableBody(_) | IngressError::Malformed(_) => StatusCode::BAD_REQUEST,
            IngressError::PipelineClosed => StatusCode::SERVICE_UNAVAILABLE,
        };
        (status, self.to_string()).into_response()
    }
}

/// Body pushed by AirGradient monitors, e.g.
/// `{"wifi":-64,"rco2":419,"pm01":4,"pm02":7,"pm10":7,"pm003_count":834,
/// "tvoc_index":3,"nox_index":2,"atmp":32.07,"rhum":56}`.
///
/// Absent and `null` values read as zero; unknown keys are ignored.
#[derive(Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct AirGradientPayload {
    pub wifi: Option<i64>,
    pub rco2: Option<i64>,
    pub pm01: Option<i64>,
    pub pm02: Option<i64>,
    pub pm10: Option<i64>,
    pub pm003_count: Option<i64>,
    pub tvoc_index: Option<i64>,
    pub nox_index: Option<i64>,
    pub atmp: Option<f64>,
    pub rhum: Option<i64>,
}

impl From<AirGradientPayload> for Measures {
    fn from(p: AirGradientPayload) -> Self {
        Measures {
            wifi: p.wifi.unwrap_or_default(),
            co2: p.rco2.unwrap_or_default(),
            pm01: p.pm01.unwrap_or_default(),
            pm02: p.pm02.unwrap_or_default(),
            pm10: p.pm10.unwrap_or_default(),
            pm003_count: p.pm003_count.unwrap_or_default(),
            tvoc_index: p.tvoc_index.unwrap_or_default(),
            nox_index: p.nox_index.unwrap_or_default(),
            temperature: p.atmp.unwrap_or_default(),
            humidity: p.rhum.unwrap_or_default(),
        }
    }
}

impl From<Measures> for AirGradientPayload {
    fn from(m: Measures) -> Self {
        AirGradientPayload {
            wifi: Some(m.wifi),
            rco2: Some(m.co2),
            pm01: Some(m.pm01),
            pm02: Some(m.pm02),
            pm10: Some(m.pm10),
            pm003_count: Some(m.pm003_count),
            tvoc_index: Some(m.tvoc_index),
            nox_index: Some(m.nox_index),
            atmp: Some(m.temperature),
            rhum: Some(m.humidity),
        }
    }
}

pub fn decode_measures(body: &[u8]) -> Result<Measures, serde_json::Error> {
    let payload: Option<AirGradientPayload> = serde_json::from_slice(body)?;
    Ok(payload.unwrap_or_default().into())
}

/// The path segment has the form `<type>:<id>`; anything else maps to the
/// sentinel id.
pub fn resolve_sensor_id(segment: Option<&str>) -> String {
    let Some(segment) = segment else {
        return UNKNOWN_SENSOR_ID.to_string();
    };
    let parts: Vec<&str> = segment.split(':').collect();
    match parts.as_slice() {
        [_, id] if !id.is_empty() => id.to_string(),
        _ => UNKNOWN_SENSOR_ID.to_string(),
    }
}

async fn post_measures(
    State(state): State<HttpState>,
    path: Result<Path<String>, PathRejection>,
    body: Result<Bytes, BytesRejection>,
) -> Result<StatusCode, IngressError> {
    let body = body.map_err(|err| {
        tracing::error!(error = %err, "cannot read body");
        IngressError::UnreadableBody(err)
    })?;

    let measures = decode_measures(&body).map_err(|err| {
        tracing::error!(error = %err, "failed to unmarshal");
        IngressError::Malformed(err)
    })?;

    let segment = path.ok().map(|Path(segment)| segment);
    let sensor_id = resolve_sensor_id(segment.as_deref());
    let point = Point::new(sensor_id, Utc::now(), measures);

    state.handoff.send(point).await.map_err(|err| {
        tracing::warn!(error = %err, "dropping point; pipeline is shutting down");
        IngressError::PipelineClosed
    })?;
    Ok(StatusCode::OK)
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    state: Phase,
    #[serde(flatten)]
    stats: StatsSnapshot,
}

async fn get_status(State(state): State<HttpState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        state: state.phase.get(),
        stats: state.handoff.stats().snapshot(),
    })
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/status", get(get_status))
        .route("/sensors/{id}/measures", post(post_measures))
        .with_state(state)
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(TraceLayer::new_for_http())
}
