//! Contract between the batch writer and the time-series store client.
//!
//! Writes are fire-and-forget: `write_point` only hands the point to the
//! client's buffer, and failures surface later on the error stream returned
//! alongside the client.

use chrono::{DateTime, Utc};
use std::future::Future;
use thiserror::Error;
use tokio::sync::mpsc;

/// Asynchronous write failures reported by a store client.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid store url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("failed to build http client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("write request failed: {0}")]
    Request(#[source] reqwest::Error),
    #[error("store rejected write ({status}): {body}")]
    Rejected { status: u16, body: String },
}

impl StoreError {
    /// Transport failures, throttling and server errors are worth another
    /// attempt; any other rejection will fail the same way again.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Request(_) => true,
            StoreError::Rejected { status, .. } => *status == 429 || *status >= 500,
            StoreError::InvalidUrl { .. } | StoreError::Client(_) => false,
        }
    }
}

pub type ErrorStream = mpsc::UnboundedReceiver<StoreError>;

/// Narrow view of a store client: buffered writes plus an explicit flush.
pub trait WriteApi: Clone + Send + Sync + 'static {
    /// Queue a point for the next batch. Never blocks on the network.
    fn write_point(&self, point: StorePoint);

    /// Push everything buffered so far and resolve once the attempt is done.
    fn flush(&self) -> impl Future<Output = ()> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue {
    Integer(i64),
    Float(f64),
}

impl FieldValue {
    fn write_line_protocol(&self, out: &mut String) {
        match self {
            FieldValue::Integer(v) => {
                out.push_str(&v.to_string());
                out.push('i');
            }
            FieldValue::Float(v) => out.push_str(&v.to_string()),
        }
    }
}

/// One store write: measurement, tags, fields and a timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct StorePoint {
    pub measurement: String,
    pub tags: Vec<(String, String)>,
    pub fields: Vec<(&'static str, FieldValue)>,
    pub timestamp: DateTime<Utc>,
}

impl StorePoint {
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn field(&self, key: &str) -> Option<FieldValue> {
        self.fields
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| *v)
    }

    /// Render as InfluxDB line protocol with a nanosecond timestamp.
    ///
    /// ```text
    /// measurement,tag=value field=1i,other=2.5 1700000000000000000
    /// ```
    pub fn to_line_protocol(&self) -> String {
        let mut line = escape(&self.measurement, &[',', ' ']);

        let mut tags: Vec<_> = self.tags.iter().filter(|(_, v)| !v.is_empty()).collect();
        tags.sort_by(|a, b| a.0.cmp(&b.0));
        for (key, value) in tags {
            line.push(',');
            line.push_str(&escape(key, &[',', '=', ' ']));
            line.push('=');
            line.push_str(&escape(value, &[',', '=', ' ']));
        }

        line.push(' ');
        for (i, (key, value)) in self.fields.iter().enumerate() {
            if i > 0 {
                line.push(',');
            }
            line.push_str(&escape(key, &[',', '=', ' ']));
            line.push('=');
            value.write_line_protocol(&mut line);
        }

        if let Some(nanos) = self.timestamp.timestamp_nanos_opt() {
            line.push(' ');
            line.push_str(&nanos.to_string());
        }
        line
    }
}

fn escape(raw: &str, special: &[char]) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if special.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
