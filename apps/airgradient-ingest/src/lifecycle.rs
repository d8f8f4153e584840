use crate::config::Config;
use crate::handoff::{self, PipelineStats};
use crate::http::{self, HttpState};
use crate::influx::{InfluxOptions, InfluxWriter};
use crate::store::{ErrorStream, WriteApi};
use crate::writer;
use anyhow::{Context, Result};
use futures::future;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

/// How long the error drain may keep logging after the final flush.
const ERROR_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Upper bound on the forced flush once shutdown starts.
pub const FORCED_FLUSH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Initializing,
    Serving,
    Draining,
    Terminated,
}

impl Phase {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Phase::Initializing,
            1 => Phase::Serving,
            2 => Phase::Draining,
            _ => Phase::Terminated,
        }
    }
}

#[derive(Debug)]
pub struct PhaseTracker(AtomicU8);

impl PhaseTracker {
    pub fn new() -> Self {
        Self(AtomicU8::new(Phase::Initializing as u8))
    }

    pub fn get(&self) -> Phase {
        Phase::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, phase: Phase) {
        let previous = Phase::from_u8(self.0.swap(phase as u8, Ordering::AcqRel));
        tracing::info!(from = ?previous, to = ?phase, "lifecycle transition");
    }
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub queue_capacity: usize,
    pub measurement: String,
    pub flush_timeout: Duration,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            queue_capacity: config.queue_capacity(),
            measurement: config.measurement(),
            flush_timeout: FORCED_FLUSH_TIMEOUT,
        }
    }
}

/// Validates the store settings, builds the InfluxDB writer, binds the
/// listener and serves until SIGINT/SIGTERM.
pub async fn run(config: Config) -> Result<()> {
    let phase = Arc::new(PhaseTracker::new());

    let options = InfluxOptions::from_config(&config)
        .context("failed to initialize InfluxDB connection")?;
    let (api, errors) =
        InfluxWriter::spawn(options).context("failed to initialize InfluxDB connection")?;

    let listener = TcpListener::bind(&config.server.listen_addr)
        .await
        .with_context(|| format!("failed to bind listener on {}", config.server.listen_addr))?;

    serve(
        listener,
        PipelineSettings::from_config(&config),
        api,
        errors,
        phase,
        shutdown_signal(),
    )
    .await
}

/// Runs the pipeline on an already bound listener until `shutdown` resolves
/// or the HTTP server stops, then force-flushes the store client.
///
/// Points still sitting in the handoff queue at that moment are not drained.
pub async fn serve<W, F>(
    listener: TcpListener,
    settings: PipelineSettings,
    api: W,
    errors: ErrorStream,
    phase: Arc<PhaseTracker>,
    shutdown: F,
) -> Result<()>
where
    W: WriteApi,
    F: Future<Output = ()> + Send,
{
    let stats = Arc::new(PipelineStats::new());
    let (handoff_tx, handoff_rx) = handoff::channel(settings.queue_capacity, stats.clone());

    let writer_handle = tokio::spawn(writer::run_batch_writer(
        handoff_rx,
        api.clone(),
        settings.measurement,
        stats.clone(),
    ));
    let drain_handle = tokio::spawn(writer::drain_errors(errors, stats));

    let app = http::router(HttpState {
        handoff: handoff_tx,
        phase: phase.clone(),
    });
    let addr = listener.local_addr().context("listener has no local address")?;
    let mut http_handle = tokio::spawn(async move { axum::serve(listener, app).await });
    tracing::info!(bind = %addr, "listening");
    phase.set(Phase::Serving);

    tokio::select! {
        _ = shutdown => {
            tracing::info!(op = "main", "caught signal, flushing data to InfluxDB");
        }
        res = &mut http_handle => {
            match res {
                Ok(Ok(())) => tracing::warn!("http server stopped"),
                Ok(Err(err)) => tracing::error!(error = %err, "failed to run http server"),
                Err(err) => tracing::error!(error = %err, "http server task failed"),
            }
        }
    }

    phase.set(Phase::Draining);
    if tokio::time::timeout(settings.flush_timeout, api.flush())
        .await
        .is_err()
    {
        tracing::error!(
            timeout_ms = settings.flush_timeout.as_millis() as u64,
            "final flush did not finish; buffered points may be lost"
        );
    }

    http_handle.abort();
    writer_handle.abort();
    let _ = writer_handle.await;
    drop(api);
    if tokio::time::timeout(ERROR_DRAIN_GRACE, drain_handle).await.is_err() {
        tracing::warn!("error drain still running at exit; abandoning it");
    }

    phase.set(Phase::Terminated);
    Ok(())
}

/// Resolves on SIGINT, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to install SIGINT handler");
            future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGTERM handler");
                future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("SIGINT received"),
        _ = terminate => tracing::info!("SIGTERM received"),
    }
}
