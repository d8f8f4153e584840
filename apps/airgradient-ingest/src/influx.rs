use crate::config::{Auth, Config, WriteDestination};
use crate::store::{ErrorStream, StoreError, StorePoint, WriteApi};
use reqwest::{Client, Url};
use std::collections::VecDeque;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, Instant, MissedTickBehavior};

/// Upper bound on the backoff between two attempts of the same batch.
const MAX_RETRY_INTERVAL: Duration = Duration::from_secs(125);

#[derive(Debug, Clone)]
pub struct InfluxOptions {
    pub url: String,
    pub auth: Auth,
    pub organization: String,
    pub destination: WriteDestination,
    pub skip_verify_ssl: bool,
    pub flush_interval: Duration,
    pub batch_size: usize,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
}

impl InfluxOptions {
    pub fn from_config(config: &Config) -> Result<Self, crate::config::ConfigError> {
        Ok(Self {
            url: config.influxdb.address.clone(),
            auth: config.auth(),
            organization: config.influxdb.organization.clone(),
            destination: config.write_destination()?,
            skip_verify_ssl: config.influxdb.skip_verify_ssl,
            flush_interval: config.flush_interval(),
            batch_size: config.batch_size(),
            request_timeout: config.request_timeout(),
            retry: RetryPolicy {
                max_retries: config.max_retries(),
                retry_interval: config.retry_interval(),
                buffer_limit: config.retry_buffer_limit(),
            },
        })
    }
}

/// How failed batches are retried: up to `max_retries` further attempts,
/// `retry_interval * 2^(attempt - 1)` apart, with at most `buffer_limit`
/// lines waiting at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_interval: Duration,
    pub buffer_limit: usize,
}

impl RetryPolicy {
    fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.retry_interval
            .saturating_mul(factor)
            .min(MAX_RETRY_INTERVAL)
    }
}

#[derive(Debug)]
enum WriteCommand {
    Line(String),
    Flush(oneshot::Sender<()>),
}

/// Handle to the background task that batches line protocol and posts it to
/// `/api/v2/write`.
#[derive(Clone)]
pub struct InfluxWriter {
    tx: mpsc::UnboundedSender<WriteCommand>,
}

impl InfluxWriter {
    /// Builds the HTTP client and spawns the flush task. Must be called from
    /// within a tokio runtime.
    pub fn spawn(options: InfluxOptions) -> Result<(Self, ErrorStream), StoreError> {
        let write_url = write_url(&options)?;
        let client = Client::builder()
            .timeout(options.request_timeout)
            .danger_accept_invalid_certs(options.skip_verify_ssl)
            .build()
            .map_err(StoreError::Client)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let (error_tx, error_rx) = mpsc::unbounded_channel();
        let target = WriteTarget {
            client,
            url: write_url,
            token: options.auth.token(),
        };
        let batch_size = options.batch_size.max(1);

        tokio::spawn(run_writer(
            rx,
            Batcher {
                target,
                errors: error_tx,
                policy: options.retry,
                buffer: Vec::with_capacity(batch_size),
                retries: VecDeque::new(),
                retry_lines: 0,
            },
            batch_size,
            options.flush_interval,
        ));

        Ok((Self { tx }, error_rx))
    }
}

impl WriteApi for InfluxWriter {
    fn write_point(&self, point: StorePoint) {
        if self.tx.send(WriteCommand::Line(point.to_line_protocol())).is_err() {
            tracing::warn!("influx writer stopped; dropping point");
        }
    }

    async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(WriteCommand::Flush(tx)).is_err() {
            return;
        }
        let _ = rx.await;
    }
}

fn write_url(options: &InfluxOptions) -> Result<Url, StoreError> {
    let invalid = |reason: String| StoreError::InvalidUrl {
        url: options.url.clone(),
        reason,
    };
    let base = Url::parse(options.url.trim()).map_err(|err| invalid(err.to_string()))?;
    if base.cannot_be_a_base() {
        return Err(invalid("not a base url".to_string()));
    }
    let mut url = base
        .join(&format!("{}/api/v2/write", base.path().trim_end_matches('/')))
        .map_err(|err| invalid(err.to_string()))?;
    url.query_pairs_mut()
        .append_pair("org", &options.organization)
        .append_pair("bucket", &options.destination.bucket())
        .append_pair("precision", "ns");
    Ok(url)
}

struct WriteTarget {
    client: Client,
    url: Url,
    token: Option<String>,
}

/// A posted body together with its retry bookkeeping.
struct Batch {
    body: String,
    lines: usize,
    attempts: u32,
    retry_at: Instant,
}

/// State owned by the writer task: the open batch and the failed batches
/// waiting for another attempt.
struct Batcher {
    target: WriteTarget,
    errors: mpsc::UnboundedSender<StoreError>,
    policy: RetryPolicy,
    buffer: Vec<String>,
    retries: VecDeque<Batch>,
    retry_lines: usize,
}

impl Batcher {
    async fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let batch = Batch {
            lines: self.buffer.len(),
            body: self.buffer.drain(..).collect::<Vec<_>>().join("\n"),
            attempts: 0,
            retry_at: Instant::now(),
        };
        self.post(batch).await;
    }

    /// Re-posts queued batches whose backoff has elapsed, or all of them
    /// when `force` is set.
    async fn retry(&mut self, force: bool) {
        let now = Instant::now();
        let queued = std::mem::take(&mut self.retries);
        self.retry_lines = 0;
        for batch in queued {
            if force || batch.retry_at <= now {
                self.post(batch).await;
            } else {
                self.retry_lines += batch.lines;
                self.retries.push_back(batch);
            }
        }
    }

    fn next_retry(&self) -> Option<Instant> {
        self.retries.iter().map(|batch| batch.retry_at).min()
    }

    async fn post(&mut self, mut batch: Batch) {
        let err = match post_batch(&self.target, &batch.body).await {
            Ok(()) => {
                tracing::debug!(
                    len = batch.lines,
                    attempts = batch.attempts,
                    "flushed points to influxdb"
                );
                return;
            }
            Err(err) => err,
        };
        let retryable = err.is_retryable();
        let _ = self.errors.send(err);

        if !retryable || batch.attempts >= self.policy.max_retries {
            tracing::warn!(len = batch.lines, attempts = batch.attempts, "giving up on batch");
            return;
        }
        batch.attempts += 1;
        batch.retry_at = Instant::now() + self.policy.delay(batch.attempts);
        self.retry_lines += batch.lines;
        self.retries.push_back(batch);

        while self.retry_lines > self.policy.buffer_limit {
            let Some(oldest) = self.retries.pop_front() else {
                break;
            };
            self.retry_lines -= oldest.lines;
            tracing::warn!(len = oldest.lines, "retry buffer full; discarding oldest batch");
        }
    }
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

async fn run_writer(
    mut rx: mpsc::UnboundedReceiver<WriteCommand>,
    mut batcher: Batcher,
    batch_size: usize,
    flush_interval: Duration,
) {
    let mut ticker = tokio::time::interval(flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        let next_retry = batcher.next_retry();
        tokio::select! {
            _ = ticker.tick() => {
                batcher.flush().await;
            }
            _ = until(next_retry) => {
                batcher.retry(false).await;
            }
            cmd = rx.recv() => {
                match cmd {
                    Some(WriteCommand::Line(line)) => {
                        batcher.buffer.push(line);
                        if batcher.buffer.len() >= batch_size {
                            batcher.flush().await;
                        }
                    }
                    Some(WriteCommand::Flush(done)) => {
                        batcher.retry(true).await;
                        batcher.flush().await;
                        let _ = done.send(());
                    }
                    None => {
                        batcher.retry(true).await;
                        batcher.flush().await;
                        break;
                    }
                }
            }
        }
    }
}

async fn post_batch(target: &WriteTarget, body: &str) -> Result<(), StoreError> {
    let mut request = target
        .client
        .post(target.url.clone())
        .header("Content-Type", "text/plain; charset=utf-8")
        .body(body.to_owned());
    if let Some(token) = &target.token {
        request = request.header("Authorization", format!("Token {token}"));
    }

    let response = request.send().await.map_err(StoreError::Request)?;
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    Err(StoreError::Rejected {
        status: status.as_u16(),
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FieldValue;
    use axum::extract::{RawQuery, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::Router;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone)]
    struct CapturedWrite {
        query: Option<String>,
        authorization: Option<String>,
        body: String,
    }

    #[derive(Clone)]
    struct FakeInflux {
        writes: Arc<Mutex<Vec<CapturedWrite>>>,
        failures_left: Arc<AtomicUsize>,
        status: StatusCode,
    }

    async fn capture(
        State(state): State<FakeInflux>,
        RawQuery(query): RawQuery,
        headers: HeaderMap,
        body: String,
    ) -> StatusCode {
        let authorization = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        state.writes.lock().unwrap().push(CapturedWrite {
            query,
            authorization,
            body,
        });
        let failing = state
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            StatusCode::SERVICE_UNAVAILABLE
        } else {
            state.status
        }
    }

    /// Answers the first `failures` writes with 503 and every later one with
    /// `status`.
    async fn start_fake_failing(
        failures: usize,
        status: StatusCode,
    ) -> (String, Arc<Mutex<Vec<CapturedWrite>>>) {
        let writes = Arc::new(Mutex::new(Vec::new()));
        let app = Router::new()
            .route("/api/v2/write", post(capture))
            .with_state(FakeInflux {
                writes: writes.clone(),
                failures_left: Arc::new(AtomicUsize::new(failures)),
                status,
            });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        (format!("http://{addr}"), writes)
    }

    async fn start_fake(status: StatusCode) -> (String, Arc<Mutex<Vec<CapturedWrite>>>) {
        start_fake_failing(0, status).await
    }

    async fn wait_for_writes(writes: &Arc<Mutex<Vec<CapturedWrite>>>, expected: usize) {
        for _ in 0..200 {
            if writes.lock().unwrap().len() >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn options(url: String, auth: Auth, destination: WriteDestination) -> InfluxOptions {
        InfluxOptions {
            url,
            auth,
            organization: "home".to_string(),
            destination,
            skip_verify_ssl: false,
            flush_interval: Duration::from_secs(3600),
            batch_size: 100,
            request_timeout: Duration::from_secs(5),
            retry: RetryPolicy {
                max_retries: 3,
                retry_interval: Duration::from_millis(50),
                buffer_limit: 1000,
            },
        }
    }

    fn point(id: &str, co2: i64) -> StorePoint {
        StorePoint {
            measurement: "air_quality".to_string(),
            tags: vec![("id".to_string(), id.to_string())],
            fields: vec![("co2", FieldValue::Integer(co2))],
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn builds_write_url_for_both_destinations() {
        let v2 = options(
            "http://localhost:8086/".to_string(),
            Auth::None,
            WriteDestination::Bucket("air".to_string()),
        );
        assert_eq!(
            write_url(&v2).unwrap().as_str(),
            "http://localhost:8086/api/v2/write?org=home&bucket=air&precision=ns"
        );

        let v1 = options(
            "https://influx.example.com/proxy".to_string(),
            Auth::None,
            WriteDestination::DatabaseRetention {
                database: "sensors".to_string(),
                retention_policy: "autogen".to_string(),
            },
        );
        assert_eq!(
            write_url(&v1).unwrap().as_str(),
            "https://influx.example.com/proxy/api/v2/write?org=home&bucket=sensors%2Fautogen&precision=ns"
        );
    }

    #[test]
    fn rejects_unparseable_url() {
        let opts = options(
            "not a url".to_string(),
            Auth::None,
            WriteDestination::Bucket("air".to_string()),
        );
        assert!(matches!(write_url(&opts), Err(StoreError::InvalidUrl { .. })));
    }

    #[tokio::test]
    async fn explicit_flush_posts_buffered_lines() {
        let (url, writes) = start_fake(StatusCode::NO_CONTENT).await;
        let (writer, _errors) = InfluxWriter::spawn(options(
            url,
            Auth::Token("secret".to_string()),
            WriteDestination::Bucket("air".to_string()),
        ))
        .unwrap();

        writer.write_point(point("office-1", 419));
        writer.write_point(point("office-2", 500));
        assert!(writes.lock().unwrap().is_empty());

        writer.flush().await;

        let writes = writes.lock().unwrap();
        assert_eq!(writes.len(), 1);
        let lines: Vec<&str> = writes[0].body.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("air_quality,id=office-1 co2=419i "));
        assert!(lines[1].starts_with("air_quality,id=office-2 co2=500i "));
        assert_eq!(writes[0].authorization.as_deref(), Some("Token secret"));
        assert_eq!(
            writes[0].query.as_deref(),
            Some("org=home&bucket=air&precision=ns")
        );
    }

    #[tokio::test]
    async fn flushes_when_batch_is_full() {
        let (url, writes) = start_fake(StatusCode::NO_CONTENT).await;
        let mut opts = options(url, Auth::None, WriteDestination::Bucket("air".to_string()));
        opts.batch_size = 2;
        let (writer, _errors) = InfluxWriter::spawn(opts).unwrap();

        writer.write_point(point("a", 1));
        writer.write_point(point("b", 2));
        writer.write_point(point("c", 3));
        writer.flush().await;

        let writes = writes.lock().unwrap();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].body.lines().count(), 2);
        assert_eq!(writes[1].body.lines().count(), 1);
        assert!(writes[0].authorization.is_none());
    }

    #[tokio::test]
    async fn flushes_on_interval() {
        let (url, writes) = start_fake(StatusCode::NO_CONTENT).await;
        let mut opts = options(url, Auth::None, WriteDestination::Bucket("air".to_string()));
        opts.flush_interval = Duration::from_millis(50);
        let (writer, _errors) = InfluxWriter::spawn(opts).unwrap();

        writer.write_point(point("a", 1));
        for _ in 0..100 {
            if !writes.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(writes.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rejected_write_is_reported_on_error_stream() {
        let (url, writes) = start_fake(StatusCode::UNAUTHORIZED).await;
        let (writer, mut errors) = InfluxWriter::spawn(options(
            url,
            Auth::Basic {
                username: "admin".to_string(),
                password: "wrong".to_string(),
            },
            WriteDestination::Bucket("air".to_string()),
        ))
        .unwrap();

        writer.write_point(point("a", 1));
        writer.flush().await;

        match errors.recv().await {
            Some(StoreError::Rejected { status, .. }) => assert_eq!(status, 401),
            other => panic!("expected rejected write, got {other:?}"),
        }

        // 401 is not transient, so the batch is not attempted again.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(writes.lock().unwrap().len(), 1);
    }

    #[test]
    fn retry_delay_doubles_up_to_the_cap() {
        let policy = RetryPolicy {
            max_retries: 10,
            retry_interval: Duration::from_secs(5),
            buffer_limit: 1,
        };
        assert_eq!(policy.delay(1), Duration::from_secs(5));
        assert_eq!(policy.delay(2), Duration::from_secs(10));
        assert_eq!(policy.delay(3), Duration::from_secs(20));
        assert_eq!(policy.delay(8), MAX_RETRY_INTERVAL);
        assert_eq!(policy.delay(40), MAX_RETRY_INTERVAL);
    }

    #[tokio::test]
    async fn failed_batch_is_retried_until_accepted() {
        let (url, writes) = start_fake_failing(1, StatusCode::NO_CONTENT).await;
        let (writer, mut errors) = InfluxWriter::spawn(options(
            url,
            Auth::None,
            WriteDestination::Bucket("air".to_string()),
        ))
        .unwrap();

        writer.write_point(point("office-1", 419));
        writer.flush().await;
        match errors.recv().await {
            Some(StoreError::Rejected { status, .. }) => assert_eq!(status, 503),
            other => panic!("expected rejected write, got {other:?}"),
        }

        wait_for_writes(&writes, 2).await;
        let writes = writes.lock().unwrap();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].body, writes[1].body);
        assert!(writes[1].body.starts_with("air_quality,id=office-1 co2=419i "));
        assert!(errors.try_recv().is_err());
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let (url, writes) = start_fake(StatusCode::BAD_GATEWAY).await;
        let mut opts = options(url, Auth::None, WriteDestination::Bucket("air".to_string()));
        opts.retry.max_retries = 2;
        let (writer, mut errors) = InfluxWriter::spawn(opts).unwrap();

        writer.write_point(point("a", 1));
        writer.flush().await;
        for _ in 0..3 {
            assert!(matches!(
                errors.recv().await,
                Some(StoreError::Rejected { status: 502, .. })
            ));
        }

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(writes.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn retry_buffer_discards_oldest_batch_when_full() {
        let (url, writes) = start_fake_failing(2, StatusCode::NO_CONTENT).await;
        let mut opts = options(url, Auth::None, WriteDestination::Bucket("air".to_string()));
        opts.batch_size = 1;
        opts.retry.retry_interval = Duration::from_secs(3600);
        opts.retry.buffer_limit = 1;
        let (writer, _errors) = InfluxWriter::spawn(opts).unwrap();

        writer.write_point(point("a", 1));
        writer.write_point(point("b", 2));
        writer.flush().await;

        let writes = writes.lock().unwrap();
        assert_eq!(writes.len(), 3);
        assert!(writes[2].body.contains("id=b "));
    }

    #[tokio::test]
    async fn unresponsive_store_times_out_instead_of_hanging() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let mut opts = options(url, Auth::None, WriteDestination::Bucket("air".to_string()));
        opts.request_timeout = Duration::from_millis(200);
        opts.retry.max_retries = 0;
        let (writer, mut errors) = InfluxWriter::spawn(opts).unwrap();

        writer.write_point(point("a", 1));
        tokio::time::timeout(Duration::from_secs(5), writer.flush())
            .await
            .expect("flush must finish once the request times out");
        assert!(matches!(errors.recv().await, Some(StoreError::Request(_))));
    }
}
