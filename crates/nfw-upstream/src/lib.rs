//! PIHPS grid client: parameterized fetches with retry/backoff, request pacing,
//! typed outcomes, and an optional immutable archive of raw payloads.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nfw_core::{IngestTuple, ReportType};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, REFERER};
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "nfw-upstream";

pub const DEFAULT_GRID_URL: &str =
    "https://www.bi.go.id/hargapangan/WebSite/TabelHarga/GetGridDataKomoditas";
pub const DEFAULT_REFERER: &str =
    "https://www.bi.go.id/hargapangan/TabelHarga/PasarTradisionalDaerah";

#[derive(Debug, Clone)]
pub struct ArchivedPayload {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Hash-addressed, write-once store for upstream response bodies.
#[derive(Debug, Clone)]
pub struct RawArchive {
    root: PathBuf,
}

impl RawArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    /// `<YYYYMMDD>/<series code>/mt<market>/<sha256>.json`
    pub fn payload_relative_path(
        &self,
        fetched_at: DateTime<Utc>,
        tuple: &IngestTuple,
        content_hash: &str,
    ) -> PathBuf {
        PathBuf::from(fetched_at.format("%Y%m%d").to_string())
            .join(tuple.target.upstream_code())
            .join(format!("mt{}", tuple.market_type.code()))
            .join(format!("{content_hash}.json"))
    }

    pub async fn store_payload(
        &self,
        fetched_at: DateTime<Utc>,
        tuple: &IngestTuple,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedPayload> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.payload_relative_path(fetched_at, tuple, &content_hash);
        let absolute_path = self.root.join(&relative_path);
        let archived = |deduplicated| ArchivedPayload {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        let Some(parent) = absolute_path.parent() else {
            anyhow::bail!("archive path {} has no parent", absolute_path.display());
        };
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating archive directory {}", parent.display()))?;

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?
        {
            return Ok(archived(true));
        }

        let temp_path = parent.join(format!(".{}.partial", Uuid::new_v4()));
        write_new_file(&temp_path, bytes).await?;

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(archived(false)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(archived(true))
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "renaming {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

async fn write_new_file(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(path)
        .await
        .with_context(|| format!("opening {}", path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing {}", path.display()))?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Timeouts, refused/reset connections and truncated bodies are transient.
pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, retry_index: usize) -> Duration {
        let exponent = u32::try_from(retry_index).unwrap_or(u32::MAX);
        let factor = 2u32.checked_pow(exponent).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Spaces upstream calls at least `min_interval` apart across all workers.
#[derive(Debug)]
pub struct RequestPacer {
    min_interval: Duration,
    next_slot: Mutex<Instant>,
}

impl RequestPacer {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            next_slot: Mutex::new(Instant::now()),
        }
    }

    pub async fn wait_turn(&self) {
        let slot = {
            let mut next = self.next_slot.lock().await;
            let slot = (*next).max(Instant::now());
            *next = slot + self.min_interval;
            slot
        };
        tokio::time::sleep_until(slot).await;
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub referer: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub concurrency: usize,
    pub backoff: BackoffPolicy,
    pub request_interval: Duration,
    pub max_window_days_daily: u32,
    pub max_window_days_monthly: u32,
    pub archive_dir: Option<PathBuf>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_GRID_URL.to_string(),
            referer: DEFAULT_REFERER.to_string(),
            timeout: Duration::from_secs(30),
            user_agent: None,
            concurrency: 4,
            backoff: BackoffPolicy::default(),
            request_interval: Duration::from_secs(1),
            max_window_days_daily: 31,
            max_window_days_monthly: 366,
            archive_dir: None,
        }
    }
}

impl UpstreamConfig {
    pub fn max_window_days(&self, report_type: ReportType) -> u32 {
        match report_type {
            ReportType::Daily => self.max_window_days_daily,
            ReportType::Monthly => self.max_window_days_monthly,
        }
    }
}

/// Successful grid payload: one JSON object per wide-format row.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub tuple: IngestTuple,
    pub fetched_at: DateTime<Utc>,
    pub status: u16,
    pub content_hash: String,
    pub rows: Vec<Map<String, Value>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum EmptyReason {
    NoData,
    Malformed(String),
}

/// HTTP 200 without usable rows. Not an error and never retried.
#[derive(Debug, Clone)]
pub struct EmptyResult {
    pub tuple: IngestTuple,
    pub reason: EmptyReason,
}

/// Terminal fetch failure for a tuple, after any retries were spent.
#[derive(Debug, Clone)]
pub struct FetchFailure {
    pub tuple: IngestTuple,
    pub attempts: usize,
    pub retryable: bool,
    pub last_error: String,
}

#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Response(RawResponse),
    Empty(EmptyResult),
    Failure(FetchFailure),
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: StatusCode, url: String },
    #[error("window of {days} days exceeds the {max}-day upstream limit")]
    WindowTooLarge { days: i64, max: u32 },
}

impl FetchError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            FetchError::Request(err) => classify_reqwest_error(err),
            FetchError::HttpStatus { status, .. } => classify_status(*status),
            FetchError::WindowTooLarge { .. } => RetryDisposition::NonRetryable,
        }
    }
}

#[derive(Debug)]
struct RetriesExhausted {
    attempts: usize,
    error: FetchError,
}

/// The fetch seam the orchestrator drives; implemented over HTTP by [`PihpsClient`].
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn fetch(&self, tuple: &IngestTuple) -> FetchOutcome;
}

#[derive(Debug)]
pub struct PihpsClient {
    client: reqwest::Client,
    base_url: String,
    limit: Arc<Semaphore>,
    pacer: Option<RequestPacer>,
    backoff: BackoffPolicy,
    max_window_days_daily: u32,
    max_window_days_monthly: u32,
    archive: Option<RawArchive>,
}

impl PihpsClient {
    pub fn new(config: UpstreamConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/json, text/javascript, */*; q=0.01"),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("id-ID,id;q=0.9,en;q=0.8"));
        headers.insert(
            HeaderName::from_static("x-requested-with"),
            HeaderValue::from_static("XMLHttpRequest"),
        );
        headers.insert(
            REFERER,
            HeaderValue::from_str(&config.referer).context("invalid referer header")?,
        );

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;

        let pacer = (!config.request_interval.is_zero())
            .then(|| RequestPacer::new(config.request_interval));

        Ok(Self {
            client,
            base_url: config.base_url,
            limit: Arc::new(Semaphore::new(config.concurrency.max(1))),
            pacer,
            backoff: config.backoff,
            max_window_days_daily: config.max_window_days_daily,
            max_window_days_monthly: config.max_window_days_monthly,
            archive: config.archive_dir.map(RawArchive::new),
        })
    }

    pub fn request_params(tuple: &IngestTuple) -> Vec<(&'static str, String)> {
        vec![
            ("price_type_id", tuple.market_type.code().to_string()),
            ("comcat_id", tuple.target.upstream_code().to_string()),
            ("province_id", String::new()),
            ("regency_id", String::new()),
            ("showKota", "false".to_string()),
            ("showPasar", "false".to_string()),
            ("tipe_laporan", tuple.report_type.upstream_code().to_string()),
            ("start_date", tuple.window.start().format("%Y-%m-%d").to_string()),
            ("end_date", tuple.window.end().format("%Y-%m-%d").to_string()),
        ]
    }

    fn max_window_days(&self, report_type: ReportType) -> u32 {
        match report_type {
            ReportType::Daily => self.max_window_days_daily,
            ReportType::Monthly => self.max_window_days_monthly,
        }
    }

    async fn send_with_retries(
        &self,
        tuple: &IngestTuple,
    ) -> Result<(StatusCode, Vec<u8>), RetriesExhausted> {
        let params = Self::request_params(tuple);
        let mut attempts = 0usize;

        loop {
            attempts += 1;
            if let Some(pacer) = &self.pacer {
                pacer.wait_turn().await;
            }

            let error = match self.client.get(&self.base_url).query(&params).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let status = resp.status();
                    match resp.bytes().await {
                        Ok(body) => return Ok((status, body.to_vec())),
                        Err(err) => FetchError::Request(err),
                    }
                }
                Ok(resp) => FetchError::HttpStatus {
                    status: resp.status(),
                    url: resp.url().to_string(),
                },
                Err(err) => FetchError::Request(err),
            };

            let retry_index = attempts - 1;
            if error.disposition() == RetryDisposition::Retryable
                && retry_index < self.backoff.max_retries
            {
                let delay = self.backoff.delay_for_attempt(retry_index);
                warn!(
                    attempt = attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %error,
                    "transient upstream failure, backing off"
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            return Err(RetriesExhausted { attempts, error });
        }
    }

    async fn fetch_inner(&self, tuple: &IngestTuple) -> FetchOutcome {
        let max = self.max_window_days(tuple.report_type);
        if tuple.window.days() > i64::from(max) {
            let error = FetchError::WindowTooLarge {
                days: tuple.window.days(),
                max,
            };
            return FetchOutcome::Failure(FetchFailure {
                tuple: tuple.clone(),
                attempts: 0,
                retryable: false,
                last_error: error.to_string(),
            });
        }

        let _permit = match self.limit.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                return FetchOutcome::Failure(FetchFailure {
                    tuple: tuple.clone(),
                    attempts: 0,
                    retryable: false,
                    last_error: "upstream limiter closed".to_string(),
                })
            }
        };

        match self.send_with_retries(tuple).await {
            Ok((status, body)) => {
                let fetched_at = Utc::now();
                if let Some(archive) = &self.archive {
                    match archive.store_payload(fetched_at, tuple, &body).await {
                        Ok(stored) => debug!(
                            path = %stored.relative_path.display(),
                            deduplicated = stored.deduplicated,
                            "archived raw payload"
                        ),
                        Err(err) => warn!(error = %err, "failed to archive raw payload"),
                    }
                }
                interpret_body(tuple, fetched_at, status.as_u16(), &body)
            }
            Err(exhausted) => FetchOutcome::Failure(FetchFailure {
                tuple: tuple.clone(),
                attempts: exhausted.attempts,
                retryable: exhausted.error.disposition() == RetryDisposition::Retryable,
                last_error: exhausted.error.to_string(),
            }),
        }
    }
}

#[async_trait]
impl Upstream for PihpsClient {
    async fn fetch(&self, tuple: &IngestTuple) -> FetchOutcome {
        let span = info_span!("http_fetch", tuple = %tuple);
        self.fetch_inner(tuple).instrument(span).await
    }
}

/// Classify a 200 body: rows present, nothing there, or not a grid at all.
pub fn interpret_body(
    tuple: &IngestTuple,
    fetched_at: DateTime<Utc>,
    status: u16,
    body: &[u8],
) -> FetchOutcome {
    let empty = |reason| {
        FetchOutcome::Empty(EmptyResult {
            tuple: tuple.clone(),
            reason,
        })
    };

    let value: Value = match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(err) => return empty(EmptyReason::Malformed(format!("invalid json: {err}"))),
    };

    let rows = match value.get("data") {
        None | Some(Value::Null) => return empty(EmptyReason::NoData),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| item.as_object().cloned())
            .collect::<Vec<_>>(),
        Some(other) => {
            return empty(EmptyReason::Malformed(format!(
                "`data` is not an array: {}",
                json_type_name(other)
            )))
        }
    };

    if rows.is_empty() {
        return empty(EmptyReason::NoData);
    }

    FetchOutcome::Response(RawResponse {
        tuple: tuple.clone(),
        fetched_at,
        status,
        content_hash: RawArchive::sha256_hex(body),
        rows,
    })
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::NaiveDate;
    use nfw_core::{CommodityRef, DateWindow, MarketType, SeriesTarget};
    use tempfile::tempdir;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn tuple(days: u32) -> IngestTuple {
        let start = NaiveDate::from_ymd_opt(2025, 11, 1).unwrap();
        let end = start + chrono::Days::new(u64::from(days) - 1);
        IngestTuple {
            target: SeriesTarget::category(CommodityRef {
                code: "cat_1".into(),
                name: "Beras".into(),
                unit: "kg".into(),
                staple: true,
            }),
            market_type: MarketType::Traditional,
            report_type: ReportType::Daily,
            window: DateWindow::new(start, end).unwrap(),
        }
    }

    fn fetched_at() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-11-20T01:00:00Z")
            .expect("ts")
            .with_timezone(&Utc)
    }

    #[test]
    fn default_backoff_doubles_from_one_second_up_to_thirty() {
        let policy = BackoffPolicy::default();
        let delays: Vec<u64> = (0..7)
            .map(|retry| policy.delay_for_attempt(retry).as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn huge_retry_index_saturates_at_the_cap() {
        let policy = BackoffPolicy::default();
        // 2^32 overflows the u32 factor; usize::MAX overflows the exponent itself.
        assert_eq!(policy.delay_for_attempt(32), Duration::from_secs(30));
        assert_eq!(policy.delay_for_attempt(usize::MAX), Duration::from_secs(30));
    }

    #[test]
    fn server_errors_and_throttling_are_retryable() {
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
    }

    #[test]
    fn request_params_carry_series_market_and_window() {
        let params = PihpsClient::request_params(&tuple(2));
        let get = |key: &str| {
            params
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.as_str())
                .unwrap()
        };
        assert_eq!(get("comcat_id"), "cat_1");
        assert_eq!(get("price_type_id"), "1");
        assert_eq!(get("tipe_laporan"), "1");
        assert_eq!(get("start_date"), "2025-11-01");
        assert_eq!(get("end_date"), "2025-11-02");
        assert_eq!(get("province_id"), "");
    }

    #[test]
    fn body_with_rows_is_a_response() {
        let body = br#"{"data":[{"no":"","name":"Semua Provinsi","level":0},{"no":"1","name":"Aceh","level":1,"19/11/2025":"14,500"}]}"#;
        match interpret_body(&tuple(2), fetched_at(), 200, body) {
            FetchOutcome::Response(raw) => {
                assert_eq!(raw.rows.len(), 2);
                assert_eq!(raw.content_hash, RawArchive::sha256_hex(body));
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn empty_and_missing_data_are_no_data() {
        for body in [&br#"{"data":[]}"#[..], br#"{"data":null}"#, br#"{"other":1}"#] {
            match interpret_body(&tuple(2), fetched_at(), 200, body) {
                FetchOutcome::Empty(empty) => assert_eq!(empty.reason, EmptyReason::NoData),
                other => panic!("expected empty, got {other:?}"),
            }
        }
    }

    #[test]
    fn non_json_body_is_malformed_not_failure() {
        match interpret_body(&tuple(2), fetched_at(), 200, b"<html>maintenance</html>") {
            FetchOutcome::Empty(EmptyResult {
                reason: EmptyReason::Malformed(_),
                ..
            }) => {}
            other => panic!("expected malformed empty result, got {other:?}"),
        }
        match interpret_body(&tuple(2), fetched_at(), 200, br#"{"data":"oops"}"#) {
            FetchOutcome::Empty(EmptyResult {
                reason: EmptyReason::Malformed(detail),
                ..
            }) => assert!(detail.contains("string")),
            other => panic!("expected malformed empty result, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn oversized_window_fails_without_network() {
        let client = PihpsClient::new(UpstreamConfig {
            base_url: "http://127.0.0.1:9/unreachable".into(),
            request_interval: Duration::ZERO,
            ..Default::default()
        })
        .expect("client");

        match client.fetch(&tuple(40)).await {
            FetchOutcome::Failure(failure) => {
                assert_eq!(failure.attempts, 0);
                assert!(!failure.retryable);
                assert!(failure.last_error.contains("31-day"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn archive_deduplicates_identical_payloads() {
        let dir = tempdir().expect("tempdir");
        let archive = RawArchive::new(dir.path());
        let body = br#"{"data":[]}"#;

        let first = archive
            .store_payload(fetched_at(), &tuple(2), body)
            .await
            .expect("first store");
        let second = archive
            .store_payload(fetched_at(), &tuple(2), body)
            .await
            .expect("second store");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.relative_path.starts_with("20251120/cat_1/mt1"));
        assert!(first.absolute_path.exists());
    }

    #[tokio::test]
    async fn pacer_spaces_calls() {
        let pacer = RequestPacer::new(Duration::from_millis(20));
        let started = Instant::now();
        for _ in 0..3 {
            pacer.wait_turn().await;
        }
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    const GRID_BODY: &str = r#"{"data":[{"no":"1","name":"Aceh","level":1,"01/11/2025":"14,500"}]}"#;

    /// Local grid server answering the n-th request with `statuses[n]` (the
    /// last entry repeats). Returns its URL and a hit counter.
    async fn scripted_server(statuses: Vec<u16>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();

        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let hit = counter.fetch_add(1, Ordering::SeqCst);
                let status = statuses[hit.min(statuses.len() - 1)];
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let body = if status == 200 { GRID_BODY } else { "{}" };
                let response = format!(
                    "HTTP/1.1 {status} Scripted\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });

        (format!("http://{addr}/grid"), hits)
    }

    fn fast_client(base_url: String, max_retries: usize, timeout: Duration) -> PihpsClient {
        PihpsClient::new(UpstreamConfig {
            base_url,
            timeout,
            request_interval: Duration::ZERO,
            backoff: BackoffPolicy {
                max_retries,
                base_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(20),
            },
            ..Default::default()
        })
        .expect("client")
    }

    #[tokio::test]
    async fn transient_statuses_are_retried_until_success() {
        let (url, hits) = scripted_server(vec![503, 503, 200]).await;
        let client = fast_client(url, 3, Duration::from_secs(5));

        match client.fetch(&tuple(1)).await {
            FetchOutcome::Response(raw) => {
                assert_eq!(raw.status, 200);
                assert_eq!(raw.rows.len(), 1);
            }
            other => panic!("expected response, got {other:?}"),
        }
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_report_every_attempt() {
        let (url, hits) = scripted_server(vec![502]).await;
        let client = fast_client(url, 2, Duration::from_secs(5));

        match client.fetch(&tuple(1)).await {
            FetchOutcome::Failure(failure) => {
                assert_eq!(failure.attempts, 3);
                assert!(failure.retryable);
                assert!(failure.last_error.contains("502"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let (url, hits) = scripted_server(vec![404, 200]).await;
        let client = fast_client(url, 3, Duration::from_secs(5));

        match client.fetch(&tuple(1)).await {
            FetchOutcome::Failure(failure) => {
                assert_eq!(failure.attempts, 1);
                assert!(!failure.retryable);
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timeouts_count_as_transient() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                held.push(socket);
            }
        });
        let client = fast_client(format!("http://{addr}/grid"), 1, Duration::from_millis(100));

        match client.fetch(&tuple(1)).await {
            FetchOutcome::Failure(failure) => {
                assert_eq!(failure.attempts, 2);
                assert!(failure.retryable);
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
