//! Rate-limit aware HTTP fetch utilities + the persisted rolling window store.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use arrow_array::cast::AsArray;
use arrow_array::types::UInt32Type;
use arrow_array::{RecordBatch, StringArray, UInt32Array};
use arrow_schema::{ArrowError, DataType, Field as ArrowField, Schema, SchemaRef};
use async_trait::async_trait;
use atlas_core::{parse_published_date, CanonicalRecord, Reputation};
use chrono::NaiveDate;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::errors::ParquetError;
use reqwest::header::RETRY_AFTER;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub use reqwest::StatusCode;

pub const CRATE_NAME: &str = "atlas-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    RateLimited,
    Transient,
    Fatal,
}

/// Classifies a non-success status; 503 counts as a throttle signal alongside 429.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::SERVICE_UNAVAILABLE {
        RetryDisposition::RateLimited
    } else if status.is_server_error() {
        RetryDisposition::Transient
    } else {
        RetryDisposition::Fatal
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RetryDisposition::Transient
    } else {
        RetryDisposition::Fatal
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    /// Total request attempts per fetch, including the first one.
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub transient_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(3),
            max_delay: Duration::from_secs(60),
            transient_delay: Duration::from_secs(1),
        }
    }
}

impl BackoffPolicy {
    /// Wait before retry number `retry` (1-based) after a failure of the given kind.
    pub fn delay_for_retry(&self, retry: usize, disposition: RetryDisposition) -> Duration {
        let retry = retry.max(1);
        let shift = (retry - 1).min(31) as u32;
        let rate_limited = self
            .base_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay);
        match disposition {
            RetryDisposition::RateLimited | RetryDisposition::Fatal => rate_limited,
            RetryDisposition::Transient => self
                .transient_delay
                .saturating_mul(retry.min(u32::MAX as usize) as u32)
                .min(rate_limited),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
    /// Minimum spacing between two requests, enforced on the happy path too.
    pub request_spacing: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
            request_spacing: Duration::from_secs(3),
        }
    }
}

/// Serializes requests so that consecutive ones are at least `min_interval` apart.
#[derive(Debug)]
pub struct RequestSpacing {
    min_interval: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl RequestSpacing {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_request: Mutex::new(None),
        }
    }

    pub async fn wait_turn(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.min_interval {
                let wait = self.min_interval - elapsed;
                debug!(?wait, "request spacing: waiting before next request");
                tokio::time::sleep(wait).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub retry_after: Option<Duration>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct TransportError {
    pub disposition: RetryDisposition,
    pub message: String,
}

impl TransportError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            disposition: RetryDisposition::Transient,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            disposition: RetryDisposition::Fatal,
            message: message.into(),
        }
    }

    fn from_reqwest(err: reqwest::Error) -> Self {
        Self {
            disposition: classify_reqwest_error(&err),
            message: err.to_string(),
        }
    }
}

/// Single-request GET transport; retries live in [`HttpFetcher`].
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn get(&self, url: &str) -> Result<TransportResponse, TransportError>;
}

#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(config: &HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn get(&self, url: &str) -> Result<TransportResponse, TransportError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(TransportError::from_reqwest)?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        let retry_after = resp
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);

        let body = if status.is_success() {
            resp.bytes()
                .await
                .map_err(TransportError::from_reqwest)?
                .to_vec()
        } else {
            Vec::new()
        };

        Ok(TransportResponse {
            status,
            final_url,
            retry_after,
            body,
        })
    }
}

/// `Retry-After` in delta-seconds form; HTTP-date values are ignored.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
    pub attempts: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    RateLimited,
    Transient,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::RateLimited => f.write_str("rate limited"),
            FailureKind::Transient => f.write_str("transient failure"),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("retries exhausted after {attempts} attempts ({kind}): {last_failure}")]
    RetriesExhausted {
        attempts: usize,
        kind: FailureKind,
        last_failure: String,
    },
    #[error("provider rejected request with http status {status} for {url}")]
    Rejected { status: u16, url: String },
    #[error("request failed: {message}")]
    Transport { message: String },
}

impl FetchError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(
            self,
            FetchError::RetriesExhausted {
                kind: FailureKind::RateLimited,
                ..
            }
        )
    }
}

pub struct HttpFetcher {
    transport: Arc<dyn HttpTransport>,
    spacing: RequestSpacing,
    backoff: BackoffPolicy,
}

impl std::fmt::Debug for HttpFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpFetcher")
            .field("spacing", &self.spacing)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let transport = ReqwestTransport::new(&config)?;
        Ok(Self::with_transport(
            Arc::new(transport),
            config.backoff,
            config.request_spacing,
        ))
    }

    pub fn with_transport(
        transport: Arc<dyn HttpTransport>,
        backoff: BackoffPolicy,
        request_spacing: Duration,
    ) -> Self {
        Self {
            transport,
            spacing: RequestSpacing::new(request_spacing),
            backoff,
        }
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    /// GET `url`, retrying throttling and transient failures per the backoff policy.
    ///
    /// Waits never shrink from one retry to the next within a call, whatever mix of
    /// failure kinds is observed.
    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let max_attempts = self.backoff.max_attempts.max(1);
        let mut previous_wait = Duration::ZERO;
        let mut last_kind = FailureKind::Transient;
        let mut last_failure = String::new();

        for attempt in 1..=max_attempts {
            self.spacing.wait_turn().await;

            let (disposition, retry_after) = match self.transport.get(url).await {
                Ok(resp) if resp.status.is_success() => {
                    return Ok(FetchedResponse {
                        status: resp.status,
                        final_url: resp.final_url,
                        body: resp.body,
                        attempts: attempt,
                    });
                }
                Ok(resp) => {
                    let disposition = classify_status(resp.status);
                    if disposition == RetryDisposition::Fatal {
                        return Err(FetchError::Rejected {
                            status: resp.status.as_u16(),
                            url: resp.final_url,
                        });
                    }
                    last_failure = format!("http status {}", resp.status.as_u16());
                    (disposition, resp.retry_after)
                }
                Err(err) => {
                    if err.disposition == RetryDisposition::Fatal {
                        return Err(FetchError::Transport {
                            message: err.message,
                        });
                    }
                    last_failure = err.message;
                    (err.disposition, None)
                }
            };

            last_kind = match disposition {
                RetryDisposition::RateLimited => FailureKind::RateLimited,
                _ => FailureKind::Transient,
            };

            if attempt == max_attempts {
                break;
            }

            let mut wait = self.backoff.delay_for_retry(attempt, disposition);
            if let Some(hint) = retry_after {
                wait = wait.max(hint.min(self.backoff.max_delay));
            }
            wait = wait.max(previous_wait);
            previous_wait = wait;

            warn!(
                attempt,
                max_attempts,
                kind = %last_kind,
                failure = %last_failure,
                ?wait,
                "provider request failed; backing off"
            );
            tokio::time::sleep(wait).await;
        }

        Err(FetchError::RetriesExhausted {
            attempts: max_attempts,
            kind: last_kind,
            last_failure,
        })
    }
}

/// Stable column names of the persisted window table.
pub mod columns {
    pub const ID: &str = "id";
    pub const TITLE: &str = "title";
    pub const ABSTRACT_TEXT: &str = "abstract_text";
    pub const EMBEDDING_TEXT: &str = "embedding_text";
    pub const SOURCE_URL: &str = "source_url";
    pub const PUBLISHED_DATE: &str = "published_date";
    pub const AUTHOR_COUNT: &str = "author_count";
    pub const REPUTATION: &str = "reputation";

    pub const ALL: [&str; 8] = [
        ID,
        TITLE,
        ABSTRACT_TEXT,
        EMBEDDING_TEXT,
        SOURCE_URL,
        PUBLISHED_DATE,
        AUTHOR_COUNT,
        REPUTATION,
    ];
}

pub fn window_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        ArrowField::new(columns::ID, DataType::Utf8, false),
        ArrowField::new(columns::TITLE, DataType::Utf8, false),
        ArrowField::new(columns::ABSTRACT_TEXT, DataType::Utf8, false),
        ArrowField::new(columns::EMBEDDING_TEXT, DataType::Utf8, false),
        ArrowField::new(columns::SOURCE_URL, DataType::Utf8, false),
        ArrowField::new(columns::PUBLISHED_DATE, DataType::Utf8, false),
        ArrowField::new(columns::AUTHOR_COUNT, DataType::UInt32, false),
        ArrowField::new(columns::REPUTATION, DataType::Utf8, false),
    ]))
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parquet error: {0}")]
    Parquet(#[from] ParquetError),
    #[error("arrow error: {0}")]
    Arrow(#[from] ArrowError),
    #[error("window table schema mismatch: {0}")]
    Schema(String),
    #[error("invalid row {row}: {reason}")]
    InvalidRow { row: usize, reason: String },
}

impl StoreError {
    fn io(action: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            action,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// In-memory window: records keyed (and therefore ordered) by id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WindowTable {
    records: BTreeMap<String, CanonicalRecord>,
}

impl WindowTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Later records replace earlier ones sharing an id.
    pub fn from_records(records: impl IntoIterator<Item = CanonicalRecord>) -> Self {
        Self::new().merge(records)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&CanonicalRecord> {
        self.records.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CanonicalRecord> {
        self.records.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut CanonicalRecord> {
        self.records.values_mut()
    }

    pub fn into_records(self) -> Vec<CanonicalRecord> {
        self.records.into_values().collect()
    }

    /// Union by id; an incoming record overwrites an existing one entirely.
    pub fn merge(mut self, incoming: impl IntoIterator<Item = CanonicalRecord>) -> Self {
        for record in incoming {
            self.records.insert(record.id.clone(), record);
        }
        self
    }

    /// Keeps records published on or after `cutoff`; returns how many were dropped.
    pub fn prune(&mut self, cutoff: NaiveDate) -> usize {
        let before = self.records.len();
        self.records.retain(|_, r| r.published_date >= cutoff);
        before - self.records.len()
    }

    pub fn date_range(&self) -> Option<(NaiveDate, NaiveDate)> {
        let min = self.records.values().map(|r| r.published_date).min()?;
        let max = self.records.values().map(|r| r.published_date).max()?;
        Some((min, max))
    }

    pub fn count_by_reputation(&self, reputation: Reputation) -> usize {
        self.records
            .values()
            .filter(|r| r.reputation == reputation)
            .count()
    }

    pub fn to_record_batch(&self) -> Result<RecordBatch, StoreError> {
        let rows = self.records.values().collect::<Vec<_>>();
        let ids = StringArray::from(rows.iter().map(|r| r.id.as_str()).collect::<Vec<_>>());
        let titles = StringArray::from(rows.iter().map(|r| r.title.as_str()).collect::<Vec<_>>());
        let abstracts = StringArray::from(
            rows.iter()
                .map(|r| r.abstract_text.as_str())
                .collect::<Vec<_>>(),
        );
        let embedding_texts = StringArray::from(
            rows.iter()
                .map(|r| r.embedding_text.as_str())
                .collect::<Vec<_>>(),
        );
        let source_urls = StringArray::from(
            rows.iter()
                .map(|r| r.source_url.as_str())
                .collect::<Vec<_>>(),
        );
        let published = StringArray::from(
            rows.iter()
                .map(|r| r.published_date_text())
                .collect::<Vec<_>>(),
        );
        let author_counts = UInt32Array::from(rows.iter().map(|r| r.author_count).collect::<Vec<_>>());
        let reputations = StringArray::from(
            rows.iter()
                .map(|r| r.reputation.as_str())
                .collect::<Vec<_>>(),
        );

        Ok(RecordBatch::try_new(
            window_schema(),
            vec![
                Arc::new(ids),
                Arc::new(titles),
                Arc::new(abstracts),
                Arc::new(embedding_texts),
                Arc::new(source_urls),
                Arc::new(published),
                Arc::new(author_counts),
                Arc::new(reputations),
            ],
        )?)
    }

    fn extend_from_batch(&mut self, batch: &RecordBatch, row_offset: usize) -> Result<(), StoreError> {
        let ids = string_column(batch, columns::ID)?;
        let titles = string_column(batch, columns::TITLE)?;
        let abstracts = string_column(batch, columns::ABSTRACT_TEXT)?;
        let embedding_texts = string_column(batch, columns::EMBEDDING_TEXT)?;
        let source_urls = string_column(batch, columns::SOURCE_URL)?;
        let published = string_column(batch, columns::PUBLISHED_DATE)?;
        let reputations = string_column(batch, columns::REPUTATION)?;
        let author_counts = batch
            .column_by_name(columns::AUTHOR_COUNT)
            .ok_or_else(|| StoreError::Schema(format!("missing column {}", columns::AUTHOR_COUNT)))?
            .as_primitive_opt::<UInt32Type>()
            .ok_or_else(|| StoreError::Schema(format!("column {} is not UInt32", columns::AUTHOR_COUNT)))?;

        for i in 0..batch.num_rows() {
            let row = row_offset + i;
            let id = ids.value(i);
            if id.is_empty() {
                return Err(StoreError::InvalidRow {
                    row,
                    reason: "empty id".to_string(),
                });
            }
            let published_date = parse_published_date(published.value(i)).ok_or_else(|| {
                StoreError::InvalidRow {
                    row,
                    reason: format!("unparseable published_date {:?}", published.value(i)),
                }
            })?;
            let reputation = reputations
                .value(i)
                .parse::<Reputation>()
                .map_err(|e| StoreError::InvalidRow {
                    row,
                    reason: e.to_string(),
                })?;

            let record = CanonicalRecord {
                id: id.to_string(),
                title: titles.value(i).to_string(),
                abstract_text: abstracts.value(i).to_string(),
                embedding_text: embedding_texts.value(i).to_string(),
                source_url: source_urls.value(i).to_string(),
                published_date,
                author_count: author_counts.value(i),
                reputation,
            };
            self.records.insert(record.id.clone(), record);
        }
        Ok(())
    }
}

fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray, StoreError> {
    let column = batch
        .column_by_name(name)
        .ok_or_else(|| StoreError::Schema(format!("missing column {name}")))?;
    if column.null_count() > 0 {
        return Err(StoreError::Schema(format!("column {name} contains nulls")));
    }
    column
        .as_string_opt::<i32>()
        .ok_or_else(|| StoreError::Schema(format!("column {name} is not Utf8")))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedTable {
    pub path: PathBuf,
    pub rows: usize,
    pub bytes: u64,
    pub sha256: String,
}

/// Durable single-file home of the window table.
#[derive(Debug, Clone)]
pub struct WindowStore {
    path: PathBuf,
}

impl WindowStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// Loads the persisted table; a missing file is an empty window, not an error.
    pub fn load(&self) -> Result<WindowTable, StoreError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no persisted window table; starting empty");
                return Ok(WindowTable::new());
            }
            Err(err) => return Err(StoreError::io("opening", &self.path, err)),
        };

        let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;
        let mut table = WindowTable::new();
        let mut row_offset = 0usize;
        for batch in reader {
            let batch = batch?;
            table.extend_from_batch(&batch, row_offset)?;
            row_offset += batch.num_rows();
        }
        Ok(table)
    }

    /// Atomically replaces the persisted table via a sibling temp file + rename.
    pub fn persist(&self, table: &WindowTable) -> Result<PersistedTable, StoreError> {
        let bytes = encode_table(table)?;
        let sha256 = Self::sha256_hex(&bytes);
        write_atomic(&self.path, &bytes)?;

        Ok(PersistedTable {
            path: self.path.clone(),
            rows: table.len(),
            bytes: bytes.len() as u64,
            sha256,
        })
    }
}

fn encode_table(table: &WindowTable) -> Result<Vec<u8>, StoreError> {
    let batch = table.to_record_batch()?;
    let mut writer = ArrowWriter::try_new(Vec::new(), batch.schema(), None)?;
    writer.write(&batch)?;
    Ok(writer.into_inner()?)
}

/// Replaces `path` with `bytes` via a synced sibling temp file and a rename.
///
/// Readers see either the previous content or the new one, never a torn file.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir).map_err(|e| StoreError::io("creating directory", &dir, e))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "window.parquet".to_string());
    let temp_path = dir.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    let result = write_temp_then_rename(bytes, &temp_path, path);
    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    result
}

fn write_temp_then_rename(bytes: &[u8], temp_path: &Path, target: &Path) -> Result<(), StoreError> {
    let mut file = File::options()
        .create_new(true)
        .write(true)
        .open(temp_path)
        .map_err(|e| StoreError::io("opening temp file", temp_path, e))?;
    file.write_all(bytes)
        .map_err(|e| StoreError::io("writing temp file", temp_path, e))?;
    file.sync_all()
        .map_err(|e| StoreError::io("syncing temp file", temp_path, e))?;
    drop(file);

    fs::rename(temp_path, target).map_err(|e| StoreError::io("renaming temp file onto", target, e))
}
