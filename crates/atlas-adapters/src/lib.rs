//! Provider adapter contracts, the arXiv Atom adapter, and record normalization.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use atlas_core::{
    collapse_whitespace, compose_embedding_text, CanonicalRecord, KeywordMatcher, RawRecord,
    Reputation,
};
use atlas_storage::{FailureKind, FetchError, HttpFetcher, RetryDisposition};
use chrono::{DateTime, NaiveDate, Utc};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

pub const CRATE_NAME: &str = "atlas-adapters";

pub const ARXIV_API_URL: &str = "http://export.arxiv.org/api/query";

/// Hard upper bound on results requested in one fetch call.
pub const PROVIDER_RESULT_CEILING: usize = 2000;

pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Category filter plus an inclusive submission-date range (minute granularity).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderQuery {
    pub category: String,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl ProviderQuery {
    pub fn new(category: impl Into<String>, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self {
            category: category.into(),
            from,
            to,
        }
    }

    /// `cat:<category> AND submittedDate:[YYYYMMDDHHMM TO YYYYMMDDHHMM]`
    pub fn to_search_query(&self) -> String {
        format!(
            "cat:{} AND submittedDate:[{} TO {}]",
            self.category.trim(),
            self.from.format("%Y%m%d%H%M"),
            self.to.format("%Y%m%d%H%M")
        )
    }

    pub fn contains(&self, published: Option<DateTime<Utc>>) -> bool {
        published.map_or(true, |p| p >= self.from && p <= self.to)
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("provider reported an error: {0}")]
    Reported(String),
    #[error("malformed provider response: {0}")]
    Parse(String),
    #[error("invalid provider query: {0}")]
    Query(String),
    #[error(transparent)]
    Fixture(#[from] anyhow::Error),
}

impl ProviderError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, ProviderError::Fetch(err) if err.is_rate_limited())
    }
}

/// All-or-nothing paginated fetch: callers see one flattened sequence or an error.
#[async_trait]
pub trait RecordProvider: Send + Sync {
    fn provider_id(&self) -> &'static str;

    async fn fetch(
        &self,
        query: &ProviderQuery,
        max_results: usize,
    ) -> Result<Vec<RawRecord>, ProviderError>;
}

#[derive(Debug)]
pub struct ArxivProvider {
    http: HttpFetcher,
    base_url: String,
    page_size: usize,
}

impl ArxivProvider {
    pub fn new(http: HttpFetcher, base_url: impl Into<String>, page_size: usize) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            page_size: page_size.clamp(1, PROVIDER_RESULT_CEILING),
        }
    }

    pub fn page_url(&self, query: &ProviderQuery, start: usize, count: usize) -> Result<String, ProviderError> {
        let start = start.to_string();
        let count = count.to_string();
        let url = Url::parse_with_params(
            &self.base_url,
            &[
                ("search_query", query.to_search_query().as_str()),
                ("start", start.as_str()),
                ("max_results", count.as_str()),
                ("sortBy", "submittedDate"),
                ("sortOrder", "descending"),
            ],
        )
        .map_err(|e| ProviderError::Query(format!("{}: {e}", self.base_url)))?;
        Ok(url.to_string())
    }
}

#[async_trait]
impl RecordProvider for ArxivProvider {
    fn provider_id(&self) -> &'static str {
        "arxiv"
    }

    async fn fetch(
        &self,
        query: &ProviderQuery,
        max_results: usize,
    ) -> Result<Vec<RawRecord>, ProviderError> {
        let max_results = max_results.min(PROVIDER_RESULT_CEILING);
        let mut records = Vec::new();
        let mut start = 0usize;

        while records.len() < max_results {
            let want = self.page_size.min(max_results - records.len());
            let page = self.fetch_page(query, start, want, max_results).await?;
            let got = page.records.len();

            records.extend(page.records);
            start += got;
            if got < want || page.total_results.is_some_and(|total| start >= total) {
                break;
            }
        }

        records.truncate(max_results);
        Ok(records)
    }
}

impl ArxivProvider {
    /// Fetches one page, re-requesting it while it is shorter than the feed's
    /// own `totalResults` says it should be.
    async fn fetch_page(
        &self,
        query: &ProviderQuery,
        start: usize,
        want: usize,
        max_results: usize,
    ) -> Result<AtomPage, ProviderError> {
        let url = self.page_url(query, start, want)?;
        let backoff = *self.http.backoff();
        let mut previous_wait = Duration::ZERO;
        let mut attempt = 1usize;

        loop {
            let response = self.http.fetch_bytes(&url).await?;
            let page = parse_atom_page(&String::from_utf8_lossy(&response.body))?;
            let got = page.records.len();
            let expected = page
                .total_results
                .map(|total| total.min(max_results).saturating_sub(start).min(want));
            debug!(start, want, got, ?expected, attempts = response.attempts, "fetched provider page");

            let Some(expected) = expected.filter(|&expected| got < expected) else {
                return Ok(page);
            };
            if attempt >= backoff.max_attempts {
                return Err(FetchError::RetriesExhausted {
                    attempts: attempt,
                    kind: FailureKind::Transient,
                    last_failure: format!("page at start={start} held {got} of {expected} expected entries"),
                }
                .into());
            }

            let wait = backoff
                .delay_for_retry(attempt, RetryDisposition::Transient)
                .max(previous_wait);
            warn!(start, got, expected, attempt, ?wait, "short provider page; requesting it again");
            tokio::time::sleep(wait).await;
            previous_wait = wait;
            attempt += 1;
        }
    }
}

fn selector(css: &str) -> Result<Selector, ProviderError> {
    Selector::parse(css).map_err(|e| ProviderError::Parse(format!("selector {css}: {e}")))
}

fn first_text(element: &ElementRef<'_>, sel: &Selector) -> Option<String> {
    element
        .select(sel)
        .next()
        .map(|n| n.text().collect::<String>().trim().to_string())
}

/// One parsed result page plus the feed's advertised result count, when present.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AtomPage {
    pub records: Vec<RawRecord>,
    pub total_results: Option<usize>,
}

pub fn parse_atom_page(xml: &str) -> Result<AtomPage, ProviderError> {
    let records = parse_atom_feed(xml)?;
    let document = Html::parse_document(xml);
    let total_results = document
        .root_element()
        .descendants()
        .filter_map(ElementRef::wrap)
        .find(|el| {
            el.value()
                .name()
                .rsplit(':')
                .next()
                .is_some_and(|local| local.eq_ignore_ascii_case("totalResults"))
        })
        .and_then(|el| el.text().collect::<String>().trim().parse().ok());
    Ok(AtomPage {
        records,
        total_results,
    })
}

/// Parses an Atom feed into provider records.
///
/// An entry pointing at the provider's error namespace is surfaced as
/// [`ProviderError::Reported`] instead of as a record.
pub fn parse_atom_feed(xml: &str) -> Result<Vec<RawRecord>, ProviderError> {
    if !xml.contains("<feed") {
        return Err(ProviderError::Parse("response is not an Atom feed".to_string()));
    }

    let document = Html::parse_document(xml);
    let entry_sel = selector("entry")?;
    let id_sel = selector("id")?;
    let title_sel = selector("title")?;
    let summary_sel = selector("summary")?;
    let published_sel = selector("published")?;
    let author_sel = selector("author > name")?;
    let link_sel = selector("link")?;

    let mut records = Vec::new();
    for entry in document.select(&entry_sel) {
        let entry_uri = first_text(&entry, &id_sel).unwrap_or_default();
        let title = first_text(&entry, &title_sel).unwrap_or_default();
        let summary = first_text(&entry, &summary_sel).unwrap_or_default();

        if entry_uri.contains("/api/errors") {
            return Err(ProviderError::Reported(collapse_whitespace(&summary)));
        }

        let published = first_text(&entry, &published_sel).and_then(|text| {
            DateTime::parse_from_rfc3339(&text)
                .map(|dt| dt.with_timezone(&Utc))
                .ok()
        });

        let authors = entry
            .select(&author_sel)
            .map(|n| collapse_whitespace(&n.text().collect::<String>()))
            .filter(|name| !name.is_empty())
            .collect::<Vec<_>>();

        let mut primary_link = None;
        let mut pdf_link = None;
        for link in entry.select(&link_sel) {
            let attrs = link.value();
            let Some(href) = attrs.attr("href").map(str::trim).filter(|h| !h.is_empty()) else {
                continue;
            };
            if attrs.attr("title") == Some("pdf") {
                pdf_link.get_or_insert_with(|| href.to_string());
            } else if attrs.attr("rel").unwrap_or("alternate") == "alternate" {
                primary_link.get_or_insert_with(|| href.to_string());
            }
        }

        records.push(RawRecord {
            entry_uri,
            title,
            summary,
            primary_link,
            pdf_link,
            authors,
            published,
        });
    }
    Ok(records)
}

pub fn load_fixture_feed(path: impl AsRef<Path>) -> Result<Vec<RawRecord>> {
    let path = path.as_ref();
    let xml = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    parse_atom_feed(&xml).with_context(|| format!("parsing {}", path.display()))
}

/// Serves Atom feeds checked in under a directory; used for offline runs.
#[derive(Debug, Clone)]
pub struct FixtureProvider {
    dir: PathBuf,
}

impl FixtureProvider {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn feed_paths(&self) -> Result<Vec<PathBuf>> {
        let mut paths = fs::read_dir(&self.dir)
            .with_context(|| format!("reading fixture dir {}", self.dir.display()))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "xml"))
            .collect::<Vec<_>>();
        paths.sort();
        Ok(paths)
    }
}

#[async_trait]
impl RecordProvider for FixtureProvider {
    fn provider_id(&self) -> &'static str {
        "fixture"
    }

    async fn fetch(
        &self,
        query: &ProviderQuery,
        max_results: usize,
    ) -> Result<Vec<RawRecord>, ProviderError> {
        let max_results = max_results.min(PROVIDER_RESULT_CEILING);
        let mut records = Vec::new();
        for path in self.feed_paths()? {
            records.extend(
                load_fixture_feed(&path)?
                    .into_iter()
                    .filter(|r| query.contains(r.published)),
            );
        }
        records.truncate(max_results);
        Ok(records)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizationError {
    #[error("record uri {uri:?} has no identifier path segment")]
    MissingIdentifier { uri: String },
}

/// Last non-empty `/`-delimited path segment of the permanent record URI.
pub fn extract_identifier(uri: &str) -> Result<String, NormalizationError> {
    let missing = || NormalizationError::MissingIdentifier {
        uri: uri.to_string(),
    };
    let uri = uri.trim();
    let segment = match Url::parse(uri) {
        Ok(parsed) => parsed
            .path_segments()
            .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
            .map(ToString::to_string),
        // Scheme-less form such as `arxiv.org/abs/<id>`: skip the host segment.
        Err(_) => uri
            .split('/')
            .filter(|s| !s.is_empty())
            .skip(1)
            .last()
            .filter(|s| !s.chars().any(char::is_whitespace))
            .map(ToString::to_string),
    };
    segment.ok_or_else(missing)
}

#[derive(Debug, Clone, Default)]
pub struct NormalizedBatch {
    pub records: Vec<CanonicalRecord>,
    pub rejected: usize,
}

/// Maps provider records onto [`CanonicalRecord`]; reputation is left at the default.
#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    noise: KeywordMatcher,
}

impl Normalizer {
    pub fn new<I, S>(noise_tokens: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Ok(Self {
            noise: KeywordMatcher::new(noise_tokens)?,
        })
    }

    pub fn noise(&self) -> &KeywordMatcher {
        &self.noise
    }

    /// `fetched_on` stands in for a missing publication timestamp.
    pub fn normalize(
        &self,
        raw: &RawRecord,
        fetched_on: NaiveDate,
    ) -> Result<CanonicalRecord, NormalizationError> {
        let id = extract_identifier(&raw.entry_uri)?;
        let title = collapse_whitespace(&raw.title);
        let abstract_text = collapse_whitespace(&raw.summary);
        let embedding_text = compose_embedding_text(&title, &abstract_text, &self.noise);
        let source_url = raw
            .pdf_link
            .clone()
            .or_else(|| raw.primary_link.clone())
            .unwrap_or_else(|| raw.entry_uri.trim().to_string());

        Ok(CanonicalRecord {
            id,
            title,
            abstract_text,
            embedding_text,
            source_url,
            published_date: raw.published.map_or(fetched_on, |p| p.date_naive()),
            author_count: u32::try_from(raw.authors.len()).unwrap_or(u32::MAX),
            reputation: Reputation::default(),
        })
    }

    /// Normalizes a batch, dropping (and logging) records that cannot be identified.
    pub fn normalize_all(&self, raws: &[RawRecord], fetched_on: NaiveDate) -> NormalizedBatch {
        let mut batch = NormalizedBatch::default();
        for raw in raws {
            match self.normalize(raw, fetched_on) {
                Ok(record) => batch.records.push(record),
                Err(err) => {
                    warn!(error = %err, title = %collapse_whitespace(&raw.title), "dropping record");
                    batch.rejected += 1;
                }
            }
        }
        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atlas_storage::{BackoffPolicy, HttpTransport, StatusCode, TransportError, TransportResponse};
    use chrono::TimeZone;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    fn fixture_dir() -> PathBuf {
        workspace_root().join("fixtures").join("arxiv").join("sample")
    }

    fn ts(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).single().unwrap()
    }

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn feed_with_entries(ids: &[&str]) -> String {
        let entries = ids
            .iter()
            .map(|id| {
                format!(
                    "<entry><id>http://arxiv.org/abs/{id}</id><published>2026-10-18T10:00:00Z</published>\
                     <title>Paper {id}</title><summary>Abstract {id}</summary>\
                     <author><name>Someone</name></author></entry>"
                )
            })
            .collect::<String>();
        format!("<?xml version=\"1.0\"?><feed xmlns=\"http://www.w3.org/2005/Atom\"><title>q</title>{entries}</feed>")
    }

    fn feed_with_total(ids: &[&str], total: usize) -> String {
        feed_with_entries(ids).replacen(
            "<title>q</title>",
            &format!(
                "<title>q</title><opensearch:totalResults xmlns:opensearch=\"http://a9.com/-/spec/opensearch/1.1/\">{total}</opensearch:totalResults>"
            ),
            1,
        )
    }

    struct PagedTransport {
        pages: Mutex<VecDeque<Result<TransportResponse, TransportError>>>,
        urls: Mutex<Vec<String>>,
    }

    impl PagedTransport {
        fn new(pages: Vec<Result<TransportResponse, TransportError>>) -> Self {
            Self {
                pages: Mutex::new(pages.into()),
                urls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl HttpTransport for PagedTransport {
        async fn get(&self, url: &str) -> Result<TransportResponse, TransportError> {
            self.urls.lock().unwrap().push(url.to_string());
            self.pages
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(TransportError::fatal("unexpected request")))
        }
    }

    fn ok_page(body: String) -> Result<TransportResponse, TransportError> {
        Ok(TransportResponse {
            status: status(200),
            final_url: ARXIV_API_URL.to_string(),
            retry_after: None,
            body: body.into_bytes(),
        })
    }

    fn status(code: u16) -> StatusCode {
        StatusCode::from_u16(code).unwrap()
    }

    fn provider(transport: Arc<PagedTransport>, page_size: usize) -> ArxivProvider {
        let policy = BackoffPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
            transient_delay: Duration::from_millis(5),
        };
        ArxivProvider::new(
            HttpFetcher::with_transport(transport, policy, Duration::ZERO),
            ARXIV_API_URL,
            page_size,
        )
    }

    #[test]
    fn query_renders_category_and_minute_range() {
        let query = ProviderQuery::new("cs.AI", ts(2026, 10, 14, 6, 0), ts(2026, 10, 19, 6, 30));
        assert_eq!(
            query.to_search_query(),
            "cat:cs.AI AND submittedDate:[202610140600 TO 202610190630]"
        );
    }

    #[test]
    fn atom_fixture_parses_all_entries() {
        let records = load_fixture_feed(fixture_dir().join("feed.xml")).unwrap();
        assert_eq!(records.len(), 5);

        let first = &records[0];
        assert_eq!(first.entry_uri, "http://arxiv.org/abs/2610.01234v1");
        assert_eq!(first.authors.len(), 9);
        assert_eq!(first.pdf_link.as_deref(), Some("http://arxiv.org/pdf/2610.01234v1"));
        assert_eq!(first.primary_link.as_deref(), Some("http://arxiv.org/abs/2610.01234v1"));
        assert_eq!(first.published, Some(ts(2026, 10, 18, 17, 59) + chrono::Duration::seconds(58)));

        let third = &records[2];
        assert_eq!(third.title, "Agents & Tools: An Empirical Study");
        assert!(third.pdf_link.is_none());
        assert!(records[3].entry_uri.is_empty());
    }

    #[test]
    fn error_feed_is_reported_not_parsed_as_record() {
        let xml = r#"<?xml version="1.0"?><feed xmlns="http://www.w3.org/2005/Atom">
            <entry><id>http://arxiv.org/api/errors#incorrect_id_format_for_1234</id>
            <title>Error</title><summary>incorrect id format for 1234</summary></entry></feed>"#;
        let err = parse_atom_feed(xml).unwrap_err();
        assert!(matches!(err, ProviderError::Reported(ref msg) if msg == "incorrect id format for 1234"));
    }

    #[test]
    fn non_feed_body_is_a_parse_error() {
        assert!(matches!(
            parse_atom_feed("<html><body>maintenance</body></html>"),
            Err(ProviderError::Parse(_))
        ));
    }

    #[test]
    fn identifier_is_last_path_segment() {
        assert_eq!(extract_identifier("http://arxiv.org/abs/2610.01234v1").unwrap(), "2610.01234v1");
        assert_eq!(extract_identifier("http://arxiv.org/abs/hep-th/9901001v1/").unwrap(), "9901001v1");
        assert!(extract_identifier("").is_err());
        assert!(extract_identifier("http://arxiv.org/").is_err());
        assert!(extract_identifier("not a uri").is_err());
    }

    #[test]
    fn identifier_survives_missing_scheme() {
        assert_eq!(extract_identifier("arxiv.org/abs/2610.01234v1").unwrap(), "2610.01234v1");
        assert_eq!(extract_identifier(" arxiv.org/abs/2610.01234v1/ ").unwrap(), "2610.01234v1");
        assert!(extract_identifier("arxiv.org/").is_err());
        assert!(extract_identifier("///").is_err());
    }

    #[test]
    fn normalizer_builds_canonical_record() {
        let raws = load_fixture_feed(fixture_dir().join("feed.xml")).unwrap();
        let normalizer = Normalizer::new(["benchmark"]).unwrap();
        let record = normalizer.normalize(&raws[0], day(2026, 10, 19)).unwrap();

        assert_eq!(record.id, "2610.01234v1");
        assert_eq!(record.title, "Scaling Sparse Retrieval with Learned Routers");
        assert_eq!(record.source_url, "http://arxiv.org/pdf/2610.01234v1");
        assert_eq!(record.published_date, day(2026, 10, 18));
        assert_eq!(record.published_date_text(), "2026-10-18");
        assert_eq!(record.author_count, 9);
        assert_eq!(record.reputation, Reputation::Standard);
        assert!(record.embedding_text.starts_with("Scaling Sparse Retrieval with Learned Routers. We study"));
        assert!(!record.embedding_text.contains("benchmark"));
        assert!(record.abstract_text.contains("benchmark"));
    }

    #[test]
    fn normalizer_degrades_missing_optional_fields() {
        let raw = RawRecord {
            entry_uri: "http://arxiv.org/abs/2610.09999v1".to_string(),
            title: String::new(),
            summary: String::new(),
            primary_link: None,
            pdf_link: None,
            authors: Vec::new(),
            published: None,
        };
        let record = Normalizer::default().normalize(&raw, day(2026, 10, 19)).unwrap();
        assert_eq!(record.author_count, 0);
        assert_eq!(record.published_date, day(2026, 10, 19));
        assert_eq!(record.source_url, "http://arxiv.org/abs/2610.09999v1");
    }

    #[test]
    fn normalize_all_skips_unidentifiable_records() {
        let raws = load_fixture_feed(fixture_dir().join("feed.xml")).unwrap();
        let batch = Normalizer::default().normalize_all(&raws, day(2026, 10, 19));
        assert_eq!(batch.records.len(), 4);
        assert_eq!(batch.rejected, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn arxiv_provider_paginates_until_short_page() {
        let transport = Arc::new(PagedTransport::new(vec![
            ok_page(feed_with_entries(&["2610.00001v1", "2610.00002v1"])),
            ok_page(feed_with_entries(&["2610.00003v1"])),
        ]));
        let query = ProviderQuery::new("cs.AI", ts(2026, 10, 14, 0, 0), ts(2026, 10, 19, 0, 0));
        let records = provider(transport.clone(), 2).fetch(&query, 5).await.unwrap();

        assert_eq!(records.len(), 3);
        let urls = transport.urls.lock().unwrap().clone();
        assert_eq!(urls.len(), 2);
        assert!(urls[0].contains("start=0&max_results=2"));
        assert!(urls[1].contains("start=2&max_results=2"));
        assert!(urls[0].contains("sortBy=submittedDate"));
    }

    #[tokio::test(start_paused = true)]
    async fn arxiv_provider_stops_at_requested_maximum() {
        let transport = Arc::new(PagedTransport::new(vec![
            ok_page(feed_with_entries(&["2610.00001v1", "2610.00002v1"])),
            ok_page(feed_with_entries(&["2610.00003v1"])),
        ]));
        let query = ProviderQuery::new("cs.AI", ts(2026, 10, 14, 0, 0), ts(2026, 10, 19, 0, 0));
        let records = provider(transport.clone(), 2).fetch(&query, 3).await.unwrap();

        assert_eq!(records.len(), 3);
        let urls = transport.urls.lock().unwrap().clone();
        assert!(urls[1].contains("start=2&max_results=1"));
    }

    #[tokio::test(start_paused = true)]
    async fn failing_later_page_returns_no_partial_results() {
        let transport = Arc::new(PagedTransport::new(vec![
            ok_page(feed_with_entries(&["2610.00001v1", "2610.00002v1"])),
            Ok(TransportResponse {
                status: status(400),
                final_url: ARXIV_API_URL.to_string(),
                retry_after: None,
                body: Vec::new(),
            }),
        ]));
        let query = ProviderQuery::new("cs.AI", ts(2026, 10, 14, 0, 0), ts(2026, 10, 19, 0, 0));
        let err = provider(transport, 2).fetch(&query, 10).await.unwrap_err();
        assert!(matches!(err, ProviderError::Fetch(FetchError::Rejected { status: 400, .. })));
    }

    #[test]
    fn atom_page_reports_advertised_total() {
        let xml = fs::read_to_string(fixture_dir().join("feed.xml")).unwrap();
        let page = parse_atom_page(&xml).unwrap();
        assert_eq!(page.records.len(), 5);
        assert_eq!(page.total_results, Some(5));

        let bare = parse_atom_page(&feed_with_entries(&["2610.00001v1"])).unwrap();
        assert_eq!(bare.total_results, None);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_page_below_advertised_total_is_requested_again() {
        let transport = Arc::new(PagedTransport::new(vec![
            ok_page(feed_with_total(&[], 3)),
            ok_page(feed_with_total(&["2610.00001v1", "2610.00002v1", "2610.00003v1"], 3)),
        ]));
        let query = ProviderQuery::new("cs.AI", ts(2026, 10, 14, 0, 0), ts(2026, 10, 19, 0, 0));
        let records = provider(transport.clone(), 5).fetch(&query, 10).await.unwrap();

        assert_eq!(records.len(), 3);
        let urls = transport.urls.lock().unwrap().clone();
        assert_eq!(urls.len(), 2);
        assert_eq!(urls[0], urls[1]);
    }

    #[tokio::test(start_paused = true)]
    async fn short_page_mid_result_set_is_retried_at_same_offset() {
        let transport = Arc::new(PagedTransport::new(vec![
            ok_page(feed_with_total(&["2610.00001v1", "2610.00002v1"], 4)),
            ok_page(feed_with_total(&["2610.00003v1"], 4)),
            ok_page(feed_with_total(&["2610.00003v1", "2610.00004v1"], 4)),
        ]));
        let query = ProviderQuery::new("cs.AI", ts(2026, 10, 14, 0, 0), ts(2026, 10, 19, 0, 0));
        let records = provider(transport.clone(), 2).fetch(&query, 10).await.unwrap();

        assert_eq!(records.len(), 4);
        let urls = transport.urls.lock().unwrap().clone();
        assert_eq!(urls.len(), 3);
        assert!(urls[1].contains("start=2&max_results=2"));
        assert_eq!(urls[1], urls[2]);
    }

    #[tokio::test(start_paused = true)]
    async fn persistently_empty_pages_exhaust_retries() {
        let transport = Arc::new(PagedTransport::new(vec![
            ok_page(feed_with_total(&[], 3)),
            ok_page(feed_with_total(&[], 3)),
            ok_page(feed_with_total(&[], 3)),
        ]));
        let query = ProviderQuery::new("cs.AI", ts(2026, 10, 14, 0, 0), ts(2026, 10, 19, 0, 0));
        let err = provider(transport.clone(), 5).fetch(&query, 10).await.unwrap_err();

        assert!(matches!(
            err,
            ProviderError::Fetch(FetchError::RetriesExhausted {
                attempts: 3,
                kind: FailureKind::Transient,
                ..
            })
        ));
        assert_eq!(transport.urls.lock().unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn short_final_page_matching_total_is_not_retried() {
        let transport = Arc::new(PagedTransport::new(vec![
            ok_page(feed_with_total(&["2610.00001v1", "2610.00002v1"], 3)),
            ok_page(feed_with_total(&["2610.00003v1"], 3)),
        ]));
        let query = ProviderQuery::new("cs.AI", ts(2026, 10, 14, 0, 0), ts(2026, 10, 19, 0, 0));
        let records = provider(transport.clone(), 2).fetch(&query, 10).await.unwrap();

        assert_eq!(records.len(), 3);
        assert_eq!(transport.urls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn fixture_provider_filters_by_query_window() {
        let provider = FixtureProvider::new(fixture_dir());
        let query = ProviderQuery::new("cs.AI", ts(2026, 10, 14, 0, 0), ts(2026, 10, 19, 0, 0));
        let records = provider.fetch(&query, 250).await.unwrap();
        // The 2026-10-12 entry is outside the window.
        assert_eq!(records.len(), 4);

        let capped = provider.fetch(&query, 2).await.unwrap();
        assert_eq!(capped.len(), 2);
    }
}
