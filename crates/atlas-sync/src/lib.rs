//! Sync cycle orchestration: fetch, normalize, score, merge, prune, persist, export.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use atlas_adapters::{
    ArxivProvider, FixtureProvider, Normalizer, ProviderError, ProviderQuery, RecordProvider,
    ARXIV_API_URL, DEFAULT_PAGE_SIZE, PROVIDER_RESULT_CEILING,
};
use atlas_core::{CanonicalRecord, KeywordMatcher, Reputation};
use atlas_storage::{
    columns, write_atomic, BackoffPolicy, HttpClientConfig, HttpFetcher, PersistedTable,
    StoreError, WindowStore, WindowTable,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "atlas-sync";

pub const MANIFEST_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Arxiv,
    Fixture,
}

impl FromStr for ProviderKind {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "arxiv" => Ok(ProviderKind::Arxiv),
            "fixture" => Ok(ProviderKind::Fixture),
            other => Err(SyncError::Config(format!("unknown provider {other:?}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub workspace_root: PathBuf,
    pub store_path: PathBuf,
    pub category: String,
    pub retention_days: u32,
    pub lookback_days: u32,
    pub max_results_per_fetch: usize,
    pub page_size: usize,
    pub provider: ProviderKind,
    pub provider_url: String,
    pub fixture_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub retry: BackoffPolicy,
    pub request_spacing: Duration,
    pub scoring_concurrency: usize,
    pub cycle_timeout: Option<Duration>,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub export_command: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::for_workspace(PathBuf::from("."))
    }
}

impl SyncConfig {
    /// Defaults with every relative path anchored under `workspace_root`.
    pub fn for_workspace(workspace_root: PathBuf) -> Self {
        Self {
            store_path: workspace_root.join("data/window.parquet"),
            fixture_dir: workspace_root.join("fixtures/arxiv/sample"),
            workspace_root,
            category: "cs.AI".to_string(),
            retention_days: 5,
            lookback_days: 5,
            max_results_per_fetch: 250,
            page_size: DEFAULT_PAGE_SIZE,
            provider: ProviderKind::Arxiv,
            provider_url: ARXIV_API_URL.to_string(),
            user_agent: "paper-atlas/0.1 (+mailto:maintainers@example.org)".to_string(),
            http_timeout_secs: 20,
            retry: BackoffPolicy::default(),
            request_spacing: Duration::from_secs(3),
            scoring_concurrency: 4,
            cycle_timeout: None,
            scheduler_enabled: false,
            sync_cron: "0 0 6 * * *".to_string(),
            export_command: None,
        }
    }

    pub fn from_env() -> Result<Self, SyncError> {
        let workspace_root = std::env::var("ATLAS_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        let mut config = Self::for_workspace(workspace_root);

        if let Ok(path) = std::env::var("ATLAS_STORE_PATH") {
            config.store_path = config.workspace_root.join(path);
        }
        if let Ok(dir) = std::env::var("ATLAS_FIXTURE_DIR") {
            config.fixture_dir = config.workspace_root.join(dir);
        }
        if let Ok(category) = std::env::var("ATLAS_CATEGORY") {
            config.category = category;
        }
        if let Some(days) = env_parse("ATLAS_RETENTION_DAYS")? {
            config.retention_days = days;
        }
        config.lookback_days = env_parse("ATLAS_LOOKBACK_DAYS")?.unwrap_or(config.retention_days);
        if let Some(max) = env_parse::<usize>("ATLAS_MAX_RESULTS")? {
            config.max_results_per_fetch = max;
        }
        if let Some(size) = env_parse("ATLAS_PAGE_SIZE")? {
            config.page_size = size;
        }
        if let Ok(kind) = std::env::var("ATLAS_PROVIDER") {
            config.provider = kind.parse()?;
        }
        if let Ok(url) = std::env::var("ATLAS_PROVIDER_URL") {
            config.provider_url = url;
        }
        if let Ok(agent) = std::env::var("ATLAS_USER_AGENT") {
            config.user_agent = agent;
        }
        if let Some(secs) = env_parse("ATLAS_HTTP_TIMEOUT_SECS")? {
            config.http_timeout_secs = secs;
        }
        if let Some(attempts) = env_parse("ATLAS_RETRY_MAX_ATTEMPTS")? {
            config.retry.max_attempts = attempts;
        }
        if let Some(ms) = env_parse("ATLAS_RETRY_BASE_MS")? {
            config.retry.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse("ATLAS_RETRY_MAX_DELAY_MS")? {
            config.retry.max_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse("ATLAS_TRANSIENT_DELAY_MS")? {
            config.retry.transient_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse("ATLAS_REQUEST_SPACING_MS")? {
            config.request_spacing = Duration::from_millis(ms);
        }
        if let Some(workers) = env_parse("ATLAS_SCORING_CONCURRENCY")? {
            config.scoring_concurrency = workers;
        }
        config.cycle_timeout = env_parse("ATLAS_CYCLE_TIMEOUT_SECS")?.map(Duration::from_secs);
        config.scheduler_enabled = std::env::var("ATLAS_SCHEDULER_ENABLED")
            .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
            .unwrap_or(false);
        if let Ok(cron) = std::env::var("ATLAS_SYNC_CRON") {
            config.sync_cron = cron;
        }
        config.export_command = std::env::var("ATLAS_EXPORT_COMMAND")
            .ok()
            .filter(|cmd| !cmd.trim().is_empty());

        config.validate()
    }

    /// Clamps bounded knobs and rejects settings no cycle could run with.
    pub fn validate(mut self) -> Result<Self, SyncError> {
        if self.category.trim().is_empty() {
            return Err(SyncError::Config("category must not be empty".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(SyncError::Config("retry max attempts must be at least 1".into()));
        }
        self.max_results_per_fetch = self.max_results_per_fetch.clamp(1, PROVIDER_RESULT_CEILING);
        self.page_size = self.page_size.clamp(1, PROVIDER_RESULT_CEILING);
        self.scoring_concurrency = self.scoring_concurrency.max(1);
        if self.lookback_days < self.retention_days {
            warn!(
                lookback_days = self.lookback_days,
                retention_days = self.retention_days,
                "lookback is shorter than retention; downtime gaps will not be backfilled"
            );
        }
        Ok(self)
    }

    pub fn manifest_path(&self) -> PathBuf {
        manifest_path_for(&self.store_path)
    }

    fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            backoff: self.retry,
            request_spacing: self.request_spacing,
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>, SyncError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| SyncError::Config(format!("{key}={raw:?} is not a valid value"))),
        Err(_) => Ok(None),
    }
}

/// Oldest publication day that survives retention at `now`.
pub fn retention_cutoff(now: DateTime<Utc>, retention_days: u32) -> NaiveDate {
    (now - chrono::Duration::days(i64::from(retention_days))).date_naive()
}

pub fn manifest_path_for(table_path: &Path) -> PathBuf {
    let mut name = table_path
        .file_stem()
        .map(|s| s.to_os_string())
        .unwrap_or_else(|| "window".into());
    name.push(".manifest.json");
    table_path.with_file_name(name)
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ReputationRulesFile {
    #[allow(dead_code)]
    #[serde(default)]
    version: u32,
    #[serde(default)]
    institutions: Vec<String>,
    #[serde(default)]
    artifact_keywords: Vec<String>,
    #[serde(default)]
    rigor_keywords: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct NoiseRulesFile {
    #[allow(dead_code)]
    #[serde(default)]
    version: u32,
    #[serde(default)]
    tokens: Vec<String>,
}

/// Keyword lists driving the reputation scorer and embedding-text scrubbing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScoringRules {
    pub institutions: Vec<String>,
    pub artifact_keywords: Vec<String>,
    pub rigor_keywords: Vec<String>,
    pub noise_tokens: Vec<String>,
}

impl ScoringRules {
    /// Reads `rules/reputation.yaml` and `rules/noise.yaml`; absent files mean empty lists.
    pub fn from_workspace_root(root: &Path) -> Result<Self> {
        let rules_dir = root.join("rules");
        let reputation: ReputationRulesFile = read_rules_file(&rules_dir.join("reputation.yaml"))?;
        let noise: NoiseRulesFile = read_rules_file(&rules_dir.join("noise.yaml"))?;
        Ok(Self {
            institutions: reputation.institutions,
            artifact_keywords: reputation.artifact_keywords,
            rigor_keywords: reputation.rigor_keywords,
            noise_tokens: noise.tokens,
        })
    }
}

fn read_rules_file<T>(path: &Path) -> Result<T>
where
    T: Default + for<'de> Deserialize<'de>,
{
    match std::fs::read_to_string(path) {
        Ok(text) => serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %path.display(), "rules file missing; using an empty list");
            Ok(T::default())
        }
        Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
    }
}

pub const INSTITUTION_POINTS: u8 = 3;
pub const ARTIFACT_POINTS: u8 = 2;
pub const RIGOR_POINTS: u8 = 1;
pub const LARGE_TEAM_POINTS: u8 = 2;
pub const MID_TEAM_POINTS: u8 = 1;
pub const LARGE_TEAM_MIN_AUTHORS: u32 = 8;
pub const MID_TEAM_MIN_AUTHORS: u32 = 4;
pub const ENHANCED_THRESHOLD: u8 = 4;

/// Coarse significance heuristic over title, abstract and author count.
///
/// Pure and deterministic: the same record and rules always give the same
/// category, which is what lets already-known records skip re-scoring.
#[derive(Debug, Clone, Default)]
pub struct ReputationScorer {
    institutions: KeywordMatcher,
    artifacts: KeywordMatcher,
    rigor: KeywordMatcher,
}

impl ReputationScorer {
    pub fn new(rules: &ScoringRules) -> Result<Self, regex::Error> {
        Ok(Self {
            institutions: KeywordMatcher::new(&rules.institutions)?,
            artifacts: KeywordMatcher::new(&rules.artifact_keywords)?,
            rigor: KeywordMatcher::new(&rules.rigor_keywords)?,
        })
    }

    pub fn points(&self, record: &CanonicalRecord) -> u8 {
        let text = record.scoring_text();
        let mut points = 0;
        if self.institutions.is_match(&text) {
            points += INSTITUTION_POINTS;
        }
        if self.artifacts.is_match(&text) {
            points += ARTIFACT_POINTS;
        }
        if self.rigor.is_match(&text) {
            points += RIGOR_POINTS;
        }
        points += match record.author_count {
            n if n >= LARGE_TEAM_MIN_AUTHORS => LARGE_TEAM_POINTS,
            n if n >= MID_TEAM_MIN_AUTHORS => MID_TEAM_POINTS,
            _ => 0,
        };
        points
    }

    pub fn score(&self, record: &CanonicalRecord) -> Reputation {
        if self.points(record) >= ENHANCED_THRESHOLD {
            Reputation::Enhanced
        } else {
            Reputation::Standard
        }
    }
}

/// Scores records on the blocking pool in at most `concurrency` chunks, preserving order.
pub async fn score_records(
    scorer: Arc<ReputationScorer>,
    records: Vec<CanonicalRecord>,
    concurrency: usize,
) -> Result<Vec<CanonicalRecord>, SyncError> {
    if records.is_empty() {
        return Ok(records);
    }
    let total = records.len();
    let chunk_size = total.div_ceil(concurrency.max(1));

    let mut pending = records.into_iter().peekable();
    let mut handles = Vec::new();
    while pending.peek().is_some() {
        let chunk = pending.by_ref().take(chunk_size).collect::<Vec<_>>();
        let scorer = scorer.clone();
        handles.push(tokio::task::spawn_blocking(move || {
            chunk
                .into_iter()
                .map(|mut record| {
                    record.reputation = scorer.score(&record);
                    record
                })
                .collect::<Vec<_>>()
        }));
    }

    let mut scored = Vec::with_capacity(total);
    for handle in handles {
        scored.extend(handle.await.map_err(|e| SyncError::Scoring(e.to_string()))?);
    }
    Ok(scored)
}

/// What the export collaborator receives: the persisted table and its designated columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportTable {
    pub table_path: PathBuf,
    pub manifest_path: PathBuf,
    pub rows: usize,
    pub id_column: &'static str,
    pub label_column: &'static str,
    pub text_column: &'static str,
    pub reputation_column: &'static str,
}

impl ExportTable {
    pub fn for_persisted(persisted: &PersistedTable, manifest_path: PathBuf) -> Self {
        Self {
            table_path: persisted.path.clone(),
            manifest_path,
            rows: persisted.rows,
            id_column: columns::ID,
            label_column: columns::TITLE,
            text_column: columns::EMBEDDING_TEXT,
            reputation_column: columns::REPUTATION,
        }
    }
}

#[async_trait]
pub trait TableExporter: Send + Sync {
    async fn export(&self, table: &ExportTable) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct NoopExporter;

#[async_trait]
impl TableExporter for NoopExporter {
    async fn export(&self, table: &ExportTable) -> Result<()> {
        debug!(table = %table.table_path.display(), "no exporter configured");
        Ok(())
    }
}

/// Runs an external program; arguments may use `{table}`, `{manifest}`,
/// `{id_column}`, `{label_column}`, `{text_column}` and `{reputation_column}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandExporter {
    program: String,
    args: Vec<String>,
}

impl CommandExporter {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Whitespace-separated command line; the first word is the program.
    pub fn from_command_line(line: &str) -> Result<Self> {
        let mut words = line.split_whitespace().map(ToString::to_string);
        let program = words
            .next()
            .context("export command is empty")?;
        Ok(Self::new(program, words.collect()))
    }

    pub fn render_args(&self, table: &ExportTable) -> Vec<String> {
        let table_path = table.table_path.display().to_string();
        let manifest_path = table.manifest_path.display().to_string();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{table}", &table_path)
                    .replace("{manifest}", &manifest_path)
                    .replace("{id_column}", table.id_column)
                    .replace("{label_column}", table.label_column)
                    .replace("{text_column}", table.text_column)
                    .replace("{reputation_column}", table.reputation_column)
            })
            .collect()
    }
}

#[async_trait]
impl TableExporter for CommandExporter {
    async fn export(&self, table: &ExportTable) -> Result<()> {
        let args = self.render_args(table);
        info!(program = %self.program, ?args, "running export command");
        let output = tokio::process::Command::new(&self.program)
            .args(&args)
            .output()
            .await
            .with_context(|| format!("spawning export command {}", self.program))?;
        if !output.status.success() {
            anyhow::bail!(
                "export command {} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

/// Sidecar describing the persisted table; free of timestamps so idempotent
/// cycles rewrite it byte-for-byte.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableManifest {
    pub schema_version: u32,
    pub table: String,
    pub columns: Vec<String>,
    pub id_column: String,
    pub label_column: String,
    pub text_column: String,
    pub reputation_column: String,
    pub rows: usize,
    pub bytes: u64,
    pub sha256: String,
}

impl TableManifest {
    pub fn new(persisted: &PersistedTable) -> Self {
        Self {
            schema_version: MANIFEST_SCHEMA_VERSION,
            table: persisted
                .path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
            columns: columns::ALL.iter().map(|c| c.to_string()).collect(),
            id_column: columns::ID.to_string(),
            label_column: columns::TITLE.to_string(),
            text_column: columns::EMBEDDING_TEXT.to_string(),
            reputation_column: columns::REPUTATION.to_string(),
            rows: persisted.rows,
            bytes: persisted.bytes,
            sha256: persisted.sha256.clone(),
        }
    }
}

fn write_manifest(path: &Path, manifest: &TableManifest) -> Result<()> {
    let mut json = serde_json::to_string_pretty(manifest).context("serializing table manifest")?;
    json.push('\n');
    write_atomic(path, json.as_bytes()).with_context(|| format!("writing {}", path.display()))
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("fetch failed: {0}")]
    Provider(#[from] ProviderError),
    #[error("window store failure: {0}")]
    Store(#[from] StoreError),
    #[error("export failed after the table was persisted: {0}")]
    Export(String),
    #[error("sync cycle timed out after {0:?}")]
    Timeout(Duration),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("scoring task failed: {0}")]
    Scoring(String),
}

impl SyncError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, SyncError::Provider(err) if err.is_rate_limited())
    }
}

/// Progress of one cycle against the window store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CyclePhase {
    Idle,
    Loaded,
    Merging,
    Pruning,
    Persisted,
    Aborted,
}

#[derive(Debug)]
struct CycleState {
    phase: CyclePhase,
}

impl CycleState {
    fn new() -> Self {
        Self {
            phase: CyclePhase::Idle,
        }
    }

    fn advance(&mut self, next: CyclePhase) {
        debug!(from = ?self.phase, to = ?next, "cycle phase");
        self.phase = next;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub cutoff_date: NaiveDate,
    pub fetched: usize,
    pub rejected: usize,
    pub already_known: usize,
    pub records_added: usize,
    pub pruned: usize,
    pub records_written: usize,
    pub enhanced: usize,
    pub table_path: String,
    pub table_sha256: String,
    pub manifest_path: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RescanSummary {
    pub run_id: Uuid,
    pub cutoff_date: NaiveDate,
    pub pruned: usize,
    pub records_written: usize,
    pub reclassified: usize,
    pub enhanced: usize,
    pub table_sha256: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub table_path: String,
    pub rows: usize,
    pub earliest: Option<NaiveDate>,
    pub latest: Option<NaiveDate>,
    pub standard: usize,
    pub enhanced: usize,
}

pub fn inspect_store(path: &Path) -> Result<StoreStats, StoreError> {
    let table = WindowStore::new(path).load()?;
    let range = table.date_range();
    Ok(StoreStats {
        table_path: path.display().to_string(),
        rows: table.len(),
        earliest: range.map(|(first, _)| first),
        latest: range.map(|(_, last)| last),
        standard: table.count_by_reputation(Reputation::Standard),
        enhanced: table.count_by_reputation(Reputation::Enhanced),
    })
}

pub fn build_provider(config: &SyncConfig) -> Result<Box<dyn RecordProvider>> {
    Ok(match config.provider {
        ProviderKind::Arxiv => {
            let http = HttpFetcher::new(config.http_client_config())?;
            Box::new(ArxivProvider::new(http, config.provider_url.clone(), config.page_size))
        }
        ProviderKind::Fixture => Box::new(FixtureProvider::new(config.fixture_dir.clone())),
    })
}

pub fn build_exporter(config: &SyncConfig) -> Result<Box<dyn TableExporter>> {
    Ok(match &config.export_command {
        Some(line) => Box::new(CommandExporter::from_command_line(line)?),
        None => Box::<NoopExporter>::default(),
    })
}

/// Owns the window store for the duration of each cycle; cycles never overlap.
pub struct SyncPipeline {
    config: SyncConfig,
    store: WindowStore,
    provider: Box<dyn RecordProvider>,
    normalizer: Normalizer,
    scorer: Arc<ReputationScorer>,
    exporter: Box<dyn TableExporter>,
    cycle_lock: Mutex<()>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig, rules: ScoringRules) -> Result<Self> {
        let provider = build_provider(&config)?;
        let exporter = build_exporter(&config)?;
        Ok(Self::with_provider(config, rules, provider)?.with_exporter(exporter))
    }

    pub fn with_provider(
        config: SyncConfig,
        rules: ScoringRules,
        provider: Box<dyn RecordProvider>,
    ) -> Result<Self> {
        let normalizer = Normalizer::new(&rules.noise_tokens).context("compiling noise tokens")?;
        let scorer = ReputationScorer::new(&rules).context("compiling reputation keywords")?;
        Ok(Self {
            store: WindowStore::new(config.store_path.clone()),
            config,
            provider,
            normalizer,
            scorer: Arc::new(scorer),
            exporter: Box::<NoopExporter>::default(),
            cycle_lock: Mutex::new(()),
        })
    }

    pub fn with_exporter(mut self, exporter: Box<dyn TableExporter>) -> Self {
        self.exporter = exporter;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &WindowStore {
        &self.store
    }

    pub async fn run_cycle(&self) -> Result<CycleSummary, SyncError> {
        self.run_cycle_at(Utc::now()).await
    }

    /// Runs a cycle under the configured wall-clock limit, if any.
    ///
    /// Expiry drops the in-flight cycle before it reaches the atomic rename, so
    /// the persisted table stays at its previous value.
    pub async fn run_cycle_with_timeout(&self) -> Result<CycleSummary, SyncError> {
        match self.config.cycle_timeout {
            Some(limit) => tokio::time::timeout(limit, self.run_cycle())
                .await
                .map_err(|_| {
                    warn!(?limit, "sync cycle timed out; persisted table left untouched");
                    SyncError::Timeout(limit)
                })?,
            None => self.run_cycle().await,
        }
    }

    pub async fn run_cycle_at(&self, now: DateTime<Utc>) -> Result<CycleSummary, SyncError> {
        let _guard = self.cycle_lock.lock().await;
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_cycle", %run_id, provider = self.provider.provider_id());
        let mut state = CycleState::new();

        let result = self.cycle(run_id, now, &mut state).instrument(span.clone()).await;
        if let Err(err) = &result {
            let failed_at = state.phase;
            span.in_scope(|| {
                if failed_at == CyclePhase::Persisted {
                    error!(error = %err, "sync cycle failed after the table was persisted");
                } else {
                    state.advance(CyclePhase::Aborted);
                    error!(
                        error = %err,
                        phase = ?failed_at,
                        rate_limited = err.is_rate_limited(),
                        "sync cycle aborted; persisted table left untouched"
                    );
                }
            });
        }
        result
    }

    async fn cycle(
        &self,
        run_id: Uuid,
        now: DateTime<Utc>,
        state: &mut CycleState,
    ) -> Result<CycleSummary, SyncError> {
        let started_at = Utc::now();
        let cutoff = retention_cutoff(now, self.config.retention_days);

        let mut existing = self.store.load()?;
        state.advance(CyclePhase::Loaded);
        let mut pruned = existing.prune(cutoff);

        let query = ProviderQuery::new(
            self.config.category.clone(),
            now - chrono::Duration::days(i64::from(self.config.lookback_days)),
            now,
        );
        let raws = self
            .provider
            .fetch(&query, self.config.max_results_per_fetch)
            .await?;
        let fetched = raws.len();

        let batch = self.normalizer.normalize_all(&raws, now.date_naive());
        let (known, fresh): (Vec<_>, Vec<_>) = batch
            .records
            .into_iter()
            .partition(|record| existing.contains(&record.id));
        let fresh = WindowTable::from_records(fresh).into_records();
        let fresh_ids = fresh.iter().map(|r| r.id.clone()).collect::<Vec<_>>();
        let scored = score_records(self.scorer.clone(), fresh, self.config.scoring_concurrency).await?;

        // Known ids take the fetched fields but keep their stored reputation.
        let refreshed = WindowTable::from_records(known)
            .into_records()
            .into_iter()
            .map(|mut record| {
                if let Some(stored) = existing.get(&record.id) {
                    record.reputation = stored.reputation;
                }
                record
            })
            .collect::<Vec<_>>();
        let already_known = refreshed.len();

        state.advance(CyclePhase::Merging);
        let mut merged = existing.merge(refreshed.into_iter().chain(scored));

        state.advance(CyclePhase::Pruning);
        pruned += merged.prune(cutoff);
        let records_added = fresh_ids.iter().filter(|id| merged.contains(id)).count();

        let persisted = self.store.persist(&merged)?;
        state.advance(CyclePhase::Persisted);

        let manifest_path = manifest_path_for(&persisted.path);
        self.finish_persist(&persisted, &manifest_path).await?;

        let summary = CycleSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            cutoff_date: cutoff,
            fetched,
            rejected: batch.rejected,
            already_known,
            records_added,
            pruned,
            records_written: persisted.rows,
            enhanced: merged.count_by_reputation(Reputation::Enhanced),
            table_path: persisted.path.display().to_string(),
            table_sha256: persisted.sha256.clone(),
            manifest_path: manifest_path.display().to_string(),
        };
        info!(
            fetched = summary.fetched,
            added = summary.records_added,
            known = summary.already_known,
            rejected = summary.rejected,
            pruned = summary.pruned,
            written = summary.records_written,
            "sync cycle complete"
        );
        Ok(summary)
    }

    pub async fn rescan_all(&self) -> Result<RescanSummary, SyncError> {
        self.rescan_all_at(Utc::now()).await
    }

    /// Re-derives embedding text and re-scores every stored record with the
    /// current rules. Maintenance only; regular cycles never rescore known ids.
    pub async fn rescan_all_at(&self, now: DateTime<Utc>) -> Result<RescanSummary, SyncError> {
        let _guard = self.cycle_lock.lock().await;
        let run_id = Uuid::new_v4();
        let span = info_span!("rescan", %run_id);
        self.rescan(run_id, now).instrument(span).await
    }

    async fn rescan(&self, run_id: Uuid, now: DateTime<Utc>) -> Result<RescanSummary, SyncError> {
        let cutoff = retention_cutoff(now, self.config.retention_days);
        let mut table = self.store.load()?;
        let pruned = table.prune(cutoff);

        let previous = table
            .iter()
            .map(|r| (r.id.clone(), r.reputation))
            .collect::<BTreeMap<_, _>>();
        let mut records = table.into_records();
        for record in &mut records {
            record.rederive_embedding_text(self.normalizer.noise());
        }
        let rescored = score_records(self.scorer.clone(), records, self.config.scoring_concurrency).await?;
        let reclassified = rescored
            .iter()
            .filter(|r| previous.get(&r.id) != Some(&r.reputation))
            .count();

        let table = WindowTable::from_records(rescored);
        let persisted = self.store.persist(&table)?;
        self.finish_persist(&persisted, &manifest_path_for(&persisted.path))
            .await?;

        info!(records = persisted.rows, reclassified, pruned, "rescan complete");
        Ok(RescanSummary {
            run_id,
            cutoff_date: cutoff,
            pruned,
            records_written: persisted.rows,
            reclassified,
            enhanced: table.count_by_reputation(Reputation::Enhanced),
            table_sha256: persisted.sha256,
        })
    }

    async fn finish_persist(&self, persisted: &PersistedTable, manifest_path: &Path) -> Result<(), SyncError> {
        write_manifest(manifest_path, &TableManifest::new(persisted))
            .map_err(|e| SyncError::Export(format!("{e:#}")))?;
        let export = ExportTable::for_persisted(persisted, manifest_path.to_path_buf());
        self.exporter
            .export(&export)
            .await
            .map_err(|e| SyncError::Export(format!("{e:#}")))
    }
}

/// Cron job running guarded cycles; `None` when scheduling is disabled.
pub async fn maybe_build_scheduler(pipeline: Arc<SyncPipeline>) -> Result<Option<JobScheduler>> {
    if !pipeline.config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = pipeline.config.sync_cron.clone();
    let job = Job::new_async(&cron, move |_uuid, _l| {
        let pipeline = pipeline.clone();
        Box::pin(async move {
            match pipeline.run_cycle_with_timeout().await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    added = summary.records_added,
                    written = summary.records_written,
                    "scheduled sync finished"
                ),
                Err(err) => error!(error = %err, "scheduled sync failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

pub fn pipeline_from_env() -> Result<SyncPipeline> {
    let config = SyncConfig::from_env()?;
    let rules = ScoringRules::from_workspace_root(&config.workspace_root)?;
    SyncPipeline::new(config, rules)
}

pub async fn run_sync_once_from_env() -> Result<CycleSummary> {
    let pipeline = pipeline_from_env()?;
    Ok(pipeline.run_cycle_with_timeout().await?)
}

pub async fn run_rescan_from_env() -> Result<RescanSummary> {
    let pipeline = pipeline_from_env()?;
    Ok(pipeline.rescan_all().await?)
}
