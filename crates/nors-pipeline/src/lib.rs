//! Pipeline orchestration for NORS: scheduled ingestion sweeps, bounded
//! enrichment, facility scoring, and run reporting.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Semaphore;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::warn;
use uuid::Uuid;

use nors_adapters::{adapter_for_source, AdapterContext, ListingTarget};
use nors_advisor::{TierLimits, TierLimitsTable};
use nors_core::{Enrichment, EnrichmentState, JobPosting, Specialty, UserProfile};
use nors_scoring::{median, score_facility, FacilityInputs, ScoringWeights};
use nors_store::{
    write_atomic, FacilityStore, HttpClientConfig, HttpFetcher, JobStore, StoreCheckpoint,
    UpsertOutcome,
};

pub const CRATE_NAME: &str = "nors-pipeline";

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    #[serde(default)]
    pub listing_urls: Vec<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub workspace_root: PathBuf,
    pub checkpoint_path: PathBuf,
    pub watermark_path: PathBuf,
    pub scheduler_enabled: bool,
    pub ingest_cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub freshness_hours: i64,
    pub enrichment_concurrency: usize,
    pub enrichment_timeout_secs: u64,
    pub max_enrichment_attempts: u8,
    pub enrichment_url: Option<String>,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let workspace_root = std::env::var("NORS_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        Self {
            checkpoint_path: workspace_root.join("state").join("checkpoint.json"),
            watermark_path: workspace_root.join("state").join("enrichment_watermark.json"),
            scheduler_enabled: std::env::var("NORS_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            ingest_cron: std::env::var("NORS_INGEST_CRON")
                .unwrap_or_else(|_| "0 0 * * * *".to_string()),
            user_agent: std::env::var("NORS_USER_AGENT")
                .unwrap_or_else(|_| "nors-bot/0.1".to_string()),
            http_timeout_secs: std::env::var("NORS_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            freshness_hours: std::env::var("NORS_FRESHNESS_HOURS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(72),
            enrichment_concurrency: std::env::var("NORS_ENRICHMENT_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8),
            enrichment_timeout_secs: std::env::var("NORS_ENRICHMENT_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            max_enrichment_attempts: std::env::var("NORS_MAX_ENRICHMENT_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3),
            enrichment_url: std::env::var("NORS_ENRICHMENT_URL").ok(),
            workspace_root,
        }
    }

    /// Postings not seen within this window read as closed.
    pub fn freshness(&self) -> chrono::Duration {
        chrono::Duration::hours(self.freshness_hours)
    }
}

#[derive(Debug, Error)]
pub enum EnrichError {
    #[error("enrichment backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("enrichment timed out after {0:?}")]
    Timeout(Duration),
}

#[async_trait]
pub trait EnrichmentBackend: Send + Sync {
    async fn enrich(&self, posting: &JobPosting) -> Result<Enrichment, EnrichError>;
}

#[derive(Debug, Clone, Deserialize)]
struct SpecialtyRulesFile {
    #[serde(default)]
    rules: Vec<TagRule>,
}

#[derive(Debug, Clone, Deserialize)]
struct TagRule {
    tag: String,
    contains_any: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct PayRulesFile {
    #[serde(default)]
    defaults: Vec<PayDefault>,
}

#[derive(Debug, Clone, Deserialize)]
struct PayDefault {
    specialty: Specialty,
    pay_min: f64,
    pay_max: f64,
}

/// Local, infallible enrichment driven by YAML rule files. The default
/// backend: derives specialty tags, fills missing pay ranges from per-specialty
/// defaults, and renders a one-line summary.
pub struct RuleBasedBackend {
    tag_rules: Vec<TagRule>,
    pay_defaults: HashMap<Specialty, (f64, f64)>,
}

impl RuleBasedBackend {
    pub fn from_workspace_root(root: &Path) -> Result<Self> {
        let rules_dir = root.join("rules");
        let specialties: SpecialtyRulesFile = serde_yaml::from_str(
            &std::fs::read_to_string(rules_dir.join("specialties.yaml"))
                .context("reading rules/specialties.yaml")?,
        )
        .context("parsing rules/specialties.yaml")?;
        let pay: PayRulesFile = serde_yaml::from_str(
            &std::fs::read_to_string(rules_dir.join("pay.yaml"))
                .context("reading rules/pay.yaml")?,
        )
        .context("parsing rules/pay.yaml")?;
        Ok(Self {
            tag_rules: specialties.rules,
            pay_defaults: pay
                .defaults
                .into_iter()
                .map(|d| (d.specialty, (d.pay_min, d.pay_max)))
                .collect(),
        })
    }

    fn derive(&self, posting: &JobPosting) -> Enrichment {
        let haystack =
            format!("{} {}", posting.title, posting.specialty.as_str()).to_ascii_lowercase();
        let mut specialty_tags = vec![posting.specialty.as_str().to_ascii_lowercase()];
        for rule in &self.tag_rules {
            if rule
                .contains_any
                .iter()
                .any(|needle| haystack.contains(&needle.to_ascii_lowercase()))
                && !specialty_tags.contains(&rule.tag)
            {
                specialty_tags.push(rule.tag.clone());
            }
        }

        let defaults = self.pay_defaults.get(&posting.specialty);
        let pay_min = match (posting.pay_min, defaults) {
            (None, Some((low, _))) => Some(*low),
            _ => None,
        };
        let pay_max = match (posting.pay_max, defaults) {
            (None, Some((_, high))) => Some(*high),
            _ => None,
        };

        let summary = match posting.pay_max.or(pay_max) {
            Some(ceiling) => format!(
                "{} at {} in {}, {}; pays up to ${ceiling:.0}/hr",
                posting.title, posting.facility_name, posting.city, posting.state
            ),
            None => format!(
                "{} at {} in {}, {}",
                posting.title, posting.facility_name, posting.city, posting.state
            ),
        };

        Enrichment {
            specialty_tags,
            pay_min,
            pay_max,
            summary,
        }
    }
}

#[async_trait]
impl EnrichmentBackend for RuleBasedBackend {
    async fn enrich(&self, posting: &JobPosting) -> Result<Enrichment, EnrichError> {
        Ok(self.derive(posting))
    }
}

/// Remote enrichment over HTTP. Posts the canonical record and expects an
/// `Enrichment` JSON body back; transport retries and backoff come from the
/// shared fetcher.
pub struct HttpEnrichmentBackend {
    http: Arc<HttpFetcher>,
    url: String,
    session_id: Uuid,
}

impl HttpEnrichmentBackend {
    pub fn new(http: Arc<HttpFetcher>, url: String) -> Self {
        Self {
            http,
            url,
            session_id: Uuid::new_v4(),
        }
    }
}

#[async_trait]
impl EnrichmentBackend for HttpEnrichmentBackend {
    async fn enrich(&self, posting: &JobPosting) -> Result<Enrichment, EnrichError> {
        let response = self
            .http
            .post_json(self.session_id, "enrichment", &self.url, posting)
            .await
            .map_err(|err| EnrichError::BackendUnavailable(err.to_string()))?;
        serde_json::from_slice(&response.body).map_err(|err| {
            EnrichError::BackendUnavailable(format!("malformed backend response: {err}"))
        })
    }
}

/// Marker for the last completed enrichment pass, persisted atomically so a
/// re-run of the same pipeline invocation is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichmentWatermark {
    pub run_id: Uuid,
    pub completed_at: DateTime<Utc>,
}

impl EnrichmentWatermark {
    pub async fn save(&self, path: &Path) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(self).context("serializing watermark")?;
        write_atomic(path, &bytes).await
    }

    pub async fn load(path: &Path) -> Result<Option<Self>> {
        match fs::read(path).await {
            Ok(bytes) => {
                let watermark = serde_json::from_slice(&bytes)
                    .with_context(|| format!("parsing watermark {}", path.display()))?;
                Ok(Some(watermark))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => {
                Err(err).with_context(|| format!("reading watermark {}", path.display()))
            }
        }
    }
}

/// Per-source tallies for one ingestion sweep, reported in the run summary.
#[derive(Debug, Clone, Serialize)]
pub struct SourceOutcome {
    pub source_id: String,
    pub fetched_listings: usize,
    pub parsed: usize,
    pub inserted: usize,
    pub refreshed: usize,
    pub updated: usize,
    pub skipped: usize,
    pub skip_reasons: Vec<String>,
    pub facilities: usize,
    pub error: Option<String>,
}

impl SourceOutcome {
    fn new(source_id: String) -> Self {
        Self {
            source_id,
            fetched_listings: 0,
            parsed: 0,
            inserted: 0,
            refreshed: 0,
            updated: 0,
            skipped: 0,
            skip_reasons: Vec::new(),
            facilities: 0,
            error: None,
        }
    }
}

#[derive(Debug)]
pub struct IngestReport {
    pub outcomes: Vec<SourceOutcome>,
    pub touched_facilities: BTreeSet<Uuid>,
}

#[derive(Debug, Clone)]
pub struct EnrichmentReport {
    pub enriched: usize,
    pub failed: usize,
    pub permanently_failed: usize,
    pub watermark: EnrichmentWatermark,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources: Vec<SourceOutcome>,
    pub enriched: usize,
    pub enrichment_failures: usize,
    pub permanently_failed: usize,
    pub scored_facilities: usize,
}

enum EnrichOutcome {
    Enriched,
    Retryable,
    Exhausted,
}

pub struct Pipeline {
    config: PipelineConfig,
    http: Arc<HttpFetcher>,
    jobs: Arc<JobStore>,
    facilities: Arc<FacilityStore>,
    weights: ScoringWeights,
    backend: Arc<dyn EnrichmentBackend>,
}

impl Pipeline {
    /// Builds the pipeline: validates weights, restores the last checkpoint
    /// when one exists, and selects the enrichment backend. Configuration
    /// errors are fatal here, before any writes.
    pub async fn from_config(config: PipelineConfig) -> Result<Self> {
        let weights = load_weights(&config.workspace_root)?;
        let http = Arc::new(HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?);
        let (jobs, facilities) = if fs::try_exists(&config.checkpoint_path).await.unwrap_or(false)
        {
            StoreCheckpoint::load(&config.checkpoint_path).await?.restore()
        } else {
            (JobStore::new(), FacilityStore::new())
        };
        let backend: Arc<dyn EnrichmentBackend> = match &config.enrichment_url {
            Some(url) => Arc::new(HttpEnrichmentBackend::new(Arc::clone(&http), url.clone())),
            None => Arc::new(RuleBasedBackend::from_workspace_root(&config.workspace_root)?),
        };
        Ok(Self {
            config,
            http,
            jobs: Arc::new(jobs),
            facilities: Arc::new(facilities),
            weights,
            backend,
        })
    }

    pub fn with_backend(mut self, backend: Arc<dyn EnrichmentBackend>) -> Self {
        self.backend = backend;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn job_store(&self) -> Arc<JobStore> {
        Arc::clone(&self.jobs)
    }

    pub fn facility_store(&self) -> Arc<FacilityStore> {
        Arc::clone(&self.facilities)
    }

    pub fn weights(&self) -> &ScoringWeights {
        &self.weights
    }

    /// One full sweep: ingest every enabled source, enrich the pending pool,
    /// rescore touched facilities, checkpoint, and write the run summary.
    pub async fn run_once(&self) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let registry = SourceRegistry::load(&self.config.workspace_root.join("sources.yaml")).await?;

        let ingest = self.run_ingestion(run_id, &registry).await?;
        let previous = EnrichmentWatermark::load(&self.config.watermark_path).await?;
        let enrichment = self.run_enrichment(run_id, previous).await?;
        let scored = self
            .score_facilities(&ingest.touched_facilities, Utc::now())
            .await?;

        self.save_checkpoint().await?;

        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            sources: ingest.outcomes,
            enriched: enrichment.enriched,
            enrichment_failures: enrichment.failed,
            permanently_failed: enrichment.permanently_failed,
            scored_facilities: scored,
        };
        self.write_run_summary(&summary).await?;
        Ok(summary)
    }

    /// Sweeps every enabled source as an independent task. Per-record and
    /// per-source failures are contained; the run is fatal only when no
    /// source completes at all.
    pub async fn run_ingestion(
        &self,
        run_id: Uuid,
        registry: &SourceRegistry,
    ) -> Result<IngestReport> {
        let ctx = AdapterContext {
            run_id,
            fetched_at: Utc::now(),
        };
        let mut tasks = Vec::new();
        for source in registry.sources.iter().filter(|s| s.enabled).cloned() {
            let http = Arc::clone(&self.http);
            let jobs = Arc::clone(&self.jobs);
            let facilities = Arc::clone(&self.facilities);
            tasks.push(tokio::spawn(ingest_source(
                http, jobs, facilities, ctx, source,
            )));
        }

        let mut outcomes = Vec::new();
        let mut touched_facilities = BTreeSet::new();
        for task in tasks {
            let (outcome, touched) = task.await.context("joining ingestion task")?;
            touched_facilities.extend(touched);
            outcomes.push(outcome);
        }

        if outcomes.is_empty() || outcomes.iter().all(|o| o.error.is_some()) {
            bail!("ingestion run completed no source sweep");
        }
        Ok(IngestReport {
            outcomes,
            touched_facilities,
        })
    }

    /// Fans the pending pool out under a semaphore, one timeout-bounded
    /// backend call per record, and persists a fresh watermark. Passing the
    /// watermark of the same `run_id` back in makes the call a no-op.
    pub async fn run_enrichment(
        &self,
        run_id: Uuid,
        previous: Option<EnrichmentWatermark>,
    ) -> Result<EnrichmentReport> {
        if let Some(previous) = previous {
            if previous.run_id == run_id {
                return Ok(EnrichmentReport {
                    enriched: 0,
                    failed: 0,
                    permanently_failed: 0,
                    watermark: previous,
                });
            }
        }

        let pending = self.jobs.pending_enrichment().await;
        let semaphore = Arc::new(Semaphore::new(self.config.enrichment_concurrency.max(1)));
        let timeout = Duration::from_secs(self.config.enrichment_timeout_secs);
        let retry_cap = self.config.max_enrichment_attempts;

        let mut tasks = Vec::new();
        for posting in pending {
            let semaphore = Arc::clone(&semaphore);
            let backend = Arc::clone(&self.backend);
            let jobs = Arc::clone(&self.jobs);
            tasks.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore not closed");
                let failure = match tokio::time::timeout(timeout, backend.enrich(&posting)).await {
                    Ok(Ok(enrichment)) => {
                        jobs.mark_enriched(&posting.fingerprint, enrichment).await?;
                        return Ok(EnrichOutcome::Enriched);
                    }
                    Ok(Err(err)) => err,
                    Err(_) => EnrichError::Timeout(timeout),
                };
                warn!(
                    fingerprint = %posting.fingerprint,
                    error = %failure,
                    "enrichment attempt failed"
                );
                let state = jobs
                    .mark_enrichment_failure(&posting.fingerprint, retry_cap)
                    .await?;
                Ok(if state == EnrichmentState::PermanentlyFailed {
                    EnrichOutcome::Exhausted
                } else {
                    EnrichOutcome::Retryable
                })
            }));
        }

        let mut enriched = 0;
        let mut failed = 0;
        let mut permanently_failed = 0;
        for task in tasks {
            let outcome: Result<EnrichOutcome, nors_store::StoreError> =
                task.await.context("joining enrichment task")?;
            match outcome.context("recording enrichment outcome")? {
                EnrichOutcome::Enriched => enriched += 1,
                EnrichOutcome::Retryable => failed += 1,
                EnrichOutcome::Exhausted => {
                    failed += 1;
                    permanently_failed += 1;
                }
            }
        }

        let watermark = EnrichmentWatermark {
            run_id,
            completed_at: Utc::now(),
        };
        watermark.save(&self.config.watermark_path).await?;
        Ok(EnrichmentReport {
            enriched,
            failed,
            permanently_failed,
            watermark,
        })
    }

    /// Rescores the given facilities against the current open-job snapshot.
    pub async fn score_facilities(
        &self,
        ids: &BTreeSet<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let region_pay = self.region_median_pay(now).await;
        let freshness = self.config.freshness();
        let mut scored = 0;
        for id in ids {
            let Some(facility) = self.facilities.get(*id).await else {
                continue;
            };
            let open: Vec<JobPosting> = self
                .jobs
                .jobs_for_facility(*id)
                .await
                .into_iter()
                .filter(|job| job.is_open(now, freshness))
                .collect();
            let region_median = region_pay
                .get(&facility.state.to_ascii_uppercase())
                .copied();
            let inputs = FacilityInputs::aggregate(&open, facility.attributes.clone(), region_median);
            let scores = score_facility(&inputs, &self.weights);
            self.facilities
                .apply_scores(*id, scores.indices, scores.composite, scores.grade, now)
                .await?;
            scored += 1;
        }
        Ok(scored)
    }

    /// Full recompute, the scheduled decay catch-up: stale postings fall out
    /// of the open set and drag their facility's indices with them.
    pub async fn score_all(&self, now: DateTime<Utc>) -> Result<usize> {
        let ids: BTreeSet<Uuid> = self
            .facilities
            .snapshot()
            .await
            .into_iter()
            .map(|f| f.id)
            .collect();
        self.score_facilities(&ids, now).await
    }

    pub async fn save_checkpoint(&self) -> Result<()> {
        let checkpoint = StoreCheckpoint::capture(&self.jobs, &self.facilities, Utc::now()).await;
        checkpoint.save(&self.config.checkpoint_path).await
    }

    pub async fn write_run_summary(&self, summary: &RunSummary) -> Result<PathBuf> {
        let path = self
            .config
            .workspace_root
            .join("reports")
            .join(summary.run_id.to_string())
            .join("run_summary.json");
        let bytes = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
        write_atomic(&path, &bytes).await?;
        Ok(path)
    }

    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let pipeline = Arc::clone(self);
        let job = Job::new_async(self.config.ingest_cron.as_str(), move |_uuid, _lock| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                if let Err(err) = pipeline.run_once().await {
                    warn!(error = %err, "scheduled pipeline run failed");
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {}", self.config.ingest_cron))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }

    async fn region_median_pay(&self, now: DateTime<Utc>) -> HashMap<String, f64> {
        let freshness = self.config.freshness();
        let mut by_state: HashMap<String, Vec<f64>> = HashMap::new();
        for job in self.jobs.snapshot().await {
            if !job.is_open(now, freshness) {
                continue;
            }
            if let Some(pay) = job.effective_pay_max() {
                by_state
                    .entry(job.state.to_ascii_uppercase())
                    .or_default()
                    .push(pay);
            }
        }
        by_state
            .into_iter()
            .filter_map(|(state, values)| median(values).map(|m| (state, m)))
            .collect()
    }
}

async fn ingest_source(
    http: Arc<HttpFetcher>,
    jobs: Arc<JobStore>,
    facilities: Arc<FacilityStore>,
    ctx: AdapterContext,
    source: SourceConfig,
) -> (SourceOutcome, BTreeSet<Uuid>) {
    let mut outcome = SourceOutcome::new(source.source_id.clone());
    let mut touched = BTreeSet::new();

    let Some(adapter) = adapter_for_source(&source.source_id) else {
        warn!(source_id = %source.source_id, "no adapter registered");
        outcome.error = Some("no adapter registered".to_string());
        return (outcome, touched);
    };

    let targets: Vec<ListingTarget> = source
        .listing_urls
        .iter()
        .map(|url| ListingTarget { url: url.clone() })
        .collect();
    let listings = match adapter.fetch_listing(&http, &ctx, &targets).await {
        Ok(listings) => listings,
        Err(err) => {
            warn!(source_id = %source.source_id, error = %err, "listing fetch failed");
            outcome.error = Some(err.to_string());
            return (outcome, touched);
        }
    };
    outcome.fetched_listings = listings.len();

    for listing in &listings {
        let parsed = match adapter.parse_listing(listing) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(source_id = %source.source_id, error = %err, "listing unparseable");
                outcome.skipped += 1;
                outcome.skip_reasons.push(err.to_string());
                continue;
            }
        };

        outcome.parsed += parsed.jobs.len();
        for skip in parsed.skipped {
            warn!(source_id = %source.source_id, reason = %skip.reason, "record skipped");
            outcome.skipped += 1;
            outcome.skip_reasons.push(skip.reason);
        }

        for draft in parsed.jobs {
            let fingerprint = draft.fingerprint();
            let facility_id = draft.facility_id();
            match jobs.upsert(draft, ctx.fetched_at).await {
                UpsertOutcome::Inserted => {
                    outcome.inserted += 1;
                    touched.insert(facility_id);
                }
                UpsertOutcome::Updated => {
                    outcome.updated += 1;
                    touched.insert(facility_id);
                }
                UpsertOutcome::Refreshed => outcome.refreshed += 1,
            }
            if let Some(posting) = jobs.get(&fingerprint).await {
                facilities.ensure_for_job(&posting).await;
            }
        }

        for facility_draft in parsed.facilities {
            let id = facilities.upsert_metadata(facility_draft).await;
            touched.insert(id);
            outcome.facilities += 1;
        }
    }

    (outcome, touched)
}

pub fn load_weights(root: &Path) -> Result<ScoringWeights> {
    let path = root.join("rules").join("weights.yaml");
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    ScoringWeights::from_yaml_str(&text).with_context(|| format!("validating {}", path.display()))
}

pub fn load_tier_limits(root: &Path) -> Result<TierLimitsTable> {
    #[derive(Deserialize)]
    struct TiersFile {
        tiers: BTreeMap<String, TierLimits>,
    }
    let path = root.join("rules").join("tiers.yaml");
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    let file: TiersFile =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    TierLimitsTable::from_named(&file.tiers).context("validating tier limits")
}

/// Profiles belong to the external account system; a missing file means no
/// known users, not an error.
pub fn load_profiles(root: &Path) -> Result<HashMap<Uuid, UserProfile>> {
    #[derive(Deserialize)]
    struct ProfilesFile {
        profiles: Vec<UserProfile>,
    }
    let path = root.join("profiles.yaml");
    let text = match std::fs::read_to_string(&path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(err) => {
            return Err(err).with_context(|| format!("reading {}", path.display()));
        }
    };
    let file: ProfilesFile =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(file.profiles.into_iter().map(|p| (p.id, p)).collect())
}
