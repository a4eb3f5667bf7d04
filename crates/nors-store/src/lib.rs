//! Canonical record store, checkpointing, and HTTP fetch utilities for NORS.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use nors_core::{
    Enrichment, EnrichmentState, Facility, FacilityAttributes, FacilityDraft, Grade, IndexCode,
    JobDraft, JobPosting,
};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tracing::info_span;
use uuid::Uuid;

pub const CRATE_NAME: &str = "nors-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no posting with fingerprint {0}")]
    UnknownFingerprint(String),
    #[error("no facility with id {0}")]
    UnknownFacility(Uuid),
}

/// Outcome of an upsert, reported per record in the run summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted,
    Refreshed,
    Updated,
}

/// In-memory canonical posting store keyed by fingerprint.
///
/// Writes to the same fingerprint are serialized through a keyed lock map;
/// writes to distinct fingerprints only contend on the map itself. Readers
/// take cloned snapshots so scoring never observes a half-applied batch.
#[derive(Debug, Default)]
pub struct JobStore {
    records: RwLock<HashMap<String, JobPosting>>,
    write_locks: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: Vec<JobPosting>) -> Self {
        let map = records
            .into_iter()
            .map(|job| (job.fingerprint.clone(), job))
            .collect();
        Self {
            records: RwLock::new(map),
            write_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn write_lock_for(&self, fingerprint: &str) -> Arc<Semaphore> {
        let mut map = self.write_locks.lock().await;
        map.entry(fingerprint.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone()
    }

    /// Upsert a draft under its fingerprint.
    ///
    /// Unseen fingerprints insert a fresh posting. A matching `raw_hash` only
    /// advances `last_seen_at`, so replaying a batch with the same `seen_at`
    /// leaves the store byte-identical. A changed `raw_hash` merges the new
    /// fields, preserves `first_seen_at`, and resets the record to
    /// `Unprocessed` so enrichment runs again.
    pub async fn upsert(&self, draft: JobDraft, seen_at: DateTime<Utc>) -> UpsertOutcome {
        let fingerprint = draft.fingerprint();
        let lock = self.write_lock_for(&fingerprint).await;
        let _permit = lock.acquire().await.expect("semaphore not closed");

        let existing = {
            let records = self.records.read().await;
            records.get(&fingerprint).cloned()
        };

        match existing {
            None => {
                let posting = JobPosting::from_draft(draft, seen_at);
                self.records.write().await.insert(fingerprint, posting);
                UpsertOutcome::Inserted
            }
            Some(current) if current.raw_hash == draft.raw_hash => {
                if seen_at > current.last_seen_at {
                    let mut refreshed = current;
                    refreshed.last_seen_at = seen_at;
                    self.records.write().await.insert(fingerprint, refreshed);
                }
                UpsertOutcome::Refreshed
            }
            Some(current) => {
                let mut merged = JobPosting::from_draft(draft, seen_at);
                merged.first_seen_at = current.first_seen_at;
                self.records.write().await.insert(fingerprint, merged);
                UpsertOutcome::Updated
            }
        }
    }

    pub async fn get(&self, fingerprint: &str) -> Option<JobPosting> {
        self.records.read().await.get(fingerprint).cloned()
    }

    /// Cloned snapshot of every posting, in no particular order.
    pub async fn snapshot(&self) -> Vec<JobPosting> {
        self.records.read().await.values().cloned().collect()
    }

    pub async fn jobs_for_facility(&self, facility_id: Uuid) -> Vec<JobPosting> {
        self.records
            .read()
            .await
            .values()
            .filter(|job| job.facility_id == facility_id)
            .cloned()
            .collect()
    }

    /// Postings still eligible for the enrichment stage.
    pub async fn pending_enrichment(&self) -> Vec<JobPosting> {
        self.records
            .read()
            .await
            .values()
            .filter(|job| job.enrichment_state.needs_enrichment())
            .cloned()
            .collect()
    }

    /// Atomically mark a posting enriched and attach the derived fields.
    pub async fn mark_enriched(
        &self,
        fingerprint: &str,
        enrichment: Enrichment,
    ) -> Result<(), StoreError> {
        let lock = self.write_lock_for(fingerprint).await;
        let _permit = lock.acquire().await.expect("semaphore not closed");

        let mut records = self.records.write().await;
        let record = records
            .get_mut(fingerprint)
            .ok_or_else(|| StoreError::UnknownFingerprint(fingerprint.to_string()))?;
        record.enrichment_state = EnrichmentState::Enriched;
        record.enrichment = Some(enrichment);
        Ok(())
    }

    /// Record one failed enrichment attempt. At `retry_cap` total attempts the
    /// posting is promoted to `PermanentlyFailed` and leaves the retry pool.
    pub async fn mark_enrichment_failure(
        &self,
        fingerprint: &str,
        retry_cap: u8,
    ) -> Result<EnrichmentState, StoreError> {
        let lock = self.write_lock_for(fingerprint).await;
        let _permit = lock.acquire().await.expect("semaphore not closed");

        let mut records = self.records.write().await;
        let record = records
            .get_mut(fingerprint)
            .ok_or_else(|| StoreError::UnknownFingerprint(fingerprint.to_string()))?;

        let next = match record.enrichment_state {
            EnrichmentState::Failed { attempts } if attempts.saturating_add(1) >= retry_cap => {
                EnrichmentState::PermanentlyFailed
            }
            EnrichmentState::Failed { attempts } => EnrichmentState::Failed {
                attempts: attempts + 1,
            },
            _ if retry_cap <= 1 => EnrichmentState::PermanentlyFailed,
            _ => EnrichmentState::Failed { attempts: 1 },
        };
        record.enrichment_state = next;
        Ok(next)
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

/// Canonical facility store keyed by the deterministic facility id.
#[derive(Debug, Default)]
pub struct FacilityStore {
    records: RwLock<HashMap<Uuid, Facility>>,
}

impl FacilityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: Vec<Facility>) -> Self {
        let map = records.into_iter().map(|f| (f.id, f)).collect();
        Self {
            records: RwLock::new(map),
        }
    }

    /// Upsert facility metadata. Fields present on the draft overwrite stored
    /// attributes; absent fields keep whatever an earlier sweep recorded.
    pub async fn upsert_metadata(&self, draft: FacilityDraft) -> Uuid {
        let id = draft.facility_id();
        let mut records = self.records.write().await;
        match records.get_mut(&id) {
            Some(existing) => merge_attributes(&mut existing.attributes, draft.attributes),
            None => {
                records.insert(id, Facility::from_draft(draft));
            }
        }
        id
    }

    /// Make sure a facility row exists for a posting's facility, so scoring
    /// always has somewhere to land even before the metadata source ran.
    pub async fn ensure_for_job(&self, job: &JobPosting) -> Uuid {
        let id = job.facility_id;
        let mut records = self.records.write().await;
        records.entry(id).or_insert_with(|| {
            Facility::from_draft(FacilityDraft {
                name: job.facility_name.clone(),
                city: job.city.clone(),
                state: job.state.clone(),
                attributes: FacilityAttributes::default(),
            })
        });
        id
    }

    pub async fn get(&self, id: Uuid) -> Option<Facility> {
        self.records.read().await.get(&id).cloned()
    }

    pub async fn snapshot(&self) -> Vec<Facility> {
        self.records.read().await.values().cloned().collect()
    }

    /// Attach a freshly computed score set to a facility in one transition.
    pub async fn apply_scores(
        &self,
        id: Uuid,
        indices: std::collections::BTreeMap<IndexCode, f64>,
        composite_score: f64,
        grade: Grade,
        scored_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        let facility = records.get_mut(&id).ok_or(StoreError::UnknownFacility(id))?;
        facility.indices = indices;
        facility.composite_score = composite_score;
        facility.grade = grade;
        facility.last_scored_at = Some(scored_at);
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

fn merge_attributes(current: &mut FacilityAttributes, incoming: FacilityAttributes) {
    if incoming.nurse_to_patient_ratio.is_some() {
        current.nurse_to_patient_ratio = incoming.nurse_to_patient_ratio;
    }
    if incoming.retention_rate.is_some() {
        current.retention_rate = incoming.retention_rate;
    }
    if incoming.survey_wellbeing.is_some() {
        current.survey_wellbeing = incoming.survey_wellbeing;
    }
    if incoming.survey_autonomy.is_some() {
        current.survey_autonomy = incoming.survey_autonomy;
    }
    if incoming.payroll_dispute_rate.is_some() {
        current.payroll_dispute_rate = incoming.payroll_dispute_rate;
    }
    if incoming.cost_of_living_index.is_some() {
        current.cost_of_living_index = incoming.cost_of_living_index;
    }
    if incoming.tuition_reimbursement.is_some() {
        current.tuition_reimbursement = incoming.tuition_reimbursement;
    }
    if incoming.preceptorship_program.is_some() {
        current.preceptorship_program = incoming.preceptorship_program;
    }
    if incoming.childcare_support.is_some() {
        current.childcare_support = incoming.childcare_support;
    }
    if incoming.lift_team.is_some() {
        current.lift_team = incoming.lift_team;
    }
}

/// Write bytes through a same-directory temp file and an atomic rename, so a
/// crash mid-write never leaves a torn file at `path`.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("checkpoint path {} has no parent", path.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

/// On-disk snapshot of both stores. Committed upserts survive a pipeline
/// abort because every save goes through the atomic writer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreCheckpoint {
    pub saved_at: DateTime<Utc>,
    pub jobs: Vec<JobPosting>,
    pub facilities: Vec<Facility>,
}

impl StoreCheckpoint {
    pub async fn capture(
        jobs: &JobStore,
        facilities: &FacilityStore,
        saved_at: DateTime<Utc>,
    ) -> Self {
        Self {
            saved_at,
            jobs: jobs.snapshot().await,
            facilities: facilities.snapshot().await,
        }
    }

    pub async fn save(&self, path: &Path) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec_pretty(self).context("serializing checkpoint")?;
        write_atomic(path, &bytes).await
    }

    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let bytes = fs::read(path)
            .await
            .with_context(|| format!("reading checkpoint {}", path.display()))?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing checkpoint {}", path.display()))
    }

    pub fn restore(self) -> (JobStore, FacilityStore) {
        (
            JobStore::from_records(self.jobs),
            FacilityStore::from_records(self.facilities),
        )
    }
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

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
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
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            per_source_concurrency: 4,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Shared HTTP client for adapters and the remote enrichment backend.
///
/// Concurrency is capped globally and per source; transient failures retry
/// with exponential backoff, permanent ones surface immediately.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let request = self.client.get(url);
        self.execute(run_id, source_id, url, request).await
    }

    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
        body: &T,
    ) -> Result<FetchedResponse, FetchError> {
        let request = self.client.post(url).json(body);
        self.execute(run_id, source_id, url, request).await
    }

    async fn execute(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<FetchedResponse, FetchError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .expect("semaphore not closed");
        let per_source = self.per_source_semaphore(source_id).await;
        let _source = per_source.acquire().await.expect("semaphore not closed");

        let span = info_span!("http_request", %run_id, source_id, url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            let attempt_request = request
                .try_clone()
                .expect("request bodies are always buffered");

            match attempt_request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}
