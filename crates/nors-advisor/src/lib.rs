//! Personalization for NORS: the Market Advantage Score, recommendation
//! lists, quick insights, and the per-tier quota gate.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use nors_core::{Facility, Grade, JobPosting, NursingType, Specialty, Tier, UserProfile};

pub const CRATE_NAME: &str = "nors-advisor";

/// Factor weights for the composite market score. Must sum to 1.0.
pub const LICENSE_DEMAND_WEIGHT: f64 = 0.40;
pub const SPECIALTY_DEMAND_WEIGHT: f64 = 0.35;
pub const EXPERIENCE_MATCH_WEIGHT: f64 = 0.25;

pub const RECOMMENDATION_CAP: usize = 5;

const NEUTRAL_FACTOR: f64 = 50.0;
const SUGGESTION_THRESHOLD: f64 = 70.0;
const MAX_SUGGESTIONS: usize = 3;
const NEW_THIS_WEEK_DAYS: i64 = 7;
const INSIGHT_CAP: usize = 5;
const HOT_SPECIALTY_CAP: usize = 3;

/// Factor breakdown behind a market score, each on a 0..=100 scale.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MarketFactors {
    pub license_demand: f64,
    pub specialty_demand: f64,
    pub experience_match: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketScore {
    pub score: f64,
    pub grade: Grade,
    pub factors: MarketFactors,
    pub suggestions: Vec<String>,
}

/// A market score is only computed for profiles that state both a nursing
/// type and a specialty. Anything less gets a message, never a number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MarketScoreOutcome {
    Scored(MarketScore),
    Insufficient { message: String },
}

pub fn market_score(profile: &UserProfile, open_jobs: &[JobPosting]) -> MarketScoreOutcome {
    let (Some(nursing_type), Some(specialty)) = (profile.nursing_type, profile.specialty) else {
        return MarketScoreOutcome::Insufficient {
            message: "add your nursing type and specialty to unlock your market score".into(),
        };
    };
    let region = profile.region_preference.as_deref();
    let license_demand = demand_percentile(open_jobs, region, |job| {
        job_matches_nursing_type(job, nursing_type)
    });
    let specialty_demand = demand_percentile(open_jobs, region, |job| job.specialty == specialty);

    let matching: Vec<&JobPosting> = open_jobs
        .iter()
        .filter(|job| job.specialty == specialty && job_matches_nursing_type(job, nursing_type))
        .collect();
    let experience_match = if matching.is_empty() {
        NEUTRAL_FACTOR
    } else {
        let fits = matching
            .iter()
            .filter(|job| {
                job.required_experience
                    .map_or(true, |band| band.contains(profile.experience_years))
            })
            .count();
        100.0 * fits as f64 / matching.len() as f64
    };

    let factors = MarketFactors {
        license_demand,
        specialty_demand,
        experience_match,
    };
    let score = LICENSE_DEMAND_WEIGHT * factors.license_demand
        + SPECIALTY_DEMAND_WEIGHT * factors.specialty_demand
        + EXPERIENCE_MATCH_WEIGHT * factors.experience_match;
    MarketScoreOutcome::Scored(MarketScore {
        score,
        grade: Grade::from_score(score),
        factors,
        suggestions: build_suggestions(&factors),
    })
}

/// Percentile of the user's-region count of matching jobs against the
/// per-region reference distribution. A profile without a stated region is
/// compared at the mean regional count.
fn demand_percentile<F>(open_jobs: &[JobPosting], region: Option<&str>, matches: F) -> f64
where
    F: Fn(&JobPosting) -> bool,
{
    let mut per_region: BTreeMap<String, f64> = BTreeMap::new();
    for job in open_jobs.iter().filter(|job| matches(job)) {
        *per_region.entry(job.state.to_ascii_uppercase()).or_insert(0.0) += 1.0;
    }
    if per_region.is_empty() {
        return 0.0;
    }
    let counts: Vec<f64> = per_region.values().copied().collect();
    let sample = match region {
        Some(region) => per_region
            .get(&region.to_ascii_uppercase())
            .copied()
            .unwrap_or(0.0),
        None => counts.iter().sum::<f64>() / counts.len() as f64,
    };
    let at_or_below = counts.iter().filter(|count| **count <= sample).count();
    100.0 * at_or_below as f64 / counts.len() as f64
}

/// A posting that names a credential in its title only matches that license;
/// a credential-free title matches every license.
pub fn job_matches_nursing_type(job: &JobPosting, nursing_type: NursingType) -> bool {
    let credentials = title_credentials(&job.title);
    credentials.is_empty() || credentials.contains(&nursing_type)
}

fn title_credentials(title: &str) -> Vec<NursingType> {
    let lowered = title.to_ascii_lowercase();
    let mut found = Vec::new();
    for word in lowered.split(|c: char| !c.is_ascii_alphanumeric()) {
        let credential = match word {
            "rn" => NursingType::Rn,
            "lpn" | "lvn" => NursingType::Lpn,
            "cna" => NursingType::Cna,
            "aprn" | "np" => NursingType::Aprn,
            _ => continue,
        };
        if !found.contains(&credential) {
            found.push(credential);
        }
    }
    found
}

fn build_suggestions(factors: &MarketFactors) -> Vec<String> {
    let mut weak: Vec<(f64, &str)> = Vec::new();
    if factors.license_demand < SUGGESTION_THRESHOLD {
        weak.push((
            factors.license_demand,
            "demand for your license is soft in your region; consider widening your search area",
        ));
    }
    if factors.specialty_demand < SUGGESTION_THRESHOLD {
        weak.push((
            factors.specialty_demand,
            "openings in your specialty are scarce nearby; a cross-training certification would broaden your options",
        ));
    }
    if factors.experience_match < SUGGESTION_THRESHOLD {
        weak.push((
            factors.experience_match,
            "many matching postings ask for a different experience level; filter for roles that fit your years of practice",
        ));
    }
    weak.sort_by(|a, b| a.0.total_cmp(&b.0));
    weak.into_iter()
        .take(MAX_SUGGESTIONS)
        .map(|(_, text)| text.to_string())
        .collect()
}

/// Three non-exclusive job lists, each capped at [`RECOMMENDATION_CAP`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecommendationSet {
    pub best_pay: Vec<JobPosting>,
    pub best_facility: Vec<JobPosting>,
    pub new_this_week: Vec<JobPosting>,
}

pub fn recommendations(
    open_jobs: &[JobPosting],
    facilities: &[Facility],
    now: DateTime<Utc>,
) -> RecommendationSet {
    let standing: HashMap<Uuid, (Grade, f64)> = facilities
        .iter()
        .filter(|facility| facility.last_scored_at.is_some())
        .map(|facility| (facility.id, (facility.grade, facility.composite_score)))
        .collect();
    let grade_of = |job: &JobPosting| standing.get(&job.facility_id).map(|(grade, _)| *grade);

    let mut best_pay: Vec<&JobPosting> = open_jobs
        .iter()
        .filter(|job| job.effective_pay_max().is_some())
        .collect();
    best_pay.sort_by(|a, b| {
        let pay_a = a.effective_pay_max().unwrap_or(0.0);
        let pay_b = b.effective_pay_max().unwrap_or(0.0);
        pay_b
            .total_cmp(&pay_a)
            .then_with(|| grade_of(b).cmp(&grade_of(a)))
            .then_with(|| b.posted_at.cmp(&a.posted_at))
            .then_with(|| a.fingerprint.cmp(&b.fingerprint))
    });

    // Only facilities the scoring engine has actually graded compete here.
    let mut best_facility: Vec<&JobPosting> = open_jobs
        .iter()
        .filter(|job| standing.contains_key(&job.facility_id))
        .collect();
    best_facility.sort_by(|a, b| {
        let (grade_a, composite_a) = standing[&a.facility_id];
        let (grade_b, composite_b) = standing[&b.facility_id];
        grade_b
            .cmp(&grade_a)
            .then_with(|| composite_b.total_cmp(&composite_a))
            .then_with(|| b.posted_at.cmp(&a.posted_at))
            .then_with(|| a.fingerprint.cmp(&b.fingerprint))
    });

    let cutoff = now - Duration::days(NEW_THIS_WEEK_DAYS);
    let mut new_this_week: Vec<&JobPosting> = open_jobs
        .iter()
        .filter(|job| job.posted_at >= cutoff)
        .collect();
    new_this_week.sort_by(|a, b| {
        b.posted_at
            .cmp(&a.posted_at)
            .then_with(|| a.fingerprint.cmp(&b.fingerprint))
    });

    RecommendationSet {
        best_pay: capped(best_pay),
        best_facility: capped(best_facility),
        new_this_week: capped(new_this_week),
    }
}

fn capped(jobs: Vec<&JobPosting>) -> Vec<JobPosting> {
    jobs.into_iter().take(RECOMMENDATION_CAP).cloned().collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpecialtyCount {
    pub specialty: Specialty,
    pub open_jobs: usize,
}

/// Dashboard snapshot. `job_matches` is zero for a missing or incomplete
/// profile rather than falling back to an unfiltered count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuickInsights {
    pub pay_spikes: Vec<JobPosting>,
    pub sign_on_bonuses: Vec<JobPosting>,
    pub hot_specialties: Vec<SpecialtyCount>,
    pub job_matches: usize,
}

pub fn quick_insights(open_jobs: &[JobPosting], profile: Option<&UserProfile>) -> QuickInsights {
    let mut pay_by_specialty: HashMap<Specialty, Vec<f64>> = HashMap::new();
    for job in open_jobs {
        if let Some(pay) = job.effective_pay_max() {
            pay_by_specialty.entry(job.specialty).or_default().push(pay);
        }
    }
    let p90_by_specialty: HashMap<Specialty, f64> = pay_by_specialty
        .into_iter()
        .filter_map(|(specialty, values)| nearest_rank(values, 90.0).map(|p90| (specialty, p90)))
        .collect();

    let mut pay_spikes: Vec<&JobPosting> = open_jobs
        .iter()
        .filter(|job| match (job.effective_pay_max(), p90_by_specialty.get(&job.specialty)) {
            (Some(pay), Some(p90)) => pay >= *p90,
            _ => false,
        })
        .collect();
    pay_spikes.sort_by(|a, b| {
        let pay_a = a.effective_pay_max().unwrap_or(0.0);
        let pay_b = b.effective_pay_max().unwrap_or(0.0);
        pay_b
            .total_cmp(&pay_a)
            .then_with(|| a.fingerprint.cmp(&b.fingerprint))
    });
    pay_spikes.truncate(INSIGHT_CAP);

    let mut sign_on_bonuses: Vec<&JobPosting> = open_jobs
        .iter()
        .filter(|job| job.sign_on_bonus.is_some())
        .collect();
    sign_on_bonuses.sort_by(|a, b| {
        let bonus_a = a.sign_on_bonus.unwrap_or(0.0);
        let bonus_b = b.sign_on_bonus.unwrap_or(0.0);
        bonus_b
            .total_cmp(&bonus_a)
            .then_with(|| a.fingerprint.cmp(&b.fingerprint))
    });
    sign_on_bonuses.truncate(INSIGHT_CAP);

    let mut counts: HashMap<Specialty, usize> = HashMap::new();
    for job in open_jobs {
        *counts.entry(job.specialty).or_insert(0) += 1;
    }
    let mut hot_specialties: Vec<SpecialtyCount> = counts
        .into_iter()
        .map(|(specialty, open_jobs)| SpecialtyCount { specialty, open_jobs })
        .collect();
    hot_specialties.sort_by(|a, b| {
        b.open_jobs
            .cmp(&a.open_jobs)
            .then_with(|| a.specialty.as_str().cmp(b.specialty.as_str()))
    });
    hot_specialties.truncate(HOT_SPECIALTY_CAP);

    let job_matches = match profile {
        Some(profile) => match (profile.nursing_type, profile.specialty) {
            (Some(nursing_type), Some(specialty)) => open_jobs
                .iter()
                .filter(|job| {
                    job.specialty == specialty && job_matches_nursing_type(job, nursing_type)
                })
                .count(),
            _ => 0,
        },
        None => 0,
    };

    QuickInsights {
        pay_spikes: pay_spikes.into_iter().cloned().collect(),
        sign_on_bonuses: sign_on_bonuses.into_iter().cloned().collect(),
        hot_specialties,
        job_matches,
    }
}

/// Nearest-rank percentile over an unsorted sample. `pct` in (0, 100].
pub fn nearest_rank(mut values: Vec<f64>, pct: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(f64::total_cmp);
    let rank = ((pct / 100.0) * values.len() as f64).ceil() as usize;
    Some(values[rank.max(1) - 1])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureKey {
    AiQuestions,
    SavedJobs,
    ComparisonSlots,
}

impl FeatureKey {
    pub fn parse(raw: &str) -> Option<FeatureKey> {
        match raw {
            "ai_questions" => Some(FeatureKey::AiQuestions),
            "saved_jobs" => Some(FeatureKey::SavedJobs),
            "comparison_slots" => Some(FeatureKey::ComparisonSlots),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureKey::AiQuestions => "ai_questions",
            FeatureKey::SavedJobs => "saved_jobs",
            FeatureKey::ComparisonSlots => "comparison_slots",
        }
    }

    /// Daily features reset at UTC midnight; capacity features never do.
    pub fn is_daily(&self) -> bool {
        matches!(self, FeatureKey::AiQuestions)
    }
}

/// Per-tier limits in the shape the billing system hands over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierLimits {
    pub sully_daily_limit: u32,
    pub saved_jobs_limit: u32,
    pub comparison_limit: u32,
}

impl TierLimits {
    pub fn limit_for(&self, feature: FeatureKey) -> u32 {
        match feature {
            FeatureKey::AiQuestions => self.sully_daily_limit,
            FeatureKey::SavedJobs => self.saved_jobs_limit,
            FeatureKey::ComparisonSlots => self.comparison_limit,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown tier {0:?} in limits configuration")]
    UnknownTier(String),
    #[error("limits configuration is missing tier {0:?}")]
    MissingTier(&'static str),
}

/// Validated tier-to-limits mapping. Construction fails on unknown tier
/// names and on missing tiers, so lookups never have to handle absence.
#[derive(Debug, Clone)]
pub struct TierLimitsTable {
    limits: HashMap<Tier, TierLimits>,
}

impl TierLimitsTable {
    pub fn from_named(named: &BTreeMap<String, TierLimits>) -> Result<Self, ConfigError> {
        let mut limits = HashMap::new();
        for (name, tier_limits) in named {
            let tier = match name.as_str() {
                "free" => Tier::Free,
                "starter" => Tier::Starter,
                "pro" => Tier::Pro,
                "premium" => Tier::Premium,
                _ => return Err(ConfigError::UnknownTier(name.clone())),
            };
            limits.insert(tier, *tier_limits);
        }
        for tier in [Tier::Free, Tier::Starter, Tier::Pro, Tier::Premium] {
            if !limits.contains_key(&tier) {
                return Err(ConfigError::MissingTier(tier.as_str()));
            }
        }
        Ok(TierLimitsTable { limits })
    }

    pub fn limits(&self, tier: Tier) -> TierLimits {
        self.limits[&tier]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaDecision {
    pub allowed: bool,
    pub used: u32,
    pub limit: u32,
}

#[derive(Debug)]
struct Counter {
    used: u32,
    window_start: DateTime<Utc>,
}

/// Per-user consumption counters behind a single lock, so a check and its
/// increment are one transition.
#[derive(Debug)]
pub struct QuotaEngine {
    table: TierLimitsTable,
    counters: Mutex<HashMap<(Uuid, FeatureKey), Counter>>,
}

impl QuotaEngine {
    pub fn new(table: TierLimitsTable) -> Self {
        QuotaEngine {
            table,
            counters: Mutex::new(HashMap::new()),
        }
    }

    /// Atomic test-and-increment. A denial leaves the counter untouched.
    /// Daily windows reset lazily when `now` has crossed a UTC day boundary
    /// since the window opened.
    pub async fn check_and_consume(
        &self,
        user: Uuid,
        tier: Tier,
        feature: FeatureKey,
        now: DateTime<Utc>,
    ) -> QuotaDecision {
        let limit = self.table.limits(tier).limit_for(feature);
        let mut counters = self.counters.lock().await;
        let counter = counters.entry((user, feature)).or_insert_with(|| Counter {
            used: 0,
            window_start: now,
        });
        if feature.is_daily() && now.date_naive() > counter.window_start.date_naive() {
            counter.used = 0;
            counter.window_start = now;
        }
        if counter.used < limit {
            counter.used += 1;
            QuotaDecision {
                allowed: true,
                used: counter.used,
                limit,
            }
        } else {
            QuotaDecision {
                allowed: false,
                used: counter.used,
                limit,
            }
        }
    }

    /// Frees one unit of a capacity feature (un-saving a job, clearing a
    /// comparison slot). Daily windows only ever reset, never release.
    pub async fn release(&self, user: Uuid, feature: FeatureKey) {
        if feature.is_daily() {
            return;
        }
        let mut counters = self.counters.lock().await;
        if let Some(counter) = counters.get_mut(&(user, feature)) {
            counter.used = counter.used.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use nors_core::{EmploymentType, ExperienceBand, JobDraft, ShiftType};
    use std::sync::Arc;

    fn ts(y: i32, mo: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, 12, 0, 0).single().unwrap()
    }

    fn job(id: &str, title: &str, specialty: Specialty, state: &str) -> JobPosting {
        JobPosting::from_draft(
            JobDraft {
                source_id: "carelist".into(),
                external_id: Some(id.into()),
                title: title.into(),
                specialty,
                employment_type: EmploymentType::FullTime,
                shift_type: ShiftType::Day,
                pay_min: None,
                pay_max: None,
                sign_on_bonus: None,
                required_experience: None,
                city: "Tulsa".into(),
                state: state.into(),
                facility_name: format!("{state} General"),
                posted_at: ts(2026, 8, 1),
                raw_hash: "hash".into(),
            },
            ts(2026, 8, 1),
        )
    }

    fn profile(nursing_type: Option<NursingType>, specialty: Option<Specialty>) -> UserProfile {
        UserProfile {
            id: Uuid::new_v4(),
            nursing_type,
            specialty,
            experience_years: 2,
            region_preference: Some("OK".into()),
            tier: Tier::Pro,
        }
    }

    fn limits_table() -> TierLimitsTable {
        let limits = TierLimits {
            sully_daily_limit: 3,
            saved_jobs_limit: 10,
            comparison_limit: 2,
        };
        let named: BTreeMap<String, TierLimits> = ["free", "starter", "pro", "premium"]
            .iter()
            .map(|name| (name.to_string(), limits))
            .collect();
        TierLimitsTable::from_named(&named).unwrap()
    }

    #[test]
    fn incomplete_profile_yields_a_message_not_a_number() {
        let jobs = vec![job("J-1", "ICU Nurse (RN)", Specialty::Icu, "OK")];
        let outcome = market_score(&profile(Some(NursingType::Rn), None), &jobs);
        assert!(matches!(outcome, MarketScoreOutcome::Insufficient { .. }));
        let outcome = market_score(&profile(None, Some(Specialty::Icu)), &jobs);
        assert!(matches!(outcome, MarketScoreOutcome::Insufficient { .. }));
    }

    #[test]
    fn demand_factors_are_percentiles_across_regions() {
        let jobs = vec![
            job("J-1", "ICU Nurse (RN)", Specialty::Icu, "TX"),
            job("J-2", "ICU Nurse (RN)", Specialty::Icu, "TX"),
            job("J-3", "ICU Nurse (RN)", Specialty::Icu, "OK"),
        ];
        let outcome = market_score(&profile(Some(NursingType::Rn), Some(Specialty::Icu)), &jobs);
        let MarketScoreOutcome::Scored(score) = outcome else {
            panic!("expected a scored outcome");
        };
        // OK has the lower of two regional counts, so both demand factors
        // land at the 50th percentile; every matching job is bandless.
        assert_eq!(score.factors.license_demand, 50.0);
        assert_eq!(score.factors.specialty_demand, 50.0);
        assert_eq!(score.factors.experience_match, 100.0);
        assert_eq!(score.score, 0.40 * 50.0 + 0.35 * 50.0 + 0.25 * 100.0);
        assert_eq!(score.grade, Grade::C);
        assert_eq!(score.suggestions.len(), 2);
    }

    #[test]
    fn bandless_jobs_count_toward_experience_match() {
        let mut banded = job("J-1", "ICU Nurse (RN)", Specialty::Icu, "OK");
        banded.required_experience = Some(ExperienceBand {
            min_years: 3,
            max_years: 5,
        });
        let bandless = job("J-2", "ICU Nurse (RN)", Specialty::Icu, "OK");
        let outcome = market_score(
            &profile(Some(NursingType::Rn), Some(Specialty::Icu)),
            &[banded, bandless],
        );
        let MarketScoreOutcome::Scored(score) = outcome else {
            panic!("expected a scored outcome");
        };
        assert_eq!(score.factors.experience_match, 50.0);
    }

    #[test]
    fn suggestions_surface_the_weakest_factors_first() {
        let factors = MarketFactors {
            license_demand: 60.0,
            specialty_demand: 20.0,
            experience_match: 95.0,
        };
        let suggestions = build_suggestions(&factors);
        assert_eq!(suggestions.len(), 2);
        assert!(suggestions[0].contains("specialty"));
        assert!(suggestions[1].contains("license"));
    }

    #[test]
    fn credential_free_titles_match_any_license() {
        let open = job("J-1", "Night Shift Nurse", Specialty::MedSurg, "OK");
        assert!(job_matches_nursing_type(&open, NursingType::Rn));
        assert!(job_matches_nursing_type(&open, NursingType::Cna));
        let tagged = job("J-2", "LPN - Med-Surg", Specialty::MedSurg, "OK");
        assert!(job_matches_nursing_type(&tagged, NursingType::Lpn));
        assert!(!job_matches_nursing_type(&tagged, NursingType::Rn));
    }

    #[test]
    fn recommendations_are_capped_and_deterministically_ordered() {
        let now = ts(2026, 8, 4);
        let mut jobs = Vec::new();
        for (i, pay) in [52.0, 44.0, 61.0, 38.0, 47.0, 55.0, 41.0].iter().enumerate() {
            let mut posting = job(&format!("J-{i}"), "ICU Nurse (RN)", Specialty::Icu, "OK");
            posting.pay_max = Some(*pay);
            jobs.push(posting);
        }
        let set = recommendations(&jobs, &[], now);
        assert_eq!(set.best_pay.len(), RECOMMENDATION_CAP);
        assert_eq!(set.best_pay[0].pay_max, Some(61.0));
        assert_eq!(set.best_pay[4].pay_max, Some(44.0));
        // No facility has been scored, so bestFacility stays empty.
        assert!(set.best_facility.is_empty());
        assert_eq!(set.new_this_week.len(), RECOMMENDATION_CAP);
    }

    #[test]
    fn best_facility_ranks_by_grade_then_composite() {
        let now = ts(2026, 8, 4);
        let strong = job("J-1", "ICU Nurse (RN)", Specialty::Icu, "TX");
        let weak = job("J-2", "ICU Nurse (RN)", Specialty::Icu, "OK");
        let facility = |posting: &JobPosting, composite: f64| Facility {
            id: posting.facility_id,
            name: posting.facility_name.clone(),
            city: posting.city.clone(),
            state: posting.state.clone(),
            attributes: Default::default(),
            indices: BTreeMap::new(),
            composite_score: composite,
            grade: Grade::from_score(composite),
            last_scored_at: Some(now),
        };
        let facilities = vec![facility(&strong, 82.0), facility(&weak, 58.0)];
        let set = recommendations(&[weak.clone(), strong.clone()], &facilities, now);
        assert_eq!(set.best_facility[0].fingerprint, strong.fingerprint);
        assert_eq!(set.best_facility[1].fingerprint, weak.fingerprint);
    }

    #[test]
    fn new_this_week_excludes_older_postings() {
        let now = ts(2026, 8, 20);
        let fresh = {
            let mut posting = job("J-1", "ICU Nurse (RN)", Specialty::Icu, "OK");
            posting.posted_at = ts(2026, 8, 18);
            posting
        };
        let stale = job("J-2", "ICU Nurse (RN)", Specialty::Icu, "OK");
        let set = recommendations(&[fresh.clone(), stale], &[], now);
        assert_eq!(set.new_this_week.len(), 1);
        assert_eq!(set.new_this_week[0].fingerprint, fresh.fingerprint);
    }

    #[test]
    fn empty_inputs_produce_empty_lists() {
        let set = recommendations(&[], &[], ts(2026, 8, 4));
        assert!(set.best_pay.is_empty());
        assert!(set.best_facility.is_empty());
        assert!(set.new_this_week.is_empty());
    }

    #[test]
    fn pay_spikes_sit_at_or_above_the_specialty_p90() {
        let mut jobs = Vec::new();
        for i in 1..=10 {
            let mut posting = job(&format!("J-{i}"), "ICU Nurse (RN)", Specialty::Icu, "OK");
            posting.pay_max = Some(10.0 * i as f64);
            jobs.push(posting);
        }
        let insights = quick_insights(&jobs, None);
        // Nearest-rank p90 of 10..=100 is 90, so exactly two jobs qualify.
        assert_eq!(insights.pay_spikes.len(), 2);
        assert_eq!(insights.pay_spikes[0].pay_max, Some(100.0));
        assert_eq!(insights.pay_spikes[1].pay_max, Some(90.0));
    }

    #[test]
    fn hot_specialties_rank_by_open_count() {
        let jobs = vec![
            job("J-1", "ICU Nurse (RN)", Specialty::Icu, "OK"),
            job("J-2", "ICU Nurse (RN)", Specialty::Icu, "TX"),
            job("J-3", "ICU Nurse (RN)", Specialty::Icu, "NM"),
            job("J-4", "Med-Surg Nurse", Specialty::MedSurg, "OK"),
            job("J-5", "Med-Surg Nurse", Specialty::MedSurg, "TX"),
            job("J-6", "Oncology Nurse", Specialty::Oncology, "OK"),
            job("J-7", "Psych Nurse", Specialty::Psych, "OK"),
        ];
        let insights = quick_insights(&jobs, None);
        assert_eq!(insights.hot_specialties.len(), 3);
        assert_eq!(insights.hot_specialties[0].specialty, Specialty::Icu);
        assert_eq!(insights.hot_specialties[0].open_jobs, 3);
        assert_eq!(insights.hot_specialties[1].specialty, Specialty::MedSurg);
        // Ties break on the display name, so Oncology precedes Psychiatric.
        assert_eq!(insights.hot_specialties[2].specialty, Specialty::Oncology);
    }

    #[test]
    fn job_match_count_requires_a_complete_profile() {
        let jobs = vec![
            job("J-1", "ICU Nurse (RN)", Specialty::Icu, "OK"),
            job("J-2", "LPN - Med-Surg", Specialty::MedSurg, "OK"),
        ];
        let complete = profile(Some(NursingType::Rn), Some(Specialty::Icu));
        assert_eq!(quick_insights(&jobs, Some(&complete)).job_matches, 1);
        let partial = profile(Some(NursingType::Rn), None);
        assert_eq!(quick_insights(&jobs, Some(&partial)).job_matches, 0);
        assert_eq!(quick_insights(&jobs, None).job_matches, 0);
    }

    #[tokio::test]
    async fn concurrent_consumes_never_exceed_the_limit() {
        let engine = Arc::new(QuotaEngine::new(limits_table()));
        let user = Uuid::new_v4();
        let now = ts(2026, 8, 4);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let engine = Arc::clone(&engine);
            handles.push(tokio::spawn(async move {
                engine
                    .check_and_consume(user, Tier::Pro, FeatureKey::AiQuestions, now)
                    .await
            }));
        }
        let mut allowed = 0;
        for handle in handles {
            if handle.await.unwrap().allowed {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 3);
    }

    #[tokio::test]
    async fn daily_window_resets_used_lazily() {
        let engine = QuotaEngine::new(limits_table());
        let user = Uuid::new_v4();
        let day_one = ts(2026, 8, 4);
        for _ in 0..3 {
            let decision = engine
                .check_and_consume(user, Tier::Free, FeatureKey::AiQuestions, day_one)
                .await;
            assert!(decision.allowed);
        }
        let denied = engine
            .check_and_consume(user, Tier::Free, FeatureKey::AiQuestions, day_one)
            .await;
        assert!(!denied.allowed);
        assert_eq!(denied.used, 3);

        let day_two = ts(2026, 8, 5);
        let fresh = engine
            .check_and_consume(user, Tier::Free, FeatureKey::AiQuestions, day_two)
            .await;
        assert!(fresh.allowed);
        assert_eq!(fresh.used, 1);
    }

    #[tokio::test]
    async fn releasing_a_capacity_slot_frees_quota() {
        let engine = QuotaEngine::new(limits_table());
        let user = Uuid::new_v4();
        let now = ts(2026, 8, 4);
        for _ in 0..2 {
            let decision = engine
                .check_and_consume(user, Tier::Pro, FeatureKey::ComparisonSlots, now)
                .await;
            assert!(decision.allowed);
        }
        let full = engine
            .check_and_consume(user, Tier::Pro, FeatureKey::ComparisonSlots, now)
            .await;
        assert!(!full.allowed);

        engine.release(user, FeatureKey::ComparisonSlots).await;
        let freed = engine
            .check_and_consume(user, Tier::Pro, FeatureKey::ComparisonSlots, now)
            .await;
        assert!(freed.allowed);
        assert_eq!(freed.used, 2);

        // Daily windows never release.
        engine
            .check_and_consume(user, Tier::Pro, FeatureKey::AiQuestions, now)
            .await;
        engine.release(user, FeatureKey::AiQuestions).await;
        let next = engine
            .check_and_consume(user, Tier::Pro, FeatureKey::AiQuestions, now)
            .await;
        assert_eq!(next.used, 2);
    }

    #[test]
    fn limits_config_rejects_unknown_and_missing_tiers() {
        let limits = TierLimits {
            sully_daily_limit: 1,
            saved_jobs_limit: 1,
            comparison_limit: 1,
        };
        let mut named: BTreeMap<String, TierLimits> = ["free", "starter", "pro", "premium"]
            .iter()
            .map(|name| (name.to_string(), limits))
            .collect();
        named.insert("enterprise".into(), limits);
        assert!(matches!(
            TierLimitsTable::from_named(&named),
            Err(ConfigError::UnknownTier(name)) if name == "enterprise"
        ));
        named.remove("enterprise");
        named.remove("pro");
        assert!(matches!(
            TierLimitsTable::from_named(&named),
            Err(ConfigError::MissingTier("pro"))
        ));
    }

    #[test]
    fn feature_keys_round_trip_through_their_names() {
        for feature in [
            FeatureKey::AiQuestions,
            FeatureKey::SavedJobs,
            FeatureKey::ComparisonSlots,
        ] {
            assert_eq!(FeatureKey::parse(feature.as_str()), Some(feature));
        }
        assert_eq!(FeatureKey::parse("bulk_export"), None);
    }
}
