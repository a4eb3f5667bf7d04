//! Core domain model for NORS: canonical job/facility records, grading, and dedup keys.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub const CRATE_NAME: &str = "nors-core";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Specialty {
    Icu,
    EmergencyDept,
    MedSurg,
    LaborDelivery,
    OperatingRoom,
    Pediatrics,
    Oncology,
    Telemetry,
    Psych,
    HomeHealth,
    Other,
}

impl Specialty {
    pub fn as_str(&self) -> &'static str {
        match self {
            Specialty::Icu => "ICU",
            Specialty::EmergencyDept => "Emergency Department",
            Specialty::MedSurg => "Med-Surg",
            Specialty::LaborDelivery => "Labor & Delivery",
            Specialty::OperatingRoom => "Operating Room",
            Specialty::Pediatrics => "Pediatrics",
            Specialty::Oncology => "Oncology",
            Specialty::Telemetry => "Telemetry",
            Specialty::Psych => "Psychiatric",
            Specialty::HomeHealth => "Home Health",
            Specialty::Other => "Other",
        }
    }

    pub fn all() -> &'static [Specialty] {
        &[
            Specialty::Icu,
            Specialty::EmergencyDept,
            Specialty::MedSurg,
            Specialty::LaborDelivery,
            Specialty::OperatingRoom,
            Specialty::Pediatrics,
            Specialty::Oncology,
            Specialty::Telemetry,
            Specialty::Psych,
            Specialty::HomeHealth,
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NursingType {
    Rn,
    Lpn,
    Cna,
    Aprn,
}

impl NursingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NursingType::Rn => "RN",
            NursingType::Lpn => "LPN",
            NursingType::Cna => "CNA",
            NursingType::Aprn => "APRN",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmploymentType {
    FullTime,
    PartTime,
    PerDiem,
    Travel,
    Contract,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShiftType {
    Day,
    Evening,
    Night,
    Rotating,
    Unspecified,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Free,
    Starter,
    Pro,
    Premium,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Starter => "starter",
            Tier::Pro => "pro",
            Tier::Premium => "premium",
        }
    }
}

/// Enrichment lifecycle of a posting. `Failed` records stay eligible for retry
/// until the attempt cap promotes them to `PermanentlyFailed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum EnrichmentState {
    Unprocessed,
    Enriched,
    Failed { attempts: u8 },
    PermanentlyFailed,
}

impl EnrichmentState {
    pub fn needs_enrichment(&self) -> bool {
        matches!(
            self,
            EnrichmentState::Unprocessed | EnrichmentState::Failed { .. }
        )
    }
}

/// The ten OFS index codes, in their documented presentation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum IndexCode {
    #[serde(rename = "NWI")]
    Nwi,
    #[serde(rename = "NCI")]
    Nci,
    #[serde(rename = "PWRI")]
    Pwri,
    #[serde(rename = "SCI")]
    Sci,
    #[serde(rename = "NGI")]
    Ngi,
    #[serde(rename = "SSI")]
    Ssi,
    #[serde(rename = "PLI")]
    Pli,
    #[serde(rename = "PPI")]
    Ppi,
    #[serde(rename = "JTI")]
    Jti,
    #[serde(rename = "SLI")]
    Sli,
}

impl IndexCode {
    pub fn code(&self) -> &'static str {
        match self {
            IndexCode::Nwi => "NWI",
            IndexCode::Nci => "NCI",
            IndexCode::Pwri => "PWRI",
            IndexCode::Sci => "SCI",
            IndexCode::Ngi => "NGI",
            IndexCode::Ssi => "SSI",
            IndexCode::Pli => "PLI",
            IndexCode::Ppi => "PPI",
            IndexCode::Jti => "JTI",
            IndexCode::Sli => "SLI",
        }
    }

    pub fn all() -> [IndexCode; 10] {
        [
            IndexCode::Nwi,
            IndexCode::Nci,
            IndexCode::Pwri,
            IndexCode::Sci,
            IndexCode::Ngi,
            IndexCode::Ssi,
            IndexCode::Pli,
            IndexCode::Ppi,
            IndexCode::Jti,
            IndexCode::Sli,
        ]
    }
}

/// Letter grade derived from a composite score. Boundary values belong to the
/// higher grade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Grade {
    F,
    D,
    C,
    B,
    A,
}

impl Grade {
    pub fn from_score(score: f64) -> Grade {
        if score >= 80.0 {
            Grade::A
        } else if score >= 65.0 {
            Grade::B
        } else if score >= 50.0 {
            Grade::C
        } else if score >= 35.0 {
            Grade::D
        } else {
            Grade::F
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Grade::A => "A",
            Grade::B => "B",
            Grade::C => "C",
            Grade::D => "D",
            Grade::F => "F",
        }
    }
}

/// Stated experience requirement on a posting, in whole years.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperienceBand {
    pub min_years: u8,
    pub max_years: u8,
}

impl ExperienceBand {
    pub fn contains(&self, years: u8) -> bool {
        years >= self.min_years && years <= self.max_years
    }
}

/// Normalized posting handed from a source adapter into the upsert engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDraft {
    pub source_id: String,
    pub external_id: Option<String>,
    pub title: String,
    pub specialty: Specialty,
    pub employment_type: EmploymentType,
    pub shift_type: ShiftType,
    pub pay_min: Option<f64>,
    pub pay_max: Option<f64>,
    pub sign_on_bonus: Option<f64>,
    pub required_experience: Option<ExperienceBand>,
    pub city: String,
    pub state: String,
    pub facility_name: String,
    pub posted_at: DateTime<Utc>,
    pub raw_hash: String,
}

impl JobDraft {
    /// Stable dedup key: source-native id when the source has one, otherwise a
    /// content hash over facility/title/location/posted-day.
    pub fn fingerprint(&self) -> String {
        match &self.external_id {
            Some(external_id) => fingerprint_from_external(&self.source_id, external_id),
            None => fingerprint_from_content(
                &self.facility_name,
                &self.title,
                &self.city,
                &self.state,
                self.posted_at,
            ),
        }
    }

    pub fn facility_id(&self) -> Uuid {
        facility_id(&self.facility_name, &self.city, &self.state)
    }
}

/// Fields derived by the enrichment stage and merged onto a posting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Enrichment {
    pub specialty_tags: Vec<String>,
    pub pay_min: Option<f64>,
    pub pay_max: Option<f64>,
    pub summary: String,
}

/// Canonical persisted posting. Owned by the ingestion subsystem; the single
/// source of truth for every downstream reader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPosting {
    pub fingerprint: String,
    pub source_id: String,
    pub external_id: Option<String>,
    pub title: String,
    pub specialty: Specialty,
    pub employment_type: EmploymentType,
    pub shift_type: ShiftType,
    pub pay_min: Option<f64>,
    pub pay_max: Option<f64>,
    pub sign_on_bonus: Option<f64>,
    pub required_experience: Option<ExperienceBand>,
    pub city: String,
    pub state: String,
    pub facility_id: Uuid,
    pub facility_name: String,
    pub posted_at: DateTime<Utc>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub enrichment_state: EnrichmentState,
    pub enrichment: Option<Enrichment>,
    pub raw_hash: String,
}

impl JobPosting {
    pub fn from_draft(draft: JobDraft, seen_at: DateTime<Utc>) -> Self {
        let fingerprint = draft.fingerprint();
        let facility_id = draft.facility_id();
        JobPosting {
            fingerprint,
            source_id: draft.source_id,
            external_id: draft.external_id,
            title: draft.title,
            specialty: draft.specialty,
            employment_type: draft.employment_type,
            shift_type: draft.shift_type,
            pay_min: draft.pay_min,
            pay_max: draft.pay_max,
            sign_on_bonus: draft.sign_on_bonus,
            required_experience: draft.required_experience,
            city: draft.city,
            state: draft.state,
            facility_id,
            facility_name: draft.facility_name,
            posted_at: draft.posted_at,
            first_seen_at: seen_at,
            last_seen_at: seen_at,
            enrichment_state: EnrichmentState::Unprocessed,
            enrichment: None,
            raw_hash: draft.raw_hash,
        }
    }

    /// Staleness is a read-time property. A posting not seen within the
    /// freshness window is considered closed, never deleted.
    pub fn is_open(&self, now: DateTime<Utc>, freshness: Duration) -> bool {
        now.signed_duration_since(self.last_seen_at) <= freshness
    }

    /// The pay ceiling visible to ranking, preferring enrichment-derived
    /// values when the source disclosed nothing.
    pub fn effective_pay_max(&self) -> Option<f64> {
        self.pay_max
            .or_else(|| self.enrichment.as_ref().and_then(|e| e.pay_max))
    }

    pub fn effective_pay_min(&self) -> Option<f64> {
        self.pay_min
            .or_else(|| self.enrichment.as_ref().and_then(|e| e.pay_min))
    }

    pub fn discloses_pay(&self) -> bool {
        self.pay_min.is_some() || self.pay_max.is_some()
    }
}

/// Structured facility attributes from the facility-metadata source. Every
/// field is optional; index formulas degrade to a neutral default when data
/// is missing.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FacilityAttributes {
    pub nurse_to_patient_ratio: Option<f64>,
    pub retention_rate: Option<f64>,
    pub survey_wellbeing: Option<f64>,
    pub survey_autonomy: Option<f64>,
    pub payroll_dispute_rate: Option<f64>,
    pub cost_of_living_index: Option<f64>,
    pub tuition_reimbursement: Option<bool>,
    pub preceptorship_program: Option<bool>,
    pub childcare_support: Option<bool>,
    pub lift_team: Option<bool>,
}

/// Facility draft handed from the facility-metadata adapter into the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FacilityDraft {
    pub name: String,
    pub city: String,
    pub state: String,
    pub attributes: FacilityAttributes,
}

impl FacilityDraft {
    pub fn facility_id(&self) -> Uuid {
        facility_id(&self.name, &self.city, &self.state)
    }
}

/// Canonical facility record. `composite_score` and `grade` are always
/// derived by the scoring engine, never hand-set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Facility {
    pub id: Uuid,
    pub name: String,
    pub city: String,
    pub state: String,
    pub attributes: FacilityAttributes,
    pub indices: BTreeMap<IndexCode, f64>,
    pub composite_score: f64,
    pub grade: Grade,
    pub last_scored_at: Option<DateTime<Utc>>,
}

impl Facility {
    pub fn from_draft(draft: FacilityDraft) -> Self {
        let id = draft.facility_id();
        Facility {
            id,
            name: draft.name,
            city: draft.city,
            state: draft.state,
            attributes: draft.attributes,
            indices: BTreeMap::new(),
            composite_score: 0.0,
            grade: Grade::F,
            last_scored_at: None,
        }
    }
}

/// User profile owned by the external account subsystem. Referenced by id
/// only; this core never mutates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: Uuid,
    pub nursing_type: Option<NursingType>,
    pub specialty: Option<Specialty>,
    pub experience_years: u8,
    pub region_preference: Option<String>,
    pub tier: Tier,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Collapse a key fragment to lowercase alphanumeric words so cosmetic
/// differences between sources do not split fingerprints.
pub fn normalize_key_fragment(input: &str) -> String {
    input
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn fingerprint_from_external(source_id: &str, external_id: &str) -> String {
    sha256_hex(format!("{source_id}:{external_id}").as_bytes())
}

pub fn fingerprint_from_content(
    facility: &str,
    title: &str,
    city: &str,
    state: &str,
    posted_at: DateTime<Utc>,
) -> String {
    let key = format!(
        "{}|{}|{}|{}|{}",
        normalize_key_fragment(facility),
        normalize_key_fragment(title),
        normalize_key_fragment(city),
        normalize_key_fragment(state),
        posted_at.format("%Y-%m-%d"),
    );
    sha256_hex(key.as_bytes())
}

/// Deterministic facility identity across sources: same name/city/state maps
/// to the same id no matter which adapter saw it first.
pub fn facility_id(name: &str, city: &str, state: &str) -> Uuid {
    let key = format!(
        "{}|{}|{}",
        normalize_key_fragment(name),
        normalize_key_fragment(city),
        normalize_key_fragment(state),
    );
    Uuid::new_v5(&Uuid::NAMESPACE_URL, key.as_bytes())
}
