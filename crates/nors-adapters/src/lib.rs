//! Source adapter contract + the closed set of per-source adapters.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use nors_core::{
    sha256_hex, EmploymentType, ExperienceBand, FacilityAttributes, FacilityDraft, JobDraft,
    ShiftType, Specialty,
};
use nors_store::HttpFetcher;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "nors-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("malformed source data: {0}")]
    MalformedSourceData(String),
    #[error(transparent)]
    Fetch(#[from] nors_store::FetchError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingTarget {
    pub url: String,
}

/// One fetched payload from a source, before parsing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawListing {
    pub url: String,
    pub content_type: String,
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
}

/// A record the parser dropped. One bad record never aborts its batch; the
/// reason is carried into the run summary instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedRecord {
    pub reason: String,
}

/// Everything a parse pass produced: job drafts, facility drafts (only the
/// metadata source emits these), and per-record skips.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParseOutcome {
    pub jobs: Vec<JobDraft>,
    pub facilities: Vec<FacilityDraft>,
    pub skipped: Vec<SkippedRecord>,
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn fetch_listing(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        targets: &[ListingTarget],
    ) -> Result<Vec<RawListing>, AdapterError>;

    fn parse_listing(&self, listing: &RawListing) -> Result<ParseOutcome, AdapterError>;
}

async fn fetch_targets(
    http: &HttpFetcher,
    ctx: &AdapterContext,
    source_id: &str,
    content_type: &str,
    targets: &[ListingTarget],
) -> Result<Vec<RawListing>, AdapterError> {
    let mut pages = Vec::with_capacity(targets.len());
    for target in targets {
        let response = http.fetch_bytes(ctx.run_id, source_id, &target.url).await?;
        pages.push(RawListing {
            url: response.final_url,
            content_type: content_type.to_string(),
            body: response.body,
            fetched_at: ctx.fetched_at,
        });
    }
    Ok(pages)
}

fn listing_json(listing: &RawListing) -> Result<JsonValue, AdapterError> {
    serde_json::from_slice(&listing.body)
        .map_err(|e| AdapterError::MalformedSourceData(format!("invalid JSON payload: {e}")))
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_str()
}

fn json_f64(value: &JsonValue, path: &[&str]) -> Option<f64> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_f64()
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn selector(input: &str) -> Selector {
    Selector::parse(input).expect("selectors are compile-time constants")
}

fn element_text(element: ElementRef<'_>, sel: &Selector) -> Option<String> {
    element
        .select(sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

/// Pull every decimal number out of free text. Commas inside a number are
/// treated as thousands separators.
pub fn extract_numbers(text: &str) -> Vec<f64> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut seen_dot = false;
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            current.push(ch);
            continue;
        }
        if ch == ',' && !current.is_empty() && !seen_dot {
            continue;
        }
        if ch == '.' && !seen_dot && !current.is_empty() {
            current.push(ch);
            seen_dot = true;
            continue;
        }
        if !current.is_empty() {
            if let Ok(v) = current.parse::<f64>() {
                out.push(v);
            }
            current.clear();
            seen_dot = false;
        }
    }
    if !current.is_empty() {
        if let Ok(v) = current.parse::<f64>() {
            out.push(v);
        }
    }
    out
}

const WEEKLY_NURSING_HOURS: f64 = 36.0;
const ANNUAL_NURSING_HOURS: f64 = 2080.0;

/// Parse a pay string into an hourly `(min, max)` range. Weekly and annual
/// figures normalize to hourly so pay is comparable across sources.
pub fn parse_pay_rate(text: &str) -> (Option<f64>, Option<f64>) {
    let nums = extract_numbers(text);
    let min = nums.first().copied();
    let max = nums.get(1).copied().or(min);

    let lower = text.to_ascii_lowercase();
    let divisor = if lower.contains("/hr") || lower.contains("hour") {
        1.0
    } else if lower.contains("/wk") || lower.contains("week") {
        WEEKLY_NURSING_HOURS
    } else if lower.contains("/yr") || lower.contains("year") || lower.contains("annual") {
        ANNUAL_NURSING_HOURS
    } else {
        1.0
    };

    (min.map(|v| v / divisor), max.map(|v| v / divisor))
}

/// Tolerant posted-date parsing: RFC 3339, then `2026-08-01`, then
/// `Aug 1, 2026`. Bare dates resolve to midnight UTC.
pub fn parse_posted_date(text: &str) -> Option<DateTime<Utc>> {
    let trimmed = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d", "%b %d, %Y", "%B %d, %Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, format) {
            let midnight = date.and_hms_opt(0, 0, 0)?;
            return Some(Utc.from_utc_datetime(&midnight));
        }
    }
    None
}

/// Parse "2-5 years" / "2+ years" style requirements into a band.
pub fn parse_experience_band(text: &str) -> Option<ExperienceBand> {
    let nums = extract_numbers(text);
    let min_years = *nums.first()? as u8;
    let max_years = if text.contains('+') {
        u8::MAX
    } else {
        nums.get(1).map(|v| *v as u8).unwrap_or(min_years)
    };
    Some(ExperienceBand {
        min_years,
        max_years,
    })
}

const SPECIALTY_ALIASES: &[(&str, Specialty)] = &[
    ("icu", Specialty::Icu),
    ("intensive care", Specialty::Icu),
    ("intensive care unit", Specialty::Icu),
    ("critical care", Specialty::Icu),
    ("er", Specialty::EmergencyDept),
    ("ed", Specialty::EmergencyDept),
    ("emergency", Specialty::EmergencyDept),
    ("emergency department", Specialty::EmergencyDept),
    ("emergency room", Specialty::EmergencyDept),
    ("med surg", Specialty::MedSurg),
    ("medical surgical", Specialty::MedSurg),
    ("l d", Specialty::LaborDelivery),
    ("labor and delivery", Specialty::LaborDelivery),
    ("labor delivery", Specialty::LaborDelivery),
    ("or", Specialty::OperatingRoom),
    ("operating room", Specialty::OperatingRoom),
    ("perioperative", Specialty::OperatingRoom),
    ("surgery", Specialty::OperatingRoom),
    ("peds", Specialty::Pediatrics),
    ("pediatrics", Specialty::Pediatrics),
    ("pediatric", Specialty::Pediatrics),
    ("oncology", Specialty::Oncology),
    ("telemetry", Specialty::Telemetry),
    ("tele", Specialty::Telemetry),
    ("psych", Specialty::Psych),
    ("psychiatric", Specialty::Psych),
    ("behavioral health", Specialty::Psych),
    ("mental health", Specialty::Psych),
    ("home health", Specialty::HomeHealth),
    ("hospice", Specialty::HomeHealth),
];

const SPECIALTY_FUZZY_THRESHOLD: f64 = 0.90;

/// Map free-text specialty labels onto the closed enum: exact alias match
/// first, then a Jaro-Winkler pass over the alias table, then `Other`.
pub fn normalize_specialty(text: &str) -> Specialty {
    let normalized = nors_core::normalize_key_fragment(text);
    if normalized.is_empty() {
        return Specialty::Other;
    }

    for (alias, specialty) in SPECIALTY_ALIASES {
        if normalized == *alias {
            return *specialty;
        }
    }

    let mut best: Option<(f64, Specialty)> = None;
    for (alias, specialty) in SPECIALTY_ALIASES {
        let score = strsim::jaro_winkler(&normalized, alias);
        if score >= SPECIALTY_FUZZY_THRESHOLD
            && best.map(|(existing, _)| score > existing).unwrap_or(true)
        {
            best = Some((score, *specialty));
        }
    }
    best.map(|(_, specialty)| specialty)
        .unwrap_or(Specialty::Other)
}

pub fn normalize_employment(text: &str) -> Option<EmploymentType> {
    let normalized = nors_core::normalize_key_fragment(text);
    match normalized.as_str() {
        "full time" | "ft" => Some(EmploymentType::FullTime),
        "part time" | "pt" => Some(EmploymentType::PartTime),
        "per diem" | "prn" => Some(EmploymentType::PerDiem),
        "travel" | "traveler" => Some(EmploymentType::Travel),
        "contract" | "contractor" => Some(EmploymentType::Contract),
        _ => None,
    }
}

pub fn normalize_shift(text: &str) -> ShiftType {
    let lower = text.to_ascii_lowercase();
    if lower.contains("rotat") {
        ShiftType::Rotating
    } else if lower.contains("night") || lower.contains("noc") {
        ShiftType::Night
    } else if lower.contains("evening") || lower.contains("mid") {
        ShiftType::Evening
    } else if lower.contains("day") {
        ShiftType::Day
    } else {
        ShiftType::Unspecified
    }
}

/// Parse "1:4" style staffing ratios into patients-per-nurse.
pub fn parse_staffing_ratio(value: &JsonValue) -> Option<f64> {
    if let Some(n) = value.as_f64() {
        return Some(n);
    }
    let text = value.as_str()?;
    let nums = extract_numbers(text);
    match nums.as_slice() {
        [_, patients, ..] => Some(*patients),
        [patients] => Some(*patients),
        [] => None,
    }
}

/// `carelist`: JSON job-board API with stable record ids.
#[derive(Debug, Clone, Copy)]
pub struct CarelistAdapter;

#[async_trait]
impl SourceAdapter for CarelistAdapter {
    fn source_id(&self) -> &'static str {
        "carelist"
    }

    async fn fetch_listing(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        targets: &[ListingTarget],
    ) -> Result<Vec<RawListing>, AdapterError> {
        fetch_targets(http, ctx, self.source_id(), "application/json", targets).await
    }

    fn parse_listing(&self, listing: &RawListing) -> Result<ParseOutcome, AdapterError> {
        let root = listing_json(listing)?;
        let records = root
            .get("jobs")
            .and_then(|v| v.as_array())
            .ok_or_else(|| AdapterError::MalformedSourceData("missing `jobs` array".into()))?;

        let mut outcome = ParseOutcome::default();
        for record in records {
            match self.parse_record(record) {
                Ok(draft) => outcome.jobs.push(draft),
                Err(reason) => outcome.skipped.push(SkippedRecord { reason }),
            }
        }
        Ok(outcome)
    }
}

impl CarelistAdapter {
    fn parse_record(&self, record: &JsonValue) -> Result<JobDraft, String> {
        let title = json_str(record, &["title"])
            .ok_or_else(|| "carelist record missing title".to_string())?;
        let facility_name = json_str(record, &["facility", "name"])
            .ok_or_else(|| "carelist record missing facility name".to_string())?;
        let city = json_str(record, &["facility", "city"])
            .ok_or_else(|| "carelist record missing city".to_string())?;
        let state = json_str(record, &["facility", "state"])
            .ok_or_else(|| "carelist record missing state".to_string())?;
        let posted_at = json_str(record, &["posted_at"])
            .and_then(parse_posted_date)
            .ok_or_else(|| "carelist record missing or invalid posted_at".to_string())?;

        let required_experience = match (
            json_f64(record, &["experience", "min_years"]),
            json_f64(record, &["experience", "max_years"]),
        ) {
            (Some(min), Some(max)) => Some(ExperienceBand {
                min_years: min as u8,
                max_years: max as u8,
            }),
            (Some(min), None) => Some(ExperienceBand {
                min_years: min as u8,
                max_years: u8::MAX,
            }),
            _ => None,
        };

        Ok(JobDraft {
            source_id: "carelist".into(),
            external_id: json_str(record, &["id"]).map(ToString::to_string),
            title: title.to_string(),
            specialty: json_str(record, &["specialty"])
                .map(normalize_specialty)
                .unwrap_or(Specialty::Other),
            employment_type: json_str(record, &["employment_type"])
                .and_then(normalize_employment)
                .unwrap_or(EmploymentType::FullTime),
            shift_type: json_str(record, &["shift"])
                .map(normalize_shift)
                .unwrap_or(ShiftType::Unspecified),
            pay_min: json_f64(record, &["pay", "min"]),
            pay_max: json_f64(record, &["pay", "max"]),
            sign_on_bonus: json_f64(record, &["sign_on_bonus"]),
            required_experience,
            city: city.to_string(),
            state: state.to_string(),
            facility_name: facility_name.to_string(),
            posted_at,
            raw_hash: sha256_hex(record.to_string().as_bytes()),
        })
    }
}

/// `medboard`: public HTML job board, one `li.job-card` per posting.
#[derive(Debug, Clone, Copy)]
pub struct MedboardAdapter;

#[async_trait]
impl SourceAdapter for MedboardAdapter {
    fn source_id(&self) -> &'static str {
        "medboard"
    }

    async fn fetch_listing(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        targets: &[ListingTarget],
    ) -> Result<Vec<RawListing>, AdapterError> {
        fetch_targets(http, ctx, self.source_id(), "text/html", targets).await
    }

    fn parse_listing(&self, listing: &RawListing) -> Result<ParseOutcome, AdapterError> {
        let html_text = String::from_utf8_lossy(&listing.body);
        let document = Html::parse_document(&html_text);
        let card_sel = selector("li.job-card");
        let title_sel = selector(".title");
        let facility_sel = selector(".facility");
        let location_sel = selector(".location");
        let pay_sel = selector(".pay");
        let shift_sel = selector(".shift");
        let posted_sel = selector(".posted");

        let mut outcome = ParseOutcome::default();
        for card in document.select(&card_sel) {
            match parse_medboard_card(
                card,
                &title_sel,
                &facility_sel,
                &location_sel,
                &pay_sel,
                &shift_sel,
                &posted_sel,
            ) {
                Ok(draft) => outcome.jobs.push(draft),
                Err(reason) => outcome.skipped.push(SkippedRecord { reason }),
            }
        }
        Ok(outcome)
    }
}

fn parse_medboard_card(
    card: ElementRef<'_>,
    title_sel: &Selector,
    facility_sel: &Selector,
    location_sel: &Selector,
    pay_sel: &Selector,
    shift_sel: &Selector,
    posted_sel: &Selector,
) -> Result<JobDraft, String> {
    let title =
        element_text(card, title_sel).ok_or_else(|| "medboard card missing title".to_string())?;
    let facility_name = element_text(card, facility_sel)
        .ok_or_else(|| "medboard card missing facility".to_string())?;
    let location = element_text(card, location_sel)
        .ok_or_else(|| "medboard card missing location".to_string())?;
    let (city, state) = location
        .split_once(',')
        .map(|(c, s)| (c.trim().to_string(), s.trim().to_string()))
        .ok_or_else(|| format!("medboard location not `City, ST`: {location}"))?;
    let posted_at = element_text(card, posted_sel)
        .as_deref()
        .and_then(parse_posted_date)
        .ok_or_else(|| "medboard card missing or invalid posted date".to_string())?;

    let (pay_min, pay_max) = element_text(card, pay_sel)
        .map(|text| parse_pay_rate(&text))
        .unwrap_or((None, None));

    Ok(JobDraft {
        source_id: "medboard".into(),
        external_id: card
            .value()
            .attr("data-job-id")
            .and_then(|s| text_or_none(s.to_string())),
        specialty: normalize_specialty(&title),
        employment_type: EmploymentType::FullTime,
        shift_type: element_text(card, shift_sel)
            .map(|text| normalize_shift(&text))
            .unwrap_or(ShiftType::Unspecified),
        pay_min,
        pay_max,
        sign_on_bonus: None,
        required_experience: None,
        city,
        state,
        facility_name,
        posted_at,
        title,
        raw_hash: sha256_hex(card.html().as_bytes()),
    })
}

/// `shiftline`: JSON feed with free-text pay strings and a flat layout.
#[derive(Debug, Clone, Copy)]
pub struct ShiftlineAdapter;

#[async_trait]
impl SourceAdapter for ShiftlineAdapter {
    fn source_id(&self) -> &'static str {
        "shiftline"
    }

    async fn fetch_listing(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        targets: &[ListingTarget],
    ) -> Result<Vec<RawListing>, AdapterError> {
        fetch_targets(http, ctx, self.source_id(), "application/json", targets).await
    }

    fn parse_listing(&self, listing: &RawListing) -> Result<ParseOutcome, AdapterError> {
        let root = listing_json(listing)?;
        let records = root
            .as_array()
            .ok_or_else(|| AdapterError::MalformedSourceData("expected top-level array".into()))?;

        let mut outcome = ParseOutcome::default();
        for record in records {
            match self.parse_record(record) {
                Ok(draft) => outcome.jobs.push(draft),
                Err(reason) => outcome.skipped.push(SkippedRecord { reason }),
            }
        }
        Ok(outcome)
    }
}

impl ShiftlineAdapter {
    fn parse_record(&self, record: &JsonValue) -> Result<JobDraft, String> {
        let title = json_str(record, &["position"])
            .ok_or_else(|| "shiftline record missing position".to_string())?;
        let facility_name = json_str(record, &["hospital"])
            .ok_or_else(|| "shiftline record missing hospital".to_string())?;
        let city = json_str(record, &["city"])
            .ok_or_else(|| "shiftline record missing city".to_string())?;
        let state = json_str(record, &["state"])
            .ok_or_else(|| "shiftline record missing state".to_string())?;
        let posted_at = json_str(record, &["listed"])
            .and_then(parse_posted_date)
            .ok_or_else(|| "shiftline record missing or invalid listed date".to_string())?;

        let (pay_min, pay_max) = json_str(record, &["compensation"])
            .map(parse_pay_rate)
            .unwrap_or((None, None));

        Ok(JobDraft {
            source_id: "shiftline".into(),
            external_id: json_str(record, &["ref"]).map(ToString::to_string),
            title: title.to_string(),
            specialty: json_str(record, &["dept"])
                .map(normalize_specialty)
                .unwrap_or_else(|| normalize_specialty(title)),
            employment_type: json_str(record, &["type"])
                .and_then(normalize_employment)
                .unwrap_or(EmploymentType::Travel),
            shift_type: json_str(record, &["shift"])
                .map(normalize_shift)
                .unwrap_or(ShiftType::Unspecified),
            pay_min,
            pay_max,
            sign_on_bonus: json_str(record, &["bonus"])
                .and_then(|text| extract_numbers(text).first().copied()),
            required_experience: json_str(record, &["experience"]).and_then(parse_experience_band),
            city: city.to_string(),
            state: state.to_string(),
            facility_name: facility_name.to_string(),
            posted_at,
            raw_hash: sha256_hex(record.to_string().as_bytes()),
        })
    }
}

/// `hhs-facility-registry`: facility metadata (staffing ratios, retention,
/// survey scores, benefits flags).
#[derive(Debug, Clone, Copy)]
pub struct HhsFacilityRegistryAdapter;

#[async_trait]
impl SourceAdapter for HhsFacilityRegistryAdapter {
    fn source_id(&self) -> &'static str {
        "hhs-facility-registry"
    }

    async fn fetch_listing(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        targets: &[ListingTarget],
    ) -> Result<Vec<RawListing>, AdapterError> {
        fetch_targets(http, ctx, self.source_id(), "application/json", targets).await
    }

    fn parse_listing(&self, listing: &RawListing) -> Result<ParseOutcome, AdapterError> {
        let root = listing_json(listing)?;
        let records = root
            .get("facilities")
            .and_then(|v| v.as_array())
            .ok_or_else(|| AdapterError::MalformedSourceData("missing `facilities` array".into()))?;

        let mut outcome = ParseOutcome::default();
        for record in records {
            match parse_facility_record(record) {
                Ok(draft) => outcome.facilities.push(draft),
                Err(reason) => outcome.skipped.push(SkippedRecord { reason }),
            }
        }
        Ok(outcome)
    }
}

fn parse_facility_record(record: &JsonValue) -> Result<FacilityDraft, String> {
    let name =
        json_str(record, &["name"]).ok_or_else(|| "registry record missing name".to_string())?;
    let city =
        json_str(record, &["city"]).ok_or_else(|| "registry record missing city".to_string())?;
    let state =
        json_str(record, &["state"]).ok_or_else(|| "registry record missing state".to_string())?;

    let benefits: Vec<&str> = record
        .get("benefits")
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_str()).collect())
        .unwrap_or_default();
    let has_benefit = |key: &str| {
        if benefits.is_empty() {
            None
        } else {
            Some(benefits.contains(&key))
        }
    };

    Ok(FacilityDraft {
        name: name.to_string(),
        city: city.to_string(),
        state: state.to_string(),
        attributes: FacilityAttributes {
            nurse_to_patient_ratio: record
                .get("nurse_to_patient_ratio")
                .and_then(parse_staffing_ratio),
            retention_rate: json_f64(record, &["retention_rate"]),
            survey_wellbeing: json_f64(record, &["survey", "wellbeing"]),
            survey_autonomy: json_f64(record, &["survey", "autonomy"]),
            payroll_dispute_rate: json_f64(record, &["payroll_dispute_rate"]),
            cost_of_living_index: json_f64(record, &["cost_of_living_index"]),
            tuition_reimbursement: has_benefit("tuition_reimbursement"),
            preceptorship_program: has_benefit("preceptorship"),
            childcare_support: has_benefit("childcare"),
            lift_team: has_benefit("lift_team"),
        },
    })
}

/// Closed adapter registry. Unknown source ids are a configuration problem,
/// surfaced by the pipeline before any fetch happens.
pub fn adapter_for_source(source_id: &str) -> Option<Box<dyn SourceAdapter>> {
    match source_id {
        "carelist" => Some(Box::new(CarelistAdapter)),
        "medboard" => Some(Box::new(MedboardAdapter)),
        "shiftline" => Some(Box::new(ShiftlineAdapter)),
        "hhs-facility-registry" => Some(Box::new(HhsFacilityRegistryAdapter)),
        _ => None,
    }
}
