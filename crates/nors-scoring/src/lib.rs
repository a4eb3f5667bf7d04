//! Objective Facility Score engine: ten index formulas, weights, composite.

use std::collections::BTreeMap;

use nors_core::{FacilityAttributes, Grade, IndexCode, JobPosting};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "nors-scoring";

/// Every index degrades to this when its underlying data is missing, so a
/// sparse facility still gets a finite composite.
pub const NEUTRAL_INDEX_SCORE: f64 = 50.0;

const WEIGHT_SUM_EPSILON: f64 = 1e-6;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("index weights sum to {sum}, expected 1.0")]
    InvalidWeights { sum: f64 },
    #[error("missing weight for index {0}")]
    MissingWeight(&'static str),
    #[error("invalid weights file: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Order-independent aggregation over a facility's open-job snapshot plus its
/// structured attributes. Built once per facility per scoring pass; every
/// field is a mean, median, or share, so reordering the input jobs cannot
/// change it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FacilityInputs {
    pub open_job_count: usize,
    pub median_pay: Option<f64>,
    pub pay_disclosure_rate: Option<f64>,
    pub new_grad_friendly_share: Option<f64>,
    pub region_median_pay: Option<f64>,
    pub attributes: FacilityAttributes,
}

impl FacilityInputs {
    pub fn aggregate(
        jobs: &[JobPosting],
        attributes: FacilityAttributes,
        region_median_pay: Option<f64>,
    ) -> Self {
        let open_job_count = jobs.len();
        let pay_values: Vec<f64> = jobs.iter().filter_map(|j| j.effective_pay_max()).collect();
        let share = |count: usize| {
            if open_job_count == 0 {
                None
            } else {
                Some(count as f64 / open_job_count as f64)
            }
        };

        Self {
            open_job_count,
            median_pay: median(pay_values),
            pay_disclosure_rate: share(jobs.iter().filter(|j| j.discloses_pay()).count()),
            new_grad_friendly_share: share(
                jobs.iter()
                    .filter(|j| {
                        j.required_experience
                            .map(|band| band.min_years <= 1)
                            .unwrap_or(true)
                    })
                    .count(),
            ),
            region_median_pay,
            attributes,
        }
    }
}

/// Median of an unordered sample. `None` for an empty sample.
pub fn median(mut values: Vec<f64>) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.partial_cmp(b).expect("pay values are finite"));
    let mid = values.len() / 2;
    if values.len() % 2 == 1 {
        Some(values[mid])
    } else {
        Some((values[mid - 1] + values[mid]) / 2.0)
    }
}

/// Clamp an observed input into `[lo, hi]`, logging when a source handed us
/// something out of range. Degrades instead of propagating bad data.
fn bounded(value: f64, lo: f64, hi: f64, what: &str) -> f64 {
    if !value.is_finite() {
        warn!(what, value, "non-finite scoring input, using neutral value");
        return (lo + hi) / 2.0;
    }
    if value < lo || value > hi {
        warn!(what, value, lo, hi, "out-of-range scoring input, clamping");
    }
    value.clamp(lo, hi)
}

/// Map `value` linearly from `[lo, hi]` onto `[0, 100]`.
fn scale_up(value: f64, lo: f64, hi: f64) -> f64 {
    ((value - lo) / (hi - lo) * 100.0).clamp(0.0, 100.0)
}

/// Map `value` linearly from `[lo, hi]` onto `[100, 0]`: lower is better.
fn scale_down(value: f64, lo: f64, hi: f64) -> f64 {
    100.0 - scale_up(value, lo, hi)
}

fn flag_average(flags: &[Option<bool>]) -> Option<f64> {
    let known: Vec<bool> = flags.iter().flatten().copied().collect();
    if known.is_empty() {
        return None;
    }
    let set = known.iter().filter(|v| **v).count();
    Some(set as f64 / known.len() as f64 * 100.0)
}

pub trait IndexFormula {
    fn compute(&self, inputs: &FacilityInputs) -> f64;
}

/// The shipped formula per index. Each one is pure, clamps to `[0, 100]`,
/// and returns [`NEUTRAL_INDEX_SCORE`] when its inputs are absent.
///
/// - `Nwi` nurse well-being: staff survey well-being, 0..10 scale.
/// - `Nci` competence support: preceptorship and tuition benefit flags.
/// - `Pwri` patient-to-worker ratio: 3 patients/nurse or better is 100,
///   8 or worse is 0.
/// - `Sci` staffing consistency: annual retention rate.
/// - `Ngi` nurse growth: share of postings open to nurses with at most one
///   year of experience.
/// - `Ssi` support services: childcare and lift-team flags.
/// - `Pli` professional latitude: staff survey autonomy, 0..10 scale.
/// - `Ppi` paycheck protection: payroll-dispute rate blended with median pay
///   relative to the regional median.
/// - `Jti` job transparency: share of open postings disclosing a pay range.
/// - `Sli` strategic location: local cost-of-living index, 80 or below is
///   100, 120 or above is 0.
impl IndexFormula for IndexCode {
    fn compute(&self, inputs: &FacilityInputs) -> f64 {
        let attrs = &inputs.attributes;
        match self {
            IndexCode::Nwi => match attrs.survey_wellbeing {
                Some(v) => bounded(v, 0.0, 10.0, "survey_wellbeing") * 10.0,
                None => NEUTRAL_INDEX_SCORE,
            },
            IndexCode::Nci => {
                flag_average(&[attrs.preceptorship_program, attrs.tuition_reimbursement])
                    .unwrap_or(NEUTRAL_INDEX_SCORE)
            }
            IndexCode::Pwri => match attrs.nurse_to_patient_ratio {
                Some(v) => scale_down(bounded(v, 0.0, 20.0, "nurse_to_patient_ratio"), 3.0, 8.0),
                None => NEUTRAL_INDEX_SCORE,
            },
            IndexCode::Sci => match attrs.retention_rate {
                Some(v) => bounded(v, 0.0, 1.0, "retention_rate") * 100.0,
                None => NEUTRAL_INDEX_SCORE,
            },
            IndexCode::Ngi => inputs
                .new_grad_friendly_share
                .map(|v| bounded(v, 0.0, 1.0, "new_grad_friendly_share") * 100.0)
                .unwrap_or(NEUTRAL_INDEX_SCORE),
            IndexCode::Ssi => flag_average(&[attrs.childcare_support, attrs.lift_team])
                .unwrap_or(NEUTRAL_INDEX_SCORE),
            IndexCode::Pli => match attrs.survey_autonomy {
                Some(v) => bounded(v, 0.0, 10.0, "survey_autonomy") * 10.0,
                None => NEUTRAL_INDEX_SCORE,
            },
            IndexCode::Ppi => {
                let dispute = attrs
                    .payroll_dispute_rate
                    .map(|v| scale_down(bounded(v, 0.0, 1.0, "payroll_dispute_rate"), 0.0, 0.05));
                let competitiveness = match (inputs.median_pay, inputs.region_median_pay) {
                    (Some(pay), Some(region)) if region > 0.0 => {
                        Some(scale_up(pay / region, 0.8, 1.2))
                    }
                    _ => None,
                };
                match (dispute, competitiveness) {
                    (Some(a), Some(b)) => (a + b) / 2.0,
                    (Some(a), None) => a,
                    (None, Some(b)) => b,
                    (None, None) => NEUTRAL_INDEX_SCORE,
                }
            }
            IndexCode::Jti => inputs
                .pay_disclosure_rate
                .map(|v| bounded(v, 0.0, 1.0, "pay_disclosure_rate") * 100.0)
                .unwrap_or(NEUTRAL_INDEX_SCORE),
            IndexCode::Sli => match attrs.cost_of_living_index {
                Some(v) => scale_down(bounded(v, 0.0, 300.0, "cost_of_living_index"), 80.0, 120.0),
                None => NEUTRAL_INDEX_SCORE,
            },
        }
    }
}

/// Per-index composite weights, validated on construction: all ten indices
/// present and summing to 1.0 within epsilon. Invalid weights are fatal at
/// startup, before any scoring runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringWeights {
    weights: BTreeMap<IndexCode, f64>,
}

impl ScoringWeights {
    pub fn from_map(weights: BTreeMap<IndexCode, f64>) -> Result<Self, ConfigError> {
        for code in IndexCode::all() {
            if !weights.contains_key(&code) {
                return Err(ConfigError::MissingWeight(code.code()));
            }
        }
        let sum: f64 = weights.values().sum();
        if (sum - 1.0).abs() > WEIGHT_SUM_EPSILON {
            return Err(ConfigError::InvalidWeights { sum });
        }
        Ok(Self { weights })
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        #[derive(Deserialize)]
        struct WeightsFile {
            weights: BTreeMap<IndexCode, f64>,
        }
        let file: WeightsFile = serde_yaml::from_str(text)?;
        Self::from_map(file.weights)
    }

    /// Equal weighting across all ten indices.
    pub fn equal() -> Self {
        let weights = IndexCode::all().into_iter().map(|c| (c, 0.1)).collect();
        Self { weights }
    }

    pub fn weight(&self, code: IndexCode) -> f64 {
        self.weights[&code]
    }
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self::equal()
    }
}

/// One facility's freshly computed scores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreSet {
    pub indices: BTreeMap<IndexCode, f64>,
    pub composite: f64,
    pub grade: Grade,
}

/// Compute all ten indices, the weighted composite, and the letter grade.
/// Deterministic: a pure function of the aggregated inputs.
pub fn score_facility(inputs: &FacilityInputs, weights: &ScoringWeights) -> ScoreSet {
    let indices: BTreeMap<IndexCode, f64> = IndexCode::all()
        .into_iter()
        .map(|code| (code, code.compute(inputs)))
        .collect();
    let composite = indices
        .iter()
        .map(|(code, value)| weights.weight(*code) * value)
        .sum();
    ScoreSet {
        indices,
        composite,
        grade: Grade::from_score(composite),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use nors_core::{
        sha256_hex, EmploymentType, ExperienceBand, JobDraft, ShiftType, Specialty,
    };

    fn job(external_id: &str, pay_max: Option<f64>, min_years: Option<u8>) -> JobPosting {
        let posted = Utc.with_ymd_and_hms(2026, 8, 1, 9, 0, 0).single().unwrap();
        JobPosting::from_draft(
            JobDraft {
                source_id: "carelist".into(),
                external_id: Some(external_id.into()),
                title: "RN".into(),
                specialty: Specialty::Icu,
                employment_type: EmploymentType::FullTime,
                shift_type: ShiftType::Day,
                pay_min: pay_max.map(|v| v - 5.0),
                pay_max,
                sign_on_bonus: None,
                required_experience: min_years.map(|min_years| ExperienceBand {
                    min_years,
                    max_years: min_years + 3,
                }),
                city: "Tulsa".into(),
                state: "OK".into(),
                facility_name: "Mercy General".into(),
                posted_at: posted,
                raw_hash: sha256_hex(external_id.as_bytes()),
            },
            posted,
        )
    }

    #[test]
    fn aggregation_is_order_independent() {
        let jobs = vec![
            job("J-1", Some(45.0), Some(0)),
            job("J-2", Some(39.0), Some(3)),
            job("J-3", None, None),
        ];
        let mut reversed = jobs.clone();
        reversed.reverse();

        let a = FacilityInputs::aggregate(&jobs, FacilityAttributes::default(), Some(40.0));
        let b = FacilityInputs::aggregate(&reversed, FacilityAttributes::default(), Some(40.0));
        assert_eq!(a, b);
        assert_eq!(
            score_facility(&a, &ScoringWeights::equal()),
            score_facility(&b, &ScoringWeights::equal())
        );
    }

    #[test]
    fn missing_data_degrades_every_index_to_the_neutral_default() {
        let inputs = FacilityInputs::default();
        let scores = score_facility(&inputs, &ScoringWeights::equal());
        for (code, value) in &scores.indices {
            assert_eq!(*value, NEUTRAL_INDEX_SCORE, "index {}", code.code());
        }
        assert_eq!(scores.composite, NEUTRAL_INDEX_SCORE);
        assert_eq!(scores.grade, Grade::C);
    }

    #[test]
    fn staffing_ratio_index_rewards_low_ratios() {
        let mut inputs = FacilityInputs::default();
        inputs.attributes.nurse_to_patient_ratio = Some(3.0);
        assert_eq!(IndexCode::Pwri.compute(&inputs), 100.0);
        inputs.attributes.nurse_to_patient_ratio = Some(8.0);
        assert_eq!(IndexCode::Pwri.compute(&inputs), 0.0);
        inputs.attributes.nurse_to_patient_ratio = Some(5.5);
        assert_eq!(IndexCode::Pwri.compute(&inputs), 50.0);
    }

    #[test]
    fn transparency_index_tracks_disclosure_rate() {
        let jobs = vec![
            job("J-1", Some(45.0), None),
            job("J-2", None, None),
            job("J-3", None, None),
            job("J-4", Some(41.0), None),
        ];
        let inputs = FacilityInputs::aggregate(&jobs, FacilityAttributes::default(), None);
        assert_eq!(IndexCode::Jti.compute(&inputs), 50.0);
    }

    #[test]
    fn out_of_range_inputs_clamp_instead_of_propagating() {
        let mut inputs = FacilityInputs::default();
        inputs.attributes.retention_rate = Some(1.4);
        assert_eq!(IndexCode::Sci.compute(&inputs), 100.0);
        inputs.attributes.survey_wellbeing = Some(f64::NAN);
        let nwi = IndexCode::Nwi.compute(&inputs);
        assert!(nwi.is_finite());
    }

    #[test]
    fn pay_competitiveness_compares_against_the_region() {
        let jobs = vec![job("J-1", Some(48.0), None)];
        let inputs = FacilityInputs::aggregate(&jobs, FacilityAttributes::default(), Some(40.0));
        assert_eq!(IndexCode::Ppi.compute(&inputs), 100.0);

        let inputs = FacilityInputs::aggregate(&jobs, FacilityAttributes::default(), Some(60.0));
        assert_eq!(IndexCode::Ppi.compute(&inputs), 0.0);
    }

    #[test]
    fn weights_must_cover_all_indices_and_sum_to_one() {
        let mut short: BTreeMap<IndexCode, f64> =
            IndexCode::all().into_iter().map(|c| (c, 0.1)).collect();
        short.remove(&IndexCode::Sli);
        assert!(matches!(
            ScoringWeights::from_map(short.clone()),
            Err(ConfigError::MissingWeight("SLI"))
        ));

        short.insert(IndexCode::Sli, 0.2);
        assert!(matches!(
            ScoringWeights::from_map(short),
            Err(ConfigError::InvalidWeights { .. })
        ));

        let exact: BTreeMap<IndexCode, f64> =
            IndexCode::all().into_iter().map(|c| (c, 0.1)).collect();
        assert!(ScoringWeights::from_map(exact).is_ok());
    }

    #[test]
    fn weights_load_from_yaml() {
        let yaml = r#"
weights:
  NWI: 0.15
  NCI: 0.05
  PWRI: 0.15
  SCI: 0.10
  NGI: 0.05
  SSI: 0.05
  PLI: 0.10
  PPI: 0.15
  JTI: 0.10
  SLI: 0.10
"#;
        let weights = ScoringWeights::from_yaml_str(yaml).expect("valid weights");
        assert_eq!(weights.weight(IndexCode::Nwi), 0.15);
        assert_eq!(weights.weight(IndexCode::Ngi), 0.05);
    }

    #[test]
    fn median_handles_odd_even_and_empty_samples() {
        assert_eq!(median(vec![3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(median(vec![4.0, 1.0, 2.0, 3.0]), Some(2.5));
        assert_eq!(median(Vec::new()), None);
    }
}
