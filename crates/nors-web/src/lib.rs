//! Read-only axum JSON API over the canonical job and facility stores.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Duration, Utc};
use nors_advisor::{market_score, quick_insights, recommendations, MarketFactors, MarketScoreOutcome, QuotaEngine};
use nors_core::{Facility, Grade, IndexCode, JobPosting, UserProfile};
use nors_store::{FacilityStore, JobStore};
use serde::Serialize;
use tokio::net::TcpListener;
use uuid::Uuid;

pub const CRATE_NAME: &str = "nors-web";

#[derive(Clone)]
pub struct AppState {
    pub jobs: Arc<JobStore>,
    pub facilities: Arc<FacilityStore>,
    pub profiles: HashMap<Uuid, UserProfile>,
    pub quota: Arc<QuotaEngine>,
    pub freshness: Duration,
}

impl AppState {
    pub fn new(
        jobs: Arc<JobStore>,
        facilities: Arc<FacilityStore>,
        profiles: HashMap<Uuid, UserProfile>,
        quota: Arc<QuotaEngine>,
        freshness: Duration,
    ) -> Self {
        Self {
            jobs,
            facilities,
            profiles,
            quota,
            freshness,
        }
    }
}

/// Facility shape served on the wire. `aggregatedIndices` keeps the ten codes
/// in their documented order.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FacilityBody {
    pub id: Uuid,
    pub name: String,
    pub city: String,
    pub state: String,
    pub aggregated_indices: BTreeMap<IndexCode, f64>,
    pub composite_score: f64,
    pub grade: Grade,
    pub last_scored_at: Option<DateTime<Utc>>,
}

impl From<Facility> for FacilityBody {
    fn from(facility: Facility) -> Self {
        FacilityBody {
            id: facility.id,
            name: facility.name,
            city: facility.city,
            state: facility.state,
            aggregated_indices: facility.indices,
            composite_score: facility.composite_score,
            grade: facility.grade,
            last_scored_at: facility.last_scored_at,
        }
    }
}

#[derive(Debug, Serialize)]
struct MarketScoreBody {
    score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    grade: Option<Grade>,
    #[serde(skip_serializing_if = "Option::is_none")]
    factors: Option<MarketFactors>,
    #[serde(skip_serializing_if = "Option::is_none")]
    suggestions: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

#[derive(Debug, Serialize)]
struct RecommendationCategory {
    title: &'static str,
    icon: &'static str,
    jobs: Vec<JobPosting>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RecommendationsBody {
    best_pay: RecommendationCategory,
    best_facility: RecommendationCategory,
    new_this_week: RecommendationCategory,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/facilities", get(facilities_handler))
        .route("/facilities/{id}", get(facility_detail_handler))
        .route("/jobs", get(jobs_handler))
        .route("/jobs/{id}", get(job_detail_handler))
        .route("/users/{id}/market-score", get(market_score_handler))
        .route("/users/{id}/recommendations", get(recommendations_handler))
        .route("/users/{id}/insights", get(insights_handler))
        .route("/users/{id}/quota/{feature}", post(quota_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn facilities_handler(State(state): State<Arc<AppState>>) -> Response {
    let mut facilities = state.facilities.snapshot().await;
    facilities.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
    Json(facilities.into_iter().map(FacilityBody::from).collect::<Vec<_>>()).into_response()
}

async fn facility_detail_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
) -> Response {
    match state.facilities.get(id).await {
        Some(facility) => Json(FacilityBody::from(facility)).into_response(),
        None => not_found("facility not found"),
    }
}

async fn jobs_handler(State(state): State<Arc<AppState>>) -> Response {
    let mut jobs = state.jobs.snapshot().await;
    jobs.sort_by(|a, b| {
        b.posted_at
            .cmp(&a.posted_at)
            .then_with(|| a.fingerprint.cmp(&b.fingerprint))
    });
    Json(jobs).into_response()
}

async fn job_detail_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    match state.jobs.get(&id).await {
        Some(job) => Json(job).into_response(),
        None => not_found("job not found"),
    }
}

async fn market_score_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
) -> Response {
    let Some(profile) = state.profiles.get(&id) else {
        return not_found("unknown user");
    };
    let open = open_jobs(&state).await;
    let body = match market_score(profile, &open) {
        MarketScoreOutcome::Scored(score) => MarketScoreBody {
            score: Some(score.score),
            grade: Some(score.grade),
            factors: Some(score.factors),
            suggestions: Some(score.suggestions),
            message: None,
        },
        MarketScoreOutcome::Insufficient { message } => MarketScoreBody {
            score: None,
            grade: None,
            factors: None,
            suggestions: None,
            message: Some(message),
        },
    };
    Json(body).into_response()
}

async fn recommendations_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
) -> Response {
    if !state.profiles.contains_key(&id) {
        return not_found("unknown user");
    }
    let open = open_jobs(&state).await;
    let facilities = state.facilities.snapshot().await;
    let set = recommendations(&open, &facilities, Utc::now());
    Json(RecommendationsBody {
        best_pay: RecommendationCategory {
            title: "Best Pay",
            icon: "dollar-sign",
            jobs: set.best_pay,
        },
        best_facility: RecommendationCategory {
            title: "Top Facilities",
            icon: "building",
            jobs: set.best_facility,
        },
        new_this_week: RecommendationCategory {
            title: "New This Week",
            icon: "sparkles",
            jobs: set.new_this_week,
        },
    })
    .into_response()
}

async fn insights_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
) -> Response {
    let Some(profile) = state.profiles.get(&id) else {
        return not_found("unknown user");
    };
    let open = open_jobs(&state).await;
    Json(quick_insights(&open, Some(profile))).into_response()
}

async fn quota_handler(
    State(state): State<Arc<AppState>>,
    AxumPath((id, feature)): AxumPath<(Uuid, String)>,
) -> Response {
    let Some(profile) = state.profiles.get(&id) else {
        return not_found("unknown user");
    };
    let Some(key) = nors_advisor::FeatureKey::parse(&feature) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": format!("unknown feature {feature:?}") })),
        )
            .into_response();
    };
    let decision = state
        .quota
        .check_and_consume(id, profile.tier, key, Utc::now())
        .await;
    Json(decision).into_response()
}

async fn open_jobs(state: &AppState) -> Vec<JobPosting> {
    let now = Utc::now();
    state
        .jobs
        .snapshot()
        .await
        .into_iter()
        .filter(|job| job.is_open(now, state.freshness))
        .collect()
}

fn not_found(message: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "error": message })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use nors_advisor::{TierLimits, TierLimitsTable};
    use nors_core::{
        EmploymentType, Enrichment, FacilityAttributes, FacilityDraft, JobDraft, NursingType,
        ShiftType, Specialty, Tier,
    };
    use tower::ServiceExt;

    fn ts(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn draft(external_id: &str, title: &str, pay_max: Option<f64>) -> JobDraft {
        JobDraft {
            source_id: "carelist".into(),
            external_id: Some(external_id.into()),
            title: title.into(),
            specialty: Specialty::Icu,
            employment_type: EmploymentType::FullTime,
            shift_type: ShiftType::Night,
            pay_min: Some(34.0),
            pay_max,
            sign_on_bonus: None,
            required_experience: None,
            city: "Tulsa".into(),
            state: "OK".into(),
            facility_name: "Mercy General".into(),
            posted_at: Utc::now() - Duration::days(1),
            raw_hash: format!("hash-{external_id}"),
        }
    }

    fn limits_table() -> TierLimitsTable {
        let limits = TierLimits {
            sully_daily_limit: 2,
            saved_jobs_limit: 10,
            comparison_limit: 2,
        };
        let named = ["free", "starter", "pro", "premium"]
            .into_iter()
            .map(|name| (name.to_string(), limits))
            .collect::<BTreeMap<_, _>>();
        TierLimitsTable::from_named(&named).unwrap()
    }

    fn profile(id: Uuid, complete: bool) -> UserProfile {
        UserProfile {
            id,
            nursing_type: complete.then_some(NursingType::Rn),
            specialty: complete.then_some(Specialty::Icu),
            experience_years: 4,
            region_preference: Some("OK".into()),
            tier: Tier::Free,
        }
    }

    async fn seeded_state(profiles: Vec<UserProfile>) -> AppState {
        let jobs = Arc::new(JobStore::new());
        let facilities = Arc::new(FacilityStore::new());
        let now = Utc::now();

        for (idx, pay) in [Some(61.0), Some(44.0), None].into_iter().enumerate() {
            let draft = draft(&format!("J-{idx}"), "ICU Nurse (RN)", pay);
            let fingerprint = draft.fingerprint();
            jobs.upsert(draft, now).await;
            if idx == 0 {
                jobs.mark_enriched(
                    &fingerprint,
                    Enrichment {
                        specialty_tags: vec!["icu".into(), "critical-care".into()],
                        pay_min: Some(38.0),
                        pay_max: Some(61.0),
                        summary: "ICU night shift at Mercy General".into(),
                    },
                )
                .await
                .unwrap();
            }
        }

        let facility_id = facilities
            .upsert_metadata(FacilityDraft {
                name: "Mercy General".into(),
                city: "Tulsa".into(),
                state: "OK".into(),
                attributes: FacilityAttributes::default(),
            })
            .await;
        let indices = IndexCode::all()
            .into_iter()
            .map(|code| (code, 70.0))
            .collect::<BTreeMap<_, _>>();
        facilities
            .apply_scores(facility_id, indices, 70.0, Grade::from_score(70.0), now)
            .await
            .unwrap();

        AppState::new(
            jobs,
            facilities,
            profiles.into_iter().map(|p| (p.id, p)).collect(),
            Arc::new(QuotaEngine::new(limits_table())),
            Duration::hours(72),
        )
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn get(uri: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    fn post_req(uri: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method("POST")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn facilities_serve_the_published_shape() {
        let app = app(seeded_state(vec![]).await);
        let resp = app.oneshot(get("/facilities")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = body_json(resp).await;
        let facility = &body.as_array().unwrap()[0];
        assert_eq!(facility["name"], "Mercy General");
        assert_eq!(facility["state"], "OK");
        assert_eq!(facility["grade"], "B");
        assert_eq!(facility["compositeScore"], 70.0);
        assert_eq!(facility["aggregatedIndices"]["NWI"], 70.0);
        assert_eq!(facility["aggregatedIndices"].as_object().unwrap().len(), 10);
        assert!(facility["lastScoredAt"].is_string());
    }

    #[tokio::test]
    async fn facility_detail_round_trips_by_id() {
        let state = seeded_state(vec![]).await;
        let facility_id = state.facilities.snapshot().await[0].id;
        let app = app(state);

        let resp = app
            .clone()
            .oneshot(get(&format!("/facilities/{facility_id}")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["id"], facility_id.to_string());

        let missing = app
            .oneshot(get(&format!("/facilities/{}", Uuid::new_v4())))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn job_detail_carries_enrichment() {
        let state = seeded_state(vec![]).await;
        let fingerprint = draft("J-0", "ICU Nurse (RN)", Some(61.0)).fingerprint();
        let app = app(state);

        let resp = app
            .clone()
            .oneshot(get(&format!("/jobs/{fingerprint}")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["enrichment"]["pay_max"], 61.0);
        assert_eq!(body["enrichment_state"]["state"], "enriched");

        let missing = app.oneshot(get("/jobs/no-such-fingerprint")).await.unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn jobs_list_is_sorted_newest_first() {
        let app = app(seeded_state(vec![]).await);
        let resp = app.oneshot(get("/jobs")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = body_json(resp).await;
        let jobs = body.as_array().unwrap();
        assert_eq!(jobs.len(), 3);
        let posted = jobs
            .iter()
            .map(|j| j["posted_at"].as_str().unwrap().to_string())
            .collect::<Vec<_>>();
        let mut sorted = posted.clone();
        sorted.sort_by(|a, b| b.cmp(a));
        assert_eq!(posted, sorted);
    }

    #[tokio::test]
    async fn market_score_is_null_with_a_message_for_incomplete_profiles() {
        let user = Uuid::new_v4();
        let app = app(seeded_state(vec![profile(user, false)]).await);

        let resp = app
            .oneshot(get(&format!("/users/{user}/market-score")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert!(body["score"].is_null());
        assert!(body["message"].as_str().unwrap().contains("specialty"));
        assert!(body.get("factors").is_none());
    }

    #[tokio::test]
    async fn market_score_reports_factors_for_complete_profiles() {
        let user = Uuid::new_v4();
        let app = app(seeded_state(vec![profile(user, true)]).await);

        let resp = app
            .oneshot(get(&format!("/users/{user}/market-score")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert!(body["score"].is_number());
        assert!(body["grade"].is_string());
        assert!(body["factors"]["license_demand"].is_number());
        assert!(body["factors"]["specialty_demand"].is_number());
        assert!(body["factors"]["experience_match"].is_number());
        assert!(body["suggestions"].is_array());
    }

    #[tokio::test]
    async fn recommendations_wrap_each_category_with_title_and_icon() {
        let user = Uuid::new_v4();
        let app = app(seeded_state(vec![profile(user, true)]).await);

        let resp = app
            .oneshot(get(&format!("/users/{user}/recommendations")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["bestPay"]["title"], "Best Pay");
        assert_eq!(body["bestPay"]["jobs"].as_array().unwrap().len(), 3);
        assert_eq!(body["bestFacility"]["icon"], "building");
        assert!(body["newThisWeek"]["jobs"].is_array());
    }

    #[tokio::test]
    async fn empty_stores_serve_empty_recommendation_arrays() {
        let user = Uuid::new_v4();
        let state = AppState::new(
            Arc::new(JobStore::new()),
            Arc::new(FacilityStore::new()),
            [(user, profile(user, true))].into_iter().collect(),
            Arc::new(QuotaEngine::new(limits_table())),
            Duration::hours(72),
        );
        let app = app(state);

        let resp = app
            .oneshot(get(&format!("/users/{user}/recommendations")))
            .await
            .unwrap();
        let body = body_json(resp).await;
        assert_eq!(body["bestPay"]["jobs"], serde_json::json!([]));
        assert_eq!(body["bestFacility"]["jobs"], serde_json::json!([]));
        assert_eq!(body["newThisWeek"]["jobs"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn insights_count_matches_for_the_profile() {
        let user = Uuid::new_v4();
        let app = app(seeded_state(vec![profile(user, true)]).await);

        let resp = app
            .oneshot(get(&format!("/users/{user}/insights")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["jobMatches"], 3);
        assert!(body["paySpikes"].is_array());
        assert!(body["hotSpecialties"].is_array());
        assert!(body["signOnBonuses"].is_array());
    }

    #[tokio::test]
    async fn quota_consumes_until_the_limit_then_denies() {
        let user = Uuid::new_v4();
        let app = app(seeded_state(vec![profile(user, true)]).await);
        let uri = format!("/users/{user}/quota/ai_questions");

        for expected_used in 1..=2u32 {
            let resp = app.clone().oneshot(post_req(&uri)).await.unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
            let body = body_json(resp).await;
            assert_eq!(body["allowed"], true);
            assert_eq!(body["used"], expected_used);
            assert_eq!(body["limit"], 2);
        }

        let resp = app.oneshot(post_req(&uri)).await.unwrap();
        let body = body_json(resp).await;
        assert_eq!(body["allowed"], false);
        assert_eq!(body["used"], 2);
    }

    #[tokio::test]
    async fn unknown_feature_names_are_rejected() {
        let user = Uuid::new_v4();
        let app = app(seeded_state(vec![profile(user, true)]).await);

        let resp = app
            .oneshot(post_req(&format!("/users/{user}/quota/teleportation")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_users_are_a_404_on_every_user_route() {
        let app = app(seeded_state(vec![]).await);
        let stranger = Uuid::new_v4();

        for uri in [
            format!("/users/{stranger}/market-score"),
            format!("/users/{stranger}/recommendations"),
            format!("/users/{stranger}/insights"),
        ] {
            let resp = app.clone().oneshot(get(&uri)).await.unwrap();
            assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        }

        let resp = app
            .oneshot(post_req(&format!("/users/{stranger}/quota/saved_jobs")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
