//! Thin axum JSON API over the catalog, the merger and the recommendation engine.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::Utc;
use scholar_core::{
    normalize_link, AcademicMajor, AgeRange, FinancialNeed, Gender, QualifyingDimension,
    Scholarship, ScholarshipObservation, UserProfile,
};
use scholar_engine::{is_eligible, EngineConfig, RecommendError, RecommendationEngine};
use scholar_ingest::{IngestConfig, MergeError, Merger};
use scholar_storage::{
    open_store, CatalogStore, DimensionFilter, StoreConfig, StoreError, UpsertOutcome,
    MAX_QUERY_LIMIT,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "scholar-web";

const DEFAULT_PAGE_SIZE: usize = 100;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn CatalogStore>,
    pub engine: Arc<RecommendationEngine>,
    pub merger: Merger,
}

impl AppState {
    pub fn new(
        store: Arc<dyn CatalogStore>,
        engine: RecommendationEngine,
        merger: Merger,
    ) -> Self {
        Self {
            store,
            engine: Arc::new(engine),
            merger,
        }
    }

    pub async fn from_env() -> anyhow::Result<Self> {
        let store = open_store(&StoreConfig::from_env()).await?;
        let engine = RecommendationEngine::new(EngineConfig::from_env());
        Ok(Self::new(store, engine, IngestConfig::from_env().merger()))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct PageQuery {
    skip: Option<usize>,
    limit: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
struct EligibilityQuery {
    link: String,
}

/// Editable part of a profile; the id comes from the path and `recommend` is computed.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfileInput {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub academic_major: Option<AcademicMajor>,
    #[serde(default)]
    pub age: Option<AgeRange>,
    #[serde(default)]
    pub gender: Option<Gender>,
    #[serde(default)]
    pub financial_need: Option<FinancialNeed>,
    #[serde(default)]
    pub grade_point_average: Option<f64>,
    #[serde(default)]
    pub sat_score: Option<u32>,
    #[serde(default)]
    pub interests: Vec<String>,
}

impl ProfileInput {
    fn into_profile(self, id: Uuid, recommend: Vec<Scholarship>) -> UserProfile {
        UserProfile {
            id,
            name: self.name,
            academic_major: self.academic_major,
            age: self.age,
            gender: self.gender,
            financial_need: self.financial_need,
            grade_point_average: self.grade_point_average,
            sat_score: self.sat_score,
            interests: self.interests,
            recommend,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct MergeResponse {
    link: String,
    outcome: UpsertOutcome,
}

#[derive(Debug, Clone, Serialize)]
struct EligibilityResponse {
    link: String,
    eligible: bool,
    reason: &'static str,
    message: &'static str,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route(
            "/scholarships",
            get(list_scholarships_handler).post(create_scholarship_handler),
        )
        .route("/scholarships/search", get(search_scholarships_handler))
        .route("/scholarships/{id}", delete(delete_scholarship_handler))
        .route("/observations", post(merge_observation_handler))
        .route(
            "/users/{id}",
            get(get_user_handler)
                .put(put_user_handler)
                .delete(delete_user_handler),
        )
        .route("/users/{id}/recommendations", get(recommendations_handler))
        .route("/users/{id}/eligibility", get(eligibility_handler))
        .with_state(Arc::new(state))
}

pub fn port_from_env() -> u16 {
    std::env::var("SCHOLAR_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000)
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving scholarship api");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    serve(AppState::from_env().await?, port_from_env()).await
}

async fn health_handler() -> Response {
    Json(serde_json::json!({ "status": "ok" })).into_response()
}

async fn list_scholarships_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PageQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE).min(MAX_QUERY_LIMIT);
    match state.store.query_batch(query.skip.unwrap_or(0), limit).await {
        Ok(records) => Json(records).into_response(),
        Err(err) => store_error(err),
    }
}

async fn search_scholarships_handler(
    State(state): State<Arc<AppState>>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Response {
    let mut filter = DimensionFilter::new();
    let mut limit = MAX_QUERY_LIMIT;
    for (key, value) in pairs {
        if key == "limit" {
            match value.parse::<usize>() {
                Ok(parsed) => limit = parsed.min(MAX_QUERY_LIMIT),
                Err(_) => {
                    return client_error(
                        StatusCode::BAD_REQUEST,
                        format!("invalid limit {value:?}"),
                    )
                }
            }
            continue;
        }
        let Some(dimension) = QualifyingDimension::ALL
            .into_iter()
            .find(|d| d.field_name() == key)
        else {
            return client_error(
                StatusCode::BAD_REQUEST,
                format!("unknown search field {key:?}"),
            );
        };
        filter.insert(dimension, [value]);
    }

    match state.store.query_by_filter(&filter, limit).await {
        Ok(records) => Json(records).into_response(),
        Err(err) => store_error(err),
    }
}

async fn create_scholarship_handler(
    State(state): State<Arc<AppState>>,
    Json(mut record): Json<Scholarship>,
) -> Response {
    record.link = match normalize_link(&record.link, state.merger.link_base()) {
        Ok(link) => link,
        Err(err) => return client_error(StatusCode::UNPROCESSABLE_ENTITY, err.to_string()),
    };
    if record.title.trim().is_empty() {
        return client_error(StatusCode::UNPROCESSABLE_ENTITY, "scholarship has no title".into());
    }
    match state.store.insert(&record).await {
        Ok(()) => (StatusCode::CREATED, Json(record)).into_response(),
        Err(err) => store_error(err),
    }
}

/// `id` is the scholarship link, percent-encoded into one path segment; relative
/// links resolve against the configured base like every other entry point.
async fn delete_scholarship_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    let link = match normalize_link(&id, state.merger.link_base()) {
        Ok(link) => link,
        Err(err) => return client_error(StatusCode::BAD_REQUEST, err.to_string()),
    };
    match state.store.delete_scholarship(&link).await {
        Ok(true) => {
            info!(link = %link, "deleted scholarship");
            StatusCode::NO_CONTENT.into_response()
        }
        Ok(false) => not_found(format!("scholarship {link} not found")),
        Err(err) => store_error(err),
    }
}

async fn merge_observation_handler(
    State(state): State<Arc<AppState>>,
    Json(observation): Json<ScholarshipObservation>,
) -> Response {
    match state.merger.merge_into(state.store.as_ref(), &observation).await {
        Ok((link, outcome)) => {
            let status = match outcome {
                UpsertOutcome::Created => StatusCode::CREATED,
                UpsertOutcome::Merged => StatusCode::OK,
            };
            (status, Json(MergeResponse { link, outcome })).into_response()
        }
        Err(MergeError::Store(err)) => store_error(err),
        Err(err) => client_error(StatusCode::UNPROCESSABLE_ENTITY, err.to_string()),
    }
}

async fn get_user_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
) -> Response {
    match state.store.fetch_profile(id).await {
        Ok(Some(profile)) => Json(profile).into_response(),
        Ok(None) => not_found(format!("user {id} not found")),
        Err(err) => store_error(err),
    }
}

async fn put_user_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
    Json(input): Json<ProfileInput>,
) -> Response {
    let cached = match state.store.fetch_profile(id).await {
        Ok(existing) => existing.map(|p| p.recommend).unwrap_or_default(),
        Err(err) => return store_error(err),
    };
    let profile = input.into_profile(id, cached);
    if let Err(err) = profile.validate() {
        return client_error(StatusCode::UNPROCESSABLE_ENTITY, err.to_string());
    }
    if let Err(err) = state.store.upsert_profile(&profile).await {
        return store_error(err);
    }

    // Recommendation failures never fail the profile write.
    let recommend = match state.engine.refresh(id, state.store.as_ref()).await {
        Ok(shortlist) => shortlist,
        Err(err) => {
            warn!(
                user_id = %id,
                error = %err,
                "could not refresh recommendations after profile update"
            );
            profile.recommend.clone()
        }
    };
    Json(UserProfile { recommend, ..profile }).into_response()
}

async fn delete_user_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
) -> Response {
    match state.store.delete_profile(id).await {
        Ok(true) => {
            info!(user_id = %id, "deleted user");
            StatusCode::NO_CONTENT.into_response()
        }
        Ok(false) => not_found(format!("user {id} not found")),
        Err(err) => store_error(err),
    }
}

async fn recommendations_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
) -> Response {
    match state.engine.recommend_within(id, state.store.as_ref()).await {
        Ok(shortlist) => Json(shortlist).into_response(),
        Err(RecommendError::UnknownUser(id)) => not_found(format!("user {id} not found")),
        Err(err) => {
            error!(
                user_id = %id,
                error = %err,
                "recommendation failed; returning empty shortlist"
            );
            Json(Vec::<Scholarship>::new()).into_response()
        }
    }
}

async fn eligibility_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
    Query(query): Query<EligibilityQuery>,
) -> Response {
    let link = match normalize_link(&query.link, state.merger.link_base()) {
        Ok(link) => link,
        Err(err) => return client_error(StatusCode::BAD_REQUEST, err.to_string()),
    };
    let user = match state.store.fetch_profile(id).await {
        Ok(Some(user)) => user,
        Ok(None) => return not_found(format!("user {id} not found")),
        Err(err) => return store_error(err),
    };
    let record = match state.store.get_by_key(&link).await {
        Ok(Some(record)) => record,
        Ok(None) => return not_found(format!("scholarship {link} not found")),
        Err(err) => return store_error(err),
    };

    let verdict = is_eligible(&user, &record, Utc::now());
    Json(EligibilityResponse {
        link,
        eligible: verdict.eligible,
        reason: verdict.reason.code(),
        message: verdict.reason.message(),
    })
    .into_response()
}

fn client_error(status: StatusCode, message: String) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

fn not_found(message: String) -> Response {
    client_error(StatusCode::NOT_FOUND, message)
}

fn store_error(err: StoreError) -> Response {
    match err {
        StoreError::DuplicateKey(_) => client_error(StatusCode::CONFLICT, err.to_string()),
        StoreError::MissingProfile(_) => not_found(err.to_string()),
        StoreError::Record(_) => client_error(StatusCode::UNPROCESSABLE_ENTITY, err.to_string()),
        err => {
            error!(error = %err, "store failure");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({ "error": format!("Server error: {err}") })),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use scholar_engine::FixedAnalyzer;
    use scholar_storage::MemoryStore;
    use tower::ServiceExt;

    fn test_app(store: Arc<MemoryStore>) -> Router {
        let engine = RecommendationEngine::new(EngineConfig::default())
            .with_analyzer(Box::new(FixedAnalyzer(0.0)));
        app(AppState::new(
            store,
            engine,
            Merger::new().with_link_base("https://www.scholarships.com"),
        ))
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    fn delete(uri: &str) -> Request<Body> {
        Request::builder()
            .method("DELETE")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    fn post_observation(link: &str, dimension: &str, label: &str) -> Request<Body> {
        json_request("POST", "/observations", observation(link, dimension, label))
    }

    fn observation(link: &str, dimension: &str, label: &str) -> serde_json::Value {
        serde_json::json!({
            "title": "Robotics Award",
            "link": link,
            "amount": "$10,000",
            "due_date": "June 07, 2099",
            "description": "Robotics scholarship",
            "dimension": { "dimension": dimension, "label": label }
        })
    }

    #[tokio::test]
    async fn handler_smoke_health() {
        let resp = test_app(Arc::new(MemoryStore::new()))
            .oneshot(get("/health"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["status"], "ok");
    }

    #[tokio::test]
    async fn duplicate_create_is_a_conflict() {
        let app = test_app(Arc::new(MemoryStore::new()));
        let record = serde_json::json!({
            "link": "https://www.scholarships.com/a",
            "title": "A"
        });
        let first = app
            .clone()
            .oneshot(json_request("POST", "/scholarships", record.clone()))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::CREATED);

        let second = app
            .oneshot(json_request("POST", "/scholarships", record))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn observations_merge_and_are_searchable() {
        let store = Arc::new(MemoryStore::new());
        let app = test_app(store.clone());

        let created = app
            .clone()
            .oneshot(post_observation("/award/robotics", "gender", "Female"))
            .await
            .unwrap();
        assert_eq!(created.status(), StatusCode::CREATED);

        let merged = app
            .clone()
            .oneshot(post_observation("/award/robotics", "academic_major", "Art"))
            .await
            .unwrap();
        assert_eq!(merged.status(), StatusCode::OK);
        assert_eq!(body_json(merged).await["outcome"], "merged");

        let rejected = app
            .clone()
            .oneshot(post_observation("/award/x", "gender", "Art"))
            .await
            .unwrap();
        assert_eq!(rejected.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let found = app
            .clone()
            .oneshot(get("/scholarships/search?gender=Male&gender=Female&academic_major=Art"))
            .await
            .unwrap();
        assert_eq!(found.status(), StatusCode::OK);
        let found = body_json(found).await;
        assert_eq!(found.as_array().unwrap().len(), 1);
        assert_eq!(found[0]["link"], "https://www.scholarships.com/award/robotics");

        let missing = app
            .oneshot(get("/scholarships/search?gender=Male"))
            .await
            .unwrap();
        assert_eq!(body_json(missing).await.as_array().unwrap().len(), 0);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn unknown_search_field_is_rejected() {
        let resp = test_app(Arc::new(MemoryStore::new()))
            .oneshot(get("/scholarships/search?color=blue"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn profile_update_recomputes_recommendations() {
        let store = Arc::new(MemoryStore::new());
        let app = test_app(store.clone());
        app.clone()
            .oneshot(post_observation("/award/robotics", "gender", "Female"))
            .await
            .unwrap();

        let id = Uuid::new_v4();
        let profile = serde_json::json!({
            "name": "Ada",
            "gender": "Female",
            "grade_point_average": 3.4,
            "sat_score": 1250,
            "interests": ["robotics"]
        });
        let put = app
            .clone()
            .oneshot(json_request("PUT", &format!("/users/{id}"), profile))
            .await
            .unwrap();
        assert_eq!(put.status(), StatusCode::OK);
        let saved = body_json(put).await;
        assert_eq!(saved["recommend"].as_array().unwrap().len(), 1);

        let recs = app
            .clone()
            .oneshot(get(&format!("/users/{id}/recommendations")))
            .await
            .unwrap();
        assert_eq!(recs.status(), StatusCode::OK);
        assert_eq!(body_json(recs).await[0]["title"], "Robotics Award");

        let verdict = app
            .oneshot(get(&format!(
                "/users/{id}/eligibility?link=/award/robotics"
            )))
            .await
            .unwrap();
        let verdict = body_json(verdict).await;
        assert_eq!(verdict["eligible"], true);
        assert_eq!(verdict["reason"], "ok");
    }

    #[tokio::test]
    async fn eligibility_explains_mismatch() {
        let store = Arc::new(MemoryStore::new());
        let app = test_app(store.clone());
        app.clone()
            .oneshot(post_observation("/award/robotics", "gender", "Female"))
            .await
            .unwrap();
        let id = Uuid::new_v4();
        app.clone()
            .oneshot(json_request(
                "PUT",
                &format!("/users/{id}"),
                serde_json::json!({ "gender": "Male" }),
            ))
            .await
            .unwrap();

        let verdict = app
            .oneshot(get(&format!("/users/{id}/eligibility?link=/award/robotics")))
            .await
            .unwrap();
        let verdict = body_json(verdict).await;
        assert_eq!(verdict["eligible"], false);
        assert_eq!(verdict["reason"], "gender_mismatch");
    }

    #[tokio::test]
    async fn invalid_profile_is_unprocessable() {
        let resp = test_app(Arc::new(MemoryStore::new()))
            .oneshot(json_request(
                "PUT",
                &format!("/users/{}", Uuid::new_v4()),
                serde_json::json!({ "grade_point_average": 9.5 }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn unknown_user_is_not_found() {
        let resp = test_app(Arc::new(MemoryStore::new()))
            .oneshot(get(&format!("/users/{}/recommendations", Uuid::new_v4())))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn store_outage_yields_empty_recommendations() {
        let store = Arc::new(MemoryStore::new());
        store.set_offline(true);
        let resp = test_app(store)
            .oneshot(get(&format!("/users/{}/recommendations", Uuid::new_v4())))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await, serde_json::json!([]));
    }

    #[tokio::test]
    async fn delete_scholarship_by_encoded_link() {
        let store = Arc::new(MemoryStore::new());
        let app = test_app(store.clone());
        app.clone()
            .oneshot(post_observation("/award/robotics", "gender", "Female"))
            .await
            .unwrap();

        let gone = app
            .clone()
            .oneshot(delete(
                "/scholarships/https%3A%2F%2Fwww.scholarships.com%2Faward%2Frobotics%2F",
            ))
            .await
            .unwrap();
        assert_eq!(gone.status(), StatusCode::NO_CONTENT);
        assert!(store.is_empty().await);

        let again = app
            .clone()
            .oneshot(delete("/scholarships/%2Faward%2Frobotics"))
            .await
            .unwrap();
        assert_eq!(again.status(), StatusCode::NOT_FOUND);

        let search = app
            .oneshot(get("/scholarships/search?gender=Female"))
            .await
            .unwrap();
        assert_eq!(search.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn delete_user_then_lookups_miss() {
        let store = Arc::new(MemoryStore::new());
        let app = test_app(store.clone());
        let id = Uuid::new_v4();
        app.clone()
            .oneshot(json_request(
                "PUT",
                &format!("/users/{id}"),
                serde_json::json!({ "name": "Ada" }),
            ))
            .await
            .unwrap();

        let gone = app
            .clone()
            .oneshot(delete(&format!("/users/{id}")))
            .await
            .unwrap();
        assert_eq!(gone.status(), StatusCode::NO_CONTENT);

        let fetched = app
            .clone()
            .oneshot(get(&format!("/users/{id}")))
            .await
            .unwrap();
        assert_eq!(fetched.status(), StatusCode::NOT_FOUND);

        let again = app
            .oneshot(delete(&format!("/users/{id}")))
            .await
            .unwrap();
        assert_eq!(again.status(), StatusCode::NOT_FOUND);
    }
}
