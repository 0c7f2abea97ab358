//! HTTP surface for the pipeline.
//!
//! Thin layer: request validation and error-to-status mapping live here,
//! everything else is delegated to the orchestrator and services.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use crate::errors::{PipelineError, ResolveError, StoreError};
use crate::genai::{InlineImage, TextGenerator};
use crate::models::{
    CacheStats, CachedProduct, DeleteOutcome, IntakeForm, Phase, RecommendationResult,
    RecommendedProduct, RoutineResult, SessionStatus, SkinAnalysis, SweepOutcome,
};
use crate::pipeline::Pipeline;
use crate::products::{self, ProductCache};
use crate::sessions::PhaseStore;
use crate::shopping::ShoppingSearch;
use crate::store::StoreHandle;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub store: StoreHandle,
    pub phases: PhaseStore,
    pub products: Arc<ProductCache>,
    pub pipeline: Pipeline,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(
        store: StoreHandle,
        generator: Arc<dyn TextGenerator>,
        search: Arc<dyn ShoppingSearch>,
        resolve_concurrency: usize,
    ) -> SharedState {
        let phases = PhaseStore::new(store.clone());
        let products = Arc::new(ProductCache::new(
            store.clone(),
            search,
            resolve_concurrency,
        ));
        let pipeline = Pipeline::new(phases.clone(), products.clone(), generator);
        Arc::new(AppState {
            store,
            phases,
            products,
            pipeline,
        })
    }
}

// ── Request and response payloads ─────────────────────────────────────

#[derive(Deserialize)]
pub struct ImageAnalysisRequest {
    pub session_id: String,
    /// Base64-encoded image bytes.
    pub image_base64: String,
    #[serde(default)]
    pub mime_type: Option<String>,
}

#[derive(Deserialize)]
pub struct SessionRequest {
    pub session_id: String,
}

#[derive(Deserialize)]
pub struct SearchParams {
    pub query: String,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Serialize)]
pub struct IntakeResponse {
    pub session_id: String,
    pub next_phase: &'static str,
    pub data: IntakeForm,
}

#[derive(Serialize)]
pub struct AnalysisResponse {
    pub session_id: String,
    pub next_phase: &'static str,
    pub analysis: SkinAnalysis,
}

#[derive(Serialize)]
pub struct RecommendationResponse {
    pub session_id: String,
    pub next_phase: &'static str,
    #[serde(flatten)]
    pub result: RecommendationResult,
}

#[derive(Serialize)]
pub struct RoutineResponse {
    pub session_id: String,
    #[serde(flatten)]
    pub result: RoutineResult,
}

#[derive(Serialize)]
pub struct StatusResponse {
    #[serde(flatten)]
    pub status: SessionStatus,
    pub next_phase: Option<&'static str>,
    pub pipeline_complete: bool,
}

#[derive(Serialize)]
pub struct RecommendedProductsResponse {
    pub session_id: String,
    pub total: usize,
    pub products: Vec<RecommendedProduct>,
}

#[derive(Serialize)]
pub struct SearchResponse {
    pub query: String,
    pub product: CachedProduct,
}

#[derive(Serialize)]
pub struct SweepResponse {
    pub phase_data: SweepOutcome,
    pub product_records: u64,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    /// A collaborator (generator or search) failed or misbehaved.
    Upstream(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Upstream(msg) => (StatusCode::BAD_GATEWAY, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError::Internal(e.to_string())
    }
}

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        match e {
            PipelineError::PreconditionFailed { .. } | PipelineError::InvalidBudget(_) => {
                ApiError::BadRequest(e.to_string())
            }
            PipelineError::InvalidAllocation { .. }
            | PipelineError::UnknownCategory(_)
            | PipelineError::Generation(_) => ApiError::Upstream(e.to_string()),
            PipelineError::Store(inner) => ApiError::Internal(inner.to_string()),
        }
    }
}

impl From<ResolveError> for ApiError {
    fn from(e: ResolveError) -> Self {
        match e {
            ResolveError::Fetch(inner) => ApiError::Upstream(inner.to_string()),
            ResolveError::Store(inner) => ApiError::Internal(inner.to_string()),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/phases/intake", post(submit_intake))
        .route("/api/phases/image-analysis", post(submit_image_analysis))
        .route("/api/phases/recommendation", post(submit_recommendation))
        .route("/api/phases/routine", post(submit_routine))
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/{id}/status", get(session_status))
        .route("/api/sessions/{id}", delete(delete_session))
        .route(
            "/api/sessions/{id}/recommended-products",
            get(recommended_products),
        )
        .route("/api/products/search", get(search_product))
        .route("/api/products/cache-stats", get(cache_stats))
        .route("/api/admin/sweep", post(sweep))
        .route("/health", get(health))
}

// ── Phase submission ──────────────────────────────────────────────────

async fn submit_intake(
    State(state): State<SharedState>,
    Json(form): Json<IntakeForm>,
) -> Result<(StatusCode, Json<IntakeResponse>), ApiError> {
    let (session_id, data) = state.pipeline.run_intake(form).await?;
    Ok((
        StatusCode::CREATED,
        Json(IntakeResponse {
            session_id,
            next_phase: Phase::Analysis.as_str(),
            data,
        }),
    ))
}

async fn submit_image_analysis(
    State(state): State<SharedState>,
    Json(request): Json<ImageAnalysisRequest>,
) -> Result<Json<AnalysisResponse>, ApiError> {
    let data = BASE64
        .decode(request.image_base64.as_bytes())
        .map_err(|e| ApiError::BadRequest(format!("image_base64 is not valid base64: {}", e)))?;
    if data.is_empty() {
        return Err(ApiError::BadRequest("image_base64 is empty".into()));
    }
    let image = InlineImage {
        mime_type: request
            .mime_type
            .unwrap_or_else(|| "image/jpeg".to_string()),
        data,
    };

    let analysis = state
        .pipeline
        .run_analysis(&request.session_id, image)
        .await?;
    Ok(Json(AnalysisResponse {
        session_id: request.session_id,
        next_phase: Phase::Recommendation.as_str(),
        analysis,
    }))
}

async fn submit_recommendation(
    State(state): State<SharedState>,
    Json(request): Json<SessionRequest>,
) -> Result<Json<RecommendationResponse>, ApiError> {
    let result = state
        .pipeline
        .run_recommendation(&request.session_id)
        .await?;
    Ok(Json(RecommendationResponse {
        session_id: request.session_id,
        next_phase: Phase::Routine.as_str(),
        result,
    }))
}

async fn submit_routine(
    State(state): State<SharedState>,
    Json(request): Json<SessionRequest>,
) -> Result<Json<RoutineResponse>, ApiError> {
    let result = state.pipeline.run_routine(&request.session_id).await?;
    Ok(Json(RoutineResponse {
        session_id: request.session_id,
        result,
    }))
}

// ── Session bookkeeping ───────────────────────────────────────────────

fn next_phase_for(status: &SessionStatus) -> Option<&'static str> {
    Phase::all()
        .into_iter()
        .find(|phase| !status.phases.get(phase.as_str()).copied().unwrap_or(false))
        .map(|phase| phase.as_str())
}

async fn session_status(
    State(state): State<SharedState>,
    Path(session_id): Path<String>,
) -> Result<Json<StatusResponse>, ApiError> {
    let status = state.phases.session_status(&session_id).await?;
    if !status.exists {
        return Err(ApiError::NotFound(format!(
            "Session {} not found",
            session_id
        )));
    }
    let next_phase = next_phase_for(&status);
    Ok(Json(StatusResponse {
        pipeline_complete: next_phase.is_none(),
        next_phase,
        status,
    }))
}

async fn list_sessions(
    State(state): State<SharedState>,
) -> Result<Json<Vec<SessionStatus>>, ApiError> {
    Ok(Json(state.phases.list_sessions().await?))
}

async fn delete_session(
    State(state): State<SharedState>,
    Path(session_id): Path<String>,
) -> Result<Json<DeleteOutcome>, ApiError> {
    let outcome = state.phases.delete_session(&session_id).await?;
    if outcome.total_deleted == 0 {
        return Err(ApiError::NotFound(format!(
            "Session {} not found",
            session_id
        )));
    }
    Ok(Json(outcome))
}

async fn recommended_products(
    State(state): State<SharedState>,
    Path(session_id): Path<String>,
) -> Result<Json<RecommendedProductsResponse>, ApiError> {
    if !state.phases.session_exists(&session_id).await? {
        return Err(ApiError::NotFound(format!(
            "Session {} not found",
            session_id
        )));
    }
    let products = state.products.list_recommended(&session_id).await?;
    Ok(Json(RecommendedProductsResponse {
        session_id,
        total: products.len(),
        products,
    }))
}

// ── Products ──────────────────────────────────────────────────────────

async fn search_product(
    State(state): State<SharedState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<SearchResponse>, ApiError> {
    let product = state
        .products
        .resolve(&params.query, params.session_id.as_deref(), None)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Product '{}' not found", params.query)))?;
    Ok(Json(SearchResponse {
        query: params.query,
        product,
    }))
}

async fn cache_stats(State(state): State<SharedState>) -> Result<Json<CacheStats>, ApiError> {
    Ok(Json(state.products.cache_stats().await?))
}

// ── Maintenance ───────────────────────────────────────────────────────

async fn sweep(State(state): State<SharedState>) -> Result<Json<SweepResponse>, ApiError> {
    let phase_data = state.phases.sweep_expired().await?;
    let product_records = products::sweep_expired(&state.store).await?;
    Ok(Json(SweepResponse {
        phase_data,
        product_records,
    }))
}

async fn health() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{FetchError, GenerationError};
    use crate::genai::GenerationRequest;
    use crate::shopping::SearchHit;
    use crate::store::Store;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    struct NoGenerator;

    #[async_trait]
    impl TextGenerator for NoGenerator {
        async fn generate(&self, _request: GenerationRequest) -> Result<String, GenerationError> {
            Err(GenerationError::Empty)
        }
    }

    struct NoSearch;

    #[async_trait]
    impl ShoppingSearch for NoSearch {
        async fn search(&self, _query: &str) -> Result<Option<SearchHit>, FetchError> {
            Ok(None)
        }

        async fn detail(
            &self,
            _detail_ref: &str,
        ) -> Result<crate::models::ProductDetail, FetchError> {
            Ok(Default::default())
        }
    }

    fn test_router() -> Router {
        let store = StoreHandle::new(Store::open_in_memory().unwrap());
        let state = AppState::new(store, Arc::new(NoGenerator), Arc::new(NoSearch), 2);
        api_router().with_state(state)
    }

    #[tokio::test]
    async fn health_responds_ok() {
        let app = test_router();
        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_session_status_is_404() {
        let app = test_router();
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/sessions/ghost/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn invalid_base64_image_is_400() {
        let app = test_router();
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/phases/image-analysis")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        serde_json::json!({
                            "session_id": "s",
                            "image_base64": "not base64!!!"
                        })
                        .to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn intake_creates_session_and_status_reports_next_phase() {
        let app = test_router();
        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/phases/intake")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        serde_json::json!({
                            "skin_type": ["oily"],
                            "skin_conditions": [],
                            "budget": "$20",
                            "allergies": [],
                            "goals": ["clear skin"]
                        })
                        .to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);

        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        let session_id = body["session_id"].as_str().unwrap().to_string();
        assert_eq!(body["next_phase"], "analysis");

        let resp = app
            .oneshot(
                Request::builder()
                    .uri(format!("/api/sessions/{}/status", session_id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let status: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(status["completed_phases"], 1);
        assert_eq!(status["next_phase"], "analysis");
        assert_eq!(status["pipeline_complete"], false);
    }

    #[tokio::test]
    async fn search_miss_is_404_not_an_error() {
        let app = test_router();
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/products/search?query=ghost%20product")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn precondition_violation_maps_to_400() {
        let app = test_router();
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/phases/recommendation")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        serde_json::json!({"session_id": "ghost"}).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn cache_stats_shape_is_stable() {
        let app = test_router();
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/products/cache-stats")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let stats: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(stats["products_cache"]["total"], 0);
        assert_eq!(stats["user_recommendations"]["total"], 0);
    }
}
