use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tokio::signal;

use crate::app::{Engine, EngineError, EngineStatus, IngestTarget, Recommendation, SchedulerHandle, TrendingContent};
use crate::ingest::IngestionReport;

const DEFAULT_LIMIT: usize = 10;
const MAX_LIMIT: usize = 100;

#[derive(Clone)]
struct SharedState {
    engine: Arc<Engine>,
}

pub fn router(engine: Arc<Engine>) -> Router {
    let shared_state = Arc::new(SharedState { engine });

    Router::new()
        .route("/api/status", get(status))
        .route("/api/modules/:id/recommendations", get(module_recommendations))
        .route("/api/recommendations", post(user_recommendations))
        .route("/api/ingest", post(ingest))
        .route("/api/trending", get(trending))
        .layer(
            tower_http::trace::TraceLayer::new_for_http()
                .make_span_with(tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO))
                .on_response(tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO)),
        )
        .with_state(shared_state)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            log::error!("failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                log::error!("failed to install signal handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::warn!("shutdown requested");
}

async fn start_app(engine: Arc<Engine>) -> anyhow::Result<()> {
    let listen = engine.config().daemon.listen.clone();
    let app = router(engine);

    let listener = tokio::net::TcpListener::bind(&listen).await?;
    log::info!("listening on {listen}");
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;
    Ok(())
}

/// Serve the JSON API until a shutdown signal, then stop the scheduler.
pub fn start_daemon(engine: Arc<Engine>, scheduler: SchedulerHandle) -> anyhow::Result<()> {
    let result = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(start_app(engine));

    log::warn!("waiting for scheduler to stop");
    scheduler.shutdown();
    result
}

#[derive(Debug)]
struct HttpError(EngineError);

impl From<EngineError> for HttpError {
    fn from(err: EngineError) -> Self {
        HttpError(err)
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self.0 {
            EngineError::ModuleNotFound(_) => StatusCode::NOT_FOUND,
            EngineError::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            EngineError::SourceUnavailable { .. } => StatusCode::BAD_GATEWAY,
            EngineError::Embedding(_) | EngineError::Store(_) | EngineError::Other(_) => {
                log::error!("{:?}", self.0);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (status, Json(json!({"error": self.0.to_string()}))).into_response()
    }
}

fn clamp_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
}

async fn status(State(state): State<Arc<SharedState>>) -> Json<EngineStatus> {
    let engine = state.engine.clone();
    Json(tokio::task::block_in_place(move || engine.get_engine_status()))
}

#[derive(Debug, Deserialize)]
struct RecommendationParams {
    limit: Option<usize>,
    threshold: Option<f32>,
}

async fn module_recommendations(
    State(state): State<Arc<SharedState>>,
    Path(module_id): Path<u64>,
    Query(params): Query<RecommendationParams>,
) -> Result<Json<Vec<Recommendation>>, HttpError> {
    log::debug!("module {module_id}: {params:?}");
    let engine = state.engine.clone();

    tokio::task::block_in_place(move || {
        engine
            .recommend_for_module(module_id, clamp_limit(params.limit), params.threshold)
            .map(Json)
            .map_err(Into::into)
    })
}

#[derive(Debug, Deserialize)]
struct UserRecommendationRequest {
    module_ids: Vec<u64>,
    limit: Option<usize>,
}

async fn user_recommendations(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<UserRecommendationRequest>,
) -> Json<Vec<Recommendation>> {
    log::debug!("payload: {payload:?}");
    let engine = state.engine.clone();

    Json(tokio::task::block_in_place(move || {
        engine.recommend_for_user(&payload.module_ids, clamp_limit(payload.limit))
    }))
}

async fn ingest(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<IngestTarget>,
) -> Result<Json<IngestionReport>, HttpError> {
    log::debug!("payload: {payload:?}");
    let engine = state.engine.clone();

    tokio::task::block_in_place(move || engine.trigger_ingestion(payload).map(Json).map_err(Into::into))
}

#[derive(Debug, Deserialize)]
struct TrendingParams {
    limit: Option<usize>,
}

async fn trending(
    State(state): State<Arc<SharedState>>,
    Query(params): Query<TrendingParams>,
) -> Result<Json<Vec<TrendingContent>>, HttpError> {
    let engine = state.engine.clone();

    tokio::task::block_in_place(move || {
        engine
            .trending_content(clamp_limit(params.limit))
            .map(Json)
            .map_err(Into::into)
    })
}
