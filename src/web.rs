use crate::{
    credibility::StatisticsSummary,
    document::{MetadataFilter, MetadataValue},
    errors::StoreError,
    pool::CancelFlag,
    retrieval::{SearchRequest, SearchResponse},
    service::{ExpertService, IngestOutcome, IngestRequest},
    store::CollectionStats,
    versioning::{RestoreOutcome, VersionRecord, VersionState},
};
use anyhow::Context;
use axum::{
    extract::{DefaultBodyLimit, Path, Query, State},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::signal;

#[derive(Clone)]
struct SharedState {
    service: Arc<ExpertService>,
}

pub fn router(service: Arc<ExpertService>) -> Router {
    let shared_state = Arc::new(SharedState { service });

    Router::new()
        .route("/health", get(health))
        .route("/api/ingest", post(ingest))
        .route("/api/search", post(search))
        .route("/api/versions", get(versions))
        .route("/api/restore/:commit_id", post(restore))
        .route("/api/credibility/refresh", post(refresh_credibility))
        .route("/api/count", get(count))
        .route("/api/stats", get(stats))
        .route("/api/values/:field", get(values))
        .layer(DefaultBodyLimit::max(100 * 1024 * 1024))
        .layer(
            tower_http::trace::TraceLayer::new_for_http()
                .make_span_with(
                    tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO),
                )
                .on_response(
                    tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO),
                ),
        )
        .with_state(shared_state)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            log::error!("failed to install Ctrl+C handler: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                log::error!("failed to install signal handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => log::warn!("interrupted, shutting down"),
        _ = terminate => log::warn!("terminated, shutting down"),
    }
}

async fn start_app(service: Arc<ExpertService>, addr: &str) -> anyhow::Result<()> {
    let app = router(service);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    log::info!("listening on {addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

pub fn start_daemon(service: Arc<ExpertService>, addr: &str) -> anyhow::Result<()> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async { start_app(service, addr).await })
}

#[derive(Debug)]
struct HttpError(StoreError);

impl IntoResponse for HttpError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;

        let status = match &self.0 {
            StoreError::Validation(_) => StatusCode::BAD_REQUEST,
            StoreError::VersionNotFound(_) => StatusCode::NOT_FOUND,
            StoreError::ConcurrencyTimeout { .. } => StatusCode::CONFLICT,
            StoreError::BackendUnavailable { .. } | StoreError::Transient(_) => {
                log::warn!("{:?}", self.0);
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => {
                log::error!("{:?}", self.0);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (status, Json(json!({"error": self.0.to_string()}))).into_response()
    }
}

impl<E> From<E> for HttpError
where
    E: Into<StoreError>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

async fn ingest(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<IngestRequest>,
) -> Result<Json<IngestOutcome>, HttpError> {
    log::debug!(
        "ingest {} documents, version_after_batch={}",
        payload.ids.len(),
        payload.version_after_batch
    );

    let service = state.service.clone();
    tokio::task::block_in_place(move || {
        service
            .ingest(payload, &CancelFlag::new())
            .map(Json)
            .map_err(Into::into)
    })
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchBody {
    pub query: String,
    pub initial_k: Option<usize>,
    pub final_k: Option<usize>,
    /// `{"location": "Paris", "years_experience": {"$gte": 5}}`
    #[serde(default)]
    pub filters: serde_json::Value,
}

async fn search(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<SearchBody>,
) -> Result<Json<SearchResponse>, HttpError> {
    log::debug!("payload: {payload:?}");

    let request = SearchRequest {
        query: payload.query,
        initial_k: payload.initial_k,
        final_k: payload.final_k,
        filters: MetadataFilter::from_json(&payload.filters)?,
    };

    let service = state.service.clone();
    tokio::task::block_in_place(move || {
        service
            .search(&request, &CancelFlag::new())
            .map(Json)
            .map_err(Into::into)
    })
}

#[derive(Debug, Deserialize)]
pub struct VersionsQuery {
    pub max_entries: Option<usize>,
}

async fn versions(
    State(state): State<Arc<SharedState>>,
    Query(query): Query<VersionsQuery>,
) -> Result<Json<Vec<VersionRecord>>, HttpError> {
    let service = state.service.clone();
    tokio::task::block_in_place(move || {
        service
            .list_versions(query.max_entries)
            .map(Json)
            .map_err(Into::into)
    })
}

async fn restore(
    State(state): State<Arc<SharedState>>,
    Path(commit_id): Path<String>,
) -> Result<Json<RestoreOutcome>, HttpError> {
    let service = state.service.clone();
    tokio::task::block_in_place(move || service.restore_to(&commit_id).map(Json).map_err(Into::into))
}

async fn refresh_credibility(
    State(state): State<Arc<SharedState>>,
) -> Result<Json<StatisticsSummary>, HttpError> {
    let service = state.service.clone();
    tokio::task::block_in_place(move || {
        service
            .refresh_credibility_statistics()
            .map(Json)
            .map_err(Into::into)
    })
}

async fn count(State(state): State<Arc<SharedState>>) -> Result<Json<serde_json::Value>, HttpError> {
    let service = state.service.clone();
    let count = tokio::task::block_in_place(move || service.count())?;
    Ok(Json(json!({"count": count})))
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    #[serde(flatten)]
    pub collection: CollectionStats,
    pub version_state: VersionState,
    pub active_commit: Option<String>,
}

async fn stats(State(state): State<Arc<SharedState>>) -> Result<Json<StatsResponse>, HttpError> {
    let service = state.service.clone();
    tokio::task::block_in_place(move || -> Result<Json<StatsResponse>, HttpError> {
        Ok(Json(StatsResponse {
            collection: service.collection_stats()?,
            version_state: service.version_state(),
            active_commit: service.active_commit(),
        }))
    })
}

async fn values(
    State(state): State<Arc<SharedState>>,
    Path(field): Path<String>,
) -> Result<Json<Vec<MetadataValue>>, HttpError> {
    let service = state.service.clone();
    tokio::task::block_in_place(move || service.metadata_values(&field).map(Json).map_err(Into::into))
}
