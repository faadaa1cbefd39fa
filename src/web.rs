use crate::{
    app::{App, AppError},
    catalog::CatalogItem,
    identify::IdentifyError,
    ingest::{IngestError, IngestReport, ItemReport},
    matching::MatchResult,
    metadata::{CollectedMetadata, Comparison, MetadataError},
};
use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::signal;

#[derive(Clone)]
struct SharedState {
    app: Arc<App>,
}

pub fn build_router(app: Arc<App>) -> Router {
    let body_limit = app.config().daemon.body_limit_mb * 1024 * 1024;
    let shared_state = Arc::new(SharedState { app });

    Router::new()
        .route("/api/identify", post(identify))
        .route("/api/ingest", post(ingest))
        .route("/api/items", get(list_items).post(add_item))
        .route("/api/items/:id", delete(remove_item))
        .route("/api/items/:id/image", put(replace_image))
        .route("/api/metadata", get(metadata))
        .route("/api/cache/purge", post(purge_cache))
        .layer(DefaultBodyLimit::max(body_limit))
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
        if let Err(e) = signal::ctrl_c().await {
            log::error!("failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                log::error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::warn!("shutting down, waiting for in-flight requests");
}

async fn start_app(app: Arc<App>, listen: &str) -> anyhow::Result<()> {
    let router = build_router(app);

    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind {listen}"))?;
    log::info!("listening on {listen}");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

/// Serve the HTTP API until SIGINT or SIGTERM.
pub fn start_daemon(app: Arc<App>, listen: Option<String>) -> anyhow::Result<()> {
    let listen = listen.unwrap_or_else(|| app.config().daemon.listen.clone());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    // `app` outlives the runtime; only clones are dropped inside it
    runtime.block_on(start_app(app.clone(), &listen))
}

#[derive(Debug)]
struct HttpError(AppError);

impl HttpError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::InvalidImage(_) => StatusCode::BAD_REQUEST,

            AppError::Identify(e) => match e {
                IdentifyError::InvalidImage(_) => StatusCode::BAD_REQUEST,
                IdentifyError::ModelUnavailable(_) | IdentifyError::IndexUnavailable(_) => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                IdentifyError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
                IdentifyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },

            AppError::Ingest(IngestError::NotFound(_)) => StatusCode::NOT_FOUND,
            AppError::Ingest(IngestError::ModelUnavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,

            AppError::Metadata(MetadataError::InvalidQuery(_))
            | AppError::Metadata(MetadataError::UnknownSources(_)) => StatusCode::BAD_REQUEST,
            AppError::Metadata(_) => StatusCode::BAD_GATEWAY,

            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status();
        if status.is_server_error() {
            log::error!("{self:?}");
        } else {
            log::debug!("{self:?}");
        }

        (status, Json(json!({"error": self.0.to_string()}))).into_response()
    }
}

impl<E> From<E> for HttpError
where
    E: Into<AppError>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

/// Body: raw image bytes.
async fn identify(
    State(state): State<Arc<SharedState>>,
    body: Bytes,
) -> Result<Json<MatchResult>, HttpError> {
    log::debug!("identify request with {} bytes", body.len());
    Ok(Json(state.app.identify(body.to_vec()).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct IngestRequest {
    /// Every item with an image when omitted
    pub ids: Option<Vec<u64>>,
}

async fn ingest(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<IngestRequest>,
) -> Result<Json<IngestReport>, HttpError> {
    log::debug!("payload: {payload:?}");
    let app = state.app.clone();

    tokio::task::block_in_place(move || match payload.ids {
        Some(ids) => Ok(Json(app.ingest(&ids))),
        None => Ok(Json(app.ingest_all()?)),
    })
}

async fn list_items(
    State(state): State<Arc<SharedState>>,
) -> Result<Json<Vec<CatalogItem>>, HttpError> {
    Ok(Json(state.app.catalog().list()?))
}

#[derive(Debug, Deserialize)]
pub struct AddItemQuery {
    pub title: String,
    pub parent_id: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct ItemResponse {
    pub item: CatalogItem,
    pub ingest: ItemReport,
}

/// Query: title and optional parent_id. Body: raw cover image bytes.
async fn add_item(
    State(state): State<Arc<SharedState>>,
    Query(query): Query<AddItemQuery>,
    body: Bytes,
) -> Result<Json<ItemResponse>, HttpError> {
    log::debug!("add item: {query:?}, {} bytes", body.len());
    let app = state.app.clone();

    tokio::task::block_in_place(move || {
        let (item, ingest) = app.add_item(query.title, query.parent_id, &body)?;
        Ok(Json(ItemResponse { item, ingest }))
    })
}

async fn replace_image(
    State(state): State<Arc<SharedState>>,
    Path(id): Path<u64>,
    body: Bytes,
) -> Result<Json<ItemResponse>, HttpError> {
    let app = state.app.clone();

    tokio::task::block_in_place(move || {
        let (item, ingest) = app.replace_image(id, &body)?;
        Ok(Json(ItemResponse { item, ingest }))
    })
}

async fn remove_item(
    State(state): State<Arc<SharedState>>,
    Path(id): Path<u64>,
) -> Result<Json<serde_json::Value>, HttpError> {
    let app = state.app.clone();

    tokio::task::block_in_place(move || {
        if !app.remove_item(id)? {
            return Err(AppError::NotFound(id).into());
        }
        Ok(Json(json!({"removed": id})))
    })
}

#[derive(Debug, Deserialize)]
pub struct MetadataQuery {
    /// "<artist> - <album>"
    pub query: String,
    /// Comma separated provider names
    pub sources: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct MetadataResponse {
    #[serde(flatten)]
    pub collected: CollectedMetadata,
    #[serde(flatten)]
    pub comparison: Comparison,
}

async fn metadata(
    State(state): State<Arc<SharedState>>,
    Query(query): Query<MetadataQuery>,
) -> Result<Json<MetadataResponse>, HttpError> {
    log::debug!("metadata: {query:?}");
    let app = state.app.clone();

    let sources: Option<Vec<String>> = query.sources.map(|s| {
        s.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    });

    tokio::task::block_in_place(move || {
        let (collected, comparison) = app.metadata(&query.query, sources.as_deref())?;
        Ok(Json(MetadataResponse {
            collected,
            comparison,
        }))
    })
}

#[derive(Debug, Default, Deserialize)]
pub struct PurgeRequest {
    #[serde(default)]
    pub all: bool,
}

async fn purge_cache(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<PurgeRequest>,
) -> Result<Json<serde_json::Value>, HttpError> {
    let removed = state.app.purge_cache(payload.all)?;
    Ok(Json(json!({"removed": removed})))
}
