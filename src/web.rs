use crate::{
    consumer::{ConsumerState, ConsumerStatus},
    errors::AppError,
    query::{QueryService, RelatedResponse, SearchResponse},
};
use axum::{
    extract::{rejection::QueryRejection, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::{future::Future, net::SocketAddr, sync::Arc};
use tokio::signal;

#[derive(Clone)]
pub struct SharedState {
    pub query: QueryService,
    /// `None` when this process runs without a consumer.
    pub consumer: Option<ConsumerStatus>,
}

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/api/search", get(search))
        .route("/api/search/related", get(related))
        .route("/api/search/stats", get(stats))
        .route("/health", get(health))
        .layer(tower_http::cors::CorsLayer::permissive())
        .layer(
            tower_http::trace::TraceLayer::new_for_http()
                .make_span_with(
                    tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO),
                )
                .on_response(
                    tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO),
                ),
        )
        .with_state(Arc::new(state))
}

/// Serve `app` on `bind` until `shutdown` resolves, then drain in-flight requests.
pub async fn serve<F>(bind: SocketAddr, app: Router, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(bind).await?;
    log::info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            log::error!("failed to install Ctrl+C handler: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
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
        _ = ctrl_c => log::warn!("received Ctrl+C, shutting down"),
        _ = terminate => log::warn!("received SIGTERM, shutting down"),
    }
}

#[derive(Debug)]
struct HttpError(AppError);

impl IntoResponse for HttpError {
    fn into_response(self) -> axum::response::Response {
        match self.0 {
            AppError::InvalidQuery(_) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(json!({"error": self.0.to_string()})),
            ),
            AppError::Embedding(_) | AppError::Store(_) => {
                log::error!("{self:?}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({"error": self.0.to_string()})),
                )
            }
        }
        .into_response()
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

fn invalid_params(rejection: QueryRejection) -> HttpError {
    HttpError(AppError::InvalidQuery(rejection.body_text()))
}

#[derive(Debug, Deserialize)]
struct SearchParams {
    q: String,
    limit: Option<usize>,
}

async fn search(
    State(state): State<Arc<SharedState>>,
    params: Result<Query<SearchParams>, QueryRejection>,
) -> Result<Json<SearchResponse>, HttpError> {
    let Query(params) = params.map_err(invalid_params)?;
    log::debug!("params: {params:?}");

    Ok(Json(state.query.search(&params.q, params.limit).await?))
}

#[derive(Debug, Deserialize)]
struct RelatedParams {
    post_id: i64,
    limit: Option<usize>,
}

async fn related(
    State(state): State<Arc<SharedState>>,
    params: Result<Query<RelatedParams>, QueryRejection>,
) -> Result<Json<RelatedResponse>, HttpError> {
    let Query(params) = params.map_err(invalid_params)?;
    log::debug!("params: {params:?}");

    Ok(Json(state.query.related(params.post_id, params.limit).await?))
}

async fn stats(State(state): State<Arc<SharedState>>) -> Result<impl IntoResponse, HttpError> {
    let indexed = state.query.store().count().await?;
    let consumer = match state.consumer.as_ref().map(ConsumerStatus::state) {
        Some(ConsumerState::Running) => "running",
        Some(ConsumerState::Terminated) => "terminated",
        None => "disabled",
    };

    Ok(Json(json!({ "indexed": indexed, "consumer": consumer })))
}

async fn health(State(state): State<Arc<SharedState>>) -> impl IntoResponse {
    if state.query.embedder().is_loaded() {
        (StatusCode::OK, Json(json!({"status": "UP"})))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(json!({"status": "DOWN"})))
    }
}
