//! Read-only JSON API over stored deals.

use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use gdeals_storage::{DealFilter, DealStore};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Header carrying the deal id for `GET /api/deal`.
pub const DEAL_ID_HEADER: &str = "x-id";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn DealStore>,
}

impl AppState {
    pub fn new(store: Arc<dyn DealStore>) -> Self {
        Self { store }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/deals", get(active_deals_handler))
        .route("/api/deals/{id}", get(deal_by_path_handler))
        .route("/api/deal", get(deal_by_header_handler))
        .with_state(Arc::new(state))
}

/// Serves the API until `shutdown` resolves.
pub async fn serve(
    store: Arc<dyn DealStore>,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving deals api");
    axum::serve(listener, app(AppState::new(store)))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn active_deals_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.find_deals(DealFilter::active()).await {
        Ok(deals) => Json(deals).into_response(),
        Err(err) => server_error(err),
    }
}

async fn deal_by_header_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let raw = headers
        .get(DEAL_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    deal_response(&state, raw).await
}

async fn deal_by_path_handler(State(state): State<Arc<AppState>>, AxumPath(id): AxumPath<String>) -> Response {
    deal_response(&state, &id).await
}

async fn deal_response(state: &AppState, raw_id: &str) -> Response {
    let Some(id) = parse_deal_id(raw_id) else {
        return client_error(StatusCode::BAD_REQUEST, "missing or invalid deal id");
    };
    match state.store.get_deal(id).await {
        Ok(Some(deal)) => Json(deal).into_response(),
        Ok(None) => client_error(StatusCode::NOT_FOUND, "deal not found"),
        Err(err) => server_error(err),
    }
}

fn parse_deal_id(raw: &str) -> Option<i64> {
    raw.trim().parse().ok()
}

fn client_error(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

fn server_error(err: impl std::fmt::Display) -> Response {
    error!(error = %err, "deal lookup failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "storage unavailable" })),
    )
        .into_response()
}
