pub mod library;
pub mod scan;

use axum::{
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use ::library::LibraryError;
use serde::Serialize;

use crate::state::{json_error, AppState, ErrorResponse};

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

pub fn api_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(scan::get_status))
        .route("/scan", post(scan::start_scan))
        .route("/scan/cancel", post(scan::cancel_scan))
        .route("/enrich", post(scan::start_enrichment))
        .route("/library/stats", get(library::get_stats))
        .route(
            "/library/folders",
            get(library::list_folders).delete(library::remove_folder),
        )
        .route("/library/failures", get(library::list_failures))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse { status: "ok" })
}

pub(crate) fn library_error(err: LibraryError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match &err {
        LibraryError::ScanInProgress(_) | LibraryError::FolderNotEmpty(_, _) => {
            StatusCode::CONFLICT
        }
        LibraryError::FolderNotFound(_) => StatusCode::NOT_FOUND,
        LibraryError::Configuration(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    json_error(status, err.to_string())
}
