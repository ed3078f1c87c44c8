use axum::{
    extract::{Query, State},
    Json,
};
use common::Folder;
use library::{CatalogStats, CleanupReport, ScanFailure};
use serde::Deserialize;

use crate::config::resolve_path;
use crate::state::{AppState, JsonResult, ListResponse};

use super::library_error;

const DEFAULT_PAGE: usize = 100;
const MAX_PAGE: usize = 1000;

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct RemoveFolderQuery {
    pub root: String,
    #[serde(default)]
    pub cascade: bool,
}

pub async fn get_stats(State(state): State<AppState>) -> JsonResult<CatalogStats> {
    state.library.stats().map(Json).map_err(library_error)
}

pub async fn list_folders(State(state): State<AppState>) -> JsonResult<ListResponse<Folder>> {
    let items = state.library.list_folders().map_err(library_error)?;
    let total = items.len();
    Ok(Json(ListResponse { items, total }))
}

pub async fn remove_folder(
    State(state): State<AppState>,
    Query(query): Query<RemoveFolderQuery>,
) -> JsonResult<CleanupReport> {
    let root = resolve_path(&state.config_path, query.root.trim());
    state
        .library
        .remove_folder(&root, query.cascade)
        .map(Json)
        .map_err(library_error)
}

pub async fn list_failures(
    State(state): State<AppState>,
    Query(query): Query<PageQuery>,
) -> JsonResult<ListResponse<ScanFailure>> {
    let limit = query.limit.unwrap_or(DEFAULT_PAGE).min(MAX_PAGE);
    let offset = query.offset.unwrap_or(0);
    let (items, total) = state
        .library
        .list_scan_failures(limit, offset)
        .map_err(library_error)?;
    Ok(Json(ListResponse { items, total }))
}
