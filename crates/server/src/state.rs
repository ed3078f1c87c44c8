use std::path::PathBuf;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::Json;
use library::{Library, ScanOptions};
use notify::RecommendedWatcher;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::config::ServerConfig;
use crate::scan::ScanManager;

#[derive(Clone)]
pub struct AppState {
    pub library: Library,
    pub config_path: PathBuf,
    pub config: Arc<RwLock<ServerConfig>>,
    pub scans: ScanManager,
    pub watchers: Arc<Mutex<Vec<RecommendedWatcher>>>,
}

impl AppState {
    pub fn scan_options(&self) -> ScanOptions {
        self.config.read().scan_options(&self.config_path)
    }

    pub fn music_roots(&self) -> Vec<PathBuf> {
        self.config.read().roots(&self.config_path)
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Serialize)]
pub struct ListResponse<T> {
    pub items: Vec<T>,
    pub total: usize,
}

pub type JsonResult<T> = Result<Json<T>, (StatusCode, Json<ErrorResponse>)>;

pub fn json_error(
    status: StatusCode,
    message: impl Into<String>,
) -> (StatusCode, Json<ErrorResponse>) {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}
