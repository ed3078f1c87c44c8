use axum::{extract::State, http::StatusCode, Json};
use common::path_string;
use library::{LibraryError, ScanScope};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::resolve_path;
use crate::scan::{FolderScan, SweepStart};
use crate::state::{json_error, AppState, JsonResult};

use super::library_error;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct StartScanRequest {
    /// Folder to scan; every configured root when absent.
    pub root: Option<String>,
    /// Restricts the scan to these files or directories under `root`.
    pub paths: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CancelScanRequest {
    pub root: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StartScanResponse {
    pub started: Vec<String>,
    pub rejected: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct CancelScanResponse {
    pub cancelled: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub roots: Vec<String>,
    pub scans: Vec<FolderScan>,
    pub enrichment_enabled: bool,
}

#[derive(Debug, Serialize)]
pub struct EnrichResponse {
    pub started: bool,
    pub already_running: bool,
}

pub async fn get_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let enrichment_enabled = state.config.read().external_metadata_enabled;
    Json(StatusResponse {
        roots: state.music_roots().iter().map(|root| path_string(root)).collect(),
        scans: state.scans.states(),
        enrichment_enabled,
    })
}

pub async fn start_scan(
    State(state): State<AppState>,
    body: Option<Json<StartScanRequest>>,
) -> JsonResult<StartScanResponse> {
    let request = body.map(|Json(body)| body).unwrap_or_default();
    let options = state.scan_options();

    let root = match request.root.as_deref().map(str::trim) {
        Some(root) if !root.is_empty() => resolve_path(&state.config_path, root),
        _ => {
            if !request.paths.is_empty() {
                return Err(json_error(
                    StatusCode::BAD_REQUEST,
                    "paths require a root",
                ));
            }
            let roots = state.music_roots();
            if roots.is_empty() {
                return Err(json_error(
                    StatusCode::BAD_REQUEST,
                    "no music roots configured",
                ));
            }
            let mut response = StartScanResponse {
                started: Vec::new(),
                rejected: Vec::new(),
            };
            for root in roots {
                match state.scans.start(root.clone(), ScanScope::Full, options.clone()) {
                    Ok(_) => response.started.push(path_string(&root)),
                    Err(LibraryError::ScanInProgress(path)) => response.rejected.push(path),
                    Err(err) => return Err(library_error(err)),
                }
            }
            return Ok(Json(response));
        }
    };

    let scope = if request.paths.is_empty() {
        ScanScope::Full
    } else {
        ScanScope::Paths(
            request
                .paths
                .iter()
                .map(|path| {
                    let path = std::path::Path::new(path.trim());
                    if path.is_absolute() {
                        path.to_path_buf()
                    } else {
                        root.join(path)
                    }
                })
                .collect(),
        )
    };
    state
        .scans
        .start(root.clone(), scope, options)
        .map_err(library_error)?;
    Ok(Json(StartScanResponse {
        started: vec![path_string(&root)],
        rejected: Vec::new(),
    }))
}

pub async fn cancel_scan(
    State(state): State<AppState>,
    body: Option<Json<CancelScanRequest>>,
) -> Json<CancelScanResponse> {
    let request = body.map(|Json(body)| body).unwrap_or_default();
    let targets = match request.root.as_deref().map(str::trim) {
        Some(root) if !root.is_empty() => vec![resolve_path(&state.config_path, root)],
        _ => state
            .library
            .active_scans()
            .into_iter()
            .map(|scan| scan.root)
            .collect(),
    };
    let cancelled = targets
        .into_iter()
        .filter(|root| state.scans.cancel(root))
        .map(|root| path_string(&root))
        .collect();
    Json(CancelScanResponse { cancelled })
}

pub async fn start_enrichment(State(state): State<AppState>) -> JsonResult<EnrichResponse> {
    match state.scans.start_enrichment() {
        SweepStart::Started(_) => {
            info!("Enrichment sweep requested");
            Ok(Json(EnrichResponse {
                started: true,
                already_running: false,
            }))
        }
        SweepStart::AlreadyRunning => Ok(Json(EnrichResponse {
            started: false,
            already_running: true,
        })),
        SweepStart::Inactive => Err(json_error(
            StatusCode::BAD_REQUEST,
            "external metadata is disabled or has no usable sources",
        )),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use library::{Library, ScanStatus};
    use parking_lot::{Mutex, RwLock};

    use super::*;
    use crate::config::ServerConfig;
    use crate::scan::ScanManager;

    fn state(dir: &tempfile::TempDir) -> AppState {
        let library = Library::open(&dir.path().join("catalog.redb")).unwrap();
        let mut config = ServerConfig::default();
        config.music_roots = vec!["music".to_string()];
        config.artist_separators = Some(vec![";".to_string()]);
        std::fs::create_dir_all(dir.path().join("music")).unwrap();
        AppState {
            scans: ScanManager::new(library.clone(), None),
            library,
            config_path: dir.path().join("config.yaml"),
            config: Arc::new(RwLock::new(config)),
            watchers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    #[tokio::test]
    async fn scan_all_roots_then_reject_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir);
        let root = dir.path().join("music");

        let guard = state.library.begin_scan(&root, true).unwrap();
        let Json(response) = start_scan(State(state.clone()), None).await.unwrap();
        assert!(response.started.is_empty());
        assert_eq!(response.rejected, vec![path_string(&root)]);

        let err = start_scan(
            State(state.clone()),
            Some(Json(StartScanRequest {
                root: Some("music".to_string()),
                paths: Vec::new(),
            })),
        )
        .await
        .unwrap_err();
        assert_eq!(err.0, StatusCode::CONFLICT);
        drop(guard);

        let Json(response) = start_scan(State(state.clone()), None).await.unwrap();
        assert_eq!(response.started, vec![path_string(&root)]);
    }

    #[tokio::test]
    async fn cancel_without_scans_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir);
        let Json(response) = cancel_scan(State(state), None).await;
        assert!(response.cancelled.is_empty());
    }

    #[tokio::test]
    async fn enrichment_requires_sources() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir);
        let err = start_enrichment(State(state)).await.unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn status_lists_finished_scans() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir);
        let outcome = state
            .scans
            .start(dir.path().join("music"), ScanScope::Full, state.scan_options())
            .unwrap()
            .await
            .unwrap();
        assert_eq!(outcome.status, ScanStatus::Complete);

        let Json(status) = get_status(State(state)).await;
        assert_eq!(status.scans.len(), 1);
        assert_eq!(status.scans[0].status, ScanStatus::Complete);
        assert!(!status.enrichment_enabled);
    }
}
