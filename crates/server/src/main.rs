mod api;
mod config;
mod enrich;
mod external;
mod retry;
mod scan;
mod state;
mod watch;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::http::{HeaderValue, Request};
use axum::Router;
use api::api_router;
use config::{config_path_from_env, load_or_create_config};
use enrich::{EnrichSettings, Enricher};
use external::{build_providers, HttpImages};
use library::{Library, ScanScope};
use parking_lot::{Mutex, RwLock};
use reqwest::Client;
use scan::ScanManager;
use state::AppState;
use tower_http::request_id::{MakeRequestId, RequestId, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use watch::configure_watchers;

/// Sequential `x-request-id` values for log correlation.
#[derive(Clone, Default)]
struct MakeRequestCounter {
    next: Arc<AtomicU64>,
}

impl MakeRequestId for MakeRequestCounter {
    fn make_request_id<B>(&mut self, _request: &Request<B>) -> Option<RequestId> {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        Some(RequestId::new(HeaderValue::from(id)))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config_path = config_path_from_env();
    let (config, created) = load_or_create_config(&config_path)?;
    if created {
        info!("Created default config at {:?}", config_path);
    } else {
        info!("Loaded config from {:?}", config_path);
    }
    if config.artist_separators.is_none() {
        warn!("artist_separators is not set in {:?}; scans will fail until it is", config_path);
    }

    let index_path = config.index_file(&config_path);
    if let Some(parent) = index_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let library = Library::open(&index_path)?;

    let client = Client::builder().user_agent("music-catalog/0.1").build()?;
    let enricher = if config.external_metadata_enabled {
        let providers = build_providers(&client, &config);
        if providers.is_empty() {
            warn!("External metadata is enabled but no source is usable");
        }
        Some(Enricher::new(
            library.catalog().clone(),
            providers,
            Arc::new(HttpImages::new(client.clone(), config.provider_timeout())),
            EnrichSettings {
                enabled: true,
                min_interval: config.min_interval(),
                scan_limit: config.external_metadata_scan_limit,
                retry: config.retry_policy(),
                cache_dir: config.cache_dir(&config_path),
            },
        ))
    } else {
        None
    };

    let scans = ScanManager::new(library.clone(), enricher);
    let state = AppState {
        library,
        config_path,
        config: Arc::new(RwLock::new(config.clone())),
        scans: scans.clone(),
        watchers: Arc::new(Mutex::new(Vec::new())),
    };

    let roots = state.music_roots();
    if roots.is_empty() {
        info!("No music roots configured yet; add them to music_roots.");
    }
    if config.scan_on_start {
        for root in roots {
            if !root.is_dir() {
                warn!("Music root {} does not exist", root.display());
                continue;
            }
            if let Err(err) = scans.start(root, ScanScope::Full, state.scan_options()) {
                warn!("Startup scan not started: {}", err);
            }
        }
    }
    configure_watchers(&state);

    let app = Router::new()
        .nest("/api/v1", api_router(state.clone()))
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestCounter::default()));

    let bind_addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("Listening on {}", bind_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    scans.shutdown();
    state.watchers.lock().clear();
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(err) => {
                warn!("Failed to install terminate signal handler: {}", err);
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = term.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {}", err);
        }
    }

    info!("Shutdown signal received.");
}
