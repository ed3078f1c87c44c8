use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use common::{path_key, path_string};
use library::store::now_secs;
use library::{
    run_scan, Library, LibraryError, LogProgress, ProgressReport, ProgressSink, ScanOptions,
    ScanOutcome, ScanRequest, ScanScope, ScanStatus,
};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::enrich::Enricher;

/// Last known state of one folder's scan.
#[derive(Clone, Debug, Serialize)]
pub struct FolderScan {
    pub root: String,
    pub full: bool,
    pub status: ScanStatus,
    pub started_at: u64,
    pub progress: Option<ProgressReport>,
    pub outcome: Option<ScanOutcome>,
}

type ScanStates = Arc<RwLock<HashMap<String, FolderScan>>>;

/// Result of asking for an enrichment sweep.
#[derive(Debug)]
pub enum SweepStart {
    Started(JoinHandle<()>),
    /// A sweep is already running; the request was folded into it.
    AlreadyRunning,
    Inactive,
}

/// Clears the sweep flag when the sweep task ends, however it ends.
struct SweepSlot(Arc<AtomicBool>);

impl Drop for SweepSlot {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

struct TrackedProgress {
    key: String,
    states: ScanStates,
}

impl ProgressSink for TrackedProgress {
    fn report(&self, report: &ProgressReport) {
        LogProgress.report(report);
        if let Some(state) = self.states.write().get_mut(&self.key) {
            state.progress = Some(report.clone());
        }
    }
}

/// Starts scans in the background, one per folder, and keeps their
/// cancellation tokens and outcomes around for the API.
#[derive(Clone)]
pub struct ScanManager {
    library: Library,
    enricher: Option<Enricher>,
    running: Arc<Mutex<HashMap<String, CancellationToken>>>,
    states: ScanStates,
    sweeping: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl ScanManager {
    pub fn new(library: Library, enricher: Option<Enricher>) -> Self {
        Self {
            library,
            enricher,
            running: Arc::new(Mutex::new(HashMap::new())),
            states: Arc::new(RwLock::new(HashMap::new())),
            sweeping: Arc::new(AtomicBool::new(false)),
            shutdown: CancellationToken::new(),
        }
    }

    /// Claims the folder and spawns the scan. A folder that is already
    /// scanning is rejected with `ScanInProgress`.
    pub fn start(
        &self,
        root: PathBuf,
        scope: ScanScope,
        options: ScanOptions,
    ) -> Result<JoinHandle<ScanOutcome>, LibraryError> {
        let full = scope == ScanScope::Full;
        let guard = self.library.begin_scan(&root, full)?;
        let key = path_key(&root);
        let cancel = self.shutdown.child_token();

        self.running.lock().insert(key.clone(), cancel.clone());
        self.states.write().insert(
            key.clone(),
            FolderScan {
                root: path_string(&root),
                full,
                status: ScanStatus::InProgress,
                started_at: now_secs(),
                progress: None,
                outcome: None,
            },
        );

        let progress = Arc::new(TrackedProgress {
            key: key.clone(),
            states: Arc::clone(&self.states),
        });
        let request = ScanRequest {
            root,
            scope,
            options,
            cancel,
            progress,
            tag_reader: Arc::new(library::LoftyTagReader),
            batch_sink: None,
        };
        info!(
            "Starting {} scan of {}",
            if full { "full" } else { "targeted" },
            request.root.display()
        );

        let manager = self.clone();
        Ok(tokio::spawn(async move {
            let outcome = run_scan(manager.library.catalog().clone(), request).await;
            drop(guard);
            manager.finish(&key, &outcome);
            outcome
        }))
    }

    fn finish(&self, key: &str, outcome: &ScanOutcome) {
        self.running.lock().remove(key);
        if let Some(state) = self.states.write().get_mut(key) {
            state.status = outcome.status;
            state.outcome = Some(outcome.clone());
        }
        let changed = outcome.counts.added + outcome.counts.modified > 0;
        if changed
            && matches!(
                outcome.status,
                ScanStatus::Complete | ScanStatus::CompleteWithErrors
            )
        {
            self.start_enrichment();
        }
    }

    /// Requests cancellation of the folder's running scan.
    pub fn cancel(&self, root: &Path) -> bool {
        match self.running.lock().get(&path_key(root)) {
            Some(token) => {
                info!("Cancelling scan of {}", root.display());
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancels every scan and enrichment sweep.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_running(&self, root: &Path) -> bool {
        self.running.lock().contains_key(&path_key(root))
    }

    pub fn states(&self) -> Vec<FolderScan> {
        let mut states: Vec<FolderScan> = self.states.read().values().cloned().collect();
        states.sort_by(|a, b| a.root.cmp(&b.root));
        states
    }

    pub fn is_enriching(&self) -> bool {
        self.sweeping.load(Ordering::SeqCst)
    }

    /// Runs an enrichment sweep in the background with its own lifetime;
    /// it outlives the scan that triggered it. At most one sweep runs at a
    /// time.
    pub fn start_enrichment(&self) -> SweepStart {
        let enricher = match &self.enricher {
            Some(enricher) if enricher.is_active() => enricher.clone(),
            _ => return SweepStart::Inactive,
        };
        if self.sweeping.swap(true, Ordering::SeqCst) {
            debug!("Enrichment sweep already running");
            return SweepStart::AlreadyRunning;
        }
        let slot = SweepSlot(Arc::clone(&self.sweeping));
        let cancel = self.shutdown.child_token();
        SweepStart::Started(tokio::spawn(async move {
            let _slot = slot;
            match enricher.sweep(&cancel).await {
                Ok(report) if report.cancelled => info!("Enrichment sweep stopped early"),
                Ok(_) => {}
                Err(err) => warn!("Enrichment sweep failed: {}", err),
            }
        }))
    }
}
