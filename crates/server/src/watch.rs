use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use library::{LibraryError, ScanScope};
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};

use crate::state::AppState;

/// Starts one watcher per configured root. Watchers live in the state and
/// stop when dropped.
pub fn configure_watchers(state: &AppState) {
    let config = state.config.read().clone();
    state.watchers.lock().clear();
    if !config.watch_music {
        info!("Watcher disabled (watch_music=false)");
        return;
    }

    let watch_debounce_secs = if config.watch_debounce_secs == 0 {
        2
    } else {
        config.watch_debounce_secs
    };
    let debounce = Duration::from_secs(watch_debounce_secs);

    for root in config.roots(&state.config_path) {
        match setup_watcher(state.clone(), root.clone(), debounce) {
            Ok(watcher) => {
                info!(
                    "Watching {} for changes (debounce {}s)",
                    root.display(),
                    debounce.as_secs()
                );
                state.watchers.lock().push(watcher);
            }
            Err(err) => warn!("Failed to watch {}: {}", root.display(), err),
        }
    }
}

fn setup_watcher(
    state: AppState,
    root: PathBuf,
    debounce: Duration,
) -> Result<RecommendedWatcher, notify::Error> {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<Event>();
    let mut watcher = RecommendedWatcher::new(
        move |res| {
            if let Ok(event) = res {
                let _ = tx.send(event);
            }
        },
        NotifyConfig::default(),
    )?;

    watcher.watch(&root, RecursiveMode::Recursive)?;

    tokio::spawn(async move {
        watch_loop(state, root, rx, debounce).await;
    });

    Ok(watcher)
}

/// Gathers changed paths until the folder has been quiet for `debounce`,
/// then hands them to a targeted rescan. Paths seen while a scan of the
/// folder is running stay pending for the next quiet period.
async fn watch_loop(
    state: AppState,
    root: PathBuf,
    mut rx: UnboundedReceiver<Event>,
    debounce: Duration,
) {
    let mut pending: BTreeSet<PathBuf> = BTreeSet::new();
    loop {
        if pending.is_empty() {
            match rx.recv().await {
                Some(event) => collect_paths(&event, &mut pending),
                None => return,
            }
            continue;
        }

        tokio::select! {
            _ = tokio::time::sleep(debounce) => {
                if state.scans.is_running(&root) {
                    debug!(
                        "Scan of {} still running; deferring {} paths",
                        root.display(),
                        pending.len()
                    );
                } else {
                    let paths: Vec<PathBuf> = pending.iter().cloned().collect();
                    let options = state.scan_options();
                    match state.scans.start(root.clone(), ScanScope::Paths(paths), options) {
                        Ok(_) => {
                            debug!(
                                "Auto-rescan of {} paths under {}",
                                pending.len(),
                                root.display()
                            );
                            pending.clear();
                        }
                        Err(LibraryError::ScanInProgress(_)) => {}
                        Err(err) => {
                            warn!("Auto-rescan of {} failed: {}", root.display(), err);
                            pending.clear();
                        }
                    }
                }
            }
            maybe_event = rx.recv() => {
                match maybe_event {
                    Some(event) => collect_paths(&event, &mut pending),
                    None => return,
                }
            }
        }
    }
}

fn collect_paths(event: &Event, pending: &mut BTreeSet<PathBuf>) {
    if !is_relevant_event(event) {
        return;
    }
    pending.extend(event.paths.iter().cloned());
}

fn is_relevant_event(event: &Event) -> bool {
    matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}
