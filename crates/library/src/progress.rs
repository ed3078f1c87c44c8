use serde::Serialize;
use tracing::{debug, info};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanPhase {
    Walking,
    Detecting,
    Persisting,
    Cleanup,
    Finished,
}

impl ScanPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanPhase::Walking => "walking",
            ScanPhase::Detecting => "detecting",
            ScanPhase::Persisting => "persisting",
            ScanPhase::Cleanup => "cleanup",
            ScanPhase::Finished => "finished",
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ProgressReport {
    pub phase: ScanPhase,
    pub current: usize,
    pub total: usize,
    pub message: String,
}

impl ProgressReport {
    pub fn new(phase: ScanPhase, current: usize, total: usize, message: impl Into<String>) -> Self {
        Self {
            phase,
            current,
            total,
            message: message.into(),
        }
    }
}

/// Consumer of scan progress. Implementations must be cheap; they are
/// called inline from the scan loop.
pub trait ProgressSink: Send + Sync {
    fn report(&self, report: &ProgressReport);
}

impl<F> ProgressSink for F
where
    F: Fn(&ProgressReport) + Send + Sync,
{
    fn report(&self, report: &ProgressReport) {
        self(report)
    }
}

/// Default sink: writes reports to the tracing log.
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn report(&self, report: &ProgressReport) {
        match report.phase {
            ScanPhase::Persisting => debug!(
                "[{}] {}/{} {}",
                report.phase.as_str(),
                report.current,
                report.total,
                report.message
            ),
            _ => info!("[{}] {}", report.phase.as_str(), report.message),
        }
    }
}
