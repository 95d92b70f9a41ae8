//! Runtime state shared between the control loop and the scan workers

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::identify::{CheckMode, DeviceRecord};

/// Lifecycle of the scanning workers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunState {
    /// No workers running; auto-resume may restart them
    #[default]
    Stopped,
    /// Capture and consensus workers are running
    Running,
    /// Stopped by the operator; auto-resume stays off until resumed
    ManualPaused,
}

impl RunState {
    /// Get the display name for this state
    pub fn name(&self) -> &'static str {
        match self {
            RunState::Stopped => "Stopped",
            RunState::Running => "Running",
            RunState::ManualPaused => "Paused",
        }
    }
}

/// Everything the workers and the control loop share.
///
/// Owned by the controller and handed to workers as an `Arc`; there is no
/// global state.
#[derive(Debug, Default)]
pub struct SharedScanState {
    /// Slow-changing runtime state
    pub runtime: RwLock<RuntimeState>,
    /// Hot-path counters
    pub stats: ScanStats,
    /// Rotate frames by 180 degrees; read by the capture worker every frame
    flip: AtomicBool,
}

impl SharedScanState {
    /// Create shared state starting in the given check mode
    pub fn new(check_mode: CheckMode) -> Self {
        let state = Self::default();
        state.runtime.write().check_mode = check_mode;
        state
    }

    /// Current check mode
    pub fn check_mode(&self) -> CheckMode {
        self.runtime.read().check_mode
    }

    pub fn flip(&self) -> bool {
        self.flip.load(Ordering::Relaxed)
    }

    pub fn set_flip(&self, flip: bool) {
        self.flip.store(flip, Ordering::Relaxed);
    }

    /// Invert the flip setting, returning the new value
    pub fn toggle_flip(&self) -> bool {
        !self.flip.fetch_xor(true, Ordering::Relaxed)
    }
}

/// Runtime state that is not persisted
#[derive(Debug, Clone, Default)]
pub struct RuntimeState {
    /// Current worker lifecycle state
    pub run_state: RunState,
    /// Basic or extended identification
    pub check_mode: CheckMode,
    /// Description of the frame source
    pub source_description: Option<String>,
    /// Last serial that won a consensus vote or was entered manually
    pub last_serial: Option<String>,
    /// Serial currently being identified
    pub processing: Option<String>,
    /// Most recently identified device
    pub current_device: Option<DeviceRecord>,
    /// Last error message (if any)
    pub last_error: Option<String>,
}

impl RuntimeState {
    /// Clear any error state
    pub fn clear_error(&mut self) {
        self.last_error = None;
    }

    /// Set an error message
    pub fn set_error(&mut self, error: impl Into<String>) {
        self.last_error = Some(error.into());
    }
}

/// Counters updated by the workers
#[derive(Debug, Default)]
pub struct ScanStats {
    frames_captured: AtomicU64,
    frames_dropped: AtomicU64,
    frames_processed: AtomicU64,
    ocr_failures: AtomicU64,
    decisions: AtomicU64,
    inconclusive: AtomicU64,
    duplicates_skipped: AtomicU64,
    busy_skipped: AtomicU64,
    identified: AtomicU64,
}

impl ScanStats {
    pub fn record_captured(&self, evicted: usize) {
        self.frames_captured.fetch_add(1, Ordering::Relaxed);
        self.frames_dropped.fetch_add(evicted as u64, Ordering::Relaxed);
    }

    pub fn record_dropped(&self, count: usize) {
        self.frames_dropped.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_processed(&self) {
        self.frames_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ocr_failure(&self) {
        self.ocr_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decision(&self) {
        self.decisions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_inconclusive(&self) {
        self.inconclusive.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.duplicates_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_busy(&self) {
        self.busy_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_identified(&self) {
        self.identified.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of all counters
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            frames_processed: self.frames_processed.load(Ordering::Relaxed),
            ocr_failures: self.ocr_failures.load(Ordering::Relaxed),
            decisions: self.decisions.load(Ordering::Relaxed),
            inconclusive: self.inconclusive.load(Ordering::Relaxed),
            duplicates_skipped: self.duplicates_skipped.load(Ordering::Relaxed),
            busy_skipped: self.busy_skipped.load(Ordering::Relaxed),
            identified: self.identified.load(Ordering::Relaxed),
        }
    }
}

/// Copy of [`ScanStats`] for display
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub frames_captured: u64,
    pub frames_dropped: u64,
    pub frames_processed: u64,
    pub ocr_failures: u64,
    pub decisions: u64,
    pub inconclusive: u64,
    pub duplicates_skipped: u64,
    pub busy_skipped: u64,
    pub identified: u64,
}
