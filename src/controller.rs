//! Scan lifecycle controller
//!
//! Owns the capture and consensus workers and decides when they run. Only
//! the control thread calls into the controller; workers report back over a
//! channel and are stopped through their run's cancellation token.
//!
//! Stopping never blocks: the handles of a stopped run move to a retiring
//! list that later polls reap once the threads have finished.

use crossbeam_channel::{Receiver, Sender};
use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::capture::{CaptureTransform, FrameBuffer, SourceProvider};
use crate::config::{ControlSettings, ScannerSettings};
use crate::identify::{CheckMode, DeviceRecord};
use crate::scanner::{run_capture, run_consensus, CancelToken, ProcessOutcome, SerialProcessor, WorkerContext};
use crate::shared::{RunState, ScanSource, SharedScanState, StatsSnapshot, StatusEvent, WorkerEvent};
use crate::vision::{SerialExtractor, TextRecognizer};

/// Collaborators handed to every scan run
pub struct ScanDeps {
    pub provider: Arc<dyn SourceProvider>,
    pub recognizer: Arc<dyn TextRecognizer>,
    pub processor: Arc<SerialProcessor>,
    pub frames: Arc<FrameBuffer>,
    pub transform: CaptureTransform,
    pub scanner: ScannerSettings,
}

/// Workers of the current run
struct ActiveRun {
    id: u64,
    cancel: CancelToken,
    workers: Vec<JoinHandle<()>>,
}

impl ActiveRun {
    fn any_finished(&self) -> bool {
        self.workers.iter().any(|h| h.is_finished())
    }
}

/// Point-in-time view of the scanner for the `status` command
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub state: RunState,
    pub check_mode: CheckMode,
    pub manual_override: bool,
    pub manual_entry_active: bool,
    pub camera_fault: bool,
    pub source: Option<String>,
    pub flip: bool,
    pub buffered_frames: usize,
    pub buffer_capacity: usize,
    pub active_workers: usize,
    pub manual_checks: usize,
    pub duplicate_window: Duration,
    pub tracked_serials: usize,
    pub processing: Option<String>,
    pub last_serial: Option<String>,
    pub current_device: Option<DeviceRecord>,
    pub last_error: Option<String>,
    pub stats: StatsSnapshot,
}

impl fmt::Display for StatusSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "State: {} | Mode: {} | Workers: {}",
            self.state.name(),
            self.check_mode.name(),
            self.active_workers
        )?;
        if self.manual_override {
            writeln!(f, "Manual pause is on; auto-resume disabled")?;
        }
        if self.manual_entry_active {
            writeln!(f, "Manual entry open")?;
        }
        if self.camera_fault {
            writeln!(f, "Camera fault latched; use start or resume to retry")?;
        }
        if let Some(source) = &self.source {
            writeln!(
                f,
                "Source: {}{}",
                source,
                if self.flip { " (rotated 180)" } else { "" }
            )?;
        }
        writeln!(
            f,
            "Frames: {} captured, {} dropped, {} processed, {}/{} buffered",
            self.stats.frames_captured,
            self.stats.frames_dropped,
            self.stats.frames_processed,
            self.buffered_frames,
            self.buffer_capacity
        )?;
        writeln!(
            f,
            "Decisions: {} ({} inconclusive), {} identified, {} duplicates, {} busy",
            self.stats.decisions,
            self.stats.inconclusive,
            self.stats.identified,
            self.stats.duplicates_skipped,
            self.stats.busy_skipped
        )?;
        writeln!(
            f,
            "Recently checked: {} serial(s), {}s duplicate window",
            self.tracked_serials,
            self.duplicate_window.as_secs()
        )?;
        if let Some(serial) = &self.processing {
            writeln!(f, "Processing: {}", serial)?;
        }
        if self.manual_checks > 0 {
            writeln!(f, "Manual checks running: {}", self.manual_checks)?;
        }
        if let Some(serial) = &self.last_serial {
            writeln!(f, "Last serial: {}", serial)?;
        }
        if let Some(device) = &self.current_device {
            writeln!(f, "Current device: {}", device.summary())?;
        }
        if let Some(err) = &self.last_error {
            writeln!(f, "Last error: {}", err)?;
        }
        Ok(())
    }
}

/// State machine over the scan workers
pub struct RunController {
    deps: ScanDeps,
    shared: Arc<SharedScanState>,
    events_tx: Sender<WorkerEvent>,
    events_rx: Receiver<WorkerEvent>,
    state: RunState,
    /// Set by an operator pause; blocks auto-resume
    manual_override: bool,
    /// Manual entry is open; blocks auto-resume
    manual_entry_active: bool,
    /// The camera failed; blocks auto-resume until an explicit start
    camera_fault: bool,
    active: Option<ActiveRun>,
    retiring: Vec<JoinHandle<()>>,
    manual_jobs: Vec<JoinHandle<ProcessOutcome>>,
    next_run_id: u64,
    auto_resume_interval: Duration,
    last_auto_resume: Instant,
    pending: Vec<StatusEvent>,
    extractor: SerialExtractor,
}

impl RunController {
    /// Create a stopped controller. `events` must be the channel whose sender
    /// the processor reports on.
    pub fn new(
        deps: ScanDeps,
        shared: Arc<SharedScanState>,
        events: (Sender<WorkerEvent>, Receiver<WorkerEvent>),
        control: &ControlSettings,
    ) -> Self {
        shared.runtime.write().source_description = Some(deps.provider.describe());
        shared.set_flip(deps.transform.flip);
        let (events_tx, events_rx) = events;
        Self {
            deps,
            shared,
            events_tx,
            events_rx,
            state: RunState::Stopped,
            manual_override: false,
            manual_entry_active: false,
            camera_fault: false,
            active: None,
            retiring: Vec::new(),
            manual_jobs: Vec::new(),
            next_run_id: 1,
            auto_resume_interval: control.auto_resume_interval(),
            last_auto_resume: Instant::now(),
            pending: Vec::new(),
            extractor: SerialExtractor::new(),
        }
    }

    pub fn manual_entry_active(&self) -> bool {
        self.manual_entry_active
    }

    /// Worker threads that have not finished yet, across current and retiring runs
    pub fn active_workers(&self) -> usize {
        let current = self
            .active
            .iter()
            .flat_map(|run| run.workers.iter())
            .filter(|h| !h.is_finished())
            .count();
        current + self.retiring.iter().filter(|h| !h.is_finished()).count()
    }

    /// Start scanning. No-op while already running.
    ///
    /// An explicit start clears a manual pause and a latched camera fault.
    pub fn start(&mut self) -> bool {
        if self.state == RunState::Running {
            debug!("Start ignored: already running");
            return false;
        }
        self.manual_override = false;
        self.camera_fault = false;
        self.launch()
    }

    /// Stop scanning. No-op unless running.
    ///
    /// In-flight identification finishes on its own; only new work is prevented.
    pub fn stop(&mut self) -> bool {
        if self.state != RunState::Running {
            debug!("Stop ignored: not running");
            return false;
        }
        self.halt_workers();
        self.set_state(RunState::Stopped);
        true
    }

    /// Operator pause: stop and keep auto-resume off
    pub fn manual_pause(&mut self) -> bool {
        match self.state {
            RunState::ManualPaused => return false,
            RunState::Running => self.halt_workers(),
            RunState::Stopped => {}
        }
        self.manual_override = true;
        self.set_state(RunState::ManualPaused);
        true
    }

    /// Operator resume: clear the pause and start scanning
    pub fn manual_resume(&mut self) -> bool {
        self.start()
    }

    /// Flip between running and manually paused
    pub fn toggle(&mut self) -> bool {
        if self.state == RunState::Running {
            self.manual_pause()
        } else {
            self.manual_resume()
        }
    }

    /// Restart a stopped scanner unless something is holding it off
    pub fn auto_resume_tick(&mut self) -> bool {
        if self.state != RunState::Stopped
            || self.manual_override
            || self.manual_entry_active
            || self.camera_fault
        {
            return false;
        }
        info!("Auto-resuming scan");
        self.launch()
    }

    /// Switch between basic and extended checks.
    ///
    /// A running scan is stopped without a manual pause, so auto-resume picks
    /// it up again under the new mode.
    pub fn toggle_mode(&mut self) -> CheckMode {
        self.stop();
        let mode = {
            let mut runtime = self.shared.runtime.write();
            runtime.check_mode = runtime.check_mode.toggled();
            runtime.check_mode
        };
        self.pending.push(StatusEvent::ModeChanged(mode));
        mode
    }

    /// Switch 180 degree frame rotation on or off. Takes effect on the next
    /// captured frame, including in a live run.
    pub fn toggle_flip(&mut self) -> bool {
        let flip = self.shared.toggle_flip();
        self.pending.push(StatusEvent::FlipChanged(flip));
        flip
    }

    /// Open manual entry: stop scanning and hold off auto-resume
    pub fn open_manual_entry(&mut self) {
        if self.manual_entry_active {
            return;
        }
        self.stop();
        self.manual_entry_active = true;
        self.pending.push(StatusEvent::ManualEntry { open: true });
    }

    /// Close manual entry without submitting
    pub fn close_manual_entry(&mut self) {
        if !self.manual_entry_active {
            return;
        }
        self.manual_entry_active = false;
        self.pending.push(StatusEvent::ManualEntry { open: false });
    }

    /// Submit a typed serial and close manual entry.
    ///
    /// Processing runs on its own thread through the same duplicate and
    /// processing gates as camera serials. Returns the normalized serial, or
    /// `None` if nothing was entered.
    pub fn submit_manual(&mut self, serial: &str) -> Option<String> {
        let serial = SerialExtractor::normalize_manual(serial);
        self.close_manual_entry();

        if serial.is_empty() {
            warn!("Manual entry submitted without a serial");
            return None;
        }
        if !self.extractor.is_serial(&serial) {
            warn!("{} does not look like a serial number; checking anyway", serial);
        }

        let processor = self.deps.processor.clone();
        let job_serial = serial.clone();
        match thread::Builder::new()
            .name("manual-entry".to_string())
            .spawn(move || processor.process(&job_serial, ScanSource::Manual))
        {
            Ok(handle) => {
                info!("Manual check queued for {}", serial);
                self.manual_jobs.push(handle);
                Some(serial)
            }
            Err(e) => {
                error!("Failed to start manual check: {}", e);
                self.shared.runtime.write().set_error(format!("manual check: {}", e));
                None
            }
        }
    }

    /// Manual checks that have not finished yet
    fn pending_manual_jobs(&self) -> usize {
        self.manual_jobs.iter().filter(|h| !h.is_finished()).count()
    }

    /// One control tick: handle worker reports, reap finished threads, and
    /// evaluate auto-resume on its cadence. Returns status for the operator.
    pub fn poll(&mut self, now: Instant) -> Vec<StatusEvent> {
        // Sampled before draining: a worker that finished has already sent
        // whatever it was going to send
        let exited_run = self
            .active
            .as_ref()
            .filter(|run| run.any_finished())
            .map(|run| run.id);

        while let Ok(event) = self.events_rx.try_recv() {
            match event {
                WorkerEvent::CameraUnavailable { run_id, reason } => {
                    self.handle_camera_failure(run_id, reason)
                }
                WorkerEvent::Status(status) => self.pending.push(status),
            }
        }

        if let Some(run_id) = exited_run {
            if self.active.as_ref().map(|run| run.id) == Some(run_id) {
                error!("Scan worker of run {} exited unexpectedly", run_id);
                self.shared.runtime.write().set_error("scan worker exited unexpectedly");
                self.halt_workers();
                self.set_state(RunState::Stopped);
            }
        }

        self.reap();

        if now.saturating_duration_since(self.last_auto_resume) >= self.auto_resume_interval {
            self.last_auto_resume = now;
            self.auto_resume_tick();
        }

        std::mem::take(&mut self.pending)
    }

    /// Snapshot of everything the operator might want to see
    pub fn status(&self) -> StatusSnapshot {
        let runtime = self.shared.runtime.read().clone();
        StatusSnapshot {
            state: self.state,
            check_mode: runtime.check_mode,
            manual_override: self.manual_override,
            manual_entry_active: self.manual_entry_active,
            camera_fault: self.camera_fault,
            source: runtime.source_description,
            flip: self.shared.flip(),
            buffered_frames: self.deps.frames.len(),
            buffer_capacity: self.deps.frames.capacity(),
            active_workers: self.active_workers(),
            manual_checks: self.pending_manual_jobs(),
            duplicate_window: self.deps.processor.duplicates().window(),
            tracked_serials: self.deps.processor.duplicates().tracked_count(),
            processing: runtime.processing,
            last_serial: runtime.last_serial,
            current_device: runtime.current_device,
            last_error: runtime.last_error,
            stats: self.shared.stats.snapshot(),
        }
    }

    /// Stop everything and wait up to `timeout` for all threads to finish.
    /// Returns whether every thread was joined.
    pub fn shutdown(&mut self, timeout: Duration) -> bool {
        self.stop();
        let deadline = Instant::now() + timeout;

        loop {
            let retiring_done = self.retiring.iter().all(|h| h.is_finished());
            let manual_done = self.manual_jobs.iter().all(|h| h.is_finished());
            if (retiring_done && manual_done) || Instant::now() >= deadline {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }

        self.reap();
        let clean = self.retiring.is_empty() && self.manual_jobs.is_empty();
        if !clean {
            warn!(
                "Shutdown timed out with {} worker(s) and {} manual check(s) still running",
                self.retiring.len(),
                self.manual_jobs.len()
            );
        }
        clean
    }

    fn launch(&mut self) -> bool {
        match self.spawn_run() {
            Ok(run) => {
                info!("Scan run {} started", run.id);
                self.active = Some(run);
                self.shared.runtime.write().clear_error();
                self.set_state(RunState::Running);
                true
            }
            Err(e) => {
                error!("Failed to start scan workers: {}", e);
                self.shared.runtime.write().set_error(format!("failed to start workers: {}", e));
                false
            }
        }
    }

    fn spawn_run(&mut self) -> std::io::Result<ActiveRun> {
        let run_id = self.next_run_id;
        self.next_run_id += 1;

        // Frames left over from an earlier run are stale
        self.deps.frames.clear();

        let ctx = WorkerContext {
            run_id,
            cancel: CancelToken::new(),
            frames: self.deps.frames.clone(),
            shared: self.shared.clone(),
            events: self.events_tx.clone(),
        };

        let capture = {
            let ctx = ctx.clone();
            let provider = self.deps.provider.clone();
            let transform = self.deps.transform.clone();
            thread::Builder::new()
                .name(format!("capture-{}", run_id))
                .spawn(move || run_capture(ctx, provider, transform))?
        };

        let consensus = {
            let ctx = ctx.clone();
            let recognizer = self.deps.recognizer.clone();
            let processor = self.deps.processor.clone();
            let settings = self.deps.scanner.clone();
            thread::Builder::new()
                .name(format!("consensus-{}", run_id))
                .spawn(move || run_consensus(ctx, recognizer, processor, settings))
        };

        let consensus = match consensus {
            Ok(handle) => handle,
            Err(e) => {
                ctx.cancel.cancel();
                self.retiring.push(capture);
                return Err(e);
            }
        };

        Ok(ActiveRun {
            id: run_id,
            cancel: ctx.cancel,
            workers: vec![capture, consensus],
        })
    }

    /// Cancel the current run and retire its threads without waiting
    fn halt_workers(&mut self) {
        if let Some(run) = self.active.take() {
            run.cancel.cancel();
            self.retiring.extend(run.workers);
            debug!("Scan run {} cancelled", run.id);
        }
        let flushed = self.deps.frames.clear();
        if flushed > 0 {
            self.shared.stats.record_dropped(flushed);
        }
    }

    fn handle_camera_failure(&mut self, run_id: u64, reason: String) {
        let current = self.active.as_ref().map(|run| run.id) == Some(run_id);
        if !current || self.state != RunState::Running {
            debug!("Ignoring camera report from retired run {}", run_id);
            return;
        }

        self.halt_workers();
        self.camera_fault = true;
        self.shared.runtime.write().set_error(reason.clone());
        self.pending.push(StatusEvent::CameraUnavailable(reason));
        self.set_state(RunState::Stopped);
    }

    fn reap(&mut self) {
        let (finished, running): (Vec<_>, Vec<_>) =
            self.retiring.drain(..).partition(|h| h.is_finished());
        self.retiring = running;
        for handle in finished {
            if handle.join().is_err() {
                error!("A scan worker panicked");
            }
        }

        let (finished, running): (Vec<_>, Vec<_>) =
            self.manual_jobs.drain(..).partition(|h| h.is_finished());
        self.manual_jobs = running;
        for handle in finished {
            match handle.join() {
                Ok(outcome) if outcome.is_identified() => debug!("Manual check finished"),
                Ok(outcome) => debug!("Manual check ended without identification: {:?}", outcome),
                Err(_) => error!("Manual check thread panicked"),
            }
        }
    }

    fn set_state(&mut self, state: RunState) {
        if self.state == state {
            return;
        }
        debug!("Scanner {} -> {}", self.state.name(), state.name());
        self.state = state;
        self.shared.runtime.write().run_state = state;
        self.pending.push(StatusEvent::StateChanged(state));
    }
}

#[cfg(test)]
impl RunController {
    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn manual_override(&self) -> bool {
        self.manual_override
    }

    pub fn camera_fault(&self) -> bool {
        self.camera_fault
    }

    pub fn check_mode(&self) -> CheckMode {
        self.shared.check_mode()
    }
}

impl Drop for RunController {
    fn drop(&mut self) {
        // Signal workers; joining is left to `shutdown`
        if let Some(run) = self.active.take() {
            run.cancel.cancel();
        }
    }
}
