//! Application Coordinator
//!
//! Wires the configured adapters into a [`RunController`] and runs the
//! control loop: operator input, worker status and auto-resume, one tick at
//! a time.

use anyhow::{Context, Result};
use crossbeam_channel::unbounded;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::capture::{CaptureTransform, FrameBuffer, ImageDirProvider};
use crate::commands::{parse_command, CommandReader, OperatorCommand, HELP};
use crate::config::{AppConfig, IdentifySettings};
use crate::controller::{RunController, ScanDeps};
use crate::identify::HttpIdentifier;
use crate::scanner::SerialProcessor;
use crate::shared::{SharedScanState, StatusEvent};
use crate::storage::{self, Database};
use crate::vision::TesseractRecognizer;

/// How long shutdown waits for worker threads
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Main application coordinator
pub struct ScannerApp {
    controller: RunController,
    database: Option<Arc<Database>>,
    commands: CommandReader,
    running: Arc<AtomicBool>,
    tick: Duration,
    /// Operator input reached end of file; reported once
    input_closed: bool,
}

impl ScannerApp {
    /// Build every component from the configuration
    pub fn new(config: &AppConfig, running: Arc<AtomicBool>) -> Result<Self> {
        let shared = Arc::new(SharedScanState::new(config.identify.check_mode));
        let frames = Arc::new(FrameBuffer::new(config.scanner.buffer_capacity));
        let (events_tx, events_rx) = unbounded();

        let database = open_database(&config.identify);
        let identifier = HttpIdentifier::new(&config.identify, database.clone())
            .context("Failed to create identification pipeline")?;

        let mut processor = SerialProcessor::new(
            config.scanner.duplicate_window(),
            Arc::new(identifier),
            frames.clone(),
            shared.clone(),
            events_tx.clone(),
        );
        if let Some(db) = &database {
            processor = processor.with_sink(db.clone());
        }

        let recognizer = TesseractRecognizer::new(&config.recognizer.command);
        match recognizer.check_available() {
            Ok(version) => info!("Using {}", version),
            Err(e) => warn!("Text recognizer unavailable, frames will be skipped: {}", e),
        }

        let source_dir = match &config.capture.source_dir {
            Some(dir) => dir.clone(),
            None => storage::get_data_dir()?.join("frames"),
        };
        let provider = ImageDirProvider::new(
            source_dir,
            config.capture.max_fps,
            config.capture.loop_frames,
        );

        let deps = ScanDeps {
            provider: Arc::new(provider),
            recognizer: Arc::new(recognizer),
            processor: Arc::new(processor),
            frames,
            transform: CaptureTransform::from(&config.capture),
            scanner: config.scanner.clone(),
        };

        let mut controller = RunController::new(deps, shared, (events_tx, events_rx), &config.control);
        if config.general.autostart {
            controller.start();
        } else {
            info!("Autostart disabled; type 'resume' to begin scanning");
            controller.manual_pause();
        }

        Ok(Self {
            controller,
            database,
            commands: CommandReader::stdin()?,
            running,
            tick: config.control.tick_interval(),
            input_closed: false,
        })
    }

    /// Run the control loop until quit or Ctrl+C
    pub fn run(&mut self) -> Result<()> {
        println!("{}", HELP);

        while self.running.load(Ordering::SeqCst) {
            for line in self.commands.poll_lines() {
                if !self.handle_line(&line) {
                    self.running.store(false, Ordering::SeqCst);
                }
            }
            if !self.input_closed && self.commands.is_closed() {
                self.input_closed = true;
                warn!("Operator input closed; scanning continues until Ctrl+C");
            }

            for event in self.controller.poll(Instant::now()) {
                report(&event);
            }

            std::thread::sleep(self.tick);
        }

        info!("Shutting down...");
        if !self.controller.shutdown(SHUTDOWN_TIMEOUT) {
            warn!("Some workers did not stop in time");
        }
        Ok(())
    }

    /// Handle one line of operator input. Returns false to quit.
    fn handle_line(&mut self, line: &str) -> bool {
        match parse_command(line) {
            Ok(command) => self.execute(command),
            Err(e) => {
                if self.controller.manual_entry_active() && !line.trim().is_empty() {
                    self.controller.submit_manual(line);
                } else if !line.trim().is_empty() {
                    println!("{} (type 'help' for commands)", e);
                }
                true
            }
        }
    }

    fn execute(&mut self, command: OperatorCommand) -> bool {
        match command {
            OperatorCommand::Toggle => {
                self.controller.toggle();
            }
            OperatorCommand::Start => {
                self.controller.start();
            }
            OperatorCommand::Stop => {
                self.controller.stop();
            }
            OperatorCommand::Pause => {
                self.controller.manual_pause();
            }
            OperatorCommand::Resume => {
                self.controller.manual_resume();
            }
            OperatorCommand::ToggleMode => {
                self.controller.toggle_mode();
            }
            OperatorCommand::Flip => {
                self.controller.toggle_flip();
            }
            OperatorCommand::OpenManual => {
                self.controller.open_manual_entry();
                println!("Enter serial number (or 'cancel'):");
            }
            OperatorCommand::CancelManual => self.controller.close_manual_entry(),
            OperatorCommand::Check(serial) => {
                self.controller.submit_manual(&serial);
            }
            OperatorCommand::Status => self.print_status(),
            OperatorCommand::Help => println!("{}", HELP),
            OperatorCommand::Quit => return false,
        }
        true
    }

    fn print_status(&self) {
        print!("{}", self.controller.status());

        if let Some(db) = &self.database {
            match db.scan_count() {
                Ok(count) => println!("Scan history: {} device(s)", count),
                Err(e) => warn!("Failed to count scan history: {}", e),
            }
            match db.recent_scans(5) {
                Ok(entries) if !entries.is_empty() => {
                    println!("Recent scans:");
                    for entry in entries {
                        println!(
                            "  {}  {}",
                            entry.scanned_at.format("%Y-%m-%d %H:%M:%S"),
                            entry.record.summary()
                        );
                    }
                }
                Ok(_) => {}
                Err(e) => warn!("Failed to read scan history: {}", e),
            }
        }
    }
}

/// Open the SQLite store; the scanner keeps working without it
fn open_database(settings: &IdentifySettings) -> Option<Arc<Database>> {
    let path: PathBuf = match &settings.database {
        Some(path) => path.clone(),
        None => match storage::get_data_dir() {
            Ok(dir) => dir.join("scanner.db"),
            Err(e) => {
                warn!("No data directory, model cache and history disabled: {}", e);
                return None;
            }
        },
    };

    match Database::open(&path) {
        Ok(db) => Some(Arc::new(db)),
        Err(e) => {
            warn!("Model cache and history disabled: {}", e);
            None
        }
    }
}

/// Log a status event for the operator
fn report(event: &StatusEvent) {
    match event {
        StatusEvent::StateChanged(state) => info!("Scanner {}", state.name()),
        StatusEvent::CameraUnavailable(reason) => {
            error!("Camera unavailable: {}. Type 'start' to retry.", reason)
        }
        StatusEvent::SerialDecided { serial, votes, window_len } => {
            info!("Serial {} ({}/{} votes)", serial, votes, window_len)
        }
        StatusEvent::DeviceIdentified { source, record } => {
            info!("{:?}: {}", source, record.summary());
            if record.is_partial() {
                warn!("Some lookups failed for {}", record.serial);
            }
        }
        StatusEvent::DuplicateSkipped { serial, remaining } => info!(
            "{} was checked recently; {} seconds until it can be checked again",
            serial,
            remaining.as_secs()
        ),
        StatusEvent::GateBusy { serial, holder } => info!(
            "Skipped {}: still processing {}",
            serial,
            holder.as_deref().unwrap_or("another device")
        ),
        StatusEvent::ProcessingFailed { serial, reason } => {
            error!("Check of {} failed: {}", serial, reason)
        }
        StatusEvent::ModeChanged(mode) => info!("Check mode: {}", mode.name()),
        StatusEvent::FlipChanged(flip) => {
            info!("Frame rotation {}", if *flip { "on" } else { "off" })
        }
        StatusEvent::ManualEntry { open } => {
            info!("Manual entry {}", if *open { "opened" } else { "closed" })
        }
    }
}
