//! Test doubles for the external collaborators

use image::RgbaImage;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::capture::{CapturedFrame, FrameSource, SourceProvider};
use crate::error::ScanError;
use crate::identify::{CheckMode, DeviceRecord, DeviceSink, IdentificationPipeline};
use crate::vision::{CandidateText, TextRecognizer};

/// Pipeline that records every serial it is asked about
#[derive(Default)]
pub struct RecordingPipeline {
    calls: Mutex<Vec<String>>,
    delay: Duration,
}

impl RecordingPipeline {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            delay,
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

impl IdentificationPipeline for RecordingPipeline {
    fn identify(&self, serial: &str, mode: CheckMode) -> DeviceRecord {
        self.calls.lock().push(serial.to_string());
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        DeviceRecord {
            model_name: Some("Test Model".to_string()),
            lock_status: mode.is_extended().then(|| "OFF".to_string()),
            ..DeviceRecord::new(serial)
        }
    }
}

/// Pipeline that always panics
pub struct PanickingPipeline;

impl IdentificationPipeline for PanickingPipeline {
    fn identify(&self, _serial: &str, _mode: CheckMode) -> DeviceRecord {
        panic!("lookup exploded");
    }
}

/// Sink that records published serials
#[derive(Default)]
pub struct RecordingSink {
    published: Mutex<Vec<String>>,
}

impl RecordingSink {
    pub fn published(&self) -> Vec<String> {
        self.published.lock().clone()
    }
}

impl DeviceSink for RecordingSink {
    fn name(&self) -> &str {
        "recording"
    }

    fn publish(&self, record: &DeviceRecord) -> Result<(), ScanError> {
        self.published.lock().push(record.serial.clone());
        Ok(())
    }
}

/// Recognizer returning the same texts for every frame
pub struct ScriptedRecognizer {
    texts: Vec<CandidateText>,
    calls: AtomicUsize,
}

impl ScriptedRecognizer {
    pub fn new(texts: Vec<CandidateText>) -> Self {
        Self {
            texts,
            calls: AtomicUsize::new(0),
        }
    }

    /// Recognizer that never finds anything
    pub fn blank() -> Self {
        Self::new(Vec::new())
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl TextRecognizer for ScriptedRecognizer {
    fn recognize(&self, _frame: &CapturedFrame) -> Result<Vec<CandidateText>, ScanError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.texts.clone())
    }
}

/// Recognizer whose reading depends on the frame's sequence number
pub struct SequencedRecognizer {
    readings: Vec<(u64, &'static str)>,
}

impl SequencedRecognizer {
    pub fn new(readings: Vec<(u64, &'static str)>) -> Self {
        Self { readings }
    }
}

impl TextRecognizer for SequencedRecognizer {
    fn recognize(&self, frame: &CapturedFrame) -> Result<Vec<CandidateText>, ScanError> {
        Ok(self
            .readings
            .iter()
            .filter(|(seq, _)| *seq == frame.sequence)
            .map(|(_, text)| CandidateText::new(*text, 0.9))
            .collect())
    }
}

/// Source producing blank frames at a fixed interval, optionally failing
/// after a number of frames
pub struct SyntheticSource {
    interval: Duration,
    fail_after: Option<u64>,
    sequence: u64,
}

impl FrameSource for SyntheticSource {
    fn next_frame(&mut self) -> Result<CapturedFrame, ScanError> {
        if self.fail_after.is_some_and(|n| self.sequence >= n) {
            return Err(ScanError::CameraUnavailable("synthetic camera unplugged".into()));
        }
        std::thread::sleep(self.interval);
        let frame = CapturedFrame::new(RgbaImage::new(8, 8), self.sequence);
        self.sequence += 1;
        Ok(frame)
    }
}

/// Provider of [`SyntheticSource`]s that counts how often it was opened
pub struct SyntheticProvider {
    interval: Duration,
    fail_after: Option<u64>,
    fail_open: bool,
    opened: Arc<AtomicUsize>,
}

impl SyntheticProvider {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            fail_after: None,
            fail_open: false,
            opened: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Sources fail after delivering `frames` frames
    pub fn failing_after(mut self, frames: u64) -> Self {
        self.fail_after = Some(frames);
        self
    }

    /// Opening always fails
    pub fn unavailable() -> Self {
        Self {
            fail_open: true,
            ..Self::new(Duration::from_millis(10))
        }
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

impl SourceProvider for SyntheticProvider {
    fn open(&self) -> Result<Box<dyn FrameSource>, ScanError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        if self.fail_open {
            return Err(ScanError::CameraUnavailable("no camera attached".into()));
        }
        Ok(Box::new(SyntheticSource {
            interval: self.interval,
            fail_after: self.fail_after,
            sequence: 0,
        }))
    }

    fn describe(&self) -> String {
        "synthetic camera".to_string()
    }
}
