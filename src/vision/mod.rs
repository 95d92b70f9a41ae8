//! Vision/OCR Layer
//!
//! Text recognition is an opaque external service reached through the
//! [`TextRecognizer`] trait. The default backend shells out to the
//! `tesseract` command line tool and parses its TSV output.

pub mod serial;

use std::path::PathBuf;
use std::process::Command;
use std::time::Instant;
use tracing::{debug, trace};

use crate::capture::CapturedFrame;
use crate::error::ScanError;

pub use serial::SerialExtractor;

/// A piece of recognized text with the recognizer's confidence (0.0 - 1.0)
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateText {
    /// Recognized text content
    pub text: String,
    /// Confidence score (0.0 - 1.0)
    pub confidence: f32,
}

impl CandidateText {
    pub fn new(text: impl Into<String>, confidence: f32) -> Self {
        Self {
            text: text.into(),
            confidence,
        }
    }
}

/// Optical text recognizer
pub trait TextRecognizer: Send + Sync {
    /// Recognize text in a frame.
    ///
    /// Failures are per-frame (`ScanError::OcrTransient`); the caller skips
    /// the frame and carries on.
    fn recognize(&self, frame: &CapturedFrame) -> Result<Vec<CandidateText>, ScanError>;
}

/// Keep only candidates strictly above `min_confidence`
pub fn filter_confident(candidates: Vec<CandidateText>, min_confidence: f32) -> Vec<CandidateText> {
    candidates
        .into_iter()
        .filter(|c| c.confidence > min_confidence)
        .collect()
}

/// Recognizer backed by the tesseract CLI
#[derive(Debug, Clone)]
pub struct TesseractRecognizer {
    /// Executable name or path
    command: PathBuf,
    /// Page segmentation mode (11 = sparse text, suits labels)
    page_segmentation: u32,
}

impl TesseractRecognizer {
    /// Create a recognizer invoking `command`
    pub fn new(command: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            page_segmentation: 11,
        }
    }

    /// Check that the executable can be launched
    pub fn check_available(&self) -> Result<String, ScanError> {
        let output = Command::new(&self.command)
            .arg("--version")
            .output()
            .map_err(|e| ScanError::OcrTransient(format!("cannot run {:?}: {}", self.command, e)))?;

        let version = String::from_utf8_lossy(&output.stdout);
        Ok(version.lines().next().unwrap_or("unknown").to_string())
    }
}

impl TextRecognizer for TesseractRecognizer {
    fn recognize(&self, frame: &CapturedFrame) -> Result<Vec<CandidateText>, ScanError> {
        let start = Instant::now();

        let scratch = tempfile::Builder::new()
            .prefix("serial-scanner-")
            .suffix(".png")
            .tempfile()
            .map_err(|e| ScanError::OcrTransient(format!("scratch file: {}", e)))?;

        frame
            .image
            .save(scratch.path())
            .map_err(|e| ScanError::OcrTransient(format!("encode frame: {}", e)))?;

        let output = Command::new(&self.command)
            .arg(scratch.path())
            .arg("stdout")
            .arg("--psm")
            .arg(self.page_segmentation.to_string())
            .arg("tsv")
            .output()
            .map_err(|e| ScanError::OcrTransient(format!("launch {:?}: {}", self.command, e)))?;

        if !output.status.success() {
            return Err(ScanError::OcrTransient(format!(
                "tesseract exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let candidates = parse_tsv(&String::from_utf8_lossy(&output.stdout));
        debug!(
            "OCR on frame {} complete in {:?}: {} words",
            frame.sequence,
            start.elapsed(),
            candidates.len()
        );

        Ok(candidates)
    }
}

/// Parse tesseract TSV output into word-level candidates.
///
/// Columns: level page block par line word left top width height conf text.
/// Only word rows (level 5) with non-empty text are kept; confidence is
/// rescaled from 0-100 to 0-1.
fn parse_tsv(tsv: &str) -> Vec<CandidateText> {
    tsv.lines()
        .skip(1)
        .filter_map(|line| {
            let cols: Vec<&str> = line.split('\t').collect();
            if cols.len() < 12 || cols[0] != "5" {
                return None;
            }

            let text = cols[11].trim();
            if text.is_empty() {
                return None;
            }

            let confidence = cols[10].trim().parse::<f32>().ok()?;
            if confidence < 0.0 {
                return None;
            }

            trace!("OCR word {:?} ({:.1})", text, confidence);
            Some(CandidateText::new(text, (confidence / 100.0).clamp(0.0, 1.0)))
        })
        .collect()
}
