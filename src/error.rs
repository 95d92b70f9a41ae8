//! Scanner error taxonomy
//!
//! Only `CameraUnavailable` ends a scan run. Everything else is handled
//! inside the worker loops and never terminates them.

use thiserror::Error;

/// Errors raised by the scanning pipeline and its collaborators
#[derive(Debug, Error)]
pub enum ScanError {
    /// The frame source could not be opened or stopped delivering frames
    #[error("camera unavailable: {0}")]
    CameraUnavailable(String),

    /// Text recognition failed for a single frame
    #[error("OCR failed for frame: {0}")]
    OcrTransient(String),

    /// A network lookup in the identification pipeline failed
    #[error("identification lookup failed: {0}")]
    PipelineNetwork(String),

    /// Local storage (model cache, scan history) failed
    #[error("storage error: {0}")]
    Storage(String),
}

impl ScanError {
    /// Whether this error must stop the current scan run
    pub fn is_fatal(&self) -> bool {
        matches!(self, ScanError::CameraUnavailable(_))
    }
}

impl From<rusqlite::Error> for ScanError {
    fn from(err: rusqlite::Error) -> Self {
        ScanError::Storage(err.to_string())
    }
}
