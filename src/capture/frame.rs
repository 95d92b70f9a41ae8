//! Frame data structures for captured camera content

use image::RgbaImage;
use std::time::Instant;

/// A captured frame from the frame source
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    /// RGBA pixel data
    pub image: RgbaImage,
    /// Timestamp when frame was captured
    pub timestamp: Instant,
    /// Position of this frame in the capture sequence of its run
    pub sequence: u64,
}

impl CapturedFrame {
    /// Create a new captured frame stamped with the current time
    pub fn new(image: RgbaImage, sequence: u64) -> Self {
        Self {
            image,
            timestamp: Instant::now(),
            sequence,
        }
    }

    /// Replace the pixel data, keeping timestamp and sequence
    pub fn with_image(self, image: RgbaImage) -> Self {
        Self { image, ..self }
    }
}
