//! Frame Acquisition Layer
//!
//! The camera itself is an external collaborator reached through the
//! [`FrameSource`] trait. A [`SourceProvider`] opens a fresh source for every
//! scan run so a camera that failed can be retried on the next start.

pub mod buffer;
pub mod frame;

use image::imageops::{self, FilterType};
use image::RgbaImage;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::CaptureSettings;
use crate::error::ScanError;

pub use buffer::FrameBuffer;
pub use frame::CapturedFrame;

/// A blocking source of camera frames
pub trait FrameSource: Send {
    /// Block until the next frame is available.
    ///
    /// `ScanError::CameraUnavailable` means the source is gone for good and
    /// the current run must stop.
    fn next_frame(&mut self) -> Result<CapturedFrame, ScanError>;
}

/// Opens frame sources, once per scan run
pub trait SourceProvider: Send + Sync {
    /// Open the camera (or equivalent)
    fn open(&self) -> Result<Box<dyn FrameSource>, ScanError>;

    /// Human-readable description for status output
    fn describe(&self) -> String;
}

/// Geometry adjustments applied to every frame before it is buffered
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureTransform {
    /// Rotate by 180 degrees (camera mounted upside down)
    pub flip: bool,
    /// Resize factor applied before cropping
    pub zoom: f32,
    /// Crop rectangle (x, y, width, height) in zoomed coordinates
    pub crop: Option<(u32, u32, u32, u32)>,
}

impl Default for CaptureTransform {
    fn default() -> Self {
        Self {
            flip: true,
            zoom: 1.0,
            crop: None,
        }
    }
}

impl From<&CaptureSettings> for CaptureTransform {
    fn from(settings: &CaptureSettings) -> Self {
        Self {
            flip: settings.flip,
            zoom: settings.zoom,
            crop: settings.crop.map(|[x, y, w, h]| (x, y, w, h)),
        }
    }
}

impl CaptureTransform {
    /// Whether applying this transform would leave frames untouched
    pub fn is_identity(&self) -> bool {
        !self.flip && (self.zoom - 1.0).abs() < 0.01 && self.crop.is_none()
    }

    /// Apply zoom, then flip, then crop
    pub fn apply(&self, image: RgbaImage) -> RgbaImage {
        if self.is_identity() {
            return image;
        }

        let mut image = image;

        if (self.zoom - 1.0).abs() >= 0.01 && self.zoom > 0.0 {
            let (w, h) = image.dimensions();
            let new_w = ((w as f32 * self.zoom) as u32).max(1);
            let new_h = ((h as f32 * self.zoom) as u32).max(1);
            image = imageops::resize(&image, new_w, new_h, FilterType::Triangle);
        }

        if self.flip {
            image = imageops::rotate180(&image);
        }

        if let Some((x, y, w, h)) = self.crop {
            let (img_w, img_h) = image.dimensions();
            if x < img_w && y < img_h {
                let w = w.min(img_w - x);
                let h = h.min(img_h - y);
                if w > 0 && h > 0 {
                    image = imageops::crop_imm(&image, x, y, w, h).to_image();
                }
            } else {
                debug!(
                    "Crop origin ({}, {}) outside {}x{} frame, skipping crop",
                    x, y, img_w, img_h
                );
            }
        }

        image
    }
}

/// Image extensions accepted by [`ImageDirSource`]
const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "tif", "tiff"];

/// Replays a directory of still images as a paced frame stream
pub struct ImageDirProvider {
    dir: PathBuf,
    max_fps: u32,
    looping: bool,
}

impl ImageDirProvider {
    /// Create a provider replaying `dir` at `max_fps`
    pub fn new(dir: impl Into<PathBuf>, max_fps: u32, looping: bool) -> Self {
        Self {
            dir: dir.into(),
            max_fps,
            looping,
        }
    }
}

impl SourceProvider for ImageDirProvider {
    fn open(&self) -> Result<Box<dyn FrameSource>, ScanError> {
        let source = ImageDirSource::open(&self.dir, self.max_fps, self.looping)?;
        Ok(Box::new(source))
    }

    fn describe(&self) -> String {
        format!("image directory {}", self.dir.display())
    }
}

/// Frame source backed by image files on disk
pub struct ImageDirSource {
    files: Vec<PathBuf>,
    position: usize,
    looping: bool,
    frame_interval: Duration,
    next_due: Instant,
    sequence: u64,
}

impl ImageDirSource {
    /// Scan `dir` for images. An empty or missing directory counts as an
    /// unavailable camera.
    pub fn open(dir: &Path, max_fps: u32, looping: bool) -> Result<Self, ScanError> {
        let entries = std::fs::read_dir(dir).map_err(|e| {
            ScanError::CameraUnavailable(format!("cannot open {}: {}", dir.display(), e))
        })?;

        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                    .unwrap_or(false)
            })
            .collect();
        files.sort();

        if files.is_empty() {
            return Err(ScanError::CameraUnavailable(format!(
                "no images found in {}",
                dir.display()
            )));
        }

        info!("Opened image source {:?} with {} frames", dir, files.len());

        Ok(Self {
            files,
            position: 0,
            looping,
            frame_interval: Duration::from_secs_f64(1.0 / max_fps.max(1) as f64),
            next_due: Instant::now(),
            sequence: 0,
        })
    }

    fn wait_for_slot(&mut self) {
        let now = Instant::now();
        if self.next_due > now {
            std::thread::sleep(self.next_due - now);
        }
        self.next_due = Instant::now() + self.frame_interval;
    }
}

impl FrameSource for ImageDirSource {
    fn next_frame(&mut self) -> Result<CapturedFrame, ScanError> {
        // Bounded by the file count so a directory of unreadable files fails
        // instead of spinning forever
        for _ in 0..self.files.len() {
            if self.position >= self.files.len() {
                if !self.looping {
                    return Err(ScanError::CameraUnavailable("image source exhausted".into()));
                }
                self.position = 0;
            }

            let path = &self.files[self.position];
            self.position += 1;

            match image::open(path) {
                Ok(img) => {
                    self.wait_for_slot();
                    self.sequence += 1;
                    return Ok(CapturedFrame::new(img.to_rgba8(), self.sequence));
                }
                Err(e) => warn!("Skipping unreadable frame {:?}: {}", path, e),
            }
        }

        Err(ScanError::CameraUnavailable("no readable frames in source".into()))
    }
}
