//! Application Configuration
//!
//! Scanner settings stored in TOML format.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::identify::CheckMode;

/// Application settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// General settings
    pub general: GeneralConfig,
    /// Capture settings
    pub capture: CaptureSettings,
    /// Recognizer settings
    pub recognizer: RecognizerSettings,
    /// Consensus and gating settings
    pub scanner: ScannerSettings,
    /// Identification pipeline settings
    pub identify: IdentifySettings,
    /// Control loop settings
    pub control: ControlSettings,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Start scanning as soon as the application launches
    pub autostart: bool,
    /// Also write the log to a file
    pub log_to_file: bool,
    /// Log file path (defaults to scanner.log in the data directory)
    pub log_file: Option<PathBuf>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            autostart: true,
            log_to_file: true,
            log_file: None,
        }
    }
}

/// Capture-related settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    /// Directory of images replayed as the frame source
    pub source_dir: Option<PathBuf>,
    /// Maximum capture FPS
    pub max_fps: u32,
    /// Restart the replay when the last image has been delivered
    pub loop_frames: bool,
    /// Rotate frames by 180 degrees
    pub flip: bool,
    /// Resize factor applied before cropping
    pub zoom: f32,
    /// Crop rectangle [x, y, width, height] applied after zoom
    pub crop: Option<[u32; 4]>,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            source_dir: None,
            max_fps: 30,
            loop_frames: true,
            flip: true,
            zoom: 1.0,
            crop: None,
        }
    }
}

/// Text recognizer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognizerSettings {
    /// OCR executable
    pub command: String,
}

impl Default for RecognizerSettings {
    fn default() -> Self {
        Self {
            command: "tesseract".to_string(),
        }
    }
}

/// Buffering, consensus and duplicate suppression settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerSettings {
    /// Frame buffer capacity (K)
    pub buffer_capacity: usize,
    /// Candidates needed for a plurality vote (N)
    pub consensus_threshold: usize,
    /// Maximum age of a consensus window in milliseconds
    pub consensus_timeout_ms: u64,
    /// Cooldown before the same serial is processed again, in seconds
    pub duplicate_window_secs: u64,
    /// Recognizer confidence a text must exceed to be considered
    pub min_confidence: f32,
    /// How long the consensus worker waits for a frame per iteration
    pub pop_timeout_ms: u64,
}

impl Default for ScannerSettings {
    fn default() -> Self {
        Self {
            buffer_capacity: 10,
            consensus_threshold: 5,
            consensus_timeout_ms: 3_000,
            duplicate_window_secs: 120,
            min_confidence: 0.5,
            pop_timeout_ms: 100,
        }
    }
}

impl ScannerSettings {
    pub fn consensus_timeout(&self) -> Duration {
        Duration::from_millis(self.consensus_timeout_ms)
    }

    pub fn duplicate_window(&self) -> Duration {
        Duration::from_secs(self.duplicate_window_secs)
    }

    pub fn pop_timeout(&self) -> Duration {
        Duration::from_millis(self.pop_timeout_ms)
    }
}

/// Identification pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentifySettings {
    /// Basic (model + specs) or extended (adds lock/MDM status)
    pub check_mode: CheckMode,
    /// Timeout for each HTTP request
    pub request_timeout_secs: u64,
    /// Model name lookup by configuration code; `{code}` is substituted
    pub model_lookup_url: String,
    /// Spec page lookup; `{serial}` is substituted
    pub spec_lookup_url: String,
    /// Lock/MDM check; `{key}` and `{serial}` are substituted
    pub lock_check_url: String,
    /// File containing the lock check API key
    pub api_key_file: Option<PathBuf>,
    /// SQLite database for the model cache and scan history
    pub database: Option<PathBuf>,
}

impl Default for IdentifySettings {
    fn default() -> Self {
        Self {
            check_mode: CheckMode::Basic,
            request_timeout_secs: 10,
            model_lookup_url: "https://support-sp.apple.com/sp/product?cc={code}".to_string(),
            spec_lookup_url: "https://macfinder.co.uk/model/macbook-pro-15-inch-2018/?serial={serial}"
                .to_string(),
            lock_check_url: "https://sickw.com/api.php?format=json&key={key}&imei={serial}&service=72"
                .to_string(),
            api_key_file: None,
            database: None,
        }
    }
}

/// Control loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlSettings {
    /// How often auto-resume is evaluated, in milliseconds
    pub auto_resume_interval_ms: u64,
    /// Control loop tick, in milliseconds
    pub tick_interval_ms: u64,
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self {
            auto_resume_interval_ms: 5_000,
            tick_interval_ms: 50,
        }
    }
}

impl ControlSettings {
    pub fn auto_resume_interval(&self) -> Duration {
        Duration::from_millis(self.auto_resume_interval_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {:?}", path))?;
    let config: AppConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config {:?}", path))?;
    Ok(config)
}

/// Save configuration to file
pub fn save_config(config: &AppConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_app_config() {
        let config = AppConfig::default();

        assert!(config.general.autostart);
        assert!(config.general.log_to_file);
        assert!(config.general.log_file.is_none());

        assert!(config.capture.source_dir.is_none());
        assert_eq!(config.capture.max_fps, 30);
        assert!(config.capture.flip);
        assert!(config.capture.crop.is_none());

        assert_eq!(config.scanner.buffer_capacity, 10);
        assert_eq!(config.scanner.consensus_threshold, 5);
        assert_eq!(config.scanner.duplicate_window(), Duration::from_secs(120));
        assert!((config.scanner.min_confidence - 0.5).abs() < 0.01);

        assert_eq!(config.identify.check_mode, CheckMode::Basic);
        assert_eq!(config.control.auto_resume_interval(), Duration::from_secs(5));
    }

    #[test]
    fn test_config_with_custom_values() {
        let mut config = AppConfig::default();
        config.capture.crop = Some([100, 100, 300, 200]);
        config.scanner.consensus_threshold = 3;
        config.identify.check_mode = CheckMode::Extended;

        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(parsed.capture.crop, Some([100, 100, 300, 200]));
        assert_eq!(parsed.scanner.consensus_threshold, 3);
        assert_eq!(parsed.identify.check_mode, CheckMode::Extended);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let parsed: AppConfig = toml::from_str(
            r#"
            [scanner]
            consensus_threshold = 7

            [identify]
            check_mode = "extended"
            "#,
        )
        .unwrap();

        assert_eq!(parsed.scanner.consensus_threshold, 7);
        assert_eq!(parsed.scanner.buffer_capacity, 10);
        assert_eq!(parsed.identify.check_mode, CheckMode::Extended);
        assert!(parsed.general.autostart);
    }

    #[test]
    fn test_save_and_load_config() {
        let mut config = AppConfig::default();
        config.scanner.duplicate_window_secs = 30;

        let temp_file = NamedTempFile::new().unwrap();
        save_config(&config, temp_file.path()).unwrap();
        let loaded = load_config(temp_file.path()).unwrap();

        assert_eq!(loaded.scanner.duplicate_window_secs, 30);
        assert_eq!(loaded.capture.max_fps, config.capture.max_fps);
    }

    #[test]
    fn test_load_config_file_not_found() {
        let result = load_config(Path::new("/nonexistent/path/config.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_config_invalid_toml() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, "this is not valid toml {{{{").unwrap();

        let result = load_config(temp_file.path());
        assert!(result.is_err());
    }
}
