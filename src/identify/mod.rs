//! Device identification
//!
//! Turns a decided serial into a [`DeviceRecord`]. The pipeline is an
//! external collaborator behind [`IdentificationPipeline`]; results are
//! handed to every registered [`DeviceSink`].

pub mod http;

use serde::{Deserialize, Serialize};

use crate::error::ScanError;

pub use http::HttpIdentifier;

/// How much to look up for each device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckMode {
    /// Model name and hardware specs
    #[default]
    Basic,
    /// Basic plus activation lock and MDM status
    Extended,
}

impl CheckMode {
    /// The other mode
    pub fn toggled(self) -> Self {
        match self {
            CheckMode::Basic => CheckMode::Extended,
            CheckMode::Extended => CheckMode::Basic,
        }
    }

    /// Display name
    pub fn name(&self) -> &'static str {
        match self {
            CheckMode::Basic => "basic",
            CheckMode::Extended => "extended",
        }
    }

    pub fn is_extended(&self) -> bool {
        matches!(self, CheckMode::Extended)
    }
}

impl std::str::FromStr for CheckMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "basic" => Ok(CheckMode::Basic),
            "extended" | "full" => Ok(CheckMode::Extended),
            other => Err(format!("unknown check mode: {}", other)),
        }
    }
}

/// Everything known about one identified device.
///
/// Fields a lookup could not fill stay `None`; a partial record is still
/// published.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub serial: String,
    pub model_name: Option<String>,
    pub cpu: Option<String>,
    pub gpu: Option<String>,
    pub ram: Option<String>,
    pub storage: Option<String>,
    /// Activation (iCloud) lock status, extended mode only
    pub lock_status: Option<String>,
    /// MDM enrollment status, extended mode only
    pub mdm_status: Option<String>,
    /// Factory configuration string, extended mode only
    pub config: Option<String>,
    /// Model name reported by the lock check service
    pub extended_model_name: Option<String>,
}

impl DeviceRecord {
    /// Empty record for `serial`
    pub fn new(serial: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            ..Self::default()
        }
    }

    /// Configuration code used for model lookups (last four characters)
    pub fn config_code(&self) -> &str {
        config_code(&self.serial)
    }

    /// Whether any lookup failed to fill its fields
    pub fn is_partial(&self) -> bool {
        self.model_name.is_none() || self.cpu.is_none()
    }

    /// One-line summary for status output
    pub fn summary(&self) -> String {
        let mut parts = vec![self.serial.clone()];
        parts.push(self.model_name.clone().unwrap_or_else(|| "unknown model".to_string()));
        for value in [&self.cpu, &self.gpu, &self.ram, &self.storage].into_iter().flatten() {
            parts.push(value.clone());
        }
        if let Some(lock) = &self.lock_status {
            parts.push(format!("iCloud: {}", lock));
        }
        if let Some(mdm) = &self.mdm_status {
            parts.push(format!("MDM: {}", mdm));
        }
        parts.join(" | ")
    }
}

/// Last four characters of a serial (the whole serial if shorter)
pub fn config_code(serial: &str) -> &str {
    let start = serial
        .char_indices()
        .rev()
        .nth(3)
        .map(|(i, _)| i)
        .unwrap_or(0);
    &serial[start..]
}

/// Looks up device details for a serial.
///
/// Implementations must not fail as a whole: lookups that cannot be completed
/// leave their fields empty.
pub trait IdentificationPipeline: Send + Sync {
    fn identify(&self, serial: &str, mode: CheckMode) -> DeviceRecord;
}

/// Receives identified devices (history, label printer, display)
pub trait DeviceSink: Send + Sync {
    /// Name used in log messages
    fn name(&self) -> &str;

    fn publish(&self, record: &DeviceRecord) -> Result<(), ScanError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_mode_toggle() {
        assert_eq!(CheckMode::Basic.toggled(), CheckMode::Extended);
        assert_eq!(CheckMode::Extended.toggled(), CheckMode::Basic);
        assert!(CheckMode::Extended.is_extended());
    }

    #[test]
    fn test_check_mode_parse() {
        assert_eq!("basic".parse::<CheckMode>().unwrap(), CheckMode::Basic);
        assert_eq!("Extended".parse::<CheckMode>().unwrap(), CheckMode::Extended);
        assert_eq!("full".parse::<CheckMode>().unwrap(), CheckMode::Extended);
        assert!("turbo".parse::<CheckMode>().is_err());
    }

    #[test]
    fn test_config_code() {
        assert_eq!(config_code("C02XG2JHJGH5"), "JGH5");
        assert_eq!(config_code("ABC"), "ABC");
        assert_eq!(DeviceRecord::new("AB12CD34EF").config_code(), "34EF");
    }

    #[test]
    fn test_record_summary_and_partial() {
        let mut record = DeviceRecord::new("C02XG2JHJGH5");
        assert!(record.is_partial());
        assert_eq!(record.summary(), "C02XG2JHJGH5 | unknown model");

        record.model_name = Some("MacBook Pro".to_string());
        record.cpu = Some("i7".to_string());
        record.lock_status = Some("OFF".to_string());
        assert!(!record.is_partial());
        assert_eq!(record.summary(), "C02XG2JHJGH5 | MacBook Pro | i7 | iCloud: OFF");
    }
}
