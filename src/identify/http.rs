//! HTTP-backed identification pipeline
//!
//! Three lookups, each allowed to fail on its own:
//! - model name by configuration code (cached in SQLite)
//! - hardware specs scraped from a spec page
//! - activation lock and MDM status from a JSON API (extended mode)

use anyhow::{Context, Result};
use regex::Regex;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};

use super::{CheckMode, DeviceRecord, IdentificationPipeline};
use crate::config::IdentifySettings;
use crate::error::ScanError;
use crate::storage::Database;

/// Hardware specs scraped from the spec page
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HardwareSpecs {
    pub cpu: Option<String>,
    pub gpu: Option<String>,
    pub ram: Option<String>,
    pub storage: Option<String>,
}

/// Fields extracted from the lock check response
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LockReport {
    pub model_name: Option<String>,
    pub config: Option<String>,
    pub mdm: Option<String>,
    pub icloud: Option<String>,
}

/// Regex-based parsers for the lookup responses
#[derive(Debug)]
pub struct ResponseParser {
    config_code: Regex,
    processor: Regex,
    graphics: Regex,
    memory: Regex,
    storage: Regex,
    lock_model: Regex,
    lock_config: Regex,
    mdm_lock: Regex,
    icloud_lock: Regex,
}

/// Marker of the spec block on the spec page
const SPEC_BLOCK_MARKER: &str = "about-your-mac-box";

fn labelled_span(label: &str) -> Result<Regex> {
    let pattern = format!(
        r"(?s)<span[^>]*>\s*{}\s*</span>.*?<span[^>]*>\s*([^<]*?)\s*</span>",
        regex::escape(label)
    );
    Regex::new(&pattern).with_context(|| format!("Invalid pattern for {}", label))
}

impl ResponseParser {
    pub fn new() -> Result<Self> {
        Ok(Self {
            config_code: Regex::new(r"<configCode>(.*?)</configCode>")?,
            processor: labelled_span("Processor:")?,
            graphics: labelled_span("Graphics Card:")?,
            memory: labelled_span("Memory:")?,
            storage: labelled_span("Storage:")?,
            lock_model: Regex::new(r"Model Name:\s*([^<]+)<br\s*/>")?,
            lock_config: Regex::new(r"Device Configuration:\s*([^<]+)")?,
            mdm_lock: Regex::new(r"MDM Lock:\s*<font[^>]*>([^<]+)</font>")?,
            icloud_lock: Regex::new(r"iCloud Lock:\s*<font[^>]*>([^<]+)</font>")?,
        })
    }

    /// Model name from the configuration code lookup body
    pub fn model_name(&self, body: &str) -> Option<String> {
        capture(&self.config_code, body)
    }

    /// Specs from the spec page, or `None` if the page has no spec block
    pub fn specs(&self, html: &str) -> Option<HardwareSpecs> {
        let start = html.find(SPEC_BLOCK_MARKER)?;
        let block = &html[start..];
        Some(HardwareSpecs {
            cpu: capture(&self.processor, block),
            gpu: capture(&self.graphics, block),
            ram: capture(&self.memory, block),
            storage: capture(&self.storage, block),
        })
    }

    /// Lock/MDM fields from the JSON response's `result` field
    pub fn lock_report(&self, body: &str) -> Result<LockReport, ScanError> {
        let json: serde_json::Value = serde_json::from_str(body)
            .map_err(|e| ScanError::PipelineNetwork(format!("invalid lock check response: {}", e)))?;
        let result = json.get("result").and_then(|r| r.as_str()).unwrap_or_default();

        Ok(LockReport {
            model_name: capture(&self.lock_model, result),
            config: capture(&self.lock_config, result),
            mdm: capture(&self.mdm_lock, result),
            icloud: capture(&self.icloud_lock, result),
        })
    }
}

fn capture(pattern: &Regex, text: &str) -> Option<String> {
    pattern
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Read the lock check API key from a file
pub fn load_api_key(path: &Path) -> Result<String> {
    let key = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read API key file {:?}", path))?;
    let key = key.trim().to_string();
    if key.is_empty() {
        anyhow::bail!("API key file {:?} is empty", path);
    }
    Ok(key)
}

/// Identification pipeline backed by HTTP lookups
pub struct HttpIdentifier {
    runtime: Runtime,
    client: reqwest::Client,
    model_lookup_url: String,
    spec_lookup_url: String,
    lock_check_url: String,
    api_key: Option<String>,
    cache: Option<Arc<Database>>,
    parser: ResponseParser,
}

impl HttpIdentifier {
    /// Create the identifier. A missing API key only disables the lock check.
    pub fn new(settings: &IdentifySettings, cache: Option<Arc<Database>>) -> Result<Self> {
        let runtime = Runtime::new().context("Failed to create tokio runtime")?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs.max(1)))
            .build()
            .context("Failed to create HTTP client")?;

        let api_key = match &settings.api_key_file {
            Some(path) => match load_api_key(path) {
                Ok(key) => Some(key),
                Err(e) => {
                    warn!("Lock check disabled: {:#}", e);
                    None
                }
            },
            None => None,
        };

        Ok(Self {
            runtime,
            client,
            model_lookup_url: settings.model_lookup_url.clone(),
            spec_lookup_url: settings.spec_lookup_url.clone(),
            lock_check_url: settings.lock_check_url.clone(),
            api_key,
            cache,
            parser: ResponseParser::new()?,
        })
    }

    async fn fetch_text(&self, url: &str, what: &str) -> Result<String, ScanError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ScanError::PipelineNetwork(format!("{} request failed: {}", what, e)))?;

        if !response.status().is_success() {
            return Err(ScanError::PipelineNetwork(format!(
                "{} returned status {}",
                what,
                response.status()
            )));
        }

        response
            .text()
            .await
            .map_err(|e| ScanError::PipelineNetwork(format!("{} body unreadable: {}", what, e)))
    }

    /// Model name for a configuration code, consulting the cache first
    pub fn lookup_model(&self, code: &str) -> Result<Option<String>, ScanError> {
        if let Some(cache) = &self.cache {
            match cache.lookup_model(code) {
                Ok(Some(name)) => {
                    debug!("Model cache hit for {}", code);
                    return Ok(Some(name));
                }
                Ok(None) => {}
                Err(e) => warn!("Model cache unavailable: {}", e),
            }
        }

        let url = self.model_lookup_url.replace("{code}", code);
        let body = self
            .runtime
            .block_on(self.fetch_text(&url, "model lookup"))?;

        let name = self.parser.model_name(&body);
        match &name {
            Some(name) => {
                info!("Model name found for {}: {}", code, name);
                if let Some(cache) = &self.cache {
                    if let Err(e) = cache.store_model(code, name) {
                        warn!("Failed to cache model name: {}", e);
                    }
                }
            }
            None => warn!("Model name not found for {}", code),
        }
        Ok(name)
    }

    /// Hardware specs for a serial
    pub fn lookup_specs(&self, serial: &str) -> Result<Option<HardwareSpecs>, ScanError> {
        let url = self.spec_lookup_url.replace("{serial}", serial);
        let html = self.runtime.block_on(self.fetch_text(&url, "spec lookup"))?;
        Ok(self.parser.specs(&html))
    }

    /// Activation lock and MDM status for a serial
    pub fn check_lock(&self, serial: &str) -> Result<LockReport, ScanError> {
        let key = self
            .api_key
            .as_deref()
            .ok_or_else(|| ScanError::PipelineNetwork("no lock check API key configured".into()))?;

        let url = self
            .lock_check_url
            .replace("{key}", key)
            .replace("{serial}", serial);
        let body = self.runtime.block_on(self.fetch_text(&url, "lock check"))?;
        self.parser.lock_report(&body)
    }
}

impl IdentificationPipeline for HttpIdentifier {
    fn identify(&self, serial: &str, mode: CheckMode) -> DeviceRecord {
        let mut record = DeviceRecord::new(serial);

        match self.lookup_model(record.config_code()) {
            Ok(name) => record.model_name = name,
            Err(e) => warn!("Model lookup for {} failed: {}", serial, e),
        }

        match self.lookup_specs(serial) {
            Ok(Some(specs)) => {
                record.cpu = specs.cpu;
                record.gpu = specs.gpu;
                record.ram = specs.ram;
                record.storage = specs.storage;
            }
            Ok(None) => warn!("No spec block found for {}", serial),
            Err(e) => warn!("Spec lookup for {} failed: {}", serial, e),
        }

        if mode.is_extended() {
            match self.check_lock(serial) {
                Ok(report) => {
                    info!(
                        "Full check: {} | iCloud: {:?} | MDM: {:?}",
                        serial, report.icloud, report.mdm
                    );
                    record.lock_status = report.icloud;
                    record.mdm_status = report.mdm;
                    record.config = report.config;
                    record.extended_model_name = report.model_name;
                }
                Err(e) => warn!("Lock check for {} failed: {}", serial, e),
            }
        }

        record
    }
}
