//! Serial Scanner - camera-fed device serial number reader
//!
//! Reads serial number labels from camera frames, settles noisy reads by
//! plurality vote, and looks up each device once per cooldown window.

mod app;
mod capture;
mod commands;
mod config;
mod controller;
mod error;
mod identify;
mod scanner;
mod shared;
mod storage;
mod vision;

#[cfg(test)]
mod testing;

use anyhow::{Context, Result};
use clap::Parser;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use crate::app::ScannerApp;
use crate::config::{AppConfig, GeneralConfig};
use crate::identify::CheckMode;

/// Serial Scanner - identify devices from their serial number labels
#[derive(Parser, Debug)]
#[command(name = "serial-scanner")]
#[command(about = "Reads device serial numbers from camera frames and identifies the devices")]
struct Args {
    /// Configuration file (defaults to config.toml in the config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory of images to replay as the camera
    #[arg(long)]
    source_dir: Option<PathBuf>,

    /// Check mode: basic or extended
    #[arg(long)]
    mode: Option<CheckMode>,

    /// Start paused; scanning begins on 'resume'
    #[arg(long)]
    no_autostart: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Write the effective configuration to the config file and exit
    #[arg(long)]
    write_config: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = match &args.config {
        Some(path) => path.clone(),
        None => storage::get_config_dir()?.join("config.toml"),
    };

    let mut config = load_or_create_config(&config_path)?;
    apply_overrides(&mut config, &args);

    // Initialize logging; RUST_LOG takes precedence
    let (file_layer, log_path, log_error) = match open_log_file(&config.general) {
        Ok(Some((path, file))) => (
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file))),
            Some(path),
            None,
        ),
        Ok(None) => (None, None, None),
        Err(e) => (None, None, Some(e)),
    };
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .try_init()?;

    if config_path.exists() {
        info!("Loaded configuration from {:?}", config_path);
    } else {
        info!("Using default configuration");
    }
    if let Some(path) = &log_path {
        info!("Logging to {:?}", path);
    }
    if let Some(e) = log_error {
        warn!("File logging disabled: {:#}", e);
    }

    if args.write_config {
        config::save_config(&config, &config_path)
            .with_context(|| format!("Failed to write config {:?}", config_path))?;
        println!("Configuration written to {}", config_path.display());
        return Ok(());
    }

    info!("Serial Scanner starting...");

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        if let Err(err) = ctrlc::set_handler(move || {
            running.store(false, Ordering::SeqCst);
        }) {
            warn!("Failed to install Ctrl+C handler: {err}");
        }
    }

    let mut app = ScannerApp::new(&config, running)?;
    app.run()?;

    info!("Serial Scanner shutdown complete");
    Ok(())
}

/// Load configuration from file or fall back to defaults
fn load_or_create_config(path: &Path) -> Result<AppConfig> {
    if path.exists() {
        return config::load_config(path);
    }
    Ok(AppConfig::default())
}

/// Open the log file for appending. `None` when file logging is off.
fn open_log_file(general: &GeneralConfig) -> Result<Option<(PathBuf, File)>> {
    if !general.log_to_file {
        return Ok(None);
    }
    let path = match &general.log_file {
        Some(path) => path.clone(),
        None => storage::get_data_dir()?.join("scanner.log"),
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create log directory {:?}", parent))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("Failed to open log file {:?}", path))?;
    Ok(Some((path, file)))
}

/// Apply command line flags on top of the file configuration
fn apply_overrides(config: &mut AppConfig, args: &Args) {
    if let Some(dir) = &args.source_dir {
        config.capture.source_dir = Some(dir.clone());
    }
    if let Some(mode) = args.mode {
        config.identify.check_mode = mode;
    }
    if args.no_autostart {
        config.general.autostart = false;
    }
}
