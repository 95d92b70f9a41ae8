//! Operator commands read line by line from stdin

use anyhow::{anyhow, Result};
use crossbeam_channel::{unbounded, Receiver};
use std::io::BufRead;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// A command typed by the operator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatorCommand {
    /// Pause if running, resume otherwise
    Toggle,
    Start,
    Stop,
    Pause,
    Resume,
    /// Switch between basic and extended checks
    ToggleMode,
    /// Switch 180 degree frame rotation
    Flip,
    /// Open manual entry; the next line that is not a command is the serial
    OpenManual,
    /// Close manual entry without submitting
    CancelManual,
    /// Submit a serial directly
    Check(String),
    Status,
    Help,
    Quit,
}

/// Parses a command line like "pause", "check C02XG2JHJGH5" or a lone space
pub fn parse_command(line: &str) -> Result<OperatorCommand> {
    let line = line.trim_end_matches(['\r', '\n']);

    // A bare space is the toggle key
    if !line.is_empty() && line.trim().is_empty() {
        return Ok(OperatorCommand::Toggle);
    }

    let mut parts = line.split_whitespace();
    let word = parts
        .next()
        .ok_or_else(|| anyhow!("Empty command"))?
        .to_uppercase();

    let command = match word.as_str() {
        "TOGGLE" | "T" => OperatorCommand::Toggle,
        "START" => OperatorCommand::Start,
        "STOP" => OperatorCommand::Stop,
        "PAUSE" | "P" => OperatorCommand::Pause,
        "RESUME" | "R" => OperatorCommand::Resume,
        "MODE" | "M" => OperatorCommand::ToggleMode,
        "FLIP" | "F" => OperatorCommand::Flip,
        "MANUAL" => OperatorCommand::OpenManual,
        "CANCEL" | "ESC" => OperatorCommand::CancelManual,
        "CHECK" | "C" => {
            let serial = parts
                .next()
                .ok_or_else(|| anyhow!("check needs a serial number"))?;
            OperatorCommand::Check(serial.to_string())
        }
        "STATUS" | "S" => OperatorCommand::Status,
        "HELP" | "?" => OperatorCommand::Help,
        "QUIT" | "Q" | "EXIT" => OperatorCommand::Quit,
        _ => return Err(anyhow!("Unknown command: {}", word.to_lowercase())),
    };

    Ok(command)
}

/// Help text for the `help` command
pub const HELP: &str = "\
Commands:
  <space> | toggle   pause or resume scanning
  start | stop       start or stop scanning (stop allows auto-resume)
  pause | resume     manual pause (no auto-resume) and resume
  mode               switch basic / extended check
  flip               rotate frames 180 degrees on / off
  manual             open manual entry, then type the serial
  cancel             close manual entry
  check <serial>     check a serial directly
  status             show scanner status
  quit               exit";

/// Reads lines on a background thread so the control loop never blocks on input
pub struct CommandReader {
    receiver: Receiver<String>,
    closed: Arc<AtomicBool>,
}

impl CommandReader {
    /// Read from the process's stdin
    pub fn stdin() -> Result<Self> {
        Self::from_reader(std::io::BufReader::new(std::io::stdin()))
    }

    /// Read from any line source
    pub fn from_reader<R>(reader: R) -> Result<Self>
    where
        R: BufRead + Send + 'static,
    {
        let (sender, receiver) = unbounded();
        let closed = Arc::new(AtomicBool::new(false));
        let reader_closed = closed.clone();

        std::thread::Builder::new()
            .name("operator-input".to_string())
            .spawn(move || {
                for line in reader.lines() {
                    match line {
                        Ok(line) => {
                            if sender.send(line).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!("Failed to read operator input: {}", e);
                            break;
                        }
                    }
                }
                debug!("Operator input closed");
                reader_closed.store(true, Ordering::SeqCst);
            })
            .map_err(|e| anyhow!("Failed to start input thread: {}", e))?;

        Ok(Self { receiver, closed })
    }

    /// Lines typed since the last call
    pub fn poll_lines(&self) -> Vec<String> {
        self.receiver.try_iter().collect()
    }

    /// Whether the input side has closed and every line was consumed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) && self.receiver.is_empty()
    }
}
