//! Message types flowing from the scan workers to the control loop

use std::time::Duration;

use crate::identify::{CheckMode, DeviceRecord};
use crate::shared::state::RunState;

/// Where a serial came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanSource {
    /// Consensus vote over camera frames
    Camera,
    /// Typed in by the operator
    Manual,
}

/// Messages sent from workers to the controller
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// The frame source failed; only the controller may act on it
    CameraUnavailable {
        /// Run that observed the failure
        run_id: u64,
        reason: String,
    },
    /// Informational update passed through to the operator
    Status(StatusEvent),
}

/// Operator-visible status updates
#[derive(Debug, Clone, PartialEq)]
pub enum StatusEvent {
    /// The controller changed state
    StateChanged(RunState),
    /// The camera failed and scanning stopped
    CameraUnavailable(String),
    /// Consensus picked a serial
    SerialDecided {
        serial: String,
        votes: usize,
        window_len: usize,
    },
    /// A device was identified
    DeviceIdentified {
        source: ScanSource,
        record: DeviceRecord,
    },
    /// A serial was skipped because it was processed recently
    DuplicateSkipped {
        serial: String,
        remaining: Duration,
    },
    /// A serial was skipped because another identification is running
    GateBusy {
        serial: String,
        holder: Option<String>,
    },
    /// Identification crashed; the gate was released
    ProcessingFailed { serial: String, reason: String },
    /// The check mode was switched
    ModeChanged(CheckMode),
    /// Frame rotation was switched on or off
    FlipChanged(bool),
    /// Manual entry was opened or closed
    ManualEntry { open: bool },
}
