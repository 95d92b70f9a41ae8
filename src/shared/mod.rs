//! Shared state and messaging between the control loop and the scan workers
//!
//! This module provides thread-safe shared state and message passing
//! for communication between the controller and its worker threads.

pub mod messages;
pub mod state;

pub use messages::{ScanSource, StatusEvent, WorkerEvent};
pub use state::{RunState, SharedScanState, StatsSnapshot};
