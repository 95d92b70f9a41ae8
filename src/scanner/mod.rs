//! Scanning Core
//!
//! Consensus voting, duplicate suppression, the single-flight processing
//! gate and the worker loops that tie them to the frame buffer.

pub mod consensus;
pub mod duplicate;
pub mod gate;
pub mod processor;
pub mod worker;

pub use processor::{ProcessOutcome, SerialProcessor};
pub use worker::{run_capture, run_consensus, CancelToken, WorkerContext};
