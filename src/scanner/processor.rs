//! Serial processing shared by the camera and manual entry paths
//!
//! Order of checks for every serial:
//! 1. duplicate peek: recently processed serials are skipped without
//!    touching the processing gate
//! 2. processing gate: skip if another identification is in flight
//! 3. duplicate accept: records the serial, now that it will run
//! 4. identification, then publication to every sink
//!
//! Accepting only after the gate is taken means a serial rejected as busy is
//! not burned and can win the next consensus round.

use crossbeam_channel::Sender;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::duplicate::DuplicateGate;
use super::gate::ProcessingGate;
use crate::capture::FrameBuffer;
use crate::identify::{DeviceRecord, DeviceSink, IdentificationPipeline};
use crate::shared::{ScanSource, SharedScanState, StatusEvent, WorkerEvent};

/// Result of processing one serial
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    /// The pipeline ran and the record was published
    Identified(DeviceRecord),
    /// Processed within the duplicate window
    Duplicate { remaining: Duration },
    /// Another identification holds the gate
    Busy { holder: Option<String> },
    /// Nothing to process
    Invalid,
    /// The pipeline panicked
    Failed(String),
}

impl ProcessOutcome {
    pub fn is_identified(&self) -> bool {
        matches!(self, ProcessOutcome::Identified(_))
    }
}

/// Runs serials through dedup, gating and identification
pub struct SerialProcessor {
    duplicates: DuplicateGate,
    gate: ProcessingGate,
    pipeline: Arc<dyn IdentificationPipeline>,
    sinks: Vec<Arc<dyn DeviceSink>>,
    frames: Arc<FrameBuffer>,
    shared: Arc<SharedScanState>,
    events: Sender<WorkerEvent>,
}

impl SerialProcessor {
    pub fn new(
        duplicate_window: Duration,
        pipeline: Arc<dyn IdentificationPipeline>,
        frames: Arc<FrameBuffer>,
        shared: Arc<SharedScanState>,
        events: Sender<WorkerEvent>,
    ) -> Self {
        Self {
            duplicates: DuplicateGate::new(duplicate_window),
            gate: ProcessingGate::new(),
            pipeline,
            sinks: Vec::new(),
            frames,
            shared,
            events,
        }
    }

    /// Register a sink for identified devices
    pub fn with_sink(mut self, sink: Arc<dyn DeviceSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Whether an identification is in flight
    #[cfg(test)]
    pub fn is_busy(&self) -> bool {
        self.gate.is_busy()
    }

    /// Serials under duplicate suppression
    pub fn duplicates(&self) -> &DuplicateGate {
        &self.duplicates
    }

    /// Process one serial end to end
    pub fn process(&self, serial: &str, source: ScanSource) -> ProcessOutcome {
        if serial.is_empty() {
            return ProcessOutcome::Invalid;
        }
        self.shared.runtime.write().last_serial = Some(serial.to_string());

        if let Some(remaining) = self.duplicates.remaining(serial) {
            return self.skip_duplicate(serial, remaining);
        }

        let Some(_permit) = self.gate.try_enter(serial) else {
            let holder = self.gate.holder();
            debug!("Skipping {}: still processing {:?}", serial, holder);
            self.shared.stats.record_busy();
            self.notify(StatusEvent::GateBusy {
                serial: serial.to_string(),
                holder: holder.clone(),
            });
            return ProcessOutcome::Busy { holder };
        };

        // Another path may have accepted it between the peek and the gate
        if !self.duplicates.accept(serial) {
            let remaining = self.duplicates.remaining(serial).unwrap_or_default();
            return self.skip_duplicate(serial, remaining);
        }

        let flushed = self.frames.clear();
        if flushed > 0 {
            debug!("Flushed {} buffered frames", flushed);
            self.shared.stats.record_dropped(flushed);
        }

        let mode = self.shared.check_mode();
        info!("Processing {} ({:?}, {} check)", serial, source, mode.name());
        self.shared.runtime.write().processing = Some(serial.to_string());

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            self.pipeline.identify(serial, mode)
        }));

        self.shared.runtime.write().processing = None;

        match result {
            Ok(record) => {
                self.publish(&record);
                self.shared.stats.record_identified();
                self.shared.runtime.write().current_device = Some(record.clone());
                debug!("Identified {}", record.summary());
                self.notify(StatusEvent::DeviceIdentified {
                    source,
                    record: record.clone(),
                });
                ProcessOutcome::Identified(record)
            }
            Err(payload) => {
                let reason = panic_message(payload.as_ref());
                error!("Identification of {} panicked: {}", serial, reason);
                self.shared.runtime.write().set_error(format!("{}: {}", serial, reason));
                self.notify(StatusEvent::ProcessingFailed {
                    serial: serial.to_string(),
                    reason: reason.clone(),
                });
                ProcessOutcome::Failed(reason)
            }
        }
    }

    fn skip_duplicate(&self, serial: &str, remaining: Duration) -> ProcessOutcome {
        debug!(
            "Skipping {}: processed recently, {} seconds remaining",
            serial,
            remaining.as_secs()
        );
        self.shared.stats.record_duplicate();
        self.notify(StatusEvent::DuplicateSkipped {
            serial: serial.to_string(),
            remaining,
        });
        ProcessOutcome::Duplicate { remaining }
    }

    fn publish(&self, record: &DeviceRecord) {
        for sink in &self.sinks {
            if let Err(e) = sink.publish(record) {
                warn!("Failed to publish {} to {}: {}", record.serial, sink.name(), e);
            }
        }
    }

    fn notify(&self, event: StatusEvent) {
        // The controller may already be gone during shutdown
        let _ = self.events.send(WorkerEvent::Status(event));
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "identification panicked".to_string()
    }
}
