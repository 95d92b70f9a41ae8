//! Single-flight gate around device identification
//!
//! Identification does network and file I/O and replaces the "current device"
//! shown to the operator, so two runs must never overlap. Callers that find
//! the gate taken skip their serial instead of queueing behind it.

use parking_lot::{Mutex, MutexGuard, RwLock};

/// Non-blocking single-slot lock
#[derive(Debug, Default)]
pub struct ProcessingGate {
    slot: Mutex<()>,
    holder: RwLock<Option<String>>,
}

/// Proof of holding the gate. Dropping it releases the gate, on every exit
/// path including unwinding.
#[must_use = "the gate is released as soon as the permit is dropped"]
pub struct ProcessingPermit<'a> {
    gate: &'a ProcessingGate,
    _slot: MutexGuard<'a, ()>,
}

impl ProcessingGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to take the gate for `serial` without waiting
    pub fn try_enter(&self, serial: &str) -> Option<ProcessingPermit<'_>> {
        let slot = self.slot.try_lock()?;
        *self.holder.write() = Some(serial.to_string());
        Some(ProcessingPermit {
            gate: self,
            _slot: slot,
        })
    }

    /// Whether an identification run is in progress
    #[cfg(test)]
    pub fn is_busy(&self) -> bool {
        self.slot.is_locked()
    }

    /// Serial currently being processed, if any
    pub fn holder(&self) -> Option<String> {
        self.holder.read().clone()
    }
}


impl Drop for ProcessingPermit<'_> {
    fn drop(&mut self) {
        // Runs before `_slot` is dropped, so the holder is cleared while the
        // slot is still ours
        *self.gate.holder.write() = None;
    }
}
