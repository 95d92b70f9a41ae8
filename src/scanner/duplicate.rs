//! Time-windowed duplicate suppression
//!
//! A serial accepted once is rejected for `window` afterwards. Rejections do
//! not refresh the timestamp, so a device left in front of the camera becomes
//! eligible again exactly `window` after its first acceptance.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// Entries are swept once the map grows past this many serials
const SWEEP_THRESHOLD: usize = 1_024;

/// Rejects serials accepted within the cooldown window
#[derive(Debug)]
pub struct DuplicateGate {
    accepted: Mutex<HashMap<String, Instant>>,
    window: Duration,
}

impl DuplicateGate {
    /// Create a gate with the given cooldown window
    pub fn new(window: Duration) -> Self {
        Self {
            accepted: Mutex::new(HashMap::new()),
            window,
        }
    }

    /// The cooldown window
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Accept `serial` unless it was accepted within the window
    pub fn accept(&self, serial: &str) -> bool {
        self.accept_at(serial, Instant::now())
    }

    /// Accept `serial` as if the current time were `now`
    pub fn accept_at(&self, serial: &str, now: Instant) -> bool {
        let mut accepted = self.accepted.lock();

        if let Some(last) = accepted.get(serial) {
            if now.saturating_duration_since(*last) < self.window {
                return false;
            }
        }

        if accepted.len() >= SWEEP_THRESHOLD {
            let window = self.window;
            let before = accepted.len();
            accepted.retain(|_, last| now.saturating_duration_since(*last) < window);
            debug!("Swept {} expired duplicate entries", before - accepted.len());
        }

        accepted.insert(serial.to_string(), now);
        true
    }

    /// Cooldown left for `serial`, or `None` if it would be accepted now
    pub fn remaining(&self, serial: &str) -> Option<Duration> {
        self.remaining_at(serial, Instant::now())
    }

    /// Cooldown left for `serial` at `now`
    pub fn remaining_at(&self, serial: &str, now: Instant) -> Option<Duration> {
        let accepted = self.accepted.lock();
        let last = accepted.get(serial)?;
        let elapsed = now.saturating_duration_since(*last);
        (elapsed < self.window).then(|| self.window - elapsed)
    }

    /// Number of serials currently remembered (including expired ones not yet swept)
    pub fn tracked_count(&self) -> usize {
        self.accepted.lock().len()
    }
}
