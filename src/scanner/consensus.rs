//! Plurality-vote consensus over noisy per-frame serial reads
//!
//! Candidates from consecutive frames are pooled into a window. A verdict
//! fires once the window holds `threshold` candidates or once `timeout` has
//! elapsed since the window opened. The window opens when the previous verdict
//! fires, not when a candidate arrives, so the worst-case delay between the
//! first read and a decision is bounded by `timeout`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Outcome of asking the accumulator for a decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Neither trigger has been reached; the window is untouched
    Pending,
    /// A serial won the vote
    Winner {
        serial: String,
        votes: usize,
        window_len: usize,
    },
    /// The window timed out empty or without a clear plurality
    Inconclusive { window_len: usize },
}

#[cfg(test)]
impl Verdict {
    /// Whether this verdict closed the window
    pub fn fired(&self) -> bool {
        !matches!(self, Verdict::Pending)
    }

    /// The winning serial, if any
    pub fn winner(&self) -> Option<&str> {
        match self {
            Verdict::Winner { serial, .. } => Some(serial),
            _ => None,
        }
    }
}

/// Rolling window of serial candidates
#[derive(Debug)]
pub struct ConsensusAccumulator {
    window: Vec<String>,
    window_start: Instant,
    threshold: usize,
    timeout: Duration,
}

impl ConsensusAccumulator {
    /// Create an accumulator deciding after `threshold` candidates or `timeout`
    pub fn new(threshold: usize, timeout: Duration) -> Self {
        Self::new_at(threshold, timeout, Instant::now())
    }

    /// Create an accumulator whose first window opens at `now`
    pub fn new_at(threshold: usize, timeout: Duration, now: Instant) -> Self {
        Self {
            window: Vec::new(),
            window_start: now,
            threshold: threshold.max(1),
            timeout,
        }
    }

    /// Add candidates to the current window. An empty batch changes nothing.
    pub fn accumulate<I>(&mut self, candidates: I)
    where
        I: IntoIterator<Item = String>,
    {
        self.window.extend(candidates);
    }

    /// Decide against the current time
    pub fn decide(&mut self) -> Verdict {
        self.decide_at(Instant::now())
    }

    /// Decide as if the current time were `now`
    pub fn decide_at(&mut self, now: Instant) -> Verdict {
        let by_count = self.window.len() >= self.threshold;
        let by_time = now.saturating_duration_since(self.window_start) >= self.timeout;

        if !by_count && !by_time {
            return Verdict::Pending;
        }

        let window_len = self.window.len();
        let verdict = match plurality(&self.window) {
            Some((serial, votes)) if by_count => Verdict::Winner {
                serial,
                votes,
                window_len,
            },
            Some((serial, votes)) if !all_tied(&self.window) => Verdict::Winner {
                serial,
                votes,
                window_len,
            },
            _ => Verdict::Inconclusive { window_len },
        };

        self.window.clear();
        self.window_start = now;
        verdict
    }

    /// Drop the current window and open a new one at `now`
    pub fn reset_at(&mut self, now: Instant) {
        self.window.clear();
        self.window_start = now;
    }
}

#[cfg(test)]
impl ConsensusAccumulator {
    /// Number of candidates in the current window
    pub fn len(&self) -> usize {
        self.window.len()
    }

    /// Whether the current window is empty
    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    /// When the current window opened
    pub fn window_start(&self) -> Instant {
        self.window_start
    }
}

/// Most frequent candidate, ties going to whichever appeared first
fn plurality(window: &[String]) -> Option<(String, usize)> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for candidate in window {
        *counts.entry(candidate.as_str()).or_insert(0) += 1;
    }

    let mut best: Option<(&str, usize)> = None;
    for candidate in window {
        let count = counts[candidate.as_str()];
        // Strictly greater keeps the earliest-seen candidate on ties
        if best.map(|(_, c)| count > c).unwrap_or(true) {
            best = Some((candidate.as_str(), count));
        }
    }

    best.map(|(serial, votes)| (serial.to_string(), votes))
}

/// Two or more distinct candidates, all with the same count
fn all_tied(window: &[String]) -> bool {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for candidate in window {
        *counts.entry(candidate.as_str()).or_insert(0) += 1;
    }

    let mut values = counts.values();
    match values.next() {
        Some(first) => counts.len() > 1 && values.all(|c| c == first),
        None => false,
    }
}
