//! Bounded frame buffer with drop-oldest backpressure
//!
//! The capture side runs at the camera's rate and must never stall on a slow
//! consumer, so a push into a full buffer evicts the oldest frame instead of
//! blocking. The consumer waits for at most a bounded timeout, which is what
//! keeps the consensus worker responsive to cancellation.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::time::Duration;

use super::frame::CapturedFrame;

/// Single-producer / single-consumer frame queue holding at most `capacity` frames
pub struct FrameBuffer {
    sender: Sender<CapturedFrame>,
    receiver: Receiver<CapturedFrame>,
    capacity: usize,
}

impl FrameBuffer {
    /// Create a buffer holding at most `capacity` frames (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, receiver) = bounded(capacity);
        Self {
            sender,
            receiver,
            capacity,
        }
    }

    /// Enqueue a frame without blocking.
    ///
    /// Returns the number of older frames evicted to make room.
    pub fn push(&self, frame: CapturedFrame) -> usize {
        let mut frame = frame;
        let mut evicted = 0;

        loop {
            match self.sender.try_send(frame) {
                Ok(()) => return evicted,
                Err(TrySendError::Full(returned)) => {
                    frame = returned;
                    // The consumer may win the race for the oldest frame, in
                    // which case there is room on the next attempt anyway.
                    if self.receiver.try_recv().is_ok() {
                        evicted += 1;
                    }
                }
                // Both ends live in `self`, so this cannot happen while we exist
                Err(TrySendError::Disconnected(_)) => return evicted,
            }
        }
    }

    /// Wait up to `timeout` for the oldest frame. `None` means nothing arrived.
    pub fn pop(&self, timeout: Duration) -> Option<CapturedFrame> {
        self.receiver.recv_timeout(timeout).ok()
    }

    /// Take the oldest frame if one is queued
    #[cfg(test)]
    pub fn try_pop(&self) -> Option<CapturedFrame> {
        self.receiver.try_recv().ok()
    }

    /// Discard every queued frame, returning how many were dropped
    pub fn clear(&self) -> usize {
        self.receiver.try_iter().count()
    }

    /// Number of queued frames
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    /// Whether no frames are queued
    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    /// Maximum number of queued frames
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbaImage;
    use std::sync::Arc;
    use std::time::Instant;

    fn frame(sequence: u64) -> CapturedFrame {
        CapturedFrame::new(RgbaImage::new(2, 2), sequence)
    }

    #[test]
    fn test_push_beyond_capacity_never_exceeds_capacity() {
        let buffer = FrameBuffer::new(3);

        for seq in 0..20 {
            buffer.push(frame(seq));
            assert!(buffer.len() <= buffer.capacity());
        }

        assert_eq!(buffer.len(), 3);
    }

    #[test]
    fn test_push_evicts_oldest_first() {
        let buffer = FrameBuffer::new(2);

        assert_eq!(buffer.push(frame(1)), 0);
        assert_eq!(buffer.push(frame(2)), 0);
        assert_eq!(buffer.push(frame(3)), 1);

        let remaining: Vec<u64> = std::iter::from_fn(|| buffer.try_pop())
            .map(|f| f.sequence)
            .collect();
        assert_eq!(remaining, vec![2, 3]);
    }

    #[test]
    fn test_most_recent_frame_is_always_retrievable() {
        let buffer = FrameBuffer::new(4);

        for seq in 0..57 {
            buffer.push(frame(seq));
            let last = std::iter::from_fn(|| buffer.try_pop()).last();
            assert_eq!(last.map(|f| f.sequence), Some(seq));
        }
    }

    #[test]
    fn test_pop_preserves_fifo_order() {
        let buffer = FrameBuffer::new(5);
        for seq in 0..5 {
            buffer.push(frame(seq));
        }

        for expected in 0..5 {
            let popped = buffer.pop(Duration::from_millis(10)).unwrap();
            assert_eq!(popped.sequence, expected);
        }
    }

    #[test]
    fn test_pop_times_out_on_empty_buffer() {
        let buffer = FrameBuffer::new(2);

        let start = Instant::now();
        let result = buffer.pop(Duration::from_millis(30));

        assert!(result.is_none());
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_blocked_pop_wakes_on_push() {
        let buffer = Arc::new(FrameBuffer::new(2));
        let producer = buffer.clone();

        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            producer.push(frame(42));
        });

        let popped = buffer.pop(Duration::from_secs(5));
        handle.join().unwrap();

        assert_eq!(popped.map(|f| f.sequence), Some(42));
    }

    #[test]
    fn test_clear_drains_everything() {
        let buffer = FrameBuffer::new(4);
        for seq in 0..3 {
            buffer.push(frame(seq));
        }

        assert_eq!(buffer.clear(), 3);
        assert!(buffer.is_empty());
        assert!(buffer.try_pop().is_none());
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let buffer = FrameBuffer::new(0);
        assert_eq!(buffer.capacity(), 1);

        buffer.push(frame(1));
        buffer.push(frame(2));
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.try_pop().map(|f| f.sequence), Some(2));
    }

    #[test]
    fn test_concurrent_producer_consumer_respects_capacity() {
        let buffer = Arc::new(FrameBuffer::new(3));
        let producer = buffer.clone();

        let handle = std::thread::spawn(move || {
            for seq in 0..500 {
                producer.push(frame(seq));
                assert!(producer.len() <= 3);
            }
        });

        let mut last_seen = None;
        while !handle.is_finished() || !buffer.is_empty() {
            if let Some(f) = buffer.pop(Duration::from_millis(5)) {
                // FIFO subject to eviction: sequence numbers only increase
                if let Some(prev) = last_seen {
                    assert!(f.sequence > prev);
                }
                last_seen = Some(f.sequence);
            }
        }
        handle.join().unwrap();

        assert_eq!(last_seen, Some(499));
    }
}
