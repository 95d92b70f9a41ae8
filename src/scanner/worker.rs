//! Capture and consensus worker loops
//!
//! Each scan run owns one capture thread and one consensus thread sharing a
//! [`CancelToken`]. Both loops check the token every iteration; the consensus
//! side never blocks longer than its pop timeout, so it notices cancellation
//! within that bound.

use crossbeam_channel::Sender;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

use super::consensus::{ConsensusAccumulator, Verdict};
use super::processor::SerialProcessor;
use crate::capture::{CaptureTransform, FrameBuffer, SourceProvider};
use crate::config::ScannerSettings;
use crate::error::ScanError;
use crate::shared::{ScanSource, SharedScanState, StatusEvent, WorkerEvent};
use crate::vision::{filter_confident, SerialExtractor, TextRecognizer};

/// Cooperative cancellation flag shared by the workers of one run
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Everything a worker of one run needs besides its collaborator
#[derive(Clone)]
pub struct WorkerContext {
    /// Run this worker belongs to
    pub run_id: u64,
    pub cancel: CancelToken,
    pub frames: Arc<FrameBuffer>,
    pub shared: Arc<SharedScanState>,
    pub events: Sender<WorkerEvent>,
}

impl WorkerContext {
    /// Tell the controller why the run is over, then stop its other worker.
    /// The workers never change the run state themselves.
    fn report_camera_failure(&self, error: &ScanError) {
        warn!("Run {}: {}", self.run_id, error);
        // Reported before cancelling, so the report is queued by the time
        // either worker has exited
        let _ = self.events.send(WorkerEvent::CameraUnavailable {
            run_id: self.run_id,
            reason: error.to_string(),
        });
        self.cancel.cancel();
    }
}

/// Capture loop: read frames, transform them, push into the buffer
pub fn run_capture(ctx: WorkerContext, provider: Arc<dyn SourceProvider>, mut transform: CaptureTransform) {
    info!("Capture worker {} starting on {}", ctx.run_id, provider.describe());

    let mut source = match provider.open() {
        Ok(source) => source,
        Err(e) => {
            ctx.report_camera_failure(&e);
            return;
        }
    };

    while !ctx.cancel.is_cancelled() {
        let mut frame = match source.next_frame() {
            Ok(frame) => frame,
            Err(e) if e.is_fatal() => {
                ctx.report_camera_failure(&e);
                break;
            }
            Err(e) => {
                debug!("Skipping unreadable frame: {}", e);
                continue;
            }
        };

        // The operator may switch rotation while the run is live
        transform.flip = ctx.shared.flip();
        if !transform.is_identity() {
            let image = std::mem::take(&mut frame.image);
            frame = frame.with_image(transform.apply(image));
        }

        let evicted = ctx.frames.push(frame);
        ctx.shared.stats.record_captured(evicted);
        if evicted > 0 {
            trace!("Buffer full, dropped {} old frame(s)", evicted);
        }
    }

    info!("Capture worker {} exiting", ctx.run_id);
}

/// Consensus loop: recognize frames, vote on serials, hand winners to the processor
pub fn run_consensus(
    ctx: WorkerContext,
    recognizer: Arc<dyn TextRecognizer>,
    processor: Arc<SerialProcessor>,
    settings: ScannerSettings,
) {
    info!("Consensus worker {} starting", ctx.run_id);

    let extractor = SerialExtractor::new();
    let mut accumulator =
        ConsensusAccumulator::new(settings.consensus_threshold, settings.consensus_timeout());
    let pop_timeout = settings.pop_timeout();

    while !ctx.cancel.is_cancelled() {
        if let Some(frame) = ctx.frames.pop(pop_timeout) {
            ctx.shared.stats.record_processed();
            match recognizer.recognize(&frame) {
                Ok(texts) => {
                    let serials: Vec<String> = filter_confident(texts, settings.min_confidence)
                        .iter()
                        .flat_map(|c| extractor.extract(&c.text))
                        .collect();
                    if !serials.is_empty() {
                        trace!(
                            "Frame {} ({:?} old): {:?}",
                            frame.sequence,
                            frame.timestamp.elapsed(),
                            serials
                        );
                    }
                    accumulator.accumulate(serials);
                }
                Err(e) => {
                    debug!("Frame {}: {}", frame.sequence, e);
                    ctx.shared.stats.record_ocr_failure();
                }
            }
        }

        // A stopped run must not start new identifications
        if ctx.cancel.is_cancelled() {
            break;
        }

        match accumulator.decide() {
            Verdict::Winner {
                serial,
                votes,
                window_len,
            } => {
                info!("Decided serial: {} ({}/{} votes)", serial, votes, window_len);
                ctx.shared.stats.record_decision();
                let _ = ctx.events.send(WorkerEvent::Status(StatusEvent::SerialDecided {
                    serial: serial.clone(),
                    votes,
                    window_len,
                }));
                processor.process(&serial, ScanSource::Camera);
                // Identification can outlast the timeout; the next vote starts
                // when it returns, not when the previous window closed
                accumulator.reset_at(Instant::now());
            }
            Verdict::Inconclusive { window_len } if window_len > 0 => {
                debug!("No clear serial among {} candidates", window_len);
                ctx.shared.stats.record_inconclusive();
            }
            _ => {}
        }
    }

    info!("Consensus worker {} exiting", ctx.run_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identify::CheckMode;
    use crate::scanner::processor::ProcessOutcome;
    use crate::testing::{RecordingPipeline, ScriptedRecognizer, SequencedRecognizer, SyntheticProvider};
    use crate::vision::CandidateText;
    use crossbeam_channel::{unbounded, Receiver};
    use std::time::{Duration, Instant};

    fn context(run_id: u64) -> (WorkerContext, Receiver<WorkerEvent>) {
        let (tx, rx) = unbounded();
        let ctx = WorkerContext {
            run_id,
            cancel: CancelToken::new(),
            frames: Arc::new(FrameBuffer::new(10)),
            shared: Arc::new(SharedScanState::new(CheckMode::Basic)),
            events: tx,
        };
        (ctx, rx)
    }

    fn fast_settings() -> ScannerSettings {
        ScannerSettings {
            consensus_threshold: 3,
            consensus_timeout_ms: 500,
            pop_timeout_ms: 20,
            ..ScannerSettings::default()
        }
    }

    #[test]
    fn test_cancel_token() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn test_capture_reports_open_failure() {
        let (ctx, rx) = context(7);
        let provider = Arc::new(SyntheticProvider::unavailable());

        run_capture(ctx.clone(), provider, CaptureTransform::default());

        assert!(ctx.cancel.is_cancelled());
        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], WorkerEvent::CameraUnavailable { run_id: 7, .. }));
    }

    #[test]
    fn test_capture_reports_mid_run_failure() {
        let (ctx, rx) = context(3);
        let provider = Arc::new(SyntheticProvider::new(Duration::from_millis(1)).failing_after(4));

        run_capture(ctx.clone(), provider, CaptureTransform::default());

        assert_eq!(ctx.shared.stats.snapshot().frames_captured, 4);
        assert_eq!(ctx.frames.len(), 4);
        assert!(matches!(
            rx.try_recv(),
            Ok(WorkerEvent::CameraUnavailable { run_id: 3, .. })
        ));
    }

    #[test]
    fn test_capture_stops_on_cancel() {
        let (ctx, rx) = context(1);
        let provider = Arc::new(SyntheticProvider::new(Duration::from_millis(5)));

        let worker_ctx = ctx.clone();
        let handle = std::thread::spawn(move || {
            run_capture(worker_ctx, provider, CaptureTransform::default())
        });

        std::thread::sleep(Duration::from_millis(50));
        ctx.cancel.cancel();
        handle.join().unwrap();

        assert!(ctx.shared.stats.snapshot().frames_captured > 0);
        // Capacity is respected under sustained capture
        assert!(ctx.frames.len() <= 10);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_consensus_decides_and_processes() {
        let (ctx, rx) = context(1);
        let pipeline = Arc::new(RecordingPipeline::default());
        let processor = Arc::new(SerialProcessor::new(
            Duration::from_secs(120),
            pipeline.clone(),
            ctx.frames.clone(),
            ctx.shared.clone(),
            ctx.events.clone(),
        ));
        let recognizer = Arc::new(ScriptedRecognizer::new(vec![
            CandidateText::new("SERIAL C02XG2JHJGH5", 0.9),
            CandidateText::new("C02XG2JHJGH6", 0.2),
        ]));

        for seq in 0..3 {
            ctx.frames.push(crate::capture::CapturedFrame::new(image::RgbaImage::new(4, 4), seq));
        }

        let worker_ctx = ctx.clone();
        let handle = std::thread::spawn(move || {
            run_consensus(worker_ctx, recognizer, processor, fast_settings())
        });

        let deadline = Instant::now() + Duration::from_secs(2);
        while pipeline.calls().is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        ctx.cancel.cancel();
        handle.join().unwrap();

        // The low-confidence read never reaches the vote
        assert_eq!(pipeline.calls(), vec!["C02XG2JHJGH5".to_string()]);
        let events: Vec<_> = rx.try_iter().collect();
        assert!(events.iter().any(|e| matches!(
            e,
            WorkerEvent::Status(StatusEvent::SerialDecided { serial, votes: 3, .. }) if serial == "C02XG2JHJGH5"
        )));
    }

    #[test]
    fn test_consensus_exits_within_pop_timeout() {
        let (ctx, _rx) = context(1);
        let processor = Arc::new(SerialProcessor::new(
            Duration::from_secs(120),
            Arc::new(RecordingPipeline::default()),
            ctx.frames.clone(),
            ctx.shared.clone(),
            ctx.events.clone(),
        ));
        let recognizer = Arc::new(ScriptedRecognizer::blank());

        let worker_ctx = ctx.clone();
        let handle = std::thread::spawn(move || {
            run_consensus(worker_ctx, recognizer, processor, fast_settings())
        });

        // Empty buffer: the worker sits in pop
        std::thread::sleep(Duration::from_millis(50));
        let cancelled_at = Instant::now();
        ctx.cancel.cancel();
        handle.join().unwrap();

        assert!(cancelled_at.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn test_winner_after_cancel_is_not_processed() {
        let (ctx, _rx) = context(1);
        let pipeline = Arc::new(RecordingPipeline::default());
        let processor = Arc::new(SerialProcessor::new(
            Duration::from_secs(120),
            pipeline.clone(),
            ctx.frames.clone(),
            ctx.shared.clone(),
            ctx.events.clone(),
        ));
        let recognizer = Arc::new(ScriptedRecognizer::new(vec![CandidateText::new(
            "C02XG2JHJGH5",
            0.9,
        )]));

        for seq in 0..3 {
            ctx.frames.push(crate::capture::CapturedFrame::new(image::RgbaImage::new(4, 4), seq));
        }
        ctx.cancel.cancel();
        run_consensus(ctx.clone(), recognizer, processor.clone(), fast_settings());

        assert!(pipeline.calls().is_empty());
        assert_eq!(
            processor.process("C02XG2JHJGH5", ScanSource::Manual),
            ProcessOutcome::Identified(crate::identify::DeviceRecord {
                model_name: Some("Test Model".to_string()),
                ..crate::identify::DeviceRecord::new("C02XG2JHJGH5")
            })
        );
    }

    #[test]
    fn test_vote_after_slow_identification_gets_a_full_window() {
        let (ctx, _rx) = context(1);
        let pipeline = Arc::new(RecordingPipeline::with_delay(Duration::from_millis(400)));
        let processor = Arc::new(SerialProcessor::new(
            Duration::from_secs(120),
            pipeline.clone(),
            ctx.frames.clone(),
            ctx.shared.clone(),
            ctx.events.clone(),
        ));
        // Frame 3 is a misread; frames 4..6 are the next label
        let recognizer = Arc::new(SequencedRecognizer::new(vec![
            (0, "AB12CD34EF"),
            (1, "AB12CD34EF"),
            (2, "AB12CD34EF"),
            (3, "XY99ZZ11AA"),
            (4, "CD34EF56GH"),
            (5, "CD34EF56GH"),
            (6, "CD34EF56GH"),
        ]));
        let settings = ScannerSettings {
            consensus_timeout_ms: 200,
            ..fast_settings()
        };

        for seq in 0..3 {
            ctx.frames.push(crate::capture::CapturedFrame::new(image::RgbaImage::new(4, 4), seq));
        }

        let worker_ctx = ctx.clone();
        let handle = std::thread::spawn(move || {
            run_consensus(worker_ctx, recognizer, processor, settings)
        });

        // Frames read while the first device is still being identified
        let deadline = Instant::now() + Duration::from_secs(2);
        while pipeline.calls().is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        std::thread::sleep(Duration::from_millis(50));
        for seq in 3..7 {
            ctx.frames.push(crate::capture::CapturedFrame::new(image::RgbaImage::new(4, 4), seq));
        }

        let deadline = Instant::now() + Duration::from_secs(3);
        while pipeline.calls().len() < 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        ctx.cancel.cancel();
        handle.join().unwrap();

        // The lone misread never decides a vote on its own
        assert_eq!(
            pipeline.calls(),
            vec!["AB12CD34EF".to_string(), "CD34EF56GH".to_string()]
        );
    }

    /// Frames with a single red pixel in the top-left corner
    struct MarkedProvider;

    struct MarkedSource {
        sequence: u64,
    }

    impl crate::capture::FrameSource for MarkedSource {
        fn next_frame(&mut self) -> Result<crate::capture::CapturedFrame, ScanError> {
            if self.sequence >= 2 {
                return Err(ScanError::CameraUnavailable("end of marked frames".into()));
            }
            let mut image = image::RgbaImage::new(4, 4);
            image.put_pixel(0, 0, image::Rgba([255, 0, 0, 255]));
            self.sequence += 1;
            Ok(crate::capture::CapturedFrame::new(image, self.sequence))
        }
    }

    impl SourceProvider for MarkedProvider {
        fn open(&self) -> Result<Box<dyn crate::capture::FrameSource>, ScanError> {
            Ok(Box::new(MarkedSource { sequence: 0 }))
        }

        fn describe(&self) -> String {
            "marked frames".to_string()
        }
    }

    fn red_corner(ctx: &WorkerContext) -> Option<(u32, u32)> {
        let frame = ctx.frames.pop(Duration::from_millis(10))?;
        frame
            .image
            .enumerate_pixels()
            .find(|(_, _, p)| p.0 == [255, 0, 0, 255])
            .map(|(x, y, _)| (x, y))
    }

    #[test]
    fn test_capture_follows_runtime_flip() {
        let (ctx, _rx) = context(1);
        let transform = CaptureTransform {
            flip: false,
            ..CaptureTransform::default()
        };

        ctx.shared.set_flip(true);
        run_capture(ctx.clone(), Arc::new(MarkedProvider), transform.clone());
        assert_eq!(red_corner(&ctx), Some((3, 3)));

        // Rotation switched off by the operator
        let (ctx2, _rx2) = context(2);
        ctx2.shared.set_flip(true);
        assert!(!ctx2.shared.toggle_flip());
        run_capture(ctx2.clone(), Arc::new(MarkedProvider), transform);
        assert_eq!(red_corner(&ctx2), Some((0, 0)));
    }
}
