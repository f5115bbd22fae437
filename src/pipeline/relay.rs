//! Capture loop: source -> pacing -> scaling -> publisher

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{error, info, instrument, warn};

use super::publisher::{PreviewPublisher, PublishOutcome};
use super::scale::PreviewScaler;
use crate::capture::source::FrameSource;
use crate::PreviewConfig;

/// Consecutive source failures tolerated before the loop gives up
const MAX_CONSECUTIVE_ERRORS: u32 = 10;
const ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// Counters for one capture loop run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub captured: u64,
    pub published: u64,
    /// Skipped because they arrived ahead of the preview interval
    pub paced: u64,
    pub stale: u64,
    pub rejected: u64,
    pub source_errors: u64,
}

/// What one [`CaptureLoop::step`] did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Published(PublishOutcome),
    Paced,
    SourceError,
    Finished,
}

/// Pulls frames from a source and hands the preview copies to the publisher.
///
/// The publisher is never asked to wait: pacing and scaling happen here,
/// on the capture thread, before `publish`.
pub struct CaptureLoop<S> {
    source: S,
    scaler: PreviewScaler,
    publisher: PreviewPublisher,
    interval: Duration,
    last_published: Option<Instant>,
    consecutive_errors: u32,
    stats: LoopStats,
}

impl<S: FrameSource> CaptureLoop<S> {
    /// Preview settings are read once here; rebuild the loop to change them
    pub fn new(source: S, publisher: PreviewPublisher, config: &PreviewConfig) -> Self {
        Self {
            source,
            scaler: PreviewScaler::new(config.quality),
            publisher,
            interval: Duration::from_secs(1) / config.fps.max(1),
            last_published: None,
            consecutive_errors: 0,
            stats: LoopStats::default(),
        }
    }

    pub fn stats(&self) -> LoopStats {
        self.stats
    }

    /// Pull and route a single frame
    pub fn step(&mut self) -> Step {
        let frame = match self.source.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => return Step::Finished,
            Err(e) => {
                self.stats.source_errors += 1;
                self.consecutive_errors += 1;
                error!("Capture error: {}", e);
                return Step::SourceError;
            }
        };
        self.consecutive_errors = 0;
        self.stats.captured += 1;

        // Accept frames up to a quarter interval early to absorb source jitter
        if let Some(last) = self.last_published {
            let elapsed = frame.timestamp.saturating_duration_since(last);
            if elapsed + self.interval / 4 < self.interval {
                self.stats.paced += 1;
                return Step::Paced;
            }
        }

        let timestamp = frame.timestamp;
        // Malformed frames go to the publisher unchanged so they are counted there
        let prepared = self.scaler.prepare(frame.clone()).unwrap_or(frame);

        let outcome = self.publisher.publish(prepared);
        match &outcome {
            PublishOutcome::Delivered { .. } => {
                self.stats.published += 1;
                self.last_published = Some(timestamp);
            }
            PublishOutcome::Stale { .. } => self.stats.stale += 1,
            PublishOutcome::Rejected(_) => self.stats.rejected += 1,
        }

        Step::Published(outcome)
    }

    /// Run until the source ends, `shutdown` is set, or the source keeps failing
    #[instrument(skip_all)]
    pub fn run(mut self, shutdown: &AtomicBool) -> LoopStats {
        info!(interval_ms = self.interval.as_millis() as u64, "Capture loop started");

        while !shutdown.load(Ordering::Acquire) {
            match self.step() {
                Step::Finished => break,
                Step::SourceError => {
                    if self.consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                        warn!(
                            errors = self.consecutive_errors,
                            "Capture source keeps failing, stopping"
                        );
                        break;
                    }
                    thread::sleep(ERROR_BACKOFF);
                }
                Step::Published(_) | Step::Paced => {}
            }
        }

        info!(
            captured = self.stats.captured,
            published = self.stats.published,
            paced = self.stats.paced,
            rejected = self.stats.rejected,
            "Capture loop stopped"
        );
        self.stats
    }
}

impl<S: FrameSource + 'static> CaptureLoop<S> {
    /// Run on a dedicated thread
    pub fn spawn(self, shutdown: Arc<AtomicBool>) -> std::io::Result<JoinHandle<LoopStats>> {
        thread::Builder::new()
            .name("capture".into())
            .spawn(move || self.run(&shutdown))
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use color_eyre::{eyre::eyre, Result};

    use super::*;
    use crate::capture::source::TestPattern;
    use crate::{Frame, PixelFormat, QualityTier};

    fn preview(fps: u32, quality: QualityTier) -> PreviewConfig {
        PreviewConfig {
            fps,
            quality,
            width: 800,
            height: 450,
        }
    }

    /// Replays a fixed script of results
    struct Scripted(Vec<Result<Option<Frame>>>);

    impl FrameSource for Scripted {
        fn next_frame(&mut self) -> Result<Option<Frame>> {
            if self.0.is_empty() {
                Ok(None)
            } else {
                self.0.remove(0)
            }
        }
    }

    fn rgb(sequence: u64) -> Frame {
        Frame::new(sequence, 4, 4, PixelFormat::Rgb24, Bytes::from(vec![5u8; 48]))
    }

    #[test]
    fn test_loop_runs_source_to_end() {
        let publisher = PreviewPublisher::new();
        let sub = publisher.subscribe();
        let source = TestPattern::new(8, 8, 1000).unpaced().with_limit(5);

        let looped = CaptureLoop::new(source, publisher, &preview(1_000_000, QualityTier::Medium));
        let stats = looped.run(&AtomicBool::new(false));

        assert_eq!(stats.captured, 5);
        assert_eq!(stats.published + stats.paced, 5);
        let latest = sub.try_take().unwrap();
        assert_eq!((latest.meta.width, latest.meta.height), (4, 4));
    }

    #[test]
    fn test_pacing_skips_early_frames() {
        let publisher = PreviewPublisher::new();
        let sub = publisher.subscribe();
        let source = Scripted(vec![Ok(Some(rgb(1))), Ok(Some(rgb(2))), Ok(Some(rgb(3)))]);

        let mut looped = CaptureLoop::new(source, publisher, &preview(1, QualityTier::High));
        assert!(matches!(looped.step(), Step::Published(PublishOutcome::Delivered { .. })));
        assert_eq!(looped.step(), Step::Paced);
        assert_eq!(looped.step(), Step::Paced);
        assert_eq!(looped.step(), Step::Finished);

        assert_eq!(sub.try_take().unwrap().sequence(), 1);
        assert_eq!(looped.stats().paced, 2);
    }

    #[test]
    fn test_malformed_counted_by_publisher() {
        let publisher = PreviewPublisher::new();
        let handle = publisher.handle();
        let empty = Frame::new(1, 4, 4, PixelFormat::Rgb24, Bytes::new());
        let huge = Frame::new(2, 0x8000_0000, 1, PixelFormat::Bgra32, Bytes::from(vec![0u8; 4]));
        let source = Scripted(vec![Ok(Some(empty)), Ok(Some(huge)), Ok(Some(rgb(3)))]);

        let looped = CaptureLoop::new(source, publisher, &preview(1_000_000, QualityTier::High));
        let stats = looped.run(&AtomicBool::new(false));

        assert_eq!(stats.rejected, 2);
        assert_eq!(stats.published, 1);
        assert_eq!(handle.stats().rejected, 2);
    }

    #[test]
    fn test_source_errors_are_not_fatal() {
        let publisher = PreviewPublisher::new();
        let source = Scripted(vec![Err(eyre!("device busy")), Ok(Some(rgb(1)))]);

        let looped = CaptureLoop::new(source, publisher, &preview(30, QualityTier::High));
        let stats = looped.run(&AtomicBool::new(false));

        assert_eq!(stats.source_errors, 1);
        assert_eq!(stats.published, 1);
    }

    #[test]
    fn test_persistent_errors_stop_loop() {
        let publisher = PreviewPublisher::new();
        let script = (0..MAX_CONSECUTIVE_ERRORS + 5)
            .map(|_| Err(eyre!("gone")))
            .collect();

        let looped = CaptureLoop::new(Scripted(script), publisher, &preview(30, QualityTier::High));
        let stats = looped.run(&AtomicBool::new(false));

        assert_eq!(stats.source_errors, MAX_CONSECUTIVE_ERRORS as u64);
    }

    #[test]
    fn test_spawned_loop_honours_shutdown() {
        let publisher = PreviewPublisher::new();
        let handle = publisher.handle();
        let shutdown = Arc::new(AtomicBool::new(false));
        let source = TestPattern::new(4, 4, 200);

        let capture = CaptureLoop::new(source, publisher, &preview(200, QualityTier::Low))
            .spawn(Arc::clone(&shutdown))
            .unwrap();

        thread::sleep(Duration::from_millis(50));
        shutdown.store(true, Ordering::Release);
        let stats = capture.join().unwrap();

        assert!(stats.captured > 0);
        assert_eq!(handle.stats().published, stats.published);
    }
}
