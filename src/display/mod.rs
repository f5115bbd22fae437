//! Preview renderers.
//!
//! A renderer is anything implementing [`PreviewSink`]. [`RenderLoop`] owns a
//! [`Subscription`] and drains it at the preview cadence, so the renderer only
//! ever paints the newest frame and never pushes back on the capture side.

pub mod stats;

#[cfg(feature = "sdl-preview")]
pub mod sdl;

use std::time::{Duration, Instant};

use color_eyre::Result;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::{Frame, PreviewConfig, Subscription};

pub use stats::StatsSink;

#[cfg(feature = "sdl-preview")]
pub use sdl::Sdl2Display;

/// Something that can paint a preview frame
pub trait PreviewSink {
    fn render(&mut self, frame: &Frame) -> Result<()>;
}

impl<T: PreviewSink + ?Sized> PreviewSink for Box<T> {
    fn render(&mut self, frame: &Frame) -> Result<()> {
        (**self).render(frame)
    }
}

/// Totals for one render loop run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenderStats {
    pub rendered: u64,
    pub errors: u64,
    /// Ticks where no new frame was waiting
    pub idle_ticks: u64,
}

/// Polls a subscription and feeds the sink
pub struct RenderLoop<K> {
    subscription: Subscription,
    sink: K,
    interval: Duration,
    stats: RenderStats,
}

impl<K: PreviewSink> RenderLoop<K> {
    pub fn new(subscription: Subscription, sink: K, config: &PreviewConfig) -> Self {
        Self {
            subscription,
            sink,
            interval: Duration::from_secs(1) / config.fps.max(1),
            stats: RenderStats::default(),
        }
    }

    pub fn stats(&self) -> RenderStats {
        self.stats
    }

    pub fn sink(&self) -> &K {
        &self.sink
    }

    /// Render the pending frame, if any. Returns whether something was drawn.
    ///
    /// Sink failures are logged and counted; they never stop the loop.
    pub fn render_pending(&mut self) -> bool {
        let Some(frame) = self.subscription.try_take() else {
            self.stats.idle_ticks += 1;
            return false;
        };

        let latency = frame.timestamp.elapsed();
        metrics::histogram!("preview_frame_latency_ms").record(latency.as_secs_f64() * 1000.0);

        let render_start = Instant::now();
        match self.sink.render(&frame) {
            Ok(()) => {
                self.stats.rendered += 1;
                metrics::histogram!("preview_render_time_us")
                    .record(render_start.elapsed().as_micros() as f64);
                true
            }
            Err(e) => {
                self.stats.errors += 1;
                error!(sequence = frame.sequence(), "Display error: {}", e);
                false
            }
        }
    }

    /// Tick at the preview rate until `shutdown` flips to true or the
    /// subscription is detached
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> RenderStats {
        info!(subscription = %self.subscription.id(), "Render loop started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = ticker.tick() => {
                    self.render_pending();
                    if !self.subscription.is_attached() && !self.subscription.is_pending() {
                        debug!("Subscription detached, leaving render loop");
                        break;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(
            rendered = self.stats.rendered,
            errors = self.stats.errors,
            "Render loop stopped"
        );
        self.stats
    }

    /// Thread-bound variant for renderers that must stay on the calling
    /// thread. `keep_going` is consulted between frames.
    pub fn run_blocking(mut self, mut keep_going: impl FnMut(&mut K) -> bool) -> RenderStats {
        while keep_going(&mut self.sink) {
            match self.subscription.wait_timeout(self.interval) {
                Some(frame) => {
                    if let Err(e) = self.sink.render(&frame) {
                        self.stats.errors += 1;
                        error!(sequence = frame.sequence(), "Display error: {}", e);
                    } else {
                        self.stats.rendered += 1;
                    }
                }
                None if !self.subscription.is_attached() => break,
                None => self.stats.idle_ticks += 1,
            }
        }
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use color_eyre::eyre::eyre;

    use super::*;
    use crate::{PixelFormat, PreviewPublisher, QualityTier};

    #[derive(Default)]
    struct Recorder {
        seen: Vec<u64>,
        fail_on: Option<u64>,
    }

    impl PreviewSink for Recorder {
        fn render(&mut self, frame: &Frame) -> Result<()> {
            if self.fail_on == Some(frame.sequence()) {
                return Err(eyre!("boom"));
            }
            self.seen.push(frame.sequence());
            Ok(())
        }
    }

    fn frame(sequence: u64) -> Frame {
        Frame::new(sequence, 1, 1, PixelFormat::Rgb24, Bytes::from_static(&[1, 2, 3]))
    }

    fn preview(fps: u32) -> PreviewConfig {
        PreviewConfig {
            fps,
            quality: QualityTier::High,
            width: 800,
            height: 450,
        }
    }

    #[test]
    fn test_render_pending_draws_latest_only() {
        let mut publisher = PreviewPublisher::new();
        let mut render = RenderLoop::new(publisher.subscribe(), Recorder::default(), &preview(30));

        assert!(!render.render_pending());
        publisher.publish(frame(1));
        publisher.publish(frame(2));
        assert!(render.render_pending());
        assert!(!render.render_pending());

        assert_eq!(render.sink().seen, vec![2]);
        assert_eq!(render.stats().idle_ticks, 2);
    }

    #[test]
    fn test_sink_errors_are_counted() {
        let mut publisher = PreviewPublisher::new();
        let sink = Recorder {
            fail_on: Some(1),
            ..Default::default()
        };
        let mut render = RenderLoop::new(publisher.subscribe(), sink, &preview(30));

        publisher.publish(frame(1));
        assert!(!render.render_pending());
        publisher.publish(frame(2));
        assert!(render.render_pending());

        assert_eq!(render.stats().errors, 1);
        assert_eq!(render.stats().rendered, 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let mut publisher = PreviewPublisher::new();
        let render = RenderLoop::new(publisher.subscribe(), Recorder::default(), &preview(200));
        let (tx, rx) = watch::channel(false);

        let task = tokio::spawn(render.run(rx));
        publisher.publish(frame(1));
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        let stats = task.await.unwrap();
        assert_eq!(stats.rendered, 1);
    }

    #[tokio::test]
    async fn test_run_stops_when_detached() {
        let publisher = PreviewPublisher::new();
        let subscription = publisher.subscribe();
        let id = subscription.id();
        let render = RenderLoop::new(subscription, Recorder::default(), &preview(200));
        let (_tx, rx) = watch::channel(false);

        let task = tokio::spawn(render.run(rx));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(publisher.unsubscribe(id));

        let stats = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats.rendered, 0);
    }

    #[test]
    fn test_run_blocking() {
        let mut publisher = PreviewPublisher::new();
        let render = RenderLoop::new(publisher.subscribe(), Recorder::default(), &preview(100));
        publisher.publish(frame(5));

        let mut ticks = 0;
        let stats = render.run_blocking(|_| {
            ticks += 1;
            ticks <= 3
        });
        assert_eq!(stats.rendered, 1);
        assert_eq!(stats.idle_ticks, 2);
    }
}
