//! Headless sink that reports preview throughput

use std::time::{Duration, Instant};

use color_eyre::Result;
use tracing::info;

use super::PreviewSink;
use crate::Frame;

/// Counts frames and logs fps/latency once per reporting window
pub struct StatsSink {
    report_every: Duration,
    window_start: Instant,
    window_frames: u64,
    window_latency: Duration,
    total_frames: u64,
    last_size: (u32, u32),
}

impl StatsSink {
    pub fn new(report_every: Duration) -> Self {
        Self {
            report_every,
            window_start: Instant::now(),
            window_frames: 0,
            window_latency: Duration::ZERO,
            total_frames: 0,
            last_size: (0, 0),
        }
    }

    pub fn total_frames(&self) -> u64 {
        self.total_frames
    }

    /// Size of the last frame seen
    pub fn last_size(&self) -> (u32, u32) {
        self.last_size
    }

    fn report(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.window_start).as_secs_f64();
        let fps = if elapsed > 0.0 {
            self.window_frames as f64 / elapsed
        } else {
            0.0
        };
        let avg_latency_ms = if self.window_frames > 0 {
            self.window_latency.as_secs_f64() * 1000.0 / self.window_frames as f64
        } else {
            0.0
        };

        info!(
            fps = %format!("{fps:.1}"),
            avg_latency_ms = %format!("{avg_latency_ms:.2}"),
            width = self.last_size.0,
            height = self.last_size.1,
            "Preview"
        );

        self.window_start = now;
        self.window_frames = 0;
        self.window_latency = Duration::ZERO;
    }
}

impl PreviewSink for StatsSink {
    fn render(&mut self, frame: &Frame) -> Result<()> {
        self.window_frames += 1;
        self.total_frames += 1;
        self.window_latency += frame.timestamp.elapsed();
        self.last_size = (frame.meta.width, frame.meta.height);

        let now = Instant::now();
        if now.duration_since(self.window_start) >= self.report_every {
            self.report(now);
        }
        Ok(())
    }
}
