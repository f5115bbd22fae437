//! Frame producers feeding the preview pipeline

use std::io::{ErrorKind, Read};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use color_eyre::Result;
use tracing::{debug, warn};

use crate::capture::frame::{Frame, PixelFormat};
use crate::error::FrameError;

/// Anything that yields captured frames in order.
///
/// `Ok(None)` means the source is exhausted and the capture loop should stop.
pub trait FrameSource: Send {
    fn next_frame(&mut self) -> Result<Option<Frame>>;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        (**self).next_frame()
    }
}

/// Splits a raw video byte stream (e.g. FFmpeg `-f rawvideo` on stdout)
/// into fixed-size frames
pub struct RawVideoReader<R> {
    reader: R,
    width: u32,
    height: u32,
    format: PixelFormat,
    frame_len: usize,
    sequence: u64,
}

impl<R: Read + Send> RawVideoReader<R> {
    /// Fails when the geometry is empty or its frame size overflows
    pub fn new(
        reader: R,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Result<Self, FrameError> {
        if width == 0 || height == 0 {
            return Err(FrameError::ZeroDimensions { width, height });
        }
        let frame_len = format
            .row_bytes(width)
            .and_then(|stride| Frame::expected_len(stride, height))
            .ok_or(FrameError::GeometryOverflow { width, height })?;

        Ok(Self {
            reader,
            width,
            height,
            format,
            frame_len,
            sequence: 0,
        })
    }

    pub fn frame_len(&self) -> usize {
        self.frame_len
    }

    /// Fill `buf` as far as the stream allows; returns bytes read
    fn fill(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }
}

impl<R: Read + Send> FrameSource for RawVideoReader<R> {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let mut buf = vec![0u8; self.frame_len];
        let filled = self.fill(&mut buf)?;

        if filled == 0 {
            debug!(frames = self.sequence, "Raw video stream ended");
            return Ok(None);
        }
        if filled < self.frame_len {
            warn!(
                expected = self.frame_len,
                got = filled,
                "Discarding truncated trailing frame"
            );
            return Ok(None);
        }

        self.sequence += 1;
        Ok(Some(Frame::new(
            self.sequence,
            self.width,
            self.height,
            self.format,
            Bytes::from(buf),
        )))
    }
}

/// Synthetic moving gradient, paced like a real device
pub struct TestPattern {
    width: u32,
    height: u32,
    interval: Option<Duration>,
    next_due: Option<Instant>,
    remaining: Option<u64>,
    sequence: u64,
}

impl TestPattern {
    pub fn new(width: u32, height: u32, fps: u32) -> Self {
        Self {
            width,
            height,
            interval: Some(Duration::from_secs(1) / fps.max(1)),
            next_due: None,
            remaining: None,
            sequence: 0,
        }
    }

    /// Stop after `frames` frames
    pub fn with_limit(mut self, frames: u64) -> Self {
        self.remaining = Some(frames);
        self
    }

    /// Produce frames as fast as they are pulled
    pub fn unpaced(mut self) -> Self {
        self.interval = None;
        self
    }

    fn render(&self) -> Vec<u8> {
        let shift = self.sequence as usize;
        let mut data = Vec::with_capacity(self.width as usize * self.height as usize * 3);
        for y in 0..self.height as usize {
            for x in 0..self.width as usize {
                data.push(((x + shift) % 256) as u8);
                data.push(((y + shift) % 256) as u8);
                data.push((shift % 256) as u8);
            }
        }
        data
    }
}

impl FrameSource for TestPattern {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if let Some(remaining) = self.remaining.as_mut() {
            if *remaining == 0 {
                return Ok(None);
            }
            *remaining -= 1;
        }

        if let Some(interval) = self.interval {
            let now = Instant::now();
            let due = self.next_due.unwrap_or(now);
            if due > now {
                thread::sleep(due - now);
            }
            self.next_due = Some(due.max(now) + interval);
        }

        self.sequence += 1;
        let data = self.render();
        Ok(Some(Frame::new(
            self.sequence,
            self.width,
            self.height,
            PixelFormat::Rgb24,
            Bytes::from(data),
        )))
    }
}
