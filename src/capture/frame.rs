use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::FrameError;

/// One captured image. Cloning shares the pixel buffer and metadata.
#[derive(Clone)]
pub struct Frame {
    /// Pixel rows, `meta.stride` bytes apart
    pub data: Bytes,

    pub meta: Arc<FrameMetadata>,

    /// When the frame left the source, used for latency tracking
    pub timestamp: Instant,
}

#[derive(Debug, Clone)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    /// Bytes per row
    pub stride: u32,
    pub format: PixelFormat,
    /// Source clock, if the device reports one
    pub device_timestamp: Option<Duration>,
}

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
    Bgra32,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => 3,
            PixelFormat::Bgra32 => 4,
        }
    }

    /// Bytes in one packed row of `width` pixels, `None` on overflow
    pub fn row_bytes(self, width: u32) -> Option<u32> {
        width.checked_mul(self.bytes_per_pixel())
    }

    /// Name FFmpeg uses for `-pix_fmt`
    pub fn ffmpeg_name(self) -> &'static str {
        match self {
            PixelFormat::Rgb24 => "rgb24",
            PixelFormat::Bgr24 => "bgr24",
            PixelFormat::Bgra32 => "bgra",
        }
    }
}

impl Frame {
    /// Build a tightly packed frame stamped with the current instant
    pub fn new(sequence: u64, width: u32, height: u32, format: PixelFormat, data: Bytes) -> Self {
        Self {
            data,
            meta: Arc::new(FrameMetadata {
                sequence,
                width,
                height,
                // Zero when the row size overflows; `validate` reports it
                stride: format.row_bytes(width).unwrap_or(0),
                format,
                device_timestamp: None,
            }),
            timestamp: Instant::now(),
        }
    }

    pub fn sequence(&self) -> u64 {
        self.meta.sequence
    }

    /// Size in bytes of a frame with the given geometry, `None` on overflow
    pub fn expected_len(stride: u32, height: u32) -> Option<usize> {
        (stride as usize).checked_mul(height as usize)
    }

    /// Check the buffer is non-empty and large enough for the declared geometry
    pub fn validate(&self) -> Result<(), FrameError> {
        if self.data.is_empty() {
            return Err(FrameError::EmptyBuffer);
        }

        let meta = &self.meta;
        if meta.width == 0 || meta.height == 0 {
            return Err(FrameError::ZeroDimensions {
                width: meta.width,
                height: meta.height,
            });
        }

        let overflow = FrameError::GeometryOverflow {
            width: meta.width,
            height: meta.height,
        };
        let min_stride = meta.format.row_bytes(meta.width).ok_or_else(|| overflow.clone())?;
        let expected =
            Frame::expected_len(meta.stride.max(min_stride), meta.height).ok_or(overflow)?;
        if self.data.len() < expected {
            return Err(FrameError::BufferTooShort {
                expected,
                actual: self.data.len(),
            });
        }

        Ok(())
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("sequence", &self.meta.sequence)
            .field("width", &self.meta.width)
            .field("height", &self.meta.height)
            .field("format", &self.meta.format)
            .field("len", &self.data.len())
            .finish()
    }
}
