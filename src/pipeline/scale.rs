//! Preview frame preparation: pixel conversion and tier downscale

use std::sync::Arc;

use bytes::Bytes;
use image::imageops::{self, FilterType};
use image::RgbImage;

use crate::capture::frame::{Frame, FrameMetadata, PixelFormat};
use crate::error::FrameError;
use crate::QualityTier;

/// Converts captured frames to packed RGB24 at the preview resolution
#[derive(Debug, Clone, Copy)]
pub struct PreviewScaler {
    divisor: u32,
    filter: FilterType,
}

impl PreviewScaler {
    pub fn new(quality: QualityTier) -> Self {
        let filter = match quality {
            QualityTier::High => FilterType::Triangle,
            QualityTier::Medium | QualityTier::Low => FilterType::Nearest,
        };
        Self {
            divisor: quality.preview_divisor(),
            filter,
        }
    }

    /// Output size for a source of `width` x `height`
    pub fn target_size(&self, width: u32, height: u32) -> (u32, u32) {
        (
            (width / self.divisor).max(1),
            (height / self.divisor).max(1),
        )
    }

    /// Prepare `frame` for the preview channel.
    ///
    /// Packed RGB24 at full size passes through without copying. Sequence
    /// number and timestamps are carried over unchanged.
    pub fn prepare(&self, frame: Frame) -> Result<Frame, FrameError> {
        frame.validate()?;

        let meta = &frame.meta;
        let packed_stride =
            PixelFormat::Rgb24
                .row_bytes(meta.width)
                .ok_or(FrameError::GeometryOverflow {
                    width: meta.width,
                    height: meta.height,
                })?;
        if meta.format == PixelFormat::Rgb24 && self.divisor == 1 && meta.stride == packed_stride
        {
            return Ok(frame);
        }

        let rgb = to_packed_rgb(&frame);
        let image = RgbImage::from_raw(meta.width, meta.height, rgb).ok_or(
            FrameError::BufferTooShort {
                expected: Frame::expected_len(packed_stride, meta.height).unwrap_or(usize::MAX),
                actual: frame.data.len(),
            },
        )?;

        let (width, height) = self.target_size(meta.width, meta.height);
        let image = if (width, height) == (meta.width, meta.height) {
            image
        } else {
            imageops::resize(&image, width, height, self.filter)
        };

        Ok(Frame {
            data: Bytes::from(image.into_raw()),
            meta: Arc::new(FrameMetadata {
                sequence: meta.sequence,
                width,
                height,
                stride: width * 3,
                format: PixelFormat::Rgb24,
                device_timestamp: meta.device_timestamp,
            }),
            timestamp: frame.timestamp,
        })
    }
}

/// Repack any supported layout into tightly packed RGB rows
fn to_packed_rgb(frame: &Frame) -> Vec<u8> {
    let meta = &frame.meta;
    let bpp = meta.format.bytes_per_pixel() as usize;
    let row_len = meta.width as usize * bpp;
    let stride = (meta.stride as usize).max(row_len);
    let mut rgb = Vec::with_capacity(meta.width as usize * meta.height as usize * 3);

    for row in frame.data.chunks(stride).take(meta.height as usize) {
        let row = &row[..row_len.min(row.len())];
        match meta.format {
            PixelFormat::Rgb24 => rgb.extend_from_slice(row),
            PixelFormat::Bgr24 | PixelFormat::Bgra32 => {
                for px in row.chunks_exact(bpp) {
                    rgb.extend_from_slice(&[px[2], px[1], px[0]]);
                }
            }
        }
    }

    rgb
}

/// Largest size with the source aspect ratio that fits in `max_width` x `max_height`
pub fn fit_within(width: u32, height: u32, max_width: u32, max_height: u32) -> (u32, u32) {
    if width == 0 || height == 0 {
        return (0, 0);
    }

    let (width, height) = (width as u64, height as u64);
    let mut scaled_height = max_height as u64;
    let mut scaled_width = scaled_height * width / height;

    if scaled_width > max_width as u64 {
        scaled_width = max_width as u64;
        scaled_height = scaled_width * height / width;
    }

    let (scaled_width, scaled_height) = (scaled_width as u32, scaled_height as u32);
    (scaled_width.max(1), scaled_height.max(1))
}
