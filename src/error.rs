//! Typed errors for the preview core.
//!
//! Application paths (process spawn, config, rendering) use `color_eyre`;
//! these are the conditions the core classifies and counts instead of raising.

/// Why a frame was refused at publish time
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("frame buffer is empty")]
    EmptyBuffer,

    #[error("frame has zero dimensions ({width}x{height})")]
    ZeroDimensions { width: u32, height: u32 },

    #[error("frame geometry {width}x{height} overflows the addressable size")]
    GeometryOverflow { width: u32, height: u32 },

    #[error("frame buffer too short: expected {expected} bytes, got {actual}")]
    BufferTooShort { expected: usize, actual: usize },
}
