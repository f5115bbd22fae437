pub mod ffmpeg;
pub mod frame;
pub mod source;

pub use ffmpeg::{FfmpegCapture, FfmpegCommand, OutboundStream, Platform, ProcessStopper};
pub use frame::Frame;
pub use frame::FrameMetadata;
pub use frame::PixelFormat;
pub use source::{FrameSource, RawVideoReader, TestPattern};
