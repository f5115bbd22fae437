pub mod capture;
pub mod display;
pub mod error;
pub mod pipeline;
pub mod utils;

use std::fs;
use std::path::{Path, PathBuf};

use arc_swap::ArcSwap;
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

pub use capture::{Frame, FrameMetadata, PixelFormat};
pub use error::FrameError;
pub use pipeline::{
    PreviewPublisher, PublishOutcome, PublisherHandle, PublisherStats, Subscription,
    SubscriptionId,
};

/// Global configuration that can be atomically swapped at runtime.
///
/// Components read their section once when they are built; storing a new
/// config only affects components constructed afterwards.
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// Environment override prefix, e.g. `STREAMLITER_PREVIEW__FPS=15`
pub const ENV_PREFIX: &str = "STREAMLITER";

/// Largest accepted capture or preview width/height
pub const MAX_DIMENSION: u32 = 16_384;

/// System configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub capture: CaptureConfig,
    pub preview: PreviewConfig,
    pub stream: StreamConfig,
    pub rtmp: RtmpConfig,
}

/// What FFmpeg should grab
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum CaptureSource {
    Screen,
    Webcam,
    Window,
    /// Synthetic frames, no FFmpeg needed
    TestPattern,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureConfig {
    pub source: CaptureSource,
    /// Display, camera name or window title depending on `source`
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub format: PixelFormat,
    /// Falls back to `ffmpeg` on PATH
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ffmpeg_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviewConfig {
    /// Publish and render cadence
    pub fps: u32,
    pub quality: QualityTier,
    /// Preview window size
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub enabled: bool,
    /// Push to the local relay in `[rtmp]` instead of `rtmp_url`
    pub local_relay: bool,
    pub rtmp_url: String,
    pub stream_key: String,
    pub quality: QualityTier,
    pub gop_size: u32,
    pub tune: String,
    pub fflags: String,
    pub flags: String,
    pub probesize: u32,
}

/// Local RTMP relay endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtmpConfig {
    pub server: String,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    High,
    Medium,
    Low,
}

/// x264 rate control for a quality tier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderSettings {
    pub preset: &'static str,
    pub crf: u32,
    pub maxrate: &'static str,
    pub bufsize: &'static str,
}

impl QualityTier {
    pub fn encoder_settings(self) -> EncoderSettings {
        match self {
            QualityTier::High => EncoderSettings {
                preset: "slow",
                crf: 18,
                maxrate: "10M",
                bufsize: "20M",
            },
            QualityTier::Medium => EncoderSettings {
                preset: "veryfast",
                crf: 23,
                maxrate: "8M",
                bufsize: "10M",
            },
            QualityTier::Low => EncoderSettings {
                preset: "ultrafast",
                crf: 28,
                maxrate: "4M",
                bufsize: "8M",
            },
        }
    }

    /// Preview downscale factor per axis
    pub fn preview_divisor(self) -> u32 {
        match self {
            QualityTier::High => 1,
            QualityTier::Medium => 2,
            QualityTier::Low => 4,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            capture: CaptureConfig {
                source: CaptureSource::Screen,
                device: "desktop".into(),
                width: 1280,
                height: 720,
                fps: 20,
                format: PixelFormat::Rgb24,
                ffmpeg_path: None,
            },
            preview: PreviewConfig {
                fps: 30,
                quality: QualityTier::Medium,
                width: 800,
                height: 450,
            },
            stream: StreamConfig {
                enabled: false,
                local_relay: false,
                rtmp_url: "rtmp://localhost/live".into(),
                stream_key: "your_stream_key".into(),
                quality: QualityTier::Medium,
                gop_size: 30,
                tune: "zerolatency".into(),
                fflags: "nobuffer".into(),
                flags: "low_delay".into(),
                probesize: 32,
            },
            rtmp: RtmpConfig {
                server: "localhost".into(),
                port: 1935,
            },
        }
    }
}

impl Config {
    /// Layer defaults, then the optional TOML file, then `STREAMLITER_*` env vars
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let capture = &self.capture;
        if capture.width == 0 || capture.height == 0 {
            return Err(eyre!(
                "capture size must be non-zero, got {}x{}",
                capture.width,
                capture.height
            ));
        }
        if capture.width > MAX_DIMENSION || capture.height > MAX_DIMENSION {
            return Err(eyre!(
                "capture size {}x{} exceeds {}x{}",
                capture.width,
                capture.height,
                MAX_DIMENSION,
                MAX_DIMENSION
            ));
        }
        if capture.fps == 0 {
            return Err(eyre!("capture.fps must be non-zero"));
        }
        if self.preview.fps == 0 {
            return Err(eyre!("preview.fps must be non-zero"));
        }
        let preview = &self.preview;
        if preview.width == 0 || preview.height == 0 {
            return Err(eyre!("preview window size must be non-zero"));
        }
        if preview.width > MAX_DIMENSION || preview.height > MAX_DIMENSION {
            return Err(eyre!("preview window size exceeds {}", MAX_DIMENSION));
        }
        // Capture devices only admit one reader at a time
        if self.stream.enabled && capture.source == CaptureSource::Webcam {
            return Err(eyre!(
                "webcam preview and outbound streaming cannot share the device; \
                 stream from the screen or disable stream.enabled"
            ));
        }
        Ok(())
    }

    /// Write the configuration as TOML, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
        info!("Settings saved to {}", path.display());
        Ok(())
    }

    /// Address of the local RTMP relay
    pub fn local_rtmp_url(&self) -> String {
        format!("rtmp://{}:{}/live/stream", self.rtmp.server, self.rtmp.port)
    }

    /// Where the outbound stream is pushed
    pub fn outbound_url(&self) -> String {
        if self.stream.local_relay {
            return self.local_rtmp_url();
        }
        format!(
            "{}/{}",
            self.stream.rtmp_url.trim_end_matches('/'),
            self.stream.stream_key
        )
    }
}
