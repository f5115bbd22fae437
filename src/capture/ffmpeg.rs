//! FFmpeg command construction and child process wrappers
//!
//! Two invocations are built here:
//! 1. Preview capture: grab the device and write raw frames to stdout.
//! 2. Outbound stream: grab the device, encode with x264 and push FLV over RTMP.

use std::fmt;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::Arc;
use std::thread;

use color_eyre::{eyre::eyre, Result};
use parking_lot::Mutex;
use tracing::{info, instrument, warn};

use crate::capture::frame::Frame;
use crate::capture::source::{FrameSource, RawVideoReader};
use crate::{CaptureConfig, CaptureSource, Config};

/// Host platform, decides which FFmpeg input device is used
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Windows,
    Linux,
    MacOs,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(windows) {
            Platform::Windows
        } else if cfg!(target_os = "macos") {
            Platform::MacOs
        } else {
            Platform::Linux
        }
    }
}

/// A fully resolved FFmpeg invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FfmpegCommand {
    program: PathBuf,
    args: Vec<String>,
}

impl FfmpegCommand {
    /// Capture `config.source` and emit raw frames of `config.format` on stdout
    pub fn preview_capture(
        program: impl Into<PathBuf>,
        config: &CaptureConfig,
        platform: Platform,
    ) -> Result<Self> {
        let mut args = strings(&["-hide_banner", "-loglevel", "error"]);
        // Low-latency input probing
        args.extend(strings(&[
            "-fflags",
            "nobuffer",
            "-flags",
            "low_delay",
            "-probesize",
            "32",
            "-analyzeduration",
            "0",
        ]));
        args.extend(input_args(config, platform)?);
        args.extend([
            "-an".to_string(),
            "-s".to_string(),
            format!("{}x{}", config.width, config.height),
            "-pix_fmt".to_string(),
            config.format.ffmpeg_name().to_string(),
            "-f".to_string(),
            "rawvideo".to_string(),
            "pipe:1".to_string(),
        ]);

        Ok(Self {
            program: program.into(),
            args,
        })
    }

    /// Encode the capture device and push it to [`Config::outbound_url`]
    pub fn rtmp_stream(
        program: impl Into<PathBuf>,
        config: &Config,
        platform: Platform,
    ) -> Result<Self> {
        let (capture, stream) = (&config.capture, &config.stream);
        if !stream.local_relay && stream.rtmp_url.is_empty() {
            return Err(eyre!("stream.rtmp_url is empty"));
        }

        let encoder = stream.quality.encoder_settings();
        let mut args = strings(&["-hide_banner", "-loglevel", "warning"]);
        args.extend(input_args(capture, platform)?);
        args.extend([
            "-s".to_string(),
            format!("{}x{}", capture.width, capture.height),
            "-pix_fmt".to_string(),
            "yuv420p".to_string(),
            "-c:v".to_string(),
            "libx264".to_string(),
            "-preset".to_string(),
            encoder.preset.to_string(),
            "-tune".to_string(),
            stream.tune.clone(),
            "-crf".to_string(),
            encoder.crf.to_string(),
            "-maxrate".to_string(),
            encoder.maxrate.to_string(),
            "-bufsize".to_string(),
            encoder.bufsize.to_string(),
            "-g".to_string(),
            stream.gop_size.to_string(),
            "-fflags".to_string(),
            stream.fflags.clone(),
            "-flags".to_string(),
            stream.flags.clone(),
            "-probesize".to_string(),
            stream.probesize.to_string(),
            "-f".to_string(),
            "flv".to_string(),
            config.outbound_url(),
        ]);

        Ok(Self {
            program: program.into(),
            args,
        })
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        command
    }
}

impl fmt::Display for FfmpegCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            if arg.contains(' ') {
                write!(f, " \"{}\"", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

/// Device name with the `desktop` placeholder mapped to each platform's default
fn device_or<'a>(config: &'a CaptureConfig, fallback: &'a str) -> &'a str {
    if config.device.is_empty() || config.device == "desktop" {
        fallback
    } else {
        &config.device
    }
}

/// Input options for the configured capture source
fn input_args(config: &CaptureConfig, platform: Platform) -> Result<Vec<String>> {
    let fps = config.fps.to_string();
    let size = format!("{}x{}", config.width, config.height);

    let args = match (config.source, platform) {
        (CaptureSource::TestPattern, _) => {
            return Err(eyre!("test pattern source does not use FFmpeg"));
        }
        (CaptureSource::Screen, Platform::Windows) => vec![
            "-f".into(),
            "gdigrab".into(),
            "-framerate".into(),
            fps,
            "-video_size".into(),
            size,
            "-i".into(),
            "desktop".into(),
        ],
        (CaptureSource::Window, Platform::Windows) => vec![
            "-f".into(),
            "gdigrab".into(),
            "-framerate".into(),
            fps,
            "-i".into(),
            format!("title={}", config.device),
        ],
        (CaptureSource::Webcam, Platform::Windows) => vec![
            "-f".into(),
            "dshow".into(),
            "-framerate".into(),
            fps,
            "-video_size".into(),
            size,
            "-i".into(),
            format!("video={}", config.device),
        ],
        (CaptureSource::Screen, Platform::Linux) => vec![
            "-f".into(),
            "x11grab".into(),
            "-framerate".into(),
            fps,
            "-video_size".into(),
            size,
            "-i".into(),
            device_or(config, ":0.0").into(),
        ],
        (CaptureSource::Window, Platform::Linux) => vec![
            "-f".into(),
            "x11grab".into(),
            "-framerate".into(),
            fps,
            "-window_id".into(),
            config.device.clone(),
            "-i".into(),
            ":0.0".into(),
        ],
        (CaptureSource::Webcam, Platform::Linux) => vec![
            "-f".into(),
            "v4l2".into(),
            "-framerate".into(),
            fps,
            "-video_size".into(),
            size,
            "-i".into(),
            device_or(config, "/dev/video0").into(),
        ],
        (CaptureSource::Screen, Platform::MacOs) => vec![
            "-f".into(),
            "avfoundation".into(),
            "-framerate".into(),
            fps,
            "-capture_cursor".into(),
            "1".into(),
            "-i".into(),
            format!("{}:none", device_or(config, "1")),
        ],
        (CaptureSource::Webcam, Platform::MacOs) => vec![
            "-f".into(),
            "avfoundation".into(),
            "-framerate".into(),
            fps,
            "-video_size".into(),
            size,
            "-i".into(),
            format!("{}:none", device_or(config, "0")),
        ],
        (CaptureSource::Window, Platform::MacOs) => {
            return Err(eyre!("window capture is not supported on macOS"));
        }
    };

    if matches!(config.source, CaptureSource::Window) && config.device.is_empty() {
        return Err(eyre!("window capture needs capture.device set"));
    }

    Ok(args)
}

/// Forward a child's stderr into the log
fn drain_stderr(child: &mut Child, label: &'static str) {
    if let Some(stderr) = child.stderr.take() {
        let spawned = thread::Builder::new()
            .name(format!("{label}-stderr"))
            .spawn(move || {
                for line in BufReader::new(stderr).lines().map_while(|l| l.ok()) {
                    warn!(process = label, "{}", line);
                }
            });
        if let Err(e) = spawned {
            warn!(process = label, "Failed to spawn stderr reader: {}", e);
        }
    }
}

fn stop_child(child: &mut Child, label: &'static str) {
    match child.try_wait() {
        Ok(Some(status)) => info!(process = label, %status, "FFmpeg already exited"),
        _ => {
            if let Err(e) = child.kill() {
                warn!(process = label, "Failed to kill FFmpeg: {}", e);
            }
            let _ = child.wait();
            info!(process = label, "FFmpeg stopped");
        }
    }
}

/// Kills a capture process from another thread. Killing closes the
/// child's stdout, so a read blocked on a stalled device returns.
#[derive(Clone)]
pub struct ProcessStopper {
    child: Arc<Mutex<Child>>,
}

impl ProcessStopper {
    pub fn stop(&self) {
        stop_child(&mut self.child.lock(), "capture");
    }
}

/// Preview frame source backed by an FFmpeg child process
pub struct FfmpegCapture {
    child: Arc<Mutex<Child>>,
    reader: RawVideoReader<ChildStdout>,
}

impl FfmpegCapture {
    #[instrument(skip(command, config))]
    pub fn spawn(command: &FfmpegCommand, config: &CaptureConfig) -> Result<Self> {
        info!("Starting FFmpeg capture: {}", command);

        let mut child = command
            .to_command()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| eyre!("Failed to start {}: {}", command.program().display(), e))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| eyre!("FFmpeg stdout not captured"))?;
        drain_stderr(&mut child, "capture");

        let reader = match RawVideoReader::new(stdout, config.width, config.height, config.format)
        {
            Ok(reader) => reader,
            Err(e) => {
                stop_child(&mut child, "capture");
                return Err(e.into());
            }
        };

        Ok(Self {
            child: Arc::new(Mutex::new(child)),
            reader,
        })
    }

    pub fn stopper(&self) -> ProcessStopper {
        ProcessStopper {
            child: Arc::clone(&self.child),
        }
    }
}

impl FrameSource for FfmpegCapture {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let frame = self.reader.next_frame()?;
        if frame.is_none() {
            let status = self.child.lock().try_wait();
            match status {
                Ok(Some(status)) if !status.success() => {
                    return Err(eyre!("FFmpeg capture exited with {}", status));
                }
                Ok(_) => info!("FFmpeg capture stream ended"),
                Err(e) => warn!("Could not query FFmpeg status: {}", e),
            }
        }
        Ok(frame)
    }
}

impl Drop for FfmpegCapture {
    fn drop(&mut self) {
        stop_child(&mut self.child.lock(), "capture");
    }
}

/// Outbound RTMP encoder process; killed on drop
pub struct OutboundStream {
    child: Child,
}

impl OutboundStream {
    #[instrument(skip(command))]
    pub fn spawn(command: &FfmpegCommand) -> Result<Self> {
        info!("Starting FFmpeg stream: {}", command);

        let mut child = command
            .to_command()
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| eyre!("Failed to start {}: {}", command.program().display(), e))?;
        drain_stderr(&mut child, "stream");

        Ok(Self { child })
    }

    /// True while the encoder is still running
    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }
}

impl Drop for OutboundStream {
    fn drop(&mut self) {
        stop_child(&mut self.child, "stream");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Config, PixelFormat, QualityTier};

    fn position(args: &[String], flag: &str) -> usize {
        args.iter().position(|a| a == flag).unwrap()
    }

    #[test]
    fn test_preview_capture_windows_screen() {
        let config = Config::default();
        let cmd = FfmpegCommand::preview_capture("ffmpeg", &config.capture, Platform::Windows)
            .unwrap();
        let args = cmd.args();

        assert_eq!(args[position(args, "-f") + 1], "gdigrab");
        assert_eq!(args[position(args, "-i") + 1], "desktop");
        assert_eq!(args[position(args, "-video_size") + 1], "1280x720");
        assert_eq!(args[position(args, "-pix_fmt") + 1], "rgb24");
        assert_eq!(args.last().unwrap(), "pipe:1");
        // Low-latency input options must precede the input
        assert!(position(args, "-probesize") < position(args, "-i"));
    }

    #[test]
    fn test_preview_capture_linux_defaults() {
        let mut config = Config::default();
        config.capture.format = PixelFormat::Bgra32;
        let cmd = FfmpegCommand::preview_capture("ffmpeg", &config.capture, Platform::Linux)
            .unwrap();
        let args = cmd.args();

        assert_eq!(args[position(args, "-f") + 1], "x11grab");
        assert_eq!(args[position(args, "-i") + 1], ":0.0");
        assert_eq!(args[position(args, "-pix_fmt") + 1], "bgra");
    }

    #[test]
    fn test_webcam_device_names() {
        let mut config = Config::default();
        config.capture.source = CaptureSource::Webcam;
        config.capture.device = "HD Webcam".into();

        let win = FfmpegCommand::preview_capture("ffmpeg", &config.capture, Platform::Windows)
            .unwrap();
        assert!(win.args().contains(&"video=HD Webcam".to_string()));
        assert!(win.to_string().contains("\"video=HD Webcam\""));

        config.capture.device = "desktop".into();
        let linux = FfmpegCommand::preview_capture("ffmpeg", &config.capture, Platform::Linux)
            .unwrap();
        assert!(linux.args().contains(&"/dev/video0".to_string()));
    }

    #[test]
    fn test_unsupported_sources() {
        let mut config = Config::default();
        config.capture.source = CaptureSource::TestPattern;
        assert!(
            FfmpegCommand::preview_capture("ffmpeg", &config.capture, Platform::Linux).is_err()
        );

        config.capture.source = CaptureSource::Window;
        config.capture.device = "OBS".into();
        assert!(
            FfmpegCommand::preview_capture("ffmpeg", &config.capture, Platform::MacOs).is_err()
        );

        config.capture.device = String::new();
        assert!(
            FfmpegCommand::preview_capture("ffmpeg", &config.capture, Platform::Windows).is_err()
        );
    }

    #[test]
    fn test_rtmp_stream_uses_quality_tier() {
        let mut config = Config::default();
        config.stream.quality = QualityTier::Low;
        config.stream.rtmp_url = "rtmp://live.example.com/app/".into();
        config.stream.stream_key = "abc123".into();

        let cmd =
            FfmpegCommand::rtmp_stream("/opt/ffmpeg/bin/ffmpeg", &config, Platform::Windows)
                .unwrap();
        let args = cmd.args();

        assert_eq!(cmd.program(), Path::new("/opt/ffmpeg/bin/ffmpeg"));
        assert_eq!(args[position(args, "-preset") + 1], "ultrafast");
        assert_eq!(args[position(args, "-crf") + 1], "28");
        assert_eq!(args[position(args, "-maxrate") + 1], "4M");
        assert_eq!(args[position(args, "-bufsize") + 1], "8M");
        assert_eq!(args[position(args, "-g") + 1], "30");
        assert_eq!(args[position(args, "-tune") + 1], "zerolatency");
        assert_eq!(args[position(args, "-pix_fmt") + 1], "yuv420p");
        assert_eq!(args.last().unwrap(), "rtmp://live.example.com/app/abc123");
    }

    #[test]
    fn test_rtmp_stream_requires_url() {
        let mut config = Config::default();
        config.stream.rtmp_url = String::new();
        assert!(FfmpegCommand::rtmp_stream("ffmpeg", &config, Platform::Linux).is_err());
    }

    #[test]
    fn test_rtmp_stream_to_local_relay() {
        let mut config = Config::default();
        config.stream.local_relay = true;
        config.rtmp.port = 1936;

        let cmd = FfmpegCommand::rtmp_stream("ffmpeg", &config, Platform::Linux).unwrap();
        assert_eq!(cmd.args().last().unwrap(), "rtmp://localhost:1936/live/stream");
    }

    #[cfg(unix)]
    #[test]
    fn test_stopper_unblocks_stalled_capture() {
        use std::sync::mpsc;
        use std::time::Duration;

        // A child that never writes a frame and never exits on its own
        let command = FfmpegCommand {
            program: PathBuf::from("sleep"),
            args: vec!["30".to_string()],
        };
        let mut capture = FfmpegCapture::spawn(&command, &Config::default().capture).unwrap();
        let stopper = capture.stopper();

        let (tx, rx) = mpsc::channel();
        let reader = thread::spawn(move || {
            let result = capture.next_frame();
            let _ = tx.send(result.map(|frame| frame.is_some()));
        });

        thread::sleep(Duration::from_millis(50));
        stopper.stop();

        let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        // Killed, so the stream ends with a failure status rather than a frame
        assert!(result.is_err());
        reader.join().unwrap();
    }

    #[test]
    fn test_spawn_missing_binary_fails() {
        let config = Config::default();
        let cmd = FfmpegCommand::preview_capture(
            "/nonexistent/ffmpeg-binary",
            &config.capture,
            Platform::Linux,
        )
        .unwrap();
        assert!(FfmpegCapture::spawn(&cmd, &config.capture).is_err());
    }
}
