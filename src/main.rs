//! StreamLiter preview relay: capture -> latest-frame publisher -> preview renderer

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use streamliter::capture::{
    FfmpegCapture, FfmpegCommand, FrameSource, OutboundStream, Platform, ProcessStopper,
    TestPattern,
};
use streamliter::display::{RenderLoop, StatsSink};
use streamliter::pipeline::CaptureLoop;
use streamliter::{utils, CaptureSource, Config, PreviewPublisher, QualityTier};

#[derive(Debug, Parser)]
#[command(name = "streamliter", about = "Low-latency capture preview and RTMP streaming")]
struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "STREAMLITER_CONFIG")]
    config: Option<PathBuf>,

    /// Override capture.source
    #[arg(long, value_enum)]
    source: Option<CaptureSource>,

    /// Override capture size, e.g. 1280x720
    #[arg(long)]
    resolution: Option<String>,

    /// Override preview.quality
    #[arg(long, value_enum)]
    quality: Option<QualityTier>,

    /// Also push the encoded stream to stream.rtmp_url
    #[arg(long)]
    go_live: bool,

    /// Push the encoded stream to the local relay in [rtmp] (implies --go-live)
    #[arg(long)]
    local_relay: bool,

    /// Write the effective settings to this TOML file before starting
    #[arg(long)]
    save_config: Option<PathBuf>,

    /// Stop after this many seconds
    #[arg(long)]
    duration: Option<u64>,

    /// Open a preview window instead of logging throughput
    #[cfg(feature = "sdl-preview")]
    #[arg(long)]
    window: bool,
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("streamliter=info"));

    #[cfg(feature = "profiling")]
    {
        use tracing_subscriber::prelude::*;
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_timer(tracing_subscriber::fmt::time::uptime()),
            )
            .with(tracing_tracy::TracyLayer::default())
            .init();
    }

    #[cfg(not(feature = "profiling"))]
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();
}

fn apply_overrides(config: &mut Config, args: &Args) -> Result<()> {
    if let Some(source) = args.source {
        config.capture.source = source;
    }
    if let Some(resolution) = &args.resolution {
        let (width, height) = utils::parse_resolution(resolution)?;
        config.capture.width = width;
        config.capture.height = height;
    }
    if let Some(quality) = args.quality {
        config.preview.quality = quality;
    }
    if args.go_live || args.local_relay {
        config.stream.enabled = true;
    }
    if args.local_relay {
        config.stream.local_relay = true;
    }
    config.validate()
}

/// The source plus, for FFmpeg sources, a way to kill it from the stop task
fn open_source(config: &Config) -> Result<(Box<dyn FrameSource>, Option<ProcessStopper>)> {
    let capture = &config.capture;
    match capture.source {
        CaptureSource::TestPattern => Ok((
            Box::new(TestPattern::new(capture.width, capture.height, capture.fps)),
            None,
        )),
        _ => {
            let ffmpeg = utils::locate_ffmpeg(capture.ffmpeg_path.as_deref())?;
            let command = FfmpegCommand::preview_capture(ffmpeg, capture, Platform::current())?;
            let source = FfmpegCapture::spawn(&command, capture)?;
            let stopper = source.stopper();
            Ok((Box::new(source), Some(stopper)))
        }
    }
}

fn start_outbound(config: &Config) -> Result<Option<OutboundStream>> {
    if !config.stream.enabled {
        return Ok(None);
    }
    if config.capture.source == CaptureSource::TestPattern {
        warn!("Outbound streaming needs a real capture source, not starting it");
        return Ok(None);
    }

    let ffmpeg = utils::locate_ffmpeg(config.capture.ffmpeg_path.as_deref())?;
    let command = FfmpegCommand::rtmp_stream(ffmpeg, config, Platform::current())?;
    OutboundStream::spawn(&command).map(Some)
}

async fn wait_for_stop(limit: Option<Duration>) {
    let deadline = async {
        match limit {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        res = tokio::signal::ctrl_c() => match res {
            Ok(()) => info!("Ctrl-C received"),
            Err(e) => warn!("Failed to listen for Ctrl-C: {}", e),
        },
        _ = deadline => info!("Run time elapsed"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    init_tracing();

    let args = Args::parse();
    info!("StreamLiter Launching...");

    // Load configuration
    let mut config = Config::load(args.config.as_deref())?;
    apply_overrides(&mut config, &args)?;
    if let Some(path) = &args.save_config {
        config.save(path)?;
    }
    streamliter::CONFIG.store(Arc::new(config));
    let config = streamliter::CONFIG.load_full();

    info!(
        source = ?config.capture.source,
        width = config.capture.width,
        height = config.capture.height,
        quality = ?config.preview.quality,
        "Capture configured"
    );

    let mut outbound = start_outbound(&config)?;

    let publisher = PreviewPublisher::new();
    let handle = publisher.handle();
    let shutdown = Arc::new(AtomicBool::new(false));
    let (stop_tx, stop_rx) = watch::channel(false);
    let stop_tx = Arc::new(stop_tx);

    // Spawn capture thread
    let (source, stopper) = open_source(&config)?;
    let capture =
        CaptureLoop::new(source, publisher, &config.preview).spawn(Arc::clone(&shutdown))?;

    // Renderers stop once the capture side is done
    let capture_done = {
        let stop_tx = Arc::clone(&stop_tx);
        tokio::task::spawn_blocking(move || {
            let stats = capture
                .join()
                .map_err(|_| eyre!("Capture thread panicked"));
            stop_tx.send_replace(true);
            stats
        })
    };

    {
        let stop_tx = Arc::clone(&stop_tx);
        let shutdown = Arc::clone(&shutdown);
        let stopper = stopper.clone();
        let limit = args.duration.map(Duration::from_secs);
        tokio::spawn(async move {
            wait_for_stop(limit).await;
            shutdown.store(true, Ordering::Release);
            // A stalled device would otherwise keep the capture thread in `read`
            if let Some(stopper) = &stopper {
                stopper.stop();
            }
            stop_tx.send_replace(true);
        });
    }

    let subscription = handle.subscribe();

    #[cfg(feature = "sdl-preview")]
    let render_stats = if args.window {
        let sdl_context = sdl2::init().map_err(|e| eyre!(e))?;
        let display = streamliter::display::Sdl2Display::new(
            &sdl_context,
            config.preview.width,
            config.preview.height,
        )?;
        let stats = streamliter::display::Sdl2Display::run(
            RenderLoop::new(subscription, display, &config.preview),
            stop_rx,
        );
        shutdown.store(true, Ordering::Release);
        stats
    } else {
        RenderLoop::new(subscription, StatsSink::new(Duration::from_secs(5)), &config.preview)
            .run(stop_rx)
            .await
    };

    #[cfg(not(feature = "sdl-preview"))]
    let render_stats =
        RenderLoop::new(subscription, StatsSink::new(Duration::from_secs(5)), &config.preview)
            .run(stop_rx)
            .await;

    shutdown.store(true, Ordering::Release);
    if let Some(stopper) = &stopper {
        stopper.stop();
    }
    let loop_stats = capture_done.await??;
    if let Some(stream) = outbound.as_mut() {
        if !stream.is_running() {
            warn!("Outbound stream exited before shutdown");
        }
    }
    drop(outbound);

    let stats = handle.stats();
    info!(
        captured = loop_stats.captured,
        published = stats.published,
        overwritten = stats.overwritten,
        stale = stats.stale,
        rejected = stats.rejected,
        rendered = render_stats.rendered,
        "StreamLiter shutting down"
    );
    Ok(())
}
