use std::env;
use std::path::{Path, PathBuf};

use color_eyre::{eyre::eyre, Result};
use tracing::info;

/// Parse `"1280x720"` into `(1280, 720)`
pub fn parse_resolution(value: &str) -> Result<(u32, u32)> {
    let (w, h) = value
        .trim()
        .split_once(['x', 'X'])
        .ok_or_else(|| eyre!("Resolution must look like WIDTHxHEIGHT, got {:?}", value))?;

    let width: u32 = w.trim().parse()?;
    let height: u32 = h.trim().parse()?;
    if width == 0 || height == 0 {
        return Err(eyre!("Resolution must be non-zero, got {}x{}", width, height));
    }
    Ok((width, height))
}

fn ffmpeg_file_name() -> &'static str {
    if cfg!(windows) {
        "ffmpeg.exe"
    } else {
        "ffmpeg"
    }
}

/// Resolve the FFmpeg binary: an explicit path must exist, otherwise search PATH
pub fn locate_ffmpeg(configured: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = configured {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        return Err(eyre!("Configured FFmpeg not found at {}", path.display()));
    }

    let search = env::var_os("PATH").ok_or_else(|| eyre!("PATH is not set"))?;
    find_in(env::split_paths(&search), ffmpeg_file_name())
        .ok_or_else(|| eyre!("{} not found on PATH", ffmpeg_file_name()))
}

fn find_in(dirs: impl IntoIterator<Item = PathBuf>, name: &str) -> Option<PathBuf> {
    let found = dirs
        .into_iter()
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file());

    if let Some(path) = &found {
        info!("Found FFmpeg: {}", path.display());
    }
    found
}
