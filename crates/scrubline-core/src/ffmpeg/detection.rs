//! FFmpeg Detection Module
//!
//! Resolves the ffmpeg/ffprobe pair either from explicitly configured paths or
//! from the system PATH. Detection runs once at startup, so it uses blocking
//! `std::process` calls.

use std::path::{Path, PathBuf};
use std::process::Command;

use super::{FFmpegError, FFmpegResult};
use crate::process::configure_std_command;

/// Where the detected binaries came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolSource {
    /// Paths supplied through settings or CLI flags
    Configured,
    /// Found in a well-known directory or on PATH
    System,
}

/// Information about a detected FFmpeg installation
#[derive(Debug, Clone)]
pub struct FFmpegInfo {
    /// Path to ffmpeg binary
    pub ffmpeg_path: PathBuf,
    /// Path to ffprobe binary
    pub ffprobe_path: PathBuf,
    /// FFmpeg version string
    pub version: String,
    /// How the binaries were located
    pub source: ToolSource,
}

impl FFmpegInfo {
    /// Builds info from explicit paths, verifying that ffmpeg runs.
    pub fn from_paths(ffmpeg_path: PathBuf, ffprobe_path: PathBuf) -> FFmpegResult<Self> {
        let version = get_ffmpeg_version(&ffmpeg_path)?;
        Ok(Self {
            ffmpeg_path,
            ffprobe_path,
            version,
            source: ToolSource::Configured,
        })
    }
}

/// Detect FFmpeg, preferring configured paths over the system installation.
///
/// A configured path that does not exist is reported as [`FFmpegError::NotFound`]
/// rather than silently falling back, so misconfiguration is visible.
pub fn detect_ffmpeg(
    ffmpeg_path: Option<&Path>,
    ffprobe_path: Option<&Path>,
) -> FFmpegResult<FFmpegInfo> {
    match (ffmpeg_path, ffprobe_path) {
        (None, None) => detect_system_ffmpeg(),
        (ffmpeg, ffprobe) => {
            let ffmpeg = match ffmpeg {
                Some(p) => p.to_path_buf(),
                None => which_binary("ffmpeg")?,
            };
            let ffprobe = match ffprobe {
                Some(p) => p.to_path_buf(),
                None => which_binary("ffprobe")?,
            };
            if !ffmpeg.exists() || !ffprobe.exists() {
                return Err(FFmpegError::NotFound);
            }
            FFmpegInfo::from_paths(ffmpeg, ffprobe)
        }
    }
}

/// Detect FFmpeg from the system PATH and common install locations.
pub fn detect_system_ffmpeg() -> FFmpegResult<FFmpegInfo> {
    let ffmpeg_path = which_binary("ffmpeg")?;
    let ffprobe_path = which_binary("ffprobe")?;
    let version = get_ffmpeg_version(&ffmpeg_path)?;

    Ok(FFmpegInfo {
        ffmpeg_path,
        ffprobe_path,
        version,
        source: ToolSource::System,
    })
}

fn which_binary(name: &str) -> FFmpegResult<PathBuf> {
    let binary_name = if cfg!(target_os = "windows") {
        format!("{name}.exe")
    } else {
        name.to_string()
    };

    for dir in get_common_ffmpeg_paths() {
        let candidate = dir.join(&binary_name);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }

    let locator = if cfg!(target_os = "windows") {
        "where"
    } else {
        "which"
    };
    let mut cmd = Command::new(locator);
    cmd.arg(name);
    configure_std_command(&mut cmd);
    let output = cmd.output().map_err(|_| FFmpegError::NotFound)?;

    if output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        if let Some(first_line) = stdout.lines().map(str::trim).find(|l| !l.is_empty()) {
            return Ok(PathBuf::from(first_line));
        }
    }

    Err(FFmpegError::NotFound)
}

/// Common FFmpeg installation directories for the current platform
fn get_common_ffmpeg_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    #[cfg(target_os = "windows")]
    {
        paths.push(PathBuf::from(r"C:\ffmpeg\bin"));
        paths.push(PathBuf::from(r"C:\Program Files\ffmpeg\bin"));
        if let Ok(programdata) = std::env::var("ProgramData") {
            paths.push(PathBuf::from(programdata).join("chocolatey").join("bin"));
        }
    }

    #[cfg(target_os = "macos")]
    {
        paths.push(PathBuf::from("/opt/homebrew/bin"));
        paths.push(PathBuf::from("/usr/local/bin"));
        paths.push(PathBuf::from("/opt/local/bin"));
    }

    #[cfg(target_os = "linux")]
    {
        paths.push(PathBuf::from("/usr/bin"));
        paths.push(PathBuf::from("/usr/local/bin"));
        paths.push(PathBuf::from("/snap/bin"));
    }

    paths
}

/// Runs `ffmpeg -version` and extracts the version token.
fn get_ffmpeg_version(ffmpeg_path: &Path) -> FFmpegResult<String> {
    let mut cmd = Command::new(ffmpeg_path);
    cmd.arg("-version");
    configure_std_command(&mut cmd);
    let output = cmd.output().map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => FFmpegError::NotFound,
        _ => FFmpegError::ProcessError(e),
    })?;

    if !output.status.success() {
        return Err(FFmpegError::ExecutionFailed(
            "Failed to get FFmpeg version".to_string(),
        ));
    }

    parse_version_line(&String::from_utf8_lossy(&output.stdout))
}

fn parse_version_line(output: &str) -> FFmpegResult<String> {
    let first_line = output
        .lines()
        .next()
        .ok_or_else(|| FFmpegError::ParseError("Empty FFmpeg version output".to_string()))?;

    Ok(first_line
        .strip_prefix("ffmpeg version ")
        .and_then(|rest| rest.split_whitespace().next())
        .unwrap_or(first_line)
        .to_string())
}
