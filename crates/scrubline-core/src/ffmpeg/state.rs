//! FFmpeg shared state
//!
//! Holds the detected runner for the lifetime of the process. Detection failure
//! is not fatal: the state stays empty and every operation that needs ffmpeg
//! fails on its own with [`FFmpegError::NotFound`].

use std::path::Path;

use tracing::{info, warn};

use super::{detect_ffmpeg, FFmpegError, FFmpegInfo, FFmpegResult, FFmpegRunner};

/// Process-wide FFmpeg runner state.
#[derive(Debug, Default)]
pub struct FFmpegState {
    runner: Option<FFmpegRunner>,
}

impl FFmpegState {
    pub fn new() -> Self {
        Self::default()
    }

    /// State with an already-constructed runner.
    pub fn with_runner(runner: FFmpegRunner) -> Self {
        Self {
            runner: Some(runner),
        }
    }

    /// Detects ffmpeg/ffprobe, honoring configured paths.
    ///
    /// Never fails; a missing installation is logged and leaves the state empty.
    pub fn detect(ffmpeg_path: Option<&Path>, ffprobe_path: Option<&Path>) -> Self {
        match detect_ffmpeg(ffmpeg_path, ffprobe_path) {
            Ok(info) => {
                info!(
                    version = %info.version,
                    ffmpeg = %info.ffmpeg_path.display(),
                    source = ?info.source,
                    "FFmpeg detected"
                );
                Self::with_runner(FFmpegRunner::new(info))
            }
            Err(e) => {
                warn!("FFmpeg unavailable: {}", e);
                Self::default()
            }
        }
    }

    /// Get the FFmpeg runner, or `NotFound` if detection failed.
    pub fn runner(&self) -> FFmpegResult<&FFmpegRunner> {
        self.runner.as_ref().ok_or(FFmpegError::NotFound)
    }

    /// Get FFmpeg info.
    pub fn info(&self) -> Option<&FFmpegInfo> {
        self.runner.as_ref().map(FFmpegRunner::info)
    }

    /// Check if FFmpeg is available.
    pub fn is_available(&self) -> bool {
        self.runner.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_state_reports_not_found() {
        let state = FFmpegState::new();
        assert!(!state.is_available());
        assert!(state.info().is_none());
        assert!(matches!(state.runner(), Err(FFmpegError::NotFound)));
    }

    #[test]
    fn test_detect_with_missing_paths_yields_empty_state() {
        let missing = Path::new("/definitely/not/here/ffmpeg");
        let state = FFmpegState::detect(Some(missing), Some(missing));
        assert!(!state.is_available());
    }
}
