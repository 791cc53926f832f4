//! FFmpeg Integration Module
//!
//! Everything that talks to the `ffmpeg`/`ffprobe` binaries:
//! - Tool detection (configured paths or system PATH)
//! - Stream probing
//! - Supervised analysis runs with a wall-clock limit and live progress
//! - Streaming transcodes gated by admission control

mod detection;
mod probe;
mod progress;
mod runner;
mod state;
mod transcode;

use std::time::Duration;

pub use detection::*;
pub use probe::{parse_probe_output, AudioStreamInfo, MediaInfo, StreamPresence, VideoStreamInfo};
pub use progress::{parse_timestamp, ProgressParser};
pub use runner::{AnalysisOutput, FFmpegRunner};
pub use state::FFmpegState;
pub use transcode::{TranscodeProfile, TranscodeSession};

use crate::ErrorCategory;

/// FFmpeg-related error types
#[derive(Debug, thiserror::Error)]
pub enum FFmpegError {
    #[error("FFmpeg not found. Please install FFmpeg or configure its path.")]
    NotFound,

    #[error("FFmpeg execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Invalid input file: {0}")]
    InvalidInput(String),

    #[error("FFprobe error: {0}")]
    ProbeError(String),

    #[error("Process error: {0}")]
    ProcessError(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Timeout: operation exceeded {0:?}")]
    Timeout(Duration),
}

impl FFmpegError {
    /// Error classification used at the boundary.
    pub fn category(&self) -> ErrorCategory {
        match self {
            FFmpegError::NotFound => ErrorCategory::Configuration,
            FFmpegError::InvalidInput(_) => ErrorCategory::Input,
            FFmpegError::Timeout(_) => ErrorCategory::Timeout,
            _ => ErrorCategory::Internal,
        }
    }
}

pub type FFmpegResult<T> = Result<T, FFmpegError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ffmpeg_error_display() {
        let err = FFmpegError::NotFound;
        assert!(err.to_string().contains("FFmpeg not found"));

        let err = FFmpegError::ExecutionFailed("exit code 1".to_string());
        assert!(err.to_string().contains("exit code 1"));

        let err = FFmpegError::Timeout(Duration::from_secs(120));
        assert!(err.to_string().contains("120s"));
    }
}
