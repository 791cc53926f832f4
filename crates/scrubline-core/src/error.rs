//! Scrubline Error Definitions
//!
//! Each subsystem has its own error enum; they all fold into [`CoreError`].
//! Boundaries only need [`CoreError::category`] to pick a response.

use serde::Serialize;
use thiserror::Error;

use crate::admission::AdmissionError;
use crate::ffmpeg::FFmpegError;
use crate::heatmap::HeatmapError;
use crate::rpc::RpcError;

/// Coarse error classification exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorCategory {
    /// A required external tool is missing or unusable
    Configuration,
    /// The input cannot be analyzed (no streams, bad path)
    Input,
    /// Admission control rejected the request; retry later
    ResourceExhausted,
    /// A subprocess or RPC call exceeded its time budget
    Timeout,
    /// A worker process exited unexpectedly
    ProcessCrash,
    /// Disk cache read/write failure
    Cache,
    /// Anything else
    Internal,
}

/// Core error types
#[derive(Error, Debug)]
pub enum CoreError {
    #[error(transparent)]
    FFmpeg(#[from] FFmpegError),

    #[error(transparent)]
    Heatmap(#[from] HeatmapError),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Core result type
pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    /// Classifies the error for boundary mapping.
    pub fn category(&self) -> ErrorCategory {
        match self {
            CoreError::FFmpeg(e) => e.category(),
            CoreError::Heatmap(e) => e.category(),
            CoreError::Rpc(e) => e.category(),
            CoreError::Admission(_) => ErrorCategory::ResourceExhausted,
            CoreError::Cache(_) => ErrorCategory::Cache,
            CoreError::ValidationError(_) => ErrorCategory::Input,
            CoreError::IoError(_) | CoreError::JsonError(_) | CoreError::Internal(_) => {
                ErrorCategory::Internal
            }
        }
    }

    /// Whether the caller should back off and retry the same request.
    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::ResourceExhausted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_busy_is_the_only_retryable_category() {
        let busy = CoreError::from(AdmissionError::Busy {
            active: 3,
            ceiling: 3,
        });
        assert_eq!(busy.category(), ErrorCategory::ResourceExhausted);
        assert!(busy.is_retryable());

        let timeout = CoreError::from(HeatmapError::Timeout(Duration::from_secs(120)));
        assert_eq!(timeout.category(), ErrorCategory::Timeout);
        assert!(!timeout.is_retryable());
    }

    #[test]
    fn test_categories_follow_subsystem_errors() {
        assert_eq!(
            CoreError::from(FFmpegError::NotFound).category(),
            ErrorCategory::Configuration
        );
        assert_eq!(
            CoreError::from(HeatmapError::NoStreams("/media/a.mp4".into())).category(),
            ErrorCategory::Input
        );
        assert_eq!(
            CoreError::from(RpcError::ProcessCrashed).category(),
            ErrorCategory::ProcessCrash
        );
        assert_eq!(
            CoreError::Cache("disk full".into()).category(),
            ErrorCategory::Cache
        );
    }
}
