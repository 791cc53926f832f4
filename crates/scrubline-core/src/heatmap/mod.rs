//! Heatmap Analysis Module
//!
//! Turns a media file into two fixed-length activity series for a scrub bar:
//! per-second audio loudness (RMS dB) and per-second visual motion (mean
//! luminance difference between consecutive frames). One ffmpeg pass produces
//! both; results are deduplicated across concurrent callers and cached on disk.

mod cache;
mod engine;
mod filter_graph;
mod resample;
mod tool;

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use cache::HeatmapCache;
pub use engine::{HeatmapConfig, HeatmapEngine};
pub use filter_graph::{parse_samples, FilterGraph, SampleSeries, AUDIO_PRINT_KEY, MOTION_PRINT_KEY};
pub use resample::resample;
pub use tool::AnalysisTool;

use crate::ffmpeg::FFmpegError;
use crate::jobs::JobSnapshot;
use crate::ErrorCategory;

/// Value used for seconds without audio (and for absent audio streams)
pub const AUDIO_FLOOR_DB: f64 = -90.0;
/// Value used for seconds without motion (and for absent video streams)
pub const MOTION_FLOOR: f64 = 0.0;

/// Activity series resampled to a fixed number of points.
///
/// `audio.len() == motion.len() == points` always holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeatmapResult {
    pub audio: Vec<f64>,
    pub motion: Vec<f64>,
    pub points: u32,
}

impl HeatmapResult {
    /// True if both series have exactly `points` entries.
    pub fn is_consistent(&self) -> bool {
        let n = self.points as usize;
        self.audio.len() == n && self.motion.len() == n
    }
}

/// Heatmap failures. Shared by every caller awaiting the same job.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum HeatmapError {
    #[error("Analysis tool unavailable: {0}")]
    ToolMissing(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("No audio or video streams in {0}")]
    NoStreams(String),

    #[error("Analysis timed out after {0:?}")]
    Timeout(Duration),

    #[error("Analysis failed: {0}")]
    Failed(String),

    #[error("Analysis job ended without a result")]
    Abandoned,
}

impl HeatmapError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            HeatmapError::ToolMissing(_) => ErrorCategory::Configuration,
            HeatmapError::InvalidInput(_) | HeatmapError::NoStreams(_) => ErrorCategory::Input,
            HeatmapError::Timeout(_) => ErrorCategory::Timeout,
            HeatmapError::Failed(_) | HeatmapError::Abandoned => ErrorCategory::Internal,
        }
    }
}

impl From<FFmpegError> for HeatmapError {
    fn from(e: FFmpegError) -> Self {
        match e {
            FFmpegError::NotFound => HeatmapError::ToolMissing(e.to_string()),
            FFmpegError::InvalidInput(msg) => HeatmapError::InvalidInput(msg),
            FFmpegError::Timeout(limit) => HeatmapError::Timeout(limit),
            other => HeatmapError::Failed(other.to_string()),
        }
    }
}

/// Allowed range and default for the requested point count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PointBounds {
    pub default: u32,
    pub min: u32,
    pub max: u32,
}

impl Default for PointBounds {
    fn default() -> Self {
        Self {
            default: 100,
            min: 1,
            max: 1000,
        }
    }
}

/// Normalizes a raw point request.
///
/// Missing or non-finite input uses the default; fractions truncate toward
/// zero before clamping.
pub fn clamp_points(raw: Option<f64>, bounds: PointBounds) -> u32 {
    let min = bounds.min.max(1);
    let max = bounds.max.max(min);
    match raw {
        Some(v) if v.is_finite() => {
            let truncated = v.trunc();
            if truncated <= min as f64 {
                min
            } else if truncated >= max as f64 {
                max
            } else {
                truncated as u32
            }
        }
        _ => bounds.default.clamp(min, max),
    }
}

/// What makes two heatmap requests "the same job"
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DedupKey {
    /// Requests for one path share a job regardless of point count; joiners
    /// receive the leader's resolution.
    Path,
    /// Requests share a job only if path and point count both match.
    #[default]
    PathAndPoints,
}

/// Registry key for an in-flight heatmap job
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeatmapJobKey {
    pub path: PathBuf,
    /// `None` when deduplicating by path only
    pub points: Option<u32>,
}

impl HeatmapJobKey {
    pub fn new(path: PathBuf, points: u32, dedup: DedupKey) -> Self {
        Self {
            path,
            points: match dedup {
                DedupKey::Path => None,
                DedupKey::PathAndPoints => Some(points),
            },
        }
    }
}

/// Diagnostic view of an in-flight heatmap job
pub type HeatmapJobSnapshot = JobSnapshot<HeatmapJobKey>;
