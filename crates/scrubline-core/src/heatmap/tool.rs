use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use super::FilterGraph;
use crate::ffmpeg::{FFmpegResult, FFmpegRunner, FFmpegState, MediaInfo};
use crate::Percent;

/// The media tooling the heatmap engine drives.
///
/// Implemented by the ffmpeg runner; tests substitute a scripted fake.
#[async_trait]
pub trait AnalysisTool: Send + Sync {
    /// Reads stream layout and duration.
    async fn probe(&self, input: &Path) -> FFmpegResult<MediaInfo>;

    /// Runs the analysis graph and returns the printed metadata (stdout).
    async fn analyze(
        &self,
        input: &Path,
        graph: &FilterGraph,
        limit: Duration,
        on_progress: &(dyn Fn(Percent) + Send + Sync),
    ) -> FFmpegResult<String>;
}

#[async_trait]
impl AnalysisTool for FFmpegRunner {
    async fn probe(&self, input: &Path) -> FFmpegResult<MediaInfo> {
        FFmpegRunner::probe(self, input).await
    }

    async fn analyze(
        &self,
        input: &Path,
        graph: &FilterGraph,
        limit: Duration,
        on_progress: &(dyn Fn(Percent) + Send + Sync),
    ) -> FFmpegResult<String> {
        let output = self
            .run_supervised(&graph.ffmpeg_args(input), limit, on_progress)
            .await?;
        Ok(output.stdout)
    }
}

/// Fails each call with `NotFound` while ffmpeg is unavailable.
#[async_trait]
impl AnalysisTool for FFmpegState {
    async fn probe(&self, input: &Path) -> FFmpegResult<MediaInfo> {
        self.runner()?.probe(input).await
    }

    async fn analyze(
        &self,
        input: &Path,
        graph: &FilterGraph,
        limit: Duration,
        on_progress: &(dyn Fn(Percent) + Send + Sync),
    ) -> FFmpegResult<String> {
        AnalysisTool::analyze(self.runner()?, input, graph, limit, on_progress).await
    }
}
