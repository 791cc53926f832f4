//! Service wiring
//!
//! One place that turns [`EngineSettings`] into the long-lived services a host
//! (HTTP layer, CLI) calls into.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use crate::admission::TranscodeAdmission;
use crate::ffmpeg::{FFmpegState, TranscodeProfile, TranscodeSession};
use crate::heatmap::{AnalysisTool, HeatmapCache, HeatmapEngine};
use crate::rpc::{ProcessLauncher, WorkerClient};
use crate::settings::EngineSettings;
use crate::{CoreError, CoreResult};

/// Long-lived services shared by every request.
#[derive(Clone)]
pub struct CoreServices {
    pub ffmpeg: Arc<FFmpegState>,
    pub heatmaps: HeatmapEngine,
    pub admission: TranscodeAdmission,
}

impl CoreServices {
    /// Detects ffmpeg and builds every service from settings.
    ///
    /// A missing ffmpeg does not fail construction.
    pub fn from_settings(settings: &EngineSettings) -> Self {
        let ffmpeg = Arc::new(FFmpegState::detect(
            settings.tools.ffmpeg_path.as_deref(),
            settings.tools.ffprobe_path.as_deref(),
        ));
        Self::with_ffmpeg(settings, ffmpeg)
    }

    /// Builds services around an already-resolved ffmpeg state.
    pub fn with_ffmpeg(settings: &EngineSettings, ffmpeg: Arc<FFmpegState>) -> Self {
        let cache_dir = settings.resolved_cache_dir();
        debug!(cache_dir = %cache_dir.display(), "Heatmap cache directory");

        let tool: Arc<dyn AnalysisTool> = ffmpeg.clone();
        let heatmaps = HeatmapEngine::new(
            tool,
            HeatmapCache::new(cache_dir),
            settings.heatmap_config(),
        );
        let admission = TranscodeAdmission::new(settings.transcode.max_concurrent);

        info!(
            ffmpeg_available = ffmpeg.is_available(),
            max_transcodes = admission.ceiling(),
            "Core services ready"
        );

        Self {
            ffmpeg,
            heatmaps,
            admission,
        }
    }

    /// Admits and starts a streaming transcode.
    ///
    /// Fails with [`crate::admission::AdmissionError::Busy`] before anything is
    /// spawned when the ceiling is reached.
    pub async fn start_transcode(
        &self,
        input: &Path,
        profile: &TranscodeProfile,
    ) -> CoreResult<TranscodeSession> {
        let permit = self.admission.try_acquire()?;
        let runner = self.ffmpeg.runner()?;
        Ok(runner.spawn_transcode(input, profile, permit).await?)
    }
}

/// Builds a client for the isolated worker process described by settings.
///
/// Without a configured program the current executable is re-launched.
pub fn worker_client(settings: &EngineSettings) -> CoreResult<WorkerClient> {
    let program = match &settings.worker.program {
        Some(program) => program.clone(),
        None => current_exe()?,
    };
    let launcher = ProcessLauncher::new(program, settings.worker.args.iter().cloned());
    Ok(WorkerClient::new(
        Arc::new(launcher),
        settings.worker_client_config(),
    ))
}

fn current_exe() -> CoreResult<PathBuf> {
    std::env::current_exe()
        .map_err(|e| CoreError::Internal(format!("Failed to resolve current executable: {}", e)))
}
