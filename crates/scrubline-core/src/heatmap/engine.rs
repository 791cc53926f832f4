//! Heatmap engine: dedup, cache, analysis, resampling.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, info_span, warn, Instrument};

use super::{
    clamp_points, parse_samples, resample, AnalysisTool, DedupKey, FilterGraph, HeatmapCache,
    HeatmapError, HeatmapJobKey, HeatmapJobSnapshot, HeatmapResult, PointBounds, AUDIO_FLOOR_DB,
    MOTION_FLOOR,
};
use crate::jobs::{JobClaim, JobRegistry, JobTicket};
use crate::{CoreError, CoreResult, Percent};

/// Default wall-clock limit for one analysis run
pub const DEFAULT_ANALYSIS_TIMEOUT: Duration = Duration::from_secs(120);

type JobOutcome = Result<HeatmapResult, HeatmapError>;
type HeatmapTicket = JobTicket<HeatmapJobKey, JobOutcome>;

/// Engine tuning
#[derive(Debug, Clone, PartialEq)]
pub struct HeatmapConfig {
    pub bounds: PointBounds,
    pub timeout: Duration,
    pub dedup: DedupKey,
}

impl Default for HeatmapConfig {
    fn default() -> Self {
        Self {
            bounds: PointBounds::default(),
            timeout: DEFAULT_ANALYSIS_TIMEOUT,
            dedup: DedupKey::default(),
        }
    }
}

struct EngineInner {
    tool: Arc<dyn AnalysisTool>,
    cache: HeatmapCache,
    jobs: JobRegistry<HeatmapJobKey, JobOutcome>,
    config: HeatmapConfig,
}

/// Heatmap generation service. Clones share jobs and cache.
#[derive(Clone)]
pub struct HeatmapEngine {
    inner: Arc<EngineInner>,
}

impl HeatmapEngine {
    pub fn new(tool: Arc<dyn AnalysisTool>, cache: HeatmapCache, config: HeatmapConfig) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                tool,
                cache,
                jobs: JobRegistry::new(),
                config,
            }),
        }
    }

    pub fn config(&self) -> &HeatmapConfig {
        &self.inner.config
    }

    pub fn cache(&self) -> &HeatmapCache {
        &self.inner.cache
    }

    /// Generates (or joins, or loads) the heatmap for `input`.
    ///
    /// `points` is the raw request; see [`clamp_points`]. The job runs on its
    /// own task, so dropping this future does not cancel work other callers
    /// may be waiting on.
    pub async fn generate_heatmap(
        &self,
        input: &Path,
        points: Option<f64>,
    ) -> CoreResult<HeatmapResult> {
        let points = clamp_points(points, self.inner.config.bounds);
        let key = HeatmapJobKey::new(input.to_path_buf(), points, self.inner.config.dedup);

        let waiter = match self.inner.jobs.claim(key) {
            JobClaim::Joined(waiter) => {
                debug!(job_id = %waiter.job_id(), input = %input.display(), "Joined heatmap job");
                waiter
            }
            JobClaim::Leader(ticket, waiter) => {
                let inner = Arc::clone(&self.inner);
                let input = input.to_path_buf();
                let span = info_span!(
                    "heatmap_job",
                    job_id = %ticket.id(),
                    input = %input.display(),
                    points
                );
                tokio::spawn(
                    async move {
                        let outcome = inner.run_job(&ticket, &input, points).await;
                        if let Err(e) = &outcome {
                            warn!("Heatmap job failed: {}", e);
                        }
                        ticket.complete(outcome);
                    }
                    .instrument(span),
                );
                waiter
            }
        };

        waiter
            .wait()
            .await
            .unwrap_or(Err(HeatmapError::Abandoned))
            .map_err(CoreError::from)
    }

    /// Progress of an in-flight job for `input`, `None` if there is none.
    pub fn get_progress(&self, input: &Path) -> Option<Percent> {
        self.inner.jobs.progress_where(|key| key.path == input)
    }

    /// In-flight jobs, oldest first
    pub fn active_jobs(&self) -> Vec<HeatmapJobSnapshot> {
        self.inner.jobs.snapshot()
    }
}

impl EngineInner {
    async fn run_job(&self, ticket: &HeatmapTicket, input: &Path, points: u32) -> JobOutcome {
        if let Some(hit) = self.cache.load(input, points).await {
            return Ok(hit);
        }

        ticket.set_running();
        let started = Instant::now();

        let media = self.tool.probe(input).await?;
        let graph = FilterGraph::for_media(&media)
            .ok_or_else(|| HeatmapError::NoStreams(input.display().to_string()))?;

        let report = ticket.progress_reporter();
        let stdout = self
            .tool
            .analyze(input, &graph, self.config.timeout, &report)
            .await?;

        let series = parse_samples(&stdout, &graph);
        if graph.audio && series.audio.is_empty() {
            warn!("Audio stream present but no loudness samples were printed");
        }
        if graph.video && series.motion.is_empty() {
            warn!("Video stream present but no motion samples were printed");
        }

        let target = points as usize;
        let result = HeatmapResult {
            audio: resample(&series.audio, target, AUDIO_FLOOR_DB),
            motion: resample(&series.motion, target, MOTION_FLOOR),
            points,
        };

        self.cache.store(input, &result).await;
        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            audio_samples = series.audio.len(),
            motion_samples = series.motion.len(),
            "Heatmap generated"
        );
        Ok(result)
    }
}
