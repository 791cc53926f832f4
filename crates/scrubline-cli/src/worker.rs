//! Isolated worker subcommand.
//!
//! Runs heatmap analysis out of process. The parent sends its effective
//! settings in the `init` handshake, so a restarted worker comes back
//! configured the same way.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use scrubline_core::rpc::{serve, WorkerHandler, INIT_MESSAGE};
use scrubline_core::services::CoreServices;
use scrubline_core::settings::EngineSettings;

pub const PING_MESSAGE: &str = "ping";
pub const HEATMAP_MESSAGE: &str = "heatmap";
pub const PROGRESS_MESSAGE: &str = "progress";
pub const JOBS_MESSAGE: &str = "jobs";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeatmapRequest {
    pub path: PathBuf,
    #[serde(default)]
    pub points: Option<f64>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressRequest {
    pub path: PathBuf,
}

pub struct AnalysisWorker {
    services: RwLock<Option<CoreServices>>,
}

impl AnalysisWorker {
    pub fn new() -> Self {
        Self {
            services: RwLock::new(None),
        }
    }

    fn services(&self) -> Result<CoreServices, String> {
        self.services
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or_else(|| "worker is not initialized".to_string())
    }

    fn initialize(&self, payload: Value) -> Result<Value, String> {
        let mut settings: EngineSettings = if payload.is_null() {
            EngineSettings::default()
        } else {
            serde_json::from_value(payload).map_err(|e| format!("invalid init payload: {e}"))?
        };
        settings.normalize();

        let services = CoreServices::from_settings(&settings);
        let available = services.ffmpeg.is_available();
        *self
            .services
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(services);

        info!(ffmpeg_available = available, "Worker initialized");
        Ok(json!({ "ready": true, "ffmpegAvailable": available }))
    }
}

impl Default for AnalysisWorker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkerHandler for AnalysisWorker {
    async fn handle(&self, kind: &str, payload: Value) -> Result<Value, String> {
        match kind {
            INIT_MESSAGE => self.initialize(payload),
            PING_MESSAGE => Ok(json!("pong")),
            HEATMAP_MESSAGE => {
                let req: HeatmapRequest =
                    serde_json::from_value(payload).map_err(|e| e.to_string())?;
                let result = self
                    .services()?
                    .heatmaps
                    .generate_heatmap(&req.path, req.points)
                    .await
                    .map_err(|e| e.to_string())?;
                serde_json::to_value(result).map_err(|e| e.to_string())
            }
            PROGRESS_MESSAGE => {
                let req: ProgressRequest =
                    serde_json::from_value(payload).map_err(|e| e.to_string())?;
                Ok(json!(self.services()?.heatmaps.get_progress(&req.path)))
            }
            JOBS_MESSAGE => {
                serde_json::to_value(self.services()?.heatmaps.active_jobs())
                    .map_err(|e| e.to_string())
            }
            other => Err(format!("unknown message type: {other}")),
        }
    }
}

/// Serves the worker protocol on stdin/stdout until the parent closes stdin.
pub async fn run() -> anyhow::Result<()> {
    info!(pid = std::process::id(), "Worker listening on stdin");
    serve(
        Arc::new(AnalysisWorker::new()),
        tokio::io::stdin(),
        tokio::io::stdout(),
    )
    .await?;
    info!("Worker input closed, exiting");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_requests_before_init_are_rejected() {
        let worker = AnalysisWorker::new();
        let err = worker
            .handle(PROGRESS_MESSAGE, json!({"path": "/m/a.mp4"}))
            .await
            .unwrap_err();
        assert!(err.contains("not initialized"));
        assert_eq!(worker.handle(PING_MESSAGE, Value::Null).await, Ok(json!("pong")));
    }

    #[tokio::test]
    async fn test_init_then_progress_for_idle_path_is_null() {
        let dir = TempDir::new().unwrap();
        let mut settings = EngineSettings::default();
        settings.cache_dir = Some(dir.path().to_path_buf());

        let worker = AnalysisWorker::new();
        let reply = worker
            .handle(INIT_MESSAGE, serde_json::to_value(&settings).unwrap())
            .await
            .unwrap();
        assert_eq!(reply["ready"], true);

        let progress = worker
            .handle(PROGRESS_MESSAGE, json!({"path": "/m/a.mp4"}))
            .await
            .unwrap();
        assert_eq!(progress, Value::Null);
        let jobs = worker.handle(JOBS_MESSAGE, Value::Null).await.unwrap();
        assert_eq!(jobs, json!([]));
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_requests() {
        let worker = AnalysisWorker::new();
        assert!(worker.handle("bogus", Value::Null).await.is_err());
        assert!(worker
            .handle(INIT_MESSAGE, json!({"heatmap": "nope"}))
            .await
            .is_err());
    }
}
