//! Settings Persistence System
//!
//! Provides persistent engine settings with:
//! - Atomic file writes (temp file + rename)
//! - Tolerant loading: missing or broken files fall back to defaults
//! - Advisory file locking against concurrent writers
//!
//! Storage location: {settings_dir}/settings.json

use std::fs;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::admission::DEFAULT_MAX_CONCURRENT_TRANSCODES;
use crate::fs::atomic_write_json_pretty;
use crate::heatmap::{DedupKey, HeatmapConfig, PointBounds};
use crate::rpc::WorkerClientConfig;
use crate::{CoreError, CoreResult};

/// Settings schema version for migration support
pub const SETTINGS_VERSION: u32 = 1;

/// Settings file name
pub const SETTINGS_FILE: &str = "settings.json";

/// Lock file name (advisory lock to prevent concurrent writers)
pub const SETTINGS_LOCK_FILE: &str = "settings.json.lock";

/// Hard limits for the heatmap point count
const POINTS_FLOOR: u32 = 1;
const POINTS_CEILING: u32 = 1000;

/// Engine settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EngineSettings {
    /// Schema version for migrations
    #[serde(default = "default_version")]
    pub version: u32,

    /// External tool locations
    #[serde(default)]
    pub tools: ToolSettings,

    /// Heatmap cache directory; platform cache dir when unset
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,

    #[serde(default)]
    pub heatmap: HeatmapSettings,

    #[serde(default)]
    pub transcode: TranscodeSettings,

    #[serde(default)]
    pub worker: WorkerSettings,
}

fn default_version() -> u32 {
    SETTINGS_VERSION
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            version: SETTINGS_VERSION,
            tools: ToolSettings::default(),
            cache_dir: None,
            heatmap: HeatmapSettings::default(),
            transcode: TranscodeSettings::default(),
            worker: WorkerSettings::default(),
        }
    }
}

impl EngineSettings {
    /// Normalizes and clamps settings so persisted state is always valid.
    ///
    /// Bad values are corrected instead of rejected.
    pub fn normalize(&mut self) {
        self.version = SETTINGS_VERSION;

        self.tools.ffmpeg_path = non_empty_path(self.tools.ffmpeg_path.take());
        self.tools.ffprobe_path = non_empty_path(self.tools.ffprobe_path.take());
        self.cache_dir = non_empty_path(self.cache_dir.take());
        self.worker.program = non_empty_path(self.worker.program.take());

        let heatmap = &mut self.heatmap;
        heatmap.min_points = heatmap.min_points.clamp(POINTS_FLOOR, POINTS_CEILING);
        heatmap.max_points = heatmap.max_points.clamp(heatmap.min_points, POINTS_CEILING);
        heatmap.default_points = heatmap
            .default_points
            .clamp(heatmap.min_points, heatmap.max_points);
        heatmap.timeout_ms = heatmap.timeout_ms.clamp(1_000, 3_600_000);

        self.transcode.max_concurrent = self.transcode.max_concurrent.clamp(1, 64);

        let worker = &mut self.worker;
        worker.request_timeout_ms = worker.request_timeout_ms.clamp(100, 600_000);
        worker.max_restarts = worker.max_restarts.min(100);
        worker.restart_delay_ms = worker.restart_delay_ms.min(60_000);
    }

    /// Configured cache directory, or the platform default
    pub fn resolved_cache_dir(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(default_cache_dir)
    }

    pub fn heatmap_config(&self) -> HeatmapConfig {
        HeatmapConfig {
            bounds: PointBounds {
                default: self.heatmap.default_points,
                min: self.heatmap.min_points,
                max: self.heatmap.max_points,
            },
            timeout: Duration::from_millis(self.heatmap.timeout_ms),
            dedup: self.heatmap.dedup_key,
        }
    }

    pub fn worker_client_config(&self) -> WorkerClientConfig {
        WorkerClientConfig {
            request_timeout: Duration::from_millis(self.worker.request_timeout_ms),
            auto_restart: self.worker.auto_restart,
            max_restarts: self.worker.max_restarts,
            restart_delay: Duration::from_millis(self.worker.restart_delay_ms),
        }
    }
}

fn non_empty_path(path: Option<PathBuf>) -> Option<PathBuf> {
    path.filter(|p| !p.as_os_str().is_empty())
}

/// Default heatmap cache location
pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("scrubline")
}

/// Default settings directory
pub fn default_settings_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("scrubline")
}

/// External tool settings; unset paths are auto-detected
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolSettings {
    #[serde(default)]
    pub ffmpeg_path: Option<PathBuf>,
    #[serde(default)]
    pub ffprobe_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HeatmapSettings {
    #[serde(default = "default_points")]
    pub default_points: u32,
    #[serde(default = "default_min_points")]
    pub min_points: u32,
    #[serde(default = "default_max_points")]
    pub max_points: u32,
    /// Wall-clock limit for one analysis run
    #[serde(default = "default_heatmap_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub dedup_key: DedupKey,
}

impl Default for HeatmapSettings {
    fn default() -> Self {
        Self {
            default_points: default_points(),
            min_points: default_min_points(),
            max_points: default_max_points(),
            timeout_ms: default_heatmap_timeout_ms(),
            dedup_key: DedupKey::default(),
        }
    }
}

fn default_points() -> u32 {
    100
}

fn default_min_points() -> u32 {
    POINTS_FLOOR
}

fn default_max_points() -> u32 {
    POINTS_CEILING
}

fn default_heatmap_timeout_ms() -> u64 {
    120_000
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TranscodeSettings {
    /// Concurrent transcode ceiling
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

impl Default for TranscodeSettings {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
        }
    }
}

fn default_max_concurrent() -> usize {
    DEFAULT_MAX_CONCURRENT_TRANSCODES
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSettings {
    /// Worker executable; the current executable when unset
    #[serde(default)]
    pub program: Option<PathBuf>,
    #[serde(default = "default_worker_args")]
    pub args: Vec<String>,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub auto_restart: bool,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            program: None,
            args: default_worker_args(),
            request_timeout_ms: default_request_timeout_ms(),
            auto_restart: true,
            max_restarts: default_max_restarts(),
            restart_delay_ms: default_restart_delay_ms(),
        }
    }
}

fn default_worker_args() -> Vec<String> {
    vec!["worker".to_string()]
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

fn default_max_restarts() -> u32 {
    3
}

fn default_restart_delay_ms() -> u64 {
    1_000
}

/// Settings manager for loading, saving, and resetting settings
pub struct SettingsManager {
    settings_path: PathBuf,
}

impl SettingsManager {
    /// Create a new settings manager rooted at `settings_dir`
    pub fn new(settings_dir: impl Into<PathBuf>) -> Self {
        Self {
            settings_path: settings_dir.into().join(SETTINGS_FILE),
        }
    }

    fn lock_path(&self) -> PathBuf {
        self.settings_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(SETTINGS_LOCK_FILE)
    }

    fn with_lock<T>(&self, exclusive: bool, op: impl FnOnce() -> CoreResult<T>) -> CoreResult<T> {
        // Ensure parent directory exists so the lock file can be created.
        if let Some(parent) = self.settings_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let lock_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(self.lock_path())?;

        if exclusive {
            fs2::FileExt::lock_exclusive(&lock_file)?;
        } else {
            fs2::FileExt::lock_shared(&lock_file)?;
        }

        let result = op();

        if let Err(e) = fs2::FileExt::unlock(&lock_file) {
            warn!("Failed to unlock settings lock file: {}", e);
        }

        result
    }

    /// Get the settings file path
    pub fn settings_path(&self) -> &Path {
        &self.settings_path
    }

    /// Load settings from disk, returning defaults if the file is missing or broken
    pub fn load(&self) -> EngineSettings {
        let result = self.with_lock(false, || {
            if !self.settings_path.exists() {
                info!("Settings file not found, using defaults");
                return Ok(EngineSettings::default());
            }

            let content = fs::read_to_string(&self.settings_path)?;
            let mut settings = serde_json::from_str::<EngineSettings>(&content)?;

            if settings.version < SETTINGS_VERSION {
                info!(
                    "Migrating settings from version {} to {}",
                    settings.version, SETTINGS_VERSION
                );
                settings = migrate(settings);
            }

            settings.normalize();
            Ok(settings)
        });

        match result {
            Ok(settings) => settings,
            Err(e) => {
                warn!("Failed to load settings, using defaults: {}", e);
                EngineSettings::default()
            }
        }
    }

    /// Normalize and save settings atomically
    pub fn save(&self, settings: &EngineSettings) -> CoreResult<EngineSettings> {
        self.with_lock(true, || {
            let mut normalized = settings.clone();
            normalized.normalize();
            atomic_write_json_pretty(&self.settings_path, &normalized)?;
            info!("Settings saved to {:?}", self.settings_path);
            Ok(normalized)
        })
    }

    /// Reset settings to defaults and delete the settings file
    pub fn reset(&self) -> CoreResult<EngineSettings> {
        self.with_lock(true, || {
            if self.settings_path.exists() {
                fs::remove_file(&self.settings_path).map_err(|e| {
                    CoreError::Internal(format!("Failed to delete settings file: {}", e))
                })?;
                info!("Settings file deleted");
            }
            Ok(EngineSettings::default())
        })
    }
}

fn migrate(mut settings: EngineSettings) -> EngineSettings {
    settings.version = SETTINGS_VERSION;
    settings
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_settings() {
        let settings = EngineSettings::default();
        assert_eq!(settings.version, SETTINGS_VERSION);
        assert_eq!(settings.heatmap.default_points, 100);
        assert_eq!(settings.heatmap.timeout_ms, 120_000);
        assert_eq!(settings.heatmap.dedup_key, DedupKey::PathAndPoints);
        assert_eq!(settings.transcode.max_concurrent, 3);
        assert_eq!(settings.worker.args, vec!["worker".to_string()]);
        assert_eq!(settings.worker.max_restarts, 3);
        assert!(settings.worker.auto_restart);
    }

    #[test]
    fn test_settings_serialization_is_camel_case() {
        let json = serde_json::to_value(EngineSettings::default()).unwrap();
        assert_eq!(json["heatmap"]["defaultPoints"], 100);
        assert_eq!(json["heatmap"]["dedupKey"], "pathAndPoints");
        assert_eq!(json["transcode"]["maxConcurrent"], 3);
        assert_eq!(json["worker"]["requestTimeoutMs"], 30_000);
    }

    #[test]
    fn test_load_nonexistent_returns_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let manager = SettingsManager::new(temp_dir.path());
        assert_eq!(manager.load(), EngineSettings::default());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let manager = SettingsManager::new(temp_dir.path());

        let mut settings = EngineSettings::default();
        settings.heatmap.dedup_key = DedupKey::Path;
        settings.transcode.max_concurrent = 5;
        settings.tools.ffmpeg_path = Some(PathBuf::from("/opt/ffmpeg/bin/ffmpeg"));

        manager.save(&settings).unwrap();
        assert_eq!(manager.load(), settings);
    }

    #[test]
    fn test_reset_deletes_file() {
        let temp_dir = TempDir::new().unwrap();
        let manager = SettingsManager::new(temp_dir.path());
        manager.save(&EngineSettings::default()).unwrap();
        assert!(manager.settings_path().exists());

        let settings = manager.reset().unwrap();
        assert!(!manager.settings_path().exists());
        assert_eq!(settings, EngineSettings::default());
    }

    #[test]
    fn test_invalid_json_returns_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let manager = SettingsManager::new(temp_dir.path());
        fs::write(manager.settings_path(), "{ not json").unwrap();
        assert_eq!(manager.load(), EngineSettings::default());
    }

    #[test]
    fn test_partial_json_uses_defaults_for_missing() {
        let temp_dir = TempDir::new().unwrap();
        let manager = SettingsManager::new(temp_dir.path());
        fs::write(
            manager.settings_path(),
            r#"{"heatmap": {"defaultPoints": 250}, "worker": {"autoRestart": false}}"#,
        )
        .unwrap();

        let settings = manager.load();
        assert_eq!(settings.heatmap.default_points, 250);
        assert_eq!(settings.heatmap.max_points, 1000);
        assert!(!settings.worker.auto_restart);
        assert_eq!(settings.worker.restart_delay_ms, 1_000);
        assert_eq!(settings.transcode.max_concurrent, 3);
    }

    #[test]
    fn test_normalize_clamps_out_of_range_values() {
        let mut settings = EngineSettings::default();
        settings.heatmap.min_points = 0;
        settings.heatmap.max_points = 50_000;
        settings.heatmap.default_points = 0;
        settings.heatmap.timeout_ms = 5;
        settings.transcode.max_concurrent = 0;
        settings.cache_dir = Some(PathBuf::new());
        settings.normalize();

        assert_eq!(settings.heatmap.min_points, 1);
        assert_eq!(settings.heatmap.max_points, 1000);
        assert_eq!(settings.heatmap.default_points, 1);
        assert_eq!(settings.heatmap.timeout_ms, 1_000);
        assert_eq!(settings.transcode.max_concurrent, 1);
        assert!(settings.cache_dir.is_none());
    }

    #[test]
    fn test_derived_configs() {
        let mut settings = EngineSettings::default();
        settings.cache_dir = Some(PathBuf::from("/tmp/heatmaps"));
        settings.worker.request_timeout_ms = 2_500;

        assert_eq!(settings.resolved_cache_dir(), PathBuf::from("/tmp/heatmaps"));
        assert_eq!(
            settings.heatmap_config().timeout,
            Duration::from_secs(120)
        );
        assert_eq!(
            settings.worker_client_config().request_timeout,
            Duration::from_millis(2_500)
        );
        assert!(default_cache_dir().ends_with("scrubline"));
    }
}
