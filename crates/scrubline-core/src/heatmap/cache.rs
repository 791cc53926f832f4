//! On-disk heatmap cache.
//!
//! One JSON file per `(path, points)` pair, named by the SHA-256 of the path
//! string followed by the decimal point count. Entries never expire; pruning is
//! left to whoever owns the cache directory.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::HeatmapResult;
use crate::fs::atomic_write_json;
use crate::{CoreError, CoreResult};

#[derive(Debug, Clone)]
pub struct HeatmapCache {
    dir: PathBuf,
}

impl HeatmapCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Hex SHA-256 of `path + points`
    pub fn key_for(input: &Path, points: u32) -> String {
        let mut hasher = Sha256::new();
        hasher.update(input.to_string_lossy().as_bytes());
        hasher.update(points.to_string().as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub fn path_for(&self, input: &Path, points: u32) -> PathBuf {
        self.dir
            .join(format!("heatmap_{}.json", Self::key_for(input, points)))
    }

    /// Reads a cached result.
    ///
    /// `Ok(None)` on a plain miss; an unreadable, corrupt or mismatched entry
    /// is an error.
    pub async fn try_load(&self, input: &Path, points: u32) -> CoreResult<Option<HeatmapResult>> {
        let file = self.path_for(input, points);
        let bytes = match tokio::fs::read(&file).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(CoreError::Cache(format!(
                    "Failed to read {}: {}",
                    file.display(),
                    e
                )))
            }
        };

        let result: HeatmapResult = serde_json::from_slice(&bytes).map_err(|e| {
            CoreError::Cache(format!("Corrupt cache entry {}: {}", file.display(), e))
        })?;

        if result.points != points || !result.is_consistent() {
            return Err(CoreError::Cache(format!(
                "Cache entry {} does not hold {} points",
                file.display(),
                points
            )));
        }

        Ok(Some(result))
    }

    /// Like [`HeatmapCache::try_load`], but failures are logged and read as a miss.
    pub async fn load(&self, input: &Path, points: u32) -> Option<HeatmapResult> {
        match self.try_load(input, points).await {
            Ok(Some(result)) => {
                debug!(input = %input.display(), points, "Heatmap cache hit");
                Some(result)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Ignoring heatmap cache entry: {}", e);
                None
            }
        }
    }

    /// Writes a result atomically.
    pub async fn try_store(&self, input: &Path, result: &HeatmapResult) -> CoreResult<()> {
        let file = self.path_for(input, result.points);
        let result = result.clone();
        tokio::task::spawn_blocking(move || atomic_write_json(&file, &result))
            .await
            .map_err(|e| CoreError::Internal(format!("Cache write task failed: {}", e)))?
            .map_err(|e| CoreError::Cache(e.to_string()))
    }

    /// Best-effort write; failures are logged.
    pub async fn store(&self, input: &Path, result: &HeatmapResult) {
        if let Err(e) = self.try_store(input, result).await {
            warn!(input = %input.display(), "Failed to write heatmap cache: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn sample(points: u32) -> HeatmapResult {
        HeatmapResult {
            audio: vec![-30.0; points as usize],
            motion: vec![1.5; points as usize],
            points,
        }
    }

    #[test]
    fn test_key_is_sha256_of_path_and_points() {
        let key = HeatmapCache::key_for(Path::new("/a"), 100);
        let expected = format!("{:x}", Sha256::digest(b"/a100"));
        assert_eq!(key, expected);
        assert_eq!(key.len(), 64);
        assert_ne!(key, HeatmapCache::key_for(Path::new("/a"), 101));
    }

    #[test]
    fn test_path_layout() {
        let cache = HeatmapCache::new("/var/cache/scrubline");
        let path = cache.path_for(Path::new("/a"), 100);
        let name = path.file_name().unwrap().to_string_lossy();
        assert!(name.starts_with("heatmap_"));
        assert!(name.ends_with(".json"));
        assert_eq!(path.parent().unwrap(), Path::new("/var/cache/scrubline"));
    }

    #[tokio::test]
    async fn test_store_then_load() {
        let dir = TempDir::new().unwrap();
        let cache = HeatmapCache::new(dir.path().join("nested"));
        let input = Path::new("/media/clip.mp4");

        assert!(cache.try_load(input, 4).await.unwrap().is_none());
        cache.try_store(input, &sample(4)).await.unwrap();
        assert_eq!(cache.load(input, 4).await, Some(sample(4)));
        assert!(cache.load(input, 5).await.is_none());
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_error_and_miss() {
        let dir = TempDir::new().unwrap();
        let cache = HeatmapCache::new(dir.path());
        let input = Path::new("/media/clip.mp4");
        std::fs::write(cache.path_for(input, 4), b"{not json").unwrap();

        assert!(matches!(
            cache.try_load(input, 4).await,
            Err(CoreError::Cache(_))
        ));
        assert!(cache.load(input, 4).await.is_none());
    }

    #[tokio::test]
    async fn test_mismatched_lengths_are_rejected() {
        let dir = TempDir::new().unwrap();
        let cache = HeatmapCache::new(dir.path());
        let input = Path::new("/media/clip.mp4");
        let bad = HeatmapResult {
            audio: vec![0.0; 3],
            motion: vec![0.0; 4],
            points: 4,
        };
        std::fs::write(cache.path_for(input, 4), serde_json::to_vec(&bad).unwrap()).unwrap();
        assert!(cache.load(input, 4).await.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_store_failure_is_reported() {
        let dir = TempDir::new().unwrap();
        // A file where the cache directory should be
        let blocker = dir.path().join("cache");
        std::fs::write(&blocker, b"").unwrap();
        let cache = HeatmapCache::new(&blocker);

        let err = cache
            .try_store(Path::new("/a"), &sample(2))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Cache(_)));
        // store() swallows the same failure
        cache.store(Path::new("/a"), &sample(2)).await;
    }
}
