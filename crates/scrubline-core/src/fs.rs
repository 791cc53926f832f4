//! Filesystem utilities.
//!
//! Crash-tolerant writes for the heatmap cache and the settings file. A reader
//! must never observe a half-written JSON document, so every write goes to a
//! sibling temp file that is renamed into place.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::{CoreError, CoreResult};

/// Write bytes to `path` using an atomic replace pattern.
///
/// - Write to a uniquely named sibling temp file, flush and sync it.
/// - Rename it over the destination.
/// - Where rename-over-existing is not supported, move the old file aside as
///   `.bak` first and restore it if the swap fails.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> CoreResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let tmp_path = tmp_path_for(path);
    let written = (|| -> std::io::Result<()> {
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(bytes)?;
        writer.flush()?;
        writer.get_ref().sync_all()
    })();

    if let Err(e) = written {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(CoreError::IoError(e));
    }

    atomic_replace(path, &tmp_path)
}

/// Write a JSON file atomically (compact formatting).
pub fn atomic_write_json<T: serde::Serialize>(path: &Path, value: &T) -> CoreResult<()> {
    let bytes = serde_json::to_vec(value)?;
    atomic_write_bytes(path, &bytes)
}

/// Write a JSON file atomically with pretty formatting.
pub fn atomic_write_json_pretty<T: serde::Serialize>(path: &Path, value: &T) -> CoreResult<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

// Two writers of the same key may race; unique temp names keep them from
// clobbering each other's partial files. Last rename wins.
fn tmp_path_for(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "tmp".to_string());
    path.with_file_name(format!("{file_name}.{}.tmp", ulid::Ulid::new()))
}

fn bak_path_for(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "bak".to_string());
    path.with_file_name(format!("{file_name}.bak"))
}

fn atomic_replace(dest: &Path, src_tmp: &Path) -> CoreResult<()> {
    if !cfg!(windows) || !dest.exists() {
        return std::fs::rename(src_tmp, dest).map_err(|e| {
            let _ = std::fs::remove_file(src_tmp);
            CoreError::IoError(e)
        });
    }

    let bak = bak_path_for(dest);
    if bak.exists() {
        let _ = std::fs::remove_file(&bak);
    }

    std::fs::rename(dest, &bak)?;
    match std::fs::rename(src_tmp, dest) {
        Ok(()) => {
            let _ = std::fs::remove_file(&bak);
            Ok(())
        }
        Err(e) => {
            let _ = std::fs::rename(&bak, dest);
            let _ = std::fs::remove_file(src_tmp);
            Err(CoreError::IoError(e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn atomic_write_bytes_creates_and_replaces() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("file.json");

        atomic_write_bytes(&path, b"one").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "one");

        atomic_write_bytes(&path, b"two").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "two");
    }

    #[test]
    fn atomic_write_creates_missing_parent_and_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("deeper").join("value.json");

        atomic_write_json(&path, &serde_json::json!({"points": 4})).unwrap();

        let entries: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(entries, vec!["value.json".to_string()]);

        let parsed: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed["points"], 4);
    }

    #[test]
    fn temp_paths_are_unique_per_write() {
        let path = Path::new("/cache/heatmap_abc.json");
        assert_ne!(tmp_path_for(path), tmp_path_for(path));
    }
}
