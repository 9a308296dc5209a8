use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use serde::Serialize;

/// Create `path` (and parents) if needed and return its canonical form.
pub fn ensure_dir(path: &Path) -> Result<PathBuf> {
    fs::create_dir_all(path)?;
    Ok(path.canonicalize()?)
}

/// Collapse a path into a flat filename by replacing separators with `%`.
///
/// Distinct inputs stay distinct because `%` never appears as a separator
/// in the source path; the result is usable both as an archive entry name
/// and as an index directory name.
pub fn escape_path(path: &Path) -> String {
    path.to_string_lossy()
        .replace(std::path::MAIN_SEPARATOR, "%")
}

pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let micros = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros())
        .unwrap_or(0);
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, std::process::id(), micros));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(tag: &str) -> PathBuf {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock before epoch")
            .as_micros();
        let dir = std::env::temp_dir().join(format!(
            "provlog_fsutil_{}_{}_{}",
            tag,
            std::process::id(),
            micros
        ));
        fs::create_dir_all(&dir).expect("scratch dir");
        dir
    }

    #[test]
    fn escape_path_collapses_separators() {
        assert_eq!(escape_path(Path::new("/tmp/out.txt")), "%tmp%out.txt");
        assert_eq!(escape_path(Path::new("rel/a/b")), "rel%a%b");
        assert_eq!(escape_path(Path::new("plain.txt")), "plain.txt");
    }

    #[test]
    fn atomic_write_replaces_content_and_leaves_no_temp_files() {
        let dir = scratch_dir("atomic");
        let target = dir.join("blob.json");
        atomic_write_json(&target, &serde_json::json!({"v": 1})).expect("first write");
        atomic_write_json(&target, &serde_json::json!({"v": 2})).expect("second write");

        let value: serde_json::Value =
            serde_json::from_slice(&fs::read(&target).expect("read back")).expect("parse");
        assert_eq!(value["v"], 2);

        let leftovers: Vec<_> = fs::read_dir(&dir)
            .expect("list dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp."))
            .collect();
        assert!(leftovers.is_empty(), "temp files left behind: {:?}", leftovers);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn ensure_dir_is_idempotent_and_absolute() {
        let dir = scratch_dir("ensure");
        let nested = dir.join("a").join("b");
        let first = ensure_dir(&nested).expect("create");
        let second = ensure_dir(&nested).expect("recreate");
        assert_eq!(first, second);
        assert!(first.is_absolute());
        let _ = fs::remove_dir_all(dir);
    }
}
