//! Source snapshot collection.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::warn;

pub struct SourceFile {
    pub path: PathBuf,
    pub contents: String,
}

/// Read the registered source files into text blobs. Unreadable files warn
/// and are skipped; files modified after `started_at` warn but are still
/// snapshotted, since the on-disk text is the best record available.
pub fn collect_sources(paths: &[PathBuf], started_at: DateTime<Utc>) -> Vec<SourceFile> {
    let mut collected = Vec::with_capacity(paths.len());
    for path in paths {
        match fs::read_to_string(path) {
            Ok(contents) => {
                if modified_since(path, started_at) {
                    warn!(
                        "source file {} modified since start of run",
                        path.display()
                    );
                }
                collected.push(SourceFile {
                    path: path.clone(),
                    contents,
                });
            }
            Err(e) => warn!("cannot snapshot source file {}: {}", path.display(), e),
        }
    }
    collected
}

fn modified_since(path: &Path, started_at: DateTime<Utc>) -> bool {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .map(|mtime| DateTime::<Utc>::from(mtime) > started_at)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn scratch_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "provlog_source_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&dir).expect("scratch dir");
        dir
    }

    #[test]
    fn collects_readable_files_and_skips_missing_ones() {
        let dir = scratch_dir();
        let present = dir.join("main.rs");
        fs::write(&present, "fn main() {}\n").expect("write source");

        let collected = collect_sources(
            &[present.clone(), dir.join("gone.rs")],
            Utc::now() + Duration::hours(1),
        );
        assert_eq!(collected.len(), 1);
        assert_eq!(collected[0].path, present);
        assert_eq!(collected[0].contents, "fn main() {}\n");

        let _ = fs::remove_dir_all(dir);
    }
}
