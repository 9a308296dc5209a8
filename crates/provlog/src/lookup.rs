//! Reverse lookups over an archive root.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use flate2::read::GzDecoder;

use provlog_core::escape_path;

/// Locate the compressed archive for an experiment id, if it exists.
pub fn archive_path(root: &Path, id: &str) -> Option<PathBuf> {
    let path = root.join("all_experiments").join(format!("{}.tar.gz", id));
    path.is_file().then_some(path)
}

/// Archives that declared `path` as an output, oldest first.
pub fn experiments_for_output(root: &Path, path: &Path) -> Result<Vec<PathBuf>> {
    resolve_index(&root.join("experiments_by_output_file"), path)
}

/// Archives that declared `path` as an input, oldest first.
pub fn experiments_for_input(root: &Path, path: &Path) -> Result<Vec<PathBuf>> {
    resolve_index(&root.join("experiments_by_input_file"), path)
}

fn resolve_index(index_root: &Path, path: &Path) -> Result<Vec<PathBuf>> {
    let dir = index_root.join(escape_path(path));
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut links: Vec<PathBuf> = fs::read_dir(&dir)
        .with_context(|| format!("cannot list index {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .collect();
    // Link names start with a sortable timestamp.
    links.sort();
    links
        .into_iter()
        .map(|link| {
            fs::read_link(&link)
                .with_context(|| format!("cannot resolve index entry {}", link.display()))
        })
        .collect()
}

/// Expand one archive into `dest` for inspection.
pub fn unpack_archive(archive: &Path, dest: &Path) -> Result<()> {
    let file =
        File::open(archive).with_context(|| format!("cannot open archive {}", archive.display()))?;
    let mut unpacker = tar::Archive::new(GzDecoder::new(file));
    unpacker
        .unpack(dest)
        .with_context(|| format!("cannot unpack archive into {}", dest.display()))?;
    Ok(())
}
