//! The archival finalizer: lays out the working directory, persists every
//! registered piece of the run, compresses it, and maintains the
//! path-indexed symlink indices.
//!
//! Every step — and every per-file / per-key unit inside a step — fails
//! independently: a warning is logged and the rest of the archive is still
//! produced.

use std::collections::BTreeMap;
use std::env;
use std::fs::{self, File};
#[cfg(unix)]
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::warn;

use provlog_core::{
    atomic_write_json, ensure_dir, escape_path, eval_checksum, ExtraEntry, ExtraValue, ReadSpec,
};

use crate::experiment::Experiment;
use crate::meta;
use crate::source::collect_sources;

const ALL_EXPERIMENTS: &str = "all_experiments";
const BY_OUTPUT_FILE: &str = "experiments_by_output_file";
const BY_INPUT_FILE: &str = "experiments_by_input_file";
const ARCHIVE_EXT: &str = "tar.gz";
const STAMP_FORMAT: &str = "%Y-%m-%d-%H-%M-%S";

pub(crate) fn write_archive(
    exp: &Experiment,
    capture: Option<&(PathBuf, PathBuf)>,
) -> Result<PathBuf> {
    let all = ensure_dir(&exp.root.join(ALL_EXPERIMENTS))?;
    let workdir = ensure_dir(&all.join(&exp.id))?;
    let archive_path = all.join(format!("{}.{}", exp.id, ARCHIVE_EXT));
    let by_output = ensure_dir(&exp.root.join(BY_OUTPUT_FILE))?;
    let by_input = ensure_dir(&exp.root.join(BY_INPUT_FILE))?;
    let stamp = exp.started_at.format(STAMP_FORMAT).to_string();

    step("snapshot sources", || write_sources(exp, &workdir));
    step("write metadata", || write_meta(exp, &workdir));
    step("store captured streams", || {
        copy_captures(capture, &workdir)
    });
    step("copy output files", || {
        copy_outputs(exp, &workdir, &by_output, &stamp, &archive_path)
    });
    step("checksum input files", || {
        write_inputs(exp, &workdir, &by_input, &stamp, &archive_path)
    });
    step("write extra keys", || write_extras(exp, &workdir));

    compress(&workdir, &archive_path)?;
    if let Err(e) = fs::remove_dir_all(&workdir) {
        warn!(
            "cannot remove working directory {}: {}",
            workdir.display(),
            e
        );
    }
    Ok(archive_path)
}

fn step(name: &str, run: impl FnOnce() -> Result<()>) {
    if let Err(e) = run() {
        warn!("archival step '{}' failed: {:#}", name, e);
    }
}

fn write_sources(exp: &Experiment, workdir: &Path) -> Result<()> {
    let dir = ensure_dir(&workdir.join("source"))?;
    if exp.sources.is_empty() {
        return Ok(());
    }
    let cwd = env::current_dir().ok();
    for file in collect_sources(&exp.sources, exp.started_at) {
        let rel_path = cwd
            .as_deref()
            .and_then(|cwd| file.path.strip_prefix(cwd).ok())
            .unwrap_or(&file.path);
        if let Err(e) = fs::write(dir.join(escape_path(rel_path)), &file.contents) {
            warn!("cannot store source snapshot {}: {}", rel_path.display(), e);
        }
    }
    Ok(())
}

fn write_meta(exp: &Experiment, workdir: &Path) -> Result<()> {
    let snapshot = meta::collect(exp.started_at);
    atomic_write_json(&workdir.join("meta"), &snapshot)
}

fn copy_captures(capture: Option<&(PathBuf, PathBuf)>, workdir: &Path) -> Result<()> {
    let Some((stdout_path, stderr_path)) = capture else {
        return Ok(());
    };
    fs::copy(stdout_path, workdir.join("stdout.out"))
        .with_context(|| format!("cannot store {}", stdout_path.display()))?;
    fs::copy(stderr_path, workdir.join("stderr.out"))
        .with_context(|| format!("cannot store {}", stderr_path.display()))?;
    Ok(())
}

fn copy_outputs(
    exp: &Experiment,
    workdir: &Path,
    index_root: &Path,
    stamp: &str,
    archive_path: &Path,
) -> Result<()> {
    let dir = ensure_dir(&workdir.join("output_files"))?;
    for output in &exp.outputs {
        if !output.exists() {
            warn!(
                "output file does not exist: {}; skipping this one",
                output.display()
            );
            continue;
        }
        let escaped = escape_path(output);
        if let Err(e) = fs::copy(output, dir.join(&escaped)) {
            warn!("cannot copy output file {}: {}", output.display(), e);
            continue;
        }
        if let Err(e) = index_symlink(index_root, &escaped, stamp, &exp.id, archive_path) {
            warn!("cannot index output file {}: {:#}", output.display(), e);
        }
    }
    Ok(())
}

fn write_inputs(
    exp: &Experiment,
    workdir: &Path,
    index_root: &Path,
    stamp: &str,
    archive_path: &Path,
) -> Result<()> {
    let mut digests = BTreeMap::new();
    for input in &exp.inputs {
        match eval_checksum(input) {
            Ok(digest) => {
                digests.insert(input.to_string_lossy().to_string(), digest);
            }
            Err(e) => warn!("cannot checksum input file {}: {:#}", input.display(), e),
        }
    }
    atomic_write_json(&workdir.join("input_files"), &digests)?;

    for input in &exp.inputs {
        if let Err(e) = index_symlink(index_root, &escape_path(input), stamp, &exp.id, archive_path)
        {
            warn!("cannot index input file {}: {:#}", input.display(), e);
        }
    }
    Ok(())
}

fn write_extras(exp: &Experiment, workdir: &Path) -> Result<()> {
    let dir = ensure_dir(&workdir.join("extra_keys"))?;
    for (key, entry) in exp.extras.iter() {
        let result = match entry {
            ExtraEntry::Single(value) => write_extra_value(&dir, key, value),
            ExtraEntry::Many(values) => {
                // Zero-pad to the element count's width so lexicographic
                // and numeric order agree.
                let width = values.len().to_string().len();
                values.iter().enumerate().try_for_each(|(idx, value)| {
                    let name = format!("{}.{:0width$}", key, idx, width = width);
                    write_extra_value(&dir, &name, value)
                })
            }
        };
        if let Err(e) = result {
            warn!("cannot persist extra key '{}': {:#}", key, e);
        }
    }
    Ok(())
}

fn write_extra_value(dir: &Path, name: &str, value: &ExtraValue) -> Result<()> {
    let path = dir.join(name);
    match value {
        ExtraValue::Scalar(scalar) => atomic_write_json(&path, scalar),
        ExtraValue::Artifact(artifact) => {
            artifact.write(&path)?;
            ReadSpec::for_artifact(artifact.as_ref()).save(&dir.join(format!("{}.read", name)))
        }
    }
}

#[cfg(unix)]
fn index_symlink(
    index_root: &Path,
    escaped: &str,
    stamp: &str,
    id: &str,
    archive_path: &Path,
) -> Result<()> {
    let dir = ensure_dir(&index_root.join(escaped))?;
    let link = dir.join(format!("{}.{}", stamp, id));
    // The same path registered twice in one run maps to the same link name.
    if fs::symlink_metadata(&link).is_ok() {
        return Ok(());
    }
    symlink(archive_path, &link)
        .with_context(|| format!("cannot create index symlink {}", link.display()))?;
    Ok(())
}

#[cfg(not(unix))]
fn index_symlink(_: &Path, _: &str, _: &str, _: &str, _: &Path) -> Result<()> {
    Ok(())
}

fn compress(workdir: &Path, archive_path: &Path) -> Result<()> {
    let file = File::create(archive_path)
        .with_context(|| format!("cannot create archive {}", archive_path.display()))?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder
        .append_dir_all(".", workdir)
        .context("cannot pack working directory")?;
    let encoder = builder.into_inner().context("cannot finish tar stream")?;
    let file = encoder.finish().context("cannot finish gzip stream")?;
    file.sync_all()?;
    Ok(())
}
