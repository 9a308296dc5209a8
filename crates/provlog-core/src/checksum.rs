//! Content identity over files and directory trees.

use std::fs::{self, File};
use std::io::Read;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use walkdir::WalkDir;

// Streaming reads never drop below the hash block granularity, and never
// demand huge buffers when the memory probe reports large headroom.
const CHUNK_FLOOR: usize = 64 * 1024;
const CHUNK_CEILING: usize = 64 * 1024 * 1024;
const DEFAULT_CHUNK: usize = 8 * 1024 * 1024;
const SMALL_FILE_FACTOR: u64 = 10;

/// Digest a file's bytes, or a directory's recursive (name, content) pairs,
/// into one hex fingerprint.
///
/// Siblings are folded in file-name order, so the digest is reproducible
/// regardless of how the underlying filesystem lists entries.
pub fn eval_checksum(path: &Path) -> Result<String> {
    let mut hasher = blake3::Hasher::new();
    fold_path(&mut hasher, path)?;
    Ok(hasher.finalize().to_hex().to_string())
}

fn fold_path(hasher: &mut blake3::Hasher, path: &Path) -> Result<()> {
    let meta = fs::metadata(path)
        .with_context(|| format!("cannot stat checksum target: {}", path.display()))?;
    if meta.is_file() {
        fold_file(hasher, path, meta.len())
    } else if meta.is_dir() {
        for entry in WalkDir::new(path).min_depth(1).sort_by_file_name() {
            let entry = entry?;
            hasher.update(entry.file_name().to_string_lossy().as_bytes());
            if entry.file_type().is_file() {
                let len = entry.metadata()?.len();
                fold_file(hasher, entry.path(), len)?;
            }
        }
        Ok(())
    } else {
        Err(anyhow!(
            "unsupported_checksum_target: {} is neither a file nor a directory",
            path.display()
        ))
    }
}

fn fold_file(hasher: &mut blake3::Hasher, path: &Path, len: u64) -> Result<()> {
    let mut file =
        File::open(path).with_context(|| format!("cannot open for checksum: {}", path.display()))?;

    let available = available_memory_bytes();
    if let Some(avail) = available {
        if len.saturating_mul(SMALL_FILE_FACTOR) <= avail {
            let mut bytes = Vec::with_capacity(len as usize);
            file.read_to_end(&mut bytes)?;
            hasher.update(&bytes);
            return Ok(());
        }
    }

    let chunk = available
        .map(|avail| (avail / SMALL_FILE_FACTOR) as usize)
        .unwrap_or(DEFAULT_CHUNK)
        .clamp(CHUNK_FLOOR, CHUNK_CEILING);
    let mut buf = vec![0u8; chunk];
    loop {
        let n = match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        hasher.update(&buf[..n]);
    }
    Ok(())
}

fn available_memory_bytes() -> Option<u64> {
    let text = fs::read_to_string("/proc/meminfo").ok()?;
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("MemAvailable:") {
            let kib: u64 = rest.trim().trim_end_matches("kB").trim().parse().ok()?;
            return Some(kib * 1024);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn scratch_dir(tag: &str) -> PathBuf {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock before epoch")
            .as_micros();
        let dir = std::env::temp_dir().join(format!(
            "provlog_checksum_{}_{}_{}",
            tag,
            std::process::id(),
            micros
        ));
        fs::create_dir_all(&dir).expect("scratch dir");
        dir
    }

    #[test]
    fn file_digest_is_deterministic_and_content_sensitive() {
        let dir = scratch_dir("file");
        let path = dir.join("data.bin");
        fs::write(&path, b"hello").expect("write");

        let first = eval_checksum(&path).expect("first digest");
        let second = eval_checksum(&path).expect("second digest");
        assert_eq!(first, second);

        fs::write(&path, b"hello!").expect("rewrite");
        let changed = eval_checksum(&path).expect("changed digest");
        assert_ne!(first, changed);

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn directory_digest_ignores_creation_order() {
        let left = scratch_dir("order_a");
        fs::write(left.join("a.txt"), b"one").expect("write a");
        fs::write(left.join("b.txt"), b"two").expect("write b");

        let right = scratch_dir("order_b");
        fs::write(right.join("b.txt"), b"two").expect("write b");
        fs::write(right.join("a.txt"), b"one").expect("write a");

        assert_eq!(
            eval_checksum(&left).expect("left digest"),
            eval_checksum(&right).expect("right digest")
        );
        let _ = fs::remove_dir_all(left);
        let _ = fs::remove_dir_all(right);
    }

    #[test]
    fn directory_digest_depends_on_entry_names() {
        let left = scratch_dir("name_a");
        fs::write(left.join("a.txt"), b"same").expect("write");

        let right = scratch_dir("name_b");
        fs::write(right.join("z.txt"), b"same").expect("write");

        assert_ne!(
            eval_checksum(&left).expect("left digest"),
            eval_checksum(&right).expect("right digest")
        );
        let _ = fs::remove_dir_all(left);
        let _ = fs::remove_dir_all(right);
    }

    #[test]
    fn directory_digest_recurses_into_subdirectories() {
        let root = scratch_dir("nested");
        let sub = root.join("inner");
        fs::create_dir_all(&sub).expect("subdir");
        fs::write(sub.join("deep.txt"), b"payload").expect("write");

        let before = eval_checksum(&root).expect("digest");
        fs::write(sub.join("deep.txt"), b"payload2").expect("rewrite");
        let after = eval_checksum(&root).expect("digest after");
        assert_ne!(before, after);

        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn missing_path_is_an_error() {
        let dir = scratch_dir("missing");
        let err = eval_checksum(&dir.join("nope")).expect_err("must fail");
        assert!(err.to_string().contains("cannot stat"), "got: {}", err);
        let _ = fs::remove_dir_all(dir);
    }
}
