//! One-shot run metadata snapshot.

use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use std::process::Command;

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct RunMeta {
    pub host: String,
    pub user: String,
    pub cwd: Option<PathBuf>,
    pub argv: Vec<String>,
    pub version: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub environment: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_commit: Option<String>,
}

/// Snapshot the process environment at finalize time. `started_at` comes
/// from experiment construction; everything else is read now.
pub fn collect(started_at: DateTime<Utc>) -> RunMeta {
    RunMeta {
        host: hostname(),
        user: username(),
        cwd: env::current_dir().ok(),
        argv: env::args().collect(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        started_at,
        finished_at: Utc::now(),
        environment: env::vars().collect(),
        git_commit: git_head_commit(),
    }
}

fn hostname() -> String {
    let mut buf = [0u8; 256];
    // SAFETY: buf is a valid writable buffer of the length passed.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc == 0 {
        let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        if let Ok(name) = std::str::from_utf8(&buf[..end]) {
            if !name.is_empty() {
                return name.to_string();
            }
        }
    }
    "unknown".to_string()
}

fn username() -> String {
    env::var("USER")
        .or_else(|_| env::var("LOGNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Best effort: `None` when there is no enclosing repository or no git.
fn git_head_commit() -> Option<String> {
    let output = Command::new("git").args(["rev-parse", "HEAD"]).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let commit = String::from_utf8(output.stdout).ok()?.trim().to_string();
    if commit.is_empty() {
        None
    } else {
        Some(commit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_is_complete_and_serializable() {
        let started = Utc::now();
        let meta = collect(started);

        assert_eq!(meta.started_at, started);
        assert!(meta.finished_at >= meta.started_at);
        assert!(!meta.host.is_empty());
        assert!(!meta.user.is_empty());
        assert!(!meta.argv.is_empty());
        assert_eq!(meta.version, env!("CARGO_PKG_VERSION"));

        let json = serde_json::to_value(&meta).expect("serialize meta");
        assert!(json.get("environment").is_some());
        assert!(json.get("argv").is_some());
    }
}
