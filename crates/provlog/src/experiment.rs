use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use provlog_core::{ensure_dir, ExtraStore, ExtraValue};

use crate::archive;
use crate::capture::StreamCapture;

/// Environment variable naming the archive root for [`Experiment::from_env`].
pub const ROOT_ENV: &str = "PROVLOG_ROOT";

enum FinalizeState {
    Idle,
    Finalizing,
    Done,
}

struct CaptureFiles {
    capture: StreamCapture,
    stdout_path: PathBuf,
    stderr_path: PathBuf,
}

/// One tracked run: accumulates declared inputs, outputs and extra data,
/// captures the console streams, and archives everything on finalize.
///
/// Finalize runs at most once — explicitly, or from `Drop` if the value
/// goes out of scope first.
pub struct Experiment {
    pub(crate) id: String,
    pub(crate) root: PathBuf,
    pub(crate) started_at: DateTime<Utc>,
    pub(crate) has_content: bool,
    pub(crate) inputs: Vec<PathBuf>,
    pub(crate) outputs: Vec<PathBuf>,
    pub(crate) sources: Vec<PathBuf>,
    pub(crate) extras: ExtraStore,
    state: FinalizeState,
    capture: Option<CaptureFiles>,
}

impl Experiment {
    /// Start a tracked run archiving under the root named by `PROVLOG_ROOT`.
    pub fn from_env() -> Result<Self> {
        let root = env::var_os(ROOT_ENV).ok_or_else(|| {
            anyhow!(
                "root_not_configured: environment variable {} is not set; cannot archive experiments",
                ROOT_ENV
            )
        })?;
        Self::new(PathBuf::from(root))
    }

    /// Start a tracked run with stream capture armed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        Self::build(root.into(), true)
    }

    /// Start a tracked run without touching the process's stdout/stderr.
    ///
    /// For embedding and tests; the archive then carries no stream files.
    pub fn without_capture(root: impl Into<PathBuf>) -> Result<Self> {
        Self::build(root.into(), false)
    }

    fn build(root: PathBuf, with_capture: bool) -> Result<Self> {
        let root = ensure_dir(&root)
            .with_context(|| format!("root_unusable: cannot use archive root {}", root.display()))?;
        let id = Uuid::new_v4().to_string();
        let started_at = Utc::now();

        let capture = if with_capture {
            let stdout_path = scratch_capture_path(&id, "stdout");
            let stderr_path = scratch_capture_path(&id, "stderr");
            let capture = StreamCapture::arm(&stdout_path, &stderr_path)?;
            Some(CaptureFiles {
                capture,
                stdout_path,
                stderr_path,
            })
        } else {
            None
        };

        Ok(Self {
            id,
            root,
            started_at,
            has_content: false,
            inputs: Vec::new(),
            outputs: Vec::new(),
            sources: Vec::new(),
            extras: ExtraStore::new(),
            state: FinalizeState::Idle,
            capture,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn has_content(&self) -> bool {
        self.has_content
    }

    /// Declare an input file; only its checksum is archived.
    pub fn add_input_file(&mut self, path: impl Into<PathBuf>) {
        self.has_content = true;
        self.inputs.push(path.into());
    }

    /// Declare an output file; a copy of it is archived.
    pub fn add_output_file(&mut self, path: impl Into<PathBuf>) {
        self.has_content = true;
        self.outputs.push(path.into());
    }

    /// Register a source file to snapshot into the archive.
    pub fn add_source_file(&mut self, path: impl Into<PathBuf>) {
        self.sources.push(path.into());
    }

    /// Attach side data under `key`. See [`ExtraStore::add`] for the
    /// overwrite/accumulate semantics.
    pub fn add_extra(&mut self, key: &str, value: ExtraValue, overwrite: bool) {
        self.has_content = true;
        self.extras.add(key, value, overwrite);
    }

    /// Attach generically serialized side data under `key`.
    pub fn add_scalar<T: Serialize>(&mut self, key: &str, value: T, overwrite: bool) -> Result<()> {
        let value = ExtraValue::scalar(value)?;
        self.add_extra(key, value, overwrite);
        Ok(())
    }

    /// Record one observation of a metric; repeated calls accumulate an
    /// ordered sequence under `metric:<name>`.
    pub fn add_metric(&mut self, name: &str, value: f64) -> Result<()> {
        self.add_scalar(&format!("metric:{}", name), value, false)
    }

    /// Absolutize `path`, declare it as an input, and hand it back.
    pub fn inpath(&mut self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let path = absolutize(path.as_ref())?;
        self.add_input_file(path.clone());
        Ok(path)
    }

    /// Absolutize `path`, create its parent directory, declare it as an
    /// output, and hand it back.
    pub fn outpath(&mut self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let path = absolutize(path.as_ref())?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("cannot create output directory {}", parent.display()))?;
        }
        self.add_output_file(path.clone());
        Ok(path)
    }

    /// Archive the run. Returns the archive path, or `None` when nothing
    /// was registered (or finalize already ran).
    ///
    /// Failures inside finalization degrade to warnings: this is expected
    /// to run during teardown, where an error must not mask the program's
    /// real exit status. Whatever succeeded is archived.
    pub fn finalize(&mut self) -> Option<PathBuf> {
        if !matches!(self.state, FinalizeState::Idle) {
            return None;
        }
        let capture_paths = self.disarm_capture();

        let archived = if self.has_content {
            self.state = FinalizeState::Finalizing;
            info!("archiving experiment {}", self.id);
            match archive::write_archive(self, capture_paths.as_ref()) {
                Ok(path) => Some(path),
                Err(e) => {
                    warn!("failed to archive experiment {}: {:#}", self.id, e);
                    None
                }
            }
        } else {
            None
        };

        // Capture files are scratch state; they go away no matter what.
        if let Some((stdout_path, stderr_path)) = &capture_paths {
            for path in [stdout_path, stderr_path] {
                if let Err(e) = fs::remove_file(path) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!("cannot remove capture file {}: {}", path.display(), e);
                    }
                }
            }
        }
        self.state = FinalizeState::Done;
        archived
    }

    fn disarm_capture(&mut self) -> Option<(PathBuf, PathBuf)> {
        let files = self.capture.take()?;
        files.capture.disarm();
        Some((files.stdout_path, files.stderr_path))
    }
}

impl fmt::Debug for Experiment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Experiment")
            .field("id", &self.id)
            .field("root", &self.root)
            .field("has_content", &self.has_content)
            .field("inputs", &self.inputs.len())
            .field("outputs", &self.outputs.len())
            .field("extras", &self.extras.len())
            .finish_non_exhaustive()
    }
}

impl Drop for Experiment {
    fn drop(&mut self) {
        if !matches!(self.state, FinalizeState::Done) {
            self.finalize();
        }
    }
}

fn scratch_capture_path(id: &str, stream: &str) -> PathBuf {
    env::temp_dir().join(format!("provlog_{}_{}.out", id, stream))
}

fn absolutize(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(env::current_dir()
            .context("cannot resolve current directory")?
            .join(path))
    }
}
