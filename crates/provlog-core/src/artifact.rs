//! The capability seam for custom payload persistence.

use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A payload that knows its own on-disk encoding.
///
/// `write` persists the payload; `format` names the paired reconstruction
/// so readers can recognize the encoding without the writing program in
/// scope. Payloads without an `Artifact` impl go through generic JSON
/// serialization instead.
pub trait Artifact {
    fn write(&self, path: &Path) -> Result<()>;
    fn format(&self) -> &'static str;
}

/// The reconstruction half of the capability, implemented by payload types
/// that can be loaded back from an archived file.
pub trait ReadArtifact: Sized {
    const FORMAT: &'static str;

    fn read(path: &Path) -> Result<Self>;
}

/// Reconstruction descriptor persisted next to each artifact payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadSpec {
    pub format: String,
}

impl ReadSpec {
    pub fn for_artifact(artifact: &dyn Artifact) -> Self {
        Self {
            format: artifact.format().to_string(),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        crate::fsutil::atomic_write_json(path, self)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)
            .with_context(|| format!("cannot read artifact spec: {}", path.display()))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Load the payload at `path` through `R`, refusing a format mismatch.
    pub fn read_as<R: ReadArtifact>(&self, path: &Path) -> Result<R> {
        if self.format != R::FORMAT {
            return Err(anyhow!(
                "artifact_format_mismatch: stored '{}', requested '{}'",
                self.format,
                R::FORMAT
            ));
        }
        R::read(path)
    }
}

/// What an extra key can hold: a generically serialized value, or a payload
/// with custom persistence.
pub enum ExtraValue {
    Scalar(Value),
    Artifact(Box<dyn Artifact>),
}

impl ExtraValue {
    pub fn scalar<T: Serialize>(value: T) -> Result<Self> {
        Ok(Self::Scalar(serde_json::to_value(value)?))
    }

    pub fn artifact<A: Artifact + 'static>(artifact: A) -> Self {
        Self::Artifact(Box::new(artifact))
    }
}

impl fmt::Debug for ExtraValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtraValue::Scalar(value) => f.debug_tuple("Scalar").field(value).finish(),
            ExtraValue::Artifact(artifact) => {
                f.debug_tuple("Artifact").field(&artifact.format()).finish()
            }
        }
    }
}
