pub mod artifact;
pub mod checksum;
pub mod extras;
pub mod fsutil;

pub use artifact::{Artifact, ExtraValue, ReadArtifact, ReadSpec};
pub use checksum::eval_checksum;
pub use extras::{ExtraEntry, ExtraStore};
pub use fsutil::{atomic_write_bytes, atomic_write_json, ensure_dir, escape_path};
