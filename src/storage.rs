//! Per-session artifact persistence.
//!
//! Every session produces exactly one file under the output directory,
//! named by its decimal id: `<id>.file`. The content is either the raw
//! received bytes or the literal [`ERROR_MARKER`](crate::protocol::ERROR_MARKER)
//! — never both, never neither. Callers watching the directory see one
//! uniform contract regardless of which failure path a session took.
//!
//! Writes go to a `.part` sibling first and are renamed into place, so an
//! observer never sees a torn artifact.

use std::io;
use std::path::{Path, PathBuf};

use crate::protocol::ERROR_MARKER;

/// File extension for persisted transfers.
const ARTIFACT_EXT: &str = "file";

/// Handle to the output directory. Cheap to clone; sessions each hold one.
#[derive(Debug, Clone)]
pub struct Storage {
    dir: PathBuf,
}

impl Storage {
    /// Open (creating if necessary) the output directory.
    ///
    /// Fails if the directory cannot be created or is not writable — this is
    /// a fatal startup error, checked before the accept loop begins.
    pub async fn open(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;

        // Probe writability now rather than discovering it per-session.
        let probe = dir.join(".accio-probe");
        tokio::fs::write(&probe, b"").await?;
        tokio::fs::remove_file(&probe).await?;

        Ok(Self { dir })
    }

    /// Path of the artifact for session `id`.
    pub fn artifact_path(&self, id: u64) -> PathBuf {
        self.dir.join(format!("{id}.{ARTIFACT_EXT}"))
    }

    /// Persist the received bytes for session `id`.
    pub async fn save_payload(&self, id: u64, payload: &[u8]) -> io::Result<()> {
        self.write_atomic(id, payload).await
    }

    /// Persist the error marker for session `id`.
    pub async fn save_error(&self, id: u64) -> io::Result<()> {
        self.write_atomic(id, ERROR_MARKER).await
    }

    /// Write to `<id>.file.part`, then rename over the final path.
    async fn write_atomic(&self, id: u64, content: &[u8]) -> io::Result<()> {
        let path = self.artifact_path(id);
        let part = path_with_part(&path);
        tokio::fs::write(&part, content).await?;
        tokio::fs::rename(&part, &path).await?;
        log::debug!("[storage] wrote {} ({} bytes)", path.display(), content.len());
        Ok(())
    }
}

fn path_with_part(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".part");
    PathBuf::from(os)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_payload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).await.unwrap();

        storage.save_payload(7, b"hello transfer").await.unwrap();

        let written = tokio::fs::read(storage.artifact_path(7)).await.unwrap();
        assert_eq!(written, b"hello transfer");
    }

    #[tokio::test]
    async fn save_error_writes_marker() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).await.unwrap();

        storage.save_error(3).await.unwrap();

        let written = tokio::fs::read(storage.artifact_path(3)).await.unwrap();
        assert_eq!(written, ERROR_MARKER);
    }

    #[tokio::test]
    async fn artifact_named_by_decimal_id() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).await.unwrap();
        assert_eq!(
            storage.artifact_path(42).file_name().unwrap(),
            "42.file"
        );
    }

    #[tokio::test]
    async fn open_creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        let storage = Storage::open(&nested).await.unwrap();
        storage.save_payload(1, b"x").await.unwrap();
        assert!(nested.join("1.file").exists());
    }

    #[tokio::test]
    async fn no_part_file_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).await.unwrap();
        storage.save_payload(5, b"payload").await.unwrap();
        assert!(!dir.path().join("5.file.part").exists());
    }
}
