//! Per-call staging directories
//!
//! The cache moves files, so payloads are written to a private directory
//! before upload and restored into one before decoding. The directory is
//! removed when the guard drops, on every exit path.

use std::io::{Error as IoError, Result as IoResult};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const STAGING_PREFIX: &str = "stage-";

/// Default parent for staging directories
pub fn default_staging_root() -> PathBuf {
    std::env::temp_dir().join("run-telemetry-staging")
}

#[derive(Debug)]
pub struct StagingDir {
    dir: TempDir,
}

impl StagingDir {
    /// Create a fresh, uniquely named directory under `root`.
    ///
    /// Runs on the blocking pool; `root` is created if missing.
    pub async fn create(root: &Path) -> IoResult<Self> {
        let root = root.to_path_buf();
        tokio::task::spawn_blocking(move || {
            std::fs::create_dir_all(&root)?;
            let dir = tempfile::Builder::new()
                .prefix(STAGING_PREFIX)
                .tempdir_in(&root)?;
            Ok(StagingDir { dir })
        })
        .await
        .map_err(IoError::other)?
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn file(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}
