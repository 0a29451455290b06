//! On-disk storage for received files.
//!
//! Files land directly under a fixed root directory, named
//! `<unix-seconds>_<client-ip>_<sanitized-filename>`. The prefix keeps
//! same-named uploads from different clients apart. Two uploads of the same
//! name from one client within one second share a path, and the later one
//! replaces the earlier.

use crate::protocol::ConnError;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tokio::fs::{DirBuilder, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{trace, warn};

/// Name used when nothing usable is left after sanitizing.
const FALLBACK_NAME: &str = "unnamed";

/// Reduce a client-supplied name to its final path component.
///
/// Both `/` and `\` count as separators. Empty, `.` and `..` results are
/// replaced with a fixed name.
pub fn sanitize_filename(name: &str) -> String {
    let trimmed = name.trim_end_matches(['/', '\\']);
    let base = trimmed.rsplit(['/', '\\']).next().unwrap_or("");

    match base {
        "" | "." | ".." => FALLBACK_NAME.to_string(),
        base => base.to_string(),
    }
}

/// Destination directory for received files.
#[derive(Debug, Clone)]
pub struct DropStore {
    root: PathBuf,
}

impl DropStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path a file from `peer` named `filename` gets at `timestamp`.
    pub fn destination(&self, timestamp: i64, peer: IpAddr, filename: &str) -> PathBuf {
        self.root
            .join(format!("{timestamp}_{peer}_{}", sanitize_filename(filename)))
    }

    /// Create the root if needed and open a fresh destination file.
    pub async fn create(&self, peer: IpAddr, filename: &str) -> Result<StoredFile, ConnError> {
        let mut dir = DirBuilder::new();
        dir.recursive(true);
        #[cfg(unix)]
        dir.mode(0o755);
        dir.create(&self.root)
            .await
            .map_err(|e| ConnError::persist_failed(&e))?;

        let path = self.destination(chrono::Utc::now().timestamp(), peer, filename);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            warn!(path = %path.display(), "Replacing existing file");
        }

        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o644);
        let file = options
            .open(&path)
            .await
            .map_err(|e| ConnError::persist_failed(&e))?;

        trace!(path = %path.display(), "Created destination file");
        Ok(StoredFile {
            path,
            file,
            written: 0,
        })
    }
}

/// A destination file being written.
#[derive(Debug)]
pub struct StoredFile {
    path: PathBuf,
    file: File,
    written: u64,
}

impl StoredFile {
    pub fn written(&self) -> u64 {
        self.written
    }

    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), ConnError> {
        self.file
            .write_all(chunk)
            .await
            .map_err(|e| ConnError::persist_failed(&e))?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    /// Flush and sync the file, giving up the handle.
    pub async fn finish(mut self) -> Result<PathBuf, ConnError> {
        self.file
            .flush()
            .await
            .map_err(|e| ConnError::persist_failed(&e))?;
        self.file
            .sync_all()
            .await
            .map_err(|e| ConnError::persist_failed(&e))?;
        Ok(self.path)
    }
}
