//! Reference pointer persistence.
//!
//! Each reference has a `link` file containing the raw digest string that is
//! currently materialized for it. Writers to the same reference are
//! serialized because the file is rewritten in place.

use std::io::ErrorKind;
use std::path::Path;

use explode_core::error::{ExplodeError, Result};
use explode_core::{Digest, ImageReference};
use tokio::io::AsyncWriteExt;

use crate::layout::StorageLayout;
use crate::locks::KeyedLocks;

/// Reads and writes per-reference digest pointers.
pub struct RefStore {
    layout: StorageLayout,
    locks: KeyedLocks,
}

impl RefStore {
    pub fn new(layout: StorageLayout) -> Self {
        Self {
            layout,
            locks: KeyedLocks::new(),
        }
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    /// Digest currently materialized for `reference`.
    ///
    /// Returns `None` when the pointer is missing, unreadable or does not
    /// hold a well-formed digest; any of these forces re-materialization.
    pub async fn digest_for(&self, reference: &ImageReference) -> Option<Digest> {
        let path = self.layout.link_path(reference);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!(reference = %reference, "No such reference");
                return None;
            }
            Err(e) => {
                tracing::warn!(
                    reference = %reference,
                    path = %path.display(),
                    error = %e,
                    "Could not read reference"
                );
                return None;
            }
        };

        let parsed = std::str::from_utf8(&raw)
            .map_err(|e| ExplodeError::InvalidDigest(e.to_string()))
            .and_then(Digest::parse);
        match parsed {
            Ok(digest) => Some(digest),
            Err(e) => {
                tracing::warn!(
                    reference = %reference,
                    len = raw.len(),
                    error = %e,
                    "Malformed reference pointer, treating as not materialized"
                );
                None
            }
        }
    }

    /// Point `reference` at `digest`.
    ///
    /// The pointer file is truncated and fully rewritten. On error the caller
    /// must not consider the reference updated.
    pub async fn set_digest(&self, reference: &ImageReference, digest: &Digest) -> Result<()> {
        let _guard = self.locks.lock(&reference.to_string()).await;
        let path = self.layout.link_path(reference);

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| persistence(parent, e))?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .await
            .map_err(|e| persistence(&path, e))?;
        file.write_all(digest.as_str().as_bytes())
            .await
            .map_err(|e| persistence(&path, e))?;
        file.flush().await.map_err(|e| persistence(&path, e))?;

        tracing::debug!(reference = %reference, digest = %digest, "Updated reference");
        Ok(())
    }

    /// Delete the pointer for `reference`. A missing pointer is not an error.
    ///
    /// Empty parent directories are left for the caller to prune.
    pub async fn remove(&self, reference: &ImageReference) -> Result<()> {
        let _guard = self.locks.lock(&reference.to_string()).await;
        let path = self.layout.link_path(reference);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(persistence(&path, e)),
        }
    }
}

fn persistence(path: &Path, err: std::io::Error) -> ExplodeError {
    ExplodeError::Persistence {
        path: path.display().to_string(),
        message: err.to_string(),
    }
}
