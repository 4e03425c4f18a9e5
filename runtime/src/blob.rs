//! Layer blob resolution.
//!
//! Blobs are read straight out of a registry's filesystem storage driver
//! layout:
//!
//! ```text
//! <root>/docker/registry/v2/blobs/<algorithm>/<first two hex>/<hex>/data
//! ```

use std::path::{Path, PathBuf};

use explode_core::config::BlobSourceUrl;
use explode_core::error::{ExplodeError, Result};
use explode_core::Digest;

/// Maps a layer blob digest to a readable local file.
pub trait BlobResolver: Send + Sync {
    fn blob_path(&self, blob: &Digest) -> Result<PathBuf>;
}

/// Blob resolver over a registry's local storage directory.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn from_source(source: &BlobSourceUrl) -> Self {
        Self::new(source.local_path())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Location of `blob` whether or not it exists.
    pub fn data_path(&self, blob: &Digest) -> PathBuf {
        let hex = blob.hex();
        let prefix = hex.get(..2).unwrap_or(hex);
        self.root
            .join("docker/registry/v2/blobs")
            .join(blob.algorithm())
            .join(prefix)
            .join(hex)
            .join("data")
    }
}

impl BlobResolver for LocalBlobStore {
    fn blob_path(&self, blob: &Digest) -> Result<PathBuf> {
        let path = self.data_path(blob);
        match std::fs::metadata(&path) {
            Ok(meta) if meta.is_file() => Ok(path),
            Ok(_) => Err(ExplodeError::BlobFetch {
                blob: blob.to_string(),
                message: format!("{} is not a regular file", path.display()),
            }),
            Err(e) => Err(ExplodeError::BlobFetch {
                blob: blob.to_string(),
                message: format!("{}: {}", path.display(), e),
            }),
        }
    }
}
