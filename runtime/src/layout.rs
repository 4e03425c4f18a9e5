//! On-disk layout of the storage root.
//!
//! ```text
//! <root>/
//! ├── .repo/                               content-store repository
//! ├── images/<namespace>/<name>/<tag>/link  pointer: raw digest string
//! └── digest/<algorithm>/<hex>/
//!     ├── .incomplete                      present while a pipeline runs
//!     └── rootfs/                          materialized root filesystem
//! ```
//!
//! These paths are shared with downstream consumers and must not change.

use std::path::{Path, PathBuf};

use explode_core::config::REPO_SUBDIR;
use explode_core::{Digest, ImageReference};

/// Directory under the root holding reference pointers.
pub const IMAGES_DIR: &str = "images";

/// Directory under the root holding per-digest checkouts.
pub const DIGEST_DIR: &str = "digest";

/// Pointer file name inside a reference directory.
pub const LINK_FILE: &str = "link";

/// Checkout directory name inside a digest directory.
pub const ROOTFS_DIR: &str = "rootfs";

/// Sentinel written before a digest's pipeline starts and removed on success.
pub const INCOMPLETE_MARKER: &str = ".incomplete";

/// Paths derived from the storage root.
#[derive(Debug, Clone)]
pub struct StorageLayout {
    root: PathBuf,
}

impl StorageLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Content-store repository: `<root>/.repo`.
    pub fn repo_path(&self) -> PathBuf {
        self.root.join(REPO_SUBDIR)
    }

    /// Scratch area for the extract-then-commit fallback: `<root>/.repo/tmp`.
    ///
    /// Kept on the same filesystem as the repository so committed files can
    /// be moved instead of copied.
    pub fn scratch_root(&self) -> PathBuf {
        self.repo_path().join("tmp")
    }

    /// Boundary for reference pruning: `<root>/images`.
    pub fn images_root(&self) -> PathBuf {
        self.root.join(IMAGES_DIR)
    }

    /// Boundary for digest pruning: `<root>/digest`.
    pub fn digest_root(&self) -> PathBuf {
        self.root.join(DIGEST_DIR)
    }

    /// `<root>/images/<namespace>/<name>/<tag>`
    pub fn reference_dir(&self, reference: &ImageReference) -> PathBuf {
        let mut dir = self.images_root();
        for component in reference.components() {
            dir.push(component);
        }
        dir
    }

    /// `<root>/images/<namespace>/<name>/<tag>/link`
    pub fn link_path(&self, reference: &ImageReference) -> PathBuf {
        self.reference_dir(reference).join(LINK_FILE)
    }

    /// `<root>/digest/<algorithm>/<hex>`
    pub fn digest_dir(&self, digest: &Digest) -> PathBuf {
        self.digest_root()
            .join(digest.algorithm())
            .join(digest.hex())
    }

    /// `<root>/digest/<algorithm>/<hex>/rootfs`
    pub fn checkout_path(&self, digest: &Digest) -> PathBuf {
        self.digest_dir(digest).join(ROOTFS_DIR)
    }

    /// `<root>/digest/<algorithm>/<hex>/.incomplete`
    pub fn incomplete_marker(&self, digest: &Digest) -> PathBuf {
        self.digest_dir(digest).join(INCOMPLETE_MARKER)
    }
}
