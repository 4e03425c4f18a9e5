//! Removal of retired references and their checkout trees.

use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;

use explode_core::error::{ExplodeError, Result};
use explode_core::{Digest, ImageReference};

use crate::layout::StorageLayout;
use crate::locks::KeyedLocks;
use crate::perms;
use crate::refstore::RefStore;

/// Deletes pointers and checkout trees, pruning emptied directories.
pub struct GcSweeper {
    layout: StorageLayout,
    refs: Arc<RefStore>,
    digest_locks: KeyedLocks,
}

impl GcSweeper {
    /// `digest_locks` must be shared with the materializer so a tree is never
    /// removed while it is being written.
    pub fn new(layout: StorageLayout, refs: Arc<RefStore>, digest_locks: KeyedLocks) -> Self {
        Self {
            layout,
            refs,
            digest_locks,
        }
    }

    /// Remove `digest/<alg>/<hex>` and its emptied ancestors below `digest/`.
    pub async fn retire_digest(&self, digest: &Digest) -> Result<()> {
        let _guard = self.digest_locks.lock(digest.as_str()).await;
        let dir = self.layout.digest_dir(digest);

        let target = dir.clone();
        tokio::task::spawn_blocking(move || perms::remove_tree(&target))
            .await
            .map_err(|e| ExplodeError::Other(format!("Removal task failed: {}", e)))?
            .map_err(|e| ExplodeError::Persistence {
                path: dir.display().to_string(),
                message: e.to_string(),
            })?;

        if let Some(parent) = dir.parent() {
            prune_empty_ancestors(parent, &self.layout.digest_root()).await;
        }
        tracing::debug!(digest = %digest, "Retired digest");
        Ok(())
    }

    /// Remove the pointer of `reference` and its emptied directories below `images/`.
    pub async fn retire_reference(&self, reference: &ImageReference) -> Result<()> {
        self.refs.remove(reference).await?;
        prune_empty_ancestors(
            &self.layout.reference_dir(reference),
            &self.layout.images_root(),
        )
        .await;
        Ok(())
    }

    /// Retire every digest a deleted reference has pointed at, then the reference.
    ///
    /// All removals are attempted; the first error is returned.
    pub async fn retire(&self, reference: &ImageReference, digests: &[Digest]) -> Result<()> {
        let mut first_error = None;
        for digest in digests {
            if let Err(e) = self.retire_digest(digest).await {
                tracing::error!(reference = %reference, digest = %digest, error = %e, "Failed to delete image");
                first_error.get_or_insert(e);
            }
        }
        if let Err(e) = self.retire_reference(reference).await {
            tracing::error!(reference = %reference, error = %e, "Failed to delete reference");
            first_error.get_or_insert(e);
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                tracing::info!(reference = %reference, digests = digests.len(), "Retired reference");
                Ok(())
            }
        }
    }
}

/// Remove `start` and its ancestors while they are empty, stopping before
/// `boundary`. Returns how many directories were removed.
///
/// A non-empty directory ends the walk; so does any other removal error.
pub async fn prune_empty_ancestors(start: &Path, boundary: &Path) -> usize {
    let mut removed = 0;
    let mut current = start;
    while current != boundary && current.starts_with(boundary) {
        match tokio::fs::remove_dir(current).await {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                tracing::trace!(path = %current.display(), error = %e, "Stopped pruning");
                break;
            }
        }
        match current.parent() {
            Some(parent) => current = parent,
            None => break,
        }
    }
    removed
}
