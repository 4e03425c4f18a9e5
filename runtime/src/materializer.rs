//! Layer-by-layer image materialization.
//!
//! `explode` turns an image digest into a checked-out root filesystem at
//! `digest/<alg>/<hex>/rootfs` and then points the reference at it:
//!
//! 1. Short-circuit when the checkout exists, is non-empty and carries no
//!    sentinel. A partial checkout is removed.
//! 2. Fetch the ordered layer list.
//! 3. Mark the digest incomplete, then create the checkout directory.
//! 4. Per layer: resolve the blob, commit it (direct or extract fallback),
//!    union-checkout the commit with whiteouts.
//! 5. Clear the marker and update the reference pointer.
//!
//! At most one pipeline runs per digest; later callers wait and then hit
//! the short-circuit.

use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;

use explode_core::error::{ExplodeError, Result};
use explode_core::{Digest, ImageReference};
use tokio::sync::watch;

use crate::blob::BlobResolver;
use crate::commit::LayerCommitter;
use crate::layout::StorageLayout;
use crate::locks::KeyedLocks;
use crate::metadata::ImageMetadataSource;
use crate::perms;
use crate::refstore::RefStore;
use crate::store::{CheckoutOptions, ContentStore};

/// Result of a successful [`LayerMaterializer::explode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExplodeOutcome {
    /// The checkout already existed; only the pointer was written.
    AlreadyMaterialized,
    /// The full pipeline ran over this many layers.
    Exploded { layers: usize },
}

/// Drives the commit/checkout pipeline for image digests.
pub struct LayerMaterializer {
    layout: StorageLayout,
    store: Arc<dyn ContentStore>,
    committer: LayerCommitter,
    blobs: Arc<dyn BlobResolver>,
    metadata: Arc<dyn ImageMetadataSource>,
    refs: Arc<RefStore>,
    digest_locks: KeyedLocks,
    shutdown: watch::Receiver<bool>,
}

impl LayerMaterializer {
    pub fn new(
        layout: StorageLayout,
        store: Arc<dyn ContentStore>,
        blobs: Arc<dyn BlobResolver>,
        metadata: Arc<dyn ImageMetadataSource>,
        refs: Arc<RefStore>,
    ) -> Self {
        let (_, shutdown) = watch::channel(false);
        Self {
            committer: LayerCommitter::new(store.clone(), layout.scratch_root()),
            layout,
            store,
            blobs,
            metadata,
            refs,
            digest_locks: KeyedLocks::new(),
            shutdown,
        }
    }

    /// Share digest locks with other components touching checkout trees.
    pub fn with_digest_locks(mut self, locks: KeyedLocks) -> Self {
        self.digest_locks = locks;
        self
    }

    /// Stop starting new layers once `shutdown` turns true.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn digest_locks(&self) -> &KeyedLocks {
        &self.digest_locks
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    /// Materialize `digest` and point `reference` at it.
    ///
    /// On error the reference pointer is left unchanged.
    pub async fn explode(
        &self,
        reference: &ImageReference,
        digest: &Digest,
    ) -> Result<ExplodeOutcome> {
        let _guard = self.digest_locks.lock(digest.as_str()).await;

        let rootfs = self.layout.checkout_path(digest);
        let marker = self.layout.incomplete_marker(digest);

        match checkout_state(&self.layout, digest).await? {
            CheckoutState::Complete => {
                tracing::warn!(reference = %reference, digest = %digest, "Image already exists");
                self.update_reference(reference, digest).await?;
                return Ok(ExplodeOutcome::AlreadyMaterialized);
            }
            CheckoutState::Incomplete => {
                tracing::warn!(
                    reference = %reference,
                    digest = %digest,
                    path = %rootfs.display(),
                    "Removing incomplete checkout"
                );
                let target = rootfs.clone();
                tokio::task::spawn_blocking(move || perms::remove_tree(&target))
                    .await
                    .map_err(|e| ExplodeError::Other(format!("Removal task failed: {}", e)))?
                    .map_err(|e| ExplodeError::Checkout {
                        commit: String::new(),
                        path: rootfs.display().to_string(),
                        message: format!("Failed to remove incomplete checkout: {}", e),
                    })?;
            }
            CheckoutState::Missing => {}
        }

        let layers = self.metadata.image_layers(digest).await.map_err(|e| {
            tracing::error!(reference = %reference, digest = %digest, error = %e, "Could not get image");
            e
        })?;

        // The sentinel exists before the checkout directory does.
        tokio::fs::create_dir_all(self.layout.digest_dir(digest)).await?;
        tokio::fs::write(&marker, b"").await?;
        tokio::fs::create_dir_all(&rootfs).await?;

        let branch = digest.branch();
        for (index, layer) in layers.iter().enumerate() {
            if *self.shutdown.borrow() {
                return Err(ExplodeError::Cancelled(format!(
                    "{} stopped before layer {} of {}",
                    digest,
                    index + 1,
                    layers.len()
                )));
            }

            let blob = layer.blob_digest.to_string();
            let blob_path = self.blobs.blob_path(&layer.blob_digest).map_err(|e| {
                tracing::error!(reference = %reference, digest = %digest, blob = %blob, error = %e, "Could not resolve layer blob");
                e
            })?;

            let committer = self.committer.clone();
            let (layer_branch, subject) = (branch.clone(), blob.clone());
            let (commit, strategy) = tokio::task::spawn_blocking(move || {
                committer.commit_with_fallback(&blob_path, &layer_branch, &subject)
            })
            .await
            .map_err(|e| ExplodeError::Other(format!("Commit task failed: {}", e)))?
            .map_err(|e| {
                tracing::error!(
                    reference = %reference,
                    digest = %digest,
                    blob = %blob,
                    branch = %branch,
                    error = %e,
                    "Could not commit layer (IMAGE POISONED)"
                );
                e
            })?;

            let store = self.store.clone();
            let (layer_commit, dest) = (commit.clone(), rootfs.clone());
            tokio::task::spawn_blocking(move || {
                store.checkout(&layer_commit, &dest, &CheckoutOptions::layered())
            })
            .await
            .map_err(|e| ExplodeError::Other(format!("Checkout task failed: {}", e)))?
            .map_err(|e| {
                tracing::error!(
                    reference = %reference,
                    digest = %digest,
                    commit = %commit,
                    path = %rootfs.display(),
                    error = %e,
                    "Could not checkout layer (IMAGE POISONED)"
                );
                e
            })?;

            tracing::debug!(
                digest = %digest,
                blob = %blob,
                commit = %commit,
                strategy = %strategy,
                layer = index + 1,
                total = layers.len(),
                "Applied layer"
            );
        }

        tokio::fs::remove_file(&marker).await?;
        self.update_reference(reference, digest).await?;

        tracing::info!(reference = %reference, digest = %digest, layers = layers.len(), "Exploded");
        Ok(ExplodeOutcome::Exploded {
            layers: layers.len(),
        })
    }

    async fn update_reference(&self, reference: &ImageReference, digest: &Digest) -> Result<()> {
        self.refs.set_digest(reference, digest).await.map_err(|e| {
            tracing::error!(reference = %reference, digest = %digest, error = %e, "Could not update reference");
            e
        })
    }
}

/// How far the checkout of a digest got.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckoutState {
    /// No checkout directory.
    Missing,
    /// A checkout directory that still carries the sentinel, is empty, or is
    /// not a directory at all. It is rebuilt from scratch.
    Incomplete,
    Complete,
}

/// Inspect `digest/<alg>/<hex>` without taking the digest lock.
pub async fn checkout_state(layout: &StorageLayout, digest: &Digest) -> Result<CheckoutState> {
    let rootfs = layout.checkout_path(digest);
    let meta = match tokio::fs::symlink_metadata(&rootfs).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(CheckoutState::Missing),
        Err(e) => return Err(e.into()),
    };
    if !meta.is_dir() || exists(&layout.incomplete_marker(digest)).await? {
        return Ok(CheckoutState::Incomplete);
    }
    let mut entries = tokio::fs::read_dir(&rootfs).await?;
    if entries.next_entry().await?.is_none() {
        return Ok(CheckoutState::Incomplete);
    }
    Ok(CheckoutState::Complete)
}

async fn exists(path: &Path) -> Result<bool> {
    match tokio::fs::symlink_metadata(path).await {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::LocalBlobStore;
    use crate::store::TreeStore;
    use crate::testutil::{put_blob, StaticMetadata, TarLayer};
    use tempfile::TempDir;

    struct Harness {
        _tmp: TempDir,
        layout: StorageLayout,
        blobs: LocalBlobStore,
        metadata: Arc<StaticMetadata>,
        refs: Arc<RefStore>,
        materializer: LayerMaterializer,
    }

    impl Harness {
        fn new() -> Self {
            let tmp = TempDir::new().unwrap();
            let layout = StorageLayout::new(tmp.path().join("explode"));
            let store = TreeStore::new(layout.repo_path());
            store.init().unwrap();
            let blobs = LocalBlobStore::new(tmp.path().join("registry"));
            let metadata = Arc::new(StaticMetadata::default());
            let refs = Arc::new(RefStore::new(layout.clone()));
            let materializer = LayerMaterializer::new(
                layout.clone(),
                Arc::new(store),
                Arc::new(blobs.clone()),
                metadata.clone(),
                refs.clone(),
            );
            Self {
                _tmp: tmp,
                layout,
                blobs,
                metadata,
                refs,
                materializer,
            }
        }

        fn image(&self, layers: &[TarLayer]) -> Digest {
            let blobs: Vec<Digest> = layers.iter().map(|l| put_blob(&self.blobs, l)).collect();
            let mut hasher_input = String::new();
            for b in &blobs {
                hasher_input.push_str(b.as_str());
            }
            let image = Digest::parse(&format!(
                "sha256:{}",
                hex::encode(<sha2::Sha256 as sha2::Digest>::digest(hasher_input.as_bytes()))
            ))
            .unwrap();
            self.metadata.insert(&image, &blobs);
            image
        }
    }

    fn reference() -> ImageReference {
        ImageReference::new("ns", "app", "latest").unwrap()
    }

    #[tokio::test]
    async fn test_explode_checks_out_layers() {
        let h = Harness::new();
        let image = h.image(&[
            TarLayer::new().file("etc/os-release", b"ID=base"),
            TarLayer::new().file("app/run", b"#!/bin/sh"),
        ]);

        let outcome = h.materializer.explode(&reference(), &image).await.unwrap();
        assert_eq!(outcome, ExplodeOutcome::Exploded { layers: 2 });

        let rootfs = h.layout.checkout_path(&image);
        assert!(rootfs.join("etc/os-release").is_file());
        assert!(rootfs.join("app/run").is_file());
        assert!(!h.layout.incomplete_marker(&image).exists());
        assert_eq!(h.refs.digest_for(&reference()).await, Some(image));
    }

    #[tokio::test]
    async fn test_second_explode_short_circuits() {
        let h = Harness::new();
        let image = h.image(&[TarLayer::new().file("a", b"a")]);
        let other = ImageReference::new("ns", "app", "stable").unwrap();

        h.materializer.explode(&reference(), &image).await.unwrap();
        let outcome = h.materializer.explode(&other, &image).await.unwrap();

        assert_eq!(outcome, ExplodeOutcome::AlreadyMaterialized);
        assert_eq!(h.metadata.calls(), 1);
        assert_eq!(h.refs.digest_for(&other).await, Some(image));
    }

    #[tokio::test]
    async fn test_metadata_failure_leaves_pointer() {
        let h = Harness::new();
        let unknown = Digest::parse(&format!("sha256:{}", "9".repeat(64))).unwrap();

        let err = h.materializer.explode(&reference(), &unknown).await.unwrap_err();
        assert_eq!(err.stage(), "metadata");
        assert!(h.refs.digest_for(&reference()).await.is_none());
        assert!(!h.layout.checkout_path(&unknown).exists());
    }

    #[tokio::test]
    async fn test_missing_blob_poisons_without_pointer_update() {
        let h = Harness::new();
        let image = Digest::parse(&format!("sha256:{}", "7".repeat(64))).unwrap();
        let missing = Digest::parse(&format!("sha256:{}", "8".repeat(64))).unwrap();
        h.metadata.insert(&image, &[missing]);

        let err = h.materializer.explode(&reference(), &image).await.unwrap_err();
        assert_eq!(err.stage(), "blob");
        assert!(h.refs.digest_for(&reference()).await.is_none());
        assert!(h.layout.incomplete_marker(&image).exists());
    }

    #[tokio::test]
    async fn test_incomplete_checkout_is_rebuilt() {
        let h = Harness::new();
        let image = h.image(&[TarLayer::new().file("good", b"1")]);
        let rootfs = h.layout.checkout_path(&image);
        std::fs::create_dir_all(&rootfs).unwrap();
        std::fs::write(rootfs.join("partial"), b"junk").unwrap();
        std::fs::write(h.layout.incomplete_marker(&image), b"").unwrap();

        let outcome = h.materializer.explode(&reference(), &image).await.unwrap();
        assert_eq!(outcome, ExplodeOutcome::Exploded { layers: 1 });
        assert!(!rootfs.join("partial").exists());
        assert!(rootfs.join("good").exists());
    }

    #[tokio::test]
    async fn test_bare_rootfs_without_marker_is_rebuilt() {
        let h = Harness::new();
        let image = h.image(&[TarLayer::new().file("bin/sh", b"#!")]);
        let rootfs = h.layout.checkout_path(&image);
        std::fs::create_dir_all(&rootfs).unwrap();
        assert_eq!(
            checkout_state(&h.layout, &image).await.unwrap(),
            CheckoutState::Incomplete
        );

        let outcome = h.materializer.explode(&reference(), &image).await.unwrap();
        assert_eq!(outcome, ExplodeOutcome::Exploded { layers: 1 });
        assert!(rootfs.join("bin/sh").is_file());
        assert_eq!(
            checkout_state(&h.layout, &image).await.unwrap(),
            CheckoutState::Complete
        );
    }

    #[tokio::test]
    async fn test_read_only_incomplete_checkout_is_rebuilt() {
        use std::os::unix::fs::PermissionsExt;

        let h = Harness::new();
        let image = h.image(&[TarLayer::new().file("good", b"1")]);
        let rootfs = h.layout.checkout_path(&image);
        std::fs::create_dir_all(rootfs.join("usr/bin")).unwrap();
        std::fs::write(rootfs.join("usr/bin/partial"), b"junk").unwrap();
        std::fs::set_permissions(rootfs.join("usr/bin"), std::fs::Permissions::from_mode(0o555)).unwrap();
        std::fs::write(h.layout.incomplete_marker(&image), b"").unwrap();

        let outcome = h.materializer.explode(&reference(), &image).await.unwrap();
        assert_eq!(outcome, ExplodeOutcome::Exploded { layers: 1 });
        assert!(!rootfs.join("usr").exists());
        assert!(rootfs.join("good").exists());
    }

    #[tokio::test]
    async fn test_checkout_state() {
        let h = Harness::new();
        let image = h.image(&[TarLayer::new().file("a", b"a")]);
        let rootfs = h.layout.checkout_path(&image);

        assert_eq!(
            checkout_state(&h.layout, &image).await.unwrap(),
            CheckoutState::Missing
        );

        std::fs::create_dir_all(h.layout.digest_dir(&image)).unwrap();
        std::fs::write(h.layout.incomplete_marker(&image), b"").unwrap();
        assert_eq!(
            checkout_state(&h.layout, &image).await.unwrap(),
            CheckoutState::Missing
        );

        std::fs::create_dir_all(&rootfs).unwrap();
        std::fs::write(rootfs.join("a"), b"a").unwrap();
        assert_eq!(
            checkout_state(&h.layout, &image).await.unwrap(),
            CheckoutState::Incomplete
        );

        std::fs::remove_file(h.layout.incomplete_marker(&image)).unwrap();
        assert_eq!(
            checkout_state(&h.layout, &image).await.unwrap(),
            CheckoutState::Complete
        );

        std::fs::remove_dir_all(&rootfs).unwrap();
        std::fs::write(&rootfs, b"not a dir").unwrap();
        assert_eq!(
            checkout_state(&h.layout, &image).await.unwrap(),
            CheckoutState::Incomplete
        );
    }

    #[tokio::test]
    async fn test_shutdown_stops_before_first_layer() {
        let h = Harness::new();
        let image = h.image(&[TarLayer::new().file("a", b"a")]);
        let (tx, rx) = watch::channel(false);
        let materializer = h.materializer.with_shutdown(rx);
        tx.send(true).unwrap();

        let err = materializer.explode(&reference(), &image).await.unwrap_err();
        assert!(matches!(err, ExplodeError::Cancelled(_)));
        assert!(h.refs.digest_for(&reference()).await.is_none());
        assert!(h.layout.incomplete_marker(&image).exists());
    }
}
