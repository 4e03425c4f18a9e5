//! Shared components, built once at startup.

use std::sync::Arc;

use explode_core::config::ExplodeConfig;
use explode_core::error::{ExplodeError, Result};
use tokio::sync::watch;

use crate::blob::{BlobResolver, LocalBlobStore};
use crate::gc::GcSweeper;
use crate::layout::StorageLayout;
use crate::locks::KeyedLocks;
use crate::materializer::LayerMaterializer;
use crate::metadata::ImageMetadataSource;
use crate::refstore::RefStore;
use crate::store::{ContentStore, TreeStore};

/// Everything the reconciliation components share.
///
/// Components receive what they need from here instead of reaching for
/// process-wide state.
#[derive(Clone)]
pub struct ExplodeContext {
    pub layout: StorageLayout,
    pub store: Arc<dyn ContentStore>,
    pub blobs: Arc<dyn BlobResolver>,
    pub metadata: Arc<dyn ImageMetadataSource>,
    pub refs: Arc<RefStore>,
    /// Held while a digest's checkout tree is written or removed.
    pub digest_locks: KeyedLocks,
    /// `host:port` of the locally-owned registry.
    pub registry_host: String,
    pub shutdown: watch::Receiver<bool>,
}

impl ExplodeContext {
    pub fn new(
        layout: StorageLayout,
        store: Arc<dyn ContentStore>,
        blobs: Arc<dyn BlobResolver>,
        metadata: Arc<dyn ImageMetadataSource>,
        registry_host: impl Into<String>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            refs: Arc::new(RefStore::new(layout.clone())),
            layout,
            store,
            blobs,
            metadata,
            digest_locks: KeyedLocks::new(),
            registry_host: registry_host.into(),
            shutdown,
        }
    }

    /// Context over the on-disk store and local blob source named by `config`.
    pub fn from_config(
        config: &ExplodeConfig,
        metadata: Arc<dyn ImageMetadataSource>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let layout = StorageLayout::new(&config.storage_root);
        let store = Arc::new(TreeStore::new(layout.repo_path()));
        let blobs = Arc::new(LocalBlobStore::from_source(&config.blob_source));
        Self::new(
            layout,
            store,
            blobs,
            metadata,
            config.registry_host.clone(),
            shutdown,
        )
    }

    /// Create the repository and the top-level directories.
    pub fn init(&self) -> Result<()> {
        self.store.init()?;
        for dir in [self.layout.images_root(), self.layout.digest_root()] {
            std::fs::create_dir_all(&dir).map_err(|e| {
                ExplodeError::ConfigError(format!(
                    "Could not create storage directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;
        }
        tracing::info!(root = %self.layout.root().display(), "Storage initialized");
        Ok(())
    }

    pub fn materializer(&self) -> LayerMaterializer {
        LayerMaterializer::new(
            self.layout.clone(),
            self.store.clone(),
            self.blobs.clone(),
            self.metadata.clone(),
            self.refs.clone(),
        )
        .with_digest_locks(self.digest_locks.clone())
        .with_shutdown(self.shutdown.clone())
    }

    pub fn sweeper(&self) -> GcSweeper {
        GcSweeper::new(
            self.layout.clone(),
            self.refs.clone(),
            self.digest_locks.clone(),
        )
    }
}
