//! Shared fixtures: a registry blob directory, layer tarballs and
//! collaborator fakes.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use explode_core::error::{ExplodeError, Result};
use explode_core::{Digest, ImageStream, Layer, TagEvent};
use explode_runtime::store::{CheckoutOptions, CommitOptions, CommitSource, ContentStore};
use explode_runtime::{
    ExplodeContext, ImageMetadataSource, LocalBlobStore, StorageLayout, TreeStore,
};
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use sha2::{Digest as _, Sha256};
use tar::{Builder, EntryType, Header};
use tempfile::TempDir;
use tokio::sync::watch;

pub const REGISTRY: &str = "172.30.1.1:5000";

/// Gzip-compressed layer tarball assembled in memory.
pub struct LayerTar {
    builder: Builder<GzEncoder<Vec<u8>>>,
}

impl LayerTar {
    pub fn new() -> Self {
        Self {
            builder: Builder::new(GzEncoder::new(Vec::new(), Compression::fast())),
        }
    }

    pub fn dir(self, path: &str) -> Self {
        self.dir_mode(path, 0o755)
    }

    pub fn dir_mode(mut self, path: &str, mode: u32) -> Self {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Directory);
        header.set_mode(mode);
        header.set_size(0);
        self.builder.append_data(&mut header, path, &[][..]).unwrap();
        self
    }

    pub fn file(mut self, path: &str, content: &str) -> Self {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_mode(0o644);
        header.set_size(content.len() as u64);
        self.builder
            .append_data(&mut header, path, content.as_bytes())
            .unwrap();
        self
    }

    pub fn symlink(mut self, path: &str, target: &str) -> Self {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Symlink);
        header.set_mode(0o777);
        header.set_size(0);
        self.builder.append_link(&mut header, path, target).unwrap();
        self
    }

    pub fn whiteout(self, path: &str) -> Self {
        let marker = match path.rsplit_once('/') {
            Some((parent, name)) => format!("{}/.wh.{}", parent, name),
            None => format!(".wh.{}", path),
        };
        self.file(&marker, "")
    }

    pub fn opaque(self, dir: &str) -> Self {
        self.file(&format!("{}/.wh..wh..opq", dir), "")
    }

    /// Finish the archive and store it as a registry blob.
    pub fn publish(self, registry: &Registry) -> Digest {
        let data = self.builder.into_inner().unwrap().finish().unwrap();
        registry.put(&data)
    }
}

/// Registry storage directory plus an image catalog.
pub struct Registry {
    pub blobs: LocalBlobStore,
    pub metadata: Arc<StaticMetadata>,
}

impl Registry {
    pub fn new(root: &Path) -> Self {
        Self {
            blobs: LocalBlobStore::new(root),
            metadata: Arc::new(StaticMetadata::default()),
        }
    }

    pub fn put(&self, data: &[u8]) -> Digest {
        let digest = Digest::parse(&format!("sha256:{}", hex::encode(Sha256::digest(data)))).unwrap();
        let path = self.blobs.data_path(&digest);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, data).unwrap();
        digest
    }

    /// Register an image made of `layers` (base first) and return its digest.
    pub fn image(&self, name: &str, layers: &[Digest]) -> Digest {
        let image = Digest::parse(&format!("sha256:{}", hex::encode(Sha256::digest(name.as_bytes())))).unwrap();
        self.metadata.insert(&image, layers);
        image
    }
}

/// Metadata source backed by a map, counting lookups.
#[derive(Default)]
pub struct StaticMetadata {
    images: Mutex<HashMap<Digest, Vec<Layer>>>,
    calls: AtomicUsize,
}

impl StaticMetadata {
    pub fn insert(&self, image: &Digest, blobs: &[Digest]) {
        let layers = blobs.iter().cloned().map(Layer::new).collect();
        self.images.lock().insert(image.clone(), layers);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageMetadataSource for StaticMetadata {
    async fn image_layers(&self, digest: &Digest) -> Result<Vec<Layer>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        // Widen the window in which concurrent callers can overlap.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        self.images
            .lock()
            .get(digest)
            .cloned()
            .ok_or_else(|| ExplodeError::MetadataFetch {
                digest: digest.to_string(),
                message: "404 Not Found".to_string(),
            })
    }
}

/// Tree store whose tarball commits always fail.
pub struct TarCommitsFail {
    inner: TreeStore,
    pub tar_attempts: AtomicUsize,
    pub dir_commits: AtomicUsize,
}

impl TarCommitsFail {
    pub fn new(inner: TreeStore) -> Self {
        Self {
            inner,
            tar_attempts: AtomicUsize::new(0),
            dir_commits: AtomicUsize::new(0),
        }
    }
}

impl ContentStore for TarCommitsFail {
    fn init(&self) -> Result<()> {
        self.inner.init()
    }

    fn commit(&self, source: CommitSource<'_>, branch: &str, options: &CommitOptions) -> Result<String> {
        match source {
            CommitSource::Tarball(_) => {
                self.tar_attempts.fetch_add(1, Ordering::SeqCst);
                Err(ExplodeError::Commit {
                    branch: branch.to_string(),
                    message: "unsupported tar feature".to_string(),
                })
            }
            CommitSource::Directory(_) => {
                self.dir_commits.fetch_add(1, Ordering::SeqCst);
                self.inner.commit(source, branch, options)
            }
        }
    }

    fn checkout(&self, commit: &str, dest: &Path, options: &CheckoutOptions) -> Result<()> {
        self.inner.checkout(commit, dest, options)
    }

    fn branch_head(&self, branch: &str) -> Result<Option<String>> {
        self.inner.branch_head(branch)
    }
}

/// A storage root and registry under one temporary directory.
pub struct Harness {
    pub tmp: TempDir,
    pub registry: Registry,
    pub ctx: ExplodeContext,
    _shutdown: watch::Sender<bool>,
}

impl Harness {
    pub fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let layout = StorageLayout::new(tmp.path().join("explode"));
        let store = Arc::new(TreeStore::new(layout.repo_path()));
        Self::with_store(tmp, layout, store)
    }

    pub fn with_failing_tar_commits() -> (Self, Arc<TarCommitsFail>) {
        let tmp = TempDir::new().unwrap();
        let layout = StorageLayout::new(tmp.path().join("explode"));
        let store = Arc::new(TarCommitsFail::new(TreeStore::new(layout.repo_path())));
        (Self::with_store(tmp, layout, store.clone()), store)
    }

    fn with_store(tmp: TempDir, layout: StorageLayout, store: Arc<dyn ContentStore>) -> Self {
        let registry = Registry::new(&tmp.path().join("registry"));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let ctx = ExplodeContext::new(
            layout,
            store,
            Arc::new(registry.blobs.clone()),
            registry.metadata.clone(),
            REGISTRY,
            shutdown_rx,
        );
        ctx.init().unwrap();
        Self {
            tmp,
            registry,
            ctx,
            _shutdown: shutdown_tx,
        }
    }

    pub fn rootfs(&self, image: &Digest) -> std::path::PathBuf {
        self.ctx.layout.checkout_path(image)
    }
}

/// Tag event for an image pushed to the local registry.
pub fn local_tag(namespace: &str, name: &str, image: &Digest) -> TagEvent {
    TagEvent::new(image.as_str(), format!("{}/{}/{}@{}", REGISTRY, namespace, name, image))
}

pub fn stream(namespace: &str, name: &str, tags: &[(&str, Vec<TagEvent>)]) -> ImageStream {
    tags.iter()
        .fold(ImageStream::new(namespace, name), |stream, (tag, history)| {
            stream.with_tag(*tag, history.clone())
        })
}

pub fn read(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap()
}
