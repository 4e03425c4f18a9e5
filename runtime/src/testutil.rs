//! Fixtures for unit tests: layer tarballs, a registry blob directory and
//! collaborator fakes.

use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use explode_core::error::{ExplodeError, Result};
use explode_core::{Digest, Layer};
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use sha2::{Digest as _, Sha256};
use tar::{Builder, EntryType, Header};

use crate::blob::LocalBlobStore;
use crate::metadata::ImageMetadataSource;
use crate::store::{CheckoutOptions, CommitOptions, CommitSource, ContentStore, TreeStore};

enum Item {
    Dir(String, u32),
    File {
        path: String,
        content: Vec<u8>,
        mode: u32,
        xattr: Option<(String, Vec<u8>)>,
    },
    Symlink(String, String),
    Hardlink(String, String),
    Fifo(String),
}

/// Builder for small layer tarballs.
#[derive(Default)]
pub(crate) struct TarLayer {
    items: Vec<Item>,
}

impl TarLayer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dir(self, path: &str) -> Self {
        self.dir_mode(path, 0o755)
    }

    pub fn dir_mode(mut self, path: &str, mode: u32) -> Self {
        self.items.push(Item::Dir(path.to_string(), mode));
        self
    }

    pub fn file(self, path: &str, content: &[u8]) -> Self {
        self.file_mode(path, content, 0o644)
    }

    pub fn file_mode(mut self, path: &str, content: &[u8], mode: u32) -> Self {
        self.items.push(Item::File {
            path: path.to_string(),
            content: content.to_vec(),
            mode,
            xattr: None,
        });
        self
    }

    pub fn file_with_xattr(mut self, path: &str, content: &[u8], name: &str, value: &[u8]) -> Self {
        self.items.push(Item::File {
            path: path.to_string(),
            content: content.to_vec(),
            mode: 0o755,
            xattr: Some((name.to_string(), value.to_vec())),
        });
        self
    }

    pub fn symlink(mut self, path: &str, target: &str) -> Self {
        self.items
            .push(Item::Symlink(path.to_string(), target.to_string()));
        self
    }

    pub fn hardlink(mut self, path: &str, target: &str) -> Self {
        self.items
            .push(Item::Hardlink(path.to_string(), target.to_string()));
        self
    }

    pub fn fifo(mut self, path: &str) -> Self {
        self.items.push(Item::Fifo(path.to_string()));
        self
    }

    /// `.wh.` entry hiding `path` from lower layers.
    pub fn whiteout(self, path: &str) -> Self {
        let marker = match path.rsplit_once('/') {
            Some((parent, name)) => format!("{}/.wh.{}", parent, name),
            None => format!(".wh.{}", path),
        };
        self.file(&marker, b"")
    }

    /// Opaque whiteout for directory `dir`.
    pub fn opaque(self, dir: &str) -> Self {
        self.file(&format!("{}/.wh..wh..opq", dir), b"")
    }

    pub fn write(&self, path: &Path) {
        let file = File::create(path).unwrap();
        let file = self.append_to(file);
        file.sync_all().unwrap();
    }

    pub fn write_gzip(&self, path: &Path) {
        let file = File::create(path).unwrap();
        let encoder = GzEncoder::new(file, Compression::default());
        self.append_to(encoder).finish().unwrap();
    }

    fn append_to<W: Write>(&self, writer: W) -> W {
        let mut builder = Builder::new(writer);
        for item in &self.items {
            let mut header = Header::new_gnu();
            match item {
                Item::Dir(path, mode) => {
                    header.set_entry_type(EntryType::Directory);
                    header.set_mode(*mode);
                    header.set_size(0);
                    builder.append_data(&mut header, path, &[][..]).unwrap();
                }
                Item::File {
                    path,
                    content,
                    mode,
                    xattr,
                } => {
                    if let Some((name, value)) = xattr {
                        let key = format!("SCHILY.xattr.{}", name);
                        builder
                            .append_pax_extensions([(key.as_str(), value.as_slice())])
                            .unwrap();
                    }
                    header.set_entry_type(EntryType::Regular);
                    header.set_mode(*mode);
                    header.set_size(content.len() as u64);
                    builder
                        .append_data(&mut header, path, content.as_slice())
                        .unwrap();
                }
                Item::Symlink(path, target) => {
                    header.set_entry_type(EntryType::Symlink);
                    header.set_mode(0o777);
                    header.set_size(0);
                    builder.append_link(&mut header, path, target).unwrap();
                }
                Item::Hardlink(path, target) => {
                    header.set_entry_type(EntryType::Link);
                    header.set_mode(0o644);
                    header.set_size(0);
                    builder.append_link(&mut header, path, target).unwrap();
                }
                Item::Fifo(path) => {
                    header.set_entry_type(EntryType::Fifo);
                    header.set_mode(0o644);
                    header.set_size(0);
                    builder.append_data(&mut header, path, &[][..]).unwrap();
                }
            }
        }
        builder.into_inner().unwrap()
    }
}

/// Store `layer` as a gzip blob in the registry layout of `blobs`.
pub(crate) fn put_blob(blobs: &LocalBlobStore, layer: &TarLayer) -> Digest {
    let staging = tempfile::NamedTempFile::new().unwrap();
    layer.write_gzip(staging.path());
    let data = std::fs::read(staging.path()).unwrap();
    let digest = Digest::parse(&format!("sha256:{}", hex::encode(Sha256::digest(&data)))).unwrap();

    let path = blobs.data_path(&digest);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, data).unwrap();
    digest
}

/// In-memory metadata source counting lookups.
#[derive(Default)]
pub(crate) struct StaticMetadata {
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

/// Content store that refuses tarball commits.
pub(crate) struct DirectCommitFails {
    inner: TreeStore,
    direct_attempts: AtomicUsize,
}

impl DirectCommitFails {
    pub fn new(inner: TreeStore) -> Self {
        Self {
            inner,
            direct_attempts: AtomicUsize::new(0),
        }
    }

    pub fn direct_attempts(&self) -> usize {
        self.direct_attempts.load(Ordering::SeqCst)
    }
}

impl ContentStore for DirectCommitFails {
    fn init(&self) -> Result<()> {
        self.inner.init()
    }

    fn commit(&self, source: CommitSource<'_>, branch: &str, options: &CommitOptions) -> Result<String> {
        if let CommitSource::Tarball(_) = source {
            self.direct_attempts.fetch_add(1, Ordering::SeqCst);
            return Err(ExplodeError::Commit {
                branch: branch.to_string(),
                message: "tar commits disabled".to_string(),
            });
        }
        self.inner.commit(source, branch, options)
    }

    fn checkout(&self, commit: &str, dest: &Path, options: &CheckoutOptions) -> Result<()> {
        self.inner.checkout(commit, dest, options)
    }

    fn branch_head(&self, branch: &str) -> Result<Option<String>> {
        self.inner.branch_head(branch)
    }
}
