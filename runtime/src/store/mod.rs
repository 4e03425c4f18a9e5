//! Content-addressable tree store.
//!
//! The materializer only depends on the [`ContentStore`] contract: commit a
//! tree into a branch, then check a commit out onto a directory, optionally
//! overlaying it onto what is already there and honouring whiteouts.
//! [`TreeStore`] is the on-disk implementation used by the controller.
//!
//! ```text
//! .repo/
//! ├── config                     repository marker
//! ├── objects/<2 hex>/<62 hex>   deduplicated file content (SHA-256)
//! ├── commits/<id>.json          tree listing + parent + subject
//! ├── refs/heads/<branch>        branch head commit id
//! └── tmp/                       scratch space
//! ```

mod checkout;
mod tree;

use std::path::Path;

use explode_core::error::Result;

pub use tree::{CommitDocument, EntryKind, TreeEntry, TreeStore};

/// Whiteout file prefix: `.wh.<name>` deletes `<name>` from lower layers.
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// Opaque whiteout: hides every lower-layer entry of its directory.
pub const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// What a commit reads its tree from.
#[derive(Debug, Clone, Copy)]
pub enum CommitSource<'a> {
    /// A (possibly gzip-compressed) tar stream, read without unpacking.
    Tarball(&'a Path),
    /// An already-extracted directory tree.
    Directory(&'a Path),
}

impl CommitSource<'_> {
    pub fn path(&self) -> &Path {
        match self {
            CommitSource::Tarball(p) | CommitSource::Directory(p) => p,
        }
    }
}

/// Options for [`ContentStore::commit`].
#[derive(Debug, Clone, Default)]
pub struct CommitOptions {
    /// Commit subject, e.g. the layer's blob digest.
    pub subject: Option<String>,
    /// Synthesize parent directories missing from a tarball.
    pub tar_autocreate_parents: bool,
    /// Flush objects and commit documents to stable storage.
    pub fsync: bool,
}

/// Options for [`ContentStore::checkout`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CheckoutOptions {
    /// Overlay onto an existing destination instead of requiring it to be absent.
    pub union: bool,
    /// Interpret `.wh.` entries as deletions rather than writing them.
    pub whiteouts: bool,
}

impl CheckoutOptions {
    /// Union checkout with whiteout processing, as used for layered images.
    pub fn layered() -> Self {
        Self {
            union: true,
            whiteouts: true,
        }
    }
}

/// Versioned, deduplicating tree store.
///
/// Methods perform blocking I/O; async callers should run them on a blocking
/// thread.
pub trait ContentStore: Send + Sync {
    /// Create the repository if it does not exist yet.
    fn init(&self) -> Result<()>;

    /// Record `source` as a new commit on `branch` and return its id.
    fn commit(&self, source: CommitSource<'_>, branch: &str, options: &CommitOptions)
        -> Result<String>;

    /// Materialize `commit` onto `dest`.
    fn checkout(&self, commit: &str, dest: &Path, options: &CheckoutOptions) -> Result<()>;

    /// Current head of `branch`, if any commit was made on it.
    fn branch_head(&self, branch: &str) -> Result<Option<String>>;
}
