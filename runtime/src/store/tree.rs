//! On-disk [`ContentStore`] implementation.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, ErrorKind, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use explode_core::error::{ExplodeError, Result};
use flate2::read::GzDecoder;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use super::{CheckoutOptions, CommitOptions, CommitSource, ContentStore};

const REPO_CONFIG: &str = "config";
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const XATTR_PAX_PREFIX: &str = "SCHILY.xattr.";

/// Kind of a tree entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EntryKind {
    Dir,
    File { object: String, size: u64 },
    Symlink { target: String },
}

/// One path of a committed tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEntry {
    /// Slash-separated path relative to the tree root, never empty.
    pub path: String,
    /// Permission bits (`0o7777` mask).
    pub mode: u32,
    pub kind: EntryKind,
    /// Extended attributes carried by the source archive, values hex-encoded.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub xattrs: BTreeMap<String, String>,
}

impl TreeEntry {
    pub fn file_name(&self) -> &str {
        match self.path.rfind('/') {
            Some(i) => &self.path[i + 1..],
            None => &self.path,
        }
    }

    /// Parent path, `""` for top-level entries.
    pub fn parent(&self) -> &str {
        match self.path.rfind('/') {
            Some(i) => &self.path[..i],
            None => "",
        }
    }
}

/// A commit as stored under `commits/<id>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitDocument {
    pub branch: String,
    pub parent: Option<String>,
    pub subject: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Entries sorted by path; a directory always precedes its children.
    pub entries: Vec<TreeEntry>,
}

/// Filesystem-backed content store.
pub struct TreeStore {
    repo: PathBuf,
    /// Serializes branch head updates.
    heads: Mutex<()>,
}

impl TreeStore {
    pub fn new(repo: impl Into<PathBuf>) -> Self {
        Self {
            repo: repo.into(),
            heads: Mutex::new(()),
        }
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo
    }

    fn objects_dir(&self) -> PathBuf {
        self.repo.join("objects")
    }

    fn commits_dir(&self) -> PathBuf {
        self.repo.join("commits")
    }

    fn heads_dir(&self) -> PathBuf {
        self.repo.join("refs").join("heads")
    }

    pub(super) fn tmp_dir(&self) -> PathBuf {
        self.repo.join("tmp")
    }

    pub(super) fn object_path(&self, object: &str) -> PathBuf {
        let (prefix, rest) = object.split_at(2.min(object.len()));
        self.objects_dir().join(prefix).join(rest)
    }

    fn commit_path(&self, id: &str) -> PathBuf {
        self.commits_dir().join(format!("{}.json", id))
    }

    fn head_path(&self, branch: &str) -> io::Result<PathBuf> {
        let mut path = self.heads_dir();
        for segment in branch.split('/') {
            if segment.is_empty() || segment == "." || segment == ".." {
                return Err(invalid(format!("invalid branch name {:?}", branch)));
            }
            path.push(segment);
        }
        Ok(path)
    }

    /// Load a commit document by id.
    pub fn load_commit(&self, id: &str) -> Result<CommitDocument> {
        Ok(self.read_commit(id)?)
    }

    pub(super) fn read_commit(&self, id: &str) -> io::Result<CommitDocument> {
        if !is_object_id(id) {
            return Err(invalid(format!("invalid commit id {:?}", id)));
        }
        let data = fs::read(self.commit_path(id))?;
        let doc: CommitDocument =
            serde_json::from_slice(&data).map_err(|e| io::Error::new(ErrorKind::InvalidData, e))?;
        for entry in &doc.entries {
            if let EntryKind::File { object, .. } = &entry.kind {
                if !is_object_id(object) {
                    return Err(invalid(format!(
                        "commit {} references invalid object {:?}",
                        id, object
                    )));
                }
            }
        }
        Ok(doc)
    }

    /// Copy `reader` into the object store, returning its id and size.
    fn store_object(&self, reader: &mut dyn Read, fsync: bool) -> io::Result<(String, u64)> {
        let mut tmp = tempfile::NamedTempFile::new_in(self.tmp_dir())?;
        let mut hasher = Sha256::new();
        let mut size = 0u64;
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            tmp.write_all(&buf[..n])?;
            size += n as u64;
        }
        if fsync {
            tmp.as_file().sync_all()?;
        }

        let id = hex::encode(hasher.finalize());
        let dest = self.object_path(&id);
        if !dest.exists() {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            tmp.persist(&dest).map_err(|e| e.error)?;
        }
        Ok((id, size))
    }

    fn read_tarball(&self, tarball: &Path, options: &CommitOptions) -> io::Result<Vec<TreeEntry>> {
        let mut reader = BufReader::new(File::open(tarball)?);
        let gzipped = reader.fill_buf()?.starts_with(&GZIP_MAGIC);
        let stream: Box<dyn Read> = if gzipped {
            Box::new(GzDecoder::new(reader))
        } else {
            Box::new(reader)
        };

        let mut archive = tar::Archive::new(stream);
        let mut tree = TreeBuilder::new(options.tar_autocreate_parents);

        for entry in archive.entries()? {
            let mut entry = entry?;
            let entry_type = entry.header().entry_type();
            if entry_type == tar::EntryType::XGlobalHeader {
                continue;
            }
            let path = normalize(&entry.path()?)?;
            if path.is_empty() {
                continue;
            }
            let mode = entry.header().mode()? & 0o7777;
            let xattrs = pax_xattrs(&mut entry)?;

            let kind = match entry_type {
                tar::EntryType::Directory => EntryKind::Dir,
                tar::EntryType::Regular | tar::EntryType::Continuous => {
                    let (object, size) = self.store_object(&mut entry, options.fsync)?;
                    EntryKind::File { object, size }
                }
                tar::EntryType::Symlink => {
                    let target = entry
                        .link_name()?
                        .ok_or_else(|| invalid(format!("symlink {} has no target", path)))?;
                    EntryKind::Symlink {
                        target: utf8(&target)?.to_string(),
                    }
                }
                tar::EntryType::Link => {
                    let target = entry
                        .link_name()?
                        .ok_or_else(|| invalid(format!("hardlink {} has no target", path)))?;
                    let target = normalize(&target)?;
                    match tree.get(&target) {
                        Some(TreeEntry {
                            kind: kind @ EntryKind::File { .. },
                            ..
                        }) => kind.clone(),
                        _ => {
                            return Err(invalid(format!(
                                "hardlink {} points at unknown file {}",
                                path, target
                            )))
                        }
                    }
                }
                other => {
                    return Err(invalid(format!(
                        "unsupported entry type {:?} at {}",
                        other, path
                    )))
                }
            };

            tree.insert(TreeEntry {
                path,
                mode,
                kind,
                xattrs,
            })?;
        }

        Ok(tree.finish())
    }

    fn read_directory(&self, root: &Path, options: &CommitOptions) -> io::Result<Vec<TreeEntry>> {
        let mut tree = TreeBuilder::new(true);
        let mut pending = vec![(root.to_path_buf(), String::new())];

        while let Some((dir, rel)) = pending.pop() {
            let mut children = fs::read_dir(&dir)?.collect::<io::Result<Vec<_>>>()?;
            children.sort_by_key(|child| child.file_name());

            for child in children {
                let name = child
                    .file_name()
                    .into_string()
                    .map_err(|n| invalid(format!("non UTF-8 file name {:?}", n)))?;
                let path = if rel.is_empty() {
                    name
                } else {
                    format!("{}/{}", rel, name)
                };
                let meta = fs::symlink_metadata(child.path())?;
                let mode = meta.permissions().mode() & 0o7777;
                let file_type = meta.file_type();

                let kind = if file_type.is_dir() {
                    pending.push((child.path(), path.clone()));
                    EntryKind::Dir
                } else if file_type.is_file() {
                    let mut file = File::open(child.path())?;
                    let (object, size) = self.store_object(&mut file, options.fsync)?;
                    EntryKind::File { object, size }
                } else if file_type.is_symlink() {
                    let target = fs::read_link(child.path())?;
                    EntryKind::Symlink {
                        target: utf8(&target)?.to_string(),
                    }
                } else {
                    return Err(invalid(format!("unsupported file type at {}", path)));
                };

                tree.insert(TreeEntry {
                    path,
                    mode,
                    kind,
                    xattrs: BTreeMap::new(),
                })?;
            }
        }

        Ok(tree.finish())
    }

    fn write_commit(
        &self,
        branch: &str,
        options: &CommitOptions,
        entries: Vec<TreeEntry>,
    ) -> io::Result<String> {
        let head_path = self.head_path(branch)?;
        let _heads = self.heads.lock();

        let doc = CommitDocument {
            branch: branch.to_string(),
            parent: read_head(&head_path)?,
            subject: options.subject.clone(),
            timestamp: Utc::now(),
            entries,
        };
        let bytes = serde_json::to_vec(&doc).map_err(|e| io::Error::new(ErrorKind::InvalidData, e))?;
        let id = hex::encode(Sha256::digest(&bytes));

        self.write_atomic(&self.commit_path(&id), &bytes, options.fsync)?;
        self.write_atomic(&head_path, id.as_bytes(), options.fsync)?;
        Ok(id)
    }

    fn write_atomic(&self, dest: &Path, bytes: &[u8], fsync: bool) -> io::Result<()> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut tmp = tempfile::NamedTempFile::new_in(self.tmp_dir())?;
        tmp.write_all(bytes)?;
        if fsync {
            tmp.as_file().sync_all()?;
        }
        tmp.persist(dest).map_err(|e| e.error)?;
        Ok(())
    }
}

impl ContentStore for TreeStore {
    fn init(&self) -> Result<()> {
        for dir in [
            self.objects_dir(),
            self.commits_dir(),
            self.heads_dir(),
            self.tmp_dir(),
        ] {
            fs::create_dir_all(&dir).map_err(|e| {
                ExplodeError::ConfigError(format!(
                    "Could not initialize repository directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;
        }

        let config = self.repo.join(REPO_CONFIG);
        if config.exists() {
            tracing::debug!(repo = %self.repo.display(), "Repository already initialized");
        } else {
            fs::write(&config, "{\"version\":1}\n").map_err(|e| {
                ExplodeError::ConfigError(format!(
                    "Could not write repository config {}: {}",
                    config.display(),
                    e
                ))
            })?;
            tracing::info!(repo = %self.repo.display(), "Initialized repository");
        }
        Ok(())
    }

    fn commit(
        &self,
        source: CommitSource<'_>,
        branch: &str,
        options: &CommitOptions,
    ) -> Result<String> {
        let entries = match source {
            CommitSource::Tarball(path) => self.read_tarball(path, options),
            CommitSource::Directory(path) => self.read_directory(path, options),
        };
        let id = entries
            .and_then(|entries| self.write_commit(branch, options, entries))
            .map_err(|e| ExplodeError::Commit {
                branch: branch.to_string(),
                message: format!("{}: {}", source.path().display(), e),
            })?;

        tracing::debug!(branch = %branch, commit = %id, source = %source.path().display(), "Committed tree");
        Ok(id)
    }

    fn checkout(&self, commit: &str, dest: &Path, options: &CheckoutOptions) -> Result<()> {
        self.checkout_commit(commit, dest, options)
            .map_err(|e| ExplodeError::Checkout {
                commit: commit.to_string(),
                path: dest.display().to_string(),
                message: e.to_string(),
            })
    }

    fn branch_head(&self, branch: &str) -> Result<Option<String>> {
        let path = self.head_path(branch)?;
        Ok(read_head(&path)?)
    }
}

/// Accumulates entries keyed by path; later entries replace earlier ones.
struct TreeBuilder {
    entries: BTreeMap<String, TreeEntry>,
    autocreate_parents: bool,
}

impl TreeBuilder {
    fn new(autocreate_parents: bool) -> Self {
        Self {
            entries: BTreeMap::new(),
            autocreate_parents,
        }
    }

    fn get(&self, path: &str) -> Option<&TreeEntry> {
        self.entries.get(path)
    }

    fn insert(&mut self, entry: TreeEntry) -> io::Result<()> {
        self.ensure_parents(&entry.path)?;
        if entry.kind != EntryKind::Dir {
            // A non-directory replacing a directory drops the directory's children.
            let prefix = format!("{}/", entry.path);
            self.entries.retain(|path, _| !path.starts_with(&prefix));
        }
        self.entries.insert(entry.path.clone(), entry);
        Ok(())
    }

    fn ensure_parents(&mut self, path: &str) -> io::Result<()> {
        for (i, _) in path.match_indices('/') {
            let parent = &path[..i];
            match self.entries.get(parent) {
                Some(existing) if existing.kind == EntryKind::Dir => {}
                Some(_) => {
                    return Err(invalid(format!("parent of {} is not a directory", path)));
                }
                None if self.autocreate_parents => {
                    self.entries.insert(
                        parent.to_string(),
                        TreeEntry {
                            path: parent.to_string(),
                            mode: 0o755,
                            kind: EntryKind::Dir,
                            xattrs: BTreeMap::new(),
                        },
                    );
                }
                None => {
                    return Err(invalid(format!("missing parent directory for {}", path)));
                }
            }
        }
        Ok(())
    }

    fn finish(self) -> Vec<TreeEntry> {
        self.entries.into_values().collect()
    }
}

fn pax_xattrs<R: Read>(entry: &mut tar::Entry<'_, R>) -> io::Result<BTreeMap<String, String>> {
    let mut xattrs = BTreeMap::new();
    if let Some(extensions) = entry.pax_extensions()? {
        for extension in extensions {
            let extension = extension?;
            if let Ok(key) = extension.key() {
                if let Some(name) = key.strip_prefix(XATTR_PAX_PREFIX) {
                    xattrs.insert(name.to_string(), hex::encode(extension.value_bytes()));
                }
            }
        }
    }
    Ok(xattrs)
}

/// Slash-joined relative form of an archive path; rejects `..`.
fn normalize(path: &Path) -> io::Result<String> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(
                part.to_str()
                    .ok_or_else(|| invalid(format!("non UTF-8 path {:?}", path)))?,
            ),
            Component::CurDir | Component::RootDir => {}
            Component::ParentDir | Component::Prefix(_) => {
                return Err(invalid(format!("path escapes the tree: {}", path.display())));
            }
        }
    }
    Ok(parts.join("/"))
}

fn utf8(path: &Path) -> io::Result<&str> {
    path.to_str()
        .ok_or_else(|| invalid(format!("non UTF-8 path {:?}", path)))
}

fn read_head(path: &Path) -> io::Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(id) => Ok(Some(id.trim().to_string())),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

fn is_object_id(id: &str) -> bool {
    id.len() == 64 && id.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

pub(super) fn invalid(message: String) -> io::Error {
    io::Error::new(ErrorKind::InvalidData, message)
}
