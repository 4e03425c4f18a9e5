use std::fs::{self, File};
use std::io::{self, ErrorKind};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use super::tree::{invalid, EntryKind, TreeEntry, TreeStore};
use super::{CheckoutOptions, OPAQUE_WHITEOUT, WHITEOUT_PREFIX};
use crate::perms::{self, OpenedDirs};

impl TreeStore {
    /// Write the tree of commit `id` onto `dest`.
    ///
    /// Whiteouts are applied before any entry is written so that a layer can
    /// both delete and recreate the same path.
    pub(super) fn checkout_commit(
        &self,
        id: &str,
        dest: &Path,
        options: &CheckoutOptions,
    ) -> io::Result<()> {
        let doc = self.read_commit(id)?;

        if !options.union && fs::symlink_metadata(dest).is_ok() {
            return Err(io::Error::new(
                ErrorKind::AlreadyExists,
                "destination exists",
            ));
        }
        fs::create_dir_all(dest)?;

        // Lower layers may have left read-only directories in the way. They
        // are opened for the owner while this commit writes and get their
        // recorded modes back afterwards, even when the checkout fails.
        let mut opened = OpenedDirs::new();
        let mut dirs = Vec::new();
        let written = self.write_entries(&doc.entries, dest, options, &mut opened, &mut dirs);
        let restored = opened.restore(&dirs);
        written?;
        restored?;

        tracing::trace!(commit = %id, dest = %dest.display(), entries = doc.entries.len(), "Checked out commit");
        Ok(())
    }

    fn write_entries(
        &self,
        entries: &[TreeEntry],
        dest: &Path,
        options: &CheckoutOptions,
        opened: &mut OpenedDirs,
        dirs: &mut Vec<(PathBuf, u32)>,
    ) -> io::Result<()> {
        if options.whiteouts {
            for entry in entries.iter().filter(|e| is_whiteout(e)) {
                apply_whiteout(dest, entry, opened)?;
            }
        }

        for entry in entries {
            if options.whiteouts && is_whiteout(entry) {
                continue;
            }
            let target = resolve_beneath(dest, &entry.path)?;
            if target == dest {
                return Err(invalid(format!("entry {:?} names the checkout root", entry.path)));
            }
            opened.open(dest, parent_of(&target)?)?;
            match &entry.kind {
                EntryKind::Dir => {
                    match fs::symlink_metadata(&target) {
                        Ok(meta) if meta.is_dir() => {}
                        Ok(_) => {
                            remove_path(&target)?;
                            fs::create_dir(&target)?;
                        }
                        Err(e) if e.kind() == ErrorKind::NotFound => fs::create_dir_all(&target)?,
                        Err(e) => return Err(e),
                    }
                    dirs.push((target, entry.mode));
                }
                EntryKind::File { object, .. } => {
                    self.write_file(object, &target, entry.mode)?;
                }
                EntryKind::Symlink { target: link } => {
                    remove_path(&target)?;
                    ensure_parent(&target)?;
                    std::os::unix::fs::symlink(link, &target)?;
                }
            }
        }
        Ok(())
    }

    fn write_file(&self, object: &str, target: &Path, mode: u32) -> io::Result<()> {
        if let Ok(meta) = fs::symlink_metadata(target) {
            if meta.is_dir() {
                perms::remove_tree(target)?;
            }
        }
        let parent = ensure_parent(target)?;

        let mut src = File::open(self.object_path(object))?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        io::copy(&mut src, tmp.as_file_mut())?;
        tmp.as_file()
            .set_permissions(fs::Permissions::from_mode(mode))?;
        tmp.persist(target).map_err(|e| e.error)?;
        Ok(())
    }
}

fn is_whiteout(entry: &TreeEntry) -> bool {
    entry.file_name().starts_with(WHITEOUT_PREFIX)
}

fn apply_whiteout(dest: &Path, entry: &TreeEntry, opened: &mut OpenedDirs) -> io::Result<()> {
    let parent = resolve_beneath(dest, entry.parent())?;
    match fs::symlink_metadata(&parent) {
        Ok(meta) if meta.is_dir() => {}
        // Nothing below to hide.
        _ => return Ok(()),
    }
    opened.open(dest, &parent)?;

    let name = entry.file_name();
    if name == OPAQUE_WHITEOUT {
        for child in fs::read_dir(&parent)? {
            remove_path(&child?.path())?;
        }
        return Ok(());
    }

    let hidden = &name[WHITEOUT_PREFIX.len()..];
    if hidden.is_empty() || hidden == "." || hidden == ".." {
        return Err(invalid(format!("malformed whiteout {}", entry.path)));
    }
    remove_path(&parent.join(hidden))
}

/// Join `rel` onto `dest`, refusing to traverse symlinks inside the tree.
fn resolve_beneath(dest: &Path, rel: &str) -> io::Result<PathBuf> {
    let mut current = dest.to_path_buf();
    let mut parts = rel.split('/').filter(|p| !p.is_empty()).peekable();
    while let Some(part) = parts.next() {
        if part == "." || part == ".." {
            return Err(invalid(format!("path escapes the tree: {}", rel)));
        }
        current.push(part);
        if parts.peek().is_some() {
            if let Ok(meta) = fs::symlink_metadata(&current) {
                if meta.file_type().is_symlink() {
                    return Err(invalid(format!(
                        "refusing to write {} through symlink {}",
                        rel,
                        current.display()
                    )));
                }
            }
        }
    }
    Ok(current)
}

fn parent_of(target: &Path) -> io::Result<&Path> {
    target
        .parent()
        .ok_or_else(|| invalid(format!("{} has no parent", target.display())))
}

fn ensure_parent(target: &Path) -> io::Result<&Path> {
    let parent = parent_of(target)?;
    fs::create_dir_all(parent)?;
    Ok(parent)
}

fn remove_path(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => perms::remove_tree(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
