//! Owner access to trees that contain read-only directories.
//!
//! Image layers routinely ship directories such as `usr/bin` at 0555. Without
//! CAP_DAC_OVERRIDE the controller cannot add, replace or delete entries below
//! them, so writers temporarily grant the owner `rwx` and put the recorded
//! mode back afterwards. Removal grants it on the whole subtree first.

use std::collections::HashMap;
use std::fs;
use std::io::{self, ErrorKind};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Owner bits needed to list, enter and modify a directory.
pub const OWNER_RWX: u32 = 0o700;

/// Give the owner `rwx` on directory `dir` when it lacks any of them.
///
/// Returns the previous permission bits when they were changed. Anything
/// that is not a directory is left alone.
pub fn grant_owner(dir: &Path) -> io::Result<Option<u32>> {
    let meta = fs::symlink_metadata(dir)?;
    if !meta.is_dir() {
        return Ok(None);
    }
    let mode = meta.permissions().mode() & 0o7777;
    if mode & OWNER_RWX == OWNER_RWX {
        return Ok(None);
    }
    fs::set_permissions(dir, fs::Permissions::from_mode(mode | OWNER_RWX))?;
    Ok(Some(mode))
}

/// Grant the owner `rwx` on every directory of the tree at `root`.
/// Symlinks are not followed.
pub fn make_removable(root: &Path) -> io::Result<()> {
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        if !fs::symlink_metadata(&dir)?.is_dir() {
            continue;
        }
        grant_owner(&dir)?;
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                pending.push(entry.path());
            }
        }
    }
    Ok(())
}

/// Delete `path`, read-only subdirectories included. A missing path is not
/// an error and anything but a directory is unlinked.
pub fn remove_tree(path: &Path) -> io::Result<()> {
    let result = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => make_removable(path).and_then(|()| fs::remove_dir_all(path)),
        Ok(_) => fs::remove_file(path),
        Err(e) => Err(e),
    };
    match result {
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        result => result,
    }
}

/// Directories opened for writing during one checkout, with their original
/// modes.
#[derive(Debug, Default)]
pub struct OpenedDirs {
    original: HashMap<PathBuf, u32>,
}

impl OpenedDirs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant the owner `rwx` on `root` and each existing directory between
    /// it and `dir`, so entries can be created or removed inside `dir`.
    ///
    /// `dir` must lie beneath `root`. The walk stops at the first missing
    /// component; it will be created writable.
    pub fn open(&mut self, root: &Path, dir: &Path) -> io::Result<()> {
        let rel = dir.strip_prefix(root).map_err(|_| {
            io::Error::new(
                ErrorKind::InvalidInput,
                format!("{} is not beneath {}", dir.display(), root.display()),
            )
        })?;

        let mut current = root.to_path_buf();
        if !self.grant(&current)? {
            return Ok(());
        }
        for part in rel.components() {
            current.push(part);
            if !self.grant(&current)? {
                break;
            }
        }
        Ok(())
    }

    /// Returns false when `path` does not exist.
    fn grant(&mut self, path: &Path) -> io::Result<bool> {
        if self.original.contains_key(path) {
            return Ok(true);
        }
        match grant_owner(path) {
            Ok(Some(mode)) => {
                self.original.insert(path.to_path_buf(), mode);
                Ok(true)
            }
            Ok(None) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Number of directories whose mode was changed.
    pub fn len(&self) -> usize {
        self.original.len()
    }

    pub fn is_empty(&self) -> bool {
        self.original.is_empty()
    }

    /// Put back the recorded modes, overridden by `modes` where given, and
    /// apply `modes` to the remaining directories as well.
    ///
    /// Deepest paths go first so a parent's mode never blocks a child.
    /// Paths that are no longer directories are skipped.
    pub fn restore(self, modes: &[(PathBuf, u32)]) -> io::Result<()> {
        let mut target = self.original;
        for (dir, mode) in modes {
            target.insert(dir.clone(), *mode);
        }
        let mut ordered: Vec<(PathBuf, u32)> = target.into_iter().collect();
        ordered.sort_by(|a, b| {
            b.0.components()
                .count()
                .cmp(&a.0.components().count())
                .then_with(|| a.0.cmp(&b.0))
        });

        for (dir, mode) in ordered {
            match fs::symlink_metadata(&dir) {
                Ok(meta) if meta.is_dir() => {
                    fs::set_permissions(&dir, fs::Permissions::from_mode(mode))?
                }
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn mode(path: &Path) -> u32 {
        fs::symlink_metadata(path).unwrap().permissions().mode() & 0o7777
    }

    fn set_mode(path: &Path, mode: u32) {
        fs::set_permissions(path, fs::Permissions::from_mode(mode)).unwrap();
    }

    #[test]
    fn test_grant_owner() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("bin");
        fs::create_dir(&dir).unwrap();
        set_mode(&dir, 0o555);

        assert_eq!(grant_owner(&dir).unwrap(), Some(0o555));
        assert_eq!(mode(&dir), 0o755);
        assert_eq!(grant_owner(&dir).unwrap(), None);

        let file = tmp.path().join("file");
        fs::write(&file, b"x").unwrap();
        set_mode(&file, 0o444);
        assert_eq!(grant_owner(&file).unwrap(), None);
        assert_eq!(mode(&file), 0o444);
    }

    #[test]
    fn test_remove_tree_with_read_only_dirs() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("rootfs");
        fs::create_dir_all(root.join("usr/bin")).unwrap();
        fs::write(root.join("usr/bin/sh"), b"#!").unwrap();
        set_mode(&root.join("usr/bin"), 0o555);
        set_mode(&root.join("usr"), 0o500);

        make_removable(&root).unwrap();
        assert_eq!(mode(&root.join("usr")), 0o700);
        assert_eq!(mode(&root.join("usr/bin")), 0o755);

        set_mode(&root.join("usr/bin"), 0o555);
        remove_tree(&root).unwrap();
        assert!(!root.exists());
        remove_tree(&root).unwrap();

        let file = tmp.path().join("stray");
        fs::write(&file, b"x").unwrap();
        remove_tree(&file).unwrap();
        assert!(!file.exists());
    }

    #[test]
    fn test_make_removable_does_not_follow_symlinks() {
        let tmp = TempDir::new().unwrap();
        let outside = tmp.path().join("outside");
        fs::create_dir(&outside).unwrap();
        set_mode(&outside, 0o555);

        let root = tmp.path().join("rootfs");
        fs::create_dir(&root).unwrap();
        std::os::unix::fs::symlink(&outside, root.join("link")).unwrap();

        make_removable(&root).unwrap();
        assert_eq!(mode(&outside), 0o555);
        set_mode(&outside, 0o755);
    }

    #[test]
    fn test_opened_dirs_restore() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("rootfs");
        fs::create_dir_all(root.join("usr/bin")).unwrap();
        set_mode(&root.join("usr/bin"), 0o555);
        set_mode(&root.join("usr"), 0o555);

        let mut opened = OpenedDirs::new();
        opened.open(&root, &root.join("usr/bin/missing/deeper")).unwrap();
        assert_eq!(opened.len(), 2);
        fs::write(root.join("usr/bin/app"), b"app").unwrap();

        opened.restore(&[(root.join("usr"), 0o751)]).unwrap();
        assert_eq!(mode(&root.join("usr/bin")), 0o555);
        assert_eq!(mode(&root.join("usr")), 0o751);
        assert!(root.join("usr/bin/app").exists());
    }

    #[test]
    fn test_open_rejects_paths_outside_root() {
        let tmp = TempDir::new().unwrap();
        let mut opened = OpenedDirs::new();
        let err = opened
            .open(&tmp.path().join("a"), &tmp.path().join("b"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }
}
