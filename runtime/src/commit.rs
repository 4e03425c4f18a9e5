//! Layer commit strategies.
//!
//! A layer blob is first committed directly as a tar tree. If the store
//! refuses it, the blob is unpacked onto a scratch directory and that
//! directory is committed instead.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use explode_core::error::{ExplodeError, Result};

use crate::layers::extract_layer;
use crate::perms;
use crate::store::{CommitOptions, CommitSource, ContentStore};

/// How a layer blob is turned into a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitStrategy {
    /// Stream the blob into the store as a tar tree.
    DirectTreeCommit,
    /// Unpack the blob to scratch space and commit the resulting directory.
    ExtractThenCommit,
}

impl fmt::Display for CommitStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DirectTreeCommit => write!(f, "direct"),
            Self::ExtractThenCommit => write!(f, "extract"),
        }
    }
}

/// Commits layer blobs onto per-digest branches.
#[derive(Clone)]
pub struct LayerCommitter {
    store: Arc<dyn ContentStore>,
    scratch_root: PathBuf,
}

impl LayerCommitter {
    pub fn new(store: Arc<dyn ContentStore>, scratch_root: impl Into<PathBuf>) -> Self {
        Self {
            store,
            scratch_root: scratch_root.into(),
        }
    }

    pub fn scratch_root(&self) -> &Path {
        &self.scratch_root
    }

    /// Commit `blob` onto `branch` with a single strategy.
    pub fn commit_layer(
        &self,
        strategy: CommitStrategy,
        blob: &Path,
        branch: &str,
        subject: &str,
    ) -> Result<String> {
        match strategy {
            CommitStrategy::DirectTreeCommit => {
                let options = CommitOptions {
                    subject: Some(subject.to_string()),
                    tar_autocreate_parents: true,
                    fsync: false,
                };
                self.store
                    .commit(CommitSource::Tarball(blob), branch, &options)
            }
            CommitStrategy::ExtractThenCommit => self.extract_then_commit(blob, branch, subject),
        }
    }

    /// Try [`CommitStrategy::DirectTreeCommit`], then fall back to
    /// [`CommitStrategy::ExtractThenCommit`] on any error.
    pub fn commit_with_fallback(
        &self,
        blob: &Path,
        branch: &str,
        subject: &str,
    ) -> Result<(String, CommitStrategy)> {
        match self.commit_layer(CommitStrategy::DirectTreeCommit, blob, branch, subject) {
            Ok(commit) => Ok((commit, CommitStrategy::DirectTreeCommit)),
            Err(e) => {
                tracing::warn!(
                    blob = %subject,
                    branch = %branch,
                    error = %e,
                    "Direct commit failed, extracting layer"
                );
                let commit =
                    self.commit_layer(CommitStrategy::ExtractThenCommit, blob, branch, subject)?;
                Ok((commit, CommitStrategy::ExtractThenCommit))
            }
        }
    }

    fn extract_then_commit(&self, blob: &Path, branch: &str, subject: &str) -> Result<String> {
        let commit_error = |message: String| ExplodeError::Commit {
            branch: branch.to_string(),
            message,
        };

        std::fs::create_dir_all(&self.scratch_root).map_err(|e| {
            commit_error(format!(
                "Failed to create scratch root {}: {}",
                self.scratch_root.display(),
                e
            ))
        })?;
        let scratch = tempfile::Builder::new()
            .prefix("explode-")
            .tempdir_in(&self.scratch_root)
            .map_err(|e| commit_error(format!("Failed to create scratch directory: {}", e)))?;

        let result = extract_layer(blob, scratch.path())
            .map_err(|e| commit_error(e.to_string()))
            .and_then(|()| {
                let options = CommitOptions {
                    subject: Some(subject.to_string()),
                    tar_autocreate_parents: false,
                    fsync: false,
                };
                self.store
                    .commit(CommitSource::Directory(scratch.path()), branch, &options)
            });

        let scratch_path = scratch.path().to_path_buf();
        // Extracted directories keep their archive modes.
        if let Err(e) = perms::make_removable(&scratch_path).and_then(|()| scratch.close()) {
            tracing::warn!(
                path = %scratch_path.display(),
                error = %e,
                "Failed to remove scratch directory"
            );
        }

        result
    }
}
