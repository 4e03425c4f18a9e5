//! Image metadata collaborator.

use async_trait::async_trait;
use explode_core::error::Result;
use explode_core::{Digest, Layer};

/// Resolves an image digest to its ordered layer list.
#[async_trait]
pub trait ImageMetadataSource: Send + Sync {
    /// Layers of `digest`, bottom first.
    ///
    /// Failures are reported as `ExplodeError::MetadataFetch`.
    async fn image_layers(&self, digest: &Digest) -> Result<Vec<Layer>>;
}
