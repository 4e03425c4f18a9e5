//! Layer extraction utilities.
//!
//! Unpacks a layer blob (plain or gzip-compressed tar) onto a scratch
//! directory so it can be committed as a directory tree.

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use explode_core::error::{ExplodeError, Result};
use flate2::read::GzDecoder;
use tar::Archive;

/// Extract a single layer blob into `target_dir`.
///
/// Whiteout entries are extracted as ordinary files; they are interpreted at
/// checkout time. Extended attributes are not applied.
///
/// # Errors
///
/// Returns error if:
/// - Layer file doesn't exist
/// - Target directory cannot be created
/// - Decompression or extraction fails
pub fn extract_layer(layer_path: &Path, target_dir: &Path) -> Result<()> {
    if !layer_path.exists() {
        return Err(ExplodeError::Other(format!(
            "Layer file not found: {}",
            layer_path.display()
        )));
    }

    std::fs::create_dir_all(target_dir).map_err(|e| {
        ExplodeError::Other(format!(
            "Failed to create target directory {}: {}",
            target_dir.display(),
            e
        ))
    })?;

    let file = File::open(layer_path).map_err(|e| {
        ExplodeError::Other(format!(
            "Failed to open layer file {}: {}",
            layer_path.display(),
            e
        ))
    })?;

    let mut reader = BufReader::new(file);
    let gzipped = reader
        .fill_buf()
        .map(|head| head.starts_with(&[0x1f, 0x8b]))
        .map_err(|e| {
            ExplodeError::Other(format!(
                "Failed to read layer file {}: {}",
                layer_path.display(),
                e
            ))
        })?;
    let stream: Box<dyn Read> = if gzipped {
        Box::new(GzDecoder::new(reader))
    } else {
        Box::new(reader)
    };

    let mut archive = Archive::new(stream);
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);
    archive.set_unpack_xattrs(false);
    archive.unpack(target_dir).map_err(|e| {
        ExplodeError::Other(format!(
            "Failed to extract layer to {}: {}",
            target_dir.display(),
            e
        ))
    })?;

    tracing::debug!(
        layer = %layer_path.display(),
        target = %target_dir.display(),
        gzipped,
        "Extracted layer"
    );

    Ok(())
}
