//! Image identity types.
//!
//! An [`ImageReference`] is the mutable `namespace/name/tag` pointer a user
//! re-tags over time; a [`Digest`] is the immutable content identifier it
//! currently resolves to.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ExplodeError, Result};

/// A `(namespace, name, tag)` triple identifying a mutable image pointer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ImageReference {
    pub namespace: String,
    pub name: String,
    pub tag: String,
}

impl ImageReference {
    /// Build a reference, rejecting components that are not a single path segment.
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        tag: impl Into<String>,
    ) -> Result<Self> {
        let reference = Self {
            namespace: namespace.into(),
            name: name.into(),
            tag: tag.into(),
        };
        for component in reference.components() {
            validate_segment(component).map_err(|reason| {
                ExplodeError::InvalidReference(format!("{}: {}", reference, reason))
            })?;
        }
        Ok(reference)
    }

    /// Components in path order.
    pub fn components(&self) -> [&str; 3] {
        [&self.namespace, &self.name, &self.tag]
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.name, self.tag)
    }
}

fn validate_segment(segment: &str) -> std::result::Result<(), &'static str> {
    if segment.is_empty() {
        return Err("empty component");
    }
    if segment == "." || segment == ".." {
        return Err("relative component");
    }
    if segment.contains('/') || segment.contains('\0') {
        return Err("component contains a path separator");
    }
    Ok(())
}

/// Immutable content identifier of the form `algorithm:hex`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest {
    raw: String,
    split: usize,
}

impl Digest {
    /// Parse and validate a digest string.
    ///
    /// The algorithm must follow the OCI grammar (`[a-z0-9]+` components
    /// joined by `+._-`) and the encoded part must be lowercase hex.
    /// `sha256` and `sha512` digests must carry their exact hex length.
    pub fn parse(input: &str) -> Result<Self> {
        let invalid = |reason: &str| ExplodeError::InvalidDigest(format!("{:?}: {}", input, reason));

        let (algorithm, hex) = input
            .split_once(':')
            .ok_or_else(|| invalid("expected algorithm:hex"))?;

        if algorithm.is_empty() {
            return Err(invalid("empty algorithm"));
        }
        let mut prev_separator = true;
        for c in algorithm.chars() {
            match c {
                'a'..='z' | '0'..='9' => prev_separator = false,
                '+' | '.' | '_' | '-' if !prev_separator => prev_separator = true,
                _ => return Err(invalid("malformed algorithm")),
            }
        }
        if prev_separator {
            return Err(invalid("malformed algorithm"));
        }

        if hex.is_empty() || !hex.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f')) {
            return Err(invalid("encoded part must be lowercase hex"));
        }
        let expected_len = match algorithm {
            "sha256" => Some(64),
            "sha512" => Some(128),
            _ => None,
        };
        if let Some(expected) = expected_len {
            if hex.len() != expected {
                return Err(invalid("wrong length for algorithm"));
            }
        }

        Ok(Self {
            raw: input.to_string(),
            split: algorithm.len(),
        })
    }

    /// Hash algorithm, e.g. `sha256`.
    pub fn algorithm(&self) -> &str {
        &self.raw[..self.split]
    }

    /// Hex-encoded hash.
    pub fn hex(&self) -> &str {
        &self.raw[self.split + 1..]
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Content-store branch holding this digest's layer commits: `oci/<algorithm>/<hex>`.
    pub fn branch(&self) -> String {
        format!("oci/{}/{}", self.algorithm(), self.hex())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for Digest {
    type Err = ExplodeError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Digest {
    type Error = ExplodeError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Digest> for String {
    fn from(digest: Digest) -> Self {
        digest.raw
    }
}

/// One entry of a tag's history.
///
/// The digest is kept as delivered by the API; it is validated when the
/// engine acts on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagEvent {
    /// Manifest digest the tag pointed at.
    pub image: String,
    /// Pull spec the image was recorded under, e.g. `172.30.1.1:5000/ns/name@sha256:...`.
    pub docker_image_reference: String,
}

impl TagEvent {
    pub fn new(image: impl Into<String>, docker_image_reference: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            docker_image_reference: docker_image_reference.into(),
        }
    }
}

/// An image-stream resource: a named set of tags, each with a history
/// ordered most-recent-first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageStream {
    pub namespace: String,
    pub name: String,
    /// Repository pull spec reported by the API (used only for logging).
    #[serde(default)]
    pub docker_image_repository: String,
    #[serde(default)]
    pub tags: BTreeMap<String, Vec<TagEvent>>,
}

impl ImageStream {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    /// Append a tag with its history (most recent first).
    pub fn with_tag(mut self, tag: impl Into<String>, history: Vec<TagEvent>) -> Self {
        self.tags.insert(tag.into(), history);
        self
    }

    /// Reference for one of this stream's tags.
    pub fn reference(&self, tag: &str) -> Result<ImageReference> {
        ImageReference::new(&self.namespace, &self.name, tag)
    }
}

/// Kind of change delivered by the watch collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WatchEventKind {
    Added,
    Updated,
    Deleted,
}

impl fmt::Display for WatchEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Added => write!(f, "ADDED"),
            Self::Updated => write!(f, "UPDATED"),
            Self::Deleted => write!(f, "DELETED"),
        }
    }
}

/// A change notification for an image stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub stream: ImageStream,
}

impl WatchEvent {
    pub fn new(kind: WatchEventKind, stream: ImageStream) -> Self {
        Self { kind, stream }
    }
}

/// One layer of an image, bottom to top.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layer {
    /// Content digest of the layer blob.
    pub blob_digest: Digest,
    /// Blob size in bytes, when known.
    #[serde(default)]
    pub size: Option<u64>,
}

impl Layer {
    pub fn new(blob_digest: Digest) -> Self {
        Self {
            blob_digest,
            size: None,
        }
    }
}
