//! os-explode core - foundational types and abstractions.
//!
//! This crate provides the data model shared by the materialization engine
//! and the binary: image references, digests, tag events, the error
//! taxonomy and configuration.

pub mod config;
pub mod error;
pub mod image;

// Re-export commonly used types
pub use config::{BlobSourceUrl, ExplodeConfig, LogLevel};
pub use error::{ExplodeError, Result};
pub use image::{Digest, ImageReference, ImageStream, Layer, TagEvent, WatchEvent, WatchEventKind};

/// os-explode version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
