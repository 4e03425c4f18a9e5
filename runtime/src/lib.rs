//! os-explode runtime - materialization and reconciliation engine.
//!
//! This crate turns image-stream tag events into checked-out root
//! filesystems: pointer persistence, the content store, the layer
//! commit/checkout pipeline, garbage collection and the API collaborators.

#![allow(clippy::result_large_err)]

pub mod api;
pub mod blob;
pub mod commit;
pub mod context;
pub mod engine;
pub mod gc;
pub mod layers;
pub mod layout;
pub mod locks;
pub mod materializer;
pub mod metadata;
pub mod perms;
pub mod refstore;
pub mod store;

#[cfg(test)]
pub(crate) mod testutil;

// Re-export common types
pub use api::ApiClient;
pub use blob::{BlobResolver, LocalBlobStore};
pub use commit::{CommitStrategy, LayerCommitter};
pub use context::ExplodeContext;
pub use engine::{Decision, ReconcileEngine};
pub use gc::{prune_empty_ancestors, GcSweeper};
pub use layers::extract_layer;
pub use layout::StorageLayout;
pub use locks::{KeyedGuard, KeyedLocks};
pub use materializer::{checkout_state, CheckoutState, ExplodeOutcome, LayerMaterializer};
pub use metadata::ImageMetadataSource;
pub use refstore::RefStore;
pub use store::{CheckoutOptions, CommitOptions, CommitSource, ContentStore, TreeStore};

/// os-explode runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Capacity of the channel between the watch feed and the engine.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;
