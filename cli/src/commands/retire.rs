//! `os-explode retire` command.

use std::sync::Arc;

use clap::Args;
use explode_runtime::{GcSweeper, KeyedLocks, RefStore, StorageLayout};

use crate::args::{parse_reference, ControllerArgs};

#[derive(Args, Debug)]
pub struct RetireArgs {
    /// References to remove, as namespace/name/tag
    #[arg(required = true)]
    pub references: Vec<String>,

    /// Keep the checkout tree; only remove the pointer
    #[arg(long)]
    pub keep_tree: bool,
}

/// Works on the storage root alone; no API access is needed.
pub async fn execute(
    options: ControllerArgs,
    args: RetireArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let layout = StorageLayout::new(&options.storage_root);
    let refs = Arc::new(RefStore::new(layout.clone()));
    let sweeper = GcSweeper::new(layout, refs.clone(), KeyedLocks::new());

    let mut errors: Vec<String> = Vec::new();
    for raw in &args.references {
        let reference = match parse_reference(raw) {
            Ok(reference) => reference,
            Err(e) => {
                errors.push(e.to_string());
                continue;
            }
        };

        let digests: Vec<_> = if args.keep_tree {
            Vec::new()
        } else {
            refs.digest_for(&reference).await.into_iter().collect()
        };

        match sweeper.retire(&reference, &digests).await {
            Ok(()) => println!("Retired: {reference}"),
            Err(e) => errors.push(format!("{reference}: {e}")),
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        let msg = errors.join("\n");
        Err(format!("Failed to retire reference(s):\n{msg}").into())
    }
}
