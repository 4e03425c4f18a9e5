//! `os-explode explode` command: materialize one digest outside the watch loop.

use std::sync::Arc;

use clap::Args;
use explode_core::Digest;
use explode_runtime::{ApiClient, ExplodeContext, ExplodeOutcome};
use tokio::sync::watch;

use crate::args::{parse_reference, ControllerArgs};

#[derive(Args, Debug)]
pub struct ExplodeArgs {
    /// Reference to point at the image, as namespace/name/tag
    pub reference: String,

    /// Image digest (e.g. sha256:...)
    pub digest: String,
}

pub async fn execute(
    options: ControllerArgs,
    args: ExplodeArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let reference = parse_reference(&args.reference)?;
    let digest = Digest::parse(&args.digest)?;
    let config = options.into_config()?;

    let api = ApiClient::new(&config)?;
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let ctx = ExplodeContext::from_config(&config, Arc::new(api), shutdown_rx);
    ctx.init()?;

    match ctx.materializer().explode(&reference, &digest).await? {
        ExplodeOutcome::AlreadyMaterialized => {
            println!("{reference} -> {digest} (already materialized)");
        }
        ExplodeOutcome::Exploded { layers } => {
            println!("{reference} -> {digest} ({layers} layers)");
        }
    }
    println!("{}", ctx.layout.checkout_path(&digest).display());
    Ok(())
}
