//! CLI command definitions and dispatch.

mod explode;
mod retire;
mod version;
mod watch;

use clap::{Parser, Subcommand};

use crate::args::ControllerArgs;

/// os-explode: keeps checked-out root filesystems in sync with image-stream tags.
#[derive(Parser, Debug)]
#[command(name = "os-explode", version, about)]
pub struct Cli {
    #[command(flatten)]
    pub options: ControllerArgs,

    /// Defaults to `watch`
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available commands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Watch image streams and materialize every tag (default)
    Watch(watch::WatchArgs),
    /// Materialize one image digest and point a reference at it
    Explode(explode::ExplodeArgs),
    /// Remove a reference and the checkout it points to
    Retire(retire::RetireArgs),
    /// Show version information
    Version(version::VersionArgs),
}

/// Dispatch a parsed CLI command to its handler.
pub async fn dispatch(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let command = cli
        .command
        .unwrap_or(Command::Watch(watch::WatchArgs::default()));
    match command {
        Command::Watch(args) => watch::execute(cli.options, args).await,
        Command::Explode(args) => explode::execute(cli.options, args).await,
        Command::Retire(args) => retire::execute(cli.options, args).await,
        Command::Version(args) => version::execute(args).await,
    }
}
