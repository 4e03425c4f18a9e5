//! os-explode: image-stream driven rootfs materialization controller.

use clap::Parser;
use explode_cli::commands::{dispatch, Cli};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    explode_cli::logging::init(cli.options.log_level, cli.options.log_format);

    if let Err(e) = dispatch(cli).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
