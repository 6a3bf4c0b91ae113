// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use clap::Parser;
use tracing::error;

use devlab::config::Config;

#[derive(Parser)]
#[command(name = "devlab", version, about = "Device-test orchestration server.")]
struct Cli {
    #[command(flatten)]
    config: Config,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = cli.config;

    if let Err(e) = config.validate() {
        eprintln!("error: {e}");
        std::process::exit(2);
    }

    if let Err(e) = devlab::run::run(config).await {
        error!("fatal: {e:#}");
        std::process::exit(1);
    }
}
