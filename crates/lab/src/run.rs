// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Top-level server runner, shared by `main` and integration tests.

use std::time::Duration;

use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::lab::Lab;

/// Drain budget once shutdown is requested.
const DRAIN_DEADLINE: Duration = Duration::from_secs(180);

/// Initialize logging, boot the lab, and run until a shutdown signal.
pub async fn run(config: Config) -> anyhow::Result<()> {
    init_logging(&config);

    let lab = Lab::start(config).await?;
    info!("devlab started");

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                anyhow::bail!("failed to listen for shutdown signal: {err}");
            }
            info!("shutdown signal received");
        }
        _ = lab.shutdown.cancelled() => {
            info!("shutdown requested");
        }
    }

    lab.drain(DRAIN_DEADLINE).await;
    info!("devlab drained");
    Ok(())
}

fn init_logging(config: &Config) {
    let filter = EnvFilter::try_new(&config.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = if config.log_format == "json" {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    // A second init (tests) keeps the first subscriber.
    let _ = result;
}
