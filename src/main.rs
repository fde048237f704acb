// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use anyhow::{Context, Result};
use infrasonar_probe::{cfg::logger::init_logger, check::CheckRegistry, probe::Probe};

const PROBE_NAME: &str = "probe-demo";
const PROBE_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    let _logger_guard = init_logger().context("failed to initialize logging")?;

    // A real collector registers its own checks here; this demo ships one
    // trivial check so the binary does something observable out of the box.
    let mut checks = CheckRegistry::new();
    checks.register(
        "ping",
        Arc::new(|asset, _options, _config| {
            Box::pin(async move {
                infrasonar_probe::check::CheckOutcome::Ok(serde_json::json!({
                    "asset": asset.name,
                    "up": true,
                }))
            })
        }),
    );

    let probe = Probe::new(PROBE_NAME, PROBE_VERSION, checks).context("failed to build probe")?;
    probe.run().await
}
