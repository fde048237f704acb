// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Top-level glue: wires the protocol client, local config store, assignment
//! reconciler, and supervisor into one running probe process.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    cfg::cli::EnvConfig,
    check::CheckRegistry,
    config::ConfigStore,
    protocol::{PushMessage, SharedClient},
    scheduler::{Reconciler, SchedulerCtx},
    supervisor::Supervisor,
};

/// A fully assembled probe: its own name/version, the checks it knows how
/// to run, and the environment it was configured from.
pub struct Probe {
    name: String,
    version: String,
    checks: CheckRegistry,
    env: EnvConfig,
}

impl Probe {
    pub fn new(name: impl Into<String>, version: impl Into<String>, checks: CheckRegistry) -> Result<Self> {
        let env = EnvConfig::from_env().context("failed to resolve environment configuration")?;
        Ok(Self { name: name.into(), version: version.into(), checks, env })
    }

    /// Runs until SIGINT/SIGTERM, then returns once every subsystem has
    /// observed the shutdown signal.
    pub async fn run(self) -> Result<()> {
        let config_store = Arc::new(
            ConfigStore::load_or_init(&self.env.config_path)
                .context("failed to load local configuration")?,
        );

        let shutdown = CancellationToken::new();
        let shared_client = Arc::new(SharedClient::new());
        let (push_tx, mut push_rx) = mpsc::unbounded_channel::<PushMessage>();

        let ctx = Arc::new(SchedulerCtx::new(
            self.name.clone(),
            Arc::new(self.checks),
            Arc::clone(&config_store),
            Arc::clone(&shared_client),
            self.env.max_package_size,
            shutdown.clone(),
        ));
        let reconciler = Reconciler::new(Arc::clone(&ctx));

        let push_task = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        msg = push_rx.recv() => {
                            match msg {
                                Some(PushMessage::SetAssets(data)) => reconciler.on_set_assets(data),
                                Some(PushMessage::UpsertAsset(data)) => reconciler.on_upsert_asset(data),
                                Some(PushMessage::UnsetAssets(data)) => reconciler.on_unset_assets(data),
                                None => return,
                            }
                        }
                    }
                }
            })
        };

        let refresh_task = {
            let config_store = Arc::clone(&config_store);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = tokio::time::sleep(std::time::Duration::from_secs(60)) => {
                            config_store.refresh();
                        }
                    }
                }
            })
        };

        let supervisor = Supervisor::new(
            self.env.agentcore_host.clone(),
            self.env.agentcore_port,
            self.name.clone(),
            self.version.clone(),
            shared_client,
            push_tx,
            shutdown.clone(),
        );

        install_signal_handlers(shutdown.clone());

        info!(probe = %self.name, version = %self.version, "probe starting");
        supervisor.run().await;

        shutdown.cancel();
        let _ = push_task.await;
        let _ = refresh_task.await;
        info!("probe shut down cleanly");
        Ok(())
    }
}

/// Cancels `shutdown` on SIGINT or SIGTERM (§4.6).
fn install_signal_handlers(shutdown: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};

            let mut sigterm =
                signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {},
                _ = sigterm.recv() => {},
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }

        info!("shutdown signal received");
        shutdown.cancel();
    });
}
