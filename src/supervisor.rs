// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Connection lifecycle: reconnect-with-backoff and the announce handshake
//! (§4.6).

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use serde_json::json;
use tokio::{
    sync::mpsc,
    time::{sleep, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::protocol::{Package, ProtocolClient, PushMessage, SharedClient, package::REQ_ANNOUNCE};

const INITIAL_STEP_SECS: u64 = 2;
const MAX_STEP_SECS: u64 = 128;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(10);

/// Owns the reconnect loop: while disconnected, attempts a connection with
/// exponentially backed-off retries; while connected, idles.
pub struct Supervisor {
    host: String,
    port: u16,
    probe_name: String,
    version: String,
    client: Arc<SharedClient>,
    push_tx: mpsc::UnboundedSender<PushMessage>,
    shutdown: CancellationToken,
}

impl Supervisor {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        probe_name: impl Into<String>,
        version: impl Into<String>,
        client: Arc<SharedClient>,
        push_tx: mpsc::UnboundedSender<PushMessage>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            probe_name: probe_name.into(),
            version: version.into(),
            client,
            push_tx,
            shutdown,
        }
    }

    /// Runs until `shutdown` is cancelled.
    pub async fn run(&self) {
        let mut step = INITIAL_STEP_SECS;

        loop {
            if self.shutdown.is_cancelled() {
                return;
            }

            let is_connected = match self.client.get().await {
                Some(client) => client.is_connected(),
                None => false,
            };

            if is_connected {
                step = INITIAL_STEP_SECS;
            } else {
                match self.connect_once().await {
                    Ok(client) => {
                        self.client.set(Some(client)).await;
                        step = INITIAL_STEP_SECS;
                    },
                    Err(e) => {
                        warn!("failed to connect to agentcore: {e}");
                        self.client.set(None).await;
                        step = (step * 2).min(MAX_STEP_SECS);
                    },
                }
            }

            for _ in 0..step {
                tokio::select! {
                    _ = self.shutdown.cancelled() => return,
                    _ = sleep(Duration::from_secs(1)) => {},
                }
            }
        }
    }

    async fn connect_once(&self) -> Result<Arc<ProtocolClient>> {
        let client = timeout(
            CONNECT_TIMEOUT,
            ProtocolClient::connect(&self.host, self.port, self.shutdown.child_token(), self.push_tx.clone()),
        )
        .await
        .context("connect timed out")?
        .context("tcp connect failed")?;

        let announce = Package::make(REQ_ANNOUNCE, 0, json!([self.probe_name, self.version]));
        client
            .request(announce, Some(ANNOUNCE_TIMEOUT))
            .await
            .context("announce request failed")?;

        info!(host = %self.host, port = self.port, "connected and announced to agentcore");
        Ok(client)
    }
}
