// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Per-assignment periodic loop (§4.5).

use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use rand::Rng;
use serde_json::{Value, json};
use tokio::time::{Instant, sleep_until, timeout};
use tracing::{debug, warn};

use crate::{
    check::{Asset, CheckError, CheckOutcome, Severity},
    protocol::Package,
    scheduler::{Path, SchedulerCtx},
};

use tokio_util::sync::CancellationToken;

const FIRST_RUN_FLOOR: Duration = Duration::from_secs(60);
const DEFAULT_INTERVAL_SECS: i64 = 60;

fn extract_interval(config: &Value) -> i64 {
    config.get("_interval").and_then(Value::as_i64).unwrap_or(DEFAULT_INTERVAL_SECS)
}

fn extract_use(config: &Value) -> Option<String> {
    config.get("_use").and_then(Value::as_str).map(str::to_owned)
}

fn unix_timestamp() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs_f64()).unwrap_or(0.0)
}

/// Delay before an assignment's first tick: `jitter * interval` spreads many
/// fresh assignments' first runs apart, floored at 60 seconds so a burst of
/// new assignments doesn't all fire at once (§8 scenario 1).
fn first_run_delay(interval: i64, jitter: f64) -> Duration {
    Duration::from_secs_f64(jitter * interval as f64) + FIRST_RUN_FLOOR
}

/// Runs one assignment's loop until cancelled or until it self-terminates
/// with `IgnoreCheck`. `generation`/`cancel` identify this particular spawn
/// so the loop can tell a reconciler-initiated cancel from a shutdown cascade
/// (§4.4).
pub async fn run(ctx: Arc<SchedulerCtx>, path: Path, generation: u64, cancel: CancellationToken) {
    let Some((mut names, mut config)) = ctx.current(path) else { return };
    let mut asset = Asset::new(path.0, names.asset_name.clone(), names.check_key.clone());

    let jitter: f64 = rand::rng().random();
    let mut ts_next = Instant::now() + first_run_delay(extract_interval(&config), jitter);

    loop {
        let now = Instant::now();
        if now > ts_next {
            warn!("clock jumped forward for assignment {path:?}, resetting schedule");
            ts_next = now;
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                on_cancelled(&ctx, path, generation).await;
                return;
            }
            _ = sleep_until(ts_next) => {}
        }

        let Some((current_names, current_config)) = ctx.current(path) else { return };
        if current_names.asset_name != asset.name {
            asset = Asset::new(path.0, current_names.asset_name.clone(), current_names.check_key.clone());
        }
        names = current_names;
        config = current_config;

        let interval = extract_interval(&config);
        let check_timeout = Duration::from_secs_f64(interval as f64 * 0.8);
        let use_label = extract_use(&config);

        let Some(check_fn) = ctx.checks.get(&names.check_key) else {
            // Reconciliation already filters by registered check key; a miss
            // here means the registry changed under us. Treat as done.
            ctx.running_remove_self(path, generation);
            return;
        };

        let options = ctx.config_store.resolve(&ctx.probe_name, path.0, use_label.as_deref());
        let fut = check_fn(asset.clone(), Value::Object(options), config.clone());

        let started = Instant::now();
        let timestamp = unix_timestamp();
        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                on_cancelled(&ctx, path, generation).await;
                return;
            }
            res = timeout(check_timeout, fut) => match res {
                Ok(outcome) => outcome,
                Err(_) => CheckOutcome::Error(CheckError::new("timed out", Severity::Medium)),
            },
        };
        let duration = started.elapsed().as_secs_f64();

        match classify(outcome) {
            Classified::Suppress => {},
            Classified::Stop => {
                ctx.running_remove_self(path, generation);
                return;
            },
            Classified::Emit(result, error) => {
                emit(&ctx, path, result, error, duration, timestamp, false).await;
            },
        }

        ts_next += Duration::from_secs(interval.max(1) as u64);
    }
}

enum Classified {
    Suppress,
    Stop,
    Emit(Option<Value>, Option<CheckError>),
}

fn classify(outcome: CheckOutcome) -> Classified {
    match outcome {
        CheckOutcome::IgnoreResult => Classified::Suppress,
        CheckOutcome::IgnoreCheck => Classified::Stop,
        CheckOutcome::Ok(result) if result.is_object() => Classified::Emit(Some(result), None),
        CheckOutcome::Ok(_) => Classified::Emit(
            None,
            Some(CheckError::new("expecting type dict for a check result", Severity::High)),
        ),
        CheckOutcome::Error(err) => Classified::Emit(None, Some(err)),
        CheckOutcome::Incomplete(partial, err) => Classified::Emit(Some(partial), Some(err)),
    }
}

async fn on_cancelled(ctx: &Arc<SchedulerCtx>, path: Path, generation: u64) {
    if ctx.generation_still_installed(path, generation) {
        // Internal: the shutdown token cascaded without the reconciler
        // pruning this entry. Emission below is attempted but will be
        // dropped, since the transport is torn down as part of shutdown.
        let err = CheckError::new("cancelled", Severity::Medium);
        emit(ctx, path, None, Some(err), 0.0, unix_timestamp(), false).await;
    }
    // External: the reconciler already removed the entry before cancelling.
    // No emission.
}

async fn emit(
    ctx: &Arc<SchedulerCtx>,
    path: Path,
    result: Option<Value>,
    error: Option<CheckError>,
    duration: f64,
    timestamp: f64,
    is_retry: bool,
) {
    let body = json!([
        [path.0, path.1],
        {
            "result": result,
            "error": error,
            "framework": { "duration": duration, "timestamp": timestamp },
        }
    ]);
    let pkg = Package::make(crate::protocol::package::FAF_DUMP, path.0 as u32, body);

    let bytes = match pkg.to_bytes() {
        Ok(b) => b,
        Err(e) => {
            warn!("failed to encode result for {path:?}: {e}");
            return;
        },
    };

    if bytes.len() > ctx.max_package_size && !is_retry {
        let err = CheckError::new(format!("data package too large ({} bytes)", bytes.len()), Severity::Medium);
        Box::pin(emit(ctx, path, None, Some(err), duration, timestamp, true)).await;
        return;
    }

    let Some(client) = ctx.client.get().await else { return };
    if !client.is_connected() {
        return;
    }
    if let Err(e) = client.send(pkg).await {
        debug!("failed to send result for {path:?}: {e}");
    }
}

#[cfg(test)]
mod tests {
    use tokio::{
        io::AsyncReadExt,
        net::{TcpListener, TcpStream},
        sync::mpsc,
    };

    use super::*;
    use crate::{
        check::CheckRegistry,
        config::ConfigStore,
        protocol::{ProtocolClient, SharedClient},
    };

    #[test]
    fn first_run_delay_is_floored_and_bounded() {
        // `_interval = 10` puts the first tick in [60, 70]s (§8 scenario 1).
        assert_eq!(first_run_delay(10, 0.0), Duration::from_secs(60));
        assert_eq!(first_run_delay(10, 1.0), Duration::from_secs(70));
    }

    async fn read_one_frame(stream: &mut TcpStream) -> Package {
        let mut header = [0u8; Package::HEADER_SIZE];
        stream.read_exact(&mut header).await.expect("read header");
        let (total, partial) = Package::parse_header(&header).expect("parse header");

        let mut body = vec![0u8; total - Package::HEADER_SIZE];
        stream.read_exact(&mut body).await.expect("read body");

        let mut full = header.to_vec();
        full.extend_from_slice(&body);
        partial.extract_body(&full).map(|data| partial.into_package(data)).expect("decode body")
    }

    #[tokio::test]
    async fn emit_retries_once_when_result_is_oversize() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            let frame = read_one_frame(&mut stream).await;

            // The oversize retry fires at most once; nothing else should
            // follow within a short window.
            let mut probe = [0u8; 1];
            let second = tokio::time::timeout(Duration::from_millis(150), stream.read(&mut probe)).await;
            assert!(second.is_err(), "unexpected second frame after the bounded retry");

            frame
        });

        let (push_tx, _push_rx) = mpsc::unbounded_channel();
        let client = ProtocolClient::connect("127.0.0.1", addr.port(), CancellationToken::new(), push_tx)
            .await
            .expect("connect");

        let dir = tempfile::tempdir().expect("tempdir");
        let config_store = Arc::new(
            ConfigStore::load_or_init(dir.path().join("infrasonar.yaml")).expect("config store"),
        );
        let shared_client = Arc::new(SharedClient::new());
        shared_client.set(Some(client)).await;

        let ctx = Arc::new(SchedulerCtx::new(
            "myprobe",
            Arc::new(CheckRegistry::new()),
            config_store,
            shared_client,
            64,
            CancellationToken::new(),
        ));

        let oversize = json!({ "data": "x".repeat(1000) });
        emit(&ctx, (1, 1), Some(oversize), None, 0.1, 1_700_000_000.0, false).await;

        let frame = server.await.expect("server task");
        let error = frame.data[1]["error"]["message"].as_str().unwrap_or_default().to_string();
        assert!(error.contains("data package too large"), "unexpected error message: {error}");
        assert!(frame.data[1]["result"].is_null());
    }
}
