// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Set-reconciliation: turns the three push message shapes into a desired
//! assignment map and diffs it against the running set (§4.4).

pub mod runner;

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use dashmap::DashMap;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::{check::CheckRegistry, config::ConfigStore, protocol::SharedClient};

/// `(asset_id, check_id)`, the unique identity of a running check.
pub type Path = (i64, i64);

/// `(asset_name, check_key)`. `check_key` must match a registered check
/// function; `asset_name` may change between reconciliations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Names {
    pub asset_name: String,
    pub check_key: String,
}

type WireTriple = ((i64, i64), (String, String), Value);

struct RunningTask {
    generation: u64,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Context shared between the reconciler and every spawned check-runner task.
pub struct SchedulerCtx {
    pub probe_name: String,
    pub checks: Arc<CheckRegistry>,
    pub config_store: Arc<ConfigStore>,
    pub client: Arc<SharedClient>,
    pub max_package_size: usize,
    pub shutdown: CancellationToken,
    desired: DashMap<Path, (Names, Value)>,
    running: DashMap<Path, RunningTask>,
    next_generation: AtomicU64,
}

impl SchedulerCtx {
    pub fn new(
        probe_name: impl Into<String>,
        checks: Arc<CheckRegistry>,
        config_store: Arc<ConfigStore>,
        client: Arc<SharedClient>,
        max_package_size: usize,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            probe_name: probe_name.into(),
            checks,
            config_store,
            client,
            max_package_size,
            shutdown,
            desired: DashMap::new(),
            running: DashMap::new(),
            next_generation: AtomicU64::new(0),
        }
    }

    /// Whether `generation` is still the one installed for `path` — the
    /// runner's way of telling a reconciler-initiated cancellation (entry
    /// already removed) from a shutdown cascade (entry still present).
    fn generation_still_installed(&self, path: Path, generation: u64) -> bool {
        self.running.get(&path).map(|e| e.generation == generation).unwrap_or(false)
    }

    fn current(&self, path: Path) -> Option<(Names, Value)> {
        self.desired.get(&path).map(|e| e.value().clone())
    }

    /// Removes the running-task entry for `path` if it still belongs to
    /// `generation` — used when a runner self-terminates (`IgnoreCheck` or a
    /// registry miss) rather than being cancelled by the reconciler.
    fn running_remove_self(&self, path: Path, generation: u64) {
        if self.running.get(&path).map(|e| e.generation == generation).unwrap_or(false) {
            self.running.remove(&path);
        }
    }

    pub fn running_paths(&self) -> usize {
        self.running.len()
    }

    pub fn desired_paths(&self) -> usize {
        self.desired.len()
    }
}

/// Drives reconciliation of the three push-message shapes into `ctx`'s
/// desired/running maps.
pub struct Reconciler {
    ctx: Arc<SchedulerCtx>,
}

impl Reconciler {
    pub fn new(ctx: Arc<SchedulerCtx>) -> Self {
        Self { ctx }
    }

    pub fn on_set_assets(&self, data: Value) {
        let Ok(items) = serde_json::from_value::<Vec<WireTriple>>(data) else {
            warn!("malformed set_assets payload");
            return;
        };
        let desired = items
            .into_iter()
            .map(|(path, names, config)| {
                (path, (Names { asset_name: names.0, check_key: names.1 }, config))
            })
            .collect();
        self.reconcile(desired);
    }

    pub fn on_upsert_asset(&self, data: Value) {
        let Ok((asset_id, items)) = serde_json::from_value::<(i64, Vec<WireTriple>)>(data) else {
            warn!("malformed upsert_asset payload");
            return;
        };

        let mut merged: HashMap<Path, (Names, Value)> = self
            .ctx
            .desired
            .iter()
            .filter(|e| e.key().0 != asset_id)
            .map(|e| (*e.key(), e.value().clone()))
            .collect();

        for (path, names, config) in items {
            merged.insert(path, (Names { asset_name: names.0, check_key: names.1 }, config));
        }

        self.reconcile(merged);
    }

    pub fn on_unset_assets(&self, data: Value) {
        let Ok(asset_ids) = serde_json::from_value::<Vec<i64>>(data) else {
            warn!("malformed unset_assets payload");
            return;
        };

        let merged: HashMap<Path, (Names, Value)> = self
            .ctx
            .desired
            .iter()
            .filter(|e| !asset_ids.contains(&e.key().0))
            .map(|e| (*e.key(), e.value().clone()))
            .collect();

        self.reconcile(merged);
    }

    /// The 4-step diff algorithm from §4.4.
    fn reconcile(&self, new_desired: HashMap<Path, (Names, Value)>) {
        let filtered: HashMap<Path, (Names, Value)> = new_desired
            .into_iter()
            .filter(|(_, (names, _))| self.ctx.checks.contains(&names.check_key))
            .collect();

        // Step 1: cancel paths no longer desired.
        let running_paths: Vec<Path> = self.ctx.running.iter().map(|e| *e.key()).collect();
        for path in running_paths {
            if !filtered.contains_key(&path)
                && let Some((_, task)) = self.ctx.running.remove(&path)
            {
                task.cancel.cancel();
            }
        }

        // Step 2: drop finished-but-stale entries whose config changed, so
        // they're respawned in step 4 with the new config.
        for (path, (_, config)) in &filtered {
            let config_changed =
                self.ctx.desired.get(path).map(|e| &e.value().1 != config).unwrap_or(false);
            if config_changed {
                let finished =
                    self.ctx.running.get(path).map(|e| e.handle.is_finished()).unwrap_or(false);
                if finished {
                    self.ctx.running.remove(path);
                }
            }
        }

        // Step 3: install the new desired map.
        self.ctx.desired.clear();
        for (path, entry) in filtered.clone() {
            self.ctx.desired.insert(path, entry);
        }

        // Step 4: spawn runners for newly desired paths.
        for path in filtered.keys() {
            if !self.ctx.running.contains_key(path) {
                self.spawn_runner(*path);
            }
        }
    }

    fn spawn_runner(&self, path: Path) {
        let generation = self.ctx.next_generation.fetch_add(1, Ordering::SeqCst);
        let cancel = self.ctx.shutdown.child_token();
        let ctx = Arc::clone(&self.ctx);
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move { runner::run(ctx, path, generation, task_cancel).await });
        self.ctx.running.insert(path, RunningTask { generation, cancel, handle });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::config::ConfigStore;

    fn ctx_for_test() -> (Arc<SchedulerCtx>, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let config_path = dir.path().join("infrasonar.yaml");

        let mut checks = CheckRegistry::new();
        checks.register(
            "A",
            Arc::new(|_a, _o, _c| Box::pin(async { crate::check::CheckOutcome::IgnoreResult })),
        );
        checks.register(
            "B",
            Arc::new(|_a, _o, _c| Box::pin(async { crate::check::CheckOutcome::IgnoreResult })),
        );
        checks.register(
            "C",
            Arc::new(|_a, _o, _c| Box::pin(async { crate::check::CheckOutcome::IgnoreResult })),
        );

        let ctx = Arc::new(SchedulerCtx::new(
            "myprobe",
            Arc::new(checks),
            Arc::new(ConfigStore::load_or_init(&config_path).expect("config store")),
            Arc::new(SharedClient::new()),
            500_000,
            CancellationToken::new(),
        ));
        (ctx, dir)
    }

    #[tokio::test]
    async fn unknown_check_key_is_dropped() {
        let (ctx, _dir) = ctx_for_test();
        let reconciler = Reconciler::new(Arc::clone(&ctx));

        reconciler.on_set_assets(json!([
            [[1, 1], ["asset-1", "unknown-check"], {"_interval": 10}],
        ]));

        assert_eq!(ctx.desired_paths(), 0);
        assert_eq!(ctx.running_paths(), 0);
    }

    #[tokio::test]
    async fn upsert_isolates_other_assets() {
        let (ctx, _dir) = ctx_for_test();
        let reconciler = Reconciler::new(Arc::clone(&ctx));

        reconciler.on_set_assets(json!([
            [[1, 1], ["a1", "A"], {"_interval": 10}],
            [[1, 2], ["a1", "B"], {"_interval": 10}],
            [[2, 3], ["a2", "C"], {"_interval": 10}],
        ]));
        assert_eq!(ctx.running_paths(), 3);

        reconciler.on_upsert_asset(json!([
            1,
            [
                [[1, 1], ["a1", "A"], {"_interval": 10}],
                [[1, 4], ["a1", "D-not-registered"], {"_interval": 10}],
            ],
        ]));

        assert!(ctx.current((1, 1)).is_some());
        assert!(ctx.current((1, 2)).is_none());
        assert!(ctx.current((2, 3)).is_some());
    }

    #[tokio::test]
    async fn unset_removes_all_assignments_for_asset() {
        let (ctx, _dir) = ctx_for_test();
        let reconciler = Reconciler::new(Arc::clone(&ctx));

        reconciler.on_set_assets(json!([
            [[1, 1], ["a1", "A"], {"_interval": 10}],
            [[2, 2], ["a2", "B"], {"_interval": 10}],
        ]));
        reconciler.on_unset_assets(json!([1]));

        assert!(ctx.current((1, 1)).is_none());
        assert!(ctx.current((2, 2)).is_some());
    }
}
