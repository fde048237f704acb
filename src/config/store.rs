// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
    time::SystemTime,
};

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use tracing::warn;

use crate::config::{HEADER_FILE, crypto};

struct Inner {
    /// Decrypted, ready-to-use document. `None` until a well-formed
    /// configuration has been loaded at least once.
    doc: Value,
    mtime: Option<SystemTime>,
}

/// Hot-reloading local YAML configuration with transparent field encryption
/// (§4.3).
pub struct ConfigStore {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl ConfigStore {
    /// Loads (creating if absent) the configuration file at `path`. Every
    /// error here is fatal to startup, matching the probe's own behavior of
    /// exiting rather than running with an unreadable configuration.
    pub fn load_or_init(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if !path.exists() {
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
                && !parent.exists()
            {
                fs::create_dir_all(parent)
                    .with_context(|| format!("cannot create directory: {parent:?}"))?;
            }
            fs::write(&path, HEADER_FILE)
                .with_context(|| format!("cannot write file: {path:?}"))?;
            warn!("created a new configuration file: {}", path.display());
        }

        let store = Self { path, inner: Mutex::new(Inner { doc: Value::Object(Map::new()), mtime: None }) };
        store.read_if_changed().context("configuration file invalid")?;
        Ok(store)
    }

    /// Re-reads the file if its mtime changed, logging (rather than
    /// propagating) any failure so a transient edit doesn't take down a
    /// running probe.
    pub fn refresh(&self) {
        if let Err(e) = self.read_if_changed() {
            warn!("new config file invalid, keep using previous: {e}");
        }
    }

    fn read_if_changed(&self) -> Result<()> {
        let mtime = fs::metadata(&self.path).and_then(|m| m.modified()).ok();

        {
            let guard = self.inner.lock().expect("config store mutex poisoned");
            if mtime.is_some() && mtime == guard.mtime {
                return Ok(());
            }
        }

        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("cannot read file: {}", self.path.display()))?;

        let mut doc: Value = if raw.trim().is_empty() {
            Value::Object(Map::new())
        } else {
            serde_yaml::from_str(&raw).context("failed to parse config YAML")?
        };

        let Value::Object(ref mut map) = doc else {
            anyhow::bail!("configuration root must be a mapping");
        };

        let changed = crypto::encrypt_tree(map);
        if changed {
            let rewritten = serde_yaml::to_string(&doc).context("failed to serialize config")?;
            let mut out = String::with_capacity(HEADER_FILE.len() + rewritten.len());
            out.push_str(HEADER_FILE);
            out.push_str(&rewritten);
            fs::write(&self.path, out)
                .with_context(|| format!("cannot write file: {}", self.path.display()))?;
        }

        let Value::Object(ref mut map) = doc else { unreachable!("checked above") };
        crypto::decrypt_tree(map).context("failed to decrypt configuration")?;

        warn_on_conflicting_use_sections(map);

        let mut guard = self.inner.lock().expect("config store mutex poisoned");
        guard.doc = doc;
        guard.mtime = mtime;
        Ok(())
    }

    /// Resolves the options map for `(probe_name, asset_id)`, preferring an
    /// asset block labelled `use` (when non-empty) over numeric id matching,
    /// falling back to the probe's top-level `config`, and finally `{}`.
    pub fn resolve(&self, probe_name: &str, asset_id: i64, use_label: Option<&str>) -> Map<String, Value> {
        let guard = self.inner.lock().expect("config store mutex poisoned");

        let Some(probe) = guard.doc.get(probe_name).and_then(Value::as_object) else {
            return Map::new();
        };

        if let Some(use_label) = use_label.filter(|s| !s.is_empty())
            && let Some(assets) = probe.get("assets").and_then(Value::as_array)
        {
            for asset in assets {
                let Some(asset) = asset.as_object() else { continue };
                if asset.get("use").and_then(Value::as_str) == Some(use_label) {
                    return config_map_of(asset);
                }
            }
        }

        if let Some(assets) = probe.get("assets").and_then(Value::as_array) {
            for asset in assets {
                let Some(asset) = asset.as_object() else { continue };
                if asset_id_matches(asset, asset_id) {
                    return config_map_of(asset);
                }
            }
        }

        probe.get("config").and_then(Value::as_object).cloned().unwrap_or_default()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn config_map_of(asset: &Map<String, Value>) -> Map<String, Value> {
    asset.get("config").and_then(Value::as_object).cloned().unwrap_or_default()
}

fn asset_id_matches(asset: &Map<String, Value>, asset_id: i64) -> bool {
    match asset.get("id") {
        Some(Value::Number(n)) => n.as_i64() == Some(asset_id),
        Some(Value::Array(ids)) => {
            ids.iter().any(|v| v.as_i64() == Some(asset_id))
        },
        _ => false,
    }
}

fn warn_on_conflicting_use_sections(doc: &Map<String, Value>) {
    for (probe_name, probe) in doc {
        let Some(probe) = probe.as_object() else { continue };
        if probe.contains_key("use") {
            for section in ["assets", "config"] {
                if probe.contains_key(section) {
                    warn!("both `{section}` and `use` present in probe section `{probe_name}`");
                }
            }
        }
    }
}
