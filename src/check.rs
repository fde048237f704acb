// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Types at the seam between the scheduler and user-supplied check code.

use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc};

use serde::Serialize;
use serde_json::Value;

/// Identifies one monitored resource. `id` and `key` are immutable once
/// assigned; `name` may be updated between reconciliations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Asset {
    pub id: i64,
    pub name: String,
    pub check_key: String,
}

impl Asset {
    pub fn new(id: i64, name: impl Into<String>, check_key: impl Into<String>) -> Self {
        Self { id, name: name.into(), check_key: check_key.into() }
    }
}

/// Severity carried alongside a [`CheckError`]/[`Incomplete`](CheckOutcome::Incomplete)
/// outcome.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    #[default]
    Medium,
    High,
}

/// An error raised by or synthesized for a check invocation.
#[derive(Debug, Clone, Serialize)]
pub struct CheckError {
    pub message: String,
    pub severity: Severity,
}

impl CheckError {
    pub fn new(message: impl Into<String>, severity: Severity) -> Self {
        Self { message: message.into(), severity }
    }

    /// Convenience for the common case of a medium-severity failure.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new(message, Severity::Medium)
    }
}

impl std::fmt::Display for CheckError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// The Rust encoding of the check-function exception taxonomy (§7). User
/// check code returns this directly rather than throwing, since Rust has no
/// exceptions.
#[derive(Debug, Clone)]
pub enum CheckOutcome {
    /// A full result for this tick.
    Ok(Value),
    /// Suppress emission for this tick only; the loop continues normally.
    IgnoreResult,
    /// Suppress emission and stop scheduling this assignment until its
    /// configuration next changes.
    IgnoreCheck,
    /// A failed tick; emitted as `{result: null, error: {...}}`.
    Error(CheckError),
    /// A partial result alongside an error; emitted as
    /// `{result: partial, error: {...}}`.
    Incomplete(Value, CheckError),
}

/// A registered check function: asset identity, resolved per-asset config
/// (from the local config store), and the raw assignment config (including
/// `_interval`/`_use`) in, an outcome out.
pub type CheckFn = Arc<
    dyn Fn(Asset, Value, Value) -> Pin<Box<dyn Future<Output = CheckOutcome> + Send>>
        + Send
        + Sync,
>;

/// The probe's registered check functions, keyed by check key.
#[derive(Clone, Default)]
pub struct CheckRegistry {
    funs: HashMap<String, CheckFn>,
}

impl CheckRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, check_key: impl Into<String>, fun: CheckFn) -> &mut Self {
        self.funs.insert(check_key.into(), fun);
        self
    }

    pub fn contains(&self, check_key: &str) -> bool {
        self.funs.contains_key(check_key)
    }

    pub fn get(&self, check_key: &str) -> Option<CheckFn> {
        self.funs.get(check_key).cloned()
    }
}

impl std::fmt::Debug for CheckRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckRegistry")
            .field("keys", &self.funs.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_lookup() {
        let mut reg = CheckRegistry::new();
        reg.register(
            "ping",
            Arc::new(|_asset, _opts, _cfg| {
                Box::pin(async { CheckOutcome::Ok(serde_json::json!({"up": true})) })
            }),
        );
        assert!(reg.contains("ping"));
        assert!(!reg.contains("other"));
        assert!(reg.get("ping").is_some());
    }
}
