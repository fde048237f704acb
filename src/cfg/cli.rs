// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Default host the agentcore listens on.
pub const DEFAULT_AGENTCORE_HOST: &str = "127.0.0.1";
/// Default port the agentcore listens on.
pub const DEFAULT_AGENTCORE_PORT: u16 = 8750;
/// Default path to the probe's local YAML configuration.
pub const DEFAULT_INFRASONAR_CONF: &str = "/data/config/infrasonar.yaml";
/// Default `MAX_PACKAGE_SIZE`, in kilobytes.
const DEFAULT_MAX_PACKAGE_SIZE_KB: u32 = 500;

/// Resolves a relative or absolute path against the current working
/// directory without requiring the target to already exist.
///
/// Unlike a strict canonicalization, a missing file is not an error here: the
/// config store is responsible for creating it on first run.
pub fn resolve_config_path(rel: impl AsRef<Path>) -> Result<PathBuf> {
    let p = rel.as_ref();

    let abs = if p.is_absolute() {
        p.to_path_buf()
    } else {
        std::env::current_dir()
            .context("cannot get current working dir")?
            .join(p)
    };

    Ok(match abs.canonicalize() {
        Ok(canon) => canon,
        Err(_) => abs,
    })
}

/// Runtime settings sourced from the process environment.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub agentcore_host: String,
    pub agentcore_port: u16,
    pub config_path: PathBuf,
    /// Maximum outgoing frame size, in bytes.
    pub max_package_size: usize,
}

impl EnvConfig {
    /// Reads `AGENTCORE_HOST`, `AGENTCORE_PORT`, `INFRASONAR_CONF`, and
    /// `MAX_PACKAGE_SIZE` from the environment, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        let agentcore_host = std::env::var("AGENTCORE_HOST")
            .unwrap_or_else(|_| DEFAULT_AGENTCORE_HOST.to_string());

        let agentcore_port = match std::env::var("AGENTCORE_PORT") {
            Ok(v) => v.parse().context("AGENTCORE_PORT must be a u16")?,
            Err(_) => DEFAULT_AGENTCORE_PORT,
        };

        let config_path_raw = std::env::var("INFRASONAR_CONF")
            .unwrap_or_else(|_| DEFAULT_INFRASONAR_CONF.to_string());
        let config_path = resolve_config_path(config_path_raw)?;

        let max_package_size_kb = match std::env::var("MAX_PACKAGE_SIZE") {
            Ok(v) => v.parse().context("MAX_PACKAGE_SIZE must be an integer")?,
            Err(_) => DEFAULT_MAX_PACKAGE_SIZE_KB,
        };
        let max_package_size_kb = max_package_size_kb.clamp(1, 2000);

        Ok(Self {
            agentcore_host,
            agentcore_port,
            config_path,
            max_package_size: max_package_size_kb as usize * 1000,
        })
    }
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;

    // Both tests below mutate process-wide env vars, so they must not run
    // concurrently with each other (or with any other test touching the
    // same vars).
    #[test]
    #[serial]
    fn max_package_size_clamps_to_bounds() {
        unsafe {
            std::env::set_var("MAX_PACKAGE_SIZE", "50000");
        }
        let cfg = EnvConfig::from_env().expect("env config");
        assert_eq!(cfg.max_package_size, 2000 * 1000);
        unsafe {
            std::env::remove_var("MAX_PACKAGE_SIZE");
        }
    }

    #[test]
    #[serial]
    fn defaults_when_unset() {
        unsafe {
            std::env::remove_var("AGENTCORE_HOST");
            std::env::remove_var("AGENTCORE_PORT");
            std::env::remove_var("MAX_PACKAGE_SIZE");
        }
        let cfg = EnvConfig::from_env().expect("env config");
        assert_eq!(cfg.agentcore_host, DEFAULT_AGENTCORE_HOST);
        assert_eq!(cfg.agentcore_port, DEFAULT_AGENTCORE_PORT);
        assert_eq!(cfg.max_package_size, DEFAULT_MAX_PACKAGE_SIZE_KB as usize * 1000);
    }
}
