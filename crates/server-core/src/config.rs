// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Server configuration loaded from TOML files, the environment, or
//! constructed programmatically.
//!
//! # TOML Format
//! ```toml
//! enable_lemethod = false
//! enable_tsengine = false
//! log_verbose = false
//! worker_pool_size = 1
//! ```
//!
//! The process-wide environment toggles recognized by [`ServerConfig::from_env`]
//! are `ENABLE_LEMETHOD`, `ENABLE_TSENGINE`, and
//! `MXNET_KVSTORE_DIST_ROW_SPARSE_VERBOSE`.

use crate::ServerError;
use std::path::Path;

/// Configuration for a shard server.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ServerConfig {
    /// Enables the LeMethod paths: local aggregation, init-time
    /// distribution, and peer-to-peer model dissemination. Restricts the
    /// worker pool to one thread and rejects non-dense requests.
    #[serde(default)]
    pub enable_lemethod: bool,
    /// Acks dense pushes before aggregation completes and delivers pull
    /// values through unsolicited version-stamped auto-pull updates.
    #[serde(default)]
    pub enable_tsengine: bool,
    /// Per-push logging for row-sparse traffic.
    #[serde(default)]
    pub log_verbose: bool,
    /// Worker pool size for model distribution. Fixed at construction.
    #[serde(default = "default_pool_size")]
    pub worker_pool_size: usize,
}

fn default_pool_size() -> usize {
    1
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enable_lemethod: false,
            enable_tsengine: false,
            log_verbose: false,
            worker_pool_size: default_pool_size(),
        }
    }
}

impl ServerConfig {
    /// Builds a configuration from the process environment.
    pub fn from_env() -> Self {
        Self {
            enable_lemethod: env_flag("ENABLE_LEMETHOD"),
            enable_tsengine: env_flag("ENABLE_TSENGINE"),
            log_verbose: env_flag("MXNET_KVSTORE_DIST_ROW_SPARSE_VERBOSE"),
            worker_pool_size: default_pool_size(),
        }
    }

    /// Loads configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ServerError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ServerError::Config(format!("cannot read config '{}': {e}", path.display()))
        })?;
        Self::from_toml(&content)
    }

    /// Parses configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ServerError> {
        toml::from_str(toml_str)
            .map_err(|e| ServerError::Config(format!("TOML parse error: {e}")))
    }

    /// Serialises configuration to TOML.
    pub fn to_toml(&self) -> Result<String, ServerError> {
        toml::to_string_pretty(self)
            .map_err(|e| ServerError::Config(format!("TOML serialise error: {e}")))
    }

    /// The worker-pool size actually used: LeMethod forces a single
    /// worker so distribution passes stay ordered.
    pub fn effective_pool_size(&self) -> usize {
        if self.enable_lemethod {
            1
        } else {
            self.worker_pool_size.max(1)
        }
    }
}

/// Reads a boolean environment toggle: `1`, `true`, `yes`, `on`
/// (case-insensitive) count as set.
fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| {
            let v = v.trim().to_ascii_lowercase();
            matches!(v.as_str(), "1" | "true" | "yes" | "on")
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default() {
        let c = ServerConfig::default();
        assert!(!c.enable_lemethod);
        assert!(!c.enable_tsengine);
        assert_eq!(c.worker_pool_size, 1);
    }

    #[test]
    fn test_from_toml() {
        let toml = r#"
enable_lemethod = true
worker_pool_size = 4
"#;
        let c = ServerConfig::from_toml(toml).unwrap();
        assert!(c.enable_lemethod);
        assert!(!c.enable_tsengine);
        assert_eq!(c.worker_pool_size, 4);
    }

    #[test]
    fn test_to_toml_roundtrip() {
        let c = ServerConfig {
            enable_tsengine: true,
            ..Default::default()
        };
        let toml = c.to_toml().unwrap();
        let back = ServerConfig::from_toml(&toml).unwrap();
        assert!(back.enable_tsengine);
    }

    #[test]
    fn test_lemethod_forces_single_worker() {
        let c = ServerConfig {
            enable_lemethod: true,
            worker_pool_size: 8,
            ..Default::default()
        };
        assert_eq!(c.effective_pool_size(), 1);

        let c2 = ServerConfig {
            worker_pool_size: 0,
            ..Default::default()
        };
        assert_eq!(c2.effective_pool_size(), 1);
    }
}
