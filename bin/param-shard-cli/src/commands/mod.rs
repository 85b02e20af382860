// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! CLI subcommand implementations.

pub mod lemethod;
pub mod run;

use tracing_subscriber::EnvFilter;

/// Initializes tracing based on `-v` repetition; `RUST_LOG` wins if set.
pub fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Prints the default server configuration as TOML.
pub fn init_config() -> anyhow::Result<()> {
    let config = server_core::ServerConfig::default();
    println!("{}", config.to_toml()?);
    Ok(())
}
