// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! # param-shard
//!
//! Command-line demo driver for the param-shard server core.
//!
//! ## Usage
//! ```bash
//! # Run a synchronous data-parallel training loop against one shard
//! param-shard run --workers 2 --keys 4 --iterations 10
//!
//! # Same loop with asynchronous pushes
//! param-shard run --workers 4 --mode async
//!
//! # Walk through a LeMethod iteration: local aggregation + distribution
//! param-shard lemethod --workers 2 --peers 9,10,11
//!
//! # Print the default server configuration as TOML
//! param-shard init-config
//! ```

mod commands;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "param-shard",
    about = "Sharded parameter-server core demo driver",
    version,
    author
)]
struct Cli {
    /// Enable verbose logging (repeat for more: -v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a simulated data-parallel training loop on one shard.
    Run {
        /// Number of simulated workers.
        #[arg(short, long, default_value_t = 2)]
        workers: usize,

        /// Number of parameter keys.
        #[arg(short, long, default_value_t = 4)]
        keys: usize,

        /// Elements per parameter tensor.
        #[arg(long, default_value_t = 8)]
        width: usize,

        /// Training iterations to run.
        #[arg(short, long, default_value_t = 10)]
        iterations: usize,

        /// Aggregation mode: "sync" or "async".
        #[arg(short, long, default_value = "sync")]
        mode: String,

        /// SGD learning rate applied by the server-side optimizer.
        #[arg(long, default_value_t = 0.1)]
        learning_rate: f32,
    },

    /// Walk through one LeMethod iteration: worker subtrees push partial
    /// sums, the server completes the aggregation and disseminates the
    /// model along the scripted peer route.
    Lemethod {
        /// Number of simulated workers.
        #[arg(short, long, default_value_t = 2)]
        workers: usize,

        /// Comma-separated peer node ids for the distribution route.
        #[arg(short, long, default_value = "9,10")]
        peers: String,
    },

    /// Print the default server configuration as TOML.
    InitConfig,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    commands::init_tracing(cli.verbose);

    match cli.command {
        Commands::Run {
            workers,
            keys,
            width,
            iterations,
            mode,
            learning_rate,
        } => commands::run::execute(workers, keys, width, iterations, &mode, learning_rate),
        Commands::Lemethod { workers, peers } => commands::lemethod::execute(workers, &peers),
        Commands::InitConfig => commands::init_config(),
    }
}
