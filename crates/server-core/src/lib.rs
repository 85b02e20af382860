// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! # server-core
//!
//! The aggregation and model-distribution core of a sharded parameter
//! server. Each server process owns a disjoint range of integer keys;
//! workers push gradients for those keys and pull the updated parameters.
//!
//! Every inbound message is either a **command** (mode switches, codec and
//! profiler configuration, shutdown) or a **data request** (dense,
//! row-sparse, or compressed push/pull). Pushes accumulate in a per-key
//! update buffer; once a synchronous cohort is complete the optimizer runs
//! on the [`SerialExecutor`] and the cohort's requesters are answered. In
//! LeMethod mode the server instead disseminates the updated parameters to
//! peer servers over a bandwidth-guided route, off the RPC threads on the
//! [`WorkerPool`].
//!
//! # Execution Contexts
//! ```text
//! RPC callback threads ──► handle_command / handle_data
//!        │                        │
//!        │  exec()                │  enqueue()
//!        ▼                        ▼
//! SerialExecutor thread    WorkerPool thread
//! (optimizer, controller)  (model distribution)
//! ```
//!
//! The per-key state is protected by one mutex per entry; there is no
//! global lock, so requests for different keys never order each other.

mod aggregation;
mod command;
pub mod config;
mod distribution;
mod error;
mod exec;
mod pool;
mod profiler;
mod server;
mod store;
mod update;

pub use command::CommandKind;
pub use config::ServerConfig;
pub use error::ServerError;
pub use exec::SerialExecutor;
pub use pool::{TaskHandle, WorkerPool};
pub use profiler::{ProfilerSink, TracingProfiler};
pub use server::{Controller, ShardServer, Updater};
pub use store::{Entry, Key, ParameterStore, UpdateBuf};
