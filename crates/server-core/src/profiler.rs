// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Profiler control surface.
//!
//! The profiler itself lives outside the server core; the command plane
//! only needs somewhere to forward the frontend's profiler commands. The
//! default sink records the requests in the log, which keeps headless
//! deployments observable without a profiler backend attached.

/// Receiver for the profiler commands relayed by the command plane.
pub trait ProfilerSink: Send + Sync {
    /// Applies a configuration of `key:value` pairs.
    fn set_config(&self, pairs: &[(String, String)]);

    /// Starts (`true`) or stops (`false`) profiling.
    fn set_state(&self, active: bool);

    /// Pauses (`true`) or resumes (`false`) sample collection.
    fn pause(&self, paused: bool);

    /// Writes collected profile data out.
    fn dump(&self);
}

/// Default sink: logs every profiler command through `tracing`.
#[derive(Debug, Default)]
pub struct TracingProfiler;

impl ProfilerSink for TracingProfiler {
    fn set_config(&self, pairs: &[(String, String)]) {
        tracing::info!(?pairs, "profiler config");
    }

    fn set_state(&self, active: bool) {
        tracing::info!(active, "profiler state");
    }

    fn pause(&self, paused: bool) {
        tracing::info!(paused, "profiler pause");
    }

    fn dump(&self) {
        tracing::info!("profiler dump");
    }
}
