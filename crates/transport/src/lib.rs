// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! # transport
//!
//! The transport interface the shard server consumes, plus the wire-level
//! framing types shared between the server and its peers.
//!
//! The real RPC fabric (message framing, routing, membership, the
//! receiver-selection oracle) lives outside this workspace; the server only
//! sees the [`Transport`] trait. This crate provides:
//!
//! - [`RequestMeta`] / [`KvPairs`] — per-request metadata and key/value
//!   payload frames.
//! - [`ControlMessage`] — out-of-band command envelope.
//! - [`handle`] — the paired request-kind/dtype wire tag.
//! - [`Transport`] — the consumed interface: responses, auto-pull updates,
//!   model-distribution sends, the receiver oracle, key ranges.
//! - [`LoopbackTransport`] — an in-process implementation that records all
//!   outbound traffic, used by the integration tests and the demo CLI.

pub mod handle;
mod loopback;
mod message;

pub use handle::{DataHandleKind, RequestKind};
pub use loopback::{AutoPullRecord, LoopbackTransport, OracleCall, ResponseRecord};
pub use message::{ControlMarker, ControlMessage, KvPairs, ModelMessage, RequestMeta};

/// Identifier of a node (worker, server, or scheduler) in the process group.
pub type NodeId = i32;

/// A server's owned slice of the global key space: `[begin, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct KeyRange {
    pub begin: u64,
    pub end: u64,
}

impl KeyRange {
    /// Creates a range covering `[begin, end)`.
    pub fn new(begin: u64, end: u64) -> Self {
        Self { begin, end }
    }

    /// Returns `true` if `key` falls inside this range.
    pub fn contains(&self, key: u64) -> bool {
        key >= self.begin && key < self.end
    }
}

/// Result of asking the receiver oracle for the next model-distribution hop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextReceiver {
    /// Send this iteration's model to the given peer next.
    Peer(NodeId),
    /// Every peer that needs this iteration's update has been served.
    Quit,
}

/// The transport interface consumed by the shard server.
///
/// All methods are callable from any thread. Responses and sends are
/// fire-and-forget; `wait_model_distribution_reply` is the only blocking
/// call and pairs with the preceding `send_model`.
pub trait Transport: Send + Sync {
    /// Acknowledges a data request without a payload.
    fn respond(&self, meta: &RequestMeta);

    /// Replies to a data request with a key/value payload.
    fn respond_with(&self, meta: &RequestMeta, kvs: KvPairs);

    /// Acknowledges an out-of-band command.
    fn respond_command(&self, msg: &ControlMessage);

    /// Sends an unsolicited pull reply stamped with a parameter version.
    fn auto_pull_update(&self, version: u64, meta: &RequestMeta, kvs: KvPairs);

    /// Sends a model-distribution message to the peer named in `msg`.
    fn send_model(&self, msg: ModelMessage);

    /// Blocks until the receiver of the last model-distribution send has
    /// acknowledged it.
    fn wait_model_distribution_reply(&self);

    /// Tells the workers that one aggregation iteration has finished.
    fn notice_workers_one_iteration_finish(&self);

    /// Asks the receiver oracle for the next model-distribution hop.
    ///
    /// `last_bw` is the previous hop's round-trip figure in the oracle's
    /// sign convention (`start − end` microseconds, a negative value);
    /// `None` on the first hop of an iteration.
    fn pick_next_receiver(
        &self,
        last_bw: Option<i64>,
        last_rcv: Option<NodeId>,
        iteration: u64,
    ) -> NextReceiver;

    /// Returns the key range owned by this server.
    fn server_key_range(&self) -> KeyRange;

    /// Returns the number of workers participating in the run.
    fn num_workers(&self) -> usize;

    /// Returns this server's rank in the server group.
    fn my_rank(&self) -> usize;

    /// Returns this server's node id.
    fn my_node_id(&self) -> NodeId;
}
