// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Request metadata and payload frames.

use crate::NodeId;
use serde::{Deserialize, Serialize};

/// Control marker attached to data requests that take a special server
/// path instead of the normal aggregation pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMarker {
    /// The payload is a pre-aggregated partial sum from a worker subtree.
    LocalAggregation,
    /// The payload initializes a parameter and should then be distributed
    /// to peer servers.
    Init,
}

/// Metadata accompanying every data request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestMeta {
    /// Node id of the requester.
    pub sender: NodeId,
    /// Transport-assigned timestamp used to match responses to requests.
    pub timestamp: i64,
    /// `true` when the request carries data to store.
    pub push: bool,
    /// `true` when the requester wants the value back.
    pub pull: bool,
    /// Paired request-kind/dtype tag (see [`crate::handle`]).
    pub cmd: i32,
    /// How many worker contributions this message represents when the
    /// transport pre-aggregates pushes; 1 otherwise.
    pub num_merge: u32,
    /// How many workers' gradients are folded into a local-aggregation
    /// payload.
    pub num_aggregation: u32,
    /// Special-path marker, if any.
    pub control: Option<ControlMarker>,
}

impl RequestMeta {
    /// Plain push metadata with the given cmd tag: one merge, no marker.
    pub fn push(sender: NodeId, timestamp: i64, cmd: i32) -> Self {
        Self {
            sender,
            timestamp,
            push: true,
            pull: false,
            cmd,
            num_merge: 1,
            num_aggregation: 0,
            control: None,
        }
    }

    /// Plain pull metadata with the given cmd tag.
    pub fn pull(sender: NodeId, timestamp: i64, cmd: i32) -> Self {
        Self {
            sender,
            timestamp,
            push: false,
            pull: true,
            cmd,
            num_merge: 1,
            num_aggregation: 0,
            control: None,
        }
    }
}

/// A key/value payload frame: parallel `keys` and `lens` arrays plus one
/// concatenated byte buffer.
///
/// Wire invariants (enforced server-side): dense requests carry one key
/// and one length equal to the payload size; row-sparse requests carry the
/// master key followed by row keys, with the master key's length 0;
/// compressed pushes carry exactly two keys and two lengths, the first 0.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KvPairs {
    pub keys: Vec<u64>,
    pub vals: Vec<u8>,
    pub lens: Vec<u32>,
}

impl KvPairs {
    /// Builds a single-key frame whose length entry covers all of `vals`.
    pub fn dense(key: u64, vals: Vec<u8>) -> Self {
        let len = vals.len() as u32;
        Self {
            keys: vec![key],
            vals,
            lens: vec![len],
        }
    }
}

/// An out-of-band command envelope: a small integer tag plus an opaque
/// body interpreted per-kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlMessage {
    pub head: i32,
    pub body: Vec<u8>,
}

impl ControlMessage {
    pub fn new(head: i32, body: impl Into<Vec<u8>>) -> Self {
        Self {
            head,
            body: body.into(),
        }
    }
}

/// A model-distribution message pushed to a peer server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMessage {
    pub sender: NodeId,
    pub recver: NodeId,
    /// Timestamp copied from the request that completed the barrier.
    pub timestamp: i64,
    /// Distribution iteration counter, carried as the message version.
    pub version: u64,
    pub kvs: KvPairs,
}
