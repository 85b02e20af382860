// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! In-process transport used by the integration tests and the demo CLI.
//!
//! `LoopbackTransport` records every outbound interaction (acks, value
//! replies, auto-pull updates, model-distribution sends, oracle calls)
//! so a test can drive the server handlers directly and then assert on
//! exactly what left the server. Model-distribution replies are immediate
//! and the receiver oracle walks a scripted sequence.

use crate::{
    ControlMessage, KeyRange, KvPairs, ModelMessage, NextReceiver, NodeId, RequestMeta, Transport,
};
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// One recorded `respond`/`respond_with` call.
#[derive(Debug, Clone)]
pub struct ResponseRecord {
    pub meta: RequestMeta,
    pub kvs: Option<KvPairs>,
}

/// One recorded `auto_pull_update` call.
#[derive(Debug, Clone)]
pub struct AutoPullRecord {
    pub version: u64,
    pub meta: RequestMeta,
    pub kvs: KvPairs,
}

/// One recorded `pick_next_receiver` call.
#[derive(Debug, Clone, Copy)]
pub struct OracleCall {
    pub last_bw: Option<i64>,
    pub last_rcv: Option<NodeId>,
    pub iteration: u64,
}

#[derive(Default)]
struct State {
    responses: Vec<ResponseRecord>,
    command_acks: Vec<i32>,
    auto_pulls: Vec<AutoPullRecord>,
    model_sends: Vec<ModelMessage>,
    model_waits: usize,
    iteration_notices: usize,
    receiver_script: VecDeque<NextReceiver>,
    oracle_calls: Vec<OracleCall>,
}

/// An in-process [`Transport`] that records all outbound traffic.
pub struct LoopbackTransport {
    num_workers: usize,
    rank: usize,
    node_id: NodeId,
    key_range: KeyRange,
    state: Mutex<State>,
    activity: Condvar,
}

impl LoopbackTransport {
    /// Creates a loopback transport for a server owning `key_range` in a
    /// run with `num_workers` workers.
    pub fn new(num_workers: usize, key_range: KeyRange) -> Self {
        Self {
            num_workers,
            rank: 0,
            node_id: 8,
            key_range,
            state: Mutex::new(State::default()),
            activity: Condvar::new(),
        }
    }

    /// Queues the receivers the oracle will hand out, in order. Once the
    /// script is exhausted the oracle answers [`NextReceiver::Quit`].
    pub fn script_receivers(&self, receivers: impl IntoIterator<Item = NextReceiver>) {
        let mut state = self.lock();
        state.receiver_script.extend(receivers);
    }

    /// Drains and returns all recorded responses.
    pub fn take_responses(&self) -> Vec<ResponseRecord> {
        std::mem::take(&mut self.lock().responses)
    }

    /// Returns the command tags acknowledged so far.
    pub fn command_acks(&self) -> Vec<i32> {
        self.lock().command_acks.clone()
    }

    /// Drains and returns all recorded auto-pull updates.
    pub fn take_auto_pulls(&self) -> Vec<AutoPullRecord> {
        std::mem::take(&mut self.lock().auto_pulls)
    }

    /// Returns copies of all model-distribution sends so far.
    pub fn model_sends(&self) -> Vec<ModelMessage> {
        self.lock().model_sends.clone()
    }

    /// Returns the recorded oracle calls.
    pub fn oracle_calls(&self) -> Vec<OracleCall> {
        self.lock().oracle_calls.clone()
    }

    /// Returns how many one-iteration-finished notices were sent.
    pub fn iteration_notices(&self) -> usize {
        self.lock().iteration_notices
    }

    /// Returns how many model-distribution replies were awaited.
    pub fn model_waits(&self) -> usize {
        self.lock().model_waits
    }

    /// Blocks until at least `n` model messages have been sent, or the
    /// timeout elapses. Returns `true` on success.
    ///
    /// Distribution runs on the server's worker pool, so tests use this to
    /// join the asynchronous part of the pipeline.
    pub fn wait_for_model_sends(&self, n: usize, timeout: Duration) -> bool {
        let state = self.lock();
        let (state, result) = self
            .activity
            .wait_timeout_while(state, timeout, |s| s.model_sends.len() < n)
            .unwrap_or_else(|e| e.into_inner());
        drop(state);
        !result.timed_out()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Transport for LoopbackTransport {
    fn respond(&self, meta: &RequestMeta) {
        tracing::debug!(sender = meta.sender, ts = meta.timestamp, "ack");
        self.lock().responses.push(ResponseRecord {
            meta: meta.clone(),
            kvs: None,
        });
        self.activity.notify_all();
    }

    fn respond_with(&self, meta: &RequestMeta, kvs: KvPairs) {
        tracing::debug!(
            sender = meta.sender,
            ts = meta.timestamp,
            bytes = kvs.vals.len(),
            "reply"
        );
        self.lock().responses.push(ResponseRecord {
            meta: meta.clone(),
            kvs: Some(kvs),
        });
        self.activity.notify_all();
    }

    fn respond_command(&self, msg: &ControlMessage) {
        self.lock().command_acks.push(msg.head);
        self.activity.notify_all();
    }

    fn auto_pull_update(&self, version: u64, meta: &RequestMeta, kvs: KvPairs) {
        tracing::debug!(version, sender = meta.sender, "auto-pull");
        self.lock().auto_pulls.push(AutoPullRecord {
            version,
            meta: meta.clone(),
            kvs,
        });
        self.activity.notify_all();
    }

    fn send_model(&self, msg: ModelMessage) {
        tracing::debug!(recver = msg.recver, version = msg.version, "model send");
        self.lock().model_sends.push(msg);
        self.activity.notify_all();
    }

    fn wait_model_distribution_reply(&self) {
        // Simulate a peer ack with a small measurable latency.
        std::thread::sleep(Duration::from_micros(200));
        self.lock().model_waits += 1;
    }

    fn notice_workers_one_iteration_finish(&self) {
        self.lock().iteration_notices += 1;
        self.activity.notify_all();
    }

    fn pick_next_receiver(
        &self,
        last_bw: Option<i64>,
        last_rcv: Option<NodeId>,
        iteration: u64,
    ) -> NextReceiver {
        let mut state = self.lock();
        state.oracle_calls.push(OracleCall {
            last_bw,
            last_rcv,
            iteration,
        });
        state
            .receiver_script
            .pop_front()
            .unwrap_or(NextReceiver::Quit)
    }

    fn server_key_range(&self) -> KeyRange {
        self.key_range
    }

    fn num_workers(&self) -> usize {
        self.num_workers
    }

    fn my_rank(&self) -> usize {
        self.rank
    }

    fn my_node_id(&self) -> NodeId {
        self.node_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_responses() {
        let t = LoopbackTransport::new(2, KeyRange::new(0, 100));
        let meta = RequestMeta::push(1, 7, 0);
        t.respond(&meta);
        t.respond_with(&meta, KvPairs::dense(3, vec![1, 2]));

        let recs = t.take_responses();
        assert_eq!(recs.len(), 2);
        assert!(recs[0].kvs.is_none());
        assert_eq!(recs[1].kvs.as_ref().unwrap().keys, vec![3]);
        assert!(t.take_responses().is_empty());
    }

    #[test]
    fn test_scripted_oracle() {
        let t = LoopbackTransport::new(2, KeyRange::new(0, 100));
        t.script_receivers([NextReceiver::Peer(9), NextReceiver::Peer(10)]);

        assert_eq!(t.pick_next_receiver(None, None, 1), NextReceiver::Peer(9));
        assert_eq!(
            t.pick_next_receiver(Some(-120), Some(9), 1),
            NextReceiver::Peer(10)
        );
        // Script exhausted.
        assert_eq!(
            t.pick_next_receiver(Some(-80), Some(10), 1),
            NextReceiver::Quit
        );

        let calls = t.oracle_calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[1].last_bw, Some(-120));
        assert_eq!(calls[1].last_rcv, Some(9));
    }

    #[test]
    fn test_wait_for_model_sends() {
        let t = LoopbackTransport::new(1, KeyRange::new(0, 10));
        assert!(!t.wait_for_model_sends(1, Duration::from_millis(10)));
        t.send_model(ModelMessage {
            sender: 8,
            recver: 9,
            timestamp: 0,
            version: 1,
            kvs: KvPairs::dense(0, vec![]),
        });
        assert!(t.wait_for_model_sends(1, Duration::from_millis(10)));
    }
}
