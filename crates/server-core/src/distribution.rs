// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! LeMethod model-distribution engine.
//!
//! After a synchronous barrier (or an init push) completes, the server
//! pushes the fresh parameters to peer servers one hop at a time. The
//! receiver oracle picks each next hop from the previous hop's measured
//! round-trip and the iteration number, and answers `Quit` once every
//! peer that needs this iteration's update has been served.
//!
//! The loop blocks on each peer's reply, so it runs on the worker pool,
//! never on an RPC thread. With LeMethod enabled the pool has exactly one
//! worker, which keeps distribution passes in submission order.

use crate::aggregation::lock_entry;
use crate::{ServerError, ShardServer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tensor_engine::{ops, DType, Shape, Tensor};
use transport::{KvPairs, ModelMessage, NextReceiver, NodeId, RequestMeta, Transport};

impl ShardServer {
    /// Server side of the workers' tree reduction: folds a pre-aggregated
    /// partial sum into the parameter, and when the declared contribution
    /// count reaches the worker count, announces the finished iteration
    /// and starts a distribution pass.
    pub(crate) fn handle_local_aggregation(
        &self,
        dtype: DType,
        meta: &RequestMeta,
        kvs: &KvPairs,
    ) -> Result<(), ServerError> {
        if kvs.keys.len() != 1
            || kvs.lens.len() != 1
            || kvs.vals.len() != kvs.lens[0] as usize
        {
            return Err(ServerError::MalformedRequest {
                reason: "local aggregation must carry one key and one payload".into(),
            });
        }
        let elem_size = dtype.size_bytes();
        if kvs.lens[0] == 0 || kvs.lens[0] as usize % elem_size != 0 {
            return Err(ServerError::MalformedRequest {
                reason: format!("local aggregation payload of {} bytes", kvs.lens[0]),
            });
        }
        let key = self.decode_key(kvs.keys[0])?;
        let elements = kvs.lens[0] as usize / elem_size;
        let recved = Tensor::from_bytes(Shape::vector(elements), dtype, kvs.vals.clone())?;

        let entry_arc = self.store.entry(key);
        let mut guard = lock_entry(&entry_arc);
        let entry = &mut *guard;
        if entry.primary.is_none() {
            entry.primary = Some(Tensor::zeros(Shape::vector(elements), dtype));
        }
        let primary = entry
            .primary
            .as_mut()
            .expect("primary initialized above");

        let mut count = self
            .local_agg_count
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if *count == 0 {
            ops::copy(&recved, primary)?;
        } else {
            ops::elementwise_add_into(primary, &recved)?;
        }
        primary.wait_until_readable();
        *count += meta.num_aggregation;

        if *count as usize == self.transport.num_workers() {
            if !self.sync_mode() {
                return Err(ServerError::UnsupportedMode {
                    reason: "LeMethod aggregation requires synchronous mode".into(),
                });
            }
            self.transport.notice_workers_one_iteration_finish();
            *count = 0;
            drop(count);
            let snapshot = KvPairs {
                keys: kvs.keys.clone(),
                vals: primary.as_bytes().to_vec(),
                lens: vec![primary.size_bytes() as u32],
            };
            self.enqueue_distribution(meta.clone(), snapshot)?;
        }
        Ok(())
    }

    /// Snapshots a key's primary bytes and queues a distribution pass for
    /// them (the init path: peers receive the starting parameters).
    pub(crate) fn distribute_key(
        &self,
        meta: &RequestMeta,
        kvs: &KvPairs,
    ) -> Result<(), ServerError> {
        let key = self.decode_key(kvs.keys[0])?;
        let entry_arc = self
            .store
            .get(key)
            .ok_or(ServerError::NotInitialized { key })?;
        let guard = lock_entry(&entry_arc);
        let primary = guard
            .primary
            .as_ref()
            .ok_or(ServerError::NotInitialized { key })?;
        let snapshot = KvPairs {
            keys: kvs.keys.clone(),
            vals: primary.as_bytes().to_vec(),
            lens: vec![primary.size_bytes() as u32],
        };
        drop(guard);
        self.enqueue_distribution(meta.clone(), snapshot)
    }

    fn enqueue_distribution(
        &self,
        meta: RequestMeta,
        kvs: KvPairs,
    ) -> Result<(), ServerError> {
        let transport = Arc::clone(&self.transport);
        let iteration = Arc::clone(&self.iteration);
        // Fire and forget: the pass reports through the transport.
        let _ = self
            .pool
            .enqueue(move || run_model_distribution(transport.as_ref(), &iteration, &meta, kvs))?;
        Ok(())
    }
}

/// One full dissemination pass: ask the oracle for a receiver, send the
/// model, wait for the reply, feed the measured round-trip back, repeat
/// until `Quit`.
pub(crate) fn run_model_distribution(
    transport: &dyn Transport,
    iteration: &AtomicU64,
    meta: &RequestMeta,
    kvs: KvPairs,
) {
    let iter = iteration.fetch_add(1, Ordering::SeqCst) + 1;
    let mut last_bw: Option<i64> = None;
    let mut last_rcv: Option<NodeId> = None;
    loop {
        let receiver = transport.pick_next_receiver(last_bw, last_rcv, iter);
        let NextReceiver::Peer(peer) = receiver else {
            break;
        };
        let start = Instant::now();
        transport.send_model(ModelMessage {
            sender: transport.my_node_id(),
            recver: peer,
            timestamp: meta.timestamp,
            version: iter,
            kvs: kvs.clone(),
        });
        transport.wait_model_distribution_reply();
        // The round-trip is reported as start − end, i.e. a negative
        // microsecond count. The receiver oracle consumes exactly this
        // sign; do not normalize it.
        let bandwidth = -(start.elapsed().as_micros().max(1) as i64);
        tracing::info!(receiver = peer, bandwidth, iteration = iter, "model distribution hop");
        last_bw = Some(bandwidth);
        last_rcv = Some(peer);
    }
}
