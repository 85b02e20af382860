// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Integration tests: the full push → barrier → update → respond pipeline
//! over a loopback transport with two workers, covering dense, row-sparse,
//! compressed, mixed-precision, TSEngine, and LeMethod traffic.

use server_core::{Key, ServerConfig, ServerError, ShardServer};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tensor_engine::{DType, Shape, Tensor};
use transport::handle::{DataHandleKind, RequestKind};
use transport::{
    ControlMarker, ControlMessage, KeyRange, KvPairs, LoopbackTransport, NextReceiver, RequestMeta,
};

// ── Helpers ────────────────────────────────────────────────────

const RANGE_BEGIN: u64 = 100;
const NUM_WORKERS: usize = 2;

/// Commands in the frontend's tag order.
const CMD_SET_MULTI_PRECISION: i32 = 1;
const CMD_SYNC_MODE: i32 = 3;

fn make_server(config: ServerConfig) -> (Arc<LoopbackTransport>, ShardServer) {
    let transport = Arc::new(LoopbackTransport::new(
        NUM_WORKERS,
        KeyRange::new(RANGE_BEGIN, RANGE_BEGIN + 10_000),
    ));
    let server = ShardServer::new(transport.clone(), config);
    (transport, server)
}

/// Runs the serial-executor consumer on a background thread for the test's
/// lifetime.
struct ExecGuard {
    exec: server_core::SerialExecutor,
    handle: Option<thread::JoinHandle<()>>,
}

fn start_exec(server: &ShardServer) -> ExecGuard {
    let exec = server.executor();
    let runner = exec.clone();
    ExecGuard {
        exec,
        handle: Some(thread::spawn(move || runner.run())),
    }
}

impl Drop for ExecGuard {
    fn drop(&mut self) {
        self.exec.stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn cmd_tag(kind: RequestKind, dtype: DType) -> i32 {
    DataHandleKind {
        kind,
        dtype_tag: dtype.wire_tag(),
    }
    .pair()
}

fn f32_bytes(vals: &[f32]) -> Vec<u8> {
    vals.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn f32_from_bytes(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

fn f16_bytes(vals: &[f32]) -> Vec<u8> {
    let mut t = Tensor::zeros(Shape::vector(vals.len()), DType::F16);
    t.fill_from_f32(vals).unwrap();
    t.as_bytes().to_vec()
}

fn assert_close(actual: &[f32], expected: &[f32]) {
    assert_eq!(actual.len(), expected.len(), "{actual:?} vs {expected:?}");
    for (a, e) in actual.iter().zip(expected) {
        assert!((a - e).abs() < 1e-4, "{actual:?} vs {expected:?}");
    }
}

/// SGD: `p ← p − lr·g`, handling dense and row-sparse gradients.
fn sgd(lr: f32) -> impl Fn(Key, &Tensor, &mut Tensor) + Send + Sync {
    move |_key, grad, param| {
        let mut values = param.to_f32_vec();
        if let Some(indices) = grad.indices() {
            let unit = grad.shape().unit_len();
            let g = grad.to_f32_vec();
            for (i, &row) in indices.iter().enumerate() {
                for c in 0..unit {
                    values[row as usize * unit + c] -= lr * g[i * unit + c];
                }
            }
        } else {
            for (p, g) in values.iter_mut().zip(grad.to_f32_vec()) {
                *p -= lr * g;
            }
        }
        param.fill_from_f32(&values).unwrap();
    }
}

fn push_dense(
    server: &ShardServer,
    wire_key: u64,
    vals: &[f32],
    sender: i32,
    pull: bool,
) -> Result<(), ServerError> {
    let mut meta = RequestMeta::push(sender, sender as i64, cmd_tag(RequestKind::DensePushPull, DType::F32));
    meta.pull = pull;
    server.handle_data(&meta, &KvPairs::dense(wire_key, f32_bytes(vals)))
}

fn pull_dense(server: &ShardServer, wire_key: u64, sender: i32) -> Result<(), ServerError> {
    let meta = RequestMeta::pull(sender, 99, cmd_tag(RequestKind::DensePushPull, DType::F32));
    let kvs = KvPairs {
        keys: vec![wire_key],
        vals: Vec::new(),
        lens: Vec::new(),
    };
    server.handle_data(&meta, &kvs)
}

fn latch_sync(server: &ShardServer) {
    server
        .handle_command(&ControlMessage::new(CMD_SYNC_MODE, Vec::new()))
        .unwrap();
}

// ── Scenario 1: dense init ─────────────────────────────────────

#[test]
fn test_dense_init_and_pull() {
    let (transport, server) = make_server(ServerConfig::default());

    push_dense(&server, RANGE_BEGIN + 5, &[1.0, 2.0, 3.0], 1, false).unwrap();

    let responses = transport.take_responses();
    assert_eq!(responses.len(), 1, "init push is acked");
    assert!(responses[0].kvs.is_none());
    assert_eq!(server.key_version(5), Some(0));

    pull_dense(&server, RANGE_BEGIN + 5, 1).unwrap();
    let responses = transport.take_responses();
    let reply = responses[0].kvs.as_ref().unwrap();
    assert_close(&f32_from_bytes(&reply.vals), &[1.0, 2.0, 3.0]);
    assert_eq!(reply.lens, vec![12]);
}

// ── Scenario 2: dense sync barrier ─────────────────────────────

#[test]
fn test_dense_sync_barrier() {
    let (transport, server) = make_server(ServerConfig::default());
    let _exec = start_exec(&server);
    server.set_updater(sgd(1.0));
    latch_sync(&server);

    push_dense(&server, RANGE_BEGIN + 5, &[1.0, 2.0, 3.0], 1, false).unwrap();
    transport.take_responses();

    // First worker's push is held until the cohort completes.
    push_dense(&server, RANGE_BEGIN + 5, &[0.1, 0.2, 0.3], 1, true).unwrap();
    assert!(transport.take_responses().is_empty());
    assert_eq!(server.key_version(5), Some(0));

    push_dense(&server, RANGE_BEGIN + 5, &[0.1, 0.2, 0.3], 2, true).unwrap();
    let responses = transport.take_responses();
    assert_eq!(responses.len(), 2, "both cohort members answered");
    for resp in &responses {
        let kvs = resp.kvs.as_ref().expect("pull requesters get values");
        assert_close(&f32_from_bytes(&kvs.vals), &[0.8, 1.6, 2.4]);
    }
    assert_eq!(server.key_version(5), Some(1));
}

#[test]
fn test_dense_sync_mixed_pull_and_push_only() {
    let (transport, server) = make_server(ServerConfig::default());
    let _exec = start_exec(&server);
    server.set_updater(sgd(1.0));
    latch_sync(&server);

    push_dense(&server, RANGE_BEGIN + 7, &[4.0], 1, false).unwrap();
    transport.take_responses();

    push_dense(&server, RANGE_BEGIN + 7, &[1.0], 1, false).unwrap();
    push_dense(&server, RANGE_BEGIN + 7, &[1.0], 2, true).unwrap();

    let responses = transport.take_responses();
    assert_eq!(responses.len(), 2, "push-only members still get an ack");
    let acks = responses.iter().filter(|r| r.kvs.is_none()).count();
    let values = responses.iter().filter(|r| r.kvs.is_some()).count();
    assert_eq!((acks, values), (1, 1));
}

// ── Aggregation laws ───────────────────────────────────────────

#[test]
fn test_zero_gradient_round_trip_identity() {
    let (transport, server) = make_server(ServerConfig::default());
    let _exec = start_exec(&server);
    server.set_updater(sgd(0.0));
    latch_sync(&server);

    push_dense(&server, RANGE_BEGIN, &[5.0, -5.0], 1, false).unwrap();
    transport.take_responses();

    for _ in 0..3 {
        push_dense(&server, RANGE_BEGIN, &[0.0, 0.0], 1, false).unwrap();
        push_dense(&server, RANGE_BEGIN, &[0.0, 0.0], 2, false).unwrap();
        transport.take_responses();
    }

    pull_dense(&server, RANGE_BEGIN, 1).unwrap();
    let responses = transport.take_responses();
    let reply = responses[0].kvs.as_ref().unwrap();
    assert_close(&f32_from_bytes(&reply.vals), &[5.0, -5.0]);
}

#[test]
fn test_aggregation_is_order_independent() {
    let run = |first: i32, second: i32| -> Vec<f32> {
        let (transport, server) = make_server(ServerConfig::default());
        let _exec = start_exec(&server);
        server.set_updater(sgd(1.0));
        latch_sync(&server);

        push_dense(&server, RANGE_BEGIN + 1, &[1.0, 1.0], 1, false).unwrap();
        transport.take_responses();

        let grads = [(1, [0.25f32, 0.5]), (2, [0.5f32, 0.25])];
        for &sender in &[first, second] {
            let (_, g) = grads[(sender - 1) as usize];
            push_dense(&server, RANGE_BEGIN + 1, &g, sender, true).unwrap();
        }
        let responses = transport.take_responses();
        f32_from_bytes(&responses[0].kvs.as_ref().unwrap().vals)
    };

    let forward = run(1, 2);
    let reversed = run(2, 1);
    assert_close(&forward, &reversed);
    assert_close(&forward, &[0.25, 0.25]);
}

// ── Scenario 3: mixed precision ────────────────────────────────

#[test]
fn test_mixed_precision_update() {
    let (transport, server) = make_server(ServerConfig::default());
    let _exec = start_exec(&server);
    server.set_updater(sgd(0.5));

    // Initialize an f16 key, then enable multi-precision and sync mode.
    let tag = cmd_tag(RequestKind::DensePushPull, DType::F16);
    let meta = RequestMeta::push(1, 0, tag);
    server
        .handle_data(&meta, &KvPairs::dense(RANGE_BEGIN + 9, f16_bytes(&[10.0, 10.0])))
        .unwrap();
    transport.take_responses();

    server
        .handle_command(&ControlMessage::new(CMD_SET_MULTI_PRECISION, Vec::new()))
        .unwrap();
    latch_sync(&server);

    for sender in 1..=2 {
        let mut meta = RequestMeta::push(sender, sender as i64, tag);
        meta.pull = true;
        server
            .handle_data(&meta, &KvPairs::dense(RANGE_BEGIN + 9, f16_bytes(&[2.0, 2.0])))
            .unwrap();
    }

    let responses = transport.take_responses();
    assert_eq!(responses.len(), 2);
    for resp in &responses {
        let kvs = resp.kvs.as_ref().unwrap();
        // The reply carries the native f16 copy of the f32 master.
        let t = Tensor::from_bytes(Shape::vector(2), DType::F16, kvs.vals.clone()).unwrap();
        assert_close(&t.to_f32_vec(), &[8.0, 8.0]);
    }
    assert_eq!(server.key_version(9), Some(1));
}

#[test]
fn test_multi_precision_rejected_mid_cohort() {
    let (transport, server) = make_server(ServerConfig::default());
    latch_sync(&server);

    push_dense(&server, RANGE_BEGIN + 2, &[1.0], 1, false).unwrap();
    transport.take_responses();
    // Open a cohort: one of two pushes arrived.
    push_dense(&server, RANGE_BEGIN + 2, &[0.5], 1, false).unwrap();

    let result =
        server.handle_command(&ControlMessage::new(CMD_SET_MULTI_PRECISION, Vec::new()));
    assert!(matches!(
        result,
        Err(ServerError::ConfigurationRace { key: 2 })
    ));
    assert!(transport.command_acks().is_empty(), "failed command is not acked");
}

// ── Scenario 4: row-sparse ─────────────────────────────────────

#[test]
fn test_row_sparse_init_and_pull() {
    let (transport, server) = make_server(ServerConfig::default());
    let tag = cmd_tag(RequestKind::RowSparsePushPull, DType::F32);

    // Push master key 200 with rows 201 and 203 (global ids 1 and 3).
    let meta = RequestMeta::push(1, 0, tag);
    let kvs = KvPairs {
        keys: vec![RANGE_BEGIN + 100, RANGE_BEGIN + 101, RANGE_BEGIN + 103],
        vals: f32_bytes(&[1.0, 1.0, 2.0, 2.0]),
        lens: vec![0, 8, 8],
    };
    server.handle_data(&meta, &kvs).unwrap();
    assert_eq!(transport.take_responses().len(), 1);

    // Pull rows 1, 2, 3: the never-pushed row reads back zero.
    let meta = RequestMeta::pull(2, 1, tag);
    let kvs = KvPairs {
        keys: vec![
            RANGE_BEGIN + 100,
            RANGE_BEGIN + 101,
            RANGE_BEGIN + 102,
            RANGE_BEGIN + 103,
        ],
        vals: Vec::new(),
        lens: Vec::new(),
    };
    server.handle_data(&meta, &kvs).unwrap();

    let responses = transport.take_responses();
    let reply = responses[0].kvs.as_ref().unwrap();
    assert_eq!(reply.lens, vec![0, 2, 2, 2]);
    assert_close(
        &f32_from_bytes(&reply.vals),
        &[1.0, 1.0, 0.0, 0.0, 2.0, 2.0],
    );
}

#[test]
fn test_row_sparse_sync_barrier_with_empty_contribution() {
    let (transport, server) = make_server(ServerConfig::default());
    let _exec = start_exec(&server);
    server.set_updater(sgd(1.0));
    latch_sync(&server);
    let tag = cmd_tag(RequestKind::RowSparsePushPull, DType::F32);

    let master = RANGE_BEGIN + 100;
    let init = KvPairs {
        keys: vec![master, master + 1, master + 2],
        vals: f32_bytes(&[1.0, 1.0, 4.0, 4.0]),
        lens: vec![0, 8, 8],
    };
    server.handle_data(&RequestMeta::push(1, 0, tag), &init).unwrap();
    transport.take_responses();

    // Worker 1 contributes row 1; worker 2 owns no rows this iteration.
    let grad = KvPairs {
        keys: vec![master, master + 1],
        vals: f32_bytes(&[0.5, 0.5]),
        lens: vec![0, 8],
    };
    server.handle_data(&RequestMeta::push(1, 1, tag), &grad).unwrap();
    assert!(transport.take_responses().is_empty());

    let empty = KvPairs {
        keys: vec![master],
        vals: Vec::new(),
        lens: vec![0],
    };
    server.handle_data(&RequestMeta::push(2, 2, tag), &empty).unwrap();

    // Barrier closed: both pushes acked, row 1 updated, row 2 untouched.
    assert_eq!(transport.take_responses().len(), 2);
    assert_eq!(server.key_version(100), Some(1));

    let pull = KvPairs {
        keys: vec![master, master + 1, master + 2],
        vals: Vec::new(),
        lens: Vec::new(),
    };
    server.handle_data(&RequestMeta::pull(1, 3, tag), &pull).unwrap();
    let responses = transport.take_responses();
    let reply = responses[0].kvs.as_ref().unwrap();
    assert_close(&f32_from_bytes(&reply.vals), &[0.5, 0.5, 4.0, 4.0]);
}

#[test]
fn test_row_sparse_pull_before_init_fails() {
    let (_transport, server) = make_server(ServerConfig::default());
    let tag = cmd_tag(RequestKind::RowSparsePushPull, DType::F32);
    let kvs = KvPairs {
        keys: vec![RANGE_BEGIN + 40, RANGE_BEGIN + 41],
        vals: Vec::new(),
        lens: Vec::new(),
    };
    let result = server.handle_data(&RequestMeta::pull(1, 0, tag), &kvs);
    assert!(matches!(result, Err(ServerError::NotInitialized { key: 40 })));
}

// ── Scenario 5: compressed ─────────────────────────────────────

#[test]
fn test_compressed_sync_update() {
    let (transport, server) = make_server(ServerConfig::default());
    let _exec = start_exec(&server);
    server.set_updater(sgd(1.0));
    latch_sync(&server);
    let tag = cmd_tag(RequestKind::CompressedPushPull, DType::F32);

    let size_key = RANGE_BEGIN + 2; // decodes to the decompressed size, 2
    let param_key = RANGE_BEGIN + 50;
    let push = |sender: i32, vals: &[f32]| {
        let payload = f32_bytes(vals);
        let kvs = KvPairs {
            keys: vec![size_key, param_key],
            lens: vec![0, payload.len() as u32],
            vals: payload,
        };
        server.handle_data(&RequestMeta::push(sender, sender as i64, tag), &kvs)
    };

    // Init: the first compressed push dequantizes straight into storage.
    push(1, &[1.0, 1.0]).unwrap();
    assert_eq!(transport.take_responses().len(), 1);

    push(1, &[0.2, 0.2]).unwrap();
    push(2, &[0.2, 0.2]).unwrap();
    assert_eq!(transport.take_responses().len(), 2);
    assert_eq!(server.key_version(50), Some(1));

    // Compressed pull: one key, no lens.
    let pull = KvPairs {
        keys: vec![param_key],
        vals: Vec::new(),
        lens: Vec::new(),
    };
    server.handle_data(&RequestMeta::pull(1, 9, tag), &pull).unwrap();
    let responses = transport.take_responses();
    let reply = responses[0].kvs.as_ref().unwrap();
    assert_close(&f32_from_bytes(&reply.vals), &[0.6, 0.6]);
}

#[test]
fn test_compressed_size_mismatch_is_malformed() {
    let (transport, server) = make_server(ServerConfig::default());
    latch_sync(&server);
    let tag = cmd_tag(RequestKind::CompressedPushPull, DType::F32);

    let push = |size: u64, vals: &[f32]| {
        let payload = f32_bytes(vals);
        let kvs = KvPairs {
            keys: vec![RANGE_BEGIN + size, RANGE_BEGIN + 60],
            lens: vec![0, payload.len() as u32],
            vals: payload,
        };
        server.handle_data(&RequestMeta::push(1, 0, tag), &kvs)
    };

    push(2, &[1.0, 1.0]).unwrap();
    transport.take_responses();

    let result = push(3, &[0.1, 0.1, 0.1]);
    assert!(matches!(result, Err(ServerError::MalformedRequest { .. })));
}

// ── TSEngine ───────────────────────────────────────────────────

#[test]
fn test_tsengine_early_ack_and_auto_pull() {
    let config = ServerConfig {
        enable_tsengine: true,
        ..Default::default()
    };
    let (transport, server) = make_server(config);
    let _exec = start_exec(&server);
    server.set_updater(sgd(1.0));
    latch_sync(&server);

    // Init: early ack plus an auto-pull stamped with version 0.
    push_dense(&server, RANGE_BEGIN + 3, &[2.0, 4.0], 1, false).unwrap();
    assert_eq!(transport.take_responses().len(), 1);
    let pulls = transport.take_auto_pulls();
    assert_eq!(pulls.len(), 1);
    assert_eq!(pulls[0].version, 0);
    assert_close(&f32_from_bytes(&pulls[0].kvs.vals), &[2.0, 4.0]);

    // Both pushes are acked before the barrier completes.
    push_dense(&server, RANGE_BEGIN + 3, &[1.0, 1.0], 1, false).unwrap();
    assert_eq!(transport.take_responses().len(), 1);
    assert!(transport.take_auto_pulls().is_empty());
    push_dense(&server, RANGE_BEGIN + 3, &[1.0, 1.0], 2, false).unwrap();
    assert_eq!(transport.take_responses().len(), 1);

    let pulls = transport.take_auto_pulls();
    assert_eq!(pulls.len(), 1);
    assert_eq!(pulls[0].version, 1);
    assert_close(&f32_from_bytes(&pulls[0].kvs.vals), &[0.0, 2.0]);
}

#[test]
fn test_tsengine_num_merge_counts_toward_barrier() {
    let config = ServerConfig {
        enable_tsengine: true,
        ..Default::default()
    };
    let (transport, server) = make_server(config);
    let _exec = start_exec(&server);
    server.set_updater(sgd(1.0));
    latch_sync(&server);

    push_dense(&server, RANGE_BEGIN + 4, &[1.0], 1, false).unwrap();
    transport.take_auto_pulls();
    transport.take_responses();

    // One pre-aggregated message stands in for both workers.
    let mut meta = RequestMeta::push(1, 5, cmd_tag(RequestKind::DensePushPull, DType::F32));
    meta.num_merge = 2;
    server
        .handle_data(&meta, &KvPairs::dense(RANGE_BEGIN + 4, f32_bytes(&[0.5])))
        .unwrap();

    let pulls = transport.take_auto_pulls();
    assert_eq!(pulls.len(), 1, "num_merge=2 closes the two-worker barrier");
    assert_eq!(pulls[0].version, 1);
    assert_close(&f32_from_bytes(&pulls[0].kvs.vals), &[0.5]);
}

// ── Async mode ─────────────────────────────────────────────────

#[test]
fn test_async_push_applies_immediately() {
    let (transport, server) = make_server(ServerConfig::default());
    let _exec = start_exec(&server);
    server.set_updater(sgd(1.0));

    push_dense(&server, RANGE_BEGIN + 6, &[3.0], 1, false).unwrap();
    transport.take_responses();

    push_dense(&server, RANGE_BEGIN + 6, &[1.0], 1, false).unwrap();
    assert_eq!(transport.take_responses().len(), 1);
    assert_eq!(server.key_version(6), Some(1));

    push_dense(&server, RANGE_BEGIN + 6, &[1.0], 2, false).unwrap();
    assert_eq!(server.key_version(6), Some(2));

    pull_dense(&server, RANGE_BEGIN + 6, 1).unwrap();
    let responses = transport.take_responses();
    let reply = responses.last().unwrap().kvs.as_ref().unwrap();
    assert_close(&f32_from_bytes(&reply.vals), &[1.0]);
}

#[test]
fn test_async_without_updater_is_unsupported() {
    let (transport, server) = make_server(ServerConfig::default());

    push_dense(&server, RANGE_BEGIN + 8, &[1.0], 1, false).unwrap();
    transport.take_responses();

    let result = push_dense(&server, RANGE_BEGIN + 8, &[1.0], 1, false);
    assert!(matches!(result, Err(ServerError::UnsupportedMode { .. })));
}

#[test]
fn test_pull_before_init_fails() {
    let (_transport, server) = make_server(ServerConfig::default());
    let result = pull_dense(&server, RANGE_BEGIN + 77, 1);
    assert!(matches!(
        result,
        Err(ServerError::NotInitialized { key: 77 })
    ));
}

// ── Scenario 6: LeMethod ───────────────────────────────────────

fn lemethod_server() -> (Arc<LoopbackTransport>, ShardServer) {
    let config = ServerConfig {
        enable_lemethod: true,
        ..Default::default()
    };
    let (transport, server) = make_server(config);
    latch_sync(&server);
    (transport, server)
}

#[test]
fn test_lemethod_local_aggregation_and_distribution() {
    let (transport, server) = lemethod_server();
    transport.script_receivers([NextReceiver::Peer(11), NextReceiver::Peer(12)]);
    let tag = cmd_tag(RequestKind::DensePushPull, DType::F32);
    let wire_key = RANGE_BEGIN + 7;

    let push_partial = |sender: i32, vals: &[f32]| {
        let meta = RequestMeta {
            control: Some(ControlMarker::LocalAggregation),
            num_aggregation: 1,
            ..RequestMeta::push(sender, sender as i64, tag)
        };
        server.handle_data(&meta, &KvPairs::dense(wire_key, f32_bytes(vals)))
    };

    push_partial(1, &[1.0, 1.0]).unwrap();
    assert_eq!(transport.iteration_notices(), 0);

    push_partial(2, &[2.0, 2.0]).unwrap();
    assert_eq!(transport.iteration_notices(), 1);

    assert!(
        transport.wait_for_model_sends(2, Duration::from_secs(5)),
        "distribution pass sends to both scripted peers"
    );
    let sends = transport.model_sends();
    assert_eq!(sends.len(), 2);
    assert_eq!((sends[0].recver, sends[1].recver), (11, 12));
    assert!(sends.iter().all(|m| m.version == 1));
    assert_close(&f32_from_bytes(&sends[0].kvs.vals), &[3.0, 3.0]);

    // The oracle saw the previous hop's negative round-trip each time.
    thread::sleep(Duration::from_millis(20));
    let calls = transport.oracle_calls();
    assert_eq!(calls.len(), 3);
    assert_eq!(calls[0].last_bw, None);
    assert_eq!(calls[0].iteration, 1);
    assert!(calls[1].last_bw.unwrap() < 0);
    assert_eq!(calls[1].last_rcv, Some(11));
    assert!(calls[2].last_bw.unwrap() < 0);
    assert_eq!(calls[2].last_rcv, Some(12));
    assert_eq!(transport.model_waits(), 2);
}

#[test]
fn test_lemethod_init_distributes_initial_parameters() {
    let (transport, server) = lemethod_server();
    transport.script_receivers([NextReceiver::Peer(9)]);
    let tag = cmd_tag(RequestKind::DensePushPull, DType::F32);

    let meta = RequestMeta {
        control: Some(ControlMarker::Init),
        ..RequestMeta::push(1, 0, tag)
    };
    server
        .handle_data(&meta, &KvPairs::dense(RANGE_BEGIN + 7, f32_bytes(&[5.0, 5.0])))
        .unwrap();

    assert_eq!(transport.take_responses().len(), 1, "init push is acked");
    assert!(transport.wait_for_model_sends(1, Duration::from_secs(5)));
    let sends = transport.model_sends();
    assert_eq!(sends[0].version, 1);
    assert_close(&f32_from_bytes(&sends[0].kvs.vals), &[5.0, 5.0]);
}

#[test]
fn test_lemethod_rejects_row_sparse_and_compressed() {
    let (_transport, server) = lemethod_server();
    for kind in [RequestKind::RowSparsePushPull, RequestKind::CompressedPushPull] {
        let meta = RequestMeta::push(1, 0, cmd_tag(kind, DType::F32));
        let result = server.handle_data(&meta, &KvPairs::dense(RANGE_BEGIN, vec![0u8; 4]));
        assert!(matches!(result, Err(ServerError::UnsupportedMode { .. })));
    }
}

// ── Versions ───────────────────────────────────────────────────

#[test]
fn test_version_is_monotone_across_iterations() {
    let (transport, server) = make_server(ServerConfig::default());
    let _exec = start_exec(&server);
    server.set_updater(sgd(0.1));
    latch_sync(&server);

    push_dense(&server, RANGE_BEGIN, &[1.0], 1, false).unwrap();
    let mut last = server.key_version(0).unwrap();
    assert_eq!(last, 0);

    for _ in 0..4 {
        push_dense(&server, RANGE_BEGIN, &[0.5], 1, false).unwrap();
        push_dense(&server, RANGE_BEGIN, &[0.5], 2, false).unwrap();
        transport.take_responses();
        let version = server.key_version(0).unwrap();
        assert_eq!(version, last + 1);
        last = version;
    }
}
