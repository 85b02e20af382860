// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! `param-shard run` command: a simulated data-parallel training loop.
//!
//! Spawns one shard server over a loopback transport, initializes a set of
//! parameter keys, and drives N simulated workers that push gradients
//! (and, in sync mode, pull the updated values) every iteration. The
//! server-side optimizer is plain SGD.

use anyhow::bail;
use server_core::{Key, ServerConfig, ShardServer};
use std::sync::Arc;
use std::thread;
use tensor_engine::{DType, Tensor};
use transport::handle::{DataHandleKind, RequestKind};
use transport::{ControlMessage, KeyRange, KvPairs, LoopbackTransport, RequestMeta};

const CMD_STOP_SERVER: i32 = 2;
const CMD_SYNC_MODE: i32 = 3;

pub fn execute(
    workers: usize,
    keys: usize,
    width: usize,
    iterations: usize,
    mode: &str,
    learning_rate: f32,
) -> anyhow::Result<()> {
    let sync = match mode {
        "sync" => true,
        "async" => false,
        other => bail!("unknown mode '{other}'; expected 'sync' or 'async'"),
    };

    println!("╔══════════════════════════════════════════════════════╗");
    println!("║           param-shard · Training Simulator           ║");
    println!("╚══════════════════════════════════════════════════════╝");
    println!();
    println!("  Config:");
    println!("   Workers:    {workers}");
    println!("   Keys:       {keys} × {width} f32");
    println!("   Iterations: {iterations}");
    println!("   Mode:       {mode}");
    println!("   SGD lr:     {learning_rate}");
    println!();

    let transport = Arc::new(LoopbackTransport::new(workers, KeyRange::new(0, 1 << 20)));
    let server = Arc::new(ShardServer::new(
        transport.clone(),
        ServerConfig::default(),
    ));
    server.set_updater(sgd(learning_rate));

    let exec = server.executor();
    let consumer = thread::spawn(move || exec.run());

    if sync {
        server.handle_command(&ControlMessage::new(CMD_SYNC_MODE, Vec::new()))?;
    }

    let tag = DataHandleKind {
        kind: RequestKind::DensePushPull,
        dtype_tag: DType::F32.wire_tag(),
    }
    .pair();

    // ── Initialize every key to ones ───────────────────────────
    println!("  [1/3] Initializing {keys} keys...");
    for key in 0..keys {
        let meta = RequestMeta::push(1, 0, tag);
        server.handle_data(&meta, &KvPairs::dense(key as u64, f32_bytes(&vec![1.0; width])))?;
    }
    transport.take_responses();

    // ── Training loop ──────────────────────────────────────────
    println!("  [2/3] Running {iterations} iterations...");
    for iteration in 1..=iterations {
        thread::scope(|scope| {
            for worker in 0..workers {
                let server = Arc::clone(&server);
                scope.spawn(move || {
                    let grad = vec![0.01 * (worker + 1) as f32; width];
                    for key in 0..keys {
                        let mut meta =
                            RequestMeta::push(worker as i32 + 1, iteration as i64, tag);
                        meta.pull = sync;
                        if let Err(e) =
                            server.handle_data(&meta, &KvPairs::dense(key as u64, f32_bytes(&grad)))
                        {
                            tracing::error!(error = %e, worker, key, "push failed");
                        }
                    }
                });
            }
        });
        let responses = transport.take_responses();

        // Observe key 0 after this iteration.
        let meta = RequestMeta::pull(1, iteration as i64, tag);
        server.handle_data(
            &meta,
            &KvPairs {
                keys: vec![0],
                vals: Vec::new(),
                lens: Vec::new(),
            },
        )?;
        let pulls = transport.take_responses();
        let value = pulls
            .last()
            .and_then(|r| r.kvs.as_ref())
            .map(|kvs| f32::from_le_bytes([kvs.vals[0], kvs.vals[1], kvs.vals[2], kvs.vals[3]]))
            .unwrap_or(f32::NAN);

        println!(
            "   iter {iteration:>3}: {} responses, version {:?}, key0[0] = {value:.4}",
            responses.len(),
            server.key_version(0),
        );
    }

    // ── Shutdown ───────────────────────────────────────────────
    println!("  [3/3] Stopping server...");
    server.handle_command(&ControlMessage::new(CMD_STOP_SERVER, Vec::new()))?;
    consumer
        .join()
        .map_err(|_| anyhow::anyhow!("executor thread panicked"))?;
    println!();
    println!("  Done: {keys} keys at version {:?}.", server.key_version(0));
    Ok(())
}

/// Server-side SGD: `p ← p − lr·g`.
fn sgd(lr: f32) -> impl Fn(Key, &Tensor, &mut Tensor) + Send + Sync {
    move |_key, grad, param| {
        let mut values = param.to_f32_vec();
        for (p, g) in values.iter_mut().zip(grad.to_f32_vec()) {
            *p -= lr * g;
        }
        if let Err(e) = param.fill_from_f32(&values) {
            tracing::error!(error = %e, "sgd writeback failed");
        }
    }
}

fn f32_bytes(vals: &[f32]) -> Vec<u8> {
    vals.iter().flat_map(|v| v.to_le_bytes()).collect()
}
