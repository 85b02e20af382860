// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! `param-shard lemethod` command: one LeMethod iteration end to end.
//!
//! Walks through the init distribution pass, the workers' pre-aggregated
//! pushes, the iteration-finished notice, and the bandwidth-guided
//! dissemination along the scripted peer route.

use anyhow::{bail, Context};
use server_core::{ServerConfig, ShardServer};
use std::sync::Arc;
use std::time::Duration;
use tensor_engine::DType;
use transport::handle::{DataHandleKind, RequestKind};
use transport::{
    ControlMarker, ControlMessage, KeyRange, KvPairs, LoopbackTransport, NextReceiver, RequestMeta,
};

const CMD_SYNC_MODE: i32 = 3;

pub fn execute(workers: usize, peers: &str) -> anyhow::Result<()> {
    let peers: Vec<i32> = peers
        .split(',')
        .map(|p| p.trim().parse().context("peer ids must be integers"))
        .collect::<Result<_, _>>()?;
    if peers.is_empty() {
        bail!("at least one peer is required");
    }

    println!("╔══════════════════════════════════════════════════════╗");
    println!("║           param-shard · LeMethod Walkthrough         ║");
    println!("╚══════════════════════════════════════════════════════╝");
    println!();
    println!("  Workers: {workers}, peer route: {peers:?}");
    println!();

    let transport = Arc::new(LoopbackTransport::new(workers, KeyRange::new(0, 1 << 20)));
    let config = ServerConfig {
        enable_lemethod: true,
        ..Default::default()
    };
    let server = ShardServer::new(transport.clone(), config);
    server.handle_command(&ControlMessage::new(CMD_SYNC_MODE, Vec::new()))?;

    let tag = DataHandleKind {
        kind: RequestKind::DensePushPull,
        dtype_tag: DType::F32.wire_tag(),
    }
    .pair();

    // ── Init pass: peers receive the starting parameters ───────
    println!("  [1/3] Init push + initial distribution...");
    transport.script_receivers(peers.iter().map(|&p| NextReceiver::Peer(p)));
    let meta = RequestMeta {
        control: Some(ControlMarker::Init),
        ..RequestMeta::push(1, 0, tag)
    };
    server.handle_data(&meta, &KvPairs::dense(0, f32_bytes(&[0.0, 0.0, 0.0, 0.0])))?;
    if !transport.wait_for_model_sends(peers.len(), Duration::from_secs(5)) {
        bail!("init distribution did not reach all peers");
    }
    println!("        {} peers received the initial model.", peers.len());

    // ── Local aggregation: one pre-aggregated push per worker ──
    println!("  [2/3] Local aggregation from {workers} workers...");
    transport.script_receivers(peers.iter().map(|&p| NextReceiver::Peer(p)));
    for worker in 0..workers {
        let meta = RequestMeta {
            control: Some(ControlMarker::LocalAggregation),
            num_aggregation: 1,
            ..RequestMeta::push(worker as i32 + 1, 1, tag)
        };
        let grad = vec![0.5 * (worker + 1) as f32; 4];
        server.handle_data(&meta, &KvPairs::dense(0, f32_bytes(&grad)))?;
    }
    println!(
        "        iteration-finished notices: {}",
        transport.iteration_notices()
    );

    // ── Distribution pass ──────────────────────────────────────
    println!("  [3/3] Model distribution...");
    if !transport.wait_for_model_sends(peers.len() * 2, Duration::from_secs(5)) {
        bail!("distribution did not reach all peers");
    }
    std::thread::sleep(Duration::from_millis(20));

    for send in transport.model_sends() {
        println!(
            "   iteration {} → peer {} ({} bytes)",
            send.version,
            send.recver,
            send.kvs.vals.len()
        );
    }
    println!();
    println!("  Oracle feedback (start − end µs, negative by convention):");
    for call in transport.oracle_calls() {
        println!(
            "   iteration {:>2}  last_rcv {:?}  last_bw {:?}",
            call.iteration, call.last_rcv, call.last_bw
        );
    }
    Ok(())
}

fn f32_bytes(vals: &[f32]) -> Vec<u8> {
    vals.iter().flat_map(|v| v.to_le_bytes()).collect()
}
