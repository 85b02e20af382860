// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! The shard server: construction, request dispatch, and lifecycle.
//!
//! A [`ShardServer`] is driven entirely by its transport: the RPC layer
//! calls [`ShardServer::handle_command`] for out-of-band commands and
//! [`ShardServer::handle_data`] for push/pull traffic, from any number of
//! callback threads. [`ShardServer::run`] parks the calling thread as the
//! serial-executor consumer until a stop command arrives.

use crate::config::ServerConfig;
use crate::exec::SerialExecutor;
use crate::pool::WorkerPool;
use crate::profiler::{ProfilerSink, TracingProfiler};
use crate::store::{Key, ParameterStore};
use crate::ServerError;
use grad_codec::GradientCompression;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tensor_engine::{DType, Tensor};
use transport::handle::{DataHandleKind, RequestKind};
use transport::{ControlMarker, KvPairs, RequestMeta, Transport};

/// The optimizer callback: `updater(key, gradient, parameter)`.
///
/// Invoked only from the serial-executor thread, never concurrently.
pub type Updater = Arc<dyn Fn(Key, &Tensor, &mut Tensor) + Send + Sync>;

/// The user controller callback: `controller(head, body)`.
pub type Controller = Arc<dyn Fn(i32, &[u8]) + Send + Sync>;

/// One shard of the parameter server.
pub struct ShardServer {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) config: ServerConfig,
    pub(crate) store: ParameterStore,
    pub(crate) exec: SerialExecutor,
    pub(crate) pool: WorkerPool,
    pub(crate) codec: Mutex<GradientCompression>,
    pub(crate) profiler: Box<dyn ProfilerSink>,
    pub(crate) updater: Mutex<Option<Updater>>,
    pub(crate) controller: Mutex<Option<Controller>>,
    pub(crate) sync_mode: AtomicBool,
    pub(crate) multi_precision: AtomicBool,
    /// Worker contributions folded into the current LeMethod iteration.
    pub(crate) local_agg_count: Mutex<u32>,
    /// Model-distribution iteration counter, shared with pool tasks.
    pub(crate) iteration: Arc<AtomicU64>,
}

impl ShardServer {
    /// Creates a server bound to `transport`.
    pub fn new(transport: Arc<dyn Transport>, config: ServerConfig) -> Self {
        let pool = WorkerPool::new(config.effective_pool_size());
        tracing::info!(
            lemethod = config.enable_lemethod,
            tsengine = config.enable_tsengine,
            pool_size = pool.size(),
            rank = transport.my_rank(),
            "shard server created"
        );
        Self {
            transport,
            config,
            store: ParameterStore::new(),
            exec: SerialExecutor::new(),
            pool,
            codec: Mutex::new(GradientCompression::default()),
            profiler: Box::new(TracingProfiler),
            updater: Mutex::new(None),
            controller: Mutex::new(None),
            sync_mode: AtomicBool::new(false),
            multi_precision: AtomicBool::new(false),
            local_agg_count: Mutex::new(0),
            iteration: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Replaces the profiler sink. Call before the server starts serving.
    pub fn set_profiler(&mut self, profiler: Box<dyn ProfilerSink>) {
        self.profiler = profiler;
    }

    /// Registers the optimizer callback.
    pub fn set_updater<F>(&self, updater: F)
    where
        F: Fn(Key, &Tensor, &mut Tensor) + Send + Sync + 'static,
    {
        *self.lock_updater() = Some(Arc::new(updater));
    }

    /// Registers the user controller callback.
    pub fn set_controller<F>(&self, controller: F)
    where
        F: Fn(i32, &[u8]) + Send + Sync + 'static,
    {
        *self
            .controller
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(controller));
    }

    /// Parks the calling thread as the optimizer/controller thread until a
    /// stop command poisons the executor, then stops the worker pool.
    pub fn run(&self) {
        tracing::info!("shard server running");
        self.exec.run();
        self.pool.stop();
        tracing::info!("shard server stopped");
    }

    /// Direct access to the serial executor (shared with tests and the
    /// embedding frontend).
    pub fn executor(&self) -> SerialExecutor {
        self.exec.clone()
    }

    /// Current version counter of a key, if the key exists.
    ///
    /// Versions start at 0 on init and advance once per applied update;
    /// any worker observes them non-decreasing.
    pub fn key_version(&self, key: Key) -> Option<u64> {
        self.store
            .get(key)
            .map(|e| e.lock().unwrap_or_else(|p| p.into_inner()).version)
    }

    /// Entry point for data requests from the RPC layer.
    ///
    /// Errors are logged and returned; the offending request is failed and
    /// the server keeps serving.
    pub fn handle_data(&self, meta: &RequestMeta, kvs: &KvPairs) -> Result<(), ServerError> {
        match self.handle_data_inner(meta, kvs) {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::error!(error = %e, sender = meta.sender, "data request failed");
                Err(e)
            }
        }
    }

    fn handle_data_inner(&self, meta: &RequestMeta, kvs: &KvPairs) -> Result<(), ServerError> {
        let handle = DataHandleKind::unpair(meta.cmd).ok_or_else(|| {
            ServerError::MalformedRequest {
                reason: format!("undecodable data handle tag {}", meta.cmd),
            }
        })?;
        let dtype = DType::from_wire_tag(handle.dtype_tag)?;

        if self.config.enable_lemethod {
            if handle.kind != RequestKind::DensePushPull {
                return Err(ServerError::UnsupportedMode {
                    reason: "LeMethod accepts dense push/pull only".into(),
                });
            }
            match meta.control {
                Some(ControlMarker::LocalAggregation) => {
                    return self.handle_local_aggregation(dtype, meta, kvs);
                }
                Some(ControlMarker::Init) => {
                    // Initialize, then push the fresh parameters to peers.
                    self.handle_dense(dtype, meta, kvs)?;
                    return self.distribute_key(meta, kvs);
                }
                None => {}
            }
        }

        match handle.kind {
            RequestKind::DensePushPull => self.handle_dense(dtype, meta, kvs),
            RequestKind::RowSparsePushPull => self.handle_row_sparse(dtype, meta, kvs),
            RequestKind::CompressedPushPull => self.handle_compressed(dtype, meta, kvs),
        }
    }

    /// Translates a wire key into this shard's local key space.
    pub(crate) fn decode_key(&self, wire_key: u64) -> Result<Key, ServerError> {
        let range = self.transport.server_key_range();
        if wire_key < range.begin {
            return Err(ServerError::MalformedRequest {
                reason: format!(
                    "wire key {wire_key} precedes owned range start {}",
                    range.begin
                ),
            });
        }
        Ok((wire_key - range.begin) as Key)
    }

    pub(crate) fn sync_mode(&self) -> bool {
        self.sync_mode.load(Ordering::SeqCst)
    }

    /// Whether mutations of a key with this dtype go through a float32
    /// master copy.
    pub(crate) fn has_multi_precision_copy(&self, dtype: DType) -> bool {
        self.multi_precision.load(Ordering::SeqCst) && dtype != DType::F32
    }

    pub(crate) fn current_updater(&self) -> Option<Updater> {
        self.lock_updater().clone()
    }

    pub(crate) fn current_controller(&self) -> Option<Controller> {
        self.controller
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn lock_updater(&self) -> std::sync::MutexGuard<'_, Option<Updater>> {
        self.updater.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for ShardServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardServer")
            .field("keys", &self.store.len())
            .field("sync_mode", &self.sync_mode())
            .field("lemethod", &self.config.enable_lemethod)
            .field("tsengine", &self.config.enable_tsengine)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use transport::{KeyRange, LoopbackTransport};

    fn server() -> (Arc<LoopbackTransport>, ShardServer) {
        let transport = Arc::new(LoopbackTransport::new(2, KeyRange::new(100, 200)));
        let server = ShardServer::new(transport.clone(), ServerConfig::default());
        (transport, server)
    }

    #[test]
    fn test_decode_key() {
        let (_t, server) = server();
        assert_eq!(server.decode_key(105).unwrap(), 5);
        assert!(server.decode_key(99).is_err());
    }

    #[test]
    fn test_undecodable_handle_tag() {
        let (_t, server) = server();
        let meta = RequestMeta {
            cmd: -3,
            ..RequestMeta::push(1, 0, 0)
        };
        let result = server.handle_data(&meta, &KvPairs::dense(100, vec![]));
        assert!(matches!(
            result,
            Err(ServerError::MalformedRequest { .. })
        ));
    }

    #[test]
    fn test_multi_precision_predicate() {
        let (_t, server) = server();
        assert!(!server.has_multi_precision_copy(DType::F16));
        server.multi_precision.store(true, Ordering::SeqCst);
        assert!(server.has_multi_precision_copy(DType::F16));
        assert!(!server.has_multi_precision_copy(DType::F32));
    }
}
