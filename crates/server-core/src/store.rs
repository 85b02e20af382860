// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Per-key parameter registry.
//!
//! Each key owns an [`Entry`]: the authoritative parameter tensor, the
//! optional float32 master copy for mixed-precision training, a version
//! counter, the update buffer the aggregation engine merges into, and the
//! decompression scratch for compressed keys.
//!
//! Entries are created lazily on first push and live until shutdown;
//! there is no eviction. The map lock is held only long enough to fetch or
//! insert an entry handle; all per-key work happens under that entry's own
//! mutex, so requests for different keys never serialize against each
//! other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tensor_engine::Tensor;
use transport::RequestMeta;

/// A parameter key local to this server: the wire key minus the shard
/// range start.
pub type Key = i64;

/// The per-key accumulation state.
///
/// `merged` is consumed only when the synchronous barrier is complete
/// (`pending.len() == num_workers`); `temp` stages asynchronous updates
/// and mixed-precision casts.
#[derive(Debug, Default)]
pub struct UpdateBuf {
    /// Accumulator for the current cohort's gradients.
    pub merged: Option<Tensor>,
    /// Staging tensor: the async-mode update source, and the f32 cast
    /// buffer in mixed-precision mode.
    pub temp: Option<Tensor>,
    /// Request handles awaiting the cohort's completion.
    pub pending: Vec<RequestMeta>,
}

/// Everything the server stores for one key.
#[derive(Debug, Default)]
pub struct Entry {
    /// The authoritative parameter in the key's native dtype.
    pub primary: Option<Tensor>,
    /// Float32 companion, present iff mixed-precision mode is on and the
    /// native dtype is not f32. All optimizer updates target this copy.
    pub master_f32: Option<Tensor>,
    /// Incremented once per successful barrier/update; never decreases.
    pub version: u64,
    /// Gradient accumulation state.
    pub update: UpdateBuf,
    /// Decompression workspace for compressed keys, sized to the
    /// decompressed tensor.
    pub decomp_scratch: Option<Tensor>,
}

/// Lazily-populated map from key to entry.
#[derive(Default)]
pub struct ParameterStore {
    entries: Mutex<HashMap<Key, Arc<Mutex<Entry>>>>,
}

impl ParameterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the entry for `key`, creating it if absent.
    pub fn entry(&self, key: Key) -> Arc<Mutex<Entry>> {
        let mut entries = self.lock();
        Arc::clone(entries.entry(key).or_default())
    }

    /// Returns the entry for `key` if it exists.
    ///
    /// Pull paths use this so that a pull for an unknown key does not
    /// materialize an empty entry.
    pub fn get(&self, key: Key) -> Option<Arc<Mutex<Entry>>> {
        self.lock().get(&key).map(Arc::clone)
    }

    /// Returns all known keys.
    pub fn keys(&self) -> Vec<Key> {
        self.lock().keys().copied().collect()
    }

    /// Number of registered keys.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Key, Arc<Mutex<Entry>>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for ParameterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParameterStore")
            .field("keys", &self.len())
            .finish()
    }
}
