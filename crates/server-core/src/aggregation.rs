// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Aggregation engine: the dense, row-sparse, and compressed push/pull
//! handlers.
//!
//! All three representations share one discipline: decode the key, fold
//! the payload into the key's update buffer (initializing the parameter on
//! first push), append the request handle to the pending cohort, and hand
//! off to the update dispatcher. Pulls read the primary tensor after the
//! appropriate fences.

use crate::store::{Entry, Key};
use crate::{ServerError, ShardServer};
use std::sync::{Arc, Mutex, MutexGuard};
use tensor_engine::{ops, DType, Shape, Tensor};
use transport::{KvPairs, RequestMeta};

pub(crate) fn lock_entry(entry: &Arc<Mutex<Entry>>) -> MutexGuard<'_, Entry> {
    entry.lock().unwrap_or_else(|e| e.into_inner())
}

/// `dst ← src`, casting iff the dtypes differ.
fn copy_or_cast(src: &Tensor, dst: &mut Tensor) -> Result<(), tensor_engine::TensorError> {
    if src.dtype() == dst.dtype() {
        ops::copy(src, dst)
    } else {
        ops::cast_copy(src, dst)
    }
}

impl ShardServer {
    // ── Dense ──────────────────────────────────────────────────

    pub(crate) fn handle_dense(
        &self,
        dtype: DType,
        meta: &RequestMeta,
        kvs: &KvPairs,
    ) -> Result<(), ServerError> {
        if kvs.keys.len() != 1 {
            return Err(ServerError::MalformedRequest {
                reason: format!("dense request must carry exactly one key, got {}", kvs.keys.len()),
            });
        }
        let key = self.decode_key(kvs.keys[0])?;
        if !meta.push {
            return self.default_storage_response(dtype, key, meta, kvs);
        }

        if kvs.lens.len() != 1 || kvs.vals.len() != kvs.lens[0] as usize {
            return Err(ServerError::MalformedRequest {
                reason: "dense push must carry one length equal to the payload size".into(),
            });
        }
        let elem_size = dtype.size_bytes();
        if kvs.lens[0] == 0 || kvs.lens[0] as usize % elem_size != 0 {
            return Err(ServerError::MalformedRequest {
                reason: format!(
                    "dense payload of {} bytes is not a whole number of {} elements",
                    kvs.lens[0],
                    dtype.as_str()
                ),
            });
        }

        // Under TSEngine the push is acknowledged before aggregation; the
        // value travels later through an auto-pull update.
        if self.config.enable_tsengine {
            self.transport.respond(meta);
        }

        let elements = kvs.lens[0] as usize / elem_size;
        let recved = Tensor::from_bytes(Shape::vector(elements), dtype, kvs.vals.clone())?;

        let entry_arc = self.store.entry(key);
        let mut guard = lock_entry(&entry_arc);
        let entry = &mut *guard;
        let mp = self.has_multi_precision_copy(dtype);

        if entry.primary.is_none() {
            self.init_dense(dtype, key, entry, &recved, meta, kvs)?;
            return Ok(());
        }

        let stored_elements = entry
            .primary
            .as_ref()
            .map(|p| p.shape().num_elements())
            .unwrap_or(0);
        if elements != stored_elements {
            return Err(ServerError::MalformedRequest {
                reason: format!(
                    "push of {elements} elements for key {key} holding {stored_elements}"
                ),
            });
        }

        let shape = Shape::vector(elements);
        let merged_dtype = if mp { DType::F32 } else { dtype };
        let sync = self.sync_mode();
        let update = &mut entry.update;

        if update.pending.is_empty() {
            if sync {
                let merged = update
                    .merged
                    .get_or_insert_with(|| Tensor::zeros(shape.clone(), merged_dtype));
                copy_or_cast(&recved, merged)?;
            } else if mp {
                let temp = update
                    .temp
                    .get_or_insert_with(|| Tensor::zeros(shape.clone(), DType::F32));
                ops::cast_copy(&recved, temp)?;
            } else {
                update.temp = Some(recved);
            }
        } else {
            if !sync {
                return Err(ServerError::UnsupportedMode {
                    reason: "asynchronous pushes cannot overlap an open cohort".into(),
                });
            }
            let merged = update
                .merged
                .get_or_insert_with(|| Tensor::zeros(shape.clone(), merged_dtype));
            if mp {
                let temp = update
                    .temp
                    .get_or_insert_with(|| Tensor::zeros(shape.clone(), DType::F32));
                ops::cast_copy(&recved, temp)?;
                ops::elementwise_add_into(merged, temp)?;
            } else {
                ops::elementwise_add_into(merged, &recved)?;
            }
        }

        // A pre-aggregating transport folds several worker pushes into one
        // message; each counts toward the barrier and earns its own ack.
        for _ in 0..meta.num_merge.max(1) {
            update.pending.push(meta.clone());
        }

        self.apply_updates(dtype, key, entry, meta, kvs)
    }

    /// First push of a key: the payload becomes the parameter.
    fn init_dense(
        &self,
        dtype: DType,
        key: Key,
        entry: &mut Entry,
        recved: &Tensor,
        meta: &RequestMeta,
        kvs: &KvPairs,
    ) -> Result<(), ServerError> {
        let shape = recved.shape().clone();
        if self.has_multi_precision_copy(dtype) {
            let mut master = Tensor::zeros(shape.clone(), DType::F32);
            ops::cast_copy(recved, &mut master)?;
            let mut primary = Tensor::zeros(shape, dtype);
            ops::cast_copy(&master, &mut primary)?;
            primary.wait_until_readable();
            master.wait_until_readable();
            entry.master_f32 = Some(master);
            entry.primary = Some(primary);
        } else {
            let mut primary = Tensor::zeros(shape, dtype);
            ops::copy(recved, &mut primary)?;
            primary.wait_until_readable();
            entry.primary = Some(primary);
        }
        if self.config.log_verbose {
            tracing::info!(key, dtype = dtype.as_str(), "initial push");
        }
        if self.config.enable_tsengine {
            self.auto_pull(key, entry, meta, kvs)
        } else {
            self.transport.respond(meta);
            Ok(())
        }
    }

    // ── Row-sparse ─────────────────────────────────────────────

    pub(crate) fn handle_row_sparse(
        &self,
        dtype: DType,
        meta: &RequestMeta,
        kvs: &KvPairs,
    ) -> Result<(), ServerError> {
        if kvs.keys.is_empty() {
            return Err(ServerError::MalformedRequest {
                reason: "row-sparse request without a master key".into(),
            });
        }
        let master_key = self.decode_key(kvs.keys[0])?;
        let num_rows = kvs.keys.len() - 1;

        if !meta.push {
            return self.row_sparse_pull_response(dtype, master_key, num_rows, meta, kvs);
        }

        if kvs.lens.first().copied() != Some(0) {
            return Err(ServerError::MalformedRequest {
                reason: "row-sparse push must carry a zero-length master-key entry".into(),
            });
        }

        let entry_arc = self.store.entry(master_key);
        let mut guard = lock_entry(&entry_arc);
        let entry = &mut *guard;
        let mp = self.has_multi_precision_copy(dtype);
        let sync = self.sync_mode();

        if entry.primary.is_none() {
            if num_rows == 0 {
                return Err(ServerError::MalformedRequest {
                    reason: "row-sparse init with no rows".into(),
                });
            }
            if self.config.log_verbose {
                tracing::info!(key = master_key, rows = num_rows, "row-sparse initial push");
            }
            return self.init_row_sparse(dtype, master_key, entry, meta, kvs);
        }

        if self.config.log_verbose {
            tracing::info!(key = master_key, rows = num_rows, "row-sparse push");
        }

        let stored_shape = entry
            .primary
            .as_ref()
            .map(|p| p.shape().clone())
            .unwrap_or_else(|| Shape::matrix(0, 0));
        let merged_dtype = if mp { DType::F32 } else { dtype };
        let update = &mut entry.update;

        if num_rows == 0 {
            // Empty contribution: counts toward the barrier, adds nothing.
            if !sync {
                self.transport.respond(meta);
                return Ok(());
            }
            if update.pending.is_empty() {
                update.merged = Some(Tensor::row_sparse_zeros(
                    stored_shape.clone(),
                    merged_dtype,
                ));
            }
            update.pending.push(meta.clone());
            return self.apply_updates(dtype, master_key, entry, meta, kvs);
        }

        let unit_bytes = kvs.lens.get(1).copied().unwrap_or(0) as usize;
        if unit_bytes == 0 || unit_bytes % dtype.size_bytes() != 0 {
            return Err(ServerError::MalformedRequest {
                reason: format!("row-sparse push with unusable unit length {unit_bytes}"),
            });
        }
        if kvs.lens.len() != kvs.keys.len()
            || kvs.lens[1..].iter().any(|&l| l as usize != unit_bytes)
            || kvs.vals.len() != num_rows * unit_bytes
        {
            return Err(ServerError::MalformedRequest {
                reason: "row-sparse push lengths disagree with the row keys".into(),
            });
        }

        let mut indices = Vec::with_capacity(num_rows);
        for row_key in &kvs.keys[1..] {
            indices.push(self.decode_key(*row_key)? - master_key);
        }
        let recved = Tensor::row_sparse(stored_shape.clone(), dtype, indices, kvs.vals.clone())?;

        if update.pending.is_empty() {
            if sync {
                let merged = update.merged.get_or_insert_with(|| {
                    Tensor::row_sparse_zeros(stored_shape.clone(), merged_dtype)
                });
                copy_or_cast(&recved, merged)?;
            } else if mp {
                let temp = update.temp.get_or_insert_with(|| {
                    Tensor::row_sparse_zeros(stored_shape.clone(), DType::F32)
                });
                ops::cast_copy(&recved, temp)?;
            } else {
                update.temp = Some(recved);
            }
        } else {
            if !sync {
                return Err(ServerError::UnsupportedMode {
                    reason: "asynchronous pushes cannot overlap an open cohort".into(),
                });
            }
            let merged = update.merged.get_or_insert_with(|| {
                Tensor::row_sparse_zeros(stored_shape.clone(), merged_dtype)
            });
            if mp {
                let temp = update.temp.get_or_insert_with(|| {
                    Tensor::row_sparse_zeros(stored_shape.clone(), DType::F32)
                });
                ops::cast_copy(&recved, temp)?;
                ops::elementwise_add_into(merged, temp)?;
            } else {
                ops::elementwise_add_into(merged, &recved)?;
            }
            merged.wait_until_readable();
        }

        update.pending.push(meta.clone());
        self.apply_updates(dtype, master_key, entry, meta, kvs)
    }

    /// First row-sparse push: allocates full storage covering every global
    /// row id named so far and scatters the pushed rows into place. Rows
    /// never pushed stay zero and read back as zero rows on pull.
    fn init_row_sparse(
        &self,
        dtype: DType,
        master_key: Key,
        entry: &mut Entry,
        meta: &RequestMeta,
        kvs: &KvPairs,
    ) -> Result<(), ServerError> {
        let num_rows = kvs.keys.len() - 1;
        let unit_bytes = kvs.lens.get(1).copied().unwrap_or(0) as usize;
        if unit_bytes == 0 || unit_bytes % dtype.size_bytes() != 0 {
            return Err(ServerError::MalformedRequest {
                reason: format!("row-sparse init with unusable unit length {unit_bytes}"),
            });
        }
        if kvs.lens.len() != kvs.keys.len()
            || kvs.lens[1..].iter().any(|&l| l as usize != unit_bytes)
            || kvs.vals.len() != num_rows * unit_bytes
        {
            return Err(ServerError::MalformedRequest {
                reason: "row-sparse init lengths disagree with the row keys".into(),
            });
        }
        let unit_len = unit_bytes / dtype.size_bytes();

        let mut indices = Vec::with_capacity(num_rows);
        for row_key in &kvs.keys[1..] {
            let row_id = self.decode_key(*row_key)? - master_key;
            if row_id < 0 {
                return Err(ServerError::MalformedRequest {
                    reason: format!("row key below master key (row id {row_id})"),
                });
            }
            indices.push(row_id);
        }
        let total_rows = indices.iter().max().map(|&m| m as usize + 1).unwrap_or(0);
        let shape = Shape::matrix(total_rows, unit_len);

        if self.has_multi_precision_copy(dtype) {
            let mut master = Tensor::row_sparse_zeros(shape.clone(), DType::F32);
            ops::row_sparse_populate_full_idx(&mut master)?;
            {
                let recved =
                    Tensor::row_sparse(shape.clone(), dtype, indices, kvs.vals.clone())?;
                let values = recved.to_f32_vec();
                let dst = master.as_f32_slice_mut();
                for (i, &row) in recved.indices().unwrap_or(&[]).iter().enumerate() {
                    let at = row as usize * unit_len;
                    dst[at..at + unit_len].copy_from_slice(&values[i * unit_len..(i + 1) * unit_len]);
                }
            }
            let mut primary = Tensor::row_sparse_zeros(shape, dtype);
            ops::row_sparse_populate_full_idx(&mut primary)?;
            ops::cast_copy(&master, &mut primary)?;
            primary.wait_until_readable();
            master.wait_until_readable();
            entry.master_f32 = Some(master);
            entry.primary = Some(primary);
        } else {
            let mut primary = Tensor::row_sparse_zeros(shape, dtype);
            ops::row_sparse_populate_full_idx(&mut primary)?;
            {
                let dst = primary.as_bytes_mut();
                for (i, &row) in indices.iter().enumerate() {
                    let at = row as usize * unit_bytes;
                    dst[at..at + unit_bytes]
                        .copy_from_slice(&kvs.vals[i * unit_bytes..(i + 1) * unit_bytes]);
                }
            }
            primary.wait_until_readable();
            entry.primary = Some(primary);
        }

        self.transport.respond(meta);
        Ok(())
    }

    /// Answers a row-sparse pull by gathering the requested rows from the
    /// primary's row-major byte layout.
    fn row_sparse_pull_response(
        &self,
        dtype: DType,
        master_key: Key,
        num_rows: usize,
        meta: &RequestMeta,
        kvs: &KvPairs,
    ) -> Result<(), ServerError> {
        if self.config.log_verbose {
            tracing::info!(key = master_key, rows = num_rows, "row-sparse pull");
        }
        if num_rows == 0 {
            let response = KvPairs {
                keys: kvs.keys.clone(),
                vals: Vec::new(),
                lens: vec![0; kvs.keys.len()],
            };
            self.transport.respond_with(meta, response);
            return Ok(());
        }

        let entry_arc = self
            .store
            .get(master_key)
            .ok_or(ServerError::NotInitialized { key: master_key })?;
        let entry = lock_entry(&entry_arc);
        let primary = entry
            .primary
            .as_ref()
            .ok_or(ServerError::NotInitialized { key: master_key })?;
        if self.has_multi_precision_copy(dtype) {
            primary.wait_until_readable();
        }

        let shape = primary.shape();
        let rows = shape.dim(0).unwrap_or(0);
        let unit_len = shape.unit_len();
        let unit_bytes = unit_len * dtype.size_bytes();
        let data = primary.as_bytes();

        let mut vals = vec![0u8; num_rows * unit_bytes];
        for i in 1..=num_rows {
            let row_id = self.decode_key(kvs.keys[i])? - master_key;
            // Rows outside the stored range were never pushed: leave zeros.
            if row_id >= 0 && (row_id as usize) < rows {
                let at = row_id as usize * unit_bytes;
                vals[(i - 1) * unit_bytes..i * unit_bytes]
                    .copy_from_slice(&data[at..at + unit_bytes]);
            }
        }

        let mut lens = vec![unit_len as u32; kvs.keys.len()];
        lens[0] = 0;
        self.transport.respond_with(
            meta,
            KvPairs {
                keys: kvs.keys.clone(),
                vals,
                lens,
            },
        );
        Ok(())
    }

    // ── Compressed ─────────────────────────────────────────────

    pub(crate) fn handle_compressed(
        &self,
        dtype: DType,
        meta: &RequestMeta,
        kvs: &KvPairs,
    ) -> Result<(), ServerError> {
        if dtype != DType::F32 {
            return Err(ServerError::UnsupportedMode {
                reason: format!(
                    "gradient compression is supported for f32 only, got {}",
                    dtype.as_str()
                ),
            });
        }

        if !meta.push {
            if kvs.keys.len() != 1 || !kvs.lens.is_empty() {
                return Err(ServerError::MalformedRequest {
                    reason: "compressed pull must carry one key and no lengths".into(),
                });
            }
            let key = self.decode_key(kvs.keys[0])?;
            return self.default_storage_response(dtype, key, meta, kvs);
        }

        // Two keys: the first encodes the decompressed size, the second is
        // the parameter key. One payload of compressed bytes.
        if kvs.keys.len() != 2
            || kvs.lens.len() != 2
            || kvs.lens[0] != 0
            || kvs.vals.len() != kvs.lens[1] as usize
        {
            return Err(ServerError::MalformedRequest {
                reason: "compressed push must carry two keys and lengths [0, payload]".into(),
            });
        }
        let original_size = self.decode_key(kvs.keys[0])? as usize;
        if original_size == 0 {
            return Err(ServerError::MalformedRequest {
                reason: "compressed push with zero decompressed size".into(),
            });
        }
        let key = self.decode_key(kvs.keys[1])?;
        let shape = Shape::vector(original_size);

        let entry_arc = self.store.entry(key);
        let mut guard = lock_entry(&entry_arc);
        let entry = &mut *guard;

        if entry.primary.is_none() {
            let mut primary = Tensor::zeros(shape, DType::F32);
            self.lock_codec().dequantize(&kvs.vals, &mut primary)?;
            primary.wait_until_readable();
            entry.primary = Some(primary);
            self.transport.respond(meta);
            return Ok(());
        }

        let stored_elements = entry
            .primary
            .as_ref()
            .map(|p| p.shape().num_elements())
            .unwrap_or(0);
        if stored_elements != original_size {
            return Err(ServerError::MalformedRequest {
                reason: format!(
                    "decompressed size {original_size} differs from stored size {stored_elements}"
                ),
            });
        }

        if entry.decomp_scratch.is_none() {
            entry.decomp_scratch = Some(Tensor::zeros(shape.clone(), DType::F32));
        }

        if self.sync_mode() {
            let update = &mut entry.update;
            let merged = update
                .merged
                .get_or_insert_with(|| Tensor::zeros(shape.clone(), DType::F32));
            if update.pending.is_empty() {
                self.lock_codec().dequantize(&kvs.vals, merged)?;
            } else if let Some(scratch) = entry.decomp_scratch.as_mut() {
                self.lock_codec().dequantize(&kvs.vals, scratch)?;
                ops::elementwise_add_into(merged, scratch)?;
            }
            update.pending.push(meta.clone());
            self.apply_updates(dtype, key, entry, meta, kvs)
        } else {
            // Async: dequantize into the scratch and apply directly.
            let updater =
                self.current_updater()
                    .ok_or_else(|| ServerError::UnsupportedMode {
                        reason: "asynchronous mode requires an optimizer".into(),
                    })?;
            let mut scratch = entry
                .decomp_scratch
                .take()
                .ok_or(ServerError::NotInitialized { key })?;
            self.lock_codec().dequantize(&kvs.vals, &mut scratch)?;
            let mut primary = entry
                .primary
                .take()
                .ok_or(ServerError::NotInitialized { key })?;
            let (primary, scratch) = self.exec.exec(move || {
                updater(key, &scratch, &mut primary);
                (primary, scratch)
            })?;
            primary.wait_until_readable();
            entry.primary = Some(primary);
            entry.decomp_scratch = Some(scratch);
            entry.version += 1;
            self.transport.respond(meta);
            Ok(())
        }
    }

    fn lock_codec(&self) -> MutexGuard<'_, grad_codec::GradientCompression> {
        self.codec.lock().unwrap_or_else(|e| e.into_inner())
    }
}
