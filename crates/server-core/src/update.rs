// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Update dispatcher: consumes a completed cohort's merge buffer, runs the
//! optimizer on the serial executor, performs the mixed-precision
//! writeback, and answers the cohort.
//!
//! The optimizer call moves the parameter and the gradient into the
//! executor closure and receives them back through its return value, so
//! the single-thread guarantee holds without sharing borrows across
//! threads. The key's entry stays locked for the whole dispatch, which is
//! what orders successive cohorts of the same key.

use crate::store::{Entry, Key};
use crate::{ServerError, ShardServer};
use tensor_engine::{ops, DType, Tensor};
use transport::{KvPairs, RequestMeta};

impl ShardServer {
    /// Invoked after every push that touched a key's update buffer.
    ///
    /// In sync mode nothing happens until the cohort is complete
    /// (`pending.len() == num_workers`); the pending handles are answered
    /// when the barrier closes. Async pushes dispatch immediately.
    pub(crate) fn apply_updates(
        &self,
        dtype: DType,
        key: Key,
        entry: &mut Entry,
        meta: &RequestMeta,
        kvs: &KvPairs,
    ) -> Result<(), ServerError> {
        let sync = self.sync_mode();
        if sync && entry.update.pending.len() < self.transport.num_workers() {
            // Cohort still open: fence the accumulator for safe observation.
            if let Some(merged) = entry.update.merged.as_ref() {
                merged.wait_until_readable();
            }
            return Ok(());
        }

        if let Some(merged) = entry.update.merged.as_ref() {
            merged.wait_until_readable();
        }

        let updater = self.current_updater();
        if updater.is_none() && !sync {
            return Err(ServerError::UnsupportedMode {
                reason: "asynchronous mode requires an optimizer".into(),
            });
        }

        let mp = self.has_multi_precision_copy(dtype);
        let mut dest = if mp {
            entry.master_f32.take()
        } else {
            entry.primary.take()
        }
        .expect("update dispatched for a key without a parameter");
        let src = if sync {
            entry.update.merged.take()
        } else {
            entry.update.temp.take()
        }
        .expect("update dispatched without an accumulated gradient");

        let (dest, src) = if let Some(updater) = updater {
            self.exec.exec(move || {
                updater(key, &src, &mut dest);
                (dest, src)
            })?
        } else {
            // No optimizer: the merged gradient replaces the parameter.
            if src.is_row_sparse() {
                scatter_rows(&src, &mut dest)?;
            } else {
                ops::copy(&src, &mut dest)?;
            }
            (dest, src)
        };

        // The buffers stay allocated for the next cohort.
        if sync {
            entry.update.merged = Some(src);
        } else {
            entry.update.temp = Some(src);
        }

        if mp {
            let mut primary = entry
                .primary
                .take()
                .expect("primary exists alongside the master copy");
            ops::cast_copy(&dest, &mut primary)?;
            entry.master_f32 = Some(dest);
            entry.primary = Some(primary);
        } else {
            entry.primary = Some(dest);
        }
        entry.version += 1;

        let pending = std::mem::take(&mut entry.update.pending);
        if self.config.log_verbose {
            tracing::debug!(key, cohort = pending.len(), version = entry.version, "update applied");
        }

        if self.config.enable_tsengine {
            if let Some(primary) = entry.primary.as_ref() {
                primary.wait_until_readable();
            }
            return self.auto_pull(key, entry, meta, kvs);
        }

        let has_pull = pending.iter().any(|m| m.pull);
        if has_pull {
            // One fence covers every response serialized below.
            if let Some(primary) = entry.primary.as_ref() {
                primary.wait_until_readable();
            }
            for req in &pending {
                if req.pull {
                    self.storage_response_for_entry(key, entry, req, kvs)?;
                } else {
                    self.transport.respond(req);
                }
            }
        } else {
            for req in &pending {
                self.transport.respond(req);
            }
            if let Some(primary) = entry.primary.as_ref() {
                primary.wait_until_readable();
            }
        }
        Ok(())
    }

    /// Answers a plain pull with the primary tensor's bytes.
    pub(crate) fn default_storage_response(
        &self,
        dtype: DType,
        key: Key,
        meta: &RequestMeta,
        kvs: &KvPairs,
    ) -> Result<(), ServerError> {
        let entry_arc = self
            .store
            .get(key)
            .ok_or(ServerError::NotInitialized { key })?;
        let entry = entry_arc.lock().unwrap_or_else(|e| e.into_inner());
        if entry.primary.is_none() {
            return Err(ServerError::NotInitialized { key });
        }
        if self.has_multi_precision_copy(dtype) {
            if let Some(primary) = entry.primary.as_ref() {
                // The barrier returns once the master is ready; the native
                // copy needs its own fence before its bytes are serialized.
                primary.wait_until_readable();
            }
        }
        self.storage_response_for_entry(key, &entry, meta, kvs)
    }

    /// Serializes the entry's primary bytes as a single-length reply.
    pub(crate) fn storage_response_for_entry(
        &self,
        key: Key,
        entry: &Entry,
        meta: &RequestMeta,
        kvs: &KvPairs,
    ) -> Result<(), ServerError> {
        let primary = entry
            .primary
            .as_ref()
            .ok_or(ServerError::NotInitialized { key })?;
        let response = KvPairs {
            keys: kvs.keys.clone(),
            vals: primary.as_bytes().to_vec(),
            lens: vec![primary.size_bytes() as u32],
        };
        self.transport.respond_with(meta, response);
        Ok(())
    }

    /// Sends an unsolicited pull reply stamped with the key's version.
    pub(crate) fn auto_pull(
        &self,
        key: Key,
        entry: &Entry,
        meta: &RequestMeta,
        kvs: &KvPairs,
    ) -> Result<(), ServerError> {
        let primary = entry
            .primary
            .as_ref()
            .ok_or(ServerError::NotInitialized { key })?;
        if self.has_multi_precision_copy(primary.dtype()) {
            primary.wait_until_readable();
        }
        let response = KvPairs {
            keys: kvs.keys.clone(),
            vals: primary.as_bytes().to_vec(),
            lens: vec![primary.size_bytes() as u32],
        };
        self.transport.auto_pull_update(entry.version, meta, response);
        Ok(())
    }
}

/// Writes a row-sparse tensor's stored rows into full storage of the same
/// dtype at their global row offsets.
fn scatter_rows(src: &Tensor, dst: &mut Tensor) -> Result<(), ServerError> {
    if src.dtype() != dst.dtype() {
        return Err(ServerError::Tensor(
            tensor_engine::TensorError::DTypeMismatch {
                op: "scatter_rows",
                lhs: src.dtype(),
                rhs: dst.dtype(),
            },
        ));
    }
    let unit_bytes = src.shape().unit_len() * src.dtype().size_bytes();
    let data = src.as_bytes();
    let out = dst.as_bytes_mut();
    for (i, &row) in src.indices().unwrap_or(&[]).iter().enumerate() {
        let at = row as usize * unit_bytes;
        out[at..at + unit_bytes].copy_from_slice(&data[i * unit_bytes..(i + 1) * unit_bytes]);
    }
    Ok(())
}
