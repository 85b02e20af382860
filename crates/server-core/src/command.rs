// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Out-of-band command plane.
//!
//! Commands are dispatched on a small integer tag; the body is an opaque
//! byte sequence interpreted per-kind. Every command is acknowledged after
//! its synchronous part completes; a failing command is logged and not
//! acknowledged.

use crate::{ServerError, ShardServer};
use std::sync::atomic::Ordering;
use tensor_engine::{ops, DType, Tensor};
use transport::ControlMessage;

/// The command kinds, in the tag order the frontend uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Run the user controller callback with the message body.
    Controller,
    /// Enable mixed-precision mode, creating f32 master copies.
    SetMultiPrecision,
    /// Shut the server down.
    StopServer,
    /// Latch the server into synchronous aggregation.
    SyncMode,
    /// Reconfigure the gradient-compression codec.
    SetGradientCompression,
    /// Configure, start/stop, pause, or dump the profiler.
    SetProfilerParams,
}

impl TryFrom<i32> for CommandKind {
    type Error = ServerError;

    fn try_from(head: i32) -> Result<Self, Self::Error> {
        match head {
            0 => Ok(CommandKind::Controller),
            1 => Ok(CommandKind::SetMultiPrecision),
            2 => Ok(CommandKind::StopServer),
            3 => Ok(CommandKind::SyncMode),
            4 => Ok(CommandKind::SetGradientCompression),
            5 => Ok(CommandKind::SetProfilerParams),
            other => Err(ServerError::UnknownCommand { head: other }),
        }
    }
}

impl ShardServer {
    /// Entry point for control messages from the RPC layer.
    pub fn handle_command(&self, msg: &ControlMessage) -> Result<(), ServerError> {
        match self.handle_command_inner(msg) {
            Ok(()) => {
                self.transport.respond_command(msg);
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, head = msg.head, "command failed");
                Err(e)
            }
        }
    }

    fn handle_command_inner(&self, msg: &ControlMessage) -> Result<(), ServerError> {
        match CommandKind::try_from(msg.head)? {
            CommandKind::StopServer => {
                tracing::info!("stop command received");
                self.exec.stop();
            }
            CommandKind::SyncMode => {
                self.sync_mode.store(true, Ordering::SeqCst);
            }
            CommandKind::SetGradientCompression => {
                self.codec
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .decode_params(&msg.body)?;
            }
            CommandKind::SetProfilerParams => {
                self.handle_profiler_command(&msg.body)?;
            }
            CommandKind::SetMultiPrecision => {
                // First transition only; repeats are no-ops.
                if self
                    .multi_precision
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    if let Err(e) = self.create_multi_precision_copies() {
                        self.multi_precision.store(false, Ordering::SeqCst);
                        return Err(e);
                    }
                }
            }
            CommandKind::Controller => {
                let controller =
                    self.current_controller()
                        .ok_or_else(|| ServerError::UnsupportedMode {
                            reason: "controller command without a registered controller".into(),
                        })?;
                let head = msg.head;
                let body = msg.body.clone();
                self.exec.exec(move || controller(head, &body))?;
            }
        }
        Ok(())
    }

    /// Up-converts every non-f32 key for mixed-precision training: the
    /// master copy is created from the current parameter, and any pending
    /// merge buffer is re-typed to f32. Keys with pushes underway make the
    /// transition fail.
    fn create_multi_precision_copies(&self) -> Result<(), ServerError> {
        let mut masters = Vec::new();
        for key in self.store.keys() {
            let Some(entry_arc) = self.store.get(key) else {
                continue;
            };
            let mut guard = entry_arc.lock().unwrap_or_else(|e| e.into_inner());
            let entry = &mut *guard;
            if !entry.update.pending.is_empty() {
                return Err(ServerError::ConfigurationRace { key });
            }
            let Some(primary) = entry.primary.as_ref() else {
                continue;
            };
            if primary.dtype() == DType::F32 {
                continue;
            }

            let mut master = if primary.is_row_sparse() {
                Tensor::row_sparse_zeros(primary.shape().clone(), DType::F32)
            } else {
                Tensor::zeros(primary.shape().clone(), DType::F32)
            };
            ops::cast_copy(primary, &mut master)?;

            if let Some(merged) = entry.update.merged.as_ref() {
                let retyped = if merged.is_row_sparse() {
                    Tensor::row_sparse_zeros(merged.shape().clone(), DType::F32)
                } else {
                    Tensor::zeros(merged.shape().clone(), DType::F32)
                };
                entry.update.merged = Some(retyped);
            }
            entry.master_f32 = Some(master);
            masters.push(entry_arc.clone());
        }
        // Fence all fresh masters before acknowledging the command.
        for entry_arc in masters {
            let entry = entry_arc.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(master) = entry.master_f32.as_ref() {
                master.wait_until_readable();
            }
        }
        tracing::info!("multi-precision mode enabled");
        Ok(())
    }

    fn handle_profiler_command(&self, body: &[u8]) -> Result<(), ServerError> {
        let (&subkind, payload) =
            body.split_last().ok_or_else(|| ServerError::MalformedRequest {
                reason: "empty profiler command body".into(),
            })?;
        match subkind.checked_sub(b'0') {
            Some(0) => {
                let pairs = parse_profiler_config(payload, self.transport.my_rank())?;
                self.profiler.set_config(&pairs);
            }
            Some(1) => self.profiler.set_state(leading_digit(body)? != 0),
            Some(2) => self.profiler.pause(leading_digit(body)? != 0),
            Some(3) => self.profiler.dump(),
            _ => {
                return Err(ServerError::MalformedRequest {
                    reason: format!("unknown profiler sub-command {subkind:#x}"),
                })
            }
        }
        Ok(())
    }
}

/// Parses the profiler config payload: comma-separated `key:value` pairs.
/// A `filename` value is prefixed with this server's rank so per-rank
/// dumps do not collide.
fn parse_profiler_config(
    payload: &[u8],
    rank: usize,
) -> Result<Vec<(String, String)>, ServerError> {
    let text = std::str::from_utf8(payload).map_err(|_| ServerError::MalformedRequest {
        reason: "profiler config is not UTF-8".into(),
    })?;
    let mut pairs = Vec::new();
    for item in text.split(',').filter(|s| !s.is_empty()) {
        let (key, value) = item.split_once(':').ok_or_else(|| {
            ServerError::MalformedRequest {
                reason: format!("improper profiler config element '{item}'"),
            }
        })?;
        if key.is_empty() || value.is_empty() {
            return Err(ServerError::MalformedRequest {
                reason: format!("empty profiler config key or value in '{item}'"),
            });
        }
        let value = if key == "filename" {
            format!("rank{rank}_{value}")
        } else {
            value.to_string()
        };
        pairs.push((key.to_string(), value));
    }
    Ok(pairs)
}

/// The numeric argument of state/pause sub-commands is the body's leading
/// ASCII digit.
fn leading_digit(body: &[u8]) -> Result<u8, ServerError> {
    body.first()
        .and_then(|b| b.checked_sub(b'0'))
        .filter(|d| *d <= 9)
        .ok_or_else(|| ServerError::MalformedRequest {
            reason: "profiler command argument is not a digit".into(),
        })
}
