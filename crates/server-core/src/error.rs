// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Error types for the server core.
//!
//! Every error is fatal to the offending request: the handler logs it and
//! the request is failed. None are silently swallowed.

use crate::store::Key;

/// Errors that can occur while handling requests or commands.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The request violates a wire invariant (key/length arity, zero unit
    /// length, undecodable tags).
    #[error("malformed request: {reason}")]
    MalformedRequest { reason: String },

    /// A pull arrived for a key that has never been pushed.
    #[error("key {key} is not initialized; push it first")]
    NotInitialized { key: Key },

    /// The request asks for a combination the active mode does not support.
    #[error("unsupported mode: {reason}")]
    UnsupportedMode { reason: String },

    /// Multi-precision mode was requested while pushes were underway.
    #[error("multi-precision mode cannot be enabled while pushes are underway (key {key})")]
    ConfigurationRace { key: Key },

    /// A task was submitted to the worker pool after shutdown.
    #[error("worker pool is stopped")]
    PoolStopped,

    /// A closure was submitted to the serial executor after shutdown.
    #[error("serial executor is stopped")]
    ExecutorStopped,

    /// The command tag does not name a known command.
    #[error("unknown command tag {head}")]
    UnknownCommand { head: i32 },

    /// Configuration file or value error.
    #[error("configuration error: {0}")]
    Config(String),

    /// A tensor-engine operation failed.
    #[error("engine error: {0}")]
    Tensor(#[from] tensor_engine::TensorError),

    /// Gradient decompression failed.
    #[error("codec error: {0}")]
    Codec(#[from] grad_codec::CodecError),
}
