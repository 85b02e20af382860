// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Error types for gradient decompression.

/// Errors that can occur while configuring or applying the codec.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The parameter body could not be parsed.
    #[error("invalid codec parameters: {0}")]
    InvalidParams(String),

    /// The requested codec type is not supported.
    #[error("unsupported compression type '{0}'")]
    UnsupportedType(String),

    /// The compressed payload does not match the decompressed size.
    #[error("compressed payload size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },
}
