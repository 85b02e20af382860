// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Error types for tensor operations.

use crate::Shape;

/// Errors that can occur during tensor operations.
#[derive(Debug, thiserror::Error)]
pub enum TensorError {
    /// The provided buffer size does not match the expected size for the given shape and dtype.
    #[error("buffer size mismatch: expected {expected} bytes, got {actual}")]
    BufferSizeMismatch { expected: usize, actual: usize },

    /// Two tensors have incompatible shapes for the requested operation.
    #[error("incompatible shapes for {op}: {lhs:?} vs {rhs:?}")]
    ShapeMismatch {
        op: &'static str,
        lhs: Shape,
        rhs: Shape,
    },

    /// Two tensors have incompatible dtypes for the requested operation.
    #[error("incompatible dtypes for {op}: {lhs:?} vs {rhs:?}")]
    DTypeMismatch {
        op: &'static str,
        lhs: crate::DType,
        rhs: crate::DType,
    },

    /// The operation requires a different storage layout.
    #[error("unsupported layout for {op}: expected {expected}")]
    LayoutMismatch {
        op: &'static str,
        expected: &'static str,
    },

    /// A row index lies outside the tensor's logical row count.
    #[error("row index {row} out of bounds for {rows} rows")]
    RowIndexOutOfBounds { row: i64, rows: usize },

    /// The wire dtype tag does not name a supported dtype.
    #[error("unknown dtype tag {tag}")]
    UnknownDTypeTag { tag: i32 },
}
