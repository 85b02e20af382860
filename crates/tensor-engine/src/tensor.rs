// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Core tensor type and view abstractions.

use crate::{DType, Shape, TensorError};
use half::{bf16, f16};

/// Storage layout of a [`Tensor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Layout {
    /// Contiguous row-major storage covering the full logical shape.
    Dense,
    /// Row-sparse storage: only the rows named by `indices` are present in
    /// the data buffer, in index order. Indices are global row ids into the
    /// logical shape and must be strictly increasing.
    RowSparse {
        /// Global row ids of the stored rows.
        indices: Vec<i64>,
    },
}

/// An owned tensor stored in contiguous memory.
///
/// `Tensor` is the primary data carrier between the wire, the update
/// buffers, and the parameter store. It owns its data buffer and exposes
/// immutable views via [`TensorView`].
///
/// # Memory Layout
/// Data is stored in row-major (C) order as a flat byte buffer. For the
/// row-sparse layout, only the stored rows are present, ordered by their
/// global row id. Typed access is provided via
/// [`as_f32_slice`](Tensor::as_f32_slice) and friends.
#[derive(Debug, Clone)]
pub struct Tensor {
    shape: Shape,
    dtype: DType,
    layout: Layout,
    data: Vec<u8>,
}

impl Tensor {
    /// Creates a new dense tensor filled with zeros.
    ///
    /// # Examples
    /// ```
    /// use tensor_engine::{Tensor, Shape, DType};
    /// let t = Tensor::zeros(Shape::matrix(2, 3), DType::F32);
    /// assert_eq!(t.size_bytes(), 24); // 2 * 3 * 4 bytes
    /// ```
    pub fn zeros(shape: Shape, dtype: DType) -> Self {
        let size = shape.size_bytes(dtype);
        Self {
            shape,
            dtype,
            layout: Layout::Dense,
            data: vec![0u8; size],
        }
    }

    /// Creates a dense tensor from raw bytes.
    ///
    /// Returns an error if the buffer size does not match `shape.size_bytes(dtype)`.
    pub fn from_bytes(shape: Shape, dtype: DType, data: Vec<u8>) -> Result<Self, TensorError> {
        let expected = shape.size_bytes(dtype);
        if data.len() != expected {
            return Err(TensorError::BufferSizeMismatch {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            shape,
            dtype,
            layout: Layout::Dense,
            data,
        })
    }

    /// Creates a dense tensor from a slice of `f32` values.
    ///
    /// # Examples
    /// ```
    /// use tensor_engine::{Tensor, Shape};
    /// let t = Tensor::from_f32(Shape::vector(3), &[1.0, 2.0, 3.0]).unwrap();
    /// assert_eq!(t.as_f32_slice(), &[1.0, 2.0, 3.0]);
    /// ```
    pub fn from_f32(shape: Shape, values: &[f32]) -> Result<Self, TensorError> {
        let expected_elements = shape.num_elements();
        if values.len() != expected_elements {
            return Err(TensorError::BufferSizeMismatch {
                expected: expected_elements * DType::F32.size_bytes(),
                actual: values.len() * DType::F32.size_bytes(),
            });
        }
        // SAFETY: reinterpreting &[f32] as &[u8] is safe for Copy types.
        let byte_slice = unsafe {
            std::slice::from_raw_parts(values.as_ptr() as *const u8, values.len() * 4)
        };
        Ok(Self {
            shape,
            dtype: DType::F32,
            layout: Layout::Dense,
            data: byte_slice.to_vec(),
        })
    }

    /// Creates a row-sparse tensor with the given stored rows.
    ///
    /// `shape` is the logical `[rows, unit_len]` shape; `indices` are the
    /// global row ids stored in `data`. The buffer must hold exactly
    /// `indices.len() × unit_len` elements and every index must lie inside
    /// the logical row count.
    pub fn row_sparse(
        shape: Shape,
        dtype: DType,
        indices: Vec<i64>,
        data: Vec<u8>,
    ) -> Result<Self, TensorError> {
        let rows = shape.dim(0).unwrap_or(0);
        for &idx in &indices {
            if idx < 0 || idx as usize >= rows {
                return Err(TensorError::RowIndexOutOfBounds { row: idx, rows });
            }
        }
        let expected = indices.len() * shape.unit_len() * dtype.size_bytes();
        if data.len() != expected {
            return Err(TensorError::BufferSizeMismatch {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            shape,
            dtype,
            layout: Layout::RowSparse { indices },
            data,
        })
    }

    /// Creates a row-sparse tensor with no stored rows.
    ///
    /// Contributes zero to any accumulation; used when a worker owns no
    /// rows for a key in the current iteration.
    pub fn row_sparse_zeros(shape: Shape, dtype: DType) -> Self {
        Self {
            shape,
            dtype,
            layout: Layout::RowSparse {
                indices: Vec::new(),
            },
            data: Vec::new(),
        }
    }

    /// Returns the tensor's logical shape.
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Returns the tensor's data type.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Returns the tensor's storage layout.
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Returns `true` if this tensor uses row-sparse storage.
    pub fn is_row_sparse(&self) -> bool {
        matches!(self.layout, Layout::RowSparse { .. })
    }

    /// Returns the stored row ids for a row-sparse tensor.
    pub fn indices(&self) -> Option<&[i64]> {
        match &self.layout {
            Layout::RowSparse { indices } => Some(indices),
            Layout::Dense => None,
        }
    }

    /// Number of elements physically present in the data buffer.
    ///
    /// Equals `shape().num_elements()` for dense tensors and
    /// `indices().len() × unit_len` for row-sparse ones.
    pub fn stored_elements(&self) -> usize {
        match &self.layout {
            Layout::Dense => self.shape.num_elements(),
            Layout::RowSparse { indices } => indices.len() * self.shape.unit_len(),
        }
    }

    /// Returns an immutable view over this tensor's data.
    pub fn view(&self) -> TensorView<'_> {
        TensorView {
            shape: &self.shape,
            dtype: self.dtype,
            data: &self.data,
        }
    }

    /// Returns the raw byte slice backing this tensor.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Returns a mutable reference to the raw byte buffer.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Returns the memory footprint of this tensor in bytes.
    pub fn size_bytes(&self) -> usize {
        self.data.len()
    }

    /// Replaces the stored rows of a row-sparse tensor.
    ///
    /// The logical shape and dtype are unchanged; `indices` and `data`
    /// become the new stored content and are validated the same way as in
    /// [`Tensor::row_sparse`].
    pub fn assign_rows(&mut self, indices: Vec<i64>, data: Vec<u8>) -> Result<(), TensorError> {
        if !self.is_row_sparse() {
            return Err(TensorError::LayoutMismatch {
                op: "assign_rows",
                expected: "row-sparse",
            });
        }
        let rows = self.shape.dim(0).unwrap_or(0);
        for &idx in &indices {
            if idx < 0 || idx as usize >= rows {
                return Err(TensorError::RowIndexOutOfBounds { row: idx, rows });
            }
        }
        let expected = indices.len() * self.shape.unit_len() * self.dtype.size_bytes();
        if data.len() != expected {
            return Err(TensorError::BufferSizeMismatch {
                expected,
                actual: data.len(),
            });
        }
        self.layout = Layout::RowSparse { indices };
        self.data = data;
        Ok(())
    }

    /// Host-side fence: blocks until all pending writes to this tensor are
    /// visible to the caller.
    ///
    /// The eager engine completes every operation before returning from it,
    /// so the fence itself is immediate. Call sites still mark the points
    /// where a deferred backend would have to synchronize.
    pub fn wait_until_readable(&self) {}

    /// Interprets the buffer as a slice of `f32`.
    ///
    /// # Panics
    /// Panics if `self.dtype() != DType::F32`.
    pub fn as_f32_slice(&self) -> &[f32] {
        assert_eq!(
            self.dtype,
            DType::F32,
            "as_f32_slice called on {:?} tensor",
            self.dtype
        );
        // SAFETY: data was constructed from f32s; length tracked by layout.
        unsafe {
            std::slice::from_raw_parts(self.data.as_ptr() as *const f32, self.stored_elements())
        }
    }

    /// Interprets the buffer as a mutable slice of `f32`.
    ///
    /// # Panics
    /// Panics if `self.dtype() != DType::F32`.
    pub fn as_f32_slice_mut(&mut self) -> &mut [f32] {
        assert_eq!(
            self.dtype,
            DType::F32,
            "as_f32_slice_mut called on {:?} tensor",
            self.dtype
        );
        let n = self.stored_elements();
        unsafe { std::slice::from_raw_parts_mut(self.data.as_mut_ptr() as *mut f32, n) }
    }

    /// Converts the stored elements to `f32`, whatever the dtype.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        match self.dtype {
            DType::F32 => self.as_f32_slice().to_vec(),
            DType::F16 => self
                .data
                .chunks_exact(2)
                .map(|b| f16::from_bits(u16::from_le_bytes([b[0], b[1]])).to_f32())
                .collect(),
            DType::BF16 => self
                .data
                .chunks_exact(2)
                .map(|b| bf16::from_bits(u16::from_le_bytes([b[0], b[1]])).to_f32())
                .collect(),
        }
    }

    /// Overwrites the stored elements from `f32` values, converting into
    /// this tensor's dtype.
    ///
    /// Returns an error if `values.len()` differs from the stored element
    /// count.
    pub fn fill_from_f32(&mut self, values: &[f32]) -> Result<(), TensorError> {
        if values.len() != self.stored_elements() {
            return Err(TensorError::BufferSizeMismatch {
                expected: self.stored_elements() * self.dtype.size_bytes(),
                actual: values.len() * self.dtype.size_bytes(),
            });
        }
        match self.dtype {
            DType::F32 => self.as_f32_slice_mut().copy_from_slice(values),
            DType::F16 => {
                for (chunk, &v) in self.data.chunks_exact_mut(2).zip(values) {
                    chunk.copy_from_slice(&f16::from_f32(v).to_bits().to_le_bytes());
                }
            }
            DType::BF16 => {
                for (chunk, &v) in self.data.chunks_exact_mut(2).zip(values) {
                    chunk.copy_from_slice(&bf16::from_f32(v).to_bits().to_le_bytes());
                }
            }
        }
        Ok(())
    }

    /// Fills the tensor with a constant `f32` value.
    ///
    /// # Panics
    /// Panics if `self.dtype() != DType::F32`.
    pub fn fill_f32(&mut self, value: f32) {
        let slice = self.as_f32_slice_mut();
        slice.iter_mut().for_each(|x| *x = value);
    }
}

/// A borrowed, read-only view over a [`Tensor`]'s data.
///
/// Views are zero-copy and tied to the lifetime of the source tensor,
/// enforced by the borrow checker.
#[derive(Debug)]
pub struct TensorView<'a> {
    shape: &'a Shape,
    dtype: DType,
    data: &'a [u8],
}

impl<'a> TensorView<'a> {
    /// Returns the shape of the viewed tensor.
    pub fn shape(&self) -> &Shape {
        self.shape
    }

    /// Returns the data type of the viewed tensor.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Returns the raw byte slice.
    pub fn as_bytes(&self) -> &[u8] {
        self.data
    }
}
