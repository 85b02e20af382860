// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Engine operations consumed by the parameter-server core.
//!
//! Each operation validates shapes, dtypes, and layouts up front and then
//! works directly on the tensors' byte buffers. Operations complete before
//! returning; callers that need a synchronization point use
//! [`Tensor::wait_until_readable`] afterwards.

use crate::{DType, Layout, Tensor, TensorError};
use half::{bf16, f16};

/// Copies `src` into `dst` without changing dtype.
///
/// Dense sources overwrite the destination buffer; row-sparse sources
/// replace the destination's stored rows (the destination must also be
/// row-sparse with the same logical shape).
///
/// # Errors
/// Returns [`TensorError::DTypeMismatch`] when dtypes differ (use
/// [`cast_copy`] instead), [`TensorError::ShapeMismatch`] on logical shape
/// disagreement, and [`TensorError::LayoutMismatch`] on dense/row-sparse
/// mixing.
pub fn copy(src: &Tensor, dst: &mut Tensor) -> Result<(), TensorError> {
    if src.dtype() != dst.dtype() {
        return Err(TensorError::DTypeMismatch {
            op: "copy",
            lhs: src.dtype(),
            rhs: dst.dtype(),
        });
    }
    if src.shape() != dst.shape() {
        return Err(TensorError::ShapeMismatch {
            op: "copy",
            lhs: src.shape().clone(),
            rhs: dst.shape().clone(),
        });
    }
    match (src.layout(), dst.layout()) {
        (Layout::Dense, Layout::Dense) => {
            dst.as_bytes_mut().copy_from_slice(src.as_bytes());
            Ok(())
        }
        (Layout::RowSparse { indices }, Layout::RowSparse { .. }) => {
            dst.assign_rows(indices.clone(), src.as_bytes().to_vec())
        }
        _ => Err(TensorError::LayoutMismatch {
            op: "copy",
            expected: "matching dense or row-sparse layouts",
        }),
    }
}

/// Copies `src` into `dst`, converting between dtypes through `f32`.
///
/// Used for the mixed-precision master-copy writeback (`f32 → f16`) and for
/// staging low-precision gradients into an `f32` accumulator.
pub fn cast_copy(src: &Tensor, dst: &mut Tensor) -> Result<(), TensorError> {
    if src.shape() != dst.shape() {
        return Err(TensorError::ShapeMismatch {
            op: "cast_copy",
            lhs: src.shape().clone(),
            rhs: dst.shape().clone(),
        });
    }
    let values = src.to_f32_vec();
    match (src.layout(), dst.layout()) {
        (Layout::Dense, Layout::Dense) => dst.fill_from_f32(&values),
        (Layout::RowSparse { indices }, Layout::RowSparse { .. }) => {
            let dtype = dst.dtype();
            let mut bytes = vec![0u8; values.len() * dtype.size_bytes()];
            encode_f32(&values, dtype, &mut bytes);
            dst.assign_rows(indices.clone(), bytes)
        }
        _ => Err(TensorError::LayoutMismatch {
            op: "cast_copy",
            expected: "matching dense or row-sparse layouts",
        }),
    }
}

/// Computes `out = a + b` elementwise.
///
/// For dense tensors all three must share shape and dtype. For row-sparse
/// tensors the stored rows of `a` and `b` are merged by global row id
/// (rows present in both are summed) and the result replaces `out`'s
/// stored rows.
pub fn elementwise_add(a: &Tensor, b: &Tensor, out: &mut Tensor) -> Result<(), TensorError> {
    if a.dtype() != b.dtype() {
        return Err(TensorError::DTypeMismatch {
            op: "elementwise_add",
            lhs: a.dtype(),
            rhs: b.dtype(),
        });
    }
    if a.shape() != b.shape() {
        return Err(TensorError::ShapeMismatch {
            op: "elementwise_add",
            lhs: a.shape().clone(),
            rhs: b.shape().clone(),
        });
    }
    match (a.layout(), b.layout()) {
        (Layout::Dense, Layout::Dense) => {
            if out.dtype() != a.dtype() || out.shape() != a.shape() {
                return Err(TensorError::ShapeMismatch {
                    op: "elementwise_add (output)",
                    lhs: a.shape().clone(),
                    rhs: out.shape().clone(),
                });
            }
            let av = a.to_f32_vec();
            let bv = b.to_f32_vec();
            let sums: Vec<f32> = av.iter().zip(&bv).map(|(x, y)| x + y).collect();
            out.fill_from_f32(&sums)
        }
        (Layout::RowSparse { .. }, Layout::RowSparse { .. }) => {
            let (indices, values) = merge_rows(a, b);
            let dtype = out.dtype();
            let mut bytes = vec![0u8; values.len() * dtype.size_bytes()];
            encode_f32(&values, dtype, &mut bytes);
            out.assign_rows(indices, bytes)
        }
        _ => Err(TensorError::LayoutMismatch {
            op: "elementwise_add",
            expected: "matching dense or row-sparse layouts",
        }),
    }
}

/// Accumulates `src` into `dst` (`dst += src`).
pub fn elementwise_add_into(dst: &mut Tensor, src: &Tensor) -> Result<(), TensorError> {
    match (dst.layout(), src.layout()) {
        (Layout::Dense, Layout::Dense) => {
            if dst.dtype() != src.dtype() {
                return Err(TensorError::DTypeMismatch {
                    op: "elementwise_add_into",
                    lhs: dst.dtype(),
                    rhs: src.dtype(),
                });
            }
            if dst.shape() != src.shape() {
                return Err(TensorError::ShapeMismatch {
                    op: "elementwise_add_into",
                    lhs: dst.shape().clone(),
                    rhs: src.shape().clone(),
                });
            }
            if dst.dtype() == DType::F32 {
                // Fast path: accumulate in place without staging.
                let sv = src.as_f32_slice().to_vec();
                for (d, s) in dst.as_f32_slice_mut().iter_mut().zip(sv) {
                    *d += s;
                }
                Ok(())
            } else {
                let sums: Vec<f32> = dst
                    .to_f32_vec()
                    .iter()
                    .zip(src.to_f32_vec())
                    .map(|(d, s)| d + s)
                    .collect();
                dst.fill_from_f32(&sums)
            }
        }
        (Layout::RowSparse { .. }, Layout::RowSparse { .. }) => {
            let snapshot = dst.clone();
            elementwise_add(&snapshot, src, dst)
        }
        _ => Err(TensorError::LayoutMismatch {
            op: "elementwise_add_into",
            expected: "matching dense or row-sparse layouts",
        }),
    }
}

/// Expands a row-sparse tensor to full storage with the identity index
/// array `[0, 1, …, rows-1]`, zero-filling the data buffer.
///
/// Used when a row-sparse parameter is first allocated: afterwards the
/// stored byte layout is row-major over the full logical shape, so a row's
/// bytes live at `row_id × unit_len × sizeof(dtype)`.
pub fn row_sparse_populate_full_idx(t: &mut Tensor) -> Result<(), TensorError> {
    let rows = t.shape().dim(0).unwrap_or(0);
    if !t.is_row_sparse() {
        return Err(TensorError::LayoutMismatch {
            op: "row_sparse_populate_full_idx",
            expected: "row-sparse",
        });
    }
    let full: Vec<i64> = (0..rows as i64).collect();
    let bytes = vec![0u8; t.shape().size_bytes(t.dtype())];
    t.assign_rows(full, bytes)
}

/// Merges the stored rows of two row-sparse tensors, summing rows present
/// in both. Returns `(indices, values)` with indices strictly increasing.
fn merge_rows(a: &Tensor, b: &Tensor) -> (Vec<i64>, Vec<f32>) {
    let unit = a.shape().unit_len();
    let (ai, av) = (a.indices().unwrap_or(&[]), a.to_f32_vec());
    let (bi, bv) = (b.indices().unwrap_or(&[]), b.to_f32_vec());

    let mut indices = Vec::with_capacity(ai.len() + bi.len());
    let mut values = Vec::with_capacity(av.len() + bv.len());
    let (mut i, mut j) = (0, 0);
    while i < ai.len() || j < bi.len() {
        let take_a = j >= bi.len() || (i < ai.len() && ai[i] <= bi[j]);
        let take_b = i >= ai.len() || (j < bi.len() && bi[j] <= ai[i]);
        if take_a && take_b {
            indices.push(ai[i]);
            values.extend(
                av[i * unit..(i + 1) * unit]
                    .iter()
                    .zip(&bv[j * unit..(j + 1) * unit])
                    .map(|(x, y)| x + y),
            );
            i += 1;
            j += 1;
        } else if take_a {
            indices.push(ai[i]);
            values.extend_from_slice(&av[i * unit..(i + 1) * unit]);
            i += 1;
        } else {
            indices.push(bi[j]);
            values.extend_from_slice(&bv[j * unit..(j + 1) * unit]);
            j += 1;
        }
    }
    (indices, values)
}

/// Encodes `f32` values into `out` using the byte representation of `dtype`.
fn encode_f32(values: &[f32], dtype: DType, out: &mut [u8]) {
    match dtype {
        DType::F32 => {
            for (chunk, v) in out.chunks_exact_mut(4).zip(values) {
                chunk.copy_from_slice(&v.to_le_bytes());
            }
        }
        DType::F16 => {
            for (chunk, v) in out.chunks_exact_mut(2).zip(values) {
                chunk.copy_from_slice(&f16::from_f32(*v).to_bits().to_le_bytes());
            }
        }
        DType::BF16 => {
            for (chunk, v) in out.chunks_exact_mut(2).zip(values) {
                chunk.copy_from_slice(&bf16::from_f32(*v).to_bits().to_le_bytes());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Shape;

    fn rs(shape: Shape, indices: Vec<i64>, vals: &[f32]) -> Tensor {
        let bytes = vals.iter().flat_map(|v| v.to_le_bytes()).collect();
        Tensor::row_sparse(shape, DType::F32, indices, bytes).unwrap()
    }

    #[test]
    fn test_dense_copy() {
        let src = Tensor::from_f32(Shape::vector(3), &[1.0, 2.0, 3.0]).unwrap();
        let mut dst = Tensor::zeros(Shape::vector(3), DType::F32);
        copy(&src, &mut dst).unwrap();
        assert_eq!(dst.as_f32_slice(), &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_copy_dtype_mismatch() {
        let src = Tensor::from_f32(Shape::vector(2), &[1.0, 2.0]).unwrap();
        let mut dst = Tensor::zeros(Shape::vector(2), DType::F16);
        assert!(matches!(
            copy(&src, &mut dst),
            Err(TensorError::DTypeMismatch { .. })
        ));
    }

    #[test]
    fn test_cast_copy_f32_to_f16() {
        let src = Tensor::from_f32(Shape::vector(2), &[8.0, -2.5]).unwrap();
        let mut dst = Tensor::zeros(Shape::vector(2), DType::F16);
        cast_copy(&src, &mut dst).unwrap();
        assert_eq!(dst.to_f32_vec(), vec![8.0, -2.5]);
    }

    #[test]
    fn test_cast_copy_f16_to_f32() {
        let mut src = Tensor::zeros(Shape::vector(2), DType::F16);
        src.fill_from_f32(&[2.0, 2.0]).unwrap();
        let mut dst = Tensor::zeros(Shape::vector(2), DType::F32);
        cast_copy(&src, &mut dst).unwrap();
        assert_eq!(dst.as_f32_slice(), &[2.0, 2.0]);
    }

    #[test]
    fn test_dense_add() {
        let a = Tensor::from_f32(Shape::vector(3), &[1.0, 2.0, 3.0]).unwrap();
        let b = Tensor::from_f32(Shape::vector(3), &[0.5, 0.5, 0.5]).unwrap();
        let mut out = Tensor::zeros(Shape::vector(3), DType::F32);
        elementwise_add(&a, &b, &mut out).unwrap();
        assert_eq!(out.as_f32_slice(), &[1.5, 2.5, 3.5]);
    }

    #[test]
    fn test_dense_add_into() {
        let mut dst = Tensor::from_f32(Shape::vector(2), &[1.0, 1.0]).unwrap();
        let src = Tensor::from_f32(Shape::vector(2), &[0.25, 0.75]).unwrap();
        elementwise_add_into(&mut dst, &src).unwrap();
        assert_eq!(dst.as_f32_slice(), &[1.25, 1.75]);
    }

    #[test]
    fn test_f16_add_into() {
        let mut dst = Tensor::zeros(Shape::vector(2), DType::F16);
        dst.fill_from_f32(&[1.0, 2.0]).unwrap();
        let mut src = Tensor::zeros(Shape::vector(2), DType::F16);
        src.fill_from_f32(&[1.0, 1.0]).unwrap();
        elementwise_add_into(&mut dst, &src).unwrap();
        assert_eq!(dst.to_f32_vec(), vec![2.0, 3.0]);
    }

    #[test]
    fn test_add_shape_mismatch() {
        let a = Tensor::zeros(Shape::vector(2), DType::F32);
        let b = Tensor::zeros(Shape::vector(3), DType::F32);
        let mut out = Tensor::zeros(Shape::vector(2), DType::F32);
        assert!(elementwise_add(&a, &b, &mut out).is_err());
    }

    #[test]
    fn test_row_sparse_merge_disjoint() {
        let shape = Shape::matrix(6, 2);
        let a = rs(shape.clone(), vec![0, 4], &[1.0, 1.0, 4.0, 4.0]);
        let b = rs(shape.clone(), vec![2], &[2.0, 2.0]);
        let mut out = Tensor::row_sparse_zeros(shape, DType::F32);
        elementwise_add(&a, &b, &mut out).unwrap();
        assert_eq!(out.indices(), Some(&[0i64, 2, 4][..]));
        assert_eq!(out.as_f32_slice(), &[1.0, 1.0, 2.0, 2.0, 4.0, 4.0]);
    }

    #[test]
    fn test_row_sparse_merge_overlapping() {
        let shape = Shape::matrix(4, 2);
        let a = rs(shape.clone(), vec![1, 3], &[1.0, 1.0, 2.0, 2.0]);
        let b = rs(shape.clone(), vec![1], &[0.5, 0.5]);
        let mut out = Tensor::row_sparse_zeros(shape, DType::F32);
        elementwise_add(&a, &b, &mut out).unwrap();
        assert_eq!(out.indices(), Some(&[1i64, 3][..]));
        assert_eq!(out.as_f32_slice(), &[1.5, 1.5, 2.0, 2.0]);
    }

    #[test]
    fn test_row_sparse_add_into_with_empty() {
        let shape = Shape::matrix(4, 1);
        let mut dst = rs(shape.clone(), vec![2], &[7.0]);
        let src = Tensor::row_sparse_zeros(shape, DType::F32);
        elementwise_add_into(&mut dst, &src).unwrap();
        assert_eq!(dst.indices(), Some(&[2i64][..]));
        assert_eq!(dst.as_f32_slice(), &[7.0]);
    }

    #[test]
    fn test_populate_full_idx() {
        let mut t = Tensor::row_sparse_zeros(Shape::matrix(3, 2), DType::F32);
        row_sparse_populate_full_idx(&mut t).unwrap();
        assert_eq!(t.indices(), Some(&[0i64, 1, 2][..]));
        assert_eq!(t.stored_elements(), 6);
        assert!(t.as_f32_slice().iter().all(|&x| x == 0.0));
    }

    #[test]
    fn test_populate_full_idx_dense_rejected() {
        let mut t = Tensor::zeros(Shape::matrix(3, 2), DType::F32);
        assert!(row_sparse_populate_full_idx(&mut t).is_err());
    }

    #[test]
    fn test_layout_mixing_rejected() {
        let dense = Tensor::zeros(Shape::matrix(2, 2), DType::F32);
        let sparse = Tensor::row_sparse_zeros(Shape::matrix(2, 2), DType::F32);
        let mut out = Tensor::zeros(Shape::matrix(2, 2), DType::F32);
        assert!(matches!(
            elementwise_add(&dense, &sparse, &mut out),
            Err(TensorError::LayoutMismatch { .. })
        ));
    }
}
