// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! # grad-codec
//!
//! The gradient-compression codec consumed by the shard server.
//!
//! Workers may quantize gradients before pushing them; the server side
//! only ever *dequantizes*: compressed bytes arrive on the wire and are
//! expanded into a pre-sized `f32` tensor (the merge buffer, the
//! decompression scratch, or a freshly initialized parameter).
//!
//! Codec selection and parameters travel as an out-of-band command whose
//! body is a comma-separated `key:value` list, e.g. `type:onebit,threshold:0.5`.
//! Reconfiguring with identical parameters is a no-op.

mod error;

pub use error::CodecError;

use tensor_engine::{DType, Tensor};

/// The codec algorithm in effect.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum CompressionKind {
    /// No compression: the payload is the little-endian `f32` data itself.
    None,
    /// One bit per element: a set bit decodes to `+threshold`, a clear bit
    /// to `-threshold`. Bits are packed MSB-first within each byte.
    OneBit {
        threshold: f32,
    },
}

/// Server-side gradient decompression state.
///
/// Starts as [`CompressionKind::None`] and is reconfigured through
/// [`GradientCompression::decode_params`] when the frontend issues the
/// compression-setup command.
#[derive(Debug, Clone, PartialEq)]
pub struct GradientCompression {
    kind: CompressionKind,
}

impl Default for GradientCompression {
    fn default() -> Self {
        Self {
            kind: CompressionKind::None,
        }
    }
}

impl GradientCompression {
    /// Returns the active codec.
    pub fn kind(&self) -> CompressionKind {
        self.kind
    }

    /// Parses codec parameters from a command body.
    ///
    /// The body is UTF-8 text of comma-separated `key:value` pairs. The
    /// `type` key selects the codec (`none` or `onebit`); `onebit` accepts
    /// an optional `threshold` (default `0.5`, must be positive).
    pub fn decode_params(&mut self, body: &[u8]) -> Result<(), CodecError> {
        let text = std::str::from_utf8(body)
            .map_err(|_| CodecError::InvalidParams("body is not UTF-8".into()))?;

        let mut kind_name = None;
        let mut threshold = None;
        for pair in text.split(',').filter(|p| !p.trim().is_empty()) {
            let (key, value) = pair
                .split_once(':')
                .ok_or_else(|| CodecError::InvalidParams(format!("expected key:value, got '{pair}'")))?;
            match key.trim() {
                "type" => kind_name = Some(value.trim().to_string()),
                "threshold" => {
                    let t: f32 = value.trim().parse().map_err(|_| {
                        CodecError::InvalidParams(format!("bad threshold '{value}'"))
                    })?;
                    if t <= 0.0 {
                        return Err(CodecError::InvalidParams(format!(
                            "threshold must be positive, got {t}"
                        )));
                    }
                    threshold = Some(t);
                }
                other => {
                    return Err(CodecError::InvalidParams(format!(
                        "unknown parameter '{other}'"
                    )))
                }
            }
        }

        let kind = match kind_name.as_deref() {
            None | Some("none") => CompressionKind::None,
            Some("onebit") => CompressionKind::OneBit {
                threshold: threshold.unwrap_or(0.5),
            },
            Some(other) => return Err(CodecError::UnsupportedType(other.to_string())),
        };

        if kind != self.kind {
            tracing::info!(?kind, "gradient compression reconfigured");
            self.kind = kind;
        }
        Ok(())
    }

    /// Expands `compressed` into `dst`, which must be a dense `f32` tensor
    /// already sized to the decompressed element count.
    pub fn dequantize(&self, compressed: &[u8], dst: &mut Tensor) -> Result<(), CodecError> {
        if dst.dtype() != DType::F32 || dst.is_row_sparse() {
            return Err(CodecError::InvalidParams(
                "dequantize target must be a dense f32 tensor".into(),
            ));
        }
        let elements = dst.shape().num_elements();
        match self.kind {
            CompressionKind::None => {
                if compressed.len() != elements * 4 {
                    return Err(CodecError::SizeMismatch {
                        expected: elements * 4,
                        actual: compressed.len(),
                    });
                }
                dst.as_bytes_mut().copy_from_slice(compressed);
                Ok(())
            }
            CompressionKind::OneBit { threshold } => {
                let expected = elements.div_ceil(8);
                if compressed.len() != expected {
                    return Err(CodecError::SizeMismatch {
                        expected,
                        actual: compressed.len(),
                    });
                }
                let out = dst.as_f32_slice_mut();
                for (i, v) in out.iter_mut().enumerate() {
                    let bit = (compressed[i / 8] >> (7 - (i % 8))) & 1;
                    *v = if bit == 1 { threshold } else { -threshold };
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tensor_engine::Shape;

    #[test]
    fn test_default_is_none() {
        let gc = GradientCompression::default();
        assert_eq!(gc.kind(), CompressionKind::None);
    }

    #[test]
    fn test_decode_params_onebit() {
        let mut gc = GradientCompression::default();
        gc.decode_params(b"type:onebit,threshold:0.25").unwrap();
        assert_eq!(
            gc.kind(),
            CompressionKind::OneBit { threshold: 0.25 }
        );
    }

    #[test]
    fn test_decode_params_idempotent() {
        let mut gc = GradientCompression::default();
        gc.decode_params(b"type:onebit,threshold:0.5").unwrap();
        let before = gc.clone();
        gc.decode_params(b"type:onebit,threshold:0.5").unwrap();
        assert_eq!(gc, before);
    }

    #[test]
    fn test_decode_params_rejects_garbage() {
        let mut gc = GradientCompression::default();
        assert!(gc.decode_params(b"type=onebit").is_err());
        assert!(gc.decode_params(b"type:zipzap").is_err());
        assert!(gc.decode_params(b"type:onebit,threshold:-1").is_err());
    }

    #[test]
    fn test_dequantize_none_is_passthrough() {
        let gc = GradientCompression::default();
        let vals = [0.2f32, 0.2];
        let bytes: Vec<u8> = vals.iter().flat_map(|v| v.to_le_bytes()).collect();
        let mut dst = Tensor::zeros(Shape::vector(2), DType::F32);
        gc.dequantize(&bytes, &mut dst).unwrap();
        assert_eq!(dst.as_f32_slice(), &[0.2, 0.2]);
    }

    #[test]
    fn test_dequantize_none_size_mismatch() {
        let gc = GradientCompression::default();
        let mut dst = Tensor::zeros(Shape::vector(3), DType::F32);
        let result = gc.dequantize(&[0u8; 4], &mut dst);
        assert!(matches!(result, Err(CodecError::SizeMismatch { .. })));
    }

    #[test]
    fn test_dequantize_onebit() {
        let mut gc = GradientCompression::default();
        gc.decode_params(b"type:onebit,threshold:1.5").unwrap();
        // 0b1010_0000 → +t, -t, +t, -t for 4 elements.
        let mut dst = Tensor::zeros(Shape::vector(4), DType::F32);
        gc.dequantize(&[0b1010_0000], &mut dst).unwrap();
        assert_eq!(dst.as_f32_slice(), &[1.5, -1.5, 1.5, -1.5]);
    }

    #[test]
    fn test_dequantize_onebit_length_check() {
        let mut gc = GradientCompression::default();
        gc.decode_params(b"type:onebit").unwrap();
        let mut dst = Tensor::zeros(Shape::vector(9), DType::F32);
        assert!(gc.dequantize(&[0u8; 1], &mut dst).is_err());
        assert!(gc.dequantize(&[0u8; 2], &mut dst).is_ok());
    }
}
