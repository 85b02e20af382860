// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! The paired request-kind/dtype tag carried in a data request's `cmd`
//! field.
//!
//! The wire protocol folds the request kind and the element dtype into a
//! single non-negative integer using the Cantor pairing function, which is
//! invertible: `unpair(pair(kind, dtype)) == (kind, dtype)`.

use serde::{Deserialize, Serialize};

/// How a data request's payload is to be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestKind {
    /// Dense push/pull of a whole tensor.
    DensePushPull,
    /// Row-sparse push/pull keyed by `(master_key, row_key…)`.
    RowSparsePushPull,
    /// Push of codec-compressed gradient bytes.
    CompressedPushPull,
}

impl RequestKind {
    fn as_int(self) -> i32 {
        match self {
            RequestKind::DensePushPull => 0,
            RequestKind::RowSparsePushPull => 1,
            RequestKind::CompressedPushPull => 2,
        }
    }

    fn from_int(v: i32) -> Option<Self> {
        match v {
            0 => Some(RequestKind::DensePushPull),
            1 => Some(RequestKind::RowSparsePushPull),
            2 => Some(RequestKind::CompressedPushPull),
            _ => None,
        }
    }
}

/// Decoded form of a data request's `cmd` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataHandleKind {
    pub kind: RequestKind,
    /// Wire tag of the element dtype (see `tensor_engine::DType::wire_tag`).
    pub dtype_tag: i32,
}

impl DataHandleKind {
    /// Folds `(kind, dtype_tag)` into the single wire integer.
    pub fn pair(self) -> i32 {
        let m = self.kind.as_int();
        let d = self.dtype_tag;
        (((m + d) * (m + d + 1)) / 2) + d
    }

    /// Inverts [`DataHandleKind::pair`].
    ///
    /// Returns `None` for values that do not decode to a known request
    /// kind or that are negative.
    pub fn unpair(cmd: i32) -> Option<Self> {
        if cmd < 0 {
            return None;
        }
        let w = (((8.0 * cmd as f64 + 1.0).sqrt() - 1.0) / 2.0).floor() as i32;
        let t = (w * w + w) / 2;
        let d = cmd - t;
        let m = w - d;
        if m < 0 || d < 0 {
            return None;
        }
        RequestKind::from_int(m).map(|kind| DataHandleKind { kind, dtype_tag: d })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_roundtrip() {
        for kind in [
            RequestKind::DensePushPull,
            RequestKind::RowSparsePushPull,
            RequestKind::CompressedPushPull,
        ] {
            for dtype_tag in 0..4 {
                let h = DataHandleKind { kind, dtype_tag };
                let cmd = h.pair();
                assert_eq!(DataHandleKind::unpair(cmd), Some(h), "cmd={cmd}");
            }
        }
    }

    #[test]
    fn test_pair_is_injective() {
        let mut seen = std::collections::HashSet::new();
        for kind in [
            RequestKind::DensePushPull,
            RequestKind::RowSparsePushPull,
            RequestKind::CompressedPushPull,
        ] {
            for dtype_tag in 0..8 {
                assert!(seen.insert(DataHandleKind { kind, dtype_tag }.pair()));
            }
        }
    }

    #[test]
    fn test_unpair_rejects_negative() {
        assert_eq!(DataHandleKind::unpair(-1), None);
    }
}
