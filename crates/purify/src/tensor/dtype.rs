//! Enumerates the scalar element types a backend handle can report.

use serde::{Deserialize, Serialize};

/// Logical dtype identifier reported by backend handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    F32,
    /// IEEE half precision.
    F16,
    BF16,
    F64,
    /// Signed integer used by index and shape tensors.
    I32,
    I64,
    Bool,
}

impl DType {
    /// Bytes per element.
    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::F32 | DType::I32 => 4,
            DType::F16 | DType::BF16 => 2,
            DType::F64 | DType::I64 => 8,
            DType::Bool => 1,
        }
    }

    /// Returns `true` when the dtype is a floating-point representation.
    pub fn is_float(self) -> bool {
        matches!(self, DType::F32 | DType::F16 | DType::BF16 | DType::F64)
    }
}
