//! Element types and their byte-size contract.
//!
//! Quantized formats are opaque here: the manager only needs to know how many
//! bytes a buffer of `n` logical elements occupies.

use std::fmt;
use std::mem::size_of;

use serde::{Deserialize, Serialize};

/// Storage type of a weight buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    F32,
    F16,
    BF16,
    F8,
    I8,
    U8,
    /// 4-bit normal-float, block scales included in the size
    Nf4,
    /// 4-bit float, block scales included in the size
    Fp4,
}

impl DType {
    /// Bytes needed to store `elements` logical elements.
    pub fn storage_bytes(&self, elements: u64) -> u64 {
        match self {
            DType::F32 => elements * size_of::<f32>() as u64,
            DType::F16 => elements * size_of::<half::f16>() as u64,
            DType::BF16 => elements * size_of::<half::bf16>() as u64,
            DType::F8 | DType::I8 | DType::U8 => elements,
            // Half a byte per element plus ~10% for block scales.
            DType::Nf4 | DType::Fp4 => (elements * 55).div_ceil(100),
        }
    }

    pub fn is_quantized(&self) -> bool {
        matches!(self, DType::Nf4 | DType::Fp4)
    }

    pub fn is_float(&self) -> bool {
        matches!(self, DType::F32 | DType::F16 | DType::BF16 | DType::F8)
    }
}

impl Default for DType {
    fn default() -> Self {
        Self::F16
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::F32 => "f32",
            DType::F16 => "f16",
            DType::BF16 => "bf16",
            DType::F8 => "f8",
            DType::I8 => "i8",
            DType::U8 => "u8",
            DType::Nf4 => "nf4",
            DType::Fp4 => "fp4",
        };
        f.write_str(name)
    }
}
