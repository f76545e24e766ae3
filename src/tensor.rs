//! Dense numeric buffer interchange types
//!
//! `Tensor` and `Storage` are the boundary types exchanged with the external
//! numeric library: a dtype, optional shape metadata, and a raw
//! little-endian byte buffer. This crate moves the bytes; it never interprets
//! them element-wise.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Element type of a dense buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DType {
    U8 = 0,
    I32 = 1,
    I64 = 2,
    F32 = 3,
    F64 = 4,
}

impl DType {
    /// Convert from discriminant.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::U8),
            1 => Some(Self::I32),
            2 => Some(Self::I64),
            3 => Some(Self::F32),
            4 => Some(Self::F64),
            _ => None,
        }
    }

    /// Size of one element in bytes.
    pub const fn element_size(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::I32 | Self::F32 => 4,
            Self::I64 | Self::F64 => 8,
        }
    }

    /// Name of this dtype.
    pub const fn name(self) -> &'static str {
        match self {
            Self::U8 => "u8",
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::F32 => "f32",
            Self::F64 => "f64",
        }
    }
}

/// A dense n-dimensional buffer with shape metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    pub dtype: DType,
    /// Dimension sizes, outermost first.
    pub shape: Vec<i64>,
    /// Row-major element bytes, little-endian.
    pub data: Vec<u8>,
}

impl Tensor {
    /// Create a tensor, validating that the buffer length matches the shape.
    pub fn new(dtype: DType, shape: Vec<i64>, data: Vec<u8>) -> Result<Self> {
        let elems: i64 = shape.iter().product();
        if elems < 0 || shape.iter().any(|&d| d < 0) {
            return Err(Error::malformed(format!(
                "negative tensor dimension in {shape:?}"
            )));
        }
        let expected = elems as usize * dtype.element_size();
        if data.len() != expected {
            return Err(Error::malformed(format!(
                "tensor buffer is {} bytes, shape {:?} of {} requires {}",
                data.len(),
                shape,
                dtype.name(),
                expected
            )));
        }
        Ok(Self { dtype, shape, data })
    }
}

/// A flat dense buffer without shape metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Storage {
    pub dtype: DType,
    /// Element bytes, little-endian.
    pub data: Vec<u8>,
}

impl Storage {
    /// Create a storage, validating that the buffer length is a whole number
    /// of elements.
    pub fn new(dtype: DType, data: Vec<u8>) -> Result<Self> {
        if data.len() % dtype.element_size() != 0 {
            return Err(Error::malformed(format!(
                "storage buffer of {} bytes is not a multiple of {} ({})",
                data.len(),
                dtype.element_size(),
                dtype.name()
            )));
        }
        Ok(Self { dtype, data })
    }
}
