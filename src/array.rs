//! Self-describing numeric arrays.
//!
//! An [`NdArray`] carries its dtype and shape next to raw little-endian
//! bytes, so archived camera frames and joint vectors can be reconstructed
//! without guessing.

use serde::{Deserialize, Serialize};

use crate::error::ArchiveError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Uint8,
    Float32,
    Float64,
}

impl DType {
    /// Size of one element in bytes.
    pub const fn size(self) -> usize {
        match self {
            Self::Uint8 => 1,
            Self::Float32 => 4,
            Self::Float64 => 8,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Uint8 => "uint8",
            Self::Float32 => "float32",
            Self::Float64 => "float64",
        }
    }
}

/// A dense row-major array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NdArray {
    dtype: DType,
    shape: Vec<usize>,
    data: Vec<u8>,
}

fn element_count(shape: &[usize]) -> usize {
    shape.iter().product()
}

impl NdArray {
    pub fn from_u8(shape: Vec<usize>, data: Vec<u8>) -> Result<Self, ArchiveError> {
        let array = Self {
            dtype: DType::Uint8,
            shape,
            data,
        };
        array.validate()?;
        Ok(array)
    }

    pub fn from_f32(shape: Vec<usize>, values: &[f32]) -> Result<Self, ArchiveError> {
        let data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        let array = Self {
            dtype: DType::Float32,
            shape,
            data,
        };
        array.validate()?;
        Ok(array)
    }

    pub fn from_f64(shape: Vec<usize>, values: &[f64]) -> Result<Self, ArchiveError> {
        let data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        let array = Self {
            dtype: DType::Float64,
            shape,
            data,
        };
        array.validate()?;
        Ok(array)
    }

    pub fn zeros(dtype: DType, shape: Vec<usize>) -> Self {
        let len = element_count(&shape) * dtype.size();
        Self {
            dtype,
            shape,
            data: vec![0; len],
        }
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        element_count(&self.shape)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check that the byte buffer matches `shape` and `dtype`.
    pub fn validate(&self) -> Result<(), ArchiveError> {
        let expected = element_count(&self.shape) * self.dtype.size();
        if self.data.len() != expected {
            return Err(ArchiveError::Corrupt(format!(
                "{} array of shape {:?} needs {expected} bytes, found {}",
                self.dtype.as_str(),
                self.shape,
                self.data.len()
            )));
        }
        Ok(())
    }

    /// Decode as `f64` values, widening `uint8` and `float32`.
    pub fn to_f64_vec(&self) -> Vec<f64> {
        match self.dtype {
            DType::Uint8 => self.data.iter().map(|&b| f64::from(b)).collect(),
            DType::Float32 => self
                .data
                .chunks_exact(4)
                .map(|c| f64::from(f32::from_le_bytes([c[0], c[1], c[2], c[3]])))
                .collect(),
            DType::Float64 => self
                .data
                .chunks_exact(8)
                .map(|c| {
                    let mut b = [0u8; 8];
                    b.copy_from_slice(c);
                    f64::from_le_bytes(b)
                })
                .collect(),
        }
    }

    /// Decode `float32` data; other dtypes are converted.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        match self.dtype {
            DType::Float32 => self
                .data
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
            _ => self.to_f64_vec().into_iter().map(|v| v as f32).collect(),
        }
    }

    /// Stack equally shaped arrays along a new leading axis.
    ///
    /// `item_shape` is required so that an empty sequence still produces a
    /// well-formed `(0, ...)` array.
    pub fn stack<'a>(
        dtype: DType,
        item_shape: &[usize],
        items: impl IntoIterator<Item = &'a NdArray>,
    ) -> Result<Self, ArchiveError> {
        let mut data = Vec::new();
        let mut count = 0usize;
        for item in items {
            if item.dtype != dtype || item.shape != item_shape {
                return Err(ArchiveError::Corrupt(format!(
                    "cannot stack {} {:?} into {} {:?}",
                    item.dtype.as_str(),
                    item.shape,
                    dtype.as_str(),
                    item_shape
                )));
            }
            data.extend_from_slice(&item.data);
            count += 1;
        }
        let mut shape = Vec::with_capacity(item_shape.len() + 1);
        shape.push(count);
        shape.extend_from_slice(item_shape);
        let array = Self { dtype, shape, data };
        array.validate()?;
        Ok(array)
    }

    /// Split along the leading axis. Inverse of [`NdArray::stack`].
    pub fn unstack(&self) -> Result<Vec<NdArray>, ArchiveError> {
        self.validate()?;
        let Some((&count, item_shape)) = self.shape.split_first() else {
            return Err(ArchiveError::Corrupt("cannot unstack a scalar array".into()));
        };
        let item_bytes = element_count(item_shape) * self.dtype.size();
        if item_bytes == 0 {
            return Ok(vec![Self::zeros(self.dtype, item_shape.to_vec()); count]);
        }
        Ok(self
            .data
            .chunks_exact(item_bytes)
            .map(|chunk| Self {
                dtype: self.dtype,
                shape: item_shape.to_vec(),
                data: chunk.to_vec(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_reject_wrong_lengths() {
        assert!(NdArray::from_u8(vec![2, 2, 3], vec![0; 12]).is_ok());
        let err = NdArray::from_u8(vec![2, 2, 3], vec![0; 11]).unwrap_err();
        assert!(err.to_string().contains("needs 12 bytes"));
        assert!(NdArray::from_f64(vec![3], &[1.0, 2.0]).is_err());
    }

    #[test]
    fn float_arrays_decode_exactly() {
        let values = [0.1, -2.5, f64::MAX];
        let array = NdArray::from_f64(vec![3], &values).unwrap();
        assert_eq!(array.dtype(), DType::Float64);
        assert_eq!(array.as_bytes().len(), 24);
        assert_eq!(array.to_f64_vec(), values.to_vec());

        let array = NdArray::from_f32(vec![2], &[1.5, -0.25]).unwrap();
        assert_eq!(array.to_f32_vec(), vec![1.5, -0.25]);
    }

    #[test]
    fn stack_then_unstack_preserves_items() {
        let a = NdArray::from_u8(vec![1, 2, 3], (0..6).collect()).unwrap();
        let b = NdArray::from_u8(vec![1, 2, 3], (6..12).collect()).unwrap();
        let stacked = NdArray::stack(DType::Uint8, &[1, 2, 3], [&a, &b]).unwrap();
        assert_eq!(stacked.shape(), &[2, 1, 2, 3]);
        assert_eq!(stacked.unstack().unwrap(), vec![a, b]);
    }

    #[test]
    fn stacking_nothing_keeps_item_shape() {
        let stacked = NdArray::stack(DType::Float64, &[9], std::iter::empty()).unwrap();
        assert_eq!(stacked.shape(), &[0, 9]);
        assert!(stacked.unstack().unwrap().is_empty());
    }

    #[test]
    fn stacking_mixed_shapes_fails() {
        let a = NdArray::zeros(DType::Uint8, vec![2, 2, 3]);
        let b = NdArray::zeros(DType::Uint8, vec![2, 3, 3]);
        assert!(NdArray::stack(DType::Uint8, &[2, 2, 3], [&a, &b]).is_err());
    }
}
