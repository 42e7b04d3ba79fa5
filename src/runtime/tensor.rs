//! Host-side tensors exchanged with execution sessions

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::error::{Error, Result};

/// Named tensors passed to or returned from a session run
pub type TensorMap = HashMap<String, Tensor>;

/// Element type of a tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    F32,
    I64,
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DType::F32 => write!(f, "float32"),
            DType::I64 => write!(f, "int64"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    F32(Vec<f32>),
    I64(Vec<i64>),
}

/// Dense row-major tensor
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    data: TensorData,
}

fn check_len(shape: &[usize], len: usize) -> Result<()> {
    let expected: usize = shape.iter().product();
    if expected != len {
        return Err(Error::tensor(format!(
            "shape {:?} needs {} elements, got {}",
            shape, expected, len
        )));
    }
    Ok(())
}

impl Tensor {
    pub fn from_f32(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        check_len(&shape, data.len())?;
        Ok(Self {
            shape,
            data: TensorData::F32(data),
        })
    }

    pub fn from_i64(shape: Vec<usize>, data: Vec<i64>) -> Result<Self> {
        check_len(&shape, data.len())?;
        Ok(Self {
            shape,
            data: TensorData::I64(data),
        })
    }

    pub fn zeros(shape: Vec<usize>) -> Self {
        let len = shape.iter().product();
        Self {
            shape,
            data: TensorData::F32(vec![0.0; len]),
        }
    }

    /// `[1, len]` int64 tensor of ones
    pub fn ones_mask(len: usize) -> Self {
        Self {
            shape: vec![1, len],
            data: TensorData::I64(vec![1; len]),
        }
    }

    /// `[1, ids.len()]` int64 tensor of token ids
    pub fn token_ids(ids: &[u32]) -> Self {
        Self {
            shape: vec![1, ids.len()],
            data: TensorData::I64(ids.iter().map(|&id| id as i64).collect()),
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn dtype(&self) -> DType {
        match self.data {
            TensorData::F32(_) => DType::F32,
            TensorData::I64(_) => DType::I64,
        }
    }

    pub fn as_f32(&self) -> Result<&[f32]> {
        match &self.data {
            TensorData::F32(v) => Ok(v),
            TensorData::I64(_) => Err(Error::tensor("expected float32 data, found int64")),
        }
    }

    pub fn as_f32_mut(&mut self) -> Result<&mut [f32]> {
        match &mut self.data {
            TensorData::F32(v) => Ok(v),
            TensorData::I64(_) => Err(Error::tensor("expected float32 data, found int64")),
        }
    }

    pub fn as_i64(&self) -> Result<&[i64]> {
        match &self.data {
            TensorData::I64(v) => Ok(v),
            TensorData::F32(_) => Err(Error::tensor("expected int64 data, found float32")),
        }
    }

    /// Size of the innermost dimension
    pub fn last_dim(&self) -> usize {
        self.shape.last().copied().unwrap_or(1)
    }

    /// Last row along the innermost dimension, e.g. the logits of the final
    /// position of a `[1, seq, vocab]` tensor
    pub fn last_row(&self) -> Result<&[f32]> {
        let data = self.as_f32()?;
        let width = self.last_dim();
        if width == 0 || data.len() < width {
            return Err(Error::tensor(format!("tensor {:?} has no rows", self.shape)));
        }
        Ok(&data[data.len() - width..])
    }
}

/// Index of the largest element; ties resolve to the lowest index
pub fn argmax(values: &[f32]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (i, &v) in values.iter().enumerate() {
        match best {
            Some((_, b)) if v <= b || v.is_nan() => {}
            _ if v.is_nan() => {}
            _ => best = Some((i, v)),
        }
    }
    best.map(|(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_must_match_data() {
        assert!(Tensor::from_f32(vec![2, 3], vec![0.0; 6]).is_ok());
        assert!(Tensor::from_f32(vec![2, 3], vec![0.0; 5]).is_err());
        assert_eq!(Tensor::zeros(vec![1, 8, 0, 64]).numel(), 0);
    }

    #[test]
    fn test_last_row_and_argmax() {
        let logits = Tensor::from_f32(vec![1, 2, 3], vec![9.0, 0.0, 0.0, 0.1, 0.7, 0.7]).unwrap();
        let row = logits.last_row().unwrap();
        assert_eq!(row, &[0.1, 0.7, 0.7]);
        assert_eq!(argmax(row), Some(1));
        assert_eq!(argmax(&[]), None);
        assert_eq!(argmax(&[f32::NAN, -1.0]), Some(1));
    }
}
