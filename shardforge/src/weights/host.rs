//! Host-side weight buffers and the tensor operations conversion needs.
//!
//! These types hold raw tensor data on the CPU. All reshaping, slicing and
//! concatenation works directly on the byte buffer, so no element decoding
//! happens except in [`host_cast`].

use crate::dtype::{DType, TensorDType};
use crate::shard::{ShardConfig, ShardStrategy};
use crate::{Error, Result};

/// Raw tensor data on the host.
///
/// The `data` field holds the raw bytes in the tensor's `dtype` encoding,
/// little-endian, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    /// Logical shape (e.g., `[out_features, in_features]` for a 2D weight).
    pub shape: Vec<usize>,
    /// Element dtype.
    pub dtype: DType,
    /// Raw bytes in `dtype` encoding.
    pub data: Vec<u8>,
}

impl HostTensor {
    /// Build a tensor from typed elements.
    ///
    /// # Errors
    /// Returns an error if `values.len()` does not match the shape.
    pub fn from_slice<T: TensorDType>(shape: &[usize], values: &[T]) -> Result<Self> {
        let numel: usize = shape.iter().product();
        if numel != values.len() {
            return Err(Error::InvalidShape(format!(
                "from_slice: shape {shape:?} needs {numel} elements, got {}",
                values.len()
            )));
        }
        Ok(Self {
            shape: shape.to_vec(),
            dtype: T::DTYPE,
            data: bytemuck::cast_slice(values).to_vec(),
        })
    }

    /// Number of elements.
    #[must_use]
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// Number of dimensions.
    #[must_use]
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Interpret the data as a slice of `f32`.
    ///
    /// # Panics
    /// Panics if `dtype` is not `F32`.
    #[must_use]
    pub fn as_f32_slice(&self) -> &[f32] {
        assert_eq!(self.dtype, DType::F32, "as_f32_slice: expected F32");
        bytemuck::cast_slice(&self.data)
    }

    /// Decode every element to `f32`, whatever the storage dtype.
    #[must_use]
    pub fn to_f32_vec(&self) -> Vec<f32> {
        match self.dtype {
            DType::F32 => decode::<f32>(&self.data),
            DType::F16 => decode::<half::f16>(&self.data),
            DType::BF16 => decode::<half::bf16>(&self.data),
        }
    }

    /// Reinterpret the buffer with a new shape of the same element count.
    ///
    /// # Errors
    /// Returns an error if the element counts differ.
    pub fn reshape(self, shape: &[usize]) -> Result<Self> {
        let numel: usize = shape.iter().product();
        if numel != self.numel() {
            return Err(Error::ShapeMismatch {
                expected: self.shape,
                got: shape.to_vec(),
            });
        }
        Ok(Self {
            shape: shape.to_vec(),
            ..self
        })
    }

    fn check_dim(&self, dim: usize, op: &str) -> Result<()> {
        if dim >= self.ndim() {
            return Err(Error::InvalidShape(format!(
                "{op}: dim {dim} out of range for shape {:?}",
                self.shape
            )));
        }
        Ok(())
    }

    /// `(outer, dim_size, inner_bytes)` view of the buffer around `dim`.
    fn split_at_dim(&self, dim: usize) -> (usize, usize, usize) {
        let outer: usize = self.shape[..dim].iter().product();
        let inner: usize = self.shape[dim + 1..].iter().product();
        (outer, self.shape[dim], inner * self.dtype.size_in_bytes())
    }
}

fn decode<T: TensorDType>(data: &[u8]) -> Vec<f32> {
    // Buffers coming out of an mmap are not guaranteed to be aligned.
    let values: Vec<T> = bytemuck::pod_collect_to_vec(data);
    values.into_iter().map(TensorDType::to_f32).collect()
}

fn encode<T: TensorDType>(values: &[f32]) -> Vec<u8> {
    let out: Vec<T> = values.iter().map(|&v| T::from_f32(v)).collect();
    bytemuck::cast_slice(&out).to_vec()
}

/// Convert a tensor to `dtype`. Returns a plain copy when it already matches.
#[must_use]
pub fn host_cast(tensor: &HostTensor, dtype: DType) -> HostTensor {
    if tensor.dtype == dtype {
        return tensor.clone();
    }
    let values = tensor.to_f32_vec();
    let data = match dtype {
        DType::F32 => encode::<f32>(&values),
        DType::F16 => encode::<half::f16>(&values),
        DType::BF16 => encode::<half::bf16>(&values),
    };
    HostTensor {
        shape: tensor.shape.clone(),
        dtype,
        data,
    }
}

/// Concatenate tensors along `dim`.
///
/// All inputs must share dtype, rank, and every dimension except `dim`.
///
/// # Errors
/// Returns an error on an empty input or mismatched shapes/dtypes.
pub fn host_concat(tensors: &[&HostTensor], dim: usize) -> Result<HostTensor> {
    let first = tensors
        .first()
        .ok_or_else(|| Error::InvalidShape("host_concat: no tensors".into()))?;
    first.check_dim(dim, "host_concat")?;

    let mut out_shape = first.shape.clone();
    out_shape[dim] = 0;
    for t in tensors {
        if t.dtype != first.dtype {
            return Err(Error::DtypeMismatch {
                expected: first.dtype.to_string(),
                got: t.dtype.to_string(),
            });
        }
        let same_outer = t.ndim() == first.ndim()
            && t.shape
                .iter()
                .zip(&first.shape)
                .enumerate()
                .all(|(d, (a, b))| d == dim || a == b);
        if !same_outer {
            return Err(Error::ShapeMismatch {
                expected: first.shape.clone(),
                got: t.shape.clone(),
            });
        }
        out_shape[dim] += t.shape[dim];
    }

    let (outer, _, inner_bytes) = first.split_at_dim(dim);
    let total: usize = tensors.iter().map(|t| t.data.len()).sum();
    let mut data = Vec::with_capacity(total);
    for o in 0..outer {
        for t in tensors {
            let chunk = t.shape[dim] * inner_bytes;
            data.extend_from_slice(&t.data[o * chunk..(o + 1) * chunk]);
        }
    }

    Ok(HostTensor {
        shape: out_shape,
        dtype: first.dtype,
        data,
    })
}

/// Slice `[start .. start + len)` along `dim`.
///
/// # Errors
/// Returns an error if the range falls outside the tensor.
pub fn host_narrow(
    tensor: &HostTensor,
    dim: usize,
    start: usize,
    len: usize,
) -> Result<HostTensor> {
    tensor.check_dim(dim, "host_narrow")?;
    let (outer, size, inner_bytes) = tensor.split_at_dim(dim);
    if start + len > size {
        return Err(Error::InvalidShape(format!(
            "host_narrow: range {start}..{} exceeds dim {dim} of shape {:?}",
            start + len,
            tensor.shape
        )));
    }

    let row = size * inner_bytes;
    let mut data = Vec::with_capacity(outer * len * inner_bytes);
    for o in 0..outer {
        let base = o * row + start * inner_bytes;
        data.extend_from_slice(&tensor.data[base..base + len * inner_bytes]);
    }

    let mut shape = tensor.shape.clone();
    shape[dim] = len;
    Ok(HostTensor {
        shape,
        dtype: tensor.dtype,
        data,
    })
}

/// Take this rank's equal slice of `dim`.
///
/// A single-rank group returns the tensor unchanged.
///
/// # Errors
/// Returns an error if `dim` is out of range or not evenly divisible by
/// the group size.
pub fn host_split(tensor: &HostTensor, shard: &ShardConfig, dim: usize) -> Result<HostTensor> {
    if shard.world_size == 1 {
        return Ok(tensor.clone());
    }
    tensor.check_dim(dim, "host_split")?;
    let (start, len) = shard.shard_range(tensor.shape[dim])?;
    host_narrow(tensor, dim, start, len)
}

/// Stack equally-shaped tensors along a new leading dimension.
///
/// # Errors
/// Returns an error on an empty input or mismatched shapes/dtypes.
pub fn host_stack(tensors: &[HostTensor]) -> Result<HostTensor> {
    let first = tensors
        .first()
        .ok_or_else(|| Error::InvalidShape("host_stack: no tensors".into()))?;

    let mut data = Vec::with_capacity(first.data.len() * tensors.len());
    for t in tensors {
        if t.dtype != first.dtype {
            return Err(Error::DtypeMismatch {
                expected: first.dtype.to_string(),
                got: t.dtype.to_string(),
            });
        }
        if t.shape != first.shape {
            return Err(Error::ShapeMismatch {
                expected: first.shape.clone(),
                got: t.shape.clone(),
            });
        }
        data.extend_from_slice(&t.data);
    }

    let mut shape = Vec::with_capacity(first.ndim() + 1);
    shape.push(tensors.len());
    shape.extend_from_slice(&first.shape);
    Ok(HostTensor {
        shape,
        dtype: first.dtype,
        data,
    })
}

/// Append zero rows along dim 0 until it has `rows` entries.
///
/// # Errors
/// Returns an error for a 0-d tensor or if `rows` is smaller than the
/// current row count.
pub fn host_pad_rows(tensor: &HostTensor, rows: usize) -> Result<HostTensor> {
    let Some(&current) = tensor.shape.first() else {
        return Err(Error::InvalidShape(
            "host_pad_rows: cannot pad a 0-d tensor".into(),
        ));
    };
    if rows < current {
        return Err(Error::InvalidShape(format!(
            "host_pad_rows: target {rows} rows is smaller than {current}"
        )));
    }

    let row_bytes = tensor.shape[1..].iter().product::<usize>() * tensor.dtype.size_in_bytes();
    let mut data = tensor.data.clone();
    data.resize(rows * row_bytes, 0);

    let mut shape = tensor.shape.clone();
    shape[0] = rows;
    Ok(HostTensor {
        shape,
        dtype: tensor.dtype,
        data,
    })
}

/// Shard a weight by strategy.
///
/// `Column` splits the output dimension (second to last), `Row` the input
/// dimension (last). For a 2D `[out, in]` weight these are rows and
/// columns; for an expert-stacked `[experts, out, in]` weight the leading
/// expert dimension is left alone.
///
/// # Errors
/// Returns an error if the tensor has too few dimensions or the split
/// dimension is not evenly divisible.
pub fn host_shard_tensor(
    tensor: &HostTensor,
    shard: &ShardConfig,
    strategy: ShardStrategy,
) -> Result<HostTensor> {
    let ndim = tensor.ndim();
    match strategy {
        ShardStrategy::Replicate => Ok(tensor.clone()),
        ShardStrategy::Column => {
            if ndim < 2 {
                return Err(Error::InvalidShape(format!(
                    "Column shard requires at least 2 dims, got {:?}",
                    tensor.shape
                )));
            }
            host_split(tensor, shard, ndim - 2)
        }
        ShardStrategy::Row => {
            if ndim < 2 {
                return Err(Error::InvalidShape(format!(
                    "Row shard requires at least 2 dims, got {:?}",
                    tensor.shape
                )));
            }
            host_split(tensor, shard, ndim - 1)
        }
    }
}
