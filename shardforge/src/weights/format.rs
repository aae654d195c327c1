//! Read-only access to a checkpoint's named parameters.
//!
//! [`ParameterSource`] is implemented by file-format parsers
//! ([`SafeTensorsLoader`](super::SafeTensorsLoader)) and by the in-memory
//! [`HostParameters`]. Methods return host-side buffers; nothing is ever
//! written back into the source.

use std::collections::HashMap;

use crate::dtype::DType;
use crate::shard::{ShardConfig, ShardStrategy};
use crate::{Error, Result};

use super::host::{host_cast, host_shard_tensor, HostTensor};

/// A named-parameter mapping from dotted name to tensor.
pub trait ParameterSource {
    /// Load a tensor in its stored dtype.
    ///
    /// # Errors
    /// Returns an error if the tensor is not found or its dtype is
    /// unsupported.
    fn load_native(&self, name: &str) -> Result<HostTensor>;

    /// Load a tensor converted to `dtype`.
    ///
    /// # Errors
    /// Returns an error if the tensor is not found.
    fn load(&self, name: &str, dtype: DType) -> Result<HostTensor> {
        let tensor = self.load_native(name)?;
        if tensor.dtype == dtype {
            Ok(tensor)
        } else {
            Ok(host_cast(&tensor, dtype))
        }
    }

    /// Load a tensor converted to `dtype`, then take this rank's slice.
    ///
    /// # Errors
    /// Returns an error if loading or slicing fails.
    fn load_sharded(
        &self,
        name: &str,
        dtype: DType,
        shard: &ShardConfig,
        strategy: ShardStrategy,
    ) -> Result<HostTensor> {
        let full = self.load(name, dtype)?;
        host_shard_tensor(&full, shard, strategy)
    }

    /// Check if a tensor exists.
    fn contains(&self, name: &str) -> bool;
}

/// Parameters already resident in host memory.
#[derive(Debug, Clone, Default)]
pub struct HostParameters {
    tensors: HashMap<String, HostTensor>,
}

impl HostParameters {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a parameter.
    pub fn insert(&mut self, name: impl Into<String>, tensor: HostTensor) {
        self.tensors.insert(name.into(), tensor);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    fn get(&self, name: &str) -> Result<&HostTensor> {
        self.tensors
            .get(name)
            .ok_or_else(|| Error::WeightNotFound(name.to_string()))
    }
}

impl FromIterator<(String, HostTensor)> for HostParameters {
    fn from_iter<I: IntoIterator<Item = (String, HostTensor)>>(iter: I) -> Self {
        Self {
            tensors: iter.into_iter().collect(),
        }
    }
}

impl ParameterSource for HostParameters {
    fn load_native(&self, name: &str) -> Result<HostTensor> {
        self.get(name).cloned()
    }

    fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> HostParameters {
        let mut p = HostParameters::new();
        p.insert(
            "model.layers.0.mlp.up_proj.weight",
            HostTensor::from_slice(&[4, 2], &[1.0_f32, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0])
                .unwrap(),
        );
        p
    }

    #[test]
    fn test_load_missing_is_weight_not_found() {
        let err = params().load_native("lm_head.weight").unwrap_err();
        assert!(matches!(err, Error::WeightNotFound(name) if name == "lm_head.weight"));
    }

    #[test]
    fn test_load_casts() {
        let p = params();
        let t = p.load("model.layers.0.mlp.up_proj.weight", DType::F16).unwrap();
        assert_eq!(t.dtype, DType::F16);
        assert_eq!(t.to_f32_vec(), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);
        // The stored tensor is left untouched.
        assert_eq!(
            p.load_native("model.layers.0.mlp.up_proj.weight").unwrap().dtype,
            DType::F32
        );
    }

    #[test]
    fn test_load_sharded() {
        let p = params();
        let t = p
            .load_sharded(
                "model.layers.0.mlp.up_proj.weight",
                DType::F32,
                &ShardConfig {
                    rank: 1,
                    world_size: 2,
                },
                ShardStrategy::Column,
            )
            .unwrap();
        assert_eq!(t.shape, vec![2, 2]);
        assert_eq!(t.as_f32_slice(), &[5.0, 6.0, 7.0, 8.0]);
    }

    #[test]
    fn test_metadata() {
        let p = params();
        assert_eq!(p.len(), 1);
        assert!(!p.is_empty());
        assert!(p.contains("model.layers.0.mlp.up_proj.weight"));
        assert!(!p.contains("missing"));
    }
}
