//! Tensor parallelism slicing types
//!
//! Describes one rank's position in a split group and how a specific
//! weight is sliced across that group.

use crate::{Error, Result};

/// Describes this rank's position in a split group (TP or MoE TP).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardConfig {
    /// This rank (`0..world_size`)
    pub rank: usize,
    /// Total number of ranks in the group
    pub world_size: usize,
}

impl ShardConfig {
    /// Compute the shard range for a dimension of size `dim`.
    ///
    /// Returns `(start, shard_size)` where the shard covers
    /// `[start .. start + shard_size)`.
    ///
    /// # Errors
    /// Returns an error if `dim` is not evenly divisible by `world_size`.
    pub fn shard_range(&self, dim: usize) -> Result<(usize, usize)> {
        if self.world_size == 0 || dim % self.world_size != 0 {
            return Err(Error::InvalidShape(format!(
                "Dimension {dim} is not evenly divisible by world_size {}",
                self.world_size
            )));
        }
        let shard_size = dim / self.world_size;
        let start = self.rank * shard_size;
        Ok((start, shard_size))
    }
}

/// How a specific weight tensor should be sliced during conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardStrategy {
    /// Replicate the full tensor on every rank (norms, router gate).
    Replicate,
    /// Column-parallel: split along the output dimension.
    /// Used for: `gate_proj`, `up_proj`, `lm_head`.
    Column,
    /// Row-parallel: split along the input dimension.
    /// Used for: `o_proj`, `down_proj`.
    Row,
}

/// Determine the shard strategy for a source weight by its name.
///
/// - Column-parallel (split output dim): `gate_proj`, `up_proj`, for dense
///   MLPs, routed experts, and shared experts alike
/// - Row-parallel (split input dim): `o_proj`, `down_proj`
/// - Replicate: norms, embeddings, router gate, everything else
///
/// Q/K/V projections are fused and split as one tensor by the converter and
/// are not covered here.
#[must_use]
pub fn shard_strategy_for_weight(name: &str) -> ShardStrategy {
    if name.ends_with("gate_proj.weight") || name.ends_with("up_proj.weight") {
        return ShardStrategy::Column;
    }

    if name.ends_with("o_proj.weight") || name.ends_with("down_proj.weight") {
        return ShardStrategy::Row;
    }

    ShardStrategy::Replicate
}
