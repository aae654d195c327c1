//! Parallel mapping: where one rank sits in the TP x PP grid.
//!
//! The global rank is laid out TP-major inside each pipeline stage:
//!
//! ```text
//!            tp_rank 0   tp_rank 1
//! pp_rank 0   rank 0      rank 1     layers 0..n/2
//! pp_rank 1   rank 2      rank 3     layers n/2..n
//! ```
//!
//! Inside the TP group, MoE weights may additionally be split across experts
//! (EP) and within experts (MoE TP), with `moe_tp_size * moe_ep_size ==
//! tp_size`.

use std::ops::Range;

use crate::shard::ShardConfig;
use crate::{Error, Result};

/// One rank's view of the tensor/pipeline/expert parallel layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    rank: usize,
    tp_size: usize,
    pp_size: usize,
    moe_tp_size: usize,
    moe_ep_size: usize,
}

impl Default for Mapping {
    fn default() -> Self {
        Self::single()
    }
}

impl Mapping {
    /// Build a mapping for global `rank` with MoE TP defaulting to the full
    /// TP group and no expert parallelism.
    ///
    /// # Errors
    /// Returns an error if a size is zero or `rank` is outside the world.
    pub fn new(rank: usize, tp_size: usize, pp_size: usize) -> Result<Self> {
        if tp_size == 0 || pp_size == 0 {
            return Err(Error::InvalidMapping(format!(
                "tp_size ({tp_size}) and pp_size ({pp_size}) must be positive"
            )));
        }
        let world_size = tp_size * pp_size;
        if rank >= world_size {
            return Err(Error::InvalidMapping(format!(
                "rank {rank} out of range (world_size={world_size})"
            )));
        }
        Ok(Self {
            rank,
            tp_size,
            pp_size,
            moe_tp_size: tp_size,
            moe_ep_size: 1,
        })
    }

    /// Single-rank mapping: no parallelism of any kind.
    #[must_use]
    pub const fn single() -> Self {
        Self {
            rank: 0,
            tp_size: 1,
            pp_size: 1,
            moe_tp_size: 1,
            moe_ep_size: 1,
        }
    }

    /// Set how the TP group is divided for MoE weights.
    ///
    /// Either size may be omitted and is then derived from the other; with
    /// both omitted, experts are split with plain TP.
    ///
    /// # Errors
    /// Returns an error if the sizes don't multiply to `tp_size`.
    pub fn with_moe_parallelism(
        mut self,
        moe_tp_size: Option<usize>,
        moe_ep_size: Option<usize>,
    ) -> Result<Self> {
        let tp = self.tp_size;
        let (moe_tp, moe_ep) = match (moe_tp_size, moe_ep_size) {
            (None, None) => (tp, 1),
            (Some(t), None) if t > 0 => (t, tp / t),
            (None, Some(e)) if e > 0 => (tp / e, e),
            (Some(t), Some(e)) => (t, e),
            (t, e) => {
                return Err(Error::InvalidMapping(format!(
                    "MoE sizes must be positive, got moe_tp={t:?} moe_ep={e:?}"
                )))
            }
        };
        if moe_tp * moe_ep != tp {
            return Err(Error::InvalidMapping(format!(
                "moe_tp_size ({moe_tp}) * moe_ep_size ({moe_ep}) must equal tp_size ({tp})"
            )));
        }
        self.moe_tp_size = moe_tp;
        self.moe_ep_size = moe_ep;
        Ok(self)
    }

    /// Same layout, seen from another global rank.
    ///
    /// # Errors
    /// Returns an error if `rank` is outside the world.
    pub fn for_rank(self, rank: usize) -> Result<Self> {
        if rank >= self.world_size() {
            return Err(Error::InvalidMapping(format!(
                "rank {rank} out of range (world_size={})",
                self.world_size()
            )));
        }
        Ok(Self { rank, ..self })
    }

    #[must_use]
    pub const fn rank(&self) -> usize {
        self.rank
    }

    #[must_use]
    pub const fn world_size(&self) -> usize {
        self.tp_size * self.pp_size
    }

    #[must_use]
    pub const fn tp_size(&self) -> usize {
        self.tp_size
    }

    #[must_use]
    pub const fn tp_rank(&self) -> usize {
        self.rank % self.tp_size
    }

    #[must_use]
    pub const fn pp_size(&self) -> usize {
        self.pp_size
    }

    #[must_use]
    pub const fn pp_rank(&self) -> usize {
        self.rank / self.tp_size
    }

    #[must_use]
    pub const fn moe_tp_size(&self) -> usize {
        self.moe_tp_size
    }

    #[must_use]
    pub const fn moe_tp_rank(&self) -> usize {
        self.tp_rank() / self.moe_ep_size
    }

    #[must_use]
    pub const fn moe_ep_size(&self) -> usize {
        self.moe_ep_size
    }

    #[must_use]
    pub const fn moe_ep_rank(&self) -> usize {
        self.tp_rank() % self.moe_ep_size
    }

    /// TP group position as a [`ShardConfig`].
    #[must_use]
    pub const fn tp_shard(&self) -> ShardConfig {
        ShardConfig {
            rank: self.tp_rank(),
            world_size: self.tp_size,
        }
    }

    /// MoE TP group position as a [`ShardConfig`].
    #[must_use]
    pub const fn moe_tp_shard(&self) -> ShardConfig {
        ShardConfig {
            rank: self.moe_tp_rank(),
            world_size: self.moe_tp_size,
        }
    }

    #[must_use]
    pub const fn has_moe_tp(&self) -> bool {
        self.moe_tp_size > 1
    }

    #[must_use]
    pub const fn has_moe_ep(&self) -> bool {
        self.moe_ep_size > 1
    }

    #[must_use]
    pub const fn is_first_pp_rank(&self) -> bool {
        self.pp_rank() == 0
    }

    #[must_use]
    pub const fn is_last_pp_rank(&self) -> bool {
        self.pp_rank() == self.pp_size - 1
    }

    /// Global layer indices owned by this pipeline stage.
    ///
    /// Layers are split into contiguous blocks; when `num_layers` isn't
    /// divisible by `pp_size`, earlier stages take one extra layer.
    #[must_use]
    pub fn pp_layers(&self, num_layers: usize) -> Range<usize> {
        let stage = self.pp_rank();
        let base = num_layers / self.pp_size;
        let extra = num_layers % self.pp_size;

        let len = if stage < extra { base + 1 } else { base };
        let start = stage * base + stage.min(extra);
        start..start + len
    }

    /// Expert indices owned by this rank's EP slot, in ascending order.
    ///
    /// # Errors
    /// Returns an error if `num_experts` isn't divisible by `moe_ep_size`.
    pub fn ep_experts(&self, num_experts: usize) -> Result<Vec<usize>> {
        if num_experts % self.moe_ep_size != 0 {
            return Err(Error::InvalidMapping(format!(
                "{num_experts} experts cannot be split evenly across moe_ep_size {}",
                self.moe_ep_size
            )));
        }
        let per_rank = num_experts / self.moe_ep_size;
        let start = self.moe_ep_rank() * per_rank;
        Ok((start..start + per_rank).collect())
    }
}

/// Round `vocab_size` up to the next multiple of `tp_size`.
#[must_use]
pub const fn pad_vocab_size(vocab_size: usize, tp_size: usize) -> usize {
    vocab_size.div_ceil(tp_size) * tp_size
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single() {
        let m = Mapping::single();
        assert_eq!(m.world_size(), 1);
        assert!(m.is_first_pp_rank());
        assert!(m.is_last_pp_rank());
        assert!(!m.has_moe_tp());
        assert!(!m.has_moe_ep());
        assert_eq!(m.pp_layers(30), 0..30);
    }

    #[test]
    fn test_rank_layout() {
        let m = Mapping::new(5, 2, 4).unwrap();
        assert_eq!(m.world_size(), 8);
        assert_eq!(m.tp_rank(), 1);
        assert_eq!(m.pp_rank(), 2);
        assert!(!m.is_first_pp_rank());
        assert!(!m.is_last_pp_rank());
        assert_eq!(
            m.tp_shard(),
            ShardConfig {
                rank: 1,
                world_size: 2
            }
        );
        assert!(m.for_rank(7).unwrap().is_last_pp_rank());
        assert!(m.for_rank(8).is_err());
    }

    #[test]
    fn test_invalid_sizes() {
        assert!(Mapping::new(0, 0, 1).is_err());
        assert!(Mapping::new(4, 2, 2).is_err());
    }

    #[test]
    fn test_moe_defaults_to_tp() {
        let m = Mapping::new(1, 4, 1).unwrap();
        assert_eq!(m.moe_tp_size(), 4);
        assert_eq!(m.moe_ep_size(), 1);
        assert!(m.has_moe_tp());
        assert_eq!(m.moe_tp_shard(), m.tp_shard());
    }

    #[test]
    fn test_moe_ep_layout() {
        let m = Mapping::new(3, 4, 1)
            .unwrap()
            .with_moe_parallelism(None, Some(2))
            .unwrap();
        assert_eq!(m.moe_tp_size(), 2);
        assert_eq!(m.moe_ep_rank(), 1);
        assert_eq!(m.moe_tp_rank(), 1);
        assert!(m.has_moe_ep());
        assert_eq!(m.ep_experts(8).unwrap(), vec![4, 5, 6, 7]);
        assert!(m.ep_experts(7).is_err());
    }

    #[test]
    fn test_moe_sizes_must_multiply_to_tp() {
        let m = Mapping::new(0, 4, 1).unwrap();
        assert!(m.with_moe_parallelism(Some(2), Some(4)).is_err());
        assert!(m.with_moe_parallelism(Some(0), None).is_err());
        let ep_only = m.with_moe_parallelism(Some(1), None).unwrap();
        assert_eq!(ep_only.moe_ep_size(), 4);
    }

    #[test]
    fn test_pp_layers_even() {
        let layers: Vec<_> = (0..4)
            .map(|pp| Mapping::new(pp, 1, 4).unwrap().pp_layers(28))
            .collect();
        assert_eq!(layers, vec![0..7, 7..14, 14..21, 21..28]);
    }

    #[test]
    fn test_pp_layers_uneven() {
        let layers: Vec<_> = (0..3)
            .map(|pp| Mapping::new(pp * 2, 2, 3).unwrap().pp_layers(8))
            .collect();
        assert_eq!(layers, vec![0..3, 3..6, 6..8]);
    }

    #[test]
    fn test_pad_vocab_size() {
        assert_eq!(pad_vocab_size(102_400, 8), 102_400);
        assert_eq!(pad_vocab_size(102_401, 8), 102_408);
        assert_eq!(pad_vocab_size(7, 2), 8);
        assert_eq!(pad_vocab_size(7, 1), 7);
    }
}
