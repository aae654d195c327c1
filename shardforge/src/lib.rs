//! shardforge: checkpoint conversion for tensor/pipeline-parallel engines
//!
//! This crate provides the model-independent pieces: host tensors and the
//! reshaping ops conversion needs, the parallel [`Mapping`], MoE parameters,
//! and SafeTensors IO. Model families live in separate crates.

pub mod dtype;
pub mod error;
pub mod mapping;
pub mod moe;
pub mod shard;
pub mod weights;

pub use dtype::DType;
pub use error::{Error, Result};
pub use mapping::{pad_vocab_size, Mapping};
pub use moe::{ExpertScaleNormalizationMode, MoeConfig};
pub use shard::{shard_strategy_for_weight, ShardConfig, ShardStrategy};
pub use weights::{HostParameters, HostTensor, ParameterSource, SafeTensorsLoader};
