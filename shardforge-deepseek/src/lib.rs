//! DeepSeek-V1 checkpoint conversion for shardforge
//!
//! Supports DeepSeek-V1 MoE checkpoints (`model_type: "deepseek"`): config
//! translation into the engine's flat config, and per-rank weight
//! conversion for any TP x PP layout with optional expert parallelism.

#![allow(clippy::doc_markdown)]

mod config;
mod convert;
mod model;
mod translate;

pub use config::{DeepSeekConfig, RopeScalingConfig};
pub use convert::{convert_deepseek, pad_vocab, split_qkv_tp, ConvertOptions, ConvertedWeights};
pub use model::SourceModel;
pub use translate::{
    create_engine_config_from_hf, engine_config_from_deepseek, EngineConfig, ParallelismRecord,
    ARCHITECTURE,
};
