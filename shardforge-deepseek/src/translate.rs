//! Translation of a DeepSeek-V1 source config into the flat engine config.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use shardforge::{DType, Error, ExpertScaleNormalizationMode, Mapping, MoeConfig, Result};

use crate::config::{DeepSeekConfig, RopeScalingConfig};

/// Architecture name the engine dispatches on.
pub const ARCHITECTURE: &str = "DeepseekForCausalLM";

/// Parallel layout recorded alongside the converted weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParallelismRecord {
    pub world_size: usize,
    pub tp_size: usize,
    pub pp_size: usize,
    pub moe_tp_size: usize,
    pub moe_ep_size: usize,
}

impl From<&Mapping> for ParallelismRecord {
    fn from(mapping: &Mapping) -> Self {
        Self {
            world_size: mapping.tp_size() * mapping.pp_size(),
            tp_size: mapping.tp_size(),
            pp_size: mapping.pp_size(),
            moe_tp_size: mapping.moe_tp_size(),
            moe_ep_size: mapping.moe_ep_size(),
        }
    }
}

/// Flat engine configuration produced for one conversion run.
///
/// Keys that overrides add beyond the known fields are kept in `extra` and
/// written back out unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub architecture: String,
    pub dtype: String,
    pub logits_type: String,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_key_value_heads: usize,
    pub vocab_size: usize,
    pub position_embedding_type: String,
    pub max_position_embeddings: usize,
    pub hidden_act: String,
    pub rotary_base: f32,
    pub norm_epsilon: f32,
    pub rotary_scaling: Option<RopeScalingConfig>,
    pub moe: MoeConfig,
    pub mapping: ParallelismRecord,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl EngineConfig {
    /// Replace top-level keys with `overrides`; the override wins on any
    /// collision.
    ///
    /// # Errors
    /// Returns an error if an override gives a known key a value of the
    /// wrong type.
    pub fn with_overrides(self, overrides: &Map<String, Value>) -> Result<Self> {
        if overrides.is_empty() {
            return Ok(self);
        }
        let Value::Object(mut fields) = serde_json::to_value(self)? else {
            return Err(Error::Other("engine config did not serialize to an object".into()));
        };
        for (key, value) in overrides {
            fields.insert(key.clone(), value.clone());
        }
        Ok(serde_json::from_value(Value::Object(fields))?)
    }
}

/// Build the engine config from the `config.json` in `model_dir`.
///
/// Only the JSON file is read; nothing from the model directory is
/// executed.
///
/// # Errors
/// Returns an error if the config can't be read, an override has the wrong
/// type, or the MoE parameters are inconsistent.
pub fn create_engine_config_from_hf(
    model_dir: impl AsRef<Path>,
    dtype: DType,
    mapping: &Mapping,
    overrides: &Map<String, Value>,
) -> Result<EngineConfig> {
    let hf_config = DeepSeekConfig::from_pretrained(model_dir)?;
    engine_config_from_deepseek(&hf_config, dtype, mapping, overrides)
}

/// Build the engine config from an already-parsed source config.
///
/// # Errors
/// Returns an error if an override has the wrong type or the MoE
/// parameters are inconsistent.
pub fn engine_config_from_deepseek(
    hf_config: &DeepSeekConfig,
    dtype: DType,
    mapping: &Mapping,
    overrides: &Map<String, Value>,
) -> Result<EngineConfig> {
    if hf_config.hidden_act != "silu" {
        tracing::warn!(
            hidden_act = %hf_config.hidden_act,
            "source activation ignored, MoE kernels run gated swiglu"
        );
    }

    let config = EngineConfig {
        architecture: ARCHITECTURE.to_string(),
        dtype: dtype.label().to_string(),
        logits_type: DType::F32.label().to_string(),
        num_hidden_layers: hf_config.num_hidden_layers,
        num_attention_heads: hf_config.num_attention_heads,
        hidden_size: hf_config.hidden_size,
        intermediate_size: hf_config.intermediate_size,
        num_key_value_heads: hf_config.num_kv_heads(),
        vocab_size: hf_config.vocab_size,
        position_embedding_type: "rope_gpt_neox".to_string(),
        max_position_embeddings: hf_config.max_position_embeddings,
        // The MoE plugin only implements the gated form.
        hidden_act: "swiglu".to_string(),
        rotary_base: hf_config.rope_theta,
        norm_epsilon: hf_config.rms_norm_eps,
        rotary_scaling: hf_config.rope_scaling.clone(),
        moe: MoeConfig {
            num_experts: hf_config.n_routed_experts.unwrap_or(0),
            top_k: hf_config.num_experts_per_tok.unwrap_or(0),
            normalization_mode: ExpertScaleNormalizationMode::None,
            num_shared_experts: hf_config.n_shared_experts.unwrap_or(0),
            moe_intermediate_size: hf_config.moe_expert_intermediate_size(),
        },
        mapping: ParallelismRecord::from(mapping),
        extra: Map::new(),
    }
    .with_overrides(overrides)?;

    config.moe.validate()?;
    Ok(config)
}
