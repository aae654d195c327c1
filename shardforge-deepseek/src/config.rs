//! DeepSeek-V1 source model configuration

#![allow(clippy::doc_markdown)]

use std::path::Path;

use serde::{Deserialize, Serialize};

use shardforge::Result;

/// RoPE scaling configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RopeScalingConfig {
    /// Scaling type: `"linear"` or `"dynamic"`
    #[serde(rename = "type", alias = "rope_type")]
    pub rope_type: String,

    /// Extension factor
    pub factor: f32,
}

/// Configuration for DeepSeek-V1 (`model_type: "deepseek"`) MoE models
///
/// Parsed from the model's `config.json` file.
#[derive(Debug, Clone, Deserialize)]
pub struct DeepSeekConfig {
    /// Model architecture type (`"deepseek"`)
    #[serde(default = "default_model_type")]
    pub model_type: String,

    /// Vocabulary size
    pub vocab_size: usize,

    /// Hidden dimension size
    pub hidden_size: usize,

    /// Intermediate size for the dense MLP
    pub intermediate_size: usize,

    /// Number of transformer layers
    pub num_hidden_layers: usize,

    /// Number of attention heads
    pub num_attention_heads: usize,

    /// Number of key-value heads
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,

    /// Maximum sequence length
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,

    // --- MoE ---
    /// Number of routed experts (absent for dense checkpoints)
    #[serde(default)]
    pub n_routed_experts: Option<usize>,

    /// Number of experts activated per token
    #[serde(default)]
    pub num_experts_per_tok: Option<usize>,

    /// Number of shared experts
    #[serde(default)]
    pub n_shared_experts: Option<usize>,

    /// Intermediate size for each routed expert
    #[serde(default)]
    pub moe_intermediate_size: Option<usize>,

    // --- RoPE ---
    /// Base frequency for RoPE
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f32,

    /// RoPE scaling configuration
    #[serde(default)]
    pub rope_scaling: Option<RopeScalingConfig>,

    // --- Misc ---
    /// RMS norm epsilon
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f32,

    /// Source activation; the engine always runs the gated `swiglu` form
    #[serde(default = "default_hidden_act")]
    pub hidden_act: String,

    /// Tie word embeddings with lm_head
    #[serde(default)]
    pub tie_word_embeddings: bool,
}

fn default_model_type() -> String {
    "deepseek".to_string()
}

fn default_max_position_embeddings() -> usize {
    4096
}

fn default_rope_theta() -> f32 {
    10000.0
}

fn default_rms_norm_eps() -> f32 {
    1e-6
}

fn default_hidden_act() -> String {
    "silu".to_string()
}

impl DeepSeekConfig {
    /// Load configuration from a JSON file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Load `config.json` from a model directory
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed
    pub fn from_pretrained(model_dir: impl AsRef<Path>) -> Result<Self> {
        Self::from_file(model_dir.as_ref().join("config.json"))
    }

    /// Number of key-value heads
    #[must_use]
    pub fn num_kv_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    /// Intermediate size for MoE routed experts
    #[must_use]
    pub fn moe_expert_intermediate_size(&self) -> usize {
        self.moe_intermediate_size.unwrap_or(self.intermediate_size)
    }
}
