//! Mixture-of-experts parameters shared by config translation and conversion.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// How routed expert scores are renormalized after top-k selection.
///
/// Serialized as the integer code the engine config expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum ExpertScaleNormalizationMode {
    #[default]
    None,
    Renormalize,
    SparseMixer,
    DeviceLimited,
    DeviceLimitedRenorm,
}

impl From<ExpertScaleNormalizationMode> for u8 {
    fn from(mode: ExpertScaleNormalizationMode) -> Self {
        match mode {
            ExpertScaleNormalizationMode::None => 0,
            ExpertScaleNormalizationMode::Renormalize => 1,
            ExpertScaleNormalizationMode::SparseMixer => 2,
            ExpertScaleNormalizationMode::DeviceLimited => 3,
            ExpertScaleNormalizationMode::DeviceLimitedRenorm => 4,
        }
    }
}

impl TryFrom<u8> for ExpertScaleNormalizationMode {
    type Error = String;

    fn try_from(code: u8) -> std::result::Result<Self, Self::Error> {
        match code {
            0 => Ok(Self::None),
            1 => Ok(Self::Renormalize),
            2 => Ok(Self::SparseMixer),
            3 => Ok(Self::DeviceLimited),
            4 => Ok(Self::DeviceLimitedRenorm),
            other => Err(format!("unknown expert normalization mode {other}")),
        }
    }
}

/// MoE block description.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MoeConfig {
    /// Number of routed experts (0 = dense model)
    #[serde(default)]
    pub num_experts: usize,

    /// Experts activated per token
    #[serde(default)]
    pub top_k: usize,

    /// Score renormalization after top-k
    #[serde(default)]
    pub normalization_mode: ExpertScaleNormalizationMode,

    /// Always-active experts alongside the routed ones
    #[serde(default)]
    pub num_shared_experts: usize,

    /// Intermediate size of each routed expert
    #[serde(default)]
    pub moe_intermediate_size: usize,
}

impl MoeConfig {
    /// A single expert is just a dense MLP.
    #[must_use]
    pub fn has_moe(&self) -> bool {
        self.num_experts > 1
    }

    /// Check that expert counts agree with each other.
    ///
    /// # Errors
    /// Returns [`Error::InvalidMoeConfig`] when exactly one of
    /// `num_experts`/`top_k` is zero, when `top_k > num_experts`, or when
    /// shared experts are configured without routed experts.
    pub fn validate(&self) -> Result<()> {
        if (self.num_experts == 0) != (self.top_k == 0) {
            return Err(Error::InvalidMoeConfig(format!(
                "num_experts ({}) and top_k ({}) must both be zero or both be set",
                self.num_experts, self.top_k
            )));
        }
        if self.top_k > self.num_experts {
            return Err(Error::InvalidMoeConfig(format!(
                "top_k ({}) exceeds num_experts ({})",
                self.top_k, self.num_experts
            )));
        }
        if self.num_shared_experts > 0 && self.num_experts == 0 {
            return Err(Error::InvalidMoeConfig(format!(
                "{} shared experts configured without routed experts",
                self.num_shared_experts
            )));
        }
        Ok(())
    }
}
