//! A loaded source checkpoint: parsed config plus named parameters.

use std::path::Path;

use shardforge::{ParameterSource, Result, SafeTensorsLoader};

use crate::DeepSeekConfig;

/// A DeepSeek-V1 checkpoint ready to be converted.
///
/// Parameters default to a memory-mapped SafeTensors checkpoint; tests and
/// callers that already hold tensors in memory can supply any
/// [`ParameterSource`].
pub struct SourceModel<P = SafeTensorsLoader> {
    config: DeepSeekConfig,
    params: P,
}

impl SourceModel<SafeTensorsLoader> {
    /// Load a checkpoint from a directory containing SafeTensors files and
    /// `config.json`
    ///
    /// # Errors
    /// Returns an error if the config or any SafeTensors file fails to load
    pub fn from_pretrained(model_path: impl AsRef<Path>) -> Result<Self> {
        let model_path = model_path.as_ref();
        let config = DeepSeekConfig::from_pretrained(model_path)?;
        let params = SafeTensorsLoader::from_directory(model_path)?;
        tracing::info!(
            path = %model_path.display(),
            layers = config.num_hidden_layers,
            experts = config.n_routed_experts.unwrap_or(0),
            "loaded source checkpoint"
        );
        Ok(Self { config, params })
    }
}

impl<P: ParameterSource> SourceModel<P> {
    /// Wrap an already-loaded parameter source.
    pub fn new(config: DeepSeekConfig, params: P) -> Self {
        Self { config, params }
    }

    /// Get the source configuration
    #[must_use]
    pub fn config(&self) -> &DeepSeekConfig {
        &self.config
    }

    /// Get the named parameters
    #[must_use]
    pub fn params(&self) -> &P {
        &self.params
    }
}
