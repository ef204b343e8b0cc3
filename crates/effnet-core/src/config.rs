//! Layered configuration: defaults, then a TOML file, then command-line
//! overrides.

use crate::error::{Error, Result};
use crate::params::GlobalParamsOverrides;
use crate::scaling::{build_architecture, Architecture, MODEL_FAMILY};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Model selection plus global parameter overrides
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InspectConfig {
    /// Model name, e.g. `efficientnet-b0`
    pub model_name: String,
    /// Number of input image channels
    pub in_channels: usize,
    /// Replacements applied on top of the model's global parameters
    pub overrides: GlobalParamsOverrides,
    /// Pretrained weights to check against the model
    pub weights: Option<WeightsConfig>,
}

impl Default for InspectConfig {
    fn default() -> Self {
        Self {
            model_name: "efficientnet-b0".to_string(),
            in_channels: 3,
            overrides: GlobalParamsOverrides::default(),
            weights: None,
        }
    }
}

/// Pretrained weight source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightsConfig {
    /// Path to a safetensors file
    pub path: PathBuf,
    /// Whether the final classifier layer is loaded too
    #[serde(default = "default_load_fc")]
    pub load_fc: bool,
}

fn default_load_fc() -> bool {
    true
}

impl InspectConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if !self.model_name.starts_with(MODEL_FAMILY) {
            return Err(Error::Config(format!(
                "model_name must start with '{}', got '{}'",
                MODEL_FAMILY, self.model_name
            )));
        }
        if self.in_channels == 0 {
            return Err(Error::Config("in_channels must be greater than 0".to_string()));
        }
        Ok(())
    }

    /// Apply a later layer of overrides on top of this configuration.
    pub fn apply_overrides(&mut self, model_name: Option<&str>, overrides: &GlobalParamsOverrides) {
        if let Some(name) = model_name {
            self.model_name = name.to_string();
        }
        self.overrides = self.overrides.merged(overrides);
    }

    /// Resolve the configured architecture
    pub fn architecture(&self) -> Result<Architecture> {
        self.validate()?;
        let overrides = (!self.overrides.is_empty()).then_some(&self.overrides);
        build_architecture(&self.model_name, overrides)
    }
}
