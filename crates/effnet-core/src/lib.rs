//! Core EfficientNet architecture logic.
//!
//! This crate has no tensor dependency. It provides:
//! - SAME padding and output size arithmetic ([`size`])
//! - The block-string codec ([`block`])
//! - Global parameters and overrides ([`params`])
//! - Compound scaling and architecture construction ([`scaling`])
//! - Layered configuration and CLI helpers ([`config`], [`cli`])

pub mod error;
pub mod types;
pub mod size;
pub mod block;
pub mod params;
pub mod scaling;
pub mod config;
pub mod cli;

pub use error::{Error, Result};
pub use types::SizeSpec;
pub use size::{dimensions_from_size, output_size, required_padding, same_padding, stride_pair, SamePadding};
pub use block::{decode_all, decode_block, encode_all, encode_block, BlockArgs};
pub use params::{GlobalParams, GlobalParamsOverrides};
pub use scaling::{
    build_architecture, coefficients_for, efficientnet_params, round_filters, round_repeats,
    valid_model_names, Architecture, ScaledStage, ScalingCoefficients,
};
pub use config::{InspectConfig, WeightsConfig};
pub use cli::{load_toml_config, setup_cli_logging};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::block::*;
    pub use crate::error::{Error, Result};
    pub use crate::params::*;
    pub use crate::scaling::*;
    pub use crate::size::*;
    pub use crate::types::*;
}
