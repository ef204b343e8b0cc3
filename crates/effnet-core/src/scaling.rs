//! Compound scaling: model name to coefficients, and coefficients to a
//! concrete architecture.

use crate::block::{decode_all, BlockArgs};
use crate::error::{Error, Result};
use crate::params::{GlobalParams, GlobalParamsOverrides};
use crate::size::output_size;
use crate::types::SizeSpec;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Name prefix shared by every supported model
pub const MODEL_FAMILY: &str = "efficientnet";

/// Stage template of the baseline network, scaled by the coefficients.
pub const BASE_BLOCKS: [&str; 7] = [
    "r1_k3_s11_e1_i32_o16_se0.25",
    "r2_k3_s22_e6_i16_o24_se0.25",
    "r2_k5_s22_e6_i24_o40_se0.25",
    "r3_k3_s22_e6_i40_o80_se0.25",
    "r3_k5_s11_e6_i80_o112_se0.25",
    "r4_k5_s22_e6_i112_o192_se0.25",
    "r1_k3_s11_e6_i192_o320_se0.25",
];

/// Filters of the stem convolution before width scaling
pub const STEM_FILTERS: usize = 32;
/// Filters of the head convolution before width scaling
pub const HEAD_FILTERS: usize = 1280;

pub const DEFAULT_DEPTH_DIVISOR: usize = 8;
pub const DEFAULT_BATCH_NORM_MOMENTUM: f64 = 0.99;
pub const DEFAULT_BATCH_NORM_EPSILON: f64 = 1e-3;
pub const DEFAULT_DROPOUT_RATE: f64 = 0.2;
pub const DEFAULT_DROP_CONNECT_RATE: f64 = 0.2;
pub const DEFAULT_NUM_CLASSES: usize = 1000;

/// Per-model scaling coefficients.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScalingCoefficients {
    pub width: f64,
    pub depth: f64,
    pub resolution: usize,
    pub dropout: f64,
}

const fn coefficients(width: f64, depth: f64, resolution: usize, dropout: f64) -> ScalingCoefficients {
    ScalingCoefficients {
        width,
        depth,
        resolution,
        dropout,
    }
}

const COEFFICIENT_TABLE: [(&str, ScalingCoefficients); 10] = [
    ("efficientnet-b0", coefficients(1.0, 1.0, 112, 0.2)),
    ("efficientnet-b1", coefficients(1.0, 1.1, 240, 0.2)),
    ("efficientnet-b2", coefficients(1.1, 1.2, 260, 0.3)),
    ("efficientnet-b3", coefficients(1.2, 1.4, 300, 0.3)),
    ("efficientnet-b4", coefficients(1.4, 1.8, 380, 0.4)),
    ("efficientnet-b5", coefficients(1.6, 2.2, 456, 0.4)),
    ("efficientnet-b6", coefficients(1.8, 2.6, 528, 0.5)),
    ("efficientnet-b7", coefficients(2.0, 3.1, 600, 0.5)),
    ("efficientnet-b8", coefficients(2.2, 3.6, 672, 0.5)),
    ("efficientnet-l2", coefficients(4.3, 5.3, 800, 0.5)),
];

/// Coefficients of a named model variant.
pub fn coefficients_for(model_name: &str) -> Result<ScalingCoefficients> {
    COEFFICIENT_TABLE
        .iter()
        .find(|(name, _)| *name == model_name)
        .map(|(_, c)| *c)
        .ok_or_else(|| {
            Error::UnknownModel(format!(
                "{} (expected one of: {})",
                model_name,
                valid_model_names().join(", ")
            ))
        })
}

/// Names of all known model variants, smallest first.
pub fn valid_model_names() -> Vec<&'static str> {
    COEFFICIENT_TABLE.iter().map(|(name, _)| *name).collect()
}

/// Scale a channel count by the width coefficient.
///
/// The result is a multiple of `depth_divisor` (default 8), at least
/// `min_depth` (default the divisor), and never below 90% of the ideal
/// scaled value.
pub fn round_filters(filters: usize, global_params: &GlobalParams) -> usize {
    let multiplier = match global_params.width_coefficient {
        Some(m) if m != 0.0 => m,
        _ => return filters,
    };

    let divisor = global_params
        .depth_divisor
        .filter(|d| *d > 0)
        .unwrap_or(DEFAULT_DEPTH_DIVISOR);
    let min_depth = global_params.min_depth.filter(|m| *m > 0).unwrap_or(divisor);

    let scaled = filters as f64 * multiplier;
    let aligned = (scaled + divisor as f64 / 2.0) as usize / divisor * divisor;
    let mut new_filters = min_depth.max(aligned);
    if (new_filters as f64) < 0.9 * scaled {
        new_filters += divisor;
    }
    new_filters
}

/// Scale a repeat count by the depth coefficient, rounding up.
pub fn round_repeats(repeats: usize, global_params: &GlobalParams) -> usize {
    match global_params.depth_coefficient {
        Some(m) if m != 0.0 => (m * repeats as f64).ceil() as usize,
        _ => repeats,
    }
}

/// Complete description of a network: ordered stages plus global parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Architecture {
    pub blocks: Vec<BlockArgs>,
    pub global_params: GlobalParams,
}

/// One stage after compound scaling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaledStage {
    pub index: usize,
    pub block: BlockArgs,
    pub input_filters: usize,
    pub output_filters: usize,
    pub num_repeat: usize,
    /// Spatial size after the stage, when the input size is declared
    pub output_resolution: Option<[usize; 2]>,
}

impl Architecture {
    /// Stages with filters and repeats scaled, tracking the resolution from
    /// the stride-2 stem onward.
    pub fn stages(&self) -> Result<Vec<ScaledStage>> {
        let params = &self.global_params;
        let mut resolution = output_size(params.image_size.as_ref(), &SizeSpec::Scalar(2))?;

        self.blocks
            .iter()
            .enumerate()
            .map(|(index, block)| {
                resolution = match resolution {
                    Some(hw) => output_size(Some(&SizeSpec::from(hw)), &SizeSpec::Scalar(block.stride))?,
                    None => None,
                };
                Ok(ScaledStage {
                    index,
                    block: block.clone(),
                    input_filters: round_filters(block.input_filters, params),
                    output_filters: round_filters(block.output_filters, params),
                    num_repeat: round_repeats(block.num_repeat, params),
                    output_resolution: resolution,
                })
            })
            .collect()
    }

    /// Total number of MBConv blocks after depth scaling
    pub fn total_blocks(&self) -> usize {
        self.blocks
            .iter()
            .map(|b| round_repeats(b.num_repeat, &self.global_params))
            .sum()
    }

    /// Scaled stem width
    pub fn stem_filters(&self) -> usize {
        round_filters(STEM_FILTERS, &self.global_params)
    }

    /// Scaled head width
    pub fn head_filters(&self) -> usize {
        round_filters(HEAD_FILTERS, &self.global_params)
    }
}

/// Baseline template and default global parameters for the given scaling.
pub fn efficientnet_params(
    width_coefficient: Option<f64>,
    depth_coefficient: Option<f64>,
    image_size: Option<SizeSpec>,
    dropout_rate: f64,
    drop_connect_rate: f64,
    num_classes: usize,
    include_top: bool,
) -> Result<Architecture> {
    let blocks = decode_all(&BASE_BLOCKS)?;

    let global_params = GlobalParams {
        width_coefficient,
        depth_coefficient,
        image_size,
        dropout_rate: Some(dropout_rate),
        num_classes: Some(num_classes),
        batch_norm_momentum: Some(DEFAULT_BATCH_NORM_MOMENTUM),
        batch_norm_epsilon: Some(DEFAULT_BATCH_NORM_EPSILON),
        drop_connect_rate: Some(drop_connect_rate),
        depth_divisor: Some(DEFAULT_DEPTH_DIVISOR),
        min_depth: None,
        include_top: Some(include_top),
    };

    Ok(Architecture {
        blocks,
        global_params,
    })
}

/// Architecture of a named model with optional global overrides.
pub fn build_architecture(
    model_name: &str,
    overrides: Option<&GlobalParamsOverrides>,
) -> Result<Architecture> {
    if !model_name.starts_with(MODEL_FAMILY) {
        return Err(Error::UnknownModel(format!(
            "model name is not pre-defined: {}",
            model_name
        )));
    }

    let c = coefficients_for(model_name)?;
    let mut arch = efficientnet_params(
        Some(c.width),
        Some(c.depth),
        Some(SizeSpec::Scalar(c.resolution)),
        c.dropout,
        DEFAULT_DROP_CONNECT_RATE,
        DEFAULT_NUM_CLASSES,
        true,
    )?;

    if let Some(overrides) = overrides {
        arch.global_params = arch.global_params.with_overrides(overrides);
    }
    arch.global_params.validate()?;

    debug!(
        "Built {}: {} stages, {} blocks, stem {} / head {} filters",
        model_name,
        arch.blocks.len(),
        arch.total_blocks(),
        arch.stem_filters(),
        arch.head_filters()
    );

    Ok(arch)
}
