//! burn building blocks for EfficientNet.
//!
//! This crate provides:
//! - SAME-padded convolution and max-pooling ([`padding`])
//! - Swish and drop-connect ([`activation`])
//! - The MBConv network built from an architecture ([`model`])
//! - Pretrained weight sources and key checks ([`weights`])

pub mod padding;
pub mod activation;
pub mod model;
pub mod weights;

pub use padding::{zero_pad, Conv2dSame, Conv2dSameConfig, MaxPool2dSame, MaxPool2dSameConfig, PaddingPlan, SamePad2d};
pub use activation::{check_drop_rate, drop_connect, Swish};
pub use model::{parameter_shapes, plan_network, EfficientNet, MBConvBlock, NetworkPlan, PlannedBlock, SqueezeExcite};
pub use weights::{load_pretrained, SafetensorsFile, StateDict, TensorEntry, WeightSource, CLASSIFIER_KEYS};

/// Re-export commonly used types
pub mod prelude {
    pub use super::model::{EfficientNet, PlannedBlock};
    pub use super::padding::{Conv2dSame, Conv2dSameConfig, MaxPool2dSame, MaxPool2dSameConfig};
    pub use super::weights::{load_pretrained, SafetensorsFile, StateDict, WeightSource};
}
