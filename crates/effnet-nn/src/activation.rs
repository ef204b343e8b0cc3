//! Swish activation and drop-connect (stochastic depth).

use burn::{
    module::Module,
    tensor::{activation::sigmoid, backend::Backend, Distribution, Tensor},
};
use effnet_core::{Error, Result};

/// Swish: `x * sigmoid(x)`
#[derive(Module, Clone, Debug, Default)]
pub struct Swish;

impl Swish {
    pub fn new() -> Self {
        Self
    }

    pub fn forward<B: Backend, const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        x.clone() * sigmoid(x)
    }
}

/// Probability of dropping a sample's residual branch, checked to lie in
/// `[0, 1]`.
pub fn check_drop_rate(p: f64) -> Result<f64> {
    if (0.0..=1.0).contains(&p) {
        Ok(p)
    } else {
        Err(Error::InvalidArgument(format!(
            "drop connect rate must be in range [0, 1], got {}",
            p
        )))
    }
}

/// Randomly zero whole samples of a residual branch and rescale the rest.
///
/// Only active when the backend tracks gradients (training); otherwise the
/// input is returned unchanged. `p` must already be validated.
pub fn drop_connect<B: Backend>(x: Tensor<B, 4>, p: f64) -> Tensor<B, 4> {
    if !B::ad_enabled() || p == 0.0 {
        return x;
    }

    if p >= 1.0 {
        return x.zeros_like();
    }

    let keep_prob = 1.0 - p;
    let [batch, _, _, _] = x.dims();
    let mask = Tensor::<B, 4>::random([batch, 1, 1, 1], Distribution::Bernoulli(keep_prob), &x.device());

    x.div_scalar(keep_prob) * mask
}
