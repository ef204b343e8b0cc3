//! TensorFlow-style "SAME" padding for convolution and max-pooling.
//!
//! Two strategies share one type:
//! - dynamic: padding is recomputed from the runtime input size on every
//!   call, so any input size works;
//! - static: padding is computed once from a declared image size and frozen
//!   as a zero-pad (or a no-op when none is needed). Cheaper per call, but
//!   inputs of any other size get the wrong padding.
//!
//! For an input matching the declared size both produce identical output.

use burn::{
    config::Config,
    module::{Ignored, Module},
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        PaddingConfig2d,
    },
    tensor::{backend::Backend, Tensor},
};
use effnet_core::{dimensions_from_size, required_padding, same_padding, Error, SamePadding, SizeSpec};

/// How a [`SamePad2d`] decides its padding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaddingPlan {
    /// Recompute from the input on every call
    Dynamic,
    /// Frozen padding computed from the declared image size
    ZeroPad(SamePadding),
    /// Declared image size needs no padding
    Identity,
}

impl PaddingPlan {
    /// Pick the strategy: dynamic without a declared image size, frozen
    /// otherwise.
    pub fn select(
        image_size: Option<&SizeSpec>,
        kernel: [usize; 2],
        stride: [usize; 2],
        dilation: [usize; 2],
    ) -> effnet_core::Result<Self> {
        let Some(image_size) = image_size else {
            return Ok(PaddingPlan::Dynamic);
        };

        let (height, width) = dimensions_from_size(image_size)?;
        let padding = same_padding([height, width], kernel, stride, dilation)?;
        if padding.is_zero() {
            Ok(PaddingPlan::Identity)
        } else {
            Ok(PaddingPlan::ZeroPad(padding))
        }
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self, PaddingPlan::Dynamic)
    }
}

/// Zero-pad the two trailing (spatial) dimensions.
pub fn zero_pad<B: Backend>(x: Tensor<B, 4>, padding: SamePadding) -> Tensor<B, 4> {
    if padding.is_zero() {
        return x;
    }

    let [batch, channels, height, width] = x.dims();
    let device = x.device();
    let padded_h = height + padding.top + padding.bottom;
    let padded_w = width + padding.left + padding.right;

    Tensor::zeros([batch, channels, padded_h, padded_w], &device).slice_assign(
        [
            0..batch,
            0..channels,
            padding.top..padding.top + height,
            padding.left..padding.left + width,
        ],
        x,
    )
}

/// SAME padding for one windowed layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamePad2d {
    kernel: [usize; 2],
    stride: [usize; 2],
    dilation: [usize; 2],
    plan: PaddingPlan,
}

impl SamePad2d {
    pub fn new(
        kernel: [usize; 2],
        stride: [usize; 2],
        dilation: [usize; 2],
        image_size: Option<&SizeSpec>,
    ) -> effnet_core::Result<Self> {
        if kernel.contains(&0) || stride.contains(&0) || dilation.contains(&0) {
            return Err(Error::InvalidArgument(format!(
                "kernel {:?}, stride {:?} and dilation {:?} must be positive",
                kernel, stride, dilation
            )));
        }

        let plan = PaddingPlan::select(image_size, kernel, stride, dilation)?;
        Ok(Self {
            kernel,
            stride,
            dilation,
            plan,
        })
    }

    pub fn plan(&self) -> PaddingPlan {
        self.plan
    }

    /// Same window parameters, re-planned for a new declared image size.
    pub fn replanned(&self, image_size: Option<&SizeSpec>) -> effnet_core::Result<Self> {
        Self::new(self.kernel, self.stride, self.dilation, image_size)
    }

    /// Padding this layer applies to an input of `[height, width]`.
    pub fn padding_for(&self, input: [usize; 2]) -> SamePadding {
        match self.plan {
            PaddingPlan::Dynamic => {
                let pad_h = self.axis_padding(input[0], 0);
                let pad_w = self.axis_padding(input[1], 1);
                SamePadding::split(pad_h, pad_w)
            }
            PaddingPlan::ZeroPad(padding) => padding,
            PaddingPlan::Identity => SamePadding::default(),
        }
    }

    fn axis_padding(&self, input: usize, axis: usize) -> usize {
        let output = input.div_ceil(self.stride[axis]);
        required_padding(input, output, self.stride[axis], self.kernel[axis], self.dilation[axis])
    }

    pub fn forward<B: Backend>(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        match self.plan {
            PaddingPlan::Identity => x,
            PaddingPlan::ZeroPad(padding) => zero_pad(x, padding),
            PaddingPlan::Dynamic => {
                let [_, _, height, width] = x.dims();
                let padding = self.padding_for([height, width]);
                zero_pad(x, padding)
            }
        }
    }
}

/// Configuration for [`Conv2dSame`]
#[derive(Config, Debug)]
pub struct Conv2dSameConfig {
    /// Input and output channels
    pub channels: [usize; 2],
    /// Kernel height and width
    pub kernel_size: [usize; 2],
    #[config(default = "[1, 1]")]
    pub stride: [usize; 2],
    #[config(default = "[1, 1]")]
    pub dilation: [usize; 2],
    #[config(default = "1")]
    pub groups: usize,
    #[config(default = "true")]
    pub bias: bool,
    /// Declared input size; `None` selects dynamic padding
    pub image_size: Option<SizeSpec>,
}

impl Conv2dSameConfig {
    /// Square kernel and stride, bias-free, as used throughout EfficientNet
    pub fn square(in_channels: usize, out_channels: usize, kernel: usize, stride: usize) -> Self {
        Self::new([in_channels, out_channels], [kernel, kernel])
            .with_stride([stride, stride])
            .with_bias(false)
    }

    /// Same configuration with a declared input size
    pub fn for_image(self, image_size: Option<SizeSpec>) -> Self {
        Self { image_size, ..self }
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> effnet_core::Result<Conv2dSame<B>> {
        let [in_channels, out_channels] = self.channels;
        if self.groups == 0 || in_channels % self.groups != 0 || out_channels % self.groups != 0 {
            return Err(Error::InvalidArgument(format!(
                "channels {:?} must be divisible by groups {}",
                self.channels, self.groups
            )));
        }

        let pad = SamePad2d::new(self.kernel_size, self.stride, self.dilation, self.image_size.as_ref())?;
        let conv = Conv2dConfig::new(self.channels, self.kernel_size)
            .with_stride(self.stride)
            .with_dilation(self.dilation)
            .with_groups(self.groups)
            .with_bias(self.bias)
            .with_padding(PaddingConfig2d::Valid)
            .init(device);

        Ok(Conv2dSame {
            conv,
            pad: Ignored(pad),
        })
    }
}

/// 2D convolution with SAME padding
#[derive(Module, Debug)]
pub struct Conv2dSame<B: Backend> {
    pub conv: Conv2d<B>,
    pad: Ignored<SamePad2d>,
}

impl<B: Backend> Conv2dSame<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.pad.0.forward(x);
        self.conv.forward(x)
    }

    pub fn padding(&self) -> &SamePad2d {
        &self.pad.0
    }

    /// Keep the weights, re-plan the padding for a new declared size
    /// (`None` switches to dynamic padding).
    pub fn with_image_size(self, image_size: Option<&SizeSpec>) -> effnet_core::Result<Self> {
        let pad = self.pad.0.replanned(image_size)?;
        Ok(Self {
            conv: self.conv,
            pad: Ignored(pad),
        })
    }
}

/// Configuration for [`MaxPool2dSame`]
#[derive(Config, Debug)]
pub struct MaxPool2dSameConfig {
    /// Window height and width
    pub kernel_size: [usize; 2],
    #[config(default = "[1, 1]")]
    pub strides: [usize; 2],
    #[config(default = "[1, 1]")]
    pub dilation: [usize; 2],
    /// Declared input size; `None` selects dynamic padding
    pub image_size: Option<SizeSpec>,
}

impl MaxPool2dSameConfig {
    /// Same configuration with a declared input size
    pub fn for_image(self, image_size: Option<SizeSpec>) -> Self {
        Self { image_size, ..self }
    }

    pub fn init(&self) -> effnet_core::Result<MaxPool2dSame> {
        let pad = SamePad2d::new(self.kernel_size, self.strides, self.dilation, self.image_size.as_ref())?;
        let pool = MaxPool2dConfig::new(self.kernel_size)
            .with_strides(self.strides)
            .with_dilation(self.dilation)
            .with_padding(PaddingConfig2d::Valid)
            .init();

        Ok(MaxPool2dSame {
            pool,
            pad: Ignored(pad),
        })
    }
}

/// 2D max-pooling with SAME padding.
///
/// Padded cells are zeros, not negative infinity, so windows overlapping the
/// border see a 0.
#[derive(Module, Debug, Clone)]
pub struct MaxPool2dSame {
    pool: MaxPool2d,
    pad: Ignored<SamePad2d>,
}

impl MaxPool2dSame {
    pub fn forward<B: Backend>(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.pad.0.forward(x);
        self.pool.forward(x)
    }

    pub fn padding(&self) -> &SamePad2d {
        &self.pad.0
    }
}
