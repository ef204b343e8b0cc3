//! EfficientNet network assembled from an [`Architecture`].
//!
//! Layout:
//! - Stem: SAME conv 3x3, stride 2, batch norm, Swish
//! - MBConv blocks: optional 1x1 expansion, depthwise conv, squeeze-excite,
//!   1x1 projection, identity skip with drop-connect
//! - Head: 1x1 conv, batch norm, Swish, global average pooling
//! - Optional dropout + linear classifier
//!
//! When the architecture declares an image size every padded layer gets a
//! static padding plan for the resolution it sees; otherwise padding is
//! computed per call.

use crate::activation::{check_drop_rate, drop_connect, Swish};
use crate::padding::{Conv2dSame, Conv2dSameConfig};
use crate::weights::{StateDict, CLASSIFIER_KEYS};
use burn::{
    module::{Module, Param, RunningState},
    nn::{
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig},
        BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Linear, LinearConfig,
    },
    tensor::{activation::sigmoid, backend::Backend, Tensor, TensorData},
};
use effnet_core::{
    build_architecture, output_size, round_filters, round_repeats,
    scaling::{
        DEFAULT_BATCH_NORM_EPSILON, DEFAULT_BATCH_NORM_MOMENTUM, DEFAULT_DROPOUT_RATE,
        DEFAULT_DROP_CONNECT_RATE, DEFAULT_NUM_CLASSES, HEAD_FILTERS, STEM_FILTERS,
    },
    Architecture, BlockArgs, Error, GlobalParamsOverrides, Result, SizeSpec,
};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// One concrete MBConv block: scaled arguments and the input size it sees.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedBlock {
    pub args: BlockArgs,
    pub image_size: Option<SizeSpec>,
}

/// Concrete block sequence of an architecture
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkPlan {
    pub stem_image_size: Option<SizeSpec>,
    pub blocks: Vec<PlannedBlock>,
    pub head_image_size: Option<SizeSpec>,
}

/// Expand stages into individual blocks: scale filters and repeats, repeat
/// each block with stride 1 and `input = output` after the first.
pub fn plan_network(arch: &Architecture) -> Result<NetworkPlan> {
    let params = &arch.global_params;
    let stem_image_size = params.image_size.clone();
    let mut image_size = output_size(stem_image_size.as_ref(), &SizeSpec::Scalar(2))?.map(SizeSpec::from);

    let mut blocks = Vec::new();
    for stage in &arch.blocks {
        stage.validate()?;
        let mut args = BlockArgs {
            input_filters: round_filters(stage.input_filters, params),
            output_filters: round_filters(stage.output_filters, params),
            num_repeat: round_repeats(stage.num_repeat, params),
            ..stage.clone()
        };

        blocks.push(PlannedBlock {
            args: args.clone(),
            image_size: image_size.clone(),
        });
        image_size = output_size(image_size.as_ref(), &SizeSpec::Scalar(args.stride))?.map(SizeSpec::from);

        if args.num_repeat > 1 {
            args.input_filters = args.output_filters;
            args.stride = 1;
        }
        for _ in 1..args.num_repeat {
            blocks.push(PlannedBlock {
                args: args.clone(),
                image_size: image_size.clone(),
            });
        }
    }

    Ok(NetworkPlan {
        stem_image_size,
        blocks,
        head_image_size: image_size,
    })
}

/// Squeeze-excite width of a block, if it has one
fn squeezed_channels(args: &BlockArgs) -> Option<usize> {
    args.se_ratio
        .filter(|_| args.has_se())
        .map(|ratio| ((args.input_filters as f64 * ratio) as usize).max(1))
}

fn insert_conv(shapes: &mut BTreeMap<String, Vec<usize>>, prefix: &str, weight: [usize; 4], bias: bool) {
    shapes.insert(format!("{prefix}.weight"), weight.to_vec());
    if bias {
        shapes.insert(format!("{prefix}.bias"), vec![weight[0]]);
    }
}

fn insert_bn(shapes: &mut BTreeMap<String, Vec<usize>>, prefix: &str, channels: usize) {
    for param in ["weight", "bias", "running_mean", "running_var"] {
        shapes.insert(format!("{prefix}.{param}"), vec![channels]);
    }
    shapes.insert(format!("{prefix}.num_batches_tracked"), Vec::new());
}

/// State-dict keys of the network built from `arch`, with the shape each
/// one must have, in the conventional `_conv_stem.weight` /
/// `_blocks.N._bn1.bias` naming. Convolution weights are
/// `[out, in / groups, kh, kw]`, the classifier weight is `[classes, features]`.
pub fn parameter_shapes(arch: &Architecture, in_channels: usize) -> Result<BTreeMap<String, Vec<usize>>> {
    let params = &arch.global_params;
    let plan = plan_network(arch)?;
    let mut shapes = BTreeMap::new();

    let stem_filters = round_filters(STEM_FILTERS, params);
    insert_conv(&mut shapes, "_conv_stem", [stem_filters, in_channels, 3, 3], false);
    insert_bn(&mut shapes, "_bn0", stem_filters);

    for (idx, block) in plan.blocks.iter().enumerate() {
        let prefix = format!("_blocks.{idx}");
        let args = &block.args;
        let oup = args.input_filters * args.expand_ratio;
        let k = args.kernel_size;

        if args.expand_ratio != 1 {
            insert_conv(&mut shapes, &format!("{prefix}._expand_conv"), [oup, args.input_filters, 1, 1], false);
            insert_bn(&mut shapes, &format!("{prefix}._bn0"), oup);
        }
        insert_conv(&mut shapes, &format!("{prefix}._depthwise_conv"), [oup, 1, k, k], false);
        insert_bn(&mut shapes, &format!("{prefix}._bn1"), oup);
        if let Some(squeezed) = squeezed_channels(args) {
            insert_conv(&mut shapes, &format!("{prefix}._se_reduce"), [squeezed, oup, 1, 1], true);
            insert_conv(&mut shapes, &format!("{prefix}._se_expand"), [oup, squeezed, 1, 1], true);
        }
        insert_conv(&mut shapes, &format!("{prefix}._project_conv"), [args.output_filters, oup, 1, 1], false);
        insert_bn(&mut shapes, &format!("{prefix}._bn2"), args.output_filters);
    }

    let head_in = plan
        .blocks
        .last()
        .map(|b| b.args.output_filters)
        .unwrap_or(stem_filters);
    let num_features = round_filters(HEAD_FILTERS, params);
    insert_conv(&mut shapes, "_conv_head", [num_features, head_in, 1, 1], false);
    insert_bn(&mut shapes, "_bn1", num_features);

    if params.include_top.unwrap_or(true) {
        let num_classes = params.num_classes.unwrap_or(DEFAULT_NUM_CLASSES);
        shapes.insert("_fc.weight".to_string(), vec![num_classes, num_features]);
        shapes.insert("_fc.bias".to_string(), vec![num_classes]);
    }

    Ok(shapes)
}

/// Copies state-dict entries into module parameters, checking each shape
/// against the parameter it replaces and remembering what was used.
struct StateReader<'a, B: Backend> {
    state: &'a StateDict,
    device: &'a B::Device,
    used: BTreeSet<String>,
}

impl<'a, B: Backend> StateReader<'a, B> {
    fn new(state: &'a StateDict, device: &'a B::Device) -> Self {
        Self {
            state,
            device,
            used: BTreeSet::new(),
        }
    }

    fn tensor<const D: usize>(&mut self, key: &str, expected: [usize; D]) -> Result<Tensor<B, D>> {
        let entry = self
            .state
            .get(key)
            .ok_or_else(|| Error::MissingWeightKey(vec![key.to_string()]))?;
        if entry.shape != expected {
            return Err(Error::WeightShapeMismatch(vec![format!(
                "{}: expected {:?}, got {:?}",
                key, expected, entry.shape
            )]));
        }
        self.used.insert(key.to_string());
        Ok(Tensor::from_data(TensorData::new(entry.data.clone(), expected), self.device))
    }

    fn conv(&mut self, mut layer: Conv2dSame<B>, prefix: &str) -> Result<Conv2dSame<B>> {
        let weight = self.tensor(&format!("{prefix}.weight"), layer.conv.weight.val().dims())?;
        layer.conv.weight = Param::from_tensor(weight);
        if let Some(bias) = &layer.conv.bias {
            let bias = self.tensor(&format!("{prefix}.bias"), bias.val().dims())?;
            layer.conv.bias = Some(Param::from_tensor(bias));
        }
        Ok(layer)
    }

    fn batch_norm(&mut self, mut layer: BatchNorm<B, 2>, prefix: &str) -> Result<BatchNorm<B, 2>> {
        let dims = layer.gamma.val().dims();
        layer.gamma = Param::from_tensor(self.tensor(&format!("{prefix}.weight"), dims)?);
        layer.beta = Param::from_tensor(self.tensor(&format!("{prefix}.bias"), dims)?);
        layer.running_mean = RunningState::new(self.tensor(&format!("{prefix}.running_mean"), dims)?);
        layer.running_var = RunningState::new(self.tensor(&format!("{prefix}.running_var"), dims)?);
        // burn does not count batches
        let tracked = format!("{prefix}.num_batches_tracked");
        if self.state.contains(&tracked) {
            self.used.insert(tracked);
        }
        Ok(layer)
    }

    /// The classifier weight is stored `[classes, features]`; burn keeps it
    /// transposed.
    fn linear(&mut self, mut layer: Linear<B>, prefix: &str) -> Result<Linear<B>> {
        let [features, classes] = layer.weight.val().dims();
        let weight: Tensor<B, 2> = self.tensor(&format!("{prefix}.weight"), [classes, features])?;
        layer.weight = Param::from_tensor(weight.transpose());
        if let Some(bias) = &layer.bias {
            let bias = self.tensor(&format!("{prefix}.bias"), bias.val().dims())?;
            layer.bias = Some(Param::from_tensor(bias));
        }
        Ok(layer)
    }

    /// Entries of the state dict nothing asked for
    fn unused(&self) -> Vec<String> {
        self.state
            .keys()
            .filter(|k| !self.used.contains(*k))
            .map(str::to_string)
            .collect()
    }
}

/// Batch norm settings shared by every layer
#[derive(Debug, Clone, Copy)]
struct NormSettings {
    momentum: f64,
    epsilon: f64,
}

impl NormSettings {
    fn init<B: Backend>(&self, channels: usize, device: &B::Device) -> BatchNorm<B, 2> {
        // burn weighs the new batch statistic by `momentum`, the reverse of
        // the TensorFlow convention stored in the global parameters
        BatchNormConfig::new(channels)
            .with_momentum(1.0 - self.momentum)
            .with_epsilon(self.epsilon)
            .init(device)
    }
}

/// Squeeze-excite sub-block
#[derive(Module, Debug)]
pub struct SqueezeExcite<B: Backend> {
    pool: AdaptiveAvgPool2d,
    reduce: Conv2dSame<B>,
    expand: Conv2dSame<B>,
    swish: Swish,
}

impl<B: Backend> SqueezeExcite<B> {
    fn new(channels: usize, squeezed: usize, device: &B::Device) -> Result<Self> {
        // operates on pooled 1x1 maps
        let pooled = Some(SizeSpec::hw(1, 1));
        Ok(Self {
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            reduce: Conv2dSameConfig::new([channels, squeezed], [1, 1])
                .for_image(pooled.clone())
                .init(device)?,
            expand: Conv2dSameConfig::new([squeezed, channels], [1, 1])
                .for_image(pooled)
                .init(device)?,
            swish: Swish::new(),
        })
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let s = self.pool.forward(x.clone());
        let s = self.swish.forward(self.reduce.forward(s));
        let s = self.expand.forward(s);
        x * sigmoid(s)
    }
}

/// Mobile inverted bottleneck block
#[derive(Module, Debug)]
pub struct MBConvBlock<B: Backend> {
    expand_conv: Option<Conv2dSame<B>>,
    bn0: Option<BatchNorm<B, 2>>,
    depthwise_conv: Conv2dSame<B>,
    bn1: BatchNorm<B, 2>,
    se: Option<SqueezeExcite<B>>,
    project_conv: Conv2dSame<B>,
    bn2: BatchNorm<B, 2>,
    swish: Swish,
    skip: bool,
    drop_connect_rate: f64,
}

impl<B: Backend> MBConvBlock<B> {
    fn new(
        planned: &PlannedBlock,
        norm: NormSettings,
        drop_connect_rate: f64,
        device: &B::Device,
    ) -> Result<Self> {
        let args = &planned.args;
        let image_size = planned.image_size.clone();
        let inp = args.input_filters;
        let oup = inp * args.expand_ratio;

        let (expand_conv, bn0) = if args.expand_ratio != 1 {
            let conv = Conv2dSameConfig::square(inp, oup, 1, 1)
                .for_image(image_size.clone())
                .init(device)?;
            (Some(conv), Some(norm.init(oup, device)))
        } else {
            (None, None)
        };

        let depthwise_conv = Conv2dSameConfig::square(oup, oup, args.kernel_size, args.stride)
            .with_groups(oup)
            .for_image(image_size.clone())
            .init(device)?;
        let bn1 = norm.init(oup, device);

        let after_dw = output_size(image_size.as_ref(), &SizeSpec::Scalar(args.stride))?.map(SizeSpec::from);

        let se = match squeezed_channels(args) {
            Some(squeezed) => Some(SqueezeExcite::new(oup, squeezed, device)?),
            None => None,
        };

        let project_conv = Conv2dSameConfig::square(oup, args.output_filters, 1, 1)
            .for_image(after_dw)
            .init(device)?;
        let bn2 = norm.init(args.output_filters, device);

        let skip = args.id_skip && args.stride == 1 && args.input_filters == args.output_filters;

        Ok(Self {
            expand_conv,
            bn0,
            depthwise_conv,
            bn1,
            se,
            project_conv,
            bn2,
            swish: Swish::new(),
            skip,
            drop_connect_rate,
        })
    }

    pub fn forward(&self, inputs: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = inputs.clone();

        if let (Some(conv), Some(bn)) = (&self.expand_conv, &self.bn0) {
            x = self.swish.forward(bn.forward(conv.forward(x)));
        }

        x = self.swish.forward(self.bn1.forward(self.depthwise_conv.forward(x)));

        if let Some(se) = &self.se {
            x = se.forward(x);
        }

        x = self.bn2.forward(self.project_conv.forward(x));

        if self.skip {
            x = drop_connect(x, self.drop_connect_rate) + inputs;
        }
        x
    }

    pub fn has_skip(&self) -> bool {
        self.skip
    }

    fn load_state(self, reader: &mut StateReader<'_, B>, prefix: &str) -> Result<Self> {
        let expand_conv = match self.expand_conv {
            Some(conv) => Some(reader.conv(conv, &format!("{prefix}._expand_conv"))?),
            None => None,
        };
        let bn0 = match self.bn0 {
            Some(bn) => Some(reader.batch_norm(bn, &format!("{prefix}._bn0"))?),
            None => None,
        };
        let se = match self.se {
            Some(se) => Some(SqueezeExcite {
                reduce: reader.conv(se.reduce, &format!("{prefix}._se_reduce"))?,
                expand: reader.conv(se.expand, &format!("{prefix}._se_expand"))?,
                ..se
            }),
            None => None,
        };

        Ok(Self {
            expand_conv,
            bn0,
            depthwise_conv: reader.conv(self.depthwise_conv, &format!("{prefix}._depthwise_conv"))?,
            bn1: reader.batch_norm(self.bn1, &format!("{prefix}._bn1"))?,
            se,
            project_conv: reader.conv(self.project_conv, &format!("{prefix}._project_conv"))?,
            bn2: reader.batch_norm(self.bn2, &format!("{prefix}._bn2"))?,
            ..self
        })
    }
}

/// EfficientNet classifier / feature extractor
#[derive(Module, Debug)]
pub struct EfficientNet<B: Backend> {
    conv_stem: Conv2dSame<B>,
    bn0: BatchNorm<B, 2>,
    blocks: Vec<MBConvBlock<B>>,
    conv_head: Conv2dSame<B>,
    bn1: BatchNorm<B, 2>,
    avg_pool: AdaptiveAvgPool2d,
    dropout: Dropout,
    fc: Option<Linear<B>>,
    swish: Swish,
    num_features: usize,
    num_classes: usize,
}

impl<B: Backend> EfficientNet<B> {
    /// Build the network described by `arch` for images with `in_channels`
    /// channels.
    pub fn from_architecture(arch: &Architecture, in_channels: usize, device: &B::Device) -> Result<Self> {
        if in_channels == 0 {
            return Err(Error::InvalidArgument("in_channels must be greater than 0".to_string()));
        }
        let params = &arch.global_params;
        params.validate()?;

        let norm = NormSettings {
            momentum: params.batch_norm_momentum.unwrap_or(DEFAULT_BATCH_NORM_MOMENTUM),
            epsilon: params.batch_norm_epsilon.unwrap_or(DEFAULT_BATCH_NORM_EPSILON),
        };
        let drop_connect_rate =
            check_drop_rate(params.drop_connect_rate.unwrap_or(DEFAULT_DROP_CONNECT_RATE))?;
        let plan = plan_network(arch)?;

        let stem_filters = round_filters(STEM_FILTERS, params);
        let conv_stem = Conv2dSameConfig::square(in_channels, stem_filters, 3, 2)
            .for_image(plan.stem_image_size.clone())
            .init(device)?;
        let bn0 = norm.init(stem_filters, device);

        let total = plan.blocks.len();
        let blocks = plan
            .blocks
            .iter()
            .enumerate()
            .map(|(idx, planned)| {
                let rate = drop_connect_rate * idx as f64 / total as f64;
                MBConvBlock::new(planned, norm, rate, device)
            })
            .collect::<Result<Vec<_>>>()?;

        let head_in = plan
            .blocks
            .last()
            .map(|b| b.args.output_filters)
            .unwrap_or(stem_filters);
        let num_features = round_filters(HEAD_FILTERS, params);
        let conv_head = Conv2dSameConfig::square(head_in, num_features, 1, 1)
            .for_image(plan.head_image_size.clone())
            .init(device)?;
        let bn1 = norm.init(num_features, device);

        let num_classes = params.num_classes.unwrap_or(DEFAULT_NUM_CLASSES);
        let fc = params
            .include_top
            .unwrap_or(true)
            .then(|| LinearConfig::new(num_features, num_classes).init(device));
        let dropout = DropoutConfig::new(params.dropout_rate.unwrap_or(DEFAULT_DROPOUT_RATE)).init();

        info!(
            "Built EfficientNet: {} blocks, {} features, {}",
            total,
            num_features,
            if fc.is_some() {
                format!("{} classes", num_classes)
            } else {
                "no classifier".to_string()
            }
        );

        Ok(Self {
            conv_stem,
            bn0,
            blocks,
            conv_head,
            bn1,
            avg_pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            dropout,
            fc,
            swish: Swish::new(),
            num_features,
            num_classes,
        })
    }

    /// Build a named model, e.g. `efficientnet-b3`
    pub fn from_name(
        model_name: &str,
        overrides: Option<&GlobalParamsOverrides>,
        in_channels: usize,
        device: &B::Device,
    ) -> Result<Self> {
        let arch = build_architecture(model_name, overrides)?;
        Self::from_architecture(&arch, in_channels, device)
    }

    /// Final feature map before pooling
    pub fn extract_features(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.swish.forward(self.bn0.forward(self.conv_stem.forward(input)));
        let x = self.blocks.iter().fold(x, |x, block| block.forward(x));
        self.swish.forward(self.bn1.forward(self.conv_head.forward(x)))
    }

    /// Class logits, or pooled features when the classifier is left out
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.avg_pool.forward(self.extract_features(input));

        // Flatten [batch, channels, 1, 1] -> [batch, channels]
        let [batch, channels, _, _] = x.dims();
        let x: Tensor<B, 2> = x.reshape([batch, channels]);

        match &self.fc {
            Some(fc) => fc.forward(self.dropout.forward(x)),
            None => x,
        }
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn num_features(&self) -> usize {
        self.num_features
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn has_classifier(&self) -> bool {
        self.fc.is_some()
    }

    /// Replace every parameter with its entry in `state`.
    ///
    /// The classifier is only replaced when the state carries it, so a
    /// state loaded without `_fc.*` keeps the freshly initialized head.
    /// Every other parameter must be present with the shape of the layer it
    /// replaces, and every entry of `state` must be used.
    pub fn load_state_dict(self, state: &StateDict, device: &B::Device) -> Result<Self> {
        let mut reader = StateReader::new(state, device);

        let conv_stem = reader.conv(self.conv_stem, "_conv_stem")?;
        let bn0 = reader.batch_norm(self.bn0, "_bn0")?;
        let blocks = self
            .blocks
            .into_iter()
            .enumerate()
            .map(|(idx, block)| block.load_state(&mut reader, &format!("_blocks.{idx}")))
            .collect::<Result<Vec<_>>>()?;
        let conv_head = reader.conv(self.conv_head, "_conv_head")?;
        let bn1 = reader.batch_norm(self.bn1, "_bn1")?;

        let fc = match self.fc {
            Some(fc) if CLASSIFIER_KEYS.iter().any(|k| state.contains(k)) => Some(reader.linear(fc, "_fc")?),
            other => other,
        };

        let unused = reader.unused();
        if !unused.is_empty() {
            return Err(Error::UnexpectedWeightKey(unused));
        }

        debug!("Loaded {} tensors into EfficientNet", reader.used.len());
        Ok(Self {
            conv_stem,
            bn0,
            blocks,
            conv_head,
            bn1,
            fc,
            ..self
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::weights::{load_pretrained, TensorEntry};
    use burn_ndarray::NdArray;
    use effnet_core::efficientnet_params;

    type TestBackend = NdArray;

    fn small_b0(image_size: Option<usize>, include_top: bool) -> Architecture {
        let overrides = GlobalParamsOverrides {
            image_size: Some(image_size.map(SizeSpec::Scalar)),
            num_classes: Some(Some(10)),
            include_top: Some(Some(include_top)),
            ..Default::default()
        };
        build_architecture("efficientnet-b0", Some(&overrides)).unwrap()
    }

    fn zero_state(shapes: &BTreeMap<String, Vec<usize>>) -> StateDict {
        let mut state = StateDict::new();
        for (key, shape) in shapes {
            state.insert(key.as_str(), TensorEntry::zeros(shape.clone()));
        }
        state
    }

    #[test]
    fn test_plan_network_b0() {
        let arch = small_b0(Some(224), true);
        let plan = plan_network(&arch).unwrap();
        assert_eq!(plan.blocks.len(), 16);

        // first block of a repeated stage keeps its stride, the rest use 1
        let stage2: Vec<&PlannedBlock> = plan.blocks[1..3].iter().collect();
        assert_eq!(stage2[0].args.stride, 2);
        assert_eq!(stage2[0].args.input_filters, 16);
        assert_eq!(stage2[1].args.stride, 1);
        assert_eq!(stage2[1].args.input_filters, 24);

        assert_eq!(plan.blocks[0].image_size, Some(SizeSpec::hw(112, 112)));
        assert_eq!(stage2[1].image_size, Some(SizeSpec::hw(56, 56)));
        assert_eq!(plan.head_image_size, Some(SizeSpec::hw(7, 7)));
    }

    #[test]
    fn test_plan_network_without_image_size() {
        let arch = efficientnet_params(Some(1.2), Some(1.4), None, 0.3, 0.2, 10, true).unwrap();
        let plan = plan_network(&arch).unwrap();
        assert!(plan.blocks.iter().all(|b| b.image_size.is_none()));
        assert_eq!(plan.blocks.len(), arch.total_blocks());
    }

    #[test]
    fn test_parameter_shapes_b0() {
        let shapes = parameter_shapes(&small_b0(None, true), 3).unwrap();
        assert_eq!(shapes.len(), 360);
        assert_eq!(shapes["_conv_stem.weight"], vec![32, 3, 3, 3]);
        assert_eq!(shapes["_bn0.running_var"], vec![32]);
        assert!(shapes["_bn0.num_batches_tracked"].is_empty());
        // the first block has expand ratio 1
        assert!(!shapes.contains_key("_blocks.0._expand_conv.weight"));
        assert_eq!(shapes["_blocks.0._depthwise_conv.weight"], vec![32, 1, 3, 3]);
        assert_eq!(shapes["_blocks.0._se_reduce.weight"], vec![8, 32, 1, 1]);
        assert_eq!(shapes["_blocks.1._expand_conv.weight"], vec![96, 16, 1, 1]);
        assert_eq!(shapes["_blocks.15._se_expand.bias"], vec![1152]);
        assert_eq!(shapes["_conv_head.weight"], vec![1280, 320, 1, 1]);
        assert_eq!(shapes["_fc.weight"], vec![10, 1280]);

        let headless = parameter_shapes(&small_b0(None, false), 1).unwrap();
        assert_eq!(headless.len(), 358);
        assert!(!headless.contains_key("_fc.bias"));
        assert_eq!(headless["_conv_stem.weight"], vec![32, 1, 3, 3]);
    }

    #[test]
    fn test_pretrained_checked_against_model_shapes() {
        let shapes = parameter_shapes(&small_b0(None, true), 3).unwrap();
        let mut source = zero_state(&shapes);

        let loaded = load_pretrained(&source, &shapes, true).unwrap();
        assert_eq!(loaded.len(), 360);

        let loaded = load_pretrained(&source, &shapes, false).unwrap();
        assert_eq!(loaded.len(), 358);

        source.remove("_blocks.3._bn1.running_mean");
        assert!(matches!(
            load_pretrained(&source, &shapes, true),
            Err(Error::MissingWeightKey(_))
        ));
    }

    #[test]
    fn test_pretrained_rejects_wrong_shapes() {
        let shapes = parameter_shapes(&small_b0(None, true), 3).unwrap();
        let mut source = StateDict::new();
        for key in shapes.keys() {
            source.insert(key.as_str(), TensorEntry::zeros(vec![7, 7]));
        }
        match load_pretrained(&source, &shapes, true) {
            Err(Error::WeightShapeMismatch(bad)) => assert_eq!(bad.len(), 360),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_shapes_cover_every_module_parameter() {
        let device = Default::default();
        for (name, in_channels, include_top) in [
            ("efficientnet-b0", 3, true),
            ("efficientnet-b0", 1, false),
            ("efficientnet-b3", 4, true),
        ] {
            let overrides = GlobalParamsOverrides {
                image_size: Some(None),
                include_top: Some(Some(include_top)),
                ..Default::default()
            };
            let arch = build_architecture(name, Some(&overrides)).unwrap();
            let shapes = parameter_shapes(&arch, in_channels).unwrap();
            let model = EfficientNet::<TestBackend>::from_architecture(&arch, in_channels, &device).unwrap();

            // every key is consumed with the shape of the layer it replaces
            assert!(model.load_state_dict(&zero_state(&shapes), &device).is_ok(), "{name}");
        }
    }

    #[test]
    fn test_load_state_dict_sets_parameters() {
        let device = Default::default();
        let arch = small_b0(Some(32), true);
        let shapes = parameter_shapes(&arch, 3).unwrap();
        let mut state = zero_state(&shapes);

        // head batch norm outputs 1 everywhere, classifier row c is all c
        state.insert("_bn1.bias", TensorEntry::new(vec![1280], vec![1.0; 1280]).unwrap());
        let weight: Vec<f32> = (0..10).flat_map(|c| vec![c as f32; 1280]).collect();
        state.insert("_fc.weight", TensorEntry::new(vec![10, 1280], weight).unwrap());
        state.insert("_fc.bias", TensorEntry::new(vec![10], (0..10).map(|c| c as f32).collect()).unwrap());

        let state = load_pretrained(&state, &shapes, true).unwrap();
        let model = EfficientNet::<TestBackend>::from_architecture(&arch, 3, &device)
            .unwrap()
            .load_state_dict(&state, &device)
            .unwrap();

        let x = Tensor::<TestBackend, 4>::ones([1, 3, 32, 32], &device);
        let logits: Vec<f32> = model.forward(x).into_data().to_vec().unwrap();
        let feature = 1.0 / (1.0 + (-1.0f32).exp());
        for (c, logit) in logits.iter().enumerate() {
            let expected = c as f32 * 1280.0 * feature + c as f32;
            assert!((logit - expected).abs() < 1e-2 * (1.0 + expected), "class {c}: {logit} vs {expected}");
        }
    }

    #[test]
    fn test_load_state_dict_without_classifier_keeps_head() {
        let device = Default::default();
        let arch = small_b0(Some(32), true);
        let shapes = parameter_shapes(&arch, 3).unwrap();
        let state = load_pretrained(&zero_state(&shapes), &shapes, false).unwrap();

        let model = EfficientNet::<TestBackend>::from_architecture(&arch, 3, &device).unwrap();
        let model = model.load_state_dict(&state, &device).unwrap();
        assert!(model.has_classifier());
    }

    #[test]
    fn test_load_state_dict_rejects_mismatch() {
        let device = Default::default();
        let arch = small_b0(Some(32), false);
        let shapes = parameter_shapes(&arch, 3).unwrap();

        let mut state = zero_state(&shapes);
        state.insert("_blocks.2._bn2.weight", TensorEntry::zeros(vec![23]));
        let model = EfficientNet::<TestBackend>::from_architecture(&arch, 3, &device).unwrap();
        assert!(matches!(
            model.load_state_dict(&state, &device),
            Err(Error::WeightShapeMismatch(_))
        ));

        let mut state = zero_state(&shapes);
        state.insert("_fc.weight", TensorEntry::zeros(vec![10, 1280]));
        let model = EfficientNet::<TestBackend>::from_architecture(&arch, 3, &device).unwrap();
        assert!(matches!(
            model.load_state_dict(&state, &device),
            Err(Error::UnexpectedWeightKey(_))
        ));
    }

    #[test]
    fn test_forward_shapes() {
        let device = Default::default();
        let model = EfficientNet::<TestBackend>::from_architecture(&small_b0(Some(64), true), 3, &device)
            .unwrap();
        assert_eq!(model.num_blocks(), 16);
        assert_eq!(model.num_features(), 1280);
        assert!(model.has_classifier());

        let x = Tensor::<TestBackend, 4>::zeros([2, 3, 64, 64], &device);
        let features = model.extract_features(x.clone());
        assert_eq!(features.dims(), [2, 1280, 2, 2]);

        let logits = model.forward(x);
        assert_eq!(logits.dims(), [2, 10]);
    }

    #[test]
    fn test_forward_dynamic_padding_any_size() {
        let device = Default::default();
        let model = EfficientNet::<TestBackend>::from_architecture(&small_b0(None, false), 1, &device)
            .unwrap();
        assert!(!model.has_classifier());

        let x = Tensor::<TestBackend, 4>::zeros([1, 1, 33, 47], &device);
        assert_eq!(model.extract_features(x.clone()).dims(), [1, 1280, 2, 2]);
        assert_eq!(model.forward(x).dims(), [1, 1280]);
    }

    #[test]
    fn test_from_name_with_dynamic_padding() {
        let device = Default::default();
        let overrides = GlobalParamsOverrides::from_pairs(&["image_size=none"]).unwrap();
        let model = EfficientNet::<TestBackend>::from_name("efficientnet-b0", Some(&overrides), 3, &device)
            .unwrap();

        // 65 -> 33 -> 17 -> 9 -> 5 -> 3 under per-call SAME padding
        let x = Tensor::<TestBackend, 4>::zeros([1, 3, 65, 65], &device);
        assert_eq!(model.extract_features(x).dims(), [1, 1280, 3, 3]);
    }

    #[test]
    fn test_skip_connections() {
        let device = Default::default();
        let model = EfficientNet::<TestBackend>::from_architecture(&small_b0(None, true), 3, &device)
            .unwrap();
        let skips: Vec<bool> = model.blocks.iter().map(|b| b.has_skip()).collect();
        // first block changes width, stage starts downsample, repeats keep shape
        assert!(!skips[0]);
        assert!(!skips[1]);
        assert!(skips[2]);
    }

    #[test]
    fn test_from_name_rejects_unknown() {
        let device = Default::default();
        let result = EfficientNet::<TestBackend>::from_name("mobilenet-v2", None, 3, &device);
        assert!(matches!(result, Err(Error::UnknownModel(_))));
    }

    #[test]
    fn test_zero_channels_rejected() {
        let device = Default::default();
        let result = EfficientNet::<TestBackend>::from_architecture(&small_b0(None, true), 0, &device);
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }
}
