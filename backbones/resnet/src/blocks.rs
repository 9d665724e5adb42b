//! ResNet block implementations.
//!
//! This module contains the building blocks for ResNet: BasicBlock, Bottleneck, and LayerBlock.

use burn::{
    nn::{BatchNorm, BatchNormConfig, Relu},
    prelude::*,
};
use burn_extra_ops::{
    conv1x1, conv3x3, join_path, ConvLayer, ConvertToSeparable, LoadParams, ParamLoader,
};

use crate::{
    error::{ResNetError, ResNetResult},
    schedule::StagePlan,
};

/// Residual block family.
#[derive(Config, Debug, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// Two 3x3 convolutions.
    Basic,
    /// 1x1 reduce, 3x3, 1x1 expand.
    Bottleneck,
}

impl BlockKind {
    /// Output width multiplier relative to `planes`.
    pub const fn expansion(&self) -> usize {
        match self {
            Self::Basic => 1,
            Self::Bottleneck => 4,
        }
    }
}

/// Construction parameters of a single residual block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockConfig {
    pub in_planes: usize,
    pub planes: usize,
    pub stride: usize,
    pub dilation: usize,
    pub groups: usize,
    pub base_width: usize,
    pub downsample: bool,
}

impl BlockConfig {
    pub const fn new(in_planes: usize, planes: usize) -> Self {
        Self {
            in_planes,
            planes,
            stride: 1,
            dilation: 1,
            groups: 1,
            base_width: 64,
            downsample: false,
        }
    }
}

#[derive(Module, Debug)]
pub enum ResidualBlock<B: Backend> {
    /// A bottleneck residual block.
    Bottleneck(Bottleneck<B>),
    /// A basic residual block.
    Basic(BasicBlock<B>),
}

impl<B: Backend> ResidualBlock<B> {
    pub fn new(kind: BlockKind, config: &BlockConfig, device: &B::Device) -> ResNetResult<Self> {
        Ok(match kind {
            BlockKind::Basic => Self::Basic(BasicBlock::new(config, device)?),
            BlockKind::Bottleneck => Self::Bottleneck(Bottleneck::new(config, device)),
        })
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        match self {
            Self::Basic(block) => block.forward(input),
            Self::Bottleneck(block) => block.forward(input),
        }
    }

    /// Sets the scale of the last normalization of the residual branch to zero.
    pub fn zero_init_last_bn(self) -> Self {
        match self {
            Self::Basic(mut block) => {
                block.bn2 = zero_gamma(block.bn2);
                Self::Basic(block)
            }
            Self::Bottleneck(mut block) => {
                block.bn3 = zero_gamma(block.bn3);
                Self::Bottleneck(block)
            }
        }
    }

    pub const fn has_downsample(&self) -> bool {
        match self {
            Self::Basic(block) => block.downsample.is_some(),
            Self::Bottleneck(block) => block.downsample.is_some(),
        }
    }
}

fn zero_gamma<B: Backend>(mut bn: BatchNorm<B, 2>) -> BatchNorm<B, 2> {
    bn.gamma = bn.gamma.map(|gamma| gamma.zeros_like());
    bn
}

/// ResNet basic residual block implementation.
/// Derived from torchvision.models.resnet.BasicBlock
#[derive(Module, Debug)]
pub struct BasicBlock<B: Backend> {
    pub conv1: ConvLayer<B>,
    pub bn1: BatchNorm<B, 2>,
    relu: Relu,
    pub conv2: ConvLayer<B>,
    pub bn2: BatchNorm<B, 2>,
    pub downsample: Option<Downsample<B>>,
}

impl<B: Backend> BasicBlock<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let identity = input.clone();

        let out = self.conv1.forward(input);
        let out = self.bn1.forward(out);
        let out = self.relu.forward(out);
        let out = self.conv2.forward(out);
        let out = self.bn2.forward(out);

        let out = match &self.downsample {
            Some(downsample) => out + downsample.forward(identity),
            None => out + identity,
        };

        self.relu.forward(out)
    }

    /// Both `conv1` and the shortcut carry the stride.
    pub fn new(config: &BlockConfig, device: &B::Device) -> ResNetResult<Self> {
        if config.groups != 1 || config.base_width != 64 {
            return Err(ResNetError::UnsupportedBasicBlock {
                groups: config.groups,
                base_width: config.base_width,
            });
        }
        let planes = config.planes;

        let conv1 = ConvLayer::new(
            conv3x3(config.in_planes, planes, config.stride, 1, config.dilation),
            device,
        );
        let conv2 = ConvLayer::new(conv3x3(planes, planes, 1, 1, config.dilation), device);

        Ok(Self {
            conv1,
            bn1: BatchNormConfig::new(planes).init(device),
            relu: Relu::new(),
            conv2,
            bn2: BatchNormConfig::new(planes).init(device),
            downsample: config
                .downsample
                .then(|| Downsample::new(config.in_planes, planes, config.stride, device)),
        })
    }
}

/// ResNet bottleneck residual block implementation.
/// Derived from torchvision.models.resnet.Bottleneck
///
/// **NOTE:** The stride sits on the 3x3 convolution (ResNet V1.5).
#[derive(Module, Debug)]
pub struct Bottleneck<B: Backend> {
    pub conv1: ConvLayer<B>,
    pub bn1: BatchNorm<B, 2>,
    relu: Relu,
    pub conv2: ConvLayer<B>,
    pub bn2: BatchNorm<B, 2>,
    pub conv3: ConvLayer<B>,
    pub bn3: BatchNorm<B, 2>,
    pub downsample: Option<Downsample<B>>,
}

impl<B: Backend> Bottleneck<B> {
    pub const EXPANSION: usize = 4;

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let identity = input.clone();

        let out = self.conv1.forward(input);
        let out = self.bn1.forward(out);
        let out = self.relu.forward(out);
        let out = self.conv2.forward(out);
        let out = self.bn2.forward(out);
        let out = self.relu.forward(out);
        let out = self.conv3.forward(out);
        let out = self.bn3.forward(out);

        let out = match &self.downsample {
            Some(downsample) => out + downsample.forward(identity),
            None => out + identity,
        };

        self.relu.forward(out)
    }

    /// Inner width of the 3x3 convolution.
    pub const fn width(planes: usize, base_width: usize, groups: usize) -> usize {
        planes * base_width / 64 * groups
    }

    pub fn new(config: &BlockConfig, device: &B::Device) -> Self {
        let width = Self::width(config.planes, config.base_width, config.groups);
        let out_planes = config.planes * Self::EXPANSION;

        let conv1 = ConvLayer::new(conv1x1(config.in_planes, width, 1), device);
        let conv2 = ConvLayer::new(
            conv3x3(width, width, config.stride, config.groups, config.dilation),
            device,
        );
        let conv3 = ConvLayer::new(conv1x1(width, out_planes, 1), device);

        Self {
            conv1,
            bn1: BatchNormConfig::new(width).init(device),
            relu: Relu::new(),
            conv2,
            bn2: BatchNormConfig::new(width).init(device),
            conv3,
            bn3: BatchNormConfig::new(out_planes).init(device),
            downsample: config
                .downsample
                .then(|| Downsample::new(config.in_planes, out_planes, config.stride, device)),
        }
    }
}

/// Projection shortcut: strided 1x1 convolution followed by batch norm.
#[derive(Module, Debug)]
pub struct Downsample<B: Backend> {
    pub conv: ConvLayer<B>,
    pub bn: BatchNorm<B, 2>,
}

impl<B: Backend> Downsample<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let out = self.conv.forward(input);
        self.bn.forward(out)
    }

    pub fn new(in_channels: usize, out_channels: usize, stride: usize, device: &B::Device) -> Self {
        Self {
            conv: ConvLayer::new(conv1x1(in_channels, out_channels, stride), device),
            bn: BatchNormConfig::new(out_channels).init(device),
        }
    }
}

/// Collection of sequential residual blocks.
#[derive(Module, Debug)]
pub struct LayerBlock<B: Backend> {
    pub blocks: Vec<ResidualBlock<B>>,
}

impl<B: Backend> LayerBlock<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        self.blocks
            .iter()
            .fold(input, |out, block| block.forward(out))
    }

    /// Builds the blocks of a planned stage.
    ///
    /// The first block takes the stage stride and the shortcut projection; every
    /// block takes its own dilation from the plan.
    pub fn new(
        kind: BlockKind,
        plan: &StagePlan,
        groups: usize,
        base_width: usize,
        device: &B::Device,
    ) -> ResNetResult<Self> {
        let out_planes = plan.out_planes(kind.expansion());
        let blocks = plan
            .dilations
            .iter()
            .enumerate()
            .map(|(index, &dilation)| {
                let config = if index == 0 {
                    BlockConfig {
                        in_planes: plan.in_planes,
                        planes: plan.planes,
                        stride: plan.stride,
                        dilation,
                        groups,
                        base_width,
                        downsample: plan.downsample,
                    }
                } else {
                    BlockConfig {
                        dilation,
                        groups,
                        base_width,
                        ..BlockConfig::new(out_planes, plan.planes)
                    }
                };
                ResidualBlock::new(kind, &config, device)
            })
            .collect::<ResNetResult<Vec<_>>>()?;

        Ok(Self { blocks })
    }

    pub fn zero_init_residual(self) -> Self {
        Self {
            blocks: self
                .blocks
                .into_iter()
                .map(ResidualBlock::zero_init_last_bn)
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

impl<B: Backend> LoadParams<B> for Downsample<B> {
    fn load_params(self, path: &str, loader: &mut ParamLoader<'_, B>) -> Self {
        Self {
            conv: self.conv.load_params(&join_path(path, "0"), loader),
            bn: self.bn.load_params(&join_path(path, "1"), loader),
        }
    }
}

impl<B: Backend> LoadParams<B> for BasicBlock<B> {
    fn load_params(self, path: &str, loader: &mut ParamLoader<'_, B>) -> Self {
        Self {
            conv1: self.conv1.load_params(&join_path(path, "conv1"), loader),
            bn1: self.bn1.load_params(&join_path(path, "bn1"), loader),
            conv2: self.conv2.load_params(&join_path(path, "conv2"), loader),
            bn2: self.bn2.load_params(&join_path(path, "bn2"), loader),
            downsample: self
                .downsample
                .load_params(&join_path(path, "downsample"), loader),
            relu: self.relu,
        }
    }
}

impl<B: Backend> LoadParams<B> for Bottleneck<B> {
    fn load_params(self, path: &str, loader: &mut ParamLoader<'_, B>) -> Self {
        Self {
            conv1: self.conv1.load_params(&join_path(path, "conv1"), loader),
            bn1: self.bn1.load_params(&join_path(path, "bn1"), loader),
            conv2: self.conv2.load_params(&join_path(path, "conv2"), loader),
            bn2: self.bn2.load_params(&join_path(path, "bn2"), loader),
            conv3: self.conv3.load_params(&join_path(path, "conv3"), loader),
            bn3: self.bn3.load_params(&join_path(path, "bn3"), loader),
            downsample: self
                .downsample
                .load_params(&join_path(path, "downsample"), loader),
            relu: self.relu,
        }
    }
}

impl<B: Backend> LoadParams<B> for ResidualBlock<B> {
    fn load_params(self, path: &str, loader: &mut ParamLoader<'_, B>) -> Self {
        match self {
            Self::Basic(block) => Self::Basic(block.load_params(path, loader)),
            Self::Bottleneck(block) => Self::Bottleneck(block.load_params(path, loader)),
        }
    }
}

impl<B: Backend> LoadParams<B> for LayerBlock<B> {
    fn load_params(self, path: &str, loader: &mut ParamLoader<'_, B>) -> Self {
        Self {
            blocks: self.blocks.load_params(path, loader),
        }
    }
}

impl<B: Backend> ConvertToSeparable<B> for Downsample<B> {
    fn convert_to_separable(self, device: &B::Device) -> Self {
        Self {
            conv: self.conv.convert_to_separable(device),
            bn: self.bn,
        }
    }
}

impl<B: Backend> ConvertToSeparable<B> for BasicBlock<B> {
    fn convert_to_separable(self, device: &B::Device) -> Self {
        Self {
            conv1: self.conv1.convert_to_separable(device),
            conv2: self.conv2.convert_to_separable(device),
            downsample: self.downsample.convert_to_separable(device),
            ..self
        }
    }
}

impl<B: Backend> ConvertToSeparable<B> for Bottleneck<B> {
    fn convert_to_separable(self, device: &B::Device) -> Self {
        Self {
            conv1: self.conv1.convert_to_separable(device),
            conv2: self.conv2.convert_to_separable(device),
            conv3: self.conv3.convert_to_separable(device),
            downsample: self.downsample.convert_to_separable(device),
            ..self
        }
    }
}

impl<B: Backend> ConvertToSeparable<B> for ResidualBlock<B> {
    fn convert_to_separable(self, device: &B::Device) -> Self {
        match self {
            Self::Basic(block) => Self::Basic(block.convert_to_separable(device)),
            Self::Bottleneck(block) => Self::Bottleneck(block.convert_to_separable(device)),
        }
    }
}

impl<B: Backend> ConvertToSeparable<B> for LayerBlock<B> {
    fn convert_to_separable(self, device: &B::Device) -> Self {
        Self {
            blocks: self.blocks.convert_to_separable(device),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::{plan_stage, DilationPolicy, StageSpec};
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_basic_block_rejects_wide_configs() {
        let device = Default::default();
        let config = BlockConfig {
            groups: 32,
            base_width: 4,
            ..BlockConfig::new(64, 64)
        };
        let err = BasicBlock::<TestBackend>::new(&config, &device).unwrap_err();
        assert_eq!(
            err,
            ResNetError::UnsupportedBasicBlock {
                groups: 32,
                base_width: 4
            }
        );
    }

    #[test]
    fn test_bottleneck_width() {
        assert_eq!(Bottleneck::<TestBackend>::width(64, 64, 1), 64);
        // resnext50_32x4d
        assert_eq!(Bottleneck::<TestBackend>::width(64, 4, 32), 128);
        // wide_resnet50_2
        assert_eq!(Bottleneck::<TestBackend>::width(128, 128, 1), 256);
    }

    #[test]
    fn test_bottleneck_forward_with_projection() {
        let device = Default::default();
        let config = BlockConfig {
            stride: 2,
            downsample: true,
            ..BlockConfig::new(16, 8)
        };
        let block = ResidualBlock::<TestBackend>::new(BlockKind::Bottleneck, &config, &device)
            .unwrap();
        assert!(block.has_downsample());

        let x = Tensor::<TestBackend, 4>::random([1, 16, 9, 9], Distribution::Default, &device);
        assert_eq!(block.forward(x).dims(), [1, 32, 5, 5]);
    }

    #[test]
    fn test_dilated_basic_block_keeps_resolution() {
        let device = Default::default();
        let config = BlockConfig {
            dilation: 4,
            ..BlockConfig::new(8, 8)
        };
        let block = ResidualBlock::<TestBackend>::new(BlockKind::Basic, &config, &device).unwrap();
        assert!(!block.has_downsample());

        let x = Tensor::<TestBackend, 4>::random([2, 8, 11, 7], Distribution::Default, &device);
        assert_eq!(block.forward(x).dims(), [2, 8, 11, 7]);
    }

    #[test]
    fn test_layer_block_follows_plan() {
        let device = Default::default();
        let spec = StageSpec {
            stage: 2,
            in_planes: 16,
            planes: 8,
            expansion: 4,
            blocks: 3,
            stride: 2,
            dilate: false,
        };
        let (plan, _) = plan_stage(&spec, &DilationPolicy::default(), 1).unwrap();
        let layer =
            LayerBlock::<TestBackend>::new(BlockKind::Bottleneck, &plan, 1, 64, &device).unwrap();

        assert_eq!(layer.len(), 3);
        assert!(layer.blocks[0].has_downsample());
        assert!(!layer.blocks[1].has_downsample());

        let x = Tensor::<TestBackend, 4>::random([1, 16, 8, 8], Distribution::Default, &device);
        assert_eq!(layer.forward(x).dims(), [1, 32, 4, 4]);
    }

    #[test]
    fn test_zero_init_residual() {
        let device = Default::default();
        let block = ResidualBlock::<TestBackend>::new(
            BlockKind::Bottleneck,
            &BlockConfig::new(32, 8),
            &device,
        )
        .unwrap()
        .zero_init_last_bn();

        let ResidualBlock::Bottleneck(block) = block else {
            panic!("expected a bottleneck");
        };
        block
            .bn3
            .gamma
            .val()
            .to_data()
            .assert_eq(&TensorData::new(vec![0.0f32; 32], [32]), true);
        block
            .bn2
            .gamma
            .val()
            .to_data()
            .assert_eq(&TensorData::new(vec![1.0f32; 8], [8]), true);
    }

    #[test]
    fn test_separable_rewrite_touches_spatial_convs_only() {
        let device = Default::default();
        let config = BlockConfig {
            stride: 2,
            downsample: true,
            ..BlockConfig::new(16, 8)
        };
        let block = Bottleneck::<TestBackend>::new(&config, &device).convert_to_separable(&device);

        assert!(!block.conv1.is_separable());
        assert!(block.conv2.is_separable());
        assert!(!block.conv3.is_separable());
        assert!(block
            .downsample
            .as_ref()
            .is_some_and(|downsample| !downsample.conv.is_separable()));

        let x = Tensor::<TestBackend, 4>::random([1, 16, 8, 8], Distribution::Default, &device);
        assert_eq!(block.forward(x).dims(), [1, 32, 4, 4]);
    }
}
