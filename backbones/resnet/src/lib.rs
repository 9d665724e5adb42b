//! ResNet backbones for semantic segmentation.
//!
//! Derived from torchvision.models.resnet.ResNet, extended with:
//! - three input stems ([`StemKind`]): the classic 7x7 convolution, a rich
//!   multi-branch stem, and the parallel sum of both;
//! - stride replacement by dilation per stage, with an optional learned feature
//!   extraction (LFE) dilation pattern for stages 2 to 4 (see [`schedule`]);
//! - [`ResNet::forward_features`], which exposes the stage 1 and stage 4 outputs
//!   consumed by segmentation heads.

use burn::{
    module::Ignored,
    nn::{
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d},
        Linear, LinearConfig,
    },
    prelude::*,
};
use burn_extra_ops::{join_path, max_pool3x3, ConvertToSeparable, LoadParams, ParamLoader};

mod blocks;
mod error;
pub mod pretrained;
pub mod schedule;
mod stems;

pub use blocks::*;
pub use error::{ResNetError, ResNetResult};
pub use schedule::{DilationPolicy, StagePlan, StageSpec};
pub use stems::*;

/// Architecture names with a preset and published ImageNet weights.
pub const ARCHITECTURES: [&str; 9] = [
    "resnet18",
    "resnet34",
    "resnet50",
    "resnet101",
    "resnet152",
    "resnext50_32x4d",
    "resnext101_32x8d",
    "wide_resnet50_2",
    "wide_resnet101_2",
];

/// Planes of the four stages before expansion.
const STAGE_PLANES: [usize; 4] = [64, 128, 256, 512];

/// ResNet configuration
#[derive(Config, Debug)]
pub struct ResNetConfig {
    /// Residual block family.
    pub block: BlockKind,
    /// Number of blocks in each of the four stages, e.g. [3, 4, 6, 3] for ResNet-50.
    pub layers: Vec<usize>,
    /// Number of classes for the final linear layer.
    #[config(default = "1000")]
    pub num_classes: usize,
    /// Zero-initialize the last BN in each residual branch.
    #[config(default = "false")]
    pub zero_init_residual: bool,
    /// Convolution groups of the bottleneck 3x3 (ResNeXt).
    #[config(default = "1")]
    pub groups: usize,
    /// Width per group of the bottleneck 3x3 (ResNeXt / Wide ResNet).
    #[config(default = "64")]
    pub width_per_group: usize,
    /// One flag per strided stage (2, 3, 4): replace the stride with dilation.
    #[config(default = "vec![false, false, false]")]
    pub replace_stride_with_dilation: Vec<bool>,
    /// Apply the 3x3 stride-2 max pool after the stem.
    #[config(default = "true")]
    pub fl_maxpool: bool,
    /// Use the rich multi-branch stem.
    #[config(default = "false")]
    pub fl_richstem: bool,
    /// Use the parallel classic + simple stem.
    #[config(default = "false")]
    pub fl_parallelstem: bool,
    /// Stride 2 in the classic stem.
    #[config(default = "true")]
    pub fl_stemstride: bool,
    /// Learned feature extraction dilation pattern for stages 2 to 4.
    #[config(default = "false")]
    pub fl_lfe: bool,
    /// Output-stride ratio used by the LFE stage 3 dilation reset.
    #[config(default = "8")]
    pub output_stride_diff: usize,
}

/// Cumulative strides of the features exposed by [`ResNet::forward_features`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureStrides {
    /// Stride of the stage 1 output.
    pub low_level: usize,
    /// Stride of the stage 4 output.
    pub out: usize,
}

impl ResNetConfig {
    pub fn resnet18() -> Self {
        Self::new(BlockKind::Basic, vec![2, 2, 2, 2])
    }

    pub fn resnet34() -> Self {
        Self::new(BlockKind::Basic, vec![3, 4, 6, 3])
    }

    pub fn resnet50() -> Self {
        Self::new(BlockKind::Bottleneck, vec![3, 4, 6, 3])
    }

    pub fn resnet101() -> Self {
        Self::new(BlockKind::Bottleneck, vec![3, 4, 23, 3])
    }

    pub fn resnet152() -> Self {
        Self::new(BlockKind::Bottleneck, vec![3, 8, 36, 3])
    }

    pub fn resnext50_32x4d() -> Self {
        Self::resnet50().with_groups(32).with_width_per_group(4)
    }

    pub fn resnext101_32x8d() -> Self {
        Self::resnet101().with_groups(32).with_width_per_group(8)
    }

    /// Bottleneck 3x3 twice as wide as ResNet-50.
    pub fn wide_resnet50_2() -> Self {
        Self::resnet50().with_width_per_group(64 * 2)
    }

    pub fn wide_resnet101_2() -> Self {
        Self::resnet101().with_width_per_group(64 * 2)
    }

    /// Preset by architecture name, see [`ARCHITECTURES`].
    pub fn from_architecture(name: &str) -> ResNetResult<Self> {
        let config = match name {
            "resnet18" => Self::resnet18(),
            "resnet34" => Self::resnet34(),
            "resnet50" => Self::resnet50(),
            "resnet101" => Self::resnet101(),
            "resnet152" => Self::resnet152(),
            "resnext50_32x4d" => Self::resnext50_32x4d(),
            "resnext101_32x8d" => Self::resnext101_32x8d(),
            "wide_resnet50_2" => Self::wide_resnet50_2(),
            "wide_resnet101_2" => Self::wide_resnet101_2(),
            _ => {
                return Err(ResNetError::UnknownArchitecture {
                    name: name.to_string(),
                })
            }
        };
        Ok(config)
    }

    pub fn validate(&self) -> ResNetResult<()> {
        if self.fl_richstem && self.fl_parallelstem {
            return Err(ResNetError::MutuallyExclusiveStems);
        }
        if self.replace_stride_with_dilation.len() != 3 {
            return Err(ResNetError::InvalidDilationReplacement {
                len: self.replace_stride_with_dilation.len(),
            });
        }
        if self.layers.len() != 4 {
            return Err(ResNetError::InvalidConfiguration {
                reason: format!("layers must have 4 elements, got {}", self.layers.len()),
            });
        }
        if self.layers.contains(&0) {
            return Err(ResNetError::InvalidConfiguration {
                reason: format!("every stage needs at least one block, got {:?}", self.layers),
            });
        }
        if self.block == BlockKind::Basic && (self.groups != 1 || self.width_per_group != 64) {
            return Err(ResNetError::UnsupportedBasicBlock {
                groups: self.groups,
                base_width: self.width_per_group,
            });
        }
        if self.groups == 0 || self.width_per_group == 0 {
            return Err(ResNetError::InvalidConfiguration {
                reason: "groups and width_per_group must be positive".to_string(),
            });
        }
        if self.num_classes == 0 {
            return Err(ResNetError::InvalidConfiguration {
                reason: "num_classes must be positive".to_string(),
            });
        }
        if !self.output_stride_diff.is_power_of_two() {
            return Err(ResNetError::InvalidConfiguration {
                reason: format!(
                    "output_stride_diff must be a power of two, got {}",
                    self.output_stride_diff
                ),
            });
        }
        Ok(())
    }

    pub const fn stem_kind(&self) -> StemKind {
        StemKind::from_flags(self.fl_richstem, self.fl_parallelstem)
    }

    pub const fn dilation_policy(&self) -> DilationPolicy {
        DilationPolicy {
            lfe: self.fl_lfe,
            output_stride_diff: self.output_stride_diff,
        }
    }

    /// Channels of the stage 4 output.
    pub const fn out_channels(&self) -> usize {
        STAGE_PLANES[3] * self.block.expansion()
    }

    /// Channels of the stage 1 output.
    pub const fn low_level_channels(&self) -> usize {
        STAGE_PLANES[0] * self.block.expansion()
    }

    /// Resolves stride, dilations and shortcuts of the four stages.
    pub fn plan_stages(&self) -> ResNetResult<Vec<StagePlan>> {
        self.validate()?;

        let policy = self.dilation_policy();
        let expansion = self.block.expansion();
        let mut in_planes = STAGE_PLANES[0];
        let mut accumulator = 1;
        let mut plans = Vec::with_capacity(4);

        for (index, (&planes, &blocks)) in STAGE_PLANES.iter().zip(&self.layers).enumerate() {
            let spec = StageSpec {
                stage: index + 1,
                in_planes,
                planes,
                expansion,
                blocks,
                stride: if index == 0 { 1 } else { 2 },
                dilate: index > 0 && self.replace_stride_with_dilation[index - 1],
            };
            let (plan, next) = schedule::plan_stage(&spec, &policy, accumulator)?;
            accumulator = next;
            in_planes = plan.out_planes(expansion);
            plans.push(plan);
        }

        Ok(plans)
    }

    pub fn feature_strides(&self) -> ResNetResult<FeatureStrides> {
        let plans = self.plan_stages()?;
        let stem = self.stem_kind().stride(self.fl_stemstride);
        let pool = if self.fl_maxpool { 2 } else { 1 };

        let low_level = stem * pool * plans[0].stride;
        let out = plans[1..]
            .iter()
            .fold(low_level, |stride, plan| stride * plan.stride);

        Ok(FeatureStrides { low_level, out })
    }

    /// Initialize a new [ResNet](ResNet) module.
    pub fn init<B: Backend>(&self, device: &B::Device) -> ResNetResult<ResNet<B>> {
        let plans = self.plan_stages()?;
        let strides = self.feature_strides()?;

        let stem = Stem::new(self.stem_kind(), self.fl_stemstride, device);
        let maxpool = self
            .fl_maxpool
            .then(|| max_pool3x3(STEM_CHANNELS, 2).max_pool2d_config().init());

        let mut layers = plans
            .iter()
            .map(|plan| {
                LayerBlock::new(
                    self.block,
                    plan,
                    self.groups,
                    self.width_per_group,
                    device,
                )
                .map(|layer| {
                    if self.zero_init_residual {
                        layer.zero_init_residual()
                    } else {
                        layer
                    }
                })
            })
            .collect::<ResNetResult<Vec<_>>>()?
            .into_iter();

        let (Some(layer1), Some(layer2), Some(layer3), Some(layer4)) =
            (layers.next(), layers.next(), layers.next(), layers.next())
        else {
            return Err(ResNetError::InvalidConfiguration {
                reason: "expected four stages".to_string(),
            });
        };

        tracing::info!(
            block = ?self.block,
            layers = ?self.layers,
            stem = ?self.stem_kind(),
            output_stride = strides.out,
            "assembled ResNet"
        );

        Ok(ResNet {
            stem,
            maxpool,
            layer1,
            layer2,
            layer3,
            layer4,
            avgpool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            fc: LinearConfig::new(self.out_channels(), self.num_classes).init(device),
            strides: Ignored(strides),
        })
    }
}

/// Stage outputs handed to segmentation heads.
#[derive(Debug, Clone)]
pub struct BackboneFeatures<B: Backend> {
    /// Stage 4 output.
    pub out: Tensor<B, 4>,
    /// Stage 1 output.
    pub low_level: Tensor<B, 4>,
}

/// ResNet with a configurable stem and dilated stages.
#[derive(Module, Debug)]
pub struct ResNet<B: Backend> {
    pub stem: Stem<B>,
    pub maxpool: Option<MaxPool2d>,
    pub layer1: LayerBlock<B>,
    pub layer2: LayerBlock<B>,
    pub layer3: LayerBlock<B>,
    pub layer4: LayerBlock<B>,
    avgpool: AdaptiveAvgPool2d,
    pub fc: Linear<B>,
    strides: Ignored<FeatureStrides>,
}

impl<B: Backend> ResNet<B> {
    /// Classification forward pass: `[batch, 3, H, W]` to `[batch, num_classes]`.
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.forward_features(input).out;
        let x = self.avgpool.forward(x);
        let x = x.flatten::<2>(1, 3);
        self.fc.forward(x)
    }

    /// Runs stem and stages, skipping the pooling and linear head.
    pub fn forward_features(&self, input: Tensor<B, 4>) -> BackboneFeatures<B> {
        let x = self.stem.forward(input);
        let x = match &self.maxpool {
            Some(maxpool) => maxpool.forward(x),
            None => x,
        };

        let low_level = self.layer1.forward(x);
        let x = self.layer2.forward(low_level.clone());
        let x = self.layer3.forward(x);
        let out = self.layer4.forward(x);

        BackboneFeatures { out, low_level }
    }

    pub const fn feature_strides(&self) -> FeatureStrides {
        self.strides.0
    }
}

impl<B: Backend> LoadParams<B> for ResNet<B> {
    fn load_params(self, path: &str, loader: &mut ParamLoader<'_, B>) -> Self {
        Self {
            stem: self.stem.load_params(&join_path(path, "stem"), loader),
            layer1: self.layer1.load_params(&join_path(path, "layer1"), loader),
            layer2: self.layer2.load_params(&join_path(path, "layer2"), loader),
            layer3: self.layer3.load_params(&join_path(path, "layer3"), loader),
            layer4: self.layer4.load_params(&join_path(path, "layer4"), loader),
            fc: self.fc.load_params(&join_path(path, "fc"), loader),
            ..self
        }
    }
}

impl<B: Backend> ConvertToSeparable<B> for ResNet<B> {
    fn convert_to_separable(self, device: &B::Device) -> Self {
        Self {
            stem: self.stem.convert_to_separable(device),
            layer1: self.layer1.convert_to_separable(device),
            layer2: self.layer2.convert_to_separable(device),
            layer3: self.layer3.convert_to_separable(device),
            layer4: self.layer4.convert_to_separable(device),
            ..self
        }
    }
}
