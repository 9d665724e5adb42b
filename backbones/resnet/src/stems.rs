//! Input stems: classic 7x7, rich multi-branch, and the parallel fusion of both.

use burn::{
    nn::{
        pool::{MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, Relu,
    },
    prelude::*,
};
use burn_extra_ops::{
    conv1x1, conv3x3, conv5x5, conv7x7, join_path, max_pool3x3, ConvLayer, ConvertToSeparable,
    LoadParams, ParamLoader,
};

/// Channels produced by every stem.
pub const STEM_CHANNELS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StemKind {
    Classic,
    Rich,
    Parallel,
}

impl StemKind {
    /// Selects the stem from the backbone flags. The flags are validated beforehand.
    pub const fn from_flags(fl_richstem: bool, fl_parallelstem: bool) -> Self {
        if fl_parallelstem {
            Self::Parallel
        } else if fl_richstem {
            Self::Rich
        } else {
            Self::Classic
        }
    }

    /// Total stride of the stem. Only the classic stem honours `fl_stemstride`.
    pub const fn stride(&self, fl_stemstride: bool) -> usize {
        match self {
            Self::Classic if !fl_stemstride => 1,
            _ => 2,
        }
    }
}

/// 7x7 convolution, batch norm and ReLU.
#[derive(Module, Debug)]
pub struct ClassicStem<B: Backend> {
    pub conv1: ConvLayer<B>,
    pub bn1: BatchNorm<B, 2>,
    relu: Relu,
}

impl<B: Backend> ClassicStem<B> {
    pub fn new(stride: usize, device: &B::Device) -> Self {
        Self {
            conv1: ConvLayer::new(conv7x7(3, STEM_CHANNELS, stride, 1, 1), device),
            bn1: BatchNormConfig::new(STEM_CHANNELS).init(device),
            relu: Relu::new(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv1.forward(x);
        let x = self.bn1.forward(x);
        self.relu.forward(x)
    }
}

/// Parallel 3x3 and 5x5 branches, concatenated.
#[derive(Module, Debug)]
pub struct DualKernelBlock<B: Backend> {
    pub conv1: ConvLayer<B>,
    pub bn1: BatchNorm<B, 2>,
    pub conv2: ConvLayer<B>,
    pub bn2: BatchNorm<B, 2>,
    relu: Relu,
}

impl<B: Backend> DualKernelBlock<B> {
    pub fn new(in_planes: usize, planes: [usize; 2], stride: usize, device: &B::Device) -> Self {
        Self {
            conv1: ConvLayer::new(conv3x3(in_planes, planes[0], stride, 1, 1), device),
            bn1: BatchNormConfig::new(planes[0]).init(device),
            conv2: ConvLayer::new(conv5x5(in_planes, planes[1], stride, 1, 1), device),
            bn2: BatchNormConfig::new(planes[1]).init(device),
            relu: Relu::new(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let out_1 = self.bn1.forward(self.conv1.forward(x.clone()));
        let out_2 = self.bn2.forward(self.conv2.forward(x));

        self.relu.forward(Tensor::cat(vec![out_1, out_2], 1))
    }
}

/// Four-branch inception-like block with a residual projection and a 1x1 fusion.
///
/// Branches: strided 1x1; 1x1 reduce then strided 3x3; 1x1 reduce then strided 5x5;
/// strided max pool then 1x1. The concatenation is summed with a projected shortcut
/// and fused down to [`STEM_CHANNELS`].
#[derive(Module, Debug)]
pub struct MultiBranchBlock<B: Backend> {
    pub conv1: ConvLayer<B>,
    pub bn1: BatchNorm<B, 2>,
    pub conv2_1: ConvLayer<B>,
    pub conv2_2: ConvLayer<B>,
    pub bn2: BatchNorm<B, 2>,
    pub conv3_1: ConvLayer<B>,
    pub conv3_2: ConvLayer<B>,
    pub bn3: BatchNorm<B, 2>,
    maxpool: MaxPool2d,
    pub conv4: ConvLayer<B>,
    pub bn4: BatchNorm<B, 2>,
    pub downsample: ConvLayer<B>,
    pub downsample_bn: BatchNorm<B, 2>,
    pub conv5: ConvLayer<B>,
    pub bn5: BatchNorm<B, 2>,
    relu: Relu,
}

impl<B: Backend> MultiBranchBlock<B> {
    pub fn new(
        in_planes: usize,
        planes: [usize; 4],
        channel_reduction: usize,
        stride: usize,
        device: &B::Device,
    ) -> Self {
        let total: usize = planes.iter().sum();
        let maxpool: MaxPool2dConfig = max_pool3x3(in_planes, stride).max_pool2d_config();

        Self {
            conv1: ConvLayer::new(conv1x1(in_planes, planes[0], stride), device),
            bn1: BatchNormConfig::new(planes[0]).init(device),
            conv2_1: ConvLayer::new(conv1x1(in_planes, channel_reduction, 1), device),
            conv2_2: ConvLayer::new(
                conv3x3(channel_reduction, planes[1], stride, 1, 1),
                device,
            ),
            bn2: BatchNormConfig::new(planes[1]).init(device),
            conv3_1: ConvLayer::new(conv1x1(in_planes, channel_reduction, 1), device),
            conv3_2: ConvLayer::new(
                conv5x5(channel_reduction, planes[2], stride, 1, 1),
                device,
            ),
            bn3: BatchNormConfig::new(planes[2]).init(device),
            maxpool: maxpool.init(),
            conv4: ConvLayer::new(conv1x1(in_planes, planes[3], 1), device),
            bn4: BatchNormConfig::new(planes[3]).init(device),
            downsample: ConvLayer::new(conv1x1(in_planes, total, stride), device),
            downsample_bn: BatchNormConfig::new(total).init(device),
            conv5: ConvLayer::new(conv1x1(total, STEM_CHANNELS, 1), device),
            bn5: BatchNormConfig::new(STEM_CHANNELS).init(device),
            relu: Relu::new(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let identity = self
            .downsample_bn
            .forward(self.downsample.forward(x.clone()));

        let out_1 = self.bn1.forward(self.conv1.forward(x.clone()));
        let out_2 = self
            .bn2
            .forward(self.conv2_2.forward(self.conv2_1.forward(x.clone())));
        let out_3 = self
            .bn3
            .forward(self.conv3_2.forward(self.conv3_1.forward(x.clone())));
        let out_4 = self.bn4.forward(self.conv4.forward(self.maxpool.forward(x)));

        let out = Tensor::cat(vec![out_1, out_2, out_3, out_4], 1) + identity;
        let out = self.relu.forward(out);

        let out = self.bn5.forward(self.conv5.forward(out));
        self.relu.forward(out)
    }
}

/// Dual-kernel block at stride 1 followed by the multi-branch block at stride 2.
#[derive(Module, Debug)]
pub struct RichStem<B: Backend> {
    pub block1: DualKernelBlock<B>,
    pub block2: MultiBranchBlock<B>,
}

impl<B: Backend> RichStem<B> {
    pub fn new(device: &B::Device) -> Self {
        Self {
            block1: DualKernelBlock::new(3, [32, 32], 1, device),
            block2: MultiBranchBlock::new(64, [32, 64, 64, 32], 16, 2, device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.block2.forward(self.block1.forward(x))
    }
}

/// Two 3x3 branches over the raw input, of which only the strided one is returned.
///
/// The stride-1 branch still owns parameters and updates its normalization
/// statistics under autodiff backends, but its activations are dropped.
#[derive(Module, Debug)]
pub struct SimpleStem<B: Backend> {
    pub conv1: ConvLayer<B>,
    pub bn1: BatchNorm<B, 2>,
    pub conv2: ConvLayer<B>,
    pub bn2: BatchNorm<B, 2>,
    relu: Relu,
}

impl<B: Backend> SimpleStem<B> {
    pub fn new(device: &B::Device) -> Self {
        Self {
            conv1: ConvLayer::new(conv3x3(3, STEM_CHANNELS, 1, 1, 1), device),
            bn1: BatchNormConfig::new(STEM_CHANNELS).init(device),
            conv2: ConvLayer::new(conv3x3(3, STEM_CHANNELS, 2, 1, 1), device),
            bn2: BatchNormConfig::new(STEM_CHANNELS).init(device),
            relu: Relu::new(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        if B::ad_enabled() {
            let _ = self.bn1.forward(self.conv1.forward(x.clone()));
        }
        let out = self.bn2.forward(self.conv2.forward(x));
        self.relu.forward(out)
    }
}

/// Elementwise sum of a stride-2 classic stem and a [`SimpleStem`].
#[derive(Module, Debug)]
pub struct ParallelStem<B: Backend> {
    pub classic: ClassicStem<B>,
    pub rich: SimpleStem<B>,
}

impl<B: Backend> ParallelStem<B> {
    pub fn new(device: &B::Device) -> Self {
        Self {
            classic: ClassicStem::new(2, device),
            rich: SimpleStem::new(device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.classic.forward(x.clone()) + self.rich.forward(x)
    }
}

#[derive(Module, Debug)]
pub enum Stem<B: Backend> {
    Classic(ClassicStem<B>),
    Rich(RichStem<B>),
    Parallel(ParallelStem<B>),
}

impl<B: Backend> Stem<B> {
    pub fn new(kind: StemKind, fl_stemstride: bool, device: &B::Device) -> Self {
        match kind {
            StemKind::Classic => Self::Classic(ClassicStem::new(kind.stride(fl_stemstride), device)),
            StemKind::Rich => Self::Rich(RichStem::new(device)),
            StemKind::Parallel => Self::Parallel(ParallelStem::new(device)),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        match self {
            Self::Classic(stem) => stem.forward(x),
            Self::Rich(stem) => stem.forward(x),
            Self::Parallel(stem) => stem.forward(x),
        }
    }

    pub const fn kind(&self) -> StemKind {
        match self {
            Self::Classic(_) => StemKind::Classic,
            Self::Rich(_) => StemKind::Rich,
            Self::Parallel(_) => StemKind::Parallel,
        }
    }
}

impl<B: Backend> LoadParams<B> for ClassicStem<B> {
    fn load_params(self, path: &str, loader: &mut ParamLoader<'_, B>) -> Self {
        Self {
            conv1: self.conv1.load_params(&join_path(path, "conv1"), loader),
            bn1: self.bn1.load_params(&join_path(path, "bn1"), loader),
            relu: self.relu,
        }
    }
}

impl<B: Backend> LoadParams<B> for DualKernelBlock<B> {
    fn load_params(self, path: &str, loader: &mut ParamLoader<'_, B>) -> Self {
        Self {
            conv1: self.conv1.load_params(&join_path(path, "conv1"), loader),
            bn1: self.bn1.load_params(&join_path(path, "bn1"), loader),
            conv2: self.conv2.load_params(&join_path(path, "conv2"), loader),
            bn2: self.bn2.load_params(&join_path(path, "bn2"), loader),
            relu: self.relu,
        }
    }
}

impl<B: Backend> LoadParams<B> for MultiBranchBlock<B> {
    fn load_params(self, path: &str, loader: &mut ParamLoader<'_, B>) -> Self {
        let at = |name: &str| join_path(path, name);
        Self {
            conv1: self.conv1.load_params(&at("conv1"), loader),
            bn1: self.bn1.load_params(&at("bn1"), loader),
            conv2_1: self.conv2_1.load_params(&at("conv2_1"), loader),
            conv2_2: self.conv2_2.load_params(&at("conv2_2"), loader),
            bn2: self.bn2.load_params(&at("bn2"), loader),
            conv3_1: self.conv3_1.load_params(&at("conv3_1"), loader),
            conv3_2: self.conv3_2.load_params(&at("conv3_2"), loader),
            bn3: self.bn3.load_params(&at("bn3"), loader),
            maxpool: self.maxpool,
            conv4: self.conv4.load_params(&at("conv4"), loader),
            bn4: self.bn4.load_params(&at("bn4"), loader),
            downsample: self.downsample.load_params(&at("downsample.0"), loader),
            downsample_bn: self.downsample_bn.load_params(&at("downsample.1"), loader),
            conv5: self.conv5.load_params(&at("conv5"), loader),
            bn5: self.bn5.load_params(&at("bn5"), loader),
            relu: self.relu,
        }
    }
}

impl<B: Backend> LoadParams<B> for RichStem<B> {
    fn load_params(self, path: &str, loader: &mut ParamLoader<'_, B>) -> Self {
        Self {
            block1: self.block1.load_params(&join_path(path, "block1"), loader),
            block2: self.block2.load_params(&join_path(path, "block2"), loader),
        }
    }
}

impl<B: Backend> LoadParams<B> for SimpleStem<B> {
    fn load_params(self, path: &str, loader: &mut ParamLoader<'_, B>) -> Self {
        Self {
            conv1: self.conv1.load_params(&join_path(path, "conv1"), loader),
            bn1: self.bn1.load_params(&join_path(path, "bn1"), loader),
            conv2: self.conv2.load_params(&join_path(path, "conv2"), loader),
            bn2: self.bn2.load_params(&join_path(path, "bn2"), loader),
            relu: self.relu,
        }
    }
}

impl<B: Backend> LoadParams<B> for ParallelStem<B> {
    fn load_params(self, path: &str, loader: &mut ParamLoader<'_, B>) -> Self {
        Self {
            classic: self.classic.load_params(&join_path(path, "classic"), loader),
            rich: self.rich.load_params(&join_path(path, "rich"), loader),
        }
    }
}

impl<B: Backend> LoadParams<B> for Stem<B> {
    fn load_params(self, path: &str, loader: &mut ParamLoader<'_, B>) -> Self {
        match self {
            Self::Classic(stem) => Self::Classic(stem.load_params(path, loader)),
            Self::Rich(stem) => Self::Rich(stem.load_params(path, loader)),
            Self::Parallel(stem) => Self::Parallel(stem.load_params(path, loader)),
        }
    }
}

impl<B: Backend> ConvertToSeparable<B> for ClassicStem<B> {
    fn convert_to_separable(self, device: &B::Device) -> Self {
        Self {
            conv1: self.conv1.convert_to_separable(device),
            ..self
        }
    }
}

impl<B: Backend> ConvertToSeparable<B> for DualKernelBlock<B> {
    fn convert_to_separable(self, device: &B::Device) -> Self {
        Self {
            conv1: self.conv1.convert_to_separable(device),
            conv2: self.conv2.convert_to_separable(device),
            ..self
        }
    }
}

impl<B: Backend> ConvertToSeparable<B> for MultiBranchBlock<B> {
    /// Only the 3x3 and 5x5 branch convolutions are spatial.
    fn convert_to_separable(self, device: &B::Device) -> Self {
        Self {
            conv2_2: self.conv2_2.convert_to_separable(device),
            conv3_2: self.conv3_2.convert_to_separable(device),
            ..self
        }
    }
}

impl<B: Backend> ConvertToSeparable<B> for RichStem<B> {
    fn convert_to_separable(self, device: &B::Device) -> Self {
        Self {
            block1: self.block1.convert_to_separable(device),
            block2: self.block2.convert_to_separable(device),
        }
    }
}

impl<B: Backend> ConvertToSeparable<B> for SimpleStem<B> {
    fn convert_to_separable(self, device: &B::Device) -> Self {
        Self {
            conv1: self.conv1.convert_to_separable(device),
            conv2: self.conv2.convert_to_separable(device),
            ..self
        }
    }
}

impl<B: Backend> ConvertToSeparable<B> for ParallelStem<B> {
    fn convert_to_separable(self, device: &B::Device) -> Self {
        Self {
            classic: self.classic.convert_to_separable(device),
            rich: self.rich.convert_to_separable(device),
        }
    }
}

impl<B: Backend> ConvertToSeparable<B> for Stem<B> {
    fn convert_to_separable(self, device: &B::Device) -> Self {
        match self {
            Self::Classic(stem) => Self::Classic(stem.convert_to_separable(device)),
            Self::Rich(stem) => Self::Rich(stem.convert_to_separable(device)),
            Self::Parallel(stem) => Self::Parallel(stem.convert_to_separable(device)),
        }
    }
}
