//! Convolution operator descriptors.
//!
//! An [`OpDescriptor`] is the shape-level description of a single operator: channels,
//! kernel, stride, padding, dilation and groups. Descriptors are built by the small
//! factory functions in this module and turned into Burn layer configs on demand,
//! which lets callers reason about channel counts and spatial sizes before any
//! parameter is allocated.

use burn::nn::{
    conv::{Conv2dConfig, ConvTranspose2dConfig},
    pool::MaxPool2dConfig,
    Initializer, PaddingConfig2d,
};
use core::f64::consts::SQRT_2;

/// The operator family a descriptor belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    /// Regular (possibly grouped / dilated) 2d convolution.
    Conv,
    /// Transposed 2d convolution.
    TransposedConv,
    /// 2d max pooling.
    Pool,
}

/// Shape-level description of a 2d operator with square kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpDescriptor {
    pub kind: OpKind,
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel_size: usize,
    pub stride: usize,
    pub padding: usize,
    pub dilation: usize,
    pub groups: usize,
    pub bias: bool,
}

impl OpDescriptor {
    /// Convolution with "same"-style centered padding: `dilation * (kernel_size - 1) / 2`.
    pub const fn conv(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        groups: usize,
        dilation: usize,
    ) -> Self {
        Self {
            kind: OpKind::Conv,
            in_channels,
            out_channels,
            kernel_size,
            stride,
            padding: dilation * (kernel_size - 1) / 2,
            dilation,
            groups,
            bias: false,
        }
    }

    pub const fn with_bias(self, bias: bool) -> Self {
        Self { bias, ..self }
    }

    pub const fn with_padding(self, padding: usize) -> Self {
        Self { padding, ..self }
    }

    /// True for kernels larger than 1x1.
    pub const fn is_spatial(&self) -> bool {
        self.kernel_size > 1
    }

    /// True when every input channel is convolved independently.
    pub const fn is_depthwise(&self) -> bool {
        self.groups > 1 && self.groups == self.in_channels
    }

    /// Spatial output size for a given `[height, width]` input.
    pub fn output_size(&self, [height, width]: [usize; 2]) -> [usize; 2] {
        let span = self.dilation * (self.kernel_size - 1);
        let size = |input: usize| match self.kind {
            OpKind::Conv | OpKind::Pool => {
                (input + 2 * self.padding).saturating_sub(span + 1) / self.stride + 1
            }
            OpKind::TransposedConv => {
                ((input - 1) * self.stride + span + 1).saturating_sub(2 * self.padding)
            }
        };
        [size(height), size(width)]
    }

    /// The depthwise half of a separable factorization of this convolution.
    ///
    /// Keeps kernel, stride, padding and dilation; `groups == in_channels`.
    pub const fn depthwise(&self) -> Self {
        Self {
            kind: OpKind::Conv,
            in_channels: self.in_channels,
            out_channels: self.in_channels,
            kernel_size: self.kernel_size,
            stride: self.stride,
            padding: self.padding,
            dilation: self.dilation,
            groups: self.in_channels,
            bias: self.bias,
        }
    }

    /// The pointwise (1x1) half of a separable factorization of this convolution.
    pub const fn pointwise(&self) -> Self {
        conv1x1(self.in_channels, self.out_channels, 1).with_bias(self.bias)
    }

    /// Burn [`Conv2dConfig`] for this descriptor.
    pub fn conv2d_config(&self) -> Conv2dConfig {
        Conv2dConfig::new(
            [self.in_channels, self.out_channels],
            [self.kernel_size, self.kernel_size],
        )
        .with_stride([self.stride, self.stride])
        .with_padding(PaddingConfig2d::Explicit(self.padding, self.padding))
        .with_dilation([self.dilation, self.dilation])
        .with_groups(self.groups)
        .with_bias(self.bias)
    }

    /// Burn [`ConvTranspose2dConfig`] for this descriptor.
    pub fn conv_transpose2d_config(&self) -> ConvTranspose2dConfig {
        ConvTranspose2dConfig::new(
            [self.in_channels, self.out_channels],
            [self.kernel_size, self.kernel_size],
        )
        .with_stride([self.stride, self.stride])
        .with_padding([self.padding, self.padding])
        .with_dilation([self.dilation, self.dilation])
        .with_groups(self.groups)
        .with_bias(self.bias)
    }

    /// Burn [`MaxPool2dConfig`] for this descriptor.
    pub fn max_pool2d_config(&self) -> MaxPool2dConfig {
        MaxPool2dConfig::new([self.kernel_size, self.kernel_size])
            .with_strides([self.stride, self.stride])
            .with_padding(PaddingConfig2d::Explicit(self.padding, self.padding))
    }
}

/// 1x1 convolution.
pub const fn conv1x1(in_planes: usize, out_planes: usize, stride: usize) -> OpDescriptor {
    OpDescriptor::conv(in_planes, out_planes, 1, stride, 1, 1)
}

/// 3x3 convolution with padding.
pub const fn conv3x3(
    in_planes: usize,
    out_planes: usize,
    stride: usize,
    groups: usize,
    dilation: usize,
) -> OpDescriptor {
    OpDescriptor::conv(in_planes, out_planes, 3, stride, groups, dilation)
}

/// 5x5 convolution with padding.
pub const fn conv5x5(
    in_planes: usize,
    out_planes: usize,
    stride: usize,
    groups: usize,
    dilation: usize,
) -> OpDescriptor {
    OpDescriptor::conv(in_planes, out_planes, 5, stride, groups, dilation)
}

/// 7x7 convolution with padding.
pub const fn conv7x7(
    in_planes: usize,
    out_planes: usize,
    stride: usize,
    groups: usize,
    dilation: usize,
) -> OpDescriptor {
    OpDescriptor::conv(in_planes, out_planes, 7, stride, groups, dilation)
}

/// Stride-2 transposed convolution that doubles the input resolution.
///
/// With `kernel_size == 4` the output is exactly `2 * input`; `kernel_size == 3`
/// yields `2 * input - 1`, which is used to fix odd target sizes.
pub const fn conv_transpose_double(
    in_planes: usize,
    out_planes: usize,
    kernel_size: usize,
    groups: usize,
) -> OpDescriptor {
    OpDescriptor {
        kind: OpKind::TransposedConv,
        in_channels: in_planes,
        out_channels: out_planes,
        kernel_size,
        stride: 2,
        padding: 1,
        dilation: 1,
        groups,
        bias: true,
    }
}

/// 3x3 max pooling with padding 1.
pub const fn max_pool3x3(channels: usize, stride: usize) -> OpDescriptor {
    OpDescriptor {
        kind: OpKind::Pool,
        in_channels: channels,
        out_channels: channels,
        kernel_size: 3,
        stride,
        padding: 1,
        dilation: 1,
        groups: 1,
        bias: false,
    }
}

/// He/Kaiming normal initializer in `fan_out` mode, for ReLU networks.
pub const fn kaiming_fan_out() -> Initializer {
    Initializer::KaimingNormal {
        gain: SQRT_2,
        fan_out_only: true,
    }
}
