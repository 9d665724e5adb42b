//! # Atrous Spatial Pyramid Pooling (ASPP)
//!
//! Five parallel branches over the same input: a 1x1 projection, three dilated 3x3
//! convolutions and an image-level pooling branch. Each branch yields
//! [`ASPP_CHANNELS`] channels; the concatenation is projected back to
//! [`ASPP_CHANNELS`].

use burn::{
    nn::{
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig},
        BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Relu,
    },
    prelude::*,
};
use burn_extra_ops::{
    conv1x1, conv3x3, join_path, ConvLayer, ConvertToSeparable, LoadParams, ParamLoader,
};

use super::{resize_bilinear, ConvBnRelu};
use crate::error::{DeepLabError, DeepLabResult};

/// Channels of every ASPP branch and of the ASPP output.
pub const ASPP_CHANNELS: usize = 256;

/// Number of concatenated branches.
pub const ASPP_BRANCHES: usize = 5;

/// Configuration for the [`Aspp`] module.
#[derive(Config, Debug)]
pub struct AsppConfig {
    /// Number of input channels.
    pub in_channels: usize,
    /// Dilations of the three atrous branches.
    #[config(default = "[12, 24, 36]")]
    pub atrous_rates: [usize; 3],
    /// Dropout after the projection, active only when training.
    #[config(default = "0.1")]
    pub dropout: f64,
}

impl AsppConfig {
    pub fn validate(&self) -> DeepLabResult<()> {
        if self.in_channels == 0 {
            return Err(DeepLabError::InvalidConfiguration {
                reason: "ASPP in_channels must be positive".to_string(),
            });
        }
        if self.atrous_rates.contains(&0) {
            return Err(DeepLabError::InvalidConfiguration {
                reason: format!(
                    "ASPP atrous rates must be positive, got {:?}",
                    self.atrous_rates
                ),
            });
        }
        Ok(())
    }

    /// Initializes a new [`Aspp`] module.
    pub fn init<B: Backend>(&self, device: &B::Device) -> DeepLabResult<Aspp<B>> {
        self.validate()?;

        let branches = core::iter::once(conv1x1(self.in_channels, ASPP_CHANNELS, 1))
            .chain(
                self.atrous_rates
                    .iter()
                    .map(|&rate| conv3x3(self.in_channels, ASPP_CHANNELS, 1, 1, rate)),
            )
            .map(|descriptor| ConvBnRelu::new(descriptor, device))
            .collect();

        Ok(Aspp {
            branches,
            pooling: AsppPooling::new(self.in_channels, ASPP_CHANNELS, device),
            project: ConvBnRelu::new(
                conv1x1(ASPP_BRANCHES * ASPP_CHANNELS, ASPP_CHANNELS, 1),
                device,
            ),
            dropout: DropoutConfig::new(self.dropout).init(),
        })
    }
}

/// Image-level branch: global average pool, 1x1 conv, BN, ReLU, then broadcast back
/// to the input resolution.
#[derive(Module, Debug)]
pub struct AsppPooling<B: Backend> {
    pool: AdaptiveAvgPool2d,
    pub conv: ConvLayer<B>,
    pub bn: BatchNorm<B, 2>,
    relu: Relu,
}

impl<B: Backend> AsppPooling<B> {
    pub fn new(in_channels: usize, out_channels: usize, device: &B::Device) -> Self {
        Self {
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            conv: ConvLayer::new(conv1x1(in_channels, out_channels, 1), device),
            bn: BatchNormConfig::new(out_channels).init(device),
            relu: Relu::new(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [_, _, height, width] = x.dims();

        let x = self.pool.forward(x);
        let x = self.conv.forward(x);
        let x = self.bn.forward(x);
        let x = self.relu.forward(x);

        resize_bilinear(x, [height, width])
    }
}

/// Atrous Spatial Pyramid Pooling (ASPP) module.
#[derive(Module, Debug)]
pub struct Aspp<B: Backend> {
    /// 1x1 branch followed by the three atrous branches.
    pub branches: Vec<ConvBnRelu<B>>,
    pub pooling: AsppPooling<B>,
    pub project: ConvBnRelu<B>,
    dropout: Dropout,
}

impl<B: Backend> Aspp<B> {
    /// Concatenated branch outputs, `ASPP_BRANCHES * ASPP_CHANNELS` channels.
    pub fn pyramid(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut outputs: Vec<_> = self
            .branches
            .iter()
            .map(|branch| branch.forward(x.clone()))
            .collect();
        outputs.push(self.pooling.forward(x));

        Tensor::cat(outputs, 1)
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.pyramid(x);
        let x = self.project.forward(x);
        self.dropout.forward(x)
    }
}

impl<B: Backend> LoadParams<B> for AsppPooling<B> {
    /// Sequential layout: pool at 0, conv at 1, bn at 2.
    fn load_params(self, path: &str, loader: &mut ParamLoader<'_, B>) -> Self {
        Self {
            conv: self.conv.load_params(&join_path(path, "1"), loader),
            bn: self.bn.load_params(&join_path(path, "2"), loader),
            ..self
        }
    }
}

impl<B: Backend> LoadParams<B> for Aspp<B> {
    /// Branches live under `convs.{0..3}`, the pooling branch under `convs.4`.
    fn load_params(self, path: &str, loader: &mut ParamLoader<'_, B>) -> Self {
        let convs = join_path(path, "convs");
        let pooling_path = join_path(&convs, &self.branches.len().to_string());
        Self {
            branches: self.branches.load_params(&convs, loader),
            pooling: self.pooling.load_params(&pooling_path, loader),
            project: self.project.load_params(&join_path(path, "project"), loader),
            dropout: self.dropout,
        }
    }
}

impl<B: Backend> ConvertToSeparable<B> for AsppPooling<B> {
    fn convert_to_separable(self, device: &B::Device) -> Self {
        Self {
            conv: self.conv.convert_to_separable(device),
            ..self
        }
    }
}

impl<B: Backend> ConvertToSeparable<B> for Aspp<B> {
    fn convert_to_separable(self, device: &B::Device) -> Self {
        Self {
            branches: self.branches.convert_to_separable(device),
            pooling: self.pooling.convert_to_separable(device),
            project: self.project.convert_to_separable(device),
            dropout: self.dropout,
        }
    }
}
