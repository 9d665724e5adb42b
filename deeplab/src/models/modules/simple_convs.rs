use burn::{
    nn::{BatchNorm, BatchNormConfig, Relu},
    prelude::*,
};
use burn_extra_ops::{
    join_path, ConvLayer, ConvertToSeparable, LoadParams, OpDescriptor, ParamLoader,
};

/// Convolution, batch norm and ReLU.
#[derive(Module, Debug)]
pub struct ConvBnRelu<B: Backend> {
    pub conv: ConvLayer<B>,
    pub bn: BatchNorm<B, 2>,
    relu: Relu,
}

impl<B: Backend> ConvBnRelu<B> {
    pub fn new(descriptor: OpDescriptor, device: &B::Device) -> Self {
        Self {
            conv: ConvLayer::new(descriptor, device),
            bn: BatchNormConfig::new(descriptor.out_channels).init(device),
            relu: Relu::new(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = self.bn.forward(x);
        self.relu.forward(x)
    }

    pub fn out_channels(&self) -> usize {
        self.conv.channels()[1]
    }

    /// Loads from a sequential layout where the convolution sits at index `first`
    /// and the batch norm right after it.
    pub fn load_params_at(self, path: &str, first: usize, loader: &mut ParamLoader<'_, B>) -> Self {
        Self {
            conv: self
                .conv
                .load_params(&join_path(path, &first.to_string()), loader),
            bn: self
                .bn
                .load_params(&join_path(path, &(first + 1).to_string()), loader),
            relu: self.relu,
        }
    }
}

impl<B: Backend> LoadParams<B> for ConvBnRelu<B> {
    fn load_params(self, path: &str, loader: &mut ParamLoader<'_, B>) -> Self {
        self.load_params_at(path, 0, loader)
    }
}

impl<B: Backend> ConvertToSeparable<B> for ConvBnRelu<B> {
    fn convert_to_separable(self, device: &B::Device) -> Self {
        Self {
            conv: self.conv.convert_to_separable(device),
            ..self
        }
    }
}
