//! Dense and depthwise-separable convolution layers, and the rewrite between them.

use burn::{
    module::{Ignored, Module},
    nn::{conv::Conv2d, Initializer},
    prelude::*,
};

use crate::conv::{kaiming_fan_out, OpDescriptor};

/// A single 2d convolution that remembers the descriptor it was built from.
#[derive(Module, Debug)]
pub struct DenseConv<B: Backend> {
    pub conv: Conv2d<B>,
    descriptor: Ignored<OpDescriptor>,
}

impl<B: Backend> DenseConv<B> {
    /// Builds the convolution with He/Kaiming fan-out initialization.
    pub fn new(descriptor: OpDescriptor, device: &B::Device) -> Self {
        Self::with_initializer(descriptor, kaiming_fan_out(), device)
    }

    pub fn with_initializer(
        descriptor: OpDescriptor,
        initializer: Initializer,
        device: &B::Device,
    ) -> Self {
        Self {
            conv: descriptor
                .conv2d_config()
                .with_initializer(initializer)
                .init(device),
            descriptor: Ignored(descriptor),
        }
    }

    pub fn descriptor(&self) -> OpDescriptor {
        self.descriptor.0
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.conv.forward(x)
    }
}

/// Depthwise convolution followed by a pointwise convolution.
///
/// `body[0]` is always the depthwise operator and the last element the pointwise one.
/// Repeated rewriting can insert more stages in between.
#[derive(Module, Debug)]
pub struct SeparableConv<B: Backend> {
    pub body: Vec<DenseConv<B>>,
}

impl<B: Backend> SeparableConv<B> {
    /// Factorizes `descriptor` into a fresh depthwise + pointwise pair.
    pub fn new(descriptor: OpDescriptor, device: &B::Device) -> Self {
        Self {
            body: vec![
                DenseConv::new(descriptor.depthwise(), device),
                DenseConv::new(descriptor.pointwise(), device),
            ],
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.body.iter().fold(x, |x, conv| conv.forward(x))
    }

    pub fn descriptors(&self) -> Vec<OpDescriptor> {
        self.body.iter().map(DenseConv::descriptor).collect()
    }
}

/// A convolution slot that is either a dense operator or its separable factorization.
#[derive(Module, Debug)]
pub enum ConvLayer<B: Backend> {
    Dense(DenseConv<B>),
    Separable(SeparableConv<B>),
}

impl<B: Backend> ConvLayer<B> {
    pub fn new(descriptor: OpDescriptor, device: &B::Device) -> Self {
        Self::Dense(DenseConv::new(descriptor, device))
    }

    pub fn with_initializer(
        descriptor: OpDescriptor,
        initializer: Initializer,
        device: &B::Device,
    ) -> Self {
        Self::Dense(DenseConv::with_initializer(descriptor, initializer, device))
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        match self {
            Self::Dense(conv) => conv.forward(x),
            Self::Separable(conv) => conv.forward(x),
        }
    }

    /// Descriptors of the operators applied, in order.
    pub fn descriptors(&self) -> Vec<OpDescriptor> {
        match self {
            Self::Dense(conv) => vec![conv.descriptor()],
            Self::Separable(conv) => conv.descriptors(),
        }
    }

    pub const fn is_separable(&self) -> bool {
        matches!(self, Self::Separable(_))
    }

    /// Channels in and out of the whole slot.
    pub fn channels(&self) -> [usize; 2] {
        let descriptors = self.descriptors();
        match (descriptors.first(), descriptors.last()) {
            (Some(first), Some(last)) => [first.in_channels, last.out_channels],
            _ => [0, 0],
        }
    }
}

/// Rewrites every spatial dense convolution of a module into a separable one.
///
/// The rewrite consumes the module and returns the converted one. Converted
/// operators are freshly initialized; learned weights of replaced convolutions are
/// not carried over. 1x1 convolutions are left untouched. Applying the rewrite to an
/// already separable module factorizes its depthwise stage again, so the rewrite is
/// not idempotent.
pub trait ConvertToSeparable<B: Backend>: Sized {
    fn convert_to_separable(self, device: &B::Device) -> Self;
}

impl<B: Backend> ConvertToSeparable<B> for DenseConv<B> {
    /// A lone `DenseConv` has no room for two operators, so it is returned as is.
    fn convert_to_separable(self, _device: &B::Device) -> Self {
        self
    }
}

impl<B: Backend> ConvertToSeparable<B> for SeparableConv<B> {
    /// New stages are spliced into `body` in place, so the result stays flat. A
    /// twice-converted slot is addressed as `body.{0,1,2}` (depthwise, 1x1 in->in,
    /// pointwise), not as a nested `body.0.body.{0,1}` followed by `body.1`.
    fn convert_to_separable(self, device: &B::Device) -> Self {
        let body = self
            .body
            .into_iter()
            .flat_map(|conv| {
                let descriptor = conv.descriptor();
                if descriptor.is_spatial() {
                    vec![
                        DenseConv::new(descriptor.depthwise(), device),
                        DenseConv::new(descriptor.pointwise(), device),
                    ]
                } else {
                    vec![conv]
                }
            })
            .collect();
        Self { body }
    }
}

impl<B: Backend> ConvertToSeparable<B> for ConvLayer<B> {
    fn convert_to_separable(self, device: &B::Device) -> Self {
        match self {
            Self::Dense(conv) if conv.descriptor().is_spatial() => {
                Self::Separable(SeparableConv::new(conv.descriptor(), device))
            }
            Self::Dense(conv) => Self::Dense(conv),
            Self::Separable(conv) => Self::Separable(conv.convert_to_separable(device)),
        }
    }
}

impl<B: Backend, M: ConvertToSeparable<B>> ConvertToSeparable<B> for Option<M> {
    fn convert_to_separable(self, device: &B::Device) -> Self {
        self.map(|module| module.convert_to_separable(device))
    }
}

impl<B: Backend, M: ConvertToSeparable<B>> ConvertToSeparable<B> for Vec<M> {
    fn convert_to_separable(self, device: &B::Device) -> Self {
        self.into_iter()
            .map(|module| module.convert_to_separable(device))
            .collect()
    }
}

/// Function form of [`ConvertToSeparable::convert_to_separable`].
pub fn convert_to_separable_conv<B: Backend, M: ConvertToSeparable<B>>(
    module: M,
    device: &B::Device,
) -> M {
    module.convert_to_separable(device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conv::{conv1x1, conv3x3};
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_dense_forward_shape() {
        let device = Default::default();
        let layer = ConvLayer::<TestBackend>::new(conv3x3(8, 16, 2, 1, 1), &device);
        let x = Tensor::<TestBackend, 4>::random([2, 8, 9, 9], Distribution::Default, &device);

        assert_eq!(layer.forward(x).dims(), [2, 16, 5, 5]);
        assert!(!layer.is_separable());
        assert_eq!(layer.channels(), [8, 16]);
    }

    #[test]
    fn test_spatial_conv_becomes_separable() {
        let device = Default::default();
        let descriptor = conv3x3(8, 16, 1, 1, 2);
        let layer = ConvLayer::<TestBackend>::new(descriptor, &device)
            .convert_to_separable(&device);

        assert!(layer.is_separable());
        assert_eq!(
            layer.descriptors(),
            vec![descriptor.depthwise(), descriptor.pointwise()]
        );

        let x = Tensor::<TestBackend, 4>::random([1, 8, 10, 7], Distribution::Default, &device);
        assert_eq!(layer.forward(x).dims(), [1, 16, 10, 7]);
    }

    #[test]
    fn test_pointwise_conv_is_untouched() {
        let device = Default::default();
        let layer = ConvLayer::<TestBackend>::new(conv1x1(8, 16, 1), &device);
        let converted = convert_to_separable_conv(layer, &device);

        assert!(!converted.is_separable());
        assert_eq!(converted.descriptors(), vec![conv1x1(8, 16, 1)]);
    }

    #[test]
    fn test_containers_are_traversed() {
        let device = Default::default();
        let layers = vec![
            ConvLayer::<TestBackend>::new(conv3x3(4, 4, 1, 1, 1), &device),
            ConvLayer::new(conv1x1(4, 8, 1), &device),
        ];
        let converted = layers.convert_to_separable(&device);
        assert!(converted[0].is_separable());
        assert!(!converted[1].is_separable());

        let missing: Option<ConvLayer<TestBackend>> = None;
        assert!(missing.convert_to_separable(&device).is_none());
    }

    #[test]
    fn test_second_rewrite_refactorizes_depthwise_stage() {
        let device = Default::default();
        let descriptor = conv3x3(8, 16, 1, 1, 1);
        let once = ConvLayer::<TestBackend>::new(descriptor, &device).convert_to_separable(&device);
        let twice = once.convert_to_separable(&device);

        // depthwise -> (depthwise, 1x1 in->in), pointwise stays.
        let descriptors = twice.descriptors();
        assert_eq!(descriptors.len(), 3);
        assert_eq!(descriptors[0], descriptor.depthwise());
        assert_eq!(descriptors[1], conv1x1(8, 8, 1));
        assert_eq!(descriptors[2], descriptor.pointwise());
        assert_eq!(twice.channels(), [8, 16]);
    }
}
