use burn::{
    nn::{conv::ConvTranspose2d, BatchNorm, BatchNormConfig, Relu},
    prelude::*,
};
use burn_extra_ops::{conv_transpose_double, join_path, LoadParams, OpDescriptor, ParamLoader};

use crate::error::{ensure_power_of_two, DeepLabResult};

/// One stride-2 depthwise transposed convolution with BN and ReLU.
#[derive(Module, Debug)]
pub struct TransposedStage<B: Backend> {
    pub conv: ConvTranspose2d<B>,
    pub bn: BatchNorm<B, 2>,
    relu: Relu,
}

impl<B: Backend> TransposedStage<B> {
    pub fn new(descriptor: OpDescriptor, device: &B::Device) -> Self {
        Self {
            conv: descriptor.conv_transpose2d_config().init(device),
            bn: BatchNormConfig::new(descriptor.out_channels).init(device),
            relu: Relu::new(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = self.bn.forward(x);
        self.relu.forward(x)
    }
}

/// Cascade of `log2(factor)` resolution-doubling stages.
///
/// With `odd_last` the final stage uses a 3x3 kernel and produces `2 * n - 1`
/// pixels instead of `2 * n`. A factor of 1 yields an empty cascade, which is the
/// identity.
#[derive(Module, Debug)]
pub struct TransposedCascade<B: Backend> {
    pub stages: Vec<TransposedStage<B>>,
}

impl<B: Backend> TransposedCascade<B> {
    /// Stage descriptors for upsampling `channels` by `factor`.
    pub fn descriptors(
        channels: usize,
        factor: usize,
        odd_last: bool,
    ) -> DeepLabResult<Vec<OpDescriptor>> {
        ensure_power_of_two("upsampling factor", factor)?;

        let count = factor.trailing_zeros() as usize;
        Ok((0..count)
            .map(|index| {
                let kernel_size = if odd_last && index + 1 == count { 3 } else { 4 };
                conv_transpose_double(channels, channels, kernel_size, channels)
            })
            .collect())
    }

    pub fn new(
        channels: usize,
        factor: usize,
        odd_last: bool,
        device: &B::Device,
    ) -> DeepLabResult<Self> {
        let stages = Self::descriptors(channels, factor, odd_last)?
            .into_iter()
            .map(|descriptor| TransposedStage::new(descriptor, device))
            .collect();
        Ok(Self { stages })
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.stages.iter().fold(x, |x, stage| stage.forward(x))
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Loads from a sequential layout of `(conv, bn, relu)` triples starting at `first`.
    pub fn load_params_at(self, path: &str, first: usize, loader: &mut ParamLoader<'_, B>) -> Self {
        let stages = self
            .stages
            .into_iter()
            .enumerate()
            .map(|(index, stage)| {
                let conv = first + 3 * index;
                TransposedStage {
                    conv: stage
                        .conv
                        .load_params(&join_path(path, &conv.to_string()), loader),
                    bn: stage
                        .bn
                        .load_params(&join_path(path, &(conv + 1).to_string()), loader),
                    relu: stage.relu,
                }
            })
            .collect();
        Self { stages }
    }
}

impl<B: Backend> LoadParams<B> for TransposedCascade<B> {
    fn load_params(self, path: &str, loader: &mut ParamLoader<'_, B>) -> Self {
        self.load_params_at(path, 0, loader)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeepLabError;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_stage_count_and_kernels() {
        let plain = TransposedCascade::<TestBackend>::descriptors(256, 8, false).unwrap();
        assert_eq!(plain.len(), 3);
        assert!(plain.iter().all(|op| op.kernel_size == 4 && op.groups == 256));

        let odd = TransposedCascade::<TestBackend>::descriptors(256, 4, true).unwrap();
        assert_eq!(
            odd.iter().map(|op| op.kernel_size).collect::<Vec<_>>(),
            vec![4, 3]
        );

        assert!(TransposedCascade::<TestBackend>::descriptors(256, 1, true)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_rejects_non_power_of_two() {
        let err = TransposedCascade::<TestBackend>::descriptors(256, 6, false).unwrap_err();
        assert_eq!(
            err,
            DeepLabError::NotPowerOfTwo {
                name: "upsampling factor".to_string(),
                value: 6
            }
        );
    }

    #[test]
    fn test_forward_doubles_each_stage() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 4>::random([1, 8, 3, 5], Distribution::Default, &device);

        let cascade = TransposedCascade::<TestBackend>::new(8, 4, false, &device).unwrap();
        assert_eq!(cascade.forward(x.clone()).dims(), [1, 8, 12, 20]);

        let odd = TransposedCascade::<TestBackend>::new(8, 4, true, &device).unwrap();
        assert_eq!(odd.forward(x.clone()).dims(), [1, 8, 11, 19]);

        let identity = TransposedCascade::<TestBackend>::new(8, 1, false, &device).unwrap();
        assert!(identity.is_empty());
        assert_eq!(identity.forward(x).dims(), [1, 8, 3, 5]);
    }
}
