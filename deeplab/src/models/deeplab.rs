//! # DeepLab Model Implementation
//!
//! [`DeepLabV3`] runs a [`ResNet`] backbone, hands its stage 1 and stage 4
//! features to a [`SegmentationHead`] and resizes the logits back to the input
//! resolution.

use burn::prelude::*;
use burn_extra_ops::{join_path, ConvertToSeparable, LoadParams, ParamLoader};
use resnet::{BackboneFeatures, ResNet};

use super::{modules::resize_bilinear, DeepLabHead, DeepLabHeadV3Plus};
use crate::config::{DeepLabConfig, HeadKind};
use crate::error::DeepLabResult;

/// The heads a [`DeepLabV3`] model can carry.
#[derive(Module, Debug)]
pub enum SegmentationHead<B: Backend> {
    V3(DeepLabHead<B>),
    V3Plus(DeepLabHeadV3Plus<B>),
}

impl<B: Backend> SegmentationHead<B> {
    pub fn forward(&self, features: BackboneFeatures<B>) -> Tensor<B, 4> {
        match self {
            Self::V3(head) => head.forward(features),
            Self::V3Plus(head) => head.forward(features),
        }
    }

    pub const fn kind(&self) -> HeadKind {
        match self {
            Self::V3(_) => HeadKind::V3,
            Self::V3Plus(_) => HeadKind::V3Plus,
        }
    }
}

impl<B: Backend> LoadParams<B> for SegmentationHead<B> {
    fn load_params(self, path: &str, loader: &mut ParamLoader<'_, B>) -> Self {
        match self {
            Self::V3(head) => Self::V3(head.load_params(path, loader)),
            Self::V3Plus(head) => Self::V3Plus(head.load_params(path, loader)),
        }
    }
}

impl<B: Backend> ConvertToSeparable<B> for SegmentationHead<B> {
    fn convert_to_separable(self, device: &B::Device) -> Self {
        match self {
            Self::V3(head) => Self::V3(head.convert_to_separable(device)),
            Self::V3Plus(head) => Self::V3Plus(head.convert_to_separable(device)),
        }
    }
}

impl DeepLabConfig {
    /// Initializes a [`DeepLabV3`] model.
    ///
    /// # Errors
    ///
    /// Returns an error if the head or the backbone configuration is invalid.
    pub fn init<B: Backend>(&self, device: &B::Device) -> DeepLabResult<DeepLabV3<B>> {
        self.validate()?;

        let backbone = self.backbone_config()?.init(device)?;
        let classifier = match self.head {
            HeadKind::V3 => SegmentationHead::V3(self.head_v3_config()?.init(device)?),
            HeadKind::V3Plus => SegmentationHead::V3Plus(self.head_v3plus_config()?.init(device)?),
        };

        let classifier = if self.separable_conv {
            tracing::info!(head = ?self.head, "converting head to separable convolutions");
            classifier.convert_to_separable(device)
        } else {
            classifier
        };

        tracing::info!(
            head = ?self.head,
            output_stride = self.output_stride,
            num_classes = self.num_classes,
            "assembled DeepLab model"
        );

        Ok(DeepLabV3 {
            backbone,
            classifier,
        })
    }
}

/// Backbone plus segmentation head.
#[derive(Module, Debug)]
pub struct DeepLabV3<B: Backend> {
    pub backbone: ResNet<B>,
    pub classifier: SegmentationHead<B>,
}

impl<B: Backend> DeepLabV3<B> {
    /// `[batch, 3, H, W]` to per-pixel logits `[batch, num_classes, H, W]`.
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let [_, _, height, width] = input.dims();

        let features = self.backbone.forward_features(input);
        let logits = self.classifier.forward(features);

        resize_bilinear(logits, [height, width])
    }
}

impl<B: Backend> LoadParams<B> for DeepLabV3<B> {
    fn load_params(self, path: &str, loader: &mut ParamLoader<'_, B>) -> Self {
        Self {
            backbone: self.backbone.load_params(&join_path(path, "backbone"), loader),
            classifier: self
                .classifier
                .load_params(&join_path(path, "classifier"), loader),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;
    use burn_extra_ops::{load_state_dict, StateDict};
    use resnet::ResNetConfig;

    type TestBackend = NdArray<f32>;

    fn small_config(head: HeadKind) -> DeepLabConfig {
        DeepLabConfig::new()
            .with_head(head)
            .with_backbone(ResNetConfig::resnet18())
            .with_num_classes(3)
    }

    #[test]
    fn test_v3plus_forward_matches_input_size() {
        let device = Default::default();
        let model = small_config(HeadKind::V3Plus)
            .init::<TestBackend>(&device)
            .unwrap();
        let input = Tensor::<TestBackend, 4>::random([1, 3, 40, 56], Distribution::Default, &device);

        assert_eq!(model.forward(input).dims(), [1, 3, 40, 56]);
    }

    #[test]
    fn test_v3_forward_with_output_stride_8() {
        let device = Default::default();
        let model = small_config(HeadKind::V3)
            .with_output_stride(8)
            .init::<TestBackend>(&device)
            .unwrap();
        assert_eq!(model.classifier.kind(), HeadKind::V3);
        assert_eq!(model.backbone.feature_strides().out, 8);

        let input = Tensor::<TestBackend, 4>::random([1, 3, 33, 33], Distribution::Default, &device);
        assert_eq!(model.forward(input).dims(), [1, 3, 33, 33]);
    }

    #[test]
    fn test_transposed_v3plus_forward() {
        let device = Default::default();
        let model = small_config(HeadKind::V3Plus)
            .with_fl_transpose(true)
            .init::<TestBackend>(&device)
            .unwrap();
        let input = Tensor::<TestBackend, 4>::random([1, 3, 64, 64], Distribution::Default, &device);

        assert_eq!(model.forward(input).dims(), [1, 3, 64, 64]);
    }

    #[test]
    fn test_transposed_head_without_maxpool() {
        let device = Default::default();
        let model = small_config(HeadKind::V3Plus)
            .with_backbone(ResNetConfig::resnet18().with_fl_maxpool(false))
            .with_fl_transpose(true)
            .init::<TestBackend>(&device)
            .unwrap();
        assert_eq!(model.backbone.feature_strides().low_level, 2);

        // The head alone must restore the full input resolution.
        let input = Tensor::<TestBackend, 4>::random([1, 3, 32, 32], Distribution::Default, &device);
        let logits = model
            .classifier
            .forward(model.backbone.forward_features(input));
        assert_eq!(logits.dims(), [1, 3, 32, 32]);
    }

    #[test]
    fn test_separable_head_only() {
        let device = Default::default();
        let model = small_config(HeadKind::V3Plus)
            .with_separable_conv(true)
            .init::<TestBackend>(&device)
            .unwrap();

        let SegmentationHead::V3Plus(head) = &model.classifier else {
            panic!("expected the V3+ head");
        };
        assert!(head.aspp.branches[1].conv.is_separable());
        // The backbone is not rewritten.
        let resnet::Stem::Classic(stem) = &model.backbone.stem else {
            panic!("expected the classic stem");
        };
        assert!(!stem.conv1.is_separable());
    }

    #[test]
    fn test_load_prefixes() {
        let device = Default::default();
        let model = small_config(HeadKind::V3Plus)
            .init::<TestBackend>(&device)
            .unwrap();

        let mut state = StateDict::new();
        state.insert(
            "backbone.layer1.0.bn1.running_mean".into(),
            TensorData::new(vec![0.5f32; 64], [64]),
        );
        state.insert(
            "classifier.project.1.weight".into(),
            TensorData::new(vec![1.0f32; 48], [48]),
        );

        let (_, report) = load_state_dict(model, &state, &device);
        assert_eq!(report.applied.len(), 2);
        assert!(report.unexpected.is_empty());
    }
}
