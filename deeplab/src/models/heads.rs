//! # Segmentation Heads
//!
//! `DeepLabHeadV3Plus` fuses projected low-level features with the upsampled ASPP
//! output before classifying. `DeepLabHead` classifies the ASPP output directly.
//!
//! Parameter paths follow the sequential layouts of the reference checkpoints:
//! `project.{0,1}`, `aspp.*`, `upsample_out.{3i,3i+1}` and `classifier.*` for
//! the V3+ head, `classifier.{0..4}` for the plain head.

use burn::prelude::*;
use burn_extra_ops::{
    conv1x1, conv3x3, join_path, ConvLayer, ConvertToSeparable, LoadParams, ParamLoader,
};
use resnet::BackboneFeatures;

use super::modules::{
    resize_bilinear, Aspp, AsppConfig, ConvBnRelu, TransposedCascade, ASPP_CHANNELS,
};
use crate::error::{ensure_power_of_two, DeepLabError, DeepLabResult};

/// Channels of the projected low-level features.
pub const LOW_LEVEL_PROJECTION: usize = 48;

fn ensure_positive(name: &str, value: usize) -> DeepLabResult<()> {
    if value == 0 {
        return Err(DeepLabError::InvalidConfiguration {
            reason: format!("{name} must be positive"),
        });
    }
    Ok(())
}

fn logits<B: Backend>(num_classes: usize, device: &B::Device) -> ConvLayer<B> {
    ConvLayer::new(conv1x1(ASPP_CHANNELS, num_classes, 1).with_bias(true), device)
}

/// Configuration for the [`DeepLabHeadV3Plus`] head.
#[derive(Config, Debug)]
pub struct DeepLabHeadV3PlusConfig {
    /// Channels of the backbone `out` features.
    pub in_channels: usize,
    /// Channels of the backbone `low_level` features.
    pub low_level_channels: usize,
    pub num_classes: usize,
    #[config(default = "[12, 24, 36]")]
    pub aspp_dilate: [usize; 3],
    /// Upsample with transposed convolutions instead of bilinear interpolation.
    #[config(default = "false")]
    pub fl_transpose: bool,
    /// Use a 3x3 kernel on the last stage of the ASPP upsampling cascade.
    #[config(default = "false")]
    pub fl_transpose_odd: bool,
    /// Stride of the low-level features relative to the input.
    #[config(default = "4")]
    pub output_stride_lowlevel: usize,
    /// Stride of `out` relative to `low_level`.
    #[config(default = "4")]
    pub output_stride_diff: usize,
}

impl DeepLabHeadV3PlusConfig {
    pub fn validate(&self) -> DeepLabResult<()> {
        ensure_positive("in_channels", self.in_channels)?;
        ensure_positive("low_level_channels", self.low_level_channels)?;
        ensure_positive("num_classes", self.num_classes)?;
        ensure_power_of_two("output_stride_lowlevel", self.output_stride_lowlevel)?;
        ensure_power_of_two("output_stride_diff", self.output_stride_diff)?;
        self.aspp_config().validate()
    }

    pub fn aspp_config(&self) -> AsppConfig {
        AsppConfig::new(self.in_channels).with_atrous_rates(self.aspp_dilate)
    }

    /// Initializes a new [`DeepLabHeadV3Plus`] head.
    pub fn init<B: Backend>(&self, device: &B::Device) -> DeepLabResult<DeepLabHeadV3Plus<B>> {
        self.validate()?;

        let upsample_out = if self.fl_transpose {
            Some(TransposedCascade::new(
                ASPP_CHANNELS,
                self.output_stride_diff,
                self.fl_transpose_odd,
                device,
            )?)
        } else {
            None
        };
        let upsample = if self.fl_transpose {
            Some(TransposedCascade::new(
                ASPP_CHANNELS,
                self.output_stride_lowlevel,
                false,
                device,
            )?)
        } else {
            None
        };

        Ok(DeepLabHeadV3Plus {
            project: ConvBnRelu::new(
                conv1x1(self.low_level_channels, LOW_LEVEL_PROJECTION, 1),
                device,
            ),
            aspp: self.aspp_config().init(device)?,
            upsample_out,
            classifier: V3PlusClassifier {
                fuse: ConvBnRelu::new(
                    conv3x3(LOW_LEVEL_PROJECTION + ASPP_CHANNELS, ASPP_CHANNELS, 1, 1, 1),
                    device,
                ),
                upsample,
                logits: logits(self.num_classes, device),
            },
        })
    }
}

/// Fusion convolution, optional upsampling cascade and the 1x1 classifier.
#[derive(Module, Debug)]
pub struct V3PlusClassifier<B: Backend> {
    pub fuse: ConvBnRelu<B>,
    pub upsample: Option<TransposedCascade<B>>,
    pub logits: ConvLayer<B>,
}

impl<B: Backend> V3PlusClassifier<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.fuse.forward(x);
        let x = match &self.upsample {
            Some(upsample) => upsample.forward(x),
            None => x,
        };
        self.logits.forward(x)
    }
}

/// DeepLabV3+ decoder head.
#[derive(Module, Debug)]
pub struct DeepLabHeadV3Plus<B: Backend> {
    pub project: ConvBnRelu<B>,
    pub aspp: Aspp<B>,
    /// Present when upsampling with transposed convolutions.
    pub upsample_out: Option<TransposedCascade<B>>,
    pub classifier: V3PlusClassifier<B>,
}

impl<B: Backend> DeepLabHeadV3Plus<B> {
    /// Projected low-level features concatenated with the upsampled ASPP output.
    pub fn fused_features(&self, features: BackboneFeatures<B>) -> Tensor<B, 4> {
        let low_level = self.project.forward(features.low_level);
        let out = self.aspp.forward(features.out);

        let out = match &self.upsample_out {
            Some(upsample) => upsample.forward(out),
            None => {
                let [_, _, height, width] = low_level.dims();
                resize_bilinear(out, [height, width])
            }
        };

        Tensor::cat(vec![low_level, out], 1)
    }

    pub fn forward(&self, features: BackboneFeatures<B>) -> Tensor<B, 4> {
        let x = self.fused_features(features);
        self.classifier.forward(x)
    }
}

/// Configuration for the [`DeepLabHead`] head.
#[derive(Config, Debug)]
pub struct DeepLabHeadConfig {
    pub in_channels: usize,
    pub num_classes: usize,
    #[config(default = "[12, 24, 36]")]
    pub aspp_dilate: [usize; 3],
}

impl DeepLabHeadConfig {
    pub fn validate(&self) -> DeepLabResult<()> {
        ensure_positive("in_channels", self.in_channels)?;
        ensure_positive("num_classes", self.num_classes)?;
        self.aspp_config().validate()
    }

    pub fn aspp_config(&self) -> AsppConfig {
        AsppConfig::new(self.in_channels).with_atrous_rates(self.aspp_dilate)
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> DeepLabResult<DeepLabHead<B>> {
        self.validate()?;

        Ok(DeepLabHead {
            aspp: self.aspp_config().init(device)?,
            fuse: ConvBnRelu::new(conv3x3(ASPP_CHANNELS, ASPP_CHANNELS, 1, 1, 1), device),
            logits: logits(self.num_classes, device),
        })
    }
}

/// DeepLabV3 head: ASPP, a 3x3 conv block and the classifier.
#[derive(Module, Debug)]
pub struct DeepLabHead<B: Backend> {
    pub aspp: Aspp<B>,
    pub fuse: ConvBnRelu<B>,
    pub logits: ConvLayer<B>,
}

impl<B: Backend> DeepLabHead<B> {
    pub fn forward(&self, features: BackboneFeatures<B>) -> Tensor<B, 4> {
        let x = self.aspp.forward(features.out);
        let x = self.fuse.forward(x);
        self.logits.forward(x)
    }
}

impl<B: Backend> LoadParams<B> for DeepLabHeadV3Plus<B> {
    fn load_params(self, path: &str, loader: &mut ParamLoader<'_, B>) -> Self {
        let classifier_path = join_path(path, "classifier");
        let classifier = self.classifier;

        let fuse = classifier.fuse.load_params_at(&classifier_path, 0, loader);
        let upsample = classifier
            .upsample
            .map(|upsample| upsample.load_params_at(&classifier_path, 3, loader));
        let logits_index = 3 + 3 * upsample.as_ref().map_or(0, TransposedCascade::len);
        let logits = classifier
            .logits
            .load_params(&join_path(&classifier_path, &logits_index.to_string()), loader);

        Self {
            project: self.project.load_params(&join_path(path, "project"), loader),
            aspp: self.aspp.load_params(&join_path(path, "aspp"), loader),
            upsample_out: self
                .upsample_out
                .load_params(&join_path(path, "upsample_out"), loader),
            classifier: V3PlusClassifier {
                fuse,
                upsample,
                logits,
            },
        }
    }
}

impl<B: Backend> LoadParams<B> for DeepLabHead<B> {
    fn load_params(self, path: &str, loader: &mut ParamLoader<'_, B>) -> Self {
        let classifier = join_path(path, "classifier");
        Self {
            aspp: self.aspp.load_params(&join_path(&classifier, "0"), loader),
            fuse: self.fuse.load_params_at(&classifier, 1, loader),
            logits: self.logits.load_params(&join_path(&classifier, "4"), loader),
        }
    }
}

impl<B: Backend> ConvertToSeparable<B> for V3PlusClassifier<B> {
    fn convert_to_separable(self, device: &B::Device) -> Self {
        Self {
            fuse: self.fuse.convert_to_separable(device),
            logits: self.logits.convert_to_separable(device),
            ..self
        }
    }
}

impl<B: Backend> ConvertToSeparable<B> for DeepLabHeadV3Plus<B> {
    /// Transposed convolutions are left as they are.
    fn convert_to_separable(self, device: &B::Device) -> Self {
        Self {
            project: self.project.convert_to_separable(device),
            aspp: self.aspp.convert_to_separable(device),
            upsample_out: self.upsample_out,
            classifier: self.classifier.convert_to_separable(device),
        }
    }
}

impl<B: Backend> ConvertToSeparable<B> for DeepLabHead<B> {
    fn convert_to_separable(self, device: &B::Device) -> Self {
        Self {
            aspp: self.aspp.convert_to_separable(device),
            fuse: self.fuse.convert_to_separable(device),
            logits: self.logits.convert_to_separable(device),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;
    use burn_extra_ops::{load_state_dict, StateDict};

    type TestBackend = NdArray<f32>;

    fn features(
        in_channels: usize,
        low_level_channels: usize,
        [height, width]: [usize; 2],
        ratio: usize,
    ) -> BackboneFeatures<TestBackend> {
        let device = Default::default();
        BackboneFeatures {
            out: Tensor::random(
                [1, in_channels, height, width],
                Distribution::Default,
                &device,
            ),
            low_level: Tensor::random(
                [1, low_level_channels, ratio * height, ratio * width],
                Distribution::Default,
                &device,
            ),
        }
    }

    #[test]
    fn test_v3plus_interpolated_output_matches_low_level() {
        let device = Default::default();
        let head = DeepLabHeadV3PlusConfig::new(2048, 256, 21)
            .init::<TestBackend>(&device)
            .unwrap();

        let logits = head.forward(features(2048, 256, [2, 3], 4));
        assert_eq!(logits.dims(), [1, 21, 8, 12]);
    }

    #[test]
    fn test_v3plus_fusion_has_304_channels() {
        let device = Default::default();
        let head = DeepLabHeadV3PlusConfig::new(32, 16, 3)
            .init::<TestBackend>(&device)
            .unwrap();

        let fused = head.fused_features(features(32, 16, [3, 3], 4));
        assert_eq!(fused.dims(), [1, 304, 12, 12]);
    }

    #[test]
    fn test_v3plus_transposed_upsampling() {
        let device = Default::default();
        let head = DeepLabHeadV3PlusConfig::new(32, 16, 5)
            .with_fl_transpose(true)
            .init::<TestBackend>(&device)
            .unwrap();

        assert_eq!(head.upsample_out.as_ref().map(TransposedCascade::len), Some(2));
        assert_eq!(
            head.classifier.upsample.as_ref().map(TransposedCascade::len),
            Some(2)
        );

        let logits = head.forward(features(32, 16, [2, 3], 4));
        assert_eq!(logits.dims(), [1, 5, 32, 48]);
    }

    #[test]
    fn test_v3plus_odd_transposed_upsampling() {
        let device = Default::default();
        let head = DeepLabHeadV3PlusConfig::new(32, 16, 5)
            .with_fl_transpose(true)
            .with_fl_transpose_odd(true)
            .with_output_stride_lowlevel(1)
            .init::<TestBackend>(&device)
            .unwrap();

        // 4 -> 8 -> 15 matches a low-level map of 15.
        let features = BackboneFeatures {
            out: Tensor::<TestBackend, 4>::random([1, 32, 4, 4], Distribution::Default, &device),
            low_level: Tensor::random([1, 16, 15, 15], Distribution::Default, &device),
        };
        assert_eq!(head.forward(features).dims(), [1, 5, 15, 15]);
    }

    #[test]
    fn test_v3plus_rejects_bad_strides() {
        let err = DeepLabHeadV3PlusConfig::new(32, 16, 5)
            .with_output_stride_diff(3)
            .validate()
            .unwrap_err();
        assert_eq!(
            err,
            DeepLabError::NotPowerOfTwo {
                name: "output_stride_diff".to_string(),
                value: 3
            }
        );

        let err = DeepLabHeadV3PlusConfig::new(32, 16, 0)
            .validate()
            .unwrap_err();
        assert!(matches!(err, DeepLabError::InvalidConfiguration { .. }));
    }

    #[test]
    fn test_deeplab_head_keeps_resolution() {
        let device = Default::default();
        let head = DeepLabHeadConfig::new(64, 7)
            .with_aspp_dilate([6, 12, 18])
            .init::<TestBackend>(&device)
            .unwrap();

        let logits = head.forward(features(64, 1, [5, 4], 1));
        assert_eq!(logits.dims(), [1, 7, 5, 4]);
    }

    #[test]
    fn test_separable_head_keeps_shapes() {
        let device = Default::default();
        let head = DeepLabHeadV3PlusConfig::new(32, 16, 4)
            .init::<TestBackend>(&device)
            .unwrap()
            .convert_to_separable(&device);

        assert!(!head.project.conv.is_separable());
        assert!(head.classifier.fuse.conv.is_separable());
        assert!(!head.classifier.logits.is_separable());
        assert_eq!(head.forward(features(32, 16, [2, 2], 4)).dims(), [1, 4, 8, 8]);
    }

    #[test]
    fn test_load_v3plus_classifier_paths() {
        let device = Default::default();
        let head = DeepLabHeadV3PlusConfig::new(8, 4, 3)
            .with_fl_transpose(true)
            .with_output_stride_lowlevel(2)
            .init::<TestBackend>(&device)
            .unwrap();

        let mut state = StateDict::new();
        state.insert(
            "classifier.3.weight".into(),
            TensorData::new(vec![0.5f32; 256 * 4 * 4], [256, 1, 4, 4]),
        );
        state.insert(
            "classifier.6.bias".into(),
            TensorData::new(vec![1.0f32, 2.0, 3.0], [3]),
        );
        state.insert(
            "upsample_out.4.running_var".into(),
            TensorData::new(vec![2.0f32; 256], [256]),
        );

        let (head, report) = load_state_dict(head, &state, &device);

        assert!(report.unexpected.is_empty(), "{:?}", report.unexpected);
        assert!(report.mismatched.is_empty(), "{:?}", report.mismatched);
        assert_eq!(report.applied.len(), 3);

        let ConvLayer::Dense(logits) = &head.classifier.logits else {
            panic!("expected a dense classifier");
        };
        logits
            .conv
            .bias
            .as_ref()
            .map(|bias| bias.val().to_data())
            .unwrap()
            .assert_eq(&TensorData::new(vec![1.0f32, 2.0, 3.0], [3]), true);
    }

    #[test]
    fn test_load_deeplab_head_paths() {
        let device = Default::default();
        let head = DeepLabHeadConfig::new(8, 2)
            .init::<TestBackend>(&device)
            .unwrap();

        let mut state = StateDict::new();
        state.insert(
            "classifier.0.convs.4.1.weight".into(),
            TensorData::new(vec![0.1f32; 256 * 8], [256, 8, 1, 1]),
        );
        state.insert(
            "classifier.2.weight".into(),
            TensorData::new(vec![1.0f32; 256], [256]),
        );
        state.insert(
            "classifier.4.weight".into(),
            TensorData::new(vec![0.0f32; 2 * 256], [2, 256, 1, 1]),
        );

        let (_, report) = load_state_dict(head, &state, &device);
        assert_eq!(report.applied.len(), 3);
        assert!(report.unexpected.is_empty());
    }
}
