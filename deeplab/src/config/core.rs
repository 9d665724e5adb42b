//! Core configuration structure for DeepLab models.
//!
//! [`DeepLabConfig`] pairs a [`ResNetConfig`] with a head selection. The output
//! stride picks both the dilated stages of the backbone and the ASPP rates, so the
//! two always agree.

use burn::prelude::*;
use resnet::{ResNetConfig, ResNetError, ARCHITECTURES};

use super::enums::HeadKind;
use crate::error::{DeepLabError, DeepLabResult};
use crate::models::{DeepLabHeadConfig, DeepLabHeadV3PlusConfig};

/// Configuration of a full DeepLab segmentation model.
#[derive(Config, Debug)]
pub struct DeepLabConfig {
    #[config(default = "HeadKind::V3Plus")]
    pub head: HeadKind,
    /// Backbone options; `replace_stride_with_dilation` is overridden by
    /// `output_stride`.
    #[config(default = "ResNetConfig::resnet50()")]
    pub backbone: ResNetConfig,
    #[config(default = "21")]
    pub num_classes: usize,
    /// Stride of the backbone output relative to the input, 8 or 16.
    #[config(default = "16")]
    pub output_stride: usize,
    #[config(default = "false")]
    pub fl_transpose: bool,
    #[config(default = "false")]
    pub fl_transpose_odd: bool,
    /// Rewrite the head's spatial convolutions into depthwise-separable ones.
    #[config(default = "false")]
    pub separable_conv: bool,
}

impl DeepLabConfig {
    pub fn deeplabv3_resnet50() -> Self {
        Self::new().with_head(HeadKind::V3)
    }

    pub fn deeplabv3plus_resnet50() -> Self {
        Self::new()
    }

    pub fn deeplabv3plus_resnet101() -> Self {
        Self::new().with_backbone(ResNetConfig::resnet101())
    }

    /// Every name accepted by [`DeepLabConfig::from_preset`].
    pub fn preset_names() -> Vec<String> {
        [HeadKind::V3, HeadKind::V3Plus]
            .iter()
            .flat_map(|head| {
                ARCHITECTURES
                    .iter()
                    .map(move |arch| format!("{}_{arch}", head.prefix()))
            })
            .collect()
    }

    /// Builds a preset named `<head>_<architecture>`, e.g. `deeplabv3plus_resnet101`.
    pub fn from_preset(name: &str) -> DeepLabResult<Self> {
        let unknown = || DeepLabError::UnknownPreset {
            name: name.to_string(),
        };

        // "deeplabv3plus_" must be tried first, it shares its start with "deeplabv3".
        let (head, architecture) = [HeadKind::V3Plus, HeadKind::V3]
            .into_iter()
            .find_map(|head| {
                name.strip_prefix(head.prefix())
                    .and_then(|rest| rest.strip_prefix('_'))
                    .map(|architecture| (head, architecture))
            })
            .ok_or_else(unknown)?;

        let backbone = ResNetConfig::from_architecture(architecture).map_err(|err| match err {
            ResNetError::UnknownArchitecture { .. } => unknown(),
            other => other.into(),
        })?;

        Ok(Self::new().with_head(head).with_backbone(backbone))
    }

    pub fn validate(&self) -> DeepLabResult<()> {
        self.replace_stride_with_dilation()?;
        if self.num_classes == 0 {
            return Err(DeepLabError::InvalidConfiguration {
                reason: "num_classes must be positive".to_string(),
            });
        }
        self.backbone_config()?.validate()?;
        Ok(())
    }

    fn replace_stride_with_dilation(&self) -> DeepLabResult<Vec<bool>> {
        match self.output_stride {
            8 => Ok(vec![false, true, true]),
            16 => Ok(vec![false, false, true]),
            output_stride => Err(DeepLabError::UnsupportedOutputStride { output_stride }),
        }
    }

    /// ASPP dilation rates for the configured output stride.
    pub fn aspp_dilate(&self) -> DeepLabResult<[usize; 3]> {
        match self.output_stride {
            8 => Ok([12, 24, 36]),
            16 => Ok([6, 12, 18]),
            output_stride => Err(DeepLabError::UnsupportedOutputStride { output_stride }),
        }
    }

    /// The backbone configuration with dilated stages matching `output_stride`.
    pub fn backbone_config(&self) -> DeepLabResult<ResNetConfig> {
        Ok(self
            .backbone
            .clone()
            .with_replace_stride_with_dilation(self.replace_stride_with_dilation()?))
    }

    pub fn head_v3plus_config(&self) -> DeepLabResult<DeepLabHeadV3PlusConfig> {
        let backbone = self.backbone_config()?;
        let strides = backbone.feature_strides()?;

        Ok(DeepLabHeadV3PlusConfig::new(
            backbone.out_channels(),
            backbone.low_level_channels(),
            self.num_classes,
        )
        .with_aspp_dilate(self.aspp_dilate()?)
        .with_fl_transpose(self.fl_transpose)
        .with_fl_transpose_odd(self.fl_transpose_odd)
        .with_output_stride_lowlevel(strides.low_level)
        .with_output_stride_diff(strides.out / strides.low_level))
    }

    pub fn head_v3_config(&self) -> DeepLabResult<DeepLabHeadConfig> {
        Ok(DeepLabHeadConfig::new(self.backbone.out_channels(), self.num_classes)
            .with_aspp_dilate(self.aspp_dilate()?))
    }

    /// Checks that an input of `[height, width]` can run through the model.
    ///
    /// Interpolated upsampling accepts any size. The transposed cascade of the V3+
    /// head only multiplies by powers of two, so the upsampled `out` features must
    /// land exactly on the low-level resolution.
    pub fn check_input_size(&self, [height, width]: [usize; 2]) -> DeepLabResult<()> {
        let incompatible = || DeepLabError::IncompatibleInputSize { height, width };
        if height == 0 || width == 0 {
            return Err(incompatible());
        }
        if !self.fl_transpose || self.head != HeadKind::V3Plus {
            return Ok(());
        }

        let strides = self.backbone_config()?.feature_strides()?;
        let diff = strides.out / strides.low_level;
        for extent in [height, width] {
            let low_level = downsample(extent, strides.low_level);
            let out = downsample(low_level, diff);
            let upsampled = if self.fl_transpose_odd && diff > 1 {
                out * diff - 1
            } else {
                out * diff
            };
            if upsampled != low_level {
                return Err(incompatible());
            }
        }
        Ok(())
    }
}

/// Extent after `log2(stride)` stride-2 operators, each rounding up.
fn downsample(extent: usize, stride: usize) -> usize {
    (0..stride.trailing_zeros()).fold(extent, |extent, _| extent.div_ceil(2))
}
