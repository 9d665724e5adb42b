use resnet::{ResNetConfig, ResNetError};

use crate::config::{DeepLabConfig, HeadKind};
use crate::error::DeepLabError;

#[test]
fn test_unsupported_output_stride() {
    let config = DeepLabConfig::new().with_output_stride(32);

    match config.validate() {
        Err(DeepLabError::UnsupportedOutputStride { output_stride }) => {
            assert_eq!(output_stride, 32);
        }
        other => panic!("Expected UnsupportedOutputStride error, got {other:?}"),
    }
}

#[test]
fn test_output_stride_drives_dilation_and_rates() {
    let os16 = DeepLabConfig::deeplabv3plus_resnet50();
    assert_eq!(
        os16.backbone_config().unwrap().replace_stride_with_dilation,
        vec![false, false, true]
    );
    assert_eq!(os16.aspp_dilate().unwrap(), [6, 12, 18]);

    let os8 = os16.with_output_stride(8);
    assert_eq!(
        os8.backbone_config().unwrap().replace_stride_with_dilation,
        vec![false, true, true]
    );
    assert_eq!(os8.aspp_dilate().unwrap(), [12, 24, 36]);
}

#[test]
fn test_head_config_follows_backbone() {
    let head = DeepLabConfig::deeplabv3plus_resnet101()
        .head_v3plus_config()
        .unwrap();
    assert_eq!(head.in_channels, 2048);
    assert_eq!(head.low_level_channels, 256);
    assert_eq!(head.output_stride_diff, 4);

    let head = DeepLabConfig::new()
        .with_backbone(ResNetConfig::resnet18())
        .with_output_stride(8)
        .head_v3plus_config()
        .unwrap();
    assert_eq!(head.in_channels, 512);
    assert_eq!(head.low_level_channels, 64);
    assert_eq!(head.output_stride_diff, 2);
}

#[test]
fn test_presets() {
    let config = DeepLabConfig::from_preset("deeplabv3_resnet50").unwrap();
    assert_eq!(config.head, HeadKind::V3);
    assert_eq!(config.backbone.layers, vec![3, 4, 6, 3]);

    let config = DeepLabConfig::from_preset("deeplabv3plus_wide_resnet50_2").unwrap();
    assert_eq!(config.head, HeadKind::V3Plus);
    assert_eq!(config.backbone.width_per_group, 128);

    let names = DeepLabConfig::preset_names();
    assert_eq!(names.len(), 18);
    for name in &names {
        assert!(DeepLabConfig::from_preset(name).is_ok(), "{name}");
    }
}

#[test]
fn test_unknown_preset() {
    for name in ["deeplabv3plus_vgg16", "deeplabv3", "fcn_resnet50", "deeplabv3plusresnet50"] {
        assert_eq!(
            DeepLabConfig::from_preset(name).unwrap_err(),
            DeepLabError::UnknownPreset {
                name: name.to_string()
            }
        );
    }
}

#[test]
fn test_backbone_errors_are_forwarded() {
    let config = DeepLabConfig::new().with_backbone(
        ResNetConfig::resnet50()
            .with_fl_richstem(true)
            .with_fl_parallelstem(true),
    );

    assert_eq!(
        config.validate().unwrap_err(),
        DeepLabError::Backbone(ResNetError::MutuallyExclusiveStems)
    );
}

#[test]
fn test_lowlevel_stride_follows_backbone() {
    let head = DeepLabConfig::new().head_v3plus_config().unwrap();
    assert_eq!(head.output_stride_lowlevel, 4);
    assert_eq!(head.output_stride_diff, 4);

    let head = DeepLabConfig::new()
        .with_backbone(ResNetConfig::resnet18().with_fl_maxpool(false))
        .head_v3plus_config()
        .unwrap();
    assert_eq!(head.output_stride_lowlevel, 2);
    assert_eq!(head.output_stride_diff, 4);
}

#[test]
fn test_input_size_under_transposed_upsampling() {
    let config = DeepLabConfig::new()
        .with_backbone(ResNetConfig::resnet18())
        .with_fl_transpose(true);

    assert_eq!(
        config.check_input_size([513, 512]),
        Err(DeepLabError::IncompatibleInputSize {
            height: 513,
            width: 512
        })
    );
    assert_eq!(config.check_input_size([512, 256]), Ok(()));
    assert!(config.check_input_size([0, 64]).is_err());

    // 508 -> 127 low-level -> 32 out, and 32 * 4 - 1 lands back on 127.
    let odd = config.clone().with_fl_transpose_odd(true);
    assert_eq!(odd.check_input_size([508, 508]), Ok(()));
    assert!(odd.check_input_size([512, 512]).is_err());
}

#[test]
fn test_input_size_unconstrained_without_transpose() {
    let config = DeepLabConfig::new().with_backbone(ResNetConfig::resnet18());
    assert_eq!(config.check_input_size([513, 513]), Ok(()));

    let v3 = config.with_head(HeadKind::V3).with_fl_transpose(true);
    assert_eq!(v3.check_input_size([513, 513]), Ok(()));
}

#[test]
fn test_zero_classes() {
    let config = DeepLabConfig::new().with_num_classes(0);

    match config.validate() {
        Err(DeepLabError::InvalidConfiguration { reason }) => {
            assert!(reason.contains("num_classes"));
        }
        other => panic!("Expected InvalidConfiguration error, got {other:?}"),
    }
}

#[test]
fn test_config_json_roundtrip() {
    use burn::config::Config;

    let config = DeepLabConfig::deeplabv3_resnet50().with_separable_conv(true);
    let json = config.to_string();
    let restored = DeepLabConfig::load_binary(json.as_bytes()).unwrap();

    assert_eq!(restored.head, HeadKind::V3);
    assert!(restored.separable_conv);
    assert_eq!(restored.backbone.layers, config.backbone.layers);
}
