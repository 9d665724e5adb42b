//! # DeepLab-Burn
//!
//! DeepLabV3 and DeepLabV3+ semantic segmentation on ResNet backbones, built with
//! the Burn deep learning framework.
//!
//! ## Modules
//!
//! - `config`: [`DeepLabConfig`] with its presets and [`HeadKind`].
//! - `error`: the [`DeepLabError`] type.
//! - `models`: ASPP, the segmentation heads and the [`DeepLabV3`] model.
//!
//! ## Key Components
//!
//! - `DeepLabV3`: backbone features, head and a resize to the input resolution.
//! - `DeepLabHeadV3Plus` / `DeepLabHead`: the two segmentation heads.
//! - `Aspp`: Atrous Spatial Pyramid Pooling.

mod config;
mod error;
mod models;

#[doc(inline)]
pub use config::{DeepLabConfig, HeadKind};
#[doc(inline)]
pub use error::{DeepLabError, DeepLabResult};
#[doc(inline)]
pub use models::{
    resize_bilinear, Aspp, AsppConfig, AsppPooling, ConvBnRelu, DeepLabHead, DeepLabHeadConfig,
    DeepLabHeadV3Plus, DeepLabHeadV3PlusConfig, DeepLabV3, DeepLabV3Record, SegmentationHead,
    TransposedCascade, TransposedStage, V3PlusClassifier, ASPP_BRANCHES, ASPP_CHANNELS,
    LOW_LEVEL_PROJECTION,
};

#[cfg(test)]
mod tests;
