//! # Model Architectures
//!
//! - `modules`: ASPP, conv-BN-ReLU blocks and upsampling cascades.
//! - `heads`: the DeepLabV3 and DeepLabV3+ segmentation heads.
//! - `deeplab`: the [`DeepLabV3`] model combining a ResNet backbone with a head.

pub mod deeplab;
pub mod heads;
pub mod modules;

pub use deeplab::*;
pub use heads::*;
pub use modules::*;
