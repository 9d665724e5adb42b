//! Configuration module for DeepLab.
//!
//! - `core`: the model configuration and its presets
//! - `enums`: enumeration types used in configurations

pub mod core;
pub mod enums;

pub use core::DeepLabConfig;
pub use enums::HeadKind;
