//! Enumeration types for DeepLab configuration.

use burn::prelude::*;

/// Selects the segmentation head placed on top of the backbone.
#[derive(Config, Debug, Copy, PartialEq, Eq)]
pub enum HeadKind {
    /// ASPP followed by a classifier on the stage 4 features.
    V3,
    /// ASPP fused with projected stage 1 features.
    V3Plus,
}

impl HeadKind {
    /// Preset name prefix.
    pub const fn prefix(&self) -> &'static str {
        match self {
            Self::V3 => "deeplabv3",
            Self::V3Plus => "deeplabv3plus",
        }
    }
}
