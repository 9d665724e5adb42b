//! ImageNet checkpoints published for the torchvision ResNet family.
//!
//! Downloading is left to the caller; this module only knows where the weights live
//! and how their keys map onto [`ResNet`].

use std::collections::HashMap;

use burn::prelude::*;
use burn_extra_ops::{load_state_dict, LoadReport, StateDict};

use crate::{ResNet, StemKind};

/// Architecture name and checkpoint URL.
pub const MODEL_URLS: [(&str, &str); 9] = [
    (
        "resnet18",
        "https://download.pytorch.org/models/resnet18-5c106cde.pth",
    ),
    (
        "resnet34",
        "https://download.pytorch.org/models/resnet34-333f7ec4.pth",
    ),
    (
        "resnet50",
        "https://download.pytorch.org/models/resnet50-19c8e357.pth",
    ),
    (
        "resnet101",
        "https://download.pytorch.org/models/resnet101-5d3b4d8f.pth",
    ),
    (
        "resnet152",
        "https://download.pytorch.org/models/resnet152-b121ed2d.pth",
    ),
    (
        "resnext50_32x4d",
        "https://download.pytorch.org/models/resnext50_32x4d-7cdf4587.pth",
    ),
    (
        "resnext101_32x8d",
        "https://download.pytorch.org/models/resnext101_32x8d-8ba56ff5.pth",
    ),
    (
        "wide_resnet50_2",
        "https://download.pytorch.org/models/wide_resnet50_2-95faca4d.pth",
    ),
    (
        "wide_resnet101_2",
        "https://download.pytorch.org/models/wide_resnet101_2-32ee1156.pth",
    ),
];

/// Stem parameters as named by checkpoints that predate configurable stems.
pub const LEGACY_STEM_KEYS: [&str; 5] = [
    "conv1.weight",
    "bn1.weight",
    "bn1.bias",
    "bn1.running_mean",
    "bn1.running_var",
];

pub fn model_url(architecture: &str) -> Option<&'static str> {
    MODEL_URLS
        .iter()
        .find(|(name, _)| *name == architecture)
        .map(|(_, url)| *url)
}

/// Where the legacy stem parameters belong for a given stem, if anywhere.
///
/// The rich stem has no 7x7 convolution and is trained from scratch.
pub const fn legacy_stem_prefix(stem: StemKind) -> Option<&'static str> {
    match stem {
        StemKind::Classic => Some("stem"),
        StemKind::Parallel => Some("stem.classic"),
        StemKind::Rich => None,
    }
}

/// Moves the legacy stem keys under the prefix of `stem`.
///
/// Other keys are left untouched.
pub fn remap_legacy_stem_keys<T>(mut state: HashMap<String, T>, stem: StemKind) -> HashMap<String, T> {
    let Some(prefix) = legacy_stem_prefix(stem) else {
        return state;
    };
    for key in LEGACY_STEM_KEYS {
        if let Some(value) = state.remove(key) {
            state.insert(format!("{prefix}.{key}"), value);
        }
    }
    state
}

impl<B: Backend> ResNet<B> {
    /// Loads a torchvision-layout checkpoint with partial-match tolerance.
    ///
    /// Legacy stem keys are remapped first. Parameters without a matching key and
    /// shape keep their initialized values; unknown keys are ignored. Both are listed
    /// in the returned report.
    pub fn load_pretrained(self, state: StateDict, device: &B::Device) -> (Self, LoadReport) {
        let state = remap_legacy_stem_keys(state, self.stem.kind());
        let (model, report) = load_state_dict(self, &state, device);

        if !report.missing.is_empty() || !report.mismatched.is_empty() {
            tracing::warn!(
                missing = report.missing.len(),
                mismatched = report.mismatched.len(),
                "pretrained weights only partially applied"
            );
        }
        (model, report)
    }
}
