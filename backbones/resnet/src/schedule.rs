//! Stride and dilation bookkeeping for the four residual stages.
//!
//! A running dilation accumulator is threaded through the stages: each call to
//! [`plan_stage`] takes the accumulator left by the previous stage and returns the
//! updated one next to the stage plan.

use crate::error::{ResNetError, ResNetResult};

/// Learned feature extraction dilation factors for stages 2 to 4.
///
/// Factor 1 maps to dilation 1, factor 2 to the accumulator, factor 3 to
/// `2 * accumulator - 1`.
pub const fn lfe_factors(stage: usize) -> Option<&'static [usize]> {
    match stage {
        2 => Some(&[1, 2, 2, 1]),
        3 => Some(&[1, 2, 3, 3, 2, 1]),
        4 => Some(&[1, 2, 1]),
        _ => None,
    }
}

/// Global switches that shape every stage's dilations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DilationPolicy {
    /// Use the learned feature extraction schedule for stages 2 to 4.
    pub lfe: bool,
    /// Output-stride ratio consumed by the stage 3 accumulator reset.
    pub output_stride_diff: usize,
}

impl Default for DilationPolicy {
    fn default() -> Self {
        Self {
            lfe: false,
            output_stride_diff: 8,
        }
    }
}

/// What a stage asks for before dilation replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageSpec {
    /// 1-based stage index.
    pub stage: usize,
    pub in_planes: usize,
    pub planes: usize,
    pub expansion: usize,
    pub blocks: usize,
    pub stride: usize,
    /// Replace the stride with dilation.
    pub dilate: bool,
}

/// Resolved layout of one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagePlan {
    pub stage: usize,
    pub in_planes: usize,
    pub planes: usize,
    /// Stride of the first block; the others use 1.
    pub stride: usize,
    /// One dilation per block.
    pub dilations: Vec<usize>,
    /// Whether the first block needs a projection shortcut.
    pub downsample: bool,
}

impl StagePlan {
    pub const fn out_planes(&self, expansion: usize) -> usize {
        self.planes * expansion
    }
}

/// A projection shortcut is needed iff the block changes resolution or width.
pub const fn needs_downsample(stride: usize, in_planes: usize, out_planes: usize) -> bool {
    stride != 1 || in_planes != out_planes
}

/// Plans one stage and returns it with the updated dilation accumulator.
pub fn plan_stage(
    spec: &StageSpec,
    policy: &DilationPolicy,
    accumulator: usize,
) -> ResNetResult<(StagePlan, usize)> {
    let schedule = if policy.lfe {
        lfe_factors(spec.stage)
    } else {
        None
    };

    let previous = accumulator;
    let mut accumulator = accumulator;
    let mut stride = spec.stride;

    if spec.dilate {
        if policy.lfe && spec.stage > 2 {
            if spec.stage == 3 {
                // Resets against the global output-stride ratio, not the current one.
                accumulator = policy
                    .output_stride_diff
                    .checked_div(accumulator)
                    .unwrap_or(0);
            } else if accumulator > 1 {
                accumulator /= stride;
            }
        } else {
            accumulator *= stride;
        }
        stride = 1;
    }

    let dilations: Vec<usize> = match schedule {
        Some(factors) => {
            if factors.len() < spec.blocks {
                return Err(ResNetError::LfeScheduleTooShort {
                    stage: spec.stage,
                    blocks: spec.blocks,
                    factors: factors.len(),
                });
            }
            factors
                .iter()
                .take(spec.blocks)
                .map(|factor| match factor {
                    1 => 1,
                    2 => accumulator,
                    _ => (2 * accumulator).saturating_sub(1),
                })
                .collect()
        }
        None => core::iter::once(previous)
            .chain(core::iter::repeat(accumulator).take(spec.blocks.saturating_sub(1)))
            .collect(),
    };

    if let Some(&dilation) = dilations.iter().find(|&&dilation| dilation == 0) {
        return Err(ResNetError::InvalidDilation {
            stage: spec.stage,
            dilation,
        });
    }

    let plan = StagePlan {
        stage: spec.stage,
        in_planes: spec.in_planes,
        planes: spec.planes,
        stride,
        downsample: needs_downsample(stride, spec.in_planes, spec.planes * spec.expansion),
        dilations,
    };

    tracing::debug!(
        stage = plan.stage,
        stride = plan.stride,
        dilations = ?plan.dilations,
        downsample = plan.downsample,
        accumulator,
        "planned stage"
    );

    Ok((plan, accumulator))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(stage: usize, blocks: usize, dilate: bool) -> StageSpec {
        StageSpec {
            stage,
            in_planes: 256,
            planes: 128,
            expansion: 4,
            blocks,
            stride: 2,
            dilate,
        }
    }

    #[test]
    fn test_plain_stage_keeps_previous_dilation() {
        let policy = DilationPolicy::default();
        let (plan, accumulator) = plan_stage(&spec(2, 4, false), &policy, 1).unwrap();

        assert_eq!(accumulator, 1);
        assert_eq!(plan.stride, 2);
        assert_eq!(plan.dilations, vec![1, 1, 1, 1]);
        assert!(plan.downsample);
    }

    #[test]
    fn test_dilated_stage_folds_stride_into_accumulator() {
        let policy = DilationPolicy::default();
        let (plan, accumulator) = plan_stage(&spec(3, 6, true), &policy, 1).unwrap();

        assert_eq!(accumulator, 2);
        assert_eq!(plan.stride, 1);
        // First block keeps the incoming dilation.
        assert_eq!(plan.dilations, vec![1, 2, 2, 2, 2, 2]);

        let (plan, accumulator) = plan_stage(&spec(4, 3, true), &policy, accumulator).unwrap();
        assert_eq!(accumulator, 4);
        assert_eq!(plan.dilations, vec![2, 4, 4]);
    }

    #[test]
    fn test_downsample_on_width_change_only() {
        let policy = DilationPolicy::default();
        let stage = StageSpec {
            stage: 1,
            in_planes: 64,
            planes: 64,
            expansion: 1,
            blocks: 2,
            stride: 1,
            dilate: false,
        };
        let (plan, _) = plan_stage(&stage, &policy, 1).unwrap();
        assert!(!plan.downsample);

        let (plan, _) = plan_stage(&StageSpec { expansion: 4, ..stage }, &policy, 1).unwrap();
        assert!(plan.downsample);

        // Dilated stage at constant width: stride 1, no projection.
        let dilated = StageSpec {
            stage: 3,
            in_planes: 256,
            planes: 256,
            expansion: 1,
            blocks: 2,
            stride: 2,
            dilate: true,
        };
        let (plan, _) = plan_stage(&dilated, &policy, 1).unwrap();
        assert!(!plan.downsample);
    }

    #[test]
    fn test_lfe_stage2_at_unit_accumulator() {
        let policy = DilationPolicy {
            lfe: true,
            output_stride_diff: 8,
        };
        let (plan, accumulator) = plan_stage(&spec(2, 4, false), &policy, 1).unwrap();
        assert_eq!(accumulator, 1);
        assert_eq!(plan.dilations, vec![1, 1, 1, 1]);
    }

    #[test]
    fn test_lfe_stage3_resets_against_output_stride_diff() {
        let policy = DilationPolicy {
            lfe: true,
            output_stride_diff: 8,
        };
        // Accumulator coming out of a dilated stage 2.
        let (plan, accumulator) = plan_stage(&spec(3, 6, true), &policy, 2).unwrap();
        assert_eq!(accumulator, 8 / 2);
        assert_eq!(plan.stride, 1);
        assert_eq!(plan.dilations, vec![1, 4, 7, 7, 4, 1]);

        // Stage 4 divides by the stride once the accumulator exceeds 1.
        let (plan, accumulator) = plan_stage(&spec(4, 3, true), &policy, accumulator).unwrap();
        assert_eq!(accumulator, 2);
        assert_eq!(plan.dilations, vec![1, 2, 1]);

        // ... and leaves a unit accumulator alone.
        let (_, accumulator) = plan_stage(&spec(4, 3, true), &policy, 1).unwrap();
        assert_eq!(accumulator, 1);
    }

    #[test]
    fn test_lfe_stage3_reset_is_not_relative_to_incoming_stride() {
        // The reset ignores the stage's own stride entirely; a large accumulator
        // collapses to a dilation below the incoming one.
        let policy = DilationPolicy {
            lfe: true,
            output_stride_diff: 4,
        };
        let (_, accumulator) = plan_stage(&spec(3, 6, true), &policy, 4).unwrap();
        assert_eq!(accumulator, 1);

        let err = plan_stage(&spec(3, 6, true), &policy, 8).unwrap_err();
        assert_eq!(
            err,
            ResNetError::InvalidDilation {
                stage: 3,
                dilation: 0
            }
        );
    }

    #[test]
    fn test_lfe_schedule_too_short() {
        let policy = DilationPolicy {
            lfe: true,
            output_stride_diff: 8,
        };
        let err = plan_stage(&spec(3, 23, false), &policy, 1).unwrap_err();
        assert_eq!(
            err,
            ResNetError::LfeScheduleTooShort {
                stage: 3,
                blocks: 23,
                factors: 6
            }
        );

        // Longer schedules are truncated.
        let (plan, _) = plan_stage(&spec(3, 2, false), &policy, 1).unwrap();
        assert_eq!(plan.dilations, vec![1, 1]);
    }

    #[test]
    fn test_lfe_does_not_touch_stage1() {
        let policy = DilationPolicy {
            lfe: true,
            output_stride_diff: 8,
        };
        let stage = StageSpec {
            stage: 1,
            in_planes: 64,
            planes: 64,
            expansion: 4,
            blocks: 3,
            stride: 1,
            dilate: false,
        };
        let (plan, _) = plan_stage(&stage, &policy, 1).unwrap();
        assert_eq!(plan.dilations, vec![1, 1, 1]);
        assert_eq!(lfe_factors(1), None);
    }
}
