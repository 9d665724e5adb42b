use thiserror::Error;

/// Errors raised while validating or assembling a ResNet.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResNetError {
    /// Logically inconsistent configuration parameters.
    #[error("Invalid ResNet configuration: {reason}")]
    InvalidConfiguration {
        /// Why the configuration was rejected.
        reason: String,
    },

    /// Both the rich and the parallel stem were requested.
    #[error("fl_richstem and fl_parallelstem are mutually exclusive")]
    MutuallyExclusiveStems,

    /// `replace_stride_with_dilation` must hold one flag per strided stage.
    #[error("replace_stride_with_dilation must have 3 elements, got {len}")]
    InvalidDilationReplacement {
        /// Number of flags supplied.
        len: usize,
    },

    /// Basic blocks only exist for the plain ResNet width.
    #[error("BasicBlock only supports groups=1 and base_width=64, got groups={groups} and base_width={base_width}")]
    UnsupportedBasicBlock { groups: usize, base_width: usize },

    /// The learned feature extraction pattern of a stage has fewer entries than blocks.
    #[error("stage {stage} has {blocks} blocks but its LFE schedule only covers {factors}")]
    LfeScheduleTooShort {
        stage: usize,
        blocks: usize,
        factors: usize,
    },

    /// The dilation bookkeeping produced a dilation that is not a positive integer.
    #[error("stage {stage} resolved to an invalid dilation of {dilation}")]
    InvalidDilation { stage: usize, dilation: usize },

    /// No preset exists under the given name.
    #[error("Unknown ResNet architecture: {name}")]
    UnknownArchitecture {
        /// The requested architecture name.
        name: String,
    },
}

/// A specialized `Result` type for ResNet construction.
pub type ResNetResult<T> = Result<T, ResNetError>;
