use resnet::ResNetError;
use thiserror::Error;

/// The error type for DeepLab construction.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeepLabError {
    /// Logically inconsistent configuration parameters.
    #[error("Invalid model configuration: {reason}")]
    InvalidConfiguration {
        /// The reason why the configuration is invalid.
        reason: String,
    },

    /// An upsampling factor that cannot be reached with stride-2 stages.
    #[error("{name} must be a power of two, got {value}")]
    NotPowerOfTwo {
        /// The offending option.
        name: String,
        value: usize,
    },

    /// Only output strides 8 and 16 have a dilation layout.
    #[error("Unsupported output stride: {output_stride}. Only 8 and 16 are supported.")]
    UnsupportedOutputStride { output_stride: usize },

    /// The transposed upsampling path cannot line up features for this input.
    #[error("Input size {height}x{width} is incompatible with transposed upsampling")]
    IncompatibleInputSize { height: usize, width: usize },

    /// No preset exists under the given name.
    #[error("Unknown model preset: {name}")]
    UnknownPreset {
        /// The requested preset name.
        name: String,
    },

    /// The backbone configuration was rejected.
    #[error(transparent)]
    Backbone(#[from] ResNetError),
}

/// A specialized `Result` type for DeepLab operations.
pub type DeepLabResult<T> = Result<T, DeepLabError>;

/// Checks that `value` is a power of two (1 included).
pub(crate) fn ensure_power_of_two(name: &str, value: usize) -> DeepLabResult<()> {
    if value.is_power_of_two() {
        Ok(())
    } else {
        Err(DeepLabError::NotPowerOfTwo {
            name: name.to_string(),
            value,
        })
    }
}
