//! Convolution building blocks shared by the backbone and the segmentation heads.
//!
//! - [`conv`]: shape-level operator descriptors and the standard factories.
//! - [`separable`]: dense / depthwise-separable convolution slots and the rewrite
//!   that turns one into the other.
//! - [`params`]: filling module trees from flat state dictionaries.

pub mod conv;
pub mod params;
pub mod separable;

pub use conv::{
    conv1x1, conv3x3, conv5x5, conv7x7, conv_transpose_double, kaiming_fan_out, max_pool3x3,
    OpDescriptor, OpKind,
};
pub use params::{join_path, load_state_dict, LoadParams, LoadReport, ParamLoader, StateDict};
pub use separable::{
    convert_to_separable_conv, ConvLayer, ConvertToSeparable, DenseConv, SeparableConv,
};
