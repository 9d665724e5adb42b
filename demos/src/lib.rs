//! DeepLab Demos
//!
//! Command line tools for building and inspecting DeepLab models.
//!
//! ```bash
//! # List presets and the backbone checkpoints they start from
//! cargo run --bin deeplab -- presets
//!
//! # Print the module tree of a preset with separable convolutions
//! cargo run --bin deeplab -- print --preset deeplabv3plus_resnet50 --separable
//!
//! # Run a dummy forward pass on the wgpu backend
//! cargo run --bin deeplab --no-default-features --features wgpu -- shapes --preset deeplabv3_resnet101
//! ```

pub mod backend;

pub use backend::{create_device, get_backend_name, SelectedBackend, SelectedDevice};
