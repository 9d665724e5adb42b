//! DeepLab model inspection tool.
//!
//! ```bash
//! cargo run --bin deeplab -- shapes --preset deeplabv3plus_resnet50 --height 513 --width 513
//! cargo run --bin deeplab -- config --preset deeplabv3_resnet50 --output-stride 8 --output os8.json
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use burn::{prelude::*, tensor::Distribution};
use clap::{Args, Parser, Subcommand};
use deeplab::{DeepLabConfig, DeepLabV3};
use deeplab_demos::{create_device, get_backend_name, SelectedBackend, SelectedDevice};
use resnet::pretrained::model_url;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "deeplab")]
#[command(about = "DeepLabV3 / DeepLabV3+ segmentation models on ResNet backbones")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Options shared by the commands that build a model.
#[derive(Args, Debug)]
struct ModelArgs {
    /// Preset name, e.g. "deeplabv3plus_resnet50" (see `presets`)
    #[arg(short, long, default_value = "deeplabv3plus_resnet50")]
    preset: String,

    /// Backbone output stride (8 or 16)
    #[arg(long, default_value_t = 16)]
    output_stride: usize,

    /// Number of segmentation classes
    #[arg(long, default_value_t = 21)]
    num_classes: usize,

    /// Rewrite the head convolutions into depthwise-separable ones
    #[arg(long)]
    separable: bool,

    /// Upsample with transposed convolutions
    #[arg(long)]
    transpose: bool,
}

impl ModelArgs {
    fn config(&self) -> Result<DeepLabConfig> {
        let config = DeepLabConfig::from_preset(&self.preset)?
            .with_output_stride(self.output_stride)
            .with_num_classes(self.num_classes)
            .with_separable_conv(self.separable)
            .with_fl_transpose(self.transpose);
        config.validate()?;
        Ok(config)
    }

    fn build(&self, device: &SelectedDevice) -> Result<DeepLabV3<SelectedBackend>> {
        let model = self
            .config()?
            .init(device)
            .with_context(|| format!("Failed to build preset {}", self.preset))?;
        Ok(model)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Show backend information
    Info,

    /// List the available presets
    Presets,

    /// Build a model and print its module tree
    Print {
        #[command(flatten)]
        model: ModelArgs,
    },

    /// Run a random input through a model and report tensor shapes
    Shapes {
        #[command(flatten)]
        model: ModelArgs,

        #[arg(long, default_value_t = 1)]
        batch: usize,

        #[arg(long, default_value_t = 513)]
        height: usize,

        #[arg(long, default_value_t = 513)]
        width: usize,
    },

    /// Save a model configuration as JSON
    Config {
        #[command(flatten)]
        model: ModelArgs,

        /// Output file
        #[arg(short, long)]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let device = create_device();
    tracing::info!(backend = get_backend_name(), "initialized device");

    match cli.command {
        Commands::Info => {
            println!("DeepLab Information:");
            println!("  Backend: {}", get_backend_name());
            println!("  Device: {device:?}");
            Ok(())
        }

        Commands::Presets => {
            for name in DeepLabConfig::preset_names() {
                let architecture = name
                    .split_once('_')
                    .map(|(_, architecture)| architecture)
                    .unwrap_or_default();
                println!("{name:<32} {}", model_url(architecture).unwrap_or("-"));
            }
            Ok(())
        }

        Commands::Print { model } => {
            let network = model.build(&device)?;
            println!("{network}");
            println!("Parameters: {}", network.num_params());
            Ok(())
        }

        Commands::Shapes {
            model,
            batch,
            height,
            width,
        } => {
            model.config()?.check_input_size([height, width])?;
            let network = model.build(&device)?;
            let input = Tensor::<SelectedBackend, 4>::random(
                [batch, 3, height, width],
                Distribution::Default,
                &device,
            );

            let features = network.backbone.forward_features(input.clone());
            let strides = network.backbone.feature_strides();
            tracing::info!(
                shape = ?features.low_level.dims(),
                stride = strides.low_level,
                "low-level features"
            );
            tracing::info!(shape = ?features.out.dims(), stride = strides.out, "out features");

            let logits = network.forward(input);
            tracing::info!(shape = ?logits.dims(), "logits");
            println!("{:?}", logits.dims());
            Ok(())
        }

        Commands::Config { model, output } => {
            let config = model.config()?;
            config
                .save(&output)
                .with_context(|| format!("Failed to write {}", output.display()))?;
            tracing::info!(path = %output.display(), "saved configuration");
            Ok(())
        }
    }
}
