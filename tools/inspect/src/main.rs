//! EfficientNet inspection tool
//!
//! Command-line access to the architecture logic: scaling coefficients,
//! scaled stage summaries, the block-string codec, SAME padding and
//! pretrained weight checks.

use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use effnet_core::{
    coefficients_for, decode_all, dimensions_from_size, encode_all, load_toml_config, same_padding, setup_cli_logging,
    valid_model_names, Architecture, BlockArgs, GlobalParamsOverrides, InspectConfig, SizeSpec,
};
use effnet_nn::{load_pretrained, parameter_shapes, SafetensorsFile};
use serde::Serialize;
use std::path::PathBuf;
use tracing::{info, warn};

/// EfficientNet architecture inspector
#[derive(Parser, Debug)]
#[command(
    name = "effnet-inspect",
    about = "Inspect EfficientNet architectures",
    long_about = "Inspect EfficientNet architectures: compound scaling coefficients, \
                  scaled stages, block strings, SAME padding and pretrained weight keys and shapes."
)]
struct Args {
    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the predefined model names
    Models,
    /// Show the scaling coefficients of a model
    Coefficients {
        /// Model name, e.g. efficientnet-b3
        name: String,
    },
    /// Summarize the scaled architecture of a model
    Arch {
        #[command(flatten)]
        model: ModelArgs,
        /// Print the architecture as JSON
        #[arg(long)]
        json: bool,
    },
    /// Decode block strings
    Decode {
        /// Block strings, e.g. r1_k3_s11_e1_i32_o16_se0.25
        #[arg(required = true)]
        blocks: Vec<String>,
        /// Print the decoded blocks as JSON
        #[arg(long)]
        json: bool,
    },
    /// Encode blocks read from a JSON file
    Encode {
        /// JSON file holding an array of blocks
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
    /// Compute SAME padding for one layer
    Padding {
        /// Input size: 224, 240x320 or 240,320
        #[arg(long)]
        size: String,
        #[arg(long)]
        kernel: usize,
        #[arg(long)]
        stride: usize,
        #[arg(long, default_value_t = 1)]
        dilation: usize,
    },
    /// Check a safetensors file against the keys and shapes of a model
    CheckWeights {
        #[command(flatten)]
        model: ModelArgs,
        /// Weights file (overrides the configured one)
        #[arg(short, long, value_name = "FILE")]
        weights: Option<PathBuf>,
        /// Leave the classifier out of the check
        #[arg(long)]
        no_fc: bool,
    },
}

/// Model selection shared by subcommands
#[derive(ClapArgs, Debug, Default)]
struct ModelArgs {
    /// Path to configuration file (TOML)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override model name
    #[arg(short, long, value_name = "NAME")]
    model: Option<String>,

    /// Override image size (`none` for dynamic padding)
    #[arg(long, value_name = "SIZE")]
    image_size: Option<String>,

    /// Override number of classes
    #[arg(long, value_name = "N")]
    num_classes: Option<usize>,

    /// Override a global parameter, e.g. --set dropout_rate=0.3
    #[arg(long = "set", value_name = "KEY=VALUE")]
    set: Vec<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    setup_cli_logging(args.verbose)?;

    match args.command {
        Command::Models => {
            for name in valid_model_names() {
                println!("{}", name);
            }
        }
        Command::Coefficients { name } => {
            let c = coefficients_for(&name)?;
            println!("{}: width={} depth={} resolution={} dropout={}", name, c.width, c.depth, c.resolution, c.dropout);
        }
        Command::Arch { model, json } => {
            let config = resolve_config(&model)?;
            let arch = config.architecture().context("Failed to build architecture")?;
            if json {
                print_json(&arch)?;
            } else {
                print_arch_summary(&config, &arch)?;
            }
        }
        Command::Decode { blocks, json } => {
            let decoded = decode_all(&blocks)?;
            if json {
                print_json(&decoded)?;
            } else {
                for block in &decoded {
                    println!("{:?}", block);
                }
            }
        }
        Command::Encode { file } => {
            let content = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read blocks file: {}", file.display()))?;
            let blocks: Vec<BlockArgs> = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse blocks file: {}", file.display()))?;
            for line in encode_all(&blocks)? {
                println!("{}", line);
            }
        }
        Command::Padding {
            size,
            kernel,
            stride,
            dilation,
        } => {
            let report = padding_report(&size, kernel, stride, dilation)?;
            println!(
                "input {} -> output {}x{}, pad top={} bottom={} left={} right={}",
                report.input,
                report.output[0],
                report.output[1],
                report.top,
                report.bottom,
                report.left,
                report.right
            );
        }
        Command::CheckWeights {
            model,
            weights,
            no_fc,
        } => {
            let config = resolve_config(&model)?;
            check_weights(&config, weights, no_fc)?;
        }
    }

    Ok(())
}

/// Defaults, then the TOML file, then command-line flags.
fn resolve_config(args: &ModelArgs) -> Result<InspectConfig> {
    let mut config = match &args.config {
        Some(path) => load_toml_config::<InspectConfig>(path).context("Failed to load configuration file")?,
        None => InspectConfig::default(),
    };

    let mut overrides = GlobalParamsOverrides::from_pairs(&args.set).context("Invalid --set override")?;
    if let Some(size) = &args.image_size {
        overrides.set("image_size", size)?;
    }
    if let Some(n) = args.num_classes {
        overrides.num_classes = Some(Some(n));
    }

    config.apply_overrides(args.model.as_deref(), &overrides);
    config.validate()?;
    Ok(config)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_arch_summary(config: &InspectConfig, arch: &Architecture) -> Result<()> {
    let params = &arch.global_params;
    let image_size = params
        .image_size
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_else(|| "dynamic".to_string());

    info!("");
    info!("Architecture Summary:");
    info!("  Model: {}", config.model_name);
    info!("  Input channels: {}", config.in_channels);
    info!("  Image size: {}", image_size);
    info!("  Width coefficient: {:?}", params.width_coefficient);
    info!("  Depth coefficient: {:?}", params.depth_coefficient);
    info!("  Dropout: {:?}", params.dropout_rate);
    info!("  Classes: {:?}", params.num_classes);
    info!("  Stem filters: {}", arch.stem_filters());
    info!("  Head filters: {}", arch.head_filters());
    info!("  Total blocks: {}", arch.total_blocks());
    info!("");

    println!("{:>5} {:>7} {:>6} {:>6} {:>6} {:>7} {:>10}", "stage", "repeat", "kernel", "stride", "in", "out", "resolution");
    for stage in arch.stages()? {
        let resolution = stage
            .output_resolution
            .map(|[h, w]| format!("{}x{}", h, w))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:>5} {:>7} {:>6} {:>6} {:>6} {:>7} {:>10}",
            stage.index + 1,
            stage.num_repeat,
            stage.block.kernel_size,
            stage.block.stride,
            stage.input_filters,
            stage.output_filters,
            resolution
        );
    }
    Ok(())
}

#[derive(Debug, PartialEq)]
struct PaddingReport {
    input: SizeSpec,
    output: [usize; 2],
    top: usize,
    bottom: usize,
    left: usize,
    right: usize,
}

fn padding_report(size: &str, kernel: usize, stride: usize, dilation: usize) -> Result<PaddingReport> {
    let mut parsed = GlobalParamsOverrides::default();
    parsed.set("image_size", size)?;
    let input = parsed.image_size.flatten().context("Missing input size")?;

    let (height, width) = dimensions_from_size(&input)?;
    let padding = same_padding([height, width], [kernel, kernel], [stride, stride], [dilation, dilation])?;

    Ok(PaddingReport {
        output: [height.div_ceil(stride), width.div_ceil(stride)],
        input,
        top: padding.top,
        bottom: padding.bottom,
        left: padding.left,
        right: padding.right,
    })
}

fn check_weights(config: &InspectConfig, weights: Option<PathBuf>, no_fc: bool) -> Result<()> {
    let configured = config.weights.as_ref();
    let path = weights
        .or_else(|| configured.map(|w| w.path.clone()))
        .context("No weights file given (use --weights or [weights] in the config)")?;
    let load_fc = !no_fc && configured.map_or(true, |w| w.load_fc);

    let arch = config.architecture().context("Failed to build architecture")?;
    let expected = parameter_shapes(&arch, config.in_channels)?;

    if !path.exists() {
        warn!("Weights file does not exist: {}", path.display());
    }
    let source = SafetensorsFile::new(&path);
    let state = load_pretrained(&source, &expected, load_fc)
        .with_context(|| format!("Weights in {} do not match {}", path.display(), config.model_name))?;

    info!(
        "{} tensors match {} ({} classifier)",
        state.len(),
        config.model_name,
        if load_fc { "with" } else { "without" }
    );
    Ok(())
}
