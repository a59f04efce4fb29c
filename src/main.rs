//! `photorevive` CLI - colorize or upscale every photo in a directory.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use photorevive::batch::{
    discover_images, prepare_output_dir, resolve_prompt, run_batch, BatchJob, ImageModel,
};
use photorevive::config::{
    self, Config, OPENCLIP_TOKENIZER_URL, SD15_ONNX_URL, SD15_TOKENIZER_URL,
};
use photorevive::model::{Device, ModelCache, SessionOptions};
use photorevive::pipeline::{VaeTiling, COLORIZE_PROMPT, UPSCALE_PROMPT};
use photorevive::{ColorizeConfig, Colorizer, Error, UpscaleConfig, Upscaler};

/// Restore old photos with pretrained diffusion models.
#[derive(Parser, Debug)]
#[command(name = "photorevive")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Config file path override.
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Compute device for inference.
    #[arg(long, global = true, value_enum, default_value_t = Device::Auto)]
    device: Device,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Colorize black-and-white photos with Stable Diffusion 1.5.
    Colorize(ColorizeArgs),
    /// Upscale images 4x with the Stable Diffusion x4 upscaler.
    Upscale(UpscaleArgs),
}

/// Flags shared by every task.
#[derive(Args, Debug)]
struct CommonArgs {
    /// Directory of source images.
    #[arg(short, long, value_name = "DIR")]
    input: PathBuf,

    /// Random seed for reproducibility.
    #[arg(long, value_name = "INT")]
    seed: Option<u64>,

    /// Output JPEG quality (1-100).
    #[arg(short, long, default_value_t = 95, value_name = "INT",
          value_parser = clap::value_parser!(u8).range(1..=100))]
    quality: u8,

    /// Local ONNX export directory; skips the config file and downloads.
    #[arg(long, value_name = "DIR")]
    model_dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct ColorizeArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Destination directory, created if absent.
    #[arg(short, long, default_value = "output", value_name = "DIR")]
    output: PathBuf,

    /// Text prompt guiding the colorization.
    #[arg(long, default_value = COLORIZE_PROMPT)]
    prompt: String,

    /// Classifier-free guidance scale.
    #[arg(long, default_value_t = 7.5, value_name = "FLOAT")]
    guidance: f32,

    /// Number of denoising steps.
    #[arg(long, default_value_t = 30, value_name = "INT")]
    steps: u32,

    /// How strongly the photo is re-imagined (0.0-1.0).
    #[arg(long, default_value_t = 0.6, value_name = "FLOAT")]
    strength: f32,

    /// Appended to each output file stem.
    #[arg(long, default_value = "_colorized")]
    suffix: String,
}

#[derive(Args, Debug)]
struct UpscaleArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Destination directory, created if absent.
    #[arg(short, long, default_value = "results", value_name = "DIR")]
    output: PathBuf,

    /// Text prompt guiding the upscaling. Empty means "high-resolution photo".
    #[arg(long, default_value = "")]
    prompt: String,

    /// Classifier-free guidance scale.
    #[arg(long, default_value_t = 0.0, value_name = "FLOAT")]
    guidance: f32,

    /// Number of denoising steps.
    #[arg(long, default_value_t = 40, value_name = "INT")]
    steps: u32,

    /// Noise added to the low-resolution input (0-350).
    #[arg(long, default_value_t = 20, value_name = "INT")]
    noise_level: u32,

    /// Tiled VAE decoding to bound memory use.
    #[arg(long, value_enum, default_value_t = VaeTiling::Auto)]
    vae_tiling: VaeTiling,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("photorevive={log_level}").into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    if let Err(err) = run(&cli) {
        tracing::error!("{err:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

fn run(cli: &Cli) -> Result<()> {
    let config_path = config::discover_config_path(cli.config.as_deref());
    let config = Config::load(&config_path)?;

    match &cli.command {
        Command::Colorize(args) => colorize(cli, &config, args),
        Command::Upscale(args) => upscale(cli, &config, args),
    }
}

fn colorize(cli: &Cli, config: &Config, args: &ColorizeArgs) -> Result<()> {
    let task = ColorizeConfig {
        prompt: resolve_prompt(&args.prompt, COLORIZE_PROMPT),
        guidance: args.guidance,
        num_steps: args.steps,
        strength: args.strength,
        seed: args.common.seed,
    };
    task.validate()?;

    run_task(&args.common, &args.output, &args.suffix, || {
        let source = config
            .colorize
            .source(args.common.model_dir.as_deref(), Some(SD15_ONNX_URL))
            .ok_or(Error::ModelSourceMissing { task: "colorize" })?;
        let models = ModelCache::new(
            config.cache_dir.as_deref(),
            "sd15",
            source,
            Some(config.colorize.tokenizer_url(SD15_TOKENIZER_URL)),
        )?;
        let options = session_options(cli.device);

        Colorizer::new(task, &models, &options).context("Failed to initialize colorizer")
    })
}

fn upscale(cli: &Cli, config: &Config, args: &UpscaleArgs) -> Result<()> {
    let task = UpscaleConfig {
        prompt: resolve_prompt(&args.prompt, UPSCALE_PROMPT),
        guidance: args.guidance,
        num_steps: args.steps,
        noise_level: args.noise_level,
        vae_tiling: args.vae_tiling,
        seed: args.common.seed,
    };
    task.validate()?;

    run_task(&args.common, &args.output, "", || {
        let source = config
            .upscale
            .source(args.common.model_dir.as_deref(), None)
            .ok_or(Error::ModelSourceMissing { task: "upscale" })?;
        let models = ModelCache::new(
            config.cache_dir.as_deref(),
            "sd-x4-upscaler",
            source,
            Some(config.upscale.tokenizer_url(OPENCLIP_TOKENIZER_URL)),
        )?;
        let options = session_options(cli.device);

        Upscaler::new(task, &models, &options).context("Failed to initialize upscaler")
    })
}

fn session_options(device: Device) -> SessionOptions {
    let device = device.resolve();
    tracing::info!("Using device: {device}");
    SessionOptions::for_device(device)
}

/// Scan, prepare the output directory, and only then load the model.
fn run_task<M, F>(common: &CommonArgs, output: &Path, suffix: &str, load_model: F) -> Result<()>
where
    M: ImageModel,
    F: FnOnce() -> Result<M>,
{
    let images = discover_images(&common.input)?;

    prepare_output_dir(output)?;

    if images.is_empty() {
        return Err(Error::NoImages {
            path: common.input.clone(),
        }
        .into());
    }
    tracing::info!("Found {} images in {}", images.len(), common.input.display());

    let mut model = load_model()?;

    let job = BatchJob {
        output_dir: output,
        suffix,
        quality: common.quality,
    };
    let report = run_batch(&mut model, &images, &job).context("Failed to process images")?;

    tracing::info!("Wrote {} images", report.outputs.len());
    println!("done -> {}", output.display());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn colorize_defaults() {
        let cli = Cli::parse_from(["photorevive", "colorize", "-i", "photos"]);
        let Command::Colorize(args) = cli.command else {
            panic!("expected colorize");
        };
        assert_eq!(args.common.input, PathBuf::from("photos"));
        assert_eq!(args.output, PathBuf::from("output"));
        assert_eq!(args.prompt, COLORIZE_PROMPT);
        assert!((args.guidance - 7.5).abs() < f32::EPSILON);
        assert_eq!(args.steps, 30);
        assert_eq!(args.suffix, "_colorized");
        assert_eq!(args.common.quality, 95);
        assert_eq!(cli.device, Device::Auto);
    }

    #[test]
    fn upscale_defaults() {
        let cli = Cli::parse_from(["photorevive", "upscale", "--input", "lowres"]);
        let Command::Upscale(args) = cli.command else {
            panic!("expected upscale");
        };
        assert_eq!(args.output, PathBuf::from("results"));
        assert_eq!(args.prompt, "");
        assert!(args.guidance.abs() < f32::EPSILON);
        assert_eq!(args.steps, 40);
        assert_eq!(args.noise_level, 20);
        assert_eq!(args.vae_tiling, VaeTiling::Auto);
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::parse_from([
            "photorevive",
            "upscale",
            "-i",
            "in",
            "-o",
            "out",
            "--device",
            "cpu",
            "-v",
            "--vae-tiling",
            "on",
            "--seed",
            "42",
        ]);
        assert_eq!(cli.device, Device::Cpu);
        assert!(cli.verbose);
        let Command::Upscale(args) = cli.command else {
            panic!("expected upscale");
        };
        assert_eq!(args.output, PathBuf::from("out"));
        assert_eq!(args.vae_tiling, VaeTiling::On);
        assert_eq!(args.common.seed, Some(42));
    }

    #[test]
    fn input_is_required() {
        assert!(Cli::try_parse_from(["photorevive", "upscale"]).is_err());
    }

    #[test]
    fn quality_range_is_enforced() {
        assert!(Cli::try_parse_from(["photorevive", "colorize", "-i", "x", "-q", "0"]).is_err());
        assert!(Cli::try_parse_from(["photorevive", "colorize", "-i", "x", "-q", "101"]).is_err());
    }
}
