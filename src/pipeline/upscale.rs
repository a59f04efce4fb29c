//! 4x super-resolution with the Stable Diffusion x4 upscaler.

use clap::ValueEnum;
use image::{DynamicImage, GenericImageView};
use indicatif::MultiProgress;
use ndarray::{concatenate, Array4, Axis};
use ort::session::Session;
use rand::rngs::StdRng;

use crate::batch::ImageModel;
use crate::error::{Error, Result};
use crate::image::{snap_dimensions, to_tensor, ImageTensor};
use crate::model::{ModelCache, ModelFile, SessionOptions};

use super::scheduler::{randn, BetaSchedule, DdimScheduler, NoiseSchedule, SchedulerConfig};
use super::text::{PromptEmbeddings, TextEncoder, OPENCLIP_PAD_TOKEN};
use super::unet::Unet;
use super::vae::{self, LatentTensor, Tiling};
use super::{seeded_rng, sized_output, step_bar};

/// Prompt used when the user leaves it empty.
pub const UPSCALE_PROMPT: &str = "high-resolution photo";

/// Output size relative to the input.
pub const UPSCALE_FACTOR: u32 = 4;

/// Highest noise level the upscaler was trained with.
pub const MAX_NOISE_LEVEL: u32 = 350;

/// VAE scaling factor of the x4 upscaler.
const VAE_SCALE: f32 = 0.083_33;

/// Latent channels produced by the VAE.
const LATENT_CHANNELS: usize = 4;

/// Input sides are snapped to a multiple of this for the `UNet`'s downsampling.
const SIZE_MULTIPLE: u32 = 8;

/// When tiled VAE decoding is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum VaeTiling {
    /// Tile on accelerators, where memory is scarcest.
    #[default]
    Auto,
    /// Always tile.
    On,
    /// Never tile.
    Off,
}

impl VaeTiling {
    /// Whether to tile given whether the session runs on an accelerator.
    #[must_use]
    pub const fn enabled(self, accelerator: bool) -> bool {
        match self {
            Self::Auto => accelerator,
            Self::On => true,
            Self::Off => false,
        }
    }
}

/// Configuration for the upscaling pipeline.
#[derive(Debug, Clone)]
pub struct UpscaleConfig {
    /// Text prompt guiding the upscaling.
    pub prompt: String,

    /// Classifier-free guidance scale. Values at or below 1.0 disable guidance.
    pub guidance: f32,

    /// Number of denoising steps.
    pub num_steps: u32,

    /// Noise added to the low-resolution image before conditioning (0-350).
    pub noise_level: u32,

    /// Tiled VAE decoding policy.
    pub vae_tiling: VaeTiling,

    /// Random seed for reproducibility. None for random.
    pub seed: Option<u64>,
}

impl Default for UpscaleConfig {
    fn default() -> Self {
        Self {
            prompt: UPSCALE_PROMPT.to_string(),
            guidance: 0.0,
            num_steps: 40,
            noise_level: 20,
            vae_tiling: VaeTiling::Auto,
            seed: None,
        }
    }
}

impl UpscaleConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any parameter is out of valid range.
    pub fn validate(&self) -> Result<()> {
        if self.num_steps == 0 {
            return Err(Error::invalid("steps", "must be greater than 0"));
        }

        if self.noise_level > MAX_NOISE_LEVEL {
            return Err(Error::invalid("noise_level", "must be at most 350"));
        }

        if !self.guidance.is_finite() || self.guidance < 0.0 {
            return Err(Error::invalid("guidance", "must be a non-negative number"));
        }

        Ok(())
    }
}

/// Stable Diffusion x4 upscaler.
pub struct Upscaler {
    config: UpscaleConfig,
    embeddings: PromptEmbeddings,
    scheduler: DdimScheduler,
    low_res_schedule: NoiseSchedule,
    rng: StdRng,
    tiling: Option<Tiling>,
    vae_decoder: Session,
    unet: Unet,
}

impl Upscaler {
    /// Create an upscaler, resolving and loading every model file.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or models cannot be loaded.
    pub fn new(config: UpscaleConfig, models: &ModelCache, options: &SessionOptions) -> Result<Self> {
        config.validate()?;

        tracing::info!("Initializing upscaler with config: {config:?}");

        tracing::info!("Encoding prompt...");
        let embeddings = {
            let mut text = TextEncoder::load(models, options, OPENCLIP_PAD_TOKEN)?;
            text.embed(&config.prompt, config.guidance > 1.0)?
        };

        tracing::info!("Loading VAE decoder...");
        let vae_decoder = models.load_session(ModelFile::VaeDecoder, options)?;

        tracing::info!("Loading `UNet`...");
        let unet = Unet::load(models, options)?;

        let tiling = config
            .vae_tiling
            .enabled(options.device.is_accelerator())
            .then(Tiling::default);
        if tiling.is_some() {
            tracing::info!("VAE tiling enabled");
        }

        tracing::info!("Upscaler initialized successfully");

        Ok(Self {
            scheduler: DdimScheduler::new(&SchedulerConfig::X4_UPSCALER, config.num_steps as usize),
            low_res_schedule: NoiseSchedule::new(BetaSchedule::Linear, 0.0001, 0.02),
            rng: seeded_rng(config.seed),
            tiling,
            config,
            embeddings,
            vae_decoder,
            unet,
        })
    }

    /// Upscale one image to exactly four times its dimensions.
    ///
    /// # Errors
    ///
    /// Returns an error if inference fails.
    pub fn upscale(&mut self, image: &DynamicImage, progress: &MultiProgress) -> Result<DynamicImage> {
        let conditioning = low_res_conditioning(
            image,
            self.config.noise_level,
            &self.low_res_schedule,
            &mut self.rng,
        );

        let (_, _, snapped_h, snapped_w) = conditioning.dim();
        tracing::debug!("Running diffusion at {snapped_w}x{snapped_h}...");
        let latents = self.diffusion_loop(&conditioning, progress)?;

        tracing::debug!("Decoding from latent space...");
        let output = self.decode(&latents)?;

        Ok(sized_output(&output, upscaled_size(image.dimensions())))
    }

    fn diffusion_loop(&mut self, conditioning: &ImageTensor, progress: &MultiProgress) -> Result<LatentTensor> {
        let (_, _, height, width) = conditioning.dim();
        let mut latents = randn((1, LATENT_CHANNELS, height, width), &mut self.rng);
        let noise_level = i64::from(self.config.noise_level);

        let timesteps = self.scheduler.timesteps().to_vec();
        let pb = step_bar(progress, timesteps.len());
        for &t in &timesteps {
            let input = unet_input(&latents, conditioning)?;
            let velocity = self.unet.predict(
                &input,
                t,
                &self.embeddings,
                self.config.guidance,
                Some(noise_level),
            )?;
            latents = self.scheduler.step(&velocity, t, &latents);
            pb.inc(1);
        }
        pb.finish_and_clear();
        progress.remove(&pb);

        Ok(latents)
    }

    fn decode(&mut self, latents: &LatentTensor) -> Result<ImageTensor> {
        let decoder = &mut self.vae_decoder;
        match self.tiling {
            Some(tiling) => vae::decode_tiled(latents, tiling, |tile| vae::decode(decoder, tile, VAE_SCALE)),
            None => vae::decode(decoder, latents, VAE_SCALE),
        }
    }
}

/// Final size for an input of `(width, height)`.
#[must_use]
pub const fn upscaled_size((width, height): (u32, u32)) -> (u32, u32) {
    (width * UPSCALE_FACTOR, height * UPSCALE_FACTOR)
}

/// Snap `image` to the `UNet`'s size multiple and noise it to `noise_level`.
fn low_res_conditioning(
    image: &DynamicImage,
    noise_level: u32,
    schedule: &NoiseSchedule,
    rng: &mut StdRng,
) -> ImageTensor {
    let (width, height) = snap_dimensions(image.width(), image.height(), SIZE_MULTIPLE);
    let low_res = to_tensor(image, width, height);
    let noise = randn(low_res.dim(), rng);
    schedule.add_noise(&low_res, &noise, noise_level as usize)
}

/// Latents followed by the conditioning image along the channel axis.
fn unet_input(latents: &LatentTensor, conditioning: &ImageTensor) -> Result<Array4<f32>> {
    concatenate(Axis(1), &[latents.view(), conditioning.view()]).map_err(|e| {
        Error::ShapeMismatch {
            expected: "latents and image with equal spatial size".to_string(),
            actual: e.to_string(),
        }
    })
}

impl ImageModel for Upscaler {
    fn label(&self) -> &'static str {
        "Upscaling"
    }

    fn process(&mut self, image: &DynamicImage, progress: &MultiProgress) -> Result<DynamicImage> {
        self.upscale(image, progress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::s;

    #[test]
    fn default_config_matches_cli_defaults() {
        let config = UpscaleConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.num_steps, 40);
        assert!(config.guidance.abs() < f32::EPSILON);
        assert_eq!(config.noise_level, 20);
    }

    #[test]
    fn rejects_noise_above_training_range() {
        let config = UpscaleConfig {
            noise_level: 351,
            ..UpscaleConfig::default()
        };
        assert!(config.validate().is_err());
    }

    fn low_res_schedule() -> NoiseSchedule {
        NoiseSchedule::new(BetaSchedule::Linear, 0.0001, 0.02)
    }

    #[test]
    fn output_is_four_times_the_source() {
        assert_eq!(upscaled_size((13, 7)), (52, 28));
        assert_eq!(upscaled_size((512, 384)), (2048, 1536));
    }

    #[test]
    fn conditioning_is_snapped_to_multiple_of_eight() {
        let image = DynamicImage::new_rgb8(21, 13);
        let mut rng = seeded_rng(Some(1));

        let conditioning = low_res_conditioning(&image, 20, &low_res_schedule(), &mut rng);
        assert_eq!(conditioning.dim(), (1, 3, 8, 16));

        let tiny = DynamicImage::new_rgb8(5, 3);
        let conditioning = low_res_conditioning(&tiny, 20, &low_res_schedule(), &mut rng);
        assert_eq!(conditioning.dim(), (1, 3, 8, 8));
    }

    #[test]
    fn conditioning_noise_grows_with_noise_level() {
        let image = DynamicImage::new_rgb8(16, 16);
        let clean = to_tensor(&image, 16, 16);
        let schedule = low_res_schedule();

        let distance = |level| {
            let mut rng = seeded_rng(Some(3));
            let noised = low_res_conditioning(&image, level, &schedule, &mut rng);
            (&noised - &clean).mapv(f32::abs).mean().unwrap_or_default()
        };

        assert!(distance(0) < 0.05);
        assert!(distance(MAX_NOISE_LEVEL) > distance(20));
    }

    #[test]
    fn unet_input_stacks_latents_then_image() {
        let latents = Array4::<f32>::from_elem((1, LATENT_CHANNELS, 2, 4), 0.5);
        let conditioning = Array4::<f32>::from_elem((1, 3, 2, 4), -1.0);

        let input = unet_input(&latents, &conditioning).unwrap();
        assert_eq!(input.dim(), (1, 7, 2, 4));
        assert!(input.slice(s![.., ..4, .., ..]).iter().all(|&v| (v - 0.5).abs() < f32::EPSILON));
        assert!(input.slice(s![.., 4.., .., ..]).iter().all(|&v| (v + 1.0).abs() < f32::EPSILON));
    }

    #[test]
    fn unet_input_rejects_mismatched_sizes() {
        let latents = Array4::<f32>::zeros((1, LATENT_CHANNELS, 2, 4));
        let conditioning = Array4::<f32>::zeros((1, 3, 4, 4));

        assert!(matches!(
            unet_input(&latents, &conditioning),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn odd_sized_source_ends_at_exact_target() {
        let image = DynamicImage::new_rgb8(13, 7);
        let mut rng = seeded_rng(Some(5));
        let conditioning = low_res_conditioning(&image, 20, &low_res_schedule(), &mut rng);
        let (_, _, h, w) = conditioning.dim();

        // The decoder returns 4x the snapped size.
        let decoded = Array4::<f32>::zeros((1, 3, h * 4, w * 4));
        let output = sized_output(&decoded, upscaled_size(image.dimensions()));
        assert_eq!(output.dimensions(), (52, 28));
    }

    #[test]
    fn tiling_policy() {
        assert!(VaeTiling::Auto.enabled(true));
        assert!(!VaeTiling::Auto.enabled(false));
        assert!(VaeTiling::On.enabled(false));
        assert!(!VaeTiling::Off.enabled(true));
    }
}
