//! Photo colorization with Stable Diffusion 1.5 image-to-image.

use image::{DynamicImage, GenericImageView};
use indicatif::MultiProgress;
use ort::session::Session;
use rand::rngs::StdRng;

use crate::batch::ImageModel;
use crate::error::{Error, Result};
use crate::image::to_tensor;
use crate::model::{ModelCache, ModelFile, SessionOptions};

use super::scheduler::{randn, DdimScheduler, SchedulerConfig};
use super::text::{PromptEmbeddings, TextEncoder, END_OF_TEXT};
use super::unet::Unet;
use super::vae::{self, LatentTensor};
use super::{seeded_rng, sized_output, step_bar};

/// Prompt used when none is given.
pub const COLORIZE_PROMPT: &str =
    "restore and colorize an old black and white family photograph, realistic natural colors";

/// Native resolution of Stable Diffusion 1.5.
pub const SD15_IMAGE_SIZE: u32 = 512;

/// VAE scaling factor of Stable Diffusion 1.5.
const VAE_SCALE: f32 = 0.182_15;

/// Configuration for the colorization pipeline.
#[derive(Debug, Clone)]
pub struct ColorizeConfig {
    /// Text prompt guiding the colorization.
    pub prompt: String,

    /// Classifier-free guidance scale. Values at or below 1.0 disable guidance.
    pub guidance: f32,

    /// Number of denoising steps for a full-strength run.
    pub num_steps: u32,

    /// How far the photo is pushed into noise (0.0-1.0]. Higher values allow
    /// stronger colors but drift further from the original.
    pub strength: f32,

    /// Random seed for reproducibility. None for random.
    pub seed: Option<u64>,
}

impl Default for ColorizeConfig {
    fn default() -> Self {
        Self {
            prompt: COLORIZE_PROMPT.to_string(),
            guidance: 7.5,
            num_steps: 30,
            strength: 0.6,
            seed: None,
        }
    }
}

impl ColorizeConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any parameter is out of valid range.
    pub fn validate(&self) -> Result<()> {
        if !(self.strength > 0.0 && self.strength <= 1.0) {
            return Err(Error::invalid("strength", "must be greater than 0.0 and at most 1.0"));
        }

        if self.num_steps == 0 {
            return Err(Error::invalid("steps", "must be greater than 0"));
        }

        if self.denoising_steps() == 0 {
            return Err(Error::invalid(
                "strength",
                "too low for the step count; strength * steps must be at least 1",
            ));
        }

        if !self.guidance.is_finite() || self.guidance < 0.0 {
            return Err(Error::invalid("guidance", "must be a non-negative number"));
        }

        Ok(())
    }

    /// Steps actually run once the photo is noised to `strength`.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    #[must_use]
    pub fn denoising_steps(&self) -> u32 {
        (self.num_steps as f32 * self.strength) as u32
    }
}

/// Stable Diffusion 1.5 image-to-image colorizer.
pub struct Colorizer {
    config: ColorizeConfig,
    embeddings: PromptEmbeddings,
    scheduler: DdimScheduler,
    rng: StdRng,
    vae_encoder: Session,
    vae_decoder: Session,
    unet: Unet,
}

impl Colorizer {
    /// Create a colorizer, resolving and loading every model file.
    ///
    /// The prompt is encoded once here; the text encoder is released afterwards.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or models cannot be loaded.
    pub fn new(config: ColorizeConfig, models: &ModelCache, options: &SessionOptions) -> Result<Self> {
        config.validate()?;

        tracing::info!("Initializing colorizer with config: {config:?}");

        tracing::info!("Encoding prompt...");
        let embeddings = {
            let mut text = TextEncoder::load(models, options, END_OF_TEXT)?;
            text.embed(&config.prompt, config.guidance > 1.0)?
        };

        tracing::info!("Loading VAE encoder...");
        let vae_encoder = models.load_session(ModelFile::VaeEncoder, options)?;

        tracing::info!("Loading VAE decoder...");
        let vae_decoder = models.load_session(ModelFile::VaeDecoder, options)?;

        tracing::info!("Loading `UNet`...");
        let unet = Unet::load(models, options)?;

        tracing::info!("Colorizer initialized successfully");

        Ok(Self {
            scheduler: DdimScheduler::new(&SchedulerConfig::SD15, config.num_steps as usize),
            rng: seeded_rng(config.seed),
            config,
            embeddings,
            vae_encoder,
            vae_decoder,
            unet,
        })
    }

    /// Colorize one photo, returning an image with the input's dimensions.
    ///
    /// # Errors
    ///
    /// Returns an error if inference fails.
    pub fn colorize(&mut self, image: &DynamicImage, progress: &MultiProgress) -> Result<DynamicImage> {
        let original_dims = image.dimensions();
        let image_tensor = to_tensor(image, SD15_IMAGE_SIZE, SD15_IMAGE_SIZE);

        tracing::debug!("Encoding to latent space...");
        let latents = vae::encode(&mut self.vae_encoder, &image_tensor, VAE_SCALE)?;

        tracing::debug!("Running diffusion...");
        let denoised = self.diffusion_loop(&latents, progress)?;

        tracing::debug!("Decoding from latent space...");
        let output = vae::decode(&mut self.vae_decoder, &denoised, VAE_SCALE)?;

        Ok(sized_output(&output, original_dims))
    }

    /// Noise the latents to the configured strength, then denoise them.
    fn diffusion_loop(&mut self, latents: &LatentTensor, progress: &MultiProgress) -> Result<LatentTensor> {
        let timesteps = self.scheduler.img2img_timesteps(self.config.strength).to_vec();

        let Some(&start) = timesteps.first() else {
            return Ok(latents.clone());
        };

        let noise = randn(latents.dim(), &mut self.rng);
        let mut sample = self.scheduler.add_noise(latents, &noise, start);

        let pb = step_bar(progress, timesteps.len());
        for &t in &timesteps {
            let noise_pred = self.unet.predict(
                &sample,
                t,
                &self.embeddings,
                self.config.guidance,
                None,
            )?;
            sample = self.scheduler.step(&noise_pred, t, &sample);
            pb.inc(1);
        }
        pb.finish_and_clear();
        progress.remove(&pb);

        Ok(sample)
    }
}

impl ImageModel for Colorizer {
    fn label(&self) -> &'static str {
        "Colorizing"
    }

    fn process(&mut self, image: &DynamicImage, progress: &MultiProgress) -> Result<DynamicImage> {
        self.colorize(image, progress)
    }
}
