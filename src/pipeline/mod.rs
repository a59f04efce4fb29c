//! Diffusion pipelines for colorization and upscaling.

mod colorize;
pub mod scheduler;
mod session;
mod text;
mod unet;
mod upscale;
pub mod vae;

pub use colorize::{ColorizeConfig, Colorizer, COLORIZE_PROMPT, SD15_IMAGE_SIZE};
pub use upscale::{
    UpscaleConfig, Upscaler, VaeTiling, MAX_NOISE_LEVEL, UPSCALE_FACTOR, UPSCALE_PROMPT,
};

use image::{imageops::FilterType, DynamicImage, GenericImageView};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::image::{from_tensor, ImageTensor};

fn seeded_rng(seed: Option<u64>) -> StdRng {
    seed.map_or_else(StdRng::from_os_rng, StdRng::seed_from_u64)
}

/// Per-image denoising bar, nested under the batch bar.
fn step_bar(progress: &MultiProgress, steps: usize) -> ProgressBar {
    let pb = progress.add(ProgressBar::new(steps as u64));
    pb.set_style(
        ProgressStyle::with_template("{spinner:.green} Denoising [{bar:40.cyan/blue}] {pos}/{len}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    pb
}

/// Decoded output as an image of exactly `width` x `height`.
fn sized_output(decoded: &ImageTensor, (width, height): (u32, u32)) -> DynamicImage {
    let image = DynamicImage::ImageRgb8(from_tensor(decoded));
    if image.dimensions() == (width, height) {
        image
    } else {
        image.resize_exact(width, height, FilterType::Lanczos3)
    }
}
