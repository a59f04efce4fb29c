//! Image loading utilities.

use std::path::Path;

use image::{imageops::FilterType, DynamicImage, RgbImage};
use ndarray::Array4;

use crate::error::{Error, Result};

use super::{ImageTensor, RGB_CHANNELS};

/// Load an image from disk as RGB8, dropping any alpha channel.
///
/// # Errors
///
/// Returns an error if the image cannot be opened or decoded.
pub fn load_rgb<P: AsRef<Path>>(path: P) -> Result<DynamicImage> {
    let path = path.as_ref();

    let img = image::open(path).map_err(|source| Error::ImageLoad {
        path: path.to_path_buf(),
        source,
    })?;

    Ok(DynamicImage::ImageRgb8(img.to_rgb8()))
}

/// Round dimensions down to a multiple of `multiple`, never below one multiple.
#[must_use]
pub fn snap_dimensions(width: u32, height: u32, multiple: u32) -> (u32, u32) {
    let snap = |v: u32| (v / multiple).max(1) * multiple;
    (snap(width), snap(height))
}

/// Resize an image and convert it to a normalized NCHW tensor.
///
/// The image is resized with Lanczos3 (skipped when it already has the
/// requested size) and each channel is mapped from [0, 255] to [-1, 1].
#[allow(clippy::cast_possible_truncation)]
#[must_use]
pub fn to_tensor(img: &DynamicImage, width: u32, height: u32) -> ImageTensor {
    let rgb: RgbImage = if img.width() == width && img.height() == height {
        img.to_rgb8()
    } else {
        img.resize_exact(width, height, FilterType::Lanczos3).to_rgb8()
    };

    let (w, h) = (width as usize, height as usize);
    let mut tensor = Array4::<f32>::zeros((1, RGB_CHANNELS, h, w));

    for (x, y, pixel) in rgb.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        for c in 0..RGB_CHANNELS {
            tensor[[0, c, y, x]] = (f32::from(pixel[c]) / 127.5) - 1.0;
        }
    }

    tensor
}
