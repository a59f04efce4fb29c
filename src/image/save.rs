//! Image saving utilities.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageBuffer, ImageError, ImageFormat, Rgb, RgbImage};

use crate::error::{Error, Result};

use super::ImageTensor;

/// Save an image, choosing the format from the file extension.
///
/// JPEG output uses `quality` (1-100); other formats ignore it.
///
/// # Errors
///
/// Returns an error if the image cannot be saved.
pub fn save_image<P: AsRef<Path>>(image: &DynamicImage, path: P, quality: u8) -> Result<()> {
    let path = path.as_ref();
    let save_err = |source| Error::ImageSave {
        path: path.to_path_buf(),
        source,
    };

    if ImageFormat::from_path(path).ok() == Some(ImageFormat::Jpeg) {
        let file = File::create(path).map_err(|e| save_err(ImageError::IoError(e)))?;
        let mut writer = BufWriter::new(file);
        image
            .write_with_encoder(JpegEncoder::new_with_quality(&mut writer, quality))
            .map_err(save_err)?;
        return writer.flush().map_err(|e| save_err(ImageError::IoError(e)));
    }

    image.save(path).map_err(save_err)
}

/// Convert a normalized NCHW tensor (first batch item) to an RGB image.
#[allow(clippy::cast_possible_truncation)]
#[must_use]
pub fn from_tensor(tensor: &ImageTensor) -> RgbImage {
    let (_, _, height, width) = tensor.dim();

    ImageBuffer::from_fn(width as u32, height as u32, |x, y| {
        let (x, y) = (x as usize, y as usize);
        Rgb([
            denormalize(tensor[[0, 0, y, x]]),
            denormalize(tensor[[0, 1, y, x]]),
            denormalize(tensor[[0, 2, y, x]]),
        ])
    })
}

/// Denormalize a value from [-1, 1] to [0, 255] with clamping.
#[inline]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn denormalize(value: f32) -> u8 {
    let scaled = (value + 1.0) * 127.5;
    scaled.clamp(0.0, 255.0) as u8
}
