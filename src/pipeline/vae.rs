//! Variational Autoencoder operations for encoding/decoding images.

use ndarray::{s, Array4, Ix4};
use ort::session::Session;

use crate::error::{Error, Result};
use crate::image::ImageTensor;

use super::session::{extract, float_input, inference_err, missing_output};

/// Latent tensor type in NCHW format.
pub type LatentTensor = Array4<f32>;

/// Encode an image to latent space using the VAE encoder.
///
/// The latents are multiplied by `scale`, the model's VAE scaling factor.
///
/// # Errors
///
/// Returns an error if inference fails.
pub fn encode(encoder: &mut Session, image: &ImageTensor, scale: f32) -> Result<LatentTensor> {
    let input_value = float_input(image.clone())?;

    let outputs = encoder
        .run(ort::inputs![input_value])
        .map_err(inference_err)?;

    let output = outputs
        .values()
        .next()
        .ok_or_else(|| missing_output("latent_sample"))?;

    let latent = extract::<Ix4>(&output, "latent_sample")?;

    Ok(latent * scale)
}

/// Decode latents back to image space using the VAE decoder.
///
/// `scale` is the factor the latents were multiplied by.
///
/// # Errors
///
/// Returns an error if inference fails.
pub fn decode(decoder: &mut Session, latent: &LatentTensor, scale: f32) -> Result<ImageTensor> {
    let input_value = float_input(latent / scale)?;

    let outputs = decoder
        .run(ort::inputs![input_value])
        .map_err(inference_err)?;

    let output = outputs
        .values()
        .next()
        .ok_or_else(|| missing_output("sample"))?;

    extract::<Ix4>(&output, "sample")
}

/// Latent tile geometry for [`decode_tiled`].
#[derive(Debug, Clone, Copy)]
pub struct Tiling {
    /// Tile edge in latent pixels.
    pub tile: usize,
    /// Overlap between neighbouring tiles in latent pixels.
    pub overlap: usize,
}

impl Default for Tiling {
    fn default() -> Self {
        Self {
            tile: 64,
            overlap: 8,
        }
    }
}

/// Decode latents tile by tile and blend the overlaps.
///
/// Each tile is decoded separately with `decode_tile`; overlapping pixels are
/// averaged with weights that ramp up from the tile edges, which hides seams
/// while bounding the decoder's peak memory to one tile.
///
/// # Errors
///
/// Returns an error if a tile fails to decode or tiles decode at
/// inconsistent scales.
#[allow(clippy::cast_precision_loss)]
pub fn decode_tiled<F>(latent: &LatentTensor, tiling: Tiling, mut decode_tile: F) -> Result<ImageTensor>
where
    F: FnMut(&LatentTensor) -> Result<ImageTensor>,
{
    let (_, _, height, width) = latent.dim();
    let tile = tiling.tile.max(1);
    let stride = tile.saturating_sub(tiling.overlap).max(1);

    if height <= tile && width <= tile {
        return decode_tile(latent);
    }

    let rows = tile_starts(height, tile, stride);
    let cols = tile_starts(width, tile, stride);

    let mut output: Option<(Array4<f32>, Array4<f32>, usize)> = None;

    for &y in &rows {
        for &x in &cols {
            let (th, tw) = (tile.min(height - y), tile.min(width - x));
            let piece = latent.slice(s![.., .., y..y + th, x..x + tw]).to_owned();
            let decoded = decode_tile(&piece)?;
            let (_, channels, dh, dw) = decoded.dim();

            if dh % th != 0 || dw % tw != 0 || dh / th != dw / tw {
                return Err(Error::ShapeMismatch {
                    expected: format!("tile decoded at a uniform scale of {th}x{tw}"),
                    actual: format!("{dh}x{dw}"),
                });
            }
            let factor = dh / th;

            let (sum, weights, scale) = output.get_or_insert_with(|| {
                (
                    Array4::zeros((1, channels, height * factor, width * factor)),
                    Array4::zeros((1, 1, height * factor, width * factor)),
                    factor,
                )
            });
            if *scale != factor {
                return Err(Error::ShapeMismatch {
                    expected: format!("tile scale {scale}"),
                    actual: format!("tile scale {factor}"),
                });
            }

            let ramp = (tiling.overlap * factor).max(1) as f32;
            let (oy, ox) = (y * factor, x * factor);
            for py in 0..dh {
                let wy = edge_weight(py, dh, ramp);
                for px in 0..dw {
                    let w = wy * edge_weight(px, dw, ramp);
                    weights[[0, 0, oy + py, ox + px]] += w;
                    for c in 0..channels {
                        sum[[0, c, oy + py, ox + px]] += decoded[[0, c, py, px]] * w;
                    }
                }
            }
        }
    }

    let (mut sum, weights, _) = output.ok_or_else(|| missing_output("tiled decode"))?;
    let channels = sum.dim().1;
    for c in 0..channels {
        let mut plane = sum.slice_mut(s![0, c, .., ..]);
        plane /= &weights.slice(s![0, 0, .., ..]);
    }

    Ok(sum)
}

/// Start offsets covering `len` with tiles of `tile`, the last one flush with the end.
fn tile_starts(len: usize, tile: usize, stride: usize) -> Vec<usize> {
    if len <= tile {
        return vec![0];
    }
    let mut starts: Vec<usize> = (0..len - tile).step_by(stride).collect();
    starts.push(len - tile);
    starts
}

/// Linear ramp from the tile border, never zero so every pixel keeps weight.
#[allow(clippy::cast_precision_loss)]
fn edge_weight(pos: usize, len: usize, ramp: f32) -> f32 {
    let from_start = pos as f32 + 0.5;
    let from_end = (len - pos) as f32 - 0.5;
    (from_start.min(from_end) / ramp).min(1.0)
}
