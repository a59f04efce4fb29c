//! Image loading, tensor conversion, and saving utilities.

mod load;
mod save;

pub use load::{load_rgb, snap_dimensions, to_tensor};
pub use save::{from_tensor, save_image};

use ndarray::Array4;

/// Image tensor in NCHW format (batch, channels, height, width).
/// Values are normalized to [-1, 1] range for diffusion model compatibility.
pub type ImageTensor = Array4<f32>;

/// Number of channels in RGB images.
pub const RGB_CHANNELS: usize = 3;

/// Extensions accepted as input images, lower-case and without the dot.
pub const SUPPORTED_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp", "bmp", "tif", "tiff"];
