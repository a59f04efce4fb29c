//! # photorevive
//!
//! Batch photo restoration with pretrained Stable Diffusion models running on
//! ONNX Runtime: colorization of black-and-white photographs (SD 1.5
//! image-to-image) and 4x super-resolution (SD x4 upscaler).
//!
//! Both pipelines implement [`batch::ImageModel`] and are driven over a
//! directory of images by [`batch::run_batch`].
//!
//! ## Example
//!
//! ```no_run
//! use std::path::Path;
//!
//! use photorevive::batch::{discover_images, run_batch, BatchJob};
//! use photorevive::model::{Device, ModelCache, ModelSource, SessionOptions};
//! use photorevive::{UpscaleConfig, Upscaler};
//!
//! # fn main() -> photorevive::Result<()> {
//! let models = ModelCache::new(
//!     None,
//!     "sd-x4-upscaler",
//!     ModelSource::Local("models/sd-x4-upscaler-onnx".into()),
//!     None,
//! )?;
//! let options = SessionOptions::for_device(Device::Auto.resolve());
//! let mut upscaler = Upscaler::new(UpscaleConfig::default(), &models, &options)?;
//!
//! let images = discover_images(Path::new("input"))?;
//! let job = BatchJob { output_dir: Path::new("results"), suffix: "", quality: 95 };
//! run_batch(&mut upscaler, &images, &job)?;
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod config;
pub mod error;
pub mod image;
pub mod model;
pub mod pipeline;

pub use error::{Error, Result};
pub use pipeline::{ColorizeConfig, Colorizer, UpscaleConfig, Upscaler};
