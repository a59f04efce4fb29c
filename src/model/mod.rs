//! Compute devices and ONNX model files.

mod device;
mod loader;

pub use device::{Device, SessionOptions};
pub use loader::{ModelCache, ModelFile, ModelSource};
