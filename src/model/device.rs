//! Compute device selection for ONNX Runtime sessions.

use std::fmt;
use std::path::Path;

use clap::ValueEnum;
use ort::execution_providers::{
    CPUExecutionProvider, CUDAExecutionProvider, CoreMLExecutionProvider, ExecutionProvider,
};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;

use crate::error::{Error, Result};

/// Where inference runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Device {
    /// Pick the best available accelerator, falling back to the CPU.
    #[default]
    Auto,
    /// ONNX Runtime's default CPU provider.
    Cpu,
    /// NVIDIA GPU through the CUDA execution provider.
    Cuda,
    /// Apple Neural Engine / GPU through the `CoreML` execution provider.
    #[value(name = "coreml")]
    CoreMl,
}

impl Device {
    /// Resolve `Auto` to a concrete device by probing the execution providers.
    ///
    /// CUDA is preferred over `CoreML`; the CPU is the fallback.
    #[must_use]
    pub fn resolve(self) -> Self {
        match self {
            Self::Auto => {
                if provider_available("CUDA", &CUDAExecutionProvider::default()) {
                    Self::Cuda
                } else if provider_available("CoreML", &CoreMLExecutionProvider::default()) {
                    Self::CoreMl
                } else {
                    Self::Cpu
                }
            }
            other => other,
        }
    }

    /// Whether this device is a hardware accelerator.
    #[must_use]
    pub const fn is_accelerator(self) -> bool {
        matches!(self, Self::Cuda | Self::CoreMl)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Auto => "auto",
            Self::Cpu => "cpu",
            Self::Cuda => "cuda",
            Self::CoreMl => "coreml",
        };
        f.write_str(name)
    }
}

fn provider_available(name: &str, provider: &impl ExecutionProvider) -> bool {
    match provider.is_available() {
        Ok(available) => available,
        Err(err) => {
            tracing::debug!("{name} provider probe failed: {err}");
            false
        }
    }
}

/// Options applied to every ONNX session of a pipeline.
#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    /// Device the sessions are bound to. Must already be resolved.
    pub device: Device,
    /// ONNX Runtime memory pattern optimization. Trades peak memory for speed.
    pub memory_pattern: bool,
}

impl SessionOptions {
    /// Default options for a resolved device.
    ///
    /// Accelerators run with the memory pattern disabled to keep peak
    /// allocation down, mirroring attention slicing on the GPU.
    #[must_use]
    pub const fn for_device(device: Device) -> Self {
        Self {
            device,
            memory_pattern: !device.is_accelerator(),
        }
    }

    /// Build a session for the ONNX graph at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the session cannot be created or the execution
    /// provider fails to register.
    pub fn load(&self, name: &str, path: &Path) -> Result<Session> {
        tracing::debug!("Loading {name} from {} on {}", path.display(), self.device);

        self.build(path).map_err(|source| Error::ModelLoad {
            name: name.to_string(),
            source,
        })
    }

    fn build(&self, path: &Path) -> ort::Result<Session> {
        let builder = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_memory_pattern(self.memory_pattern)?;

        let builder = match self.device {
            Device::Cuda => builder.with_execution_providers([CUDAExecutionProvider::default()
                .build()
                .error_on_failure()])?,
            Device::CoreMl => builder.with_execution_providers([
                CoreMLExecutionProvider::default().build().error_on_failure(),
            ])?,
            Device::Cpu | Device::Auto => {
                builder.with_execution_providers([CPUExecutionProvider::default().build()])?
            }
        };

        builder.commit_from_file(path)
    }
}
