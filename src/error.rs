//! Error type shared by the library and the CLI.

use std::path::PathBuf;
use thiserror::Error;

/// Everything that can go wrong while restoring a batch of photos.
#[derive(Error, Debug)]
pub enum Error {
    /// An input photo could not be decoded.
    #[error("failed to read image {path}")]
    ImageLoad {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    /// A restored photo could not be encoded or written.
    #[error("failed to write image {path}")]
    ImageSave {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    /// The input directory does not exist or is not a directory.
    #[error("input directory does not exist: {path}")]
    InputDirMissing { path: PathBuf },

    /// The output directory could not be created.
    #[error("failed to create output directory {path}")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// No supported images were found in the input directory.
    #[error("no images found in {path}")]
    NoImages { path: PathBuf },

    /// Fetching a model export file failed.
    #[error("failed to download {name}")]
    ModelDownload {
        name: String,
        #[source]
        source: reqwest::Error,
    },

    /// ONNX Runtime rejected a model file.
    #[error("failed to load {name} session")]
    ModelLoad {
        name: String,
        #[source]
        source: ort::Error,
    },

    /// No location is configured for a model's files.
    #[error("no model source configured for {task}; pass --model-dir or set [{task}] model_dir/base_url in the config file")]
    ModelSourceMissing { task: &'static str },

    /// A session run failed.
    #[error("inference failed")]
    Inference {
        #[source]
        source: ort::Error,
    },

    /// Tokenizer loading or encoding failed.
    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    /// The model cache directory could not be created.
    #[error("failed to create model cache {path}")]
    CacheDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configuration file could not be read or parsed.
    #[error("config error: {0}")]
    Config(String),

    /// A generation parameter is out of range.
    #[error("invalid parameter {name}: {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A model produced or expected a tensor of the wrong shape.
    #[error("expected {expected}, got {actual}")]
    ShapeMismatch { expected: String, actual: String },
}

impl Error {
    pub(crate) fn invalid(name: &str, reason: &str) -> Self {
        Self::InvalidParameter {
            name: name.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// `Result` with [`enum@Error`] as the error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chained_display_names_each_cause_once() {
        let err = Error::OutputDir {
            path: PathBuf::from("restored"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only volume"),
        };

        let chain = format!("{:#}", anyhow::Error::from(err));
        assert_eq!(chain, "failed to create output directory restored: read-only volume");
    }
}
