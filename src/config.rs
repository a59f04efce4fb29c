//! Configuration file loading.
//!
//! The file only says where models live; every generation parameter comes
//! from the command line.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::model::ModelSource;

/// Public ONNX export of Stable Diffusion 1.5.
pub const SD15_ONNX_URL: &str =
    "https://huggingface.co/modularai/stable-diffusion-1.5-onnx/resolve/main";

/// CLIP BPE tokenizer; the vocabulary matches the Stable Diffusion 1.x text encoder.
pub const SD15_TOKENIZER_URL: &str =
    "https://huggingface.co/openai/clip-vit-base-patch32/resolve/main/tokenizer.json";

/// `OpenCLIP` ViT-H/14 tokenizer used by the Stable Diffusion 2.x family.
pub const OPENCLIP_TOKENIZER_URL: &str =
    "https://huggingface.co/laion/CLIP-ViT-H-14-laion2B-s32B-b79K/resolve/main/tokenizer.json";

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Override for the model download cache.
    pub cache_dir: Option<PathBuf>,

    /// Colorization model location.
    #[serde(default)]
    pub colorize: ModelConfig,

    /// Upscaler model location.
    #[serde(default)]
    pub upscale: ModelConfig,
}

/// Location of one model export.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
    /// Local export directory. Takes precedence over `base_url`.
    pub model_dir: Option<PathBuf>,
    /// Base URL the export's files are downloaded from.
    pub base_url: Option<String>,
    /// Tokenizer to download when the export does not ship one.
    pub tokenizer_url: Option<String>,
}

impl ModelConfig {
    /// Pick the model source: `--model-dir`, then `model_dir`, then `base_url`,
    /// then `default_url`.
    #[must_use]
    pub fn source(&self, cli_dir: Option<&Path>, default_url: Option<&str>) -> Option<ModelSource> {
        if let Some(dir) = cli_dir.or(self.model_dir.as_deref()) {
            return Some(ModelSource::Local(dir.to_path_buf()));
        }
        self.base_url
            .as_deref()
            .or(default_url)
            .map(|url| ModelSource::Remote {
                base_url: url.to_string(),
            })
    }

    /// Tokenizer URL, falling back to `default_url`.
    #[must_use]
    pub fn tokenizer_url(&self, default_url: &str) -> String {
        self.tokenizer_url
            .clone()
            .unwrap_or_else(|| default_url.to_string())
    }
}

impl Config {
    /// Load configuration from the given path, or return defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
        toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("failed to parse {}: {e}", path.display())))
    }
}

/// Discover the config file path using the resolution order:
/// 1. Explicit path (from `--config` flag)
/// 2. `PHOTOREVIVE_CONFIG` environment variable
/// 3. `~/.config/photorevive/config.toml`
#[must_use]
pub fn discover_config_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(p) = explicit {
        return p.to_path_buf();
    }

    if let Ok(p) = std::env::var("PHOTOREVIVE_CONFIG") {
        return PathBuf::from(p);
    }

    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("photorevive")
        .join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_nonexistent_returns_defaults() {
        let config = Config::load(Path::new("/nonexistent/path/config.toml")).unwrap();
        assert!(config.cache_dir.is_none());
        assert!(config.upscale.model_dir.is_none());
    }

    #[test]
    fn load_valid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
cache_dir = "/tmp/models"

[colorize]
base_url = "https://example.com/sd15"

[upscale]
model_dir = "/models/x4"
tokenizer_url = "https://example.com/tokenizer.json"
"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.cache_dir.as_deref(), Some(Path::new("/tmp/models")));
        assert_eq!(config.colorize.base_url.as_deref(), Some("https://example.com/sd15"));
        assert_eq!(config.upscale.model_dir.as_deref(), Some(Path::new("/models/x4")));
        assert_eq!(
            config.upscale.tokenizer_url(OPENCLIP_TOKENIZER_URL),
            "https://example.com/tokenizer.json"
        );
    }

    #[test]
    fn load_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "this is not valid toml {{{").unwrap();

        assert!(matches!(Config::load(&path), Err(Error::Config(_))));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("typo.toml");
        std::fs::write(&path, "[upscale]\nmodel_path = \"/x\"\n").unwrap();

        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn source_precedence() {
        let config = ModelConfig {
            model_dir: Some(PathBuf::from("/from/config")),
            base_url: Some("https://example.com".into()),
            tokenizer_url: None,
        };

        assert_eq!(
            config.source(Some(Path::new("/from/cli")), None),
            Some(ModelSource::Local(PathBuf::from("/from/cli")))
        );
        assert_eq!(
            config.source(None, None),
            Some(ModelSource::Local(PathBuf::from("/from/config")))
        );

        let remote_only = ModelConfig {
            model_dir: None,
            ..config
        };
        assert_eq!(
            remote_only.source(None, Some(SD15_ONNX_URL)),
            Some(ModelSource::Remote {
                base_url: "https://example.com".into()
            })
        );
    }

    #[test]
    fn no_source_without_default() {
        assert_eq!(ModelConfig::default().source(None, None), None);
        assert_eq!(
            ModelConfig::default().source(None, Some(SD15_ONNX_URL)),
            Some(ModelSource::Remote {
                base_url: SD15_ONNX_URL.into()
            })
        );
    }

    #[test]
    fn discover_explicit_path() {
        let path = discover_config_path(Some(Path::new("/tmp/my-config.toml")));
        assert_eq!(path, PathBuf::from("/tmp/my-config.toml"));
    }
}
