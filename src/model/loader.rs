//! Model file resolution, downloading, and session loading.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use indicatif::{ProgressBar, ProgressStyle};
use ort::session::Session;
use reqwest::StatusCode;

use crate::error::{Error, Result};

use super::SessionOptions;

/// Files of an optimum-style Stable Diffusion ONNX export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFile {
    /// CLIP text encoder - turns token ids into prompt embeddings.
    TextEncoder,
    /// CLIP BPE tokenizer in `tokenizers` JSON format.
    Tokenizer,
    /// VAE Encoder - encodes images to latent space.
    VaeEncoder,
    /// VAE Decoder - decodes latents to images.
    VaeDecoder,
    /// `UNet` - performs the denoising diffusion.
    Unet,
}

impl ModelFile {
    /// Path of this file relative to the export root.
    #[must_use]
    pub const fn relative_path(&self) -> &'static str {
        match self {
            Self::TextEncoder => "text_encoder/model.onnx",
            Self::Tokenizer => "tokenizer/tokenizer.json",
            Self::VaeEncoder => "vae_encoder/model.onnx",
            Self::VaeDecoder => "vae_decoder/model.onnx",
            Self::Unet => "unet/model.onnx",
        }
    }

    /// External tensor data stored next to the graph, if the export may have one.
    /// Must match the name referenced inside the ONNX file.
    #[must_use]
    pub const fn external_data(&self) -> Option<&'static str> {
        match self {
            Self::Unet => Some("unet/model.onnx_data"),
            Self::TextEncoder | Self::Tokenizer | Self::VaeEncoder | Self::VaeDecoder => None,
        }
    }

    /// Approximate size in bytes, for progress bars when the server sends no length.
    #[must_use]
    pub const fn approx_size(&self) -> u64 {
        match self {
            Self::TextEncoder => 490_000_000,
            Self::Tokenizer => 2_200_000,
            Self::VaeEncoder => 140_000_000,
            Self::VaeDecoder => 200_000_000,
            Self::Unet => 3_500_000_000,
        }
    }
}

/// Where a pipeline's model files come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
    /// An export already on disk.
    Local(PathBuf),
    /// An export served over HTTP, e.g. a Hugging Face `resolve/main` URL.
    Remote { base_url: String },
}

/// Resolves model files to local paths, downloading into a cache when needed.
pub struct ModelCache {
    cache_dir: PathBuf,
    source: ModelSource,
    tokenizer_url: Option<String>,
}

impl ModelCache {
    /// Create a cache for one model export.
    ///
    /// Downloads land in `<base>/<name>`, where `base` defaults to the
    /// platform cache directory:
    /// - Windows: `%LOCALAPPDATA%\photorevive\models`
    /// - Linux: `~/.cache/photorevive/models`
    /// - macOS: `~/Library/Caches/photorevive/models`
    ///
    /// # Errors
    ///
    /// Returns an error if the cache directory cannot be created.
    pub fn new(
        base: Option<&Path>,
        name: &str,
        source: ModelSource,
        tokenizer_url: Option<String>,
    ) -> Result<Self> {
        let base = base.map_or_else(default_cache_base, Path::to_path_buf);
        let cache_dir = base.join(name);

        fs::create_dir_all(&cache_dir).map_err(|source| Error::CacheDir {
            path: cache_dir.clone(),
            source,
        })?;

        Ok(Self {
            cache_dir,
            source,
            tokenizer_url,
        })
    }

    /// Directory downloads are written to.
    #[must_use]
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Get the local path of a model file, downloading it if necessary.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing from a local export or cannot
    /// be downloaded.
    pub fn get_model_path(&self, file: ModelFile) -> Result<PathBuf> {
        match &self.source {
            ModelSource::Local(dir) => {
                let path = dir.join(file.relative_path());
                if path.exists() {
                    return Ok(path);
                }
                match (file, &self.tokenizer_url) {
                    (ModelFile::Tokenizer, Some(url)) => self.cached_tokenizer(url),
                    _ => Err(not_found(&path)),
                }
            }
            ModelSource::Remote { base_url } => {
                if file == ModelFile::Tokenizer {
                    return self.remote_tokenizer(base_url);
                }

                let path = self.cache_dir.join(file.relative_path());
                if !path.exists() {
                    let url = join_url(base_url, file.relative_path());
                    download_file(&url, &path, file.relative_path(), file.approx_size(), false)?;
                }

                // External data is optional: small graphs carry their weights inline.
                if let Some(data) = file.external_data() {
                    let data_path = self.cache_dir.join(data);
                    if !data_path.exists() {
                        let url = join_url(base_url, data);
                        download_file(&url, &data_path, data, file.approx_size(), true)?;
                    }
                }

                Ok(path)
            }
        }
    }

    /// Resolve an auxiliary file of the export that may be absent, such as
    /// tokenizer metadata. Returns `None` when the export does not have it.
    ///
    /// # Errors
    ///
    /// Returns an error if a download fails for a reason other than absence.
    pub fn optional_file(&self, relative: &str) -> Result<Option<PathBuf>> {
        let path = match &self.source {
            ModelSource::Local(dir) => dir.join(relative),
            ModelSource::Remote { base_url } => {
                let path = self.cache_dir.join(relative);
                if !path.exists() {
                    download_file(&join_url(base_url, relative), &path, relative, 0, true)?;
                }
                path
            }
        };
        Ok(path.exists().then_some(path))
    }

    /// Load an ONNX session for a model file.
    ///
    /// # Errors
    ///
    /// Returns an error if the model cannot be resolved or loaded.
    pub fn load_session(&self, file: ModelFile, options: &SessionOptions) -> Result<Session> {
        let path = self.get_model_path(file)?;
        options.load(file.relative_path(), &path)
    }

    /// Tokenizer of a remote export, or the fallback tokenizer when the
    /// export does not ship one.
    fn remote_tokenizer(&self, base_url: &str) -> Result<PathBuf> {
        let file = ModelFile::Tokenizer;
        let path = self.cache_dir.join(file.relative_path());

        for (url, optional) in self.tokenizer_urls(base_url) {
            if path.exists() {
                break;
            }
            download_file(&url, &path, file.relative_path(), file.approx_size(), optional)?;
        }

        if path.exists() {
            Ok(path)
        } else {
            Err(not_found(&path))
        }
    }

    /// Download order for a remote tokenizer. The export's copy is optional
    /// only when a fallback URL follows it.
    fn tokenizer_urls(&self, base_url: &str) -> Vec<(String, bool)> {
        let export = join_url(base_url, ModelFile::Tokenizer.relative_path());
        match &self.tokenizer_url {
            Some(fallback) => vec![(export, true), (fallback.clone(), false)],
            None => vec![(export, false)],
        }
    }

    fn cached_tokenizer(&self, url: &str) -> Result<PathBuf> {
        let path = self.cache_dir.join(ModelFile::Tokenizer.relative_path());
        if !path.exists() {
            download_file(
                url,
                &path,
                ModelFile::Tokenizer.relative_path(),
                ModelFile::Tokenizer.approx_size(),
                false,
            )?;
        }
        Ok(path)
    }
}

fn default_cache_base() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("photorevive")
        .join("models")
}

fn not_found(path: &Path) -> Error {
    Error::Io(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        format!("model file not found: {}", path.display()),
    ))
}

fn join_url(base: &str, relative: &str) -> String {
    format!("{}/{relative}", base.trim_end_matches('/'))
}

/// Download a file from a URL to a path with progress indication.
///
/// With `optional` set, a 404 response is not an error and nothing is written.
fn download_file(url: &str, path: &Path, name: &str, approx_size: u64, optional: bool) -> Result<()> {
    let download_err = |source| Error::ModelDownload {
        name: name.to_string(),
        source,
    };

    let client = reqwest::blocking::Client::builder()
        .timeout(None::<std::time::Duration>)
        .build()
        .map_err(download_err)?;
    let response = client.get(url).send().map_err(download_err)?;

    if optional && response.status() == StatusCode::NOT_FOUND {
        tracing::debug!("{name} not present at {url}, skipping");
        return Ok(());
    }

    let mut response = response.error_for_status().map_err(download_err)?;
    tracing::info!("Downloading {name} from {url}");

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let total_size = response.content_length().unwrap_or(approx_size);

    let pb = ProgressBar::new(total_size);
    pb.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} {msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-"),
    );
    pb.set_message(name.to_string());

    // Write to a temporary file first, then rename for atomicity
    let temp_path = path.with_extension("tmp");
    let mut file = fs::File::create(&temp_path)?;

    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let bytes_read = response.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        file.write_all(&buffer[..bytes_read])?;
        pb.inc(bytes_read as u64);
    }
    file.flush()?;

    pb.finish_with_message(format!("Downloaded {name}"));

    fs::rename(&temp_path, path)?;

    Ok(())
}
