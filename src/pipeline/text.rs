//! CLIP prompt encoding.

use std::path::Path;

use ndarray::{Array2, Array3, Ix3};
use ort::session::Session;
use serde::Deserialize;
use tokenizers::Tokenizer;

use crate::error::{Error, Result};
use crate::model::{ModelCache, ModelFile, SessionOptions};

use super::session::{extract, inference_err, integer_input, missing_output};

/// Sequence length of the CLIP text encoders.
pub const MAX_TOKENS: usize = 77;

/// CLIP end-of-text token, also the pad token of the Stable Diffusion 1.x tokenizer.
pub const END_OF_TEXT: &str = "<|endoftext|>";

/// Pad token of the `OpenCLIP` tokenizer used by the Stable Diffusion 2.x family.
pub const OPENCLIP_PAD_TOKEN: &str = "!";

const SPECIAL_TOKENS_MAP: &str = "tokenizer/special_tokens_map.json";

#[derive(Debug, Default, Deserialize)]
struct SpecialTokensMap {
    #[serde(default)]
    pad_token: Option<SpecialToken>,
}

/// A special token, either bare or in the `AddedToken` object form.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SpecialToken {
    Plain(String),
    Added { content: String },
}

impl SpecialToken {
    fn content(&self) -> &str {
        match self {
            Self::Plain(content) | Self::Added { content } => content,
        }
    }
}

/// Prompt embeddings for one generation, with the unconditional pair when
/// classifier-free guidance is active.
#[derive(Debug, Clone)]
pub struct PromptEmbeddings {
    pub cond: Array3<f32>,
    pub uncond: Option<Array3<f32>>,
}

/// Tokenizer plus text encoder session.
pub struct TextEncoder {
    tokenizer: Tokenizer,
    pad_id: u32,
    end_id: u32,
    session: Session,
}

impl TextEncoder {
    /// Load the tokenizer and text encoder of a model export.
    ///
    /// Prompts are padded with the export's declared pad token, then the
    /// tokenizer's own padding setting, then `default_pad`.
    ///
    /// # Errors
    ///
    /// Returns an error if either file cannot be resolved or loaded, or the
    /// pad token is not in the vocabulary.
    pub fn load(models: &ModelCache, options: &SessionOptions, default_pad: &str) -> Result<Self> {
        let tokenizer = load_tokenizer(&models.get_model_path(ModelFile::Tokenizer)?)?;
        let end_id = tokenizer
            .token_to_id(END_OF_TEXT)
            .ok_or_else(|| Error::Tokenizer(format!("vocabulary has no {END_OF_TEXT} token")))?;

        let declared = match models.optional_file(SPECIAL_TOKENS_MAP)? {
            Some(path) => read_special_tokens(&path)?.pad_token,
            None => None,
        };
        let pad_id = select_pad_id(
            |token| tokenizer.token_to_id(token),
            declared.as_ref().map(SpecialToken::content),
            tokenizer.get_padding().map(|padding| padding.pad_id),
            default_pad,
        )?;
        tracing::debug!("Padding prompts with token id {pad_id}");

        let session = models.load_session(ModelFile::TextEncoder, options)?;

        Ok(Self {
            tokenizer,
            pad_id,
            end_id,
            session,
        })
    }

    /// Embed `prompt`, and the empty prompt as well when `guided` is set.
    ///
    /// # Errors
    ///
    /// Returns an error if tokenization or inference fails.
    pub fn embed(&mut self, prompt: &str, guided: bool) -> Result<PromptEmbeddings> {
        let cond = self.encode(prompt)?;
        let uncond = if guided { Some(self.encode("")?) } else { None };
        Ok(PromptEmbeddings { cond, uncond })
    }

    /// Encode one prompt into `(1, 77, hidden)` embeddings.
    ///
    /// # Errors
    ///
    /// Returns an error if tokenization or inference fails.
    pub fn encode(&mut self, prompt: &str) -> Result<Array3<f32>> {
        let ids = self.token_ids(prompt)?;
        tracing::debug!("Encoding prompt {prompt:?} ({} tokens)", ids.len());

        let ids = Array2::from_shape_vec((1, MAX_TOKENS), ids).map_err(|_| Error::ShapeMismatch {
            expected: format!("{MAX_TOKENS} token ids"),
            actual: "wrong length".to_string(),
        })?;
        let input_ids = integer_input(&self.session, "input_ids", ids)?;

        let outputs = self
            .session
            .run(ort::inputs!["input_ids" => input_ids])
            .map_err(inference_err)?;

        let output = outputs
            .values()
            .next()
            .ok_or_else(|| missing_output("last_hidden_state"))?;

        extract::<Ix3>(&output, "last_hidden_state")
    }

    fn token_ids(&self, prompt: &str) -> Result<Vec<i64>> {
        let encoding = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| Error::Tokenizer(e.to_string()))?;
        Ok(pad_tokens(encoding.get_ids(), self.end_id, self.pad_id))
    }
}

fn load_tokenizer(path: &Path) -> Result<Tokenizer> {
    Tokenizer::from_file(path)
        .map_err(|e| Error::Tokenizer(format!("failed to load {}: {e}", path.display())))
}

fn read_special_tokens(path: &Path) -> Result<SpecialTokensMap> {
    let contents = std::fs::read_to_string(path)?;
    serde_json::from_str(&contents)
        .map_err(|e| Error::Tokenizer(format!("failed to parse {}: {e}", path.display())))
}

/// Pad id from the declared pad token, else the tokenizer's padding id, else
/// `default_pad`.
fn select_pad_id(
    token_to_id: impl Fn(&str) -> Option<u32>,
    declared: Option<&str>,
    padding_id: Option<u32>,
    default_pad: &str,
) -> Result<u32> {
    let token = match (declared, padding_id) {
        (Some(token), _) => token,
        (None, Some(id)) => return Ok(id),
        (None, None) => default_pad,
    };
    token_to_id(token)
        .ok_or_else(|| Error::Tokenizer(format!("pad token {token:?} is not in the vocabulary")))
}

/// Fit token ids to [`MAX_TOKENS`]: truncate keeping a closing end token,
/// then pad.
fn pad_tokens(ids: &[u32], end_id: u32, pad_id: u32) -> Vec<i64> {
    let mut tokens: Vec<i64> = ids.iter().map(|&id| i64::from(id)).collect();
    if tokens.len() > MAX_TOKENS {
        tokens.truncate(MAX_TOKENS - 1);
        tokens.push(i64::from(end_id));
    }
    tokens.resize(MAX_TOKENS, i64::from(pad_id));
    tokens
}
