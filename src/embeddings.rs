use std::sync::Mutex;

use anyhow::{Context, Result};
use fastembed::{
    InitOptionsUserDefined, Pooling, TextEmbedding, TokenizerFiles, UserDefinedEmbeddingModel,
};

use tokenizers::Tokenizer;

use crate::types::ModelAssets;

/// Used when the asset set carries no `special_tokens_map.json`.
const DEFAULT_SPECIAL_TOKENS_MAP: &[u8] = br#"{"cls_token":"[CLS]","mask_token":"[MASK]","pad_token":"[PAD]","sep_token":"[SEP]","unk_token":"[UNK]"}"#;

/// Used when the asset set carries no `tokenizer_config.json`. The tokenizer
/// setup reads `model_max_length` and `pad_token` from it.
const DEFAULT_TOKENIZER_CONFIG: &[u8] =
    br#"{"model_max_length":512,"pad_token":"[PAD]","do_lower_case":true}"#;

/// Sentence embedder built from in-memory model assets, mean pooled.
///
/// The inner `TextEmbedding` session is behind a `Mutex` so concurrent
/// callers are serialized through the ONNX runtime. The model's own
/// tokenizer is kept alongside for sizing plain-text chunks.
pub struct Embedder {
    model: Mutex<TextEmbedding>,
    tokenizer: Tokenizer,
}

impl Embedder {
    /// Build the ONNX session. Nothing is downloaded here; the bytes come
    /// from the asset loader.
    pub fn from_assets(assets: ModelAssets) -> Result<Self> {
        let tokenizer = chunk_tokenizer(&assets.tokenizer)?;
        let tokenizer_files = TokenizerFiles {
            tokenizer_file: assets.tokenizer.to_vec(),
            config_file: assets.config.to_vec(),
            special_tokens_map_file: assets
                .special_tokens_map
                .map_or_else(|| DEFAULT_SPECIAL_TOKENS_MAP.to_vec(), |b| b.to_vec()),
            tokenizer_config_file: assets
                .tokenizer_config
                .map_or_else(|| DEFAULT_TOKENIZER_CONFIG.to_vec(), |b| b.to_vec()),
        };
        let model = UserDefinedEmbeddingModel::new(assets.weights.to_vec(), tokenizer_files)
            .with_pooling(Pooling::Mean);
        let model =
            TextEmbedding::try_new_from_user_defined(model, InitOptionsUserDefined::default())
                .context("failed to build the embedding session")?;
        Ok(Self {
            model: Mutex::new(model),
            tokenizer,
        })
    }

    /// Tokenizer for measuring chunks, without padding or truncation.
    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    /// Embed a single text, L2-normalized.
    pub fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let model = self
            .model
            .lock()
            .map_err(|e| anyhow::anyhow!("model lock poisoned: {e}"))?;
        let mut results = model.embed(vec![text], None)?;
        if results.is_empty() {
            anyhow::bail!("embedding model returned no vector");
        }
        Ok(normalize(results.remove(0)))
    }
}

fn chunk_tokenizer(raw: &[u8]) -> Result<Tokenizer> {
    let mut tokenizer = Tokenizer::from_bytes(raw)
        .map_err(|e| anyhow::anyhow!("tokenizer.json is not readable: {e}"))?;
    tokenizer
        .with_padding(None)
        .with_truncation(None)
        .map_err(|e| anyhow::anyhow!("failed to reset tokenizer truncation: {e}"))?;
    Ok(tokenizer)
}

/// L2-normalize so cosine similarity == dot product.
pub(crate) fn normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 1e-10 {
        v.iter_mut().for_each(|x| *x /= norm);
    }
    v
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_produces_unit_length() {
        let v = normalize(vec![3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn normalize_leaves_zero_vector_alone() {
        assert_eq!(normalize(vec![0.0, 0.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn fallback_tokenizer_files_are_valid_json() {
        for raw in [DEFAULT_SPECIAL_TOKENS_MAP, DEFAULT_TOKENIZER_CONFIG] {
            let parsed: serde_json::Value = serde_json::from_slice(raw).expect("valid json");
            assert!(parsed.is_object());
        }
    }

    #[test]
    fn unreadable_tokenizer_is_rejected() {
        let err = chunk_tokenizer(b"not json").expect_err("bad tokenizer");
        assert!(err.to_string().contains("tokenizer.json"));
    }

    #[test]
    fn garbage_weights_fail_to_load() {
        let assets = ModelAssets {
            weights: bytes::Bytes::from_static(b"not onnx"),
            tokenizer: bytes::Bytes::from_static(b"{}"),
            config: bytes::Bytes::from_static(b"{}"),
            special_tokens_map: None,
            tokenizer_config: None,
        };
        assert!(Embedder::from_assets(assets).is_err());
    }
}
