use std::path::PathBuf;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::types::AssetDescriptor;

const MODEL_BASE: &str = "https://huggingface.co/sentence-transformers/all-MiniLM-L6-v2/resolve/main";

#[derive(Clone, Deserialize, Debug, PartialEq, Eq)]
pub struct AssetSettings {
    pub locator: String,
    /// Used for progress until the server reports a length.
    #[serde(default)]
    pub estimated_size_bytes: u64,
}

impl AssetSettings {
    fn new(locator: String, estimated_size_bytes: u64) -> Self {
        Self {
            locator,
            estimated_size_bytes,
        }
    }

    pub fn descriptor(&self) -> AssetDescriptor {
        AssetDescriptor::from_locator(&self.locator, self.estimated_size_bytes)
    }
}

#[derive(Clone, Deserialize, Debug, PartialEq, Eq)]
pub struct ModelAssetSettings {
    pub weights: AssetSettings,
    pub tokenizer: AssetSettings,
    pub config: AssetSettings,
    #[serde(default)]
    pub special_tokens_map: Option<AssetSettings>,
    #[serde(default)]
    pub tokenizer_config: Option<AssetSettings>,
}

impl Default for ModelAssetSettings {
    fn default() -> Self {
        Self {
            weights: AssetSettings::new(format!("{MODEL_BASE}/onnx/model.onnx"), 90_405_214),
            tokenizer: AssetSettings::new(format!("{MODEL_BASE}/tokenizer.json"), 466_247),
            config: AssetSettings::new(format!("{MODEL_BASE}/config.json"), 612),
            special_tokens_map: Some(AssetSettings::new(
                format!("{MODEL_BASE}/special_tokens_map.json"),
                112,
            )),
            tokenizer_config: Some(AssetSettings::new(
                format!("{MODEL_BASE}/tokenizer_config.json"),
                350,
            )),
        }
    }
}

#[derive(Clone, Deserialize, Debug)]
pub struct Settings {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub assets: ModelAssetSettings,
    #[serde(default = "default_search_limit")]
    pub search_limit: usize,
    #[serde(default = "default_score_threshold")]
    pub score_threshold: f32,
    #[serde(default = "default_snapshot_key")]
    pub snapshot_key: String,
    #[serde(default = "default_max_chunk_tokens")]
    pub max_chunk_tokens: usize,
    /// How long completed/failed uploads stay visible before pruning.
    #[serde(default = "default_completed_display_ms")]
    pub completed_display_ms: i64,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_search_limit() -> usize {
    5
}

fn default_score_threshold() -> f32 {
    0.5
}

fn default_snapshot_key() -> String {
    "index-snapshot".to_string()
}

fn default_max_chunk_tokens() -> usize {
    100
}

fn default_completed_display_ms() -> i64 {
    3000
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            assets: ModelAssetSettings::default(),
            search_limit: default_search_limit(),
            score_threshold: default_score_threshold(),
            snapshot_key: default_snapshot_key(),
            max_chunk_tokens: default_max_chunk_tokens(),
            completed_display_ms: default_completed_display_ms(),
        }
    }
}

impl Settings {
    /// Path of the SQLite file backing the persistent store.
    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("store.sqlite")
    }
}

/// Reads `local-mind.*` from the working directory (optional), then
/// `LOCAL_MIND_*` environment variables, e.g. `LOCAL_MIND_SEARCH_LIMIT=10`
/// or `LOCAL_MIND_ASSETS__WEIGHTS__LOCATOR=...`.
pub fn get_settings() -> Result<Settings, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("local-mind").required(false))
        .add_source(
            Environment::with_prefix("LOCAL_MIND")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    config.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_search_parameters() {
        let settings = Settings::default();
        assert_eq!(settings.search_limit, 5);
        assert!((settings.score_threshold - 0.5).abs() < f32::EPSILON);
        assert_eq!(settings.snapshot_key, "index-snapshot");
        assert_eq!(settings.store_path(), PathBuf::from("./data/store.sqlite"));
    }

    #[test]
    fn default_assets_derive_cache_keys_from_locators() {
        let assets = ModelAssetSettings::default();
        assert_eq!(assets.weights.descriptor().name, "model.onnx");
        assert_eq!(assets.tokenizer.descriptor().name, "tokenizer.json");
        assert_eq!(assets.config.descriptor().name, "config.json");
    }

    #[test]
    fn partial_source_falls_back_to_defaults() {
        let config = Config::builder()
            .set_override("search_limit", 9)
            .expect("override")
            .build()
            .expect("build config");
        let settings: Settings = config.try_deserialize().expect("deserialize settings");
        assert_eq!(settings.search_limit, 9);
        assert_eq!(settings.max_chunk_tokens, 100);
        assert_eq!(settings.assets, ModelAssetSettings::default());
    }
}
