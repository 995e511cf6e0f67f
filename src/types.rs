use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A large immutable blob the index needs before it can serve requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetDescriptor {
    /// Cache key. Last path segment of the locator.
    pub name: String,
    pub source_locator: String,
    pub estimated_size_bytes: u64,
}

impl AssetDescriptor {
    pub fn from_locator(locator: impl Into<String>, estimated_size_bytes: u64) -> Self {
        let source_locator = locator.into();
        let name = source_locator
            .rsplit('/')
            .next()
            .filter(|segment| !segment.is_empty())
            .unwrap_or("unknown")
            .to_string();
        Self {
            name,
            source_locator,
            estimated_size_bytes,
        }
    }
}

/// Byte progress of a single asset. `total_bytes == 0` means unknown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadProgress {
    pub loaded_bytes: u64,
    pub total_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InitStage {
    #[serde(rename = "Downloading model...")]
    Downloading,
    #[serde(rename = "Compiling model...")]
    Compiling,
    #[serde(rename = "Initializing...")]
    Initializing,
}

impl InitStage {
    pub fn label(self) -> &'static str {
        match self {
            InitStage::Downloading => "Downloading model...",
            InitStage::Compiling => "Compiling model...",
            InitStage::Initializing => "Initializing...",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InitProgress {
    pub percent: f64, // 0.0 to 100.0
    pub status: InitStage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadState {
    Pending,
    Processing,
    Completed,
    Error,
}

impl UploadState {
    pub fn is_terminal(self) -> bool {
        matches!(self, UploadState::Completed | UploadState::Error)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadProgress {
    pub current: usize,
    pub total: usize,
    pub percent: f64,
    pub etr: String,
    pub start_time: i64, // Unix ms of the first progress event
}

/// Per-document ingestion status as seen by the controller.
/// `filename` doubles as the document id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadStatus {
    pub filename: String,
    pub status: UploadState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<UploadProgress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Unix ms at which the entry reached a terminal state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settled_at: Option<i64>,
}

impl UploadStatus {
    pub fn pending(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            status: UploadState::Pending,
            progress: None,
            error: None,
            settled_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub doc_id: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    pub score: f32,
}

/// Model files handed to the index capability once downloaded.
/// The two tokenizer-side files are optional; the capability supplies
/// defaults when they are absent.
#[derive(Debug, Clone)]
pub struct ModelAssets {
    pub weights: Bytes,
    pub tokenizer: Bytes,
    pub config: Bytes,
    pub special_tokens_map: Option<Bytes>,
    pub tokenizer_config: Option<Bytes>,
}
