use thiserror::Error;
use tokio::task::JoinError;

use crate::protocol::CommandKind;
use crate::worker::WorkerState;

/// Fetching an asset from the network failed. Fatal to initialization.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("Failed to fetch {locator}: HTTP {status} {reason}")]
    Status {
        locator: String,
        status: u16,
        reason: String,
    },

    #[error("Transport error while fetching {locator}: {message}")]
    Transport { locator: String, message: String },
}

/// Persistent store failure. Always recovered locally, never surfaced.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Store task failed: {0}")]
    Task(#[from] JoinError),

    #[error("Store is unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug)]
pub enum InitError {
    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error("Failed to load model: {reason:#}")]
    ModelLoad { reason: anyhow::Error },

    #[error("Initialization task failed: {0}")]
    Task(#[from] JoinError),
}

/// The index rejected a document. Reported per document.
#[derive(Error, Debug)]
pub enum IngestionError {
    #[error("Document {0} is already indexed")]
    AlreadyIndexed(String),

    #[error("Failed to index {id}: {reason:#}")]
    Rejected { id: String, reason: anyhow::Error },

    #[error("Index is unavailable: {0}")]
    Unavailable(String),

    #[error("Ingestion task failed: {0}")]
    Task(#[from] JoinError),
}

#[derive(Error, Debug)]
pub enum SearchError {
    #[error("Search failed: {reason:#}")]
    Capability { reason: anyhow::Error },

    #[error("Index is unavailable: {0}")]
    Unavailable(String),

    #[error("Search task failed: {0}")]
    Task(#[from] JoinError),
}

/// A message arrived in a state that does not accept it.
/// Dropped and logged, never reported to the controller.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("{kind:?} is not accepted while {state:?}")]
pub struct ProtocolViolation {
    pub state: WorkerState,
    pub kind: CommandKind,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_error_mentions_locator_and_status() {
        let error = NetworkError::Status {
            locator: "https://example.com/model.onnx".into(),
            status: 404,
            reason: "Not Found".into(),
        };
        assert_eq!(
            error.to_string(),
            "Failed to fetch https://example.com/model.onnx: HTTP 404 Not Found"
        );
    }

    #[test]
    fn rejected_document_renders_full_cause_chain() {
        let reason = anyhow::anyhow!("no segments").context("segmenting chat.txt");
        let error = IngestionError::Rejected {
            id: "chat.txt".into(),
            reason,
        };
        assert_eq!(
            error.to_string(),
            "Failed to index chat.txt: segmenting chat.txt: no segments"
        );
    }

    #[test]
    fn protocol_violation_names_state_and_kind() {
        let violation = ProtocolViolation {
            state: WorkerState::Initializing,
            kind: CommandKind::Search,
        };
        assert_eq!(violation.to_string(), "Search is not accepted while Initializing");
    }
}
