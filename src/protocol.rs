//! Messages exchanged between the controller and the worker, and the table
//! deciding which of them a worker state accepts.
//!
//! Serialized form is `{"type": "ADD_DOCUMENT", "payload": {...}}`.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::types::{InitProgress, SearchResult};
use crate::worker::WorkerState;

/// Controller -> worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Command {
    Init,
    AddDocument {
        id: String,
        content: String,
    },
    #[serde(rename_all = "camelCase")]
    Search {
        request_id: u64,
        query: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        allowed_ids: Option<Vec<String>>,
    },
    CancelDocument {
        id: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Init,
    AddDocument,
    Search,
    CancelDocument,
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::Init => CommandKind::Init,
            Command::AddDocument { .. } => CommandKind::AddDocument,
            Command::Search { .. } => CommandKind::Search,
            Command::CancelDocument { .. } => CommandKind::CancelDocument,
        }
    }
}

/// What an `ERROR` refers to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "camelCase")]
pub enum ErrorContext {
    Init,
    Document {
        id: String,
    },
    #[serde(rename_all = "camelCase")]
    Search {
        request_id: u64,
    },
}

/// Worker -> controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Event {
    InitProgress(InitProgress),
    Ready,
    RestoredDocs {
        ids: Vec<String>,
    },
    IndexProgress {
        filename: String,
        current: usize,
        total: usize,
        percent: f64,
    },
    DocumentAdded {
        count: usize,
        id: String,
    },
    #[serde(rename_all = "camelCase")]
    SearchResults {
        request_id: u64,
        results: Vec<SearchResult>,
    },
    Error {
        payload: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context: Option<ErrorContext>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Handle,
    Drop,
}

/// The (state, message) transition table.
///
/// `CANCEL_DOCUMENT` is always recorded. `INIT` is accepted exactly once.
/// Ingestion and search are only served once ready; anything else is
/// dropped without a reply.
pub fn route(state: WorkerState, kind: CommandKind) -> Route {
    use CommandKind as K;
    use WorkerState as S;

    match (state, kind) {
        (_, K::CancelDocument) => Route::Handle,
        (S::Uninitialized, K::Init) => Route::Handle,
        (S::Initializing | S::Ready | S::Failed, K::Init) => Route::Drop,
        (S::Ready, K::AddDocument | K::Search) => Route::Handle,
        (S::Uninitialized | S::Initializing | S::Failed, K::AddDocument | K::Search) => {
            Route::Drop
        }
    }
}

/// Sending half of the worker -> controller channel.
#[derive(Clone, Debug)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<Event>,
}

impl Outbox {
    pub fn new(tx: mpsc::UnboundedSender<Event>) -> Self {
        Self { tx }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /// Fire and forget; a controller that went away is not an error here.
    pub fn emit(&self, event: Event) {
        if self.tx.send(event).is_err() {
            tracing::trace!("controller is gone, event discarded");
        }
    }

    pub fn error(&self, payload: impl ToString, context: ErrorContext) {
        self.emit(Event::Error {
            payload: payload.to_string(),
            context: Some(context),
        });
    }
}
