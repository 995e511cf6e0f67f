use std::sync::Arc;

use bytes::Bytes;

use crate::background::BackgroundWrites;
use crate::cancellation::CancellationCoordinator;
use crate::capability::SharedIndex;
use crate::error::IngestionError;
use crate::protocol::{ErrorContext, Event, Outbox};
use crate::store::PersistentStore;
use crate::transcript;

/// A point at which queued cancellations become visible.
pub trait Checkpoint {
    /// Check and clear the cancellation mark for `id`.
    fn cancelled(&mut self, id: &str) -> bool;
}

impl Checkpoint for CancellationCoordinator {
    fn cancelled(&mut self, id: &str) -> bool {
        self.consume_if_marked(id)
    }
}

#[derive(Debug)]
pub enum IngestOutcome {
    Added { count: usize },
    /// Cancelled before the index was called. Nothing was emitted.
    CancelledBeforeStart,
    /// Cancelled while the index call ran. The document may be indexed but
    /// is not reported.
    CancelledDuringProcessing,
    Failed(IngestionError),
}

/// Drives one document at a time into the index and reports on it.
pub struct IngestionQueue {
    index: SharedIndex,
    store: Arc<dyn PersistentStore>,
    writes: BackgroundWrites,
    snapshot_key: String,
    /// Held across export and write so snapshots land in commit order.
    snapshot_turn: Arc<tokio::sync::Mutex<()>>,
}

impl IngestionQueue {
    pub fn new(
        index: SharedIndex,
        store: Arc<dyn PersistentStore>,
        writes: BackgroundWrites,
        snapshot_key: impl Into<String>,
    ) -> Self {
        Self {
            index,
            store,
            writes,
            snapshot_key: snapshot_key.into(),
            snapshot_turn: Arc::default(),
        }
    }

    /// Emits `INDEX_PROGRESS*` then `DOCUMENT_ADDED` or `ERROR`, unless the
    /// document is cancelled at one of the two checkpoints.
    pub async fn submit<C>(
        &self,
        id: String,
        content: String,
        checkpoint: &mut C,
        outbox: &Outbox,
    ) -> IngestOutcome
    where
        C: Checkpoint + ?Sized,
    {
        if checkpoint.cancelled(&id) {
            tracing::info!(id = %id, "document cancelled before indexing started");
            return IngestOutcome::CancelledBeforeStart;
        }

        tracing::info!(id = %id, bytes = content.len(), "indexing document");
        let count = match self.index_document(id.clone(), content, outbox.clone()).await {
            Ok(count) => count,
            Err(error) => {
                tracing::warn!(id = %id, %error, "document rejected");
                outbox.error(&error, ErrorContext::Document { id });
                return IngestOutcome::Failed(error);
            }
        };

        if checkpoint.cancelled(&id) {
            tracing::info!(id = %id, "document cancelled while indexing; result not reported");
            return IngestOutcome::CancelledDuringProcessing;
        }

        tracing::info!(id = %id, count, "document indexed");
        outbox.emit(Event::DocumentAdded { count, id });
        self.persist_snapshot();
        IngestOutcome::Added { count }
    }

    async fn index_document(
        &self,
        id: String,
        content: String,
        outbox: Outbox,
    ) -> Result<usize, IngestionError> {
        let index = Arc::clone(&self.index);
        tokio::task::spawn_blocking(move || {
            let mut index = index
                .lock()
                .map_err(|e| IngestionError::Unavailable(format!("index lock poisoned: {e}")))?;
            if index.document_ids().iter().any(|existing| existing == &id) {
                return Err(IngestionError::AlreadyIndexed(id));
            }

            let content = if transcript::looks_like_transcript(&content) {
                transcript::parse(&content)
            } else {
                content
            };

            let mut report = |unit: usize, total: usize| {
                let current = unit + 1;
                outbox.emit(Event::IndexProgress {
                    filename: id.clone(),
                    current,
                    total,
                    percent: current as f64 / total.max(1) as f64 * 100.0,
                });
            };
            if let Err(reason) = index.add_document(&id, &content, &mut report) {
                return Err(IngestionError::Rejected { id, reason });
            }
            Ok(index.document_count())
        })
        .await?
    }

    /// Export the index and write it to the store without holding up the caller.
    fn persist_snapshot(&self) {
        let index = Arc::clone(&self.index);
        let store = Arc::clone(&self.store);
        let key = self.snapshot_key.clone();
        let turn = Arc::clone(&self.snapshot_turn);
        self.writes.spawn("index snapshot", key.clone(), async move {
            let _turn = turn.lock().await;
            let bytes = tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<u8>> {
                let index = index
                    .lock()
                    .map_err(|e| anyhow::anyhow!("index lock poisoned: {e}"))?;
                index.export_state()
            })
            .await??;
            store.set(&key, Bytes::from(bytes)).await?;
            anyhow::Ok(())
        });
    }
}
