//! The background worker: owns the index, answers controller commands.
//!
//! ```text
//! Uninitialized --INIT--> Initializing --ok--> Ready
//!                              |
//!                              +--err--> Failed
//! ```
//!
//! Initialization runs as its own task so the loop keeps routing commands
//! while it is in flight. Everything else is handled one command at a time.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::assets::{AssetFetcher, AssetLoader};
use crate::background::BackgroundWrites;
use crate::cancellation::CancellationCoordinator;
use crate::capability::{self, IndexCapability, SharedIndex};
use crate::config::{ModelAssetSettings, Settings};
use crate::error::{InitError, ProtocolViolation, SearchError};
use crate::ingestion::{Checkpoint, IngestionQueue};
use crate::protocol::{route, Command, ErrorContext, Event, Outbox, Route};
use crate::store::PersistentStore;
use crate::types::{AssetDescriptor, InitProgress, InitStage, ModelAssets, SearchResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerState {
    Uninitialized,
    Initializing,
    Ready,
    Failed,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub assets: ModelAssetSettings,
    pub snapshot_key: String,
    pub search_limit: usize,
    pub score_threshold: f32,
}

impl From<&Settings> for WorkerConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            assets: settings.assets.clone(),
            snapshot_key: settings.snapshot_key.clone(),
            search_limit: settings.search_limit,
            score_threshold: settings.score_threshold,
        }
    }
}

/// What a worker is built from. Consumed by `INIT`.
pub struct WorkerParts {
    pub index: Box<dyn IndexCapability>,
    pub store: Arc<dyn PersistentStore>,
    pub fetcher: Arc<dyn AssetFetcher>,
    pub config: WorkerConfig,
}

/// Built by a successful `INIT`, used by every later handler.
struct WorkerContext {
    index: SharedIndex,
    ingestion: IngestionQueue,
    search_limit: usize,
    score_threshold: f32,
}

impl WorkerContext {
    async fn search(
        &self,
        query: String,
        allowed_ids: Option<Vec<String>>,
    ) -> Result<Vec<SearchResult>, SearchError> {
        let index = Arc::clone(&self.index);
        let (limit, threshold) = (self.search_limit, self.score_threshold);
        tokio::task::spawn_blocking(move || {
            let index = index
                .lock()
                .map_err(|e| SearchError::Unavailable(format!("index lock poisoned: {e}")))?;
            index
                .search(&query, limit, threshold, allowed_ids.as_deref())
                .map_err(|reason| SearchError::Capability { reason })
        })
        .await?
    }
}

/// Controller-side ends of a spawned worker.
pub struct WorkerHandle {
    pub commands: mpsc::UnboundedSender<Command>,
    pub events: mpsc::UnboundedReceiver<Event>,
    pub task: JoinHandle<()>,
}

pub struct Worker {
    state: WorkerState,
    inbox: mpsc::UnboundedReceiver<Command>,
    outbox: Outbox,
    /// Commands pulled off the inbox at a checkpoint, replayed in order.
    deferred: VecDeque<Command>,
    cancellations: CancellationCoordinator,
    writes: BackgroundWrites,
    parts: Option<WorkerParts>,
    init: Option<JoinHandle<Result<WorkerContext, InitError>>>,
    context: Option<WorkerContext>,
}

impl Worker {
    pub fn new(parts: WorkerParts, inbox: mpsc::UnboundedReceiver<Command>, outbox: Outbox) -> Self {
        Self {
            state: WorkerState::Uninitialized,
            inbox,
            outbox,
            deferred: VecDeque::new(),
            cancellations: CancellationCoordinator::new(),
            writes: BackgroundWrites::new(),
            parts: Some(parts),
            init: None,
            context: None,
        }
    }

    /// Spawn a worker on the current runtime.
    pub fn spawn(parts: WorkerParts) -> WorkerHandle {
        let (commands, inbox) = mpsc::unbounded_channel();
        let (outbox, events) = Outbox::channel();
        let task = tokio::spawn(Worker::new(parts, inbox, outbox).run());
        WorkerHandle {
            commands,
            events,
            task,
        }
    }

    /// Serve commands until every sender is dropped, then wait for
    /// outstanding background writes.
    pub async fn run(mut self) {
        while let Some(command) = self.next_command().await {
            self.dispatch(command).await;
        }
        if let Some(init) = self.init.take() {
            init.abort();
        }
        self.writes.settle().await;
        tracing::info!(state = ?self.state, "worker stopped");
    }

    async fn next_command(&mut self) -> Option<Command> {
        loop {
            if let Some(command) = self.deferred.pop_front() {
                return Some(command);
            }
            let Some(init) = self.init.as_mut() else {
                return self.inbox.recv().await;
            };
            tokio::select! {
                command = self.inbox.recv() => return command,
                joined = init => {
                    self.init = None;
                    self.finish_init(joined.map_err(InitError::from).and_then(|r| r));
                }
            }
        }
    }

    async fn dispatch(&mut self, command: Command) {
        let kind = command.kind();
        if route(self.state, kind) == Route::Drop {
            let violation = ProtocolViolation {
                state: self.state,
                kind,
            };
            tracing::debug!(%violation, "dropping command");
            return;
        }

        match command {
            Command::Init => self.begin_init(),
            Command::CancelDocument { id } => self.cancellations.mark(id),
            Command::AddDocument { id, content } => self.add_document(id, content).await,
            Command::Search {
                request_id,
                query,
                allowed_ids,
            } => self.search(request_id, query, allowed_ids).await,
        }
    }

    fn begin_init(&mut self) {
        let Some(parts) = self.parts.take() else {
            return;
        };
        tracing::info!("initializing worker");
        self.state = WorkerState::Initializing;
        self.init = Some(tokio::spawn(initialize(
            parts,
            self.outbox.clone(),
            self.writes.clone(),
        )));
    }

    fn finish_init(&mut self, result: Result<WorkerContext, InitError>) {
        match result {
            Ok(context) => {
                self.context = Some(context);
                self.state = WorkerState::Ready;
                tracing::info!("worker ready");
                self.outbox.emit(Event::Ready);
            }
            Err(error) => {
                self.state = WorkerState::Failed;
                tracing::error!(%error, "worker initialization failed");
                self.outbox.error(&error, ErrorContext::Init);
            }
        }
    }

    async fn add_document(&mut self, id: String, content: String) {
        let Some(context) = self.context.as_ref() else {
            return;
        };
        let mut checkpoint = YieldPoint {
            inbox: &mut self.inbox,
            deferred: &mut self.deferred,
            cancellations: &mut self.cancellations,
        };
        context
            .ingestion
            .submit(id, content, &mut checkpoint, &self.outbox)
            .await;
    }

    async fn search(&mut self, request_id: u64, query: String, allowed_ids: Option<Vec<String>>) {
        let Some(context) = self.context.as_ref() else {
            return;
        };
        match context.search(query, allowed_ids).await {
            Ok(results) => {
                tracing::debug!(request_id, results = results.len(), "search complete");
                self.outbox.emit(Event::SearchResults {
                    request_id,
                    results,
                });
            }
            Err(error) => {
                tracing::warn!(request_id, %error, "search failed");
                self.outbox.error(&error, ErrorContext::Search { request_id });
            }
        }
    }
}

/// Checkpoint used while a document is being ingested. Pulls whatever has
/// queued up on the inbox: cancellations take effect immediately, anything
/// else waits its turn.
struct YieldPoint<'a> {
    inbox: &'a mut mpsc::UnboundedReceiver<Command>,
    deferred: &'a mut VecDeque<Command>,
    cancellations: &'a mut CancellationCoordinator,
}

impl Checkpoint for YieldPoint<'_> {
    fn cancelled(&mut self, id: &str) -> bool {
        while let Ok(command) = self.inbox.try_recv() {
            match command {
                Command::CancelDocument { id: marked } => self.cancellations.mark(marked),
                other => self.deferred.push_back(other),
            }
        }
        self.cancellations.consume_if_marked(id)
    }
}

fn progress(percent: f64, status: InitStage) -> Event {
    Event::InitProgress(InitProgress { percent, status })
}

fn model_descriptors(assets: &ModelAssetSettings) -> Vec<AssetDescriptor> {
    let mut descriptors = vec![
        assets.weights.descriptor(),
        assets.tokenizer.descriptor(),
        assets.config.descriptor(),
    ];
    descriptors.extend(assets.special_tokens_map.iter().map(|a| a.descriptor()));
    descriptors.extend(assets.tokenizer_config.iter().map(|a| a.descriptor()));
    descriptors
}

/// Inverse of [`model_descriptors`].
fn assemble(assets: &ModelAssetSettings, blobs: Vec<Bytes>) -> ModelAssets {
    let mut blobs = blobs.into_iter();
    let weights = blobs.next().unwrap_or_default();
    let tokenizer = blobs.next().unwrap_or_default();
    let config = blobs.next().unwrap_or_default();
    let special_tokens_map = assets.special_tokens_map.as_ref().and_then(|_| blobs.next());
    let tokenizer_config = assets.tokenizer_config.as_ref().and_then(|_| blobs.next());
    ModelAssets {
        weights,
        tokenizer,
        config,
        special_tokens_map,
        tokenizer_config,
    }
}

async fn initialize(
    parts: WorkerParts,
    outbox: Outbox,
    writes: BackgroundWrites,
) -> Result<WorkerContext, InitError> {
    let WorkerParts {
        mut index,
        store,
        fetcher,
        config,
    } = parts;

    outbox.emit(progress(0.0, InitStage::Downloading));
    let loader = AssetLoader::new(Arc::clone(&store), fetcher, writes.clone());
    let descriptors = model_descriptors(&config.assets);
    // One event per whole percent is plenty.
    let last_whole = AtomicU64::new(u64::MAX);
    let blobs = loader
        .acquire_all(&descriptors, |percent| {
            let whole = percent.floor() as u64;
            if last_whole.swap(whole, Ordering::Relaxed) != whole {
                outbox.emit(progress(percent, InitStage::Downloading));
            }
        })
        .await?;
    let assets = assemble(&config.assets, blobs);

    outbox.emit(progress(100.0, InitStage::Compiling));
    let index = tokio::task::spawn_blocking(move || index.load_model(assets).map(|()| index))
        .await?
        .map_err(|reason| InitError::ModelLoad { reason })?;

    outbox.emit(progress(100.0, InitStage::Initializing));
    let index = capability::shared(index);
    restore_snapshot(&index, store.as_ref(), &config.snapshot_key, &outbox).await;

    Ok(WorkerContext {
        index: Arc::clone(&index),
        ingestion: IngestionQueue::new(index, store, writes, config.snapshot_key),
        search_limit: config.search_limit,
        score_threshold: config.score_threshold,
    })
}

/// Load the last persisted index, if any. Failures leave the index empty.
async fn restore_snapshot(
    index: &SharedIndex,
    store: &dyn PersistentStore,
    key: &str,
    outbox: &Outbox,
) {
    let bytes = match store.get(key).await {
        Ok(Some(bytes)) => bytes,
        Ok(None) => {
            tracing::debug!(key, "no index snapshot to restore");
            return;
        }
        Err(error) => {
            tracing::warn!(key, %error, "failed to read index snapshot, starting empty");
            return;
        }
    };

    let index = Arc::clone(index);
    let restored = tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<String>> {
        let mut index = index
            .lock()
            .map_err(|e| anyhow::anyhow!("index lock poisoned: {e}"))?;
        index.import_state(&bytes)?;
        Ok(index.document_ids())
    })
    .await;

    match restored {
        Ok(Ok(ids)) => {
            tracing::info!(documents = ids.len(), "restored index snapshot");
            outbox.emit(Event::RestoredDocs { ids });
        }
        Ok(Err(error)) => {
            tracing::warn!(key, error = %format!("{error:#}"), "index snapshot rejected, starting empty");
        }
        Err(error) => {
            tracing::warn!(key, %error, "index snapshot restore task failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AssetSettings;

    fn asset(name: &str) -> AssetSettings {
        AssetSettings {
            locator: format!("https://models.test/{name}"),
            estimated_size_bytes: 10,
        }
    }

    #[test]
    fn optional_tokenizer_files_line_up_with_blobs() {
        let settings = ModelAssetSettings {
            weights: asset("model.onnx"),
            tokenizer: asset("tokenizer.json"),
            config: asset("config.json"),
            special_tokens_map: None,
            tokenizer_config: Some(asset("tokenizer_config.json")),
        };
        let names: Vec<String> = model_descriptors(&settings)
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(
            names,
            vec!["model.onnx", "tokenizer.json", "config.json", "tokenizer_config.json"]
        );

        let blobs = ["w", "t", "c", "tc"]
            .into_iter()
            .map(|s| Bytes::from_static(s.as_bytes()))
            .collect();
        let assets = assemble(&settings, blobs);
        assert_eq!(assets.weights.as_ref(), b"w");
        assert_eq!(assets.config.as_ref(), b"c");
        assert!(assets.special_tokens_map.is_none());
        assert_eq!(assets.tokenizer_config.as_deref(), Some(&b"tc"[..]));
    }

    #[tokio::test]
    async fn yield_point_marks_cancels_and_defers_the_rest() {
        let (tx, mut inbox) = mpsc::unbounded_channel();
        let mut deferred = VecDeque::new();
        let mut cancellations = CancellationCoordinator::new();

        tx.send(Command::Search {
            request_id: 1,
            query: "q".into(),
            allowed_ids: None,
        })
        .expect("send");
        tx.send(Command::CancelDocument { id: "b.txt".into() })
            .expect("send");

        let mut checkpoint = YieldPoint {
            inbox: &mut inbox,
            deferred: &mut deferred,
            cancellations: &mut cancellations,
        };
        assert!(!checkpoint.cancelled("a.txt"));
        assert!(checkpoint.cancelled("b.txt"));
        assert!(!checkpoint.cancelled("b.txt"));

        assert_eq!(deferred.len(), 1);
        assert!(matches!(deferred[0], Command::Search { request_id: 1, .. }));
        assert!(cancellations.is_empty());
    }
}
