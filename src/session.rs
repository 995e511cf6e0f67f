//! Controller side: owns the worker, mirrors its events into observable
//! state, and turns user intents into commands.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::eta;
use crate::protocol::{Command, ErrorContext, Event};
use crate::types::{InitProgress, SearchResult, UploadProgress, UploadState, UploadStatus};
use crate::worker::{Worker, WorkerParts};

/// Documents accepted in the current batch versus documents that reached a
/// terminal state (added, failed, cancelled).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounters {
    pub submitted: usize,
    pub settled: usize,
}

impl QueueCounters {
    pub fn is_idle(&self) -> bool {
        self.settled >= self.submitted
    }
}

/// Everything the controller shows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionState {
    pub ready: bool,
    pub failed: bool,
    pub init_progress: Option<InitProgress>,
    /// Indexed document ids, ordered, unique.
    pub documents: Vec<String>,
    /// Keyed by filename.
    pub uploads: BTreeMap<String, UploadStatus>,
    pub search_results: Vec<SearchResult>,
    pub is_searching: bool,
    /// Request id whose results are awaited. Older replies are ignored.
    pub pending_search: Option<u64>,
    pub indexed_count: usize,
    /// Blocking notice; cleared by acknowledging it.
    pub last_error: Option<String>,
    pub queue: QueueCounters,
    cancelled: HashSet<String>,
}

impl SessionState {
    /// Fold one worker event into the state. `now_ms` is Unix milliseconds.
    pub fn apply(&mut self, event: Event, now_ms: i64) {
        match event {
            Event::InitProgress(progress) => {
                if !self.ready {
                    self.init_progress = Some(progress);
                }
            }
            Event::Ready => {
                self.ready = true;
                self.init_progress = None;
            }
            Event::RestoredDocs { ids } => {
                self.documents.clear();
                for id in ids {
                    self.uploads.insert(
                        id.clone(),
                        UploadStatus {
                            filename: id.clone(),
                            status: UploadState::Completed,
                            progress: Some(UploadProgress {
                                current: 0,
                                total: 0,
                                percent: 100.0,
                                etr: "Restored".to_string(),
                                start_time: now_ms,
                            }),
                            error: None,
                            settled_at: Some(now_ms),
                        },
                    );
                    self.push_document(id);
                }
            }
            Event::IndexProgress {
                filename,
                current,
                total,
                percent,
            } => {
                if self.cancelled.contains(&filename) {
                    return;
                }
                let entry = self
                    .uploads
                    .entry(filename.clone())
                    .or_insert_with(|| UploadStatus::pending(filename));
                if entry.status.is_terminal() {
                    return;
                }
                let start_time = entry
                    .progress
                    .as_ref()
                    .map_or(now_ms, |p| p.start_time);
                entry.status = UploadState::Processing;
                entry.progress = Some(UploadProgress {
                    current,
                    total,
                    percent,
                    etr: eta::estimate_remaining(current, total, now_ms - start_time),
                    start_time,
                });
            }
            Event::DocumentAdded { count, id } => {
                self.indexed_count = count;
                self.push_document(id.clone());
                if self.cancelled.contains(&id) {
                    return;
                }
                let entry = self
                    .uploads
                    .entry(id.clone())
                    .or_insert_with(|| UploadStatus::pending(id));
                if !entry.status.is_terminal() {
                    self.queue.settled += 1;
                }
                let mut progress = entry.progress.take().unwrap_or(UploadProgress {
                    current: 0,
                    total: 0,
                    percent: 0.0,
                    etr: String::new(),
                    start_time: now_ms,
                });
                progress.current = progress.total;
                progress.percent = 100.0;
                progress.etr = "Done".to_string();
                entry.status = UploadState::Completed;
                entry.progress = Some(progress);
                entry.settled_at = Some(now_ms);
            }
            Event::SearchResults {
                request_id,
                results,
            } => {
                if self.pending_search != Some(request_id) {
                    tracing::debug!(request_id, "ignoring stale search results");
                    return;
                }
                self.search_results = results;
                self.is_searching = false;
                self.pending_search = None;
            }
            Event::Error { payload, context } => {
                match context {
                    Some(ErrorContext::Init) => {
                        self.failed = true;
                        self.init_progress = None;
                    }
                    Some(ErrorContext::Document { id }) => {
                        if !self.cancelled.contains(&id) {
                            let entry = self
                                .uploads
                                .entry(id.clone())
                                .or_insert_with(|| UploadStatus::pending(id));
                            if !entry.status.is_terminal() {
                                self.queue.settled += 1;
                            }
                            entry.status = UploadState::Error;
                            entry.error = Some(payload.clone());
                            entry.settled_at = Some(now_ms);
                        }
                    }
                    Some(ErrorContext::Search { request_id }) => {
                        if self.pending_search == Some(request_id) {
                            self.is_searching = false;
                            self.pending_search = None;
                        }
                    }
                    None => {
                        self.is_searching = false;
                        self.pending_search = None;
                    }
                }
                self.last_error = Some(payload);
            }
        }
    }

    fn push_document(&mut self, id: String) {
        if !self.documents.contains(&id) {
            self.documents.push(id);
        }
    }

    /// Whether every upload has reached a terminal state.
    pub fn uploads_settled(&self) -> bool {
        self.uploads.values().all(|u| u.status.is_terminal())
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A running controller session bound to one worker.
pub struct Session {
    commands: mpsc::UnboundedSender<Command>,
    state: Arc<watch::Sender<SessionState>>,
    next_request_id: AtomicU64,
    completed_display_ms: i64,
    worker: JoinHandle<()>,
    mirror: JoinHandle<()>,
}

impl Session {
    /// Spawn the worker and ask it to initialize.
    pub fn start(parts: WorkerParts, completed_display_ms: i64) -> Self {
        let handle = Worker::spawn(parts);
        let (state, _) = watch::channel(SessionState::default());
        let state = Arc::new(state);
        let mirror = tokio::spawn(mirror_events(handle.events, Arc::clone(&state)));

        let session = Self {
            commands: handle.commands,
            state,
            next_request_id: AtomicU64::new(0),
            completed_display_ms,
            worker: handle.task,
            mirror,
        };
        session.send(Command::Init);
        session
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            tracing::warn!("worker is gone, command discarded");
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn snapshot(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// Start a search. Ignored (returns `None`) until the worker is ready or
    /// when the query is blank. Results land in `search_results`.
    pub fn search(&self, query: &str, allowed_ids: Option<Vec<String>>) -> Option<u64> {
        let query = query.trim();
        if query.is_empty() || !self.state.borrow().ready {
            return None;
        }
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.state.send_modify(|s| {
            s.is_searching = true;
            s.pending_search = Some(request_id);
        });
        self.send(Command::Search {
            request_id,
            query: query.to_string(),
            allowed_ids,
        });
        Some(request_id)
    }

    /// Queue a document. Sent regardless of readiness; a worker that is not
    /// ready drops it.
    pub fn add_document(&self, filename: impl Into<String>, content: impl Into<String>) {
        let filename = filename.into();
        self.state.send_modify(|s| {
            s.cancelled.remove(&filename);
            s.uploads
                .insert(filename.clone(), UploadStatus::pending(filename.clone()));
            s.queue.submitted += 1;
        });
        self.send(Command::AddDocument {
            id: filename,
            content: content.into(),
        });
    }

    /// Forget an upload locally and ask the worker to cancel it.
    pub fn cancel_upload(&self, filename: &str) {
        self.state.send_modify(|s| {
            if let Some(removed) = s.uploads.remove(filename) {
                if !removed.status.is_terminal() {
                    s.queue.settled += 1;
                }
            }
            s.cancelled.insert(filename.to_string());
        });
        self.send(Command::CancelDocument {
            id: filename.to_string(),
        });
    }

    pub fn acknowledge_error(&self) {
        self.state.send_modify(|s| s.last_error = None);
    }

    /// Drop terminal uploads that have been visible long enough. Resets the
    /// batch counters once nothing is in flight.
    pub fn prune_settled(&self, now_ms: i64) {
        let window = self.completed_display_ms;
        self.state.send_if_modified(|s| {
            let before = (s.uploads.len(), s.queue);
            s.uploads.retain(|_, u| match u.settled_at {
                Some(at) if u.status.is_terminal() => now_ms - at < window,
                _ => true,
            });
            if s.queue.is_idle() && s.uploads_settled() {
                s.queue = QueueCounters::default();
            }
            before != (s.uploads.len(), s.queue)
        });
    }

    /// Close the command channel and wait for the worker to drain and stop.
    pub async fn shutdown(self) {
        let Session {
            commands,
            worker,
            mirror,
            ..
        } = self;
        drop(commands);
        if let Err(error) = worker.await {
            tracing::warn!(%error, "worker task ended abnormally");
        }
        if let Err(error) = mirror.await {
            tracing::warn!(%error, "event mirror ended abnormally");
        }
    }
}

async fn mirror_events(mut events: mpsc::UnboundedReceiver<Event>, state: Arc<watch::Sender<SessionState>>) {
    while let Some(event) = events.recv().await {
        let now = now_ms();
        state.send_modify(move |s| s.apply(event, now));
    }
    tracing::debug!("worker event stream closed");
}
