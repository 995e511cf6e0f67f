#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::{mpsc, oneshot, Semaphore};

use local_mind::assets::{AssetFetcher, FetchResponse};
use local_mind::config::{AssetSettings, ModelAssetSettings};
use local_mind::error::NetworkError;
use local_mind::store::PersistentStore;
use local_mind::types::{ModelAssets, SearchResult};
use local_mind::{Event, IndexCapability, WorkerConfig, WorkerParts};

const MODEL_HOST: &str = "https://models.test";

/// Serves in-memory bodies in two chunks. Unknown locators get a 404.
/// With `held()`, every fetch waits until `release()` is called.
pub struct StaticFetcher {
    bodies: HashMap<String, Bytes>,
    calls: AtomicUsize,
    hold: Option<Arc<Semaphore>>,
}

impl StaticFetcher {
    pub fn empty() -> Self {
        Self {
            bodies: HashMap::new(),
            calls: AtomicUsize::new(0),
            hold: None,
        }
    }

    /// Serves the files named by `test_config()`.
    pub fn model() -> Self {
        let mut fetcher = Self::empty();
        for (name, body) in [
            ("model.onnx", &b"weights-weights-weights"[..]),
            ("tokenizer.json", b"{\"tokenizer\": true}"),
            ("config.json", b"{}"),
        ] {
            fetcher
                .bodies
                .insert(format!("{MODEL_HOST}/{name}"), Bytes::from_static(body));
        }
        fetcher
    }

    /// Replace the body served for one of the `test_config()` files.
    pub fn with_body(mut self, name: &str, body: &'static [u8]) -> Self {
        self.bodies
            .insert(format!("{MODEL_HOST}/{name}"), Bytes::from_static(body));
        self
    }

    pub fn held(mut self) -> Self {
        self.hold = Some(Arc::new(Semaphore::new(0)));
        self
    }

    pub fn release(&self) {
        if let Some(hold) = &self.hold {
            hold.add_permits(Semaphore::MAX_PERMITS / 2);
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AssetFetcher for StaticFetcher {
    async fn fetch(&self, locator: &str) -> Result<FetchResponse, NetworkError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(hold) = &self.hold {
            let _permit = hold.acquire().await;
        }
        let Some(body) = self.bodies.get(locator).cloned() else {
            return Err(NetworkError::Status {
                locator: locator.to_string(),
                status: 404,
                reason: "Not Found".into(),
            });
        };
        let mid = body.len() / 2;
        let chunks = vec![Ok(body.slice(..mid)), Ok(body.slice(mid..))];
        Ok(FetchResponse {
            content_length: Some(body.len() as u64),
            body: futures::stream::iter(chunks).boxed(),
        })
    }
}

struct Gate {
    id: String,
    started: Option<oneshot::Sender<()>>,
    release: std_mpsc::Receiver<()>,
}

/// Test side of a gated document: see when indexing started, then let it finish.
pub struct GateControl {
    started: oneshot::Receiver<()>,
    release: std_mpsc::Sender<()>,
}

impl GateControl {
    pub async fn started(&mut self) {
        tokio::time::timeout(Duration::from_secs(5), &mut self.started)
            .await
            .expect("gated document never started")
            .expect("index dropped the gate");
    }

    pub fn release(&self) {
        let _ = self.release.send(());
    }
}

/// In-memory index: one unit of work per line, substring search.
/// Content containing "REJECT" is refused; weights equal to "broken" fail to load.
#[derive(Default)]
pub struct FakeIndex {
    docs: Vec<(String, String)>,
    gate: Option<Gate>,
}

impl FakeIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// `add_document(id)` blocks after its first unit until released.
    pub fn gated(id: &str) -> (Self, GateControl) {
        let (started_tx, started_rx) = oneshot::channel();
        let (release_tx, release_rx) = std_mpsc::channel();
        let index = Self {
            docs: Vec::new(),
            gate: Some(Gate {
                id: id.to_string(),
                started: Some(started_tx),
                release: release_rx,
            }),
        };
        (
            index,
            GateControl {
                started: started_rx,
                release: release_tx,
            },
        )
    }
}

impl IndexCapability for FakeIndex {
    fn load_model(&mut self, assets: ModelAssets) -> Result<()> {
        if assets.weights.as_ref() == b"broken" {
            bail!("weights are not a model");
        }
        Ok(())
    }

    fn add_document(
        &mut self,
        id: &str,
        content: &str,
        on_progress: &mut dyn FnMut(usize, usize),
    ) -> Result<()> {
        if content.contains("REJECT") {
            bail!("unsupported content");
        }
        let total = content.lines().count().max(1);
        for unit in 0..total {
            on_progress(unit, total);
            if unit == 0 {
                if let Some(gate) = self.gate.as_mut().filter(|g| g.id == id) {
                    if let Some(started) = gate.started.take() {
                        let _ = started.send(());
                    }
                    let _ = gate.release.recv_timeout(Duration::from_secs(5));
                }
            }
        }
        self.docs.push((id.to_string(), content.to_string()));
        Ok(())
    }

    fn document_count(&self) -> usize {
        self.docs.len()
    }

    fn document_ids(&self) -> Vec<String> {
        self.docs.iter().map(|(id, _)| id.clone()).collect()
    }

    fn search(
        &self,
        query: &str,
        limit: usize,
        _score_threshold: f32,
        allowed_ids: Option<&[String]>,
    ) -> Result<Vec<SearchResult>> {
        let query = query.to_lowercase();
        Ok(self
            .docs
            .iter()
            .filter(|(id, _)| allowed_ids.map_or(true, |allowed| allowed.contains(id)))
            .filter(|(_, content)| content.to_lowercase().contains(&query))
            .take(limit)
            .map(|(id, content)| SearchResult {
                doc_id: id.clone(),
                content: content.clone(),
                sender: None,
                date: None,
                score: 1.0,
            })
            .collect())
    }

    fn export_state(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.docs)?)
    }

    fn import_state(&mut self, bytes: &[u8]) -> Result<()> {
        self.docs = serde_json::from_slice(bytes)?;
        Ok(())
    }
}

fn asset(name: &str, estimated_size_bytes: u64) -> AssetSettings {
    AssetSettings {
        locator: format!("{MODEL_HOST}/{name}"),
        estimated_size_bytes,
    }
}

pub fn test_config() -> WorkerConfig {
    WorkerConfig {
        assets: ModelAssetSettings {
            weights: asset("model.onnx", 1_000),
            tokenizer: asset("tokenizer.json", 100),
            config: asset("config.json", 10),
            special_tokens_map: None,
            tokenizer_config: None,
        },
        snapshot_key: "index-snapshot".into(),
        search_limit: 5,
        score_threshold: 0.0,
    }
}

pub fn parts(
    index: FakeIndex,
    store: Arc<dyn PersistentStore>,
    fetcher: Arc<StaticFetcher>,
) -> WorkerParts {
    WorkerParts {
        index: Box::new(index),
        store,
        fetcher,
        config: test_config(),
    }
}

pub async fn next_event(events: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for a worker event")
        .expect("worker closed its event channel")
}

/// Collect events up to and including the first one matching `done`.
pub async fn collect_until<F>(events: &mut mpsc::UnboundedReceiver<Event>, done: F) -> Vec<Event>
where
    F: Fn(&Event) -> bool,
{
    let mut seen = Vec::new();
    loop {
        let event = next_event(events).await;
        let finished = done(&event);
        seen.push(event);
        if finished {
            return seen;
        }
    }
}

/// Give the worker time to act, then require that it said nothing.
pub async fn assert_quiet(events: &mut mpsc::UnboundedReceiver<Event>) {
    tokio::time::sleep(Duration::from_millis(150)).await;
    if let Ok(event) = events.try_recv() {
        panic!("unexpected event {event:?}");
    }
}
