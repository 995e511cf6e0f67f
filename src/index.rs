use std::collections::HashSet;

use anyhow::{bail, Context, Result};
use ruvector_core::index::hnsw::HnswIndex;
use ruvector_core::index::VectorIndex;
use ruvector_core::types::{DistanceMetric, HnswConfig};
use serde::{Deserialize, Serialize};
use text_splitter::{ChunkConfig, ChunkSizer, TextSplitter};

use crate::capability::IndexCapability;
use crate::embeddings::Embedder;
use crate::transcript;
use crate::types::{ModelAssets, SearchResult};

const SNAPSHOT_VERSION: u32 = 1;

/// Graph capacity floor; the graph is rebuilt with double the chunk count
/// once it fills up.
const MIN_CAPACITY: usize = 2000;

const VECTOR_WEIGHT: f32 = 0.7;
const KEYWORD_WEIGHT: f32 = 0.3;

/// One unit of indexed text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub text: String,
    pub sender: Option<String>,
    pub date: Option<String>,
}

impl Segment {
    /// What gets embedded. Transcript messages keep their speaker and date.
    fn embedding_text(&self) -> String {
        match (&self.sender, &self.date) {
            (Some(sender), Some(date)) => format!("On {date}, {sender} said: {}", self.text),
            _ => self.text.clone(),
        }
    }
}

/// Split a document into indexable segments: one per message for normalized
/// transcripts, chunks bounded by `chunking` otherwise. Blank pieces are skipped.
pub fn segment<S: ChunkSizer>(content: &str, chunking: ChunkConfig<S>) -> Vec<Segment> {
    if let Some(messages) = transcript::split_normalized(content) {
        return messages
            .into_iter()
            .filter(|m| !m.body.trim().is_empty())
            .map(|m| Segment {
                text: m.body,
                sender: Some(m.sender),
                date: Some(m.date),
            })
            .collect();
    }

    TextSplitter::new(chunking)
        .chunks(content)
        .map(str::trim)
        .filter(|chunk| !chunk.is_empty())
        .map(|chunk| Segment {
            text: chunk.to_string(),
            sender: None,
            date: None,
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct StoredChunk {
    doc_id: String,
    content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    date: Option<String>,
    embedding: Vec<f32>,
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    chunks: Vec<StoredChunk>,
}

/// Chunk-level semantic index: fastembed vectors in a ruvector HNSW graph,
/// ranked by a blend of vector similarity and keyword overlap.
pub struct SemanticIndex {
    embedder: Option<Embedder>,
    chunks: Vec<StoredChunk>,
    /// Distinct document ids, first insertion order.
    doc_order: Vec<String>,
    /// `None` while no chunk has been stored.
    hnsw: Option<HnswIndex>,
    capacity: usize,
    /// Plain-text chunk size, in model tokens.
    max_chunk_tokens: usize,
}

impl SemanticIndex {
    pub fn new(max_chunk_tokens: usize) -> Self {
        Self {
            embedder: None,
            chunks: Vec::new(),
            doc_order: Vec::new(),
            hnsw: None,
            capacity: 0,
            max_chunk_tokens,
        }
    }

    fn embedder(&self) -> Result<&Embedder> {
        self.embedder
            .as_ref()
            .context("Model not loaded. Initialize the index first.")
    }

    fn dimensions(&self) -> Option<usize> {
        self.chunks.first().map(|c| c.embedding.len())
    }

    /// Rebuild the graph from every stored chunk.
    fn rebuild_graph(&mut self) -> Result<()> {
        let Some(dims) = self.dimensions() else {
            self.hnsw = None;
            self.capacity = 0;
            return Ok(());
        };
        let capacity = (self.chunks.len() * 2).max(MIN_CAPACITY);
        let config = HnswConfig {
            m: 16,
            ef_construction: 200,
            ef_search: 50,
            max_elements: capacity,
        };
        let mut hnsw = HnswIndex::new(dims, DistanceMetric::Cosine, config)
            .map_err(|e| anyhow::anyhow!("Failed to create HNSW index: {e}"))?;
        let entries = self
            .chunks
            .iter()
            .enumerate()
            .map(|(pos, chunk)| (pos.to_string(), chunk.embedding.clone()))
            .collect();
        hnsw.add_batch(entries)
            .map_err(|e| anyhow::anyhow!("Index batch add failed: {e}"))?;

        self.hnsw = Some(hnsw);
        self.capacity = capacity;
        Ok(())
    }

    /// Store a fully embedded document. Either every chunk lands or none.
    fn commit(&mut self, staged: Vec<StoredChunk>) -> Result<()> {
        if let (Some(dims), Some(first)) = (self.dimensions(), staged.first()) {
            if first.embedding.len() != dims {
                bail!(
                    "embedding has {} dimensions, index holds {dims}",
                    first.embedding.len()
                );
            }
        }

        let base = self.chunks.len();
        let fits = self.hnsw.is_some() && base + staged.len() <= self.capacity;
        if fits {
            let entries = staged
                .iter()
                .enumerate()
                .map(|(offset, chunk)| ((base + offset).to_string(), chunk.embedding.clone()))
                .collect();
            if let Some(hnsw) = self.hnsw.as_mut() {
                hnsw.add_batch(entries)
                    .map_err(|e| anyhow::anyhow!("Index batch add failed: {e}"))?;
            }
            self.extend(staged);
        } else {
            self.extend(staged);
            if let Err(error) = self.rebuild_graph() {
                self.chunks.truncate(base);
                self.doc_order = distinct_ids(&self.chunks);
                self.rebuild_graph()?;
                return Err(error);
            }
        }
        Ok(())
    }

    fn extend(&mut self, staged: Vec<StoredChunk>) {
        for chunk in &staged {
            if !self.doc_order.contains(&chunk.doc_id) {
                self.doc_order.push(chunk.doc_id.clone());
            }
        }
        self.chunks.extend(staged);
    }
}

fn distinct_ids(chunks: &[StoredChunk]) -> Vec<String> {
    let mut seen = HashSet::new();
    chunks
        .iter()
        .filter(|c| seen.insert(c.doc_id.as_str()))
        .map(|c| c.doc_id.clone())
        .collect()
}

/// Lowercase whitespace-separated words with punctuation stripped.
fn tokens(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split_whitespace()
        .map(|word| word.chars().filter(|c| c.is_alphanumeric()).collect::<String>())
        .filter(|word| !word.is_empty())
        .collect()
}

/// Fraction of query terms found as substrings of the chunk text or
/// speaker name.
fn keyword_score(query_terms: &[String], chunk: &StoredChunk) -> f32 {
    if query_terms.is_empty() {
        return 0.0;
    }
    let content = chunk.content.to_lowercase();
    let sender = chunk.sender.as_deref().map(str::to_lowercase);
    let hits = query_terms
        .iter()
        .filter(|term| {
            content.contains(term.as_str())
                || sender.as_deref().is_some_and(|s| s.contains(term.as_str()))
        })
        .count();
    hits as f32 / query_terms.len() as f32
}

impl IndexCapability for SemanticIndex {
    fn load_model(&mut self, assets: ModelAssets) -> Result<()> {
        let embedder = Embedder::from_assets(assets)?;
        tracing::info!("embedding model ready");
        self.embedder = Some(embedder);
        Ok(())
    }

    fn add_document(
        &mut self,
        id: &str,
        content: &str,
        on_progress: &mut dyn FnMut(usize, usize),
    ) -> Result<()> {
        let embedder = self.embedder()?;
        let chunking =
            ChunkConfig::new(self.max_chunk_tokens.max(1)).with_sizer(embedder.tokenizer());
        let segments = segment(content, chunking);
        if segments.is_empty() {
            bail!("no indexable text in document");
        }

        let total = segments.len();
        let mut staged = Vec::with_capacity(total);
        for (unit, segment) in segments.into_iter().enumerate() {
            on_progress(unit, total);
            let embedding = embedder
                .embed_one(&segment.embedding_text())
                .with_context(|| format!("failed to embed segment {} of {total}", unit + 1))?;
            staged.push(StoredChunk {
                doc_id: id.to_string(),
                content: segment.text,
                sender: segment.sender,
                date: segment.date,
                embedding,
            });
        }

        self.commit(staged)?;
        tracing::debug!(id, chunks = total, "document committed");
        Ok(())
    }

    fn document_count(&self) -> usize {
        self.doc_order.len()
    }

    fn document_ids(&self) -> Vec<String> {
        self.doc_order.clone()
    }

    fn search(
        &self,
        query: &str,
        limit: usize,
        score_threshold: f32,
        allowed_ids: Option<&[String]>,
    ) -> Result<Vec<SearchResult>> {
        let embedder = self.embedder()?;
        let Some(hnsw) = self.hnsw.as_ref() else {
            return Ok(Vec::new());
        };

        let query_embedding = embedder.embed_one(query)?;
        let raw = hnsw
            .search(&query_embedding, self.chunks.len())
            .map_err(|e| anyhow::anyhow!("Index search failed: {e}"))?;

        let terms = tokens(query);
        let mut scored: Vec<(usize, f32)> = raw
            .into_iter()
            .filter_map(|hit| {
                let pos: usize = hit.id.parse().ok()?;
                let chunk = self.chunks.get(pos)?;
                if let Some(allowed) = allowed_ids {
                    if !allowed.contains(&chunk.doc_id) {
                        return None;
                    }
                }
                // ruvector-core reports cosine distance.
                let similarity = (1.0 - hit.score).clamp(0.0, 1.0);
                let score =
                    VECTOR_WEIGHT * similarity + KEYWORD_WEIGHT * keyword_score(&terms, chunk);
                Some((pos, score))
            })
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });

        Ok(scored
            .into_iter()
            .filter(|(_, score)| *score >= score_threshold)
            .take(limit)
            .map(|(pos, score)| {
                let chunk = &self.chunks[pos];
                SearchResult {
                    doc_id: chunk.doc_id.clone(),
                    content: chunk.content.clone(),
                    sender: chunk.sender.clone(),
                    date: chunk.date.clone(),
                    score,
                }
            })
            .collect())
    }

    fn export_state(&self) -> Result<Vec<u8>> {
        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            chunks: self.chunks.clone(),
        };
        serde_json::to_vec(&snapshot).context("failed to serialize index snapshot")
    }

    /// Replaces the current contents. Does not need the model.
    fn import_state(&mut self, bytes: &[u8]) -> Result<()> {
        let snapshot: Snapshot =
            serde_json::from_slice(bytes).context("index snapshot is not readable")?;
        if snapshot.version != SNAPSHOT_VERSION {
            bail!("unsupported index snapshot version {}", snapshot.version);
        }
        if let Some(dims) = snapshot.chunks.first().map(|c| c.embedding.len()) {
            if snapshot.chunks.iter().any(|c| c.embedding.len() != dims) {
                bail!("index snapshot mixes embedding dimensions");
            }
        }

        self.doc_order = distinct_ids(&snapshot.chunks);
        self.chunks = snapshot.chunks;
        self.rebuild_graph()?;
        tracing::info!(
            documents = self.doc_order.len(),
            chunks = self.chunks.len(),
            "index snapshot imported"
        );
        Ok(())
    }
}
