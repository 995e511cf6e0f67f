//! Cache-first acquisition of large immutable model files.
//!
//! Every asset is looked up in the persistent store under its descriptor
//! name first. A hit is returned without touching the network. A miss is
//! streamed from the source, reassembled in arrival order, and written back
//! to the store in the background.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::future::try_join_all;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};

use crate::background::BackgroundWrites;
use crate::error::NetworkError;
use crate::store::PersistentStore;
use crate::types::{AssetDescriptor, DownloadProgress};

/// Upper bound for the up-front buffer reservation. Estimates can be wrong.
const MAX_PREALLOCATION: u64 = 256 * 1024 * 1024;

/// A successful response: declared length (if any) plus the body as chunks.
pub struct FetchResponse {
    pub content_length: Option<u64>,
    pub body: BoxStream<'static, Result<Bytes, NetworkError>>,
}

#[async_trait]
pub trait AssetFetcher: Send + Sync {
    /// Start a fetch. Non-success statuses are reported as `NetworkError::Status`.
    async fn fetch(&self, locator: &str) -> Result<FetchResponse, NetworkError>;
}

/// Fetches over HTTP(S), streaming the body chunk by chunk.
#[derive(Clone, Default)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AssetFetcher for HttpFetcher {
    async fn fetch(&self, locator: &str) -> Result<FetchResponse, NetworkError> {
        let response = self
            .client
            .get(locator)
            .send()
            .await
            .map_err(|e| NetworkError::Transport {
                locator: locator.to_string(),
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(NetworkError::Status {
                locator: locator.to_string(),
                status: status.as_u16(),
                reason: status.canonical_reason().unwrap_or_default().to_string(),
            });
        }

        let content_length = response.content_length();
        let owned_locator = locator.to_string();
        let body = response
            .bytes_stream()
            .map_err(move |e| NetworkError::Transport {
                locator: owned_locator.clone(),
                message: e.to_string(),
            })
            .boxed();

        Ok(FetchResponse {
            content_length,
            body,
        })
    }
}

/// Folds per-asset byte progress into one percentage.
///
/// Each asset's denominator is the largest of its reported total, its
/// estimate, and the bytes already loaded, so a total that becomes known
/// mid-download cannot pull the aggregate backwards. The reported value is
/// additionally ratcheted, which keeps it monotonic under interleaved and
/// out-of-order updates from concurrent downloads.
pub struct ProgressAggregator {
    inner: Mutex<AggregateState>,
}

struct AggregateState {
    slots: Vec<Slot>,
    high_water: f64,
}

struct Slot {
    estimate: u64,
    progress: DownloadProgress,
}

impl ProgressAggregator {
    pub fn new(estimates: impl IntoIterator<Item = u64>) -> Self {
        let slots = estimates
            .into_iter()
            .map(|estimate| Slot {
                estimate,
                progress: DownloadProgress::default(),
            })
            .collect();
        Self {
            inner: Mutex::new(AggregateState {
                slots,
                high_water: 0.0,
            }),
        }
    }

    /// Record progress for one asset and return the aggregate percentage.
    pub fn update(&self, slot: usize, loaded_bytes: u64, total_bytes: u64) -> f64 {
        let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = state.slots.get_mut(slot) {
            entry.progress = DownloadProgress {
                loaded_bytes: entry.progress.loaded_bytes.max(loaded_bytes),
                total_bytes,
            };
        }

        let (loaded, total) = state.slots.iter().fold((0u64, 0u64), |(loaded, total), s| {
            // The estimate only stands in until the real size is known.
            let expected = if s.progress.total_bytes > 0 {
                s.progress.total_bytes
            } else {
                s.estimate
            };
            let denominator = expected.max(s.progress.loaded_bytes);
            (
                loaded.saturating_add(s.progress.loaded_bytes),
                total.saturating_add(denominator),
            )
        });

        let percent = if total == 0 {
            0.0
        } else {
            (loaded as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
        };
        state.high_water = state.high_water.max(percent);
        state.high_water
    }
}

pub struct AssetLoader {
    store: Arc<dyn PersistentStore>,
    fetcher: Arc<dyn AssetFetcher>,
    writes: BackgroundWrites,
}

impl AssetLoader {
    pub fn new(
        store: Arc<dyn PersistentStore>,
        fetcher: Arc<dyn AssetFetcher>,
        writes: BackgroundWrites,
    ) -> Self {
        Self {
            store,
            fetcher,
            writes,
        }
    }

    /// Fetch one asset, cache first. `on_progress(loaded, total)` fires once
    /// on a cache hit and after every received chunk otherwise.
    pub async fn acquire<F>(
        &self,
        descriptor: &AssetDescriptor,
        mut on_progress: F,
    ) -> Result<Bytes, NetworkError>
    where
        F: FnMut(u64, u64),
    {
        match self.store.get(&descriptor.name).await {
            Ok(Some(cached)) => {
                tracing::info!(asset = %descriptor.name, bytes = cached.len(), "loaded asset from cache");
                let size = cached.len() as u64;
                on_progress(size, size);
                return Ok(cached);
            }
            Ok(None) => {}
            Err(error) => {
                tracing::warn!(asset = %descriptor.name, %error, "cache read failed, falling back to network");
            }
        }

        tracing::info!(asset = %descriptor.name, locator = %descriptor.source_locator, "fetching asset from network");
        let response = self.fetcher.fetch(&descriptor.source_locator).await?;
        let total = response
            .content_length
            .filter(|len| *len > 0)
            .unwrap_or(descriptor.estimated_size_bytes);

        let capacity = usize::try_from(total.min(MAX_PREALLOCATION)).unwrap_or(0);
        let mut buffer = BytesMut::with_capacity(capacity);
        let mut body = response.body;
        while let Some(chunk) = body.next().await {
            buffer.extend_from_slice(&chunk?);
            on_progress(buffer.len() as u64, total);
        }
        let bytes = buffer.freeze();

        let store = Arc::clone(&self.store);
        let key = descriptor.name.clone();
        let value = bytes.clone();
        self.writes.spawn("asset cache", key.clone(), async move {
            store.set(&key, value).await
        });

        Ok(bytes)
    }

    /// Acquire all descriptors concurrently, reporting one aggregate
    /// percentage. Results keep the order of `descriptors`.
    pub async fn acquire_all<F>(
        &self,
        descriptors: &[AssetDescriptor],
        on_percent: F,
    ) -> Result<Vec<Bytes>, NetworkError>
    where
        F: Fn(f64) + Send + Sync,
    {
        let aggregator =
            ProgressAggregator::new(descriptors.iter().map(|d| d.estimated_size_bytes));
        let aggregator = &aggregator;
        let on_percent = &on_percent;

        try_join_all(descriptors.iter().enumerate().map(|(slot, descriptor)| {
            self.acquire(descriptor, move |loaded, total| {
                on_percent(aggregator.update(slot, loaded, total));
            })
        }))
        .await
    }
}
