use std::sync::{Arc, Mutex};

use anyhow::Result;

use crate::types::{ModelAssets, SearchResult};

/// The embedding / similarity engine the worker drives.
///
/// Every call is synchronous and may run for a long time; the worker runs
/// them on the blocking pool and does not interrupt them.
pub trait IndexCapability: Send {
    fn load_model(&mut self, assets: ModelAssets) -> Result<()>;

    /// Index `content` under `id`. `on_progress(unit_index, total_units)`
    /// fires once per unit of work, zero-based.
    fn add_document(
        &mut self,
        id: &str,
        content: &str,
        on_progress: &mut dyn FnMut(usize, usize),
    ) -> Result<()>;

    fn document_count(&self) -> usize;

    /// Indexed document ids, first insertion order, no duplicates.
    fn document_ids(&self) -> Vec<String>;

    /// Results in descending score order.
    fn search(
        &self,
        query: &str,
        limit: usize,
        score_threshold: f32,
        allowed_ids: Option<&[String]>,
    ) -> Result<Vec<SearchResult>>;

    fn export_state(&self) -> Result<Vec<u8>>;

    fn import_state(&mut self, bytes: &[u8]) -> Result<()>;
}

/// The capability as owned by the worker context. Cloned into blocking
/// tasks; the mutex keeps calls single-flight.
pub type SharedIndex = Arc<Mutex<Box<dyn IndexCapability>>>;

pub fn shared(index: Box<dyn IndexCapability>) -> SharedIndex {
    Arc::new(Mutex::new(index))
}
